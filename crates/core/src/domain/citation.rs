use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub source_id: String,
    pub doc_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safeguarded_transcript_text: Option<String>,
}

impl Citation {
    pub fn new(source_id: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            doc_id: doc_id.into(),
            safeguarded_transcript_text: None,
        }
    }

    /// Only citations that point at a document can be enriched.
    pub fn is_enrichable(&self) -> bool {
        !self.doc_id.is_empty() && self.safeguarded_transcript_text.is_none()
    }

    /// Whether the citation should be rendered as an expandable excerpt.
    pub fn is_displayable(&self) -> bool {
        !self.doc_id.is_empty()
            && self.safeguarded_transcript_text.as_deref().is_some_and(|text| !text.is_empty())
    }

    pub fn label(&self) -> String {
        format!("[{}]", self.source_id)
    }
}
