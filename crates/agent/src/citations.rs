use std::sync::Arc;

use salesguard_core::{Citation, QueryExecutor, ThreadId, UserIdentity};
use tracing::{debug, warn};

use crate::authorizer::{ContentAuthorizer, VectorDbInfoSlot};
use crate::shield::ShieldError;

/// Attaches safeguarded transcript excerpts to search citations.
pub struct CitationEnricher {
    authorizer: ContentAuthorizer,
    query: Arc<dyn QueryExecutor>,
}

impl CitationEnricher {
    pub fn new(authorizer: ContentAuthorizer, query: Arc<dyn QueryExecutor>) -> Self {
        Self { authorizer, query }
    }

    /// Each citation with a document id gets its transcript looked up and
    /// authorized as a reply. A missing row or a failed lookup leaves the
    /// citation without text. Shield transport failures abort enrichment.
    pub async fn enrich(
        &self,
        identity: &UserIdentity,
        thread_id: &ThreadId,
        citations: &mut [Citation],
        slot: &mut VectorDbInfoSlot,
    ) -> Result<(), ShieldError> {
        for citation in citations.iter_mut().filter(|citation| citation.is_enrichable()) {
            let transcript = match self.query.lookup_transcript(&citation.doc_id).await {
                Ok(Some(transcript)) => transcript,
                Ok(None) => {
                    debug!(
                        event_name = "citation.transcript.missing",
                        thread_id = %thread_id,
                        doc_id = %citation.doc_id,
                        "no transcript for cited document"
                    );
                    continue;
                }
                Err(error) => {
                    warn!(
                        event_name = "citation.transcript.lookup_failed",
                        thread_id = %thread_id,
                        doc_id = %citation.doc_id,
                        error = %error,
                        "transcript lookup failed"
                    );
                    continue;
                }
            };

            let outcome =
                self.authorizer.authorize_reply(identity, &transcript, thread_id, slot).await?;
            citation.safeguarded_transcript_text = Some(outcome.into_display_text());
        }

        Ok(())
    }
}
