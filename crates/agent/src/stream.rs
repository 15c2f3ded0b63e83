//! Decoding of the agent's streamed response.
//!
//! The response is a list of loosely structured events. Only `message.delta`
//! events contribute. Each level is decoded item by item, so a malformed
//! fragment is skipped with a warning and the rest of the response still
//! decodes.

use salesguard_core::Citation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::dispatch::RawResponse;

pub const MESSAGE_DELTA_EVENT: &str = "message.delta";

/// Assistant text, generated SQL and citations recovered from one response.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DecodedResponse {
    pub text: String,
    pub sql: String,
    pub citations: Vec<Citation>,
}

impl DecodedResponse {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.sql.is_empty() && self.citations.is_empty()
    }

    /// Combines the decodings of two consecutive chunks of one response.
    /// `decode(a ++ b) == decode(a).merge(decode(b))`.
    pub fn merge(mut self, later: DecodedResponse) -> Self {
        self.text.push_str(&later.text);
        if !later.sql.is_empty() {
            self.sql = later.sql;
        }
        self.citations.extend(later.citations);
        self
    }

    fn absorb_tool_json(&mut self, json: ToolJson, position: &Position) {
        self.text.push_str(&json.text.unwrap_or_default());

        for (index, result) in json.search_results.unwrap_or_default().iter().enumerate() {
            match citation_from(result) {
                Ok(citation) => self.citations.push(citation),
                Err(error) => skip(position, "search_result", index, &error),
            }
        }

        if let Some(sql) = json.sql.filter(|sql| !sql.is_empty()) {
            self.sql = sql;
        }
    }
}

#[derive(Debug, Deserialize)]
struct AgentEvent {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct EventData {
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentItem {
    Text {
        #[serde(default)]
        text: Option<String>,
    },
    ToolResults {
        #[serde(default)]
        tool_results: Option<ToolResults>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct ToolResults {
    #[serde(default)]
    content: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ToolResult {
    Json {
        #[serde(default)]
        json: Option<ToolJson>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct ToolJson {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    sql: Option<String>,
    #[serde(default, rename = "searchResults")]
    search_results: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    source_id: Option<Value>,
    #[serde(default)]
    doc_id: Option<Value>,
}

/// Where in the response a fragment sits, for skip warnings.
#[derive(Clone, Copy, Debug)]
struct Position {
    event: usize,
    item: Option<usize>,
}

pub fn decode(raw: &RawResponse) -> DecodedResponse {
    match raw {
        RawResponse::Events(events) => decode_events(events),
        RawResponse::Opaque(_) => DecodedResponse::default(),
    }
}

pub fn decode_events(events: &[Value]) -> DecodedResponse {
    let mut decoded = DecodedResponse::default();

    for (event_index, value) in events.iter().enumerate() {
        let position = Position { event: event_index, item: None };
        let event = match AgentEvent::deserialize(value) {
            Ok(event) => event,
            Err(error) => {
                skip(&position, "event", event_index, &error.to_string());
                continue;
            }
        };
        if event.event.as_deref() != Some(MESSAGE_DELTA_EVENT) {
            continue;
        }

        let data = match event.data.as_ref().map(EventData::deserialize).transpose() {
            Ok(data) => data,
            Err(error) => {
                skip(&position, "event_data", event_index, &error.to_string());
                continue;
            }
        };

        let content = data.and_then(|data| data.delta).and_then(|delta| delta.content);
        for (item_index, item) in content.unwrap_or_default().iter().enumerate() {
            let position = Position { event: event_index, item: Some(item_index) };
            match ContentItem::deserialize(item) {
                Ok(ContentItem::Text { text }) => decoded.text.push_str(&text.unwrap_or_default()),
                Ok(ContentItem::ToolResults { tool_results }) => {
                    let results = tool_results.and_then(|results| results.content);
                    for (index, result) in results.unwrap_or_default().iter().enumerate() {
                        match ToolResult::deserialize(result) {
                            Ok(ToolResult::Json { json }) => {
                                decoded.absorb_tool_json(json.unwrap_or_default(), &position)
                            }
                            Ok(ToolResult::Other) => {}
                            Err(error) => {
                                skip(&position, "tool_result", index, &error.to_string())
                            }
                        }
                    }
                }
                Ok(ContentItem::Other) => {}
                Err(error) => skip(&position, "content_item", item_index, &error.to_string()),
            }
        }
    }

    decoded
}

fn citation_from(value: &Value) -> Result<Citation, String> {
    let result = SearchResult::deserialize(value).map_err(|error| error.to_string())?;
    Ok(Citation::new(id_string(result.source_id)?, id_string(result.doc_id)?))
}

/// Identifiers may arrive as strings or numbers; missing means empty.
fn id_string(value: Option<Value>) -> Result<String, String> {
    match value {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(id)) => Ok(id),
        Some(Value::Number(id)) => Ok(id.to_string()),
        Some(other) => Err(format!("identifier must be a string or number, found {other}")),
    }
}

fn skip(position: &Position, fragment: &str, index: usize, error: &str) {
    warn!(
        event_name = "agent.stream.fragment_skipped",
        event_index = position.event,
        item_index = ?position.item,
        fragment,
        fragment_index = index,
        error,
        "skipping malformed response fragment"
    );
}
