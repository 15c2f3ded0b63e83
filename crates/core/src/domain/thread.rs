use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-turn correlation key shared by every policy call and audit entry of
/// that turn. A fresh id is minted for each turn and never reused.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque token handed out by the shield after a retrieval filter was
/// resolved. It must ride along with the first reply audit of the turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorDbInfo(pub serde_json::Value);
