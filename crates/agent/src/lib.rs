//! Safeguarded conversation pipeline.
//!
//! Turns a natural-language sales question into an audited round trip through
//! a text-to-SQL/search agent. Every piece of text going to or coming from the
//! agent passes the policy shield first.
//!
//! # Architecture
//!
//! One turn runs these steps in order:
//! 1. **Prompt authorization** (`authorizer`) - the user query is checked as a PROMPT
//! 2. **Retrieval filter** (`filter`) - the shield supplies a filter for the search tool
//! 3. **Dispatch** (`dispatch`) - the agent is called with the query and the filter
//! 4. **Decoding** (`stream`) - streamed events become text, SQL and citations
//! 5. **Reply authorization** (`citations`, `authorizer`) - transcripts, text,
//!    SQL and result rows are checked as REPLY before display
//!
//! `runtime::ConversationOrchestrator` sequences the steps and keeps the
//! conversation history.
//!
//! # Safety Principle
//!
//! Raw shield output never reaches the user. Denials are reduced to a
//! sanitized message and transport failures to a fixed notice.

pub mod authorizer;
pub mod citations;
pub mod dispatch;
pub mod filter;
pub mod runtime;
pub mod shield;
pub mod stream;

pub use authorizer::{ContentAuthorizer, VectorDbInfoSlot};
pub use citations::CitationEnricher;
pub use dispatch::{
    AgentDispatcher, AgentToolConfig, DispatchError, HttpAgentDispatcher, RawResponse,
};
pub use filter::{FilterResolutionError, ResolvedFilter, RetrievalFilterResolver};
pub use runtime::{
    ConversationOrchestrator, ConversationSession, DisplayItem, NoticeLevel, OrchestratorParts,
    TurnError, TurnReport, TurnStatus,
};
pub use shield::{
    HttpShieldClient, ShieldApplication, ShieldClient, ShieldContext, ShieldError, ShieldSession,
};
pub use stream::{decode, DecodedResponse};
