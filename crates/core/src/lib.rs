pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod filter;
pub mod query;
pub mod table;
pub mod text;

pub use audit::{
    AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink, TracingAuditSink,
};
pub use domain::citation::Citation;
pub use domain::content::{
    sanitize_denial_message, AuthorizationOutcome, ContentArtifact, ConversationRole,
    NOT_AUTHORIZED_MESSAGE,
};
pub use domain::history::{ConversationHistory, HistoryEntry, HistoryRole};
pub use domain::identity::UserIdentity;
pub use domain::thread::{ThreadId, VectorDbInfo};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use filter::{parse_filter_expression, FilterError, SearchFilter};
pub use query::{prepare_generated_sql, QueryError, QueryExecutor};
pub use table::{CellValue, ResultSet};
pub use text::normalize_citation_markers;
