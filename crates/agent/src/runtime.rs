//! Per-turn orchestration of the safeguarded conversation pipeline.
//!
//! A turn runs strictly in sequence: prompt authorization, retrieval filter
//! resolution, agent dispatch, decoding, then the reply side (citations,
//! assistant text, generated SQL and its result set). Every step that talks to
//! the shield shares the turn's [`ThreadId`].

use std::sync::{Arc, Mutex};

use salesguard_core::{
    normalize_citation_markers, prepare_generated_sql, ApplicationError, AuditCategory,
    AuditEvent, AuditOutcome, AuditSink, Citation, ConversationHistory, DomainError, FilterError,
    QueryExecutor, ResultSet, ThreadId, UserIdentity,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::MutexGuard;
use tracing::{info, warn};

use crate::authorizer::{ContentAuthorizer, VectorDbInfoSlot};
use crate::citations::CitationEnricher;
use crate::dispatch::{AgentDispatcher, DispatchError};
use crate::filter::{FilterResolutionError, RetrievalFilterResolver};
use crate::shield::{ShieldClient, ShieldError};
use crate::stream;

const ACTOR: &str = "conversation-orchestrator";

pub const QUERY_FAILED_MESSAGE: &str =
    "The generated query could not be run. Try rephrasing the question.";

/// Failures that end a turn early. The user only ever sees
/// [`TurnError::user_message`].
#[derive(Clone, Debug, Error, PartialEq)]
pub enum TurnError {
    #[error("policy service failure: {0}")]
    Policy(#[from] ShieldError),
    #[error("retrieval filter contract violation: {0}")]
    FilterContract(#[from] FilterError),
    #[error("agent failure: {0}")]
    Agent(#[from] DispatchError),
}

impl TurnError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Policy(_) => {
                "The policy service is unavailable right now. Please try again shortly."
            }
            Self::FilterContract(_) => {
                "This request could not be completed safely. Please contact your administrator."
            }
            Self::Agent(_) => "The sales assistant could not answer right now. Please try again.",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Policy(_) => "policy_unavailable",
            Self::FilterContract(_) => "filter_contract_violation",
            Self::Agent(_) => "agent_unavailable",
        }
    }
}

impl From<FilterResolutionError> for TurnError {
    fn from(error: FilterResolutionError) -> Self {
        match error {
            FilterResolutionError::Shield(error) => Self::Policy(error),
            FilterResolutionError::Contract(error) => Self::FilterContract(error),
        }
    }
}

impl From<TurnError> for ApplicationError {
    fn from(error: TurnError) -> Self {
        match error {
            TurnError::Policy(error) => Self::Policy(error.to_string()),
            TurnError::FilterContract(error) => Self::FilterContract(error),
            TurnError::Agent(error) => Self::Agent(error.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Warning,
    Error,
}

/// One thing the display collaborator should render, in order.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisplayItem {
    UserMessage { text: String },
    AssistantMessage { text: String, citations: Vec<Citation> },
    GeneratedSql { sql: String },
    ResultTable { result: ResultSet },
    Notice { level: NoticeLevel, message: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    Aborted { reason: &'static str },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TurnReport {
    pub thread_id: ThreadId,
    pub status: TurnStatus,
    pub items: Vec<DisplayItem>,
}

impl TurnReport {
    fn new(thread_id: ThreadId) -> Self {
        Self { thread_id, status: TurnStatus::Completed, items: Vec::new() }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TurnStatus::Completed
    }

    pub fn assistant_text(&self) -> Option<&str> {
        self.items.iter().find_map(|item| match item {
            DisplayItem::AssistantMessage { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Default)]
struct SessionState {
    history: ConversationHistory,
    generation: u64,
}

/// History of one conversation plus the lock that keeps its turns sequential.
///
/// Clearing bumps the generation. A turn remembers the generation it started
/// under and stops appending once it is stale, so "new conversation" never
/// waits for or mixes with an in-flight turn.
#[derive(Debug, Default)]
pub struct ConversationSession {
    state: Mutex<SessionState>,
    turn_lock: tokio::sync::Mutex<()>,
}

impl ConversationSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SessionState) -> T) -> T {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.with_state(|state| state.generation)
    }

    pub fn history(&self) -> ConversationHistory {
        self.with_state(|state| state.history.clone())
    }

    /// Starts a new conversation and returns the new generation.
    pub fn clear(&self) -> u64 {
        self.with_state(|state| {
            state.history.clear();
            state.generation += 1;
            state.generation
        })
    }

    fn append_if_current(
        &self,
        generation: u64,
        append: impl FnOnce(&mut ConversationHistory),
    ) -> bool {
        self.with_state(|state| {
            if state.generation != generation {
                return false;
            }
            append(&mut state.history);
            true
        })
    }

    /// True when no turn is running for this session.
    pub fn is_idle(&self) -> bool {
        self.turn_lock.try_lock().is_ok()
    }

    async fn begin_turn(&self) -> MutexGuard<'_, ()> {
        self.turn_lock.lock().await
    }
}

/// Collaborators the orchestrator is built from.
pub struct OrchestratorParts {
    pub shield: Arc<dyn ShieldClient>,
    pub dispatcher: Arc<dyn AgentDispatcher>,
    pub query: Arc<dyn QueryExecutor>,
    pub audit: Arc<dyn AuditSink>,
    pub result_limit: u32,
}

pub struct ConversationOrchestrator {
    authorizer: ContentAuthorizer,
    filters: RetrievalFilterResolver,
    dispatcher: Arc<dyn AgentDispatcher>,
    enricher: CitationEnricher,
    query: Arc<dyn QueryExecutor>,
    audit: Arc<dyn AuditSink>,
    result_limit: u32,
}

impl ConversationOrchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        let authorizer = ContentAuthorizer::new(parts.shield.clone(), parts.audit.clone());
        Self {
            filters: RetrievalFilterResolver::new(parts.shield, parts.audit.clone()),
            enricher: CitationEnricher::new(authorizer.clone(), parts.query.clone()),
            authorizer,
            dispatcher: parts.dispatcher,
            query: parts.query,
            audit: parts.audit,
            result_limit: parts.result_limit,
        }
    }

    /// Runs one user turn. Only an empty message is rejected up front; every
    /// later failure is reported inside the returned [`TurnReport`].
    pub async fn run_turn(
        &self,
        session: &ConversationSession,
        identity: &UserIdentity,
        message: &str,
    ) -> Result<TurnReport, DomainError> {
        if message.trim().is_empty() {
            return Err(DomainError::EmptyMessage);
        }

        let _turn = session.begin_turn().await;
        let generation = session.generation();
        let mut report = TurnReport::new(ThreadId::generate());
        let thread_id = report.thread_id.clone();

        info!(
            event_name = "conversation.turn.started",
            thread_id = %thread_id,
            username = %identity.username,
            "conversation turn started"
        );
        self.audit.emit(
            AuditEvent::new(
                thread_id.clone(),
                "conversation.turn.started",
                AuditCategory::Ingress,
                ACTOR,
                AuditOutcome::Success,
            )
            .with_metadata("username", identity.username.clone()),
        );

        let outcome = self
            .run_pipeline(session, generation, identity, &thread_id, message, &mut report)
            .await;

        let audit_outcome = match outcome {
            Ok(()) => {
                info!(
                    event_name = "conversation.turn.completed",
                    thread_id = %thread_id,
                    item_count = report.items.len(),
                    "conversation turn completed"
                );
                AuditOutcome::Success
            }
            Err(error) => {
                warn!(
                    event_name = "conversation.turn.aborted",
                    thread_id = %thread_id,
                    reason = error.kind(),
                    error = %error,
                    "conversation turn aborted"
                );
                report.items.push(DisplayItem::Notice {
                    level: NoticeLevel::Error,
                    message: error.user_message().to_string(),
                });
                report.status = TurnStatus::Aborted { reason: error.kind() };
                AuditOutcome::Failed
            }
        };
        self.audit.emit(AuditEvent::new(
            thread_id,
            "conversation.turn.finished",
            AuditCategory::System,
            ACTOR,
            audit_outcome,
        ));

        Ok(report)
    }

    async fn run_pipeline(
        &self,
        session: &ConversationSession,
        generation: u64,
        identity: &UserIdentity,
        thread_id: &ThreadId,
        message: &str,
        report: &mut TurnReport,
    ) -> Result<(), TurnError> {
        // A denied prompt still runs; the sanitized message stands in for it.
        let query = self
            .authorizer
            .authorize_prompt(identity, message, thread_id)
            .await?
            .into_display_text();
        report.items.push(DisplayItem::UserMessage { text: query.clone() });
        session.append_if_current(generation, |history| history.push_user(query.clone()));

        let resolved = self.filters.resolve(identity, thread_id).await?;
        let raw =
            self.dispatcher.dispatch(&query, self.result_limit, resolved.filter.as_ref()).await?;
        let decoded = stream::decode(&raw);
        self.audit.emit(
            AuditEvent::new(
                thread_id.clone(),
                "agent.response.decoded",
                AuditCategory::Agent,
                ACTOR,
                AuditOutcome::Success,
            )
            .with_metadata("text_len", decoded.text.chars().count().to_string())
            .with_metadata("has_sql", (!decoded.sql.is_empty()).to_string())
            .with_metadata("citation_count", decoded.citations.len().to_string()),
        );

        let mut slot = VectorDbInfoSlot::new(resolved.vector_db_info);

        if !decoded.text.is_empty() {
            let text = normalize_citation_markers(&decoded.text);
            let mut citations = decoded.citations;
            self.enricher.enrich(identity, thread_id, &mut citations, &mut slot).await?;

            let safeguarded = self
                .authorizer
                .authorize_reply(identity, &text, thread_id, &mut slot)
                .await?
                .into_display_text();
            session.append_if_current(generation, |history| {
                history.push_assistant(safeguarded.clone())
            });
            citations.retain(Citation::is_displayable);
            report.items.push(DisplayItem::AssistantMessage { text: safeguarded, citations });
        }

        if !decoded.sql.is_empty() {
            self.audit_reply(identity, thread_id, "generated_sql", &decoded.sql, &mut slot).await;
            report.items.push(DisplayItem::GeneratedSql { sql: decoded.sql.clone() });

            match self.query.execute(&prepare_generated_sql(&decoded.sql)).await {
                Ok(result) => {
                    let csv = result.to_csv();
                    self.audit_reply(identity, thread_id, "result_csv", &csv, &mut slot).await;
                    report.items.push(DisplayItem::ResultTable { result });
                }
                Err(error) => {
                    warn!(
                        event_name = "conversation.sql.failed",
                        thread_id = %thread_id,
                        error = %error,
                        "generated sql failed to execute"
                    );
                    self.audit.emit(
                        AuditEvent::new(
                            thread_id.clone(),
                            "query.execute",
                            AuditCategory::Query,
                            ACTOR,
                            AuditOutcome::Failed,
                        )
                        .with_metadata("error", error.to_string()),
                    );
                    report.items.push(DisplayItem::Notice {
                        level: NoticeLevel::Warning,
                        message: QUERY_FAILED_MESSAGE.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Audit-only authorization. The outcome is discarded and failures never
    /// block the turn.
    async fn audit_reply(
        &self,
        identity: &UserIdentity,
        thread_id: &ThreadId,
        artifact: &'static str,
        text: &str,
        slot: &mut VectorDbInfoSlot,
    ) {
        match self.authorizer.authorize_reply(identity, text, thread_id, slot).await {
            Ok(outcome) if !outcome.is_authorized() => warn!(
                event_name = "conversation.audit.denied",
                thread_id = %thread_id,
                artifact,
                "shield denied an audit-only artifact"
            ),
            Ok(_) => {}
            Err(error) => warn!(
                event_name = "conversation.audit.failed",
                thread_id = %thread_id,
                artifact,
                error = %error,
                "audit-only authorization failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use salesguard_core::{
        ApplicationError, AuditOutcome, CellValue, Citation, ConversationRole, DomainError,
        FilterError, HistoryRole, InMemoryAuditSink, QueryError, ResultSet, SearchFilter,
        UserIdentity, VectorDbInfo, NOT_AUTHORIZED_MESSAGE,
    };
    use serde_json::{json, Value};

    use super::{
        ConversationOrchestrator, ConversationSession, DisplayItem, NoticeLevel,
        OrchestratorParts, TurnError, TurnStatus, QUERY_FAILED_MESSAGE,
    };
    use crate::citations::testing::FakeWarehouse;
    use crate::dispatch::testing::FakeDispatcher;
    use crate::dispatch::{AgentDispatcher, DispatchError, RawResponse};
    use crate::shield::testing::FakeShield;
    use crate::shield::ShieldError;

    struct Harness {
        shield: FakeShield,
        dispatcher: FakeDispatcher,
        warehouse: FakeWarehouse,
        audit: InMemoryAuditSink,
    }

    impl Harness {
        fn new(warehouse: FakeWarehouse) -> Self {
            Self {
                shield: FakeShield::default(),
                dispatcher: FakeDispatcher::default(),
                warehouse,
                audit: InMemoryAuditSink::default(),
            }
        }

        fn orchestrator(&self) -> ConversationOrchestrator {
            ConversationOrchestrator::new(OrchestratorParts {
                shield: Arc::new(self.shield.clone()),
                dispatcher: Arc::new(self.dispatcher.clone()),
                query: Arc::new(self.warehouse.clone()),
                audit: Arc::new(self.audit.clone()),
                result_limit: 1,
            })
        }
    }

    fn identity() -> UserIdentity {
        UserIdentity::new("Jane.Doe", "\"SALES_ANALYST\"")
    }

    fn text_delta(text: &str) -> Value {
        json!({
            "event": "message.delta",
            "data": { "delta": { "content": [{ "type": "text", "text": text }] } }
        })
    }

    fn tool_delta(tool_json: Value) -> Value {
        json!({
            "event": "message.delta",
            "data": { "delta": { "content": [{
                "type": "tool_results",
                "tool_results": { "content": [{ "type": "json", "json": tool_json }] }
            }] } }
        })
    }

    fn revenue_result() -> ResultSet {
        ResultSet::new(
            vec!["region".to_string(), "revenue".to_string()],
            vec![vec![CellValue::Text("EMEA".to_string()), CellValue::Integer(1200)]],
        )
    }

    #[tokio::test]
    async fn text_and_sql_without_citations_are_displayed_and_executed() {
        let harness = Harness::new(FakeWarehouse::default().with_result(Ok(revenue_result())));
        harness.dispatcher.respond_with(Ok(RawResponse::Events(vec![
            text_delta("Revenue grew"),
            tool_delta(json!({ "sql": "SELECT region, SUM(deal_value) FROM sales_metrics;" })),
        ])));
        let session = ConversationSession::new();

        let report = harness
            .orchestrator()
            .run_turn(&session, &identity(), "How did revenue change?")
            .await
            .expect("turn");

        assert!(report.is_completed());
        assert_eq!(
            report.items,
            vec![
                DisplayItem::UserMessage { text: "How did revenue change?".to_string() },
                DisplayItem::AssistantMessage {
                    text: "Revenue grew".to_string(),
                    citations: Vec::new()
                },
                DisplayItem::GeneratedSql {
                    sql: "SELECT region, SUM(deal_value) FROM sales_metrics;".to_string()
                },
                DisplayItem::ResultTable { result: revenue_result() },
            ]
        );
        assert_eq!(
            harness.warehouse.executed(),
            vec!["SELECT region, SUM(deal_value) FROM sales_metrics".to_string()]
        );

        let checked = harness.shield.checks();
        let texts = checked.iter().map(|check| check.text.as_str()).collect::<Vec<_>>();
        assert_eq!(
            texts,
            vec![
                "How did revenue change?",
                "Revenue grew",
                "SELECT region, SUM(deal_value) FROM sales_metrics;",
                "region,revenue\nEMEA,1200\n",
            ]
        );
        assert_eq!(checked[0].role, ConversationRole::Prompt);
        assert!(checked[1..].iter().all(|check| check.role == ConversationRole::Reply));
        assert!(checked.iter().all(|check| check.thread_id == report.thread_id));

        let history = session.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history.entries()[0].role, HistoryRole::User);
        assert_eq!(history.entries()[1].content, "Revenue grew");
    }

    #[tokio::test]
    async fn cited_transcript_is_safeguarded_and_attached() {
        let harness = Harness::new(
            FakeWarehouse::default().with_transcript("D1", "Client wants discount on renewal"),
        );
        harness.dispatcher.respond_with(Ok(RawResponse::Events(vec![
            tool_delta(json!({
                "text": "TechCorp asked for a discount 【†1†】",
                "searchResults": [{ "source_id": 1, "doc_id": "D1" }]
            })),
        ])));

        let report = harness
            .orchestrator()
            .run_turn(&ConversationSession::new(), &identity(), "What did TechCorp ask for?")
            .await
            .expect("turn");

        let mut expected = Citation::new("1", "D1");
        expected.safeguarded_transcript_text = Some("Client wants discount on renewal".to_string());
        assert_eq!(
            report.items[1],
            DisplayItem::AssistantMessage {
                text: "TechCorp asked for a discount [1]".to_string(),
                citations: vec![expected],
            }
        );
        assert_eq!(harness.warehouse.lookups(), vec!["D1".to_string()]);
    }

    #[tokio::test]
    async fn missing_transcript_yields_no_citation_text_and_no_error() {
        let harness = Harness::new(FakeWarehouse::default());
        harness.dispatcher.respond_with(Ok(RawResponse::Events(vec![tool_delta(json!({
            "text": "See the call notes 【†1†】",
            "searchResults": [{ "source_id": "1", "doc_id": "D1" }]
        }))])));

        let report = harness
            .orchestrator()
            .run_turn(&ConversationSession::new(), &identity(), "Any call notes?")
            .await
            .expect("turn");

        assert!(report.is_completed());
        assert_eq!(
            report.items[1],
            DisplayItem::AssistantMessage {
                text: "See the call notes [1]".to_string(),
                citations: Vec::new(),
            }
        );
    }

    #[tokio::test]
    async fn denied_final_text_shows_generic_message_and_turn_completes() {
        let harness = Harness::new(FakeWarehouse::default());
        harness.shield.deny_when_containing("salaries", "access denied for role SALES_ANALYST");
        harness
            .dispatcher
            .respond_with(Ok(RawResponse::Events(vec![text_delta("Rep salaries are 200k")])));
        let session = ConversationSession::new();

        let report =
            harness.orchestrator().run_turn(&session, &identity(), "Show pay").await.expect("turn");

        assert!(report.is_completed());
        assert_eq!(report.assistant_text(), Some(NOT_AUTHORIZED_MESSAGE));
        assert_eq!(session.history().entries()[1].content, NOT_AUTHORIZED_MESSAGE);
    }

    #[tokio::test]
    async fn denied_prompt_continues_with_sanitized_message() {
        let harness = Harness::new(FakeWarehouse::default());
        harness.shield.push_result(Err(ShieldError::AccessDenied(
            "ERROR: PAIG-400004: Questions about compensation are blocked".to_string(),
        )));

        let report = harness
            .orchestrator()
            .run_turn(&ConversationSession::new(), &identity(), "What does Mike earn?")
            .await
            .expect("turn");

        let blocked = "Questions about compensation are blocked".to_string();
        assert_eq!(report.items[0], DisplayItem::UserMessage { text: blocked.clone() });
        assert_eq!(harness.dispatcher.calls()[0].query, blocked);
    }

    #[tokio::test]
    async fn vector_db_info_accompanies_only_the_first_reply_authorization() {
        let harness = Harness::new(
            FakeWarehouse::default()
                .with_transcript("D1", "first transcript")
                .with_transcript("D2", "second transcript")
                .with_result(Ok(revenue_result())),
        );
        harness.shield.set_filter(
            Ok("{'@eq': {'region': 'EMEA'}}".to_string()),
            Some(VectorDbInfo(json!({"vectorDBName": "sales_conversation_search"}))),
        );
        harness.dispatcher.respond_with(Ok(RawResponse::Events(vec![tool_delta(json!({
            "text": "Two calls 【†1†】【†2†】",
            "sql": "SELECT 1",
            "searchResults": [
                { "source_id": 1, "doc_id": "D1" },
                { "source_id": 2, "doc_id": "D2" }
            ]
        }))])));

        harness
            .orchestrator()
            .run_turn(&ConversationSession::new(), &identity(), "Summarize EMEA calls")
            .await
            .expect("turn");

        assert_eq!(
            harness.dispatcher.calls()[0].filter,
            Some(SearchFilter::eq("region", "EMEA"))
        );
        let replies = harness
            .shield
            .checks()
            .into_iter()
            .filter(|check| check.role == ConversationRole::Reply)
            .collect::<Vec<_>>();
        assert_eq!(replies.len(), 5);
        assert_eq!(replies[0].text, "first transcript");
        let carried = replies.iter().filter(|check| check.vector_db_info.is_some()).count();
        assert_eq!(carried, 1);
        assert!(replies[0].vector_db_info.is_some());
    }

    #[tokio::test]
    async fn sql_audit_failures_do_not_block_execution() {
        let harness = Harness::new(FakeWarehouse::default().with_result(Ok(revenue_result())));
        harness.shield.push_result(Ok("Which region leads?".to_string()));
        harness.shield.push_result(Err(ShieldError::Transport("reset".to_string())));
        harness.shield.push_result(Err(ShieldError::AccessDenied("access denied".to_string())));
        harness
            .dispatcher
            .respond_with(Ok(RawResponse::Events(vec![tool_delta(json!({ "sql": "SELECT 1;" }))])));

        let report = harness
            .orchestrator()
            .run_turn(&ConversationSession::new(), &identity(), "Which region leads?")
            .await
            .expect("turn");

        assert!(report.is_completed());
        assert!(report.items.contains(&DisplayItem::GeneratedSql { sql: "SELECT 1;".to_string() }));
        assert!(report.items.contains(&DisplayItem::ResultTable { result: revenue_result() }));
        assert_eq!(harness.warehouse.executed(), vec!["SELECT 1".to_string()]);
    }

    #[tokio::test]
    async fn sql_execution_error_becomes_a_generic_notice() {
        let harness = Harness::new(
            FakeWarehouse::default()
                .with_result(Err(QueryError::Execution("no such table: secrets".to_string()))),
        );
        harness.dispatcher.respond_with(Ok(RawResponse::Events(vec![tool_delta(
            json!({ "sql": "SELECT * FROM secrets" }),
        )])));

        let report = harness
            .orchestrator()
            .run_turn(&ConversationSession::new(), &identity(), "Show me everything")
            .await
            .expect("turn");

        assert!(report.is_completed());
        assert_eq!(
            report.items.last(),
            Some(&DisplayItem::Notice {
                level: NoticeLevel::Warning,
                message: QUERY_FAILED_MESSAGE.to_string()
            })
        );
    }

    #[tokio::test]
    async fn shield_transport_failure_on_prompt_aborts_turn() {
        let harness = Harness::new(FakeWarehouse::default());
        harness.shield.push_result(Err(ShieldError::Transport("timed out".to_string())));
        let session = ConversationSession::new();

        let report =
            harness.orchestrator().run_turn(&session, &identity(), "Hello").await.expect("turn");

        assert_eq!(report.status, TurnStatus::Aborted { reason: "policy_unavailable" });
        assert!(matches!(
            report.items.as_slice(),
            [DisplayItem::Notice { level: NoticeLevel::Error, .. }]
        ));
        assert!(harness.dispatcher.calls().is_empty());
        assert!(session.history().is_empty());
        assert_eq!(harness.shield.open_sessions(), 0);

        let finished = harness
            .audit
            .events_for(&report.thread_id)
            .into_iter()
            .find(|event| event.event_type == "conversation.turn.finished")
            .expect("finish event");
        assert_eq!(finished.outcome, AuditOutcome::Failed);
    }

    #[tokio::test]
    async fn malformed_filter_fails_closed_before_dispatch() {
        let harness = Harness::new(FakeWarehouse::default());
        harness.shield.set_filter(Ok("{'@eq': ['region', 'EMEA']}".to_string()), None);

        let report = harness
            .orchestrator()
            .run_turn(&ConversationSession::new(), &identity(), "EMEA deals")
            .await
            .expect("turn");

        assert_eq!(report.status, TurnStatus::Aborted { reason: "filter_contract_violation" });
        assert!(harness.dispatcher.calls().is_empty());
    }

    #[tokio::test]
    async fn empty_filter_literal_dispatches_unfiltered_and_keeps_vector_db_info() {
        let harness = Harness::new(FakeWarehouse::default().with_transcript("D1", "call notes"));
        harness.shield.set_filter(
            Ok("{}".to_string()),
            Some(VectorDbInfo(json!({"vectorDBName": "sales_conversation_search"}))),
        );
        harness.dispatcher.respond_with(Ok(RawResponse::Events(vec![tool_delta(json!({
            "text": "One call 【†1†】",
            "searchResults": [{ "source_id": 1, "doc_id": "D1" }]
        }))])));

        let report = harness
            .orchestrator()
            .run_turn(&ConversationSession::new(), &identity(), "Any calls?")
            .await
            .expect("turn");

        assert!(report.is_completed());
        let calls = harness.dispatcher.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].filter, None);
        let first_reply = harness
            .shield
            .checks()
            .into_iter()
            .find(|check| check.role == ConversationRole::Reply)
            .expect("reply check");
        assert_eq!(first_reply.text, "call notes");
        assert!(first_reply.vector_db_info.is_some());
    }

    #[tokio::test]
    async fn agent_failure_aborts_turn_with_generic_notice() {
        let harness = Harness::new(FakeWarehouse::default());
        harness.dispatcher.respond_with(Err(DispatchError::Status {
            status: 500,
            reason: "Internal Server Error".to_string(),
        }));

        let report = harness
            .orchestrator()
            .run_turn(&ConversationSession::new(), &identity(), "Top deals?")
            .await
            .expect("turn");

        assert_eq!(report.status, TurnStatus::Aborted { reason: "agent_unavailable" });
        let notice = report.items.last().expect("notice");
        assert!(matches!(notice, DisplayItem::Notice { message, .. } if !message.contains("500")));
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let harness = Harness::new(FakeWarehouse::default());

        let error = harness
            .orchestrator()
            .run_turn(&ConversationSession::new(), &identity(), "   ")
            .await
            .expect_err("empty message");

        assert_eq!(error, DomainError::EmptyMessage);
        assert!(harness.shield.checks().is_empty());
    }

    struct ClearingDispatcher {
        session: Arc<ConversationSession>,
    }

    #[async_trait]
    impl AgentDispatcher for ClearingDispatcher {
        async fn dispatch(
            &self,
            _query: &str,
            _result_limit: u32,
            _filter: Option<&SearchFilter>,
        ) -> Result<RawResponse, DispatchError> {
            self.session.clear();
            Ok(RawResponse::Events(vec![text_delta("late answer")]))
        }
    }

    #[tokio::test]
    async fn clearing_mid_turn_keeps_new_history_clean() {
        let harness = Harness::new(FakeWarehouse::default());
        let session = Arc::new(ConversationSession::new());
        let orchestrator = ConversationOrchestrator::new(OrchestratorParts {
            shield: Arc::new(harness.shield.clone()),
            dispatcher: Arc::new(ClearingDispatcher { session: session.clone() }),
            query: Arc::new(harness.warehouse.clone()),
            audit: Arc::new(harness.audit.clone()),
            result_limit: 1,
        });

        let report = orchestrator.run_turn(&session, &identity(), "question").await.expect("turn");

        assert_eq!(report.assistant_text(), Some("late answer"));
        assert!(session.history().is_empty());
        assert_eq!(session.generation(), 1);
    }

    struct ObservingDispatcher {
        session: Arc<ConversationSession>,
        idle_during_turn: std::sync::Mutex<Option<bool>>,
    }

    #[async_trait]
    impl AgentDispatcher for ObservingDispatcher {
        async fn dispatch(
            &self,
            _query: &str,
            _result_limit: u32,
            _filter: Option<&SearchFilter>,
        ) -> Result<RawResponse, DispatchError> {
            if let Ok(mut seen) = self.idle_during_turn.lock() {
                *seen = Some(self.session.is_idle());
            }
            Ok(RawResponse::Events(vec![text_delta("answer")]))
        }
    }

    #[tokio::test]
    async fn session_is_busy_only_while_a_turn_runs() {
        let harness = Harness::new(FakeWarehouse::default());
        let session = Arc::new(ConversationSession::new());
        let dispatcher = Arc::new(ObservingDispatcher {
            session: session.clone(),
            idle_during_turn: std::sync::Mutex::new(None),
        });
        let orchestrator = ConversationOrchestrator::new(OrchestratorParts {
            shield: Arc::new(harness.shield.clone()),
            dispatcher: dispatcher.clone(),
            query: Arc::new(harness.warehouse.clone()),
            audit: Arc::new(harness.audit.clone()),
            result_limit: 1,
        });

        assert!(session.is_idle());
        orchestrator.run_turn(&session, &identity(), "question").await.expect("turn");

        assert_eq!(*dispatcher.idle_during_turn.lock().expect("lock"), Some(false));
        assert!(session.is_idle());
    }

    #[test]
    fn turn_errors_map_onto_application_errors() {
        let filter = TurnError::from(FilterError::Shape("unknown operator `@regex`".to_string()));
        assert!(matches!(ApplicationError::from(filter), ApplicationError::FilterContract(_)));

        let policy = TurnError::from(ShieldError::Transport("reset".to_string()));
        assert!(!policy.user_message().contains("reset"));
        assert!(matches!(ApplicationError::from(policy), ApplicationError::Policy(_)));
    }
}
