use std::sync::Arc;

use salesguard_core::{
    parse_filter_expression, AuditCategory, AuditEvent, AuditOutcome, AuditSink, FilterError,
    SearchFilter, ThreadId, UserIdentity, VectorDbInfo,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::shield::{ShieldClient, ShieldContext, ShieldError};

#[derive(Clone, Debug, Error, PartialEq)]
pub enum FilterResolutionError {
    #[error(transparent)]
    Shield(#[from] ShieldError),
    #[error("shield returned an unusable retrieval filter: {0}")]
    Contract(#[from] FilterError),
}

/// Query-time access control for the retrieval step.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedFilter {
    pub filter: Option<SearchFilter>,
    pub vector_db_info: Option<VectorDbInfo>,
}

pub struct RetrievalFilterResolver {
    shield: Arc<dyn ShieldClient>,
    audit: Arc<dyn AuditSink>,
}

impl RetrievalFilterResolver {
    pub fn new(shield: Arc<dyn ShieldClient>, audit: Arc<dyn AuditSink>) -> Self {
        Self { shield, audit }
    }

    /// Asks the shield for the filter expression of this thread. A blank
    /// expression means no filter and no vector-db info. `{}` or `None` means
    /// no filter but keeps the vector-db info. Anything else must parse into a
    /// [`SearchFilter`]; otherwise resolution fails closed.
    pub async fn resolve(
        &self,
        identity: &UserIdentity,
        thread_id: &ThreadId,
    ) -> Result<ResolvedFilter, FilterResolutionError> {
        let result = self.resolve_inner(identity, thread_id).await;

        let outcome = match &result {
            Ok(_) => AuditOutcome::Success,
            Err(FilterResolutionError::Contract(_)) => AuditOutcome::Rejected,
            Err(FilterResolutionError::Shield(_)) => AuditOutcome::Failed,
        };
        let mut event = AuditEvent::new(
            thread_id.clone(),
            "shield.retrieval_filter",
            AuditCategory::Retrieval,
            "retrieval-filter-resolver",
            outcome,
        )
        .with_metadata("username", identity.username.clone());

        match &result {
            Ok(resolved) => {
                let operator = resolved.filter.as_ref().map_or("none", SearchFilter::operator);
                event = event.with_metadata("operator", operator);
                info!(
                    event_name = "shield.retrieval_filter.resolved",
                    thread_id = %thread_id,
                    operator,
                    has_vector_db_info = resolved.vector_db_info.is_some(),
                    "retrieval filter resolved"
                );
            }
            Err(error) => {
                event = event.with_metadata("error", error.to_string());
                warn!(
                    event_name = "shield.retrieval_filter.failed",
                    thread_id = %thread_id,
                    error = %error,
                    "retrieval filter resolution failed"
                );
            }
        }
        self.audit.emit(event);

        result
    }

    async fn resolve_inner(
        &self,
        identity: &UserIdentity,
        thread_id: &ThreadId,
    ) -> Result<ResolvedFilter, FilterResolutionError> {
        let mut context = ShieldContext::enter(self.shield.as_ref(), identity, None)?;
        let expression = context.retrieval_filter_expression(thread_id).await?;
        if expression.trim().is_empty() {
            return Ok(ResolvedFilter::default());
        }

        // `{}` and `None` carry no filter but still scope the vector store
        let filter = parse_filter_expression(&expression)?;
        Ok(ResolvedFilter { filter, vector_db_info: context.current_vector_db_info() })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use salesguard_core::{
        AuditOutcome, InMemoryAuditSink, SearchFilter, ThreadId, UserIdentity, VectorDbInfo,
    };
    use serde_json::json;

    use super::{FilterResolutionError, ResolvedFilter, RetrievalFilterResolver};
    use crate::shield::testing::FakeShield;
    use crate::shield::ShieldError;

    fn resolver(shield: &FakeShield, audit: &InMemoryAuditSink) -> RetrievalFilterResolver {
        RetrievalFilterResolver::new(Arc::new(shield.clone()), Arc::new(audit.clone()))
    }

    fn identity() -> UserIdentity {
        UserIdentity::new("jane", "sales_analyst")
    }

    #[tokio::test]
    async fn blank_expression_yields_no_filter_and_no_token() {
        let shield = FakeShield::default();
        shield.set_filter(Ok("   ".to_string()), Some(VectorDbInfo(json!({"ignored": true}))));
        let audit = InMemoryAuditSink::default();

        let resolved = resolver(&shield, &audit)
            .resolve(&identity(), &ThreadId::generate())
            .await
            .expect("blank filter");

        assert_eq!(resolved, ResolvedFilter::default());
        assert_eq!(shield.open_sessions(), 0);
    }

    #[tokio::test]
    async fn literal_expression_parses_and_carries_token() {
        let shield = FakeShield::default();
        let token = VectorDbInfo(json!({"vectorDBName": "sales", "filter_id": 7}));
        shield.set_filter(Ok("{'@eq': {'region': 'EMEA'}}".to_string()), Some(token.clone()));
        let audit = InMemoryAuditSink::default();
        let thread_id = ThreadId::generate();

        let resolved =
            resolver(&shield, &audit).resolve(&identity(), &thread_id).await.expect("filter");

        assert_eq!(resolved.filter, Some(SearchFilter::eq("region", "EMEA")));
        assert_eq!(resolved.vector_db_info, Some(token));
        let events = audit.events_for(&thread_id);
        assert_eq!(events[0].outcome, AuditOutcome::Success);
        assert_eq!(events[0].metadata.get("operator").map(String::as_str), Some("@eq"));
    }

    #[tokio::test]
    async fn empty_dict_expression_yields_no_filter_but_keeps_token() {
        let shield = FakeShield::default();
        let token = VectorDbInfo(json!({"vectorDBName": "sales"}));
        shield.set_filter(Ok("{}".to_string()), Some(token.clone()));
        let audit = InMemoryAuditSink::default();
        let thread_id = ThreadId::generate();

        let resolved =
            resolver(&shield, &audit).resolve(&identity(), &thread_id).await.expect("no filter");

        assert_eq!(resolved.filter, None);
        assert_eq!(resolved.vector_db_info, Some(token));
        assert_eq!(audit.events_for(&thread_id)[0].outcome, AuditOutcome::Success);
        assert_eq!(shield.open_sessions(), 0);
    }

    #[tokio::test]
    async fn malformed_expression_fails_closed() {
        let shield = FakeShield::default();
        shield.set_filter(Ok("{'@eq': {'region': ".to_string()), None);
        let audit = InMemoryAuditSink::default();
        let thread_id = ThreadId::generate();

        let error = resolver(&shield, &audit)
            .resolve(&identity(), &thread_id)
            .await
            .expect_err("unparseable filter");

        assert!(matches!(error, FilterResolutionError::Contract(_)));
        assert_eq!(audit.events_for(&thread_id)[0].outcome, AuditOutcome::Rejected);
        assert_eq!(shield.open_sessions(), 0);
    }

    #[tokio::test]
    async fn unsupported_operator_fails_closed() {
        let shield = FakeShield::default();
        shield.set_filter(Ok("{'@regex': {'region': 'E.*'}}".to_string()), None);
        let audit = InMemoryAuditSink::default();

        let error = resolver(&shield, &audit)
            .resolve(&identity(), &ThreadId::generate())
            .await
            .expect_err("unknown operator");

        assert!(matches!(error, FilterResolutionError::Contract(_)));
    }

    #[tokio::test]
    async fn shield_failure_is_reported() {
        let shield = FakeShield::default();
        shield.set_filter(
            Err(ShieldError::Status { status: 502, reason: "Bad Gateway".to_string() }),
            None,
        );
        let audit = InMemoryAuditSink::default();

        let error = resolver(&shield, &audit)
            .resolve(&identity(), &ThreadId::generate())
            .await
            .expect_err("shield failure");

        assert!(matches!(error, FilterResolutionError::Shield(ShieldError::Status { .. })));
    }
}
