use std::sync::Arc;

use salesguard_core::{
    AuditCategory, AuditEvent, AuditOutcome, AuditSink, AuthorizationOutcome, ContentArtifact,
    ThreadId, UserIdentity, VectorDbInfo,
};
use tracing::{info, warn};

use crate::shield::{ShieldClient, ShieldContext, ShieldError};

const ACTOR: &str = "content-authorizer";

/// Holds the turn's vector-db info until the first reply-side authorization
/// that actually reaches the shield takes it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VectorDbInfoSlot(Option<VectorDbInfo>);

impl VectorDbInfoSlot {
    pub fn new(info: Option<VectorDbInfo>) -> Self {
        Self(info)
    }

    pub fn take(&mut self) -> Option<VectorDbInfo> {
        self.0.take()
    }

    pub fn is_spent(&self) -> bool {
        self.0.is_none()
    }
}

/// Runs single text fragments through the shield.
#[derive(Clone)]
pub struct ContentAuthorizer {
    shield: Arc<dyn ShieldClient>,
    audit: Arc<dyn AuditSink>,
}

impl ContentAuthorizer {
    pub fn new(shield: Arc<dyn ShieldClient>, audit: Arc<dyn AuditSink>) -> Self {
        Self { shield, audit }
    }

    /// Empty text is authorized as-is without contacting the shield. Access
    /// denials become [`AuthorizationOutcome::Denied`] with a sanitized
    /// message; any other shield failure is returned as an error.
    pub async fn authorize(
        &self,
        identity: &UserIdentity,
        artifact: &ContentArtifact,
        thread_id: &ThreadId,
        vector_db_info: Option<VectorDbInfo>,
    ) -> Result<AuthorizationOutcome, ShieldError> {
        if artifact.is_blank() {
            return Ok(AuthorizationOutcome::Authorized(artifact.text.clone()));
        }

        let carried_vector_db_info = vector_db_info.is_some();
        let checked = match ShieldContext::enter(self.shield.as_ref(), identity, vector_db_info) {
            Ok(context) => context.check_access(&artifact.text, artifact.role, thread_id).await,
            Err(error) => Err(error),
        };

        let (outcome, audit_outcome) = match checked {
            Ok(text) => (Ok(AuthorizationOutcome::Authorized(text)), AuditOutcome::Success),
            Err(error) if error.is_access_denied() => (
                Ok(AuthorizationOutcome::denied_from_raw(&error.to_string())),
                AuditOutcome::Rejected,
            ),
            Err(error) => {
                warn!(
                    event_name = "shield.authorize.failed",
                    thread_id = %thread_id,
                    role = artifact.role.as_str(),
                    error = %error,
                    "shield authorization call failed"
                );
                (Err(error), AuditOutcome::Failed)
            }
        };

        info!(
            event_name = "shield.authorize",
            thread_id = %thread_id,
            role = artifact.role.as_str(),
            outcome = ?audit_outcome,
            carried_vector_db_info,
            "content authorization completed"
        );
        self.audit.emit(
            AuditEvent::new(
                thread_id.clone(),
                "shield.authorize",
                AuditCategory::Policy,
                ACTOR,
                audit_outcome,
            )
            .with_metadata("role", artifact.role.as_str())
            .with_metadata("username", identity.username.clone())
            .with_metadata("text_len", artifact.text.chars().count().to_string())
            .with_metadata("carried_vector_db_info", carried_vector_db_info.to_string()),
        );

        outcome
    }

    /// Reply-side authorization. Takes the slot's vector-db info only when the
    /// call is going to reach the shield.
    pub async fn authorize_reply(
        &self,
        identity: &UserIdentity,
        text: &str,
        thread_id: &ThreadId,
        slot: &mut VectorDbInfoSlot,
    ) -> Result<AuthorizationOutcome, ShieldError> {
        let artifact = ContentArtifact::reply(text);
        let vector_db_info = if artifact.is_blank() { None } else { slot.take() };
        self.authorize(identity, &artifact, thread_id, vector_db_info).await
    }

    pub async fn authorize_prompt(
        &self,
        identity: &UserIdentity,
        text: &str,
        thread_id: &ThreadId,
    ) -> Result<AuthorizationOutcome, ShieldError> {
        self.authorize(identity, &ContentArtifact::prompt(text), thread_id, None).await
    }
}

impl std::fmt::Debug for ContentAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentAuthorizer").finish_non_exhaustive()
    }
}
