//! Policy ("shield") collaborator contract and the scoped session guard.
//!
//! Every authorization and filter-resolution call runs inside a
//! [`ShieldContext`]. The context owns the underlying session and releases it
//! when dropped, so early returns through `?` release it too.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use salesguard_core::config::ShieldConfig;
use salesguard_core::{ConversationRole, ThreadId, UserIdentity, VectorDbInfo};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ShieldError {
    /// Rule-level rejection. Displays in the shield's exception format so the
    /// denial sanitizer can inspect it.
    #[error("AccessControlException: {0}")]
    AccessDenied(String),
    #[error("shield transport failure: {0}")]
    Transport(String),
    #[error("shield returned status {status}: {reason}")]
    Status { status: u16, reason: String },
    #[error("shield returned a malformed response: {0}")]
    MalformedResponse(String),
}

impl ShieldError {
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::AccessDenied(_))
    }
}

/// Who the session acts for, plus the retrieval token to audit against.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionScope {
    pub identity: UserIdentity,
    pub vector_db_info: Option<VectorDbInfo>,
}

#[async_trait]
pub trait ShieldSession: Send + Sync {
    /// Returns the approved (possibly rewritten) text, or
    /// [`ShieldError::AccessDenied`].
    async fn check_access(
        &self,
        text: &str,
        role: ConversationRole,
        thread_id: &ThreadId,
    ) -> Result<String, ShieldError>;

    /// Literal-syntax filter expression for the retrieval step. Also updates
    /// the session's current vector-db info.
    async fn retrieval_filter_expression(
        &mut self,
        thread_id: &ThreadId,
    ) -> Result<String, ShieldError>;

    fn current_vector_db_info(&self) -> Option<VectorDbInfo>;

    fn release(&mut self);
}

pub trait ShieldClient: Send + Sync {
    fn open_session(&self, scope: SessionScope) -> Result<Box<dyn ShieldSession>, ShieldError>;
}

/// Scoped authorization session for one user and conversation thread.
pub struct ShieldContext {
    session: Box<dyn ShieldSession>,
}

impl ShieldContext {
    pub fn enter(
        client: &dyn ShieldClient,
        identity: &UserIdentity,
        vector_db_info: Option<VectorDbInfo>,
    ) -> Result<Self, ShieldError> {
        let session =
            client.open_session(SessionScope { identity: identity.clone(), vector_db_info })?;
        Ok(Self { session })
    }

    pub async fn check_access(
        &self,
        text: &str,
        role: ConversationRole,
        thread_id: &ThreadId,
    ) -> Result<String, ShieldError> {
        self.session.check_access(text, role, thread_id).await
    }

    pub async fn retrieval_filter_expression(
        &mut self,
        thread_id: &ThreadId,
    ) -> Result<String, ShieldError> {
        self.session.retrieval_filter_expression(thread_id).await
    }

    pub fn current_vector_db_info(&self) -> Option<VectorDbInfo> {
        self.session.current_vector_db_info()
    }
}

impl Drop for ShieldContext {
    fn drop(&mut self) {
        self.session.release();
    }
}

/// Explicit shield application settings, created once at bootstrap.
#[derive(Clone, Debug)]
pub struct ShieldApplication {
    pub endpoint: String,
    pub application_key: SecretString,
    pub timeout: Duration,
}

impl ShieldApplication {
    pub fn from_config(config: &ShieldConfig) -> Self {
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            application_key: config.application_api_key.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

/// Shield reached over HTTP.
#[derive(Clone, Debug)]
pub struct HttpShieldClient {
    http: reqwest::Client,
    application: ShieldApplication,
}

impl HttpShieldClient {
    pub fn new(application: ShieldApplication) -> Result<Self, ShieldError> {
        let http = reqwest::Client::builder()
            .timeout(application.timeout)
            .build()
            .map_err(|error| ShieldError::Transport(error.to_string()))?;
        Ok(Self { http, application })
    }
}

impl ShieldClient for HttpShieldClient {
    fn open_session(&self, scope: SessionScope) -> Result<Box<dyn ShieldSession>, ShieldError> {
        debug!(
            event_name = "shield.session.opened",
            username = %scope.identity.username,
            carries_vector_db_info = scope.vector_db_info.is_some(),
            "shield session opened"
        );
        Ok(Box::new(HttpShieldSession {
            http: self.http.clone(),
            application: self.application.clone(),
            current_vector_db_info: None,
            scope,
        }))
    }
}

struct HttpShieldSession {
    http: reqwest::Client,
    application: ShieldApplication,
    scope: SessionScope,
    current_vector_db_info: Option<VectorDbInfo>,
}

#[derive(Serialize)]
struct AuthorizeRequest<'a> {
    application_key: &'a str,
    username: &'a str,
    user_groups: &'a [String],
    use_external_groups: bool,
    thread_id: &'a str,
    conversation_type: ConversationRole,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    vector_db_info: Option<&'a VectorDbInfo>,
}

#[derive(Serialize)]
struct FilterRequest<'a> {
    application_key: &'a str,
    username: &'a str,
    user_groups: &'a [String],
    use_external_groups: bool,
    thread_id: &'a str,
}

#[derive(Deserialize)]
struct AuthorizeResponse {
    response_text: String,
}

#[derive(Deserialize)]
struct DeniedResponse {
    message: String,
}

#[derive(Deserialize)]
struct FilterResponse {
    #[serde(default)]
    filter_expression: String,
    #[serde(default)]
    vector_db_info: Option<VectorDbInfo>,
}

impl HttpShieldSession {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.application.endpoint)
    }

    async fn post<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(StatusCode, String), ShieldError> {
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|error| ShieldError::Transport(error.to_string()))?;
        let status = response.status();
        let body =
            response.text().await.map_err(|error| ShieldError::Transport(error.to_string()))?;
        Ok((status, body))
    }
}

#[async_trait]
impl ShieldSession for HttpShieldSession {
    async fn check_access(
        &self,
        text: &str,
        role: ConversationRole,
        thread_id: &ThreadId,
    ) -> Result<String, ShieldError> {
        let request = AuthorizeRequest {
            application_key: self.application.application_key.expose_secret(),
            username: &self.scope.identity.username,
            user_groups: &self.scope.identity.user_groups,
            use_external_groups: true,
            thread_id: thread_id.as_str(),
            conversation_type: role,
            text,
            vector_db_info: self.scope.vector_db_info.as_ref(),
        };
        let (status, body) = self.post("/shield/authorize", &request).await?;
        authorize_outcome(status, &body)
    }

    async fn retrieval_filter_expression(
        &mut self,
        thread_id: &ThreadId,
    ) -> Result<String, ShieldError> {
        let request = FilterRequest {
            application_key: self.application.application_key.expose_secret(),
            username: &self.scope.identity.username,
            user_groups: &self.scope.identity.user_groups,
            use_external_groups: true,
            thread_id: thread_id.as_str(),
        };
        let (status, body) = self.post("/shield/vector-db-filter", &request).await?;
        if status != StatusCode::OK {
            return Err(status_error(status));
        }

        let response = serde_json::from_str::<FilterResponse>(&body)
            .map_err(|error| ShieldError::MalformedResponse(error.to_string()))?;
        self.current_vector_db_info = response.vector_db_info;
        Ok(response.filter_expression)
    }

    fn current_vector_db_info(&self) -> Option<VectorDbInfo> {
        self.current_vector_db_info.clone()
    }

    fn release(&mut self) {
        self.current_vector_db_info = None;
        debug!(
            event_name = "shield.session.released",
            username = %self.scope.identity.username,
            "shield session released"
        );
    }
}

/// A 403 is always a denial. An unreadable 403 body carries no reason, so the
/// sanitizer falls back to the generic message.
fn authorize_outcome(status: StatusCode, body: &str) -> Result<String, ShieldError> {
    match status {
        StatusCode::OK => serde_json::from_str::<AuthorizeResponse>(body)
            .map(|response| response.response_text)
            .map_err(|error| ShieldError::MalformedResponse(error.to_string())),
        StatusCode::FORBIDDEN => match serde_json::from_str::<DeniedResponse>(body) {
            Ok(denied) => Err(access_denied(denied.message)),
            Err(_) => Err(ShieldError::AccessDenied(String::new())),
        },
        other => Err(status_error(other)),
    }
}

fn access_denied(message: String) -> ShieldError {
    let message = match message.strip_prefix("AccessControlException: ") {
        Some(rest) => rest.to_string(),
        None => message,
    };
    ShieldError::AccessDenied(message)
}

fn status_error(status: StatusCode) -> ShieldError {
    ShieldError::Status {
        status: status.as_u16(),
        reason: status.canonical_reason().unwrap_or("Unknown reason").to_string(),
    }
}


#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use salesguard_core::{
        sanitize_denial_message, ConversationRole, ThreadId, UserIdentity, NOT_AUTHORIZED_MESSAGE,
    };

    use super::testing::FakeShield;
    use super::{access_denied, authorize_outcome, ShieldContext, ShieldError};

    #[tokio::test]
    async fn context_releases_session_on_error_paths() {
        let shield = FakeShield::default();
        shield.push_result(Err(ShieldError::Transport("connection reset".to_string())));
        let identity = UserIdentity::new("jane", "analyst");

        let outcome: Result<String, ShieldError> = async {
            let context = ShieldContext::enter(&shield, &identity, None)?;
            context.check_access("hello", ConversationRole::Prompt, &ThreadId::generate()).await
        }
        .await;

        assert!(matches!(outcome, Err(ShieldError::Transport(_))));
        assert_eq!(shield.sessions_opened(), 1);
        assert_eq!(shield.open_sessions(), 0);
    }

    #[test]
    fn access_denied_display_matches_exception_format() {
        let error = access_denied("ERROR: PAIG-400004: Column X contains PII".to_string());
        assert_eq!(
            error.to_string(),
            "AccessControlException: ERROR: PAIG-400004: Column X contains PII"
        );

        let already_prefixed = access_denied("AccessControlException: access denied".to_string());
        assert_eq!(already_prefixed.to_string(), "AccessControlException: access denied");
        assert!(already_prefixed.is_access_denied());
    }

    #[test]
    fn authorize_statuses_map_to_outcomes() {
        assert_eq!(
            authorize_outcome(StatusCode::OK, r#"{"response_text": "Revenue grew"}"#),
            Ok("Revenue grew".to_string())
        );
        assert!(matches!(
            authorize_outcome(StatusCode::OK, "<html>"),
            Err(ShieldError::MalformedResponse(_))
        ));
        assert_eq!(
            authorize_outcome(StatusCode::FORBIDDEN, r#"{"message": "ERROR: PAIG-400004: PII"}"#),
            Err(ShieldError::AccessDenied("ERROR: PAIG-400004: PII".to_string()))
        );
        assert!(matches!(
            authorize_outcome(StatusCode::BAD_GATEWAY, ""),
            Err(ShieldError::Status { status: 502, .. })
        ));
    }

    #[test]
    fn unreadable_forbidden_body_is_a_generic_denial() {
        let error = authorize_outcome(StatusCode::FORBIDDEN, "Forbidden")
            .expect_err("403 should be a denial");

        assert!(error.is_access_denied());
        assert_eq!(sanitize_denial_message(&error.to_string()), NOT_AUTHORIZED_MESSAGE);
    }
}
