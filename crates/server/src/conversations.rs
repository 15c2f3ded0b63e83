//! Conversation endpoints: run a turn, read history, start over.
//!
//! Every request must carry `Authorization: Bearer <token>` for one of the
//! configured callers. The caller decides the shield identity and scopes the
//! session ids it can see.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use salesguard_agent::{ConversationOrchestrator, ConversationSession, TurnReport};
use salesguard_core::config::ServerCaller;
use salesguard_core::{ApplicationError, DomainError, HistoryEntry, InterfaceError, UserIdentity};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_SESSION_ID_LEN: usize = 128;
const MAX_SESSIONS: usize = 10_000;

/// Configured bearer tokens and the identity each one acts as.
pub struct CallerDirectory {
    callers: Vec<(SecretString, UserIdentity)>,
}

impl CallerDirectory {
    pub fn new(callers: &[ServerCaller]) -> Self {
        let callers = callers
            .iter()
            .map(|caller| {
                (caller.token.clone(), UserIdentity::new(&caller.username, &caller.role))
            })
            .collect();
        Self { callers }
    }

    fn identify(&self, headers: &HeaderMap) -> Option<UserIdentity> {
        let presented = headers
            .get(AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")?
            .trim();
        if presented.is_empty() {
            return None;
        }
        self.callers
            .iter()
            .find(|(token, _)| token.expose_secret().trim() == presented)
            .map(|(_, identity)| identity.clone())
    }
}

/// Sessions are keyed by caller username and client-chosen session id.
type SessionKey = (String, String);

/// Live sessions, bounded by `capacity`. Starting over removes an idle
/// session outright; a full registry first drops idle sessions with no
/// history.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionKey, Arc<ConversationSession>>>,
    capacity: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_capacity(MAX_SESSIONS)
    }
}

impl SessionRegistry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), capacity }
    }

    async fn get(&self, key: &SessionKey) -> Option<Arc<ConversationSession>> {
        self.sessions.read().await.get(key).cloned()
    }

    /// `None` when the registry is full of sessions that are still in use.
    async fn get_or_create(&self, key: &SessionKey) -> Option<Arc<ConversationSession>> {
        if let Some(session) = self.get(key).await {
            return Some(session);
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(key) {
            return Some(session.clone());
        }
        if sessions.len() >= self.capacity {
            sessions.retain(|_, session| !(session.is_idle() && session.history().is_empty()));
        }
        if sessions.len() >= self.capacity {
            return None;
        }
        Some(sessions.entry(key.clone()).or_default().clone())
    }

    /// Clears the session and forgets it unless a turn is running. Returns
    /// the generation the cleared history ended at.
    async fn discard(&self, key: &SessionKey) -> u64 {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get(key).cloned() else {
            return 0;
        };
        let generation = session.clear();
        if session.is_idle() {
            sessions.remove(key);
        }
        generation
    }
}

#[derive(Clone)]
pub struct ConversationState {
    orchestrator: Arc<ConversationOrchestrator>,
    callers: Arc<CallerDirectory>,
    sessions: Arc<SessionRegistry>,
}

impl ConversationState {
    pub fn new(orchestrator: Arc<ConversationOrchestrator>, callers: CallerDirectory) -> Self {
        Self::with_registry(orchestrator, callers, SessionRegistry::default())
    }

    pub fn with_registry(
        orchestrator: Arc<ConversationOrchestrator>,
        callers: CallerDirectory,
        sessions: SessionRegistry,
    ) -> Self {
        Self { orchestrator, callers: Arc::new(callers), sessions: Arc::new(sessions) }
    }
}

/// Body of a turn. Identity fields sent by clients are ignored.
#[derive(Clone, Debug, Deserialize)]
pub struct TurnRequest {
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HistoryResponse {
    pub session_id: String,
    pub generation: u64,
    pub entries: Vec<HistoryEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClearedResponse {
    pub session_id: String,
    pub generation: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub correlation_id: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn router(orchestrator: Arc<ConversationOrchestrator>, callers: &[ServerCaller]) -> Router {
    routes(ConversationState::new(orchestrator, CallerDirectory::new(callers)))
}

pub fn routes(state: ConversationState) -> Router {
    Router::new()
        .route("/conversations/{session_id}", get(history).delete(new_conversation))
        .route("/conversations/{session_id}/turns", post(run_turn))
        .with_state(state)
}

pub async fn run_turn(
    State(state): State<ConversationState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(request): Json<TurnRequest>,
) -> Result<Json<TurnReport>, ApiError> {
    let correlation_id = Uuid::new_v4().to_string();
    let identity = authenticate(&state, &headers, &correlation_id)?;
    validate_session_id(&session_id, &correlation_id)?;

    let key = (identity.username.clone(), session_id.clone());
    let Some(session) = state.sessions.get_or_create(&key).await else {
        return Err(reject(
            ApplicationError::Persistence("session registry is full".to_string()),
            &correlation_id,
        ));
    };

    let report = state
        .orchestrator
        .run_turn(&session, &identity, &request.message)
        .await
        .map_err(|error| reject(ApplicationError::from(error), &correlation_id))?;

    info!(
        event_name = "http.conversation.turn_completed",
        correlation_id = %correlation_id,
        thread_id = %report.thread_id,
        session_id = %session_id,
        username = %identity.username,
        completed = report.is_completed(),
        item_count = report.items.len(),
        "conversation turn served"
    );
    Ok(Json(report))
}

pub async fn history(
    State(state): State<ConversationState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let correlation_id = Uuid::new_v4().to_string();
    let identity = authenticate(&state, &headers, &correlation_id)?;
    validate_session_id(&session_id, &correlation_id)?;

    let key = (identity.username, session_id.clone());
    let (generation, entries) = match state.sessions.get(&key).await {
        Some(session) => (session.generation(), session.history().entries().to_vec()),
        None => (0, Vec::new()),
    };
    Ok(Json(HistoryResponse { session_id, generation, entries }))
}

/// Clears history and releases the session. A turn still running for this
/// session finishes but no longer writes to the cleared history.
pub async fn new_conversation(
    State(state): State<ConversationState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<ClearedResponse>, ApiError> {
    let correlation_id = Uuid::new_v4().to_string();
    let identity = authenticate(&state, &headers, &correlation_id)?;
    validate_session_id(&session_id, &correlation_id)?;

    let generation = state.sessions.discard(&(identity.username, session_id.clone())).await;
    info!(
        event_name = "http.conversation.cleared",
        correlation_id = %correlation_id,
        thread_id = "unknown",
        session_id = %session_id,
        generation,
        "conversation history cleared"
    );
    Ok(Json(ClearedResponse { session_id, generation }))
}

fn authenticate(
    state: &ConversationState,
    headers: &HeaderMap,
    correlation_id: &str,
) -> Result<UserIdentity, ApiError> {
    if let Some(identity) = state.callers.identify(headers) {
        return Ok(identity);
    }
    warn!(
        event_name = "http.conversation.unauthenticated",
        correlation_id = %correlation_id,
        thread_id = "unknown",
        has_authorization = headers.contains_key(AUTHORIZATION),
        "conversation request without a known caller token"
    );
    Err((
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: "A valid caller token is required.",
            correlation_id: correlation_id.to_string(),
        }),
    ))
}

fn validate_session_id(session_id: &str, correlation_id: &str) -> Result<(), ApiError> {
    let valid = !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_LEN
        && session_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        return Ok(());
    }
    Err(reject(
        ApplicationError::from(DomainError::InvariantViolation(format!(
            "session id must be 1..={MAX_SESSION_ID_LEN} characters of [A-Za-z0-9_-]"
        ))),
        correlation_id,
    ))
}

fn reject(error: ApplicationError, correlation_id: &str) -> ApiError {
    let interface = error.into_interface(correlation_id);
    let status = match interface {
        InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(
        event_name = "http.conversation.rejected",
        correlation_id = %interface.correlation_id(),
        thread_id = "unknown",
        status = status.as_u16(),
        error = %interface,
        "conversation request rejected"
    );
    (
        status,
        Json(ErrorResponse {
            error: interface.user_message(),
            correlation_id: interface.correlation_id().to_string(),
        }),
    )
}
