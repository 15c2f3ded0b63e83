use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use salesguard_db::DbPool;
use serde::Serialize;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    Degraded,
}

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    started_at: DateTime<Utc>,
}

impl HealthState {
    pub fn new(db_pool: DbPool) -> Self {
        Self { db_pool, started_at: Utc::now() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub status: Readiness,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: Readiness,
    pub service: ComponentHealth,
    pub warehouse: ComponentHealth,
    pub uptime_secs: i64,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState::new(db_pool))
}

/// Readiness of the server. Degraded when the warehouse database cannot
/// answer a trivial query; policy and agent endpoints are not checked.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let warehouse = warehouse_check(&state.db_pool).await;
    let status = warehouse.status;
    let now = Utc::now();

    let payload = HealthResponse {
        status,
        service: ComponentHealth {
            status: Readiness::Ready,
            detail: "conversation orchestrator initialized".to_string(),
        },
        warehouse,
        uptime_secs: (now - state.started_at).num_seconds(),
        checked_at: now.to_rfc3339(),
    };

    let code = match status {
        Readiness::Ready => StatusCode::OK,
        Readiness::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(payload))
}

async fn warehouse_check(pool: &DbPool) -> ComponentHealth {
    if let Err(error) = sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        warn!(
            event_name = "system.health.warehouse_degraded",
            correlation_id = "health",
            thread_id = "unknown",
            error = %error,
            "warehouse database check failed"
        );
        return ComponentHealth {
            status: Readiness::Degraded,
            detail: format!("warehouse query failed: {error}"),
        };
    }
    ComponentHealth { status: Readiness::Ready, detail: "warehouse query succeeded".to_string() }
}
