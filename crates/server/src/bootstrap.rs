use std::sync::Arc;

use salesguard_agent::{
    ConversationOrchestrator, DispatchError, HttpAgentDispatcher, HttpShieldClient,
    OrchestratorParts, ShieldApplication, ShieldError,
};
use salesguard_core::config::{AppConfig, ConfigError};
use salesguard_core::TracingAuditSink;
use salesguard_db::{connect_with_settings, migrations, DbPool, SqlQueryExecutor};
use thiserror::Error;
use tracing::{info, warn};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub orchestrator: Arc<ConversationOrchestrator>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("shield client setup failed: {0}")]
    Shield(#[source] ShieldError),
    #[error("agent client setup failed: {0}")]
    Agent(#[source] DispatchError),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        thread_id = "unknown",
        "starting application bootstrap"
    );
    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        thread_id = "unknown",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        thread_id = "unknown",
        "database migrations applied"
    );

    let shield = HttpShieldClient::new(ShieldApplication::from_config(&config.shield))
        .map_err(BootstrapError::Shield)?;
    let dispatcher =
        HttpAgentDispatcher::from_config(&config.agent).map_err(BootstrapError::Agent)?;
    info!(
        event_name = "system.bootstrap.clients_ready",
        correlation_id = "bootstrap",
        thread_id = "unknown",
        agent_endpoint = %dispatcher.endpoint(),
        shield_endpoint = %config.shield.endpoint,
        "agent and shield clients configured"
    );

    if config.server.callers.is_empty() {
        warn!(
            event_name = "system.bootstrap.no_callers",
            correlation_id = "bootstrap",
            thread_id = "unknown",
            "no server.callers configured; conversation routes will reject every request"
        );
    }

    let orchestrator = ConversationOrchestrator::new(OrchestratorParts {
        shield: Arc::new(shield),
        dispatcher: Arc::new(dispatcher),
        query: Arc::new(SqlQueryExecutor::new(db_pool.clone())),
        audit: Arc::new(TracingAuditSink),
        result_limit: config.agent.result_limit,
    });

    Ok(Application { config, db_pool, orchestrator: Arc::new(orchestrator) })
}

#[cfg(test)]
mod tests {
    use salesguard_core::config::{AppConfig, ConfigOverrides, LoadOptions};

    use crate::bootstrap::{bootstrap_with_config, Application, BootstrapError};

    async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
        bootstrap_with_config(AppConfig::load(options)?).await
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_without_shield_application_key() {
        let mut options = valid_overrides("sqlite::memory:?cache=shared");
        options.overrides.shield_application_api_key = Some("   ".to_string());

        let result = bootstrap(options).await;

        assert!(result.is_err());
        let message = result.err().expect("error").to_string();
        assert!(message.contains("shield.application_api_key"));
    }

    #[tokio::test]
    async fn bootstrap_rejects_non_http_agent_account() {
        let mut options = valid_overrides("sqlite::memory:?cache=shared");
        options.overrides.agent_account_url = Some("ftp://account.example.com".to_string());

        let message = bootstrap(options).await.err().expect("error").to_string();

        assert!(message.contains("agent.account_url"));
    }

    #[tokio::test]
    async fn bootstrap_migrates_warehouse_tables_and_wires_orchestrator() {
        let app = bootstrap(valid_overrides("sqlite::memory:?cache=shared"))
            .await
            .expect("bootstrap should succeed with valid overrides");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('sales_conversations', 'sales_metrics')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("expected warehouse tables to be available after bootstrap");
        assert_eq!(table_count, 2);
        assert_eq!(app.config.agent.result_limit, 4);

        app.db_pool.close().await;
    }

    fn valid_overrides(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                agent_account_url: Some("https://account.example.com".to_string()),
                agent_pat_token: Some("pat-test".to_string()),
                agent_result_limit: Some(4),
                shield_endpoint: Some("https://shield.example.com".to_string()),
                shield_application_api_key: Some("shield-key-test".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }
}
