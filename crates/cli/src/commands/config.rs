use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use salesguard_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

struct ConfigField {
    key_path: &'static str,
    env_key: Option<&'static str>,
    value: String,
}

impl ConfigField {
    fn new(key_path: &'static str, env_key: &'static str, value: impl ToString) -> Self {
        Self { key_path, env_key: Some(env_key), value: value.to_string() }
    }

    fn file_only(key_path: &'static str, value: impl ToString) -> Self {
        Self { key_path, env_key: None, value: value.to_string() }
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in effective_fields(&config) {
        let source = field_source(
            field.key_path,
            field.env_key,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key_path, &field.value, source));
    }

    lines.join("\n")
}

fn effective_fields(config: &AppConfig) -> Vec<ConfigField> {
    let database = &config.database;
    let agent = &config.agent;
    let shield = &config.shield;
    let server = &config.server;

    vec![
        ConfigField::new("database.url", "SALESGUARD_DATABASE_URL", &database.url),
        ConfigField::new(
            "database.max_connections",
            "SALESGUARD_DATABASE_MAX_CONNECTIONS",
            database.max_connections,
        ),
        ConfigField::new(
            "database.timeout_secs",
            "SALESGUARD_DATABASE_TIMEOUT_SECS",
            database.timeout_secs,
        ),
        ConfigField::new("agent.account_url", "SALESGUARD_AGENT_ACCOUNT_URL", &agent.account_url),
        ConfigField::new(
            "agent.pat_token",
            "SALESGUARD_AGENT_PAT_TOKEN",
            redact_secret(agent.pat_token.expose_secret()),
        ),
        ConfigField::new("agent.model", "SALESGUARD_AGENT_MODEL", &agent.model),
        ConfigField::new(
            "agent.semantic_model_file",
            "SALESGUARD_AGENT_SEMANTIC_MODEL_FILE",
            &agent.semantic_model_file,
        ),
        ConfigField::new(
            "agent.search_service",
            "SALESGUARD_AGENT_SEARCH_SERVICE",
            &agent.search_service,
        ),
        ConfigField::file_only("agent.id_column", &agent.id_column),
        ConfigField::file_only("agent.analyst_tool_name", &agent.analyst_tool_name),
        ConfigField::file_only("agent.search_tool_name", &agent.search_tool_name),
        ConfigField::new(
            "agent.result_limit",
            "SALESGUARD_AGENT_RESULT_LIMIT",
            agent.result_limit,
        ),
        ConfigField::new("agent.timeout_ms", "SALESGUARD_AGENT_TIMEOUT_MS", agent.timeout_ms),
        ConfigField::new("shield.endpoint", "SALESGUARD_SHIELD_ENDPOINT", &shield.endpoint),
        ConfigField::new(
            "shield.application_api_key",
            "SALESGUARD_SHIELD_APPLICATION_API_KEY",
            redact_secret(shield.application_api_key.expose_secret()),
        ),
        ConfigField::new("shield.timeout_ms", "SALESGUARD_SHIELD_TIMEOUT_MS", shield.timeout_ms),
        ConfigField::new(
            "server.bind_address",
            "SALESGUARD_SERVER_BIND_ADDRESS",
            &server.bind_address,
        ),
        ConfigField::new("server.port", "SALESGUARD_SERVER_PORT", server.port),
        ConfigField::new(
            "server.graceful_shutdown_secs",
            "SALESGUARD_SERVER_GRACEFUL_SHUTDOWN_SECS",
            server.graceful_shutdown_secs,
        ),
        ConfigField::new(
            "server.callers",
            "SALESGUARD_SERVER_CALLER_TOKEN",
            describe_callers(config),
        ),
        ConfigField::new("logging.level", "SALESGUARD_LOGGING_LEVEL", &config.logging.level),
        ConfigField::new(
            "logging.format",
            "SALESGUARD_LOGGING_FORMAT",
            format!("{:?}", config.logging.format),
        ),
    ]
}

/// Usernames and roles only; tokens stay hidden.
fn describe_callers(config: &AppConfig) -> String {
    if config.server.callers.is_empty() {
        return "<none>".to_string();
    }
    let callers = config
        .server
        .callers
        .iter()
        .map(|caller| format!("{} as {}", caller.username, caller.role))
        .collect::<Vec<_>>();
    format!("[{}]", callers.join(", "))
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("salesguard.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/salesguard.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_secret(secret: &str) -> String {
    if secret.trim().is_empty() {
        "<empty>".to_string()
    } else {
        "<redacted>".to_string()
    }
}
