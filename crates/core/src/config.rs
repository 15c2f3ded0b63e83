use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub agent: AgentConfig,
    pub shield: ShieldConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub account_url: String,
    pub pat_token: SecretString,
    pub model: String,
    pub semantic_model_file: String,
    pub search_service: String,
    pub id_column: String,
    pub analyst_tool_name: String,
    pub search_tool_name: String,
    pub result_limit: u32,
    pub timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ShieldConfig {
    pub endpoint: String,
    pub application_api_key: SecretString,
    pub timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
    /// Bearer tokens the HTTP front-end accepts. The shield identity of a
    /// turn comes from the matching entry, never from the request body.
    pub callers: Vec<ServerCaller>,
}

#[derive(Clone, Debug)]
pub struct ServerCaller {
    pub token: SecretString,
    pub username: String,
    pub role: String,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub agent_account_url: Option<String>,
    pub agent_pat_token: Option<String>,
    pub agent_model: Option<String>,
    pub agent_result_limit: Option<u32>,
    pub shield_endpoint: Option<String>,
    pub shield_application_api_key: Option<String>,
    pub server_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://salesguard.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            agent: AgentConfig {
                account_url: String::new(),
                pat_token: String::new().into(),
                model: "claude-4-sonnet".to_string(),
                semantic_model_file: "@sales_intelligence.data.models/sales_metrics_model.yaml"
                    .to_string(),
                search_service: "sales_intelligence.data.sales_conversation_search".to_string(),
                id_column: "conversation_id".to_string(),
                analyst_tool_name: "analyst1".to_string(),
                search_tool_name: "search1".to_string(),
                result_limit: 1,
                timeout_ms: 50_000,
            },
            shield: ShieldConfig {
                endpoint: String::new(),
                application_api_key: String::new().into(),
                timeout_ms: 30_000,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
                callers: Vec::new(),
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from("salesguard.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(agent) = patch.agent {
            if let Some(account_url) = agent.account_url {
                self.agent.account_url = account_url;
            }
            if let Some(pat_token_value) = agent.pat_token {
                self.agent.pat_token = secret_value(pat_token_value);
            }
            if let Some(model) = agent.model {
                self.agent.model = model;
            }
            if let Some(semantic_model_file) = agent.semantic_model_file {
                self.agent.semantic_model_file = semantic_model_file;
            }
            if let Some(search_service) = agent.search_service {
                self.agent.search_service = search_service;
            }
            if let Some(id_column) = agent.id_column {
                self.agent.id_column = id_column;
            }
            if let Some(analyst_tool_name) = agent.analyst_tool_name {
                self.agent.analyst_tool_name = analyst_tool_name;
            }
            if let Some(search_tool_name) = agent.search_tool_name {
                self.agent.search_tool_name = search_tool_name;
            }
            if let Some(result_limit) = agent.result_limit {
                self.agent.result_limit = result_limit;
            }
            if let Some(timeout_ms) = agent.timeout_ms {
                self.agent.timeout_ms = timeout_ms;
            }
        }

        if let Some(shield) = patch.shield {
            if let Some(endpoint) = shield.endpoint {
                self.shield.endpoint = endpoint;
            }
            if let Some(api_key_value) = shield.application_api_key {
                self.shield.application_api_key = secret_value(api_key_value);
            }
            if let Some(timeout_ms) = shield.timeout_ms {
                self.shield.timeout_ms = timeout_ms;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
            if let Some(callers) = server.callers {
                self.server.callers = callers
                    .into_iter()
                    .map(|caller| ServerCaller {
                        token: secret_value(caller.token),
                        username: caller.username,
                        role: caller.role,
                    })
                    .collect();
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        let database = &mut self.database;
        set_from_env(&mut database.url, "SALESGUARD_DATABASE_URL");
        parse_from_env(&mut database.max_connections, "SALESGUARD_DATABASE_MAX_CONNECTIONS")?;
        parse_from_env(&mut database.timeout_secs, "SALESGUARD_DATABASE_TIMEOUT_SECS")?;

        let agent = &mut self.agent;
        set_from_env(&mut agent.account_url, "SALESGUARD_AGENT_ACCOUNT_URL");
        if let Some(value) = read_env("SALESGUARD_AGENT_PAT_TOKEN") {
            agent.pat_token = secret_value(value);
        }
        set_from_env(&mut agent.model, "SALESGUARD_AGENT_MODEL");
        set_from_env(&mut agent.semantic_model_file, "SALESGUARD_AGENT_SEMANTIC_MODEL_FILE");
        set_from_env(&mut agent.search_service, "SALESGUARD_AGENT_SEARCH_SERVICE");
        parse_from_env(&mut agent.result_limit, "SALESGUARD_AGENT_RESULT_LIMIT")?;
        parse_from_env(&mut agent.timeout_ms, "SALESGUARD_AGENT_TIMEOUT_MS")?;

        let shield = &mut self.shield;
        set_from_env(&mut shield.endpoint, "SALESGUARD_SHIELD_ENDPOINT");
        if let Some(value) = read_env("SALESGUARD_SHIELD_APPLICATION_API_KEY") {
            shield.application_api_key = secret_value(value);
        }
        parse_from_env(&mut shield.timeout_ms, "SALESGUARD_SHIELD_TIMEOUT_MS")?;

        let server = &mut self.server;
        set_from_env(&mut server.bind_address, "SALESGUARD_SERVER_BIND_ADDRESS");
        parse_from_env(&mut server.port, "SALESGUARD_SERVER_PORT")?;
        parse_from_env(
            &mut server.graceful_shutdown_secs,
            "SALESGUARD_SERVER_GRACEFUL_SHUTDOWN_SECS",
        )?;
        // One extra caller can come from the environment, e.g. for a single-tenant deploy
        if let Some(token) = read_env("SALESGUARD_SERVER_CALLER_TOKEN") {
            server.callers.push(ServerCaller {
                token: secret_value(token),
                username: read_env("SALESGUARD_SERVER_CALLER_USERNAME").unwrap_or_default(),
                role: read_env("SALESGUARD_SERVER_CALLER_ROLE").unwrap_or_default(),
            });
        }

        // Short aliases are accepted for the logging keys only
        let log_level =
            read_env("SALESGUARD_LOGGING_LEVEL").or_else(|| read_env("SALESGUARD_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("SALESGUARD_LOGGING_FORMAT").or_else(|| read_env("SALESGUARD_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(account_url) = overrides.agent_account_url {
            self.agent.account_url = account_url;
        }
        if let Some(pat_token) = overrides.agent_pat_token {
            self.agent.pat_token = secret_value(pat_token);
        }
        if let Some(model) = overrides.agent_model {
            self.agent.model = model;
        }
        if let Some(result_limit) = overrides.agent_result_limit {
            self.agent.result_limit = result_limit;
        }
        if let Some(endpoint) = overrides.shield_endpoint {
            self.shield.endpoint = endpoint;
        }
        if let Some(api_key) = overrides.shield_application_api_key {
            self.shield.application_api_key = secret_value(api_key);
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_agent(&self.agent)?;
        validate_shield(&self.shield)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("salesguard.toml"), PathBuf::from("config/salesguard.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_agent(agent: &AgentConfig) -> Result<(), ConfigError> {
    validate_http_url("agent.account_url", &agent.account_url)?;

    if agent.pat_token.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "agent.pat_token is required to call the agent API".to_string(),
        ));
    }

    if agent.model.trim().is_empty() {
        return Err(ConfigError::Validation("agent.model must not be empty".to_string()));
    }

    let tool_fields = [
        ("agent.semantic_model_file", &agent.semantic_model_file),
        ("agent.search_service", &agent.search_service),
        ("agent.id_column", &agent.id_column),
        ("agent.analyst_tool_name", &agent.analyst_tool_name),
        ("agent.search_tool_name", &agent.search_tool_name),
    ];
    if let Some((name, _)) = tool_fields.iter().find(|(_, value)| value.trim().is_empty()) {
        return Err(ConfigError::Validation(format!("{name} must not be empty")));
    }

    if agent.analyst_tool_name == agent.search_tool_name {
        return Err(ConfigError::Validation(
            "agent.analyst_tool_name and agent.search_tool_name must differ".to_string(),
        ));
    }

    if agent.result_limit == 0 || agent.result_limit > 1_000 {
        return Err(ConfigError::Validation(
            "agent.result_limit must be in range 1..=1000".to_string(),
        ));
    }

    validate_timeout_ms("agent.timeout_ms", agent.timeout_ms)
}

fn validate_shield(shield: &ShieldConfig) -> Result<(), ConfigError> {
    validate_http_url("shield.endpoint", &shield.endpoint)?;

    if shield.application_api_key.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "shield.application_api_key is required to open shield sessions".to_string(),
        ));
    }

    validate_timeout_ms("shield.timeout_ms", shield.timeout_ms)
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    for (index, caller) in server.callers.iter().enumerate() {
        let token = caller.token.expose_secret().trim();
        if token.is_empty() || caller.username.trim().is_empty() || caller.role.trim().is_empty()
        {
            return Err(ConfigError::Validation(format!(
                "server.callers[{index}] needs a token, username and role"
            )));
        }
        let duplicate = server.callers[..index]
            .iter()
            .any(|earlier| earlier.token.expose_secret().trim() == token);
        if duplicate {
            return Err(ConfigError::Validation(format!(
                "server.callers[{index}] reuses the token of an earlier caller"
            )));
        }
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn validate_http_url(name: &str, value: &str) -> Result<(), ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::Validation(format!("{name} is required")));
    }
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(ConfigError::Validation(format!(
            "{name} must start with http:// or https://"
        )));
    }
    Ok(())
}

fn validate_timeout_ms(name: &str, timeout_ms: u64) -> Result<(), ConfigError> {
    if timeout_ms == 0 || timeout_ms > 300_000 {
        return Err(ConfigError::Validation(format!("{name} must be in range 1..=300000")));
    }
    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn set_from_env(target: &mut String, key: &str) {
    if let Some(value) = read_env(key) {
        *target = value;
    }
}

fn parse_from_env<T: std::str::FromStr>(target: &mut T, key: &str) -> Result<(), ConfigError> {
    if let Some(value) = read_env(key) {
        *target = value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
            key: key.to_string(),
            value: value.clone(),
        })?;
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    agent: Option<AgentPatch>,
    shield: Option<ShieldPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    account_url: Option<String>,
    pat_token: Option<String>,
    model: Option<String>,
    semantic_model_file: Option<String>,
    search_service: Option<String>,
    id_column: Option<String>,
    analyst_tool_name: Option<String>,
    search_tool_name: Option<String>,
    result_limit: Option<u32>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ShieldPatch {
    endpoint: Option<String>,
    application_api_key: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
    callers: Option<Vec<CallerPatch>>,
}

#[derive(Debug, Deserialize)]
struct CallerPatch {
    token: String,
    username: String,
    role: String,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
