use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::task::MAX_ITERATIONS;

const CONFIG_CANDIDATES: [&str; 2] = ["boardwright.toml", "config/boardwright.toml"];

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Model endpoint settings. Costs are USD per million tokens.
#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub input_cost_per_mtok: Decimal,
    pub output_cost_per_mtok: Decimal,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_iterations: u32,
    /// Monthly spend ceiling per user. `None` disables the budget gate.
    pub budget_ceiling_usd: Option<Decimal>,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
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

/// Programmatic values applied after the file and environment layers.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_base_url: Option<String>,
    pub llm_model: Option<String>,
    pub agent_max_iterations: Option<u32>,
    pub agent_budget_ceiling_usd: Option<Decimal>,
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
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("{path} is not valid TOML: {source}")]
    Toml { path: PathBuf, source: toml::de::Error },
    #[error("config file {0} does not exist")]
    FileNotFound(PathBuf),
    #[error("placeholder `${{{name}}}` refers to an unset environment variable")]
    UndefinedVariable { name: String },
    #[error("placeholder opened with `${{` is never closed")]
    UnclosedPlaceholder,
    #[error("{key}={value:?} cannot be parsed")]
    BadEnvValue { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://boardwright.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                api_key: None,
                base_url: "https://api.anthropic.com".to_string(),
                model: "claude-sonnet-4-5".to_string(),
                max_tokens: 4096,
                timeout_secs: 120,
                max_retries: 2,
                input_cost_per_mtok: Decimal::new(3, 0),
                output_cost_per_mtok: Decimal::new(15, 0),
            },
            agent: AgentConfig { max_iterations: MAX_ITERATIONS, budget_ceiling_usd: None },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        [Self::Compact, Self::Pretty, Self::Json]
            .into_iter()
            .find(|format| format.as_str().eq_ignore_ascii_case(raw.trim()))
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "logging.format `{}` is not one of compact, pretty or json",
                    raw.trim()
                ))
            })
    }
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

impl AppConfig {
    /// Defaults, then the TOML file, then `BOARDWRIGHT_*` variables, then `options.overrides`.
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        match resolve_config_path(options.config_path.as_deref()) {
            Some(path) => config.merge(file_layer(&path)?),
            None if options.require_file => {
                return Err(ConfigError::FileNotFound(
                    options.config_path.unwrap_or_else(|| PathBuf::from(CONFIG_CANDIDATES[0])),
                ));
            }
            None => {}
        }

        config.merge(env_layer()?);
        config.merge(options.overrides.into());
        config.validate()?;
        Ok(config)
    }

    fn merge(&mut self, layer: Layer) {
        put(&mut self.database.url, layer.database_url);
        put(&mut self.database.max_connections, layer.database_max_connections);
        put(&mut self.database.timeout_secs, layer.database_timeout_secs);

        if let Some(key) = layer.llm_api_key {
            self.llm.api_key = Some(SecretString::from(key));
        }
        put(&mut self.llm.base_url, layer.llm_base_url);
        put(&mut self.llm.model, layer.llm_model);
        put(&mut self.llm.max_tokens, layer.llm_max_tokens);
        put(&mut self.llm.timeout_secs, layer.llm_timeout_secs);
        put(&mut self.llm.max_retries, layer.llm_max_retries);
        put(&mut self.llm.input_cost_per_mtok, layer.llm_input_cost_per_mtok);
        put(&mut self.llm.output_cost_per_mtok, layer.llm_output_cost_per_mtok);

        put(&mut self.agent.max_iterations, layer.agent_max_iterations);
        if layer.agent_budget_ceiling_usd.is_some() {
            self.agent.budget_ceiling_usd = layer.agent_budget_ceiling_usd;
        }

        put(&mut self.server.bind_address, layer.server_bind_address);
        put(&mut self.server.port, layer.server_port);
        put(&mut self.server.graceful_shutdown_secs, layer.server_graceful_shutdown_secs);

        put(&mut self.logging.level, layer.logging_level);
        put(&mut self.logging.format, layer.logging_format);
    }

    /// Reports every problem at once, joined with `; `.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        let mut require = |ok: bool, problem: String| {
            if !ok {
                problems.push(problem);
            }
        };

        let url = self.database.url.trim();
        require(
            url.starts_with("sqlite:") || url == ":memory:",
            format!("database.url `{url}` is not a sqlite URL"),
        );
        require(
            self.database.max_connections > 0,
            "database.max_connections must be positive".into(),
        );
        require(
            (1..=300).contains(&self.database.timeout_secs),
            "database.timeout_secs must be between 1 and 300".into(),
        );

        let has_key =
            self.llm.api_key.as_ref().is_some_and(|key| !key.expose_secret().trim().is_empty());
        require(
            has_key,
            concat!(
                "llm.api_key is missing; ",
                "set BOARDWRIGHT_LLM_API_KEY, ANTHROPIC_API_KEY or [llm] api_key"
            )
            .into(),
        );
        require(
            ["http://", "https://"].iter().any(|scheme| self.llm.base_url.starts_with(scheme)),
            format!("llm.base_url `{}` needs an http(s) scheme", self.llm.base_url),
        );
        require(!self.llm.model.trim().is_empty(), "llm.model is empty".into());
        require(self.llm.max_tokens > 0, "llm.max_tokens must be positive".into());
        require(
            (1..=600).contains(&self.llm.timeout_secs),
            "llm.timeout_secs must be between 1 and 600".into(),
        );
        require(
            !self.llm.input_cost_per_mtok.is_sign_negative()
                && !self.llm.output_cost_per_mtok.is_sign_negative(),
            "llm token costs cannot be negative".into(),
        );

        require(
            (1..=MAX_ITERATIONS).contains(&self.agent.max_iterations),
            format!("agent.max_iterations must be between 1 and {MAX_ITERATIONS}"),
        );
        require(
            !self.agent.budget_ceiling_usd.is_some_and(|ceiling| ceiling.is_sign_negative()),
            "agent.budget_ceiling_usd cannot be negative".into(),
        );

        require(self.server.port > 0, "server.port must be positive".into());
        require(
            self.server.graceful_shutdown_secs > 0,
            "server.graceful_shutdown_secs must be positive".into(),
        );

        require(
            ["trace", "debug", "info", "warn", "error"]
                .iter()
                .any(|level| level.eq_ignore_ascii_case(self.logging.level.trim())),
            format!("logging.level `{}` is not a tracing level", self.logging.level),
        );

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join("; ")))
        }
    }
}

/// The explicit path when it exists, else the first of `boardwright.toml` and
/// `config/boardwright.toml` found in the working directory.
pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    match explicit_path {
        Some(path) => path.exists().then(|| path.to_path_buf()),
        None => {
            CONFIG_CANDIDATES.into_iter().map(PathBuf::from).find(|candidate| candidate.exists())
        }
    }
}

fn put<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

/// One source of settings, flattened to `section_field` names.
#[derive(Debug, Default)]
struct Layer {
    database_url: Option<String>,
    database_max_connections: Option<u32>,
    database_timeout_secs: Option<u64>,
    llm_api_key: Option<String>,
    llm_base_url: Option<String>,
    llm_model: Option<String>,
    llm_max_tokens: Option<u32>,
    llm_timeout_secs: Option<u64>,
    llm_max_retries: Option<u32>,
    llm_input_cost_per_mtok: Option<Decimal>,
    llm_output_cost_per_mtok: Option<Decimal>,
    agent_max_iterations: Option<u32>,
    agent_budget_ceiling_usd: Option<Decimal>,
    server_bind_address: Option<String>,
    server_port: Option<u16>,
    server_graceful_shutdown_secs: Option<u64>,
    logging_level: Option<String>,
    logging_format: Option<LogFormat>,
}

impl From<ConfigOverrides> for Layer {
    fn from(overrides: ConfigOverrides) -> Self {
        Self {
            database_url: overrides.database_url,
            llm_api_key: overrides.llm_api_key,
            llm_base_url: overrides.llm_base_url,
            llm_model: overrides.llm_model,
            agent_max_iterations: overrides.agent_max_iterations,
            agent_budget_ceiling_usd: overrides.agent_budget_ceiling_usd,
            server_port: overrides.server_port,
            logging_level: overrides.log_level,
            ..Self::default()
        }
    }
}

fn file_layer(path: &Path) -> Result<Layer, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    let document: FileDocument = toml::from_str(&expand_placeholders(&raw)?)
        .map_err(|source| ConfigError::Toml { path: path.to_path_buf(), source })?;
    Ok(document.into())
}

/// Replaces each `${NAME}` with the value of environment variable `NAME`.
fn expand_placeholders(raw: &str) -> Result<String, ConfigError> {
    let mut expanded = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        expanded.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let close = after_open.find('}').ok_or(ConfigError::UnclosedPlaceholder)?;
        let name = &after_open[..close];
        let value = env::var(name)
            .map_err(|_| ConfigError::UndefinedVariable { name: name.to_string() })?;
        expanded.push_str(&value);
        rest = &after_open[close + 1..];
    }

    expanded.push_str(rest);
    Ok(expanded)
}

fn env_layer() -> Result<Layer, ConfigError> {
    Ok(Layer {
        database_url: env_text(&["BOARDWRIGHT_DATABASE_URL"]),
        database_max_connections: env_parsed("BOARDWRIGHT_DATABASE_MAX_CONNECTIONS")?,
        database_timeout_secs: env_parsed("BOARDWRIGHT_DATABASE_TIMEOUT_SECS")?,
        llm_api_key: env_text(&["BOARDWRIGHT_LLM_API_KEY", "ANTHROPIC_API_KEY"]),
        llm_base_url: env_text(&["BOARDWRIGHT_LLM_BASE_URL"]),
        llm_model: env_text(&["BOARDWRIGHT_LLM_MODEL"]),
        llm_max_tokens: env_parsed("BOARDWRIGHT_LLM_MAX_TOKENS")?,
        llm_timeout_secs: env_parsed("BOARDWRIGHT_LLM_TIMEOUT_SECS")?,
        llm_max_retries: env_parsed("BOARDWRIGHT_LLM_MAX_RETRIES")?,
        llm_input_cost_per_mtok: env_parsed("BOARDWRIGHT_LLM_INPUT_COST_PER_MTOK")?,
        llm_output_cost_per_mtok: env_parsed("BOARDWRIGHT_LLM_OUTPUT_COST_PER_MTOK")?,
        agent_max_iterations: env_parsed("BOARDWRIGHT_AGENT_MAX_ITERATIONS")?,
        agent_budget_ceiling_usd: env_parsed("BOARDWRIGHT_AGENT_BUDGET_CEILING_USD")?,
        server_bind_address: env_text(&["BOARDWRIGHT_SERVER_BIND_ADDRESS"]),
        server_port: env_parsed("BOARDWRIGHT_SERVER_PORT")?,
        server_graceful_shutdown_secs: env_parsed("BOARDWRIGHT_SERVER_GRACEFUL_SHUTDOWN_SECS")?,
        logging_level: env_text(&["BOARDWRIGHT_LOGGING_LEVEL", "BOARDWRIGHT_LOG_LEVEL"]),
        logging_format: env_text(&["BOARDWRIGHT_LOGGING_FORMAT", "BOARDWRIGHT_LOG_FORMAT"])
            .map(|raw| raw.parse::<LogFormat>())
            .transpose()?,
    })
}

/// First non-blank value among `keys`, in order.
fn env_text(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| env::var(key).ok())
        .find(|value| !value.trim().is_empty())
}

fn env_parsed<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    env_text(&[key])
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::BadEnvValue { key: key.to_string(), value })
        })
        .transpose()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileDocument {
    database: DatabaseSection,
    llm: LlmSection,
    agent: AgentSection,
    server: ServerSection,
    logging: LoggingSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DatabaseSection {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LlmSection {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    input_cost_per_mtok: Option<Decimal>,
    output_cost_per_mtok: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AgentSection {
    max_iterations: Option<u32>,
    budget_ceiling_usd: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServerSection {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoggingSection {
    level: Option<String>,
    format: Option<LogFormat>,
}

impl From<FileDocument> for Layer {
    fn from(file: FileDocument) -> Self {
        Self {
            database_url: file.database.url,
            database_max_connections: file.database.max_connections,
            database_timeout_secs: file.database.timeout_secs,
            llm_api_key: file.llm.api_key,
            llm_base_url: file.llm.base_url,
            llm_model: file.llm.model,
            llm_max_tokens: file.llm.max_tokens,
            llm_timeout_secs: file.llm.timeout_secs,
            llm_max_retries: file.llm.max_retries,
            llm_input_cost_per_mtok: file.llm.input_cost_per_mtok,
            llm_output_cost_per_mtok: file.llm.output_cost_per_mtok,
            agent_max_iterations: file.agent.max_iterations,
            agent_budget_ceiling_usd: file.agent.budget_ceiling_usd,
            server_bind_address: file.server.bind_address,
            server_port: file.server.port,
            server_graceful_shutdown_secs: file.server.graceful_shutdown_secs,
            logging_level: file.logging.level,
            logging_format: file.logging.format,
        }
    }
}
