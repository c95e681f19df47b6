use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use boardwright_core::config::{resolve_config_path, AppConfig};
use secrecy::ExposeSecret;
use toml::Value;

use crate::commands::{load_config, CommandResult};

struct Field {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

impl Field {
    fn new(key: &'static str, value: impl ToString, env_keys: &'static [&'static str]) -> Self {
        Self { key, value: value.to_string(), env_keys }
    }
}

pub fn run() -> CommandResult {
    let config = match load_config("config") {
        Ok(config) => config,
        Err(result) => return result,
    };

    let file_path = resolve_config_path(None);
    let file_doc = load_file_doc(file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(fields(&config).into_iter().map(|field| {
        let source = field_source(&field, file_doc.as_ref(), file_path.as_deref());
        format!("- {} = {} (source: {source})", field.key, field.value)
    }));

    CommandResult { exit_code: 0, output: lines.join("\n") }
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let api_key = config
        .llm
        .api_key
        .as_ref()
        .map(|key| redact_token(key.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());
    let ceiling = config
        .agent
        .budget_ceiling_usd
        .map(|ceiling| ceiling.to_string())
        .unwrap_or_else(|| "<unlimited>".to_string());

    vec![
        Field::new("database.url", &config.database.url, &["BOARDWRIGHT_DATABASE_URL"]),
        Field::new(
            "database.max_connections",
            config.database.max_connections,
            &["BOARDWRIGHT_DATABASE_MAX_CONNECTIONS"],
        ),
        Field::new(
            "database.timeout_secs",
            config.database.timeout_secs,
            &["BOARDWRIGHT_DATABASE_TIMEOUT_SECS"],
        ),
        Field::new("llm.api_key", api_key, &["BOARDWRIGHT_LLM_API_KEY", "ANTHROPIC_API_KEY"]),
        Field::new("llm.base_url", &config.llm.base_url, &["BOARDWRIGHT_LLM_BASE_URL"]),
        Field::new("llm.model", &config.llm.model, &["BOARDWRIGHT_LLM_MODEL"]),
        Field::new("llm.max_tokens", config.llm.max_tokens, &["BOARDWRIGHT_LLM_MAX_TOKENS"]),
        Field::new("llm.timeout_secs", config.llm.timeout_secs, &["BOARDWRIGHT_LLM_TIMEOUT_SECS"]),
        Field::new("llm.max_retries", config.llm.max_retries, &["BOARDWRIGHT_LLM_MAX_RETRIES"]),
        Field::new(
            "llm.input_cost_per_mtok",
            config.llm.input_cost_per_mtok,
            &["BOARDWRIGHT_LLM_INPUT_COST_PER_MTOK"],
        ),
        Field::new(
            "llm.output_cost_per_mtok",
            config.llm.output_cost_per_mtok,
            &["BOARDWRIGHT_LLM_OUTPUT_COST_PER_MTOK"],
        ),
        Field::new(
            "agent.max_iterations",
            config.agent.max_iterations,
            &["BOARDWRIGHT_AGENT_MAX_ITERATIONS"],
        ),
        Field::new("agent.budget_ceiling_usd", ceiling, &["BOARDWRIGHT_AGENT_BUDGET_CEILING_USD"]),
        Field::new(
            "server.bind_address",
            &config.server.bind_address,
            &["BOARDWRIGHT_SERVER_BIND_ADDRESS"],
        ),
        Field::new("server.port", config.server.port, &["BOARDWRIGHT_SERVER_PORT"]),
        Field::new(
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs,
            &["BOARDWRIGHT_SERVER_GRACEFUL_SHUTDOWN_SECS"],
        ),
        Field::new(
            "logging.level",
            &config.logging.level,
            &["BOARDWRIGHT_LOGGING_LEVEL", "BOARDWRIGHT_LOG_LEVEL"],
        ),
        Field::new(
            "logging.format",
            config.logging.format.as_str(),
            &["BOARDWRIGHT_LOGGING_FORMAT", "BOARDWRIGHT_LOG_FORMAT"],
        ),
    ]
}

fn load_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(field: &Field, file_doc: Option<&Value>, file_path: Option<&Path>) -> String {
    if let Some(env_key) = field.env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if file_doc.is_some_and(|doc| contains_path(doc, field.key)) {
        let file_path = file_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("config file"));
        return format!("file ({})", file_path.display());
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

/// Keeps a recognizable prefix (`sk-ant-***`) and hides the rest.
fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    match trimmed.splitn(3, '-').collect::<Vec<_>>().as_slice() {
        [vendor, product, _] => format!("{vendor}-{product}-***"),
        _ => "<redacted>".to_string(),
    }
}
