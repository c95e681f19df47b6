pub mod config;
pub mod migrate;
pub mod skills;
pub mod transcript;

use std::future::Future;

use boardwright_core::config::{AppConfig, LoadOptions};
use boardwright_db::{connect_with_config, DbPool};
use serde::Serialize;
use serde_json::Value;

/// What a command prints and the process exit code it maps to.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

/// Single-line JSON envelope shared by every subcommand.
#[derive(Debug, Serialize)]
struct Envelope<'a> {
    command: &'a str,
    status: &'a str,
    error_class: Option<&'a str>,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

/// Failure classes and their process exit codes.
pub mod exit {
    pub const CONFIG: u8 = 2;
    pub const RUNTIME: u8 = 3;
    pub const DATABASE: u8 = 4;
    pub const MIGRATION: u8 = 5;
    pub const INPUT: u8 = 6;
    pub const NOT_FOUND: u8 = 7;
    pub const PERSISTENCE: u8 = 8;
}

impl CommandResult {
    pub fn success(command: &str, message: impl AsRef<str>) -> Self {
        Envelope { command, status: "ok", error_class: None, message: message.as_ref(), data: None }
            .render(0)
    }

    pub fn success_with_data(command: &str, message: impl AsRef<str>, data: Value) -> Self {
        Envelope {
            command,
            status: "ok",
            error_class: None,
            message: message.as_ref(),
            data: Some(data),
        }
        .render(0)
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl AsRef<str>,
        exit_code: u8,
    ) -> Self {
        Envelope {
            command,
            status: "error",
            error_class: Some(error_class),
            message: message.as_ref(),
            data: None,
        }
        .render(exit_code)
    }
}

impl Envelope<'_> {
    fn render(&self, exit_code: u8) -> CommandResult {
        let output = serde_json::to_string(self).unwrap_or_else(|error| {
            serde_json::json!({
                "command": self.command,
                "status": "error",
                "error_class": "serialization",
                "message": error.to_string(),
            })
            .to_string()
        });
        CommandResult { exit_code, output }
    }
}

pub(crate) fn load_config(command: &str) -> Result<AppConfig, CommandResult> {
    AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(command, "config_validation", error.to_string(), exit::CONFIG)
    })
}

/// Loads config, opens the database, and runs `body` on a single-threaded runtime.
/// The pool is closed before returning.
pub(crate) fn with_database<F, Fut>(command: &str, body: F) -> CommandResult
where
    F: FnOnce(AppConfig, DbPool) -> Fut,
    Fut: Future<Output = CommandResult>,
{
    let config = match load_config(command) {
        Ok(config) => config,
        Err(result) => return result,
    };

    let Ok(runtime) = tokio::runtime::Builder::new_current_thread().enable_all().build() else {
        let message = "could not start a tokio runtime";
        return CommandResult::failure(command, "runtime", message, exit::RUNTIME);
    };

    runtime.block_on(async {
        match connect_with_config(&config.database).await {
            Ok(pool) => {
                let result = body(config, pool.clone()).await;
                pool.close().await;
                result
            }
            Err(error) => {
                CommandResult::failure(command, "database", error.to_string(), exit::DATABASE)
            }
        }
    })
}
