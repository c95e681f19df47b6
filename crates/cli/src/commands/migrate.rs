use boardwright_db::migrations;

use crate::commands::{exit, with_database, CommandResult};

pub fn run() -> CommandResult {
    with_database("migrate", |config, pool| async move {
        match migrations::run_pending(&pool).await {
            Ok(()) => CommandResult::success(
                "migrate",
                format!("applied pending migrations to {}", config.database.url),
            ),
            Err(error) => {
                CommandResult::failure("migrate", "migration", error.to_string(), exit::MIGRATION)
            }
        }
    })
}
