pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "boardwright",
    about = "Boardwright operator CLI",
    long_about = "Apply migrations, inspect configuration, manage skills, and read transcripts.",
    after_help = concat!(
        "Examples:\n",
        "  boardwright migrate\n",
        "  boardwright skills import skills.toml\n",
        "  boardwright transcript task_3f2a",
    )
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(subcommand, about = "Manage skill definitions")]
    Skills(SkillsCommand),
    #[command(about = "Print a task's status, usage, and message history")]
    Transcript {
        #[arg(help = "Task id, as returned by the execution API")]
        task_id: String,
    },
}

#[derive(Debug, Subcommand)]
enum SkillsCommand {
    #[command(about = "Upsert skills from a TOML file of [[skill]] tables")]
    Import {
        #[arg(help = "Path to the skill file")]
        path: PathBuf,
    },
    #[command(about = "List stored skills")]
    List,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => commands::config::run(),
        Command::Skills(SkillsCommand::Import { path }) => commands::skills::import(&path),
        Command::Skills(SkillsCommand::List) => commands::skills::list(),
        Command::Transcript { task_id } => commands::transcript::run(&task_id),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
