pub mod commands;
pub mod logging;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "baton",
    about = "Baton operator CLI",
    long_about = "Inspect effective configuration, validate runtime readiness, and exercise \
                  the agent execution core against a scripted backend.",
    after_help = "Examples:\n  baton doctor --json\n  baton config\n  baton smoke"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, retry budget, breaker thresholds, and guardrail presets")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Drive a scripted handoff run through the runner with per-check timing")]
    Smoke,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    if let Err(error) = logging::init_from_env() {
        eprintln!("logging disabled: {error:#}");
    }

    let result = match cli.command {
        Command::Config => commands::config::run(),
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Smoke => commands::smoke::run(),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
