pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use crate::commands::ask::AskArgs;

#[derive(Debug, Parser)]
#[command(
    name = "salesguard",
    about = "SalesGuard operator CLI",
    long_about = "Ask policy-checked sales questions and operate the SalesGuard warehouse.",
    after_help = concat!(
        "Examples:\n",
        "  salesguard ask --username jane --role sales_analyst \"Which deals slipped?\"\n",
        "  salesguard doctor --json\n",
        "  salesguard config"
    )
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Run one policy-checked conversation turn and print the turn report")]
    Ask {
        #[arg(long, help = "Username the policy shield evaluates the turn for")]
        username: String,
        #[arg(long, help = "Active warehouse role, passed to the shield as the user group")]
        role: String,
        #[arg(long, help = "Emit the turn report as JSON")]
        json: bool,
        #[arg(help = "Natural-language question")]
        message: String,
    },
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the demo sales conversations and metrics into the warehouse database")]
    Seed,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, agent and shield client setup, and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Ask { username, role, json, message } => {
            commands::ask::run(AskArgs { message, username, role, json })
        }
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
