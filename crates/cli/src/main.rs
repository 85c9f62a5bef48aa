//! TaskPilot CLI — the main entry point.
//!
//! Commands:
//! - `run`     — Run a workflow file against the built-in back ends
//! - `guard`   — Check an invocation list against the loop guard
//! - `config`  — Show, validate or locate the configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "taskpilot",
    about = "TaskPilot — rate-limited, loop-guarded work item scheduler",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow file
    Run {
        /// Workflow definition (TOML)
        workflow: PathBuf,

        /// Sandbox root for the `fs` back end
        #[arg(short, long, default_value = ".")]
        root: PathBuf,

        /// Confirm every guarded invocation without prompting
        #[arg(long)]
        auto_approve: bool,

        /// Configuration file (default: ~/.taskpilot/config.toml)
        #[arg(short, long, env = "TASKPILOT_CONFIG")]
        config: Option<PathBuf>,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Feed an invocation list (JSON array) through a fresh loop guard
    Guard {
        invocations: PathBuf,

        #[arg(short, long, env = "TASKPILOT_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show {
        #[arg(short, long, env = "TASKPILOT_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Check the configuration for errors
    Validate {
        #[arg(short, long, env = "TASKPILOT_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Print the default configuration path
    Path,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing; logs go to stderr so reports stay pipeable
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let logs = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        logs.json().init();
    } else {
        logs.init();
    }

    match cli.command {
        Commands::Run {
            workflow,
            root,
            auto_approve,
            config,
            json,
        } => {
            commands::run::run(commands::run::RunArgs {
                workflow,
                root,
                auto_approve,
                config,
                json,
            })
            .await?
        }
        Commands::Guard {
            invocations,
            config,
        } => commands::guard::run(&invocations, config.as_deref()).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show { config } => commands::config_cmd::show(config.as_deref()).await?,
            ConfigAction::Validate { config } => {
                commands::config_cmd::validate(config.as_deref()).await?
            }
            ConfigAction::Path => commands::config_cmd::path().await?,
        },
    }

    Ok(())
}
