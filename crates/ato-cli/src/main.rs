mod commands;
mod logging;

use std::path::PathBuf;

use anyhow::Context;
use ato_core::config::Config;
use ato_core::types::TaskMode;
use clap::{Parser, Subcommand};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// ato -- plan, approve and execute coding tasks with a language model.
#[derive(Parser)]
#[command(name = "ato", version, about)]
struct Cli {
    /// Config file (default: ~/.agent-orchestrator/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan a goal, ask for approval, then execute it.
    Run {
        /// What the task should achieve.
        goal: String,
        /// plan | build | coding | bugfix
        #[arg(short, long, default_value = "build")]
        mode: TaskMode,
        /// Workspace root; one is created under the base dir when omitted.
        #[arg(short, long)]
        workspace: Option<PathBuf>,
        /// Approve the plan without prompting.
        #[arg(short, long)]
        yes: bool,
        /// Skip the build/test battery after the steps finish.
        #[arg(long)]
        no_validate: bool,
    },

    /// Run one shell command with the configured time limit.
    Exec {
        command: String,
        /// Working directory.
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Timeout in seconds (default from [pipeline].command_timeout_secs).
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Send one prompt to the configured provider.
    Chat { prompt: String },

    /// Probe the provider and print runtime diagnostics as JSON.
    Diagnostics,

    /// Print the effective configuration.
    Config {
        /// Print the config file path instead.
        #[arg(long)]
        path: bool,
        /// Write the effective configuration to the config file.
        #[arg(long)]
        init: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Config::load().context("failed to load config"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level, cli.log_json);

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Run {
            goal,
            mode,
            workspace,
            yes,
            no_validate,
        } => {
            commands::run::run(
                config,
                commands::run::RunOptions {
                    goal,
                    mode,
                    workspace,
                    yes,
                    validate: !no_validate,
                },
            )
            .await?;
        }
        Commands::Exec {
            command,
            cwd,
            timeout,
        } => {
            let code = commands::exec::run(&config, &command, cwd.as_deref(), timeout).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Chat { prompt } => {
            commands::chat::run(&config, &prompt).await?;
        }
        Commands::Diagnostics => {
            commands::diagnostics::run(&config).await?;
        }
        Commands::Config { path, init } => {
            let target = cli.config.clone().unwrap_or_else(Config::default_path);
            commands::config::run(&config, &target, path, init)?;
        }
    }

    Ok(())
}
