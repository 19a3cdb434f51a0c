use anyhow::{Context, Result};
use botarmy::config::BotArmyConfig;
use botarmy::logging::{LogSettings, init_logging};
use botarmy_common::{ProjectId, ProjectStatus, RequestId};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "botarmy")]
#[command(version, about = "Drive a requirement through the analyst, architect, developer and tester agents")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, env = "BOTARMY_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the .botarmy directory with a default botarmy.toml
    Init,
    /// Submit a requirement and run the pipeline
    Run {
        /// The natural-language requirement
        requirement: String,

        /// Short display name for the project
        #[arg(short, long)]
        name: Option<String>,

        /// Return after starting; continue later with `botarmy recover`
        #[arg(long)]
        detach: bool,
    },
    /// Show a project's status, errors and pending intervention
    Status { project: ProjectId },
    /// List projects
    List {
        /// Only projects with this status
        #[arg(long)]
        status: Option<ProjectStatus>,
    },
    /// Cancel a project
    Cancel { project: ProjectId },
    /// Continue a project left in processing
    Resume { project: ProjectId },
    /// Continue every project left in processing after a crash
    Recover,
    /// Show a project's message log
    Messages {
        project: ProjectId,

        /// Show at most this many of the newest messages
        #[arg(short, long)]
        limit: Option<u32>,
    },
    /// Print a project's events as JSON lines
    Events {
        project: ProjectId,

        /// Only events with an id greater than this
        #[arg(long)]
        after: Option<i64>,
    },
    /// List pending intervention requests
    Interventions {
        #[arg(short, long)]
        project: Option<ProjectId>,
    },
    /// Resolve an intervention request
    Resolve {
        request: RequestId,

        /// One of the request's options; prompts when omitted
        choice: Option<String>,

        /// Return without waiting for the pipeline to continue
        #[arg(long)]
        detach: bool,
    },
    /// Show per-agent statistics
    Agents,
    /// Delete finished projects older than the retention window
    Cleanup {
        /// Override [retention] days
        #[arg(long)]
        days: Option<u32>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default botarmy.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let config = BotArmyConfig::with_cli_args(project_dir, cli.verbose)?;
    let _log = init_logging(&LogSettings {
        filter: config.log_filter(),
        json: config.toml.log_json(),
        file_dir: config.toml.logging.file.then(|| config.log_dir()),
    })?;

    match cli.command {
        Commands::Init => cmd::cmd_init(&config)?,
        Commands::Config { command } => cmd::cmd_config(&config, command)?,
        Commands::Run {
            requirement,
            name,
            detach,
        } => cmd::cmd_run(&config, requirement, name, detach).await?,
        Commands::Status { project } => cmd::cmd_status(&config, project).await?,
        Commands::List { status } => cmd::cmd_list(&config, status).await?,
        Commands::Cancel { project } => cmd::cmd_cancel(&config, project).await?,
        Commands::Resume { project } => cmd::cmd_resume(&config, project).await?,
        Commands::Recover => cmd::cmd_recover(&config).await?,
        Commands::Messages { project, limit } => {
            cmd::cmd_messages(&config, project, limit).await?
        }
        Commands::Events { project, after } => cmd::cmd_events(&config, project, after).await?,
        Commands::Interventions { project } => cmd::cmd_interventions(&config, project).await?,
        Commands::Resolve {
            request,
            choice,
            detach,
        } => cmd::cmd_resolve(&config, request, choice, detach).await?,
        Commands::Agents => cmd::cmd_agents(&config).await?,
        Commands::Cleanup { days } => cmd::cmd_cleanup(&config, days).await?,
    }

    Ok(())
}
