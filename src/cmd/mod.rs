//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                                          |
//! |------------|-----------------------------------------------------------|
//! | `project`  | `Init`                                                    |
//! | `config`   | `Config`                                                  |
//! | `run`      | `Run`, `Resume`, `Recover`, `Cancel`                      |
//! | `inspect`  | `Status`, `List`, `Messages`, `Events`, `Agents`, `Cleanup` |
//! | `review`   | `Interventions`, `Resolve`                                |

pub mod config;
pub mod inspect;
pub mod project;
pub mod review;
pub mod run;

pub use config::cmd_config;
pub use inspect::{cmd_agents, cmd_cleanup, cmd_events, cmd_list, cmd_messages, cmd_status};
pub use project::cmd_init;
pub use review::{cmd_interventions, cmd_resolve};
pub use run::{cmd_cancel, cmd_recover, cmd_resume, cmd_run};

use anyhow::{Context, Result};
use botarmy::agents::build_registry;
use botarmy::config::BotArmyConfig;
use botarmy::pipeline::Orchestrator;
use botarmy::store::{PipelineDb, StoreHandle};
use botarmy_common::ProjectStatus;
use console::{StyledObject, style};

/// Open the configured database, creating its directory if needed.
pub fn open_store(config: &BotArmyConfig) -> Result<StoreHandle> {
    let path = config.db_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let db = PipelineDb::new(&path)
        .with_context(|| format!("Failed to open store at {}", path.display()))?;
    Ok(StoreHandle::new(db))
}

pub fn build_orchestrator(config: &BotArmyConfig) -> Result<Orchestrator> {
    let store = open_store(config)?;
    let registry = build_registry(config)?;
    let recovery = config.recovery_manager()?;
    Ok(Orchestrator::new(
        store,
        registry,
        recovery,
        config.pipeline_settings(),
    ))
}

pub fn styled_status(status: ProjectStatus) -> StyledObject<&'static str> {
    let text = style(status.as_str());
    match status {
        ProjectStatus::Completed => text.green(),
        ProjectStatus::Error => text.red(),
        ProjectStatus::WaitingApproval => text.yellow(),
        ProjectStatus::Processing => text.cyan(),
        ProjectStatus::Created | ProjectStatus::Cancelled => text.dim(),
    }
}
