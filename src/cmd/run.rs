//! Pipeline execution commands: run, resume, recover, cancel.

use std::time::Duration;

use anyhow::{Result, bail};
use botarmy::config::BotArmyConfig;
use botarmy::pipeline::Orchestrator;
use botarmy::store::{EventKind, NewProject, Project};
use botarmy_common::{ProjectId, ProjectStatus};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;

use super::inspect::print_report;
use super::{build_orchestrator, styled_status};

pub async fn cmd_run(
    config: &BotArmyConfig,
    requirement: String,
    name: Option<String>,
    detach: bool,
) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;

    let mut new = NewProject::new(requirement);
    if let Some(name) = name {
        new = new.with_name(name);
    }
    let project = orchestrator.submit(new).await?;
    println!("Started project {}", style(project.id).bold());

    if detach {
        println!("Detached. Continue it later with `botarmy recover`.");
        return Ok(());
    }

    finish(&orchestrator, project.id).await
}

pub async fn cmd_resume(config: &BotArmyConfig, project_id: ProjectId) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    orchestrator.resume(project_id).await?;
    println!("Resumed project {}", style(project_id).bold());
    finish(&orchestrator, project_id).await
}

pub async fn cmd_recover(config: &BotArmyConfig) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let resumed = orchestrator.recover().await?;
    if resumed.is_empty() {
        println!("No projects left in processing.");
        return Ok(());
    }

    println!("Recovering {} project(s)", resumed.len());
    for project_id in resumed {
        let project = wait_with_progress(&orchestrator, project_id).await?;
        println!(
            "  {}  {}  {}",
            project.id,
            styled_status(project.status),
            project.display_name()
        );
    }
    Ok(())
}

pub async fn cmd_cancel(config: &BotArmyConfig, project_id: ProjectId) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let project = orchestrator.cancel(project_id).await?;
    println!(
        "Cancelled project {} at stage {}",
        style(project.id).bold(),
        project.stage
    );
    Ok(())
}

/// Wait for the driver, print the report, and fail the command if the
/// project ended in error.
async fn finish(orchestrator: &Orchestrator, project_id: ProjectId) -> Result<()> {
    let project = wait_with_progress(orchestrator, project_id).await?;
    let report = orchestrator.status(project_id).await?;
    print_report(&report);

    match project.status {
        ProjectStatus::Error => bail!(
            "Project {} failed: {}",
            project.id,
            project.last_error.as_deref().unwrap_or("unknown error")
        ),
        ProjectStatus::WaitingApproval => {
            if let Some(request) = &report.pending_intervention {
                println!(
                    "Resolve with `botarmy resolve {} <{}>`",
                    request.id,
                    request.options.join("|")
                );
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn spinner() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if let Ok(spinner_style) = ProgressStyle::default_spinner().template("{spinner} {msg}") {
        bar.set_style(spinner_style);
    }
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

pub(super) async fn wait_with_progress(
    orchestrator: &Orchestrator,
    project_id: ProjectId,
) -> Result<Project> {
    let bar = spinner();
    bar.set_message("Running pipeline...");
    let mut events = orchestrator.subscribe();
    let wait = orchestrator.wait(project_id);
    tokio::pin!(wait);

    let mut listening = true;
    let result = loop {
        tokio::select! {
            result = &mut wait => break result,
            _ = tokio::signal::ctrl_c() => {
                bar.finish_and_clear();
                orchestrator.shutdown().await;
                bail!(
                    "Interrupted. Project {} stays resumable with `botarmy recover`.",
                    project_id
                );
            }
            event = events.recv(), if listening => match event {
                Ok(event) if event.project_id == project_id => {
                    if let Some(message) = describe(&event.kind) {
                        bar.set_message(message);
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => listening = false,
            },
        }
    };
    bar.finish_and_clear();
    Ok(result?)
}

fn describe(kind: &EventKind) -> Option<String> {
    let message = match kind {
        EventKind::StageStarted { stage, attempt } => {
            format!("{} (attempt {})", style(stage).yellow(), attempt)
        }
        EventKind::AttemptFailed {
            stage,
            attempt,
            error,
            ..
        } => format!(
            "{} attempt {} failed: {}",
            style(stage).yellow(),
            attempt,
            style(error).dim()
        ),
        EventKind::StageCompleted { stage, .. } => {
            format!("{} {}", style(stage).yellow(), style("done").green())
        }
        _ => return None,
    };
    Some(message)
}
