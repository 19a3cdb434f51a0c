//! Read-only views of the store, plus retention cleanup.

use anyhow::Result;
use botarmy::config::BotArmyConfig;
use botarmy::pipeline::PipelineReport;
use botarmy::util::{format_duration, truncate};
use botarmy_common::{ProjectId, ProjectStatus};
use console::style;

use super::{build_orchestrator, open_store, styled_status};

pub fn print_report(report: &PipelineReport) {
    let project = &report.project;
    println!();
    println!("{}", style(project.display_name()).bold());
    println!("  id:       {}", project.id);
    println!("  status:   {}", styled_status(project.status));
    println!("  stage:    {}", project.stage);
    println!("  elapsed:  {}", format_duration(report.elapsed));
    if let Some(error) = &project.last_error {
        let stage = project
            .error_stage
            .map(|s| format!(" ({})", s))
            .unwrap_or_default();
        println!("  error:    {}{}", style(error).red(), stage);
    }
    if !report.errors.is_empty() {
        println!("  failures: {}", report.errors.len());
        for failure in &report.errors {
            println!(
                "    {} #{} {} [{}] -> {}",
                failure.stage,
                failure.attempt,
                failure.class.as_str(),
                truncate(&failure.message, 80),
                failure.decision.as_str()
            );
        }
    }
    if let Some(request) = &report.pending_intervention {
        println!(
            "  waiting:  {} {}",
            style(request.id).yellow(),
            request.description
        );
        println!("            options: {}", request.options.join(", "));
    }
    println!();
}

pub async fn cmd_status(config: &BotArmyConfig, project_id: ProjectId) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let report = orchestrator.status(project_id).await?;
    print_report(&report);
    Ok(())
}

pub async fn cmd_list(config: &BotArmyConfig, status: Option<ProjectStatus>) -> Result<()> {
    let store = open_store(config)?;
    let projects = store.call(move |db| db.list_projects(status)).await?;

    if projects.is_empty() {
        println!("No projects found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<16}  {:<12}  Name",
        "Project", "Status", "Stage"
    );
    for project in &projects {
        println!(
            "{:<36}  {:<16}  {:<12}  {}",
            project.id,
            styled_status(project.status),
            project.stage.as_str(),
            truncate(project.display_name(), 60)
        );
    }
    Ok(())
}

pub async fn cmd_messages(
    config: &BotArmyConfig,
    project_id: ProjectId,
    limit: Option<u32>,
) -> Result<()> {
    let store = open_store(config)?;
    let messages = store
        .call(move |db| db.list_messages(project_id, limit))
        .await?;

    if messages.is_empty() {
        println!("No messages for project {}.", project_id);
        return Ok(());
    }

    for message in &messages {
        let confidence = message
            .confidence
            .map(|c| format!(" confidence={:.2}", c))
            .unwrap_or_default();
        println!(
            "{} {} {} -> {} [{}] {} attempt={}{}",
            style(message.created_at.format("%Y-%m-%d %H:%M:%S")).dim(),
            message.kind.as_str(),
            message.from_agent,
            message.to_agent,
            message.stage,
            message.status,
            message.attempt,
            confidence
        );
        println!("    {}", truncate(&message.payload.to_string(), 120));
    }
    Ok(())
}

/// One JSON object per line, for piping into other tools.
pub async fn cmd_events(
    config: &BotArmyConfig,
    project_id: ProjectId,
    after: Option<i64>,
) -> Result<()> {
    let store = open_store(config)?;
    let events = store
        .call(move |db| db.list_events(project_id, after))
        .await?;
    for event in &events {
        println!("{}", serde_json::to_string(event)?);
    }
    Ok(())
}

pub async fn cmd_agents(config: &BotArmyConfig) -> Result<()> {
    let store = open_store(config)?;
    let stats = store.call(|db| db.agent_stats()).await?;

    println!(
        "{:<10}  {:>9}  {:>8}  {:>12}",
        "Agent", "Completed", "Failures", "Avg attempts"
    );
    for stat in &stats {
        println!(
            "{:<10}  {:>9}  {:>8}  {:>12.2}",
            stat.role.as_str(),
            stat.stages_completed,
            stat.failures,
            stat.average_attempts
        );
    }
    Ok(())
}

pub async fn cmd_cleanup(config: &BotArmyConfig, days: Option<u32>) -> Result<()> {
    let days = days.unwrap_or_else(|| config.retention_days());
    let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(days));
    let store = open_store(config)?;
    let purged = store
        .call(move |db| db.purge_terminal_projects(cutoff))
        .await?;
    println!(
        "Removed {} finished project(s) older than {} day(s).",
        purged, days
    );
    Ok(())
}
