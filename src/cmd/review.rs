//! Human intervention commands.

use anyhow::{Result, bail};
use botarmy::config::BotArmyConfig;
use botarmy::pipeline::ResolutionAction;
use botarmy::util::truncate;
use botarmy_common::{InterventionStatus, ProjectId, ProjectStatus, RequestId};
use console::style;

use super::inspect::print_report;
use super::run::wait_with_progress;
use super::{build_orchestrator, open_store};

pub async fn cmd_interventions(config: &BotArmyConfig, project: Option<ProjectId>) -> Result<()> {
    let store = open_store(config)?;
    let pending = store
        .call(move |db| db.pending_interventions(project))
        .await?;

    if pending.is_empty() {
        println!("No pending interventions.");
        return Ok(());
    }

    for request in &pending {
        println!(
            "{}  {:<6}  {}  {}",
            style(request.id).yellow(),
            request.priority.as_str(),
            request.stage,
            style(request.project_id).dim()
        );
        println!("    {}", truncate(&request.description, 120));
        println!("    options: {}", request.options.join(", "));
    }
    Ok(())
}

pub async fn cmd_resolve(
    config: &BotArmyConfig,
    request_id: RequestId,
    choice: Option<String>,
    detach: bool,
) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;

    let choice = match choice {
        Some(choice) => choice,
        None => {
            let request = orchestrator
                .store()
                .call(move |db| db.get_intervention(request_id))
                .await?;
            let Some(request) = request else {
                bail!("Intervention request {} not found", request_id);
            };
            if request.status == InterventionStatus::Resolved {
                bail!("Intervention request {} was already resolved", request_id);
            }
            prompt_choice(&request.description, &request.options)?
        }
    };

    let resolution = orchestrator.resolve_intervention(request_id, &choice).await?;
    let verb = match resolution.action {
        ResolutionAction::Rerun => "re-running",
        ResolutionAction::Skip => "skipping",
        ResolutionAction::Abort => "aborting",
    };
    println!(
        "Resolved {} with '{}': {} {}",
        style(request_id).bold(),
        resolution.request.resolution.as_deref().unwrap_or(&choice),
        verb,
        resolution.request.stage
    );

    let project_id = resolution.project.id;
    if resolution.project.status == ProjectStatus::Processing && !detach {
        wait_with_progress(&orchestrator, project_id).await?;
    }
    let report = orchestrator.status(project_id).await?;
    print_report(&report);
    Ok(())
}

fn prompt_choice(description: &str, options: &[String]) -> Result<String> {
    use dialoguer::{Input, Select, theme::ColorfulTheme};

    println!("{}", description);
    if options.is_empty() {
        let choice: String = Input::with_theme(&ColorfulTheme::default())
            .with_prompt("Decision")
            .interact_text()?;
        return Ok(choice);
    }

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Choose how to continue")
        .items(options)
        .default(0)
        .interact()?;
    Ok(options[selection].clone())
}
