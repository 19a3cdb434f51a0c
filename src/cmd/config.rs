//! Configuration view and validation commands: `botarmy config`.

use anyhow::Result;
use botarmy::config::{BotArmyConfig, BotArmyToml};
use botarmy_common::AgentRole;

use super::super::ConfigCommands;

pub fn cmd_config(config: &BotArmyConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("BotArmy Configuration");
            println!("=====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No botarmy.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let toml = &config.toml;
            let retry = config.retry_policy();
            println!("[retry]");
            println!("  max_attempts = {}", retry.max_attempts);
            println!("  base_delay_ms = {}", toml.retry.base_delay_ms);
            println!("  max_delay_ms = {}", toml.retry.max_delay_ms);
            println!("  timeout_secs = {}", retry.attempt_timeout.as_secs());
            println!();
            println!("[intervention]");
            println!(
                "  confidence_threshold = {}",
                toml.intervention.confidence_threshold
            );
            println!();
            println!("[retention]");
            println!("  days = {}", toml.retention.days);
            println!();

            println!("Effective values (with env/CLI overrides):");
            println!("  store = \"{}\"", config.db_path().display());
            println!("  log_filter = \"{}\"", config.log_filter());
            println!("  log_json = {}", toml.log_json());
            for role in AgentRole::WORKERS {
                let args = toml.agent_args(role);
                let command = if args.is_empty() {
                    toml.agent_command(role)
                } else {
                    format!("{} {}", toml.agent_command(role), args.join(" "))
                };
                println!(
                    "  {:<10} {} (fields: {})",
                    role.as_str(),
                    command,
                    toml.required_fields(role).join(", ")
                );
            }
            println!();

            if !config_path.exists() {
                println!("Run 'botarmy config init' to create a botarmy.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No botarmy.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = BotArmyToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("botarmy.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config.botarmy_dir)?;
            BotArmyToml::default().save(&config_path)?;

            println!("Created botarmy.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [retry] max_attempts, base_delay_ms, timeout_secs");
            println!("  - [intervention] confidence_threshold");
            println!("  - [agents.<role>] command, args, required_fields");
            println!();
        }
    }

    Ok(())
}
