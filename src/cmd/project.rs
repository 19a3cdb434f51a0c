//! Project initialization command.

use anyhow::Result;
use botarmy::config::BotArmyConfig;

pub fn cmd_init(config: &BotArmyConfig) -> Result<()> {
    use botarmy::init::init_project;

    let result = init_project(&config.project_dir)?;

    if result.created {
        println!(
            "Initialized botarmy project at {}",
            result.botarmy_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .botarmy/");
        println!("  ├── botarmy.toml  # Retry, intervention and agent settings");
        println!("  └── logs/         # Log files when [logging] file = true");
        println!();
        println!("Next steps:");
        println!("  1. Point [agents.<role>] command at your agent CLI");
        println!("  2. Run `botarmy run \"<requirement>\"`");
    } else if result.wrote_config {
        println!(
            "Completed botarmy initialization at {}",
            result.botarmy_dir.display()
        );
    } else {
        println!(
            "BotArmy project already initialized at {}",
            result.botarmy_dir.display()
        );
    }

    Ok(())
}
