//! Concrete stage agents.

pub mod command;
pub mod prompt;

use std::sync::Arc;

use anyhow::Result;
use botarmy_common::AgentRole;

pub use command::CommandAgent;

use crate::config::BotArmyConfig;
use crate::pipeline::AgentRegistry;

/// One [`CommandAgent`] per worker role, configured from `[agents.<role>]`.
pub fn build_registry(config: &BotArmyConfig) -> Result<AgentRegistry> {
    let toml = &config.toml;
    let mut registry = AgentRegistry::new();

    for role in AgentRole::WORKERS {
        let section = toml.agents.get(role);
        let instructions = section
            .and_then(|s| s.instructions.clone())
            .unwrap_or_else(|| prompt::default_instructions(role).to_string());
        let env = section.map(|s| s.env.clone()).unwrap_or_default();

        let agent = CommandAgent::new(role, toml.agent_command(role))
            .with_args(toml.agent_args(role))
            .with_instructions(instructions)
            .with_required_fields(toml.required_fields(role))
            .with_env(env)
            .with_working_dir(config.project_dir.clone());
        registry.register(Arc::new(agent))?;
    }

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use botarmy_common::Stage;
    use tempfile::tempdir;

    #[test]
    fn test_build_registry_covers_every_stage() {
        let dir = tempdir().unwrap();
        let config = BotArmyConfig::new(dir.path().to_path_buf()).unwrap();
        let registry = build_registry(&config).unwrap();
        assert!(registry.missing().is_empty());

        let developer = registry.get(Stage::Developing).unwrap();
        assert_eq!(developer.role(), AgentRole::Developer);
        assert_eq!(developer.required_fields(), &["files".to_string()]);
    }

    #[test]
    fn test_build_registry_uses_configured_fields() {
        let dir = tempdir().unwrap();
        let botarmy_dir = dir.path().join(".botarmy");
        std::fs::create_dir_all(&botarmy_dir).unwrap();
        std::fs::write(
            botarmy_dir.join("botarmy.toml"),
            "[agents.tester]\ncommand = \"sh\"\nrequired_fields = []\n",
        )
        .unwrap();

        let config = BotArmyConfig::new(dir.path().to_path_buf()).unwrap();
        let registry = build_registry(&config).unwrap();
        let tester = registry.get(Stage::Testing).unwrap();
        assert!(tester.required_fields().is_empty());
    }
}
