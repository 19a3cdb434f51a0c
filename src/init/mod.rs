//! `botarmy init`: create the `.botarmy/` directory in a project.
//!
//! ```text
//! .botarmy/
//! ├── botarmy.toml     # Configuration (written with defaults)
//! ├── botarmy.db       # Persistent store, created on first use
//! └── logs/            # Rolling log files when [logging] file = true
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::{BOTARMY_DIR, BotArmyToml, CONFIG_FILE};

#[derive(Debug)]
pub struct InitResult {
    /// Path to the `.botarmy` directory.
    pub botarmy_dir: PathBuf,
    /// False if the directory already existed.
    pub created: bool,
    /// True if a default `botarmy.toml` was written.
    pub wrote_config: bool,
}

/// Initialize `project_dir`, completing any missing pieces of an existing
/// `.botarmy/` without touching files that are already there.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let botarmy_dir = project_dir.join(BOTARMY_DIR);
    let created = !botarmy_dir.exists();

    std::fs::create_dir_all(&botarmy_dir)
        .with_context(|| format!("Failed to create directory: {}", botarmy_dir.display()))?;

    let logs_dir = botarmy_dir.join("logs");
    std::fs::create_dir_all(&logs_dir)
        .with_context(|| format!("Failed to create logs directory: {}", logs_dir.display()))?;

    let config_file = botarmy_dir.join(CONFIG_FILE);
    let wrote_config = if config_file.exists() {
        false
    } else {
        BotArmyToml::default().save(&config_file)?;
        true
    };

    Ok(InitResult {
        botarmy_dir,
        created,
        wrote_config,
    })
}

pub fn is_initialized(project_dir: &Path) -> bool {
    project_dir.join(BOTARMY_DIR).is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_project_creates_directory_and_config() {
        let dir = tempdir().unwrap();
        let result = init_project(dir.path()).unwrap();

        assert!(result.created);
        assert!(result.wrote_config);
        assert!(result.botarmy_dir.join("logs").is_dir());

        let loaded = BotArmyToml::load(&result.botarmy_dir.join(CONFIG_FILE)).unwrap();
        assert_eq!(loaded.retry.max_attempts, 3);
    }

    #[test]
    fn test_init_project_keeps_existing_config() {
        let dir = tempdir().unwrap();
        let botarmy_dir = dir.path().join(BOTARMY_DIR);
        std::fs::create_dir_all(&botarmy_dir).unwrap();
        std::fs::write(botarmy_dir.join(CONFIG_FILE), "[retry]\nmax_attempts = 7\n").unwrap();

        let result = init_project(dir.path()).unwrap();
        assert!(!result.created);
        assert!(!result.wrote_config);
        assert!(botarmy_dir.join("logs").is_dir());

        let loaded = BotArmyToml::load(&botarmy_dir.join(CONFIG_FILE)).unwrap();
        assert_eq!(loaded.retry.max_attempts, 7);
    }

    #[test]
    fn test_is_initialized() {
        let dir = tempdir().unwrap();
        assert!(!is_initialized(dir.path()));
        init_project(dir.path()).unwrap();
        assert!(is_initialized(dir.path()));
    }
}
