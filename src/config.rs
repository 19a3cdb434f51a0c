//! Configuration loaded from `.botarmy/botarmy.toml`.
//!
//! Layering is file → environment → CLI. Every section is optional and
//! falls back to the defaults shown here:
//!
//! ```toml
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 1000
//! max_delay_ms = 60000
//! timeout_secs = 300
//!
//! [intervention]
//! confidence_threshold = 0.7
//!
//! [recovery]
//! transient_patterns = ["(?i)rate[ _-]?limit", "..."]
//! fatal_patterns = ["(?i)permission denied", "..."]
//!
//! [store]
//! path = "botarmy.db"
//!
//! [logging]
//! filter = "botarmy=info"
//! json = false
//! file = false
//!
//! [retention]
//! days = 30
//!
//! [agents.developer]
//! command = "claude"
//! args = ["--print"]
//! required_fields = ["files"]
//! env = { ANTHROPIC_MODEL = "claude-sonnet" }
//! ```
//!
//! Environment overrides: `BOTARMY_DB`, `BOTARMY_LOG_JSON`,
//! `BOTARMY_MAX_ATTEMPTS`, `BOTARMY_TIMEOUT_SECS` and, for agents without an
//! explicit `command`, `BOTARMY_AGENT_CMD`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use botarmy_common::{AgentRole, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::pipeline::PipelineSettings;
use crate::pipeline::intervention::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::pipeline::recovery::{
    DEFAULT_FATAL_PATTERNS, DEFAULT_TRANSIENT_PATTERNS, ErrorRecoveryManager,
};

pub const BOTARMY_DIR: &str = ".botarmy";
pub const CONFIG_FILE: &str = "botarmy.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Per-attempt adapter deadline.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionSection {
    /// Outputs scored below this are held for human review.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

impl Default for InterventionSection {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

fn default_confidence_threshold() -> f64 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

/// Regex patterns used to classify unstructured agent failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySection {
    #[serde(default = "default_transient_patterns")]
    pub transient_patterns: Vec<String>,
    #[serde(default = "default_fatal_patterns")]
    pub fatal_patterns: Vec<String>,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            transient_patterns: default_transient_patterns(),
            fatal_patterns: default_fatal_patterns(),
        }
    }
}

fn default_transient_patterns() -> Vec<String> {
    DEFAULT_TRANSIENT_PATTERNS.iter().map(|p| p.to_string()).collect()
}

fn default_fatal_patterns() -> Vec<String> {
    DEFAULT_FATAL_PATTERNS.iter().map(|p| p.to_string()).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// Database file, relative to the `.botarmy` directory.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "botarmy.db".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// `tracing` filter directives; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
    /// Also write JSON logs to `.botarmy/logs/`, rotated daily.
    #[serde(default)]
    pub file: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
            file: false,
        }
    }
}

fn default_log_filter() -> String {
    "botarmy=info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionSection {
    /// Terminal projects older than this are removed by `cleanup`.
    #[serde(default = "default_retention_days")]
    pub days: u32,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            days: default_retention_days(),
        }
    }
}

fn default_retention_days() -> u32 {
    30
}

/// How to invoke one stage's agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSection {
    /// Executable to run (default: `BOTARMY_AGENT_CMD`, then `claude`).
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Replaces the built-in role instructions.
    #[serde(default)]
    pub instructions: Option<String>,
    /// Payload fields a valid output must contain (default: per role).
    #[serde(default)]
    pub required_fields: Option<Vec<String>>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsSection {
    #[serde(default)]
    pub analyst: AgentSection,
    #[serde(default)]
    pub architect: AgentSection,
    #[serde(default)]
    pub developer: AgentSection,
    #[serde(default)]
    pub tester: AgentSection,
}

impl AgentsSection {
    pub fn get(&self, role: AgentRole) -> Option<&AgentSection> {
        match role {
            AgentRole::Analyst => Some(&self.analyst),
            AgentRole::Architect => Some(&self.architect),
            AgentRole::Developer => Some(&self.developer),
            AgentRole::Tester => Some(&self.tester),
            AgentRole::Human | AgentRole::Orchestrator => None,
        }
    }
}

/// Payload fields each role must produce unless configured otherwise.
pub fn default_required_fields(role: AgentRole) -> &'static [&'static str] {
    match role {
        AgentRole::Analyst => &["analysis", "user_stories"],
        AgentRole::Architect => &["architecture", "components"],
        AgentRole::Developer => &["files"],
        AgentRole::Tester => &["test_results"],
        AgentRole::Human | AgentRole::Orchestrator => &[],
    }
}

/// Root of `botarmy.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotArmyToml {
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub intervention: InterventionSection,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub retention: RetentionSection,
    #[serde(default)]
    pub agents: AgentsSection,
}

impl BotArmyToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse botarmy.toml")
    }

    /// Load `botarmy.toml` from `botarmy_dir`, or defaults if it is absent.
    pub fn load_or_default(botarmy_dir: &Path) -> Result<Self> {
        let config_path = botarmy_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize botarmy.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Retry policy with `BOTARMY_MAX_ATTEMPTS` / `BOTARMY_TIMEOUT_SECS`
    /// applied on top of the file.
    pub fn retry_policy(&self) -> RetryPolicy {
        let max_attempts = env_parse("BOTARMY_MAX_ATTEMPTS").unwrap_or(self.retry.max_attempts);
        let timeout_secs = env_parse("BOTARMY_TIMEOUT_SECS").unwrap_or(self.retry.timeout_secs);
        RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_base_delay(Duration::from_millis(self.retry.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .with_attempt_timeout(Duration::from_secs(timeout_secs))
    }

    pub fn log_json(&self) -> bool {
        match std::env::var("BOTARMY_LOG_JSON") {
            Ok(v) => v == "1" || v.eq_ignore_ascii_case("true"),
            Err(_) => self.logging.json,
        }
    }

    /// Command for `role` (file → `BOTARMY_AGENT_CMD` → `claude`).
    pub fn agent_command(&self, role: AgentRole) -> String {
        self.agents
            .get(role)
            .and_then(|a| a.command.clone())
            .or_else(|| std::env::var("BOTARMY_AGENT_CMD").ok())
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Arguments for `role`. The default `claude` command runs in print mode.
    pub fn agent_args(&self, role: AgentRole) -> Vec<String> {
        let Some(section) = self.agents.get(role) else {
            return Vec::new();
        };
        if section.args.is_empty() && self.agent_command(role) == "claude" {
            return vec!["--print".to_string()];
        }
        section.args.clone()
    }

    pub fn required_fields(&self, role: AgentRole) -> Vec<String> {
        self.agents
            .get(role)
            .and_then(|a| a.required_fields.clone())
            .unwrap_or_else(|| {
                default_required_fields(role)
                    .iter()
                    .map(|f| f.to_string())
                    .collect()
            })
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts is 0; at least one attempt is always made".into());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            warnings.push(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            ));
        }
        if self.retry.timeout_secs == 0 {
            warnings.push("retry.timeout_secs is 0; every attempt will time out".into());
        }
        let threshold = self.intervention.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            warnings.push(format!(
                "intervention.confidence_threshold {} is outside [0, 1]",
                threshold
            ));
        }
        for (name, patterns) in [
            ("transient_patterns", &self.recovery.transient_patterns),
            ("fatal_patterns", &self.recovery.fatal_patterns),
        ] {
            for pattern in patterns {
                if let Err(e) = regex::Regex::new(pattern) {
                    warnings.push(format!("Invalid regex in recovery.{}: {}", name, e));
                }
            }
        }
        for role in AgentRole::WORKERS {
            if let Some(section) = self.agents.get(role)
                && section.command.as_deref().is_some_and(|c| c.trim().is_empty())
            {
                warnings.push(format!("agents.{}.command is empty", role));
            }
        }
        if self.store.path.trim().is_empty() {
            warnings.push("store.path is empty".into());
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.filter).is_err() {
            warnings.push(format!("Invalid logging.filter '{}'", self.logging.filter));
        }

        warnings
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Effective configuration for one project directory.
#[derive(Debug, Clone)]
pub struct BotArmyConfig {
    pub project_dir: PathBuf,
    /// The `.botarmy` directory.
    pub botarmy_dir: PathBuf,
    pub toml: BotArmyToml,
    pub verbose: bool,
}

impl BotArmyConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let botarmy_dir = project_dir.join(BOTARMY_DIR);
        let toml = BotArmyToml::load_or_default(&botarmy_dir)?;
        Ok(Self {
            project_dir,
            botarmy_dir,
            toml,
            verbose: false,
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.botarmy_dir.join(CONFIG_FILE)
    }

    /// Database path (`BOTARMY_DB` → file, relative to `.botarmy`).
    pub fn db_path(&self) -> PathBuf {
        match std::env::var("BOTARMY_DB") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => self.botarmy_dir.join(&self.toml.store.path),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.botarmy_dir.join("logs")
    }

    /// Filter directives, widened to debug by `--verbose`.
    pub fn log_filter(&self) -> String {
        if self.verbose {
            "botarmy=debug".to_string()
        } else {
            self.toml.logging.filter.clone()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.toml.retry_policy()
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            retry: self.retry_policy(),
            confidence_threshold: self.toml.intervention.confidence_threshold,
        }
    }

    pub fn recovery_manager(&self) -> Result<ErrorRecoveryManager> {
        ErrorRecoveryManager::new(
            self.toml.recovery.transient_patterns.as_slice(),
            self.toml.recovery.fatal_patterns.as_slice(),
        )
    }

    pub fn retention_days(&self) -> u32 {
        self.toml.retention.days
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
