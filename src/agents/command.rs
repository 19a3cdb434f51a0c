//! Subprocess-backed agent adapter.
//!
//! The prompt goes to the child's stdin; the first JSON object on stdout is
//! the stage output. Either the full envelope is printed:
//!
//! ```json
//! {"payload": {...}, "confidence": 0.9, "requires_intervention": false}
//! ```
//!
//! or just the payload object, which is then given a default confidence.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use botarmy_common::{AgentAdapter, AgentError, AgentOutput, AgentRole, StageInput};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::prompt::render_prompt;
use crate::util::{extract_json_object, truncate};

/// Confidence assigned when the agent prints a bare payload object.
pub const DEFAULT_BARE_CONFIDENCE: f64 = 0.8;

const MAX_STDERR_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct CommandAgent {
    role: AgentRole,
    command: String,
    args: Vec<String>,
    instructions: String,
    required_fields: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl CommandAgent {
    pub fn new(role: AgentRole, command: impl Into<String>) -> Self {
        Self {
            role,
            command: command.into(),
            args: Vec::new(),
            instructions: String::new(),
            required_fields: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_required_fields(mut self, fields: Vec<String>) -> Self {
        self.required_fields = fields;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn spawn_error(&self, err: std::io::Error) -> AgentError {
        match err.kind() {
            ErrorKind::NotFound => {
                AgentError::InvalidInput(format!("agent command '{}' not found", self.command))
            }
            ErrorKind::PermissionDenied => AgentError::PermissionDenied(format!(
                "cannot execute agent command '{}'",
                self.command
            )),
            _ => AgentError::Failed(format!("failed to spawn '{}': {}", self.command, err)),
        }
    }
}

#[async_trait]
impl AgentAdapter for CommandAgent {
    fn role(&self) -> AgentRole {
        self.role
    }

    fn required_fields(&self) -> &[String] {
        &self.required_fields
    }

    async fn execute(&self, input: &StageInput) -> Result<AgentOutput, AgentError> {
        let prompt = render_prompt(&self.instructions, input, &self.required_fields)
            .map_err(|e| AgentError::InvalidInput(format!("failed to encode stage input: {}", e)))?;

        debug!(
            role = %self.role,
            command = %self.command,
            project_id = %input.project_id,
            "Spawning agent"
        );

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .env("BOTARMY_STAGE", input.stage.as_str())
            .env("BOTARMY_PROJECT_ID", input.project_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        // Feed stdin while collecting output so a chatty child cannot
        // deadlock on a full stdout pipe.
        let stdin = child.stdin.take();
        let write = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(prompt.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());

        let output = output.map_err(|e| {
            AgentError::Failed(format!("failed to wait for '{}': {}", self.command, e))
        })?;
        if let Err(e) = written
            && e.kind() != ErrorKind::BrokenPipe
        {
            return Err(AgentError::Failed(format!(
                "failed to write prompt to '{}': {}",
                self.command, e
            )));
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = truncate(stderr.trim(), MAX_STDERR_CHARS);
            let status = match output.status.code() {
                Some(code) => format!("exited with code {}", code),
                None => "was terminated by a signal".to_string(),
            };
            return Err(AgentError::Failed(format!(
                "{} {}: {}",
                self.command, status, stderr
            )));
        }

        parse_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse agent stdout into an [`AgentOutput`].
pub fn parse_output(stdout: &str) -> Result<AgentOutput, AgentError> {
    let json = extract_json_object(stdout).ok_or_else(|| {
        AgentError::Validation(format!(
            "no JSON object in agent output: {}",
            truncate(stdout.trim(), 200)
        ))
    })?;
    let value: Value = serde_json::from_str(json)
        .map_err(|e| AgentError::Validation(format!("agent output is not valid JSON: {}", e)))?;

    if value.get("payload").is_some() {
        serde_json::from_value(value)
            .map_err(|e| AgentError::Validation(format!("unexpected output envelope: {}", e)))
    } else {
        Ok(AgentOutput::new(value).with_confidence(DEFAULT_BARE_CONFIDENCE))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use botarmy_common::{ProjectId, Stage};
    use serde_json::json;

    use super::*;

    fn sh(script: &str) -> CommandAgent {
        CommandAgent::new(AgentRole::Analyst, "sh")
            .with_args(vec!["-c".to_string(), script.to_string()])
            .with_instructions("Analyse the requirement.")
    }

    fn input() -> StageInput {
        StageInput {
            project_id: ProjectId::new(),
            stage: Stage::Analyzing,
            requirement: "Build a todo app".to_string(),
            previous_stage_outputs: Vec::new(),
            human_decision: None,
        }
    }

    #[test]
    fn test_parse_bare_payload() {
        let output = parse_output(r#"Sure! {"analysis": "ok"} Hope that helps."#).unwrap();
        assert_eq!(output.payload, json!({"analysis": "ok"}));
        assert_eq!(output.confidence, Some(DEFAULT_BARE_CONFIDENCE));
        assert!(!output.requires_intervention);
    }

    #[test]
    fn test_parse_envelope() {
        let output = parse_output(
            r#"{"payload": {"files": []}, "confidence": 0.4, "requires_intervention": true, "intervention_reason": "two readings"}"#,
        )
        .unwrap();
        assert_eq!(output.payload, json!({"files": []}));
        assert_eq!(output.confidence, Some(0.4));
        assert!(output.requires_intervention);
        assert_eq!(output.intervention_reason.as_deref(), Some("two readings"));
    }

    #[test]
    fn test_parse_without_json_is_validation_error() {
        let err = parse_output("I could not do it").unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }

    #[test]
    fn test_parse_bad_envelope_is_validation_error() {
        let err = parse_output(r#"{"payload": {}, "confidence": "high"}"#).unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }

    #[tokio::test]
    async fn test_execute_reads_stdout() {
        let agent = sh(r#"cat > /dev/null; echo '{"analysis": "ok", "user_stories": []}'"#);
        let output = agent.execute(&input()).await.unwrap();
        assert_eq!(output.payload["analysis"], "ok");
    }

    #[tokio::test]
    async fn test_execute_sends_prompt_on_stdin() {
        let agent = sh(r#"if grep -q "Build a todo app"; then echo '{"seen": true}'; fi"#);
        let output = agent.execute(&input()).await.unwrap();
        assert_eq!(output.payload, json!({"seen": true}));
    }

    #[tokio::test]
    async fn test_execute_sets_stage_env() {
        let mut env = BTreeMap::new();
        env.insert("EXTRA".to_string(), "yes".to_string());
        let agent = sh(r#"cat > /dev/null; echo "{\"stage\": \"$BOTARMY_STAGE\", \"extra\": \"$EXTRA\"}""#)
            .with_env(env);
        let output = agent.execute(&input()).await.unwrap();
        assert_eq!(output.payload, json!({"stage": "analyzing", "extra": "yes"}));
    }

    #[tokio::test]
    async fn test_execute_nonzero_exit_carries_stderr() {
        let agent = sh("cat > /dev/null; echo 'rate limit exceeded' >&2; exit 3");
        let err = agent.execute(&input()).await.unwrap_err();
        match err {
            AgentError::Failed(msg) => {
                assert!(msg.contains("exited with code 3"), "{}", msg);
                assert!(msg.contains("rate limit exceeded"), "{}", msg);
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_execute_missing_command() {
        let agent = CommandAgent::new(AgentRole::Tester, "botarmy-no-such-agent-binary");
        let err = agent.execute(&input()).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_dropped_future_returns_promptly() {
        let agent = sh("sleep 5");
        let started = Instant::now();
        let result = tokio::time::timeout(Duration::from_millis(100), agent.execute(&input())).await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
