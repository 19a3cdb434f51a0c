use std::fmt;
use std::str::FromStr;

use botarmy_common::{
    AgentRole, DecisionOrigin, InterventionStatus, MessageId, MessageStatus, Priority, ProjectId,
    ProjectStatus, RequestId, Stage,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Projects ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: ProjectId,
    pub name: Option<String>,
    pub requirement: String,
    pub stage: Stage,
    pub status: ProjectStatus,
    pub metadata: Map<String, Value>,
    /// Last fatal error, set when the project enters `Error`.
    pub last_error: Option<String>,
    /// Stage at which `last_error` occurred.
    pub error_stage: Option<Stage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Wall time spent so far, frozen at the last update once terminal.
    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        let end = if self.status.is_terminal() {
            self.updated_at
        } else {
            now
        };
        end - self.created_at
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.requirement)
    }
}

#[derive(Debug, Clone)]
pub struct NewProject {
    pub id: ProjectId,
    pub name: Option<String>,
    pub requirement: String,
    pub metadata: Map<String, Value>,
}

impl NewProject {
    pub fn new(requirement: impl Into<String>) -> Self {
        Self {
            id: ProjectId::new(),
            name: None,
            requirement: requirement.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_id(mut self, id: ProjectId) -> Self {
        self.id = id;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

// ── Messages ──────────────────────────────────────────────────────────

/// What a message carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Output of `stage`, addressed to the downstream agent.
    Handoff,
    /// Operator decision addressed to the agent that will re-run `stage`.
    Decision,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Handoff => "handoff",
            MessageKind::Decision => "decision",
        }
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "handoff" => Ok(MessageKind::Handoff),
            "decision" => Ok(MessageKind::Decision),
            _ => Err(format!("Invalid message kind: {}", s)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub project_id: ProjectId,
    pub from_agent: AgentRole,
    pub to_agent: AgentRole,
    pub kind: MessageKind,
    pub stage: Stage,
    pub payload: Value,
    pub status: MessageStatus,
    pub confidence: Option<f64>,
    /// Processing attempts made by the recipient.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub project_id: ProjectId,
    pub from_agent: AgentRole,
    pub to_agent: AgentRole,
    pub kind: MessageKind,
    pub stage: Stage,
    pub payload: Value,
    pub confidence: Option<f64>,
}

impl NewMessage {
    /// Output of `stage` addressed to the agent downstream of it.
    pub fn handoff(project_id: ProjectId, stage: Stage, from: AgentRole, payload: Value) -> Self {
        Self {
            project_id,
            from_agent: from,
            to_agent: stage.downstream(),
            kind: MessageKind::Handoff,
            stage,
            payload,
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: Option<f64>) -> Self {
        self.confidence = confidence;
        self
    }
}

/// Result of persisting a stage's output.
#[derive(Debug, Clone)]
pub struct StageCompletion {
    pub message: Message,
    /// The project after advancing.
    pub project: Project,
}

// ── Interventions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterventionRequest {
    pub id: RequestId,
    pub project_id: ProjectId,
    pub stage: Stage,
    pub description: String,
    pub priority: Priority,
    pub options: Vec<String>,
    /// Candidate output or failure detail shown to the operator.
    pub context: Option<Value>,
    pub status: InterventionStatus,
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl InterventionRequest {
    /// Find the option matching `choice`, ignoring case. Any choice is
    /// accepted when the request offers no options.
    pub fn match_option(&self, choice: &str) -> Option<String> {
        let choice = choice.trim();
        if choice.is_empty() {
            return None;
        }
        if self.options.is_empty() {
            return Some(choice.to_string());
        }
        self.options
            .iter()
            .find(|o| o.eq_ignore_ascii_case(choice))
            .cloned()
    }

    /// What raised the request, as tagged in its context.
    pub fn origin(&self) -> DecisionOrigin {
        self.context
            .as_ref()
            .and_then(|c| c.get("origin"))
            .and_then(|o| serde_json::from_value(o.clone()).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct NewIntervention {
    pub project_id: ProjectId,
    pub stage: Stage,
    pub description: String,
    pub priority: Priority,
    pub options: Vec<String>,
    pub context: Option<Value>,
}

/// What resolving an intervention does to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionEffect {
    /// Re-enter the raising stage with a fresh attempt window.
    Rerun,
    /// Treat the synthetic message as the stage's output and move on.
    Advance,
    /// Stop the pipeline in `Error`.
    Abort { reason: String },
}

/// Everything resolution writes in one transaction.
#[derive(Debug, Clone)]
pub struct ResolutionPlan {
    pub request_id: RequestId,
    pub choice: String,
    pub message: NewMessage,
    pub effect: ResolutionEffect,
}

#[derive(Debug, Clone)]
pub enum RaiseOutcome {
    Raised(InterventionRequest),
    /// The project already has a pending request.
    AlreadyPending(RequestId),
    /// The project is no longer at this stage in `Processing`.
    Halted(ProjectStatus),
}

#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    Resolved {
        request: InterventionRequest,
        project: Project,
        message: Message,
    },
    NotFound,
    AlreadyResolved(InterventionRequest),
}

// ── Stage runs and failures ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageRunStatus {
    Running,
    Suspended,
    Completed,
    Skipped,
    Failed,
}

impl StageRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageRunStatus::Running => "running",
            StageRunStatus::Suspended => "suspended",
            StageRunStatus::Completed => "completed",
            StageRunStatus::Skipped => "skipped",
            StageRunStatus::Failed => "failed",
        }
    }
}

impl FromStr for StageRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(StageRunStatus::Running),
            "suspended" => Ok(StageRunStatus::Suspended),
            "completed" => Ok(StageRunStatus::Completed),
            "skipped" => Ok(StageRunStatus::Skipped),
            "failed" => Ok(StageRunStatus::Failed),
            _ => Err(format!("Invalid stage run status: {}", s)),
        }
    }
}

/// Attempt bookkeeping for one stage of one project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageRun {
    pub project_id: ProjectId,
    pub stage: Stage,
    pub attempt: u32,
    pub status: StageRunStatus,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum AttemptStart {
    /// Attempt number `n` (1-based) is now recorded.
    Started(u32),
    /// The attempt window is used up.
    Exhausted {
        attempts: u32,
        last_error: Option<String>,
    },
    /// The project left `Processing` at this stage.
    Halted(ProjectStatus),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Fatal => "fatal",
        }
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(ErrorClass::Transient),
            "fatal" => Ok(ErrorClass::Fatal),
            _ => Err(format!("Invalid error class: {}", s)),
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Retry,
    Escalate,
    Abort,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Retry => "retry",
            DecisionKind::Escalate => "escalate",
            DecisionKind::Abort => "abort",
        }
    }
}

impl FromStr for DecisionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retry" => Ok(DecisionKind::Retry),
            "escalate" => Ok(DecisionKind::Escalate),
            "abort" => Ok(DecisionKind::Abort),
            _ => Err(format!("Invalid decision: {}", s)),
        }
    }
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified attempt failure and the recovery decision taken for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageFailure {
    pub id: i64,
    pub project_id: ProjectId,
    pub stage: Stage,
    pub attempt: u32,
    pub class: ErrorClass,
    pub error_kind: String,
    pub message: String,
    pub decision: DecisionKind,
    pub retry_delay_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewFailure {
    pub stage: Stage,
    pub attempt: u32,
    pub class: ErrorClass,
    pub error_kind: String,
    pub message: String,
    pub decision: DecisionKind,
    pub retry_delay_ms: Option<u64>,
}

/// Per-role execution statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentStats {
    pub role: AgentRole,
    pub stages_completed: u64,
    pub failures: u64,
    pub average_attempts: f64,
}

// ── Events ────────────────────────────────────────────────────────────

/// A state transition, as recorded in the events feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    ProjectCreated {
        requirement: String,
    },
    PipelineStarted {
        stage: Stage,
    },
    StageStarted {
        stage: Stage,
        attempt: u32,
    },
    AttemptFailed {
        stage: Stage,
        attempt: u32,
        class: ErrorClass,
        decision: DecisionKind,
        error: String,
    },
    StageCompleted {
        stage: Stage,
        message_id: MessageId,
        confidence: Option<f64>,
    },
    OutputDiscarded {
        stage: Stage,
    },
    InterventionRaised {
        request_id: RequestId,
        stage: Stage,
        priority: Priority,
        description: String,
    },
    InterventionResolved {
        request_id: RequestId,
        stage: Stage,
        choice: String,
    },
    PipelineResumed {
        stage: Stage,
    },
    PipelineCompleted,
    PipelineFailed {
        stage: Stage,
        error: String,
    },
    PipelineCancelled {
        stage: Stage,
    },
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::ProjectCreated { .. } => "project_created",
            EventKind::PipelineStarted { .. } => "pipeline_started",
            EventKind::StageStarted { .. } => "stage_started",
            EventKind::AttemptFailed { .. } => "attempt_failed",
            EventKind::StageCompleted { .. } => "stage_completed",
            EventKind::OutputDiscarded { .. } => "output_discarded",
            EventKind::InterventionRaised { .. } => "intervention_raised",
            EventKind::InterventionResolved { .. } => "intervention_resolved",
            EventKind::PipelineResumed { .. } => "pipeline_resumed",
            EventKind::PipelineCompleted => "pipeline_completed",
            EventKind::PipelineFailed { .. } => "pipeline_failed",
            EventKind::PipelineCancelled { .. } => "pipeline_cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineEvent {
    pub id: i64,
    pub project_id: ProjectId,
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(options: &[&str]) -> InterventionRequest {
        InterventionRequest {
            id: RequestId::new(),
            project_id: ProjectId::new(),
            stage: Stage::Developing,
            description: "low confidence".into(),
            priority: Priority::Medium,
            options: options.iter().map(|s| s.to_string()).collect(),
            context: None,
            status: InterventionStatus::Pending,
            resolution: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[test]
    fn test_match_option_case_insensitive() {
        let req = request(&["approve", "skip", "abort"]);
        assert_eq!(req.match_option("APPROVE"), Some("approve".to_string()));
        assert_eq!(req.match_option(" skip "), Some("skip".to_string()));
        assert_eq!(req.match_option("maybe"), None);
        assert_eq!(req.match_option(""), None);
    }

    #[test]
    fn test_match_option_free_form_without_options() {
        let req = request(&[]);
        assert_eq!(req.match_option("use postgres"), Some("use postgres".to_string()));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = PipelineEvent {
            id: 7,
            project_id: ProjectId::new(),
            kind: EventKind::StageStarted {
                stage: Stage::Architecting,
                attempt: 2,
            },
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "stage_started");
        assert_eq!(value["payload"], json!({"stage": "architecting", "attempt": 2}));
        assert_eq!(
            event.kind.event_type(),
            value["type"].as_str().unwrap()
        );
    }

    #[test]
    fn test_unit_event_roundtrip() {
        let value = serde_json::to_value(EventKind::PipelineCompleted).unwrap();
        assert_eq!(value, json!({"type": "pipeline_completed"}));
        let back: EventKind = serde_json::from_value(value).unwrap();
        assert_eq!(back, EventKind::PipelineCompleted);
    }

    #[test]
    fn test_elapsed_frozen_when_terminal() {
        let created = Utc::now() - chrono::Duration::seconds(90);
        let mut project = Project {
            id: ProjectId::new(),
            name: None,
            requirement: "Build a to-do app".into(),
            stage: Stage::Testing,
            status: ProjectStatus::Completed,
            metadata: Map::new(),
            last_error: None,
            error_stage: None,
            created_at: created,
            updated_at: created + chrono::Duration::seconds(30),
        };
        assert_eq!(project.elapsed(Utc::now()), chrono::Duration::seconds(30));
        project.status = ProjectStatus::Processing;
        assert!(project.elapsed(Utc::now()) >= chrono::Duration::seconds(90));
        assert_eq!(project.display_name(), "Build a to-do app");
    }
}
