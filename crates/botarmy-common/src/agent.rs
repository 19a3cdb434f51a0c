//! The agent adapter contract.
//!
//! An adapter wraps whatever actually produces a stage's work (an LLM call,
//! a subprocess, a test double). The orchestrator only ever sees
//! [`StageInput`] going in and [`AgentOutput`] or [`AgentError`] coming out.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ids::{ProjectId, RequestId};
use crate::stage::{AgentRole, Stage};

/// Payload produced by an earlier stage, as read back from the message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorOutput {
    pub stage: Stage,
    pub agent: AgentRole,
    pub payload: Value,
}

/// What kind of request an operator decision answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOrigin {
    /// The operator looked at the stage's held-back output.
    Review,
    /// The stage ran out of attempts.
    Failure,
    #[default]
    Question,
}

/// Operator decision carried into a re-run of the stage that raised it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanDecision {
    pub request_id: RequestId,
    pub choice: String,
    pub description: String,
    #[serde(default)]
    pub origin: DecisionOrigin,
}

impl HumanDecision {
    /// Whether the operator already reviewed this stage's output.
    pub fn is_review(&self) -> bool {
        self.origin == DecisionOrigin::Review
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInput {
    pub project_id: ProjectId,
    pub stage: Stage,
    pub requirement: String,
    #[serde(default)]
    pub previous_stage_outputs: Vec<PriorOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_decision: Option<HumanDecision>,
}

impl StageInput {
    pub fn output_of(&self, stage: Stage) -> Option<&Value> {
        self.previous_stage_outputs
            .iter()
            .rev()
            .find(|o| o.stage == stage)
            .map(|o| &o.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub payload: Value,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub requires_intervention: bool,
    #[serde(default)]
    pub intervention_reason: Option<String>,
    /// Choices to offer the operator if this output triggers an intervention.
    #[serde(default)]
    pub options: Vec<String>,
}

impl AgentOutput {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            confidence: None,
            requires_intervention: false,
            intervention_reason: None,
            options: Vec::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn flag_ambiguity(mut self, reason: impl Into<String>) -> Self {
        self.requires_intervention = true;
        self.intervention_reason = Some(reason.into());
        self
    }

    /// Check the payload shape: non-empty, declared fields present and
    /// non-null, confidence inside `[0, 1]`.
    pub fn validate(&self, required_fields: &[String]) -> Result<(), AgentError> {
        let empty = match &self.payload {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::String(s) => s.trim().is_empty(),
            Value::Bool(_) | Value::Number(_) => false,
        };
        if empty {
            return Err(AgentError::Validation("payload is empty".to_string()));
        }

        if !required_fields.is_empty() {
            let Some(map) = self.payload.as_object() else {
                return Err(AgentError::Validation(format!(
                    "payload must be an object with fields: {}",
                    required_fields.join(", ")
                )));
            };
            let missing: Vec<&str> = required_fields
                .iter()
                .filter(|f| map.get(f.as_str()).is_none_or(Value::is_null))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(AgentError::Validation(format!(
                    "missing required fields: {}",
                    missing.join(", ")
                )));
            }
        }

        if let Some(c) = self.confidence
            && !(0.0..=1.0).contains(&c)
        {
            return Err(AgentError::Validation(format!(
                "confidence {} outside [0, 1]",
                c
            )));
        }

        Ok(())
    }
}

/// Failure reported by an adapter, or synthesized by the executor.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    #[error("agent timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("connection failure: {0}")]
    Connection(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid output: {0}")]
    Validation(String),

    /// Unstructured failure; classified by matching the message.
    #[error("{0}")]
    Failed(String),
}

impl AgentError {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Timeout(_) => "timeout",
            AgentError::RateLimited { .. } => "rate_limited",
            AgentError::Connection(_) => "connection",
            AgentError::InvalidInput(_) => "invalid_input",
            AgentError::PermissionDenied(_) => "permission_denied",
            AgentError::Validation(_) => "validation",
            AgentError::Failed(_) => "failed",
        }
    }

    /// Server-suggested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AgentError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Uniform execution contract implemented by every stage agent.
///
/// Real implementation: `botarmy::agents::CommandAgent`.
/// Test doubles implement this directly.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    fn role(&self) -> AgentRole;

    /// Top-level payload fields a successful output must contain.
    fn required_fields(&self) -> &[String] {
        &[]
    }

    async fn execute(&self, input: &StageInput) -> Result<AgentOutput, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_decision_origin_defaults_to_question() {
        let decision: HumanDecision = serde_json::from_value(json!({
            "request_id": RequestId::new(),
            "choice": "web",
            "description": "which platform?",
        }))
        .unwrap();
        assert_eq!(decision.origin, DecisionOrigin::Question);
        assert!(!decision.is_review());
    }

    #[test]
    fn test_validate_accepts_complete_payload() {
        let output = AgentOutput::new(json!({"analysis": "ok", "user_stories": []}))
            .with_confidence(0.9);
        assert!(output.validate(&fields(&["analysis", "user_stories"])).is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_payload() {
        for payload in [json!(null), json!({}), json!([]), json!("  ")] {
            let err = AgentOutput::new(payload).validate(&[]).unwrap_err();
            assert!(matches!(err, AgentError::Validation(_)));
        }
    }

    #[test]
    fn test_validate_reports_missing_fields() {
        let output = AgentOutput::new(json!({"analysis": "ok", "user_stories": null}));
        let err = output
            .validate(&fields(&["analysis", "user_stories", "risks"]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid output: missing required fields: user_stories, risks"
        );
    }

    #[test]
    fn test_validate_requires_object_when_fields_declared() {
        let output = AgentOutput::new(json!("some prose"));
        assert!(output.validate(&fields(&["files"])).is_err());
        assert!(output.validate(&[]).is_ok());
    }

    #[test]
    fn test_validate_confidence_range() {
        let output = AgentOutput::new(json!({"a": 1})).with_confidence(1.5);
        assert!(matches!(output.validate(&[]), Err(AgentError::Validation(_))));
    }

    #[test]
    fn test_agent_output_defaults_on_deserialize() {
        let output: AgentOutput = serde_json::from_str(r#"{"payload": {"x": 1}}"#).unwrap();
        assert_eq!(output.confidence, None);
        assert!(!output.requires_intervention);
        assert!(output.options.is_empty());
    }

    #[test]
    fn test_error_kind_and_retry_after() {
        let err = AgentError::RateLimited {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.kind(), "rate_limited");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(AgentError::Timeout(Duration::from_secs(300)).to_string(), "agent timed out after 300s");
    }

    #[test]
    fn test_stage_input_output_of() {
        let input = StageInput {
            project_id: ProjectId::new(),
            stage: Stage::Developing,
            requirement: "Build a to-do app".into(),
            previous_stage_outputs: vec![
                PriorOutput {
                    stage: Stage::Analyzing,
                    agent: AgentRole::Analyst,
                    payload: json!({"analysis": "a"}),
                },
                PriorOutput {
                    stage: Stage::Architecting,
                    agent: AgentRole::Architect,
                    payload: json!({"architecture": "b"}),
                },
            ],
            human_decision: None,
        };
        assert_eq!(input.output_of(Stage::Architecting), Some(&json!({"architecture": "b"})));
        assert_eq!(input.output_of(Stage::Testing), None);
    }

    struct Echo;

    #[async_trait]
    impl AgentAdapter for Echo {
        fn role(&self) -> AgentRole {
            AgentRole::Analyst
        }

        async fn execute(&self, input: &StageInput) -> Result<AgentOutput, AgentError> {
            Ok(AgentOutput::new(json!({"echo": input.requirement})))
        }
    }

    #[tokio::test]
    async fn test_adapter_default_required_fields() {
        let echo = Echo;
        assert!(echo.required_fields().is_empty());
        let input = StageInput {
            project_id: ProjectId::new(),
            stage: Stage::Analyzing,
            requirement: "r".into(),
            previous_stage_outputs: vec![],
            human_decision: None,
        };
        let out = echo.execute(&input).await.unwrap();
        assert_eq!(out.payload, json!({"echo": "r"}));
    }
}
