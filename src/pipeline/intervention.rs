//! Human intervention: decide when a stage needs an operator, raise the
//! request, and turn the operator's choice into a pipeline effect.
//!
//! Choices map onto three effects:
//!
//! | Choice          | Effect                                              |
//! |-----------------|-----------------------------------------------------|
//! | `abort`         | Pipeline stops in `Error` ("aborted by operator")   |
//! | `skip`          | Candidate (or placeholder) output is handed forward |
//! | anything else   | The raising stage re-runs with the decision attached |

use async_trait::async_trait;
use botarmy_common::{
    AgentOutput, AgentRole, DecisionOrigin, HumanDecision, InterventionStatus, MessageId, MessageStatus,
    Priority, ProjectId, ProjectStatus, RequestId, Stage,
};
use serde_json::{Value, json};
use tracing::info;

use super::recovery::ClassifiedError;
use crate::errors::PipelineError;
use crate::store::{
    InterventionRequest, Message, MessageKind, NewIntervention, NewMessage, Project, RaiseOutcome,
    ResolutionEffect, ResolutionPlan, ResolveOutcome, StoreHandle,
};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

pub const REVIEW_OPTIONS: [&str; 3] = ["approve", "skip", "abort"];
pub const FAILURE_OPTIONS: [&str; 3] = ["retry", "skip", "abort"];

/// How an operator's choice affects the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionAction {
    Rerun,
    Skip,
    Abort,
}

impl ResolutionAction {
    pub fn from_choice(choice: &str) -> Self {
        match choice.trim().to_ascii_lowercase().as_str() {
            "abort" | "cancel" | "reject" => ResolutionAction::Abort,
            "skip" => ResolutionAction::Skip,
            _ => ResolutionAction::Rerun,
        }
    }
}

/// Continues a pipeline after a resolution put it back into `Processing`.
#[async_trait]
pub trait ResumeHook: Send + Sync {
    async fn resume(&self, project_id: ProjectId) -> Result<(), PipelineError>;
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub request: InterventionRequest,
    pub project: Project,
    /// The decision or skip message written for the next stage run.
    pub message: Message,
    pub action: ResolutionAction,
}

pub struct InterventionManager {
    store: StoreHandle,
    confidence_threshold: f64,
}

impl InterventionManager {
    pub fn new(store: StoreHandle) -> Self {
        Self {
            store,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }

    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn confidence_threshold(&self) -> f64 {
        self.confidence_threshold
    }

    /// Why `output` needs a human before it is handed on, if it does.
    pub fn review_reason(&self, output: &AgentOutput) -> Option<String> {
        if output.requires_intervention {
            return Some(
                output
                    .intervention_reason
                    .clone()
                    .unwrap_or_else(|| "agent flagged its result as ambiguous".to_string()),
            );
        }
        match output.confidence {
            Some(c) if c < self.confidence_threshold => Some(format!(
                "confidence {:.2} is below the {:.2} threshold",
                c, self.confidence_threshold
            )),
            _ => None,
        }
    }

    /// Like [`review_reason`](Self::review_reason), but a re-run answering
    /// a review request is let through: the operator already accepted it.
    pub fn review_reason_after(
        &self,
        output: &AgentOutput,
        decision: Option<&HumanDecision>,
    ) -> Option<String> {
        if decision.is_some_and(HumanDecision::is_review) {
            return None;
        }
        self.review_reason(output)
    }

    /// Raise a request with the given options and suspend the project.
    pub async fn raise(
        &self,
        project_id: ProjectId,
        stage: Stage,
        description: &str,
        options: Vec<String>,
    ) -> Result<RequestId, PipelineError> {
        let request = self
            .raise_request(
                NewIntervention {
                    project_id,
                    stage,
                    description: description.to_string(),
                    priority: Priority::Medium,
                    options,
                    context: None,
                },
                None,
            )
            .await?;
        Ok(request.id)
    }

    /// Hold back a low-confidence or ambiguous output for review.
    ///
    /// The candidate is kept in the request context so `skip` can hand it
    /// forward; the consumed input message is marked completed.
    pub async fn raise_for_review(
        &self,
        project_id: ProjectId,
        stage: Stage,
        output: &AgentOutput,
        reason: &str,
        input: Option<MessageId>,
    ) -> Result<InterventionRequest, PipelineError> {
        let options = if output.options.is_empty() {
            REVIEW_OPTIONS.iter().map(|o| o.to_string()).collect()
        } else {
            output.options.clone()
        };
        let new = NewIntervention {
            project_id,
            stage,
            description: format!("Review {} output: {}", stage, reason),
            priority: Priority::Medium,
            options,
            context: Some(json!({
                "origin": DecisionOrigin::Review,
                "reason": reason,
                "confidence": output.confidence,
                "candidate": output.payload,
            })),
        };
        self.raise_request(new, input.map(|id| (id, MessageStatus::Completed)))
            .await
    }

    /// Escalate a stage whose retries are exhausted.
    pub async fn raise_for_failure(
        &self,
        project_id: ProjectId,
        stage: Stage,
        error: &ClassifiedError,
        attempts: u32,
        input: Option<MessageId>,
    ) -> Result<InterventionRequest, PipelineError> {
        let new = NewIntervention {
            project_id,
            stage,
            description: format!(
                "{} failed after {} attempts: {}",
                stage, attempts, error.message
            ),
            priority: Priority::High,
            options: FAILURE_OPTIONS.iter().map(|o| o.to_string()).collect(),
            context: Some(json!({
                "origin": DecisionOrigin::Failure,
                "error_kind": error.kind,
                "error_class": error.class,
                "error": error.message,
                "attempts": attempts,
            })),
        };
        self.raise_request(new, input.map(|id| (id, MessageStatus::Error)))
            .await
    }

    pub async fn raise_request(
        &self,
        new: NewIntervention,
        input: Option<(MessageId, MessageStatus)>,
    ) -> Result<InterventionRequest, PipelineError> {
        let project_id = new.project_id;
        let outcome = self
            .store
            .call(move |db| db.raise_intervention(&new, input))
            .await?;
        match outcome {
            RaiseOutcome::Raised(request) => {
                info!(
                    project_id = %project_id,
                    request_id = %request.id,
                    stage = %request.stage,
                    priority = %request.priority,
                    "intervention raised"
                );
                Ok(request)
            }
            RaiseOutcome::AlreadyPending(request_id) => {
                Err(PipelineError::InterventionAlreadyPending {
                    project_id,
                    request_id,
                })
            }
            RaiseOutcome::Halted(status) => Err(PipelineError::InvalidTransition {
                id: project_id,
                status,
                action: "suspend",
            }),
        }
    }

    /// Resolve a pending request exactly once.
    ///
    /// When the resolution leaves the project processing, `hook` is called
    /// to continue it.
    pub async fn resolve(
        &self,
        request_id: RequestId,
        choice: &str,
        hook: &dyn ResumeHook,
    ) -> Result<Resolution, PipelineError> {
        let request = self
            .store
            .call(move |db| db.get_intervention(request_id))
            .await?
            .ok_or(PipelineError::InterventionNotFound { id: request_id })?;
        if request.status == InterventionStatus::Resolved {
            return Err(PipelineError::InterventionAlreadyResolved { id: request_id });
        }
        let choice = request
            .match_option(choice)
            .ok_or_else(|| PipelineError::InvalidChoice {
                choice: choice.to_string(),
                options: request.options.clone(),
            })?;

        let (action, plan) = build_plan(&request, choice);
        let outcome = self
            .store
            .call(move |db| db.resolve_intervention(&plan))
            .await?;
        let (request, project, message) = match outcome {
            ResolveOutcome::Resolved {
                request,
                project,
                message,
            } => (request, project, message),
            ResolveOutcome::NotFound => {
                return Err(PipelineError::InterventionNotFound { id: request_id });
            }
            ResolveOutcome::AlreadyResolved(_) => {
                return Err(PipelineError::InterventionAlreadyResolved { id: request_id });
            }
        };
        info!(
            project_id = %project.id,
            request_id = %request_id,
            choice = request.resolution.as_deref().unwrap_or_default(),
            status = %project.status,
            "intervention resolved"
        );

        if project.status == ProjectStatus::Processing {
            hook.resume(project.id).await?;
        }
        Ok(Resolution {
            request,
            project,
            message,
            action,
        })
    }

    /// Pending requests, most urgent first.
    pub async fn pending(
        &self,
        project_id: Option<ProjectId>,
    ) -> Result<Vec<InterventionRequest>, PipelineError> {
        Ok(self
            .store
            .call(move |db| db.pending_interventions(project_id))
            .await?)
    }
}

fn build_plan(request: &InterventionRequest, choice: String) -> (ResolutionAction, ResolutionPlan) {
    let action = ResolutionAction::from_choice(&choice);
    let stage = request.stage;
    let decision = HumanDecision {
        request_id: request.id,
        choice: choice.clone(),
        description: request.description.clone(),
        origin: request.origin(),
    };
    let decision_payload = serde_json::to_value(&decision).unwrap_or(Value::Null);

    let (message, effect) = match action {
        ResolutionAction::Rerun => (
            NewMessage {
                project_id: request.project_id,
                from_agent: AgentRole::Human,
                to_agent: stage.agent().unwrap_or(AgentRole::Orchestrator),
                kind: MessageKind::Decision,
                stage,
                payload: decision_payload,
                confidence: None,
            },
            ResolutionEffect::Rerun,
        ),
        ResolutionAction::Skip => {
            let payload = request
                .context
                .as_ref()
                .and_then(|c| c.get("candidate"))
                .filter(|c| !c.is_null())
                .cloned()
                .unwrap_or_else(|| {
                    json!({
                        "skipped": true,
                        "request_id": request.id,
                        "choice": choice,
                    })
                });
            (
                NewMessage {
                    project_id: request.project_id,
                    from_agent: AgentRole::Human,
                    to_agent: stage.downstream(),
                    kind: MessageKind::Handoff,
                    stage,
                    payload,
                    confidence: None,
                },
                ResolutionEffect::Advance,
            )
        }
        ResolutionAction::Abort => (
            NewMessage {
                project_id: request.project_id,
                from_agent: AgentRole::Human,
                to_agent: AgentRole::Orchestrator,
                kind: MessageKind::Decision,
                stage,
                payload: decision_payload,
                confidence: None,
            },
            ResolutionEffect::Abort {
                reason: format!("aborted by operator: {}", request.description),
            },
        ),
    };

    (
        action,
        ResolutionPlan {
            request_id: request.id,
            choice,
            message,
            effect,
        },
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::store::{NewProject, PipelineDb};

    #[derive(Default)]
    struct RecordingHook {
        resumed: Mutex<Vec<ProjectId>>,
    }

    #[async_trait]
    impl ResumeHook for RecordingHook {
        async fn resume(&self, project_id: ProjectId) -> Result<(), PipelineError> {
            self.resumed.lock().unwrap().push(project_id);
            Ok(())
        }
    }

    fn setup() -> (StoreHandle, InterventionManager, ProjectId) {
        let store = StoreHandle::new(PipelineDb::new_in_memory().unwrap());
        let id = {
            let db = store.lock_sync().unwrap();
            let project = db.create_project(&NewProject::new("build a todo app")).unwrap();
            db.start_project(project.id).unwrap().unwrap().id
        };
        (store.clone(), InterventionManager::new(store), id)
    }

    #[test]
    fn test_review_reason_thresholds() {
        let store = StoreHandle::new(PipelineDb::new_in_memory().unwrap());
        let manager = InterventionManager::new(store);
        let confident = AgentOutput::new(json!({"a": 1})).with_confidence(0.9);
        assert!(manager.review_reason(&confident).is_none());

        let at_threshold = AgentOutput::new(json!({"a": 1})).with_confidence(0.7);
        assert!(manager.review_reason(&at_threshold).is_none());

        let low = AgentOutput::new(json!({"a": 1})).with_confidence(0.4);
        let reason = manager.review_reason(&low).unwrap();
        assert!(reason.contains("0.40"));

        let unscored = AgentOutput::new(json!({"a": 1}));
        assert!(manager.review_reason(&unscored).is_none());

        let flagged = AgentOutput::new(json!({"a": 1}))
            .with_confidence(0.95)
            .flag_ambiguity("two databases would fit");
        assert_eq!(
            manager.review_reason(&flagged).as_deref(),
            Some("two databases would fit")
        );
    }

    #[test]
    fn test_only_review_decisions_bypass_review() {
        let store = StoreHandle::new(PipelineDb::new_in_memory().unwrap());
        let manager = InterventionManager::new(store);
        let low = AgentOutput::new(json!({"a": 1})).with_confidence(0.2);
        let decision = |origin| HumanDecision {
            request_id: RequestId::new(),
            choice: "approve".to_string(),
            description: "Review output".to_string(),
            origin,
        };

        assert!(manager.review_reason_after(&low, None).is_some());
        assert!(
            manager
                .review_reason_after(&low, Some(&decision(DecisionOrigin::Review)))
                .is_none()
        );
        assert!(
            manager
                .review_reason_after(&low, Some(&decision(DecisionOrigin::Failure)))
                .is_some()
        );
        assert!(
            manager
                .review_reason_after(&low, Some(&decision(DecisionOrigin::Question)))
                .is_some()
        );
    }

    #[test]
    fn test_threshold_is_clamped() {
        let store = StoreHandle::new(PipelineDb::new_in_memory().unwrap());
        let manager = InterventionManager::new(store).with_confidence_threshold(1.5);
        assert_eq!(manager.confidence_threshold(), 1.0);
    }

    #[test]
    fn test_choices_map_to_actions() {
        assert_eq!(ResolutionAction::from_choice("approve"), ResolutionAction::Rerun);
        assert_eq!(ResolutionAction::from_choice("Retry"), ResolutionAction::Rerun);
        assert_eq!(ResolutionAction::from_choice("SKIP"), ResolutionAction::Skip);
        assert_eq!(ResolutionAction::from_choice(" abort "), ResolutionAction::Abort);
        assert_eq!(
            ResolutionAction::from_choice("use postgres"),
            ResolutionAction::Rerun
        );
    }

    #[tokio::test]
    async fn test_raise_suspends_and_second_raise_is_rejected() {
        let (store, manager, id) = setup();
        let request_id = manager
            .raise(id, Stage::Analyzing, "which platform?", vec!["web".into(), "mobile".into()])
            .await
            .unwrap();
        let project = store.call(move |db| db.get_project(id)).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::WaitingApproval);

        let err = manager
            .raise(id, Stage::Analyzing, "again", vec![])
            .await
            .unwrap_err();
        match err {
            PipelineError::InterventionAlreadyPending { request_id: got, .. } => {
                assert_eq!(got, request_id)
            }
            other => panic!("expected InterventionAlreadyPending, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolve_rerun_calls_hook_once() {
        let (store, manager, id) = setup();
        let request_id = manager
            .raise(id, Stage::Analyzing, "which platform?", vec!["web".into(), "mobile".into()])
            .await
            .unwrap();
        let hook = RecordingHook::default();

        let resolution = manager.resolve(request_id, "WEB", &hook).await.unwrap();
        assert_eq!(resolution.action, ResolutionAction::Rerun);
        assert_eq!(resolution.request.resolution.as_deref(), Some("web"));
        assert_eq!(resolution.project.status, ProjectStatus::Processing);
        assert_eq!(resolution.message.to_agent, AgentRole::Analyst);
        assert_eq!(resolution.message.kind, MessageKind::Decision);
        let decision: HumanDecision =
            serde_json::from_value(resolution.message.payload.clone()).unwrap();
        assert_eq!(decision.choice, "web");
        assert_eq!(decision.origin, DecisionOrigin::Question);

        let again = manager.resolve(request_id, "web", &hook).await.unwrap_err();
        assert!(matches!(
            again,
            PipelineError::InterventionAlreadyResolved { .. }
        ));
        assert_eq!(*hook.resumed.lock().unwrap(), vec![id]);

        let pending = manager.pending(Some(id)).await.unwrap();
        assert!(pending.is_empty());
        let messages = store.call(move |db| db.list_messages(id, None)).await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_rejects_unknown_choice() {
        let (_store, manager, id) = setup();
        let request_id = manager
            .raise(id, Stage::Analyzing, "which platform?", vec!["web".into()])
            .await
            .unwrap();
        let err = manager
            .resolve(request_id, "desktop", &RecordingHook::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidChoice { .. }));
        // Still pending and resolvable.
        assert_eq!(manager.pending(Some(id)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_unknown_request() {
        let (_store, manager, _id) = setup();
        let err = manager
            .resolve(RequestId::new(), "approve", &RecordingHook::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InterventionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_skip_hands_candidate_forward() {
        let (store, manager, id) = setup();
        let output = AgentOutput::new(json!({"analysis": "draft", "user_stories": []}))
            .with_confidence(0.4);
        let request = manager
            .raise_for_review(id, Stage::Analyzing, &output, "low confidence", None)
            .await
            .unwrap();
        assert_eq!(request.priority, Priority::Medium);
        assert_eq!(request.options, vec!["approve", "skip", "abort"]);

        let hook = RecordingHook::default();
        let resolution = manager.resolve(request.id, "skip", &hook).await.unwrap();
        assert_eq!(resolution.action, ResolutionAction::Skip);
        assert_eq!(resolution.message.to_agent, AgentRole::Architect);
        assert_eq!(resolution.message.payload["analysis"], "draft");
        assert_eq!(resolution.project.stage, Stage::Architecting);

        let outputs = store
            .call(move |db| db.stage_outputs(id, Stage::Architecting))
            .await
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(hook.resumed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_abort_stops_pipeline_without_resuming() {
        let (_store, manager, id) = setup();
        let error = ClassifiedError {
            class: crate::store::ErrorClass::Transient,
            kind: "rate_limited".into(),
            message: "rate limited: 429".into(),
            retryable: true,
            retry_after: None,
        };
        let request = manager
            .raise_for_failure(id, Stage::Analyzing, &error, 3, None)
            .await
            .unwrap();
        assert_eq!(request.priority, Priority::High);

        let hook = RecordingHook::default();
        let resolution = manager.resolve(request.id, "abort", &hook).await.unwrap();
        let decision: HumanDecision =
            serde_json::from_value(resolution.message.payload.clone()).unwrap();
        assert_eq!(decision.origin, DecisionOrigin::Failure);
        assert_eq!(resolution.project.status, ProjectStatus::Error);
        assert!(
            resolution
                .project
                .last_error
                .as_deref()
                .unwrap()
                .starts_with("aborted by operator")
        );
        assert!(hook.resumed.lock().unwrap().is_empty());
    }
}
