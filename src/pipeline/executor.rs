//! Stage executor: run one stage's adapter under the retry policy.
//!
//! Each attempt is recorded in the store before the adapter is invoked and
//! bounded by the policy's per-attempt timeout. Output that fails schema
//! validation counts as a failed attempt. The executor never writes the
//! stage's output itself; it hands a [`StageResult`] back to the
//! orchestrator.

use std::sync::Arc;

use anyhow::Result;
use botarmy_common::{
    AgentAdapter, AgentError, AgentOutput, MessageId, ProjectId, ProjectStatus, RetryPolicy,
    Stage, StageInput,
};
use tracing::{info, instrument, warn};

use super::recovery::{ClassifiedError, DecisionKind, ErrorRecoveryManager, RecoveryDecision};
use crate::store::{AttemptStart, StoreHandle};

/// What the pipeline should do after a failed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Retries are used up on a transient failure; ask a human.
    Escalate,
    /// Unrecoverable; the pipeline stops in `Error`.
    Abort,
}

#[derive(Debug, Clone)]
pub enum StageResult {
    Success {
        output: AgentOutput,
        attempts: u32,
    },
    Failure {
        error: ClassifiedError,
        outcome: FailureOutcome,
        attempts: u32,
    },
    /// The project left `Processing` at this stage before an attempt
    /// could start.
    Halted(ProjectStatus),
}

pub struct StageExecutor {
    store: StoreHandle,
    recovery: Arc<ErrorRecoveryManager>,
}

impl StageExecutor {
    pub fn new(store: StoreHandle, recovery: Arc<ErrorRecoveryManager>) -> Self {
        Self { store, recovery }
    }

    pub fn recovery(&self) -> &ErrorRecoveryManager {
        &self.recovery
    }

    /// Run `input.stage` with `adapter` until it succeeds, the attempt
    /// bound is reached, or a fatal error occurs.
    ///
    /// `input_message` is the queued message the stage is consuming; its
    /// attempt counter is advanced alongside the stage's.
    #[instrument(skip_all, fields(project_id = %input.project_id, stage = %input.stage))]
    pub async fn run(
        &self,
        adapter: &dyn AgentAdapter,
        input: &StageInput,
        input_message: Option<MessageId>,
        policy: &RetryPolicy,
    ) -> Result<StageResult> {
        let project_id = input.project_id;
        let stage = input.stage;
        let max_attempts = policy.max_attempts;

        let recorded = self
            .store
            .call(move |db| db.unapplied_decision(project_id, stage))
            .await?;
        if let Some(failure) = recorded {
            // Decided before a restart but never acted on.
            info!(
                attempt = failure.attempt,
                decision = %failure.decision,
                "applying recorded decision"
            );
            let outcome = match failure.decision {
                DecisionKind::Abort => FailureOutcome::Abort,
                _ => FailureOutcome::Escalate,
            };
            return Ok(StageResult::Failure {
                error: ClassifiedError::from_failure(&failure),
                outcome,
                attempts: failure.attempt,
            });
        }

        loop {
            let start = self
                .store
                .call(move |db| db.begin_attempt(project_id, stage, input_message, max_attempts))
                .await?;
            let attempt = match start {
                AttemptStart::Started(attempt) => attempt,
                AttemptStart::Halted(status) => return Ok(StageResult::Halted(status)),
                AttemptStart::Exhausted {
                    attempts,
                    last_error,
                } => {
                    // Window used up by a run that never reported back.
                    let error = ClassifiedError::interrupted(last_error);
                    return self
                        .fail(project_id, stage, attempts, error, policy)
                        .await;
                }
            };

            info!(attempt, max_attempts, "starting attempt");
            let error = match self.attempt(adapter, input, policy).await {
                Ok(output) => {
                    return Ok(StageResult::Success {
                        output,
                        attempts: attempt,
                    });
                }
                Err(e) => self.recovery.classify(&e),
            };

            let decision = self.recovery.decide(stage, attempt, &error, policy);
            self.recovery
                .record(&self.store, project_id, stage, attempt, &error, decision)
                .await?;
            match decision {
                RecoveryDecision::Retry(delay) => {
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error.message,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RecoveryDecision::Escalate => {
                    return Ok(StageResult::Failure {
                        error,
                        outcome: FailureOutcome::Escalate,
                        attempts: attempt,
                    });
                }
                RecoveryDecision::Abort => {
                    return Ok(StageResult::Failure {
                        error,
                        outcome: FailureOutcome::Abort,
                        attempts: attempt,
                    });
                }
            }
        }
    }

    async fn attempt(
        &self,
        adapter: &dyn AgentAdapter,
        input: &StageInput,
        policy: &RetryPolicy,
    ) -> Result<AgentOutput, AgentError> {
        let output = tokio::time::timeout(policy.attempt_timeout, adapter.execute(input))
            .await
            .map_err(|_| AgentError::Timeout(policy.attempt_timeout))??;
        output.validate(adapter.required_fields())?;
        Ok(output)
    }

    async fn fail(
        &self,
        project_id: ProjectId,
        stage: Stage,
        attempts: u32,
        error: ClassifiedError,
        policy: &RetryPolicy,
    ) -> Result<StageResult> {
        let decision = self.recovery.decide(stage, attempts, &error, policy);
        self.recovery
            .record(&self.store, project_id, stage, attempts, &error, decision)
            .await?;
        let outcome = match decision {
            RecoveryDecision::Abort => FailureOutcome::Abort,
            RecoveryDecision::Retry(_) | RecoveryDecision::Escalate => FailureOutcome::Escalate,
        };
        Ok(StageResult::Failure {
            error,
            outcome,
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use botarmy_common::AgentRole;
    use serde_json::json;

    use super::*;
    use crate::store::{NewProject, PipelineDb};

    /// Replays a scripted sequence of results; repeats the last one.
    struct Scripted {
        script: Mutex<VecDeque<Result<AgentOutput, AgentError>>>,
        calls: Mutex<u32>,
        required: Vec<String>,
    }

    impl Scripted {
        fn new(script: Vec<Result<AgentOutput, AgentError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
                required: Vec::new(),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl AgentAdapter for Scripted {
        fn role(&self) -> AgentRole {
            AgentRole::Analyst
        }

        fn required_fields(&self) -> &[String] {
            &self.required
        }

        async fn execute(&self, _input: &StageInput) -> Result<AgentOutput, AgentError> {
            *self.calls.lock().unwrap() += 1;
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            }
        }
    }

    struct Sleepy;

    #[async_trait]
    impl AgentAdapter for Sleepy {
        fn role(&self) -> AgentRole {
            AgentRole::Analyst
        }

        async fn execute(&self, _input: &StageInput) -> Result<AgentOutput, AgentError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(AgentOutput::new(json!({"late": true})))
        }
    }

    fn setup() -> (StoreHandle, StageExecutor, ProjectId) {
        let store = StoreHandle::new(PipelineDb::new_in_memory().unwrap());
        let project = {
            let db = store.lock_sync().unwrap();
            let project = db.create_project(&NewProject::new("build a todo app")).unwrap();
            db.start_project(project.id).unwrap().unwrap()
        };
        let recovery = Arc::new(ErrorRecoveryManager::with_default_patterns().unwrap());
        let executor = StageExecutor::new(store.clone(), recovery);
        (store, executor, project.id)
    }

    fn input(project_id: ProjectId) -> StageInput {
        StageInput {
            project_id,
            stage: Stage::Analyzing,
            requirement: "build a todo app".into(),
            previous_stage_outputs: Vec::new(),
            human_decision: None,
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
    }

    fn ok(payload: serde_json::Value) -> Result<AgentOutput, AgentError> {
        Ok(AgentOutput::new(payload).with_confidence(0.9))
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let (_store, executor, id) = setup();
        let adapter = Scripted::new(vec![ok(json!({"analysis": "done"}))]);
        let result = executor
            .run(&adapter, &input(id), None, &fast_policy())
            .await
            .unwrap();
        match result {
            StageResult::Success { output, attempts } => {
                assert_eq!(attempts, 1);
                assert_eq!(output.payload["analysis"], "done");
            }
            other => panic!("expected success, got {:?}", other),
        }
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let (store, executor, id) = setup();
        let adapter = Scripted::new(vec![
            Err(AgentError::Connection("connection reset".into())),
            ok(json!({"analysis": "done"})),
        ]);
        let result = executor
            .run(&adapter, &input(id), None, &fast_policy())
            .await
            .unwrap();
        assert!(matches!(result, StageResult::Success { attempts: 2, .. }));

        let failures = store.call(move |db| db.stage_failures(id)).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].decision, crate::store::DecisionKind::Retry);
    }

    #[tokio::test]
    async fn test_exhausted_transient_escalates_after_max_attempts() {
        let (store, executor, id) = setup();
        let adapter = Scripted::new(vec![Err(AgentError::RateLimited {
            message: "429".into(),
            retry_after: None,
        })]);
        let result = executor
            .run(&adapter, &input(id), None, &fast_policy())
            .await
            .unwrap();
        match result {
            StageResult::Failure {
                outcome, attempts, ..
            } => {
                assert_eq!(outcome, FailureOutcome::Escalate);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(adapter.calls(), 3);
        let failures = store.call(move |db| db.stage_failures(id)).await.unwrap();
        assert_eq!(failures.len(), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_without_retry() {
        let (_store, executor, id) = setup();
        let adapter = Scripted::new(vec![Err(AgentError::PermissionDenied("no key".into()))]);
        let result = executor
            .run(&adapter, &input(id), None, &fast_policy())
            .await
            .unwrap();
        assert!(matches!(
            result,
            StageResult::Failure {
                outcome: FailureOutcome::Abort,
                attempts: 1,
                ..
            }
        ));
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_output_counts_as_failed_attempt() {
        let (_store, executor, id) = setup();
        let mut adapter = Scripted::new(vec![
            ok(json!({"wrong": 1})),
            ok(json!({"analysis": "done", "user_stories": []})),
        ]);
        adapter.required = vec!["analysis".into(), "user_stories".into()];
        let result = executor
            .run(&adapter, &input(id), None, &fast_policy())
            .await
            .unwrap();
        assert!(matches!(result, StageResult::Success { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_transient() {
        let (_store, executor, id) = setup();
        let policy = fast_policy()
            .with_max_attempts(1)
            .with_attempt_timeout(Duration::from_millis(20));
        let result = executor
            .run(&Sleepy, &input(id), None, &policy)
            .await
            .unwrap();
        match result {
            StageResult::Failure { error, outcome, .. } => {
                assert_eq!(error.kind, "timeout");
                assert_eq!(outcome, FailureOutcome::Escalate);
            }
            other => panic!("expected timeout failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_halts_when_project_cancelled() {
        let (store, executor, id) = setup();
        store.call(move |db| db.cancel_project(id)).await.unwrap();
        let adapter = Scripted::new(vec![ok(json!({"analysis": "done"}))]);
        let result = executor
            .run(&adapter, &input(id), None, &fast_policy())
            .await
            .unwrap();
        assert!(matches!(
            result,
            StageResult::Halted(ProjectStatus::Cancelled)
        ));
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn test_resumes_attempt_count_after_restart() {
        let (store, executor, id) = setup();
        // Two attempts were recorded by a previous process.
        store
            .call(move |db| {
                db.begin_attempt(id, Stage::Analyzing, None, 3)?;
                db.begin_attempt(id, Stage::Analyzing, None, 3)
            })
            .await
            .unwrap();
        let adapter = Scripted::new(vec![Err(AgentError::Connection("refused".into()))]);
        let result = executor
            .run(&adapter, &input(id), None, &fast_policy())
            .await
            .unwrap();
        assert!(matches!(
            result,
            StageResult::Failure {
                outcome: FailureOutcome::Escalate,
                attempts: 3,
                ..
            }
        ));
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn test_recorded_abort_is_applied_after_restart() {
        let (store, executor, id) = setup();
        // The previous process decided to abort but died before failing
        // the project.
        store
            .call(move |db| {
                db.begin_attempt(id, Stage::Analyzing, None, 3)?;
                db.record_failure(
                    id,
                    &crate::store::NewFailure {
                        stage: Stage::Analyzing,
                        attempt: 1,
                        class: crate::store::ErrorClass::Fatal,
                        error_kind: "permission_denied".into(),
                        message: "permission denied: api key revoked".into(),
                        decision: crate::store::DecisionKind::Abort,
                        retry_delay_ms: None,
                    },
                )
            })
            .await
            .unwrap();
        let adapter = Scripted::new(vec![ok(json!({"analysis": "done"}))]);
        let result = executor
            .run(&adapter, &input(id), None, &fast_policy())
            .await
            .unwrap();
        match result {
            StageResult::Failure {
                error,
                outcome,
                attempts,
            } => {
                assert_eq!(outcome, FailureOutcome::Abort);
                assert_eq!(attempts, 1);
                assert_eq!(error.kind, "permission_denied");
            }
            other => panic!("expected abort, got {:?}", other),
        }
        assert_eq!(adapter.calls(), 0);
    }
}
