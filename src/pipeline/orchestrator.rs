//! Pipeline orchestrator: owns project lifecycles.
//!
//! Each processing project is advanced by one background driver task.
//! The driver runs stages back to back until the project stops being
//! `Processing` (completed, failed, suspended for a human or cancelled)
//! and then deregisters itself. Every state change goes through the store
//! first, so a restarted process picks up where the previous one stopped
//! via [`Orchestrator::recover`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use botarmy_common::{
    HumanDecision, ProjectId, ProjectStatus, RequestId, RetryPolicy, Stage, StageInput,
};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, instrument, warn};

use super::executor::{FailureOutcome, StageExecutor, StageResult};
use super::intervention::{InterventionManager, Resolution, ResumeHook};
use super::queue::MessageQueue;
use super::recovery::ErrorRecoveryManager;
use super::registry::AgentRegistry;
use crate::errors::PipelineError;
use crate::store::{
    InterventionRequest, MessageKind, NewMessage, NewProject, PipelineEvent, Project,
    StageFailure, StoreHandle,
};

/// Engine-wide knobs.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub retry: RetryPolicy,
    pub confidence_threshold: f64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            confidence_threshold: super::intervention::DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

/// Point-in-time view of one pipeline.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub project: Project,
    pub errors: Vec<StageFailure>,
    pub pending_intervention: Option<InterventionRequest>,
    pub elapsed: Duration,
    /// Whether a driver task is currently advancing the project.
    pub active: bool,
}

struct Driver {
    done: watch::Receiver<bool>,
    abort: AbortHandle,
}

impl Driver {
    fn is_live(&self) -> bool {
        !*self.done.borrow() && self.done.has_changed().is_ok()
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    store: StoreHandle,
    queue: MessageQueue,
    registry: Arc<AgentRegistry>,
    executor: Arc<StageExecutor>,
    interventions: Arc<InterventionManager>,
    retry: RetryPolicy,
    drivers: Arc<Mutex<HashMap<ProjectId, Driver>>>,
}

impl Orchestrator {
    pub fn new(
        store: StoreHandle,
        registry: AgentRegistry,
        recovery: ErrorRecoveryManager,
        settings: PipelineSettings,
    ) -> Self {
        let executor = StageExecutor::new(store.clone(), Arc::new(recovery));
        let interventions = InterventionManager::new(store.clone())
            .with_confidence_threshold(settings.confidence_threshold);
        Self {
            queue: MessageQueue::new(store.clone()),
            store,
            registry: Arc::new(registry),
            executor: Arc::new(executor),
            interventions: Arc::new(interventions),
            retry: settings.retry,
            drivers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn interventions(&self) -> &InterventionManager {
        &self.interventions
    }

    /// Live feed of every committed state transition.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.store.subscribe()
    }

    /// Create a project and start its pipeline.
    pub async fn submit(&self, new: NewProject) -> Result<Project, PipelineError> {
        let project = self.store.call(move |db| db.create_project(&new)).await?;
        self.start(project.id, &project.requirement).await
    }

    /// Start the pipeline of `project_id`, creating the project if it does
    /// not exist yet. Only a `Created` project can be started.
    pub async fn start(
        &self,
        project_id: ProjectId,
        requirement: &str,
    ) -> Result<Project, PipelineError> {
        let requirement = requirement.to_string();
        let started = self
            .store
            .call(move |db| {
                if db.get_project(project_id)?.is_none() {
                    db.create_project(&NewProject::new(requirement).with_id(project_id))?;
                }
                db.start_project(project_id)
            })
            .await?;
        let Some(project) = started else {
            let current = self.project(project_id).await?;
            return Err(PipelineError::InvalidTransition {
                id: project_id,
                status: current.status,
                action: "start",
            });
        };
        info!(project_id = %project_id, "pipeline started");
        self.spawn_driver(project_id).await;
        Ok(project)
    }

    /// Continue a `Processing` project that has no driver, such as one
    /// left behind by a crashed process or just released by a resolution.
    pub async fn resume(&self, project_id: ProjectId) -> Result<Project, PipelineError> {
        let project = self.project(project_id).await?;
        if project.status != ProjectStatus::Processing {
            return Err(PipelineError::InvalidTransition {
                id: project_id,
                status: project.status,
                action: "resume",
            });
        }
        self.spawn_driver(project_id).await;
        Ok(project)
    }

    /// Cancel a non-terminal project.
    ///
    /// An adapter call already in flight runs to completion and its result
    /// is discarded; no further stage starts.
    pub async fn cancel(&self, project_id: ProjectId) -> Result<Project, PipelineError> {
        let cancelled = self
            .store
            .call(move |db| db.cancel_project(project_id))
            .await?;
        let Some(project) = cancelled else {
            let current = self.project(project_id).await?;
            return Err(PipelineError::InvalidTransition {
                id: project_id,
                status: current.status,
                action: "cancel",
            });
        };
        info!(project_id = %project_id, stage = %project.stage, "pipeline cancelled");
        Ok(project)
    }

    pub async fn status(&self, project_id: ProjectId) -> Result<PipelineReport, PipelineError> {
        let (project, errors, pending) = self
            .store
            .call(move |db| {
                let project = db.get_project(project_id)?;
                let errors = db.stage_failures(project_id)?;
                let pending = db.pending_interventions(Some(project_id))?;
                Ok((project, errors, pending))
            })
            .await?;
        let project = project.ok_or(PipelineError::ProjectNotFound { id: project_id })?;
        let active = self
            .drivers
            .lock()
            .await
            .get(&project_id)
            .is_some_and(Driver::is_live);
        Ok(PipelineReport {
            elapsed: project.elapsed(chrono::Utc::now()).to_std().unwrap_or_default(),
            project,
            errors,
            pending_intervention: pending.into_iter().next(),
            active,
        })
    }

    /// Resolve an intervention and continue the pipeline if it was released.
    pub async fn resolve_intervention(
        &self,
        request_id: RequestId,
        choice: &str,
    ) -> Result<Resolution, PipelineError> {
        self.interventions.resolve(request_id, choice, self).await
    }

    /// Spawn drivers for every project left in `Processing`.
    pub async fn recover(&self) -> Result<Vec<ProjectId>, PipelineError> {
        let processing = self
            .store
            .call(|db| db.list_projects(Some(ProjectStatus::Processing)))
            .await?;
        let mut resumed = Vec::with_capacity(processing.len());
        for project in processing {
            info!(project_id = %project.id, stage = %project.stage, "recovering pipeline");
            self.spawn_driver(project.id).await;
            resumed.push(project.id);
        }
        Ok(resumed)
    }

    /// Wait until no driver is advancing `project_id`, then return it.
    pub async fn wait(&self, project_id: ProjectId) -> Result<Project, PipelineError> {
        loop {
            let mut done = {
                let mut drivers = self.drivers.lock().await;
                match drivers.get(&project_id) {
                    Some(driver) if driver.is_live() => driver.done.clone(),
                    Some(_) => {
                        drivers.remove(&project_id);
                        break;
                    }
                    None => break,
                }
            };
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.project(project_id).await
    }

    /// Abort every driver task, dropping in-flight adapter calls.
    ///
    /// Projects stay in the state the store last recorded; attempts that
    /// were running are picked up again by [`recover`](Self::recover).
    pub async fn shutdown(&self) -> usize {
        let mut drivers = self.drivers.lock().await;
        let count = drivers.len();
        for (project_id, driver) in drivers.drain() {
            debug!(project_id = %project_id, "aborting driver");
            driver.abort.abort();
        }
        count
    }

    async fn project(&self, project_id: ProjectId) -> Result<Project, PipelineError> {
        self.store
            .call(move |db| db.get_project(project_id))
            .await?
            .ok_or(PipelineError::ProjectNotFound { id: project_id })
    }

    async fn spawn_driver(&self, project_id: ProjectId) {
        let mut drivers = self.drivers.lock().await;
        if drivers.get(&project_id).is_some_and(Driver::is_live) {
            // The live driver re-reads the project before it exits.
            debug!(project_id = %project_id, "driver already running");
            return;
        }
        let (done_tx, done_rx) = watch::channel(false);
        let this = self.clone();
        let task = tokio::spawn(async move {
            this.drive(project_id, done_tx).await;
        });
        drivers.insert(
            project_id,
            Driver {
                done: done_rx,
                abort: task.abort_handle(),
            },
        );
    }

    #[instrument(skip(self, done), fields(project_id = %project_id))]
    async fn drive(&self, project_id: ProjectId, done: watch::Sender<bool>) {
        loop {
            let failed = match self.advance(project_id).await {
                Ok(()) => false,
                Err(e) => {
                    error!(error = %format!("{:#}", e), "pipeline driver stopped");
                    true
                }
            };
            // Deregister under the same lock `spawn_driver` checks, so a
            // resume landing now is either seen here or spawns a new driver.
            let mut drivers = self.drivers.lock().await;
            let released = !failed
                && matches!(
                    self.store.call(move |db| db.get_project(project_id)).await,
                    Ok(Some(ref p)) if p.status == ProjectStatus::Processing
                );
            if !released {
                drivers.remove(&project_id);
                let _ = done.send(true);
                return;
            }
        }
    }

    /// Run stages until the project leaves `Processing`.
    async fn advance(&self, project_id: ProjectId) -> Result<()> {
        loop {
            let project = self
                .store
                .call(move |db| db.get_project(project_id))
                .await?
                .with_context(|| format!("Project {} not found", project_id))?;
            if project.status != ProjectStatus::Processing {
                debug!(status = %project.status, "pipeline not processing");
                return Ok(());
            }
            let stage = project.stage;
            if !self.step(project, stage).await? {
                return Ok(());
            }
        }
    }

    /// Execute `stage` once to a conclusion. Returns whether the project
    /// moved on and the driver should continue.
    async fn step(&self, project: Project, stage: Stage) -> Result<bool> {
        let project_id = project.id;
        let Some(agent) = stage.agent() else {
            let message = format!("Project is processing without a work stage ({})", stage);
            self.store
                .call(move |db| db.fail_project(project_id, stage, &message, None))
                .await?;
            return Ok(false);
        };
        let Some(adapter) = self.registry.get(stage) else {
            let message = PipelineError::NoAdapter { stage }.to_string();
            error!(stage = %stage, "{}", message);
            self.store
                .call(move |db| db.fail_project(project_id, stage, &message, None))
                .await?;
            return Ok(false);
        };

        let input_message = self.queue.next_for(project_id, agent).await?;
        let previous = self
            .store
            .call(move |db| db.stage_outputs(project_id, stage))
            .await?;
        let human_decision = input_message
            .as_ref()
            .filter(|m| m.kind == MessageKind::Decision)
            .and_then(|m| serde_json::from_value::<HumanDecision>(m.payload.clone()).ok());
        let input = StageInput {
            project_id,
            stage,
            requirement: project.requirement,
            previous_stage_outputs: previous,
            human_decision,
        };
        let input_id = input_message.as_ref().map(|m| m.id);

        let result = self
            .executor
            .run(adapter.as_ref(), &input, input_id, &self.retry)
            .await?;
        match result {
            StageResult::Halted(status) => {
                info!(stage = %stage, status = %status, "stage halted before an attempt");
                Ok(false)
            }
            StageResult::Success { output, attempts } => {
                let review = self
                    .interventions
                    .review_reason_after(&output, input.human_decision.as_ref());
                if let Some(reason) = review {
                    let raised = self
                        .interventions
                        .raise_for_review(project_id, stage, &output, &reason, input_id)
                        .await;
                    return self.suspended(stage, raised).map(|()| false);
                }
                let message = NewMessage::handoff(project_id, stage, agent, output.payload)
                    .with_confidence(output.confidence);
                let completed = self
                    .store
                    .call(move |db| db.complete_stage(project_id, stage, &message, input_id))
                    .await?;
                match completed {
                    Some(completion) => {
                        info!(
                            stage = %stage,
                            attempts,
                            status = %completion.project.status,
                            next = %completion.project.stage,
                            "stage completed"
                        );
                        Ok(completion.project.status == ProjectStatus::Processing)
                    }
                    None => {
                        info!(stage = %stage, "project left processing, output discarded");
                        Ok(false)
                    }
                }
            }
            StageResult::Failure {
                error,
                outcome: FailureOutcome::Escalate,
                attempts,
            } => {
                let raised = self
                    .interventions
                    .raise_for_failure(project_id, stage, &error, attempts, input_id)
                    .await;
                self.suspended(stage, raised).map(|()| false)
            }
            StageResult::Failure {
                error,
                outcome: FailureOutcome::Abort,
                attempts,
            } => {
                let message = error.message.clone();
                let failed = self
                    .store
                    .call(move |db| db.fail_project(project_id, stage, &message, input_id))
                    .await?;
                if failed {
                    warn!(stage = %stage, attempts, error = %error.message, "pipeline failed");
                }
                Ok(false)
            }
        }
    }

    fn suspended(
        &self,
        stage: Stage,
        raised: Result<InterventionRequest, PipelineError>,
    ) -> Result<()> {
        match raised {
            Ok(request) => {
                info!(stage = %stage, request_id = %request.id, "waiting for human input");
                Ok(())
            }
            Err(
                e @ (PipelineError::InterventionAlreadyPending { .. }
                | PipelineError::InvalidTransition { .. }),
            ) => {
                warn!(stage = %stage, error = %e, "intervention not raised");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ResumeHook for Orchestrator {
    async fn resume(&self, project_id: ProjectId) -> Result<(), PipelineError> {
        Orchestrator::resume(self, project_id).await.map(|_| ())
    }
}
