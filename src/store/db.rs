use std::cell::Cell;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use botarmy_common::{
    AgentRole, InterventionStatus, MessageId, MessageStatus, PriorOutput, Priority, ProjectId,
    ProjectStatus, RequestId, Stage,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use super::models::*;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Async-safe handle to the pipeline database.
///
/// Wraps `PipelineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`. Holding the mutex for the
/// whole closure is what serializes a project's state transitions.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<PipelineDb>>,
    events: broadcast::Sender<PipelineEvent>,
}

impl StoreHandle {
    pub fn new(db: PipelineDb) -> Self {
        let events = db.events.clone();
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
            events,
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PipelineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup, CLI
    /// one-shots and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, PipelineDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }

    /// Live feed of every event committed through this store.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }
}

pub struct PipelineDb {
    conn: Connection,
    /// Last issued timestamp in microseconds; keeps writes strictly ordered.
    clock: Cell<i64>,
    events: broadcast::Sender<PipelineEvent>,
}

const PROJECT_COLUMNS: &str = "id, name, requirement, stage, status, metadata_json, last_error, \
     error_stage, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, project_id, from_agent, to_agent, kind, stage, payload_json, \
     status, confidence, attempt, created_at";
const INTERVENTION_COLUMNS: &str = "id, project_id, stage, description, priority, options_json, \
     context_json, status, resolution, created_at, resolved_at";
const STAGE_RUN_COLUMNS: &str =
    "project_id, stage, attempt, status, last_error, started_at, completed_at";
const FAILURE_COLUMNS: &str = "id, project_id, stage, attempt, class, error_kind, message, \
     decision, retry_delay_ms, created_at";

impl PipelineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self::from_connection(conn);
        db.init()?;
        db.conn
            .execute_batch("PRAGMA journal_mode = WAL;")
            .context("Failed to enable WAL journal")?;
        // Another botarmy process may hold the write lock briefly.
        db.conn
            .busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self::from_connection(conn);
        db.init()?;
        Ok(db)
    }

    fn from_connection(conn: Connection) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            conn,
            clock: Cell::new(0),
            events,
        }
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    name TEXT,
                    requirement TEXT NOT NULL,
                    stage TEXT NOT NULL DEFAULT 'idle',
                    status TEXT NOT NULL DEFAULT 'created',
                    metadata_json TEXT NOT NULL DEFAULT '{}',
                    last_error TEXT,
                    error_stage TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    from_agent TEXT NOT NULL,
                    to_agent TEXT NOT NULL,
                    kind TEXT NOT NULL DEFAULT 'handoff',
                    stage TEXT NOT NULL,
                    payload_json TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    confidence REAL,
                    attempt INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS intervention_requests (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    stage TEXT NOT NULL,
                    description TEXT NOT NULL,
                    priority TEXT NOT NULL DEFAULT 'medium',
                    options_json TEXT NOT NULL DEFAULT '[]',
                    context_json TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    resolution TEXT,
                    created_at TEXT NOT NULL,
                    resolved_at TEXT
                );

                CREATE TABLE IF NOT EXISTS stage_runs (
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    stage TEXT NOT NULL,
                    attempt INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'running',
                    last_error TEXT,
                    started_at TEXT NOT NULL,
                    completed_at TEXT,
                    PRIMARY KEY (project_id, stage)
                );

                CREATE TABLE IF NOT EXISTS stage_errors (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    stage TEXT NOT NULL,
                    attempt INTEGER NOT NULL,
                    class TEXT NOT NULL,
                    error_kind TEXT NOT NULL,
                    message TEXT NOT NULL,
                    decision TEXT NOT NULL,
                    retry_delay_ms INTEGER,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    event_type TEXT NOT NULL,
                    payload_json TEXT NOT NULL DEFAULT 'null',
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_projects_status ON projects(status);
                CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(to_agent, status, created_at);
                CREATE INDEX IF NOT EXISTS idx_messages_project ON messages(project_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_interventions_project ON intervention_requests(project_id);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_interventions_one_pending
                    ON intervention_requests(project_id) WHERE status = 'pending';
                CREATE INDEX IF NOT EXISTS idx_stage_errors_project ON stage_errors(project_id);
                CREATE INDEX IF NOT EXISTS idx_events_project ON events(project_id, id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    /// Strictly increasing timestamp, microsecond resolution.
    fn now(&self) -> DateTime<Utc> {
        let micros = Utc::now().timestamp_micros().max(self.clock.get() + 1);
        self.clock.set(micros);
        DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
    }

    fn publish(&self, events: Vec<PipelineEvent>) {
        for event in events {
            // No subscribers is fine; the row is already durable.
            let _ = self.events.send(event);
        }
    }

    fn append_event(
        &self,
        conn: &Connection,
        project_id: ProjectId,
        kind: EventKind,
    ) -> Result<PipelineEvent> {
        let now = self.now();
        let mut value = serde_json::to_value(&kind).context("Failed to serialize event")?;
        let payload = value
            .as_object_mut()
            .and_then(|m| m.remove("payload"))
            .unwrap_or(Value::Null);
        conn.execute(
            "INSERT INTO events (project_id, event_type, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                project_id.to_string(),
                kind.event_type(),
                payload.to_string(),
                ts(&now)
            ],
        )
        .context("Failed to insert event")?;
        Ok(PipelineEvent {
            id: conn.last_insert_rowid(),
            project_id,
            kind,
            timestamp: now,
        })
    }

    fn query_list<R, T>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        read: fn(&Row<'_>) -> rusqlite::Result<R>,
        convert: fn(R) -> Result<T>,
    ) -> Result<Vec<T>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .with_context(|| format!("Failed to prepare query: {}", sql))?;
        let rows = stmt.query_map(params, read).context("Failed to run query")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(convert(row.context("Failed to read row")?)?);
        }
        Ok(out)
    }

    fn query_one<R, T>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        read: fn(&Row<'_>) -> rusqlite::Result<R>,
        convert: fn(R) -> Result<T>,
    ) -> Result<Option<T>> {
        self.conn
            .query_row(sql, params, read)
            .optional()
            .context("Failed to run query")?
            .map(convert)
            .transpose()
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, new: &NewProject) -> Result<Project> {
        let now = self.now();
        let metadata =
            serde_json::to_string(&new.metadata).context("Failed to serialize project metadata")?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO projects (id, name, requirement, stage, status, metadata_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                new.id.to_string(),
                new.name,
                new.requirement,
                Stage::Idle.as_str(),
                ProjectStatus::Created.as_str(),
                metadata,
                ts(&now)
            ],
        )
        .context("Failed to insert project")?;
        let event = self.append_event(
            &tx,
            new.id,
            EventKind::ProjectCreated {
                requirement: new.requirement.clone(),
            },
        )?;
        tx.commit().context("Failed to commit project insert")?;
        self.publish(vec![event]);
        self.get_project(new.id)?
            .context("Project not found after insert")
    }

    pub fn get_project(&self, id: ProjectId) -> Result<Option<Project>> {
        self.query_one(
            &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
            params![id.to_string()],
            ProjectRow::read,
            ProjectRow::into_project,
        )
    }

    /// Projects newest first, optionally filtered by status.
    pub fn list_projects(&self, status: Option<ProjectStatus>) -> Result<Vec<Project>> {
        self.query_list(
            &format!(
                "SELECT {PROJECT_COLUMNS} FROM projects
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY created_at DESC, id"
            ),
            params![status.map(|s| s.as_str())],
            ProjectRow::read,
            ProjectRow::into_project,
        )
    }

    /// `Created → Processing(first stage)`. Returns `None` if the project
    /// was not in `Created`.
    pub fn start_project(&self, id: ProjectId) -> Result<Option<Project>> {
        let now = self.now();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let changed = tx
            .execute(
                "UPDATE projects SET status = ?2, stage = ?3, updated_at = ?4
                 WHERE id = ?1 AND status = ?5",
                params![
                    id.to_string(),
                    ProjectStatus::Processing.as_str(),
                    Stage::first().as_str(),
                    ts(&now),
                    ProjectStatus::Created.as_str()
                ],
            )
            .context("Failed to start project")?;
        if changed == 0 {
            return Ok(None);
        }
        let event = self.append_event(
            &tx,
            id,
            EventKind::PipelineStarted {
                stage: Stage::first(),
            },
        )?;
        tx.commit().context("Failed to commit project start")?;
        self.publish(vec![event]);
        self.get_project(id)
    }

    /// Move a non-terminal project to `Cancelled`, closing any pending
    /// intervention. Returns `None` if the project was already terminal.
    pub fn cancel_project(&self, id: ProjectId) -> Result<Option<Project>> {
        let now = self.now();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let changed = tx
            .execute(
                "UPDATE projects SET status = ?2, updated_at = ?3
                 WHERE id = ?1 AND status IN (?4, ?5, ?6)",
                params![
                    id.to_string(),
                    ProjectStatus::Cancelled.as_str(),
                    ts(&now),
                    ProjectStatus::Created.as_str(),
                    ProjectStatus::Processing.as_str(),
                    ProjectStatus::WaitingApproval.as_str()
                ],
            )
            .context("Failed to cancel project")?;
        if changed == 0 {
            return Ok(None);
        }
        tx.execute(
            "UPDATE intervention_requests SET status = ?2, resolution = 'cancelled', resolved_at = ?3
             WHERE project_id = ?1 AND status = ?4",
            params![
                id.to_string(),
                InterventionStatus::Resolved.as_str(),
                ts(&now),
                InterventionStatus::Pending.as_str()
            ],
        )
        .context("Failed to close pending interventions")?;
        let project = self
            .get_project(id)?
            .context("Project not found after cancel")?;
        let event = self.append_event(
            &tx,
            id,
            EventKind::PipelineCancelled {
                stage: project.stage,
            },
        )?;
        tx.commit().context("Failed to commit project cancel")?;
        self.publish(vec![event]);
        Ok(Some(project))
    }

    /// `Processing(stage) → Error`, recording the error and the stage.
    pub fn fail_project(
        &self,
        id: ProjectId,
        stage: Stage,
        error: &str,
        input: Option<MessageId>,
    ) -> Result<bool> {
        let now = self.now();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let changed = tx
            .execute(
                "UPDATE projects SET status = ?2, last_error = ?3, error_stage = ?4, updated_at = ?5
                 WHERE id = ?1 AND status = ?6 AND stage = ?4",
                params![
                    id.to_string(),
                    ProjectStatus::Error.as_str(),
                    error,
                    stage.as_str(),
                    ts(&now),
                    ProjectStatus::Processing.as_str()
                ],
            )
            .context("Failed to mark project failed")?;
        if changed == 0 {
            return Ok(false);
        }
        self.set_stage_run_status(&tx, id, stage, StageRunStatus::Failed, now)?;
        if let Some(message_id) = input {
            self.set_message_status(&tx, message_id, MessageStatus::Error)?;
        }
        let event = self.append_event(
            &tx,
            id,
            EventKind::PipelineFailed {
                stage,
                error: error.to_string(),
            },
        )?;
        tx.commit().context("Failed to commit project failure")?;
        self.publish(vec![event]);
        Ok(true)
    }

    /// Move past `stage`: to the next work stage, or to `Completed` when the
    /// sequence is exhausted (the stage then stays at the last work stage).
    fn advance(
        &self,
        conn: &Connection,
        id: ProjectId,
        stage: Stage,
        now: DateTime<Utc>,
        events: &mut Vec<PipelineEvent>,
    ) -> Result<()> {
        let next = stage.next();
        if next == Stage::Completed {
            conn.execute(
                "UPDATE projects SET status = ?2, stage = ?3, updated_at = ?4 WHERE id = ?1",
                params![
                    id.to_string(),
                    ProjectStatus::Completed.as_str(),
                    stage.as_str(),
                    ts(&now)
                ],
            )
            .context("Failed to complete project")?;
            events.push(self.append_event(conn, id, EventKind::PipelineCompleted)?);
        } else {
            conn.execute(
                "UPDATE projects SET status = ?2, stage = ?3, updated_at = ?4 WHERE id = ?1",
                params![
                    id.to_string(),
                    ProjectStatus::Processing.as_str(),
                    next.as_str(),
                    ts(&now)
                ],
            )
            .context("Failed to advance project stage")?;
        }
        Ok(())
    }

    // ── Stage execution ───────────────────────────────────────────────

    /// Record the start of the next attempt for `stage`.
    ///
    /// Increments the durable attempt counters (the stage run and, when
    /// present, the input message) before the adapter is invoked, so a
    /// restart continues the count instead of resetting it.
    pub fn begin_attempt(
        &self,
        id: ProjectId,
        stage: Stage,
        input: Option<MessageId>,
        max_attempts: u32,
    ) -> Result<AttemptStart> {
        let now = self.now();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let project = self
            .get_project(id)?
            .with_context(|| format!("Project {} not found", id))?;
        if project.status != ProjectStatus::Processing || project.stage != stage {
            return Ok(AttemptStart::Halted(project.status));
        }

        tx.execute(
            "INSERT OR IGNORE INTO stage_runs (project_id, stage, attempt, status, started_at)
             VALUES (?1, ?2, 0, ?3, ?4)",
            params![
                id.to_string(),
                stage.as_str(),
                StageRunStatus::Running.as_str(),
                ts(&now)
            ],
        )
        .context("Failed to insert stage run")?;
        let (attempt, last_error): (u32, Option<String>) = tx
            .query_row(
                "SELECT attempt, last_error FROM stage_runs WHERE project_id = ?1 AND stage = ?2",
                params![id.to_string(), stage.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to read stage run")?;
        if attempt >= max_attempts {
            return Ok(AttemptStart::Exhausted {
                attempts: attempt,
                last_error,
            });
        }

        let next = attempt + 1;
        tx.execute(
            "UPDATE stage_runs SET attempt = ?3, status = ?4 WHERE project_id = ?1 AND stage = ?2",
            params![
                id.to_string(),
                stage.as_str(),
                next,
                StageRunStatus::Running.as_str()
            ],
        )
        .context("Failed to increment stage attempt")?;
        if let Some(message_id) = input {
            tx.execute(
                "UPDATE messages SET attempt = attempt + 1, status = ?2
                 WHERE id = ?1 AND attempt < ?3",
                params![
                    message_id.to_string(),
                    MessageStatus::Processing.as_str(),
                    max_attempts
                ],
            )
            .context("Failed to increment message attempt")?;
        }
        let event = self.append_event(
            &tx,
            id,
            EventKind::StageStarted {
                stage,
                attempt: next,
            },
        )?;
        tx.commit().context("Failed to commit attempt start")?;
        self.publish(vec![event]);
        Ok(AttemptStart::Started(next))
    }

    pub fn record_failure(&self, id: ProjectId, failure: &NewFailure) -> Result<StageFailure> {
        let now = self.now();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO stage_errors
                (project_id, stage, attempt, class, error_kind, message, decision, retry_delay_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id.to_string(),
                failure.stage.as_str(),
                failure.attempt,
                failure.class.as_str(),
                failure.error_kind,
                failure.message,
                failure.decision.as_str(),
                failure.retry_delay_ms.map(|ms| ms as i64),
                ts(&now)
            ],
        )
        .context("Failed to insert stage error")?;
        let failure_id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE stage_runs SET last_error = ?3 WHERE project_id = ?1 AND stage = ?2",
            params![id.to_string(), failure.stage.as_str(), failure.message],
        )
        .context("Failed to update stage run error")?;
        let event = self.append_event(
            &tx,
            id,
            EventKind::AttemptFailed {
                stage: failure.stage,
                attempt: failure.attempt,
                class: failure.class,
                decision: failure.decision,
                error: failure.message.clone(),
            },
        )?;
        tx.commit().context("Failed to commit stage error")?;
        self.publish(vec![event]);
        self.query_one(
            &format!("SELECT {FAILURE_COLUMNS} FROM stage_errors WHERE id = ?1"),
            params![failure_id],
            FailureRow::read,
            FailureRow::into_failure,
        )?
        .context("Stage error not found after insert")
    }

    /// Persist `stage`'s output and advance the project in one transaction.
    ///
    /// Returns `None` without writing the output if the project is no longer
    /// processing this stage (cancelled while the adapter was running).
    pub fn complete_stage(
        &self,
        id: ProjectId,
        stage: Stage,
        output: &NewMessage,
        input: Option<MessageId>,
    ) -> Result<Option<StageCompletion>> {
        let now = self.now();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let project = self
            .get_project(id)?
            .with_context(|| format!("Project {} not found", id))?;
        if project.status != ProjectStatus::Processing || project.stage != stage {
            let event = self.append_event(&tx, id, EventKind::OutputDiscarded { stage })?;
            tx.commit().context("Failed to commit discard event")?;
            self.publish(vec![event]);
            return Ok(None);
        }

        let message = self.insert_message(&tx, output)?;
        if let Some(message_id) = input {
            self.set_message_status(&tx, message_id, MessageStatus::Completed)?;
        }
        self.set_stage_run_status(&tx, id, stage, StageRunStatus::Completed, now)?;
        let mut events = vec![self.append_event(
            &tx,
            id,
            EventKind::StageCompleted {
                stage,
                message_id: message.id,
                confidence: message.confidence,
            },
        )?];
        self.advance(&tx, id, stage, now, &mut events)?;
        tx.commit().context("Failed to commit stage completion")?;
        self.publish(events);

        let project = self
            .get_project(id)?
            .context("Project not found after stage completion")?;
        Ok(Some(StageCompletion { message, project }))
    }

    fn set_stage_run_status(
        &self,
        conn: &Connection,
        id: ProjectId,
        stage: Stage,
        status: StageRunStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let completed_at = match status {
            StageRunStatus::Completed | StageRunStatus::Skipped | StageRunStatus::Failed => {
                Some(ts(&now))
            }
            StageRunStatus::Running | StageRunStatus::Suspended => None,
        };
        conn.execute(
            "INSERT INTO stage_runs (project_id, stage, attempt, status, started_at, completed_at)
             VALUES (?1, ?2, 0, ?3, ?4, ?5)
             ON CONFLICT(project_id, stage) DO UPDATE SET status = ?3, completed_at = ?5",
            params![
                id.to_string(),
                stage.as_str(),
                status.as_str(),
                ts(&now),
                completed_at
            ],
        )
        .context("Failed to update stage run status")?;
        Ok(())
    }

    pub fn stage_runs(&self, id: ProjectId) -> Result<Vec<StageRun>> {
        self.query_list(
            &format!(
                "SELECT {STAGE_RUN_COLUMNS} FROM stage_runs WHERE project_id = ?1 ORDER BY started_at"
            ),
            params![id.to_string()],
            StageRunRow::read,
            StageRunRow::into_stage_run,
        )
    }

    pub fn stage_failures(&self, id: ProjectId) -> Result<Vec<StageFailure>> {
        self.query_list(
            &format!("SELECT {FAILURE_COLUMNS} FROM stage_errors WHERE project_id = ?1 ORDER BY id"),
            params![id.to_string()],
            FailureRow::read,
            FailureRow::into_failure,
        )
    }

    /// The last recorded failure of `stage` when it closed the current
    /// attempt window with an escalate or abort decision.
    ///
    /// A project still processing the stage means the decision was never
    /// applied, for example because the process died right after recording it.
    pub fn unapplied_decision(&self, id: ProjectId, stage: Stage) -> Result<Option<StageFailure>> {
        let Some(run) = self.stage_runs(id)?.into_iter().find(|r| r.stage == stage) else {
            return Ok(None);
        };
        let last = self.query_one(
            &format!(
                "SELECT {FAILURE_COLUMNS} FROM stage_errors
                 WHERE project_id = ?1 AND stage = ?2 ORDER BY id DESC LIMIT 1"
            ),
            params![id.to_string(), stage.as_str()],
            FailureRow::read,
            FailureRow::into_failure,
        )?;
        Ok(last.filter(|f| {
            f.attempt == run.attempt
                && matches!(f.decision, DecisionKind::Escalate | DecisionKind::Abort)
        }))
    }

    // ── Messages ──────────────────────────────────────────────────────

    fn insert_message(&self, conn: &Connection, new: &NewMessage) -> Result<Message> {
        let id = MessageId::new();
        let now = self.now();
        conn.execute(
            "INSERT INTO messages
                (id, project_id, from_agent, to_agent, kind, stage, payload_json, status, confidence, attempt, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10)",
            params![
                id.to_string(),
                new.project_id.to_string(),
                new.from_agent.as_str(),
                new.to_agent.as_str(),
                new.kind.as_str(),
                new.stage.as_str(),
                new.payload.to_string(),
                MessageStatus::Pending.as_str(),
                new.confidence,
                ts(&now)
            ],
        )
        .context("Failed to insert message")?;
        Ok(Message {
            id,
            project_id: new.project_id,
            from_agent: new.from_agent,
            to_agent: new.to_agent,
            kind: new.kind,
            stage: new.stage,
            payload: new.payload.clone(),
            status: MessageStatus::Pending,
            confidence: new.confidence,
            attempt: 0,
            created_at: now,
        })
    }

    fn set_message_status(
        &self,
        conn: &Connection,
        id: MessageId,
        status: MessageStatus,
    ) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE messages SET status = ?2 WHERE id = ?1",
                params![id.to_string(), status.as_str()],
            )
            .context("Failed to update message status")?;
        Ok(changed > 0)
    }

    pub fn enqueue_message(&self, new: &NewMessage) -> Result<Message> {
        self.insert_message(&self.conn, new)
    }

    pub fn mark_message_status(&self, id: MessageId, status: MessageStatus) -> Result<bool> {
        self.set_message_status(&self.conn, id, status)
    }

    pub fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        self.query_one(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            params![id.to_string()],
            MessageRow::read,
            MessageRow::into_message,
        )
    }

    /// Pending messages addressed to `agent`, oldest first.
    pub fn pending_for(&self, agent: AgentRole) -> Result<Vec<Message>> {
        self.query_list(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE to_agent = ?1 AND status = ?2
                 ORDER BY created_at, id"
            ),
            params![agent.as_str(), MessageStatus::Pending.as_str()],
            MessageRow::read,
            MessageRow::into_message,
        )
    }

    /// Oldest unconsumed (pending or mid-processing) message for `agent`
    /// within one project.
    pub fn next_input(&self, id: ProjectId, agent: AgentRole) -> Result<Option<Message>> {
        self.query_one(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE project_id = ?1 AND to_agent = ?2 AND status IN (?3, ?4)
                 ORDER BY created_at, id
                 LIMIT 1"
            ),
            params![
                id.to_string(),
                agent.as_str(),
                MessageStatus::Pending.as_str(),
                MessageStatus::Processing.as_str()
            ],
            MessageRow::read,
            MessageRow::into_message,
        )
    }

    /// All messages of a project in log order.
    pub fn list_messages(&self, id: ProjectId, limit: Option<u32>) -> Result<Vec<Message>> {
        self.query_list(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE project_id = ?1
                 ORDER BY created_at, id
                 LIMIT ?2"
            ),
            params![id.to_string(), limit.map(i64::from).unwrap_or(-1)],
            MessageRow::read,
            MessageRow::into_message,
        )
    }

    /// Latest handoff payload of each stage before `before`, in stage order.
    pub fn stage_outputs(&self, id: ProjectId, before: Stage) -> Result<Vec<PriorOutput>> {
        let handoffs = self.query_list(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE project_id = ?1 AND kind = ?2
                 ORDER BY created_at, id"
            ),
            params![id.to_string(), MessageKind::Handoff.as_str()],
            MessageRow::read,
            MessageRow::into_message,
        )?;
        let mut latest = BTreeMap::new();
        for message in handoffs.into_iter().filter(|m| m.stage < before) {
            latest.insert(
                message.stage,
                PriorOutput {
                    stage: message.stage,
                    agent: message.from_agent,
                    payload: message.payload,
                },
            );
        }
        Ok(latest.into_values().collect())
    }

    // ── Interventions ─────────────────────────────────────────────────

    /// Create a pending request and suspend the project in one transaction.
    ///
    /// `input` is the stage's input message and the status it should be
    /// left in.
    pub fn raise_intervention(
        &self,
        new: &NewIntervention,
        input: Option<(MessageId, MessageStatus)>,
    ) -> Result<RaiseOutcome> {
        let now = self.now();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM intervention_requests WHERE project_id = ?1 AND status = ?2",
                params![
                    new.project_id.to_string(),
                    InterventionStatus::Pending.as_str()
                ],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query pending interventions")?;
        if let Some(existing) = existing {
            return Ok(RaiseOutcome::AlreadyPending(parse_id(
                &existing,
                "intervention id",
            )?));
        }
        let project = self
            .get_project(new.project_id)?
            .with_context(|| format!("Project {} not found", new.project_id))?;
        if project.status != ProjectStatus::Processing || project.stage != new.stage {
            return Ok(RaiseOutcome::Halted(project.status));
        }

        let id = RequestId::new();
        let options =
            serde_json::to_string(&new.options).context("Failed to serialize options")?;
        tx.execute(
            "INSERT INTO intervention_requests
                (id, project_id, stage, description, priority, options_json, context_json, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id.to_string(),
                new.project_id.to_string(),
                new.stage.as_str(),
                new.description,
                new.priority.as_str(),
                options,
                new.context.as_ref().map(Value::to_string),
                InterventionStatus::Pending.as_str(),
                ts(&now)
            ],
        )
        .context("Failed to insert intervention request")?;
        tx.execute(
            "UPDATE projects SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                new.project_id.to_string(),
                ProjectStatus::WaitingApproval.as_str(),
                ts(&now)
            ],
        )
        .context("Failed to suspend project")?;
        self.set_stage_run_status(&tx, new.project_id, new.stage, StageRunStatus::Suspended, now)?;
        if let Some((message_id, status)) = input {
            self.set_message_status(&tx, message_id, status)?;
        }
        let event = self.append_event(
            &tx,
            new.project_id,
            EventKind::InterventionRaised {
                request_id: id,
                stage: new.stage,
                priority: new.priority,
                description: new.description.clone(),
            },
        )?;
        tx.commit().context("Failed to commit intervention")?;
        self.publish(vec![event]);

        let request = self
            .get_intervention(id)?
            .context("Intervention not found after insert")?;
        Ok(RaiseOutcome::Raised(request))
    }

    /// Resolve a pending request exactly once and apply its effect.
    pub fn resolve_intervention(&self, plan: &ResolutionPlan) -> Result<ResolveOutcome> {
        let now = self.now();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let Some(request) = self.get_intervention(plan.request_id)? else {
            return Ok(ResolveOutcome::NotFound);
        };
        let changed = tx
            .execute(
                "UPDATE intervention_requests SET status = ?2, resolution = ?3, resolved_at = ?4
                 WHERE id = ?1 AND status = ?5",
                params![
                    plan.request_id.to_string(),
                    InterventionStatus::Resolved.as_str(),
                    plan.choice,
                    ts(&now),
                    InterventionStatus::Pending.as_str()
                ],
            )
            .context("Failed to resolve intervention")?;
        if changed == 0 {
            return Ok(ResolveOutcome::AlreadyResolved(request));
        }

        let id = request.project_id;
        let stage = request.stage;
        let message = self.insert_message(&tx, &plan.message)?;
        let mut events = vec![self.append_event(
            &tx,
            id,
            EventKind::InterventionResolved {
                request_id: request.id,
                stage,
                choice: plan.choice.clone(),
            },
        )?];

        match &plan.effect {
            ResolutionEffect::Rerun => {
                tx.execute(
                    "UPDATE projects SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = ?4",
                    params![
                        id.to_string(),
                        ProjectStatus::Processing.as_str(),
                        ts(&now),
                        ProjectStatus::WaitingApproval.as_str()
                    ],
                )
                .context("Failed to resume project")?;
                tx.execute(
                    "UPDATE stage_runs SET attempt = 0, status = ?3, last_error = NULL, completed_at = NULL
                     WHERE project_id = ?1 AND stage = ?2",
                    params![
                        id.to_string(),
                        stage.as_str(),
                        StageRunStatus::Running.as_str()
                    ],
                )
                .context("Failed to reset stage attempts")?;
                events.push(self.append_event(&tx, id, EventKind::PipelineResumed { stage })?);
            }
            ResolutionEffect::Advance => {
                self.set_stage_run_status(&tx, id, stage, StageRunStatus::Skipped, now)?;
                self.advance(&tx, id, stage, now, &mut events)?;
                if stage.next() != Stage::Completed {
                    events.push(self.append_event(
                        &tx,
                        id,
                        EventKind::PipelineResumed {
                            stage: stage.next(),
                        },
                    )?);
                }
            }
            ResolutionEffect::Abort { reason } => {
                tx.execute(
                    "UPDATE projects SET status = ?2, last_error = ?3, error_stage = ?4, updated_at = ?5
                     WHERE id = ?1",
                    params![
                        id.to_string(),
                        ProjectStatus::Error.as_str(),
                        reason,
                        stage.as_str(),
                        ts(&now)
                    ],
                )
                .context("Failed to abort project")?;
                self.set_stage_run_status(&tx, id, stage, StageRunStatus::Failed, now)?;
                events.push(self.append_event(
                    &tx,
                    id,
                    EventKind::PipelineFailed {
                        stage,
                        error: reason.clone(),
                    },
                )?);
            }
        }
        tx.commit().context("Failed to commit intervention resolution")?;
        self.publish(events);

        let request = self
            .get_intervention(plan.request_id)?
            .context("Intervention not found after resolve")?;
        let project = self
            .get_project(id)?
            .context("Project not found after resolve")?;
        Ok(ResolveOutcome::Resolved {
            request,
            project,
            message,
        })
    }

    pub fn get_intervention(&self, id: RequestId) -> Result<Option<InterventionRequest>> {
        self.query_one(
            &format!("SELECT {INTERVENTION_COLUMNS} FROM intervention_requests WHERE id = ?1"),
            params![id.to_string()],
            InterventionRow::read,
            InterventionRow::into_request,
        )
    }

    /// Pending requests, most urgent first, then oldest first.
    pub fn pending_interventions(
        &self,
        project: Option<ProjectId>,
    ) -> Result<Vec<InterventionRequest>> {
        self.query_list(
            &format!(
                "SELECT {INTERVENTION_COLUMNS} FROM intervention_requests
                 WHERE status = ?1 AND (?2 IS NULL OR project_id = ?2)
                 ORDER BY CASE priority WHEN 'high' THEN 0 WHEN 'medium' THEN 1 ELSE 2 END,
                          created_at, id"
            ),
            params![
                InterventionStatus::Pending.as_str(),
                project.map(|p| p.to_string())
            ],
            InterventionRow::read,
            InterventionRow::into_request,
        )
    }

    pub fn list_interventions(&self, id: ProjectId) -> Result<Vec<InterventionRequest>> {
        self.query_list(
            &format!(
                "SELECT {INTERVENTION_COLUMNS} FROM intervention_requests
                 WHERE project_id = ?1 ORDER BY created_at, id"
            ),
            params![id.to_string()],
            InterventionRow::read,
            InterventionRow::into_request,
        )
    }

    // ── Events ────────────────────────────────────────────────────────

    /// Events of a project in commit order, optionally after a cursor.
    pub fn list_events(&self, id: ProjectId, after: Option<i64>) -> Result<Vec<PipelineEvent>> {
        self.query_list(
            "SELECT id, project_id, event_type, payload_json, created_at FROM events
             WHERE project_id = ?1 AND id > ?2
             ORDER BY id",
            params![id.to_string(), after.unwrap_or(0)],
            EventRow::read,
            EventRow::into_event,
        )
    }

    // ── Maintenance ───────────────────────────────────────────────────

    /// Delete terminal projects last updated before `cutoff`, together with
    /// everything recorded for them.
    pub fn purge_terminal_projects(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM projects WHERE status IN (?1, ?2, ?3) AND updated_at < ?4",
                params![
                    ProjectStatus::Completed.as_str(),
                    ProjectStatus::Error.as_str(),
                    ProjectStatus::Cancelled.as_str(),
                    ts(&cutoff)
                ],
            )
            .context("Failed to purge projects")?;
        Ok(deleted)
    }

    pub fn agent_stats(&self) -> Result<Vec<AgentStats>> {
        let mut stats = Vec::new();
        for role in AgentRole::WORKERS {
            let Some(stage) = role.stage() else {
                continue;
            };
            let (completed, average): (i64, Option<f64>) = self
                .conn
                .query_row(
                    "SELECT COUNT(*) FILTER (WHERE status = ?2), AVG(attempt)
                     FROM stage_runs WHERE stage = ?1",
                    params![stage.as_str(), StageRunStatus::Completed.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .context("Failed to aggregate stage runs")?;
            let failures: i64 = self
                .conn
                .query_row(
                    "SELECT COUNT(*) FROM stage_errors WHERE stage = ?1",
                    params![stage.as_str()],
                    |row| row.get(0),
                )
                .context("Failed to count stage errors")?;
            stats.push(AgentStats {
                role,
                stages_completed: completed.max(0) as u64,
                failures: failures.max(0) as u64,
                average_attempts: average.unwrap_or(0.0),
            });
        }
        Ok(stats)
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse timestamp '{}'", s))
}

fn parse_enum<T: FromStr<Err = String>>(s: &str, what: &str) -> Result<T> {
    T::from_str(s)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to parse {}", what))
}

fn parse_id<T: FromStr<Err = uuid::Error>>(s: &str, what: &str) -> Result<T> {
    T::from_str(s).with_context(|| format!("Failed to parse {} '{}'", what, s))
}

fn parse_json(s: &str, what: &str) -> Result<Value> {
    serde_json::from_str(s).with_context(|| format!("Failed to parse {} JSON", what))
}

struct ProjectRow {
    id: String,
    name: Option<String>,
    requirement: String,
    stage: String,
    status: String,
    metadata_json: String,
    last_error: Option<String>,
    error_stage: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ProjectRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            requirement: row.get(2)?,
            stage: row.get(3)?,
            status: row.get(4)?,
            metadata_json: row.get(5)?,
            last_error: row.get(6)?,
            error_stage: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_project(self) -> Result<Project> {
        let metadata: Map<String, Value> = serde_json::from_str(&self.metadata_json)
            .context("Failed to parse project metadata JSON")?;
        Ok(Project {
            id: parse_id(&self.id, "project id")?,
            name: self.name,
            requirement: self.requirement,
            stage: parse_enum(&self.stage, "project stage")?,
            status: parse_enum(&self.status, "project status")?,
            metadata,
            last_error: self.last_error,
            error_stage: self
                .error_stage
                .as_deref()
                .map(|s| parse_enum(s, "error stage"))
                .transpose()?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct MessageRow {
    id: String,
    project_id: String,
    from_agent: String,
    to_agent: String,
    kind: String,
    stage: String,
    payload_json: String,
    status: String,
    confidence: Option<f64>,
    attempt: u32,
    created_at: String,
}

impl MessageRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            from_agent: row.get(2)?,
            to_agent: row.get(3)?,
            kind: row.get(4)?,
            stage: row.get(5)?,
            payload_json: row.get(6)?,
            status: row.get(7)?,
            confidence: row.get(8)?,
            attempt: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: parse_id(&self.id, "message id")?,
            project_id: parse_id(&self.project_id, "project id")?,
            from_agent: parse_enum(&self.from_agent, "sender")?,
            to_agent: parse_enum(&self.to_agent, "recipient")?,
            kind: parse_enum(&self.kind, "message kind")?,
            stage: parse_enum(&self.stage, "message stage")?,
            payload: parse_json(&self.payload_json, "message payload")?,
            status: parse_enum(&self.status, "message status")?,
            confidence: self.confidence,
            attempt: self.attempt,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct InterventionRow {
    id: String,
    project_id: String,
    stage: String,
    description: String,
    priority: String,
    options_json: String,
    context_json: Option<String>,
    status: String,
    resolution: Option<String>,
    created_at: String,
    resolved_at: Option<String>,
}

impl InterventionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            stage: row.get(2)?,
            description: row.get(3)?,
            priority: row.get(4)?,
            options_json: row.get(5)?,
            context_json: row.get(6)?,
            status: row.get(7)?,
            resolution: row.get(8)?,
            created_at: row.get(9)?,
            resolved_at: row.get(10)?,
        })
    }

    fn into_request(self) -> Result<InterventionRequest> {
        let options: Vec<String> = serde_json::from_str(&self.options_json)
            .context("Failed to parse intervention options JSON")?;
        let priority: Priority = parse_enum(&self.priority, "priority")?;
        Ok(InterventionRequest {
            id: parse_id(&self.id, "intervention id")?,
            project_id: parse_id(&self.project_id, "project id")?,
            stage: parse_enum(&self.stage, "intervention stage")?,
            description: self.description,
            priority,
            options,
            context: self
                .context_json
                .as_deref()
                .map(|s| parse_json(s, "intervention context"))
                .transpose()?,
            status: parse_enum(&self.status, "intervention status")?,
            resolution: self.resolution,
            created_at: parse_ts(&self.created_at)?,
            resolved_at: self.resolved_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

struct StageRunRow {
    project_id: String,
    stage: String,
    attempt: u32,
    status: String,
    last_error: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl StageRunRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            project_id: row.get(0)?,
            stage: row.get(1)?,
            attempt: row.get(2)?,
            status: row.get(3)?,
            last_error: row.get(4)?,
            started_at: row.get(5)?,
            completed_at: row.get(6)?,
        })
    }

    fn into_stage_run(self) -> Result<StageRun> {
        Ok(StageRun {
            project_id: parse_id(&self.project_id, "project id")?,
            stage: parse_enum(&self.stage, "stage")?,
            attempt: self.attempt,
            status: parse_enum(&self.status, "stage run status")?,
            last_error: self.last_error,
            started_at: parse_ts(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

struct FailureRow {
    id: i64,
    project_id: String,
    stage: String,
    attempt: u32,
    class: String,
    error_kind: String,
    message: String,
    decision: String,
    retry_delay_ms: Option<i64>,
    created_at: String,
}

impl FailureRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            stage: row.get(2)?,
            attempt: row.get(3)?,
            class: row.get(4)?,
            error_kind: row.get(5)?,
            message: row.get(6)?,
            decision: row.get(7)?,
            retry_delay_ms: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_failure(self) -> Result<StageFailure> {
        Ok(StageFailure {
            id: self.id,
            project_id: parse_id(&self.project_id, "project id")?,
            stage: parse_enum(&self.stage, "stage")?,
            attempt: self.attempt,
            class: parse_enum(&self.class, "error class")?,
            error_kind: self.error_kind,
            message: self.message,
            decision: parse_enum(&self.decision, "decision")?,
            retry_delay_ms: self.retry_delay_ms.map(|ms| ms.max(0) as u64),
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct EventRow {
    id: i64,
    project_id: String,
    event_type: String,
    payload_json: String,
    created_at: String,
}

impl EventRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            event_type: row.get(2)?,
            payload_json: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn into_event(self) -> Result<PipelineEvent> {
        let payload = parse_json(&self.payload_json, "event payload")?;
        let mut tagged = Map::new();
        tagged.insert("type".to_string(), Value::String(self.event_type));
        if !payload.is_null() {
            tagged.insert("payload".to_string(), payload);
        }
        let kind: EventKind = serde_json::from_value(Value::Object(tagged))
            .context("Failed to decode event")?;
        Ok(PipelineEvent {
            id: self.id,
            project_id: parse_id(&self.project_id, "project id")?,
            kind,
            timestamp: parse_ts(&self.created_at)?,
        })
    }
}
