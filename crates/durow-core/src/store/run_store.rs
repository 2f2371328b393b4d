//! Persistence for workflow runs.
//!
//! Three store-level guarantees back the orchestrator's concurrency model:
//!
//! - the partial unique index on (workflow_name, dedupe_key) keeps at most
//!   one non-terminal run per key; `create` surfaces a collision as
//!   `AlreadyActive` carrying the existing run id;
//! - `save` is an optimistic compare-and-swap on the `version` column; a
//!   lost race returns `Conflict` and the caller reloads;
//! - `acquire_lease` grants exclusive drive rights for a bounded interval,
//!   re-entrant for the current owner (renewal).

use chrono::{TimeZone, Utc};
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::definition::WorkflowDefinition;
use crate::models::run::{RunStatus, StepRecord, WorkflowRun};

const RUN_COLUMNS: &str = "id, workflow_name, tenant_id, dedupe_key, definition, status, \
     current_step, steps, input, result, last_error, parent_run_id, version, \
     lease_owner, lease_until, created_at, updated_at";

#[derive(Clone)]
pub struct RunStore {
    db: Database,
}

impl RunStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new run. A dedupe-key collision with an active run returns
    /// `AlreadyActive(existing_run_id)` instead of creating a second
    /// concurrent instance.
    pub async fn create(&self, run: &WorkflowRun) -> Result<(), EngineError> {
        let r = run.clone();
        let existing = self
            .db
            .with_conn_async(move |conn| {
                let inserted = conn.execute(
                    &format!(
                        "INSERT INTO workflow_runs ({}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                        RUN_COLUMNS
                    ),
                    rusqlite::params![
                        r.id,
                        r.workflow_name,
                        r.tenant_id,
                        r.dedupe_key,
                        serde_json::to_string(&r.definition).unwrap_or_default(),
                        r.status.as_str(),
                        r.current_step as i64,
                        serde_json::to_string(&r.steps).unwrap_or_else(|_| "[]".to_string()),
                        r.input.to_string(),
                        r.result.as_ref().map(|v| v.to_string()),
                        r.last_error,
                        r.parent_run_id,
                        r.version,
                        r.lease_owner,
                        r.lease_until.map(|t| t.timestamp_millis()),
                        r.created_at.timestamp_millis(),
                        r.updated_at.timestamp_millis(),
                    ],
                );
                match inserted {
                    Ok(_) => Ok(None),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        // Fetch the active run holding the dedupe key.
                        conn.query_row(
                            "SELECT id FROM workflow_runs \
                             WHERE workflow_name = ?1 AND dedupe_key = ?2 \
                               AND status IN ('PENDING', 'RUNNING')",
                            rusqlite::params![r.workflow_name, r.dedupe_key],
                            |row| row.get::<_, String>(0),
                        )
                        .optional()
                        .map(|id| Some(id.unwrap_or_else(|| r.id.clone())))
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;

        match existing {
            None => Ok(()),
            Some(id) => Err(EngineError::AlreadyActive(id)),
        }
    }

    pub async fn get(&self, run_id: &str) -> Result<Option<WorkflowRun>, EngineError> {
        let id = run_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM workflow_runs WHERE id = ?1", RUN_COLUMNS),
                    rusqlite::params![id],
                    row_to_run,
                )
                .optional()
            })
            .await
    }

    /// Persist the run's state, bumping its version epoch. Fails with
    /// `Conflict` when another writer advanced the run first; the caller
    /// must reload and retry against the updated state, never overwrite.
    pub async fn save(&self, run: &mut WorkflowRun) -> Result<(), EngineError> {
        run.updated_at = Utc::now();
        let r = run.clone();
        let updated = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE workflow_runs SET status=?2, current_step=?3, steps=?4, \
                     result=?5, last_error=?6, version=version+1, updated_at=?7 \
                     WHERE id=?1 AND version=?8",
                    rusqlite::params![
                        r.id,
                        r.status.as_str(),
                        r.current_step as i64,
                        serde_json::to_string(&r.steps).unwrap_or_else(|_| "[]".to_string()),
                        r.result.as_ref().map(|v| v.to_string()),
                        r.last_error,
                        r.updated_at.timestamp_millis(),
                        r.version,
                    ],
                )
            })
            .await?;

        if updated == 0 {
            return Err(EngineError::Conflict(format!(
                "Run {} was updated concurrently (version {})",
                run.id, run.version
            )));
        }
        run.version += 1;
        Ok(())
    }

    /// Try to acquire (or renew) the drive lease on a run. Exactly one
    /// caller wins while the lease is live; an expired lease is claimable.
    pub async fn acquire_lease(
        &self,
        run_id: &str,
        owner: &str,
        ttl_ms: u64,
    ) -> Result<bool, EngineError> {
        let id = run_id.to_string();
        let owner = owner.to_string();
        let now_ms = Utc::now().timestamp_millis();
        let until_ms = now_ms + ttl_ms as i64;
        let updated = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE workflow_runs SET lease_owner=?2, lease_until=?3 \
                     WHERE id=?1 AND (lease_owner IS NULL OR lease_owner=?2 \
                       OR lease_until IS NULL OR lease_until <= ?4)",
                    rusqlite::params![id, owner, until_ms, now_ms],
                )
            })
            .await?;
        Ok(updated > 0)
    }

    pub async fn release_lease(&self, run_id: &str, owner: &str) -> Result<(), EngineError> {
        let id = run_id.to_string();
        let owner = owner.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE workflow_runs SET lease_owner=NULL, lease_until=NULL \
                     WHERE id=?1 AND lease_owner=?2",
                    rusqlite::params![id, owner],
                )?;
                Ok(())
            })
            .await
    }

    /// Runs that still need driving, oldest first. Used by the resume pass
    /// at startup.
    pub async fn list_incomplete(&self) -> Result<Vec<WorkflowRun>, EngineError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM workflow_runs \
                     WHERE status IN ('PENDING', 'RUNNING') ORDER BY created_at ASC",
                    RUN_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], row_to_run)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

}

fn row_to_run(row: &rusqlite::Row<'_>) -> Result<WorkflowRun, rusqlite::Error> {
    let to_dt = |ms: Option<i64>| ms.and_then(|v| Utc.timestamp_millis_opt(v).single());

    let definition_json: String = row.get(4)?;
    let definition: WorkflowDefinition = serde_json::from_str(&definition_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e)))?;

    let status_str: String = row.get(5)?;
    let steps_json: String = row.get(7)?;
    let steps: Vec<StepRecord> = serde_json::from_str(&steps_json).unwrap_or_default();
    let input_json: String = row.get(8)?;
    let result_json: Option<String> = row.get(9)?;

    Ok(WorkflowRun {
        id: row.get(0)?,
        workflow_name: row.get(1)?,
        tenant_id: row.get(2)?,
        dedupe_key: row.get(3)?,
        definition,
        status: RunStatus::from_str(&status_str).unwrap_or(RunStatus::Failed),
        current_step: row.get::<_, i64>(6)? as u32,
        steps,
        input: serde_json::from_str(&input_json).unwrap_or(serde_json::Value::Null),
        result: result_json.and_then(|s| serde_json::from_str(&s).ok()),
        last_error: row.get(10)?,
        parent_run_id: row.get(11)?,
        version: row.get(12)?,
        lease_owner: row.get(13)?,
        lease_until: to_dt(row.get(14)?),
        created_at: to_dt(row.get(15)?).unwrap_or_else(Utc::now),
        updated_at: to_dt(row.get(16)?).unwrap_or_else(Utc::now),
    })
}
