//! Persistence for schedule entries.
//!
//! `create` is idempotent: re-issuing an identical definition returns the
//! existing row untouched, while a same-id request with a differing
//! definition is rejected. All other mutations go through targeted updates
//! so concurrent fire bookkeeping and enable toggles do not clobber each
//! other.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::schedule::{CreateScheduleInput, ScheduleEntry};

const SCHEDULE_COLUMNS: &str = "id, tenant_id, workflow_name, cron_expr, task_queue, enabled, \
     last_fired_at, last_run_id, created_at, updated_at";

enum CreateOutcome {
    Created(ScheduleEntry),
    Existing(ScheduleEntry),
    Conflict,
}

#[derive(Clone)]
pub struct ScheduleStore {
    db: Database,
}

impl ScheduleStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Idempotent create. Returns the entry and whether it already existed.
    /// A same-id request whose definition differs fails with
    /// `ScheduleConflict` instead of silently mutating the stored trigger.
    pub async fn create(
        &self,
        input: CreateScheduleInput,
    ) -> Result<(ScheduleEntry, bool), EngineError> {
        let id = input.id.clone();
        let outcome = self
            .db
            .with_conn_async(move |conn| {
                let existing = conn
                    .query_row(
                        &format!(
                            "SELECT {} FROM schedules WHERE tenant_id = ?1 AND id = ?2",
                            SCHEDULE_COLUMNS
                        ),
                        rusqlite::params![input.tenant_id, input.id],
                        row_to_schedule,
                    )
                    .optional()?;

                if let Some(entry) = existing {
                    if entry.definition_matches(&input) {
                        return Ok(CreateOutcome::Existing(entry));
                    }
                    return Ok(CreateOutcome::Conflict);
                }

                let now = Utc::now();
                let entry = ScheduleEntry {
                    id: input.id,
                    tenant_id: input.tenant_id,
                    workflow_name: input.workflow_name,
                    cron_expr: input.cron_expr,
                    task_queue: input.task_queue,
                    enabled: input.enabled,
                    last_fired_at: None,
                    last_run_id: None,
                    created_at: now,
                    updated_at: now,
                };
                conn.execute(
                    &format!(
                        "INSERT INTO schedules ({}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, ?7, ?8)",
                        SCHEDULE_COLUMNS
                    ),
                    rusqlite::params![
                        entry.id,
                        entry.tenant_id,
                        entry.workflow_name,
                        entry.cron_expr,
                        entry.task_queue,
                        entry.enabled as i64,
                        entry.created_at.timestamp_millis(),
                        entry.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(CreateOutcome::Created(entry))
            })
            .await?;

        match outcome {
            CreateOutcome::Created(entry) => Ok((entry, false)),
            CreateOutcome::Existing(entry) => Ok((entry, true)),
            CreateOutcome::Conflict => Err(EngineError::ScheduleConflict(id)),
        }
    }

    pub async fn get(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<Option<ScheduleEntry>, EngineError> {
        let tenant = tenant_id.to_string();
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM schedules WHERE tenant_id = ?1 AND id = ?2",
                        SCHEDULE_COLUMNS
                    ),
                    rusqlite::params![tenant, id],
                    row_to_schedule,
                )
                .optional()
            })
            .await
    }

    pub async fn list(&self, tenant_id: &str) -> Result<Vec<ScheduleEntry>, EngineError> {
        let tenant = tenant_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM schedules WHERE tenant_id = ?1 ORDER BY id ASC",
                    SCHEDULE_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![tenant], row_to_schedule)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Enabled schedules across all tenants. This is the wakeup loop's view.
    pub async fn list_enabled(&self) -> Result<Vec<ScheduleEntry>, EngineError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM schedules WHERE enabled = 1 ORDER BY tenant_id, id",
                    SCHEDULE_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], row_to_schedule)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Pause/unpause. Idempotent; `NotFound` if the schedule does not exist.
    pub async fn set_enabled(
        &self,
        tenant_id: &str,
        id: &str,
        enabled: bool,
    ) -> Result<(), EngineError> {
        let tenant = tenant_id.to_string();
        let sid = id.to_string();
        let updated = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE schedules SET enabled = ?3, updated_at = ?4 \
                     WHERE tenant_id = ?1 AND id = ?2",
                    rusqlite::params![
                        tenant,
                        sid,
                        enabled as i64,
                        Utc::now().timestamp_millis()
                    ],
                )
            })
            .await?;
        if updated == 0 {
            return Err(EngineError::NotFound(format!("Schedule not found: {}", id)));
        }
        Ok(())
    }

    /// Record a fire. `fired_at` is the deadline that was served, not the
    /// wall-clock moment of the insert, so catch-up fires advance the
    /// cursor correctly.
    pub async fn mark_fired(
        &self,
        tenant_id: &str,
        id: &str,
        fired_at: DateTime<Utc>,
        run_id: &str,
    ) -> Result<(), EngineError> {
        let tenant = tenant_id.to_string();
        let sid = id.to_string();
        let rid = run_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE schedules SET last_fired_at = ?3, last_run_id = ?4, updated_at = ?5 \
                     WHERE tenant_id = ?1 AND id = ?2",
                    rusqlite::params![
                        tenant,
                        sid,
                        fired_at.timestamp_millis(),
                        rid,
                        Utc::now().timestamp_millis()
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Idempotent delete: removing an absent schedule is not an error.
    pub async fn delete(&self, tenant_id: &str, id: &str) -> Result<bool, EngineError> {
        let tenant = tenant_id.to_string();
        let sid = id.to_string();
        let deleted = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "DELETE FROM schedules WHERE tenant_id = ?1 AND id = ?2",
                    rusqlite::params![tenant, sid],
                )
            })
            .await?;
        Ok(deleted > 0)
    }
}

fn row_to_schedule(row: &rusqlite::Row<'_>) -> Result<ScheduleEntry, rusqlite::Error> {
    let to_dt = |ms: Option<i64>| ms.and_then(|v| Utc.timestamp_millis_opt(v).single());

    Ok(ScheduleEntry {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        workflow_name: row.get(2)?,
        cron_expr: row.get(3)?,
        task_queue: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        last_fired_at: to_dt(row.get(6)?),
        last_run_id: row.get(7)?,
        created_at: to_dt(row.get(8)?).unwrap_or_else(Utc::now),
        updated_at: to_dt(row.get(9)?).unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(id: &str, cron: &str) -> CreateScheduleInput {
        CreateScheduleInput {
            id: id.to_string(),
            tenant_id: "default".to_string(),
            workflow_name: "nightly-report".to_string(),
            cron_expr: cron.to_string(),
            task_queue: "default".to_string(),
            enabled: true,
        }
    }

    fn store() -> ScheduleStore {
        ScheduleStore::new(Database::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = store();
        let (first, existed) = store.create(input("s1", "0 2 * * *")).await.unwrap();
        assert!(!existed);

        let (second, existed) = store.create(input("s1", "0 2 * * *")).await.unwrap();
        assert!(existed);
        assert_eq!(second.created_at, first.created_at);
    }

    #[tokio::test]
    async fn test_create_conflict_on_differing_definition() {
        let store = store();
        store.create(input("s1", "0 2 * * *")).await.unwrap();

        match store.create(input("s1", "0 3 * * *")).await {
            Err(EngineError::ScheduleConflict(id)) => assert_eq!(id, "s1"),
            other => panic!("expected ScheduleConflict, got {:?}", other.map(|_| ())),
        }

        // The stored definition is untouched.
        let entry = store.get("default", "s1").await.unwrap().unwrap();
        assert_eq!(entry.cron_expr, "0 2 * * *");
    }

    #[tokio::test]
    async fn test_tenant_scoping() {
        let store = store();
        store.create(input("s1", "0 2 * * *")).await.unwrap();

        let mut other = input("s1", "0 2 * * *");
        other.tenant_id = "acme".to_string();
        // Same id under another tenant is a distinct schedule.
        let (_, existed) = store.create(other).await.unwrap();
        assert!(!existed);

        assert_eq!(store.list("default").await.unwrap().len(), 1);
        assert_eq!(store.list("acme").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pause_and_enabled_listing() {
        let store = store();
        store.create(input("s1", "0 2 * * *")).await.unwrap();
        store.create(input("s2", "0 4 * * *")).await.unwrap();

        store.set_enabled("default", "s1", false).await.unwrap();
        // Pausing twice is fine.
        store.set_enabled("default", "s1", false).await.unwrap();

        let enabled = store.list_enabled().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "s2");

        assert!(matches!(
            store.set_enabled("default", "missing", false).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_fired_advances_cursor() {
        let store = store();
        store.create(input("s1", "0 2 * * *")).await.unwrap();

        let fired = Utc::now();
        store.mark_fired("default", "s1", fired, "run-9").await.unwrap();

        let entry = store.get("default", "s1").await.unwrap().unwrap();
        assert_eq!(
            entry.last_fired_at.map(|t| t.timestamp_millis()),
            Some(fired.timestamp_millis())
        );
        assert_eq!(entry.last_run_id.as_deref(), Some("run-9"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = store();
        store.create(input("s1", "0 2 * * *")).await.unwrap();

        assert!(store.delete("default", "s1").await.unwrap());
        assert!(!store.delete("default", "s1").await.unwrap());
        assert!(store.get("default", "s1").await.unwrap().is_none());
    }
}
