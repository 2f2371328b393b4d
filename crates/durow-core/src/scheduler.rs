//! Cron schedule manager.
//!
//! Admin operations are store-backed and idempotent, each serialized by a
//! per-schedule async mutex. Firing is done by one timer task for all
//! schedules: it computes the minimum next deadline across enabled entries,
//! sleeps until that deadline, and re-plans whenever an admin operation
//! signals a change. There is no per-entry sleep loop.
//!
//! Missed deadlines (the process was down past a fire time) collapse to a
//! single recovery fire: the latest occurrence at or before now is served,
//! and the cursor advances past all the ones in between.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};

use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::models::schedule::{CreateScheduleInput, ScheduleEntry};
use crate::orchestrator::Orchestrator;
use crate::store::ScheduleStore;

/// Fallback wakeup when there is nothing to plan for.
const IDLE_WAKEUP: Duration = Duration::from_secs(60);

/// Parse a cron expression. Five-field expressions (minute-resolution, the
/// common crontab form) are accepted by normalizing to the six-field form
/// with a zero seconds column.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, EngineError> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| EngineError::BadRequest(format!("Invalid cron expression '{}': {}", expr, e)))
}

/// The latest occurrence after `cursor` that is due at `now`, if any.
/// Collapses a backlog of missed occurrences into one.
fn due_occurrence(
    schedule: &cron::Schedule,
    cursor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let mut last_due = None;
    for occurrence in schedule.after(&cursor) {
        if occurrence > now {
            break;
        }
        last_due = Some(occurrence);
    }
    last_due
}

#[derive(Clone)]
pub struct ScheduleManager {
    store: ScheduleStore,
    orchestrator: Orchestrator,
    /// Wakes the timer loop after any admin mutation.
    notify: Arc<Notify>,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ScheduleManager {
    pub fn new(store: ScheduleStore, orchestrator: Orchestrator) -> Self {
        Self {
            store,
            orchestrator,
            notify: Arc::new(Notify::new()),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn lock_for(&self, tenant_id: &str, id: &str) -> OwnedMutexGuard<()> {
        let key = format!("{}/{}", tenant_id, id);
        let lock = self
            .locks
            .lock()
            .await
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Idempotent create. Returns the entry and whether it already existed;
    /// a same-id request with a differing definition fails with
    /// `ScheduleConflict`.
    pub async fn create(
        &self,
        input: CreateScheduleInput,
    ) -> Result<(ScheduleEntry, bool), EngineError> {
        parse_cron(&input.cron_expr)?;
        let _guard = self.lock_for(&input.tenant_id, &input.id).await;
        let (entry, existed) = self.store.create(input).await?;
        if !existed {
            tracing::info!(
                "[Scheduler] Created schedule {}/{} ('{}' @ '{}')",
                entry.tenant_id,
                entry.id,
                entry.workflow_name,
                entry.cron_expr
            );
        }
        self.notify.notify_one();
        Ok((entry, existed))
    }

    pub async fn get(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<ScheduleEntry, EngineError> {
        self.store
            .get(tenant_id, id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Schedule not found: {}", id)))
    }

    pub async fn list(&self, tenant_id: &str) -> Result<Vec<ScheduleEntry>, EngineError> {
        self.store.list(tenant_id).await
    }

    pub async fn pause(&self, tenant_id: &str, id: &str) -> Result<(), EngineError> {
        let _guard = self.lock_for(tenant_id, id).await;
        self.store.set_enabled(tenant_id, id, false).await?;
        tracing::info!("[Scheduler] Paused schedule {}/{}", tenant_id, id);
        self.notify.notify_one();
        Ok(())
    }

    pub async fn unpause(&self, tenant_id: &str, id: &str) -> Result<(), EngineError> {
        let _guard = self.lock_for(tenant_id, id).await;
        self.store.set_enabled(tenant_id, id, true).await?;
        tracing::info!("[Scheduler] Unpaused schedule {}/{}", tenant_id, id);
        self.notify.notify_one();
        Ok(())
    }

    /// Fire the schedule immediately, outside its cron cadence.
    pub async fn trigger(&self, tenant_id: &str, id: &str) -> Result<String, EngineError> {
        let _guard = self.lock_for(tenant_id, id).await;
        let entry = self
            .store
            .get(tenant_id, id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Schedule not found: {}", id)))?;
        let run_id = self.fire(&entry, Utc::now()).await?;
        self.notify.notify_one();
        Ok(run_id)
    }

    pub async fn delete(&self, tenant_id: &str, id: &str) -> Result<bool, EngineError> {
        let guard = self.lock_for(tenant_id, id).await;
        let deleted = self.store.delete(tenant_id, id).await?;
        if deleted {
            tracing::info!("[Scheduler] Deleted schedule {}/{}", tenant_id, id);
        }
        drop(guard);
        // The lock entry would otherwise outlive the schedule.
        self.locks
            .lock()
            .await
            .remove(&format!("{}/{}", tenant_id, id));
        self.notify.notify_one();
        Ok(deleted)
    }

    /// Timer loop. One iteration: fire everything due, compute the minimum
    /// next deadline, sleep until it or until an admin change / cancel.
    pub async fn run_loop(&self, cancel: CancelToken) {
        tracing::info!("[Scheduler] Timer loop started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let sleep_for = match self.plan_and_fire().await {
                Ok(deadline) => deadline,
                Err(e) => {
                    tracing::error!("[Scheduler] Planning pass failed: {}", e);
                    IDLE_WAKEUP
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => break,
            }
        }
        tracing::info!("[Scheduler] Timer loop stopped");
    }

    /// Fire all due entries and return the time until the next deadline.
    async fn plan_and_fire(&self) -> Result<Duration, EngineError> {
        let now = Utc::now();
        let entries = self.store.list_enabled().await?;

        let mut next_deadline: Option<DateTime<Utc>> = None;
        let mut fold = |candidate: Option<DateTime<Utc>>| {
            if let Some(c) = candidate {
                next_deadline = Some(match next_deadline {
                    Some(d) if d <= c => d,
                    _ => c,
                });
            }
        };

        for entry in entries {
            let schedule = match parse_cron(&entry.cron_expr) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(
                        "[Scheduler] Skipping schedule {}/{}: {}",
                        entry.tenant_id,
                        entry.id,
                        e
                    );
                    continue;
                }
            };
            let cursor = entry.last_fired_at.unwrap_or(entry.created_at);

            if let Some(due) = due_occurrence(&schedule, cursor, now) {
                let _guard = self.lock_for(&entry.tenant_id, &entry.id).await;
                if let Err(e) = self.fire(&entry, due).await {
                    tracing::warn!(
                        "[Scheduler] Failed to fire schedule {}/{}: {}",
                        entry.tenant_id,
                        entry.id,
                        e
                    );
                }
                fold(schedule.after(&due).next());
            } else {
                fold(schedule.after(&cursor).next());
            }
        }

        let sleep_for = match next_deadline {
            Some(deadline) => (deadline - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO),
            None => IDLE_WAKEUP,
        };
        Ok(sleep_for)
    }

    /// Start the schedule's workflow for the occurrence at `fired_at` and
    /// stamp the cursor. The dedupe key ties the occurrence to at most one
    /// run even when several processes plan concurrently.
    async fn fire(
        &self,
        entry: &ScheduleEntry,
        fired_at: DateTime<Utc>,
    ) -> Result<String, EngineError> {
        let dedupe_key = format!(
            "sched-{}-{}-{}",
            entry.tenant_id,
            entry.id,
            fired_at.timestamp()
        );
        let input = serde_json::json!({
            "scheduleId": entry.id,
            "firedAt": fired_at.to_rfc3339(),
        });
        let handle = self
            .orchestrator
            .start_by_name(
                &entry.workflow_name,
                input,
                &entry.tenant_id,
                Some(dedupe_key),
            )
            .await?;

        if handle.already_active {
            tracing::debug!(
                "[Scheduler] Occurrence {} of {}/{} already fired (run {})",
                fired_at,
                entry.tenant_id,
                entry.id,
                handle.run_id
            );
        } else {
            tracing::info!(
                "[Scheduler] Fired schedule {}/{} -> run {}",
                entry.tenant_id,
                entry.id,
                handle.run_id
            );
        }

        self.store
            .mark_fired(&entry.tenant_id, &entry.id, fired_at, &handle.run_id)
            .await?;
        Ok(handle.run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use crate::audit::AuditRecorder;
    use crate::cancel::cancel_pair;
    use crate::config::EngineConfig;
    use crate::db::Database;
    use crate::models::definition::{StepSpec, WorkflowDefinition};
    use crate::registry::{
        CapabilityProvider, CapabilityRegistry, StepContext, StepError, StepHandler,
    };
    use crate::store::{AuditStore, RunStore};

    struct TickHandler {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl StepHandler for TickHandler {
        async fn execute(&self, _ctx: StepContext) -> Result<serde_json::Value, StepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!("tick"))
        }
    }

    struct TickProvider {
        calls: Arc<AtomicU32>,
    }

    impl CapabilityProvider for TickProvider {
        fn name(&self) -> &str {
            "tick"
        }

        fn step_handlers(&self) -> Vec<(String, Arc<dyn StepHandler>)> {
            vec![(
                "tick.run".to_string(),
                Arc::new(TickHandler {
                    calls: self.calls.clone(),
                }),
            )]
        }

        fn workflows(&self) -> Vec<WorkflowDefinition> {
            vec![WorkflowDefinition {
                name: "tick-flow".to_string(),
                version: "1.0".to_string(),
                steps: vec![StepSpec {
                    name: "tick".to_string(),
                    handler: "tick.run".to_string(),
                    retry: Default::default(),
                    timeout_ms: None,
                    params: serde_json::Value::Null,
                }],
            }]
        }
    }

    fn manager() -> (ScheduleManager, ScheduleStore, Arc<AtomicU32>) {
        let db = Database::open_in_memory().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let registry = Arc::new(CapabilityRegistry::from_providers(vec![Box::new(
            TickProvider {
                calls: calls.clone(),
            },
        )]));
        let orchestrator = Orchestrator::new(
            RunStore::new(db.clone()),
            registry,
            AuditRecorder::new(Arc::new(AuditStore::new(db.clone()))),
            EngineConfig::default(),
        );
        let store = ScheduleStore::new(db);
        (
            ScheduleManager::new(store.clone(), orchestrator),
            store,
            calls,
        )
    }

    fn input(id: &str, cron: &str) -> CreateScheduleInput {
        CreateScheduleInput {
            id: id.to_string(),
            tenant_id: "default".to_string(),
            workflow_name: "tick-flow".to_string(),
            cron_expr: cron.to_string(),
            task_queue: "default".to_string(),
            enabled: true,
        }
    }

    #[test]
    fn test_parse_cron_accepts_five_and_six_fields() {
        assert!(parse_cron("0 2 * * *").is_ok());
        assert!(parse_cron("*/5 * * * * *").is_ok());
        assert!(matches!(
            parse_cron("every tuesday"),
            Err(EngineError::BadRequest(_))
        ));
    }

    #[test]
    fn test_missed_occurrences_collapse_to_one() {
        let schedule = parse_cron("* * * * *").unwrap();
        let now = Utc::now();
        let cursor = now - ChronoDuration::minutes(10);

        let due = due_occurrence(&schedule, cursor, now).unwrap();
        assert!(due <= now);
        // The recovery fire serves the most recent deadline; everything
        // after it is in the future.
        let next = schedule.after(&due).next().unwrap();
        assert!(next > now);
    }

    #[test]
    fn test_nothing_due_before_first_occurrence() {
        let schedule = parse_cron("0 2 * * *").unwrap();
        let now = Utc::now();
        assert!(due_occurrence(&schedule, now, now).is_none());
    }

    #[tokio::test]
    async fn test_create_validates_cron() {
        let (manager, _, _) = manager();
        assert!(matches!(
            manager.create(input("bad", "not a cron")).await,
            Err(EngineError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_create_idempotent_then_conflict() {
        let (manager, _, _) = manager();
        let (_, existed) = manager.create(input("s1", "0 2 * * *")).await.unwrap();
        assert!(!existed);
        let (_, existed) = manager.create(input("s1", "0 2 * * *")).await.unwrap();
        assert!(existed);
        assert!(matches!(
            manager.create(input("s1", "0 3 * * *")).await,
            Err(EngineError::ScheduleConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_prunes_lock_entry() {
        let (manager, _, _) = manager();
        manager.create(input("s1", "0 2 * * *")).await.unwrap();
        assert!(manager.locks.lock().await.contains_key("default/s1"));

        assert!(manager.delete("default", "s1").await.unwrap());
        assert!(!manager.locks.lock().await.contains_key("default/s1"));

        // Idempotent re-delete leaves no entry behind either.
        assert!(!manager.delete("default", "s1").await.unwrap());
        assert!(!manager.locks.lock().await.contains_key("default/s1"));
    }

    #[tokio::test]
    async fn test_trigger_starts_run_and_stamps_cursor() {
        let (manager, store, calls) = manager();
        manager.create(input("s1", "0 2 * * *")).await.unwrap();

        let run_id = manager.trigger("default", "s1").await.unwrap();
        assert!(!run_id.is_empty());

        let entry = store.get("default", "s1").await.unwrap().unwrap();
        assert_eq!(entry.last_run_id.as_deref(), Some(run_id.as_str()));
        assert!(entry.last_fired_at.is_some());

        // The run actually executes.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while calls.load(Ordering::SeqCst) == 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(matches!(
            manager.trigger("default", "missing").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_loop_fires_due_schedule() {
        let (manager, store, calls) = manager();
        // Every second.
        manager.create(input("s1", "* * * * * *")).await.unwrap();

        let (handle, token) = cancel_pair();
        let loop_manager = manager.clone();
        let loop_task = tokio::spawn(async move { loop_manager.run_loop(token).await });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "schedule never fired");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let entry = store.get("default", "s1").await.unwrap().unwrap();
        assert!(entry.last_run_id.is_some());

        handle.cancel();
        loop_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_paused_schedule_does_not_fire() {
        let (manager, _, calls) = manager();
        manager.create(input("s1", "* * * * * *")).await.unwrap();
        manager.pause("default", "s1").await.unwrap();

        let (handle, token) = cancel_pair();
        let loop_manager = manager.clone();
        let loop_task = tokio::spawn(async move { loop_manager.run_loop(token).await });

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        handle.cancel();
        loop_task.await.unwrap();
    }
}
