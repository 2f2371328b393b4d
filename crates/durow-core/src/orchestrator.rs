//! Workflow orchestrator: durable, resumable execution of step sequences.
//!
//! Every run is driven by a dedicated tokio task that holds the run's lease
//! for the duration. The driver executes steps strictly in order and
//! persists the step record (a version-checked save) before advancing, so a
//! crash at any point resumes at the first incomplete step and never
//! re-executes a completed one. The in-flight step at crash time is the one
//! exception: it re-runs, which is why handlers must tolerate a repeat
//! attempt.
//!
//! Retries follow the step's policy, or the engine's configured default for
//! steps that specify none: transient failures back off exponentially up to
//! `max_attempts`, permanent failures (and exhaustion) fail the run.
//! Cancellation arrives through a watch token observed at every suspension
//! point and forwarded into sandbox executions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::audit::AuditRecorder;
use crate::cancel::{cancel_pair, CancelHandle, CancelToken};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::audit::AuditRecord;
use crate::models::definition::{StepSpec, WorkflowDefinition};
use crate::models::run::{RunHandle, RunStatus, RunStatusView, StepRecord, WorkflowRun};
use crate::registry::{CapabilityRegistry, RunSpawner, StepContext, StepError};
use crate::store::RunStore;

/// Outcome of one step attempt, after timeout handling.
enum AttemptOutcome {
    Success(serde_json::Value),
    Transient(String),
    Permanent(String),
}

/// What the driver does after one step cycle.
enum StepProgress {
    /// Step persisted; move on to the next one.
    Advanced,
    /// The run reached a terminal status, here or concurrently.
    Stopped,
    /// The lease moved to another worker; leave the run untouched.
    LeaseLost,
}

#[derive(Clone)]
pub struct Orchestrator {
    store: RunStore,
    registry: Arc<CapabilityRegistry>,
    audit: AuditRecorder,
    config: EngineConfig,
    /// Cancel handles of drivers running in this process.
    drivers: Arc<RwLock<HashMap<String, CancelHandle>>>,
}

impl Orchestrator {
    pub fn new(
        store: RunStore,
        registry: Arc<CapabilityRegistry>,
        audit: AuditRecorder,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            audit,
            config,
            drivers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start a new run of the given definition. A dedupe-key collision with
    /// an active run returns that run's handle with `already_active` set
    /// instead of creating a duplicate.
    pub async fn start_workflow(
        &self,
        definition: WorkflowDefinition,
        input: serde_json::Value,
        tenant_id: &str,
        dedupe_key: Option<String>,
    ) -> Result<RunHandle, EngineError> {
        definition.validate()?;
        self.registry.check_definition(&definition)?;

        let run = WorkflowRun::new(definition, input, tenant_id.to_string(), dedupe_key, None);
        match self.store.create(&run).await {
            Ok(()) => {}
            Err(EngineError::AlreadyActive(existing_id)) => {
                let status = self
                    .store
                    .get(&existing_id)
                    .await?
                    .map(|r| r.status)
                    .unwrap_or(RunStatus::Pending);
                tracing::info!(
                    "[Orchestrator] Start of '{}' joined active run {}",
                    run.workflow_name,
                    existing_id
                );
                return Ok(RunHandle {
                    run_id: existing_id,
                    status,
                    already_active: true,
                });
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            "[Orchestrator] Starting run {} ({} steps) for workflow '{}'",
            run.id,
            run.definition.steps.len(),
            run.workflow_name
        );
        let run_id = run.id.clone();
        self.spawn_driver(run_id.clone()).await;

        Ok(RunHandle {
            run_id,
            status: RunStatus::Pending,
            already_active: false,
        })
    }

    /// Start a workflow registered in the capability registry by name.
    pub async fn start_by_name(
        &self,
        workflow_name: &str,
        input: serde_json::Value,
        tenant_id: &str,
        dedupe_key: Option<String>,
    ) -> Result<RunHandle, EngineError> {
        let definition = self
            .registry
            .workflow(workflow_name)
            .cloned()
            .ok_or_else(|| {
                EngineError::NotFound(format!("Workflow not registered: {}", workflow_name))
            })?;
        self.start_workflow(definition, input, tenant_id, dedupe_key)
            .await
    }

    pub async fn get_status(&self, run_id: &str) -> Result<RunStatusView, EngineError> {
        let run = self
            .store
            .get(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Run not found: {}", run_id)))?;
        Ok(RunStatusView::from_run(&run))
    }

    /// Request cancellation. With an active local driver the token is
    /// signalled and the driver finalizes the run; otherwise the run is
    /// finalized directly. Idempotent for terminal runs.
    pub async fn cancel(&self, run_id: &str) -> Result<(), EngineError> {
        let mut run = self
            .store
            .get(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Run not found: {}", run_id)))?;

        let handle = self.drivers.read().await.get(run_id).cloned();
        if let Some(handle) = handle {
            tracing::info!("[Orchestrator] Cancelling run {}", run_id);
            handle.cancel();
            return Ok(());
        }

        if run.status.is_terminal() {
            return Ok(());
        }
        run.status = RunStatus::Cancelled;
        run.last_error = Some("Cancelled".to_string());
        self.persist(&mut run).await?;
        Ok(())
    }

    /// Boot-time recovery: spawn drivers for every non-terminal run. The
    /// lease arbitrates if another worker already picked one up.
    pub async fn resume_incomplete(&self) -> Result<usize, EngineError> {
        let incomplete = self.store.list_incomplete().await?;
        let count = incomplete.len();
        if count > 0 {
            tracing::info!("[Orchestrator] Resuming {} incomplete run(s)", count);
        }
        for run in incomplete {
            self.spawn_driver(run.id).await;
        }
        Ok(count)
    }

    /// Poll until the run reaches a terminal status or `max_wait` elapses.
    pub async fn wait_for_terminal(
        &self,
        run_id: &str,
        max_wait: Duration,
    ) -> Result<WorkflowRun, EngineError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let run = self
                .store
                .get(run_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("Run not found: {}", run_id)))?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Internal(format!(
                    "Run {} still {} after {:?}",
                    run_id,
                    run.status.as_str(),
                    max_wait
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    // ───────────────────────────── driver ─────────────────────────────

    async fn spawn_driver(&self, run_id: String) {
        let (handle, token) = cancel_pair();
        self.drivers.write().await.insert(run_id.clone(), handle);
        let orch = self.clone();
        tokio::spawn(async move {
            if let Err(e) = orch.drive(&run_id, token).await {
                tracing::error!("[Orchestrator] Driver for run {} failed: {}", run_id, e);
            }
            orch.drivers.write().await.remove(&run_id);
        });
    }

    async fn drive(&self, run_id: &str, cancel: CancelToken) -> Result<(), EngineError> {
        let owner = self.config.worker_id.clone();
        let ttl = self.config.lease_ttl_ms;
        if !self.store.acquire_lease(run_id, &owner, ttl).await? {
            tracing::debug!("[Orchestrator] Run {} is leased elsewhere, skipping", run_id);
            return Ok(());
        }

        let mut run = match self.store.get(run_id).await? {
            Some(run) if !run.status.is_terminal() => run,
            _ => {
                self.store.release_lease(run_id, &owner).await?;
                return Ok(());
            }
        };

        if run.status == RunStatus::Pending {
            run.status = RunStatus::Running;
            if !self.persist(&mut run).await? {
                self.store.release_lease(run_id, &owner).await?;
                return Ok(());
            }
        }

        while (run.current_step as usize) < run.definition.steps.len() {
            if cancel.is_cancelled() {
                self.finalize_cancelled(&mut run).await?;
                break;
            }
            // Renew for the next step; losing the lease means another
            // worker took the run over.
            if !self.store.acquire_lease(run_id, &owner, ttl).await? {
                tracing::warn!("[Orchestrator] Lost lease on run {}, stopping driver", run_id);
                return Ok(());
            }

            let step = run.definition.steps[run.current_step as usize].clone();
            match self.execute_step(&mut run, &step, &cancel).await? {
                StepProgress::Advanced => {}
                StepProgress::Stopped => break,
                StepProgress::LeaseLost => {
                    tracing::warn!(
                        "[Orchestrator] Lost lease on run {}, stopping driver",
                        run_id
                    );
                    return Ok(());
                }
            }
        }

        if !run.status.is_terminal() {
            run.status = RunStatus::Completed;
            run.result = run.steps.last().and_then(|s| s.output.clone());
            self.persist(&mut run).await?;
            tracing::info!(
                "[Orchestrator] Run {} completed ({} steps)",
                run.id,
                run.steps.len()
            );
        }

        self.store.release_lease(run_id, &owner).await?;
        Ok(())
    }

    /// Run one step to success or terminal failure.
    async fn execute_step(
        &self,
        run: &mut WorkflowRun,
        step: &StepSpec,
        cancel: &CancelToken,
    ) -> Result<StepProgress, EngineError> {
        let handler = match self.registry.handler(&step.handler) {
            Some(handler) => handler,
            None => {
                return self
                    .finalize_failed(
                        run,
                        step,
                        1,
                        format!("Unknown handler: {}", step.handler),
                    )
                    .await;
            }
        };

        let timeout = Duration::from_millis(
            step.timeout_ms.unwrap_or(self.config.default_step_timeout_ms),
        );
        let retry = step
            .retry
            .unwrap_or_else(|| self.config.default_retry_policy());
        let started_at = Utc::now();
        let prior_outputs: HashMap<String, serde_json::Value> = run
            .steps
            .iter()
            .filter_map(|s| s.output.clone().map(|o| (s.name.clone(), o)))
            .collect();

        for attempt in 1..=retry.max_attempts {
            let ctx = StepContext::new(
                run.id.clone(),
                run.tenant_id.clone(),
                step.name.clone(),
                attempt,
                run.input.clone(),
                step.params.clone(),
                prior_outputs.clone(),
                cancel.clone(),
                Arc::new(self.clone()),
            );

            let outcome = match tokio::time::timeout(timeout, handler.execute(ctx)).await {
                Ok(Ok(output)) => AttemptOutcome::Success(output),
                Ok(Err(StepError::Transient(msg))) => AttemptOutcome::Transient(msg),
                Ok(Err(StepError::Permanent(msg))) => AttemptOutcome::Permanent(msg),
                Err(_) => AttemptOutcome::Transient(format!(
                    "Attempt timed out after {}ms",
                    timeout.as_millis()
                )),
            };

            // A failure that arrives after the token fired is the forced
            // abort itself (the sandbox hard-kill), not a step outcome.
            if !matches!(outcome, AttemptOutcome::Success(_)) && cancel.is_cancelled() {
                self.audit
                    .record(AuditRecord::new(&run.id, &step.name, attempt, "cancelled"))
                    .await;
                self.finalize_cancelled(run).await?;
                return Ok(StepProgress::Stopped);
            }

            match outcome {
                AttemptOutcome::Success(output) => {
                    self.audit
                        .record(AuditRecord::new(&run.id, &step.name, attempt, "completed"))
                        .await;
                    run.steps.push(StepRecord {
                        step_index: run.current_step,
                        name: step.name.clone(),
                        attempts: attempt,
                        output: Some(output),
                        error: None,
                        started_at,
                        finished_at: Utc::now(),
                    });
                    run.current_step += 1;
                    run.last_error = None;
                    // Persistence point: the step is durable before the
                    // driver moves on.
                    return Ok(if self.persist(run).await? {
                        StepProgress::Advanced
                    } else {
                        StepProgress::Stopped
                    });
                }
                AttemptOutcome::Permanent(msg) => {
                    self.audit
                        .record(
                            AuditRecord::new(&run.id, &step.name, attempt, "failed")
                                .with_detail(serde_json::json!({"error": msg})),
                        )
                        .await;
                    return self.finalize_failed(run, step, attempt, msg).await;
                }
                AttemptOutcome::Transient(msg) => {
                    self.audit
                        .record(
                            AuditRecord::new(&run.id, &step.name, attempt, "failed")
                                .with_detail(serde_json::json!({"error": msg, "transient": true})),
                        )
                        .await;

                    if attempt == retry.max_attempts {
                        // Exhaustion converts to a permanent failure.
                        return self
                            .finalize_failed(
                                run,
                                step,
                                attempt,
                                format!("Retries exhausted ({} attempts): {}", attempt, msg),
                            )
                            .await;
                    }

                    let delay = retry.delay_before_retry(attempt);
                    tracing::debug!(
                        "[Orchestrator] Run {} step '{}' attempt {} failed, retrying in {:?}",
                        run.id,
                        step.name,
                        attempt,
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            self.finalize_cancelled(run).await?;
                            return Ok(StepProgress::Stopped);
                        }
                    }
                    // The backoff can outlast the lease TTL. Re-claim before
                    // the next attempt; a failed claim means another worker
                    // took the run over while we slept.
                    if !self
                        .store
                        .acquire_lease(&run.id, &self.config.worker_id, self.config.lease_ttl_ms)
                        .await?
                    {
                        return Ok(StepProgress::LeaseLost);
                    }
                }
            }
        }
        Ok(StepProgress::Stopped)
    }

    async fn finalize_failed(
        &self,
        run: &mut WorkflowRun,
        step: &StepSpec,
        attempts: u32,
        error: String,
    ) -> Result<StepProgress, EngineError> {
        tracing::warn!(
            "[Orchestrator] Run {} failed at step '{}': {}",
            run.id,
            step.name,
            error
        );
        run.steps.push(StepRecord {
            step_index: run.current_step,
            name: step.name.clone(),
            attempts,
            output: None,
            error: Some(error.clone()),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        });
        run.status = RunStatus::Failed;
        run.last_error = Some(error);
        self.persist(run).await?;
        Ok(StepProgress::Stopped)
    }

    async fn finalize_cancelled(&self, run: &mut WorkflowRun) -> Result<(), EngineError> {
        tracing::info!("[Orchestrator] Run {} cancelled", run.id);
        run.status = RunStatus::Cancelled;
        run.last_error = Some("Cancelled".to_string());
        self.persist(run).await?;
        Ok(())
    }

    /// Version-checked save. On a conflict the driver reloads; if a
    /// concurrent writer already finalized the run it backs off entirely
    /// (returns false), otherwise it adopts the new version and retries.
    async fn persist(&self, run: &mut WorkflowRun) -> Result<bool, EngineError> {
        for _ in 0..3 {
            match self.store.save(run).await {
                Ok(()) => return Ok(true),
                Err(EngineError::Conflict(_)) => {
                    let fresh = self.store.get(&run.id).await?.ok_or_else(|| {
                        EngineError::NotFound(format!("Run disappeared: {}", run.id))
                    })?;
                    if fresh.status.is_terminal() {
                        tracing::debug!(
                            "[Orchestrator] Run {} finalized concurrently, backing off",
                            run.id
                        );
                        return Ok(false);
                    }
                    run.version = fresh.version;
                }
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::Conflict(format!(
            "Run {} kept conflicting on save",
            run.id
        )))
    }
}

#[async_trait]
impl RunSpawner for Orchestrator {
    /// Durably record and start a child run linked to its parent. The
    /// parent's step completes as soon as the child is recorded.
    async fn spawn_child(
        &self,
        parent_run_id: &str,
        tenant_id: &str,
        definition: WorkflowDefinition,
        input: serde_json::Value,
    ) -> Result<String, EngineError> {
        definition.validate()?;
        self.registry.check_definition(&definition)?;

        let run = WorkflowRun::new(
            definition,
            input,
            tenant_id.to_string(),
            None,
            Some(parent_run_id.to_string()),
        );
        self.store.create(&run).await?;
        tracing::info!(
            "[Orchestrator] Run {} spawned child {} ('{}')",
            parent_run_id,
            run.id,
            run.workflow_name
        );
        let run_id = run.id.clone();
        self.spawn_driver(run_id.clone()).await;
        Ok(run_id)
    }

    async fn run_status(&self, run_id: &str) -> Result<RunStatusView, EngineError> {
        self.get_status(run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::db::Database;
    use crate::models::definition::RetryPolicy;
    use crate::registry::StepHandler;
    use crate::store::AuditStore;

    struct CountingHandler {
        calls: Arc<AtomicU32>,
        /// Failures before the first success; u32::MAX fails forever.
        fail_times: u32,
        permanent: bool,
    }

    #[async_trait]
    impl StepHandler for CountingHandler {
        async fn execute(&self, _ctx: StepContext) -> Result<serde_json::Value, StepError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_times {
                if self.permanent {
                    return Err(StepError::Permanent("no good".to_string()));
                }
                return Err(StepError::Transient("flaky".to_string()));
            }
            Ok(serde_json::json!({"call": call}))
        }
    }

    struct SleepHandler {
        sleep_ms: u64,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl StepHandler for SleepHandler {
        async fn execute(&self, _ctx: StepContext) -> Result<serde_json::Value, StepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.sleep_ms)).await;
            Ok(serde_json::json!("slept"))
        }
    }

    struct SpawnChildHandler {
        child: WorkflowDefinition,
    }

    #[async_trait]
    impl StepHandler for SpawnChildHandler {
        async fn execute(&self, ctx: StepContext) -> Result<serde_json::Value, StepError> {
            let child_id = ctx
                .spawn_child(self.child.clone(), serde_json::json!({}))
                .await
                .map_err(|e| StepError::Permanent(e.to_string()))?;
            Ok(serde_json::json!({"childRunId": child_id}))
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        store: RunStore,
        audit_store: Arc<AuditStore>,
        registry: Arc<CapabilityRegistry>,
    }

    fn harness(handlers: Vec<(&str, Arc<dyn StepHandler>)>) -> Harness {
        harness_with_config(handlers, EngineConfig::default())
    }

    fn harness_with_config(
        handlers: Vec<(&str, Arc<dyn StepHandler>)>,
        config: EngineConfig,
    ) -> Harness {
        let db = Database::open_in_memory().unwrap();
        let store = RunStore::new(db.clone());
        let audit_store = Arc::new(AuditStore::new(db));
        let mut registry = CapabilityRegistry::from_providers(vec![]);
        for (name, handler) in handlers {
            registry.register_handler(name, handler);
        }
        let registry = Arc::new(registry);
        let orchestrator = Orchestrator::new(
            store.clone(),
            registry.clone(),
            AuditRecorder::new(audit_store.clone()),
            config,
        );
        Harness {
            orchestrator,
            store,
            audit_store,
            registry,
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 100,
        }
    }

    fn one_step(handler: &str, retry: RetryPolicy, timeout_ms: Option<u64>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "test-flow".to_string(),
            version: "1.0".to_string(),
            steps: vec![StepSpec {
                name: "s1".to_string(),
                handler: handler.to_string(),
                retry: Some(retry),
                timeout_ms,
                params: serde_json::Value::Null,
            }],
        }
    }

    #[tokio::test]
    async fn test_single_step_run_completes() {
        let calls = Arc::new(AtomicU32::new(0));
        let h = harness(vec![(
            "ok",
            Arc::new(CountingHandler {
                calls: calls.clone(),
                fail_times: 0,
                permanent: false,
            }),
        )]);

        let handle = h
            .orchestrator
            .start_workflow(
                one_step("ok", fast_retry(3), None),
                serde_json::json!({"x": 1}),
                "default",
                None,
            )
            .await
            .unwrap();
        assert!(!handle.already_active);

        let run = h
            .orchestrator
            .wait_for_terminal(&handle.run_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.steps.len(), 1);
        assert_eq!(run.steps[0].attempts, 1);
        assert_eq!(run.result.as_ref().unwrap()["call"], 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_exhaustion_makes_exactly_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let h = harness(vec![(
            "always-fails",
            Arc::new(CountingHandler {
                calls: calls.clone(),
                fail_times: u32::MAX,
                permanent: false,
            }),
        )]);

        let started = std::time::Instant::now();
        let handle = h
            .orchestrator
            .start_workflow(
                one_step("always-fails", fast_retry(3), None),
                serde_json::json!(null),
                "default",
                None,
            )
            .await
            .unwrap();
        let run = h
            .orchestrator
            .wait_for_terminal(&handle.run_id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(run.last_error.as_ref().unwrap().contains("exhausted"));
        // Two backoffs happened: 10ms then 20ms.
        assert!(started.elapsed() >= Duration::from_millis(30));

        let records = h.audit_store.query_by_run(&handle.run_id).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records.iter().map(|r| r.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(records.iter().all(|r| r.outcome == "failed"));
    }

    #[tokio::test]
    async fn test_configured_retry_default_applies_to_steps_without_policy() {
        let calls = Arc::new(AtomicU32::new(0));
        let h = harness_with_config(
            vec![(
                "always-fails",
                Arc::new(CountingHandler {
                    calls: calls.clone(),
                    fail_times: u32::MAX,
                    permanent: false,
                }),
            )],
            EngineConfig {
                retry_max_attempts: 2,
                retry_base_delay_ms: 10,
                ..EngineConfig::default()
            },
        );

        // The step carries no policy of its own.
        let def = WorkflowDefinition {
            name: "test-flow".to_string(),
            version: "1.0".to_string(),
            steps: vec![StepSpec {
                name: "s1".to_string(),
                handler: "always-fails".to_string(),
                retry: None,
                timeout_ms: None,
                params: serde_json::Value::Null,
            }],
        };
        let handle = h
            .orchestrator
            .start_workflow(def, serde_json::json!(null), "default", None)
            .await
            .unwrap();
        let run = h
            .orchestrator
            .wait_for_terminal(&handle.run_id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_backoff_past_lease_expiry_yields_to_new_owner() {
        let calls = Arc::new(AtomicU32::new(0));
        let h = harness_with_config(
            vec![(
                "always-fails",
                Arc::new(CountingHandler {
                    calls: calls.clone(),
                    fail_times: u32::MAX,
                    permanent: false,
                }),
            )],
            EngineConfig {
                lease_ttl_ms: 50,
                ..EngineConfig::default()
            },
        );

        // Backoff (400ms) deliberately outlasts the 50ms lease TTL.
        let retry = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 400,
            multiplier: 1.0,
            max_delay_ms: 400,
        };
        let handle = h
            .orchestrator
            .start_workflow(
                one_step("always-fails", retry, None),
                serde_json::json!(null),
                "default",
                None,
            )
            .await
            .unwrap();

        // First attempt fails immediately; the driver enters its backoff.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Another worker claims the now-expired lease mid-backoff.
        assert!(h
            .store
            .acquire_lease(&handle.run_id, "other-worker", 60_000)
            .await
            .unwrap());

        // The original driver wakes, fails to re-claim, and never invokes
        // the handler again; the run is left to the new owner.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let run = h.store.get(&handle.run_id).await.unwrap().unwrap();
        assert!(!run.status.is_terminal());
        assert_eq!(run.lease_owner.as_deref(), Some("other-worker"));
    }

    #[tokio::test]
    async fn test_flaky_step_succeeds_within_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let h = harness(vec![(
            "flaky",
            Arc::new(CountingHandler {
                calls: calls.clone(),
                fail_times: 2,
                permanent: false,
            }),
        )]);

        let handle = h
            .orchestrator
            .start_workflow(
                one_step("flaky", fast_retry(3), None),
                serde_json::json!(null),
                "default",
                None,
            )
            .await
            .unwrap();
        let run = h
            .orchestrator
            .wait_for_terminal(&handle.run_id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.steps[0].attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let h = harness(vec![(
            "broken",
            Arc::new(CountingHandler {
                calls: calls.clone(),
                fail_times: u32::MAX,
                permanent: true,
            }),
        )]);

        let handle = h
            .orchestrator
            .start_workflow(
                one_step("broken", fast_retry(3), None),
                serde_json::json!(null),
                "default",
                None,
            )
            .await
            .unwrap();
        let run = h
            .orchestrator
            .wait_for_terminal(&handle.run_id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let h = harness(vec![(
            "slow",
            Arc::new(SleepHandler {
                sleep_ms: 200,
                calls: calls.clone(),
            }),
        )]);

        let handle = h
            .orchestrator
            .start_workflow(
                one_step("slow", fast_retry(2), Some(50)),
                serde_json::json!(null),
                "default",
                None,
            )
            .await
            .unwrap();
        let run = h
            .orchestrator
            .wait_for_terminal(&handle.run_id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(run.last_error.as_ref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_dedupe_key_joins_active_run() {
        let calls = Arc::new(AtomicU32::new(0));
        let h = harness(vec![(
            "slow",
            Arc::new(SleepHandler {
                sleep_ms: 300,
                calls: calls.clone(),
            }),
        )]);
        let def = one_step("slow", fast_retry(1), None);

        let first = h
            .orchestrator
            .start_workflow(
                def.clone(),
                serde_json::json!(null),
                "default",
                Some("import-2026-08".to_string()),
            )
            .await
            .unwrap();
        let second = h
            .orchestrator
            .start_workflow(
                def,
                serde_json::json!(null),
                "default",
                Some("import-2026-08".to_string()),
            )
            .await
            .unwrap();

        assert!(!first.already_active);
        assert!(second.already_active);
        assert_eq!(second.run_id, first.run_id);

        let run = h
            .orchestrator
            .wait_for_terminal(&first.run_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        // Only one driver ever ran the step.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resume_skips_completed_steps() {
        let first_calls = Arc::new(AtomicU32::new(0));
        let second_calls = Arc::new(AtomicU32::new(0));
        let h = harness(vec![
            (
                "first",
                Arc::new(CountingHandler {
                    calls: first_calls.clone(),
                    fail_times: 0,
                    permanent: false,
                }) as Arc<dyn StepHandler>,
            ),
            (
                "second",
                Arc::new(CountingHandler {
                    calls: second_calls.clone(),
                    fail_times: 0,
                    permanent: false,
                }),
            ),
        ]);

        let def = WorkflowDefinition {
            name: "two-step".to_string(),
            version: "1.0".to_string(),
            steps: vec![
                StepSpec {
                    name: "a".to_string(),
                    handler: "first".to_string(),
                    retry: Some(fast_retry(1)),
                    timeout_ms: None,
                    params: serde_json::Value::Null,
                },
                StepSpec {
                    name: "b".to_string(),
                    handler: "second".to_string(),
                    retry: Some(fast_retry(1)),
                    timeout_ms: None,
                    params: serde_json::Value::Null,
                },
            ],
        };

        // Simulate a crash after step "a" was persisted: the run is mid-
        // flight on disk with no driver attached.
        let mut run = WorkflowRun::new(def, serde_json::json!(null), "default".to_string(), None, None);
        run.status = RunStatus::Running;
        run.current_step = 1;
        run.steps.push(StepRecord {
            step_index: 0,
            name: "a".to_string(),
            attempts: 1,
            output: Some(serde_json::json!({"call": 1})),
            error: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        });
        let run_id = run.id.clone();
        h.store.create(&run).await.unwrap();

        let resumed = h.orchestrator.resume_incomplete().await.unwrap();
        assert_eq!(resumed, 1);

        let run = h
            .orchestrator
            .wait_for_terminal(&run_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.steps.len(), 2);
        // Step "a" was already durable; only "b" executed.
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let h = harness(vec![(
            "always-fails",
            Arc::new(CountingHandler {
                calls: calls.clone(),
                fail_times: u32::MAX,
                permanent: false,
            }),
        )]);

        let retry = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 10_000,
        };
        let handle = h
            .orchestrator
            .start_workflow(
                one_step("always-fails", retry, None),
                serde_json::json!(null),
                "default",
                None,
            )
            .await
            .unwrap();

        // Let the first attempt fail and the driver enter its backoff.
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.orchestrator.cancel(&handle.run_id).await.unwrap();

        let started = std::time::Instant::now();
        let run = h
            .orchestrator
            .wait_for_terminal(&handle.run_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        // Cancellation interrupted the 2s backoff instead of waiting it out.
        assert!(started.elapsed() < Duration::from_millis(1_500));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_without_driver_finalizes() {
        let h = harness(vec![]);

        // A run persisted by some other process, no local driver.
        let run = WorkflowRun::new(
            one_step("x", fast_retry(1), None),
            serde_json::json!(null),
            "default".to_string(),
            None,
            None,
        );
        h.store.create(&run).await.unwrap();

        h.orchestrator.cancel(&run.id).await.unwrap();
        let fresh = h.store.get(&run.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, RunStatus::Cancelled);
        // Idempotent on terminal runs.
        h.orchestrator.cancel(&run.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_not_found() {
        let h = harness(vec![]);
        assert!(matches!(
            h.orchestrator.get_status("no-such-run").await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            h.orchestrator.cancel("no-such-run").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_handler_rejected_at_start() {
        let h = harness(vec![]);
        let err = h
            .orchestrator
            .start_workflow(
                one_step("nowhere", fast_retry(1), None),
                serde_json::json!(null),
                "default",
                None,
            )
            .await;
        assert!(matches!(err, Err(EngineError::BadRequest(_))));
        assert!(h.registry.handler("nowhere").is_none());
    }

    #[tokio::test]
    async fn test_child_workflow_spawn() {
        let child_calls = Arc::new(AtomicU32::new(0));
        let child_def = one_step("child-step", fast_retry(1), None);
        let h = harness(vec![
            (
                "spawner",
                Arc::new(SpawnChildHandler {
                    child: child_def,
                }) as Arc<dyn StepHandler>,
            ),
            (
                "child-step",
                Arc::new(CountingHandler {
                    calls: child_calls.clone(),
                    fail_times: 0,
                    permanent: false,
                }),
            ),
        ]);

        let handle = h
            .orchestrator
            .start_workflow(
                one_step("spawner", fast_retry(1), None),
                serde_json::json!(null),
                "default",
                None,
            )
            .await
            .unwrap();
        let parent = h
            .orchestrator
            .wait_for_terminal(&handle.run_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(parent.status, RunStatus::Completed);

        let child_id = parent.result.as_ref().unwrap()["childRunId"]
            .as_str()
            .unwrap()
            .to_string();
        let child = h
            .orchestrator
            .wait_for_terminal(&child_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(child.status, RunStatus::Completed);
        assert_eq!(child.parent_run_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(child_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_prior_outputs_flow_downstream() {
        struct EchoPrior;
        #[async_trait]
        impl StepHandler for EchoPrior {
            async fn execute(&self, ctx: StepContext) -> Result<serde_json::Value, StepError> {
                Ok(serde_json::json!({
                    "sawFirst": ctx.prior_outputs.contains_key("a"),
                    "attempt": ctx.attempt,
                }))
            }
        }

        let calls = Arc::new(AtomicU32::new(0));
        let h = harness(vec![
            (
                "first",
                Arc::new(CountingHandler {
                    calls,
                    fail_times: 0,
                    permanent: false,
                }) as Arc<dyn StepHandler>,
            ),
            ("echo", Arc::new(EchoPrior)),
        ]);

        let def = WorkflowDefinition {
            name: "chained".to_string(),
            version: "1.0".to_string(),
            steps: vec![
                StepSpec {
                    name: "a".to_string(),
                    handler: "first".to_string(),
                    retry: Some(fast_retry(1)),
                    timeout_ms: None,
                    params: serde_json::Value::Null,
                },
                StepSpec {
                    name: "b".to_string(),
                    handler: "echo".to_string(),
                    retry: Some(fast_retry(1)),
                    timeout_ms: None,
                    params: serde_json::Value::Null,
                },
            ],
        };

        let handle = h
            .orchestrator
            .start_workflow(def, serde_json::json!(null), "default", None)
            .await
            .unwrap();
        let run = h
            .orchestrator
            .wait_for_terminal(&handle.run_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.result.as_ref().unwrap()["sawFirst"], true);
    }
}
