//! Audit recorder: the engine's single entry point for trace writes.
//!
//! Audit failures are logged and swallowed. An execution must never fail
//! because its trace could not be written; the step outcome is already
//! persisted in the run record itself.

use std::sync::Arc;

use crate::models::audit::AuditRecord;
use crate::store::AuditStore;

#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<AuditStore>,
}

impl AuditRecorder {
    pub fn new(store: Arc<AuditStore>) -> Self {
        Self { store }
    }

    /// Best-effort append. Duplicate (run, step, attempt) writes are
    /// silently dropped by the store.
    pub async fn record(&self, record: AuditRecord) {
        let run_id = record.run_id.clone();
        let step_id = record.step_id.clone();
        match self.store.record(record).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(
                    "[Audit] Duplicate record for run {} step {} ignored",
                    run_id,
                    step_id
                );
            }
            Err(e) => {
                tracing::warn!(
                    "[Audit] Failed to record run {} step {}: {}",
                    run_id,
                    step_id,
                    e
                );
            }
        }
    }
}
