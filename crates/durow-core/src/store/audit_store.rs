//! Persistence for audit records.
//!
//! The table's primary key (run_id, step_id, attempt) does the
//! deduplication; `record` uses INSERT OR IGNORE so a retried write of the
//! same attempt is a no-op and the first record wins.

use chrono::{TimeZone, Utc};

use crate::db::Database;
use crate::error::EngineError;
use crate::models::audit::AuditRecord;

#[derive(Clone)]
pub struct AuditStore {
    db: Database,
}

impl AuditStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a record. Returns false when an identical
    /// (run, step, attempt) entry already exists.
    pub async fn record(&self, record: AuditRecord) -> Result<bool, EngineError> {
        let inserted = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO audit_records \
                     (run_id, step_id, attempt, outcome, detail, recorded_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        record.run_id,
                        record.step_id,
                        record.attempt,
                        record.outcome,
                        record.detail.to_string(),
                        record.recorded_at.timestamp_millis(),
                    ],
                )
            })
            .await?;
        Ok(inserted > 0)
    }

    /// All records for a run, in insertion order.
    pub async fn query_by_run(&self, run_id: &str) -> Result<Vec<AuditRecord>, EngineError> {
        let id = run_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT run_id, step_id, attempt, outcome, detail, recorded_at \
                     FROM audit_records WHERE run_id = ?1 ORDER BY rowid ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![id], row_to_record)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<AuditRecord, rusqlite::Error> {
    let detail_json: String = row.get(4)?;
    let recorded_ms: i64 = row.get(5)?;

    Ok(AuditRecord {
        run_id: row.get(0)?,
        step_id: row.get(1)?,
        attempt: row.get::<_, i64>(2)? as u32,
        outcome: row.get(3)?,
        detail: serde_json::from_str(&detail_json).unwrap_or(serde_json::Value::Null),
        recorded_at: Utc
            .timestamp_millis_opt(recorded_ms)
            .single()
            .unwrap_or_else(Utc::now),
    })
}
