//! SQLite-backed stores, one per table.

pub mod audit_store;
pub mod run_store;
pub mod schedule_store;

pub use audit_store::AuditStore;
pub use run_store::RunStore;
pub use schedule_store::ScheduleStore;
