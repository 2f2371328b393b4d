//! Isolation scopes for sandboxed executions.
//!
//! Each execution gets a single-use `IsolationContext`: a private scratch
//! directory plus a resolved environment built from an explicit whitelist.
//! The context owns the directory and removes it when dropped, so every
//! exit path (success, failure, timeout, panic unwind) tears the scope
//! down.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::EngineError;

/// Resource ceilings and environment policy for one execution.
#[derive(Debug, Clone)]
pub struct IsolationSpec {
    /// Hard wall-clock deadline; the process is killed on expiry.
    pub wall_timeout_ms: u64,
    /// CPU time ceiling, enforced by the kernel on unix.
    pub cpu_time_ms: u64,
    /// Address-space ceiling, enforced by the kernel on unix.
    pub memory_bytes: u64,
    /// Host environment variables passed through; everything else is
    /// stripped.
    pub env_whitelist: Vec<String>,
}

impl Default for IsolationSpec {
    fn default() -> Self {
        Self {
            wall_timeout_ms: 30_000,
            cpu_time_ms: 10_000,
            memory_bytes: 256 * 1024 * 1024,
            env_whitelist: vec![
                "PATH".to_string(),
                "HOME".to_string(),
                "LANG".to_string(),
            ],
        }
    }
}

/// A live, single-use execution scope. Dropping it deletes the directory.
pub struct IsolationContext {
    scope: TempDir,
    env: Vec<(String, String)>,
}

impl IsolationContext {
    pub fn scope_path(&self) -> &Path {
        self.scope.path()
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Write the task payload into the scope and return its path.
    pub fn write_task_file(&self, name: &str, contents: &str) -> Result<PathBuf, EngineError> {
        let path = self.scope.path().join(name);
        std::fs::write(&path, contents)
            .map_err(|e| EngineError::Internal(format!("Failed to write task file: {}", e)))?;
        Ok(path)
    }
}

/// Allocates isolation contexts. Stateless; the context itself carries the
/// cleanup obligation.
#[derive(Clone, Default)]
pub struct IsolationManager;

impl IsolationManager {
    pub fn new() -> Self {
        Self
    }

    pub fn allocate(&self, spec: &IsolationSpec) -> Result<IsolationContext, EngineError> {
        let scope = TempDir::new()
            .map_err(|e| EngineError::Internal(format!("Failed to create scope dir: {}", e)))?;

        let mut env: Vec<(String, String)> = spec
            .env_whitelist
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.clone(), v)))
            .collect();
        env.push((
            "TMPDIR".to_string(),
            scope.path().to_string_lossy().into_owned(),
        ));

        Ok(IsolationContext { scope, env })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_removed_on_drop() {
        let manager = IsolationManager::new();
        let ctx = manager.allocate(&IsolationSpec::default()).unwrap();
        let path = ctx.scope_path().to_path_buf();
        assert!(path.is_dir());

        let file = ctx.write_task_file("task", "echo hi").unwrap();
        assert!(file.is_file());

        drop(ctx);
        assert!(!path.exists());
    }

    #[test]
    fn test_env_is_whitelist_only() {
        std::env::set_var("DUROW_TEST_SECRET", "nope");
        let manager = IsolationManager::new();
        let spec = IsolationSpec {
            env_whitelist: vec!["PATH".to_string()],
            ..IsolationSpec::default()
        };
        let ctx = manager.allocate(&spec).unwrap();

        assert!(ctx.env().iter().any(|(k, _)| k == "PATH"));
        assert!(!ctx.env().iter().any(|(k, _)| k == "DUROW_TEST_SECRET"));
        // The scope doubles as the scratch space.
        assert!(ctx.env().iter().any(|(k, _)| k == "TMPDIR"));
        std::env::remove_var("DUROW_TEST_SECRET");
    }

    #[test]
    fn test_contexts_are_disjoint() {
        let manager = IsolationManager::new();
        let a = manager.allocate(&IsolationSpec::default()).unwrap();
        let b = manager.allocate(&IsolationSpec::default()).unwrap();
        assert_ne!(a.scope_path(), b.scope_path());
    }
}
