//! Engine configuration, loaded from the environment.

use uuid::Uuid;

use crate::models::definition::RetryPolicy;

/// Runtime tunables for the engine. `from_env` reads the `DUROW_*`
/// variables and falls back to defaults for anything unset or unparsable.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: String,
    pub port: u16,
    /// Ceiling on concurrently executing sandboxed tasks.
    pub max_concurrent_tasks: usize,
    /// Applied when a step specifies no timeout of its own.
    pub default_step_timeout_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_multiplier: f64,
    pub default_tenant: String,
    pub lease_ttl_ms: u64,
    /// Identifies this process as a lease owner. Fresh per process.
    pub worker_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: "data/durow.db".to_string(),
            port: 3200,
            max_concurrent_tasks: 4,
            default_step_timeout_ms: 30_000,
            retry_max_attempts: 3,
            retry_base_delay_ms: 1_000,
            retry_multiplier: 2.0,
            default_tenant: "default".to_string(),
            lease_ttl_ms: 30_000,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: env_or("DUROW_DB_PATH", defaults.db_path),
            port: env_parsed("DUROW_PORT", defaults.port),
            max_concurrent_tasks: env_parsed(
                "DUROW_MAX_CONCURRENT_TASKS",
                defaults.max_concurrent_tasks,
            )
            .max(1),
            default_step_timeout_ms: env_parsed(
                "DUROW_DEFAULT_STEP_TIMEOUT_MS",
                defaults.default_step_timeout_ms,
            ),
            retry_max_attempts: env_parsed("DUROW_RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts)
                .max(1),
            retry_base_delay_ms: env_parsed(
                "DUROW_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay_ms,
            ),
            retry_multiplier: env_parsed("DUROW_RETRY_MULTIPLIER", defaults.retry_multiplier),
            default_tenant: env_or("DUROW_DEFAULT_TENANT", defaults.default_tenant),
            lease_ttl_ms: env_parsed("DUROW_LEASE_TTL_MS", defaults.lease_ttl_ms),
            worker_id: defaults.worker_id,
        }
    }

    /// Retry policy applied to steps that specify none of their own.
    pub fn default_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay_ms: self.retry_base_delay_ms,
            multiplier: self.retry_multiplier,
            ..RetryPolicy::default()
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
