//! Sub-agent executor: runs untrusted task code in bounded subprocesses.
//!
//! Each execution is confined to a fresh isolation scope, stripped to a
//! whitelisted environment, and bounded three ways: a wall-clock deadline
//! enforced here (the process is killed on expiry), and CPU/address-space
//! ceilings enforced by the kernel via `setrlimit` on unix. A ceiling
//! breach surfaces as a `ResourceExceeded` result and a deadline breach as
//! `Timeout`; neither crashes the host. Concurrency is bounded by a
//! semaphore sized from config, and every execution forwards one audit
//! record.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::audit::AuditRecorder;
use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::models::audit::AuditRecord;
use crate::registry::{StepContext, StepError, StepHandler, SubAgentKind};
use crate::sandbox::isolation::{IsolationManager, IsolationSpec};

const OUTPUT_CAP_BYTES: usize = 64 * 1024;

/// A unit of code to run in the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeTask {
    /// Sub-agent kind name, resolved against the capability registry.
    pub kind: String,
    pub code: String,
}

/// Where an execution hangs in the audit trail.
#[derive(Debug, Clone)]
pub struct ExecTrace {
    pub run_id: String,
    pub tenant_id: String,
    pub step_id: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubAgentStatus {
    Completed,
    Failed,
    Timeout,
    ResourceExceeded,
    Cancelled,
}

impl SubAgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubAgentStatus::Completed => "completed",
            SubAgentStatus::Failed => "failed",
            SubAgentStatus::Timeout => "timeout",
            SubAgentStatus::ResourceExceeded => "resourceExceeded",
            SubAgentStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAgentResult {
    pub status: SubAgentStatus,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl SubAgentResult {
    fn bare(status: SubAgentStatus) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            error: None,
            duration_ms: 0,
        }
    }
}

pub struct SubAgentExecutor {
    kinds: HashMap<String, SubAgentKind>,
    isolation: IsolationManager,
    semaphore: Arc<Semaphore>,
    audit: AuditRecorder,
    default_spec: IsolationSpec,
}

impl SubAgentExecutor {
    pub fn new(
        kinds: Vec<SubAgentKind>,
        max_concurrent: usize,
        default_spec: IsolationSpec,
        audit: AuditRecorder,
    ) -> Self {
        Self {
            kinds: kinds.into_iter().map(|k| (k.name.clone(), k)).collect(),
            isolation: IsolationManager::new(),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            audit,
            default_spec,
        }
    }

    pub fn default_spec(&self) -> IsolationSpec {
        self.default_spec.clone()
    }

    /// Run one task to completion (or to its deadline). Holds a concurrency
    /// permit for the whole execution; excess tasks queue for one.
    pub async fn execute(
        &self,
        task: &CodeTask,
        spec: &IsolationSpec,
        cancel: &CancelToken,
        trace: &ExecTrace,
    ) -> Result<SubAgentResult, EngineError> {
        let kind = self
            .kinds
            .get(&task.kind)
            .cloned()
            .ok_or_else(|| EngineError::BadRequest(format!("Unknown sub-agent kind: {}", task.kind)))?;

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| EngineError::Internal("Executor is shut down".to_string()))?;

        let started = Instant::now();
        // Context lives for this block only; the scope dir is removed on
        // every exit path when it drops.
        let context = self.isolation.allocate(spec)?;
        let task_file = context.write_task_file("task", &task.code)?;

        let mut result = self
            .run_process(&kind, &task_file.to_string_lossy(), &context, spec, cancel)
            .await;
        result.duration_ms = started.elapsed().as_millis() as u64;
        drop(context);

        tracing::info!(
            "[Executor] {} kind={} status={} duration={}ms",
            trace.run_id,
            task.kind,
            result.status.as_str(),
            result.duration_ms
        );

        self.audit
            .record(
                AuditRecord::new(&trace.run_id, &trace.step_id, trace.attempt, result.status.as_str())
                    .with_detail(serde_json::json!({
                        "kind": task.kind,
                        "tenantId": trace.tenant_id,
                        "exitCode": result.exit_code,
                        "durationMs": result.duration_ms,
                    })),
            )
            .await;

        Ok(result)
    }

    async fn run_process(
        &self,
        kind: &SubAgentKind,
        task_file: &str,
        context: &crate::sandbox::isolation::IsolationContext,
        spec: &IsolationSpec,
        cancel: &CancelToken,
    ) -> SubAgentResult {
        let mut cmd = Command::new(&kind.program);
        for arg in &kind.args {
            cmd.arg(arg.replace("{file}", task_file));
        }
        cmd.current_dir(context.scope_path())
            .env_clear()
            .envs(context.env().iter().map(|(k, v)| (k.clone(), v.clone())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        apply_rlimits(&mut cmd, spec);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let mut r = SubAgentResult::bare(SubAgentStatus::Failed);
                r.error = Some(format!("Failed to spawn '{}': {}", kind.program, e));
                return r;
            }
        };

        let wall = Duration::from_millis(spec.wall_timeout_ms);
        let wait = child.wait_with_output();
        tokio::pin!(wait);

        // Dropping the pinned wait future on the timeout/cancel branches
        // kills the process (kill_on_drop).
        tokio::select! {
            res = &mut wait => match res {
                Ok(output) => classify_output(output),
                Err(e) => {
                    let mut r = SubAgentResult::bare(SubAgentStatus::Failed);
                    r.error = Some(format!("Failed to collect output: {}", e));
                    r
                }
            },
            _ = tokio::time::sleep(wall) => {
                let mut r = SubAgentResult::bare(SubAgentStatus::Timeout);
                r.error = Some(format!("Wall-clock deadline exceeded ({}ms)", spec.wall_timeout_ms));
                r
            }
            _ = cancel.cancelled() => {
                let mut r = SubAgentResult::bare(SubAgentStatus::Cancelled);
                r.error = Some("Execution cancelled".to_string());
                r
            }
        }
    }
}

#[cfg(unix)]
fn apply_rlimits(cmd: &mut Command, spec: &IsolationSpec) {
    let cpu_secs = (spec.cpu_time_ms.div_ceil(1000)).max(1) as libc::rlim_t;
    let mem_bytes = spec.memory_bytes as libc::rlim_t;
    unsafe {
        cmd.pre_exec(move || {
            // Soft limit delivers SIGXCPU, hard limit one second later
            // delivers SIGKILL if the task ignores it.
            let cpu = libc::rlimit {
                rlim_cur: cpu_secs,
                rlim_max: cpu_secs + 1,
            };
            if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            let mem = libc::rlimit {
                rlim_cur: mem_bytes,
                rlim_max: mem_bytes,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &mem) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_rlimits(_cmd: &mut Command, _spec: &IsolationSpec) {}

fn classify_output(output: std::process::Output) -> SubAgentResult {
    let stdout = cap_output(&output.stdout);
    let stderr = cap_output(&output.stderr);

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = output.status.signal() {
            let status = if signal == libc::SIGXCPU || signal == libc::SIGKILL {
                SubAgentStatus::ResourceExceeded
            } else {
                SubAgentStatus::Failed
            };
            return SubAgentResult {
                status,
                stdout,
                stderr,
                exit_code: None,
                error: Some(format!("Terminated by signal {}", signal)),
                duration_ms: 0,
            };
        }
    }

    let code = output.status.code();
    let status = if output.status.success() {
        SubAgentStatus::Completed
    } else {
        SubAgentStatus::Failed
    };
    SubAgentResult {
        status,
        stdout,
        stderr,
        exit_code: code,
        error: (status == SubAgentStatus::Failed)
            .then(|| format!("Exited with code {:?}", code)),
        duration_ms: 0,
    }
}

fn cap_output(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= OUTPUT_CAP_BYTES {
        return text.into_owned();
    }
    let mut end = OUTPUT_CAP_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &text[..end])
}

// ---------------------------------------------------------------------------
// Step handler bridge
// ---------------------------------------------------------------------------

/// Built-in handler exposing the executor to workflows. Step params:
/// `{ "kind": "...", "code": "...", "timeoutMs"?, "cpuTimeMs"?,
/// "memoryBytes"? }`.
pub struct SubAgentStepHandler {
    executor: Arc<SubAgentExecutor>,
}

impl SubAgentStepHandler {
    /// Handler name workflows reference in their step specs.
    pub const NAME: &'static str = "core.execCode";

    pub fn new(executor: Arc<SubAgentExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl StepHandler for SubAgentStepHandler {
    async fn execute(&self, ctx: StepContext) -> Result<serde_json::Value, StepError> {
        let kind = ctx.params["kind"]
            .as_str()
            .ok_or_else(|| StepError::Permanent("Missing 'kind' in step params".to_string()))?
            .to_string();
        let code = ctx.params["code"]
            .as_str()
            .ok_or_else(|| StepError::Permanent("Missing 'code' in step params".to_string()))?
            .to_string();

        let mut spec = self.executor.default_spec();
        if let Some(ms) = ctx.params["timeoutMs"].as_u64() {
            spec.wall_timeout_ms = ms;
        }
        if let Some(ms) = ctx.params["cpuTimeMs"].as_u64() {
            spec.cpu_time_ms = ms;
        }
        if let Some(bytes) = ctx.params["memoryBytes"].as_u64() {
            spec.memory_bytes = bytes;
        }

        let task = CodeTask { kind, code };
        let trace = ExecTrace {
            run_id: ctx.run_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            step_id: ctx.step_name.clone(),
            attempt: ctx.attempt,
        };
        let result = self
            .executor
            .execute(&task, &spec, &ctx.cancel, &trace)
            .await
            .map_err(|e| StepError::Permanent(e.to_string()))?;

        match result.status {
            SubAgentStatus::Completed => Ok(serde_json::to_value(&result)
                .map_err(|e| StepError::Permanent(e.to_string()))?),
            // Deadline and ceiling breaches are deterministic for the same
            // task; retrying would burn the budget again.
            SubAgentStatus::Timeout | SubAgentStatus::ResourceExceeded => Err(
                StepError::Permanent(result.error.unwrap_or_else(|| {
                    result.status.as_str().to_string()
                })),
            ),
            SubAgentStatus::Cancelled => {
                Err(StepError::Permanent("Execution cancelled".to_string()))
            }
            SubAgentStatus::Failed => Err(StepError::Permanent(
                result
                    .error
                    .unwrap_or_else(|| "Sub-agent failed".to_string()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::registry::CapabilityRegistry;
    use crate::store::AuditStore;

    fn executor(max_concurrent: usize) -> (SubAgentExecutor, Arc<AuditStore>) {
        let store = Arc::new(AuditStore::new(Database::open_in_memory().unwrap()));
        let registry = CapabilityRegistry::from_providers(vec![]);
        let exec = SubAgentExecutor::new(
            registry.sub_agent_kinds(),
            max_concurrent,
            IsolationSpec::default(),
            AuditRecorder::new(store.clone()),
        );
        (exec, store)
    }

    fn trace(step: &str) -> ExecTrace {
        ExecTrace {
            run_id: "run-test".to_string(),
            tenant_id: "acme".to_string(),
            step_id: step.to_string(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let (exec, _) = executor(2);
        let task = CodeTask {
            kind: "cobol".to_string(),
            code: "".to_string(),
        };
        let err = exec
            .execute(&task, &IsolationSpec::default(), &CancelToken::never(), &trace("s"))
            .await;
        assert!(matches!(err, Err(EngineError::BadRequest(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_completes_and_audits() {
        let (exec, store) = executor(2);
        let task = CodeTask {
            kind: "shell".to_string(),
            code: "echo hello from the scope".to_string(),
        };
        let result = exec
            .execute(&task, &IsolationSpec::default(), &CancelToken::never(), &trace("greet"))
            .await
            .unwrap();

        assert_eq!(result.status, SubAgentStatus::Completed);
        assert!(result.stdout.contains("hello from the scope"));
        assert_eq!(result.exit_code, Some(0));

        let records = store.query_by_run("run-test").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, "completed");
        assert_eq!(records[0].step_id, "greet");
        assert_eq!(records[0].detail["tenantId"], "acme");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let (exec, _) = executor(2);
        let task = CodeTask {
            kind: "shell".to_string(),
            code: "echo oops >&2; exit 3".to_string(),
        };
        let result = exec
            .execute(&task, &IsolationSpec::default(), &CancelToken::never(), &trace("s"))
            .await
            .unwrap();

        assert_eq!(result.status, SubAgentStatus::Failed);
        assert_eq!(result.exit_code, Some(3));
        assert!(result.stderr.contains("oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wall_deadline_kills_sleeper() {
        let (exec, _) = executor(2);
        let spec = IsolationSpec {
            wall_timeout_ms: 500,
            ..IsolationSpec::default()
        };
        let task = CodeTask {
            kind: "shell".to_string(),
            code: "sleep 5".to_string(),
        };

        let started = Instant::now();
        let result = exec
            .execute(&task, &spec, &CancelToken::never(), &trace("s"))
            .await
            .unwrap();

        assert_eq!(result.status, SubAgentStatus::Timeout);
        // Well under the task's own 5s sleep.
        assert!(started.elapsed() < Duration::from_millis(3000));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_sleeper() {
        let (exec, _) = executor(2);
        let (handle, token) = crate::cancel::cancel_pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.cancel();
        });

        let task = CodeTask {
            kind: "shell".to_string(),
            code: "sleep 5".to_string(),
        };
        let result = exec
            .execute(&task, &IsolationSpec::default(), &token, &trace("s"))
            .await
            .unwrap();
        assert_eq!(result.status, SubAgentStatus::Cancelled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let (exec, _) = executor(1);
        let exec = Arc::new(exec);

        let started = Instant::now();
        let mut handles = Vec::new();
        for i in 0..2 {
            let exec = exec.clone();
            handles.push(tokio::spawn(async move {
                let task = CodeTask {
                    kind: "shell".to_string(),
                    code: "sleep 0.2".to_string(),
                };
                exec.execute(
                    &task,
                    &IsolationSpec::default(),
                    &CancelToken::never(),
                    &ExecTrace {
                        run_id: format!("run-{}", i),
                        tenant_id: "default".to_string(),
                        step_id: "s".to_string(),
                        attempt: 1,
                    },
                )
                .await
                .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().status, SubAgentStatus::Completed);
        }
        // With a single permit the two 200ms tasks must serialize.
        assert!(started.elapsed() >= Duration::from_millis(350));
    }
}
