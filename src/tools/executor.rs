//! Gated tool execution with bounded concurrency, timeouts, cancellation,
//! and output capping.
//!
//! The executor is the single entry point for running tools. Every request
//! passes validation, the permission check, and (when required) the
//! approval rendezvous before a semaphore slot is taken and the tool runs
//! under a deadline. Output larger than the cap is truncated with a marker
//! suffix. `shutdown` stops new work, cancels live executions, and waits —
//! bounded — for in-flight work to drain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{oneshot, Notify, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approvals::permission::PermissionDecision;
use crate::approvals::{ApprovalBroker, ApprovalError, PermissionService};
use crate::types::{ApprovalRequest, PermissionTier, ToolInput, ToolOutput};

use super::{ToolError, ToolRegistry};

/// Suffix appended when output exceeds the cap.
pub const TRUNCATION_SUFFIX: &str = "\n... (output truncated)";

/// Default per-execution deadline.
const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Default cap on captured output.
const DEFAULT_MAX_OUTPUT: usize = 1024 * 1024;

/// Default number of concurrently running executions.
const DEFAULT_MAX_CONCURRENT: usize = 10;

// ---------------------------------------------------------------------------
// Request / result / errors
// ---------------------------------------------------------------------------

/// One execution request.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    /// Registry name of the tool.
    pub tool: String,
    /// Tool input.
    pub input: ToolInput,
    /// Permission tier of the requesting user.
    pub tier: PermissionTier,
    /// Per-call deadline override.
    pub timeout: Option<Duration>,
    /// Skip the approval gate (caller already holds a grant).
    pub skip_approval: bool,
    /// Human-readable reason shown in approval dialogs.
    pub reason: String,
}

/// One successful execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub output: ToolOutput,
    pub tool: String,
    pub execution_id: String,
    /// Whether the execution passed an approval gate (auto or human).
    pub approved: bool,
    /// The user who answered the dialog, when a human was involved.
    pub approved_by: Option<String>,
}

/// A live execution, for status displays and cancellation.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: String,
    pub tool: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
}

/// Executor errors. Each variant is a distinguishable kind the agent loop
/// branches on when rendering a user-facing result.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The executor is shutting down and refuses new work.
    #[error("executor is shutting down")]
    ShuttingDown,
    /// No tool registered under this name.
    #[error("tool not found: {0}")]
    ToolNotFound(String),
    /// The tool rejected the input.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The permission service blocked the invocation.
    #[error("permission blocked: {reason}")]
    PermissionBlocked {
        /// Explanation carried to the user.
        reason: String,
    },
    /// The user denied the approval dialog.
    #[error("approval denied")]
    ApprovalDenied,
    /// The approval dialog expired unanswered.
    #[error("approval request timed out")]
    ApprovalTimeout,
    /// The tool ran past its deadline.
    #[error("command timed out")]
    ExecutionTimeout,
    /// The execution was cancelled via [`ToolExecutor::cancel_execution`].
    #[error("execution cancelled")]
    Cancelled,
    /// The tool failed below the invocation level.
    #[error(transparent)]
    Tool(#[from] ToolError),
    /// Persistence failure in the approval layer.
    #[error("approval bookkeeping failed: {0}")]
    Approval(String),
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

struct LiveExecution {
    record: ExecutionRecord,
    cancel: Option<oneshot::Sender<()>>,
}

/// The tool execution pipeline.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    permissions: Arc<PermissionService>,
    broker: Arc<ApprovalBroker>,
    semaphore: Arc<Semaphore>,
    live: Mutex<HashMap<String, LiveExecution>>,
    in_flight: AtomicUsize,
    drained: Notify,
    shutting_down: AtomicBool,
    default_timeout: Duration,
    max_output: usize,
}

impl ToolExecutor {
    /// Build an executor with explicit limits.
    pub fn new(
        registry: Arc<ToolRegistry>,
        permissions: Arc<PermissionService>,
        broker: Arc<ApprovalBroker>,
        max_concurrent: usize,
        default_timeout: Duration,
        max_output: usize,
    ) -> Self {
        Self {
            registry,
            permissions,
            broker,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            live: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            shutting_down: AtomicBool::new(false),
            default_timeout,
            max_output,
        }
    }

    /// Build an executor with the default limits (10 concurrent, 2 min
    /// timeout, 1 MiB output cap).
    pub fn with_defaults(
        registry: Arc<ToolRegistry>,
        permissions: Arc<PermissionService>,
        broker: Arc<ApprovalBroker>,
    ) -> Self {
        Self::new(
            registry,
            permissions,
            broker,
            DEFAULT_MAX_CONCURRENT,
            DEFAULT_EXECUTION_TIMEOUT,
            DEFAULT_MAX_OUTPUT,
        )
    }

    /// Run one tool invocation through the full pipeline.
    ///
    /// # Errors
    ///
    /// Every [`ExecutorError`] kind; see the variant docs.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecutionResult, ExecutorError> {
        // 1. Refuse new work during shutdown.
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ExecutorError::ShuttingDown);
        }

        // 2. Resolve and validate.
        let tool = self
            .registry
            .get(&request.tool)
            .ok_or_else(|| ExecutorError::ToolNotFound(request.tool.clone()))?;
        tool.validate(&request.input)
            .map_err(|e| ExecutorError::Validation(e.to_string()))?;

        let mut input = request.input.clone();
        let risk = tool.risk_for(&input);

        // 3. Permission gate, then the approval rendezvous when required.
        let mut approved = false;
        let mut approved_by = None;
        if !request.skip_approval {
            let check = self.permissions.check(
                &input.user_id,
                request.tier,
                &request.tool,
                &input.command,
                input.working_dir.as_deref(),
                risk,
            );
            match check.decision {
                PermissionDecision::Blocked => {
                    return Err(ExecutorError::PermissionBlocked {
                        reason: check
                            .block_reason
                            .unwrap_or_else(|| "blocked by policy".to_owned()),
                    });
                }
                PermissionDecision::Auto => {
                    approved = true;
                }
                PermissionDecision::NeedsApproval => {
                    let approval = ApprovalRequest {
                        id: Uuid::new_v4().to_string(),
                        user_id: input.user_id.clone(),
                        tool: request.tool.clone(),
                        command: input.command.clone(),
                        args: input.args.clone(),
                        working_dir: input.working_dir.clone(),
                        risk,
                        reason: request.reason.clone(),
                        created_at: Utc::now(),
                    };
                    let response = self
                        .broker
                        .request_approval(approval, request.tier)
                        .await
                        .map_err(|e| match e {
                            ApprovalError::Blocked { reason } => {
                                ExecutorError::PermissionBlocked { reason }
                            }
                            ApprovalError::Timeout => ExecutorError::ApprovalTimeout,
                            ApprovalError::Shutdown => ExecutorError::ShuttingDown,
                            other => ExecutorError::Approval(other.to_string()),
                        })?;
                    if !response.approved {
                        return Err(ExecutorError::ApprovalDenied);
                    }
                    if let Some(modified) = response.modified {
                        info!(tool = %request.tool, "user modified command before approval");
                        input.command = modified;
                    }
                    approved = true;
                    approved_by = Some(input.user_id.clone());
                }
            }
        }

        // 4. Bounded concurrency.
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ExecutorError::ShuttingDown)?;

        // 5. Track the live execution.
        let execution_id = Uuid::new_v4().to_string();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let record = ExecutionRecord {
            id: execution_id.clone(),
            tool: request.tool.clone(),
            command: input.command.clone(),
            started_at: Utc::now(),
        };
        if let Ok(mut live) = self.live.lock() {
            live.insert(
                execution_id.clone(),
                LiveExecution {
                    record,
                    cancel: Some(cancel_tx),
                },
            );
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        // Unregisters on every exit path, including caller cancellation.
        let guard = LiveGuard {
            executor: self,
            id: execution_id.clone(),
        };

        debug!(execution_id = %execution_id, tool = %request.tool, "execution started");

        // 6. Run under the deadline.
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();
        let outcome = tokio::select! {
            result = tool.execute(&input) => result.map_err(ExecutorError::from),
            _ = cancel_rx => Err(ExecutorError::Cancelled),
            () = tokio::time::sleep(timeout) => Err(ExecutorError::ExecutionTimeout),
        };

        // 7. Always unregister, then release the slot.
        drop(guard);
        drop(permit);

        let mut output = outcome?;

        // 8. Fill duration and cap output.
        output.duration = started.elapsed();
        truncate_output(&mut output.output, self.max_output);

        debug!(
            execution_id = %execution_id,
            tool = %request.tool,
            success = output.success,
            "execution finished"
        );

        Ok(ExecutionResult {
            output,
            tool: request.tool,
            execution_id,
            approved,
            approved_by,
        })
    }

    /// Cancel a live execution. Returns whether an execution was found.
    pub fn cancel_execution(&self, id: &str) -> bool {
        let Ok(mut live) = self.live.lock() else {
            return false;
        };
        match live.get_mut(id).and_then(|e| e.cancel.take()) {
            Some(cancel) => {
                info!(execution_id = %id, "cancelling execution");
                let _ = cancel.send(());
                true
            }
            None => false,
        }
    }

    /// Snapshot of currently running executions.
    pub fn list_executions(&self) -> Vec<ExecutionRecord> {
        let Ok(live) = self.live.lock() else {
            return Vec::new();
        };
        live.values().map(|e| e.record.clone()).collect()
    }

    /// Number of currently running executions.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop accepting work, cancel live executions, and wait (up to
    /// `deadline`) for in-flight work to drain.
    pub async fn shutdown(&self, deadline: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let ids: Vec<String> = {
            let Ok(live) = self.live.lock() else {
                return;
            };
            live.keys().cloned().collect()
        };
        for id in ids {
            self.cancel_execution(&id);
        }

        let wait = async {
            while self.in_flight.load(Ordering::SeqCst) > 0 {
                self.drained.notified().await;
            }
        };
        if tokio::time::timeout(deadline, wait).await.is_err() {
            warn!(
                remaining = self.in_flight.load(Ordering::SeqCst),
                "shutdown deadline reached with executions still in flight"
            );
        } else {
            info!("executor drained");
        }
    }

    fn remove_live(&self, id: &str) {
        if let Ok(mut live) = self.live.lock() {
            live.remove(id);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.drained.notify_waiters();
    }
}

/// Drop guard unregistering a live execution.
struct LiveGuard<'a> {
    executor: &'a ToolExecutor,
    id: String,
}

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        self.executor.remove_live(&self.id);
    }
}

/// Cap `output` at `max_bytes`, appending the truncation suffix.
///
/// Output of exactly `max_bytes` is untouched; one byte more gets cut at a
/// character boundary and marked.
fn truncate_output(output: &mut String, max_bytes: usize) {
    if output.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while cut > 0 && !output.is_char_boundary(cut) {
        cut = cut.saturating_sub(1);
    }
    output.truncate(cut);
    output.push_str(TRUNCATION_SUFFIX);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvals::store::ApprovalStore;
    use crate::tools::test_support::StubTool;
    use crate::types::{ApprovalResponse, RiskLevel};

    struct Harness {
        _dir: tempfile::TempDir,
        executor: Arc<ToolExecutor>,
        broker: Arc<ApprovalBroker>,
    }

    fn harness(max_concurrent: usize, timeout: Duration, max_output: usize) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let store =
            Arc::new(ApprovalStore::open(dir.path().join("approvals.yaml")).expect("store"));
        let permissions = Arc::new(PermissionService::new(store));
        let broker = Arc::new(ApprovalBroker::new(
            Arc::clone(&permissions),
            Duration::from_millis(100),
        ));
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(StubTool::named("echo")));

        let mut slow = StubTool::named("slow");
        slow.delay = Duration::from_secs(5);
        registry.register(Arc::new(slow));

        let mut risky = StubTool::named("risky");
        risky.risk = RiskLevel::High;
        registry.register(Arc::new(risky));

        let executor = Arc::new(ToolExecutor::new(
            registry,
            permissions,
            Arc::clone(&broker),
            max_concurrent,
            timeout,
            max_output,
        ));
        Harness {
            _dir: dir,
            executor,
            broker,
        }
    }

    fn request(tool: &str, command: &str) -> ExecuteRequest {
        ExecuteRequest {
            tool: tool.to_owned(),
            input: ToolInput {
                command: command.to_owned(),
                user_id: "u1".to_owned(),
                ..Default::default()
            },
            tier: PermissionTier::Some,
            timeout: None,
            skip_approval: false,
            reason: "test".to_owned(),
        }
    }

    #[tokio::test]
    async fn executes_low_risk_tool() {
        let h = harness(2, Duration::from_secs(5), 1024);
        let result = h
            .executor
            .execute(request("echo", "hello"))
            .await
            .expect("execution");
        assert!(result.output.success);
        assert!(result.approved);
        assert!(result.approved_by.is_none(), "auto approval has no approver");
        assert_eq!(result.output.output, "ok");
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let h = harness(2, Duration::from_secs(5), 1024);
        let err = h
            .executor
            .execute(request("missing", "x"))
            .await
            .expect_err("should fail");
        assert!(matches!(err, ExecutorError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn validation_failure_surfaces() {
        let h = harness(2, Duration::from_secs(5), 1024);
        let err = h
            .executor
            .execute(request("echo", "invalid"))
            .await
            .expect_err("should fail");
        assert!(matches!(err, ExecutorError::Validation(_)));
    }

    #[tokio::test]
    async fn dangerous_command_is_permission_blocked() {
        let h = harness(2, Duration::from_secs(5), 1024);
        let mut req = request("echo", "rm -rf /home");
        req.tier = PermissionTier::Unrestricted;
        let err = h.executor.execute(req).await.expect_err("should block");
        match err {
            ExecutorError::PermissionBlocked { reason } => {
                assert_eq!(reason, "command matches dangerous pattern");
            }
            other => panic!("expected PermissionBlocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn high_risk_waits_for_approval_and_runs() {
        let h = harness(2, Duration::from_secs(5), 1024);
        let executor = Arc::clone(&h.executor);
        let task = tokio::spawn(async move { executor.execute(request("risky", "do it")).await });

        // Answer the dialog once it opens.
        let mut answered = false;
        for _ in 0..100 {
            if h.broker.pending_count() == 1 {
                let pending_id = h
                    .broker
                    .pending_ids()
                    .into_iter()
                    .next()
                    .expect("pending id");
                h.broker
                    .respond(&pending_id, ApprovalResponse::approve())
                    .expect("respond");
                answered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(answered, "approval dialog never opened");

        let result = task.await.expect("join").expect("approved execution");
        assert!(result.approved);
        assert_eq!(result.approved_by.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn denial_maps_to_approval_denied() {
        let h = harness(2, Duration::from_secs(5), 1024);
        let executor = Arc::clone(&h.executor);
        let task = tokio::spawn(async move { executor.execute(request("risky", "do it")).await });

        for _ in 0..100 {
            if h.broker.pending_count() == 1 {
                let pending_id = h
                    .broker
                    .pending_ids()
                    .into_iter()
                    .next()
                    .expect("pending id");
                h.broker
                    .respond(&pending_id, ApprovalResponse::deny())
                    .expect("respond");
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = task.await.expect("join").expect_err("should be denied");
        assert!(matches!(err, ExecutorError::ApprovalDenied));
    }

    #[tokio::test]
    async fn unanswered_approval_times_out() {
        let h = harness(2, Duration::from_secs(5), 1024);
        let err = h
            .executor
            .execute(request("risky", "do it"))
            .await
            .expect_err("should time out");
        assert!(matches!(err, ExecutorError::ApprovalTimeout));
    }

    #[tokio::test]
    async fn execution_timeout_fires() {
        let h = harness(2, Duration::from_millis(50), 1024);
        let err = h
            .executor
            .execute(request("slow", "sleep"))
            .await
            .expect_err("should time out");
        assert!(matches!(err, ExecutorError::ExecutionTimeout));
        assert_eq!(h.executor.in_flight(), 0, "live map must be cleaned up");
    }

    #[tokio::test]
    async fn per_call_timeout_override() {
        let h = harness(2, Duration::from_secs(60), 1024);
        let mut req = request("slow", "sleep");
        req.timeout = Some(Duration::from_millis(50));
        let err = h.executor.execute(req).await.expect_err("should time out");
        assert!(matches!(err, ExecutorError::ExecutionTimeout));
    }

    #[tokio::test]
    async fn cancel_unblocks_execution() {
        let h = harness(2, Duration::from_secs(60), 1024);
        let executor = Arc::clone(&h.executor);
        let task = tokio::spawn(async move { executor.execute(request("slow", "sleep")).await });

        let mut cancelled = false;
        for _ in 0..100 {
            let live = h.executor.list_executions();
            if let Some(record) = live.first() {
                cancelled = h.executor.cancel_execution(&record.id);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(cancelled, "execution never appeared in live map");

        let err = task.await.expect("join").expect_err("should be cancelled");
        assert!(matches!(err, ExecutorError::Cancelled));
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let h = harness(1, Duration::from_secs(60), 1024);
        let first = {
            let executor = Arc::clone(&h.executor);
            tokio::spawn(async move { executor.execute(request("slow", "a")).await })
        };
        // Give the first execution time to take the only slot.
        for _ in 0..100 {
            if h.executor.in_flight() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.executor.in_flight(), 1);

        // A second fast execution must queue behind the slot, so the live
        // count never exceeds 1.
        let second = {
            let executor = Arc::clone(&h.executor);
            tokio::spawn(async move { executor.execute(request("echo", "b")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.executor.in_flight() <= 1);

        first.abort();
        second.abort();
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let h = harness(2, Duration::from_secs(5), 1024);
        h.executor.shutdown(Duration::from_millis(100)).await;
        let err = h
            .executor
            .execute(request("echo", "hello"))
            .await
            .expect_err("should refuse");
        assert!(matches!(err, ExecutorError::ShuttingDown));
    }

    // ── Output truncation ──

    #[test]
    fn truncation_boundary_exact() {
        let mut exact = "a".repeat(64);
        truncate_output(&mut exact, 64);
        assert_eq!(exact.len(), 64);
        assert!(!exact.contains("truncated"));
    }

    #[test]
    fn truncation_boundary_one_over() {
        let mut over = "a".repeat(65);
        truncate_output(&mut over, 64);
        assert!(over.starts_with(&"a".repeat(64)));
        assert!(over.ends_with(TRUNCATION_SUFFIX));
        assert!(over.len() <= 64 + TRUNCATION_SUFFIX.len());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut text = "é".repeat(40); // 2 bytes per char
        truncate_output(&mut text, 63);
        assert!(text.ends_with(TRUNCATION_SUFFIX));
        // Must still be valid UTF-8 (guaranteed by String) and within cap.
        assert!(text.len() <= 63 + TRUNCATION_SUFFIX.len());
    }
}
