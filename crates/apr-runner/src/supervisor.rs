use crate::adapter::{run_adapter, AdapterContext, StepError, ToolAdapter};
use crate::backend::{CancelToken, EnvironmentHandle, IsolationBackend};
use crate::benchmark::CheckoutSpec;
use crate::config::ExecutionPolicy;
use crate::provision::{ProvisionInputs, Provisioner};
use crate::registry::Registry;
use crate::store::{JobPaths, ResultStore};
use anyhow::{anyhow, Result};
use apr_core::{JobOutcome, JobSpec, JobStatus, PatchStats};
use chrono::{DateTime, Utc};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Provisioning,
    Running,
    Succeeded,
    ToolFailed,
    TimedOut,
    EnvironmentFailed,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::ToolFailed => "tool_failed",
            Self::TimedOut => "timed_out",
            Self::EnvironmentFailed => "environment_failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Provisioning | Self::Running)
    }

    /// Retries re-enter `Provisioning` from the retryable terminal states.
    pub fn can_transition(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Pending, Provisioning) => true,
            (Provisioning, Running) | (Provisioning, EnvironmentFailed) => true,
            (Running, Succeeded | ToolFailed | TimedOut | EnvironmentFailed) => true,
            (EnvironmentFailed | TimedOut, Provisioning) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl From<JobStatus> for JobState {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Success => Self::Succeeded,
            JobStatus::ToolFailure => Self::ToolFailed,
            JobStatus::Timeout => Self::TimedOut,
            JobStatus::EnvironmentError => Self::EnvironmentFailed,
            JobStatus::Cancelled => Self::Cancelled,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared between a job's supervisor and the dispatcher. Whoever wins
/// [`JobTicket::claim`] is the only party allowed to record the outcome;
/// whoever takes the environment out of the ticket is the only party that
/// destroys it.
#[derive(Debug)]
pub struct JobTicket {
    pub job: JobSpec,
    cancel: CancelToken,
    claimed: AtomicBool,
    environment: Mutex<Option<EnvironmentHandle>>,
    state: Mutex<JobState>,
    running_since: Mutex<Option<Instant>>,
    attempts: AtomicU32,
    started_at: DateTime<Utc>,
}

impl JobTicket {
    pub fn new(job: JobSpec) -> Arc<Self> {
        Arc::new(Self {
            job,
            cancel: CancelToken::new(),
            claimed: AtomicBool::new(false),
            environment: Mutex::new(None),
            state: Mutex::new(JobState::Pending),
            running_since: Mutex::new(None),
            attempts: AtomicU32::new(0),
            started_at: Utc::now(),
        })
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    /// Returns false, leaving the slot empty, once the ticket is claimed.
    pub fn install_environment(&self, handle: EnvironmentHandle) -> bool {
        let mut slot = lock(&self.environment);
        if self.is_claimed() {
            return false;
        }
        *slot = Some(handle);
        true
    }

    pub fn take_environment(&self) -> Option<EnvironmentHandle> {
        lock(&self.environment).take()
    }

    pub fn state(&self) -> JobState {
        *lock(&self.state)
    }

    pub fn transition(&self, next: JobState) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.can_transition(next) {
            return Err(anyhow!(
                "invalid job state transition for {}: {} -> {}",
                self.job.job_key,
                state.as_str(),
                next.as_str()
            ));
        }
        debug!(job_key = %self.job.job_key, from = state.as_str(), to = next.as_str(), "job state");
        *state = next;
        *lock(&self.running_since) = (next == JobState::Running).then(Instant::now);
        Ok(())
    }

    pub fn running_for(&self) -> Option<Duration> {
        lock(&self.running_since).map(|since| since.elapsed())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[derive(Debug, Clone)]
struct AttemptResult {
    status: JobStatus,
    exit_code: Option<i32>,
    patch_stats: PatchStats,
    detail: Option<String>,
}

impl AttemptResult {
    fn failed(status: JobStatus, detail: String) -> Self {
        Self {
            status,
            exit_code: None,
            patch_stats: PatchStats::default(),
            detail: Some(detail),
        }
    }
}

struct ResolvedJob {
    adapter: Arc<dyn ToolAdapter>,
    checkout: CheckoutSpec,
    setup_dir: Option<PathBuf>,
}

/// Runs one job from provisioning to a recorded outcome.
pub struct JobSupervisor {
    registry: Arc<Registry>,
    provisioner: Provisioner,
    store: Arc<ResultStore>,
    policy: ExecutionPolicy,
}

impl JobSupervisor {
    pub fn new(
        registry: Arc<Registry>,
        provisioner: Provisioner,
        store: Arc<ResultStore>,
        policy: ExecutionPolicy,
    ) -> Self {
        Self {
            registry,
            provisioner,
            store,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    pub fn backend(&self) -> &Arc<dyn IsolationBackend> {
        self.provisioner.backend()
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    /// Returns `Ok(None)` when the dispatcher force-terminated the job and
    /// recorded its outcome first. Errors are store failures or broken
    /// invariants and are fatal for the run.
    pub fn supervise(&self, ticket: &Arc<JobTicket>) -> Result<Option<JobOutcome>> {
        let job = &ticket.job;
        let mut paths = self.store.reset_job_dir(job)?;
        let mut attempt = 0u32;
        let result = loop {
            attempt += 1;
            ticket.attempts.store(attempt, Ordering::SeqCst);
            let result = self.attempt(ticket, &paths)?;
            if ticket.cancel_token().is_cancelled()
                || !self.policy.should_retry(result.status, attempt)
            {
                break result;
            }
            warn!(
                job_key = %job.job_key,
                attempt,
                status = result.status.as_str(),
                detail = result.detail.as_deref().unwrap_or(""),
                "retrying job"
            );
            paths = self.store.reset_attempt(job)?;
        };

        let mut outcome = JobOutcome::new(job, result.status, ticket.started_at());
        outcome.attempts = attempt;
        outcome.exit_code = result.exit_code;
        outcome.patch_stats = result.patch_stats;
        outcome.error_detail = result.detail;
        outcome.artifact_paths = self.store.artifacts(job);

        if !ticket.claim() {
            debug!(job_key = %job.job_key, "outcome already recorded by force termination");
            return Ok(None);
        }
        self.store.put(&outcome)?;
        info!(
            job_key = %job.job_key,
            tool = %job.tool,
            bug = %job.bug,
            status = outcome.status.as_str(),
            attempts = attempt,
            wall_seconds = outcome.wall_seconds(),
            "job finished"
        );
        Ok(Some(outcome))
    }

    fn resolve(&self, job: &JobSpec) -> Result<ResolvedJob> {
        let adapter = Arc::clone(self.registry.tool(job.tool.as_str())?);
        let benchmark = self.registry.benchmark(&job.benchmark)?;
        let checkout = benchmark.describe(job.bug)?;
        Ok(ResolvedJob {
            adapter,
            checkout,
            setup_dir: benchmark.setup_dir().map(|p| p.to_path_buf()),
        })
    }

    fn attempt(&self, ticket: &Arc<JobTicket>, paths: &JobPaths) -> Result<AttemptResult> {
        let job = &ticket.job;
        ticket.transition(JobState::Provisioning)?;
        if ticket.cancel_token().is_cancelled() {
            ticket.transition(JobState::Cancelled)?;
            return Ok(AttemptResult::failed(
                JobStatus::Cancelled,
                "cancelled before provisioning".to_string(),
            ));
        }

        let resolved = match self.resolve(job) {
            Ok(resolved) => resolved,
            Err(e) => {
                ticket.transition(JobState::EnvironmentFailed)?;
                return Ok(AttemptResult::failed(
                    JobStatus::EnvironmentError,
                    format!("job inputs unavailable: {:#}", e),
                ));
            }
        };
        let lease = match self.provisioner.provision(
            ticket,
            ProvisionInputs {
                checkout: &resolved.checkout,
                setup_dir: resolved.setup_dir.as_deref(),
                paths,
                image: resolved.adapter.image(),
                tool_mounts: resolved.adapter.mounts(),
                checkout_timeout: self.policy.job_timeout(),
            },
        ) {
            Ok(lease) => lease,
            Err(e) => {
                let status = if ticket.cancel_token().is_cancelled() {
                    JobStatus::Cancelled
                } else {
                    JobStatus::EnvironmentError
                };
                warn!(job_key = %job.job_key, error = %e, "provisioning failed");
                ticket.transition(status.into())?;
                return Ok(AttemptResult::failed(status, e.to_string()));
            }
        };

        ticket.transition(JobState::Running)?;
        let ctx = AdapterContext::new(
            job,
            &resolved.checkout,
            paths,
            lease.handle(),
            self.provisioner.backend().as_ref(),
            ticket.cancel_token(),
            ticket.attempts(),
            self.policy.job_timeout(),
        );
        let run = panic::catch_unwind(AssertUnwindSafe(|| {
            run_adapter(resolved.adapter.as_ref(), &ctx)
        }));
        let mut result = match run {
            Ok(Ok(report)) => AttemptResult {
                status: if report.success {
                    JobStatus::Success
                } else {
                    JobStatus::ToolFailure
                },
                exit_code: report.exit_code,
                patch_stats: report.patch_stats,
                detail: report.detail,
            },
            Ok(Err(StepError::TimedOut)) => AttemptResult::failed(
                JobStatus::Timeout,
                format!(
                    "exceeded job timeout of {} minutes",
                    self.policy.timeout_minutes
                ),
            ),
            Ok(Err(StepError::Cancelled)) => {
                AttemptResult::failed(JobStatus::Cancelled, "cancelled by shutdown".to_string())
            }
            Ok(Err(StepError::Environment(e))) => {
                AttemptResult::failed(JobStatus::EnvironmentError, e.to_string())
            }
            Err(payload) => AttemptResult::failed(
                JobStatus::EnvironmentError,
                format!("tool adapter panicked: {}", panic_message(payload.as_ref())),
            ),
        };

        if matches!(result.status, JobStatus::Timeout | JobStatus::Cancelled) {
            if let Err(e) = lease.interrupt(self.policy.grace()) {
                warn!(job_key = %job.job_key, error = %e, "interrupt failed; forcing teardown");
            }
        }
        if let Err(e) = lease.release() {
            let prior = result.status;
            result.status = JobStatus::EnvironmentError;
            result.detail = Some(match result.detail.take() {
                Some(detail) => format!("{} (job ended as {}: {})", e, prior, detail),
                None => format!("{} (job ended as {})", e, prior),
            });
        }
        ticket.transition(result.status.into())?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::DeclarativeTool;
    use crate::config::{ClassifyRule, ResourceLimits, RetryTrigger, ToolConfig, ToolKindConfig};
    use crate::testkit::{harness, registry, temp_root, FakeBackend, FakeTool};
    use apr_core::{BugId, ToolName};
    use std::fs;
    use std::path::Path;

    fn spec(tool: &str, bug: u64) -> JobSpec {
        JobSpec::new(ToolName::new(tool).expect("tool"), "bench", BugId(bug), 1)
    }

    #[test]
    fn state_machine_accepts_only_documented_transitions() {
        use JobState::*;
        assert!(Pending.can_transition(Provisioning));
        assert!(Provisioning.can_transition(Running));
        assert!(Provisioning.can_transition(EnvironmentFailed));
        assert!(Running.can_transition(TimedOut));
        assert!(Running.can_transition(Cancelled));
        assert!(TimedOut.can_transition(Provisioning));
        assert!(!Pending.can_transition(Running));
        assert!(!Succeeded.can_transition(Cancelled));
        assert!(!ToolFailed.can_transition(Provisioning));
        assert!(!Provisioning.can_transition(Succeeded));

        let ticket = JobTicket::new(spec("nopol", 1));
        assert!(ticket.transition(Running).is_err());
        ticket.transition(Provisioning).expect("provisioning");
        ticket.transition(Running).expect("running");
        assert!(ticket.running_for().is_some());
        ticket.transition(Succeeded).expect("succeeded");
        assert!(ticket.running_for().is_none());
    }

    #[test]
    fn claim_is_won_exactly_once_and_blocks_late_environments() {
        let ticket = JobTicket::new(spec("nopol", 1));
        assert!(ticket.claim());
        assert!(!ticket.claim());
        let handle = EnvironmentHandle {
            id: "env".to_string(),
            job_key: ticket.job.job_key.clone(),
            guest: Default::default(),
            env: Default::default(),
        };
        assert!(!ticket.install_environment(handle));
        assert!(ticket.take_environment().is_none());
    }

    #[test]
    fn successful_job_records_outcome_with_artifacts() {
        let root = temp_root("sup_ok");
        let backend = Arc::new(FakeBackend::new());
        let (store, supervisor) = harness(
            &root,
            backend.clone(),
            vec![FakeTool::new("nopol", "patch:2")],
            &[1],
            ExecutionPolicy::default(),
        );
        let ticket = JobTicket::new(spec("nopol", 1));
        let outcome = supervisor
            .supervise(&ticket)
            .expect("supervise")
            .expect("recorded");
        assert_eq!(outcome.status, JobStatus::Success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.patch_stats.generated, 2);
        assert_eq!(
            outcome.artifact_paths,
            vec!["output/patch_1.patch", "output/patch_2.patch"]
        );
        assert_eq!(ticket.state(), JobState::Succeeded);
        assert!(store.has("nopol:1:1"));
        assert_eq!(backend.destroyed(), 1);
        assert_eq!(backend.active_count(), 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn non_returning_tool_times_out_and_is_torn_down() {
        let root = temp_root("sup_timeout");
        let backend = Arc::new(FakeBackend::new());
        let policy = ExecutionPolicy {
            timeout_minutes: 1,
            grace_seconds: 0,
            ..ExecutionPolicy::default()
        };
        let (store, supervisor) = harness(
            &root,
            backend.clone(),
            vec![FakeTool::new("nopol", "hang")],
            &[1],
            policy,
        );
        backend.set_timeout_cap(Duration::from_millis(100));
        let started = Instant::now();
        let outcome = supervisor
            .supervise(&JobTicket::new(spec("nopol", 1)))
            .expect("supervise")
            .expect("recorded");
        assert_eq!(outcome.status, JobStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(backend.interrupted(), 1);
        assert_eq!(backend.destroyed(), 1);
        assert_eq!(store.get("nopol:1:1").map(|o| o.status), Some(JobStatus::Timeout));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn provisioning_failure_never_executes() {
        let root = temp_root("sup_prov");
        let backend = Arc::new(FakeBackend::new());
        backend.fail_create_for("nopol:1:1", 1);
        let (_store, supervisor) = harness(
            &root,
            backend.clone(),
            vec![FakeTool::new("nopol", "ok")],
            &[1],
            ExecutionPolicy::default(),
        );
        let outcome = supervisor
            .supervise(&JobTicket::new(spec("nopol", 1)))
            .expect("supervise")
            .expect("recorded");
        assert_eq!(outcome.status, JobStatus::EnvironmentError);
        assert!(outcome
            .error_detail
            .as_deref()
            .unwrap_or("")
            .contains("environment creation failed"));
        assert_eq!(backend.exec_count("nopol:1:1"), 0);
        assert_eq!(backend.created(), 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn environment_errors_are_retried_when_policy_allows() {
        let root = temp_root("sup_retry");
        let backend = Arc::new(FakeBackend::new());
        backend.fail_create_for("nopol:1:1", 1);
        let policy = ExecutionPolicy {
            max_attempts: 2,
            retry_on: vec![RetryTrigger::EnvironmentError],
            ..ExecutionPolicy::default()
        };
        let (_store, supervisor) = harness(
            &root,
            backend.clone(),
            vec![FakeTool::new("nopol", "ok")],
            &[1],
            policy,
        );
        let outcome = supervisor
            .supervise(&JobTicket::new(spec("nopol", 1)))
            .expect("supervise")
            .expect("recorded");
        assert_eq!(outcome.status, JobStatus::Success);
        assert_eq!(outcome.attempts, 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn retried_attempt_is_classified_from_its_own_log() {
        let root = temp_root("sup_retry_log");
        let backend = Arc::new(FakeBackend::new());
        backend.set_timeout_cap(Duration::from_millis(100));
        let tool = DeclarativeTool::from_config(
            &ToolConfig {
                name: "astor".to_string(),
                image: "astor:latest".to_string(),
                kind: ToolKindConfig::Command {
                    prepare: vec![],
                    execute: "say:Found solution, id 1|hang ;; say:no repair found|fail"
                        .to_string(),
                },
                classify: ClassifyRule::LogMarker {
                    marker: "Found solution".to_string(),
                },
                plausible_marker: Some("found solution,".to_string()),
            },
            Path::new("/"),
        )
        .expect("tool");
        let mut reg = registry(vec![], &[1]);
        reg.register_tool(Arc::new(tool)).expect("register");
        let store = Arc::new(ResultStore::open(&root).expect("store"));
        let supervisor = JobSupervisor::new(
            Arc::new(reg),
            Provisioner::new(backend.clone(), ResourceLimits::default()),
            Arc::clone(&store),
            ExecutionPolicy {
                timeout_minutes: 1,
                grace_seconds: 0,
                max_attempts: 2,
                retry_on: vec![RetryTrigger::Timeout],
                ..ExecutionPolicy::default()
            },
        );

        let job = spec("astor", 1);
        let outcome = supervisor
            .supervise(&JobTicket::new(job.clone()))
            .expect("supervise")
            .expect("recorded");
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.status, JobStatus::ToolFailure);
        assert_eq!(outcome.exit_code, Some(1));
        assert_eq!(outcome.patch_stats.plausible, 0);

        let paths = store.job_paths(&job);
        let first = fs::read_to_string(paths.attempt_logs(1).join("execute.log")).expect("log 1");
        let second = fs::read_to_string(paths.attempt_logs(2).join("execute.log")).expect("log 2");
        assert!(first.contains("Found solution, id 1"));
        assert!(!second.contains("Found solution"));
        assert!(second.contains("no repair found"));
        assert_eq!(backend.created(), 2);
        assert_eq!(backend.destroyed(), 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn tool_failure_is_data_and_not_retried() {
        let root = temp_root("sup_fail");
        let backend = Arc::new(FakeBackend::new());
        let policy = ExecutionPolicy {
            max_attempts: 3,
            retry_on: vec![RetryTrigger::EnvironmentError, RetryTrigger::Timeout],
            ..ExecutionPolicy::default()
        };
        let (_store, supervisor) = harness(
            &root,
            backend.clone(),
            vec![FakeTool::new("nopol", "fail")],
            &[1],
            policy,
        );
        let outcome = supervisor
            .supervise(&JobTicket::new(spec("nopol", 1)))
            .expect("supervise")
            .expect("recorded");
        assert_eq!(outcome.status, JobStatus::ToolFailure);
        assert_eq!(outcome.exit_code, Some(1));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(backend.created(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn adapter_panic_is_recorded_and_environment_released() {
        let root = temp_root("sup_panic");
        let backend = Arc::new(FakeBackend::new());
        let (_store, supervisor) = harness(
            &root,
            backend.clone(),
            vec![FakeTool::new("nopol", "panic")],
            &[1],
            ExecutionPolicy::default(),
        );
        let outcome = supervisor
            .supervise(&JobTicket::new(spec("nopol", 1)))
            .expect("supervise")
            .expect("recorded");
        assert_eq!(outcome.status, JobStatus::EnvironmentError);
        assert!(outcome
            .error_detail
            .as_deref()
            .unwrap_or("")
            .contains("panicked"));
        assert_eq!(backend.destroyed(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn teardown_failure_overrides_status_and_keeps_prior() {
        let root = temp_root("sup_teardown");
        let backend = Arc::new(FakeBackend::new());
        backend.fail_destroy();
        let (_store, supervisor) = harness(
            &root,
            backend.clone(),
            vec![FakeTool::new("nopol", "ok")],
            &[1],
            ExecutionPolicy::default(),
        );
        let outcome = supervisor
            .supervise(&JobTicket::new(spec("nopol", 1)))
            .expect("supervise")
            .expect("recorded");
        assert_eq!(outcome.status, JobStatus::EnvironmentError);
        assert!(outcome
            .error_detail
            .as_deref()
            .unwrap_or("")
            .contains("job ended as success"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn claimed_ticket_does_not_record() {
        let root = temp_root("sup_claimed");
        let backend = Arc::new(FakeBackend::new());
        let (store, supervisor) = harness(
            &root,
            backend.clone(),
            vec![FakeTool::new("nopol", "ok")],
            &[1],
            ExecutionPolicy::default(),
        );
        let ticket = JobTicket::new(spec("nopol", 1));
        assert!(ticket.claim());
        ticket.cancel();
        assert!(supervisor.supervise(&ticket).expect("supervise").is_none());
        assert!(!store.has("nopol:1:1"));
        assert_eq!(backend.created(), 0);
        let _ = fs::remove_dir_all(root);
    }
}
