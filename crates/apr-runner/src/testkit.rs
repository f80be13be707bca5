//! In-process stand-ins for the isolation backend, tools and benchmarks.
//!
//! `FakeBackend` interprets commands instead of running them:
//! `ok`, `fail`, `exit:<n>`, `patch:<n>` (writes n patch files),
//! `sleep:<ms>`, `hang` (until timeout or cancel) and `stuck` (ignores
//! both and returns only once its environment is destroyed).
//! `say:<text>|<command>` logs `<text>` before running `<command>`, and
//! `<a> ;; <b>` runs `<a>` the first time a job reaches that step and `<b>`
//! on every later attempt.

use crate::adapter::{AdapterContext, AdapterReport, StepError, StepOutput, ToolAdapter};
use crate::backend::{
    EnvironmentHandle, EnvironmentRequest, ExecOutcome, ExecRequest, ExecResult,
    IsolationBackend, MountTarget,
};
use crate::benchmark::{CheckoutSpec, MetadataBenchmark};
use crate::config::{ExecutionPolicy, ResourceLimits};
use crate::provision::Provisioner;
use crate::registry::Registry;
use crate::store::ResultStore;
use crate::supervisor::JobSupervisor;
use apr_core::{BugId, EnvironmentError, PatchStats, ToolName};
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(5);

pub fn temp_root(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "apr_runner_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&root).expect("temp root");
    root
}

#[derive(Default)]
pub struct FakeBackend {
    fail_create: Mutex<HashMap<String, u32>>,
    fail_destroy: AtomicBool,
    timeout_cap: Mutex<Option<Duration>>,
    active: Mutex<HashMap<String, String>>,
    per_tool: Mutex<HashMap<String, usize>>,
    max_per_tool: Mutex<HashMap<String, usize>>,
    max_active: AtomicUsize,
    execs: Mutex<Vec<(String, String)>>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    interrupted: AtomicUsize,
    next_id: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` creations for `job_key` fail.
    pub fn fail_create_for(&self, job_key: &str, times: u32) {
        self.fail_create
            .lock()
            .expect("lock")
            .insert(job_key.to_string(), times);
    }

    pub fn fail_destroy(&self) {
        self.fail_destroy.store(true, Ordering::SeqCst);
    }

    /// Shortens every exec timeout to at most `cap`.
    pub fn set_timeout_cap(&self, cap: Duration) {
        *self.timeout_cap.lock().expect("lock") = Some(cap);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn interrupted(&self) -> usize {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().expect("lock").len()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn max_active_for(&self, tool: &str) -> usize {
        self.max_per_tool
            .lock()
            .expect("lock")
            .get(tool)
            .copied()
            .unwrap_or(0)
    }

    pub fn exec_count(&self, job_key: &str) -> usize {
        self.execs
            .lock()
            .expect("lock")
            .iter()
            .filter(|(key, _)| key == job_key)
            .count()
    }

    /// Job keys in the order their `execute` step started.
    pub fn executed_keys(&self) -> Vec<String> {
        self.execs
            .lock()
            .expect("lock")
            .iter()
            .filter(|(_, step)| step == "execute")
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn is_active(&self, id: &str) -> bool {
        self.active.lock().expect("lock").contains_key(id)
    }

    fn wait(
        &self,
        handle: &EnvironmentHandle,
        request: &ExecRequest<'_>,
        finish_after: Option<Duration>,
    ) -> ExecOutcome {
        let timeout = match *self.timeout_cap.lock().expect("lock") {
            Some(cap) => cap.min(request.timeout),
            None => request.timeout,
        };
        let started = Instant::now();
        loop {
            if request.cancel.is_cancelled() || !self.is_active(&handle.id) {
                return ExecOutcome::Cancelled;
            }
            if let Some(after) = finish_after {
                if started.elapsed() >= after {
                    return ExecOutcome::Exited(0);
                }
            }
            if started.elapsed() >= timeout {
                return ExecOutcome::TimedOut;
            }
            thread::sleep(POLL);
        }
    }
}

impl IsolationBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn create(&self, request: &EnvironmentRequest<'_>) -> Result<EnvironmentHandle, EnvironmentError> {
        {
            let mut failures = self.fail_create.lock().expect("lock");
            if let Some(left) = failures.get_mut(&request.job.job_key) {
                if *left > 0 {
                    *left -= 1;
                    return Err(EnvironmentError::Create(format!(
                        "image {} unavailable",
                        request.image
                    )));
                }
            }
        }
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let tool = request.job.tool.to_string();
        {
            let mut active = self.active.lock().expect("lock");
            active.insert(id.clone(), tool.clone());
            self.max_active.fetch_max(active.len(), Ordering::SeqCst);
            let mut per_tool = self.per_tool.lock().expect("lock");
            let count = per_tool.entry(tool.clone()).or_insert(0);
            *count += 1;
            let mut max = self.max_per_tool.lock().expect("lock");
            let seen = max.entry(tool).or_insert(0);
            *seen = (*seen).max(*count);
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(EnvironmentHandle {
            id,
            job_key: request.job.job_key.clone(),
            guest: request
                .mounts
                .iter()
                .map(|m| (m.target, m.host.to_string_lossy().to_string()))
                .collect(),
            env: request.env.clone(),
        })
    }

    fn exec(
        &self,
        handle: &EnvironmentHandle,
        request: &ExecRequest<'_>,
    ) -> Result<ExecResult, EnvironmentError> {
        let step = request
            .log_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let prior = {
            let mut execs = self.execs.lock().expect("lock");
            let prior = execs
                .iter()
                .filter(|(key, s)| *key == handle.job_key && *s == step)
                .count();
            execs.push((handle.job_key.clone(), step));
            prior
        };
        let command = nth_attempt(request.command.trim(), prior);
        let (said, command) = match command.strip_prefix("say:").and_then(|r| r.split_once('|')) {
            Some((text, rest)) => (Some(text), rest.trim()),
            None => (None, command),
        };
        let mut log_lines = vec![format!("$ {}", command)];
        log_lines.extend(said.map(|text| text.to_string()));
        let outcome = match command.split_once(':') {
            _ if command == "ok" => ExecOutcome::Exited(0),
            _ if command == "fail" => ExecOutcome::Exited(1),
            _ if command == "hang" => self.wait(handle, request, None),
            _ if command == "stuck" => {
                while self.is_active(&handle.id) {
                    thread::sleep(POLL);
                }
                return Err(EnvironmentError::Exec("environment destroyed".to_string()));
            }
            Some(("exit", code)) => ExecOutcome::Exited(code.parse().unwrap_or(2)),
            Some(("sleep", ms)) => {
                let ms = ms.parse().unwrap_or(0);
                self.wait(handle, request, Some(Duration::from_millis(ms)))
            }
            Some(("patch", n)) => {
                let n: usize = n.parse().unwrap_or(0);
                let output = PathBuf::from(handle.guest_path(MountTarget::Output));
                for i in 1..=n {
                    fs::write(output.join(format!("patch_{}.patch", i)), b"--- a\n+++ b\n")
                        .map_err(|e| EnvironmentError::Exec(e.to_string()))?;
                    log_lines.push(format!("Found solution, patch {}", i));
                }
                ExecOutcome::Exited(0)
            }
            _ => ExecOutcome::Exited(127),
        };
        if let Some(parent) = request.log_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let mut log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(request.log_path)
            .map_err(|e| EnvironmentError::Exec(e.to_string()))?;
        for line in &log_lines {
            let _ = writeln!(log, "{}", line);
        }
        Ok(ExecResult {
            outcome,
            log_tail: log_lines.last().cloned().unwrap_or_default(),
        })
    }

    fn interrupt(&self, _handle: &EnvironmentHandle, _grace: Duration) -> Result<(), EnvironmentError> {
        self.interrupted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn destroy(&self, handle: &EnvironmentHandle) -> Result<(), EnvironmentError> {
        if self.fail_destroy.load(Ordering::SeqCst) {
            // Remove it anyway so nothing waits on it forever.
            self.remove(&handle.id);
            return Err(EnvironmentError::Teardown(format!(
                "{}: device busy",
                handle.id
            )));
        }
        self.remove(&handle.id);
        Ok(())
    }
}

fn nth_attempt(command: &str, prior: usize) -> &str {
    let variants = command.split(";;").map(str::trim).collect::<Vec<_>>();
    variants
        .get(prior)
        .or(variants.last())
        .copied()
        .unwrap_or(command)
}

impl FakeBackend {
    fn remove(&self, id: &str) {
        let tool = self.active.lock().expect("lock").remove(id);
        if let Some(tool) = tool {
            if let Some(count) = self.per_tool.lock().expect("lock").get_mut(&tool) {
                *count = count.saturating_sub(1);
            }
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Tool whose commands are interpreted by [`FakeBackend`]. The command
/// `panic` makes the adapter itself panic.
pub struct FakeTool {
    name: ToolName,
    default: String,
    per_bug: HashMap<BugId, String>,
    prepare: Vec<String>,
}

impl FakeTool {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: ToolName::new(name).expect("tool name"),
            default: command.to_string(),
            per_bug: HashMap::new(),
            prepare: Vec::new(),
        }
    }

    pub fn with_bug(mut self, bug: u64, command: &str) -> Self {
        self.per_bug.insert(BugId(bug), command.to_string());
        self
    }

    pub fn with_prepare(mut self, command: &str) -> Self {
        self.prepare.push(command.to_string());
        self
    }
}

impl ToolAdapter for FakeTool {
    fn name(&self) -> &ToolName {
        &self.name
    }

    fn image(&self) -> &str {
        "fake:latest"
    }

    fn prepare(&self, ctx: &AdapterContext<'_>) -> Result<Option<AdapterReport>, StepError> {
        for command in &self.prepare {
            let out = ctx.exec("prepare", command)?;
            if out.exit_code != 0 {
                return Ok(Some(AdapterReport {
                    success: false,
                    exit_code: Some(out.exit_code),
                    patch_stats: PatchStats::default(),
                    detail: Some("prepare failed".to_string()),
                }));
            }
        }
        Ok(None)
    }

    fn execute(&self, ctx: &AdapterContext<'_>) -> Result<StepOutput, StepError> {
        let command = self.per_bug.get(&ctx.job.bug).unwrap_or(&self.default);
        if command == "panic" {
            panic!("fake adapter blew up on {}", ctx.job.job_key);
        }
        ctx.exec("execute", command)
    }

    fn classify(
        &self,
        ctx: &AdapterContext<'_>,
        execution: &StepOutput,
    ) -> Result<AdapterReport, StepError> {
        let generated = fs::read_dir(&ctx.paths.output)
            .map(|entries| entries.count() as u64)
            .unwrap_or(0);
        Ok(AdapterReport {
            success: execution.exit_code == 0,
            exit_code: Some(execution.exit_code),
            patch_stats: PatchStats {
                generated,
                plausible: 0,
            },
            detail: (execution.exit_code != 0).then(|| execution.log_tail.clone()),
        })
    }
}

pub fn benchmark(name: &str, ids: &[u64]) -> MetadataBenchmark {
    let records = ids
        .iter()
        .map(|id| CheckoutSpec {
            id: BugId(*id),
            subject: "demo".to_string(),
            bug_id: format!("demo-{}", id),
            ..CheckoutSpec::default()
        })
        .collect();
    MetadataBenchmark::from_records(name, records).expect("benchmark")
}

pub fn registry(tools: Vec<FakeTool>, bugs: &[u64]) -> Registry {
    let mut registry = Registry::new();
    registry
        .register_benchmark(Arc::new(benchmark("bench", bugs)))
        .expect("register benchmark");
    for tool in tools {
        registry.register_tool(Arc::new(tool)).expect("register tool");
    }
    registry
}

/// Store and supervisor over a fake backend, with benchmark `bench`.
pub fn harness(
    root: &Path,
    backend: Arc<FakeBackend>,
    tools: Vec<FakeTool>,
    bugs: &[u64],
    policy: ExecutionPolicy,
) -> (Arc<ResultStore>, Arc<JobSupervisor>) {
    let store = Arc::new(ResultStore::open(root).expect("store"));
    let supervisor = JobSupervisor::new(
        Arc::new(registry(tools, bugs)),
        Provisioner::new(backend, ResourceLimits::default()),
        Arc::clone(&store),
        policy,
    );
    (store, Arc::new(supervisor))
}
