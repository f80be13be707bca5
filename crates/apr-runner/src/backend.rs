use crate::config::{NetworkPolicy, ResourceLimits};
use apr_core::{ensure_dir, EnvironmentError, JobSpec};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Read, Seek, SeekFrom};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const EXEC_POLL: Duration = Duration::from_millis(50);
const LOG_TAIL_BYTES: u64 = 4096;

/// Cooperative cancellation flag shared between the dispatcher and the
/// supervisors it spawned.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MountTarget {
    Experiment,
    Setup,
    Output,
    Logs,
    Tool,
}

impl MountTarget {
    pub fn container_path(self) -> &'static str {
        match self {
            Self::Experiment => "/experiment",
            Self::Setup => "/setup",
            Self::Output => "/output",
            Self::Logs => "/logs",
            Self::Tool => "/tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
    pub host: PathBuf,
    pub target: MountTarget,
    pub read_only: bool,
}

pub struct EnvironmentRequest<'a> {
    pub job: &'a JobSpec,
    pub image: &'a str,
    pub limits: &'a ResourceLimits,
    pub mounts: Vec<Mount>,
    pub env: BTreeMap<String, String>,
}

/// Live isolated environment. `guest` maps each mount to the path under
/// which commands running inside the environment see it.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentHandle {
    pub id: String,
    pub job_key: String,
    pub guest: BTreeMap<MountTarget, String>,
    pub env: BTreeMap<String, String>,
}

impl EnvironmentHandle {
    pub fn guest_path(&self, target: MountTarget) -> &str {
        self.guest
            .get(&target)
            .map(|s| s.as_str())
            .unwrap_or_else(|| target.container_path())
    }
}

pub struct ExecRequest<'a> {
    pub command: &'a str,
    pub timeout: Duration,
    pub cancel: &'a CancelToken,
    /// Combined stdout and stderr are appended here.
    pub log_path: &'a Path,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Exited(i32),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub outcome: ExecOutcome,
    pub log_tail: String,
}

/// Capability that creates, runs commands in, and destroys sandboxes.
pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self, request: &EnvironmentRequest<'_>) -> Result<EnvironmentHandle, EnvironmentError>;

    fn exec(
        &self,
        handle: &EnvironmentHandle,
        request: &ExecRequest<'_>,
    ) -> Result<ExecResult, EnvironmentError>;

    /// Asks every process in the environment to stop, escalating to a kill
    /// once `grace` has elapsed.
    fn interrupt(&self, handle: &EnvironmentHandle, grace: Duration) -> Result<(), EnvironmentError>;

    /// Must tolerate environments that are already gone.
    fn destroy(&self, handle: &EnvironmentHandle) -> Result<(), EnvironmentError>;
}

fn open_log(path: &Path) -> Result<fs::File, EnvironmentError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent).map_err(|e| EnvironmentError::Exec(e.to_string()))?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| EnvironmentError::Exec(format!("open log {}: {}", path.display(), e)))
}

pub fn read_log_tail(path: &Path) -> String {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return String::new(),
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if len > LOG_TAIL_BYTES {
        let _ = file.seek(SeekFrom::Start(len - LOG_TAIL_BYTES));
    }
    let mut buf = Vec::new();
    let _ = file.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).trim().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Term,
    Kill,
}

/// Makes the spawned command lead a new process group, so signals reach
/// everything it forks.
fn own_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(not(unix))]
    let _ = cmd;
}

#[cfg(unix)]
fn signal_group(pgid: u32, stop: Stop) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match stop {
        Stop::Term => Signal::SIGTERM,
        Stop::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => debug!(pgid, signal = ?signal, error = %e, "killpg failed"),
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _stop: Stop) {}

/// Spawns `cmd` with output appended to `log_path` and waits for it, polling
/// the cancel token and the deadline. The child's whole process group is
/// killed on timeout or cancellation.
pub fn run_with_deadline(
    mut cmd: Command,
    log_path: &Path,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<ExecResult, EnvironmentError> {
    let log = open_log(log_path)?;
    let log_err = log
        .try_clone()
        .map_err(|e| EnvironmentError::Exec(e.to_string()))?;
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::from(log));
    cmd.stderr(Stdio::from(log_err));
    own_process_group(&mut cmd);

    let mut child = cmd
        .spawn()
        .map_err(|e| EnvironmentError::Exec(format!("spawn failed: {}", e)))?;
    let outcome = wait_child(&mut child, timeout, cancel)?;
    Ok(ExecResult {
        outcome,
        log_tail: read_log_tail(log_path),
    })
}

fn wait_child(
    child: &mut Child,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<ExecOutcome, EnvironmentError> {
    let started = Instant::now();
    let pgid = child.id();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                // Background processes the command left behind go with it.
                signal_group(pgid, Stop::Kill);
                return Ok(ExecOutcome::Exited(status.code().unwrap_or(-1)));
            }
            Ok(None) => {}
            Err(e) => return Err(EnvironmentError::Exec(e.to_string())),
        }
        if cancel.is_cancelled() {
            kill_tree(child);
            return Ok(ExecOutcome::Cancelled);
        }
        if started.elapsed() >= timeout {
            kill_tree(child);
            return Ok(ExecOutcome::TimedOut);
        }
        thread::sleep(EXEC_POLL);
    }
}

fn kill_tree(child: &mut Child) {
    signal_group(child.id(), Stop::Kill);
    let _ = child.kill();
    let _ = child.wait();
}

fn output_tail(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    stderr
        .lines()
        .chain(stdout.lines())
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no output")
        .trim()
        .to_string()
}

fn container_name(job: &JobSpec) -> String {
    let mut out = String::from("apr-");
    for ch in job.job_key.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    format!("{}-{}", out, Utc::now().timestamp_micros())
}

/// Runs each job in its own container through the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker: String,
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self {
            docker: "docker".to_string(),
        }
    }
}

impl DockerBackend {
    pub fn new(docker: &str) -> Self {
        Self {
            docker: docker.to_string(),
        }
    }

    fn run_cli(&self, args: &[String]) -> Result<std::process::Output, String> {
        Command::new(&self.docker)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| format!("failed to invoke {}: {}", self.docker, e))
    }

    fn create_args(&self, request: &EnvironmentRequest<'_>, name: &str) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--label".to_string(),
            format!("apr.job_key={}", request.job.job_key),
            "--init".to_string(),
        ];
        let limits = request.limits;
        if let Some(cpus) = limits.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        if let Some(mem) = limits.memory_mb {
            args.push("--memory".to_string());
            args.push(format!("{}m", mem));
        }
        if let Some(disk) = limits.disk_gb {
            args.push("--storage-opt".to_string());
            args.push(format!("size={}G", disk));
        }
        if limits.network == NetworkPolicy::None {
            args.push("--network=none".to_string());
        }
        for mount in &request.mounts {
            let mut spec = format!(
                "{}:{}",
                mount.host.display(),
                mount.target.container_path()
            );
            if mount.read_only {
                spec.push_str(":ro");
            }
            args.push("-v".to_string());
            args.push(spec);
        }
        for (key, value) in &request.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push("-w".to_string());
        args.push(MountTarget::Experiment.container_path().to_string());
        // Keep the container idle; work is submitted with `docker exec`.
        args.push("--entrypoint".to_string());
        args.push("tail".to_string());
        args.push(request.image.to_string());
        args.push("-f".to_string());
        args.push("/dev/null".to_string());
        args
    }
}

impl IsolationBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn create(&self, request: &EnvironmentRequest<'_>) -> Result<EnvironmentHandle, EnvironmentError> {
        let name = container_name(request.job);
        let output = self
            .run_cli(&self.create_args(request, &name))
            .map_err(EnvironmentError::Create)?;
        if !output.status.success() {
            return Err(EnvironmentError::Create(format!(
                "docker create {}: {}",
                request.image,
                output_tail(&output)
            )));
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let id = if id.is_empty() { name } else { id };
        let handle = EnvironmentHandle {
            id: id.clone(),
            job_key: request.job.job_key.clone(),
            guest: request
                .mounts
                .iter()
                .map(|m| (m.target, m.target.container_path().to_string()))
                .collect(),
            env: request.env.clone(),
        };
        let start = self
            .run_cli(&["start".to_string(), id.clone()])
            .map_err(EnvironmentError::Create)?;
        if !start.status.success() {
            let _ = self.destroy(&handle);
            return Err(EnvironmentError::Create(format!(
                "docker start {}: {}",
                id,
                output_tail(&start)
            )));
        }
        debug!(container = %id, job_key = %request.job.job_key, "container started");
        Ok(handle)
    }

    fn exec(
        &self,
        handle: &EnvironmentHandle,
        request: &ExecRequest<'_>,
    ) -> Result<ExecResult, EnvironmentError> {
        let mut cmd = Command::new(&self.docker);
        cmd.arg("exec")
            .arg("-w")
            .arg(handle.guest_path(MountTarget::Experiment))
            .arg(&handle.id)
            .arg("sh")
            .arg("-c")
            .arg(request.command);
        run_with_deadline(cmd, request.log_path, request.timeout, request.cancel)
    }

    fn interrupt(&self, handle: &EnvironmentHandle, grace: Duration) -> Result<(), EnvironmentError> {
        let output = self
            .run_cli(&[
                "stop".to_string(),
                "-t".to_string(),
                grace.as_secs().to_string(),
                handle.id.clone(),
            ])
            .map_err(EnvironmentError::Teardown)?;
        if !output.status.success() {
            return Err(EnvironmentError::Teardown(format!(
                "docker stop {}: {}",
                handle.id,
                output_tail(&output)
            )));
        }
        Ok(())
    }

    fn destroy(&self, handle: &EnvironmentHandle) -> Result<(), EnvironmentError> {
        let output = self
            .run_cli(&["rm".to_string(), "-f".to_string(), handle.id.clone()])
            .map_err(EnvironmentError::Teardown)?;
        if output.status.success() {
            return Ok(());
        }
        let tail = output_tail(&output);
        if tail.contains("No such container") {
            return Ok(());
        }
        Err(EnvironmentError::Teardown(format!(
            "docker rm {}: {}",
            handle.id, tail
        )))
    }
}

/// Development backend: commands run as host processes with the job's
/// directories standing in for the container mounts. Offers no isolation.
#[derive(Debug, Default)]
pub struct LocalBackend {
    running: Mutex<HashMap<String, Vec<u32>>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&self, id: &str, pid: u32) {
        if let Ok(mut running) = self.running.lock() {
            running.entry(id.to_string()).or_default().push(pid);
        }
    }

    fn untrack(&self, id: &str, pid: u32) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(pids) = running.get_mut(id) {
                pids.retain(|p| *p != pid);
            }
        }
    }

    fn signal_all(&self, id: &str, stop: Stop) {
        let pids = self
            .running
            .lock()
            .ok()
            .and_then(|r| r.get(id).cloned())
            .unwrap_or_default();
        for pid in pids {
            signal_group(pid, stop);
        }
    }
}

impl IsolationBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn create(&self, request: &EnvironmentRequest<'_>) -> Result<EnvironmentHandle, EnvironmentError> {
        let mut guest = BTreeMap::new();
        for mount in &request.mounts {
            if !mount.host.exists() {
                return Err(EnvironmentError::Create(format!(
                    "mount source missing: {}",
                    mount.host.display()
                )));
            }
            guest.insert(mount.target, mount.host.to_string_lossy().to_string());
        }
        let id = container_name(request.job);
        if let Ok(mut running) = self.running.lock() {
            running.insert(id.clone(), Vec::new());
        }
        Ok(EnvironmentHandle {
            id,
            job_key: request.job.job_key.clone(),
            guest,
            env: request.env.clone(),
        })
    }

    fn exec(
        &self,
        handle: &EnvironmentHandle,
        request: &ExecRequest<'_>,
    ) -> Result<ExecResult, EnvironmentError> {
        let log = open_log(request.log_path)?;
        let log_err = log
            .try_clone()
            .map_err(|e| EnvironmentError::Exec(e.to_string()))?;
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(request.command);
        cmd.current_dir(handle.guest_path(MountTarget::Experiment));
        cmd.envs(&handle.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log));
        cmd.stderr(Stdio::from(log_err));
        own_process_group(&mut cmd);
        let mut child = cmd
            .spawn()
            .map_err(|e| EnvironmentError::Exec(format!("spawn failed: {}", e)))?;
        let pid = child.id();
        self.track(&handle.id, pid);
        let outcome = wait_child(&mut child, request.timeout, request.cancel);
        self.untrack(&handle.id, pid);
        Ok(ExecResult {
            outcome: outcome?,
            log_tail: read_log_tail(request.log_path),
        })
    }

    fn interrupt(&self, handle: &EnvironmentHandle, grace: Duration) -> Result<(), EnvironmentError> {
        self.signal_all(&handle.id, Stop::Term);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            let idle = self
                .running
                .lock()
                .map(|r| r.get(&handle.id).map(|p| p.is_empty()).unwrap_or(true))
                .unwrap_or(true);
            if idle {
                return Ok(());
            }
            thread::sleep(EXEC_POLL);
        }
        self.signal_all(&handle.id, Stop::Kill);
        Ok(())
    }

    fn destroy(&self, handle: &EnvironmentHandle) -> Result<(), EnvironmentError> {
        self.signal_all(&handle.id, Stop::Kill);
        let removed = self
            .running
            .lock()
            .map(|mut r| r.remove(&handle.id))
            .unwrap_or(None);
        if removed.is_none() {
            warn!(environment = %handle.id, "destroy called for unknown local environment");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceLimits;
    use apr_core::{BugId, ToolName};

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "apr_backend_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("root");
        root
    }

    fn spec() -> JobSpec {
        JobSpec::new(ToolName::new("nopol").expect("tool"), "b", BugId(1), 1)
    }

    #[test]
    fn docker_create_args_bind_limits_and_mounts() {
        let job = spec();
        let limits = ResourceLimits {
            cpus: Some(2.0),
            memory_mb: Some(4096),
            disk_gb: Some(20),
            network: NetworkPolicy::None,
        };
        let request = EnvironmentRequest {
            job: &job,
            image: "nopol:latest",
            limits: &limits,
            mounts: vec![
                Mount {
                    host: PathBuf::from("/h/exp"),
                    target: MountTarget::Experiment,
                    read_only: false,
                },
                Mount {
                    host: PathBuf::from("/h/setup"),
                    target: MountTarget::Setup,
                    read_only: true,
                },
            ],
            env: BTreeMap::from([("APR_BUG".to_string(), "1".to_string())]),
        };
        let args = DockerBackend::default().create_args(&request, "apr-x");
        let joined = args.join(" ");
        assert!(joined.contains("--cpus 2"), "{}", joined);
        assert!(joined.contains("--memory 4096m"));
        assert!(joined.contains("--storage-opt size=20G"));
        assert!(joined.contains("--network=none"));
        assert!(joined.contains("-v /h/exp:/experiment "));
        assert!(joined.contains("-v /h/setup:/setup:ro"));
        assert!(joined.contains("-e APR_BUG=1"));
        assert!(joined.ends_with("--entrypoint tail nopol:latest -f /dev/null"));
    }

    #[test]
    fn container_names_are_docker_safe() {
        let name = container_name(&spec());
        assert!(name.starts_with("apr-nopol_1_1-"), "{}", name);
        assert!(!name.contains(':'));
    }

    #[cfg(unix)]
    #[test]
    fn local_exec_reports_exit_code_and_log_tail() {
        let root = temp_root("exit");
        let job = spec();
        let limits = ResourceLimits::default();
        let backend = LocalBackend::new();
        let handle = backend
            .create(&EnvironmentRequest {
                job: &job,
                image: "ignored",
                limits: &limits,
                mounts: vec![Mount {
                    host: root.clone(),
                    target: MountTarget::Experiment,
                    read_only: false,
                }],
                env: BTreeMap::from([("APR_MSG".to_string(), "hello".to_string())]),
            })
            .expect("create");
        let log = root.join("exec.log");
        let cancel = CancelToken::new();
        let result = backend
            .exec(
                &handle,
                &ExecRequest {
                    command: "echo $APR_MSG; exit 3",
                    timeout: Duration::from_secs(10),
                    cancel: &cancel,
                    log_path: &log,
                },
            )
            .expect("exec");
        assert_eq!(result.outcome, ExecOutcome::Exited(3));
        assert_eq!(result.log_tail, "hello");
        backend.destroy(&handle).expect("destroy");
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn run_with_deadline_kills_on_timeout_and_cancel() {
        let root = temp_root("deadline");
        let log = root.join("sleep.log");
        let cancel = CancelToken::new();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30");
        let started = Instant::now();
        let result =
            run_with_deadline(cmd, &log, Duration::from_millis(200), &cancel).expect("run");
        assert_eq!(result.outcome, ExecOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));

        let cancelled = CancelToken::new();
        cancelled.cancel();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30");
        let result =
            run_with_deadline(cmd, &log, Duration::from_secs(30), &cancelled).expect("run");
        assert_eq!(result.outcome, ExecOutcome::Cancelled);
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(target_os = "linux")]
    fn process_alive(pid: &str) -> bool {
        match fs::read_to_string(format!("/proc/{}/stat", pid)) {
            // Zombies are dead but not yet reaped by their new parent.
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
                .unwrap_or(true),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn timeout_kills_grandchildren_too() {
        let root = temp_root("group");
        let pid_file = root.join("grandchild.pid");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("sleep 47 & echo $! > {}; wait", pid_file.display()));
        let result = run_with_deadline(
            cmd,
            &root.join("group.log"),
            Duration::from_millis(300),
            &CancelToken::new(),
        )
        .expect("run");
        assert_eq!(result.outcome, ExecOutcome::TimedOut);
        let pid = fs::read_to_string(&pid_file).expect("pid file").trim().to_string();
        let deadline = Instant::now() + Duration::from_secs(5);
        while process_alive(&pid) && Instant::now() < deadline {
            thread::sleep(EXEC_POLL);
        }
        assert!(!process_alive(&pid), "grandchild {} outlived the job", pid);
        let _ = fs::remove_dir_all(root);
    }
}
