use crate::backend::CancelToken;
use anyhow::{anyhow, Result};
use apr_core::{atomic_write_json_pretty, ensure_dir};
use chrono::Utc;
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tracing::warn;

const INTERRUPT_POLL: Duration = Duration::from_millis(100);

static INTERRUPTS: AtomicUsize = AtomicUsize::new(0);

pub fn runtime_dir(results_root: &Path) -> PathBuf {
    results_root.join("runtime")
}

pub fn stop_request_path(results_root: &Path) -> PathBuf {
    runtime_dir(results_root).join("stop_request.json")
}

pub fn run_control_path(run_dir: &Path) -> PathBuf {
    run_dir.join("run_control.json")
}

/// Asks whichever dispatcher owns `results_root` to shut down.
pub fn request_stop(results_root: &Path, reason: &str) -> Result<PathBuf> {
    let path = stop_request_path(results_root);
    let payload = json!({
        "schema_version": "stop_request_v1",
        "reason": reason,
        "requested_by_pid": std::process::id(),
        "requested_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&path, &payload)?;
    Ok(path)
}

pub fn stop_requested(results_root: &Path) -> bool {
    stop_request_path(results_root).exists()
}

pub fn clear_stop_request(results_root: &Path) -> Result<()> {
    match fs::remove_file(stop_request_path(results_root)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn write_run_control(
    run_dir: &Path,
    run_id: &str,
    status: &str,
    active_jobs: &[String],
    done: usize,
    total: usize,
) -> Result<()> {
    let payload = json!({
        "schema_version": "run_control_v1",
        "run_id": run_id,
        "status": status,
        "active_jobs": active_jobs,
        "done": done,
        "total": total,
        "updated_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&run_control_path(run_dir), &payload)
}

pub fn read_run_control(run_dir: &Path) -> Result<Value> {
    let bytes = fs::read(run_control_path(run_dir))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(unix)]
extern "C" fn count_interrupt(_: std::os::raw::c_int) {
    INTERRUPTS.fetch_add(1, Ordering::SeqCst);
}

/// Routes SIGINT and SIGTERM into `shutdown`. The first signal cancels the
/// run so in-flight jobs are recorded and their environments destroyed; a
/// second one exits the process with status 130.
pub fn install_interrupt_handler(shutdown: CancelToken) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

        let action = SigAction::new(
            SigHandler::Handler(count_interrupt),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for signal in [Signal::SIGINT, Signal::SIGTERM] {
            // SAFETY: the handler only increments an atomic.
            unsafe { sigaction(signal, &action) }
                .map_err(|e| anyhow!("installing {:?} handler: {}", signal, e))?;
        }
    }
    thread::Builder::new()
        .name("apr-interrupts".to_string())
        .spawn(move || {
            forward_interrupts(&INTERRUPTS, &shutdown, INTERRUPT_POLL);
            warn!("interrupted twice; exiting without cleanup");
            std::process::exit(130);
        })?;
    Ok(())
}

/// Cancels `shutdown` once `count` reaches one and returns once it reaches two.
fn forward_interrupts(count: &AtomicUsize, shutdown: &CancelToken, poll: Duration) {
    loop {
        let seen = count.load(Ordering::SeqCst);
        if seen >= 2 {
            return;
        }
        if seen == 1 && !shutdown.is_cancelled() {
            warn!("interrupt received; cancelling jobs (interrupt again to exit immediately)");
            shutdown.cancel();
        }
        thread::sleep(poll);
    }
}

/// Keeps `run_control.json` current while a run is dispatching. A run that
/// unwinds without calling [`RunControlGuard::complete`] is marked failed.
pub struct RunControlGuard {
    run_dir: PathBuf,
    run_id: String,
    total: usize,
    done: bool,
}

impl RunControlGuard {
    pub fn new(run_dir: &Path, run_id: &str, total: usize) -> Result<Self> {
        write_run_control(run_dir, run_id, "running", &[], 0, total)?;
        Ok(Self {
            run_dir: run_dir.to_path_buf(),
            run_id: run_id.to_string(),
            total,
            done: false,
        })
    }

    pub fn progress(&self, active_jobs: &[String], done: usize) {
        if let Err(e) = write_run_control(
            &self.run_dir,
            &self.run_id,
            "running",
            active_jobs,
            done,
            self.total,
        ) {
            warn!(run_id = %self.run_id, error = %e, "failed to update run control");
        }
    }

    pub fn complete(&mut self, status: &str, done: usize) -> Result<()> {
        write_run_control(&self.run_dir, &self.run_id, status, &[], done, self.total)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RunControlGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = write_run_control(&self.run_dir, &self.run_id, "failed", &[], 0, self.total);
        }
    }
}

/// Exclusive ownership of a results root by one dispatcher process.
#[derive(Debug)]
pub struct DispatchLock {
    path: PathBuf,
}

impl Drop for DispatchLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn acquire_dispatch_lock(results_root: &Path) -> Result<DispatchLock> {
    let lock_path = runtime_dir(results_root).join("dispatch.lock");
    ensure_dir(&runtime_dir(results_root))?;
    for _ in 0..2 {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut file) => {
                let payload = format!(
                    "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                    std::process::id(),
                    Utc::now().to_rfc3339()
                );
                let _ = file.write_all(payload.as_bytes());
                let _ = file.sync_all();
                return Ok(DispatchLock { path: lock_path });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = lock_holder(&lock_path);
                match holder {
                    Some(pid) if pid_alive(pid) => {
                        return Err(anyhow!(
                            "dispatch_in_progress: results root {} is owned by pid {}",
                            results_root.display(),
                            pid
                        ));
                    }
                    _ => {
                        warn!(lock = %lock_path.display(), pid = ?holder, "reclaiming stale dispatch lock");
                        let _ = fs::remove_file(&lock_path);
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(anyhow!(
        "dispatch_in_progress: could not acquire {}",
        lock_path.display()
    ))
}

fn lock_holder(path: &Path) -> Option<u32> {
    let bytes = fs::read(path).ok()?;
    let value: Value = serde_json::from_slice(&bytes).ok()?;
    value.get("pid").and_then(|v| v.as_u64()).map(|v| v as u32)
}

fn pid_alive(pid: u32) -> bool {
    if cfg!(target_os = "linux") {
        Path::new("/proc").join(pid.to_string()).exists()
    } else {
        // Without a cheap liveness check, treat the holder as alive.
        true
    }
}
