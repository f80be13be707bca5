pub mod adapter;
pub mod backend;
pub mod benchmark;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod matrix;
pub mod provision;
pub mod registry;
pub mod selector;
pub mod store;
pub mod supervisor;

#[cfg(test)]
mod testkit;

pub use backend::{CancelToken, DockerBackend, IsolationBackend, LocalBackend};
pub use config::{load_config, BackendKind, ExecutionPolicy, LoadedConfig, ResourceLimits};
pub use control::{install_interrupt_handler, request_stop, stop_request_path};
pub use dispatch::{DispatchOptions, DispatchSummary, Dispatcher};
pub use matrix::{build, plan_matrix, Matrix, MatrixRequest};
pub use registry::Registry;
pub use selector::select;
pub use store::ResultStore;

use anyhow::Result;
use apr_analysis::{summarize, write_analysis, MatrixSummary};
use apr_core::{atomic_write_json_pretty, ensure_dir, JobOutcome};
use chrono::Utc;
use control::{acquire_dispatch_lock, clear_stop_request, RunControlGuard};
use provision::Provisioner;
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use supervisor::JobSupervisor;
use tracing::{info, warn};

/// A matrix request plus command-line overrides of the configured
/// execution policy.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub task: String,
    pub matrix: MatrixRequest,
    pub concurrency: Option<usize>,
    pub per_tool_limit: Option<usize>,
    pub timeout_minutes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub matrix: Matrix,
    pub dispatch: DispatchSummary,
    pub summary: MatrixSummary,
    pub summary_path: PathBuf,
}

impl RunResult {
    pub fn aborted(&self) -> bool {
        self.dispatch.aborted
    }
}

#[derive(Debug, Clone)]
pub struct MatrixStatus {
    pub recorded: Vec<JobOutcome>,
    pub pending: Vec<String>,
}

pub fn backend_for(kind: BackendKind) -> Arc<dyn IsolationBackend> {
    match kind {
        BackendKind::Docker => Arc::new(DockerBackend::default()),
        BackendKind::Local => Arc::new(LocalBackend::new()),
    }
}

pub fn effective_policy(loaded: &LoadedConfig, request: &RunRequest) -> Result<ExecutionPolicy> {
    let mut policy = loaded.config.execution.clone();
    if let Some(concurrency) = request.concurrency {
        policy.concurrency = concurrency;
    }
    if request.per_tool_limit.is_some() {
        policy.per_tool_limit = request.per_tool_limit;
    }
    if let Some(minutes) = request.timeout_minutes {
        policy.timeout_minutes = minutes;
    }
    policy.validate()?;
    Ok(policy)
}

/// Plans the matrix, then dispatches it against the configured backend.
/// Matrix errors surface before the result store is opened.
pub fn run_matrix(
    loaded: &LoadedConfig,
    request: &RunRequest,
    shutdown: CancelToken,
) -> Result<RunResult> {
    let policy = effective_policy(loaded, request)?;
    let registry = Arc::new(Registry::from_config(loaded)?);
    let matrix = plan_matrix(&registry, &request.matrix)?;
    info!(
        task = %request.task,
        benchmark = %matrix.benchmark,
        jobs = matrix.jobs.len(),
        concurrency = policy.concurrency,
        backend = loaded.config.backend.as_str(),
        "matrix planned"
    );
    execute_matrix(
        &loaded.results_dir(),
        registry,
        backend_for(loaded.config.backend),
        loaded.config.resources.clone(),
        &matrix,
        policy,
        &json!({
            "task": request.task,
            "config_digest": loaded.digest,
            "backend": loaded.config.backend.as_str(),
        }),
        shutdown,
    )
}

#[allow(clippy::too_many_arguments)]
pub fn execute_matrix(
    results_root: &Path,
    registry: Arc<Registry>,
    backend: Arc<dyn IsolationBackend>,
    limits: ResourceLimits,
    matrix: &Matrix,
    policy: ExecutionPolicy,
    provenance: &serde_json::Value,
    shutdown: CancelToken,
) -> Result<RunResult> {
    ensure_dir(results_root)?;
    let _lock = acquire_dispatch_lock(results_root)?;
    clear_stop_request(results_root)?;
    let store = Arc::new(ResultStore::open(results_root)?);

    let run_id = format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S_%3f"));
    let run_dir = results_root.join("runs").join(&run_id);
    ensure_dir(&run_dir)?;
    atomic_write_json_pretty(
        &run_dir.join("manifest.json"),
        &json!({
            "schema_version": "run_manifest_v1",
            "run_id": run_id,
            "created_at": Utc::now().to_rfc3339(),
            "provenance": provenance,
            "benchmark": matrix.benchmark,
            "tools": matrix.tools,
            "bugs": matrix.bugs,
            "runs": matrix.runs,
            "job_count": matrix.jobs.len(),
            "already_recorded": matrix.jobs.iter().filter(|j| store.has(&j.job_key)).count(),
            "execution": policy,
            "resources": limits,
        }),
    )?;
    let control = RunControlGuard::new(&run_dir, &run_id, matrix.jobs.len())?;

    let options = DispatchOptions {
        concurrency: policy.concurrency,
        per_tool_limit: policy.per_tool_limit,
        shutdown_grace: policy.shutdown_grace(),
        watchdog: Some(policy.job_timeout() + policy.grace() * 2),
        poll_interval: Duration::from_millis(200),
        stop_root: Some(results_root.to_path_buf()),
    };
    let supervisor = Arc::new(JobSupervisor::new(
        registry,
        Provisioner::new(backend, limits),
        Arc::clone(&store),
        policy,
    ));
    let mut dispatcher = Dispatcher::new(supervisor, shutdown).with_run_control(control);
    let dispatch = dispatcher.run(&matrix.jobs, &options);
    let mut control = dispatcher.into_run_control();
    let dispatch = match dispatch {
        Ok(dispatch) => dispatch,
        Err(err) => {
            // What was recorded before the failure still gets a summary;
            // dropping `control` marks the run failed.
            let outcomes = matrix_outcomes(&store, matrix);
            if let Err(e) =
                write_analysis(&run_dir, &run_id, &summarize(&outcomes), &outcomes, true)
            {
                warn!(run_id = %run_id, error = %e, "failed to write summary of failed run");
            }
            return Err(err);
        }
    };

    let outcomes = matrix_outcomes(&store, matrix);
    let summary = summarize(&outcomes);
    let summary_path = write_analysis(&run_dir, &run_id, &summary, &outcomes, dispatch.aborted)?;
    let status = if dispatch.aborted { "aborted" } else { "completed" };
    if let Some(control) = control.as_mut() {
        control.complete(status, outcomes.len())?;
    }
    info!(run_id = %run_id, status, recorded = outcomes.len(), total = matrix.jobs.len(), "run finished");

    Ok(RunResult {
        run_id,
        run_dir,
        matrix: matrix.clone(),
        dispatch,
        summary,
        summary_path,
    })
}

fn matrix_outcomes(store: &ResultStore, matrix: &Matrix) -> Vec<JobOutcome> {
    let keys = matrix
        .jobs
        .iter()
        .map(|j| j.job_key.as_str())
        .collect::<HashSet<_>>();
    store
        .list()
        .into_iter()
        .filter(|o| keys.contains(o.job_key.as_str()))
        .collect()
}

/// Recorded and still pending keys of `matrix`, in matrix order.
pub fn matrix_status(results_root: &Path, matrix: &Matrix) -> Result<MatrixStatus> {
    let store = ResultStore::open(results_root)?;
    let mut recorded = Vec::new();
    let mut pending = Vec::new();
    for job in &matrix.jobs {
        match store.get(&job.job_key) {
            Some(outcome) => recorded.push(outcome),
            None => pending.push(job.job_key.clone()),
        }
    }
    Ok(MatrixStatus { recorded, pending })
}

/// Aggregates every outcome in the store into
/// `<results_root>/analysis/summary.json`.
pub fn summarize_store(results_root: &Path) -> Result<(MatrixSummary, PathBuf)> {
    let store = ResultStore::open(results_root)?;
    let outcomes = store.list();
    let summary = summarize(&outcomes);
    let path = write_analysis(results_root, "store", &summary, &outcomes, false)?;
    Ok((summary, path))
}
