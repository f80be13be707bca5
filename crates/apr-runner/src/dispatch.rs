use crate::backend::CancelToken;
use crate::control::{stop_requested, RunControlGuard};
use crate::supervisor::{panic_message, JobSupervisor, JobTicket};
use anyhow::{anyhow, Result};
use apr_core::{JobOutcome, JobSpec, JobStatus, StoreError, ToolName};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub concurrency: usize,
    pub per_tool_limit: Option<usize>,
    pub shutdown_grace: Duration,
    /// A job still running this long after entering `Running` is
    /// force-terminated as timed out. Covers adapters that never return.
    pub watchdog: Option<Duration>,
    pub poll_interval: Duration,
    /// Results root polled for a stop request.
    pub stop_root: Option<PathBuf>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            per_tool_limit: None,
            shutdown_grace: Duration::from_secs(60),
            watchdog: None,
            poll_interval: Duration::from_millis(200),
            stop_root: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispatchSummary {
    pub total: usize,
    /// Keys already recorded before this dispatch.
    pub skipped: usize,
    /// Keys listed more than once in the input.
    pub duplicates: usize,
    /// Outcomes recorded by this dispatch, in completion order.
    pub outcomes: Vec<JobOutcome>,
    pub force_terminated: usize,
    /// Jobs never started because of shutdown.
    pub not_started: usize,
    pub aborted: bool,
}

struct InFlight {
    ticket: Arc<JobTicket>,
    slot: usize,
    worker: Option<thread::JoinHandle<()>>,
}

struct Completion {
    job_key: String,
    result: Result<Option<JobOutcome>>,
}

/// Runs jobs on a bounded pool of worker threads, one supervisor per slot.
pub struct Dispatcher {
    supervisor: Arc<JobSupervisor>,
    shutdown: CancelToken,
    control: Option<RunControlGuard>,
}

impl Dispatcher {
    pub fn new(supervisor: Arc<JobSupervisor>, shutdown: CancelToken) -> Self {
        Self {
            supervisor,
            shutdown,
            control: None,
        }
    }

    pub fn with_run_control(mut self, control: RunControlGuard) -> Self {
        self.control = Some(control);
        self
    }

    pub fn into_run_control(self) -> Option<RunControlGuard> {
        self.control
    }

    pub fn run(&mut self, jobs: &[JobSpec], opts: &DispatchOptions) -> Result<DispatchSummary> {
        if opts.concurrency == 0 {
            return Err(anyhow!("concurrency must be at least 1"));
        }
        let store = Arc::clone(self.supervisor.store());
        let mut summary = DispatchSummary {
            total: jobs.len(),
            ..DispatchSummary::default()
        };
        let mut seen = HashSet::new();
        let mut queue: Vec<JobSpec> = Vec::with_capacity(jobs.len());
        for job in jobs {
            if !seen.insert(job.job_key.clone()) {
                summary.duplicates += 1;
                continue;
            }
            queue.push(job.clone());
        }

        let (tx, rx) = mpsc::channel::<Completion>();
        let mut free_slots: BTreeSet<usize> = (0..opts.concurrency).collect();
        let mut in_flight: HashMap<String, InFlight> = HashMap::new();
        let mut per_tool: HashMap<ToolName, usize> = HashMap::new();
        let mut shutdown_at: Option<Instant> = None;
        let mut fatal: Option<anyhow::Error> = None;

        loop {
            if shutdown_at.is_none() && self.shutdown_requested(opts) {
                info!(in_flight = in_flight.len(), queued = queue.len(), "shutdown requested; cancelling in-flight jobs");
                shutdown_at = Some(Instant::now());
                for entry in in_flight.values() {
                    entry.ticket.cancel();
                }
            }

            if shutdown_at.is_none() {
                let mut idx = 0;
                while !free_slots.is_empty() && idx < queue.len() {
                    let at_limit = opts.per_tool_limit.is_some_and(|limit| {
                        per_tool.get(&queue[idx].tool).copied().unwrap_or(0) >= limit
                    });
                    if at_limit {
                        idx += 1;
                        continue;
                    }
                    let job = queue.remove(idx);
                    if store.has(&job.job_key) {
                        debug!(job_key = %job.job_key, "already recorded; skipping");
                        summary.skipped += 1;
                        continue;
                    }
                    if in_flight.contains_key(&job.job_key) {
                        summary.duplicates += 1;
                        continue;
                    }
                    let Some(slot) = free_slots.pop_first() else {
                        break;
                    };
                    let ticket = JobTicket::new(job);
                    let worker = self.spawn_worker(slot, Arc::clone(&ticket), tx.clone())?;
                    *per_tool.entry(ticket.job.tool.clone()).or_insert(0) += 1;
                    info!(
                        job_key = %ticket.job.job_key,
                        tool = %ticket.job.tool,
                        bug = %ticket.job.bug,
                        slot,
                        done = summary.outcomes.len() + summary.skipped,
                        total = summary.total,
                        "dispatched"
                    );
                    in_flight.insert(
                        ticket.job.job_key.clone(),
                        InFlight {
                            ticket,
                            slot,
                            worker: Some(worker),
                        },
                    );
                    self.report_progress(&in_flight, &summary);
                }
            }

            if in_flight.is_empty() && (queue.is_empty() || shutdown_at.is_some()) {
                break;
            }

            match rx.recv_timeout(opts.poll_interval) {
                Ok(done) => {
                    if let Some(mut entry) = in_flight.remove(&done.job_key) {
                        if let Some(worker) = entry.worker.take() {
                            let _ = worker.join();
                        }
                        release(&mut free_slots, &mut per_tool, &entry);
                        match done.result {
                            Ok(Some(outcome)) => {
                                info!(
                                    job_key = %outcome.job_key,
                                    status = outcome.status.as_str(),
                                    done = summary.outcomes.len() + summary.skipped + 1,
                                    total = summary.total,
                                    "completed"
                                );
                                summary.outcomes.push(outcome);
                            }
                            Ok(None) => {}
                            Err(e) if e.downcast_ref::<StoreError>().is_some() => {
                                error!(job_key = %done.job_key, error = %e, "result store failure");
                                if fatal.is_none() {
                                    fatal = Some(e);
                                }
                            }
                            Err(e) => {
                                warn!(job_key = %done.job_key, error = %format!("{:#}", e), "supervisor failed");
                                match self.force_terminate(
                                    &entry.ticket,
                                    JobStatus::EnvironmentError,
                                    &format!("supervisor failed: {:#}", e),
                                ) {
                                    Ok(Some(outcome)) => summary.outcomes.push(outcome),
                                    Ok(None) => {}
                                    Err(e) => {
                                        if fatal.is_none() {
                                            fatal = Some(e);
                                        }
                                    }
                                }
                            }
                        }
                        self.report_progress(&in_flight, &summary);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("dispatcher completion channel closed"));
                }
            }

            if fatal.is_some() && shutdown_at.is_none() {
                shutdown_at = Some(Instant::now());
                for entry in in_flight.values() {
                    entry.ticket.cancel();
                }
            }

            let mut expired: Vec<(String, JobStatus, String)> = Vec::new();
            if let Some(limit) = opts.watchdog {
                for (key, entry) in &in_flight {
                    if entry.ticket.running_for().is_some_and(|d| d >= limit) {
                        expired.push((
                            key.clone(),
                            JobStatus::Timeout,
                            format!("force-terminated after running for {:?}", limit),
                        ));
                    }
                }
            }
            if let Some(at) = shutdown_at {
                if at.elapsed() >= opts.shutdown_grace {
                    for key in in_flight.keys() {
                        if !expired.iter().any(|(k, _, _)| k == key) {
                            expired.push((
                                key.clone(),
                                JobStatus::Cancelled,
                                "force-terminated at shutdown".to_string(),
                            ));
                        }
                    }
                }
            }
            for (key, status, detail) in expired {
                let Some(entry) = in_flight.remove(&key) else {
                    continue;
                };
                warn!(job_key = %key, status = status.as_str(), "force-terminating job");
                release(&mut free_slots, &mut per_tool, &entry);
                match self.force_terminate(&entry.ticket, status, &detail) {
                    Ok(Some(outcome)) => {
                        summary.force_terminated += 1;
                        summary.outcomes.push(outcome);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        if fatal.is_none() {
                            fatal = Some(e);
                        }
                    }
                }
                // The worker is left detached; it can no longer record.
                self.report_progress(&in_flight, &summary);
            }
        }

        if shutdown_at.is_some() {
            summary.aborted = true;
            summary.not_started = queue.iter().filter(|j| !store.has(&j.job_key)).count();
        }
        if let Some(e) = fatal {
            return Err(e);
        }
        info!(
            recorded = summary.outcomes.len(),
            skipped = summary.skipped,
            force_terminated = summary.force_terminated,
            not_started = summary.not_started,
            aborted = summary.aborted,
            "dispatch finished"
        );
        Ok(summary)
    }

    fn shutdown_requested(&self, opts: &DispatchOptions) -> bool {
        self.shutdown.is_cancelled()
            || opts
                .stop_root
                .as_deref()
                .is_some_and(stop_requested)
    }

    fn spawn_worker(
        &self,
        slot: usize,
        ticket: Arc<JobTicket>,
        tx: mpsc::Sender<Completion>,
    ) -> Result<thread::JoinHandle<()>> {
        let supervisor = Arc::clone(&self.supervisor);
        let handle = thread::Builder::new()
            .name(format!("apr-slot-{}", slot))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| supervisor.supervise(&ticket)))
                    .unwrap_or_else(|payload| {
                        Err(anyhow!("supervisor panicked: {}", panic_message(payload.as_ref())))
                    });
                let _ = tx.send(Completion {
                    job_key: ticket.job.job_key.clone(),
                    result,
                });
            })?;
        Ok(handle)
    }

    /// Claims the job, destroys its environment if one is live and records
    /// `status`. Returns `Ok(None)` if the supervisor recorded first.
    fn force_terminate(
        &self,
        ticket: &JobTicket,
        status: JobStatus,
        detail: &str,
    ) -> Result<Option<JobOutcome>> {
        ticket.cancel();
        if !ticket.claim() {
            return Ok(None);
        }
        if let Some(handle) = ticket.take_environment() {
            if let Err(e) = self.supervisor.backend().destroy(&handle) {
                warn!(job_key = %ticket.job.job_key, error = %e, "forced teardown failed");
            }
        }
        let store = self.supervisor.store();
        let mut outcome = JobOutcome::new(&ticket.job, status, ticket.started_at());
        outcome.attempts = ticket.attempts();
        outcome.error_detail = Some(detail.to_string());
        outcome.artifact_paths = store.artifacts(&ticket.job);
        store.put(&outcome)?;
        Ok(Some(outcome))
    }

    fn report_progress(&self, in_flight: &HashMap<String, InFlight>, summary: &DispatchSummary) {
        if let Some(control) = &self.control {
            let mut active = in_flight.keys().cloned().collect::<Vec<_>>();
            active.sort();
            control.progress(&active, summary.outcomes.len() + summary.skipped);
        }
    }
}

fn release(
    free_slots: &mut BTreeSet<usize>,
    per_tool: &mut HashMap<ToolName, usize>,
    entry: &InFlight,
) {
    free_slots.insert(entry.slot);
    if let Some(count) = per_tool.get_mut(&entry.ticket.job.tool) {
        *count = count.saturating_sub(1);
    }
}
