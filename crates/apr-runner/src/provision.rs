use crate::backend::{
    EnvironmentHandle, EnvironmentRequest, ExecOutcome, ExecRequest, IsolationBackend, Mount,
    MountTarget,
};
use crate::benchmark::CheckoutSpec;
use crate::config::ResourceLimits;
use crate::store::JobPaths;
use crate::supervisor::JobTicket;
use anyhow::Result;
use apr_core::{ensure_dir, EnvironmentError, JobSpec};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(unix)]
use std::os::unix::fs::symlink;

/// Inputs bound into one environment creation call.
pub struct ProvisionInputs<'a> {
    pub checkout: &'a CheckoutSpec,
    pub setup_dir: Option<&'a Path>,
    pub paths: &'a JobPaths,
    pub image: &'a str,
    pub tool_mounts: Vec<Mount>,
    pub checkout_timeout: Duration,
}

/// Turns a job into a ready environment: the bug checkout copied into the
/// job's experiment directory, mounts and resource limits applied, and the
/// benchmark checkout command run inside it.
pub struct Provisioner {
    backend: Arc<dyn IsolationBackend>,
    limits: ResourceLimits,
}

impl Provisioner {
    pub fn new(backend: Arc<dyn IsolationBackend>, limits: ResourceLimits) -> Self {
        Self { backend, limits }
    }

    pub fn backend(&self) -> &Arc<dyn IsolationBackend> {
        &self.backend
    }

    pub fn provision(
        &self,
        ticket: &Arc<JobTicket>,
        inputs: ProvisionInputs<'_>,
    ) -> Result<EnvironmentLease, EnvironmentError> {
        let job = &ticket.job;
        let paths = inputs.paths;
        materialize_checkout(inputs.checkout, &paths.experiment)?;
        for dir in [&paths.output, &paths.logs] {
            ensure_dir(dir).map_err(|e| EnvironmentError::Inputs(e.to_string()))?;
        }

        let mut mounts = vec![
            Mount {
                host: paths.experiment.clone(),
                target: MountTarget::Experiment,
                read_only: false,
            },
            Mount {
                host: paths.output.clone(),
                target: MountTarget::Output,
                read_only: false,
            },
            Mount {
                host: paths.logs.clone(),
                target: MountTarget::Logs,
                read_only: false,
            },
        ];
        if let Some(setup) = inputs.setup_dir {
            if !setup.is_dir() {
                return Err(EnvironmentError::Inputs(format!(
                    "setup directory missing: {}",
                    setup.display()
                )));
            }
            mounts.push(Mount {
                host: setup.to_path_buf(),
                target: MountTarget::Setup,
                read_only: true,
            });
        }
        mounts.extend(inputs.tool_mounts);

        let request = EnvironmentRequest {
            job,
            image: inputs.image,
            limits: &self.limits,
            mounts,
            env: job_env(job, inputs.checkout),
        };
        let handle = self.backend.create(&request)?;
        debug!(job_key = %job.job_key, environment = %handle.id, backend = self.backend.name(), "environment created");

        if !ticket.install_environment(handle.clone()) {
            // Force-terminated while the environment was being created.
            let _ = self.backend.destroy(&handle);
            return Err(EnvironmentError::Create(
                "job was terminated during provisioning".to_string(),
            ));
        }
        let lease = EnvironmentLease {
            backend: Arc::clone(&self.backend),
            ticket: Arc::clone(ticket),
            handle,
            released: false,
        };

        if let Some(command) = inputs.checkout.checkout_command.as_deref() {
            let log_path = paths.attempt_logs(ticket.attempts()).join("checkout.log");
            let result = self.backend.exec(
                &lease.handle,
                &ExecRequest {
                    command,
                    timeout: inputs.checkout_timeout,
                    cancel: ticket.cancel_token(),
                    log_path: &log_path,
                },
            );
            let failure = match result {
                Ok(r) => match r.outcome {
                    ExecOutcome::Exited(0) => None,
                    ExecOutcome::Exited(code) => {
                        Some(format!("exit code {}: {}", code, r.log_tail))
                    }
                    ExecOutcome::TimedOut => Some("checkout command timed out".to_string()),
                    ExecOutcome::Cancelled => Some("checkout command cancelled".to_string()),
                },
                Err(e) => Some(e.to_string()),
            };
            if let Some(detail) = failure {
                if let Err(e) = lease.release() {
                    warn!(job_key = %job.job_key, error = %e, "teardown after failed checkout");
                }
                return Err(EnvironmentError::Checkout(detail));
            }
        }
        Ok(lease)
    }
}

fn job_env(job: &JobSpec, checkout: &CheckoutSpec) -> BTreeMap<String, String> {
    let mut env = BTreeMap::from([
        ("APR_JOB_KEY".to_string(), job.job_key.clone()),
        ("APR_TOOL".to_string(), job.tool.to_string()),
        ("APR_BENCHMARK".to_string(), job.benchmark.clone()),
        ("APR_BUG_INDEX".to_string(), job.bug.to_string()),
        ("APR_RUN_INDEX".to_string(), job.run_index.to_string()),
        ("APR_BUG_ID".to_string(), checkout.bug_id.clone()),
        ("APR_SUBJECT".to_string(), checkout.subject.clone()),
    ]);
    if let Some(commit) = &checkout.commit {
        env.insert("APR_COMMIT".to_string(), commit.clone());
    }
    env
}

fn materialize_checkout(checkout: &CheckoutSpec, experiment: &Path) -> Result<(), EnvironmentError> {
    ensure_dir(experiment).map_err(|e| EnvironmentError::Inputs(e.to_string()))?;
    let Some(source) = checkout.source_directory.as_deref() else {
        return Ok(());
    };
    if !source.is_dir() {
        return Err(EnvironmentError::Inputs(format!(
            "bug {} source directory missing: {}",
            checkout.id,
            source.display()
        )));
    }
    copy_dir_filtered(source, experiment, &["target"]).map_err(|e| {
        EnvironmentError::Inputs(format!(
            "copy {} -> {}: {}",
            source.display(),
            experiment.display(),
            e
        ))
    })
}

/// Recursive copy skipping top-level entries named in `exclude`. Symlinks
/// are followed; dangling ones are recreated as links.
pub fn copy_dir_filtered(src: &Path, dst: &Path, exclude: &[&str]) -> Result<()> {
    let walker = walkdir::WalkDir::new(src).into_iter().filter_entry(|e| {
        let rel = e.path().strip_prefix(src).unwrap_or(e.path());
        rel.as_os_str().is_empty() || !exclude.iter().any(|ex| rel.starts_with(ex))
    });
    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        let rel = match path.strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let target = dst.join(rel);
        let kind = entry.file_type();
        if kind.is_dir() {
            ensure_dir(&target)?;
        } else if kind.is_symlink() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            match fs::canonicalize(path) {
                Ok(real) if real.is_dir() => copy_dir_filtered(&real, &target, &[])?,
                Ok(real) if real.is_file() => {
                    fs::copy(real, &target)?;
                }
                Ok(_) => {}
                Err(_) => {
                    let link_target = fs::read_link(path)?;
                    let _ = fs::remove_file(&target);
                    #[cfg(unix)]
                    {
                        symlink(&link_target, &target)?;
                    }
                }
            }
        } else if kind.is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(path, &target)?;
        }
    }
    Ok(())
}

/// Scoped ownership of a job's environment. The environment is destroyed
/// by [`EnvironmentLease::release`] or, failing that, on drop. If the
/// dispatcher force-terminated the job and already took the handle, the
/// lease leaves it alone.
pub struct EnvironmentLease {
    backend: Arc<dyn IsolationBackend>,
    ticket: Arc<JobTicket>,
    handle: EnvironmentHandle,
    released: bool,
}

impl EnvironmentLease {
    pub fn handle(&self) -> &EnvironmentHandle {
        &self.handle
    }

    pub fn interrupt(&self, grace: Duration) -> Result<(), EnvironmentError> {
        self.backend.interrupt(&self.handle, grace)
    }

    pub fn release(mut self) -> Result<(), EnvironmentError> {
        self.released = true;
        self.destroy_owned()
    }

    fn destroy_owned(&self) -> Result<(), EnvironmentError> {
        match self.ticket.take_environment() {
            Some(handle) => {
                debug!(job_key = %self.ticket.job.job_key, environment = %handle.id, "destroying environment");
                self.backend.destroy(&handle)
            }
            None => Ok(()),
        }
    }
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.destroy_owned() {
                warn!(job_key = %self.ticket.job.job_key, error = %e, "environment teardown on drop failed");
            }
        }
    }
}
