use apr_core::{sync_dir, temp_sibling, JobOutcome, JobSpec, StoreError};
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

pub const OUTCOME_FILE: &str = "outcome.json";

/// Host directories of one job inside the result store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub dir: PathBuf,
    pub experiment: PathBuf,
    pub output: PathBuf,
    pub logs: PathBuf,
    pub outcome: PathBuf,
}

impl JobPaths {
    /// Logs of one attempt: `logs/attempt_<n>/`.
    pub fn attempt_logs(&self, attempt: u32) -> PathBuf {
        self.logs.join(format!("attempt_{}", attempt))
    }
}

/// Append-only record of job outcomes and artifacts:
/// `<root>/jobs/<tool>/<bug>/run_<n>/{outcome.json, output/, logs/attempt_<a>/}`.
///
/// An outcome becomes visible only once it is complete on disk, and a key
/// can be recorded at most once.
#[derive(Debug)]
pub struct ResultStore {
    root: PathBuf,
    index: Mutex<BTreeMap<String, JobOutcome>>,
}

impl ResultStore {
    /// Opens (creating if needed) the store and loads every recorded outcome.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let jobs = root.join("jobs");
        fs::create_dir_all(&jobs)?;
        let mut index = BTreeMap::new();
        for entry in walkdir::WalkDir::new(&jobs)
            .min_depth(4)
            .max_depth(4)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() || entry.file_name() != OUTCOME_FILE {
                continue;
            }
            let path = entry.path();
            let bytes = fs::read(path)?;
            let outcome: JobOutcome =
                serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                    path: path.display().to_string(),
                    source,
                })?;
            if path.parent() != Some(jobs.join(outcome.rel_dir()).as_path()) {
                warn!(path = %path.display(), job_key = %outcome.job_key, "outcome stored outside its job directory; ignored");
                continue;
            }
            index.insert(outcome.job_key.clone(), outcome);
        }
        debug!(root = %root.display(), recorded = index.len(), "result store opened");
        Ok(Self {
            root: root.to_path_buf(),
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn has(&self, job_key: &str) -> bool {
        self.index
            .lock()
            .map(|idx| idx.contains_key(job_key))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.index.lock().map(|idx| idx.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, job_key: &str) -> Option<JobOutcome> {
        self.index
            .lock()
            .ok()
            .and_then(|idx| idx.get(job_key).cloned())
    }

    /// Recorded outcomes ordered by tool, bug and run index.
    pub fn list(&self) -> Vec<JobOutcome> {
        let mut out = self
            .index
            .lock()
            .map(|idx| idx.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        out.sort_by(|a, b| {
            (&a.tool, a.bug, a.run_index).cmp(&(&b.tool, b.bug, b.run_index))
        });
        out
    }

    /// Publishes `outcome`: temp file, fsync, hard link into place (which
    /// fails if an outcome already exists), then a directory fsync.
    pub fn put(&self, outcome: &JobOutcome) -> Result<(), StoreError> {
        let mut index = self
            .index
            .lock()
            .map_err(|_| StoreError::Io(std::io::Error::other("result store index poisoned")))?;
        if index.contains_key(&outcome.job_key) {
            return Err(StoreError::DuplicateKey(outcome.job_key.clone()));
        }
        let dir = self.root.join("jobs").join(outcome.rel_dir());
        fs::create_dir_all(&dir)?;
        let target = dir.join(OUTCOME_FILE);
        let tmp = temp_sibling(&target);
        let bytes = serde_json::to_vec_pretty(outcome)?;
        let written = write_synced(&tmp, &bytes);
        let linked = written.and_then(|_| fs::hard_link(&tmp, &target));
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::DuplicateKey(outcome.job_key.clone()));
            }
            Err(e) => return Err(StoreError::Io(e)),
        }
        sync_dir(&dir);
        index.insert(outcome.job_key.clone(), outcome.clone());
        Ok(())
    }

    pub fn job_paths(&self, spec: &JobSpec) -> JobPaths {
        let dir = self.root.join("jobs").join(spec.rel_dir());
        JobPaths {
            experiment: dir.join("experiment"),
            output: dir.join("output"),
            logs: dir.join("logs"),
            outcome: dir.join(OUTCOME_FILE),
            dir,
        }
    }

    /// Clears whatever an interrupted earlier attempt left in the job's
    /// directory. Refuses to touch a recorded job.
    pub fn reset_job_dir(&self, spec: &JobSpec) -> Result<JobPaths, StoreError> {
        if self.has(&spec.job_key) {
            return Err(StoreError::DuplicateKey(spec.job_key.clone()));
        }
        let paths = self.job_paths(spec);
        if paths.dir.exists() {
            fs::remove_dir_all(&paths.dir)?;
        }
        for dir in [&paths.experiment, &paths.output, &paths.logs] {
            fs::create_dir_all(dir)?;
        }
        Ok(paths)
    }

    /// Fresh experiment and output directories for a retry. Logs of earlier
    /// attempts are kept.
    pub fn reset_attempt(&self, spec: &JobSpec) -> Result<JobPaths, StoreError> {
        if self.has(&spec.job_key) {
            return Err(StoreError::DuplicateKey(spec.job_key.clone()));
        }
        let paths = self.job_paths(spec);
        for dir in [&paths.experiment, &paths.output] {
            if dir.exists() {
                fs::remove_dir_all(dir)?;
            }
            fs::create_dir_all(dir)?;
        }
        Ok(paths)
    }

    /// Files under the job's output directory, as sorted paths relative to
    /// the job directory.
    pub fn artifacts(&self, spec: &JobSpec) -> Vec<String> {
        let paths = self.job_paths(spec);
        let mut out = walkdir::WalkDir::new(&paths.output)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                e.path()
                    .strip_prefix(&paths.dir)
                    .ok()
                    .map(|rel| rel.to_string_lossy().to_string())
            })
            .collect::<Vec<_>>();
        out.sort();
        out
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
