pub mod error;

pub use error::{EnvironmentError, MatrixError, StoreError};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const OUTCOME_SCHEMA_VERSION: &str = "job_outcome_v1";

/// Numeric index of a benchmark bug.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BugId(pub u64);

impl fmt::Display for BugId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a registered repair tool adapter.
///
/// Restricted to `[A-Za-z0-9_.-]` so that it can be used verbatim as a path
/// component and never contains the `:` job key separator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolName(String);

impl ToolName {
    pub fn new(raw: &str) -> std::result::Result<Self, MatrixError> {
        let invalid = |reason: &str| MatrixError::InvalidToolName {
            name: raw.to_string(),
            reason: reason.to_string(),
        };
        if raw.is_empty() {
            return Err(invalid("name is empty"));
        }
        if raw == "." || raw == ".." {
            return Err(invalid("name is a relative path component"));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || "-_.".contains(*c)))
        {
            return Err(invalid(&format!("character '{}' is not allowed", bad)));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ToolName {
    type Error = MatrixError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        ToolName::new(&value)
    }
}

impl From<ToolName> for String {
    fn from(value: ToolName) -> Self {
        value.0
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn job_key(tool: &ToolName, bug: BugId, run_index: u32) -> String {
    format!("{}:{}:{}", tool, bug, run_index)
}

/// Directory of a job relative to the result store's `jobs/` root.
pub fn job_rel_dir(tool: &ToolName, bug: BugId, run_index: u32) -> PathBuf {
    PathBuf::from(tool.as_str())
        .join(bug.to_string())
        .join(format!("run_{}", run_index))
}

/// One (tool, bug, run-index) execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub tool: ToolName,
    pub benchmark: String,
    pub bug: BugId,
    pub run_index: u32,
    pub job_key: String,
}

impl JobSpec {
    pub fn new(tool: ToolName, benchmark: &str, bug: BugId, run_index: u32) -> Self {
        let job_key = job_key(&tool, bug, run_index);
        Self {
            tool,
            benchmark: benchmark.to_string(),
            bug,
            run_index,
            job_key,
        }
    }

    pub fn rel_dir(&self) -> PathBuf {
        job_rel_dir(&self.tool, self.bug, self.run_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    ToolFailure,
    Timeout,
    EnvironmentError,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Success,
        JobStatus::ToolFailure,
        JobStatus::Timeout,
        JobStatus::EnvironmentError,
        JobStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ToolFailure => "tool_failure",
            Self::Timeout => "timeout",
            Self::EnvironmentError => "environment_error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchStats {
    pub generated: u64,
    pub plausible: u64,
}

/// Terminal record of one job. Written once per job key; its presence in the
/// result store is what marks the job as done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub schema_version: String,
    pub job_key: String,
    pub tool: ToolName,
    pub benchmark: String,
    pub bug: BugId,
    pub run_index: u32,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub attempts: u32,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub artifact_paths: Vec<String>,
    #[serde(default)]
    pub patch_stats: PatchStats,
    #[serde(default)]
    pub error_detail: Option<String>,
}

impl JobOutcome {
    pub fn new(spec: &JobSpec, status: JobStatus, start_time: DateTime<Utc>) -> Self {
        Self {
            schema_version: OUTCOME_SCHEMA_VERSION.to_string(),
            job_key: spec.job_key.clone(),
            tool: spec.tool.clone(),
            benchmark: spec.benchmark.clone(),
            bug: spec.bug,
            run_index: spec.run_index,
            status,
            start_time,
            end_time: Utc::now(),
            attempts: 0,
            exit_code: None,
            artifact_paths: Vec::new(),
            patch_stats: PatchStats::default(),
            error_detail: None,
        }
    }

    pub fn rel_dir(&self) -> PathBuf {
        job_rel_dir(&self.tool, self.bug, self.run_index)
    }

    pub fn wall_seconds(&self) -> f64 {
        let millis = (self.end_time - self.start_time).num_milliseconds().max(0);
        millis as f64 / 1000.0
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Best-effort fsync of a directory so that renames and links inside it
/// survive a crash.
pub fn sync_dir(path: &Path) {
    if let Ok(dir) = fs::File::open(path) {
        let _ = dir.sync_all();
    }
}

/// Sibling temp path used for write-then-publish updates. Dot-prefixed and
/// unique per process and instant.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts))
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp = temp_sibling(path);
    write_synced(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent);
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Digest of a JSON value with object keys sorted at every level.
pub fn canonical_json_digest(value: &Value) -> String {
    let canonical = canonicalize(value);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    format!("sha256:{}", sha256_bytes(&bytes))
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
