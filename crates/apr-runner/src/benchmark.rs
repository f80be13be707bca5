use anyhow::{anyhow, Context, Result};
use apr_core::BugId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Everything the provisioner needs to materialize one bug.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSpec {
    pub id: BugId,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub bug_id: String,
    /// Host directory holding the buggy program, copied into the job.
    #[serde(default)]
    pub source_directory: Option<PathBuf>,
    #[serde(default)]
    pub commit: Option<String>,
    /// Run inside the environment after creation, from `/experiment`.
    #[serde(default)]
    pub checkout_command: Option<String>,
    #[serde(default)]
    pub build_script: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

pub trait Benchmark: Send + Sync {
    fn name(&self) -> &str;

    fn known_bug_ids(&self) -> BTreeSet<BugId>;

    fn describe(&self, bug: BugId) -> Result<CheckoutSpec>;

    /// Host directory mounted read-only at `/setup`.
    fn setup_dir(&self) -> Option<&Path> {
        None
    }
}

/// Benchmark backed by a `meta-data.json` array of bug records.
#[derive(Debug, Clone)]
pub struct MetadataBenchmark {
    name: String,
    bugs: BTreeMap<BugId, CheckoutSpec>,
    setup_dir: Option<PathBuf>,
}

impl MetadataBenchmark {
    pub fn load(name: &str, metadata_path: &Path, setup_dir: Option<PathBuf>) -> Result<Self> {
        let bytes = fs::read(metadata_path).with_context(|| {
            format!(
                "failed to read benchmark metadata {}",
                metadata_path.display()
            )
        })?;
        let records: Vec<CheckoutSpec> = serde_json::from_slice(&bytes).with_context(|| {
            format!("invalid benchmark metadata {}", metadata_path.display())
        })?;
        let base = metadata_path.parent().unwrap_or(Path::new("."));
        let mut bugs = BTreeMap::new();
        for mut record in records {
            if let Some(dir) = record.source_directory.take() {
                record.source_directory = Some(if dir.is_absolute() {
                    dir
                } else {
                    base.join(dir)
                });
            }
            Self::insert_unique(&mut bugs, name, record)?;
        }
        Ok(Self {
            name: name.to_string(),
            bugs,
            setup_dir,
        })
    }

    pub fn from_records(name: &str, records: Vec<CheckoutSpec>) -> Result<Self> {
        let mut bugs = BTreeMap::new();
        for record in records {
            Self::insert_unique(&mut bugs, name, record)?;
        }
        Ok(Self {
            name: name.to_string(),
            bugs,
            setup_dir: None,
        })
    }

    fn insert_unique(
        bugs: &mut BTreeMap<BugId, CheckoutSpec>,
        name: &str,
        record: CheckoutSpec,
    ) -> Result<()> {
        let id = record.id;
        if bugs.insert(id, record).is_some() {
            return Err(anyhow!(
                "benchmark '{}' lists bug id {} more than once",
                name,
                id
            ));
        }
        Ok(())
    }
}

impl Benchmark for MetadataBenchmark {
    fn name(&self) -> &str {
        &self.name
    }

    fn known_bug_ids(&self) -> BTreeSet<BugId> {
        self.bugs.keys().copied().collect()
    }

    fn describe(&self, bug: BugId) -> Result<CheckoutSpec> {
        self.bugs
            .get(&bug)
            .cloned()
            .ok_or_else(|| anyhow!("benchmark '{}' has no bug {}", self.name, bug))
    }

    fn setup_dir(&self) -> Option<&Path> {
        self.setup_dir.as_deref()
    }
}
