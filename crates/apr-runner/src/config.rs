use anyhow::{anyhow, Context, Result};
use apr_core::{canonical_json_digest, JobStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub execution: ExecutionPolicy,
    #[serde(default)]
    pub benchmarks: Vec<BenchmarkConfig>,
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Docker,
    Local,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    #[default]
    None,
    Bridge,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub disk_gb: Option<u64>,
    #[serde(default)]
    pub network: NetworkPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryTrigger {
    EnvironmentError,
    Timeout,
}

/// One week.
pub const MAX_TIMEOUT_MINUTES: u64 = 7 * 24 * 60;
pub const MAX_GRACE_SECONDS: u64 = 60 * 60;

pub fn max_job_timeout() -> Duration {
    Duration::from_secs(MAX_TIMEOUT_MINUTES * 60)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub per_tool_limit: Option<usize>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub retry_on: Vec<RetryTrigger>,
}

fn default_timeout_minutes() -> u64 {
    60
}

fn default_grace_seconds() -> u64 {
    30
}

fn default_shutdown_grace_seconds() -> u64 {
    60
}

fn default_concurrency() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            timeout_minutes: default_timeout_minutes(),
            grace_seconds: default_grace_seconds(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
            concurrency: default_concurrency(),
            per_tool_limit: None,
            max_attempts: default_max_attempts(),
            retry_on: Vec::new(),
        }
    }
}

impl ExecutionPolicy {
    pub fn job_timeout(&self) -> Duration {
        self.timeout_minutes
            .checked_mul(60)
            .map(Duration::from_secs)
            .unwrap_or_else(max_job_timeout)
            .min(max_job_timeout())
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_seconds.min(MAX_GRACE_SECONDS))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds.min(MAX_GRACE_SECONDS))
    }

    /// Tool failures are never retried: they are a valid experimental result.
    pub fn should_retry(&self, status: JobStatus, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match status {
            JobStatus::EnvironmentError => self.retry_on.contains(&RetryTrigger::EnvironmentError),
            JobStatus::Timeout => self.retry_on.contains(&RetryTrigger::Timeout),
            JobStatus::Success | JobStatus::ToolFailure | JobStatus::Cancelled => false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(anyhow!("execution.concurrency must be at least 1"));
        }
        if self.per_tool_limit == Some(0) {
            return Err(anyhow!("execution.per_tool_limit must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow!("execution.max_attempts must be at least 1"));
        }
        if self.timeout_minutes == 0 {
            return Err(anyhow!("execution.timeout_minutes must be at least 1"));
        }
        if self.timeout_minutes > MAX_TIMEOUT_MINUTES {
            return Err(anyhow!(
                "execution.timeout_minutes must be at most {} (got {})",
                MAX_TIMEOUT_MINUTES,
                self.timeout_minutes
            ));
        }
        for (field, value) in [
            ("grace_seconds", self.grace_seconds),
            ("shutdown_grace_seconds", self.shutdown_grace_seconds),
        ] {
            if value > MAX_GRACE_SECONDS {
                return Err(anyhow!(
                    "execution.{} must be at most {} (got {})",
                    field,
                    MAX_GRACE_SECONDS,
                    value
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    pub name: String,
    pub metadata: PathBuf,
    #[serde(default)]
    pub setup_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    pub image: String,
    #[serde(flatten)]
    pub kind: ToolKindConfig,
    #[serde(default)]
    pub classify: ClassifyRule,
    #[serde(default)]
    pub plausible_marker: Option<String>,
}

/// How a tool is launched inside its environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolKindConfig {
    Command {
        #[serde(default)]
        prepare: Vec<String>,
        execute: String,
    },
    Script {
        script: PathBuf,
        #[serde(default)]
        prepare: Vec<String>,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ClassifyRule {
    #[default]
    ExitCode,
    PatchFiles {
        #[serde(default = "default_patch_extension")]
        extension: String,
    },
    LogMarker {
        marker: String,
    },
}

fn default_patch_extension() -> String {
    ".patch".to_string()
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: OrchestratorConfig,
    pub base_dir: PathBuf,
    pub digest: String,
}

impl LoadedConfig {
    pub fn results_dir(&self) -> PathBuf {
        self.resolve(&self.config.results_dir)
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

pub fn load_config(path: &Path) -> Result<LoadedConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from("."));
    parse_config(&raw, base_dir)
}

pub fn parse_config(raw: &str, base_dir: PathBuf) -> Result<LoadedConfig> {
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(raw)?;
    let json_value: Value = serde_json::to_value(yaml_value)?;
    let config: OrchestratorConfig = serde_json::from_value(json_value.clone())
        .map_err(|e| anyhow!("invalid orchestrator config: {}", e))?;
    config.execution.validate()?;
    let digest = canonical_json_digest(&json_value);
    Ok(LoadedConfig {
        config,
        base_dir,
        digest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
results_dir: out
backend: local
resources:
  cpus: 2
  memory_mb: 4096
  network: bridge
execution:
  timeout_minutes: 90
  concurrency: 4
  per_tool_limit: 2
  max_attempts: 2
  retry_on: [environment_error]
benchmarks:
  - name: bugsdotjar
    metadata: benchmark/meta-data.json
    setup_dir: benchmark/setup
tools:
  - name: nopol
    image: nopol:latest
    kind: command
    prepare: ["bash {setup}/build.sh"]
    execute: "java -jar /opt/nopol.jar --source {experiment}"
    classify: { rule: patch_files }
  - name: llama
    image: "repairllama@sha256:84e6"
    kind: script
    script: tools/llama.sh
    args: ["{bug_id}"]
    classify: { rule: log_marker, marker: "found solution" }
    plausible_marker: "found solution,"
"#;

    #[test]
    fn parse_config_reads_tagged_tools_and_policy() {
        let loaded = parse_config(SAMPLE, PathBuf::from("/cfg")).expect("parse");
        let cfg = &loaded.config;
        assert_eq!(cfg.backend, BackendKind::Local);
        assert_eq!(cfg.resources.network, NetworkPolicy::Bridge);
        assert_eq!(cfg.execution.concurrency, 4);
        assert_eq!(cfg.execution.grace_seconds, 30);
        assert_eq!(cfg.tools.len(), 2);
        assert!(matches!(cfg.tools[0].kind, ToolKindConfig::Command { .. }));
        assert_eq!(
            cfg.tools[0].classify,
            ClassifyRule::PatchFiles {
                extension: ".patch".to_string()
            }
        );
        assert!(matches!(cfg.tools[1].kind, ToolKindConfig::Script { .. }));
        assert_eq!(loaded.results_dir(), PathBuf::from("/cfg/out"));
        assert!(loaded.digest.starts_with("sha256:"));
    }

    #[test]
    fn retry_policy_never_retries_tool_failure() {
        let policy = ExecutionPolicy {
            max_attempts: 3,
            retry_on: vec![RetryTrigger::EnvironmentError, RetryTrigger::Timeout],
            ..ExecutionPolicy::default()
        };
        assert!(policy.should_retry(JobStatus::EnvironmentError, 1));
        assert!(policy.should_retry(JobStatus::Timeout, 2));
        assert!(!policy.should_retry(JobStatus::Timeout, 3));
        assert!(!policy.should_retry(JobStatus::ToolFailure, 1));
        assert!(!policy.should_retry(JobStatus::Cancelled, 1));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = parse_config("execution:\n  concurrency: 0\n", PathBuf::from("/"))
            .expect_err("must fail");
        assert!(err.to_string().contains("concurrency"), "{}", err);
    }

    #[test]
    fn oversized_timeouts_are_rejected_not_wrapped() {
        let huge = ExecutionPolicy {
            timeout_minutes: u64::MAX,
            ..ExecutionPolicy::default()
        };
        let err = huge.validate().expect_err("u64::MAX minutes");
        assert!(err.to_string().contains("timeout_minutes"), "{}", err);
        assert_eq!(huge.job_timeout(), max_job_timeout());

        let week = ExecutionPolicy {
            timeout_minutes: MAX_TIMEOUT_MINUTES,
            ..ExecutionPolicy::default()
        };
        assert!(week.validate().is_ok());
        assert!(ExecutionPolicy {
            timeout_minutes: MAX_TIMEOUT_MINUTES + 1,
            ..ExecutionPolicy::default()
        }
        .validate()
        .is_err());

        let err = parse_config("execution:\n  grace_seconds: 99999999\n", PathBuf::from("/"))
            .expect_err("grace");
        assert!(err.to_string().contains("grace_seconds"), "{}", err);
    }
}
