use crate::backend::{
    CancelToken, EnvironmentHandle, ExecOutcome, ExecRequest, IsolationBackend, Mount, MountTarget,
};
use crate::benchmark::CheckoutSpec;
use crate::config::{max_job_timeout, ClassifyRule, ToolConfig, ToolKindConfig};
use crate::store::JobPaths;
use anyhow::{anyhow, Result};
use apr_core::{EnvironmentError, JobSpec, PatchStats, ToolName};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Why an adapter step stopped before producing a result.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("job timed out")]
    TimedOut,

    #[error("job cancelled")]
    Cancelled,

    #[error(transparent)]
    Environment(#[from] EnvironmentError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub exit_code: i32,
    pub log_tail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterReport {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub patch_stats: PatchStats,
    pub detail: Option<String>,
}

/// View of a running job handed to adapter steps. Every command goes
/// through [`AdapterContext::exec`], which enforces the job deadline and
/// observes cancellation.
pub struct AdapterContext<'a> {
    pub job: &'a JobSpec,
    pub checkout: &'a CheckoutSpec,
    pub paths: &'a JobPaths,
    pub handle: &'a EnvironmentHandle,
    pub attempt: u32,
    backend: &'a dyn IsolationBackend,
    cancel: &'a CancelToken,
    deadline: Instant,
    timeout: Duration,
}

impl<'a> AdapterContext<'a> {
    pub fn new(
        job: &'a JobSpec,
        checkout: &'a CheckoutSpec,
        paths: &'a JobPaths,
        handle: &'a EnvironmentHandle,
        backend: &'a dyn IsolationBackend,
        cancel: &'a CancelToken,
        attempt: u32,
        timeout: Duration,
    ) -> Self {
        let timeout = timeout.min(max_job_timeout());
        Self {
            job,
            checkout,
            paths,
            handle,
            attempt,
            backend,
            cancel,
            deadline: Instant::now() + timeout,
            timeout,
        }
    }

    pub fn checkpoint(&self) -> Result<(), StepError> {
        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(StepError::TimedOut);
        }
        Ok(())
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Log of `step` in the current attempt only.
    pub fn log_path(&self, step: &str) -> PathBuf {
        self.paths
            .attempt_logs(self.attempt)
            .join(format!("{}.log", step))
    }

    pub fn exec(&self, step: &str, command: &str) -> Result<StepOutput, StepError> {
        self.checkpoint()?;
        let log_path = self.log_path(step);
        debug!(job_key = %self.job.job_key, step, command, "exec");
        let result = self.backend.exec(
            self.handle,
            &ExecRequest {
                command,
                timeout: self.remaining(),
                cancel: self.cancel,
                log_path: &log_path,
            },
        )?;
        match result.outcome {
            ExecOutcome::Exited(exit_code) => Ok(StepOutput {
                exit_code,
                log_tail: result.log_tail,
            }),
            ExecOutcome::TimedOut => Err(StepError::TimedOut),
            ExecOutcome::Cancelled => Err(StepError::Cancelled),
        }
    }

    /// Values substituted for `{name}` placeholders in tool templates.
    pub fn placeholders(&self) -> BTreeMap<&'static str, String> {
        let minutes = self.timeout.as_secs_f64() / 60.0;
        BTreeMap::from([
            ("bug_index", self.job.bug.to_string()),
            ("bug_id", self.checkout.bug_id.clone()),
            ("subject", self.checkout.subject.clone()),
            ("commit", self.checkout.commit.clone().unwrap_or_default()),
            ("job_key", self.job.job_key.clone()),
            ("run_index", self.job.run_index.to_string()),
            ("experiment", self.handle.guest_path(MountTarget::Experiment).to_string()),
            ("setup", self.handle.guest_path(MountTarget::Setup).to_string()),
            ("output", self.handle.guest_path(MountTarget::Output).to_string()),
            ("logs", self.handle.guest_path(MountTarget::Logs).to_string()),
            ("tool_name", self.job.tool.to_string()),
            ("tool_dir", self.handle.guest_path(MountTarget::Tool).to_string()),
            ("timeout_m", format_number(minutes)),
            ("timeout_h", format_number(minutes / 60.0)),
        ])
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as u64)
    } else {
        format!("{:.2}", value)
    }
}

pub const PLACEHOLDERS: [&str; 14] = [
    "bug_index",
    "bug_id",
    "subject",
    "commit",
    "job_key",
    "run_index",
    "experiment",
    "setup",
    "output",
    "logs",
    "tool_name",
    "tool_dir",
    "timeout_m",
    "timeout_h",
];

/// A repair tool, resolved once at registry build into its three phases.
pub trait ToolAdapter: Send + Sync {
    fn name(&self) -> &ToolName;

    fn image(&self) -> &str;

    /// Additional host directories the tool needs inside its environment.
    fn mounts(&self) -> Vec<Mount> {
        Vec::new()
    }

    /// Returns a report when preparation already decided the job.
    fn prepare(&self, _ctx: &AdapterContext<'_>) -> Result<Option<AdapterReport>, StepError> {
        Ok(None)
    }

    fn execute(&self, ctx: &AdapterContext<'_>) -> Result<StepOutput, StepError>;

    fn classify(
        &self,
        ctx: &AdapterContext<'_>,
        execution: &StepOutput,
    ) -> Result<AdapterReport, StepError>;
}

/// Drives prepare, execute and classify, checking for timeout and
/// cancellation between steps.
pub fn run_adapter(
    adapter: &dyn ToolAdapter,
    ctx: &AdapterContext<'_>,
) -> Result<AdapterReport, StepError> {
    ctx.checkpoint()?;
    if let Some(report) = adapter.prepare(ctx)? {
        return Ok(report);
    }
    ctx.checkpoint()?;
    let execution = adapter.execute(ctx)?;
    ctx.checkpoint()?;
    adapter.classify(ctx, &execution)
}

#[derive(Debug, Clone, PartialEq)]
enum Launch {
    Command { execute: String },
    Script { script: PathBuf, args: Vec<String> },
}

/// Tool described entirely by configuration.
#[derive(Debug, Clone)]
pub struct DeclarativeTool {
    name: ToolName,
    image: String,
    prepare: Vec<String>,
    launch: Launch,
    classify: ClassifyRule,
    plausible_marker: Option<String>,
}

impl DeclarativeTool {
    pub fn from_config(cfg: &ToolConfig, base_dir: &Path) -> Result<Self> {
        let name = ToolName::new(&cfg.name)?;
        if cfg.image.trim().is_empty() {
            return Err(anyhow!("tool '{}' has no image", cfg.name));
        }
        let (prepare, launch) = match &cfg.kind {
            ToolKindConfig::Command { prepare, execute } => (
                prepare.clone(),
                Launch::Command {
                    execute: execute.clone(),
                },
            ),
            ToolKindConfig::Script {
                script,
                prepare,
                args,
            } => {
                let script = if script.is_absolute() {
                    script.clone()
                } else {
                    base_dir.join(script)
                };
                if script.file_name().is_none() {
                    return Err(anyhow!("tool '{}' script path has no file name", cfg.name));
                }
                (
                    prepare.clone(),
                    Launch::Script {
                        script,
                        args: args.clone(),
                    },
                )
            }
        };
        let tool = Self {
            name,
            image: cfg.image.clone(),
            prepare,
            launch,
            classify: cfg.classify.clone(),
            plausible_marker: cfg.plausible_marker.clone(),
        };
        for template in tool.templates() {
            validate_template(&tool.name, template)?;
        }
        Ok(tool)
    }

    fn templates(&self) -> Vec<&str> {
        let mut out = self.prepare.iter().map(|s| s.as_str()).collect::<Vec<_>>();
        match &self.launch {
            Launch::Command { execute } => out.push(execute),
            Launch::Script { args, .. } => out.extend(args.iter().map(|s| s.as_str())),
        }
        out
    }

    fn execute_command(&self, ctx: &AdapterContext<'_>) -> String {
        let values = ctx.placeholders();
        match &self.launch {
            Launch::Command { execute } => render_template(execute, &values),
            Launch::Script { script, args } => {
                let file = script
                    .file_name()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                let mut parts = vec![
                    "sh".to_string(),
                    format!("{}/{}", ctx.handle.guest_path(MountTarget::Tool), file),
                ];
                parts.extend(args.iter().map(|a| render_template(a, &values)));
                shell_join(&parts)
            }
        }
    }

    fn patch_extension(&self) -> &str {
        match &self.classify {
            ClassifyRule::PatchFiles { extension } => extension,
            _ => ".patch",
        }
    }
}

impl ToolAdapter for DeclarativeTool {
    fn name(&self) -> &ToolName {
        &self.name
    }

    fn image(&self) -> &str {
        &self.image
    }

    fn mounts(&self) -> Vec<Mount> {
        match &self.launch {
            Launch::Script { script, .. } => script
                .parent()
                .map(|dir| {
                    vec![Mount {
                        host: dir.to_path_buf(),
                        target: MountTarget::Tool,
                        read_only: true,
                    }]
                })
                .unwrap_or_default(),
            Launch::Command { .. } => Vec::new(),
        }
    }

    fn prepare(&self, ctx: &AdapterContext<'_>) -> Result<Option<AdapterReport>, StepError> {
        let values = ctx.placeholders();
        for (idx, template) in self.prepare.iter().enumerate() {
            let command = render_template(template, &values);
            let output = ctx.exec(&format!("prepare_{}", idx + 1), &command)?;
            if output.exit_code != 0 {
                return Ok(Some(AdapterReport {
                    success: false,
                    exit_code: Some(output.exit_code),
                    patch_stats: PatchStats::default(),
                    detail: Some(format!(
                        "prepare step {} exited with {}: {}",
                        idx + 1,
                        output.exit_code,
                        output.log_tail
                    )),
                }));
            }
        }
        Ok(None)
    }

    fn execute(&self, ctx: &AdapterContext<'_>) -> Result<StepOutput, StepError> {
        let command = self.execute_command(ctx);
        ctx.exec("execute", &command)
    }

    fn classify(
        &self,
        ctx: &AdapterContext<'_>,
        execution: &StepOutput,
    ) -> Result<AdapterReport, StepError> {
        let generated = count_files_with_extension(&ctx.paths.output, self.patch_extension());
        let log = fs::read_to_string(ctx.log_path("execute")).unwrap_or_default();
        let plausible = self
            .plausible_marker
            .as_deref()
            .map(|marker| count_marker_lines(&log, marker))
            .unwrap_or(0);
        let success = match &self.classify {
            ClassifyRule::ExitCode => execution.exit_code == 0,
            ClassifyRule::PatchFiles { .. } => generated > 0,
            ClassifyRule::LogMarker { marker } => log.contains(marker.as_str()),
        };
        let detail = if success {
            None
        } else {
            Some(format!(
                "tool exited with {}: {}",
                execution.exit_code, execution.log_tail
            ))
        };
        Ok(AdapterReport {
            success,
            exit_code: Some(execution.exit_code),
            patch_stats: PatchStats {
                generated,
                plausible,
            },
            detail,
        })
    }
}

pub fn render_template(raw: &str, values: &BTreeMap<&'static str, String>) -> String {
    let mut rendered = raw.to_string();
    for (key, value) in values {
        let needle = format!("{{{}}}", key);
        if rendered.contains(&needle) {
            rendered = rendered.replace(&needle, value);
        }
    }
    rendered
}

/// `{name}` placeholders in a template. Shell `${VAR}` expansions are skipped.
fn template_placeholders(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' && (i == 0 || bytes[i - 1] != b'$') {
            if let Some(len) = raw[i + 1..].find('}') {
                let inner = &raw[i + 1..i + 1 + len];
                if !inner.is_empty()
                    && inner.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    out.push(inner.to_string());
                }
                i += len + 1;
            }
        }
        i += 1;
    }
    out
}

fn validate_template(tool: &ToolName, template: &str) -> Result<()> {
    for name in template_placeholders(template) {
        if !PLACEHOLDERS.contains(&name.as_str()) {
            return Err(anyhow!(
                "tool '{}' template uses unknown placeholder {{{}}} (known: {})",
                tool,
                name,
                PLACEHOLDERS.join(", ")
            ));
        }
    }
    Ok(())
}

fn count_files_with_extension(dir: &Path, extension: &str) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy().ends_with(extension))
        .count() as u64
}

fn count_marker_lines(log: &str, marker: &str) -> u64 {
    let marker = marker.to_lowercase();
    log.lines()
        .filter(|line| line.to_lowercase().contains(&marker))
        .count() as u64
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
