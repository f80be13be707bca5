use anyhow::Result;
use apr_core::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir, BugId, JobOutcome, JobStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const SUMMARY_SCHEMA_VERSION: &str = "matrix_summary_v1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub success: usize,
    pub tool_failure: usize,
    pub timeout: usize,
    pub environment_error: usize,
    pub cancelled: usize,
    pub total: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: JobStatus) {
        match status {
            JobStatus::Success => self.success += 1,
            JobStatus::ToolFailure => self.tool_failure += 1,
            JobStatus::Timeout => self.timeout += 1,
            JobStatus::EnvironmentError => self.environment_error += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
        self.total += 1;
    }

    pub fn get(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Success => self.success,
            JobStatus::ToolFailure => self.tool_failure,
            JobStatus::Timeout => self.timeout,
            JobStatus::EnvironmentError => self.environment_error,
            JobStatus::Cancelled => self.cancelled,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPatchTotals {
    pub generated: u64,
    pub plausible: u64,
    pub mean_wall_seconds: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatrixSummary {
    pub per_tool: BTreeMap<String, StatusCounts>,
    pub per_bug: BTreeMap<BugId, StatusCounts>,
    pub overall: StatusCounts,
    pub patches: BTreeMap<String, ToolPatchTotals>,
}

/// Folds outcomes into per-tool, per-bug and overall status counts.
pub fn summarize(outcomes: &[JobOutcome]) -> MatrixSummary {
    let mut summary = MatrixSummary::default();
    let mut wall: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for outcome in outcomes {
        let tool = outcome.tool.to_string();
        summary
            .per_tool
            .entry(tool.clone())
            .or_default()
            .add(outcome.status);
        summary.per_bug.entry(outcome.bug).or_default().add(outcome.status);
        summary.overall.add(outcome.status);

        let totals = summary.patches.entry(tool.clone()).or_default();
        totals.generated += outcome.patch_stats.generated;
        totals.plausible += outcome.patch_stats.plausible;
        let acc = wall.entry(tool).or_insert((0.0, 0));
        acc.0 += outcome.wall_seconds();
        acc.1 += 1;
    }
    for (tool, (secs, n)) in wall {
        if let Some(totals) = summary.patches.get_mut(&tool) {
            totals.mean_wall_seconds = if n == 0 { 0.0 } else { secs / n as f64 };
        }
    }
    summary
}

/// Writes `analysis/summary.json` and `analysis/jobs.jsonl` under `run_dir`.
pub fn write_analysis(
    run_dir: &Path,
    run_id: &str,
    summary: &MatrixSummary,
    outcomes: &[JobOutcome],
    aborted: bool,
) -> Result<PathBuf> {
    let analysis_dir = run_dir.join("analysis");
    ensure_dir(&analysis_dir)?;

    let payload = json!({
        "schema_version": SUMMARY_SCHEMA_VERSION,
        "run_id": run_id,
        "aborted": aborted,
        "created_at": Utc::now().to_rfc3339(),
        "overall": summary.overall,
        "per_tool": summary.per_tool,
        "per_bug": summary.per_bug,
        "patches": summary.patches,
    });
    let summary_path = analysis_dir.join("summary.json");
    atomic_write_json_pretty(&summary_path, &payload)?;

    let mut table = Vec::new();
    for outcome in outcomes {
        let row = json!({
            "job_key": outcome.job_key,
            "tool": outcome.tool,
            "bug": outcome.bug,
            "run_index": outcome.run_index,
            "status": outcome.status,
            "attempts": outcome.attempts,
            "wall_seconds": outcome.wall_seconds(),
            "patches_generated": outcome.patch_stats.generated,
            "patches_plausible": outcome.patch_stats.plausible,
        });
        table.extend_from_slice(serde_json::to_string(&row)?.as_bytes());
        table.push(b'\n');
    }
    atomic_write_bytes(&analysis_dir.join("jobs.jsonl"), &table)?;
    Ok(summary_path)
}

/// Plain-text table of per-tool counts followed by the overall row.
pub fn render_table(summary: &MatrixSummary) -> String {
    let mut out = String::new();
    let name_width = summary
        .per_tool
        .keys()
        .map(|k| k.len())
        .chain(std::iter::once("overall".len()))
        .max()
        .unwrap_or(7);
    out.push_str(&format!(
        "{:<w$}  {:>7}  {:>7}  {:>7}  {:>7}  {:>9}  {:>5}  {:>9}\n",
        "tool",
        "success",
        "failure",
        "timeout",
        "env_err",
        "cancelled",
        "total",
        "plausible",
        w = name_width
    ));
    let row = |name: &str, c: &StatusCounts, plausible: u64| {
        format!(
            "{:<w$}  {:>7}  {:>7}  {:>7}  {:>7}  {:>9}  {:>5}  {:>9}\n",
            name,
            c.success,
            c.tool_failure,
            c.timeout,
            c.environment_error,
            c.cancelled,
            c.total,
            plausible,
            w = name_width
        )
    };
    for (tool, counts) in &summary.per_tool {
        let plausible = summary.patches.get(tool).map(|p| p.plausible).unwrap_or(0);
        out.push_str(&row(tool, counts, plausible));
    }
    let plausible_total = summary.patches.values().map(|p| p.plausible).sum();
    out.push_str(&row("overall", &summary.overall, plausible_total));
    out
}
