use crate::registry::Registry;
use crate::selector::select;
use apr_core::{BugId, JobSpec, MatrixError, ToolName};
use serde::Serialize;

/// Experiment request as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixRequest {
    pub tools: Vec<String>,
    pub benchmark: String,
    pub bugs: String,
    pub runs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Matrix {
    pub benchmark: String,
    pub tools: Vec<ToolName>,
    pub bugs: Vec<BugId>,
    pub runs: u32,
    pub jobs: Vec<JobSpec>,
}

/// Cross product in tool (caller order), bug (ascending), run index order.
/// A tool named twice keeps its first position.
pub fn build(
    tools: &[String],
    benchmark: &str,
    bugs: &[BugId],
    runs: u32,
    registry: &Registry,
) -> Result<Vec<JobSpec>, MatrixError> {
    if tools.is_empty() {
        return Err(MatrixError::NoTools);
    }
    if runs == 0 {
        return Err(MatrixError::InvalidRunCount);
    }
    let mut resolved: Vec<ToolName> = Vec::with_capacity(tools.len());
    for name in tools {
        let tool = registry.tool(name)?.name().clone();
        if !resolved.contains(&tool) {
            resolved.push(tool);
        }
    }
    let mut sorted = bugs.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut jobs = Vec::with_capacity(resolved.len() * sorted.len() * runs as usize);
    for tool in &resolved {
        for bug in &sorted {
            for run_index in 1..=runs {
                jobs.push(JobSpec::new(tool.clone(), benchmark, *bug, run_index));
            }
        }
    }
    Ok(jobs)
}

/// Resolves the bug selector against the benchmark and builds the matrix.
/// Pure: nothing is read from or written to the result store.
pub fn plan_matrix(registry: &Registry, request: &MatrixRequest) -> Result<Matrix, MatrixError> {
    let benchmark = registry.benchmark(&request.benchmark)?;
    let bugs = select(&request.bugs, &benchmark.known_bug_ids())?;
    let jobs = build(&request.tools, &request.benchmark, &bugs, request.runs, registry)?;
    let mut tools: Vec<ToolName> = Vec::new();
    for job in &jobs {
        if !tools.contains(&job.tool) {
            tools.push(job.tool.clone());
        }
    }
    Ok(Matrix {
        benchmark: request.benchmark.clone(),
        tools,
        bugs,
        runs: request.runs,
        jobs,
    })
}
