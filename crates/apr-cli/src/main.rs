use anyhow::Result;
use apr_core::{JobOutcome, MatrixError, StoreError};
use apr_runner::{CancelToken, LoadedConfig, Matrix, MatrixRequest, RunRequest, RunResult};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "apr", version = "0.1.0", about = "Automated program repair experiment runner")]
struct Cli {
    /// Verbose logging (overridden by RUST_LOG).
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug)]
struct MatrixArgs {
    #[arg(long, default_value = "apr.yaml")]
    config: PathBuf,
    /// Repair tool; repeat for several.
    #[arg(long = "tool", required = true)]
    tools: Vec<String>,
    #[arg(long)]
    benchmark: String,
    /// Bug selector, e.g. `1159-1161,1170`.
    #[arg(long)]
    bugs: String,
    #[arg(long, default_value_t = 1)]
    runs: u32,
}

impl MatrixArgs {
    fn request(&self) -> MatrixRequest {
        MatrixRequest {
            tools: self.tools.clone(),
            benchmark: self.benchmark.clone(),
            bugs: self.bugs.clone(),
            runs: self.runs,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    Run {
        #[command(flatten)]
        matrix: MatrixArgs,
        #[arg(long, default_value = "repair")]
        task: String,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        per_tool_limit: Option<usize>,
        #[arg(long)]
        timeout_minutes: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    Plan {
        #[command(flatten)]
        matrix: MatrixArgs,
        #[arg(long)]
        json: bool,
    },
    Stop {
        #[arg(long, default_value = "apr.yaml")]
        config: PathBuf,
        #[arg(long, default_value = "operator request")]
        reason: String,
        #[arg(long)]
        json: bool,
    },
    Summarize {
        #[arg(long, default_value = "apr.yaml")]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Status {
        #[command(flatten)]
        matrix: MatrixArgs,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            matrix,
            task,
            concurrency,
            per_tool_limit,
            timeout_minutes,
            json,
        } => {
            let loaded = apr_runner::load_config(&matrix.config)?;
            let request = RunRequest {
                task,
                matrix: matrix.request(),
                concurrency,
                per_tool_limit,
                timeout_minutes,
            };
            let shutdown = CancelToken::new();
            apr_runner::install_interrupt_handler(shutdown.clone())?;
            let result = apr_runner::run_matrix(&loaded, &request, shutdown)?;
            if json {
                let payload = run_result_to_json(&result);
                if result.aborted() {
                    emit_json(&payload);
                    std::process::exit(1);
                }
                return Ok(Some(payload));
            }
            print_run_result(&result);
            if result.aborted() {
                std::process::exit(1);
            }
        }
        Commands::Plan { matrix, json } => {
            let (_, planned) = plan(&matrix)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "matrix": planned,
                })));
            }
            println!("benchmark: {}", planned.benchmark);
            println!("tools: {}", join(planned.tools.iter().map(|t| t.to_string())));
            println!("bugs: {}", join(planned.bugs.iter().map(|b| b.to_string())));
            println!("runs: {}", planned.runs);
            println!("jobs: {}", planned.jobs.len());
            for job in &planned.jobs {
                println!("  {}", job.job_key);
            }
        }
        Commands::Stop {
            config,
            reason,
            json,
        } => {
            let loaded = apr_runner::load_config(&config)?;
            let path = apr_runner::request_stop(&loaded.results_dir(), &reason)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "stop",
                    "stop_request": path.display().to_string(),
                })));
            }
            println!("stop requested: {}", path.display());
        }
        Commands::Summarize { config, json } => {
            let loaded = apr_runner::load_config(&config)?;
            let (summary, path) = apr_runner::summarize_store(&loaded.results_dir())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "summarize",
                    "summary_path": path.display().to_string(),
                    "summary": summary,
                })));
            }
            print!("{}", apr_analysis::render_table(&summary));
            println!("summary: {}", path.display());
        }
        Commands::Status { matrix, json } => {
            let (loaded, planned) = plan(&matrix)?;
            let status = apr_runner::matrix_status(&loaded.results_dir(), &planned)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "total": planned.jobs.len(),
                    "recorded": status.recorded.iter().map(outcome_to_json).collect::<Vec<_>>(),
                    "pending": status.pending,
                })));
            }
            println!(
                "recorded: {} / {}",
                status.recorded.len(),
                planned.jobs.len()
            );
            for outcome in &status.recorded {
                println!("  {} {}", outcome.job_key, outcome.status);
            }
            println!("pending: {}", status.pending.len());
            for key in &status.pending {
                println!("  {}", key);
            }
        }
    }
    Ok(None)
}

fn plan(args: &MatrixArgs) -> Result<(LoadedConfig, Matrix)> {
    let loaded = apr_runner::load_config(&args.config)?;
    let registry = apr_runner::Registry::from_config(&loaded)?;
    let matrix = apr_runner::plan_matrix(&registry, &args.request())?;
    Ok((loaded, matrix))
}

fn error_code(err: &anyhow::Error) -> &'static str {
    if err.downcast_ref::<MatrixError>().is_some() {
        return "invalid_matrix";
    }
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::DuplicateKey(_)) => "invariant_violation",
        Some(_) => "store_error",
        None => "command_failed",
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Plan { json, .. }
        | Commands::Stop { json, .. }
        | Commands::Summarize { json, .. }
        | Commands::Status { json, .. } => *json,
    }
}

fn outcome_to_json(outcome: &JobOutcome) -> Value {
    json!({
        "job_key": outcome.job_key,
        "status": outcome.status,
        "attempts": outcome.attempts,
        "wall_seconds": outcome.wall_seconds(),
        "patches_generated": outcome.patch_stats.generated,
    })
}

fn run_result_to_json(result: &RunResult) -> Value {
    json!({
        "ok": !result.aborted(),
        "command": "run",
        "run_id": result.run_id,
        "run_dir": result.run_dir.display().to_string(),
        "summary_path": result.summary_path.display().to_string(),
        "total": result.dispatch.total,
        "skipped": result.dispatch.skipped,
        "executed": result.dispatch.outcomes.len(),
        "force_terminated": result.dispatch.force_terminated,
        "not_started": result.dispatch.not_started,
        "aborted": result.aborted(),
        "overall": result.summary.overall,
        "per_tool": result.summary.per_tool,
    })
}

fn print_run_result(result: &RunResult) {
    println!("run_id: {}", result.run_id);
    println!("run_dir: {}", result.run_dir.display());
    println!(
        "jobs: {} (skipped {}, executed {}, force-terminated {})",
        result.dispatch.total,
        result.dispatch.skipped,
        result.dispatch.outcomes.len(),
        result.dispatch.force_terminated
    );
    if result.aborted() {
        println!("aborted: {} jobs not started", result.dispatch.not_started);
    }
    print!("{}", apr_analysis::render_table(&result.summary));
    println!("summary: {}", result.summary_path.display());
}

fn join(items: impl Iterator<Item = String>) -> String {
    items.collect::<Vec<_>>().join(",")
}
