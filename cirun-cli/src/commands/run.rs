use crate::output;

use std::path::{Path, PathBuf};
use std::process::Command;

use clap::Args;
use color_eyre::Result;
use tokio_util::sync::CancellationToken;

use pipeline_engine::execution::LogLevel;
use pipeline_engine::{
    progress_channel, DefinitionParser, EngineConfig, EngineError, EventKind, ExecutionEvent,
    JobStatus, PipelineEngine, ReportFormat, ResultReporter, RunOutcome, StepStatus, TriggerEvent,
    Verdict,
};

/// Run a pipeline definition locally
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Event kind to simulate (push, pull_request, manual)
    #[arg(long, default_value = "push", value_name = "KIND")]
    pub event: EventKind,

    /// Branch the event is for (default: current git branch)
    #[arg(long, value_name = "BRANCH")]
    pub branch: Option<String>,

    /// Commit the event is for (default: current git HEAD)
    #[arg(long, value_name = "SHA")]
    pub commit: Option<String>,

    /// Maximum jobs running at once
    #[arg(long, short = 'j', value_name = "N", env = "CIRUN_MAX_PARALLEL_JOBS")]
    pub jobs: Option<usize>,

    /// Timeout for jobs without timeout-minutes
    #[arg(long, value_name = "MINUTES", env = "CIRUN_JOB_TIMEOUT_MINUTES")]
    pub timeout_minutes: Option<u64>,

    /// Cache store directory
    #[arg(long, value_name = "DIR", env = "CIRUN_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Write the run report to this file
    #[arg(long, value_name = "PATH", env = "CIRUN_REPORT_PATH")]
    pub report: Option<PathBuf>,

    /// Report format (json, junit, terminal); printed to stdout without --report
    #[arg(long, value_name = "FORMAT")]
    pub format: Option<ReportFormat>,

    /// Checkout to run in (default: repository containing the current directory)
    #[arg(long, short = 'w', value_name = "DIR", env = "CIRUN_WORKSPACE")]
    pub workspace: Option<PathBuf>,
}

impl RunArgs {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = EngineConfig::from_env()?;

        if let Some(jobs) = self.jobs {
            config = config.with_max_parallel_jobs(jobs);
        }
        if let Some(minutes) = self.timeout_minutes {
            config = config.with_job_timeout_minutes(minutes)?;
        }
        if let Some(dir) = &self.cache_dir {
            config = config.with_cache_dir(dir);
        }
        if let Some(path) = &self.report {
            let format = self.format.unwrap_or(config.report_format);
            config = config.with_report(path, format);
        }
        if let Some(dir) = &self.workspace {
            config = config.with_workspace(dir);
        }

        Ok(config)
    }
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let pipeline_path = &args.pipeline;

    if !pipeline_path.exists() {
        color_eyre::eyre::bail!("Pipeline file not found: {}", pipeline_path.display());
    }

    output::status("Parsing", &format!("{}", pipeline_path.display()));
    let definition = match DefinitionParser::from_file(pipeline_path) {
        Ok(def) => def,
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    };

    output::info(&format!(
        "Pipeline '{}': {} jobs, {} steps",
        definition.name,
        definition.jobs.len(),
        definition.total_steps()
    ));

    let (tx, mut rx) = progress_channel();
    let config = args.engine_config()?;
    tracing::debug!(?config, "resolved engine configuration");
    let engine = PipelineEngine::new(config)?.with_progress(tx);

    let event = TriggerEvent::new(
        args.event,
        args.branch
            .clone()
            .or_else(|| git_output(engine.workspace(), &["rev-parse", "--abbrev-ref", "HEAD"]))
            .unwrap_or_else(|| "main".to_string()),
        args.commit
            .clone()
            .or_else(|| git_output(engine.workspace(), &["rev-parse", "HEAD"]))
            .unwrap_or_else(|| "unknown".to_string()),
    );
    output::info(&format!(
        "Event: {} on '{}' ({})",
        event.kind, event.branch, event.commit
    ));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Interrupted, cancelling run");
            on_interrupt.cancel();
        }
    });

    // Spawn execution in background
    let exec_handle = tokio::spawn(async move { engine.run(&definition, event, cancel).await });

    // Process events in the foreground
    while let Some(event) = rx.recv().await {
        print_event(&event);
    }

    let outcome = match exec_handle.await? {
        Ok(outcome) => outcome,
        Err(EngineError::Definition(e)) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    let report = match &outcome {
        RunOutcome::Rejected { reason } => {
            output::info(&format!("Nothing to run: {}", reason));
            return Ok(());
        }
        RunOutcome::Completed { report, .. } => report,
    };

    match (outcome.written_to(), &args.report, args.format) {
        (Some(path), _, _) => {
            output::info(&format!("Report written to {}", path.display()));
        }
        (None, None, Some(format)) => println!("{}", ResultReporter::render(report, format)?),
        _ => eprint!("{}", ResultReporter::to_terminal(report)),
    }

    if !outcome.is_success() {
        std::process::exit(1);
    }

    Ok(())
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::PipelineStarted {
            pipeline_name,
            total_jobs,
        } => {
            println!();
            output::header(&format!("Pipeline '{}' ({} jobs)", pipeline_name, total_jobs));
        }

        ExecutionEvent::PipelineCompleted {
            verdict, duration, ..
        } => {
            println!();
            if *verdict == Verdict::Succeeded {
                output::success(&format!(
                    "Pipeline succeeded in {:.2}s",
                    duration.as_secs_f64()
                ));
            } else {
                output::failure(&format!(
                    "Pipeline failed after {:.2}s",
                    duration.as_secs_f64()
                ));
            }
        }

        ExecutionEvent::JobStarted {
            job_name,
            display_name,
            total_steps,
        } => {
            let label = display_name.as_deref().unwrap_or(job_name);
            output::status("Job", &format!("'{}' started ({} steps)", label, total_steps));
        }

        ExecutionEvent::JobCompleted {
            job_name,
            status,
            duration,
        } => {
            let line = format!(
                "    Job '{}' {} ({:.2}s)",
                job_name,
                status.to_string().to_uppercase(),
                duration.as_secs_f64()
            );
            if *status == JobStatus::Succeeded {
                output::dim_success(&line);
            } else {
                output::dim_failure(&line);
            }
        }

        ExecutionEvent::JobSkipped { job_name, reason } => {
            output::warning(&format!("Job '{}' skipped: {}", job_name, reason));
        }

        ExecutionEvent::StepStarted {
            job_name,
            step_name,
            step_index,
        } => {
            output::dim(&format!("{:>16} [Step {}] {}", job_name, step_index + 1, step_name));
        }

        ExecutionEvent::StepOutput {
            job_name,
            output,
            is_error,
            ..
        } => {
            for line in output.lines() {
                if *is_error {
                    output::step_error(job_name, line);
                } else {
                    output::step_output(job_name, line);
                }
            }
        }

        ExecutionEvent::StepCompleted {
            job_name,
            step_index,
            status,
            duration,
            exit_code,
            ..
        } => {
            let exit_info = match exit_code {
                Some(code) if *code != 0 => format!(" (exit code: {})", code),
                _ => String::new(),
            };
            let line = format!(
                "{:>16} [Step {}] {} ({:.2}s){}",
                job_name,
                step_index + 1,
                status.to_string().to_uppercase(),
                duration.as_secs_f64(),
                exit_info,
            );
            match status {
                StepStatus::Succeeded => output::dim_success(&line),
                StepStatus::Failed => output::dim_failure(&line),
                StepStatus::Skipped => output::dim(&line),
            }
        }

        ExecutionEvent::Log { level, message, .. } => match level {
            LogLevel::Error => output::error(message),
            LogLevel::Warning => output::warning(message),
            LogLevel::Info => output::info(message),
            LogLevel::Debug => output::dim(message),
        },
    }
}

/// First line of a git command's stdout, if git is available and succeeds
fn git_output(dir: &Path, args: &[&str]) -> Option<String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }

    let line = String::from_utf8_lossy(&out.stdout).lines().next()?.trim().to_string();
    (!line.is_empty()).then_some(line)
}
