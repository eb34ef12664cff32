// Pipeline Engine
// Entry point tying trigger filtering, graph building, scheduling and reporting together

use crate::cache::CacheManager;
use crate::config::EngineConfig;
use crate::definition::{PipelineDefinition, TriggerDecision, TriggerEvent};
use crate::error::EngineResult;
use crate::execution::{
    EventSender, ExecutionEvent, JobGraph, JobScheduler, ProgressSender, RunContext,
    SchedulerConfig, StepExecutor,
};
use crate::report::{ResultReporter, RunReport};
use crate::runners::{Provisioner, ProvisionerRegistry};
use crate::utils::resolve_workspace;

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What happened to a run request
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The event did not pass the trigger filters; nothing ran
    Rejected { reason: String },
    /// All jobs reached a terminal status
    Completed {
        report: RunReport,
        /// Where this run's report was written, if persisting it succeeded
        written_to: Option<PathBuf>,
    },
}

impl RunOutcome {
    /// A rejected trigger is not a failure
    pub fn is_success(&self) -> bool {
        match self {
            RunOutcome::Rejected { .. } => true,
            RunOutcome::Completed { report, .. } => report.verdict.is_success(),
        }
    }

    pub fn report(&self) -> Option<&RunReport> {
        match self {
            RunOutcome::Completed { report, .. } => Some(report),
            RunOutcome::Rejected { .. } => None,
        }
    }

    pub fn written_to(&self) -> Option<&Path> {
        match self {
            RunOutcome::Completed { written_to, .. } => written_to.as_deref(),
            RunOutcome::Rejected { .. } => None,
        }
    }
}

/// Runs pipeline definitions against one workspace and cache store
pub struct PipelineEngine {
    config: EngineConfig,
    workspace: PathBuf,
    cache: Arc<CacheManager>,
    provisioners: ProvisionerRegistry,
    event_tx: Option<ProgressSender>,
}

impl PipelineEngine {
    /// Validate the configuration, resolve the workspace and open the cache store
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let workspace = resolve_workspace(config.workspace.as_deref())?;
        let cache = CacheManager::open(config.cache.clone())?;

        tracing::debug!(
            workspace = %workspace.display(),
            cache_root = %cache.root().display(),
            "engine ready"
        );

        Ok(Self {
            config,
            workspace,
            cache: Arc::new(cache),
            provisioners: ProvisionerRegistry::with_defaults(),
            event_tx: None,
        })
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Register an extra toolchain provisioner (replacing one with the same name)
    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioners.register(provisioner);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Run a definition for an event.
    ///
    /// Definition errors (duplicates, unknown dependencies, cycles) abort
    /// before any job starts. Job failures are part of the report, not
    /// errors; so is a report that could not be written.
    pub async fn run(
        &self,
        definition: &PipelineDefinition,
        event: TriggerEvent,
        cancel: CancellationToken,
    ) -> EngineResult<RunOutcome> {
        if let TriggerDecision::Rejected { reason } = definition.trigger.evaluate(&event) {
            tracing::info!(pipeline = %definition.name, %reason, "trigger rejected event");
            self.event_tx
                .send_event(ExecutionEvent::info(format!("Run skipped: {}", reason), None));
            return Ok(RunOutcome::Rejected { reason });
        }

        let graph = JobGraph::build(definition)?;
        let run = Arc::new(RunContext::new(
            definition,
            event.clone(),
            self.workspace.clone(),
        ));

        let mut executor = StepExecutor::new(self.cache.clone())
            .with_provisioners(self.provisioners.clone());
        if let Some(tx) = &self.event_tx {
            executor = executor.with_progress(tx.clone());
        }

        let mut scheduler = JobScheduler::new(
            Arc::new(executor),
            SchedulerConfig {
                max_parallel_jobs: self.config.max_parallel_jobs,
                default_job_timeout: self.config.job_timeout,
            },
        );
        if let Some(tx) = &self.event_tx {
            scheduler = scheduler.with_progress(tx.clone());
        }

        let started_at = Utc::now();
        let result = scheduler.run(&graph, run, cancel).await;
        let report = ResultReporter::build(&result, &event, started_at, Utc::now());

        // Persistence never changes the verdict
        let written_to = match &self.config.report_path {
            Some(path) => {
                match ResultReporter::write_report(&report, path, self.config.report_format) {
                    Ok(()) => Some(path.clone()),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to write run report");
                        self.event_tx.send_event(ExecutionEvent::warning(
                            format!("Failed to write report to {}: {}", path.display(), e),
                            None,
                        ));
                        None
                    }
                }
            }
            None => None,
        };

        Ok(RunOutcome::Completed { report, written_to })
    }
}
