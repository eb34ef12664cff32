// Job Scheduler
// Drives the per-job state machine over a job graph with bounded parallelism

use crate::definition::Job;
use crate::error::ExecutionError;
use crate::execution::context::{JobScope, RunContext};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::JobGraph;
use crate::execution::result::{JobResult, JobStatus, RunResult, StepResult, Verdict};
use crate::runners::StepRunner;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum jobs running at once (at least 1)
    pub max_parallel_jobs: usize,
    /// Time budget for jobs without `timeout-minutes`
    pub default_job_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: 4,
            default_job_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// Runs every job of a graph once.
///
/// A job becomes ready when all of its dependencies succeeded and is skipped
/// as soon as one of them failed or was skipped. Ready jobs are dispatched
/// in the order they became ready, never more than `max_parallel_jobs` at a
/// time; steps within a job run sequentially.
pub struct JobScheduler {
    runner: Arc<dyn StepRunner>,
    config: SchedulerConfig,
    event_tx: Option<ProgressSender>,
}

impl JobScheduler {
    pub fn new(runner: Arc<dyn StepRunner>, config: SchedulerConfig) -> Self {
        Self {
            runner,
            config,
            event_tx: None,
        }
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Run all jobs to a terminal status.
    ///
    /// Cancelling `cancel` kills in-flight steps (their jobs fail with
    /// `Cancelled`) and skips every job that has not started yet.
    pub async fn run(
        &self,
        graph: &JobGraph,
        run: Arc<RunContext>,
        cancel: CancellationToken,
    ) -> RunResult {
        let start = Instant::now();
        let limit = self.config.max_parallel_jobs.max(1);

        let mut results: Vec<JobResult> = graph
            .nodes()
            .iter()
            .map(|node| JobResult::new(node.name(), node.job.optional))
            .collect();
        let mut ready: VecDeque<usize> = VecDeque::new();
        let mut running: JoinSet<(usize, JobResult)> = JoinSet::new();

        self.event_tx.send_event(ExecutionEvent::pipeline_started(
            &run.pipeline_name,
            graph.len(),
        ));
        tracing::info!(
            pipeline = %run.pipeline_name,
            jobs = graph.len(),
            max_parallel_jobs = limit,
            "starting pipeline run"
        );

        loop {
            if cancel.is_cancelled() {
                ready.clear();
                self.skip_unstarted(graph, &mut results, "pipeline run was cancelled");
            } else {
                self.promote(graph, &mut results, &mut ready);
            }

            while running.len() < limit {
                let Some(index) = ready.pop_front() else {
                    break;
                };
                results[index].status = JobStatus::Running;
                self.dispatch(&mut running, graph, index, run.clone(), &cancel);
            }

            match running.join_next().await {
                Some(Ok((index, result))) => {
                    tracing::info!(
                        job = %result.job_name,
                        status = %result.status,
                        duration_ms = result.duration.as_millis() as u64,
                        "job finished"
                    );
                    self.event_tx.send_event(ExecutionEvent::job_completed(
                        &result.job_name,
                        result.status,
                        result.duration,
                    ));
                    results[index] = result;
                }
                Some(Err(e)) => {
                    // The job stays non-terminal and is failed below
                    tracing::error!(error = %e, "job supervisor task failed");
                }
                None => break,
            }
        }

        for result in results.iter_mut().filter(|r| !r.status.is_terminal()) {
            result.status = JobStatus::Failed;
            result.error = Some(ExecutionError::internal("job never reached a final status"));
        }

        let verdict = Verdict::from_jobs(&results);
        let duration = start.elapsed();

        self.event_tx.send_event(ExecutionEvent::pipeline_completed(
            &run.pipeline_name,
            verdict,
            duration,
        ));
        tracing::info!(pipeline = %run.pipeline_name, %verdict, "pipeline run finished");

        RunResult {
            pipeline_name: run.pipeline_name.clone(),
            jobs: results,
            duration,
            verdict,
        }
    }

    /// Move pending jobs to ready or skipped until nothing changes
    fn promote(&self, graph: &JobGraph, results: &mut [JobResult], ready: &mut VecDeque<usize>) {
        loop {
            let mut changed = false;

            for node in graph.nodes() {
                let i = node.index;
                if results[i].status != JobStatus::Pending {
                    continue;
                }

                let blocked_by = node.dependencies.iter().copied().find(|&d| {
                    matches!(results[d].status, JobStatus::Failed | JobStatus::Skipped)
                });

                if let Some(dep) = blocked_by {
                    let reason = format!(
                        "dependency '{}' {}",
                        results[dep].job_name, results[dep].status
                    );
                    self.skip(&node.job, &mut results[i], reason);
                    changed = true;
                } else if node
                    .dependencies
                    .iter()
                    .all(|&d| results[d].status == JobStatus::Succeeded)
                {
                    results[i].status = JobStatus::Ready;
                    ready.push_back(i);
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }
    }

    fn skip_unstarted(&self, graph: &JobGraph, results: &mut [JobResult], reason: &str) {
        for node in graph.nodes() {
            let result = &mut results[node.index];
            if matches!(result.status, JobStatus::Pending | JobStatus::Ready) {
                self.skip(&node.job, result, reason.to_string());
            }
        }
    }

    fn skip(&self, job: &Job, result: &mut JobResult, reason: String) {
        tracing::info!(job = %job.name, %reason, "skipping job");
        result.status = JobStatus::Skipped;
        result.steps = job
            .steps
            .iter()
            .map(|step| StepResult::skipped(step.label(), step.kind.as_str()))
            .collect();
        self.event_tx
            .send_event(ExecutionEvent::job_skipped(&job.name, reason));
    }

    fn dispatch(
        &self,
        running: &mut JoinSet<(usize, JobResult)>,
        graph: &JobGraph,
        index: usize,
        run: Arc<RunContext>,
        cancel: &CancellationToken,
    ) {
        let job = graph.nodes()[index].job.clone();
        let timeout = job.timeout.unwrap_or(self.config.default_job_timeout);
        let runner = self.runner.clone();
        let event_tx = self.event_tx.clone();
        let job_cancel = cancel.child_token();

        running.spawn(async move {
            let name = job.name.clone();
            let optional = job.optional;
            let handle = tokio::spawn(run_job(runner, job, run, timeout, job_cancel, event_tx));

            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(job = %name, error = %e, "job task panicked");
                    JobResult {
                        status: JobStatus::Failed,
                        error: Some(ExecutionError::internal(format!("job task failed: {}", e))),
                        ..JobResult::new(name, optional)
                    }
                }
            };

            (index, result)
        });
    }
}

/// Run one job's steps under its time budget
async fn run_job(
    runner: Arc<dyn StepRunner>,
    job: Arc<Job>,
    run: Arc<RunContext>,
    timeout: Duration,
    cancel: CancellationToken,
    event_tx: Option<ProgressSender>,
) -> JobResult {
    let start = Instant::now();
    let mut result = JobResult::new(&job.name, job.optional);
    result.status = JobStatus::Running;

    event_tx.send_event(ExecutionEvent::job_started(
        &job.name,
        job.display_name.clone(),
        job.steps.len(),
    ));
    tracing::info!(job = %job.name, timeout_ms = timeout.as_millis() as u64, "starting job");

    let mut scope = JobScope::new(run, job.name.clone(), job.env.clone());
    let mut steps: Vec<StepResult> = Vec::with_capacity(job.steps.len());
    let mut timed_out = false;

    let outcome = {
        let steps_fut = run_steps(
            runner.as_ref(),
            &job,
            &mut scope,
            &cancel,
            &event_tx,
            &mut steps,
        );
        tokio::pin!(steps_fut);

        tokio::select! {
            outcome = &mut steps_fut => outcome,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(job = %job.name, timeout_ms = timeout.as_millis() as u64, "job timed out");
                timed_out = true;
                cancel.cancel();
                // Wait for the in-flight step to be killed and cleaned up
                let _ = (&mut steps_fut).await;
                Err(ExecutionError::timeout(timeout))
            }
        }
    };

    if timed_out {
        if let Some(step) = steps.last_mut() {
            if step.error == Some(ExecutionError::Cancelled) {
                step.error = outcome.as_ref().err().cloned();
            }
        }
    }

    for (index, step) in job.steps.iter().enumerate().skip(steps.len()) {
        let skipped = StepResult::skipped(step.label(), step.kind.as_str());
        event_tx.send_event(ExecutionEvent::step_completed(
            &job.name,
            &skipped.step_name,
            index,
            skipped.status,
            Duration::ZERO,
            None,
        ));
        steps.push(skipped);
    }

    match outcome {
        Ok(()) => result.status = JobStatus::Succeeded,
        Err(error) => {
            result.status = JobStatus::Failed;
            result.error = Some(error);
        }
    }

    result.steps = steps;
    result.duration = start.elapsed();
    result
}

/// Run steps in order until one fails without `continue-on-error`
async fn run_steps(
    runner: &dyn StepRunner,
    job: &Job,
    scope: &mut JobScope,
    cancel: &CancellationToken,
    event_tx: &Option<ProgressSender>,
    steps: &mut Vec<StepResult>,
) -> Result<(), ExecutionError> {
    for (index, step) in job.steps.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let label = step.label();
        event_tx.send_event(ExecutionEvent::step_started(&job.name, &label, index));
        tracing::debug!(job = %job.name, step = %label, index, "starting step");

        let step_result = runner.run_step(step, index, scope, cancel).await;

        event_tx.send_event(ExecutionEvent::step_completed(
            &job.name,
            &step_result.step_name,
            index,
            step_result.status,
            step_result.duration,
            step_result.exit_code,
        ));

        let error = if step_result.succeeded() {
            None
        } else {
            Some(
                step_result
                    .error
                    .clone()
                    .unwrap_or_else(|| ExecutionError::internal("step failed without an error")),
            )
        };
        steps.push(step_result);

        let Some(error) = error else {
            continue;
        };

        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        if step.continue_on_error {
            tracing::warn!(job = %job.name, step = %label, %error, "step failed, continuing");
            continue;
        }

        return Err(error);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{EventKind, PipelineDefinition, Program, Step, StepKind, TriggerEvent};
    use crate::execution::events::progress_channel;
    use crate::execution::result::StepStatus;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Interprets command scripts instead of spawning processes:
    /// `sleep <ms>`, `exit <code>`, anything else succeeds
    #[derive(Default)]
    struct ScriptedRunner {
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl StepRunner for ScriptedRunner {
        async fn run_step(
            &self,
            step: &Step,
            index: usize,
            scope: &mut JobScope,
            cancel: &CancellationToken,
        ) -> StepResult {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}/{}", scope.job_name(), index));

            let mut result = StepResult::new(step.label(), step.kind.as_str());
            let script = match &step.kind {
                StepKind::Command(spec) => match &spec.program {
                    Program::Script(s) => s.clone(),
                    Program::Argv(argv) => argv.join(" "),
                },
                _ => String::new(),
            };

            if let Some(ms) = script.strip_prefix("sleep ") {
                let ms: u64 = ms.parse().unwrap();
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                    _ = cancel.cancelled() => result.fail(ExecutionError::Cancelled),
                }
            } else if let Some(code) = script.strip_prefix("exit ") {
                let code: i32 = code.parse().unwrap();
                result.exit_code = Some(code);
                if code != 0 {
                    result.fail(ExecutionError::Command { exit_code: code });
                }
            }

            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn run_context(def: &PipelineDefinition) -> Arc<RunContext> {
        Arc::new(RunContext::new(
            def,
            TriggerEvent::new(EventKind::Push, "main", "abc123"),
            PathBuf::from("/work"),
        ))
    }

    async fn schedule(
        def: &PipelineDefinition,
        runner: Arc<ScriptedRunner>,
        max_parallel_jobs: usize,
    ) -> RunResult {
        let graph = JobGraph::build(def).unwrap();
        let scheduler = JobScheduler::new(
            runner,
            SchedulerConfig {
                max_parallel_jobs,
                ..SchedulerConfig::default()
            },
        );
        scheduler
            .run(&graph, run_context(def), CancellationToken::new())
            .await
    }

    fn three_jobs(lint_script: &str) -> PipelineDefinition {
        PipelineDefinition::new("ci")
            .with_job(Job::new("format").with_step(Step::script("sleep 100")))
            .with_job(
                Job::new("lint")
                    .with_step(Step::script("sleep 100"))
                    .with_step(Step::script(lint_script)),
            )
            .with_job(Job::new("test").with_step(Step::script("sleep 100")))
    }

    #[tokio::test]
    async fn test_parallel_limit_respected() {
        let runner = Arc::new(ScriptedRunner::default());
        let result = schedule(&three_jobs("exit 0"), runner.clone(), 2).await;

        assert_eq!(result.verdict, Verdict::Succeeded);
        assert_eq!(result.count(JobStatus::Succeeded), 3);
        assert!(runner.max_active.load(Ordering::SeqCst) <= 2);
        assert_eq!(runner.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_failing_job_fails_verdict_only() {
        let runner = Arc::new(ScriptedRunner::default());
        let result = schedule(&three_jobs("exit 1"), runner, 2).await;

        assert_eq!(result.verdict, Verdict::Failed);
        let lint = result.job("lint").unwrap();
        assert_eq!(lint.status, JobStatus::Failed);
        assert_eq!(lint.error, Some(ExecutionError::Command { exit_code: 1 }));
        assert_eq!(result.job("format").unwrap().status, JobStatus::Succeeded);
        assert_eq!(result.job("test").unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_dependents_of_failed_job_are_skipped() {
        let def = PipelineDefinition::new("ci")
            .with_job(Job::new("build").with_step(Step::script("exit 2")))
            .with_job(Job::new("test").with_needs(["build"]).with_step(Step::script("ok")))
            .with_job(Job::new("deploy").with_needs(["test"]).with_step(Step::script("ok")))
            .with_job(Job::new("docs").with_step(Step::script("ok")));

        let runner = Arc::new(ScriptedRunner::default());
        let result = schedule(&def, runner.clone(), 4).await;

        assert_eq!(result.job("build").unwrap().status, JobStatus::Failed);
        assert_eq!(result.job("test").unwrap().status, JobStatus::Skipped);
        assert_eq!(result.job("deploy").unwrap().status, JobStatus::Skipped);
        assert_eq!(result.job("docs").unwrap().status, JobStatus::Succeeded);

        let calls = runner.calls();
        assert!(!calls.iter().any(|c| c.starts_with("test/") || c.starts_with("deploy/")));
        assert_eq!(
            result.job("test").unwrap().steps[0].status,
            StepStatus::Skipped
        );
    }

    #[tokio::test]
    async fn test_dependencies_run_first() {
        let def = PipelineDefinition::new("ci")
            .with_job(Job::new("test").with_needs(["build"]).with_step(Step::script("ok")))
            .with_job(Job::new("build").with_step(Step::script("sleep 50")));

        let runner = Arc::new(ScriptedRunner::default());
        let result = schedule(&def, runner.clone(), 4).await;

        assert_eq!(result.verdict, Verdict::Succeeded);
        assert_eq!(runner.calls(), vec!["build/0", "test/0"]);
        // Results keep declaration order
        assert_eq!(result.jobs[0].job_name, "test");
    }

    #[tokio::test]
    async fn test_dispatch_in_declaration_order() {
        let def = PipelineDefinition::new("ci")
            .with_job(Job::new("c").with_step(Step::script("ok")))
            .with_job(Job::new("a").with_step(Step::script("ok")))
            .with_job(Job::new("b").with_step(Step::script("ok")));

        let runner = Arc::new(ScriptedRunner::default());
        schedule(&def, runner.clone(), 1).await;
        assert_eq!(runner.calls(), vec!["c/0", "a/0", "b/0"]);
    }

    #[tokio::test]
    async fn test_timeout_fails_job_and_skips_later_steps() {
        let def = PipelineDefinition::new("ci").with_job(
            Job::new("slow")
                .with_timeout(Duration::from_millis(100))
                .with_step(Step::script("sleep 5000"))
                .with_step(Step::script("ok")),
        );

        let runner = Arc::new(ScriptedRunner::default());
        let start = Instant::now();
        let result = schedule(&def, runner.clone(), 1).await;
        assert!(start.elapsed() < Duration::from_secs(4));

        let slow = result.job("slow").unwrap();
        assert_eq!(slow.status, JobStatus::Failed);
        assert_eq!(slow.error, Some(ExecutionError::Timeout { timeout_ms: 100 }));
        assert_eq!(slow.steps[0].status, StepStatus::Failed);
        assert_eq!(slow.steps[1].status, StepStatus::Skipped);
        assert_eq!(runner.calls(), vec!["slow/0"]);
        assert_eq!(result.verdict, Verdict::Failed);
    }

    #[tokio::test]
    async fn test_optional_job_failure_keeps_verdict() {
        let def = PipelineDefinition::new("ci")
            .with_job(Job::new("nightly").optional().with_step(Step::script("exit 1")))
            .with_job(Job::new("test").with_step(Step::script("ok")));

        let result = schedule(&def, Arc::new(ScriptedRunner::default()), 2).await;
        assert_eq!(result.job("nightly").unwrap().status, JobStatus::Failed);
        assert_eq!(result.verdict, Verdict::Succeeded);
    }

    #[tokio::test]
    async fn test_continue_on_error_step() {
        let def = PipelineDefinition::new("ci").with_job(
            Job::new("test")
                .with_step(Step::script("exit 1").continue_on_error())
                .with_step(Step::script("ok")),
        );

        let runner = Arc::new(ScriptedRunner::default());
        let result = schedule(&def, runner.clone(), 1).await;

        let job = result.job("test").unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.steps[0].status, StepStatus::Failed);
        assert_eq!(runner.calls(), vec!["test/0", "test/1"]);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let def = PipelineDefinition::new("ci")
            .with_job(Job::new("long").with_step(Step::script("sleep 5000")))
            .with_job(Job::new("after").with_needs(["long"]).with_step(Step::script("ok")))
            .with_job(Job::new("queued").with_step(Step::script("ok")));

        let runner = Arc::new(ScriptedRunner::default());
        let graph = JobGraph::build(&def).unwrap();
        let scheduler = JobScheduler::new(
            runner.clone(),
            SchedulerConfig {
                max_parallel_jobs: 1,
                ..SchedulerConfig::default()
            },
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = scheduler.run(&graph, run_context(&def), cancel).await;

        let long = result.job("long").unwrap();
        assert_eq!(long.status, JobStatus::Failed);
        assert_eq!(long.error, Some(ExecutionError::Cancelled));
        assert_eq!(result.job("after").unwrap().status, JobStatus::Skipped);
        assert_eq!(result.job("queued").unwrap().status, JobStatus::Skipped);
        assert_eq!(runner.calls(), vec!["long/0"]);
    }

    #[tokio::test]
    async fn test_progress_events() {
        let def = PipelineDefinition::new("ci")
            .with_job(Job::new("build").with_step(Step::script("exit 1")))
            .with_job(Job::new("test").with_needs(["build"]).with_step(Step::script("ok")));

        let (tx, mut rx) = progress_channel();
        let graph = JobGraph::build(&def).unwrap();
        let scheduler = JobScheduler::new(
            Arc::new(ScriptedRunner::default()),
            SchedulerConfig::default(),
        )
        .with_progress(tx);
        scheduler
            .run(&graph, run_context(&def), CancellationToken::new())
            .await;
        drop(scheduler);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert!(matches!(events.first(), Some(ExecutionEvent::PipelineStarted { total_jobs: 2, .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            ExecutionEvent::JobSkipped { job_name, .. } if job_name == "test"
        )));
        assert!(matches!(
            events.last(),
            Some(ExecutionEvent::PipelineCompleted { verdict: Verdict::Failed, .. })
        ));
    }
}
