// Step Executor
// Runs a single step (command, toolchain setup, cache restore/save) inside a job scope

use crate::cache::{render_key, CacheError, CacheManager, KeyContext};
use crate::definition::{CacheSpec, CommandSpec, Step, StepKind, ToolchainSpec};
use crate::error::ExecutionError;
use crate::execution::context::{JobScope, StepSandbox};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::result::StepResult;
use crate::runners::{
    CommandRunner, OutputCallback, Provisioned, ProvisionerRegistry, ProvisioningError,
    StepRunner,
};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Variable exported after a cache restore step: `true` on a hit
pub const CACHE_HIT_VAR: &str = "CIRUN_CACHE_HIT";

/// Default [`StepRunner`]: real subprocesses, registered provisioners and
/// the shared cache store
pub struct StepExecutor {
    runner: CommandRunner,
    provisioners: ProvisionerRegistry,
    cache: Arc<CacheManager>,
    event_tx: Option<ProgressSender>,
}

impl StepExecutor {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        Self {
            runner: CommandRunner::new(),
            provisioners: ProvisionerRegistry::with_defaults(),
            cache,
            event_tx: None,
        }
    }

    pub fn with_provisioners(mut self, provisioners: ProvisionerRegistry) -> Self {
        self.provisioners = provisioners;
        self
    }

    /// Stream step output and warnings to a progress channel
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    async fn execute(
        &self,
        step: &Step,
        index: usize,
        scope: &mut JobScope,
        env: &HashMap<String, String>,
        cancel: &CancellationToken,
        result: &mut StepResult,
    ) {
        match &step.kind {
            StepKind::Command(spec) => {
                self.run_command(spec, index, scope, env, cancel, result)
                    .await
            }
            StepKind::ToolchainSetup(spec) => {
                self.provision(spec, scope, env, cancel, result).await
            }
            StepKind::CacheRestore(spec) => {
                self.restore_cache(spec, scope, env, cancel, result).await
            }
            StepKind::CacheSave(spec) => self.save_cache(spec, scope, env, cancel, result).await,
        }
    }

    async fn run_command(
        &self,
        spec: &CommandSpec,
        index: usize,
        scope: &JobScope,
        env: &HashMap<String, String>,
        cancel: &CancellationToken,
        result: &mut StepResult,
    ) {
        let working_dir = match &spec.working_directory {
            Some(dir) => scope.resolve_path(dir),
            None => scope.workspace().to_path_buf(),
        };

        let callback = self.event_tx.clone().map(|tx| {
            let job_name = scope.job_name().to_string();
            Arc::new(move |line: &str, is_error: bool| {
                tx.send_event(ExecutionEvent::step_output(
                    job_name.clone(),
                    index,
                    line,
                    is_error,
                ));
            }) as OutputCallback
        });

        let output = self
            .runner
            .run(&spec.program, env, &working_dir, cancel, callback)
            .await;
        output.apply_to(result);
    }

    async fn provision(
        &self,
        spec: &ToolchainSpec,
        scope: &mut JobScope,
        env: &HashMap<String, String>,
        cancel: &CancellationToken,
        result: &mut StepResult,
    ) {
        let provisioner = match self.provisioners.get(&spec.provider) {
            Ok(provisioner) => provisioner,
            Err(e) => return result.fail(ExecutionError::provisioning(e.to_string())),
        };

        match provisioner
            .provision(spec, env, scope.workspace(), cancel)
            .await
        {
            Ok(Provisioned {
                env,
                path,
                summary,
                output,
            }) => {
                tracing::info!(job = %scope.job_name(), provider = %spec.provider, "{}", summary);
                for (name, value) in env {
                    scope.export_env(name, value);
                }
                for dir in path {
                    scope.prepend_path(dir);
                }
                result.stdout = output;
            }
            Err(ProvisioningError::Cancelled) => result.fail(ExecutionError::Cancelled),
            Err(e) => result.fail(ExecutionError::provisioning(e.to_string())),
        }
    }

    async fn restore_cache(
        &self,
        spec: &CacheSpec,
        scope: &mut JobScope,
        env: &HashMap<String, String>,
        cancel: &CancellationToken,
        result: &mut StepResult,
    ) {
        if cancel.is_cancelled() {
            return result.fail(ExecutionError::Cancelled);
        }

        let key = match render(&spec.key, env, scope).await {
            Ok(key) => key,
            Err(e) => return result.fail(ExecutionError::cache(e.to_string())),
        };

        let destinations: Vec<PathBuf> = spec.paths.iter().map(|p| scope.resolve_path(p)).collect();

        match self.cache.restore_into(&key, &destinations).await {
            Ok(true) => {
                tracing::info!(job = %scope.job_name(), key = %key, "cache hit");
                result.stdout = format!("Cache restored from key: {}", key);
                scope.export_env(CACHE_HIT_VAR, "true");
            }
            Ok(false) => {
                tracing::info!(job = %scope.job_name(), key = %key, "cache miss");
                result.stdout = format!("Cache not found for key: {}", key);
                scope.export_env(CACHE_HIT_VAR, "false");
            }
            Err(e) => result.fail(ExecutionError::cache(e.to_string())),
        }
    }

    async fn save_cache(
        &self,
        spec: &CacheSpec,
        scope: &JobScope,
        env: &HashMap<String, String>,
        cancel: &CancellationToken,
        result: &mut StepResult,
    ) {
        if cancel.is_cancelled() {
            return result.fail(ExecutionError::Cancelled);
        }

        let key = match render(&spec.key, env, scope).await {
            Ok(key) => key,
            Err(e) => return result.fail(ExecutionError::cache(e.to_string())),
        };

        let sources: Vec<PathBuf> = spec.paths.iter().map(|p| scope.resolve_path(p)).collect();

        match self.cache.save_paths(&key, &sources).await {
            Ok(entry) => {
                result.stdout = format!(
                    "Cache saved with key: {} ({} bytes)",
                    key, entry.size_bytes
                );
            }
            Err(e) => {
                // Best effort: the step still succeeds
                tracing::warn!(job = %scope.job_name(), key = %key, error = %e, "cache save failed");
                self.event_tx.send_event(ExecutionEvent::warning(
                    format!("Failed to save cache '{}': {}", key, e),
                    Some(scope.job_name().to_string()),
                ));
                result.warnings.push(ExecutionError::cache_write(e.to_string()));
            }
        }
    }
}

#[async_trait::async_trait]
impl StepRunner for StepExecutor {
    async fn run_step(
        &self,
        step: &Step,
        index: usize,
        scope: &mut JobScope,
        cancel: &CancellationToken,
    ) -> StepResult {
        let start = Instant::now();
        let mut result = StepResult::new(step.label(), step.kind.as_str());

        let sandbox = match StepSandbox::create() {
            Ok(sandbox) => sandbox,
            Err(e) => {
                result.fail(ExecutionError::internal(format!(
                    "failed to create step directory: {}",
                    e
                )));
                result.duration = start.elapsed();
                return result;
            }
        };

        match scope.resolve_env(&step.env) {
            Ok(mut env) => {
                env.extend(sandbox.env());
                self.execute(step, index, scope, &env, cancel, &mut result)
                    .await;
            }
            Err(e) => result.fail(e),
        }

        // Exports of a failed step are discarded
        if result.succeeded() {
            match sandbox.collect_exports() {
                Ok(exports) => exports.apply_to(scope),
                Err(e) => {
                    tracing::warn!(
                        job = %scope.job_name(),
                        step = %result.step_name,
                        error = %e,
                        "failed to read step exports"
                    );
                }
            }
        }

        drop(sandbox);
        result.duration = start.elapsed();
        result
    }
}

/// Render a key template off the async runtime; `hashFiles` reads files
async fn render(
    template: &str,
    env: &HashMap<String, String>,
    scope: &JobScope,
) -> Result<String, CacheError> {
    let template = template.to_string();
    let env = env.clone();
    let workspace = scope.workspace().to_path_buf();
    let job = scope.job_name().to_string();

    tokio::task::spawn_blocking(move || {
        render_key(
            &template,
            &KeyContext {
                workspace: &workspace,
                env: &env,
                job: &job,
            },
        )
    })
    .await
    .map_err(|e| CacheError::Key(format!("key rendering task failed: {}", e)))?
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::definition::{EventKind, Job, PipelineDefinition, TriggerEvent};
    use crate::execution::context::RunContext;
    use crate::execution::events::progress_channel;
    use crate::execution::result::StepStatus;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        _workspace: TempDir,
        _cache_dir: TempDir,
        executor: StepExecutor,
        scope: JobScope,
    }

    fn fixture() -> Fixture {
        let workspace = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::open(CacheConfig {
            root: cache_dir.path().to_path_buf(),
            capacity: 8,
            ttl: None,
        })
        .unwrap();

        let def = PipelineDefinition::new("ci")
            .with_env("GREETING", "hello")
            .with_job(Job::new("build"));
        let run = Arc::new(RunContext::new(
            &def,
            TriggerEvent::new(EventKind::Push, "main", "abc123"),
            workspace.path().to_path_buf(),
        ));

        Fixture {
            executor: StepExecutor::new(Arc::new(cache)),
            scope: JobScope::new(run, "build", HashMap::new()),
            _workspace: workspace,
            _cache_dir: cache_dir,
        }
    }

    impl Fixture {
        fn workspace(&self) -> &Path {
            self.scope.workspace()
        }

        async fn run(&mut self, step: Step) -> StepResult {
            self.executor
                .run_step(&step, 0, &mut self.scope, &CancellationToken::new())
                .await
        }
    }

    fn cache_step(restore: bool, key: &str, path: &str) -> Step {
        let spec = CacheSpec {
            key: key.to_string(),
            paths: vec![PathBuf::from(path)],
        };
        if restore {
            Step::new(StepKind::CacheRestore(spec))
        } else {
            Step::new(StepKind::CacheSave(spec))
        }
    }

    #[tokio::test]
    async fn test_command_sees_merged_env() {
        let mut fx = fixture();
        let step = Step::script("echo $GREETING $CI $CIRUN_JOB $LOCAL").with_env("LOCAL", "step");

        let result = fx.run(step).await;
        assert!(result.succeeded());
        assert_eq!(result.stdout, "hello true build step");
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.kind, "command");
    }

    #[tokio::test]
    async fn test_command_failure() {
        let mut fx = fixture();
        let result = fx.run(Step::script("echo bad >&2; exit 1")).await;

        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.error, Some(ExecutionError::Command { exit_code: 1 }));
        assert_eq!(result.stderr, "bad");
    }

    #[tokio::test]
    async fn test_runs_in_workspace_and_working_directory() {
        let mut fx = fixture();
        fs::create_dir_all(fx.workspace().join("sub")).unwrap();

        let result = fx.run(Step::script("pwd")).await;
        assert_eq!(
            Path::new(&result.stdout).canonicalize().unwrap(),
            fx.workspace().canonicalize().unwrap()
        );

        let step = Step::new(StepKind::Command(CommandSpec {
            program: crate::definition::Program::Script("pwd".to_string()),
            working_directory: Some(PathBuf::from("sub")),
        }));
        let result = fx.run(step).await;
        assert_eq!(
            Path::new(&result.stdout).canonicalize().unwrap(),
            fx.workspace().join("sub").canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_exports_reach_later_steps() {
        let mut fx = fixture();

        let result = fx
            .run(Step::script(
                "echo FOO=bar >> \"$CIRUN_ENV\"; echo /opt/cirun-test/bin >> \"$CIRUN_PATH\"",
            ))
            .await;
        assert!(result.succeeded());

        let result = fx.run(Step::script("echo $FOO; echo $PATH")).await;
        let lines: Vec<&str> = result.stdout.lines().collect();
        assert_eq!(lines[0], "bar");
        assert!(lines[1].starts_with("/opt/cirun-test/bin:"));
    }

    #[tokio::test]
    async fn test_failed_step_exports_are_discarded() {
        let mut fx = fixture();
        fx.run(Step::script("echo LEAK=yes >> \"$CIRUN_ENV\"; exit 1"))
            .await;

        let result = fx.run(Step::script("echo \"[$LEAK]\"")).await;
        assert_eq!(result.stdout, "[]");
    }

    #[tokio::test]
    async fn test_step_temp_dir_is_removed() {
        let mut fx = fixture();
        let result = fx
            .run(Step::script("test -d \"$CIRUN_TEMP\" && echo $CIRUN_TEMP"))
            .await;
        assert!(result.succeeded());
        assert!(!Path::new(&result.stdout).exists());

        let result = fx.run(Step::script("echo $CIRUN_TEMP; exit 4")).await;
        assert!(!result.succeeded());
        assert!(!Path::new(&result.stdout).exists());
    }

    #[tokio::test]
    async fn test_cancelled_step() {
        let mut fx = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = fx
            .executor
            .run_step(&Step::script("echo never"), 0, &mut fx.scope, &cancel)
            .await;
        assert_eq!(result.error, Some(ExecutionError::Cancelled));
        assert!(result.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_cache_miss_then_hit() {
        let mut fx = fixture();

        let result = fx.run(cache_step(true, "deps-${{ job }}", "target")).await;
        assert!(result.succeeded());
        assert!(result.stdout.contains("not found"));

        let result = fx.run(Step::script("echo $CIRUN_CACHE_HIT")).await;
        assert_eq!(result.stdout, "false");

        fs::create_dir_all(fx.workspace().join("target/debug")).unwrap();
        fs::write(fx.workspace().join("target/debug/app"), "binary").unwrap();
        let result = fx.run(cache_step(false, "deps-${{ job }}", "target")).await;
        assert!(result.succeeded());
        assert!(result.warnings.is_empty());

        fs::remove_dir_all(fx.workspace().join("target")).unwrap();
        let result = fx.run(cache_step(true, "deps-${{ job }}", "target")).await;
        assert!(result.succeeded());
        assert_eq!(
            fs::read_to_string(fx.workspace().join("target/debug/app")).unwrap(),
            "binary"
        );

        let result = fx.run(Step::script("echo $CIRUN_CACHE_HIT")).await;
        assert_eq!(result.stdout, "true");
    }

    #[tokio::test]
    async fn test_cache_save_failure_is_a_warning() {
        let mut fx = fixture();
        let (tx, mut rx) = progress_channel();
        fx.executor = StepExecutor::new(fx.executor.cache.clone()).with_progress(tx);

        let result = fx.run(cache_step(false, "deps", "does-not-exist")).await;
        assert!(result.succeeded());
        assert!(matches!(
            result.warnings.as_slice(),
            [ExecutionError::CacheWrite { .. }]
        ));

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ExecutionEvent::Log { .. }));
    }

    #[tokio::test]
    async fn test_bad_cache_key_fails_step() {
        let mut fx = fixture();
        let result = fx.run(cache_step(true, "${{ secrets.TOKEN }}", "target")).await;

        assert_eq!(result.status, StepStatus::Failed);
        assert!(matches!(result.error, Some(ExecutionError::Cache { .. })));
    }

    #[tokio::test]
    async fn test_toolchain_unknown_provider() {
        let mut fx = fixture();
        let step = Step::new(StepKind::ToolchainSetup(ToolchainSpec {
            provider: "nix".to_string(),
            toolchain: "stable".to_string(),
            components: Vec::new(),
            targets: Vec::new(),
        }));

        let result = fx.run(step).await;
        assert!(matches!(
            result.error,
            Some(ExecutionError::Provisioning { .. })
        ));
    }

    #[tokio::test]
    async fn test_host_toolchain() {
        let mut fx = fixture();
        let spec = |toolchain: &str| ToolchainSpec {
            provider: "host".to_string(),
            toolchain: toolchain.to_string(),
            components: Vec::new(),
            targets: Vec::new(),
        };

        let result = fx.run(Step::new(StepKind::ToolchainSetup(spec("sh")))).await;
        assert!(result.succeeded());
        assert_eq!(result.kind, "toolchain-setup");

        let result = fx
            .run(Step::new(StepKind::ToolchainSetup(spec("cirun-missing-tool"))))
            .await;
        assert!(matches!(
            result.error,
            Some(ExecutionError::Provisioning { .. })
        ));
    }

    #[tokio::test]
    async fn test_output_is_streamed() {
        let mut fx = fixture();
        let (tx, mut rx) = progress_channel();
        fx.executor = StepExecutor::new(fx.executor.cache.clone()).with_progress(tx);

        fx.executor
            .run_step(
                &Step::script("echo streamed"),
                3,
                &mut fx.scope,
                &CancellationToken::new(),
            )
            .await;

        match rx.recv().await.unwrap() {
            ExecutionEvent::StepOutput {
                job_name,
                step_index,
                output,
                is_error,
            } => {
                assert_eq!(job_name, "build");
                assert_eq!(step_index, 3);
                assert_eq!(output, "streamed");
                assert!(!is_error);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
