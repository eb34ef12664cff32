// Execution Context
// Run-wide context, per-job environment scope and per-step sandboxes

use crate::definition::{PipelineDefinition, TriggerEvent};
use crate::error::ExecutionError;

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Immutable context shared by every job of a run
#[derive(Debug, Clone)]
pub struct RunContext {
    pub pipeline_name: String,
    /// The event that started the run
    pub event: TriggerEvent,
    /// Checkout the run operates on
    pub workspace: PathBuf,
    /// Process-wide environment from the definition
    pub env: HashMap<String, String>,
}

impl RunContext {
    pub fn new(definition: &PipelineDefinition, event: TriggerEvent, workspace: PathBuf) -> Self {
        Self {
            pipeline_name: definition.name.clone(),
            event,
            workspace,
            env: definition.env.clone(),
        }
    }
}

/// Environment and filesystem scope of one running job.
///
/// Variables resolve with the most specific scope winning:
/// built-ins < pipeline < job < exported by earlier steps < step.
#[derive(Debug, Clone)]
pub struct JobScope {
    run: Arc<RunContext>,
    job_name: String,
    job_env: HashMap<String, String>,
    /// Set by earlier steps through `CIRUN_ENV` or by provisioners
    exported: HashMap<String, String>,
    /// Most recent first
    path_prepend: Vec<PathBuf>,
}

impl JobScope {
    pub fn new(
        run: Arc<RunContext>,
        job_name: impl Into<String>,
        job_env: HashMap<String, String>,
    ) -> Self {
        Self {
            run,
            job_name: job_name.into(),
            job_env,
            exported: HashMap::new(),
            path_prepend: Vec::new(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn workspace(&self) -> &Path {
        &self.run.workspace
    }

    pub fn run(&self) -> &RunContext {
        &self.run
    }

    fn builtins(&self) -> HashMap<String, String> {
        let run = &self.run;
        HashMap::from([
            ("CI".to_string(), "true".to_string()),
            ("CIRUN".to_string(), "true".to_string()),
            ("CIRUN_PIPELINE".to_string(), run.pipeline_name.clone()),
            ("CIRUN_EVENT".to_string(), run.event.kind.to_string()),
            ("CIRUN_BRANCH".to_string(), run.event.branch.clone()),
            ("CIRUN_COMMIT".to_string(), run.event.commit.clone()),
            ("CIRUN_JOB".to_string(), self.job_name.clone()),
            (
                "CIRUN_WORKSPACE".to_string(),
                run.workspace.to_string_lossy().into_owned(),
            ),
        ])
    }

    /// Merge every scope into the environment a step runs with
    pub fn resolve_env(
        &self,
        step_env: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, ExecutionError> {
        let mut env = self.builtins();
        env.extend(self.run.env.clone());
        env.extend(self.job_env.clone());
        env.extend(self.exported.clone());
        env.extend(step_env.clone());

        if !self.path_prepend.is_empty() {
            let base: OsString = match env.get("PATH") {
                Some(path) => path.into(),
                None => std::env::var_os("PATH").unwrap_or_default(),
            };

            let paths = self
                .path_prepend
                .iter()
                .cloned()
                .chain(std::env::split_paths(&base));
            let joined = std::env::join_paths(paths)
                .map_err(|e| ExecutionError::internal(format!("invalid PATH entry: {}", e)))?;
            env.insert("PATH".to_string(), joined.to_string_lossy().into_owned());
        }

        Ok(env)
    }

    /// Make a variable visible to later steps of this job
    pub fn export_env(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.exported.insert(name.into(), value.into());
    }

    /// Put a directory in front of `PATH` for later steps of this job
    pub fn prepend_path(&mut self, path: impl Into<PathBuf>) {
        self.path_prepend.insert(0, path.into());
    }

    /// Resolve a definition path: `~/` is the home directory, relative paths
    /// are relative to the workspace
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if let Ok(rest) = path.strip_prefix("~") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }

        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.run.workspace.join(path)
        }
    }
}

/// Variables and `PATH` entries a step asked to pass on
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SandboxExports {
    pub env: Vec<(String, String)>,
    pub path: Vec<PathBuf>,
}

impl SandboxExports {
    pub fn apply_to(self, scope: &mut JobScope) {
        for (name, value) in self.env {
            scope.export_env(name, value);
        }
        for path in self.path {
            scope.prepend_path(path);
        }
    }
}

/// Private temporary directory of one step. Removed when dropped.
#[derive(Debug)]
pub struct StepSandbox {
    dir: TempDir,
    env_file: PathBuf,
    path_file: PathBuf,
}

impl StepSandbox {
    pub fn create() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("cirun-step-").tempdir()?;
        let env_file = dir.path().join("env");
        let path_file = dir.path().join("path");
        fs::write(&env_file, "")?;
        fs::write(&path_file, "")?;

        Ok(Self {
            dir,
            env_file,
            path_file,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Variables that point a step at its sandbox
    pub fn env(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                "CIRUN_TEMP".to_string(),
                self.dir.path().to_string_lossy().into_owned(),
            ),
            (
                "CIRUN_ENV".to_string(),
                self.env_file.to_string_lossy().into_owned(),
            ),
            (
                "CIRUN_PATH".to_string(),
                self.path_file.to_string_lossy().into_owned(),
            ),
        ])
    }

    /// Read what the step wrote to its `CIRUN_ENV` and `CIRUN_PATH` files
    pub fn collect_exports(&self) -> io::Result<SandboxExports> {
        let env = parse_env_file(&fs::read_to_string(&self.env_file)?);
        let path = fs::read_to_string(&self.path_file)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect();

        Ok(SandboxExports { env, path })
    }
}

/// `KEY=VALUE` lines, plus `KEY<<DELIM` heredocs for multi-line values
fn parse_env_file(content: &str) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    let mut lines = content.lines();

    while let Some(line) = lines.next() {
        if line.trim().is_empty() {
            continue;
        }

        let heredoc = match (line.find("<<"), line.find('=')) {
            (Some(h), Some(eq)) => h < eq,
            (Some(_), None) => true,
            _ => false,
        };

        if let Some((name, delimiter)) = line.split_once("<<").filter(|_| heredoc) {
            let mut value = Vec::new();
            for body in lines.by_ref() {
                if body == delimiter {
                    break;
                }
                value.push(body);
            }
            vars.push((name.trim().to_string(), value.join("\n")));
        } else if let Some((name, value)) = line.split_once('=') {
            vars.push((name.trim().to_string(), value.to_string()));
        } else {
            tracing::warn!(line = %line, "ignoring malformed CIRUN_ENV line");
        }
    }

    vars
}
