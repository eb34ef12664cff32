// Pipeline Definition Models
// Typed, validated form of a pipeline definition document

use super::trigger::Trigger;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// A loaded pipeline definition. Immutable once built.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    /// Pipeline name (falls back to the file stem)
    pub name: String,
    /// Which events start a run
    pub trigger: Trigger,
    /// Process-wide environment visible to every step
    pub env: HashMap<String, String>,
    /// Jobs in declaration order
    pub jobs: Vec<Job>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            trigger: Trigger::any(),
            env: HashMap::new(),
            jobs: Vec::new(),
        }
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_job(mut self, job: Job) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn total_steps(&self) -> usize {
        self.jobs.iter().map(|j| j.steps.len()).sum()
    }
}

/// A named, independently schedulable unit of work
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique identifier within the definition
    pub name: String,
    /// Human-readable label
    pub display_name: Option<String>,
    /// Names of jobs that must succeed first
    pub needs: Vec<String>,
    /// Target environment descriptor; informational, jobs always run locally
    pub runs_on: Option<String>,
    /// Job-level environment
    pub env: HashMap<String, String>,
    /// Job time budget; the scheduler default applies when unset
    pub timeout: Option<Duration>,
    /// A failing optional job does not fail the verdict
    pub optional: bool,
    /// Steps in execution order
    pub steps: Vec<Step>,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            needs: Vec::new(),
            runs_on: None,
            env: HashMap::new(),
            timeout: None,
            optional: false,
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_needs<I, S>(mut self, needs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.needs = needs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// A single action within a job
#[derive(Debug, Clone)]
pub struct Step {
    pub name: Option<String>,
    pub kind: StepKind,
    /// Step-local environment overrides
    pub env: HashMap<String, String>,
    /// Keep running later steps when this one fails
    pub continue_on_error: bool,
}

impl Step {
    pub fn new(kind: StepKind) -> Self {
        Self {
            name: None,
            kind,
            env: HashMap::new(),
            continue_on_error: false,
        }
    }

    /// A command run through the default shell
    pub fn script(script: impl Into<String>) -> Self {
        Self::new(StepKind::Command(CommandSpec {
            program: Program::Script(script.into()),
            working_directory: None,
        }))
    }

    /// A command run directly from an argument list
    pub fn command<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(StepKind::Command(CommandSpec {
            program: Program::Argv(argv.into_iter().map(Into::into).collect()),
            working_directory: None,
        }))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    /// Name used in logs and reports
    pub fn label(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }

        match &self.kind {
            StepKind::ToolchainSetup(spec) => {
                format!("Set up {} toolchain {}", spec.provider, spec.toolchain)
            }
            StepKind::CacheRestore(spec) => format!("Restore cache {}", spec.key),
            StepKind::CacheSave(spec) => format!("Save cache {}", spec.key),
            StepKind::Command(spec) => format!("Run {}", spec.program),
        }
    }
}

/// What a step does
#[derive(Debug, Clone)]
pub enum StepKind {
    ToolchainSetup(ToolchainSpec),
    CacheRestore(CacheSpec),
    CacheSave(CacheSpec),
    Command(CommandSpec),
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::ToolchainSetup(_) => "toolchain-setup",
            StepKind::CacheRestore(_) => "cache-restore",
            StepKind::CacheSave(_) => "cache-save",
            StepKind::Command(_) => "command",
        }
    }
}

/// Toolchain to provision before later steps run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainSpec {
    /// Name of the provisioner (`rustup`, `host`)
    pub provider: String,
    /// Toolchain to install, e.g. `stable` or `1.83.0`
    pub toolchain: String,
    /// Extra components, e.g. `rustfmt`, `clippy`
    pub components: Vec<String>,
    /// Extra compilation targets
    pub targets: Vec<String>,
}

/// Cache key template plus the paths it covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSpec {
    /// Key template, see [`crate::cache::render_key`]
    pub key: String,
    /// Paths relative to the workspace (or `~/`-prefixed)
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: Program,
    /// Relative to the workspace
    pub working_directory: Option<PathBuf>,
}

/// The process a command step spawns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Program {
    /// Passed to the default shell
    Script(String),
    /// Executed directly, no shell involved
    Argv(Vec<String>),
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Program::Script(script) => {
                let first_line = script.lines().next().unwrap_or("");
                write!(f, "{}", first_line)
            }
            Program::Argv(argv) => write!(f, "{}", argv.join(" ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let def = PipelineDefinition::new("ci")
            .with_env("CARGO_TERM_COLOR", "always")
            .with_job(
                Job::new("test")
                    .with_needs(["build"])
                    .with_timeout(Duration::from_secs(60))
                    .with_step(Step::command(["cargo", "test"])),
            );

        let job = def.job("test").unwrap();
        assert_eq!(job.needs, vec!["build"]);
        assert_eq!(job.timeout, Some(Duration::from_secs(60)));
        assert_eq!(def.total_steps(), 1);
        assert_eq!(def.env["CARGO_TERM_COLOR"], "always");
    }

    #[test]
    fn test_step_labels() {
        assert_eq!(Step::command(["cargo", "fmt"]).label(), "Run cargo fmt");
        assert_eq!(Step::script("make\nmake install").label(), "Run make");
        assert_eq!(Step::script("true").named("Check").label(), "Check");

        let restore = Step::new(StepKind::CacheRestore(CacheSpec {
            key: "deps-1".to_string(),
            paths: vec![PathBuf::from("target")],
        }));
        assert_eq!(restore.label(), "Restore cache deps-1");
        assert_eq!(restore.kind.as_str(), "cache-restore");
    }
}
