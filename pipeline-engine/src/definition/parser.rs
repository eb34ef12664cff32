// Definition Parser
// Loads GitHub-Actions style pipeline YAML into a PipelineDefinition

use super::error::DefinitionError;
use super::models::{
    CacheSpec, CommandSpec, Job, PipelineDefinition, Program, Step, StepKind, ToolchainSpec,
};
use super::trigger::{BranchFilter, EventKind, Trigger};

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_yaml::Value;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Parser for pipeline definition files.
pub struct DefinitionParser;

impl DefinitionParser {
    /// Parse a definition from a file path. The file stem names the
    /// pipeline when the document has no `name`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<PipelineDefinition, DefinitionError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            DefinitionError::io(format!("failed to read {}: {}", path.display(), e))
        })?;

        let fallback = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("pipeline");

        Self::parse_with_fallback(&content, fallback)
    }

    /// Parse a definition from a YAML string.
    pub fn parse(content: &str) -> Result<PipelineDefinition, DefinitionError> {
        Self::parse_with_fallback(content, "pipeline")
    }

    fn parse_with_fallback(
        content: &str,
        fallback_name: &str,
    ) -> Result<PipelineDefinition, DefinitionError> {
        let raw: RawDefinition = serde_yaml::from_str(content)
            .map_err(|e| DefinitionError::from_yaml_error(&e, content))?;

        let trigger = match raw.on {
            Some(on) => on.into_trigger()?,
            None => Trigger::any(),
        };

        let mut jobs = Vec::with_capacity(raw.jobs.0.len());
        for (name, raw_job) in raw.jobs.0 {
            jobs.push(raw_job.into_job(name)?);
        }

        Ok(PipelineDefinition {
            name: raw.name.unwrap_or_else(|| fallback_name.to_string()),
            trigger,
            env: stringify_env(raw.env, "pipeline env")?,
            jobs,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawDefinition {
    name: Option<String>,

    #[serde(rename = "on")]
    on: Option<RawTrigger>,

    #[serde(default)]
    env: BTreeMap<String, Value>,

    jobs: RawJobs,
}

/// `on: push`, `on: [push, pull_request]` or `on: { push: { branches: [main] } }`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTrigger {
    Single(String),
    Multiple(Vec<String>),
    Detailed(BTreeMap<String, Option<RawEventConfig>>),
}

#[derive(Debug, Default, Deserialize)]
struct RawEventConfig {
    #[serde(default)]
    branches: Vec<String>,

    #[serde(default, rename = "branches-ignore")]
    branches_ignore: Vec<String>,
}

impl RawTrigger {
    fn into_trigger(self) -> Result<Trigger, DefinitionError> {
        let events: Vec<(String, RawEventConfig)> = match self {
            RawTrigger::Single(event) => vec![(event, RawEventConfig::default())],
            RawTrigger::Multiple(events) => events
                .into_iter()
                .map(|e| (e, RawEventConfig::default()))
                .collect(),
            RawTrigger::Detailed(map) => map
                .into_iter()
                .map(|(e, config)| (e, config.unwrap_or_default()))
                .collect(),
        };

        let mut trigger = Trigger::declared();
        for (event, config) in events {
            let kind = match event.parse::<EventKind>() {
                Ok(kind) => kind,
                Err(_) => {
                    tracing::warn!(event = %event, "ignoring unsupported trigger event");
                    continue;
                }
            };

            let filter = BranchFilter::new(&config.branches, &config.branches_ignore)
                .map_err(DefinitionError::invalid_schema)?;
            trigger = trigger.on(kind, filter);
        }

        Ok(trigger)
    }
}

/// Jobs keep their declaration order, and duplicate names survive parsing so
/// the graph builder can report them.
#[derive(Debug, Default)]
struct RawJobs(Vec<(String, RawJob)>);

impl<'de> Deserialize<'de> for RawJobs {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct JobsVisitor;

        impl<'de> Visitor<'de> for JobsVisitor {
            type Value = RawJobs;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of job names to jobs")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut jobs = Vec::new();
                while let Some((name, job)) = map.next_entry::<String, RawJob>()? {
                    jobs.push((name, job));
                }
                Ok(RawJobs(jobs))
            }
        }

        deserializer.deserialize_map(JobsVisitor)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }

    /// Like `into_vec`, but a single string may hold a separated list
    fn split(self, separators: &[char]) -> Vec<String> {
        match self {
            OneOrMany::One(s) => split_list(&s, separators),
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawJob {
    name: Option<String>,

    needs: Option<OneOrMany>,

    #[serde(rename = "runs-on")]
    runs_on: Option<OneOrMany>,

    #[serde(default)]
    env: BTreeMap<String, Value>,

    #[serde(rename = "timeout-minutes")]
    timeout_minutes: Option<u64>,

    #[serde(default, rename = "continue-on-error")]
    continue_on_error: bool,

    steps: Vec<RawStep>,
}

impl RawJob {
    fn into_job(self, name: String) -> Result<Job, DefinitionError> {
        if self.steps.is_empty() {
            return Err(DefinitionError::invalid_schema(format!(
                "job '{}' has no steps",
                name
            )));
        }

        let timeout = match self.timeout_minutes {
            Some(0) => {
                return Err(DefinitionError::invalid_schema(format!(
                    "job '{}' has a timeout-minutes of 0",
                    name
                ))
                .with_suggestion("remove timeout-minutes to use the configured default"))
            }
            Some(minutes) => match minutes.checked_mul(60) {
                Some(secs) => Some(Duration::from_secs(secs)),
                None => {
                    return Err(DefinitionError::invalid_schema(format!(
                        "job '{}' has a timeout-minutes of {}, which is too large",
                        name, minutes
                    )))
                }
            },
            None => None,
        };

        let mut steps = Vec::new();
        let mut trailing_saves = Vec::new();
        for (index, raw_step) in self.steps.into_iter().enumerate() {
            let context = StepContext { job: &name, index };
            raw_step.into_steps(&context, &mut steps, &mut trailing_saves)?;
        }
        // actions/cache saves run after everything else in the job
        steps.extend(trailing_saves.into_iter().rev());

        Ok(Job {
            env: stringify_env(self.env, &format!("env of job '{}'", name))?,
            display_name: self.name,
            needs: self.needs.map(OneOrMany::into_vec).unwrap_or_default(),
            runs_on: self.runs_on.map(|r| r.into_vec().join(", ")),
            timeout,
            optional: self.continue_on_error,
            steps,
            name,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRun {
    Script(String),
    Argv(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawToolchain {
    Name(String),
    Detailed(RawToolchainSpec),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawToolchainSpec {
    #[serde(default = "default_provider")]
    provider: String,

    #[serde(default = "default_toolchain")]
    toolchain: String,

    components: Option<OneOrMany>,

    targets: Option<OneOrMany>,
}

fn default_provider() -> String {
    "rustup".to_string()
}

fn default_toolchain() -> String {
    "stable".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCache {
    key: String,
    path: OneOrMany,
}

impl RawCache {
    fn into_spec(self) -> CacheSpec {
        CacheSpec {
            key: self.key,
            paths: self.path.split(&['\n']).into_iter().map(PathBuf::from).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStep {
    name: Option<String>,

    #[serde(default)]
    env: BTreeMap<String, Value>,

    #[serde(default, rename = "continue-on-error")]
    continue_on_error: bool,

    #[serde(rename = "working-directory")]
    working_directory: Option<String>,

    run: Option<RawRun>,

    toolchain: Option<RawToolchain>,

    #[serde(rename = "cache-restore")]
    cache_restore: Option<RawCache>,

    #[serde(rename = "cache-save")]
    cache_save: Option<RawCache>,

    uses: Option<String>,

    #[serde(default)]
    with: BTreeMap<String, Value>,
}

struct StepContext<'a> {
    job: &'a str,
    index: usize,
}

impl StepContext<'_> {
    fn error(&self, message: impl fmt::Display) -> DefinitionError {
        DefinitionError::invalid_schema(format!(
            "step {} in job '{}': {}",
            self.index + 1,
            self.job,
            message
        ))
    }
}

impl RawStep {
    fn into_steps(
        self,
        ctx: &StepContext,
        steps: &mut Vec<Step>,
        trailing_saves: &mut Vec<Step>,
    ) -> Result<(), DefinitionError> {
        let actions = [
            self.run.is_some(),
            self.toolchain.is_some(),
            self.cache_restore.is_some(),
            self.cache_save.is_some(),
            self.uses.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count();

        if actions != 1 {
            return Err(ctx.error(
                "expected exactly one of 'run', 'toolchain', 'cache-restore', 'cache-save', 'uses'",
            ));
        }

        if !self.with.is_empty() && self.uses.is_none() {
            return Err(ctx.error("'with' is only valid together with 'uses'"));
        }

        if self.working_directory.is_some() && self.run.is_none() {
            return Err(ctx.error("'working-directory' is only valid together with 'run'"));
        }

        let scope = format!("env of step {} in job '{}'", ctx.index + 1, ctx.job);
        let env = stringify_env(self.env, &scope)?;
        let make = |kind: StepKind| Step {
            name: self.name.clone(),
            kind,
            env: env.clone(),
            continue_on_error: self.continue_on_error,
        };

        if let Some(run) = self.run {
            let program = match run {
                RawRun::Script(script) => Program::Script(script),
                RawRun::Argv(argv) if argv.is_empty() => {
                    return Err(ctx.error("'run' argument list is empty"))
                }
                RawRun::Argv(argv) => Program::Argv(argv),
            };
            steps.push(make(StepKind::Command(CommandSpec {
                program,
                working_directory: self.working_directory.map(PathBuf::from),
            })));
        } else if let Some(toolchain) = self.toolchain {
            let spec = match toolchain {
                RawToolchain::Name(toolchain) => ToolchainSpec {
                    provider: default_provider(),
                    toolchain,
                    components: Vec::new(),
                    targets: Vec::new(),
                },
                RawToolchain::Detailed(raw) => ToolchainSpec {
                    provider: raw.provider,
                    toolchain: raw.toolchain,
                    components: raw.components.map(|c| c.split(LIST_SEPARATORS)).unwrap_or_default(),
                    targets: raw.targets.map(|t| t.split(LIST_SEPARATORS)).unwrap_or_default(),
                },
            };
            steps.push(make(StepKind::ToolchainSetup(spec)));
        } else if let Some(cache) = self.cache_restore {
            steps.push(make(StepKind::CacheRestore(cache.into_spec())));
        } else if let Some(cache) = self.cache_save {
            steps.push(make(StepKind::CacheSave(cache.into_spec())));
        } else if let Some(uses) = self.uses {
            match map_uses(&uses, &self.with, ctx)? {
                UsesMapping::Nothing => {}
                UsesMapping::Toolchain(spec) => steps.push(make(StepKind::ToolchainSetup(spec))),
                UsesMapping::Cache(spec) => {
                    steps.push(make(StepKind::CacheRestore(spec.clone())));
                    let mut save = make(StepKind::CacheSave(spec));
                    save.name = self.name.as_ref().map(|n| format!("Post {}", n));
                    trailing_saves.push(save);
                }
            }
        }

        Ok(())
    }
}

const LIST_SEPARATORS: &[char] = &[',', ' ', '\n', '\t'];

enum UsesMapping {
    /// The action has no local equivalent
    Nothing,
    Toolchain(ToolchainSpec),
    Cache(CacheSpec),
}

/// Map the handful of well-known actions onto built-in step kinds
fn map_uses(
    uses: &str,
    with: &BTreeMap<String, Value>,
    ctx: &StepContext,
) -> Result<UsesMapping, DefinitionError> {
    let (action, reference) = match uses.split_once('@') {
        Some((action, reference)) => (action, Some(reference)),
        None => (uses, None),
    };

    let input = |name: &str| -> Result<Option<String>, DefinitionError> {
        match with.get(name) {
            None => Ok(None),
            Some(value) => scalar_to_string(value)
                .map(Some)
                .ok_or_else(|| ctx.error(format!("input '{}' must be a scalar", name))),
        }
    };

    match action {
        "actions/checkout" => Ok(UsesMapping::Nothing),
        "actions-rs/toolchain" | "dtolnay/rust-toolchain" => {
            let toolchain = match input("toolchain")? {
                Some(toolchain) => toolchain,
                None if action == "dtolnay/rust-toolchain" => match reference {
                    Some(r) if !matches!(r, "master" | "main" | "v1") => r.to_string(),
                    _ => {
                        return Err(ctx
                            .error("dtolnay/rust-toolchain needs a toolchain input or a toolchain ref")
                            .with_suggestion("use dtolnay/rust-toolchain@stable"))
                    }
                },
                None => default_toolchain(),
            };

            let mut targets = Vec::new();
            for name in ["target", "targets"] {
                if let Some(value) = input(name)? {
                    targets.extend(split_list(&value, LIST_SEPARATORS));
                }
            }

            Ok(UsesMapping::Toolchain(ToolchainSpec {
                provider: default_provider(),
                toolchain,
                components: input("components")?
                    .map(|c| split_list(&c, LIST_SEPARATORS))
                    .unwrap_or_default(),
                targets,
            }))
        }
        "actions/cache" => {
            let key = input("key")?.ok_or_else(|| ctx.error("actions/cache requires a 'key' input"))?;
            let path = input("path")?.ok_or_else(|| ctx.error("actions/cache requires a 'path' input"))?;
            let paths: Vec<PathBuf> = split_list(&path, &['\n']).into_iter().map(PathBuf::from).collect();
            if paths.is_empty() {
                return Err(ctx.error("actions/cache 'path' input is empty"));
            }
            Ok(UsesMapping::Cache(CacheSpec { key, paths }))
        }
        _ => Err(ctx
            .error(format!("unsupported action '{}'", uses))
            .with_suggestion("replace it with a 'run' step")),
    }
}

fn split_list(value: &str, separators: &[char]) -> Vec<String> {
    value
        .split(|c| separators.contains(&c))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

fn stringify_env(
    env: BTreeMap<String, Value>,
    scope: &str,
) -> Result<HashMap<String, String>, DefinitionError> {
    env.into_iter()
        .map(|(name, value)| match scalar_to_string(&value) {
            Some(value) => Ok((name, value)),
            None => Err(DefinitionError::invalid_schema(format!(
                "{}: variable '{}' must be a scalar",
                scope, name
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::error::DefinitionErrorKind;
    use crate::definition::trigger::{TriggerDecision, TriggerEvent};

    const SAMPLE: &str = include_str!("../../fixtures/ci.yml");

    #[test]
    fn test_parse_sample_workflow() {
        let def = DefinitionParser::parse(SAMPLE).unwrap();

        assert_eq!(def.name, "CI");
        assert_eq!(def.env["CARGO_TERM_COLOR"], "always");
        let names: Vec<&str> = def.jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["format", "lint", "test"]);
        assert!(def.jobs.iter().all(|j| j.needs.is_empty()));
        assert_eq!(def.jobs[0].label(), "Format");
        assert_eq!(def.jobs[0].runs_on.as_deref(), Some("ubuntu-latest"));
    }

    #[test]
    fn test_sample_trigger() {
        let def = DefinitionParser::parse(SAMPLE).unwrap();

        let push = TriggerEvent::new(EventKind::Push, "main", "abc");
        assert_eq!(def.trigger.evaluate(&push), TriggerDecision::Accepted);

        let feature = TriggerEvent::new(EventKind::PullRequest, "feature", "abc");
        assert!(matches!(
            def.trigger.evaluate(&feature),
            TriggerDecision::Rejected { .. }
        ));
    }

    #[test]
    fn test_only_unsupported_events_rejects_pushes() {
        let yaml = r#"
on: schedule
jobs:
  nightly:
    steps:
      - run: make
"#;
        let def = DefinitionParser::parse(yaml).unwrap();
        assert!(def.trigger.is_declared());
        assert!(def.trigger.events().next().is_none());

        let push = TriggerEvent::new(EventKind::Push, "feature/x", "abc");
        assert!(matches!(
            def.trigger.evaluate(&push),
            TriggerDecision::Rejected { .. }
        ));
    }

    #[test]
    fn test_missing_on_accepts_any_event() {
        let yaml = r#"
jobs:
  build:
    steps:
      - run: make
"#;
        let def = DefinitionParser::parse(yaml).unwrap();
        assert!(!def.trigger.is_declared());

        let push = TriggerEvent::new(EventKind::Push, "feature/x", "abc");
        assert_eq!(def.trigger.evaluate(&push), TriggerDecision::Accepted);
    }

    #[test]
    fn test_oversized_timeout_rejected() {
        let yaml = r#"
jobs:
  build:
    timeout-minutes: 18446744073709551615
    steps:
      - run: make
"#;
        let err = DefinitionParser::parse(yaml).unwrap_err();
        assert_eq!(err.kind, DefinitionErrorKind::InvalidSchema);
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_uses_mapping() {
        let def = DefinitionParser::parse(SAMPLE).unwrap();
        let lint = def.job("lint").unwrap();

        // checkout dropped, cache split into restore + trailing save
        let kinds: Vec<&str> = lint.steps.iter().map(|s| s.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec!["toolchain-setup", "cache-restore", "command", "cache-save"]
        );

        match &lint.steps[0].kind {
            StepKind::ToolchainSetup(spec) => {
                assert_eq!(spec.provider, "rustup");
                assert_eq!(spec.toolchain, "stable");
                assert_eq!(spec.components, vec!["clippy"]);
            }
            other => panic!("unexpected step kind {:?}", other),
        }

        match (&lint.steps[1].kind, &lint.steps[3].kind) {
            (StepKind::CacheRestore(restore), StepKind::CacheSave(save)) => {
                assert_eq!(restore, save);
                assert_eq!(restore.paths, vec![PathBuf::from("target")]);
                assert!(restore.key.contains("hashFiles('**/Cargo.lock')"));
            }
            other => panic!("unexpected step kinds {:?}", other),
        }
    }

    #[test]
    fn test_native_step_kinds() {
        let yaml = r#"
jobs:
  build:
    timeout-minutes: 15
    continue-on-error: true
    env:
      RUST_BACKTRACE: 1
    steps:
      - toolchain:
          toolchain: 1.83.0
          components: [rustfmt, clippy]
          targets: wasm32-unknown-unknown
      - cache-restore:
          key: deps-${{ hashFiles('Cargo.lock') }}
          path: |
            ~/.cargo/registry
            target
      - run: [cargo, build, --release]
        working-directory: crates/app
        continue-on-error: true
        env:
          DEBUG: true
      - cache-save:
          key: deps
          path: target
"#;
        let def = DefinitionParser::parse(yaml).unwrap();
        assert_eq!(def.name, "pipeline");
        assert!(def.trigger.events().next().is_none());

        let job = &def.jobs[0];
        assert!(job.optional);
        assert_eq!(job.timeout, Some(Duration::from_secs(900)));
        assert_eq!(job.env["RUST_BACKTRACE"], "1");

        match &job.steps[0].kind {
            StepKind::ToolchainSetup(spec) => {
                assert_eq!(spec.toolchain, "1.83.0");
                assert_eq!(spec.components, vec!["rustfmt", "clippy"]);
                assert_eq!(spec.targets, vec!["wasm32-unknown-unknown"]);
            }
            other => panic!("unexpected step kind {:?}", other),
        }

        match &job.steps[1].kind {
            StepKind::CacheRestore(spec) => assert_eq!(
                spec.paths,
                vec![PathBuf::from("~/.cargo/registry"), PathBuf::from("target")]
            ),
            other => panic!("unexpected step kind {:?}", other),
        }

        let build = &job.steps[2];
        assert!(build.continue_on_error);
        assert_eq!(build.env["DEBUG"], "true");
        match &build.kind {
            StepKind::Command(spec) => {
                assert_eq!(
                    spec.program,
                    Program::Argv(vec!["cargo".into(), "build".into(), "--release".into()])
                );
                assert_eq!(spec.working_directory, Some(PathBuf::from("crates/app")));
            }
            other => panic!("unexpected step kind {:?}", other),
        }
    }

    #[test]
    fn test_needs_forms() {
        let yaml = r#"
jobs:
  build:
    steps:
      - run: make
  test:
    needs: build
    steps:
      - run: make test
  deploy:
    needs: [build, test]
    steps:
      - run: make deploy
"#;
        let def = DefinitionParser::parse(yaml).unwrap();
        assert_eq!(def.job("test").unwrap().needs, vec!["build"]);
        assert_eq!(def.job("deploy").unwrap().needs, vec!["build", "test"]);
    }

    #[test]
    fn test_duplicate_job_names_are_kept() {
        let yaml = r#"
jobs:
  build:
    steps:
      - run: make
  build:
    steps:
      - run: make again
"#;
        // Reported by the graph builder, not the parser
        let def = DefinitionParser::parse(yaml).unwrap();
        assert_eq!(def.jobs.len(), 2);
    }

    #[test]
    fn test_multiple_actions_rejected() {
        let yaml = r#"
jobs:
  build:
    steps:
      - run: make
        uses: actions/checkout@v4
"#;
        let err = DefinitionParser::parse(yaml).unwrap_err();
        assert_eq!(err.kind, DefinitionErrorKind::InvalidSchema);
        assert!(err.message.contains("exactly one"));
    }

    #[test]
    fn test_unsupported_action_rejected() {
        let yaml = r#"
jobs:
  build:
    steps:
      - uses: some/action@v1
"#;
        let err = DefinitionParser::parse(yaml).unwrap_err();
        assert!(err.message.contains("unsupported action 'some/action@v1'"));
    }

    #[test]
    fn test_unknown_field_with_suggestion() {
        let yaml = "jobs:\n  test:\n    depends_on: build\n    steps:\n      - run: make\n";
        let err = DefinitionParser::parse(yaml).unwrap_err();
        assert_eq!(err.kind, DefinitionErrorKind::InvalidSchema);
        assert_eq!(err.message, "unknown field 'depends_on'");
        assert_eq!(err.suggestion.as_deref(), Some("did you mean 'needs'?"));
    }

    #[test]
    fn test_missing_jobs() {
        let err = DefinitionParser::parse("name: CI\n").unwrap_err();
        assert_eq!(err.message, "missing required field 'jobs'");
    }

    #[test]
    fn test_job_without_steps() {
        let err = DefinitionParser::parse("jobs:\n  empty:\n    steps: []\n").unwrap_err();
        assert!(err.message.contains("job 'empty' has no steps"));
    }

    #[test]
    fn test_from_file_uses_stem_as_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nightly.yml");
        fs::write(&path, "jobs:\n  a:\n    steps:\n      - run: true\n").unwrap();

        let def = DefinitionParser::from_file(&path).unwrap();
        assert_eq!(def.name, "nightly");
    }

    #[test]
    fn test_from_file_missing() {
        let err = DefinitionParser::from_file("/nonexistent/ci.yml").unwrap_err();
        assert_eq!(err.kind, DefinitionErrorKind::Io);
    }
}
