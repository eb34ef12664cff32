// Toolchain Provisioners
// Capability interface for toolchain setup steps, with rustup and host variants

use super::shell::{CommandRunner, Termination};
use crate::definition::{Program, ToolchainSpec};

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("unknown toolchain provider '{0}'")]
    UnknownProvider(String),

    #[error("'{0}' was not found on PATH")]
    ToolNotFound(String),

    #[error("failed to install toolchain '{toolchain}': {message}")]
    InstallFailed { toolchain: String, message: String },

    #[error("provisioning was cancelled")]
    Cancelled,
}

/// What a provisioner hands back to the job: variables and `PATH` entries
/// visible to later steps
#[derive(Debug, Clone, Default)]
pub struct Provisioned {
    pub env: Vec<(String, String)>,
    pub path: Vec<PathBuf>,
    /// One-line description for logs
    pub summary: String,
    /// Output of any installer that ran
    pub output: String,
}

/// Sets up a toolchain so later steps of the same job can use it
#[async_trait::async_trait]
pub trait Provisioner: Send + Sync {
    /// Provider name used in definitions (`provider: rustup`)
    fn name(&self) -> &str;

    async fn provision(
        &self,
        spec: &ToolchainSpec,
        env: &HashMap<String, String>,
        working_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Provisioned, ProvisioningError>;
}

/// Locate a binary using the step's `PATH` rather than the engine's
fn find_binary(
    name: &str,
    env: &HashMap<String, String>,
    working_dir: &Path,
) -> Result<PathBuf, ProvisioningError> {
    let path: Option<OsString> = env
        .get("PATH")
        .map(OsString::from)
        .or_else(|| std::env::var_os("PATH"));

    which::which_in(name, path, working_dir)
        .map_err(|_| ProvisioningError::ToolNotFound(name.to_string()))
}

/// Installs Rust toolchains through rustup
#[derive(Debug, Clone, Default)]
pub struct RustupProvisioner {
    runner: CommandRunner,
}

impl RustupProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    fn install_args(spec: &ToolchainSpec) -> Vec<String> {
        let mut args = vec![
            "toolchain".to_string(),
            "install".to_string(),
            spec.toolchain.clone(),
            "--profile".to_string(),
            "minimal".to_string(),
            "--no-self-update".to_string(),
        ];

        for component in &spec.components {
            args.push("-c".to_string());
            args.push(component.clone());
        }

        for target in &spec.targets {
            args.push("-t".to_string());
            args.push(target.clone());
        }

        args
    }
}

#[async_trait::async_trait]
impl Provisioner for RustupProvisioner {
    fn name(&self) -> &str {
        "rustup"
    }

    async fn provision(
        &self,
        spec: &ToolchainSpec,
        env: &HashMap<String, String>,
        working_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Provisioned, ProvisioningError> {
        let rustup = find_binary("rustup", env, working_dir)?;

        let mut argv = vec![rustup.to_string_lossy().into_owned()];
        argv.extend(Self::install_args(spec));

        tracing::info!(
            toolchain = %spec.toolchain,
            components = ?spec.components,
            targets = ?spec.targets,
            "Installing toolchain via rustup"
        );

        let output = self
            .runner
            .run(&Program::Argv(argv), env, working_dir, cancel, None)
            .await;

        let combined = match (output.stdout.is_empty(), output.stderr.is_empty()) {
            (false, false) => format!("{}\n{}", output.stdout, output.stderr),
            (false, true) => output.stdout.clone(),
            _ => output.stderr.clone(),
        };

        match output.termination {
            Termination::Cancelled => return Err(ProvisioningError::Cancelled),
            Termination::SpawnFailed(message) => {
                return Err(ProvisioningError::InstallFailed {
                    toolchain: spec.toolchain.clone(),
                    message,
                })
            }
            Termination::Exited if output.exit_code != Some(0) => {
                let last_line = output.stderr.lines().last().unwrap_or("rustup failed");
                return Err(ProvisioningError::InstallFailed {
                    toolchain: spec.toolchain.clone(),
                    message: last_line.to_string(),
                });
            }
            Termination::Exited => {}
        }

        Ok(Provisioned {
            env: vec![("RUSTUP_TOOLCHAIN".to_string(), spec.toolchain.clone())],
            path: Vec::new(),
            summary: format!("rust toolchain {} installed", spec.toolchain),
            output: combined,
        })
    }
}

/// Uses whatever is already installed: checks the toolchain binary and each
/// listed component binary exist, installs nothing
#[derive(Debug, Clone, Default)]
pub struct HostProvisioner;

#[async_trait::async_trait]
impl Provisioner for HostProvisioner {
    fn name(&self) -> &str {
        "host"
    }

    async fn provision(
        &self,
        spec: &ToolchainSpec,
        env: &HashMap<String, String>,
        working_dir: &Path,
        _cancel: &CancellationToken,
    ) -> Result<Provisioned, ProvisioningError> {
        let mut found = Vec::new();
        for binary in std::iter::once(&spec.toolchain).chain(&spec.components) {
            let path = find_binary(binary, env, working_dir)?;
            found.push(format!("{} at {}", binary, path.display()));
        }

        Ok(Provisioned {
            summary: format!("using host tools: {}", found.join(", ")),
            ..Provisioned::default()
        })
    }
}

/// Maps provider names to provisioners
#[derive(Clone)]
pub struct ProvisionerRegistry {
    providers: HashMap<String, Arc<dyn Provisioner>>,
}

impl ProvisionerRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Registry with the `rustup` and `host` provisioners
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RustupProvisioner::new()));
        registry.register(Arc::new(HostProvisioner));
        registry
    }

    /// Add a provisioner, replacing any with the same name
    pub fn register(&mut self, provisioner: Arc<dyn Provisioner>) {
        self.providers
            .insert(provisioner.name().to_string(), provisioner);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provisioner>, ProvisioningError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ProvisioningError::UnknownProvider(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ProvisionerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for ProvisionerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionerRegistry")
            .field("providers", &self.names())
            .finish()
    }
}
