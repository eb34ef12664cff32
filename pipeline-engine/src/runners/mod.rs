// Runners Module
// Subprocess execution, toolchain provisioners and the step runner seam

pub mod provisioner;
pub mod shell;

// Re-export key types
pub use provisioner::{
    HostProvisioner, Provisioned, Provisioner, ProvisionerRegistry, ProvisioningError,
    RustupProvisioner,
};
pub use shell::{CommandOutput, CommandRunner, OutputCallback, Termination};

use crate::definition::Step;
use crate::execution::context::JobScope;
use crate::execution::result::StepResult;

use tokio_util::sync::CancellationToken;

/// Executes one step of a job.
///
/// The scheduler only talks to this trait, so tests can drive it with
/// scripted runners instead of real subprocesses.
#[async_trait::async_trait]
pub trait StepRunner: Send + Sync {
    /// Run `step` (position `index` in its job) inside `scope`.
    ///
    /// Never panics on step failure; failures are reported in the result.
    async fn run_step(
        &self,
        step: &Step,
        index: usize,
        scope: &mut JobScope,
        cancel: &CancellationToken,
    ) -> StepResult;
}
