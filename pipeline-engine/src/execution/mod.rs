// Execution Engine Module
// Job graph construction, step execution, scheduling and run results

pub mod context;
pub mod events;
pub mod executor;
pub mod graph;
pub mod result;
pub mod scheduler;

// Re-export key types
pub use context::{JobScope, RunContext, SandboxExports, StepSandbox};
pub use events::{progress_channel, EventSender, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender};
pub use executor::{StepExecutor, CACHE_HIT_VAR};
pub use graph::{JobGraph, JobNode};
pub use result::{JobResult, JobStatus, RunResult, StepResult, StepStatus, Verdict};
pub use scheduler::{JobScheduler, SchedulerConfig};
