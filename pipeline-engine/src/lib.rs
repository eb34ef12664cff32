// Pipeline Engine Library
// Parses CI pipeline definitions and runs their jobs locally with caching and reporting

pub mod cache;
pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod execution;
pub mod report;
pub mod runners;
pub mod utils;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{PipelineEngine, RunOutcome};
pub use error::{EngineError, EngineResult, ExecutionError};

// Re-export definition types
pub use definition::{
    DefinitionError, DefinitionErrorKind, DefinitionParser, EventKind, Job, PipelineDefinition,
    Step, StepKind, Trigger, TriggerDecision, TriggerEvent,
};

// Re-export execution types
pub use execution::{
    progress_channel, ExecutionEvent, JobGraph, JobResult, JobScheduler, JobStatus, LogLevel,
    ProgressReceiver, ProgressSender, RunResult, SchedulerConfig, StepExecutor, StepResult,
    StepStatus, Verdict,
};

// Re-export cache and report types
pub use cache::{CacheConfig, CacheEntry, CacheError, CacheManager, CacheStats};
pub use report::{ReportError, ReportFormat, ResultReporter, RunReport};

// Re-export runner types
pub use runners::{CommandRunner, Provisioner, ProvisionerRegistry, StepRunner};
