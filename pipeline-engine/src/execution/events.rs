// Execution Events
// Progress reporting and event types for pipeline execution

use super::result::{JobStatus, StepStatus, Verdict};

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Pipeline execution started
    PipelineStarted {
        pipeline_name: String,
        total_jobs: usize,
    },

    /// Pipeline execution completed
    PipelineCompleted {
        pipeline_name: String,
        verdict: Verdict,
        duration: Duration,
    },

    /// Job was dispatched to a worker
    JobStarted {
        job_name: String,
        display_name: Option<String>,
        total_steps: usize,
    },

    /// Job reached a terminal status after running
    JobCompleted {
        job_name: String,
        status: JobStatus,
        duration: Duration,
    },

    /// Job never ran (failed/skipped dependency or cancelled run)
    JobSkipped { job_name: String, reason: String },

    /// Step execution started
    StepStarted {
        job_name: String,
        step_name: String,
        step_index: usize,
    },

    /// Step output (stdout/stderr), one line at a time
    StepOutput {
        job_name: String,
        step_index: usize,
        output: String,
        is_error: bool,
    },

    /// Step execution completed
    StepCompleted {
        job_name: String,
        step_name: String,
        step_index: usize,
        status: StepStatus,
        duration: Duration,
        exit_code: Option<i32>,
    },

    /// Log message (info, warning, error)
    Log {
        level: LogLevel,
        message: String,
        job_name: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    pub fn pipeline_started(name: impl Into<String>, total_jobs: usize) -> Self {
        Self::PipelineStarted {
            pipeline_name: name.into(),
            total_jobs,
        }
    }

    pub fn pipeline_completed(
        name: impl Into<String>,
        verdict: Verdict,
        duration: Duration,
    ) -> Self {
        Self::PipelineCompleted {
            pipeline_name: name.into(),
            verdict,
            duration,
        }
    }

    pub fn job_started(
        job_name: impl Into<String>,
        display_name: Option<String>,
        total_steps: usize,
    ) -> Self {
        Self::JobStarted {
            job_name: job_name.into(),
            display_name,
            total_steps,
        }
    }

    pub fn job_completed(job_name: impl Into<String>, status: JobStatus, duration: Duration) -> Self {
        Self::JobCompleted {
            job_name: job_name.into(),
            status,
            duration,
        }
    }

    pub fn job_skipped(job_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::JobSkipped {
            job_name: job_name.into(),
            reason: reason.into(),
        }
    }

    pub fn step_started(
        job_name: impl Into<String>,
        step_name: impl Into<String>,
        step_index: usize,
    ) -> Self {
        Self::StepStarted {
            job_name: job_name.into(),
            step_name: step_name.into(),
            step_index,
        }
    }

    pub fn step_output(
        job_name: impl Into<String>,
        step_index: usize,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::StepOutput {
            job_name: job_name.into(),
            step_index,
            output: output.into(),
            is_error,
        }
    }

    pub fn step_completed(
        job_name: impl Into<String>,
        step_name: impl Into<String>,
        step_index: usize,
        status: StepStatus,
        duration: Duration,
        exit_code: Option<i32>,
    ) -> Self {
        Self::StepCompleted {
            job_name: job_name.into(),
            step_name: step_name.into(),
            step_index,
            status,
            duration,
            exit_code,
        }
    }

    /// Create an info log event
    pub fn info(message: impl Into<String>, job_name: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
            job_name,
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, job_name: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            job_name,
        }
    }

    /// Create an error log event
    pub fn error(message: impl Into<String>, job_name: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            job_name,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
