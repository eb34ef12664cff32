// Execution Results
// Job and step statuses plus the per-run result the scheduler produces

use crate::error::ExecutionError;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Per-job state machine: pending → ready → running → {succeeded, failed, skipped}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Ready => "ready",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of a single step
#[derive(Debug, Clone)]
pub struct StepResult {
    /// Display label of the step
    pub step_name: String,
    /// Step kind, e.g. `command`
    pub kind: &'static str,
    pub status: StepStatus,
    /// Exit code of the subprocess, if one ran to completion
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// Why the step failed
    pub error: Option<ExecutionError>,
    /// Problems that did not fail the step
    pub warnings: Vec<ExecutionError>,
}

impl StepResult {
    pub fn new(step_name: impl Into<String>, kind: &'static str) -> Self {
        Self {
            step_name: step_name.into(),
            kind,
            status: StepStatus::Succeeded,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
            error: None,
            warnings: Vec::new(),
        }
    }

    pub fn skipped(step_name: impl Into<String>, kind: &'static str) -> Self {
        Self {
            status: StepStatus::Skipped,
            ..Self::new(step_name, kind)
        }
    }

    pub fn fail(&mut self, error: ExecutionError) {
        self.status = StepStatus::Failed;
        self.error = Some(error);
    }

    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// Outcome of a single job
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_name: String,
    pub status: JobStatus,
    /// A failure of an optional job does not fail the verdict
    pub optional: bool,
    pub steps: Vec<StepResult>,
    pub duration: Duration,
    pub error: Option<ExecutionError>,
}

impl JobResult {
    pub fn new(job_name: impl Into<String>, optional: bool) -> Self {
        Self {
            job_name: job_name.into(),
            status: JobStatus::Pending,
            optional,
            steps: Vec::new(),
            duration: Duration::ZERO,
            error: None,
        }
    }
}

/// Single pass/fail outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Succeeded,
    Failed,
}

impl Verdict {
    /// Succeeded iff every non-optional job succeeded
    pub fn from_jobs(jobs: &[JobResult]) -> Self {
        if jobs
            .iter()
            .all(|j| j.optional || j.status == JobStatus::Succeeded)
        {
            Verdict::Succeeded
        } else {
            Verdict::Failed
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Verdict::Succeeded
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Succeeded => write!(f, "succeeded"),
            Verdict::Failed => write!(f, "failed"),
        }
    }
}

/// Result of one pipeline invocation
#[derive(Debug, Clone)]
pub struct RunResult {
    pub pipeline_name: String,
    /// Jobs in declaration order
    pub jobs: Vec<JobResult>,
    pub duration: Duration,
    pub verdict: Verdict,
}

impl RunResult {
    pub fn job(&self, name: &str) -> Option<&JobResult> {
        self.jobs.iter().find(|j| j.job_name == name)
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }
}
