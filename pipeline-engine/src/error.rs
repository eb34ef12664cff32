// Engine Errors
// Error taxonomy shared by the definition parser, step executor and scheduler

use crate::cache::CacheError;
use crate::definition::DefinitionError;
use crate::report::ReportError;

use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors that abort an engine operation outright
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Why a step or a job did not succeed.
///
/// These never abort the pipeline: they are recorded on the owning step/job
/// and only influence the verdict through the job status.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionError {
    /// The requested toolchain could not be provisioned
    #[error("provisioning failed: {message}")]
    Provisioning { message: String },

    /// A command exited with a non-zero status
    #[error("command exited with code {exit_code}")]
    Command { exit_code: i32 },

    /// A command was killed by a signal
    #[error("command was terminated without an exit code")]
    Terminated,

    /// A command could not be started at all
    #[error("failed to start command: {message}")]
    Spawn { message: String },

    /// The job ran longer than its time budget
    #[error("job exceeded its timeout of {}", format_millis(*timeout_ms))]
    Timeout { timeout_ms: u64 },

    /// The run was cancelled while the step or job was in flight
    #[error("cancelled")]
    Cancelled,

    /// A cache restore or key computation failed
    #[error("cache operation failed: {message}")]
    Cache { message: String },

    /// A cache save failed; recorded as a warning only
    #[error("cache write failed: {message}")]
    CacheWrite { message: String },

    /// The engine could not set up the step scope
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ExecutionError {
    pub fn timeout(limit: Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn provisioning(message: impl Into<String>) -> Self {
        Self::Provisioning {
            message: message.into(),
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
        }
    }

    pub fn cache_write(message: impl Into<String>) -> Self {
        Self::CacheWrite {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// `600000` → `600s`, `250` → `250ms`
fn format_millis(ms: u64) -> String {
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{}ms", ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_display() {
        assert_eq!(
            ExecutionError::Command { exit_code: 1 }.to_string(),
            "command exited with code 1"
        );
        assert_eq!(
            ExecutionError::timeout(Duration::from_secs(600)).to_string(),
            "job exceeded its timeout of 600s"
        );
        assert_eq!(
            ExecutionError::timeout(Duration::from_millis(100)).to_string(),
            "job exceeded its timeout of 100ms"
        );
        assert_eq!(
            ExecutionError::provisioning("rustup not found").to_string(),
            "provisioning failed: rustup not found"
        );
    }

    #[test]
    fn test_execution_error_serializes_with_kind_tag() {
        let json = serde_json::to_value(ExecutionError::Timeout { timeout_ms: 5000 }).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["timeout_ms"], 5000);
    }
}
