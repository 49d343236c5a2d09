//! Error types for myrient-dl
//!
//! The taxonomy mirrors the pipeline layers: transfer, external process,
//! stage, and job-queue errors each get their own enum, wrapped by the
//! top-level [`Error`]. Queue-level errors (`JobError`) are rejected
//! synchronously at the API boundary before any job state changes.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::{JobId, StageKind, Status};

/// Result type alias for myrient-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for myrient-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration or setup error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "tools.ps3dec_path")
        key: Option<String>,
    },

    /// Network transfer error
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// External helper-tool error
    #[error("process error: {0}")]
    Process(#[from] ProcessError),

    /// Pipeline stage error
    #[error("stage error: {0}")]
    Stage(#[from] StageError),

    /// Job queue error
    #[error("job error: {0}")]
    Job(#[from] JobError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shutdown in progress - not accepting new jobs
    #[error("shutdown in progress: not accepting new jobs")]
    ShuttingDown,
}

/// Errors from the resumable transfer engine
#[derive(Debug, Error)]
pub enum TransferError {
    /// Network-level failure (connect, timeout, bad HTTP status)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Local I/O failure while streaming to disk
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The local file involved
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The stream ended but the on-disk size disagrees with the known total.
    /// The partial file is left in place for a future resume attempt.
    #[error("transfer incomplete: expected {expected} bytes, got {actual}")]
    Incomplete {
        /// Total size reported by the server (or the caller)
        expected: u64,
        /// Bytes actually present on disk
        actual: u64,
    },

    /// The completed file does not match the caller-supplied checksum
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected SHA-256 hex digest
        expected: String,
        /// Computed SHA-256 hex digest
        actual: String,
    },

    /// The transfer was cancelled cooperatively; the partial file survives
    #[error("transfer cancelled")]
    Cancelled,
}

/// Errors from running an external helper tool
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The executable could not be spawned (not found, not executable)
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        /// Path of the tool that failed to start
        tool: PathBuf,
        /// The underlying spawn error
        #[source]
        source: std::io::Error,
    },

    /// The tool ran but reported failure. Signal deaths map to the negated
    /// signal number on unix.
    #[error("{tool} exited with status {code}")]
    NonZeroExit {
        /// Path of the tool that failed
        tool: PathBuf,
        /// Exit code (negative for signal deaths)
        code: i32,
    },

    /// Waiting on the child process failed; the exit status is unknown
    #[error("failed to reap {tool}: {source}")]
    Reap {
        /// Path of the tool
        tool: PathBuf,
        /// The underlying wait error
        #[source]
        source: std::io::Error,
    },
}

/// Errors from executing one pipeline stage
#[derive(Debug, Error)]
pub enum StageError {
    /// A required input was missing or empty; no engine was invoked
    #[error("precondition unmet for {stage} stage: {reason}")]
    PreconditionUnmet {
        /// The stage whose precondition failed
        stage: StageKind,
        /// What was missing
        reason: String,
    },

    /// The tool reported success but its declared output is absent or
    /// implausible. Distinct from a tool-reported failure so callers can
    /// tell "tool said it failed" from "tool said success but produced
    /// nothing useful".
    #[error("postcondition unmet for {stage} stage: {reason}")]
    PostconditionUnmet {
        /// The stage whose postcondition failed
        stage: StageKind,
        /// What was wrong with the output
        reason: String,
    },

    /// Transfer engine failure
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Helper-tool failure
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// Local filesystem failure while preparing or checking stage files
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The file or directory involved
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The stage was aborted by cancellation or pause
    #[error("stage aborted")]
    Cancelled,
}

/// Errors from the job queue API boundary
#[derive(Debug, Error)]
pub enum JobError {
    /// Another non-terminal job already claims this destination path
    #[error("destination {path} already claimed by job {existing}")]
    DestinationConflict {
        /// The computed destination that collides
        path: PathBuf,
        /// The job currently holding it
        existing: JobId,
    },

    /// No job with this id is known to the queue
    #[error("job {0} not found")]
    NotFound(JobId),

    /// The requested transition is not valid for the job's current state
    #[error("cannot {operation} job {id} in state {status}")]
    InvalidTransition {
        /// The job the operation targeted
        id: JobId,
        /// The operation that was attempted (e.g., "cancel", "retry")
        operation: &'static str,
        /// The state that prevents it
        status: Status,
    },
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_preserves_transfer_detail_through_transparent_wrapping() {
        let inner = TransferError::Incomplete {
            expected: 100,
            actual: 40,
        };
        let err = StageError::from(inner);
        assert_eq!(
            err.to_string(),
            "transfer incomplete: expected 100 bytes, got 40",
            "transparent wrapping must not add a layer of prose"
        );
    }

    #[test]
    fn invalid_transition_names_operation_and_state() {
        let err = JobError::InvalidTransition {
            id: JobId::new(7),
            operation: "cancel",
            status: Status::Succeeded,
        };
        let msg = err.to_string();
        assert!(msg.contains("cancel"), "message should name the operation");
        assert!(msg.contains("7"), "message should name the job id");
        assert!(
            msg.contains("succeeded"),
            "message should name the blocking state, got: {msg}"
        );
    }

    #[test]
    fn nonzero_exit_display_includes_tool_and_code() {
        let err = ProcessError::NonZeroExit {
            tool: PathBuf::from("/opt/ps3dec"),
            code: 2,
        };
        assert_eq!(err.to_string(), "/opt/ps3dec exited with status 2");
    }
}
