//! Core types for myrient-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a job
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    /// Create a new JobId
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<JobId> for u64 {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Overall job status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Waiting for a concurrency slot
    Queued,
    /// Being driven through its stages
    Running,
    /// Suspended by the caller; resumable
    Paused,
    /// All stages completed
    Succeeded,
    /// A stage failed; retryable from the failed stage
    Failed,
    /// Cancelled by the caller; partial files retained
    Cancelled,
}

impl Status {
    /// Terminal states are reached exactly once and never left,
    /// except through an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed | Status::Cancelled)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Queued => "queued",
            Status::Running => "running",
            Status::Paused => "paused",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One unit of work in a job's pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Resumable network retrieval of the remote resource
    Download,
    /// External decryption tool (`tool <input> <output>`)
    Decrypt,
    /// External splitting/extraction tool (`tool <input> <output-dir>`)
    SplitOrExtract,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageKind::Download => "download",
            StageKind::Decrypt => "decrypt",
            StageKind::SplitOrExtract => "split",
        };
        f.write_str(s)
    }
}

/// Platform of a title, which fixes the job's stage list at creation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// PS3 disc image: download, decrypt with ps3dec, then split for FAT32
    Ps3,
    /// PSN package: download, then split for FAT32
    Psn,
    /// Anything else: download only
    #[default]
    Other,
}

impl Platform {
    /// The ordered, fixed stage list for this platform.
    pub fn stages(&self) -> Vec<StageKind> {
        match self {
            Platform::Ps3 => vec![
                StageKind::Download,
                StageKind::Decrypt,
                StageKind::SplitOrExtract,
            ],
            Platform::Psn => vec![StageKind::Download, StageKind::SplitOrExtract],
            Platform::Other => vec![StageKind::Download],
        }
    }

    /// Whether this platform's pipeline invokes the decrypt tool.
    pub fn needs_decrypt_tool(&self) -> bool {
        self.stages().contains(&StageKind::Decrypt)
    }

    /// Whether this platform's pipeline invokes the split tool.
    pub fn needs_split_tool(&self) -> bool {
        self.stages().contains(&StageKind::SplitOrExtract)
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ps3" => Ok(Platform::Ps3),
            "psn" => Ok(Platform::Psn),
            "other" | "generic" => Ok(Platform::Other),
            other => Err(format!("unknown platform '{other}' (expected ps3, psn or other)")),
        }
    }
}

/// One entry from the remote index, treated as an opaque input
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Title {
    /// Display name shown to the user
    pub name: String,
    /// Full download URL
    pub url: String,
    /// Approximate size from the index, if listed
    pub approximate_size: Option<u64>,
}

/// Event emitted during a job's lifecycle
///
/// Events for a given job are emitted in order: progress notifications are
/// non-decreasing within a stage, and no event for stage `i+1` precedes
/// stage `i`'s completion event.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Job admitted to the queue
    Queued {
        /// Job ID
        id: JobId,
        /// Display name
        name: String,
    },

    /// A stage began executing
    StageStarted {
        /// Job ID
        id: JobId,
        /// Zero-based index into the job's stage list
        stage_index: usize,
        /// The stage kind
        stage: StageKind,
    },

    /// Byte progress within the current stage
    Progress {
        /// Job ID
        id: JobId,
        /// The stage reporting progress
        stage: StageKind,
        /// Bytes completed so far (monotonically non-decreasing per stage)
        bytes_done: u64,
        /// Total bytes if known
        bytes_total: Option<u64>,
        /// Current session transfer speed in bytes per second
        speed_bps: u64,
    },

    /// A line of live output from a helper tool
    ToolOutput {
        /// Job ID
        id: JobId,
        /// The stage whose tool produced the line
        stage: StageKind,
        /// The output line
        line: String,
    },

    /// A stage completed successfully
    StageComplete {
        /// Job ID
        id: JobId,
        /// Zero-based stage index
        stage_index: usize,
        /// The stage kind
        stage: StageKind,
    },

    /// A stage was skipped by policy (already complete, or below the
    /// split threshold)
    StageSkipped {
        /// Job ID
        id: JobId,
        /// Zero-based stage index
        stage_index: usize,
        /// The stage kind
        stage: StageKind,
        /// Why it was skipped
        reason: String,
    },

    /// The job entered Paused at a stage boundary
    Paused {
        /// Job ID
        id: JobId,
        /// The stage the job will resume at
        stage_index: usize,
    },

    /// A paused job was re-queued
    Resumed {
        /// Job ID
        id: JobId,
        /// The stage the job resumes at
        stage_index: usize,
    },

    /// A failed or cancelled job was re-queued at its current stage
    Retrying {
        /// Job ID
        id: JobId,
        /// The stage the retry re-enters
        stage_index: usize,
    },

    /// The job was cancelled; partial files of the current stage survive
    Cancelled {
        /// Job ID
        id: JobId,
    },

    /// The job failed at a stage
    Failed {
        /// Job ID
        id: JobId,
        /// Index of the failing stage
        stage_index: usize,
        /// Kind of the failing stage
        stage: StageKind,
        /// Error description
        error: String,
    },

    /// All stages completed
    Complete {
        /// Job ID
        id: JobId,
        /// Path of the final artifact (file or directory of parts)
        path: PathBuf,
    },

    /// A terminal job was dismissed from the queue's history
    Dismissed {
        /// Job ID
        id: JobId,
    },

    /// Graceful shutdown initiated
    Shutdown,
}

/// Read-only snapshot of one job, suitable for polling or display
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// Unique job identifier
    pub id: JobId,

    /// Display name
    pub name: String,

    /// Current status
    pub status: Status,

    /// Zero-based index of the current (or failed) stage
    pub stage_index: usize,

    /// Kind of the current stage, if the stage list is not exhausted
    pub stage: Option<StageKind>,

    /// Number of stages in the fixed stage list
    pub stage_count: usize,

    /// Bytes completed in the current stage
    pub bytes_done: u64,

    /// Total bytes for the current stage, if known
    pub bytes_total: Option<u64>,

    /// Last error, retained for Failed jobs
    pub error: Option<String>,

    /// Destination path of the raw downloaded file
    pub destination: PathBuf,

    /// When the job was submitted
    pub created_at: DateTime<Utc>,

    /// When the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}
