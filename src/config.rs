//! Configuration types for myrient-dl

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Top-level configuration
///
/// An immutable snapshot of this struct is handed to the downloader at
/// creation; reconfiguration takes effect only for downloaders created
/// afterwards.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Transfer behavior (directories, user agent, size verification)
    #[serde(default)]
    pub download: DownloadConfig,

    /// External helper-tool paths and process handling
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Retry behavior for transient network failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Queue admission and event delivery
    #[serde(default)]
    pub queue: QueueConfig,
}

impl Config {
    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.download.download_dir.as_os_str().is_empty() {
            return Err(Error::Config {
                message: "download directory must not be empty".to_string(),
                key: Some("download.download_dir".to_string()),
            });
        }
        if self.queue.max_concurrent_jobs == 0 {
            return Err(Error::Config {
                message: "max_concurrent_jobs must be at least 1".to_string(),
                key: Some("queue.max_concurrent_jobs".to_string()),
            });
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config {
                message: "backoff_multiplier must be >= 1.0".to_string(),
                key: Some("retry.backoff_multiplier".to_string()),
            });
        }
        Ok(())
    }
}

/// Transfer behavior configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Directory holding one working subdirectory per job (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// User-Agent header sent on transfer requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Fail with `TransferError::Incomplete` when the final on-disk size
    /// disagrees with the server-reported total (default: true)
    #[serde(default = "default_true")]
    pub verify_size: bool,

    /// Delete earlier intermediates (raw download, encrypted input) once the
    /// whole job succeeds (default: false, everything is retained)
    #[serde(default)]
    pub cleanup_intermediates: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            user_agent: default_user_agent(),
            verify_size: true,
            cleanup_intermediates: false,
        }
    }
}

/// External helper-tool configuration
///
/// The decrypt and split tools are invoked as opaque executables with the
/// contracts `tool <input> <output>` and `tool <input> <output-dir>`. A
/// configured path that does not reference an executable file is a setup
/// error at downloader construction, never a stage error.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to the PS3 ISO decryption tool (e.g. ps3dec)
    #[serde(default)]
    pub ps3dec_path: Option<PathBuf>,

    /// Path to the FAT32 splitting tool
    #[serde(default)]
    pub splitter_path: Option<PathBuf>,

    /// Search PATH for tools not explicitly configured (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,

    /// Grace period between asking a tool to terminate and force-killing it
    /// (default: 5 seconds)
    #[serde(default = "default_termination_grace", with = "duration_serde")]
    pub termination_grace: Duration,

    /// Inputs below this size skip the split stage entirely
    /// (default: 4294967295, the FAT32 file-size limit)
    #[serde(default = "default_split_threshold")]
    pub split_threshold: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ps3dec_path: None,
            splitter_path: None,
            search_path: true,
            termination_grace: default_termination_grace(),
            split_threshold: default_split_threshold(),
        }
    }
}

/// Retry configuration for transient transfer failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Queue admission configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of concurrently running jobs (default: 2)
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Capacity of the event broadcast channel (default: 1024)
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_user_agent() -> String {
    // Some mirrors refuse requests without a browser-looking agent.
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/58.0.3029.110 Safari/537.3"
        .to_string()
}

fn default_true() -> bool {
    true
}

fn default_termination_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_split_threshold() -> u64 {
    4_294_967_295
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_concurrent_jobs() -> usize {
    2
}

fn default_event_capacity() -> usize {
    1024
}

// Duration serialization helper (seconds as integers)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
