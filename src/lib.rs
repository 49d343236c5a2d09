//! # myrient-dl
//!
//! Backend library for acquiring disc images and packages from HTTP
//! mirrors and preparing them for console storage.
//!
//! ## Design Philosophy
//!
//! myrient-dl is designed to be:
//! - **Resumable** - interrupted downloads pick up where they stopped
//! - **Pipeline-driven** - each job runs a fixed stage list (download,
//!   decrypt, split) determined by its platform at submission
//! - **Library-first** - no UI, purely a Rust crate for embedding; a thin
//!   CLI binary ships alongside
//! - **Event-driven** - consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use myrient_dl::{Config, MyrientDownloader, Platform, Title};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let downloader = MyrientDownloader::new(Config::default()).await?;
//!
//!     // Subscribe to events
//!     let mut events = downloader.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     downloader
//!         .submit(
//!             Title {
//!                 name: "Demo Disc (USA)".to_string(),
//!                 url: "https://example.com/ps3/Demo%20Disc%20%28USA%29.iso".to_string(),
//!                 approximate_size: None,
//!             },
//!             Platform::Ps3,
//!         )
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Acquisition manager (decomposed into focused submodules)
pub mod manager;
/// Per-job pipeline orchestration
pub mod pipeline;
/// External helper-tool invocation
pub mod process;
/// Retry logic with exponential backoff
pub mod retry;
/// Stage executor
pub mod stage;
/// Resumable transfer engine
pub mod transfer;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::{Config, DownloadConfig, QueueConfig, RetryConfig, ToolsConfig};
pub use error::{Error, JobError, ProcessError, Result, StageError, TransferError};
pub use manager::MyrientDownloader;
pub use transfer::{HttpTransport, Transport};
pub use types::{Event, JobId, JobSnapshot, Platform, StageKind, Status, Title};

/// Helper function to run the downloader with graceful signal handling.
///
/// Waits for a termination signal and then calls the downloader's
/// `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(downloader: MyrientDownloader) {
    wait_for_signal().await;
    downloader.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
            } else {
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
            } else {
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to listen for Ctrl+C signal");
        }
    }
}
