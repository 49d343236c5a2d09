//! Acquisition manager split into focused submodules.
//!
//! The `MyrientDownloader` struct and its methods are organized by domain:
//! - [`submit`] - Job admission and destination conflict checks
//! - [`control`] - Job lifecycle control (pause/resume/cancel/retry/dismiss)
//! - [`queue_processor`] - FIFO dispatch under the concurrency limit

mod control;
mod queue_processor;
mod submit;


use crate::config::Config;
use crate::error::{Error, JobError, Result};
use crate::pipeline::{Job, Pipeline};
use crate::process::{ToolRunner, resolve_tool};
use crate::stage::StageExecutor;
use crate::transfer::{HttpTransport, TransferEngine, Transport};
use crate::types::{Event, JobId, JobSnapshot, Status};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, broadcast};

/// How long shutdown waits for running jobs to wind down after cancelling them
const SHUTDOWN_WAIT: Duration = Duration::from_secs(30);

/// Queue and dispatch state
#[derive(Clone)]
pub(crate) struct QueueState {
    /// FIFO of jobs awaiting a concurrency slot
    pub(crate) queue: Arc<Mutex<VecDeque<JobId>>>,
    /// Semaphore limiting concurrently running jobs
    pub(crate) concurrent_limit: Arc<Semaphore>,
    /// Cleared during shutdown so new submissions are rejected
    pub(crate) accepting_new: Arc<AtomicBool>,
}

/// Main acquisition manager (cloneable - all fields are Arc-wrapped)
///
/// Owns the job registry, the FIFO admission queue and the event channel.
/// Jobs run on background tasks; callers observe them through
/// [`subscribe`](Self::subscribe) or by polling snapshots.
#[derive(Clone)]
pub struct MyrientDownloader {
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Configuration snapshot taken at construction
    pub(crate) config: Arc<Config>,
    /// All known jobs, keyed by id; ids are monotone so iteration order is
    /// submission order
    pub(crate) registry: Arc<Mutex<BTreeMap<JobId, Arc<Job>>>>,
    /// Queue and dispatch state
    pub(crate) queue_state: QueueState,
    /// Per-job stage driver
    pub(crate) pipeline: Arc<Pipeline>,
    /// Stage executor, kept for submit-time tool checks
    pub(crate) executor: Arc<StageExecutor>,
    /// Next job id
    pub(crate) next_id: Arc<AtomicU64>,
}

impl MyrientDownloader {
    /// Create a manager over the real HTTP transport
    ///
    /// Validates the configuration and any explicitly configured tool
    /// paths, creates the download directory and starts the queue
    /// processor.
    pub async fn new(config: Config) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.download)?);
        Self::with_transport(config, transport).await
    }

    /// Create a manager over a caller-supplied transport
    pub async fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        // An explicitly configured tool path that is not an executable is a
        // setup error here, not a stage failure later.
        if let Some(path) = &config.tools.ps3dec_path {
            resolve_tool(Some(path), "ps3dec", false, "tools.ps3dec_path")?;
        }
        if let Some(path) = &config.tools.splitter_path {
            resolve_tool(Some(path), "splitfile", false, "tools.splitter_path")?;
        }

        tokio::fs::create_dir_all(&config.download.download_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "failed to create download directory '{}': {}",
                        config.download.download_dir.display(),
                        e
                    ),
                ))
            })?;

        let (event_tx, _rx) = broadcast::channel(config.queue.event_capacity);

        let engine = Arc::new(TransferEngine::new(
            transport,
            config.download.clone(),
            config.retry.clone(),
        ));
        let runner = Arc::new(ToolRunner::new(config.tools.termination_grace));
        let executor = Arc::new(StageExecutor::new(engine, runner, config.tools.clone()));
        let pipeline = Arc::new(Pipeline::new(
            executor.clone(),
            event_tx.clone(),
            config.download.cleanup_intermediates,
        ));

        let downloader = Self {
            event_tx,
            queue_state: QueueState {
                queue: Arc::new(Mutex::new(VecDeque::new())),
                concurrent_limit: Arc::new(Semaphore::new(config.queue.max_concurrent_jobs)),
                accepting_new: Arc::new(AtomicBool::new(true)),
            },
            config: Arc::new(config),
            registry: Arc::new(Mutex::new(BTreeMap::new())),
            pipeline,
            executor,
            next_id: Arc::new(AtomicU64::new(1)),
        };

        downloader.start_queue_processor();

        Ok(downloader)
    }

    /// Subscribe to the event stream
    ///
    /// Each receiver sees every event from the point of subscription; slow
    /// receivers may lag and miss events, which affects only them.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Snapshot one job
    pub async fn job(&self, id: JobId) -> Result<JobSnapshot> {
        let registry = self.registry.lock().await;
        registry
            .get(&id)
            .map(|job| job.snapshot())
            .ok_or_else(|| JobError::NotFound(id).into())
    }

    /// Snapshot every known job in submission order
    pub async fn jobs(&self) -> Vec<JobSnapshot> {
        let registry = self.registry.lock().await;
        registry.values().map(|job| job.snapshot()).collect()
    }

    /// Shut down gracefully
    ///
    /// Stops accepting submissions, cancels queued and running jobs (their
    /// partial downloads survive for a later process to resume) and waits
    /// for running pipelines to wind down.
    pub async fn shutdown(&self) {
        self.queue_state.accepting_new.store(false, Ordering::SeqCst);
        let _ = self.event_tx.send(Event::Shutdown);
        tracing::info!("shutdown initiated, cancelling active jobs");

        {
            let registry = self.registry.lock().await;
            for job in registry.values() {
                match job.status() {
                    Status::Running => job.control.request_cancel(),
                    Status::Queued => {
                        job.set_status(Status::Cancelled);
                        let _ = self.event_tx.send(Event::Cancelled { id: job.id });
                    }
                    _ => {}
                }
            }
        }

        let wait = async {
            loop {
                let any_running = {
                    let registry = self.registry.lock().await;
                    registry.values().any(|job| job.status() == Status::Running)
                };
                if !any_running {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_WAIT, wait).await.is_err() {
            tracing::warn!("shutdown wait expired with jobs still running");
        }

        self.queue_state.concurrent_limit.close();
    }

    pub(crate) async fn get_job(&self, id: JobId) -> Result<Arc<Job>> {
        let registry = self.registry.lock().await;
        registry
            .get(&id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(id).into())
    }

    pub(crate) fn emit(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }
}
