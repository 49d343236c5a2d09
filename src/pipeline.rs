//! Per-job pipeline orchestration
//!
//! A job's stage list is fixed at creation and driven by a single loop
//! with a monotone stage index. Pause and cancel are cooperative: control
//! flags are checked at stage boundaries, and an abort token interrupts
//! the stage in flight when the request cannot wait for the boundary.

use crate::error::StageError;
use crate::stage::{StageContext, StageExecutor, StageOutcome};
use crate::transfer::{ProgressFn, TransferProgress};
use crate::types::{Event, JobId, JobSnapshot, StageKind, Status};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Sentinel for "total unknown" in the progress cell
const TOTAL_UNKNOWN: u64 = u64::MAX;

/// Lock-free progress observation shared between the running stage and
/// snapshot readers
#[derive(Debug, Default)]
pub struct ProgressCell {
    bytes_done: AtomicU64,
    bytes_total: AtomicU64,
    speed_bps: AtomicU64,
}

impl ProgressCell {
    /// Record a progress update from the transfer engine
    pub fn record(&self, progress: &TransferProgress) {
        self.bytes_done.store(progress.bytes_done, Ordering::Relaxed);
        self.bytes_total
            .store(progress.bytes_total.unwrap_or(TOTAL_UNKNOWN), Ordering::Relaxed);
        self.speed_bps.store(progress.speed_bps, Ordering::Relaxed);
    }

    /// Reset at a stage boundary so the next stage starts from zero
    pub fn reset(&self) {
        self.bytes_done.store(0, Ordering::Relaxed);
        self.bytes_total.store(TOTAL_UNKNOWN, Ordering::Relaxed);
        self.speed_bps.store(0, Ordering::Relaxed);
    }

    /// Bytes completed in the current stage
    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.load(Ordering::Relaxed)
    }

    /// Total bytes for the current stage, if known
    pub fn bytes_total(&self) -> Option<u64> {
        match self.bytes_total.load(Ordering::Relaxed) {
            TOTAL_UNKNOWN => None,
            total => Some(total),
        }
    }

    /// Current transfer speed in bytes per second
    pub fn speed_bps(&self) -> u64 {
        self.speed_bps.load(Ordering::Relaxed)
    }
}

/// Cooperative control flags for one job
///
/// `pause_requested` and `cancel_requested` are observed at stage
/// boundaries; the abort token interrupts the stage currently in flight.
/// When an aborted stage returns, `cancel_requested` decides whether the
/// abort was a pause or a cancellation.
#[derive(Debug)]
pub struct JobControl {
    cancel_requested: AtomicBool,
    pause_requested: AtomicBool,
    abort: Mutex<CancellationToken>,
}

impl Default for JobControl {
    fn default() -> Self {
        Self {
            cancel_requested: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            abort: Mutex::new(CancellationToken::new()),
        }
    }
}

impl JobControl {
    /// Request cancellation and interrupt the stage in flight
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.abort_current();
    }

    /// Request a pause
    ///
    /// When `interrupt` is set the stage in flight is aborted (safe for the
    /// resumable download stage); otherwise the pause waits for the next
    /// stage boundary.
    pub fn request_pause(&self, interrupt: bool) {
        self.pause_requested.store(true, Ordering::SeqCst);
        if interrupt {
            self.abort_current();
        }
    }

    /// Clear both requests before a resume or retry re-queues the job
    pub fn clear(&self) {
        self.cancel_requested.store(false, Ordering::SeqCst);
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Whether a pause has been requested
    pub fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    fn abort_current(&self) {
        if let Ok(token) = self.abort.lock() {
            token.cancel();
        }
    }

    /// Install and return a fresh abort token for the next stage
    fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut slot) = self.abort.lock() {
            *slot = token.clone();
        }
        token
    }
}

/// Mutable job state guarded by a lock
#[derive(Debug)]
pub struct JobState {
    /// Current status
    pub status: Status,
    /// Zero-based index of the current (or failed) stage, never decreasing
    /// except through an explicit retry re-entering the same stage
    pub stage_index: usize,
    /// Last error, retained while Failed
    pub error: Option<String>,
    /// Set when the job reaches a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}

/// One job: immutable identity plus shared mutable state
#[derive(Debug)]
pub struct Job {
    /// Unique identifier
    pub id: JobId,
    /// Display name
    pub name: String,
    /// Fixed, ordered stage list
    pub stages: Vec<StageKind>,
    /// Stage input/output derivation context
    pub ctx: StageContext,
    /// Guarded mutable state
    pub state: Mutex<JobState>,
    /// Live progress of the current stage
    pub progress: ProgressCell,
    /// Pause/cancel flags and the per-stage abort token
    pub control: JobControl,
    /// Submission time
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a freshly queued job
    pub fn new(id: JobId, name: String, stages: Vec<StageKind>, ctx: StageContext) -> Self {
        Self {
            id,
            name,
            stages,
            ctx,
            state: Mutex::new(JobState {
                status: Status::Queued,
                stage_index: 0,
                error: None,
                finished_at: None,
            }),
            progress: ProgressCell::default(),
            control: JobControl::default(),
            created_at: Utc::now(),
        }
    }

    /// Current status
    pub fn status(&self) -> Status {
        self.state.lock().map(|s| s.status).unwrap_or(Status::Failed)
    }

    /// Current stage index
    pub fn stage_index(&self) -> usize {
        self.state.lock().map(|s| s.stage_index).unwrap_or(0)
    }

    /// Whether the current stage is the resumable download stage
    pub fn in_download_stage(&self) -> bool {
        let index = self.stage_index();
        self.stages.get(index) == Some(&StageKind::Download)
    }

    /// Build a point-in-time snapshot for polling or display
    pub fn snapshot(&self) -> JobSnapshot {
        let (status, stage_index, error, finished_at) = match self.state.lock() {
            Ok(state) => (
                state.status,
                state.stage_index,
                state.error.clone(),
                state.finished_at,
            ),
            Err(_) => (Status::Failed, 0, Some("state lock poisoned".to_string()), None),
        };

        JobSnapshot {
            id: self.id,
            name: self.name.clone(),
            status,
            stage_index,
            stage: self.stages.get(stage_index).copied(),
            stage_count: self.stages.len(),
            bytes_done: self.progress.bytes_done(),
            bytes_total: self.progress.bytes_total(),
            error,
            destination: self.ctx.destination.clone(),
            created_at: self.created_at,
            finished_at,
        }
    }

    /// Atomically claim a queued job for execution
    ///
    /// The queue may hold more than one entry for a job that was paused and
    /// resumed while waiting; claiming guarantees only one of them runs.
    pub fn try_claim(&self) -> bool {
        if let Ok(mut state) = self.state.lock()
            && state.status == Status::Queued
        {
            state.status = Status::Running;
            return true;
        }
        false
    }

    /// Set the status, recording the finish time for terminal states
    pub fn set_status(&self, status: Status) {
        if let Ok(mut state) = self.state.lock() {
            state.status = status;
            if status.is_terminal() {
                state.finished_at = Some(Utc::now());
            }
        }
    }

    fn advance_stage(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.stage_index += 1;
        }
    }

    fn set_error(&self, message: String) {
        if let Ok(mut state) = self.state.lock() {
            state.error = Some(message);
        }
    }
}

/// Drives one job through its stage list
pub struct Pipeline {
    executor: Arc<StageExecutor>,
    events: broadcast::Sender<Event>,
    cleanup_intermediates: bool,
}

impl Pipeline {
    /// Create a pipeline over a shared stage executor
    pub fn new(
        executor: Arc<StageExecutor>,
        events: broadcast::Sender<Event>,
        cleanup_intermediates: bool,
    ) -> Self {
        Self {
            executor,
            events,
            cleanup_intermediates,
        }
    }

    /// Run the job from its current stage index until it pauses or reaches
    /// a terminal state
    ///
    /// Safe to call again on the same job after a resume or retry; the
    /// loop picks up at the recorded stage index.
    pub async fn run(&self, job: &Arc<Job>) {
        job.set_status(Status::Running);

        loop {
            if job.control.cancel_requested() {
                self.finish_cancelled(job);
                return;
            }
            if job.control.pause_requested() {
                self.finish_paused(job);
                return;
            }

            let index = job.stage_index();
            let Some(stage) = job.stages.get(index).copied() else {
                break;
            };

            job.progress.reset();
            let abort = job.control.arm();
            self.emit(Event::StageStarted {
                id: job.id,
                stage_index: index,
                stage,
            });

            let progress = self.progress_fn(job, stage);
            let output = self.output_fn(job, stage);

            let result = self
                .executor
                .execute(stage, &job.ctx, &abort, Some(progress), Some(output))
                .await;

            match result {
                Ok(StageOutcome::Completed) => {
                    self.emit(Event::StageComplete {
                        id: job.id,
                        stage_index: index,
                        stage,
                    });
                    job.advance_stage();
                }
                Ok(StageOutcome::Skipped { reason }) => {
                    tracing::info!(job = %job.id, stage = %stage, reason = %reason, "stage skipped");
                    self.emit(Event::StageSkipped {
                        id: job.id,
                        stage_index: index,
                        stage,
                        reason,
                    });
                    job.advance_stage();
                }
                Err(StageError::Cancelled) => {
                    // The abort fired; the flags say whether this was a
                    // pause or a cancellation.
                    if job.control.cancel_requested() {
                        self.finish_cancelled(job);
                    } else {
                        self.finish_paused(job);
                    }
                    return;
                }
                Err(e) => {
                    self.finish_failed(job, index, stage, &e);
                    return;
                }
            }
        }

        self.finish_succeeded(job).await;
    }

    fn progress_fn(&self, job: &Arc<Job>, stage: StageKind) -> ProgressFn {
        let job = job.clone();
        let events = self.events.clone();
        Arc::new(move |progress: TransferProgress| {
            job.progress.record(&progress);
            let _ = events.send(Event::Progress {
                id: job.id,
                stage,
                bytes_done: progress.bytes_done,
                bytes_total: progress.bytes_total,
                speed_bps: progress.speed_bps,
            });
        })
    }

    fn output_fn(&self, job: &Arc<Job>, stage: StageKind) -> crate::process::OutputFn {
        let id = job.id;
        let events = self.events.clone();
        Arc::new(move |line: String| {
            let _ = events.send(Event::ToolOutput { id, stage, line });
        })
    }

    fn finish_paused(&self, job: &Arc<Job>) {
        let index = job.stage_index();
        job.set_status(Status::Paused);
        tracing::info!(job = %job.id, stage_index = index, "job paused");
        self.emit(Event::Paused {
            id: job.id,
            stage_index: index,
        });
    }

    fn finish_cancelled(&self, job: &Arc<Job>) {
        job.set_status(Status::Cancelled);
        tracing::info!(job = %job.id, "job cancelled");
        self.emit(Event::Cancelled { id: job.id });
    }

    fn finish_failed(&self, job: &Arc<Job>, index: usize, stage: StageKind, error: &StageError) {
        let message = error.to_string();
        tracing::warn!(job = %job.id, stage = %stage, error = %message, "job failed");
        job.set_error(message.clone());
        job.set_status(Status::Failed);
        self.emit(Event::Failed {
            id: job.id,
            stage_index: index,
            stage,
            error: message,
        });
    }

    async fn finish_succeeded(&self, job: &Arc<Job>) {
        if self.cleanup_intermediates {
            self.cleanup(job).await;
        }
        let artifact = job.ctx.final_artifact();
        job.set_status(Status::Succeeded);
        tracing::info!(job = %job.id, artifact = %artifact.display(), "job complete");
        self.emit(Event::Complete {
            id: job.id,
            path: artifact,
        });
    }

    /// Remove inputs that a later stage has superseded
    async fn cleanup(&self, job: &Arc<Job>) {
        let ctx = &job.ctx;
        let artifact = ctx.final_artifact();

        let mut intermediates = Vec::new();
        if ctx.platform.needs_decrypt_tool() && artifact != ctx.destination {
            intermediates.push(ctx.destination.clone());
        }
        if ctx.platform.needs_split_tool() && artifact == ctx.parts_dir() {
            intermediates.push(ctx.split_input());
        }

        for path in intermediates {
            if path == artifact {
                continue;
            }
            if tokio::fs::remove_file(&path).await.is_ok() {
                tracing::debug!(job = %job.id, path = %path.display(), "removed intermediate");
            }
        }
    }

    fn emit(&self, event: Event) {
        // No receivers is fine; events are observation only
        let _ = self.events.send(event);
    }
}
