//! Job lifecycle control: pause, resume, cancel, retry, dismiss.
//!
//! Invalid transitions are rejected synchronously with
//! [`JobError::InvalidTransition`] before any job state changes.

use super::MyrientDownloader;
use crate::error::{JobError, Result};
use crate::types::{Event, JobId, Status};
use std::sync::atomic::Ordering;

impl MyrientDownloader {
    /// Pause a queued or running job
    ///
    /// A queued job parks immediately. A running job in its download stage
    /// is interrupted (the partial file is kept for resume); a running tool
    /// stage finishes first and the pause takes effect at the next stage
    /// boundary.
    pub async fn pause(&self, id: JobId) -> Result<()> {
        let job = self.get_job(id).await?;
        match job.status() {
            Status::Queued => {
                job.set_status(Status::Paused);
                self.emit(Event::Paused {
                    id,
                    stage_index: job.stage_index(),
                });
                Ok(())
            }
            Status::Running => {
                // The pipeline emits Paused once the stage lets go
                job.control.request_pause(job.in_download_stage());
                Ok(())
            }
            status => Err(JobError::InvalidTransition {
                id,
                operation: "pause",
                status,
            }
            .into()),
        }
    }

    /// Re-queue a paused job at its current stage
    pub async fn resume(&self, id: JobId) -> Result<()> {
        let job = self.get_job(id).await?;
        match job.status() {
            Status::Paused => {
                job.control.clear();
                job.set_status(Status::Queued);
                self.queue_state.queue.lock().await.push_back(id);
                self.emit(Event::Resumed {
                    id,
                    stage_index: job.stage_index(),
                });
                Ok(())
            }
            status => Err(JobError::InvalidTransition {
                id,
                operation: "resume",
                status,
            }
            .into()),
        }
    }

    /// Cancel a queued, paused or running job
    ///
    /// Partial download files always survive cancellation; a cancelled job
    /// stays in the registry until dismissed and can be retried.
    pub async fn cancel(&self, id: JobId) -> Result<()> {
        let job = self.get_job(id).await?;
        match job.status() {
            Status::Queued | Status::Paused => {
                job.control.request_cancel();
                job.set_status(Status::Cancelled);
                self.emit(Event::Cancelled { id });
                Ok(())
            }
            Status::Running => {
                // The pipeline emits Cancelled once the stage aborts
                job.control.request_cancel();
                Ok(())
            }
            status => Err(JobError::InvalidTransition {
                id,
                operation: "cancel",
                status,
            }
            .into()),
        }
    }

    /// Re-queue a failed or cancelled job at the stage it stopped in
    ///
    /// Completed earlier stages are not re-run; their outputs (including a
    /// partial download) are picked up where they were left.
    pub async fn retry(&self, id: JobId) -> Result<()> {
        if !self.queue_state.accepting_new.load(Ordering::SeqCst) {
            return Err(crate::error::Error::ShuttingDown);
        }

        let job = self.get_job(id).await?;
        match job.status() {
            Status::Failed | Status::Cancelled => {
                job.control.clear();
                if let Ok(mut state) = job.state.lock() {
                    state.error = None;
                    state.finished_at = None;
                    state.status = Status::Queued;
                }
                self.queue_state.queue.lock().await.push_back(id);
                self.emit(Event::Retrying {
                    id,
                    stage_index: job.stage_index(),
                });
                tracing::info!(job = %id, stage_index = job.stage_index(), "job requeued for retry");
                Ok(())
            }
            status => Err(JobError::InvalidTransition {
                id,
                operation: "retry",
                status,
            }
            .into()),
        }
    }

    /// Drop a terminal job from the registry
    ///
    /// Terminal jobs are retained (with their error, for Failed) until
    /// dismissed; dismissal also releases the job's destination claim.
    pub async fn dismiss(&self, id: JobId) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let job = registry.get(&id).ok_or(JobError::NotFound(id))?;
        let status = job.status();
        if !status.is_terminal() {
            return Err(JobError::InvalidTransition {
                id,
                operation: "dismiss",
                status,
            }
            .into());
        }
        registry.remove(&id);
        drop(registry);
        self.emit(Event::Dismissed { id });
        Ok(())
    }
}
