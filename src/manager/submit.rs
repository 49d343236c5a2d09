//! Job admission: destination derivation, conflict checks, queueing.

use super::MyrientDownloader;
use crate::error::{Error, JobError, Result};
use crate::pipeline::Job;
use crate::stage::StageContext;
use crate::types::{Event, JobId, Platform, Title};
use crate::utils;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

impl MyrientDownloader {
    /// Submit a title for acquisition
    ///
    /// The job's stage list is fixed by the platform at this point and
    /// never changes. Submission fails synchronously when:
    /// - shutdown is in progress
    /// - a tool the platform's stages need cannot be resolved
    /// - the computed destination is already claimed by a non-terminal job
    ///
    /// On success the job is queued FIFO and a [`Event::Queued`] is
    /// emitted; all further outcomes are reported through events and
    /// snapshots.
    pub async fn submit(&self, title: Title, platform: Platform) -> Result<JobId> {
        if !self.queue_state.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        self.executor.check_tools(platform)?;

        let file_name = utils::file_name_from_url(&title.url)?;
        let stem = Path::new(&file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&file_name)
            .to_string();
        let work_dir = self.config.download.download_dir.join(&stem);
        let destination = work_dir.join(&file_name);

        // Idempotent, and done before taking the registry lock
        tokio::fs::create_dir_all(&work_dir).await?;

        let name = if title.name.is_empty() {
            file_name
        } else {
            title.name.clone()
        };

        let mut registry = self.registry.lock().await;

        for job in registry.values() {
            if !job.status().is_terminal() && job.ctx.destination == destination {
                return Err(JobError::DestinationConflict {
                    path: destination,
                    existing: job.id,
                }
                .into());
            }
        }

        let id = JobId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let ctx = StageContext {
            url: title.url,
            destination,
            work_dir,
            // Index sizes are approximate; the transfer trusts the server
            expected_size: None,
            checksum: None,
            platform,
        };
        let job = Arc::new(Job::new(id, name.clone(), platform.stages(), ctx));
        registry.insert(id, job);
        drop(registry);

        self.queue_state.queue.lock().await.push_back(id);
        self.emit(Event::Queued { id, name: name.clone() });
        tracing::info!(job = %id, name = %name, platform = ?platform, "job queued");

        Ok(id)
    }
}
