//! Queue processor: dispatches queued jobs under the concurrency limit.

use super::MyrientDownloader;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Interval between queue polling attempts when the queue is empty
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl MyrientDownloader {
    /// Start the queue processor task
    ///
    /// The spawned task continuously:
    /// 1. Pops the oldest queued job (strict FIFO by submission order)
    /// 2. Acquires a permit from the concurrency limiter
    /// 3. Claims the job and spawns its pipeline
    /// 4. Repeats until shutdown closes the semaphore
    ///
    /// Jobs that were paused, cancelled or dismissed while waiting in the
    /// queue fail the claim and are skipped; their slot goes to the next
    /// entry. A lower queue position never waits on a later one: permits
    /// are acquired one at a time in pop order.
    pub(crate) fn start_queue_processor(&self) -> tokio::task::JoinHandle<()> {
        let queue = self.queue_state.queue.clone();
        let concurrent_limit = self.queue_state.concurrent_limit.clone();
        let accepting_new = self.queue_state.accepting_new.clone();
        let registry = self.registry.clone();
        let pipeline = self.pipeline.clone();

        tokio::spawn(async move {
            loop {
                let next = {
                    let mut queue_guard = queue.lock().await;
                    queue_guard.pop_front()
                };

                if let Some(id) = next {
                    let job = {
                        let registry_guard = registry.lock().await;
                        registry_guard.get(&id).cloned()
                    };
                    // Dismissed while queued
                    let Some(job) = job else { continue };

                    // Blocks while the configured number of jobs is running
                    let permit = match concurrent_limit.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => {
                            // Semaphore closed during shutdown
                            break;
                        }
                    };

                    if !job.try_claim() {
                        // No longer Queued (paused or cancelled while waiting)
                        drop(permit);
                        continue;
                    }

                    tracing::debug!(job = %job.id, "dispatching job");
                    let pipeline = pipeline.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        pipeline.run(&job).await;
                    });
                } else {
                    if !accepting_new.load(Ordering::SeqCst) {
                        break;
                    }
                    tokio::time::sleep(QUEUE_POLL_INTERVAL).await;
                }
            }
            tracing::debug!("queue processor stopped");
        })
    }
}
