//! Shared fixtures for integration tests: a range-aware mock mirror,
//! fake helper tools and a fast-retry configuration.

#![allow(dead_code)]

use myrient_dl::{Config, Event, RetryConfig};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use wiremock::{Request, Respond, ResponseTemplate};

/// Responder that honors `Range: bytes=N-` requests with 206 responses,
/// answers 416 for out-of-range offsets and records every offset it served
pub struct RangeResponder {
    body: Vec<u8>,
    pub offsets: Arc<Mutex<Vec<u64>>>,
}

impl RangeResponder {
    pub fn new(body: &[u8]) -> Self {
        Self {
            body: body.to_vec(),
            offsets: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn served_offsets(&self) -> Vec<u64> {
        self.offsets.lock().unwrap().clone()
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let offset = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.strip_suffix('-'))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        self.offsets.lock().unwrap().push(offset);

        if offset > 0 && (offset as usize) >= self.body.len() {
            // The requested suffix starts at or past the end of the body
            ResponseTemplate::new(416).insert_header("accept-ranges", "bytes")
        } else if offset > 0 {
            ResponseTemplate::new(206)
                .insert_header("accept-ranges", "bytes")
                .set_body_bytes(self.body[offset as usize..].to_vec())
        } else {
            ResponseTemplate::new(200)
                .insert_header("accept-ranges", "bytes")
                .set_body_bytes(self.body.clone())
        }
    }
}

/// Write an executable shell script standing in for a helper tool
pub fn fake_tool(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// Config with a temp download dir and millisecond-scale retries
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.download.download_dir = dir.path().join("downloads");
    config.tools.search_path = false;
    config.tools.termination_grace = Duration::from_millis(500);
    config.queue.max_concurrent_jobs = 2;
    config.retry = RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config
}

/// Receive events until one matches, panicking after the deadline
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<Event>, mut pred: F) -> Event
where
    F: FnMut(&Event) -> bool,
{
    let deadline = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    });
    deadline.await.expect("timed out waiting for event")
}
