//! Stage executor: preconditions, engine dispatch, postconditions
//!
//! Each stage derives its input and output paths functionally from the
//! job's destination, so a retried or resumed stage recomputes the same
//! paths with nothing carried over from the failed run. Tool stages clean
//! up their own outputs on failure; the download stage never deletes its
//! partial file.

use crate::config::ToolsConfig;
use crate::error::{ProcessError, StageError, TransferError};
use crate::process::{OutputFn, RunOutcome, ToolRunner, resolve_tool};
use crate::transfer::{ProgressFn, TransferEngine, TransferOutcome, TransferRequest};
use crate::types::{Platform, StageKind};
use crate::utils;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a stage needs to derive its inputs and outputs
#[derive(Clone, Debug)]
pub struct StageContext {
    /// Remote URL for the download stage
    pub url: String,
    /// Final path of the raw downloaded file
    pub destination: PathBuf,
    /// The job's private working directory
    pub work_dir: PathBuf,
    /// Expected download size, if known from the index
    pub expected_size: Option<u64>,
    /// Expected SHA-256 of the download, if known
    pub checksum: Option<String>,
    /// Platform, which determines which later stages exist
    pub platform: Platform,
}

impl StageContext {
    /// Output of the decrypt stage
    pub fn decrypted(&self) -> PathBuf {
        utils::decrypted_path(&self.destination)
    }

    /// Input of the split stage: the decrypted file when the pipeline has a
    /// decrypt stage, otherwise the raw download
    pub fn split_input(&self) -> PathBuf {
        if self.platform.needs_decrypt_tool() {
            self.decrypted()
        } else {
            self.destination.clone()
        }
    }

    /// Output directory of the split stage
    pub fn parts_dir(&self) -> PathBuf {
        utils::parts_dir(&self.work_dir)
    }

    /// Path of the job's final artifact once all stages have run
    ///
    /// The split stage may be skipped for small inputs, in which case the
    /// artifact is whatever the last stage that actually produced output
    /// left behind.
    pub fn final_artifact(&self) -> PathBuf {
        let parts = self.parts_dir();
        if self.platform.needs_split_tool() && parts.is_dir() {
            return parts;
        }
        if self.platform.needs_decrypt_tool() {
            return self.decrypted();
        }
        self.destination.clone()
    }
}

/// How a stage ended when it did not fail
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage ran and its postcondition holds
    Completed,
    /// Policy decided the stage had nothing to do
    Skipped {
        /// Why, e.g. "already complete" or "below split threshold"
        reason: String,
    },
}

/// Executes single stages against the transfer engine and tool runner
pub struct StageExecutor {
    engine: Arc<TransferEngine>,
    runner: Arc<ToolRunner>,
    tools: ToolsConfig,
}

impl StageExecutor {
    /// Create an executor over shared engines
    pub fn new(engine: Arc<TransferEngine>, runner: Arc<ToolRunner>, tools: ToolsConfig) -> Self {
        Self {
            engine,
            runner,
            tools,
        }
    }

    /// Verify that every tool a platform's stage list needs can be resolved
    ///
    /// Called at submit time so a missing tool is rejected before the job
    /// enters the queue rather than failing mid-pipeline.
    pub fn check_tools(&self, platform: Platform) -> crate::error::Result<()> {
        if platform.needs_decrypt_tool() {
            self.decrypt_tool()?;
        }
        if platform.needs_split_tool() {
            self.split_tool()?;
        }
        Ok(())
    }

    fn decrypt_tool(&self) -> crate::error::Result<PathBuf> {
        resolve_tool(
            self.tools.ps3dec_path.as_deref(),
            "ps3dec",
            self.tools.search_path,
            "tools.ps3dec_path",
        )
    }

    fn split_tool(&self) -> crate::error::Result<PathBuf> {
        resolve_tool(
            self.tools.splitter_path.as_deref(),
            "splitfile",
            self.tools.search_path,
            "tools.splitter_path",
        )
    }

    /// Execute one stage
    ///
    /// Cancellation (of the token) aborts the stage and surfaces as
    /// [`StageError::Cancelled`] regardless of which engine noticed it.
    pub async fn execute(
        &self,
        stage: StageKind,
        ctx: &StageContext,
        cancel: &CancellationToken,
        progress: Option<ProgressFn>,
        output: Option<OutputFn>,
    ) -> Result<StageOutcome, StageError> {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        tracing::debug!(stage = %stage, destination = %ctx.destination.display(), "executing stage");

        match stage {
            StageKind::Download => self.download(ctx, cancel, progress).await,
            StageKind::Decrypt => self.decrypt(ctx, cancel, output).await,
            StageKind::SplitOrExtract => self.split(ctx, cancel, output).await,
        }
    }

    async fn download(
        &self,
        ctx: &StageContext,
        cancel: &CancellationToken,
        progress: Option<ProgressFn>,
    ) -> Result<StageOutcome, StageError> {
        let request = TransferRequest {
            url: ctx.url.clone(),
            destination: ctx.destination.clone(),
            expected_size: ctx.expected_size,
            checksum: ctx.checksum.clone(),
        };

        match self.engine.download(&request, cancel, progress).await {
            Ok(TransferOutcome::Completed { .. }) => Ok(StageOutcome::Completed),
            Ok(TransferOutcome::AlreadyComplete) => Ok(StageOutcome::Skipped {
                reason: "already complete".to_string(),
            }),
            Err(TransferError::Cancelled) => Err(StageError::Cancelled),
            Err(e) => Err(e.into()),
        }
    }

    async fn decrypt(
        &self,
        ctx: &StageContext,
        cancel: &CancellationToken,
        output: Option<OutputFn>,
    ) -> Result<StageOutcome, StageError> {
        let input = &ctx.destination;
        require_nonempty_file(input, StageKind::Decrypt)?;

        let tool = self.decrypt_tool().map_err(|e| StageError::PreconditionUnmet {
            stage: StageKind::Decrypt,
            reason: e.to_string(),
        })?;
        let out = ctx.decrypted();

        let result = self
            .runner
            .run(
                &tool,
                &[input.as_os_str(), out.as_os_str()],
                cancel,
                output,
            )
            .await;

        match result {
            Ok(RunOutcome::Completed) => {
                if !is_nonempty_file(&out) {
                    remove_stage_output(&out).await;
                    return Err(StageError::PostconditionUnmet {
                        stage: StageKind::Decrypt,
                        reason: format!(
                            "tool reported success but '{}' is missing or empty",
                            out.display()
                        ),
                    });
                }
                Ok(StageOutcome::Completed)
            }
            Ok(RunOutcome::Cancelled) => {
                remove_stage_output(&out).await;
                Err(StageError::Cancelled)
            }
            Err(e) => {
                remove_stage_output(&out).await;
                Err(process_error(e))
            }
        }
    }

    async fn split(
        &self,
        ctx: &StageContext,
        cancel: &CancellationToken,
        output: Option<OutputFn>,
    ) -> Result<StageOutcome, StageError> {
        let input = ctx.split_input();
        let size = require_nonempty_file(&input, StageKind::SplitOrExtract)?;

        if size <= self.tools.split_threshold {
            return Ok(StageOutcome::Skipped {
                reason: "below split threshold".to_string(),
            });
        }

        let tool = self.split_tool().map_err(|e| StageError::PreconditionUnmet {
            stage: StageKind::SplitOrExtract,
            reason: e.to_string(),
        })?;

        let parts = ctx.parts_dir();
        tokio::fs::create_dir_all(&parts)
            .await
            .map_err(|e| StageError::Io {
                path: parts.clone(),
                source: e,
            })?;

        let result = self
            .runner
            .run(
                &tool,
                &[input.as_os_str(), parts.as_os_str()],
                cancel,
                output,
            )
            .await;

        match result {
            Ok(RunOutcome::Completed) => {
                if !dir_has_files(&parts) {
                    remove_stage_dir(&parts).await;
                    return Err(StageError::PostconditionUnmet {
                        stage: StageKind::SplitOrExtract,
                        reason: format!(
                            "tool reported success but '{}' contains no files",
                            parts.display()
                        ),
                    });
                }
                Ok(StageOutcome::Completed)
            }
            Ok(RunOutcome::Cancelled) => {
                remove_stage_dir(&parts).await;
                Err(StageError::Cancelled)
            }
            Err(e) => {
                remove_stage_dir(&parts).await;
                Err(process_error(e))
            }
        }
    }
}

fn process_error(e: ProcessError) -> StageError {
    StageError::Process(e)
}

fn require_nonempty_file(path: &Path, stage: StageKind) -> Result<u64, StageError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(meta.len()),
        Ok(_) => Err(StageError::PreconditionUnmet {
            stage,
            reason: format!("input '{}' is empty or not a file", path.display()),
        }),
        Err(_) => Err(StageError::PreconditionUnmet {
            stage,
            reason: format!("input '{}' does not exist", path.display()),
        }),
    }
}

fn is_nonempty_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

fn dir_has_files(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Remove a failed tool stage's output file; earlier stages' files survive
async fn remove_stage_output(path: &Path) {
    if tokio::fs::remove_file(path).await.is_ok() {
        tracing::debug!(path = %path.display(), "removed incomplete stage output");
    }
}

/// Remove a failed split stage's output directory
async fn remove_stage_dir(path: &Path) {
    if tokio::fs::remove_dir_all(path).await.is_ok() {
        tracing::debug!(path = %path.display(), "removed incomplete stage output directory");
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DownloadConfig, RetryConfig};
    use crate::transfer::{FetchBody, RemoteInfo, Transport};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct StaticTransport(Vec<u8>);

    #[async_trait]
    impl Transport for StaticTransport {
        async fn probe(&self, _url: &str) -> Result<RemoteInfo, TransferError> {
            Ok(RemoteInfo {
                total_size: Some(self.0.len() as u64),
                accepts_ranges: true,
            })
        }

        async fn fetch(&self, _url: &str, offset: u64) -> Result<FetchBody, TransferError> {
            let body = self.0[offset as usize..].to_vec();
            Ok(FetchBody {
                resumed_at: offset,
                total_size: Some(self.0.len() as u64),
                stream: Box::pin(futures::stream::once(async move { Ok(body) })),
            })
        }
    }

    fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn executor(tools: ToolsConfig) -> StageExecutor {
        let engine = Arc::new(TransferEngine::new(
            Arc::new(StaticTransport(b"encrypted-image-bytes".to_vec())),
            DownloadConfig::default(),
            RetryConfig {
                jitter: false,
                initial_delay: std::time::Duration::from_millis(1),
                ..RetryConfig::default()
            },
        ));
        let runner = Arc::new(ToolRunner::new(std::time::Duration::from_millis(500)));
        StageExecutor::new(engine, runner, tools)
    }

    fn context(dir: &TempDir, platform: Platform) -> StageContext {
        StageContext {
            url: "http://mirror.test/game.iso".to_string(),
            destination: dir.path().join("game.iso"),
            work_dir: dir.path().to_path_buf(),
            expected_size: None,
            checksum: None,
            platform,
        }
    }

    #[tokio::test]
    async fn decrypt_requires_its_input() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Platform::Ps3);
        let exec = executor(ToolsConfig::default());

        let err = exec
            .execute(StageKind::Decrypt, &ctx, &CancellationToken::new(), None, None)
            .await
            .unwrap_err();

        assert!(
            matches!(err, StageError::PreconditionUnmet { stage: StageKind::Decrypt, .. }),
            "no download yet, so decrypt must refuse to run: {err}"
        );
    }

    #[tokio::test]
    async fn decrypt_runs_tool_and_checks_its_output() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Platform::Ps3);
        std::fs::write(&ctx.destination, b"encrypted").unwrap();

        // A stand-in that actually produces the declared output
        let tool = script(&dir, "ps3dec.sh", r#"cat "$1" > "$2""#);
        let exec = executor(ToolsConfig {
            ps3dec_path: Some(tool),
            ..ToolsConfig::default()
        });

        let outcome = exec
            .execute(StageKind::Decrypt, &ctx, &CancellationToken::new(), None, None)
            .await
            .unwrap();

        assert_eq!(outcome, StageOutcome::Completed);
        assert_eq!(std::fs::read(ctx.decrypted()).unwrap(), b"encrypted");
    }

    #[tokio::test]
    async fn lying_decrypt_tool_fails_the_postcondition_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Platform::Ps3);
        std::fs::write(&ctx.destination, b"encrypted").unwrap();

        // Exits zero but writes an empty output file
        let tool = script(&dir, "liar.sh", r#": > "$2"; exit 0"#);
        let exec = executor(ToolsConfig {
            ps3dec_path: Some(tool),
            ..ToolsConfig::default()
        });

        let err = exec
            .execute(StageKind::Decrypt, &ctx, &CancellationToken::new(), None, None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StageError::PostconditionUnmet { stage: StageKind::Decrypt, .. }
        ));
        assert!(
            !ctx.decrypted().exists(),
            "the implausible output must be removed so a retry starts clean"
        );
        assert!(ctx.destination.exists(), "the stage input must survive");
    }

    #[tokio::test]
    async fn failing_decrypt_tool_keeps_input_removes_output() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Platform::Ps3);
        std::fs::write(&ctx.destination, b"encrypted").unwrap();

        let tool = script(&dir, "broken.sh", r#"echo partial > "$2"; exit 1"#);
        let exec = executor(ToolsConfig {
            ps3dec_path: Some(tool),
            ..ToolsConfig::default()
        });

        let err = exec
            .execute(StageKind::Decrypt, &ctx, &CancellationToken::new(), None, None)
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::Process(ProcessError::NonZeroExit { code: 1, .. })));
        assert!(!ctx.decrypted().exists());
        assert!(ctx.destination.exists());
    }

    #[tokio::test]
    async fn small_input_skips_the_split_stage() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Platform::Psn);
        std::fs::write(&ctx.destination, b"tiny package").unwrap();

        let exec = executor(ToolsConfig::default());

        let outcome = exec
            .execute(
                StageKind::SplitOrExtract,
                &ctx,
                &CancellationToken::new(),
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            StageOutcome::Skipped {
                reason: "below split threshold".to_string()
            },
            "a file under the FAT32 limit needs no splitting"
        );
        assert!(!ctx.parts_dir().exists(), "no output directory for a skipped stage");
    }

    #[tokio::test]
    async fn split_runs_tool_into_the_parts_directory() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Platform::Psn);
        std::fs::write(&ctx.destination, b"0123456789").unwrap();

        let tool = script(
            &dir,
            "split.sh",
            r#"head -c 5 "$1" > "$2/part.0"; tail -c 5 "$1" > "$2/part.1""#,
        );
        let exec = executor(ToolsConfig {
            splitter_path: Some(tool),
            split_threshold: 4, // force the stage to run on a 10-byte input
            ..ToolsConfig::default()
        });

        let outcome = exec
            .execute(
                StageKind::SplitOrExtract,
                &ctx,
                &CancellationToken::new(),
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome, StageOutcome::Completed);
        assert_eq!(
            std::fs::read(ctx.parts_dir().join("part.0")).unwrap(),
            b"01234"
        );
        assert_eq!(
            std::fs::read(ctx.parts_dir().join("part.1")).unwrap(),
            b"56789"
        );
    }

    #[tokio::test]
    async fn split_postcondition_requires_at_least_one_part() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Platform::Psn);
        std::fs::write(&ctx.destination, b"0123456789").unwrap();

        let tool = script(&dir, "noop-split.sh", "exit 0");
        let exec = executor(ToolsConfig {
            splitter_path: Some(tool),
            split_threshold: 4,
            ..ToolsConfig::default()
        });

        let err = exec
            .execute(
                StageKind::SplitOrExtract,
                &ctx,
                &CancellationToken::new(),
                None,
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StageError::PostconditionUnmet { stage: StageKind::SplitOrExtract, .. }
        ));
        assert!(!ctx.parts_dir().exists());
    }

    #[tokio::test]
    async fn split_input_follows_the_pipeline_shape() {
        let dir = TempDir::new().unwrap();
        let ps3 = context(&dir, Platform::Ps3);
        let psn = context(&dir, Platform::Psn);

        assert_eq!(
            ps3.split_input(),
            ps3.decrypted(),
            "a PS3 pipeline splits the decrypted image"
        );
        assert_eq!(
            psn.split_input(),
            psn.destination,
            "a PSN pipeline splits the raw download"
        );
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_any_work() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Platform::Other);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = executor(ToolsConfig::default())
            .execute(StageKind::Download, &ctx, &cancel, None, None)
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::Cancelled));
    }

    #[tokio::test]
    async fn missing_tool_is_reported_as_an_unmet_precondition() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, Platform::Ps3);
        std::fs::write(&ctx.destination, b"encrypted").unwrap();

        let exec = executor(ToolsConfig {
            ps3dec_path: None,
            search_path: false,
            ..ToolsConfig::default()
        });

        let err = exec
            .execute(StageKind::Decrypt, &ctx, &CancellationToken::new(), None, None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StageError::PreconditionUnmet { stage: StageKind::Decrypt, .. }
        ));
    }

    #[test]
    fn check_tools_only_requires_what_the_platform_uses() {
        let exec = executor(ToolsConfig {
            search_path: false,
            ..ToolsConfig::default()
        });

        assert!(exec.check_tools(Platform::Other).is_ok());
        assert!(exec.check_tools(Platform::Ps3).is_err());
        assert!(exec.check_tools(Platform::Psn).is_err());
    }
}
