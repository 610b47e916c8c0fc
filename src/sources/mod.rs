// src/sources/mod.rs
//! Source adapters: one [`GuideSource`] per EPG tool, wrapped by a
//! [`SourceAdapter`] that gives every tool the same contract: run with a
//! timeout, write into a private directory, come back as a [`GuideFragment`].

pub mod command;
pub mod openwebif;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::guide::xmltv;
use crate::guide::GuideFragment;

pub const FRAGMENT_FILE_NAME: &str = "fragment.xml";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("tool `{0}` not found")]
    ToolNotFound(String),
    #[error("timed out after {0:?}")]
    ToolTimedOut(Duration),
    #[error("exited with status {code:?}: {stderr}")]
    ToolExitedNonZero { code: Option<i32>, stderr: String },
    #[error("output unparsable: {0}")]
    OutputUnparsable(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("cancelled by shutdown")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::ToolNotFound(_) => "not_found",
            SourceError::ToolTimedOut(_) => "timeout",
            SourceError::ToolExitedNonZero { .. } => "exit_status",
            SourceError::OutputUnparsable(_) => "unparsable",
            SourceError::Fetch(_) => "fetch",
            SourceError::Cancelled => "cancelled",
            SourceError::Io(_) => "io",
        }
    }
}

/// One EPG-producing tool. Implementations write a complete XMLTV document to
/// `output` and must not touch any other location.
#[async_trait]
pub trait GuideSource: Send + Sync {
    fn id(&self) -> &str;

    /// Version of the wrapped tool, if it can tell.
    async fn version(&self) -> Option<String> {
        None
    }

    async fn produce(&self, output: &Path) -> Result<(), SourceError>;
}

/// Uniform wrapper around a [`GuideSource`]: timeout, private work dir, parsing.
pub struct SourceAdapter {
    source: Box<dyn GuideSource>,
    timeout: Duration,
    work_dir: PathBuf,
}

impl SourceAdapter {
    pub fn new(source: Box<dyn GuideSource>, timeout: Duration, work_root: &Path) -> Self {
        let work_dir = work_root.join(source.id());
        Self {
            source,
            timeout,
            work_dir,
        }
    }

    pub fn id(&self) -> &str {
        self.source.id()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn output_path(&self) -> PathBuf {
        self.work_dir.join(FRAGMENT_FILE_NAME)
    }

    /// Run the source once. Never fails: every error becomes a failed fragment.
    pub async fn run(&self, cancel: &CancellationToken) -> GuideFragment {
        let t0 = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SourceError::Cancelled),
            r = tokio::time::timeout(self.timeout, self.fetch()) => {
                r.unwrap_or(Err(SourceError::ToolTimedOut(self.timeout)))
            }
        };
        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("epg_source_run_ms", "source" => self.id().to_string()).record(ms);

        match result {
            Ok(fragment) => {
                tracing::info!(
                    target: "source",
                    source = self.id(),
                    channels = fragment.channels.len(),
                    programmes = fragment.programme_count(),
                    elapsed_ms = ms as u64,
                    "source produced fragment"
                );
                fragment
            }
            Err(e) => {
                tracing::warn!(
                    target: "source",
                    source = self.id(),
                    kind = e.kind(),
                    error = %e,
                    "source failed"
                );
                counter!(
                    "epg_source_failures_total",
                    "source" => self.id().to_string(),
                    "kind" => e.kind()
                )
                .increment(1);
                GuideFragment::failed(self.id(), e)
            }
        }
    }

    async fn fetch(&self) -> Result<GuideFragment, SourceError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let out = self.output_path();
        match tokio::fs::remove_file(&out).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.source.produce(&out).await?;

        let path = out.clone();
        let parsed = tokio::task::spawn_blocking(move || xmltv::parse_file(&path))
            .await
            .map_err(|e| SourceError::OutputUnparsable(format!("parser task failed: {e}")))?
            .map_err(|e| SourceError::OutputUnparsable(e.to_string()))?;

        if parsed.orphans + parsed.invalid + parsed.duplicate_channels > 0 {
            tracing::debug!(
                target: "source",
                source = self.id(),
                orphans = parsed.orphans,
                invalid = parsed.invalid,
                duplicate_channels = parsed.duplicate_channels,
                "dropped entries while parsing fragment"
            );
        }

        let version = self.source.version().await;
        Ok(GuideFragment::succeeded(
            self.id(),
            parsed.channels,
            Some(out),
            version,
        ))
    }
}

/// Run all adapters concurrently and join them. One fragment per adapter,
/// in completion order.
pub async fn run_all(
    adapters: &[Arc<SourceAdapter>],
    cancel: &CancellationToken,
) -> Vec<GuideFragment> {
    let mut set = JoinSet::new();
    let mut ids = HashMap::with_capacity(adapters.len());
    for adapter in adapters {
        let a = Arc::clone(adapter);
        let c = cancel.clone();
        let handle = set.spawn(async move { a.run(&c).await });
        ids.insert(handle.id(), adapter.id().to_string());
    }

    let mut out = Vec::with_capacity(adapters.len());
    while let Some(joined) = set.join_next_with_id().await {
        match joined {
            Ok((_, fragment)) => out.push(fragment),
            Err(e) => {
                let id = ids.get(&e.id()).cloned().unwrap_or_default();
                tracing::error!(target: "source", source = %id, error = %e, "source task aborted");
                out.push(GuideFragment::failed(id, format!("task aborted: {e}")));
            }
        }
    }
    out
}
