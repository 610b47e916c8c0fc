// src/pipeline.rs
//! One refresh cycle: run every source, merge, publish.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{OrchestratorConfig, SourceKind};
use crate::guide::GuideFragment;
use crate::merge::{merge, MergeError, SourcePriority};
use crate::publish::{PublishError, Publisher};
use crate::sources::command::CommandSource;
use crate::sources::openwebif::OpenWebifSource;
use crate::sources::{run_all, GuideSource, SourceAdapter};

/// Per-source line of a cycle report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceRun {
    pub source_id: String,
    pub success: bool,
    pub channels: usize,
    pub programmes: usize,
    pub tool_version: Option<String>,
    pub error: Option<String>,
}

impl From<&GuideFragment> for SourceRun {
    fn from(f: &GuideFragment) -> Self {
        Self {
            source_id: f.source_id.clone(),
            success: f.success,
            channels: f.channels.len(),
            programmes: f.programme_count(),
            tool_version: f.tool_version.clone(),
            error: f.error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Published {
        /// At least one source failed.
        partial: bool,
        path: PathBuf,
        bytes: u64,
        sha256: String,
        channels: usize,
        programmes: usize,
    },
    NoUsableData,
    PublishFailed { error: String },
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleResult {
    Success,
    Partial,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// Sorted by source id.
    pub sources: Vec<SourceRun>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CycleReport {
    pub fn result(&self) -> CycleResult {
        match &self.outcome {
            CycleOutcome::Published { partial: false, .. } => CycleResult::Success,
            CycleOutcome::Published { partial: true, .. } => CycleResult::Partial,
            _ => CycleResult::Failure,
        }
    }

    pub fn published(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Published { .. })
    }

    pub fn summary(&self) -> String {
        let ok = self.sources.iter().filter(|s| s.success).count();
        match &self.outcome {
            CycleOutcome::Published {
                channels,
                programmes,
                ..
            } => format!(
                "published {channels} channels / {programmes} programmes from {ok}/{} sources",
                self.sources.len()
            ),
            CycleOutcome::NoUsableData => {
                format!("no usable data: all {} sources failed", self.sources.len())
            }
            CycleOutcome::PublishFailed { error } => format!("publish failed: {error}"),
            CycleOutcome::Cancelled => "cancelled".to_string(),
        }
    }
}

/// Something the scheduler can run. The real implementation is [`Pipeline`].
#[async_trait]
pub trait RefreshCycle: Send + Sync + 'static {
    async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport;
}

pub struct Pipeline {
    adapters: Vec<Arc<SourceAdapter>>,
    priority: SourcePriority,
    publisher: Arc<Publisher>,
}

impl Pipeline {
    pub fn new(
        adapters: Vec<Arc<SourceAdapter>>,
        priority: SourcePriority,
        publisher: Publisher,
    ) -> Self {
        Self {
            adapters,
            priority,
            publisher: Arc::new(publisher),
        }
    }

    pub fn from_config(cfg: &OrchestratorConfig) -> Self {
        let adapters = cfg
            .sources
            .iter()
            .map(|s| {
                let source: Box<dyn GuideSource> = match &s.kind {
                    SourceKind::Command(c) => Box::new(CommandSource::from_config(&s.id, c)),
                    SourceKind::Openwebif(o) => Box::new(OpenWebifSource::from_config(&s.id, o)),
                };
                Arc::new(SourceAdapter::new(
                    source,
                    Duration::from_secs(s.timeout_secs),
                    &cfg.work_dir,
                ))
            })
            .collect();
        Self::new(
            adapters,
            cfg.source_priority(),
            Publisher::new(&cfg.guide_path),
        )
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.id()).collect()
    }
}

#[async_trait]
impl RefreshCycle for Pipeline {
    async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        crate::metrics::ensure_described();
        let started_at = Utc::now();
        let t0 = std::time::Instant::now();

        let fragments = run_all(&self.adapters, cancel).await;
        let mut sources: Vec<SourceRun> = fragments.iter().map(SourceRun::from).collect();
        sources.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        let failed = sources.iter().filter(|s| !s.success).count();
        gauge!("epg_sources_failed").set(failed as f64);

        let outcome = if cancel.is_cancelled() {
            tracing::info!(target: "pipeline", "cycle cancelled; not publishing");
            CycleOutcome::Cancelled
        } else {
            match merge(&fragments, &self.priority) {
                Err(MergeError::NoUsableData { attempted }) => {
                    tracing::warn!(
                        target: "pipeline",
                        attempted,
                        "no usable guide data; keeping previous guide"
                    );
                    CycleOutcome::NoUsableData
                }
                Ok(guide) => {
                    let publisher = Arc::clone(&self.publisher);
                    let published =
                        tokio::task::spawn_blocking(move || publisher.publish(&guide)).await;
                    match published {
                        Ok(Ok(report)) => {
                            gauge!("epg_guide_bytes").set(report.bytes as f64);
                            gauge!("epg_guide_channels").set(report.channels as f64);
                            gauge!("epg_guide_programmes").set(report.programmes as f64);
                            gauge!("epg_guide_last_publish_ts")
                                .set(report.published_at.timestamp() as f64);
                            CycleOutcome::Published {
                                partial: failed > 0,
                                path: report.path,
                                bytes: report.bytes,
                                sha256: report.sha256,
                                channels: report.channels,
                                programmes: report.programmes,
                            }
                        }
                        Ok(Err(e)) => publish_failed(&e),
                        Err(join) => {
                            tracing::error!(target: "pipeline", error = %join, "publish task failed");
                            CycleOutcome::PublishFailed {
                                error: join.to_string(),
                            }
                        }
                    }
                }
            }
        };

        let report = CycleReport {
            outcome,
            sources,
            started_at,
            finished_at: Utc::now(),
        };
        let result = report.result();
        counter!(
            "epg_cycles_total",
            "result" => match result {
                CycleResult::Success => "success",
                CycleResult::Partial => "partial",
                CycleResult::Failure => "failure",
            }
        )
        .increment(1);
        histogram!("epg_cycle_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        tracing::info!(target: "pipeline", ?result, summary = %report.summary(), "cycle finished");
        report
    }
}

fn publish_failed(e: &PublishError) -> CycleOutcome {
    tracing::error!(target: "pipeline", error = %e, "publishing guide failed");
    counter!("epg_publish_failures_total").increment(1);
    CycleOutcome::PublishFailed {
        error: e.to_string(),
    }
}
