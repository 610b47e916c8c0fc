// src/metrics.rs
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Call once per process.
    pub fn init() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| anyhow::anyhow!("prometheus: install recorder: {e}"))?;
        ensure_described();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

/// Register descriptions for every series the orchestrator emits.
pub fn ensure_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_histogram!("epg_source_run_ms", "Source adapter run time in milliseconds.");
        describe_counter!(
            "epg_source_failures_total",
            "Failed source runs by source and failure kind."
        );
        describe_gauge!("epg_sources_failed", "Sources that failed in the last cycle.");
        describe_counter!("epg_cycles_total", "Refresh cycles by result.");
        describe_histogram!("epg_cycle_ms", "Refresh cycle duration in milliseconds.");
        describe_counter!("epg_publish_failures_total", "Guide publications that failed.");
        describe_gauge!("epg_guide_bytes", "Size of the last published guide.");
        describe_gauge!("epg_guide_channels", "Channels in the last published guide.");
        describe_gauge!("epg_guide_programmes", "Programmes in the last published guide.");
        describe_gauge!(
            "epg_guide_last_publish_ts",
            "Unix time of the last successful publication."
        );
        describe_counter!(
            "epg_refresh_triggers_total",
            "Manual refresh triggers (queued or coalesced)."
        );
        describe_gauge!("epg_scheduler_running", "1 while a refresh cycle runs.");
        describe_gauge!("epg_proxy_up", "1 while the proxy process is running.");
        describe_counter!("epg_proxy_restarts_total", "Proxy crashes followed by a restart.");
        describe_counter!(
            "epg_proxy_probe_failures_total",
            "Failed proxy health probes."
        );
        describe_gauge!(
            "epg_proxy_persistent_failure",
            "1 while the proxy keeps crashing right after start."
        );
    });
}
