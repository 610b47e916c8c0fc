//! EPG orchestrator container entrypoint.
//! Starts the proxy supervisor, the guide refresh scheduler and (optionally)
//! the read-only status server, then waits for operational signals.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use epg_orchestrator::config::OrchestratorConfig;
use epg_orchestrator::metrics::Metrics;
use epg_orchestrator::pipeline::Pipeline;
use epg_orchestrator::scheduler::Scheduler;
use epg_orchestrator::signals::{ControlSignal, SignalListener};
use epg_orchestrator::status::{self, AppState};
use epg_orchestrator::supervisor::Supervisor;

/// Extra time allowed for tasks to wind down on top of the proxy grace period.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in containers without one.
    let _ = dotenvy::dotenv();
    epg_orchestrator::init_tracing();

    let cfg = OrchestratorConfig::load_default().context("loading orchestrator config")?;
    tracing::info!(
        guide = %cfg.guide_path.display(),
        sources = cfg.sources.len(),
        interval_secs = cfg.schedule.interval_secs,
        proxy = cfg.proxy.is_some(),
        "configuration loaded"
    );

    let metrics = match cfg.status.listen {
        Some(_) => Some(Metrics::init()?),
        None => None,
    };
    epg_orchestrator::metrics::ensure_described();

    let mut signals = SignalListener::install().context("installing signal handlers")?;
    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let mut grace = Duration::ZERO;
    let supervisor_rx = cfg.proxy.as_ref().map(|proxy| {
        let sup_cfg = proxy.supervisor_config();
        grace = sup_cfg.grace_period;
        let supervisor = Supervisor::new(proxy.command(), sup_cfg);
        let rx = supervisor.subscribe();
        tasks.spawn(supervisor.run(cancel.clone()));
        rx
    });

    let scheduler = Scheduler::new(Arc::new(Pipeline::from_config(&cfg)), cfg.schedule_config());
    let scheduler_handle = scheduler.handle();
    tasks.spawn(scheduler.run(cancel.clone()));

    let status_task = cfg.status.listen.clone().map(|listen| {
        let state = AppState {
            supervisor: supervisor_rx,
            scheduler: Some(scheduler_handle.subscribe()),
        };
        let router = status::create_router(state, metrics.as_ref());
        let c = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = status::serve(&listen, router, c).await {
                tracing::error!(target: "status", error = %e, "status server failed");
            }
        })
    });

    let mut failure = None;
    loop {
        tokio::select! {
            sig = signals.recv() => match sig {
                ControlSignal::Refresh => {
                    let outcome = scheduler_handle.trigger();
                    tracing::info!(?outcome, "SIGHUP: guide refresh requested");
                }
                ControlSignal::Shutdown => {
                    tracing::info!("termination signal received; shutting down");
                    break;
                }
            },
            Some(joined) = tasks.join_next() => {
                // supervisor and scheduler only return after cancellation
                tracing::error!(error = ?joined.err(), "background task ended unexpectedly");
                failure = Some(anyhow::anyhow!("background task ended unexpectedly"));
                break;
            }
        }
    }

    cancel.cancel();
    let drain = async {
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "task failed during shutdown");
            }
        }
    };
    if tokio::time::timeout(grace + SHUTDOWN_MARGIN, drain).await.is_err() {
        tracing::warn!("tasks did not stop in time; aborting");
        tasks.abort_all();
    }
    if let Some(task) = status_task {
        let _ = task.await;
    }
    tracing::info!("orchestrator stopped");

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
