//! One-shot guide refresh: fetch → merge → publish, then exit.
//! Exit code 0 when a guide was published, 1 otherwise (cron-friendly).

use std::process::ExitCode;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use epg_orchestrator::config::OrchestratorConfig;
use epg_orchestrator::pipeline::{Pipeline, RefreshCycle};
use epg_orchestrator::signals::{ControlSignal, SignalListener};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let _ = dotenvy::dotenv();
    epg_orchestrator::init_tracing();

    let cfg = OrchestratorConfig::load_default().context("loading orchestrator config")?;
    let pipeline = Pipeline::from_config(&cfg);
    let cancel = CancellationToken::new();

    let mut signals = SignalListener::install().context("installing signal handlers")?;
    let c = cancel.clone();
    tokio::spawn(async move {
        while signals.recv().await != ControlSignal::Shutdown {}
        c.cancel();
    });

    let report = pipeline.run_cycle(&cancel).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(if report.published() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
