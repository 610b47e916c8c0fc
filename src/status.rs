// src/status.rs
//! Read-only HTTP status surface: `/health`, `/status` and (when a recorder is
//! installed) `/metrics`. Nothing here can change orchestrator state.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::metrics::Metrics;
use crate::scheduler::ScheduleState;
use crate::supervisor::SupervisorStatus;

#[derive(Clone, Default)]
pub struct AppState {
    pub supervisor: Option<watch::Receiver<SupervisorStatus>>,
    pub scheduler: Option<watch::Receiver<ScheduleState>>,
}

#[derive(Serialize)]
struct StatusResp {
    version: &'static str,
    supervisor: Option<SupervisorStatus>,
    scheduler: Option<ScheduleState>,
}

pub fn create_router(state: AppState, metrics: Option<&Metrics>) -> Router {
    let router = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/status", get(status))
        .with_state(state);
    let router = match metrics {
        Some(m) => router.merge(m.router()),
        None => router,
    };
    router.layer(TraceLayer::new_for_http())
}

async fn status(State(state): State<AppState>) -> Json<StatusResp> {
    Json(StatusResp {
        version: env!("CARGO_PKG_VERSION"),
        supervisor: state.supervisor.as_ref().map(|rx| rx.borrow().clone()),
        scheduler: state.scheduler.as_ref().map(|rx| rx.borrow().clone()),
    })
}

/// Bind `listen` and serve until `cancel` fires.
pub async fn serve(listen: &str, router: Router, cancel: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| anyhow::anyhow!("binding status server on {listen}: {e}"))?;
    tracing::info!(target: "status", addr = %listener.local_addr()?, "status server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
