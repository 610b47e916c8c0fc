// tests/supervisor_lifecycle.rs
//
// Supervisor against real `sh` children.
//
// Covered:
// - crash loop: restarts counted, exit code recorded, persistent failure flagged
// - graceful stop: SIGTERM honoured within the grace period
// - forced stop: SIGTERM ignored → killed after the grace period
// - shutdown does not wait for a hanging health check
// - failed health probes mark the proxy unhealthy and restart it
// - a missing binary is a spawn failure, retried like a crash
#![cfg(unix)]

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use epg_orchestrator::backoff::Backoff;
use epg_orchestrator::supervisor::{
    CrashCause, ProxyCommand, Supervisor, SupervisorConfig, SupervisorState, SupervisorStatus,
};

fn config() -> SupervisorConfig {
    SupervisorConfig {
        backoff: Backoff::new(Duration::from_millis(20), Duration::from_millis(200)),
        stable_after: Duration::from_secs(30),
        persistent_failure_after: 3,
        grace_period: Duration::from_millis(500),
        ..SupervisorConfig::default()
    }
}

fn sh(script: &str) -> ProxyCommand {
    ProxyCommand::new("sh", ["-c", script])
}

async fn wait_for(
    rx: &mut watch::Receiver<SupervisorStatus>,
    what: &str,
    pred: impl Fn(&SupervisorStatus) -> bool,
) {
    let res = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| pred(s))).await;
    assert!(matches!(res, Ok(Ok(_))), "timed out waiting for {what}");
}

#[tokio::test]
async fn crash_loop_restarts_and_flags_persistent_failure() {
    let sup = Supervisor::new(sh("exit 3"), config());
    let mut rx = sup.subscribe();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(sup.run(cancel.clone()));

    wait_for(&mut rx, "four restarts", |s| s.restart_count >= 4).await;
    let status = rx.borrow().clone();
    assert!(status.persistent_failure);
    let exit = status.last_exit.expect("exit recorded");
    assert_eq!(exit.cause, CrashCause::Exited);
    assert_eq!(exit.code, Some(3));

    cancel.cancel();
    task.await.unwrap();
    assert_eq!(rx.borrow().state, SupervisorState::Stopped);
}

#[tokio::test]
async fn graceful_stop_honours_sigterm() {
    let sup = Supervisor::new(
        sh("trap 'exit 0' TERM; while :; do sleep 0.05; done"),
        SupervisorConfig {
            grace_period: Duration::from_secs(5),
            ..config()
        },
    );
    let mut rx = sup.subscribe();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(sup.run(cancel.clone()));

    wait_for(&mut rx, "running", |s| s.state == SupervisorState::Running).await;
    let pid = rx.borrow().process.as_ref().and_then(|p| p.pid);
    assert!(pid.is_some());

    let t0 = Instant::now();
    cancel.cancel();
    task.await.unwrap();
    assert!(t0.elapsed() < Duration::from_secs(4), "{:?}", t0.elapsed());

    let status = rx.borrow().clone();
    assert_eq!(status.state, SupervisorState::Stopped);
    assert_eq!(status.restart_count, 0);
}

#[tokio::test]
async fn child_ignoring_sigterm_is_killed_after_grace() {
    let dir = tempfile::tempdir().unwrap();
    let ready = dir.path().join("ready");
    let sup = Supervisor::new(
        sh(&format!(
            "trap '' TERM; touch '{}'; while :; do sleep 0.05; done",
            ready.display()
        )),
        config(),
    );
    let mut rx = sup.subscribe();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(sup.run(cancel.clone()));

    wait_for(&mut rx, "running", |s| s.state == SupervisorState::Running).await;
    // the trap must be in place before SIGTERM arrives
    let deadline = Instant::now() + Duration::from_secs(10);
    while !ready.exists() {
        assert!(Instant::now() < deadline, "child never installed its trap");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let t0 = Instant::now();
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("killed after grace period")
        .unwrap();
    assert!(t0.elapsed() >= Duration::from_millis(500), "{:?}", t0.elapsed());
    assert_eq!(rx.borrow().state, SupervisorState::Stopped);
}

#[tokio::test]
async fn shutdown_is_not_held_up_by_a_hanging_health_check() {
    // accepts connections and never answers
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = std::sync::Arc::new(tokio::sync::Notify::new());
    let accepted_tx = accepted.clone();
    let server = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((sock, _)) = listener.accept().await {
            held.push(sock);
            accepted_tx.notify_one();
        }
    });

    let sup = Supervisor::new(
        sh("exec sleep 30"),
        SupervisorConfig {
            health_url: Some(format!("http://{addr}/health")),
            probe_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_secs(30),
            ..config()
        },
    );
    let cancel = CancellationToken::new();
    let task = tokio::spawn(sup.run(cancel.clone()));

    tokio::time::timeout(Duration::from_secs(10), accepted.notified())
        .await
        .expect("health check connected");
    let t0 = Instant::now();
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("stopped while the health check was pending")
        .unwrap();
    assert!(t0.elapsed() < Duration::from_secs(5));
    server.abort();
}

#[tokio::test]
async fn failing_health_probe_restarts_proxy() {
    // nothing listens on port 9 locally
    let sup = Supervisor::new(
        sh("exec sleep 30"),
        SupervisorConfig {
            health_url: Some("http://127.0.0.1:9/health".to_string()),
            probe_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(200),
            probe_failure_threshold: 2,
            ..config()
        },
    );
    let mut rx = sup.subscribe();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(sup.run(cancel.clone()));

    wait_for(&mut rx, "unhealthy restart", |s| s.restart_count >= 1).await;
    let exit = rx.borrow().last_exit.clone().expect("exit recorded");
    assert_eq!(exit.cause, CrashCause::Unhealthy);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn missing_binary_is_retried_as_spawn_failure() {
    let sup = Supervisor::new(
        ProxyCommand::new("/nonexistent/epg-proxy", Vec::<String>::new()),
        config(),
    );
    let mut rx = sup.subscribe();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(sup.run(cancel.clone()));

    wait_for(&mut rx, "two spawn failures", |s| s.restart_count >= 2).await;
    let status = rx.borrow().clone();
    let exit = status.last_exit.expect("exit recorded");
    assert_eq!(exit.cause, CrashCause::SpawnFailed);
    assert!(exit.detail.is_some());

    cancel.cancel();
    task.await.unwrap();
}
