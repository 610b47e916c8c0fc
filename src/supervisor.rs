// src/supervisor.rs
//! # Proxy supervisor
//! Keeps the streaming proxy alive.
//!
//! `Stopped → Starting → Running → (Stopping | Crashed)`, and `Crashed →
//! Starting` after a backoff. A run counts as a crash when the child exits,
//! cannot be spawned, or fails `probe_failure_threshold` health probes in a
//! row. Shutdown sends SIGTERM, waits `grace_period`, then kills.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub current_dir: Option<PathBuf>,
}

impl ProxyCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            current_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// Optional HTTP endpoint; any 2xx counts as healthy.
    pub health_url: Option<String>,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub probe_failure_threshold: u32,
    pub backoff: Backoff,
    /// A run at least this long resets the backoff.
    pub stable_after: Duration,
    /// Consecutive fast crashes before the failure is flagged persistent.
    pub persistent_failure_after: u32,
    pub grace_period: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_url: None,
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            probe_failure_threshold: 3,
            backoff: Backoff::default(),
            stable_after: Duration::from_secs(60),
            persistent_failure_after: 10,
            grace_period: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashCause {
    Exited,
    SpawnFailed,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub cause: CrashCause,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
    pub ran_for_ms: u64,
}

impl ExitInfo {
    fn new(cause: CrashCause, ran_for: Duration) -> Self {
        Self {
            cause,
            code: None,
            signal: None,
            detail: None,
            at: Utc::now(),
            ran_for_ms: ran_for.as_millis() as u64,
        }
    }

    fn from_status(cause: CrashCause, status: ExitStatus, ran_for: Duration) -> Self {
        let mut info = Self::new(cause, ran_for);
        info.code = status.code();
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            info.signal = status.signal();
        }
        info
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// The currently (or most recently) running proxy. Recreated on every start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyProcessHandle {
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub restart_count: u32,
    pub last_exit: Option<ExitInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub restart_count: u32,
    pub process: Option<ProxyProcessHandle>,
    pub last_exit: Option<ExitInfo>,
    pub persistent_failure: bool,
    pub next_restart: Option<DateTime<Utc>>,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: SupervisorState::Stopped,
            restart_count: 0,
            process: None,
            last_exit: None,
            persistent_failure: false,
            next_restart: None,
        }
    }
}

/// Restart delay bookkeeping.
///
/// Fast crashes (runs shorter than `stable_after`) walk up the backoff curve;
/// a stable run resets it. Once `persistent_after` fast crashes pile up the
/// delay stays at `backoff.max`.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    backoff: Backoff,
    stable_after: Duration,
    persistent_after: u32,
    attempt: u32,
    fast_crashes: u32,
}

impl RestartPolicy {
    pub fn new(backoff: Backoff, stable_after: Duration, persistent_after: u32) -> Self {
        Self {
            backoff,
            stable_after,
            persistent_after,
            attempt: 0,
            fast_crashes: 0,
        }
    }

    /// Record a crash of a run that lasted `ran_for`; returns the delay
    /// before the next start.
    pub fn on_exit(&mut self, ran_for: Duration) -> Duration {
        if ran_for >= self.stable_after {
            self.attempt = 0;
            self.fast_crashes = 0;
        } else {
            self.fast_crashes = self.fast_crashes.saturating_add(1);
        }
        let delay = if self.is_persistent() {
            self.backoff.max
        } else {
            self.backoff.delay(self.attempt)
        };
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent_after > 0 && self.fast_crashes >= self.persistent_after
    }
}

enum RunEnd {
    Crashed(ExitInfo),
    Shutdown,
}

pub struct Supervisor {
    command: ProxyCommand,
    config: SupervisorConfig,
    client: reqwest::Client,
    status_tx: watch::Sender<SupervisorStatus>,
    status_rx: watch::Receiver<SupervisorStatus>,
}

impl Supervisor {
    pub fn new(command: ProxyCommand, config: SupervisorConfig) -> Self {
        let (status_tx, status_rx) = watch::channel(SupervisorStatus::default());
        Self {
            command,
            config,
            client: reqwest::Client::new(),
            status_tx,
            status_rx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status_rx.clone()
    }

    /// Supervise until `cancel` fires, then stop the proxy gracefully.
    pub async fn run(self, cancel: CancellationToken) {
        let mut policy = RestartPolicy::new(
            self.config.backoff,
            self.config.stable_after,
            self.config.persistent_failure_after,
        );
        let mut restart_count: u32 = 0;
        let mut flagged = false;

        while !cancel.is_cancelled() {
            self.status_tx.send_modify(|s| {
                s.state = SupervisorState::Starting;
                s.next_restart = None;
            });
            let started = Instant::now();

            let end = match self.spawn() {
                Ok(child) => {
                    let pid = child.id();
                    tracing::info!(target: "supervisor", pid, restart_count, program = %self.command.program, "proxy started");
                    gauge!("epg_proxy_up").set(1.0);
                    self.status_tx.send_modify(|s| {
                        s.state = SupervisorState::Running;
                        s.process = Some(ProxyProcessHandle {
                            pid,
                            started_at: Utc::now(),
                            restart_count,
                            last_exit: s.last_exit.clone(),
                        });
                    });
                    let end = self.watch(child, started, &cancel).await;
                    gauge!("epg_proxy_up").set(0.0);
                    end
                }
                Err(e) => RunEnd::Crashed(
                    ExitInfo::new(CrashCause::SpawnFailed, started.elapsed())
                        .with_detail(e.to_string()),
                ),
            };

            let exit = match end {
                RunEnd::Shutdown => break,
                RunEnd::Crashed(exit) => exit,
            };

            let delay = policy.on_exit(started.elapsed());
            restart_count = restart_count.saturating_add(1);
            let persistent = policy.is_persistent();
            counter!("epg_proxy_restarts_total").increment(1);
            gauge!("epg_proxy_persistent_failure").set(if persistent { 1.0 } else { 0.0 });

            tracing::warn!(
                target: "supervisor",
                cause = ?exit.cause,
                code = ?exit.code,
                signal = ?exit.signal,
                ran_for_ms = exit.ran_for_ms,
                retry_in_ms = delay.as_millis() as u64,
                "proxy crashed"
            );
            if persistent && !flagged {
                tracing::error!(
                    target: "supervisor",
                    restart_count,
                    "proxy keeps crashing right after start; retrying at max backoff"
                );
            }
            flagged = persistent;

            self.status_tx.send_modify(|s| {
                s.state = SupervisorState::Crashed;
                s.restart_count = restart_count;
                s.last_exit = Some(exit);
                s.persistent_failure = persistent;
                s.next_restart = chrono::Duration::from_std(delay)
                    .ok()
                    .map(|d| Utc::now() + d);
            });

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.status_tx.send_modify(|s| {
            s.state = SupervisorState::Stopped;
            s.next_restart = None;
            if let Some(p) = s.process.as_mut() {
                p.pid = None;
            }
        });
        tracing::info!(target: "supervisor", "supervisor stopped");
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .envs(&self.command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.command.current_dir {
            cmd.current_dir(dir);
        }
        cmd.spawn()
    }

    async fn watch(&self, mut child: Child, started: Instant, cancel: &CancellationToken) -> RunEnd {
        let mut probe = self.config.health_url.as_ref().map(|_| {
            let period = self.config.probe_interval.max(MIN_PROBE_INTERVAL);
            let mut iv = tokio::time::interval_at(Instant::now() + period, period);
            iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
            iv
        });
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.shutdown(&mut child).await,
                status = child.wait() => return RunEnd::Crashed(exited(status, started)),
                _ = next_tick(&mut probe) => {}
            }

            // A probe may hang up to `probe_timeout`; shutdown and exits still win.
            let healthy = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.shutdown(&mut child).await,
                status = child.wait() => return RunEnd::Crashed(exited(status, started)),
                ok = self.probe() => ok,
            };
            if healthy {
                failures = 0;
                continue;
            }
            failures += 1;
            counter!("epg_proxy_probe_failures_total").increment(1);
            tracing::warn!(target: "supervisor", failures, threshold = self.config.probe_failure_threshold, "health probe failed");
            if failures >= self.config.probe_failure_threshold {
                let status = self.stop_child(&mut child).await;
                let mut exit = match status {
                    Some(st) => ExitInfo::from_status(CrashCause::Unhealthy, st, started.elapsed()),
                    None => ExitInfo::new(CrashCause::Unhealthy, started.elapsed()),
                };
                exit.detail = Some(format!("{failures} consecutive failed health probes"));
                return RunEnd::Crashed(exit);
            }
        }
    }

    async fn shutdown(&self, child: &mut Child) -> RunEnd {
        self.status_tx.send_modify(|s| s.state = SupervisorState::Stopping);
        self.stop_child(child).await;
        RunEnd::Shutdown
    }

    async fn probe(&self) -> bool {
        let Some(url) = self.config.health_url.as_deref() else {
            return true;
        };
        match self
            .client
            .get(url)
            .timeout(self.config.probe_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(target: "supervisor", error = %e, "health probe error");
                false
            }
        }
    }

    /// SIGTERM, wait up to the grace period, then SIGKILL.
    async fn stop_child(&self, child: &mut Child) -> Option<ExitStatus> {
        if let Ok(Some(status)) = child.try_wait() {
            return Some(status);
        }
        terminate(child);
        match tokio::time::timeout(self.config.grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(target: "supervisor", ?status, "proxy stopped");
                Some(status)
            }
            Ok(Err(e)) => {
                tracing::warn!(target: "supervisor", error = %e, "waiting for proxy failed");
                None
            }
            Err(_) => {
                tracing::warn!(
                    target: "supervisor",
                    grace_ms = self.config.grace_period.as_millis() as u64,
                    "proxy ignored SIGTERM; killing"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(target: "supervisor", error = %e, "killing proxy failed");
                }
                child.wait().await.ok()
            }
        }
    }
}

const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(10);

async fn next_tick(probe: &mut Option<tokio::time::Interval>) {
    match probe {
        Some(iv) => {
            iv.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn exited(status: std::io::Result<ExitStatus>, started: Instant) -> ExitInfo {
    match status {
        Ok(st) => ExitInfo::from_status(CrashCause::Exited, st, started.elapsed()),
        Err(e) => ExitInfo::new(CrashCause::Exited, started.elapsed()).with_detail(e.to_string()),
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(target: "supervisor", pid, error = %e, "sending SIGTERM failed");
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RestartPolicy {
        RestartPolicy::new(
            Backoff::new(Duration::from_millis(100), Duration::from_secs(2)),
            Duration::from_secs(10),
            4,
        )
    }

    #[test]
    fn fast_crashes_never_shorten_the_delay() {
        let mut p = policy();
        let delays: Vec<_> = (0..8).map(|_| p.on_exit(Duration::from_millis(5))).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{delays:?}");
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn stable_run_resets_backoff() {
        let mut p = policy();
        p.on_exit(Duration::from_millis(5));
        p.on_exit(Duration::from_millis(5));
        assert_eq!(p.on_exit(Duration::from_millis(5)), Duration::from_millis(400));
        assert_eq!(p.on_exit(Duration::from_secs(30)), Duration::from_millis(100));
        assert!(!p.is_persistent());
    }

    #[test]
    fn persistent_after_threshold_uses_max_delay() {
        let mut p = policy();
        for _ in 0..3 {
            p.on_exit(Duration::ZERO);
        }
        assert!(!p.is_persistent());
        assert_eq!(p.on_exit(Duration::ZERO), Duration::from_secs(2));
        assert!(p.is_persistent());
        p.on_exit(Duration::from_secs(60));
        assert!(!p.is_persistent());
    }
}
