// src/scheduler.rs
//! # Refresh scheduler
//! Runs the refresh cycle on a fixed cadence and on demand.
//!
//! `Idle → Running → (Idle | Backoff)`. Only one cycle runs at a time; manual
//! triggers that arrive while a cycle is running collapse into a single
//! follow-up run. A cycle that produced no usable data is retried sooner,
//! with a delay that doubles per consecutive failure up to the normal interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::pipeline::{CycleOutcome, CycleReport, CycleResult, RefreshCycle};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleConfig {
    pub interval: Duration,
    /// Retry delay after cycles without usable data; `max` should be the interval.
    pub backoff: Backoff,
    pub run_on_start: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePhase {
    Idle,
    Running,
    Backoff,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleState {
    pub phase: SchedulePhase,
    pub next_fire: Option<DateTime<Utc>>,
    pub last_result: Option<CycleResult>,
    pub last_summary: Option<String>,
    pub last_report: Option<CycleReport>,
    pub cycles: u64,
    pub consecutive_failures: u32,
}

impl Default for ScheduleState {
    fn default() -> Self {
        Self {
            phase: SchedulePhase::Idle,
            next_fire: None,
            last_result: None,
            last_summary: None,
            last_report: None,
            cycles: 0,
            consecutive_failures: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A run will start (now, or right after the current one).
    Queued,
    /// A run was already pending; this trigger adds nothing.
    Coalesced,
}

struct Shared {
    pending: AtomicBool,
    notify: Notify,
}

/// Cheap, cloneable view of a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
    state: watch::Receiver<ScheduleState>,
}

impl SchedulerHandle {
    pub fn trigger(&self) -> TriggerOutcome {
        if self.shared.pending.swap(true, Ordering::SeqCst) {
            counter!("epg_refresh_triggers_total", "outcome" => "coalesced").increment(1);
            tracing::debug!(target: "scheduler", "refresh already pending; coalesced");
            TriggerOutcome::Coalesced
        } else {
            self.shared.notify.notify_one();
            counter!("epg_refresh_triggers_total", "outcome" => "queued").increment(1);
            tracing::info!(target: "scheduler", "refresh requested");
            TriggerOutcome::Queued
        }
    }

    pub fn state(&self) -> ScheduleState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ScheduleState> {
        self.state.clone()
    }
}

pub struct Scheduler<C: RefreshCycle> {
    cycle: Arc<C>,
    config: ScheduleConfig,
    shared: Arc<Shared>,
    state_tx: watch::Sender<ScheduleState>,
    state_rx: watch::Receiver<ScheduleState>,
}

impl<C: RefreshCycle> Scheduler<C> {
    pub fn new(cycle: Arc<C>, config: ScheduleConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ScheduleState::default());
        Self {
            cycle,
            config,
            shared: Arc::new(Shared {
                pending: AtomicBool::new(false),
                notify: Notify::new(),
            }),
            state_tx,
            state_rx,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
            state: self.state_rx.clone(),
        }
    }

    /// Drive the schedule until `cancel` fires. An in-flight cycle sees the
    /// same token and stops without publishing.
    pub async fn run(self, cancel: CancellationToken) {
        let mut next = if self.config.run_on_start {
            Instant::now()
        } else {
            Instant::now() + self.config.interval
        };
        let mut no_data_streak: u32 = 0;
        self.set_waiting(SchedulePhase::Idle, next);

        loop {
            let due = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.shared.notify.notified() => false,
                _ = tokio::time::sleep_until(next) => true,
            };
            // `pending` is the source of truth; a leftover permit from a
            // trigger the previous cycle already served is ignored.
            if !self.shared.pending.swap(false, Ordering::SeqCst) && !due {
                continue;
            }

            self.state_tx.send_modify(|s| {
                s.phase = SchedulePhase::Running;
                s.next_fire = None;
            });
            gauge!("epg_scheduler_running").set(1.0);
            tracing::info!(target: "scheduler", "refresh cycle starting");

            let report = self.cycle.run_cycle(&cancel).await;
            gauge!("epg_scheduler_running").set(0.0);

            let (phase, delay) = match report.outcome {
                CycleOutcome::Cancelled => {
                    self.record(report, SchedulePhase::Idle, None);
                    break;
                }
                CycleOutcome::NoUsableData => {
                    let delay = self.config.backoff.delay(no_data_streak);
                    no_data_streak = no_data_streak.saturating_add(1);
                    tracing::warn!(
                        target: "scheduler",
                        retry_in_ms = delay.as_millis() as u64,
                        streak = no_data_streak,
                        "no usable data; backing off"
                    );
                    (SchedulePhase::Backoff, delay)
                }
                CycleOutcome::Published { .. } | CycleOutcome::PublishFailed { .. } => {
                    no_data_streak = 0;
                    (SchedulePhase::Idle, self.config.interval)
                }
            };
            next = Instant::now() + delay;
            self.record(report, phase, Some(delay));

            if cancel.is_cancelled() {
                break;
            }
        }

        self.state_tx.send_modify(|s| {
            s.phase = SchedulePhase::Idle;
            s.next_fire = None;
        });
        tracing::info!(target: "scheduler", "scheduler stopped");
    }

    fn set_waiting(&self, phase: SchedulePhase, next: Instant) {
        let wait = next.saturating_duration_since(Instant::now());
        self.state_tx.send_modify(|s| {
            s.phase = phase;
            s.next_fire = fire_at(wait);
        });
    }

    fn record(&self, report: CycleReport, phase: SchedulePhase, wait: Option<Duration>) {
        let result = report.result();
        self.state_tx.send_modify(|s| {
            s.cycles += 1;
            s.consecutive_failures = match result {
                CycleResult::Failure => s.consecutive_failures.saturating_add(1),
                _ => 0,
            };
            s.phase = phase;
            s.next_fire = wait.and_then(fire_at);
            s.last_result = Some(result);
            s.last_summary = Some(report.summary());
            s.last_report = Some(report);
        });
    }
}

fn fire_at(wait: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(wait).ok().map(|d| Utc::now() + d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl RefreshCycle for Noop {
        async fn run_cycle(&self, _cancel: &CancellationToken) -> CycleReport {
            CycleReport {
                outcome: CycleOutcome::NoUsableData,
                sources: Vec::new(),
                started_at: Utc::now(),
                finished_at: Utc::now(),
            }
        }
    }

    fn config() -> ScheduleConfig {
        ScheduleConfig {
            interval: Duration::from_secs(3600),
            backoff: Backoff::new(Duration::from_secs(60), Duration::from_secs(3600)),
            run_on_start: false,
        }
    }

    #[test]
    fn second_trigger_before_pickup_coalesces() {
        let s = Scheduler::new(Arc::new(Noop), config());
        let h = s.handle();
        assert_eq!(h.trigger(), TriggerOutcome::Queued);
        assert_eq!(h.trigger(), TriggerOutcome::Coalesced);
        assert_eq!(h.state().phase, SchedulePhase::Idle);
    }

    #[tokio::test]
    async fn leftover_permit_without_pending_trigger_runs_nothing() {
        let s = Scheduler::new(Arc::new(Noop), config());
        let h = s.handle();
        s.shared.notify.notify_one();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(s.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.state().cycles, 0);
        assert_eq!(h.state().phase, SchedulePhase::Idle);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(h.state().cycles, 0);
    }

    #[tokio::test]
    async fn cancelled_scheduler_returns_without_running() {
        let s = Scheduler::new(Arc::new(Noop), config());
        let h = s.handle();
        let cancel = CancellationToken::new();
        cancel.cancel();
        s.run(cancel).await;
        assert_eq!(h.state().cycles, 0);
        assert_eq!(h.state().next_fire, None);
    }
}
