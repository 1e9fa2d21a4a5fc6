//! Timeout supervision for an open stream.
//!
//! One task tracks up to three deadlines (TTFT, idle, total). The reader
//! reports frame activity through a `watch` channel; the first deadline to
//! pass records a timeout and closes the session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tracing::{Instrument as _, Span, debug, warn};

use crate::config::TimeoutBudgets;
use crate::errors::{StreamError, TimeoutKind};
use crate::lifecycle::{CloseReason, Lifecycle};

#[derive(Clone, Copy, Debug, Default)]
struct Activity {
    frames: u64,
    content_seen: bool,
}

/// Handle the reader uses to report activity. Dropping it stops the task.
pub(crate) struct TimeoutSupervisor {
    activity: watch::Sender<Activity>,
}

impl TimeoutSupervisor {
    /// Spawns the supervisor task, or returns `None` when every budget is
    /// disabled. TTFT and total deadlines count from `started`.
    pub fn spawn(
        budgets: TimeoutBudgets,
        lifecycle: Arc<Lifecycle>,
        started: Instant,
        span: Span,
    ) -> Option<Self> {
        if !budgets.is_active() {
            return None;
        }
        let (tx, rx) = watch::channel(Activity::default());
        tokio::spawn(supervise(budgets, lifecycle, started, rx).instrument(span));
        Some(Self { activity: tx })
    }

    /// Records a non-empty frame; resets the idle timer.
    pub fn frame_received(&self) {
        self.activity.send_modify(|a| a.frames = a.frames.wrapping_add(1));
    }

    /// Records a content-bearing record; permanently disarms TTFT.
    pub fn content_received(&self) {
        self.activity.send_if_modified(|a| {
            let changed = !a.content_seen;
            a.content_seen = true;
            changed
        });
    }
}

struct Timer {
    kind: TimeoutKind,
    budget: Duration,
    deadline: Option<Instant>,
}

fn earliest(timers: &[Timer]) -> Option<(Instant, TimeoutKind, Duration)> {
    timers
        .iter()
        .filter_map(|t| t.deadline.map(|d| (d, t.kind, t.budget)))
        .min_by_key(|(deadline, _, _)| *deadline)
}

async fn supervise(
    budgets: TimeoutBudgets,
    lifecycle: Arc<Lifecycle>,
    started: Instant,
    mut activity: watch::Receiver<Activity>,
) {
    let mut timers: Vec<Timer> = [
        (TimeoutKind::Ttft, budgets.ttft_budget()),
        (TimeoutKind::Idle, budgets.idle_budget()),
        (TimeoutKind::Total, budgets.total_budget()),
    ]
    .into_iter()
    .filter_map(|(kind, budget)| {
        budget.map(|budget| Timer {
            kind,
            budget,
            deadline: Some(started + budget),
        })
    })
    .collect();
    let done = lifecycle.done().clone();
    let mut reporting = true;

    loop {
        let next = earliest(&timers);
        tokio::select! {
            biased;
            _ = done.cancelled() => return,
            changed = activity.changed(), if reporting => {
                if changed.is_err() {
                    // Reader is gone; only the session's own close can follow.
                    reporting = false;
                    continue;
                }
                let seen = *activity.borrow_and_update();
                let now = Instant::now();
                for timer in &mut timers {
                    match timer.kind {
                        TimeoutKind::Idle => timer.deadline = Some(now + timer.budget),
                        TimeoutKind::Ttft if seen.content_seen => timer.deadline = None,
                        _ => {}
                    }
                }
            }
            _ = sleep_until_or_pending(next.map(|(deadline, _, _)| deadline)) => {
                let Some((_, kind, budget)) = next else { continue };
                let error = StreamError::timeout(lifecycle.request_id(), kind, budget);
                if lifecycle.fail(CloseReason::TimedOut, error) {
                    warn!(timeout = %kind, ?budget, "stream timed out");
                } else {
                    debug!(timeout = %kind, "timeout fired after close");
                }
                return;
            }
        }
    }
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::SessionState;

    fn lifecycle() -> Arc<Lifecycle> {
        Arc::new(Lifecycle::new("req".into()))
    }

    fn spawn(budgets: TimeoutBudgets, lifecycle: &Arc<Lifecycle>) -> Option<TimeoutSupervisor> {
        TimeoutSupervisor::spawn(budgets, lifecycle.clone(), Instant::now(), Span::none())
    }

    #[tokio::test]
    async fn disabled_budgets_spawn_nothing() {
        assert!(spawn(TimeoutBudgets::none(), &lifecycle()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ttft_fires_without_content() {
        let lifecycle = lifecycle();
        let _sup = spawn(
            TimeoutBudgets::none().ttft(Duration::from_millis(100)),
            &lifecycle,
        )
        .expect("active");
        lifecycle.done().cancelled().await;
        assert_eq!(
            lifecycle.take_pending().and_then(|e| e.timeout_kind()),
            Some(TimeoutKind::Ttft)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn content_disarms_ttft() {
        let lifecycle = lifecycle();
        let sup = spawn(
            TimeoutBudgets::none()
                .ttft(Duration::from_millis(100))
                .total(Duration::from_millis(1_000)),
            &lifecycle,
        )
        .expect("active");
        tokio::time::sleep(Duration::from_millis(50)).await;
        sup.frame_received();
        sup.content_received();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(lifecycle.state(), SessionState::Open);

        let start = Instant::now();
        lifecycle.done().cancelled().await;
        assert!(start.elapsed() >= Duration::from_millis(700));
        assert_eq!(
            lifecycle.take_pending().and_then(|e| e.timeout_kind()),
            Some(TimeoutKind::Total)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn frames_keep_idle_timer_alive() {
        let lifecycle = lifecycle();
        let sup = spawn(
            TimeoutBudgets::none().idle(Duration::from_millis(100)),
            &lifecycle,
        )
        .expect("active");
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            sup.frame_received();
        }
        assert_eq!(lifecycle.state(), SessionState::Open);
        lifecycle.done().cancelled().await;
        assert_eq!(
            lifecycle.take_pending().and_then(|e| e.timeout_kind()),
            Some(TimeoutKind::Idle)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadlines_count_from_session_creation() {
        let lifecycle = lifecycle();
        let created = Instant::now();
        tokio::time::advance(Duration::from_millis(80)).await;
        let _sup = TimeoutSupervisor::spawn(
            TimeoutBudgets::none().total(Duration::from_millis(100)),
            lifecycle.clone(),
            created,
            Span::none(),
        )
        .expect("active");
        lifecycle.done().cancelled().await;
        let elapsed = created.elapsed();
        assert!(
            elapsed >= Duration::from_millis(100) && elapsed < Duration::from_millis(150),
            "{elapsed:?}"
        );
        assert_eq!(
            lifecycle.take_pending().and_then(|e| e.timeout_kind()),
            Some(TimeoutKind::Total)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_stops_when_session_closes() {
        let lifecycle = lifecycle();
        let _sup = spawn(
            TimeoutBudgets::none().total(Duration::from_millis(100)),
            &lifecycle,
        )
        .expect("active");
        lifecycle.close(CloseReason::Explicit);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(lifecycle.take_pending(), None);
        assert_eq!(lifecycle.reason(), Some(CloseReason::Explicit));
    }
}
