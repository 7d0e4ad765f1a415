//! Tracking and cancelling the single in-flight unit of work.

use super::emitter::EngineOutput;
use super::events::{Event, EventKind};
use super::history::History;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How a unit of work finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

struct ActiveUnit {
    token: CancellationToken,
    handle: JoinHandle<UnitOutcome>,
    trigger: EventKind,
    started: Instant,
}

/// Holds at most one active unit. A new unit can only begin once the
/// previous one has been joined or interrupted.
pub struct InterruptController {
    active: Option<ActiveUnit>,
    grace: Duration,
    interruptions: u64,
}

impl InterruptController {
    /// `grace` bounds how long an interrupted unit may take to unwind before
    /// its task is aborted.
    #[must_use]
    pub const fn new(grace: Duration) -> Self {
        Self { active: None, grace, interruptions: 0 }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active.is_some()
    }

    #[must_use]
    pub const fn interruptions(&self) -> u64 {
        self.interruptions
    }

    pub(crate) fn begin(&mut self, token: CancellationToken, handle: JoinHandle<UnitOutcome>, trigger: EventKind) {
        debug_assert!(self.active.is_none(), "a unit is already active");
        self.active = Some(ActiveUnit { token, handle, trigger, started: Instant::now() });
    }

    /// Resolves when the active unit finishes on its own. Pending forever
    /// when idle. Cancel safe: dropping this leaves the unit in place.
    pub(crate) async fn join(&mut self) -> UnitOutcome {
        let Some(unit) = self.active.as_mut() else {
            return std::future::pending().await;
        };
        let joined = (&mut unit.handle).await;
        let unit = self.active.take();
        let outcome = flatten(joined);
        if let Some(unit) = unit {
            tracing::debug!(
                trigger = %unit.trigger,
                elapsed_ms = unit.started.elapsed().as_millis(),
                outcome = ?outcome,
                "unit finished"
            );
        }
        outcome
    }

    /// Join the active unit if its task has already finished. Units that
    /// are still running are left alone.
    pub(crate) async fn reap(&mut self) -> Option<UnitOutcome> {
        if !self.active.as_ref().is_some_and(|unit| unit.handle.is_finished()) {
            return None;
        }
        Some(self.join().await)
    }

    /// Interrupt the active unit because of `event`.
    ///
    /// Under the history lock the unit's token is cancelled and `event` is
    /// appended, so nothing the unit emits can land after the interrupting
    /// event. `clear` is then sent (when given) and the unit is awaited.
    /// With no active unit, `event` is simply appended. A unit that already
    /// finished is joined without `clear`, since nothing was cut off.
    pub(crate) async fn interrupt(
        &mut self,
        history: &History,
        event: Event,
        clear: Option<&mpsc::UnboundedSender<EngineOutput>>,
    ) -> Option<UnitOutcome> {
        let Some(unit) = self.active.take() else {
            history.append(event).await;
            return None;
        };
        let trigger = event.kind();
        {
            let mut guard = history.lock().await;
            if unit.handle.is_finished() {
                guard.push(event);
                drop(guard);
                return Some(flatten(unit.handle.await));
            }
            unit.token.cancel();
            guard.push(event);
        }
        if let Some(outbound) = clear {
            let _ = outbound.send(EngineOutput::Clear);
        }
        self.interruptions += 1;

        let mut handle = unit.handle;
        let outcome = match tokio::time::timeout(self.grace, &mut handle).await {
            Ok(joined) => flatten(joined),
            Err(_) => {
                tracing::warn!(grace_ms = self.grace.as_millis(), "unit ignored cancellation, aborting");
                handle.abort();
                UnitOutcome::Cancelled
            }
        };
        tracing::debug!(
            interrupted = %unit.trigger,
            by = %trigger,
            elapsed_ms = unit.started.elapsed().as_millis(),
            "unit interrupted"
        );
        Some(outcome)
    }
}

fn flatten(joined: Result<UnitOutcome, tokio::task::JoinError>) -> UnitOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(err) if err.is_cancelled() => UnitOutcome::Cancelled,
        Err(err) => UnitOutcome::Failed(format!("unit panicked: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn interrupt_cancels_before_appending() {
        let history = History::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut controller = InterruptController::new(Duration::from_secs(1));

        let token = CancellationToken::new();
        let watched = token.clone();
        let handle = tokio::spawn(async move {
            watched.cancelled().await;
            UnitOutcome::Cancelled
        });
        controller.begin(token, handle, EventKind::UserTurnEnded);
        assert!(controller.is_active());

        let outcome = controller.interrupt(&history, Event::UserTurnStarted, Some(&tx)).await;
        assert_eq!(outcome, Some(UnitOutcome::Cancelled));
        assert!(!controller.is_active());
        assert_eq!(rx.recv().await, Some(EngineOutput::Clear));
        assert_eq!(history.snapshot().await.events(), &[Event::UserTurnStarted]);
        assert_eq!(controller.interruptions(), 1);
    }

    #[tokio::test]
    async fn finished_unit_is_joined_without_clear() {
        let history = History::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut controller = InterruptController::new(Duration::from_secs(1));
        let handle = tokio::spawn(async { UnitOutcome::Completed });
        controller.begin(CancellationToken::new(), handle, EventKind::UserTurnEnded);
        while !controller.active.as_ref().unwrap().handle.is_finished() {
            tokio::task::yield_now().await;
        }

        let outcome = controller.interrupt(&history, Event::UserTurnStarted, Some(&tx)).await;
        assert_eq!(outcome, Some(UnitOutcome::Completed));
        assert!(rx.try_recv().is_err());
        assert_eq!(history.snapshot().await.events(), &[Event::UserTurnStarted]);
        assert_eq!(controller.interruptions(), 0);
    }

    #[tokio::test]
    async fn reap_leaves_running_units_alone() {
        let mut controller = InterruptController::new(Duration::from_secs(1));
        let token = CancellationToken::new();
        let watched = token.clone();
        let handle = tokio::spawn(async move {
            watched.cancelled().await;
            UnitOutcome::Cancelled
        });
        controller.begin(token.clone(), handle, EventKind::UserTurnEnded);
        assert_eq!(controller.reap().await, None);
        assert!(controller.is_active());

        token.cancel();
        while !controller.active.as_ref().unwrap().handle.is_finished() {
            tokio::task::yield_now().await;
        }
        assert_eq!(controller.reap().await, Some(UnitOutcome::Cancelled));
        assert!(!controller.is_active());
    }

    #[tokio::test]
    async fn idle_interrupt_only_appends() {
        let history = History::new();
        let mut controller = InterruptController::new(Duration::from_secs(1));
        assert_eq!(controller.interrupt(&history, Event::UserTurnStarted, None).await, None);
        assert_eq!(history.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_units_are_aborted_after_grace() {
        let history = History::new();
        let mut controller = InterruptController::new(Duration::from_millis(100));
        let handle = tokio::spawn(async {
            std::future::pending::<()>().await;
            UnitOutcome::Completed
        });
        controller.begin(CancellationToken::new(), handle, EventKind::UserTurnEnded);

        let outcome = controller.interrupt(&history, Event::UserTurnStarted, None).await;
        assert_eq!(outcome, Some(UnitOutcome::Cancelled));
    }
}
