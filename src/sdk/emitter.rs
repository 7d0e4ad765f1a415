use super::events::{Event, OutputEvent};
use super::history::History;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What the engine hands to the transport side, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOutput {
    Event(OutputEvent),
    /// In-flight agent speech was interrupted; drop any buffered playback.
    Clear,
    Ended,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Idle,
    Reasoning,
    ExecutingTools,
    Emitting,
    Ended,
}

/// Appends output events to the call history and forwards them to the
/// transport. Both happen under the history lock, so the transport sees
/// events in exactly the order history records them.
#[derive(Clone)]
pub struct Emitter {
    history: History,
    outbound: mpsc::UnboundedSender<EngineOutput>,
    cancel: CancellationToken,
}

impl Emitter {
    pub(crate) const fn new(
        history: History,
        outbound: mpsc::UnboundedSender<EngineOutput>,
        cancel: CancellationToken,
    ) -> Self {
        Self { history, outbound, cancel }
    }

    /// Same destination, different cancellation scope.
    pub(crate) fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            history: self.history.clone(),
            outbound: self.outbound.clone(),
            cancel,
        }
    }

    /// # Errors
    /// Returns [`Error::Cancelled`] once this emitter's scope was cancelled;
    /// nothing is appended in that case.
    pub async fn emit(&self, event: OutputEvent) -> Result<()> {
        self.emit_with(event, |_| {}).await
    }

    /// Emit, then run `after` while the history lock is still held.
    pub(crate) async fn emit_with<F>(&self, event: OutputEvent, after: F) -> Result<()>
    where
        F: FnOnce(&Event),
    {
        let mut guard = self.history.lock().await;
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let recorded = Event::from(event.clone());
        guard.push(recorded.clone());
        if self.outbound.send(EngineOutput::Event(event)).is_err() {
            tracing::debug!("transport receiver dropped, event kept in history only");
        }
        after(&recorded);
        Ok(())
    }

    /// # Errors
    /// Returns [`Error::Cancelled`] once this emitter's scope was cancelled.
    pub async fn text(&self, text: impl Into<String>) -> Result<()> {
        self.emit(OutputEvent::text(text)).await
    }

    /// Record a synthesized input event (e.g. `AgentHandedOff`).
    pub(crate) async fn record(&self, event: Event) -> Result<()> {
        let mut guard = self.history.lock().await;
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        guard.push(event);
        Ok(())
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_appends_and_forwards_in_order() {
        let history = History::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let emitter = Emitter::new(history.clone(), tx, CancellationToken::new());

        emitter.text("one").await.unwrap();
        emitter.text("two").await.unwrap();

        assert_eq!(rx.recv().await, Some(EngineOutput::Event(OutputEvent::text("one"))));
        assert_eq!(rx.recv().await, Some(EngineOutput::Event(OutputEvent::text("two"))));
        let snapshot = history.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1], Event::AgentSendText { text: "two".to_string() });
    }

    #[tokio::test]
    async fn cancelled_emitter_appends_nothing() {
        let history = History::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let emitter = Emitter::new(history.clone(), tx, token.clone());

        token.cancel();
        let err = emitter.text("late").await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(history.is_empty().await);
        assert!(rx.try_recv().is_err());
    }
}
