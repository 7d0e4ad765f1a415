use super::agent::Agent;
use super::background::BackgroundSupervisor;
use super::call::CallId;
use super::emitter::{Emitter, EngineOutput, EngineState};
use super::events::{Event, OutputEvent};
use super::handoff::HandoffCoordinator;
use super::history::{History, HistorySnapshot};
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// One unit of work: the triggering event plus the history as it stood when
/// the unit started.
#[derive(Debug, Clone)]
pub struct Turn {
    pub call_id: CallId,
    pub event: Event,
    pub history: HistorySnapshot,
}

/// Engine state shared between the engine loop and running units.
/// `Ended` is terminal.
#[derive(Clone)]
pub(crate) struct StateCell(Arc<watch::Sender<EngineState>>);

impl StateCell {
    pub(crate) fn new() -> (Self, watch::Receiver<EngineState>) {
        let (tx, rx) = watch::channel(EngineState::Idle);
        (Self(Arc::new(tx)), rx)
    }

    pub(crate) fn set(&self, next: EngineState) {
        self.0.send_if_modified(|current| {
            if *current == EngineState::Ended || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    pub(crate) fn get(&self) -> EngineState {
        *self.0.borrow()
    }
}

/// Capabilities handed to an agent for the duration of one unit.
#[derive(Clone)]
pub struct TurnContext {
    call_id: CallId,
    history: History,
    emitter: Emitter,
    cancel: CancellationToken,
    state: StateCell,
    background: BackgroundSupervisor,
    handoff: HandoffCoordinator,
}

impl TurnContext {
    pub(crate) const fn new(
        call_id: CallId,
        history: History,
        emitter: Emitter,
        cancel: CancellationToken,
        state: StateCell,
        background: BackgroundSupervisor,
        handoff: HandoffCoordinator,
    ) -> Self {
        Self { call_id, history, emitter, cancel, state, background, handoff }
    }

    /// A context that is not attached to a running engine. Emitted output
    /// arrives on the returned receiver; background yields are recorded but
    /// trigger nothing.
    #[must_use]
    pub fn detached(agent: Arc<dyn Agent>) -> (Self, mpsc::UnboundedReceiver<EngineOutput>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (triggers, _) = mpsc::unbounded_channel();
        let history = History::new();
        let cancel = CancellationToken::new();
        let emitter = Emitter::new(history.clone(), outbound, cancel.clone());
        let (state, _) = StateCell::new();
        let background = BackgroundSupervisor::new(&emitter, triggers);
        let cx = Self::new(
            CallId::new(),
            history,
            emitter,
            cancel,
            state,
            background,
            HandoffCoordinator::new(agent),
        );
        (cx, rx)
    }

    #[must_use]
    pub const fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Live history. Reads are snapshots; appends go through [`Self::emit`].
    #[must_use]
    pub const fn history(&self) -> &History {
        &self.history
    }

    #[must_use]
    pub const fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    /// # Errors
    /// Returns [`Error::Cancelled`] if this unit was interrupted.
    pub async fn emit(&self, event: OutputEvent) -> Result<()> {
        if matches!(event, OutputEvent::AgentSendText { .. }) {
            self.state.set(EngineState::Emitting);
        }
        self.emitter.emit(event).await
    }

    /// # Errors
    /// Returns [`Error::Cancelled`] if this unit was interrupted.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.emit(OutputEvent::text(text)).await
    }

    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive `fut` unless this unit is cancelled first.
    ///
    /// # Errors
    /// Returns [`Error::Cancelled`] if cancellation wins.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            out = fut => Ok(out),
        }
    }

    pub fn set_state(&self, state: EngineState) {
        self.state.set(state);
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    #[must_use]
    pub const fn background(&self) -> &BackgroundSupervisor {
        &self.background
    }

    #[must_use]
    pub const fn handoff(&self) -> &HandoffCoordinator {
        &self.handoff
    }

    /// Same capabilities, under a different cancellation scope.
    pub(crate) fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            emitter: self.emitter.with_cancel(cancel.clone()),
            cancel,
            ..self.clone()
        }
    }
}
