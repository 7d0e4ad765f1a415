//! Per-call turn engine.
//!
//! One task per call owns the event loop: it appends inputs to history,
//! starts at most one unit of work at a time for the current owner, routes
//! interrupting events through the [`InterruptController`], and finishes the
//! call on `CallEnded`.

use super::agent::Agent;
use super::background::BackgroundSupervisor;
use super::call::CallId;
use super::context::{StateCell, Turn, TurnContext};
use super::emitter::{Emitter, EngineOutput, EngineState};
use super::events::{Event, LogLevel, Metadata, OutputEvent};
use super::handoff::HandoffCoordinator;
use super::history::History;
use super::interrupt::{InterruptController, UnitOutcome};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_FALLBACK_MESSAGE: &str = "Sorry, something went wrong on my end. Could you say that again?";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Spoken when a turn fails structurally. `None` stays silent.
    #[serde(default = "default_fallback_message")]
    pub fallback_message: Option<String>,
    /// End the call instead of continuing after a failed turn.
    #[serde(default)]
    pub end_call_on_failure: bool,
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
    /// How long an interrupted unit may take to unwind before it is aborted.
    #[serde(default = "default_cancel_grace", with = "crate::serde_ext::millis")]
    pub cancel_grace: Duration,
}

#[allow(clippy::unnecessary_wraps)]
fn default_fallback_message() -> Option<String> {
    Some(DEFAULT_FALLBACK_MESSAGE.to_string())
}

const fn default_inbox_capacity() -> usize {
    256
}

const fn default_cancel_grace() -> Duration {
    Duration::from_secs(2)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fallback_message: default_fallback_message(),
            end_call_on_failure: false,
            inbox_capacity: default_inbox_capacity(),
            cancel_grace: default_cancel_grace(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn fallback_message(mut self, message: Option<String>) -> Self {
        self.fallback_message = message;
        self
    }

    #[must_use]
    pub const fn end_call_on_failure(mut self, end: bool) -> Self {
        self.end_call_on_failure = end;
        self
    }

    #[must_use]
    pub const fn cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }
}

/// Cloneable handle for feeding input events to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    call_id: CallId,
    sender: mpsc::Sender<Event>,
    state: watch::Receiver<EngineState>,
    history: History,
}

impl EngineHandle {
    #[must_use]
    pub const fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// # Errors
    /// Output events are rejected. Returns [`Error::CallEnded`] once the
    /// engine has stopped.
    pub async fn send(&self, event: Event) -> Result<()> {
        if event.is_output() {
            return Err(Error::UnexpectedEvent(event.kind()));
        }
        self.sender.send(event).await.map_err(|_| Error::CallEnded)
    }

    /// # Errors
    /// Returns [`Error::CallEnded`] if the call already ended.
    pub async fn end(&self) -> Result<()> {
        self.send(Event::CallEnded).await
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state.clone()
    }

    /// Wait until the engine reports `target`.
    ///
    /// # Errors
    /// Returns [`Error::CallEnded`] if the engine stops without reaching it.
    pub async fn wait_for(&self, target: EngineState) -> Result<()> {
        let mut state = self.state.clone();
        loop {
            if *state.borrow_and_update() == target {
                return Ok(());
            }
            if state.changed().await.is_err() {
                return if *state.borrow() == target { Ok(()) } else { Err(Error::CallEnded) };
            }
        }
    }

    #[must_use]
    pub const fn history(&self) -> &History {
        &self.history
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

pub struct TurnEngine;

impl TurnEngine {
    /// Start the engine for one call. Output is delivered on `outbound`,
    /// ending with [`EngineOutput::Ended`].
    #[must_use]
    pub fn spawn(
        call_id: CallId,
        agent: Arc<dyn Agent>,
        config: EngineConfig,
        outbound: mpsc::UnboundedSender<EngineOutput>,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (sender, inbox) = mpsc::channel(config.inbox_capacity.max(1));
        let (trigger_tx, triggers) = mpsc::unbounded_channel();
        let (state, state_rx) = StateCell::new();
        let history = History::new();
        let call_token = CancellationToken::new();
        let emitter = Emitter::new(history.clone(), outbound.clone(), call_token.clone());
        let background = BackgroundSupervisor::new(&emitter, trigger_tx);

        let engine = EngineLoop {
            call_id: call_id.clone(),
            interrupt: InterruptController::new(config.cancel_grace),
            config: Arc::new(config),
            history: history.clone(),
            coordinator: HandoffCoordinator::new(agent),
            background,
            emitter,
            outbound,
            state,
            inbox,
            triggers,
            pending: VecDeque::new(),
            call_token,
            ended: false,
        };
        let task = tokio::spawn(engine.run());
        let handle = EngineHandle { call_id, sender, state: state_rx, history };
        (handle, task)
    }
}

/// Work waiting for the engine to go idle.
enum Pending {
    /// Input event; the run filter is checked against the owner at start.
    Input(Event),
    /// Background yield, already in history. Always starts a unit.
    Yield(Event),
}

struct EngineLoop {
    call_id: CallId,
    config: Arc<EngineConfig>,
    history: History,
    coordinator: HandoffCoordinator,
    background: BackgroundSupervisor,
    emitter: Emitter,
    outbound: mpsc::UnboundedSender<EngineOutput>,
    state: StateCell,
    inbox: mpsc::Receiver<Event>,
    triggers: mpsc::UnboundedReceiver<Event>,
    pending: VecDeque<Pending>,
    interrupt: InterruptController,
    call_token: CancellationToken,
    ended: bool,
}

impl EngineLoop {
    async fn run(mut self) {
        tracing::info!(call_id = %self.call_id, "call engine started");
        while !self.ended {
            self.start_next().await;
            tokio::select! {
                event = self.inbox.recv() => match event {
                    Some(event) => self.on_input(event).await,
                    None => {
                        tracing::debug!(call_id = %self.call_id, "all handles dropped, ending call");
                        self.on_input(Event::CallEnded).await;
                    }
                },
                Some(event) = self.triggers.recv() => {
                    tracing::trace!(call_id = %self.call_id, kind = %event.kind(), "background trigger queued");
                    self.pending.push_back(Pending::Yield(event));
                }
                outcome = self.interrupt.join() => self.on_unit_finished(&outcome),
            }
        }
    }

    async fn on_input(&mut self, event: Event) {
        if matches!(event, Event::CallEnded) {
            self.end_call().await;
            return;
        }
        if let Some(outcome) = self.interrupt.reap().await {
            self.on_unit_finished(&outcome);
        }
        if self.interrupt.is_active() {
            let owner = self.coordinator.current().await;
            if owner.cancel_filter().matches(&event) {
                let by = event.kind();
                let outcome = self
                    .interrupt
                    .interrupt(&self.history, event.clone(), Some(&self.outbound))
                    .await;
                self.state.set(EngineState::Idle);
                tracing::info!(call_id = %self.call_id, by = %by, outcome = ?outcome, "turn interrupted");
                self.pending.push_back(Pending::Input(event));
                return;
            }
        }
        self.history.append(event.clone()).await;
        self.pending.push_back(Pending::Input(event));
    }

    async fn start_next(&mut self) {
        while !self.interrupt.is_active() {
            let Some(next) = self.pending.pop_front() else {
                return;
            };
            let owner = self.coordinator.current().await;
            let event = match next {
                Pending::Input(event) if !owner.run_filter().matches(&event) => continue,
                Pending::Input(event) | Pending::Yield(event) => event,
            };
            self.launch(owner, event).await;
        }
    }

    async fn launch(&mut self, owner: Arc<dyn Agent>, event: Event) {
        let token = self.call_token.child_token();
        let cx = self.context(token.clone());
        let turn = Turn { call_id: self.call_id.clone(), event, history: self.history.snapshot().await };
        let trigger = turn.event.kind();
        tracing::debug!(call_id = %self.call_id, agent = owner.name(), trigger = %trigger, "starting unit");
        self.state.set(EngineState::Reasoning);
        let handle = tokio::spawn(run_unit(owner, turn, cx, Arc::clone(&self.config)));
        self.interrupt.begin(token, handle, trigger);
    }

    fn on_unit_finished(&self, outcome: &UnitOutcome) {
        if let UnitOutcome::Failed(reason) = outcome {
            tracing::warn!(call_id = %self.call_id, %reason, "unit failed");
        }
        self.state.set(EngineState::Idle);
    }

    fn context(&self, token: CancellationToken) -> TurnContext {
        TurnContext::new(
            self.call_id.clone(),
            self.history.clone(),
            self.emitter.with_cancel(token.clone()),
            token,
            self.state.clone(),
            self.background.clone(),
            self.coordinator.clone(),
        )
    }

    async fn end_call(&mut self) {
        let owner = self.coordinator.current().await;
        // Cancels any in-flight unit and records CallEnded after it.
        self.interrupt.interrupt(&self.history, Event::CallEnded, None).await;
        self.pending.clear();
        self.background.shutdown().await;

        if owner.run_filter().matches(&Event::CallEnded) {
            let cx = self.context(CancellationToken::new());
            let turn = Turn {
                call_id: self.call_id.clone(),
                event: Event::CallEnded,
                history: self.history.snapshot().await,
            };
            if let Err(err) = owner.process(turn, cx).await {
                tracing::warn!(call_id = %self.call_id, error = %err, "owner failed handling call end");
            }
        }
        for participant in self.coordinator.participants().await {
            if let Err(err) = participant.cleanup().await {
                tracing::warn!(call_id = %self.call_id, agent = participant.name(), error = %err, "cleanup failed");
            }
        }

        self.call_token.cancel();
        self.state.set(EngineState::Ended);
        let _ = self.outbound.send(EngineOutput::Ended);
        self.ended = true;
        let events = self.history.len().await;
        tracing::info!(
            call_id = %self.call_id,
            events,
            interruptions = self.interrupt.interruptions(),
            "call ended"
        );
    }
}

async fn run_unit(agent: Arc<dyn Agent>, turn: Turn, cx: TurnContext, config: Arc<EngineConfig>) -> UnitOutcome {
    match agent.process(turn, cx.clone()).await {
        Ok(()) => UnitOutcome::Completed,
        Err(err) if err.is_cancelled() || cx.is_cancelled() => UnitOutcome::Cancelled,
        Err(err) => {
            if err.is_turn_failure() {
                tracing::warn!(call_id = %cx.call_id(), error = %err, "turn failed");
            } else {
                tracing::error!(call_id = %cx.call_id(), agent = agent.name(), error = %err, "agent error");
            }
            recover(&cx, &err, &config).await;
            UnitOutcome::Failed(err.to_string())
        }
    }
}

/// Fallback after a failed turn: log it, apologize, optionally hang up.
async fn recover(cx: &TurnContext, err: &Error, config: &EngineConfig) {
    let mut metadata = Metadata::new();
    metadata.insert("reason".to_string(), err.code().into());
    let log = OutputEvent::LogMessage {
        name: "turn_failed".to_string(),
        level: LogLevel::Error,
        message: err.to_string(),
        metadata,
    };
    if cx.emit(log).await.is_err() {
        return;
    }
    if let Some(message) = &config.fallback_message {
        if cx.send_text(message.clone()).await.is_err() {
            return;
        }
    }
    if config.end_call_on_failure {
        let _ = cx.emit(OutputEvent::AgentEndCall).await;
    }
}
