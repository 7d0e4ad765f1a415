//! Call admission and per-call engine lifecycle.

use super::call::{CallContext, CallId, CallRequest, CallStatus, PreCallDecision};
use super::emitter::{EngineOutput, EngineState};
use super::engine::{EngineConfig, EngineHandle, TurnEngine};
use super::events::Event;
use super::handlers::CallHandlers;
use super::history::History;
use crate::{Error, Result};
use futures::Stream;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{Mutex, mpsc};

/// Entry point for hosting agents: screens incoming calls, builds the root
/// agent and runs one engine per call.
#[derive(Clone)]
pub struct App {
    handlers: Arc<CallHandlers>,
    engine: EngineConfig,
    calls: Arc<Mutex<HashMap<CallId, EngineHandle>>>,
}

impl App {
    #[must_use]
    pub fn builder() -> AppBuilder {
        AppBuilder::new()
    }

    /// Run the pre-call hook. Calls are accepted when none is set.
    ///
    /// # Errors
    /// Propagates errors from the hook.
    pub async fn screen(&self, request: &CallRequest) -> Result<PreCallDecision> {
        match &self.handlers.pre_call {
            Some(pre_call) => pre_call(request.clone()).await,
            None => Ok(PreCallDecision::Accept),
        }
    }

    /// Screen, build the agent and start the call's engine. The engine has
    /// already been sent `CallStarted` when this returns.
    ///
    /// # Errors
    /// Returns [`Error::CallRejected`] if the pre-call hook rejects the call,
    /// or the agent factory's error.
    pub async fn start_call(&self, request: CallRequest) -> Result<CallSession> {
        if let PreCallDecision::Reject { reason } = self.screen(&request).await? {
            tracing::info!(%reason, "call rejected before start");
            return Err(Error::CallRejected(reason));
        }
        let get_agent = self
            .handlers
            .get_agent
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("get_agent handler required".to_string()))?;

        let call_id = request.call_id.clone().map(CallId::from).unwrap_or_default();
        let agent = get_agent(CallContext { call_id: call_id.clone(), request }).await?;

        let (outbound, outputs) = mpsc::unbounded_channel();
        let (handle, task) = TurnEngine::spawn(call_id.clone(), agent, self.engine.clone(), outbound);
        self.calls.lock().await.insert(call_id.clone(), handle.clone());

        let calls = Arc::clone(&self.calls);
        let finished_id = call_id.clone();
        tokio::spawn(async move {
            if let Err(err) = task.await {
                tracing::error!(call_id = %finished_id, error = %err, "call engine task failed");
            }
            calls.lock().await.remove(&finished_id);
        });

        tracing::info!(call_id = %call_id, "call started");
        handle.send(Event::CallStarted).await?;
        Ok(CallSession { handle, outputs })
    }

    pub async fn active_calls(&self) -> usize {
        self.calls.lock().await.len()
    }

    pub async fn call(&self, call_id: &CallId) -> Option<EngineHandle> {
        self.calls.lock().await.get(call_id).cloned()
    }
}

pub struct AppBuilder {
    handlers: CallHandlers,
    engine: EngineConfig,
}

impl AppBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self { handlers: CallHandlers::new(), engine: EngineConfig::default() }
    }

    #[must_use]
    pub fn handlers(mut self, handlers: CallHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    #[must_use]
    pub fn get_agent<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn super::agent::Agent>>> + Send + 'static,
    {
        self.handlers = self.handlers.get_agent(handler);
        self
    }

    #[must_use]
    pub fn pre_call<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(CallRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PreCallDecision>> + Send + 'static,
    {
        self.handlers = self.handlers.pre_call(handler);
        self
    }

    #[must_use]
    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// # Errors
    /// Returns an error if no `get_agent` handler was configured.
    #[allow(clippy::result_large_err)]
    pub fn build(self) -> Result<App> {
        if self.handlers.get_agent.is_none() {
            return Err(Error::InvalidConfig("get_agent handler required".to_string()));
        }
        Ok(App {
            handlers: Arc::new(self.handlers),
            engine: self.engine,
            calls: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running call: the input handle plus the ordered output stream.
pub struct CallSession {
    handle: EngineHandle,
    outputs: mpsc::UnboundedReceiver<EngineOutput>,
}

impl CallSession {
    #[must_use]
    pub const fn call_id(&self) -> &CallId {
        self.handle.call_id()
    }

    #[must_use]
    pub const fn handle(&self) -> &EngineHandle {
        &self.handle
    }

    #[must_use]
    pub const fn history(&self) -> &History {
        self.handle.history()
    }

    /// `Created` until the engine has recorded `CallStarted`, which is
    /// always the first entry of a call's history.
    pub async fn status(&self) -> CallStatus {
        if self.handle.state() == EngineState::Ended {
            CallStatus::Ended
        } else if self.history().is_empty().await {
            CallStatus::Created
        } else {
            CallStatus::Active
        }
    }

    /// # Errors
    /// Returns [`Error::CallEnded`] once the call is over.
    pub async fn send(&self, event: Event) -> Result<()> {
        self.handle.send(event).await
    }

    /// # Errors
    /// Returns [`Error::CallEnded`] if the call already ended.
    pub async fn end(&self) -> Result<()> {
        self.handle.end().await
    }

    /// Next output, `None` after the engine is gone.
    pub async fn next_output(&mut self) -> Option<EngineOutput> {
        self.outputs.recv().await
    }

    #[must_use]
    pub fn outputs(&mut self) -> OutputStream<'_> {
        OutputStream { rx: &mut self.outputs }
    }
}

pub struct OutputStream<'a> {
    rx: &'a mut mpsc::UnboundedReceiver<EngineOutput>,
}

impl Stream for OutputStream<'_> {
    type Item = EngineOutput;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.rx.poll_recv(cx)
    }
}
