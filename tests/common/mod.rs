#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use voice_rt_rs::sdk::llm::{ReasoningStream, ToolCallRequest};
use voice_rt_rs::sdk::{EngineHandle, TurnEngine};
use voice_rt_rs::{
    Agent, EngineConfig, EngineOutput, Event, EventKind, OutputEvent, ProviderError, ProviderErrorKind,
    ReasoningDelta, ReasoningProvider, ReasoningRequest, Result, Turn, TurnContent, TurnContext,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// What the provider does for one `complete` call.
#[derive(Clone)]
pub enum Step {
    Reply(Vec<ReasoningDelta>),
    Fail(ProviderErrorKind),
    /// Open a stream that never yields.
    Hang,
}

/// Provider that plays back a script, then repeats `fallback` forever.
pub struct ScriptedProvider {
    name: String,
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    requests: Mutex<Vec<ReasoningRequest>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Self::with_fallback(steps, Step::Reply(Vec::new()))
    }

    pub fn with_fallback(steps: impl IntoIterator<Item = Step>, fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            name: "scripted".to_string(),
            steps: Mutex::new(steps.into_iter().collect()),
            fallback,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ReasoningRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub async fn wait_for_calls(&self, n: usize) {
        tokio::time::timeout(WAIT, async {
            while self.calls() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("provider was not called in time");
    }
}

#[async_trait]
impl ReasoningProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ReasoningRequest) -> Result<ReasoningStream> {
        self.requests.lock().unwrap().push(request);
        let step = self.steps.lock().unwrap().pop_front().unwrap_or_else(|| self.fallback.clone());
        self.calls.fetch_add(1, Ordering::SeqCst);
        match step {
            Step::Reply(deltas) => Ok(futures::stream::iter(deltas.into_iter().map(Ok)).boxed()),
            Step::Fail(kind) => Err(ProviderError::new(kind, "scripted failure").into()),
            Step::Hang => Ok(futures::stream::pending::<Result<ReasoningDelta>>().boxed()),
        }
    }
}

pub fn text(content: &str) -> ReasoningDelta {
    ReasoningDelta::Text(content.to_string())
}

pub fn call(id: &str, name: &str, arguments: Value) -> ReasoningDelta {
    ReasoningDelta::ToolCall(ToolCallRequest { id: id.to_string(), name: name.to_string(), arguments })
}

pub fn user_said(content: &str) -> Event {
    Event::UserTurnEnded { content: vec![TurnContent::text(content)] }
}

/// Agent that answers every user turn with `"{name}: {text}"` and counts
/// cleanups.
pub struct EchoAgent {
    pub name: String,
    pub handled: Mutex<Vec<EventKind>>,
    pub cleanups: AtomicUsize,
}

impl EchoAgent {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self { name: name.to_string(), handled: Mutex::new(Vec::new()), cleanups: AtomicUsize::new(0) })
    }

    pub fn handled(&self) -> Vec<EventKind> {
        self.handled.lock().unwrap().clone()
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, turn: Turn, cx: TurnContext) -> Result<()> {
        self.handled.lock().unwrap().push(turn.event.kind());
        match &turn.event {
            Event::UserTurnEnded { content } => {
                let said: Vec<String> = content
                    .iter()
                    .map(|part| match part {
                        TurnContent::Text { content } => content.clone(),
                        TurnContent::Dtmf { button } => button.clone(),
                    })
                    .collect();
                cx.send_text(format!("{}: {}", self.name, said.join(" "))).await
            }
            Event::AgentHandedOff => cx.send_text(format!("{} here", self.name)).await,
            _ => Ok(()),
        }
    }

    async fn cleanup(&self) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub handle: EngineHandle,
    pub outputs: mpsc::UnboundedReceiver<EngineOutput>,
}

impl Harness {
    pub fn start(agent: Arc<dyn Agent>) -> Self {
        Self::with_config(agent, EngineConfig::default())
    }

    pub fn with_config(agent: Arc<dyn Agent>, config: EngineConfig) -> Self {
        let (tx, outputs) = mpsc::unbounded_channel();
        let (handle, _task) = TurnEngine::spawn("test-call".into(), agent, config, tx);
        Self { handle, outputs }
    }

    pub async fn send(&self, event: Event) {
        self.handle.send(event).await.expect("engine accepts input");
    }

    pub async fn next(&mut self) -> EngineOutput {
        tokio::time::timeout(WAIT, self.outputs.recv())
            .await
            .expect("timed out waiting for engine output")
            .expect("engine output channel closed")
    }

    /// Skip outputs until one matches, returning everything seen before it.
    pub async fn until<F>(&mut self, mut pred: F) -> (EngineOutput, Vec<EngineOutput>)
    where
        F: FnMut(&EngineOutput) -> bool,
    {
        let mut skipped = Vec::new();
        loop {
            let output = self.next().await;
            if pred(&output) {
                return (output, skipped);
            }
            skipped.push(output);
        }
    }

    /// Next spoken text, skipping every other output.
    pub async fn next_text(&mut self) -> String {
        let (output, _) = self
            .until(|output| matches!(output, EngineOutput::Event(OutputEvent::AgentSendText { .. })))
            .await;
        match output {
            EngineOutput::Event(OutputEvent::AgentSendText { text }) => text,
            _ => unreachable!(),
        }
    }

    pub async fn end(&mut self) -> Vec<EngineOutput> {
        self.handle.end().await.expect("call still running");
        let (_, seen) = self.until(|output| matches!(output, EngineOutput::Ended)).await;
        seen
    }

    pub async fn events(&self) -> Vec<Event> {
        self.handle.history().snapshot().await.events().to_vec()
    }
}

pub fn tool_results(events: &[Event]) -> Vec<(String, Value)> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::AgentToolReturned { id, result, .. } => Some((id.clone(), result.clone())),
            _ => None,
        })
        .collect()
}
