use super::builder::{AgentConfig, LlmAgentBuilder};
use super::context::{Turn, TurnContext};
use super::conversation::build_messages;
use super::emitter::EngineState;
use super::events::Event;
use super::filter::EventFilter;
use super::handoff;
use super::llm::{ReasoningDelta, ReasoningProvider, ReasoningRequest, ToolCallRequest};
use super::tools::{Args, Paradigm, Tool, ToolContext, ToolInvocation, ToolRegistry, error_result};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Anything that can own a call: it reacts to triggering events by emitting
/// output through its [`TurnContext`].
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str {
        "agent"
    }

    /// Handle one triggering event.
    ///
    /// # Errors
    /// [`Error::Cancelled`] means the unit was interrupted. Structural
    /// failures (see [`Error::is_turn_failure`]) end the turn with the
    /// engine's fallback; the call continues either way.
    async fn process(&self, turn: Turn, cx: TurnContext) -> Result<()>;

    /// Events that start a unit of work while this agent owns the call.
    fn run_filter(&self) -> EventFilter {
        EventFilter::default_run()
    }

    /// Events that interrupt this agent's in-flight work.
    fn cancel_filter(&self) -> EventFilter {
        EventFilter::default_cancel()
    }

    /// Called once when the call ends.
    ///
    /// # Errors
    /// Errors are logged; they never stop other participants' cleanup.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

type ProcessFn = Arc<dyn Fn(Turn, TurnContext) -> super::tools::BoxFuture<Result<()>> + Send + Sync>;

/// An [`Agent`] backed by a closure.
pub struct FnAgent {
    name: String,
    process: ProcessFn,
    run_filter: EventFilter,
    cancel_filter: EventFilter,
}

impl FnAgent {
    pub fn new<F, Fut>(name: impl Into<String>, process: F) -> Self
    where
        F: Fn(Turn, TurnContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let process: ProcessFn =
            Arc::new(move |turn: Turn, cx: TurnContext| -> super::tools::BoxFuture<Result<()>> {
                Box::pin(process(turn, cx))
            });
        Self {
            name: name.into(),
            process,
            run_filter: EventFilter::default_run(),
            cancel_filter: EventFilter::default_cancel(),
        }
    }

    #[must_use]
    pub fn with_run_filter(mut self, filter: EventFilter) -> Self {
        self.run_filter = filter;
        self
    }

    #[must_use]
    pub fn with_cancel_filter(mut self, filter: EventFilter) -> Self {
        self.cancel_filter = filter;
        self
    }
}

#[async_trait]
impl Agent for FnAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, turn: Turn, cx: TurnContext) -> Result<()> {
        (self.process)(turn, cx).await
    }

    fn run_filter(&self) -> EventFilter {
        self.run_filter.clone()
    }

    fn cancel_filter(&self) -> EventFilter {
        self.cancel_filter.clone()
    }
}

/// Agent driven by a reasoning provider and a tool registry.
pub struct LlmAgent {
    pub(crate) name: String,
    pub(crate) config: AgentConfig,
    pub(crate) provider: Arc<dyn ReasoningProvider>,
    pub(crate) tools: ToolRegistry,
    pub(crate) run_filter: EventFilter,
    pub(crate) cancel_filter: EventFilter,
    pub(crate) introduced: AtomicBool,
    pub(crate) cleaned_up: AtomicBool,
}

impl LlmAgent {
    #[must_use]
    pub fn builder() -> LlmAgentBuilder {
        LlmAgentBuilder::new()
    }

    #[must_use]
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }

    #[must_use]
    pub const fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Speak the introduction, at most once per agent. Returns whether
    /// anything was said.
    async fn introduce(&self, cx: &TurnContext) -> Result<bool> {
        let Some(intro) = self.config.introduction.as_deref().filter(|text| !text.is_empty()) else {
            return Ok(false);
        };
        if self.introduced.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        cx.send_text(intro).await?;
        Ok(true)
    }

    async fn reason(&self, turn: &Turn, cx: &TurnContext) -> Result<()> {
        let limit = self.config.max_tool_iterations;
        let mut rounds = 0usize;
        loop {
            cx.set_state(EngineState::Reasoning);
            let history = cx.history().snapshot().await;
            let request = ReasoningRequest {
                system_prompt: self.config.system_prompt.clone(),
                messages: build_messages(&history),
                tools: self.tools.definitions(),
                sampling: self.config.sampling.clone(),
            };
            tracing::debug!(
                agent = %self.name,
                call_id = %cx.call_id(),
                messages = request.messages.len(),
                round = rounds,
                "reasoning step"
            );

            let mut stream = cx.run(self.provider.complete(request)).await??;
            let mut calls = Vec::new();
            while let Some(delta) = cx.run(stream.next()).await? {
                match delta? {
                    ReasoningDelta::Text(text) if text.is_empty() => {}
                    ReasoningDelta::Text(text) => cx.send_text(text).await?,
                    ReasoningDelta::ToolCall(call) => calls.push(call),
                }
            }

            if calls.is_empty() {
                return Ok(());
            }
            if rounds >= limit {
                tracing::warn!(agent = %self.name, limit, "tool loop bound reached");
                return Err(Error::ToolLoopExceeded { limit });
            }
            rounds += 1;
            cx.set_state(EngineState::ExecutingTools);
            if !self.execute_round(turn, cx, calls).await? {
                return Ok(());
            }
        }
    }

    /// Run one round of tool calls. Returns whether reasoning should continue,
    /// which is the case when any call produced a result for the loop.
    async fn execute_round(&self, turn: &Turn, cx: &TurnContext, calls: Vec<ToolCallRequest>) -> Result<bool> {
        let mut continue_reasoning = false;
        for call in calls {
            let mut invocation = ToolInvocation::new(&call);
            cx.emit(invocation.called()).await?;

            let Some(tool) = self.tools.get(&call.name) else {
                tracing::warn!(tool = %call.name, "model called an unknown tool");
                cx.emit(invocation.failed(&Error::UnknownTool(call.name.clone()))).await?;
                continue_reasoning = true;
                continue;
            };
            let args = match tool.descriptor().params.validate(&call.name, &call.arguments) {
                Ok(values) => Args::new(values),
                Err(violation) => {
                    tracing::debug!(tool = %call.name, %violation, "rejected tool arguments");
                    cx.emit(invocation.failed(&Error::from(violation))).await?;
                    continue_reasoning = true;
                    continue;
                }
            };

            let descriptor = tool.descriptor();
            match descriptor.paradigm {
                Paradigm::Loopback if descriptor.background => {
                    self.spawn_background(tool, turn, cx, &call, args, invocation).await?;
                }
                Paradigm::Loopback => {
                    let ctx = tool_context(turn, cx, &call).await;
                    run_loopback(tool, ctx, args, &mut invocation, cx).await?;
                    continue_reasoning = true;
                }
                Paradigm::Passthrough => {
                    let ctx = tool_context(turn, cx, &call).await;
                    run_passthrough(tool, ctx, args, &mut invocation, cx).await?;
                }
                Paradigm::Handoff => {
                    let ctx = tool_context(turn, cx, &call).await;
                    handoff::activate(tool, ctx, args, &mut invocation, cx).await?;
                    // The new owner takes it from here; later calls are dropped.
                    return Ok(false);
                }
            }
        }
        Ok(continue_reasoning)
    }

    async fn spawn_background(
        &self,
        tool: &Tool,
        turn: &Turn,
        cx: &TurnContext,
        call: &ToolCallRequest,
        args: Args,
        invocation: ToolInvocation,
    ) -> Result<()> {
        let background_cx = cx.with_cancel(cx.background().shutdown_token());
        let ctx = tool_context(turn, &background_cx, call).await;
        // An interrupted unit must not leave work behind.
        if cx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Some(work) = tool.call_loopback(ctx.clone(), args) else {
            return Ok(());
        };
        tracing::debug!(agent = %self.name, tool = %call.name, "dispatching background tool");
        cx.background().spawn(ctx, invocation, async move { Ok(work.await?.into_stream()) });
        Ok(())
    }
}

async fn tool_context(turn: &Turn, cx: &TurnContext, call: &ToolCallRequest) -> ToolContext {
    ToolContext::new(
        call.id.clone(),
        call.name.clone(),
        turn.event.clone(),
        cx.history().snapshot().await,
        cx.clone(),
    )
}

async fn run_loopback(
    tool: &Tool,
    ctx: ToolContext,
    args: Args,
    invocation: &mut ToolInvocation,
    cx: &TurnContext,
) -> Result<()> {
    let Some(work) = tool.call_loopback(ctx, args) else {
        return Err(Error::Tool(format!("`{}` is not a loopback tool", tool.name())));
    };
    let output = match cx.run(work).await? {
        Ok(output) => output,
        Err(err) if err.is_cancelled() => {
            invocation.cancel();
            return Err(err);
        }
        Err(err) => {
            tracing::warn!(tool = %invocation.name, error = %err, "tool failed");
            cx.emit(invocation.failed(&err)).await?;
            return Ok(());
        }
    };
    let mut results = output.into_stream();
    while let Some(item) = cx.run(results.next()).await? {
        let result = item.unwrap_or_else(|err| error_result(&err));
        cx.emit(invocation.returned(result)).await?;
    }
    invocation.complete();
    Ok(())
}

async fn run_passthrough(
    tool: &Tool,
    ctx: ToolContext,
    args: Args,
    invocation: &mut ToolInvocation,
    cx: &TurnContext,
) -> Result<()> {
    let Some(work) = tool.call_passthrough(ctx, args) else {
        return Err(Error::Tool(format!("`{}` is not a passthrough tool", tool.name())));
    };
    match cx.run(work).await? {
        Ok(()) => {
            cx.emit(invocation.returned(Value::from("ok"))).await?;
            invocation.complete();
        }
        Err(err) if err.is_cancelled() => {
            invocation.cancel();
            return Err(err);
        }
        Err(err) => {
            tracing::warn!(tool = %invocation.name, error = %err, "passthrough tool failed");
            cx.emit(invocation.failed(&err)).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl Agent for LlmAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, turn: Turn, cx: TurnContext) -> Result<()> {
        match &turn.event {
            Event::CallEnded => Ok(()),
            Event::CallStarted => self.introduce(&cx).await.map(|_| ()),
            Event::AgentHandedOff => {
                if self.introduce(&cx).await? {
                    Ok(())
                } else {
                    self.reason(&turn, &cx).await
                }
            }
            _ => self.reason(&turn, &cx).await,
        }
    }

    fn run_filter(&self) -> EventFilter {
        self.run_filter.clone()
    }

    fn cancel_filter(&self) -> EventFilter {
        self.cancel_filter.clone()
    }

    async fn cleanup(&self) -> Result<()> {
        if !self.cleaned_up.swap(true, Ordering::SeqCst) {
            tracing::debug!(agent = %self.name, "agent cleaned up");
        }
        Ok(())
    }
}
