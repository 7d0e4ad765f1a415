//! Call ownership and its transfer between agents.

use super::agent::Agent;
use super::context::{Turn, TurnContext};
use super::events::Event;
use super::filter::EventFilter;
use super::schema::ParamSchema;
use super::tools::{Args, HandoffHandler, HandoffTrigger, Handler, Tool, ToolContext, ToolInvocation};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;

struct Ownership {
    owner: Arc<dyn Agent>,
    generation: u64,
    participants: Vec<Arc<dyn Agent>>,
}

/// Tracks which agent currently owns a call. The engine reads the owner
/// when a unit starts, so a transfer only affects units that start later.
#[derive(Clone)]
pub struct HandoffCoordinator {
    inner: Arc<RwLock<Ownership>>,
}

impl HandoffCoordinator {
    #[must_use]
    pub fn new(root: Arc<dyn Agent>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Ownership {
                owner: Arc::clone(&root),
                generation: 0,
                participants: vec![root],
            })),
        }
    }

    pub async fn current(&self) -> Arc<dyn Agent> {
        Arc::clone(&self.inner.read().await.owner)
    }

    /// Number of transfers so far.
    pub async fn generation(&self) -> u64 {
        self.inner.read().await.generation
    }

    /// Make `owner` the call's owner. `participant`, when given, is the agent
    /// that must be cleaned up at call end on the new owner's behalf.
    pub async fn transfer(&self, owner: Arc<dyn Agent>, participant: Option<Arc<dyn Agent>>) -> u64 {
        let mut inner = self.inner.write().await;
        if let Some(participant) = participant {
            let known = inner.participants.iter().any(|p| same_agent(p, &participant));
            if !known {
                inner.participants.push(participant);
            }
        }
        tracing::info!(from = inner.owner.name(), to = owner.name(), "call handed off");
        inner.owner = owner;
        inner.generation += 1;
        inner.generation
    }

    /// Every agent that owned the call or was handed it, each once.
    pub async fn participants(&self) -> Vec<Arc<dyn Agent>> {
        self.inner.read().await.participants.clone()
    }
}

fn same_agent(a: &Arc<dyn Agent>, b: &Arc<dyn Agent>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Owner installed by a handoff tool: each later triggering event is routed
/// back into the tool's handler.
struct HandoffOwner {
    name: String,
    tool_call_id: String,
    handler: HandoffHandler,
    args: Args,
    run_filter: EventFilter,
    cancel_filter: EventFilter,
}

#[async_trait]
impl Agent for HandoffOwner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, turn: Turn, cx: TurnContext) -> Result<()> {
        let ctx = ToolContext::new(
            self.tool_call_id.clone(),
            self.name.clone(),
            turn.event.clone(),
            turn.history,
            cx,
        );
        (self.handler)(ctx, self.args.clone(), HandoffTrigger::Event(turn.event)).await
    }

    fn run_filter(&self) -> EventFilter {
        self.run_filter.clone()
    }

    fn cancel_filter(&self) -> EventFilter {
        self.cancel_filter.clone()
    }
}

/// Carry out a handoff tool call: announce, answer the call, transfer
/// ownership, then let the handler react to being handed the call.
pub(crate) async fn activate(
    tool: &Tool,
    ctx: ToolContext,
    args: Args,
    invocation: &mut ToolInvocation,
    cx: &TurnContext,
) -> Result<()> {
    let Handler::Handoff(handler) = &tool.handler else {
        return Err(Error::Tool(format!("`{}` is not a handoff tool", tool.name())));
    };
    if let Some(message) = &tool.handoff.announce {
        cx.send_text(message.clone()).await?;
    }
    cx.emit(invocation.returned(Value::from("handed off"))).await?;
    cx.emitter().record(Event::AgentHandedOff).await?;

    let owner = HandoffOwner {
        name: tool.name().to_string(),
        tool_call_id: invocation.id.clone(),
        handler: Arc::clone(handler),
        args: args.clone(),
        run_filter: tool.handoff.run_filter.clone().unwrap_or_else(EventFilter::default_run),
        cancel_filter: tool.handoff.cancel_filter.clone().unwrap_or_else(EventFilter::default_cancel),
    };
    cx.handoff().transfer(Arc::new(owner), tool.handoff.target.clone()).await;
    invocation.complete();

    let ctx = ctx.with_history(cx.history().snapshot().await);
    cx.run(handler(ctx, args, HandoffTrigger::HandedOff)).await?
}

/// Wrap `agent` as a handoff tool. Calling the tool hands the call to
/// `agent`, which first sees an [`Event::AgentHandedOff`] and then every
/// event its own run filter selects.
pub fn agent_as_handoff(agent: Arc<dyn Agent>, name: impl Into<String>, description: impl Into<String>) -> Tool {
    let run_filter = agent.run_filter();
    let cancel_filter = agent.cancel_filter();
    let target = Arc::clone(&agent);
    let mut tool = Tool::handoff(name, description, ParamSchema::new(), move |ctx, _args, trigger| {
        let agent = Arc::clone(&agent);
        async move {
            let turn = Turn {
                call_id: ctx.call_id().clone(),
                event: trigger.event(),
                history: ctx.turn().history().snapshot().await,
            };
            agent.process(turn, ctx.turn().clone()).await
        }
    })
    .owner_filters(run_filter, cancel_filter);
    tool.handoff.target = Some(target);
    tool
}
