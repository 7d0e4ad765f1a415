//! Turn orchestration for voice agents.
//!
//! A call is a totally ordered [`History`] of [`Event`]s driven by one
//! [`TurnEngine`]. The engine hands triggering events to the call's current
//! [`Agent`], interrupts it when the user barges in, and routes handoffs
//! between agents. Wire-level concerns live in `crate::transport`.

mod agent;
mod app;
mod background;
mod builder;
mod call;
mod context;
pub mod conversation;
mod emitter;
mod engine;
pub mod events;
mod filter;
mod handlers;
mod handoff;
mod history;
mod interrupt;
pub mod llm;
pub mod schema;
mod tools;

pub use agent::{Agent, FnAgent, LlmAgent};
pub use app::{App, AppBuilder, CallSession, OutputStream};
pub use background::BackgroundSupervisor;
pub use builder::{AgentConfig, DEFAULT_MAX_TOOL_ITERATIONS, LlmAgentBuilder};
pub use call::{AgentOverrides, CallContext, CallId, CallRequest, CallStatus, PreCallDecision};
pub use context::{Turn, TurnContext};
pub use emitter::{Emitter, EngineOutput, EngineState};
pub use engine::{DEFAULT_FALLBACK_MESSAGE, EngineConfig, EngineHandle, TurnEngine};
pub use events::{Event, EventKind, LogLevel, Metadata, OutputEvent, TurnContent};
pub use filter::EventFilter;
pub use handlers::{CallHandlers, GetAgentHandler, PreCallHandler};
pub use handoff::{HandoffCoordinator, agent_as_handoff};
pub use history::{History, HistorySnapshot};
pub use interrupt::{InterruptController, UnitOutcome};
pub use llm::{
    Message, ReasoningDelta, ReasoningPolicy, ReasoningProvider, ReasoningRequest, ReasoningStream,
    ResilientProvider, Role, SamplingConfig, Temperature, ToolCallRequest, ToolDefinition,
};
pub use schema::{Param, ParamSchema, ParamType, SchemaViolation, ViolationReason};
pub use tools::{
    Args, BoxFuture, HandoffTrigger, InvocationState, Paradigm, Tool, ToolContext, ToolDescriptor,
    ToolInvocation, ToolOutput, ToolRegistry, YieldStream,
};
