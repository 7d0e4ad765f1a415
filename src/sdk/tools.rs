use super::agent::Agent;
use super::call::CallId;
use super::context::TurnContext;
use super::events::{Event, OutputEvent};
use super::filter::EventFilter;
use super::history::HistorySnapshot;
use super::llm::{ToolCallRequest, ToolDefinition};
use super::schema::ParamSchema;
use crate::{Error, Result};
use futures::stream::{BoxStream, Stream, StreamExt};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Successive results of a generator-style loopback tool.
pub type YieldStream = BoxStream<'static, Result<Value>>;

pub(crate) type LoopbackHandler = Arc<dyn Fn(ToolContext, Args) -> BoxFuture<Result<ToolOutput>> + Send + Sync>;
pub(crate) type PassthroughHandler = Arc<dyn Fn(ToolContext, Args) -> BoxFuture<Result<()>> + Send + Sync>;
pub(crate) type HandoffHandler =
    Arc<dyn Fn(ToolContext, Args, HandoffTrigger) -> BoxFuture<Result<()>> + Send + Sync>;

/// How a tool's result flows back into the call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Paradigm {
    /// Result goes back to the reasoning loop.
    Loopback,
    /// Handler emits output events directly; reasoning stops.
    Passthrough,
    /// Handler takes ownership of subsequent events for the call.
    Handoff,
}

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub params: ParamSchema,
    pub paradigm: Paradigm,
    /// Runs off the turn path and is exempt from interruption.
    pub background: bool,
}

impl ToolDescriptor {
    #[must_use]
    pub fn json_schema(&self) -> Value {
        self.params.json_schema()
    }

    #[must_use]
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.json_schema(),
        }
    }
}

/// Validated arguments, with declared defaults filled in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Map<String, Value>);

impl Args {
    #[must_use]
    pub const fn new(values: Map<String, Value>) -> Self {
        Self(values)
    }

    #[must_use]
    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    #[must_use]
    pub fn str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// # Errors
    /// Returns an error if the argument is absent or has the wrong shape.
    #[allow(clippy::result_large_err)]
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self
            .0
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Tool(format!("missing argument `{name}`")))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Deserialize the whole argument object.
    ///
    /// # Errors
    /// Returns an error if the arguments do not fit `T`.
    #[allow(clippy::result_large_err)]
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.0.clone()))?)
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

pub enum ToolOutput {
    Value(Value),
    /// Generator-style result; each item becomes its own tool result.
    Yields(YieldStream),
}

impl ToolOutput {
    /// # Errors
    /// Returns an error if `value` does not serialize.
    #[allow(clippy::result_large_err)]
    pub fn value(value: impl Serialize) -> Result<Self> {
        Ok(Self::Value(serde_json::to_value(value)?))
    }

    pub fn yields<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        Self::Yields(stream.boxed())
    }

    /// Every result as a stream; a plain value counts as a single yield.
    #[must_use]
    pub fn into_stream(self) -> YieldStream {
        match self {
            Self::Value(value) => futures::stream::once(async move { Ok(value) }).boxed(),
            Self::Yields(stream) => stream,
        }
    }
}

impl From<Value> for ToolOutput {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl fmt::Debug for ToolOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Yields(_) => f.write_str("Yields(..)"),
        }
    }
}

/// Why a handoff handler is being invoked.
#[derive(Debug, Clone, PartialEq)]
pub enum HandoffTrigger {
    /// Ownership is being transferred right now.
    HandedOff,
    /// A later event routed to the handler as the call's owner.
    Event(Event),
}

impl HandoffTrigger {
    #[must_use]
    pub fn event(&self) -> Event {
        match self {
            Self::HandedOff => Event::AgentHandedOff,
            Self::Event(event) => event.clone(),
        }
    }
}

/// What a tool handler sees about its invocation.
#[derive(Clone)]
pub struct ToolContext {
    pub tool_call_id: String,
    pub tool_name: String,
    /// The event that triggered the current unit.
    pub event: Event,
    pub history: HistorySnapshot,
    turn: TurnContext,
}

impl ToolContext {
    pub(crate) const fn new(
        tool_call_id: String,
        tool_name: String,
        event: Event,
        history: HistorySnapshot,
        turn: TurnContext,
    ) -> Self {
        Self { tool_call_id, tool_name, event, history, turn }
    }

    pub(crate) fn with_history(self, history: HistorySnapshot) -> Self {
        Self { history, ..self }
    }

    #[must_use]
    pub const fn call_id(&self) -> &CallId {
        self.turn.call_id()
    }

    /// # Errors
    /// Returns [`Error::Cancelled`] if the invoking scope was cancelled.
    pub async fn emit(&self, event: OutputEvent) -> Result<()> {
        self.turn.emit(event).await
    }

    /// # Errors
    /// Returns [`Error::Cancelled`] if the invoking scope was cancelled.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.turn.send_text(text).await
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.turn.is_cancelled()
    }

    #[must_use]
    pub const fn turn(&self) -> &TurnContext {
        &self.turn
    }
}

#[derive(Clone)]
pub(crate) enum Handler {
    Loopback(LoopbackHandler),
    Passthrough(PassthroughHandler),
    Handoff(HandoffHandler),
}

/// Handoff-only settings.
#[derive(Clone, Default)]
pub(crate) struct HandoffSettings {
    pub(crate) announce: Option<String>,
    pub(crate) run_filter: Option<EventFilter>,
    pub(crate) cancel_filter: Option<EventFilter>,
    /// Agent that should be cleaned up when the call ends.
    pub(crate) target: Option<Arc<dyn Agent>>,
}

#[derive(Clone)]
pub struct Tool {
    descriptor: ToolDescriptor,
    pub(crate) handler: Handler,
    pub(crate) handoff: HandoffSettings,
}

impl Tool {
    fn with_handler(
        name: impl Into<String>,
        description: impl Into<String>,
        params: ParamSchema,
        paradigm: Paradigm,
        handler: Handler,
    ) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: name.into(),
                description: description.into(),
                params,
                paradigm,
                background: false,
            },
            handler,
            handoff: HandoffSettings::default(),
        }
    }

    pub fn loopback<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        params: ParamSchema,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolContext, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput>> + Send + 'static,
    {
        let handler: LoopbackHandler =
            Arc::new(move |ctx: ToolContext, args: Args| -> BoxFuture<Result<ToolOutput>> {
                Box::pin(handler(ctx, args))
            });
        Self::with_handler(name, description, params, Paradigm::Loopback, Handler::Loopback(handler))
    }

    pub fn passthrough<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        params: ParamSchema,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolContext, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: PassthroughHandler =
            Arc::new(move |ctx: ToolContext, args: Args| -> BoxFuture<Result<()>> {
                Box::pin(handler(ctx, args))
            });
        Self::with_handler(
            name,
            description,
            params,
            Paradigm::Passthrough,
            Handler::Passthrough(handler),
        )
    }

    pub fn handoff<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        params: ParamSchema,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolContext, Args, HandoffTrigger) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: HandoffHandler = Arc::new(
            move |ctx: ToolContext, args: Args, trigger: HandoffTrigger| -> BoxFuture<Result<()>> {
                Box::pin(handler(ctx, args, trigger))
            },
        );
        Self::with_handler(name, description, params, Paradigm::Handoff, Handler::Handoff(handler))
    }

    /// Run this tool off the turn path.
    ///
    /// # Errors
    /// Only loopback tools can run in the background.
    #[allow(clippy::result_large_err)]
    pub fn background(mut self) -> Result<Self> {
        if self.descriptor.paradigm != Paradigm::Loopback {
            return Err(Error::InvalidConfig(format!(
                "tool `{}` is {:?}; only loopback tools can run in the background",
                self.descriptor.name, self.descriptor.paradigm
            )));
        }
        self.descriptor.background = true;
        Ok(self)
    }

    /// Text spoken before a handoff takes effect.
    #[must_use]
    pub fn announce(mut self, message: impl Into<String>) -> Self {
        self.handoff.announce = Some(message.into());
        self
    }

    /// Filters the handler uses while it owns the call.
    #[must_use]
    pub fn owner_filters(mut self, run: EventFilter, cancel: EventFilter) -> Self {
        self.handoff.run_filter = Some(run);
        self.handoff.cancel_filter = Some(cancel);
        self
    }

    #[must_use]
    pub const fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub(crate) fn call_loopback(&self, ctx: ToolContext, args: Args) -> Option<BoxFuture<Result<ToolOutput>>> {
        match &self.handler {
            Handler::Loopback(handler) => Some(handler(ctx, args)),
            Handler::Passthrough(_) | Handler::Handoff(_) => None,
        }
    }

    pub(crate) fn call_passthrough(&self, ctx: ToolContext, args: Args) -> Option<BoxFuture<Result<()>>> {
        match &self.handler {
            Handler::Passthrough(handler) => Some(handler(ctx, args)),
            Handler::Loopback(_) | Handler::Handoff(_) => None,
        }
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool").field("descriptor", &self.descriptor).finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    Pending,
    Yielding,
    Completed,
    Cancelled,
    Failed,
}

/// Bookkeeping for one tool call within a reasoning round.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub args: Value,
    state: InvocationState,
    yields: usize,
}

impl ToolInvocation {
    #[must_use]
    pub fn new(call: &ToolCallRequest) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            args: call.arguments.clone(),
            state: InvocationState::Pending,
            yields: 0,
        }
    }

    #[must_use]
    pub const fn state(&self) -> InvocationState {
        self.state
    }

    #[must_use]
    pub const fn yields(&self) -> usize {
        self.yields
    }

    #[must_use]
    pub fn called(&self) -> OutputEvent {
        OutputEvent::AgentToolCalled {
            id: self.id.clone(),
            name: self.name.clone(),
            args: self.args.clone(),
        }
    }

    /// Result event for one yield, advancing the state.
    pub fn returned(&mut self, result: Value) -> OutputEvent {
        self.yields += 1;
        self.state = InvocationState::Yielding;
        OutputEvent::AgentToolReturned {
            id: self.id.clone(),
            name: self.name.clone(),
            args: self.args.clone(),
            result,
        }
    }

    /// Error result event; also marks the invocation failed.
    pub fn failed(&mut self, error: &Error) -> OutputEvent {
        let event = self.returned(error_result(error));
        self.state = InvocationState::Failed;
        event
    }

    pub fn complete(&mut self) {
        if self.state != InvocationState::Failed {
            self.state = InvocationState::Completed;
        }
    }

    pub fn cancel(&mut self) {
        self.state = InvocationState::Cancelled;
    }
}

/// Tool failures are reported to the reasoning loop as data.
#[must_use]
pub fn error_result(error: &Error) -> Value {
    Value::String(format!("Error: {error}"))
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Tool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns an error if a tool with the same name is already registered.
    #[allow(clippy::result_large_err)]
    pub fn register(&mut self, tool: Tool) -> Result<()> {
        let name = tool.name().to_string();
        if self.index.contains_key(&name) {
            return Err(Error::InvalidConfig(format!("duplicate tool name `{name}`")));
        }
        self.index.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    /// Register a loopback tool whose arguments and result are plain Rust
    /// types. The parameter schema is derived from `TArgs`.
    ///
    /// # Errors
    /// Returns an error if a tool with the same name is already registered.
    #[allow(clippy::result_large_err)]
    pub fn loopback_typed<TArgs, TResp, F, Fut>(
        &mut self,
        name: &str,
        description: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        TArgs: DeserializeOwned + JsonSchema + Send + 'static,
        TResp: Serialize + Send + 'static,
        F: Fn(TArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TResp>> + Send + 'static,
    {
        let user_handler = Arc::new(handler);
        let tool = Tool::loopback(name, description, ParamSchema::from_type::<TArgs>(), move |_ctx, args: Args| {
            let user_handler = Arc::clone(&user_handler);
            async move {
                let args: TArgs = args.parse()?;
                let resp = user_handler(args).await?;
                ToolOutput::value(resp)
            }
        });
        self.register(tool)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|tool| tool.descriptor().definition()).collect()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.iter().map(Tool::descriptor)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tools.iter().map(Tool::name)).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::schema::Param;

    fn noop_loopback(name: &str) -> Tool {
        Tool::loopback(name, "noop", ParamSchema::new(), |_ctx, _args| async {
            Ok(ToolOutput::Value(Value::Null))
        })
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(noop_loopback("lookup")).unwrap();
        let err = registry.register(noop_loopback("lookup")).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn only_loopback_tools_run_in_background() {
        assert!(noop_loopback("slow").background().unwrap().descriptor().background);

        let passthrough = Tool::passthrough("hangup", "end", ParamSchema::new(), |_ctx, _args| async { Ok(()) });
        assert!(matches!(passthrough.background(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn definitions_carry_the_parameter_schema() {
        let mut registry = ToolRegistry::new();
        let params = ParamSchema::new().param(Param::string("account").describe("Account number"));
        registry
            .register(Tool::loopback("balance", "Look up a balance", params, |_ctx, _args| async {
                ToolOutput::value("$10")
            }))
            .unwrap();

        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "balance");
        assert_eq!(defs[0].parameters["properties"]["account"]["type"], "string");
        assert_eq!(defs[0].parameters["required"][0], "account");
    }

    #[test]
    fn invocation_tracks_yields() {
        let call = ToolCallRequest {
            id: "call_1".to_string(),
            name: "lookup".to_string(),
            arguments: serde_json::json!({}),
        };
        let mut invocation = ToolInvocation::new(&call);
        assert_eq!(invocation.state(), InvocationState::Pending);

        let first = invocation.returned(Value::from("partial"));
        invocation.returned(Value::from("done"));
        invocation.complete();

        assert_eq!(invocation.yields(), 2);
        assert_eq!(invocation.state(), InvocationState::Completed);
        assert!(matches!(first, OutputEvent::AgentToolReturned { ref id, .. } if id == "call_1"));
    }

    #[test]
    fn args_parse_typed_values() {
        #[derive(Deserialize)]
        struct Lookup {
            city: String,
            days: u32,
        }

        let mut map = Map::new();
        map.insert("city".to_string(), Value::from("Oslo"));
        map.insert("days".to_string(), Value::from(3));
        let args = Args::new(map);

        let parsed: Lookup = args.parse().unwrap();
        assert_eq!(parsed.city, "Oslo");
        assert_eq!(parsed.days, 3);
        assert_eq!(args.get::<u32>("days").unwrap(), 3);
        assert!(args.get::<u32>("missing").is_err());
    }
}
