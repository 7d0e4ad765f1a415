use super::agent::Agent;
use super::call::{CallContext, CallRequest, PreCallDecision};
use super::tools::BoxFuture;
use crate::Result;
use std::future::Future;
use std::sync::Arc;

pub type GetAgentHandler = Box<dyn Fn(CallContext) -> BoxFuture<Result<Arc<dyn Agent>>> + Send + Sync>;
pub type PreCallHandler = Box<dyn Fn(CallRequest) -> BoxFuture<Result<PreCallDecision>> + Send + Sync>;

/// Application hooks consulted when a call arrives.
#[derive(Default)]
pub struct CallHandlers {
    pub get_agent: Option<GetAgentHandler>,
    pub pre_call: Option<PreCallHandler>,
}

impl CallHandlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the root agent for an accepted call. Invoked once per call,
    /// before any event is processed.
    #[must_use]
    pub fn get_agent<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Agent>>> + Send + 'static,
    {
        self.get_agent = Some(Box::new(move |ctx| Box::pin(handler(ctx))));
        self
    }

    /// Accept or reject a call before any agent exists.
    #[must_use]
    pub fn pre_call<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(CallRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PreCallDecision>> + Send + 'static,
    {
        self.pre_call = Some(Box::new(move |request| Box::pin(handler(request))));
        self
    }
}
