//! Supervision of background tool invocations.
//!
//! Background work is owned by the call, not by the unit that started it:
//! interrupting a turn leaves it running, ending the call stops it.

use super::emitter::Emitter;
use super::events::Event;
use super::tools::{ToolContext, ToolInvocation, YieldStream, error_result};
use crate::Error;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Clone)]
pub struct BackgroundSupervisor {
    tracker: TaskTracker,
    shutdown: CancellationToken,
    emitter: Emitter,
    triggers: mpsc::UnboundedSender<Event>,
}

impl BackgroundSupervisor {
    /// `emitter` is re-scoped to this supervisor's shutdown token; every
    /// recorded yield is also forwarded on `triggers`.
    pub(crate) fn new(emitter: &Emitter, triggers: mpsc::UnboundedSender<Event>) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            tracker: TaskTracker::new(),
            emitter: emitter.with_cancel(shutdown.clone()),
            shutdown,
            triggers,
        }
    }

    /// Token cancelled when the call ends. Background tool contexts run
    /// under it instead of the unit's token.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run `work` to completion off the turn path. Each yielded value is
    /// appended as a tool result and then delivered to the engine as a
    /// trigger, both under the history lock, so triggers arrive in the order
    /// history records them.
    pub(crate) fn spawn<F>(&self, ctx: ToolContext, mut invocation: ToolInvocation, work: F)
    where
        F: std::future::Future<Output = crate::Result<YieldStream>> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            tracing::debug!(tool = %invocation.name, "call ended, background tool not started");
            return;
        }
        let shutdown = self.shutdown.clone();
        let emitter = self.emitter.clone();
        let triggers = self.triggers.clone();
        let call_id = ctx.call_id().clone();

        self.tracker.spawn(async move {
            tracing::debug!(call_id = %call_id, tool = %invocation.name, "background tool started");
            let mut stream = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    invocation.cancel();
                    return;
                }
                result = work => match result {
                    Ok(stream) => stream,
                    Err(err) => {
                        tracing::warn!(tool = %invocation.name, error = %err, "background tool failed");
                        let event = invocation.failed(&err);
                        let _ = emitter.emit_with(event, |event| { let _ = triggers.send(event.clone()); }).await;
                        return;
                    }
                },
            };
            loop {
                let next = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => {
                        invocation.cancel();
                        break;
                    }
                    next = stream.next() => next,
                };
                let event = match next {
                    Some(Ok(value)) => invocation.returned(value),
                    Some(Err(err)) => {
                        tracing::warn!(tool = %invocation.name, error = %err, "background tool yield failed");
                        invocation.returned(error_result(&err))
                    }
                    None => {
                        invocation.complete();
                        break;
                    }
                };
                let delivered = emitter
                    .emit_with(event, |event| {
                        if triggers.send(event.clone()).is_err() {
                            tracing::debug!("engine gone, background yield recorded only");
                        }
                    })
                    .await;
                if let Err(Error::Cancelled) = delivered {
                    invocation.cancel();
                    break;
                }
            }
            tracing::debug!(
                call_id = %call_id,
                tool = %invocation.name,
                yields = invocation.yields(),
                state = ?invocation.state(),
                "background tool finished"
            );
        });
    }

    /// Stop all background work and wait for it to unwind. Results already
    /// recorded stay in history.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
