//! Append-only, totally ordered per-call event history.

use super::events::Event;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Shared handle to a call's history. Cloning shares the same log.
///
/// All appends go through one mutex, which is the call's single
/// serialization point for history mutation.
#[derive(Clone, Default)]
pub struct History {
    entries: Arc<Mutex<Vec<Event>>>,
}

impl History {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, returning its sequence number.
    pub async fn append(&self, event: Event) -> usize {
        self.lock().await.push(event)
    }

    pub async fn snapshot(&self) -> HistorySnapshot {
        self.lock().await.snapshot()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub(crate) async fn lock(&self) -> HistoryGuard<'_> {
        HistoryGuard { entries: self.entries.lock().await }
    }
}

/// Exclusive access to the history. Only appends are possible.
pub(crate) struct HistoryGuard<'a> {
    entries: MutexGuard<'a, Vec<Event>>,
}

impl HistoryGuard<'_> {
    pub(crate) fn push(&mut self, event: Event) -> usize {
        self.entries.push(event);
        self.entries.len() - 1
    }

    pub(crate) fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot(Arc::from(self.entries.as_slice()))
    }
}

/// Immutable view of the history at one instant.
#[derive(Debug, Clone)]
pub struct HistorySnapshot(Arc<[Event]>);

impl HistorySnapshot {
    #[must_use]
    pub fn empty() -> Self {
        Self(Arc::from(Vec::new()))
    }

    /// Whether `self` is a prefix of `later`.
    #[must_use]
    pub fn is_prefix_of(&self, later: &Self) -> bool {
        later.0.len() >= self.0.len() && later.0[..self.0.len()] == self.0[..]
    }

    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.0
    }
}

impl Deref for HistorySnapshot {
    type Target = [Event];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<Event>> for HistorySnapshot {
    fn from(events: Vec<Event>) -> Self {
        Self(Arc::from(events))
    }
}
