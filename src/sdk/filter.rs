use super::events::{Event, EventKind};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Predicate over events selecting which ones start processing (run filter)
/// or interrupt in-flight work (cancel filter).
#[derive(Clone)]
pub enum EventFilter {
    Kinds(HashSet<EventKind>),
    Custom(Predicate),
}

impl EventFilter {
    #[must_use]
    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self::Kinds(kinds.into_iter().collect())
    }

    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(predicate))
    }

    #[must_use]
    pub fn never() -> Self {
        Self::Kinds(HashSet::new())
    }

    /// `CallStarted`, `UserTurnEnded` and `CallEnded`.
    #[must_use]
    pub fn default_run() -> Self {
        Self::kinds([EventKind::CallStarted, EventKind::UserTurnEnded, EventKind::CallEnded])
    }

    /// `UserTurnStarted`.
    #[must_use]
    pub fn default_cancel() -> Self {
        Self::kinds([EventKind::UserTurnStarted])
    }

    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::Kinds(kinds) => kinds.contains(&event.kind()),
            Self::Custom(predicate) => predicate(event),
        }
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kinds(kinds) => f.debug_tuple("Kinds").field(kinds).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
