use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::parser::{FinalSizes, ProgressSample};

/// The closed set of notification kinds a run can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    Progress,
    Writing,
    Done,
    Error,
    Exit,
}

/// A progress sample enriched with derived run context.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub sample: ProgressSample,
    pub duration_seconds: Option<f64>,
    /// Derived, never read from the tool; 0 when the duration is unknown
    pub percent: f64,
    pub output_index: usize,
    pub file: Option<String>,
}

/// "Now writing file X" notification.
#[derive(Debug, Clone)]
pub struct WritingInfo {
    pub file: String,
    pub output_index: usize,
}

/// Completion descriptor for one output index.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Absent when the output is handle/stdout-backed or a segment pattern
    pub file: Option<String>,
    pub sizes: Option<FinalSizes>,
    pub output_index: usize,
}

/// Typed event payloads, one variant per `EventKind`.
#[derive(Debug, Clone)]
pub enum TranscodeEvent {
    Start { args: Vec<String> },
    Progress(ProgressEvent),
    Writing(Vec<WritingInfo>),
    Done(Vec<RunOutput>),
    Error { message: String },
    Exit { code: Option<i32>, error: Option<String> },
}

impl TranscodeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TranscodeEvent::Start { .. } => EventKind::Start,
            TranscodeEvent::Progress(_) => EventKind::Progress,
            TranscodeEvent::Writing(_) => EventKind::Writing,
            TranscodeEvent::Done(_) => EventKind::Done,
            TranscodeEvent::Error { .. } => EventKind::Error,
            TranscodeEvent::Exit { .. } => EventKind::Exit,
        }
    }
}

type Handler = Arc<dyn Fn(&TranscodeEvent) + Send + Sync + 'static>;

/// Token returned by `subscribe`, used to detach the handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Explicit publish-subscribe registry keyed by event kind. Handlers run on
/// whichever task emits, so they must be short and must not block.
pub struct EventBus {
    inner: Mutex<BusInner>,
}

struct BusInner {
    next_id: u64,
    listeners: HashMap<EventKind, Vec<(ListenerId, Handler)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner {
                next_id: 0,
                listeners: HashMap::new(),
            }),
        }
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&TranscodeEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner
            .listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Detach a handler. Returns false when the id is unknown (already
    /// removed, or from another bus).
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        for handlers in inner.listeners.values_mut() {
            if let Some(position) = handlers.iter().position(|(entry, _)| *entry == id) {
                handlers.remove(position);
                return true;
            }
        }
        false
    }

    pub fn has_listeners(&self, kind: EventKind) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .listeners
            .get(&kind)
            .is_some_and(|handlers| !handlers.is_empty())
    }

    /// Deliver an event to every handler registered for its kind. The
    /// handler list is snapshotted first so a handler may subscribe or
    /// unsubscribe without deadlocking.
    pub fn emit(&self, event: &TranscodeEvent) {
        let handlers: Vec<Handler> = {
            let inner = self.inner.lock().unwrap();
            inner
                .listeners
                .get(&event.kind())
                .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
