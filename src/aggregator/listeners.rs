//! Callback listeners for the adapter surface (`add_listener` /
//! `remove_all_listeners`). Channel consumers should prefer
//! [`super::ActivityAggregator::subscribe`].

use crate::types::ActivitySnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Step,
    Distance,
    Snapshot,
    Flush,
    Recording,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrackerEvent {
    Step { steps: u64 },
    Distance { distance_km: f64, delta_km: f64 },
    Snapshot(ActivitySnapshot),
    Flush { snapshot: ActivitySnapshot, recorded_at: DateTime<Utc> },
    Recording { active: bool },
}

impl TrackerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TrackerEvent::Step { .. } => EventKind::Step,
            TrackerEvent::Distance { .. } => EventKind::Distance,
            TrackerEvent::Snapshot(_) => EventKind::Snapshot,
            TrackerEvent::Flush { .. } => EventKind::Flush,
            TrackerEvent::Recording { .. } => EventKind::Recording,
        }
    }
}

pub type ListenerHandle = u64;
pub type Listener = Arc<dyn Fn(&TrackerEvent) + Send + Sync>;

#[derive(Default)]
pub struct ListenerRegistry {
    next: AtomicU64,
    entries: Mutex<Vec<(ListenerHandle, EventKind, Listener)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kind: EventKind, listener: Listener) -> ListenerHandle {
        let handle = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((handle, kind, listener));
        }
        handle
    }

    pub fn remove(&self, handle: ListenerHandle) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(h, _, _)| *h != handle);
        entries.len() != before
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls outside the registry lock, so a listener may add or remove
    /// listeners itself.
    pub fn emit(&self, event: &TrackerEvent) {
        let kind = event.kind();
        let matching: Vec<Listener> = match self.entries.lock() {
            Ok(entries) => entries
                .iter()
                .filter(|(_, k, _)| *k == kind)
                .map(|(_, _, l)| l.clone())
                .collect(),
            Err(_) => return,
        };
        for listener in matching {
            listener(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_emit_reaches_matching_kind_only() {
        let registry = ListenerRegistry::new();
        let steps = Arc::new(AtomicU32::new(0));
        let counter = steps.clone();
        registry.add(
            EventKind::Step,
            Arc::new(move |_: &TrackerEvent| {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
        );

        registry.emit(&TrackerEvent::Step { steps: 1 });
        registry.emit(&TrackerEvent::Recording { active: true });
        assert_eq!(steps.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let registry = ListenerRegistry::new();
        let a = registry.add(EventKind::Flush, Arc::new(|_: &TrackerEvent| {}));
        registry.add(EventKind::Step, Arc::new(|_: &TrackerEvent| {}));
        assert!(registry.remove(a));
        assert!(!registry.remove(a));
        assert_eq!(registry.len(), 1);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_listener_may_unregister_itself() {
        let registry = Arc::new(ListenerRegistry::new());
        let inner = registry.clone();
        registry.add(EventKind::Step, Arc::new(move |_: &TrackerEvent| inner.clear()));
        registry.emit(&TrackerEvent::Step { steps: 1 });
        assert!(registry.is_empty());
    }
}
