// Per-kind listener registry shared by bridge implementations

use super::bridge::{ListenerId, RadioEvent, RadioEventKind, RadioListener};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

type SharedListener = Arc<dyn Fn(RadioEvent) + Send + Sync>;

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<RadioEventKind, Vec<(ListenerId, SharedListener)>>>,
    next_seq: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kind: RadioEventKind, listener: RadioListener) -> ListenerId {
        let id = ListenerId::new(kind, self.next_seq.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::from(listener)));
        trace!(%kind, ?id, "listener added");
        id
    }

    /// Remove a single listener. Returns false if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(entries) = listeners.get_mut(&id.kind()) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(&id.kind());
        }
        if removed {
            trace!(?id, "listener removed");
        }
        removed
    }

    pub fn remove_all(&self, kind: RadioEventKind) {
        self.listeners.write().remove(&kind);
        trace!(%kind, "listeners removed");
    }

    pub fn count(&self, kind: RadioEventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }

    pub fn total(&self) -> usize {
        self.listeners.read().values().map(Vec::len).sum()
    }

    /// Deliver `event` to every listener of its kind. Returns the number of
    /// listeners invoked.
    pub fn emit(&self, event: RadioEvent) -> usize {
        // Snapshot first so a listener may add or remove listeners.
        let targets: Vec<SharedListener> = self
            .listeners
            .read()
            .get(&event.kind())
            .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();

        for listener in &targets {
            listener(event.clone());
        }
        targets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_reaches_only_matching_kind() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        registry.add(
            RadioEventKind::ScanStopped,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(registry.emit(RadioEvent::ScanStopped), 1);
        let other = RadioEvent::PeripheralDisconnected {
            handle: super::super::bridge::PeripheralHandle::new("AA", None),
        };
        assert_eq!(registry.emit(other), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_all() {
        let registry = ListenerRegistry::new();
        registry.add(RadioEventKind::ScanStopped, Box::new(|_| {}));
        registry.add(RadioEventKind::ScanStopped, Box::new(|_| {}));
        registry.add(RadioEventKind::PeripheralDiscovered, Box::new(|_| {}));
        assert_eq!(registry.count(RadioEventKind::ScanStopped), 2);
        assert_eq!(registry.total(), 3);

        registry.remove_all(RadioEventKind::ScanStopped);
        assert_eq!(registry.count(RadioEventKind::ScanStopped), 0);
        assert_eq!(registry.total(), 1);
    }

    #[test]
    fn test_remove_by_id_leaves_other_owners() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let mine = registry.add(RadioEventKind::ScanStopped, Box::new(|_| {}));
        let counter = hits.clone();
        let theirs = registry.add(
            RadioEventKind::ScanStopped,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_ne!(mine, theirs);

        assert!(registry.remove(mine));
        assert!(!registry.remove(mine));
        assert_eq!(registry.count(RadioEventKind::ScanStopped), 1);
        assert_eq!(registry.emit(RadioEvent::ScanStopped), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(registry.remove(theirs));
        assert_eq!(registry.total(), 0);
    }
}
