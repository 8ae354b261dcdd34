//! Listener registry with copy-on-iterate dispatch.
//!
//! [`Subscribers::emit`] snapshots the listener list before invoking anything,
//! so a listener may subscribe or unsubscribe (itself or others) while being
//! called. Changes take effect from the next emit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Handle returned by [`Subscribers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Subscribers<T> {
    listeners: Mutex<Vec<(SubscriptionId, Listener<T>)>>,
    next_id: AtomicU64,
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(listener)));
        id
    }

    /// Returns `false` if the id was not (or no longer) registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Invoke every listener registered at the time of the call.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = self
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(value);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Listener<T>)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emit_reaches_every_listener() {
        let subs = Subscribers::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let total = Arc::clone(&total);
            subs.subscribe(move |v| {
                total.fetch_add(*v as usize, Ordering::SeqCst);
            });
        }
        subs.emit(&2);
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn unsubscribe_only_removes_target() {
        let subs = Subscribers::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h1 = Arc::clone(&hits);
        let first = subs.subscribe(move |()| {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        let h2 = Arc::clone(&hits);
        subs.subscribe(move |()| {
            h2.fetch_add(10, Ordering::SeqCst);
        });

        assert!(subs.unsubscribe(first));
        assert!(!subs.unsubscribe(first));
        subs.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn listener_can_unsubscribe_itself_during_emit() {
        let subs = Arc::new(Subscribers::<()>::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let own_id: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let subs_in = Arc::clone(&subs);
        let own_in = Arc::clone(&own_id);
        let hits_in = Arc::clone(&hits);
        let id = subs.subscribe(move |()| {
            hits_in.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *own_in.lock().unwrap() {
                subs_in.unsubscribe(id);
            }
        });
        *own_id.lock().unwrap() = Some(id);

        let hits_other = Arc::clone(&hits);
        subs.subscribe(move |()| {
            hits_other.fetch_add(100, Ordering::SeqCst);
        });

        subs.emit(&());
        // Both listeners ran from the snapshot.
        assert_eq!(hits.load(Ordering::SeqCst), 101);
        subs.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 201);
        assert_eq!(subs.len(), 1);
    }
}
