//! Synchronous multicast used for kernel event streams and transport receivers.

use std::sync::{Arc, Mutex, Weak};

use crate::lock;

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Observers<T> {
    next_id: u64,
    entries: Vec<(u64, Observer<T>)>,
}

/// Fan-out point: every value passed to [`Subject::next`] is delivered to all current
/// observers, in subscription order, before `next` returns.
pub struct Subject<T> {
    observers: Arc<Mutex<Observers<T>>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            observers: self.observers.clone(),
        }
    }
}

impl<T: 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Subject<T> {
    pub fn new() -> Self {
        Self {
            observers: Arc::new(Mutex::new(Observers {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self, observer: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        self.subscribe_shared(Arc::new(observer))
    }

    pub fn subscribe_shared(&self, observer: Arc<dyn Fn(&T) + Send + Sync>) -> Subscription {
        let id = {
            let mut observers = lock(&self.observers);
            let id = observers.next_id;
            observers.next_id += 1;
            observers.entries.push((id, observer));
            id
        };
        let weak: Weak<Mutex<Observers<T>>> = Arc::downgrade(&self.observers);
        Subscription::new(move || {
            if let Some(observers) = weak.upgrade() {
                lock(&observers).entries.retain(|(entry, _)| *entry != id);
            }
        })
    }

    /// Delivers `value` to a snapshot of the observers. No lock is held while
    /// observers run, so they may subscribe, unsubscribe or publish re-entrantly.
    pub fn next(&self, value: &T) {
        let snapshot: Vec<Observer<T>> = lock(&self.observers)
            .entries
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in snapshot {
            observer(value);
        }
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.observers).entries.len()
    }
}

/// Handle returned by `subscribe`; the observer is removed when this is dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dropping_subscription_stops_delivery() {
        let subject = Subject::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let subscription = subject.subscribe(move |value| {
            counter.fetch_add(*value as usize, Ordering::SeqCst);
        });
        subject.next(&2);
        drop(subscription);
        subject.next(&5);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(subject.observer_count(), 0);
    }

    #[test]
    fn observers_may_publish_reentrantly() {
        let subject = Subject::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let inner = subject.clone();
        let log = seen.clone();
        let _subscription = subject.subscribe(move |value| {
            lock(&log).push(*value);
            if *value == 1 {
                inner.next(&2);
            }
        });
        subject.next(&1);
        assert_eq!(*lock(&seen), vec![1, 2]);
    }
}
