//! One-to-many delivery of owned items and borrowed observations.
//!
//! Sinks are registered by identity: attaching the same `Arc` twice is a
//! no-op, and detaching compares the data pointer only.

use std::sync::{Arc, Mutex, PoisonError};

/// Receives items by value.
pub trait Sink<T>: Send + Sync {
    fn handle(&self, item: T);
}

/// Receives items by reference, before they move on to their owner.
pub trait Observer<T>: Send + Sync {
    fn observe(&self, item: &T);
}

struct Registry<S: ?Sized> {
    entries: Mutex<Vec<Arc<S>>>,
}

impl<S: ?Sized> Registry<S> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn attach(&self, entry: Arc<S>) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.iter().any(|e| same(e, &entry)) {
            return false;
        }
        entries.push(entry);
        true
    }

    fn detach(&self, entry: &Arc<S>) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|e| !same(e, entry));
        entries.len() != before
    }

    fn snapshot(&self) -> Vec<Arc<S>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn same<S: ?Sized>(a: &Arc<S>, b: &Arc<S>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Delivers owned items to every attached [`Sink`].
pub struct Source<T> {
    sinks: Registry<dyn Sink<T>>,
}

impl<T> Source<T> {
    pub fn new() -> Self {
        Self {
            sinks: Registry::new(),
        }
    }

    /// Returns false if the sink was already attached.
    pub fn attach(&self, sink: Arc<dyn Sink<T>>) -> bool {
        self.sinks.attach(sink)
    }

    /// Returns false if the sink was not attached.
    pub fn detach(&self, sink: &Arc<dyn Sink<T>>) -> bool {
        self.sinks.detach(sink)
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Source<T> {
    /// Hands `item` to every attached sink and returns how many received it.
    ///
    /// The last sink gets the item itself, the others get clones. With no
    /// sink attached the item is dropped here. Delivery happens outside the
    /// registry lock, so sinks may attach or detach concurrently.
    pub fn forward(&self, item: T) -> usize {
        let sinks = self.sinks.snapshot();
        match sinks.split_last() {
            None => 0,
            Some((last, rest)) => {
                for sink in rest {
                    sink.handle(item.clone());
                }
                last.handle(item);
                sinks.len()
            }
        }
    }
}

impl<T> Default for Source<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Lends items to every attached [`Observer`].
pub struct Observers<T> {
    observers: Registry<dyn Observer<T>>,
}

impl<T> Observers<T> {
    pub fn new() -> Self {
        Self {
            observers: Registry::new(),
        }
    }

    pub fn attach(&self, observer: Arc<dyn Observer<T>>) -> bool {
        self.observers.attach(observer)
    }

    pub fn detach(&self, observer: &Arc<dyn Observer<T>>) -> bool {
        self.observers.detach(observer)
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&self, item: &T) -> usize {
        let observers = self.observers.snapshot();
        for observer in &observers {
            observer.observe(item);
        }
        observers.len()
    }
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<u32>>);

    impl Sink<u32> for Collect {
        fn handle(&self, item: u32) {
            self.0.lock().unwrap().push(item);
        }
    }

    impl Observer<u32> for Collect {
        fn observe(&self, item: &u32) {
            self.0.lock().unwrap().push(*item);
        }
    }

    struct Tracked {
        clones: Arc<AtomicUsize>,
        drops: Arc<AtomicUsize>,
    }

    impl Clone for Tracked {
        fn clone(&self) -> Self {
            self.clones.fetch_add(1, Ordering::SeqCst);
            Self {
                clones: self.clones.clone(),
                drops: self.drops.clone(),
            }
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Swallow;

    impl Sink<Tracked> for Swallow {
        fn handle(&self, _item: Tracked) {}
    }

    #[test]
    fn attach_is_idempotent() {
        let source = Source::<u32>::new();
        let sink: Arc<dyn Sink<u32>> = Arc::new(Collect::default());
        assert!(source.attach(sink.clone()));
        assert!(!source.attach(sink.clone()));
        assert_eq!(source.len(), 1);
        assert!(source.detach(&sink));
        assert!(!source.detach(&sink));
        assert!(source.is_empty());
    }

    #[test]
    fn forward_reaches_every_sink() {
        let source = Source::new();
        let a = Arc::new(Collect::default());
        let b = Arc::new(Collect::default());
        source.attach(a.clone());
        source.attach(b.clone());
        assert_eq!(source.forward(7), 2);
        assert_eq!(source.forward(8), 2);
        assert_eq!(*a.0.lock().unwrap(), vec![7, 8]);
        assert_eq!(*b.0.lock().unwrap(), vec![7, 8]);
    }

    #[test]
    fn forward_without_sinks_drops_item() {
        let drops = Arc::new(AtomicUsize::new(0));
        let clones = Arc::new(AtomicUsize::new(0));
        let source = Source::new();
        let item = Tracked {
            clones: clones.clone(),
            drops: drops.clone(),
        };
        assert_eq!(source.forward(item), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(clones.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn last_sink_receives_the_original() {
        let drops = Arc::new(AtomicUsize::new(0));
        let clones = Arc::new(AtomicUsize::new(0));
        let source = Source::new();
        for _ in 0..3 {
            source.attach(Arc::new(Swallow));
        }
        let item = Tracked {
            clones: clones.clone(),
            drops: drops.clone(),
        };
        assert_eq!(source.forward(item), 3);
        assert_eq!(clones.load(Ordering::SeqCst), 2);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn observers_borrow_items() {
        let observers = Observers::new();
        let seen = Arc::new(Collect::default());
        observers.attach(seen.clone());
        let value = 42;
        assert_eq!(observers.notify(&value), 1);
        assert_eq!(*seen.0.lock().unwrap(), vec![42]);
    }
}
