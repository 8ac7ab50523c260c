//! Handler registration slots
//!
//! Each notification source (store changes, state manager changes,
//! transaction commits) holds at most one registered handler. A registration
//! carries an optional cleanup callback that runs exactly once, when the
//! registration is replaced, cleared, or the slot is dropped.

use parking_lot::RwLock;
use std::sync::Arc;

/// Cleanup callback run when a registration is torn down
pub type Cleanup = Box<dyn FnOnce() + Send + Sync>;

struct Registration<T: ?Sized> {
    handler: Arc<T>,
    cleanup: Option<Cleanup>,
}

impl<T: ?Sized> Drop for Registration<T> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

/// Single-handler registration point
pub struct HandlerSlot<T: ?Sized> {
    current: RwLock<Option<Registration<T>>>,
}

impl<T: ?Sized> Default for HandlerSlot<T> {
    fn default() -> Self {
        HandlerSlot {
            current: RwLock::new(None),
        }
    }
}

impl<T: ?Sized> HandlerSlot<T> {
    /// Empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`, tearing down any previous registration
    pub fn set(&self, handler: Arc<T>, cleanup: Option<Cleanup>) {
        let previous = self.current.write().replace(Registration { handler, cleanup });
        // Previous cleanup runs outside the lock.
        drop(previous);
    }

    /// Remove the current registration, running its cleanup
    pub fn clear(&self) {
        let previous = self.current.write().take();
        drop(previous);
    }

    /// The registered handler, if any
    pub fn get(&self) -> Option<Arc<T>> {
        self.current
            .read()
            .as_ref()
            .map(|registration| Arc::clone(&registration.handler))
    }

    /// Whether a handler is registered
    pub fn is_set(&self) -> bool {
        self.current.read().is_some()
    }
}

impl<T: ?Sized> std::fmt::Debug for HandlerSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSlot")
            .field("registered", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    trait Greeter: Send + Sync {
        fn greet(&self) -> &'static str;
    }

    struct Hello;
    impl Greeter for Hello {
        fn greet(&self) -> &'static str {
            "hello"
        }
    }

    fn counting_cleanup(counter: &Arc<AtomicUsize>) -> Option<Cleanup> {
        let counter = Arc::clone(counter);
        Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_get_returns_registered_handler() {
        let slot: HandlerSlot<dyn Greeter> = HandlerSlot::new();
        assert!(slot.get().is_none());
        slot.set(Arc::new(Hello), None);
        assert_eq!(slot.get().unwrap().greet(), "hello");
    }

    #[test]
    fn test_cleanup_runs_once_on_replace() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let slot: HandlerSlot<dyn Greeter> = HandlerSlot::new();

        slot.set(Arc::new(Hello), counting_cleanup(&first));
        slot.set(Arc::new(Hello), counting_cleanup(&second));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        slot.clear();
        slot.clear();
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(!slot.is_set());
    }

    #[test]
    fn test_cleanup_runs_on_drop() {
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let slot: HandlerSlot<dyn Greeter> = HandlerSlot::new();
            slot.set(Arc::new(Hello), counting_cleanup(&calls));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
