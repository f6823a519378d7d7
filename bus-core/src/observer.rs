// bus-core/src/observer.rs

//! Observer registration and notification.
//!
//! Observers are the hand-off point from the bus to application logic: each
//! received message is delivered once to every registered observer, in
//! registration order, synchronously from the dispatch-loop task. Observers
//! must not block indefinitely or they stall all subsequent delivery on this
//! process.

use std::sync::{Arc, RwLock};

use crate::error::{BoxError, BusError, Result};
use crate::message::Message;

/// Application-supplied callback invoked once per received message.
pub trait Observer: Send + Sync {
    /// Handles one message. An error aborts delivery of this message to any
    /// observers registered after this one; the dispatch loop logs it and
    /// moves on to the next queued message.
    fn receive(&self, msg_type: &str, message: &Message) -> std::result::Result<(), BoxError>;

    /// Name used in logs and error reports.
    fn name(&self) -> &str {
        "observer"
    }
}

/// Ordered sequence of observers. Identity is `Arc` pointer equality; no
/// duplicate detection is performed.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: RwLock<Vec<Arc<dyn Observer>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: Arc<dyn Observer>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Removes the first registration of `observer`, if present.
    pub fn remove(&self, observer: &Arc<dyn Observer>) {
        let mut observers = self.observers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = observers.iter().position(|o| Arc::ptr_eq(o, observer)) {
            observers.remove(pos);
        }
    }

    pub fn len(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `message` to every observer registered at the moment of the
    /// call, in order.
    ///
    /// The sequence is snapshotted first, so observers may register or
    /// unregister themselves from inside the callback without affecting this
    /// delivery.
    pub fn notify(&self, message: &Message) -> Result<()> {
        let snapshot: Vec<_> = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for observer in snapshot {
            observer
                .receive(message.msg_type(), message)
                .map_err(|e| BusError::observer(observer.name(), e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Recording {
        label: &'static str,
        seen: Mutex<Vec<String>>,
    }

    impl Recording {
        fn new(label: &'static str) -> Arc<Self> {
            Arc::new(Self {
                label,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Observer for Recording {
        fn receive(&self, msg_type: &str, _message: &Message) -> std::result::Result<(), BoxError> {
            self.seen.lock().unwrap().push(msg_type.to_string());
            Ok(())
        }

        fn name(&self) -> &str {
            self.label
        }
    }

    struct Failing;

    impl Observer for Failing {
        fn receive(&self, _msg_type: &str, _message: &Message) -> std::result::Result<(), BoxError> {
            Err("boom".into())
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn ping() -> Message {
        Message::new("ping", 0, 1)
    }

    #[test]
    fn test_notify_in_registration_order() {
        let registry = ObserverRegistry::new();
        let first = Recording::new("first");
        let second = Recording::new("second");
        registry.add(first.clone());
        registry.add(second.clone());

        registry.notify(&ping()).unwrap();

        assert_eq!(first.seen(), vec!["ping"]);
        assert_eq!(second.seen(), vec!["ping"]);
    }

    #[test]
    fn test_error_aborts_later_observers() {
        let registry = ObserverRegistry::new();
        let before = Recording::new("before");
        let after = Recording::new("after");
        registry.add(before.clone());
        registry.add(Arc::new(Failing));
        registry.add(after.clone());

        let err = registry.notify(&ping()).unwrap_err();
        assert!(matches!(err, BusError::Observer { .. }));
        assert!(err.to_string().contains("failing"));

        assert_eq!(before.seen(), vec!["ping"]);
        assert!(after.seen().is_empty());
    }

    #[test]
    fn test_remove_by_identity() {
        let registry = ObserverRegistry::new();
        let observer = Recording::new("only");
        registry.add(observer.clone());
        assert_eq!(registry.len(), 1);

        let as_dyn: Arc<dyn Observer> = observer.clone();
        registry.remove(&as_dyn);
        assert!(registry.is_empty());

        registry.notify(&ping()).unwrap();
        assert!(observer.seen().is_empty());
    }

    #[test]
    fn test_observer_may_unregister_itself_mid_notify() {
        struct SelfRemoving {
            registry: Arc<ObserverRegistry>,
            me: Mutex<Option<Arc<dyn Observer>>>,
            calls: AtomicUsize,
        }

        impl Observer for SelfRemoving {
            fn receive(
                &self,
                _msg_type: &str,
                _message: &Message,
            ) -> std::result::Result<(), BoxError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(me) = self.me.lock().unwrap().take() {
                    self.registry.remove(&me);
                }
                Ok(())
            }
        }

        let registry = Arc::new(ObserverRegistry::new());
        let observer = Arc::new(SelfRemoving {
            registry: registry.clone(),
            me: Mutex::new(None),
            calls: AtomicUsize::new(0),
        });
        *observer.me.lock().unwrap() = Some(observer.clone());
        registry.add(observer.clone());

        registry.notify(&ping()).unwrap();
        registry.notify(&ping()).unwrap();

        // Delivered once, then gone.
        assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }
}
