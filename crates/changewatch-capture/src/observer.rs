//! Audit record observers and their registry.

use std::sync::{Arc, PoisonError, RwLock};

use changewatch_core::AuditRecord;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Receives every audit record after it has been persisted.
///
/// Observers run synchronously on the feed task of the record's
/// collection, so `on_record` should return quickly. For heavy work use a
/// [`ChannelObserver`] and process records elsewhere.
pub trait AuditObserver: Send + Sync {
    /// Called once per persisted record.
    fn on_record(&self, record: &AuditRecord);

    /// Optional name for debugging.
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "anonymous"
    }
}

/// Registration handle for an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(Uuid);

impl ObserverId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Observers in registration order.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: RwLock<Vec<(ObserverId, Arc<dyn AuditObserver>)>>,
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observer_count", &self.len())
            .finish()
    }
}

impl ObserverRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Returns a handle for [`Self::unregister`].
    pub fn register(&self, observer: Arc<dyn AuditObserver>) -> ObserverId {
        let id = ObserverId::new();
        let name = observer.name().to_owned();
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        debug!(observer_name = %name, "Observer registered");
        id
    }

    /// Unregister an observer. Returns `true` if it was registered.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        let removed = observers.len() != before;
        if removed {
            debug!("Observer unregistered");
        }
        removed
    }

    /// Deliver `record` to every observer in registration order.
    ///
    /// A panicking observer is logged and skipped; the others still
    /// receive the record.
    pub fn notify(&self, record: &AuditRecord) {
        let observers: Vec<_> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (id, observer) in &observers {
            trace!(
                observer_name = %observer.name(),
                collection = %record.collection,
                "Notifying observer"
            );
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                observer.on_record(record);
            }));
            if let Err(e) = result {
                warn!(
                    observer_id = ?id,
                    observer_name = %observer.name(),
                    error = ?e,
                    "Observer panicked"
                );
            }
        }
    }

    /// Number of registered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no observers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An observer backed by a closure.
pub struct FnObserver<F>
where
    F: Fn(&AuditRecord) + Send + Sync,
{
    name: String,
    handler: F,
}

impl<F> FnObserver<F>
where
    F: Fn(&AuditRecord) + Send + Sync,
{
    /// Create a named closure observer.
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

impl<F> AuditObserver for FnObserver<F>
where
    F: Fn(&AuditRecord) + Send + Sync,
{
    fn on_record(&self, record: &AuditRecord) {
        (self.handler)(record);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// An observer that forwards records to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<AuditRecord>,
}

impl ChannelObserver {
    /// Create an observer and the receiver it feeds.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AuditRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AuditObserver for ChannelObserver {
    fn on_record(&self, record: &AuditRecord) {
        if self.tx.send(record.clone()).is_err() {
            trace!("Channel observer receiver dropped");
        }
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "channel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changewatch_core::OperationKind;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;

    fn record(id: i64) -> AuditRecord {
        AuditRecord {
            collection: "orders".into(),
            document_id: json!(id),
            operation: OperationKind::Insert,
            timestamp: Utc::now(),
            before: None,
            after: None,
            transform_error: None,
        }
    }

    #[test]
    fn test_notify_in_registration_order() {
        let registry = ObserverRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            registry.register(Arc::new(FnObserver::new(name, move |_: &AuditRecord| {
                seen.lock().unwrap().push(name);
            })));
        }

        registry.notify(&record(1));
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unregister() {
        let registry = ObserverRegistry::new();
        let (observer, _rx) = ChannelObserver::channel();
        let id = registry.register(Arc::new(observer));
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let registry = ObserverRegistry::new();
        registry.register(Arc::new(FnObserver::new("bad", |_: &AuditRecord| {
            panic!("observer failure");
        })));
        let (observer, mut rx) = ChannelObserver::channel();
        registry.register(Arc::new(observer));

        registry.notify(&record(7));
        assert_eq!(rx.try_recv().unwrap().document_id, json!(7));
    }

    #[test]
    fn test_channel_observer_survives_dropped_receiver() {
        let (observer, rx) = ChannelObserver::channel();
        drop(rx);
        observer.on_record(&record(1));
    }
}
