//! Named publish/subscribe bus with async handlers.
//!
//! A message type `M` fans out by channel name to an ordered set of handler
//! closures registered once at startup. [`EventBus::emit`] awaits every
//! handler for the name in registration order and propagates the first
//! failure to the publisher, so a faulty handler surfaces immediately
//! instead of being swallowed.
//!
//! Emitting on a name with zero handlers is silent at this layer; callers
//! that require at least one handler (the packet registry does) check
//! [`EventBus::listener_count`] first.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use thiserror::Error;

/// Boxed error type handlers may fail with.
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

type Handler<M> = dyn Fn(M) -> BoxFuture<'static, Result<(), DynError>> + Send + Sync;

/// Failure raised while publishing an event.
#[derive(Debug, Error)]
pub enum BusError {
    /// A registered handler returned an error.
    #[error("handler for event '{name}' failed: {source}")]
    Handler {
        /// Channel name the failing handler was registered on.
        name: String,
        /// The handler's error.
        #[source]
        source: DynError,
    },
}

/// Token identifying one registration, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Named publish/subscribe bus over messages of type `M`.
pub struct EventBus<M> {
    channels: RwLock<HashMap<String, Vec<(HandlerId, Arc<Handler<M>>)>>>,
    next_id: AtomicU64,
}

impl<M> Default for EventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> EventBus<M> {
    /// Creates a bus with no registrations.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of handlers registered for `name`.
    ///
    /// # Panics
    ///
    /// Panics if the channel lock is poisoned.
    #[must_use]
    pub fn listener_count(&self, name: &str) -> usize {
        self.channels
            .read()
            .expect("bus lock poisoned")
            .get(name)
            .map_or(0, Vec::len)
    }

    /// Removes the registration `id` from `name`.
    ///
    /// Returns `true` when a handler was actually removed.
    ///
    /// # Panics
    ///
    /// Panics if the channel lock is poisoned.
    pub fn off(&self, name: &str, id: HandlerId) -> bool {
        let mut channels = self.channels.write().expect("bus lock poisoned");
        let Some(handlers) = channels.get_mut(name) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            channels.remove(name);
        }
        removed
    }
}

impl<M: Clone + Send + 'static> EventBus<M> {
    /// Registers `handler` on the channel `name`.
    ///
    /// Handlers run in registration order on every emit and are captured
    /// once here; there is no per-dispatch rebinding.
    ///
    /// # Panics
    ///
    /// Panics if the channel lock is poisoned.
    pub fn on<F, Fut>(&self, name: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DynError>> + Send + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let boxed: Arc<Handler<M>> = Arc::new(move |message| Box::pin(handler(message)));
        self.channels
            .write()
            .expect("bus lock poisoned")
            .entry(name.into())
            .or_default()
            .push((id, boxed));
        id
    }

    /// Delivers `message` to every handler registered for `name`, awaiting
    /// each in turn.
    ///
    /// The first handler failure stops delivery and propagates to the
    /// publisher. Zero registered handlers is a silent success.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Handler`] carrying the first failing handler's
    /// error.
    ///
    /// # Panics
    ///
    /// Panics if the channel lock is poisoned.
    pub async fn emit(&self, name: &str, message: M) -> Result<(), BusError> {
        let handlers: Vec<Arc<Handler<M>>> = self
            .channels
            .read()
            .expect("bus lock poisoned")
            .get(name)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in handlers {
            handler(message.clone())
                .await
                .map_err(|source| BusError::Handler {
                    name: name.to_string(),
                    source,
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let bus = EventBus::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            bus.on("tick", move |value: u32| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push((tag, value));
                    Ok(())
                }
            });
        }

        bus.emit("tick", 9).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![("first", 9), ("second", 9)]);
    }

    #[tokio::test]
    async fn emit_with_no_handlers_is_silent() {
        let bus = EventBus::<u32>::new();
        assert_eq!(bus.listener_count("missing"), 0);
        bus.emit("missing", 1).await.unwrap();
    }

    #[tokio::test]
    async fn first_failure_propagates_to_publisher() {
        let bus = EventBus::<u32>::new();
        let reached = Arc::new(Mutex::new(false));

        bus.on("tick", |_| async {
            Err::<(), DynError>("handler exploded".into())
        });
        {
            let reached = Arc::clone(&reached);
            bus.on("tick", move |_| {
                let reached = Arc::clone(&reached);
                async move {
                    *reached.lock().unwrap() = true;
                    Ok(())
                }
            });
        }

        let err = bus.emit("tick", 1).await.unwrap_err();
        assert!(err.to_string().contains("handler for event 'tick' failed"));
        // Delivery stops at the first failure.
        assert!(!*reached.lock().unwrap());
    }

    #[tokio::test]
    async fn off_removes_a_single_registration() {
        let bus = EventBus::<u32>::new();
        let first = bus.on("tick", |_| async { Ok(()) });
        let _second = bus.on("tick", |_| async { Ok(()) });

        assert_eq!(bus.listener_count("tick"), 2);
        assert!(bus.off("tick", first));
        assert_eq!(bus.listener_count("tick"), 1);
        assert!(!bus.off("tick", first));
    }
}
