//! Publish/subscribe plumbing between pipeline stages.
//!
//! A [`Source`] owns an ordered list of callbacks. Pushing an item runs every
//! callback in subscription order on the pushing thread; the item is only
//! borrowed for the duration of the call. Subscribing returns a
//! [`Subscription`] token which detaches the callback when dropped.

use std::sync::{Arc, Mutex, Weak};

use crate::error::{Result, lock};
use crate::stream::{Stream, StreamDescriptor};

type Callback<T> = dyn Fn(&T, &Arc<StreamDescriptor>) -> Result<()> + Send + Sync;

struct Registry<C: ?Sized> {
    next_id: u64,
    callbacks: Vec<(u64, Arc<C>)>,
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

impl<C: ?Sized + Send + Sync> Detach for Mutex<Registry<C>> {
    fn detach(&self, id: u64) {
        lock(self).callbacks.retain(|(cb_id, _)| *cb_id != id);
    }
}

/// Ordered list of callbacks of any shape, shared by every fan-out point in
/// the crate.
pub(crate) struct Handlers<C: ?Sized> {
    registry: Arc<Mutex<Registry<C>>>,
}

impl<C: ?Sized> Clone for Handlers<C> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<C: ?Sized + Send + Sync + 'static> Handlers<C> {
    pub(crate) fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                callbacks: Vec::new(),
            })),
        }
    }

    pub(crate) fn add(&self, callback: Arc<C>) -> Subscription {
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.callbacks.push((id, callback));
        let weak: Weak<Mutex<Registry<C>>> = Arc::downgrade(&self.registry);
        Subscription {
            id,
            registry: Some(weak),
        }
    }

    /// Current callbacks, in subscription order. Taken under the lock and
    /// released before any of them runs, so callbacks may subscribe or
    /// unsubscribe without deadlocking.
    pub(crate) fn snapshot(&self) -> Vec<Arc<C>> {
        lock(&self.registry)
            .callbacks
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.registry).callbacks.len()
    }
}

/// Fan-out point for items of type `T`. Cloning shares the subscriber list.
pub struct Source<T> {
    handlers: Handlers<Callback<T>>,
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<T: 'static> Default for Source<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Source<T> {
    pub fn new() -> Self {
        Self {
            handlers: Handlers::new(),
        }
    }

    /// Registers a callback. Duplicate registrations are not detected.
    #[must_use = "dropping the subscription detaches the callback"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T, &Arc<StreamDescriptor>) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.add(Arc::new(callback))
    }

    /// Delivers `item` to every subscriber in order and stops at the first
    /// failure.
    pub fn forward(&self, item: &T, stream: &Arc<StreamDescriptor>) -> Result<()> {
        for callback in self.handlers.snapshot() {
            callback(item, stream)?;
        }
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

/// Token for one registered callback. Detaches on drop.
#[must_use = "dropping the subscription detaches the callback"]
pub struct Subscription {
    id: u64,
    registry: Option<Weak<dyn Detach>>,
}

impl Subscription {
    /// Detaches the callback. Calling it again is a no-op.
    pub fn unsubscribe(&mut self) {
        if let Some(registry) = self.registry.take().and_then(|weak| weak.upgrade()) {
            registry.detach(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.registry
            .as_ref()
            .is_some_and(|weak| weak.strong_count() > 0)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// A stage that consumes items pushed by an upstream source.
pub trait Sink<T>: Send {
    /// Handles one item. The item is only valid for the duration of the call.
    fn process(&mut self, item: &T, stream: &Arc<StreamDescriptor>) -> Result<()>;

    /// Runs once per subscription, before any item can be delivered.
    fn on_subscribe(&mut self, _stream: &Arc<StreamDescriptor>) -> Result<()> {
        Ok(())
    }
}

/// Owns a sink together with its upstream subscriptions.
///
/// Dropping the handle drops the sink and detaches it from every source.
pub struct SinkHandle<S> {
    sink: Arc<Mutex<S>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl<S: Send + 'static> SinkHandle<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Subscribes the sink to a stream, running its subscribe hook first.
    pub fn subscribe<T: 'static>(&self, stream: &Stream<T>) -> Result<()>
    where
        S: Sink<T>,
    {
        lock(&self.sink).on_subscribe(stream.descriptor())?;
        let weak = Arc::downgrade(&self.sink);
        let subscription = stream.source().subscribe(move |item, descriptor| {
            match weak.upgrade() {
                Some(sink) => lock(&sink).process(item, descriptor),
                None => Ok(()),
            }
        });
        lock(&self.subscriptions).push(subscription);
        Ok(())
    }

    /// Detaches from every upstream source. Safe to call repeatedly.
    pub fn unsubscribe(&self) {
        lock(&self.subscriptions).clear();
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    /// Runs `f` with exclusive access to the sink.
    pub fn with<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut lock(&self.sink))
    }
}

impl<S> Drop for SinkHandle<S> {
    fn drop(&mut self) {
        lock(&self.subscriptions).clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::codec::{CodecParameters, Rational};
    use crate::packet::Packet;

    fn descriptor() -> Arc<StreamDescriptor> {
        Arc::new(StreamDescriptor::new(
            0,
            "test",
            Some(CodecParameters::video(27, 64, 64)),
            Rational::new(1, 90_000),
        ))
    }

    #[test]
    fn test_callbacks_fire_in_subscription_order() {
        let source = Source::<Packet>::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = {
            let order = order.clone();
            source.subscribe(move |_, _| {
                order.lock().unwrap().push("first");
                Ok(())
            })
        };
        let second = {
            let order = order.clone();
            source.subscribe(move |_, _| {
                order.lock().unwrap().push("second");
                Ok(())
            })
        };

        source.forward(&Packet::empty(), &descriptor()).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        drop((first, second));
    }

    #[test]
    fn test_unsubscribe_is_idempotent_and_drop_detaches() {
        let source = Source::<Packet>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let mut sub = {
            let count = count.clone();
            source.subscribe(move |_, _| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let other = source.subscribe(|_, _| Ok(()));
        assert_eq!(source.subscriber_count(), 2);

        source.forward(&Packet::empty(), &descriptor()).unwrap();
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        source.forward(&Packet::empty(), &descriptor()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        drop(other);
        assert_eq!(source.subscriber_count(), 0);
    }

    #[test]
    fn test_forward_stops_at_first_error() {
        let source = Source::<Packet>::new();
        let reached = Arc::new(AtomicUsize::new(0));
        let _failing = source.subscribe(|_, _| Err(crate::Error::config("boom")));
        let _after = {
            let reached = reached.clone();
            source.subscribe(move |_, _| {
                reached.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let err = source.forward(&Packet::empty(), &descriptor()).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callback_may_unsubscribe_during_delivery() {
        let source = Source::<Packet>::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let sub = {
            let slot = slot.clone();
            source.subscribe(move |_, _| {
                if let Some(mut sub) = slot.lock().unwrap().take() {
                    sub.unsubscribe();
                }
                Ok(())
            })
        };
        *slot.lock().unwrap() = Some(sub);
        source.forward(&Packet::empty(), &descriptor()).unwrap();
        assert_eq!(source.subscriber_count(), 0);
    }

    struct Counting {
        seen: Vec<Option<i64>>,
        hooked: usize,
    }

    impl Sink<Packet> for Counting {
        fn process(&mut self, item: &Packet, _stream: &Arc<StreamDescriptor>) -> Result<()> {
            self.seen.push(item.pts());
            Ok(())
        }

        fn on_subscribe(&mut self, _stream: &Arc<StreamDescriptor>) -> Result<()> {
            self.hooked += 1;
            Ok(())
        }
    }

    #[test]
    fn test_sink_handle_subscribe_and_drop() {
        let stream = Stream::<Packet>::new(descriptor());
        let handle = SinkHandle::new(Counting {
            seen: Vec::new(),
            hooked: 0,
        });
        handle.subscribe(&stream).unwrap();
        assert_eq!(handle.with(|s| s.hooked), 1);

        let mut packet = Packet::empty();
        packet.set_pts(Some(5));
        stream.forward(&packet).unwrap();
        assert_eq!(handle.with(|s| s.seen.clone()), vec![Some(5)]);

        handle.unsubscribe();
        handle.unsubscribe();
        assert_eq!(stream.source().subscriber_count(), 0);

        handle.subscribe(&stream).unwrap();
        assert_eq!(stream.source().subscriber_count(), 1);
        drop(handle);
        assert_eq!(stream.source().subscriber_count(), 0);
    }
}
