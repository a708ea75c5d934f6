//! # Subscription registry.
//!
//! Owns the two indices of the bus:
//!
//! - event type → subscriptions, ordered by descending priority (ties keep
//!   registration order);
//! - subscriber identity → event types it is registered for.
//!
//! Both live behind one coarse lock; mutation is rare relative to reads.
//! Readers never iterate under the lock: `snapshot_for` hands out the current
//! `Arc`'d list and every mutation installs a fresh list, so an in-flight
//! dispatch keeps iterating its own stable snapshot while writers proceed.
//!
//! ## Rules
//! - A (subscriber, event type, handler) triple exists at most once.
//! - `subscribe_all` is atomic: duplicates are rejected before either index
//!   is touched.
//! - Unsubscribing flips each subscription inactive before removal, so
//!   already-queued cross-thread dispatches observe the retirement and skip.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::BusError;
use crate::subscribers::descriptor::{HandlerDescriptor, Subscriber};

/// The live pairing of one registered subscriber instance with one of its
/// handler descriptors.
pub(crate) struct Subscription {
    subscriber: Weak<dyn Subscriber>,
    subscriber_id: usize,
    subscriber_name: &'static str,
    descriptor: Arc<HandlerDescriptor>,
    active: AtomicBool,
}

impl Subscription {
    fn new(
        subscriber: &Arc<dyn Subscriber>,
        subscriber_id: usize,
        subscriber_name: &'static str,
        descriptor: Arc<HandlerDescriptor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            subscriber: Arc::downgrade(subscriber),
            subscriber_id,
            subscriber_name,
            descriptor,
            active: AtomicBool::new(true),
        })
    }

    /// The subscriber instance, if it is still alive.
    pub(crate) fn subscriber(&self) -> Option<Arc<dyn Subscriber>> {
        self.subscriber.upgrade()
    }

    /// The handler descriptor this subscription delivers through.
    pub(crate) fn descriptor(&self) -> &HandlerDescriptor {
        &self.descriptor
    }

    /// Type name of the subscriber, for logs and the exception event.
    pub(crate) fn subscriber_name(&self) -> &'static str {
        self.subscriber_name
    }

    /// False once the subscriber has unregistered; queued deliveries check
    /// this at execution time and drop themselves.
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn retire(&self) {
        self.active.store(false, Ordering::Release);
    }

    fn matches(&self, subscriber_id: usize, descriptor: &HandlerDescriptor) -> bool {
        self.subscriber_id == subscriber_id
            && self.descriptor.event_type() == descriptor.event_type()
            && self.descriptor.name() == descriptor.name()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subscriber", &self.subscriber_name)
            .field("handler", &self.descriptor.name())
            .field("event_type", &self.descriptor.event_type())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Stable, independently-iterable view of one event type's subscriptions.
pub(crate) type SubscriptionList = Arc<Vec<Arc<Subscription>>>;

#[derive(Default)]
struct Indices {
    by_event: HashMap<TypeId, SubscriptionList>,
    by_subscriber: HashMap<usize, Vec<TypeId>>,
}

/// The two mutually-consistent subscription indices.
///
/// No user code ever runs under the lock, so a poisoned guard means a bug in
/// the registry itself; lock accesses unwrap rather than mask it.
#[derive(Default)]
pub(crate) struct Registry {
    indices: Mutex<Indices>,
}

impl Registry {
    /// Inserts one subscription per descriptor, keeping priority order within
    /// each event type's list.
    ///
    /// Rejects the whole batch with [`BusError::AlreadyRegistered`] if any
    /// (subscriber, event type, handler) triple already exists; on error
    /// neither index is modified. Returns the new subscriptions whose
    /// descriptor is sticky, for replay by the caller.
    pub(crate) fn subscribe_all(
        &self,
        subscriber: &Arc<dyn Subscriber>,
        subscriber_id: usize,
        subscriber_name: &'static str,
        descriptors: &[Arc<HandlerDescriptor>],
    ) -> Result<Vec<Arc<Subscription>>, BusError> {
        let mut indices = self.indices.lock().unwrap();

        for descriptor in descriptors.iter() {
            let duplicate = indices
                .by_event
                .get(&descriptor.event_type().id())
                .is_some_and(|list| {
                    list.iter().any(|s| s.matches(subscriber_id, descriptor))
                });
            if duplicate {
                return Err(BusError::AlreadyRegistered {
                    subscriber: subscriber_name,
                    event: descriptor.event_type().name(),
                });
            }
        }

        let mut sticky = Vec::new();
        for descriptor in descriptors.iter() {
            let subscription =
                Subscription::new(subscriber, subscriber_id, subscriber_name, Arc::clone(descriptor));
            if descriptor.is_sticky() {
                sticky.push(Arc::clone(&subscription));
            }

            let event = descriptor.event_type().id();
            let current = indices.by_event.entry(event).or_default();
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            let at = next
                .iter()
                .position(|s| s.descriptor().priority_value() < descriptor.priority_value())
                .unwrap_or(next.len());
            next.insert(at, subscription);
            *current = Arc::new(next);

            indices
                .by_subscriber
                .entry(subscriber_id)
                .or_default()
                .push(event);
        }
        Ok(sticky)
    }

    /// Retires and removes every subscription of `subscriber_id`.
    ///
    /// Returns false when the subscriber had no registrations (the caller
    /// reports the warning).
    pub(crate) fn unsubscribe_all(&self, subscriber_id: usize) -> bool {
        let mut indices = self.indices.lock().unwrap();
        let Some(events) = indices.by_subscriber.remove(&subscriber_id) else {
            return false;
        };
        for event in events {
            if let Some(list) = indices.by_event.get_mut(&event) {
                let retained: Vec<Arc<Subscription>> = list
                    .iter()
                    .filter(|s| {
                        if s.subscriber_id == subscriber_id {
                            s.retire();
                            false
                        } else {
                            true
                        }
                    })
                    .cloned()
                    .collect();
                *list = Arc::new(retained);
            }
        }
        true
    }

    /// True if the subscriber currently has any registration.
    pub(crate) fn is_registered(&self, subscriber_id: usize) -> bool {
        self.indices
            .lock()
            .unwrap()
            .by_subscriber
            .contains_key(&subscriber_id)
    }

    /// The current subscription list for one event type.
    pub(crate) fn snapshot_for(&self, event: TypeId) -> Option<SubscriptionList> {
        self.indices.lock().unwrap().by_event.get(&event).cloned()
    }

    /// True if any subscription exists for the event type.
    pub(crate) fn has_any(&self, event: TypeId) -> bool {
        self.snapshot_for(event).is_some_and(|list| !list.is_empty())
    }
}
