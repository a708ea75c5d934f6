//! # Event trait and runtime event-type identity.
//!
//! Any `'static` value can travel through the bus; it only has to implement
//! [`Event`]. Dispatch is keyed by the value's runtime type, identified by an
//! [`EventTypeId`].
//!
//! ## Polymorphic dispatch
//! Rust has no runtime type hierarchy, so an event type *declares* the types
//! it wants to be delivered as via [`Event::lineage`]: direct supertypes and
//! capability markers, nearest first. The dispatcher expands the declaration
//! transitively (see the lineage resolver) and fans a posted value out to
//! handlers of every type in the expansion.
//!
//! ```text
//! struct Base;          impl Event for Base {}
//! struct Derived;       impl Event for Derived {
//!                           fn lineage() -> Vec<EventTypeId> {
//!                               vec![EventTypeId::of::<Base>()]
//!                           }
//!                       }
//!
//! post(Derived) ──► handlers for Derived, then handlers for Base
//! post(Base)    ──► handlers for Base only
//! ```
//!
//! ## Rules
//! - Lineage is declared once per type and cached process-wide; it must be
//!   deterministic.
//! - An event value posted to the bus is shared behind an `Arc`; handlers
//!   receive `&E` for the event type they declared. A handler declared for a
//!   lineage type receives the value through [`Event::as_lineage`], so a
//!   declaring type must be able to project itself as every type it lists.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use crate::error::HandlerError;

/// A value that can be posted through the bus.
///
/// The default implementation declares an empty lineage: the event is
/// delivered to exact-type handlers only.
pub trait Event: Any + Send + Sync {
    /// Direct supertypes and capability markers of this event type, nearest
    /// first. Transitive expansion and deduplication happen in the dispatcher.
    fn lineage() -> Vec<EventTypeId>
    where
        Self: Sized,
    {
        Vec::new()
    }

    /// Projects this value as lineage type `target`, so handlers declared
    /// for an ancestor or capability marker can receive it.
    ///
    /// Types with a non-empty [`lineage`](Event::lineage) override this to
    /// return the embedded ancestor value (delegating further up the chain)
    /// or a marker instance. The default covers the exact type only.
    fn as_lineage(&self, target: TypeId) -> Option<&(dyn Any + Send + Sync)>
    where
        Self: Sized,
    {
        (target == TypeId::of::<Self>()).then_some(self as &(dyn Any + Send + Sync))
    }
}

fn project_value<E: Event>(
    value: &(dyn Any + Send + Sync),
    target: TypeId,
) -> Option<&(dyn Any + Send + Sync)> {
    value.downcast_ref::<E>()?.as_lineage(target)
}

/// Identity of a concrete event type, plus the hook the dispatcher uses to
/// expand its declared lineage.
///
/// Equality and hashing consider only the underlying [`TypeId`].
#[derive(Clone, Copy)]
pub struct EventTypeId {
    id: TypeId,
    name: &'static str,
    lineage: fn() -> Vec<EventTypeId>,
}

impl EventTypeId {
    /// Identity of the event type `E`.
    pub fn of<E: Event>() -> Self {
        Self {
            id: TypeId::of::<E>(),
            name: std::any::type_name::<E>(),
            lineage: E::lineage,
        }
    }

    /// The raw [`TypeId`].
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// The event type's name, for logs and diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Direct lineage as declared by the type.
    pub(crate) fn declared_lineage(&self) -> Vec<EventTypeId> {
        (self.lineage)()
    }
}

impl PartialEq for EventTypeId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EventTypeId {}

impl std::hash::Hash for EventTypeId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for EventTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventTypeId").field(&self.name).finish()
    }
}

/// A posted event value paired with its runtime type identity.
///
/// Cheap to clone; the value itself is shared behind an `Arc` across worker
/// threads and the sticky store.
#[derive(Clone)]
pub struct PostedEvent {
    value: Arc<dyn Any + Send + Sync>,
    type_id: EventTypeId,
    project: fn(&(dyn Any + Send + Sync), TypeId) -> Option<&(dyn Any + Send + Sync)>,
}

impl PostedEvent {
    /// Wraps an owned event value.
    pub fn new<E: Event>(event: E) -> Self {
        Self {
            value: Arc::new(event),
            type_id: EventTypeId::of::<E>(),
            project: project_value::<E>,
        }
    }

    /// Identity of the wrapped value's concrete type.
    pub fn type_id(&self) -> EventTypeId {
        self.type_id
    }

    /// The wrapped value, type-erased.
    pub fn value(&self) -> &(dyn Any + Send + Sync) {
        &*self.value
    }

    /// The wrapped value projected as lineage type `target`, for delivery to
    /// a handler declared for that type.
    pub fn project(&self, target: TypeId) -> Option<&(dyn Any + Send + Sync)> {
        (self.project)(&*self.value, target)
    }

    /// Address of the wrapped allocation; used for the cancellation identity
    /// check.
    pub(crate) fn addr(&self) -> *const () {
        Arc::as_ptr(&self.value) as *const ()
    }

    /// Borrows the wrapped value as `E` if that is its concrete type.
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.value.downcast_ref::<E>()
    }

    /// Returns the wrapped value as `Arc<E>` if that is its concrete type.
    pub fn downcast<E: Event>(&self) -> Option<Arc<E>> {
        Arc::clone(&self.value).downcast::<E>().ok()
    }

    /// True if the wrapped value is one of the bus's own meta events.
    pub(crate) fn is_meta_event(&self) -> bool {
        let id = self.type_id.id;
        id == TypeId::of::<NoSubscriberEvent>() || id == TypeId::of::<SubscriberExceptionEvent>()
    }
}

impl fmt::Debug for PostedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostedEvent")
            .field("type", &self.type_id.name())
            .finish()
    }
}

/// Posted when an event found no subscriber across its whole type lineage and
/// `emit_no_subscriber_event` is enabled.
///
/// Never synthesized for the bus's own meta events, so an unobserved
/// `NoSubscriberEvent` does not trigger another one.
#[derive(Clone)]
pub struct NoSubscriberEvent {
    /// The event that went undelivered.
    pub event: PostedEvent,
}

impl Event for NoSubscriberEvent {}

impl fmt::Debug for NoSubscriberEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoSubscriberEvent")
            .field("event", &self.event.type_id().name())
            .finish()
    }
}

/// Posted when a handler failed and `emit_subscriber_exception_event` is
/// enabled.
///
/// A failure while handling a `SubscriberExceptionEvent` itself is only
/// logged, never re-posted.
#[derive(Clone)]
pub struct SubscriberExceptionEvent {
    /// The contained failure.
    pub failure: HandlerError,
    /// The event whose delivery failed.
    pub event: PostedEvent,
    /// Type name of the subscriber whose handler failed.
    pub subscriber: &'static str,
}

impl Event for SubscriberExceptionEvent {}

impl fmt::Debug for SubscriberExceptionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberExceptionEvent")
            .field("failure", &self.failure)
            .field("event", &self.event.type_id().name())
            .field("subscriber", &self.subscriber)
            .finish()
    }
}
