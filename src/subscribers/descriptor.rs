//! # Handler descriptors and the subscriber contract.
//!
//! A subscriber is any `Send + Sync` struct that describes its handlers as
//! data: one [`HandlerDescriptor`] per handler, bundled into a
//! [`SubscriberInfo`]. The descriptor carries everything the dispatcher needs
//! to route a delivery — event type, thread mode, priority, sticky flag — plus
//! a type-erased callable that downcasts back to the concrete pair.
//!
//! ## Declaring handlers
//! ```
//! use postbus::{Event, HandlerDescriptor, Subscriber, SubscriberInfo, ThreadMode};
//! use std::any::Any;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[derive(Debug)]
//! struct Tick(u64);
//! impl Event for Tick {}
//!
//! #[derive(Default)]
//! struct Counter {
//!     seen: AtomicUsize,
//! }
//!
//! impl Counter {
//!     fn on_tick(&self, _ev: &Tick) {
//!         self.seen.fetch_add(1, Ordering::Relaxed);
//!     }
//! }
//!
//! impl Subscriber for Counter {
//!     fn subscriber_info(&self) -> SubscriberInfo {
//!         SubscriberInfo::of::<Self>(vec![
//!             HandlerDescriptor::new("on_tick", ThreadMode::Immediate, Counter::on_tick),
//!         ])
//!     }
//!
//!     fn as_any(&self) -> &dyn Any {
//!         self
//!     }
//! }
//! ```
//!
//! ## Emulated inheritance
//! A subscriber that reuses a base type's handlers links the base's
//! [`SubscriberInfo`] as its parent; the resolver walks the chain and lets the
//! more-derived declaration win when both levels claim the same handler for
//! the same event type.
//!
//! ## Generated tables
//! A [`DescriptorSource`] is the hook for descriptor tables produced ahead of
//! time (or from any registry external to the subscriber type itself). Sources
//! are consulted in order before falling back to
//! [`Subscriber::subscriber_info`]; a hit is expected to encode its own parent
//! chain.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use crate::error::HandlerError;
use crate::events::{Event, EventTypeId};

/// Outcome of one handler invocation.
pub type HandlerResult = Result<(), HandlerError>;

type Invoker = Arc<dyn Fn(&dyn Any, &dyn Any) -> HandlerResult + Send + Sync>;

/// How a handler is scheduled relative to the posting thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ThreadMode {
    /// Invoke synchronously on the posting thread. The only mode from which
    /// delivery may be canceled.
    #[default]
    Immediate,
    /// Invoke on the designated main context; immediately if the poster
    /// already is that context, otherwise enqueued.
    Main,
    /// Always enqueue onto the main context, guaranteeing FIFO order among
    /// `MainOrdered` deliveries regardless of the posting thread.
    MainOrdered,
    /// Invoke on the single serialized background worker; immediately if the
    /// poster is not the main context (no pointless hop).
    Background,
    /// Always submit to the unordered worker pool; fully concurrent.
    Async,
}

/// Immutable description of one handler: its identity, routing metadata, and
/// the type-erased callable.
///
/// Built once per distinct subscriber type and cached by the resolver.
#[derive(Clone)]
pub struct HandlerDescriptor {
    name: &'static str,
    event_type: EventTypeId,
    thread_mode: ThreadMode,
    priority: i32,
    sticky: bool,
    invoke: Invoker,
}

impl HandlerDescriptor {
    /// Describes an infallible handler.
    ///
    /// `f` is typically a method reference like `MySubscriber::on_event`.
    pub fn new<S, E, F>(name: &'static str, thread_mode: ThreadMode, f: F) -> Self
    where
        S: Subscriber,
        E: Event,
        F: Fn(&S, &E) + Send + Sync + 'static,
    {
        Self::fallible(name, thread_mode, move |s: &S, e: &E| {
            f(s, e);
            Ok(())
        })
    }

    /// Describes a handler that reports failure through its return value.
    pub fn fallible<S, E, F>(name: &'static str, thread_mode: ThreadMode, f: F) -> Self
    where
        S: Subscriber,
        E: Event,
        F: Fn(&S, &E) -> HandlerResult + Send + Sync + 'static,
    {
        let invoke: Invoker = Arc::new(move |subscriber, event| {
            let (Some(subscriber), Some(event)) =
                (subscriber.downcast_ref::<S>(), event.downcast_ref::<E>())
            else {
                return Err(HandlerError::TypeMismatch { handler: name });
            };
            f(subscriber, event)
        });
        Self {
            name,
            event_type: EventTypeId::of::<E>(),
            thread_mode,
            priority: 0,
            sticky: false,
            invoke,
        }
    }

    /// Sets the delivery priority (default 0). Higher runs first within one
    /// event type's subscription list.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Marks the handler sticky: on registration it immediately receives the
    /// latest retained event compatible with its event type.
    pub fn sticky(mut self, sticky: bool) -> Self {
        self.sticky = sticky;
        self
    }

    /// Handler name, unique within its declaring subscriber type.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The event type the handler is declared for.
    pub fn event_type(&self) -> EventTypeId {
        self.event_type
    }

    /// The handler's scheduling mode.
    pub fn thread_mode(&self) -> ThreadMode {
        self.thread_mode
    }

    /// The handler's delivery priority.
    pub fn priority_value(&self) -> i32 {
        self.priority
    }

    /// True if the handler wants sticky replay on registration.
    pub fn is_sticky(&self) -> bool {
        self.sticky
    }

    /// Invokes the callable on type-erased subscriber and event values.
    pub(crate) fn invoke(&self, subscriber: &dyn Any, event: &dyn Any) -> HandlerResult {
        (self.invoke)(subscriber, event)
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("name", &self.name)
            .field("event_type", &self.event_type)
            .field("thread_mode", &self.thread_mode)
            .field("priority", &self.priority)
            .field("sticky", &self.sticky)
            .finish()
    }
}

/// A handler declaration the describing side could not turn into a usable
/// descriptor (a generated table's stand-in for an annotated method with the
/// wrong shape).
///
/// Skipped with a debug log by default; fails registration under
/// `strict_handler_verification`.
#[derive(Clone, Debug)]
pub struct MalformedHandler {
    /// Name of the declaration.
    pub name: &'static str,
    /// Why it is not a usable handler.
    pub detail: String,
}

/// The handler table of one subscriber type level, with an optional link to
/// the next level up the emulated inheritance chain.
pub struct SubscriberInfo {
    subscriber_type: TypeId,
    type_name: &'static str,
    handlers: Vec<HandlerDescriptor>,
    malformed: Vec<MalformedHandler>,
    parent: Option<Box<SubscriberInfo>>,
}

impl SubscriberInfo {
    /// Handler table for subscriber type `S`.
    pub fn of<S: Subscriber>(handlers: Vec<HandlerDescriptor>) -> Self {
        Self {
            subscriber_type: TypeId::of::<S>(),
            type_name: std::any::type_name::<S>(),
            handlers,
            malformed: Vec::new(),
            parent: None,
        }
    }

    /// Links the handler table of the next level up the chain.
    pub fn parent(mut self, parent: SubscriberInfo) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    /// Records a declaration that could not be turned into a handler.
    pub fn malformed(mut self, name: &'static str, detail: impl Into<String>) -> Self {
        self.malformed.push(MalformedHandler {
            name,
            detail: detail.into(),
        });
        self
    }

    /// `TypeId` of the declaring subscriber type.
    pub fn subscriber_type(&self) -> TypeId {
        self.subscriber_type
    }

    /// Name of the declaring subscriber type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn handlers(&self) -> &[HandlerDescriptor] {
        &self.handlers
    }

    pub(crate) fn malformed_handlers(&self) -> &[MalformedHandler] {
        &self.malformed
    }

    pub(crate) fn parent_info(&self) -> Option<&SubscriberInfo> {
        self.parent.as_deref()
    }
}

impl fmt::Debug for SubscriberInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberInfo")
            .field("type", &self.type_name)
            .field("handlers", &self.handlers.len())
            .field("malformed", &self.malformed.len())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

/// A registered event consumer.
///
/// Implementations describe their handlers as data; the bus never inspects
/// the type beyond this contract.
pub trait Subscriber: Any + Send + Sync {
    /// The handler table for this type, with any parent chain attached.
    ///
    /// Only consulted when no [`DescriptorSource`] knows the type; the result
    /// is resolved once and cached process-wide.
    fn subscriber_info(&self) -> SubscriberInfo;

    /// The concrete value, for the dispatcher's downcast back to `Self`.
    ///
    /// Implement as `fn as_any(&self) -> &dyn Any { self }`.
    fn as_any(&self) -> &dyn Any;
}

/// An external provider of pre-resolved handler tables, keyed by subscriber
/// type.
///
/// Sources are consulted in registration order before the fallback to
/// [`Subscriber::subscriber_info`]; the first hit wins and is expected to
/// carry its own parent chain.
pub trait DescriptorSource: Send + Sync {
    /// The handler table for `subscriber_type`, if this source knows it.
    fn lookup(&self, subscriber_type: TypeId) -> Option<SubscriberInfo>;
}
