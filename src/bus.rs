//! # The event bus: registration, posting, and delivery orchestration.
//!
//! [`EventBus`] is a cheap-to-clone handle over a shared core that ties the
//! other modules together:
//!
//! ```text
//!  post(event)
//!      │
//!      ▼
//!  [per-thread posting queue]  ─ reentrant posts append, outermost drains
//!      │
//!      ▼
//!  lineage fan-out ── registry snapshot ── per-subscription routing
//!                                              │
//!                          Immediate ──────────┤ invoke on posting thread
//!                          Main/MainOrdered ───┤ host main context
//!                          Background/Async ───┘ tokio workers
//! ```
//!
//! ## Rules
//!
//! - Posting is reentrant: an event posted from inside a handler is queued
//!   behind the current batch on the same thread and drained FIFO.
//! - Within one event type, subscriptions are delivered in descending
//!   priority; equal priorities keep registration order.
//! - A handler failure never skips the remaining subscriptions unless
//!   `rethrow_handler_failures` surfaces it to the caller.
//! - Delivery cancellation only takes effect for immediate-mode handlers and
//!   only stops later handlers of the same closure (same resolved type of the
//!   same event); other lineage closures still run.
//!
//! ### Notes
//!
//! Sticky replay on registration runs through the same routing as a live
//! post, but outside the posting-state bookkeeping: replayed deliveries
//! cannot be canceled.

use std::any::TypeId;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, Weak};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::BusConfig;
use crate::dispatch::{
    spawn_background_worker, Executor, MainContext, MainDispatch, PendingPost,
};
use crate::error::{BusError, HandlerError};
use crate::events::{
    clear_lineage_cache, full_lineage, Event, EventTypeId, NoSubscriberEvent, PostedEvent,
    SubscriberExceptionEvent,
};
use crate::sticky::StickyStore;
use crate::subscribers::{
    clear_descriptor_cache, DescriptorResolver, DescriptorSource, Registry, Subscriber,
    Subscription, ThreadMode,
};

/// Per-thread posting state, keyed by bus identity so independent buses on
/// the same thread do not interleave their queues.
#[derive(Default)]
struct PostingState {
    queue: VecDeque<PostedEvent>,
    is_posting: bool,
    is_main: bool,
    canceled: bool,
    current_event: Option<PostedEvent>,
    current_subscription: Option<Arc<Subscription>>,
}

thread_local! {
    static POSTING_STATES: RefCell<HashMap<usize, PostingState>> =
        RefCell::new(HashMap::new());
}

fn with_state<R>(bus: usize, f: impl FnOnce(&mut PostingState) -> R) -> R {
    POSTING_STATES.with(|states| f(states.borrow_mut().entry(bus).or_default()))
}

/// Resets the drain flags even when a rethrown failure unwinds the drain
/// loop early.
struct DrainGuard {
    bus: usize,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        with_state(self.bus, |state| {
            state.is_posting = false;
            state.is_main = false;
        });
    }
}

/// Shared state behind every [`EventBus`] clone.
pub(crate) struct BusCore {
    config: BusConfig,
    registry: Registry,
    sticky: StickyStore,
    resolver: DescriptorResolver,
    main_context: Option<Arc<dyn MainContext>>,
    background: mpsc::UnboundedSender<PendingPost>,
    executor: Executor,
    weak_self: Weak<BusCore>,
}

impl BusCore {
    fn id(&self) -> usize {
        self as *const BusCore as *const () as usize
    }

    pub(crate) fn executor_handle(&self) -> &Handle {
        self.executor.handle()
    }

    /// Without a main context every thread counts as main, so main-mode
    /// handlers run inline on the posting thread.
    fn on_main_context(&self) -> bool {
        self.main_context
            .as_ref()
            .map_or(true, |context| context.is_main_context())
    }

    fn register(&self, subscriber: Arc<dyn Subscriber>) -> Result<(), BusError> {
        let resolved = self.resolver.resolve(subscriber.as_ref())?;
        let id = subscriber_identity(subscriber.as_ref());
        let sticky = self.registry.subscribe_all(
            &subscriber,
            id,
            resolved.type_name,
            &resolved.handlers,
        )?;
        for subscription in &sticky {
            self.replay_sticky(subscription)?;
        }
        Ok(())
    }

    fn unregister(&self, subscriber: &dyn Subscriber) {
        if !self
            .registry
            .unsubscribe_all(subscriber_identity(subscriber))
        {
            warn!("unregister called for a subscriber that was not registered");
        }
    }

    /// Replays stored sticky events matching one freshly inserted sticky
    /// subscription. Runs after the registry lock is released, so a replayed
    /// handler may re-enter the bus.
    fn replay_sticky(&self, subscription: &Arc<Subscription>) -> Result<(), BusError> {
        let target = subscription.descriptor().event_type();
        let matching: Vec<PostedEvent> = if self.config.event_inheritance {
            self.sticky
                .snapshot()
                .into_iter()
                .filter(|event| full_lineage(event.type_id()).contains(&target))
                .collect()
        } else {
            self.sticky.get(target.id()).into_iter().collect()
        };
        if matching.is_empty() {
            return Ok(());
        }

        let is_main = self.on_main_context();
        for event in matching {
            self.route(subscription, event, is_main, true)?;
        }
        Ok(())
    }

    fn post_event(&self, event: PostedEvent) -> Result<(), BusError> {
        let bus = self.id();
        let is_main = self.on_main_context();
        let nested = with_state(bus, |state| {
            state.queue.push_back(event);
            if state.is_posting {
                return true;
            }
            state.is_posting = true;
            state.is_main = is_main;
            false
        });
        if nested {
            // An enclosing drain on this thread will deliver it.
            return Ok(());
        }

        let _guard = DrainGuard { bus };
        while let Some(next) = with_state(bus, |state| state.queue.pop_front()) {
            self.post_single(next, bus)?;
        }
        Ok(())
    }

    /// Delivers one event to every matching closure, synthesizing a
    /// [`NoSubscriberEvent`] when nothing matched anywhere in the lineage.
    fn post_single(&self, event: PostedEvent, bus: usize) -> Result<(), BusError> {
        let mut found = false;
        if self.config.event_inheritance {
            for ty in full_lineage(event.type_id()).iter() {
                found |= self.post_for_type(&event, *ty, bus)?;
            }
        } else {
            found = self.post_for_type(&event, event.type_id(), bus)?;
        }

        if !found {
            if self.config.log_no_subscriber {
                debug!(event = event.type_id().name(), "no subscribers for event");
            }
            if self.config.emit_no_subscriber_event && !event.is_meta_event() {
                with_state(bus, |state| {
                    state
                        .queue
                        .push_back(PostedEvent::new(NoSubscriberEvent { event }));
                });
            }
        }
        Ok(())
    }

    /// One closure: the subscriptions of a single resolved event type.
    /// Returns false when the type has no subscriptions at all.
    fn post_for_type(
        &self,
        event: &PostedEvent,
        ty: EventTypeId,
        bus: usize,
    ) -> Result<bool, BusError> {
        let Some(snapshot) = self.registry.snapshot_for(ty.id()) else {
            return Ok(false);
        };
        if snapshot.is_empty() {
            return Ok(false);
        }

        let is_main = with_state(bus, |state| state.is_main);
        for subscription in snapshot.iter() {
            with_state(bus, |state| {
                state.current_event = Some(event.clone());
                state.current_subscription = Some(Arc::clone(subscription));
            });
            let outcome = self.route(subscription, event.clone(), is_main, true);
            let aborted = with_state(bus, |state| {
                let aborted = state.canceled;
                state.canceled = false;
                state.current_event = None;
                state.current_subscription = None;
                aborted
            });
            outcome?;
            if aborted {
                break;
            }
        }
        Ok(true)
    }

    /// Hands one delivery to the execution context its thread mode asks for.
    fn route(
        &self,
        subscription: &Arc<Subscription>,
        event: PostedEvent,
        is_main: bool,
        may_rethrow: bool,
    ) -> Result<(), BusError> {
        match subscription.descriptor().thread_mode() {
            ThreadMode::Immediate => self.invoke_now(subscription, &event, may_rethrow),
            ThreadMode::Main => {
                if is_main {
                    self.invoke_now(subscription, &event, may_rethrow)
                } else {
                    self.enqueue_main(subscription, event);
                    Ok(())
                }
            }
            ThreadMode::MainOrdered => {
                if self.main_context.is_some() {
                    self.enqueue_main(subscription, event);
                    Ok(())
                } else {
                    self.invoke_now(subscription, &event, may_rethrow)
                }
            }
            ThreadMode::Background => {
                if is_main {
                    let pending = PendingPost {
                        subscription: Arc::clone(subscription),
                        event,
                    };
                    if self.background.send(pending).is_err() {
                        debug!("background worker is gone, dropping delivery");
                    }
                    Ok(())
                } else {
                    self.invoke_now(subscription, &event, may_rethrow)
                }
            }
            ThreadMode::Async => {
                let pending = PendingPost {
                    subscription: Arc::clone(subscription),
                    event,
                };
                if let Some(core) = self.weak_self.upgrade() {
                    self.executor
                        .handle()
                        .spawn_blocking(move || core.invoke_pending(pending));
                }
                Ok(())
            }
        }
    }

    fn enqueue_main(&self, subscription: &Arc<Subscription>, event: PostedEvent) {
        if let Some(context) = &self.main_context {
            let pending = PendingPost {
                subscription: Arc::clone(subscription),
                event,
            };
            context.enqueue(MainDispatch::new(self.weak_self.clone(), pending));
        }
    }

    /// Invokes on the current thread, applying the configured failure policy.
    fn invoke_now(
        &self,
        subscription: &Arc<Subscription>,
        event: &PostedEvent,
        may_rethrow: bool,
    ) -> Result<(), BusError> {
        let Some(subscriber) = subscription.subscriber() else {
            return Ok(());
        };
        match self.invoke(subscriber.as_ref(), subscription, event) {
            Ok(()) => Ok(()),
            Err(failure) => self.report_failure(subscription, event, failure, may_rethrow),
        }
    }

    /// Raw invocation with the panic boundary.
    fn invoke(
        &self,
        subscriber: &dyn Subscriber,
        subscription: &Subscription,
        event: &PostedEvent,
    ) -> Result<(), HandlerError> {
        let descriptor = subscription.descriptor();
        // Handlers declared for an ancestor or marker type receive the value
        // projected as that type.
        let Some(value) = event.project(descriptor.event_type().id()) else {
            return Err(HandlerError::TypeMismatch {
                handler: descriptor.name(),
            });
        };
        let call = AssertUnwindSafe(|| descriptor.invoke(subscriber.as_any(), value));
        match panic::catch_unwind(call) {
            Ok(result) => result,
            Err(payload) => Err(HandlerError::Panicked {
                handler: descriptor.name(),
                message: panic_message(&payload),
            }),
        }
    }

    /// Executes a captured delivery coming back from a detached context.
    pub(crate) fn invoke_pending(&self, pending: PendingPost) {
        if !pending.subscription.is_active() {
            debug!(
                subscriber = pending.subscription.subscriber_name(),
                event = pending.event.type_id().name(),
                "dropping delivery to an unregistered subscriber"
            );
            return;
        }
        let Some(subscriber) = pending.subscription.subscriber() else {
            return;
        };
        if let Err(failure) =
            self.invoke(subscriber.as_ref(), &pending.subscription, &pending.event)
        {
            // Detached contexts have no caller to rethrow to.
            let _ = self.report_failure(&pending.subscription, &pending.event, failure, false);
        }
    }

    /// Applies the configured failure policy: log, rethrow to the poster,
    /// and/or re-post as a [`SubscriberExceptionEvent`].
    fn report_failure(
        &self,
        subscription: &Arc<Subscription>,
        event: &PostedEvent,
        failure: HandlerError,
        may_rethrow: bool,
    ) -> Result<(), BusError> {
        if event.type_id().id() == TypeId::of::<SubscriberExceptionEvent>() {
            // Never re-post a failure about the failure event itself.
            if self.config.log_handler_failures {
                error!(
                    subscriber = subscription.subscriber_name(),
                    failure = %failure,
                    "exception-event handler failed"
                );
                if let Some(original) = event.downcast_ref::<SubscriberExceptionEvent>() {
                    error!(
                        subscriber = original.subscriber,
                        event = original.event.type_id().name(),
                        failure = %original.failure,
                        "initial failure that produced the exception event"
                    );
                }
            }
            return Ok(());
        }

        if self.config.rethrow_handler_failures {
            if may_rethrow {
                return Err(failure.into());
            }
            error!(
                failure = %failure,
                "handler failure in a detached context cannot be rethrown"
            );
            return Ok(());
        }

        if self.config.log_handler_failures {
            error!(
                subscriber = subscription.subscriber_name(),
                event = event.type_id().name(),
                failure = %failure,
                "could not dispatch event"
            );
        }
        if self.config.emit_subscriber_exception_event {
            let exception = SubscriberExceptionEvent {
                failure,
                event: event.clone(),
                subscriber: subscription.subscriber_name(),
            };
            if let Err(err) = self.post_event(PostedEvent::new(exception)) {
                error!(error = %err, "failed to post the exception event");
            }
        }
        Ok(())
    }

    fn cancel_event_delivery(
        &self,
        event_type: TypeId,
        event_addr: *const (),
    ) -> Result<(), BusError> {
        with_state(self.id(), |state| {
            if !state.is_posting {
                return Err(BusError::CancelNotPosting);
            }
            let Some(current) = &state.current_event else {
                return Err(BusError::CancelNotPosting);
            };
            if current.type_id().id() != event_type || current.addr() != event_addr {
                return Err(BusError::CancelWrongEvent);
            }
            let Some(subscription) = &state.current_subscription else {
                return Err(BusError::CancelNotPosting);
            };
            if subscription.descriptor().thread_mode() != ThreadMode::Immediate {
                return Err(BusError::CancelWrongThreadMode);
            }
            state.canceled = true;
            Ok(())
        })
    }

    fn has_subscriber_for(&self, ty: EventTypeId) -> bool {
        full_lineage(ty)
            .iter()
            .any(|candidate| self.registry.has_any(candidate.id()))
    }
}

fn subscriber_identity(subscriber: &dyn Subscriber) -> usize {
    subscriber as *const dyn Subscriber as *const () as usize
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}

/// # In-process typed publish/subscribe dispatcher.
///
/// Clones share one bus; an independent bus has its own registry, sticky
/// store, and detached execution contexts. The descriptor and lineage caches
/// are process-wide and keyed by type, so independent buses share them.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use postbus::{EventBus, Event, HandlerDescriptor, Subscriber, SubscriberInfo, ThreadMode};
///
/// #[derive(Debug)]
/// struct Saved {
///     path: String,
/// }
/// impl Event for Saved {}
///
/// #[derive(Default)]
/// struct Tracker;
///
/// impl Subscriber for Tracker {
///     fn subscriber_info(&self) -> SubscriberInfo {
///         SubscriberInfo::of::<Tracker>(vec![HandlerDescriptor::new(
///             "on_saved",
///             ThreadMode::Immediate,
///             |_tracker: &Tracker, saved: &Saved| {
///                 println!("saved {}", saved.path);
///             },
///         )])
///     }
///     fn as_any(&self) -> &dyn std::any::Any {
///         self
///     }
/// }
///
/// let bus = EventBus::new();
/// let tracker: Arc<dyn Subscriber> = Arc::new(Tracker);
/// bus.register(Arc::clone(&tracker))?;
/// bus.post(Saved { path: "a.txt".into() })?;
/// bus.unregister(tracker.as_ref());
/// # Ok::<(), postbus::BusError>(())
/// ```
#[derive(Clone)]
pub struct EventBus {
    core: Arc<BusCore>,
}

impl EventBus {
    /// A bus with the default configuration and no main context.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    #[must_use]
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::new()
    }

    /// The process-wide default bus, built lazily with the default
    /// configuration.
    pub fn global() -> &'static EventBus {
        static GLOBAL: OnceLock<EventBus> = OnceLock::new();
        GLOBAL.get_or_init(EventBus::new)
    }

    /// Registers every handler the subscriber's type declares.
    ///
    /// Fails without side effects when the type declares no usable handlers,
    /// when a declaration is malformed under strict verification, or when the
    /// subscriber is already registered. Sticky handlers immediately receive
    /// the latest matching sticky events.
    pub fn register(&self, subscriber: Arc<dyn Subscriber>) -> Result<(), BusError> {
        self.core.register(subscriber)
    }

    /// Removes every subscription of `subscriber`. In-flight detached
    /// deliveries to it are silently dropped. Unknown subscribers are logged,
    /// not errors.
    pub fn unregister(&self, subscriber: &dyn Subscriber) {
        self.core.unregister(subscriber);
    }

    #[must_use]
    pub fn is_registered(&self, subscriber: &dyn Subscriber) -> bool {
        self.core
            .registry
            .is_registered(subscriber_identity(subscriber))
    }

    /// Posts `event` to all subscriptions matching its type lineage.
    ///
    /// Only fails when `rethrow_handler_failures` is enabled and an
    /// immediate-path handler failed; delivery stops at that point.
    pub fn post<E: Event>(&self, event: E) -> Result<(), BusError> {
        self.core.post_event(PostedEvent::new(event))
    }

    /// Stores `event` as the latest sticky value of its type, then posts it.
    ///
    /// The store happens first, so a handler observing the post can already
    /// read or remove the sticky value.
    pub fn post_sticky<E: Event>(&self, event: E) -> Result<(), BusError> {
        let posted = PostedEvent::new(event);
        self.core.sticky.put(posted.clone());
        self.core.post_event(posted)
    }

    /// The latest sticky event of type `E`, if any.
    #[must_use]
    pub fn get_sticky<E: Event>(&self) -> Option<Arc<E>> {
        self.core
            .sticky
            .get(TypeId::of::<E>())
            .and_then(|event| event.downcast::<E>())
    }

    /// Removes and returns the sticky event of type `E`.
    pub fn remove_sticky<E: Event>(&self) -> Option<Arc<E>> {
        self.core
            .sticky
            .remove(TypeId::of::<E>())
            .and_then(|event| event.downcast::<E>())
    }

    /// Removes the sticky event of type `E` only if it compares equal to
    /// `event`. The compare and remove are atomic against concurrent
    /// `post_sticky` calls.
    pub fn remove_sticky_if_equals<E: Event + PartialEq>(&self, event: &E) -> bool {
        self.core
            .sticky
            .remove_if(TypeId::of::<E>(), |stored| {
                stored.downcast_ref::<E>() == Some(event)
            })
    }

    /// Drops every stored sticky event.
    pub fn remove_all_sticky(&self) {
        self.core.sticky.clear();
    }

    /// Stops delivery of `event` to the remaining handlers of the current
    /// closure.
    ///
    /// Valid only from an immediate-mode handler currently receiving exactly
    /// this event on this thread.
    pub fn cancel_event_delivery<E: Event>(&self, event: &E) -> Result<(), BusError> {
        self.core
            .cancel_event_delivery(TypeId::of::<E>(), event as *const E as *const ())
    }

    /// True if any subscription would currently receive an `E`, anywhere in
    /// its type lineage.
    #[must_use]
    pub fn has_subscriber_for<E: Event>(&self) -> bool {
        self.core.has_subscriber_for(EventTypeId::of::<E>())
    }

    /// Drops the process-wide descriptor and lineage caches. Intended for
    /// tests that redefine descriptor sources between cases.
    pub fn clear_caches() {
        clear_descriptor_cache();
        clear_lineage_cache();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("event_inheritance", &self.core.config.event_inheritance)
            .field("has_main_context", &self.core.main_context.is_some())
            .finish()
    }
}

/// Builder for an [`EventBus`] with a non-default configuration or
/// non-default collaborators.
///
/// # Example
/// ```no_run
/// use postbus::EventBus;
///
/// let bus = EventBus::builder()
///     .event_inheritance(false)
///     .rethrow_handler_failures(true)
///     .build();
/// assert!(!format!("{bus:?}").is_empty());
/// ```
pub struct EventBusBuilder {
    config: BusConfig,
    sources: Vec<Arc<dyn DescriptorSource>>,
    main_context: Option<Arc<dyn MainContext>>,
    runtime: Option<Handle>,
}

impl EventBusBuilder {
    fn new() -> Self {
        Self {
            config: BusConfig::default(),
            sources: Vec::new(),
            main_context: None,
            runtime: None,
        }
    }

    /// Replaces the whole configuration at once.
    #[must_use]
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn event_inheritance(mut self, enabled: bool) -> Self {
        self.config.event_inheritance = enabled;
        self
    }

    #[must_use]
    pub fn strict_handler_verification(mut self, enabled: bool) -> Self {
        self.config.strict_handler_verification = enabled;
        self
    }

    #[must_use]
    pub fn log_no_subscriber(mut self, enabled: bool) -> Self {
        self.config.log_no_subscriber = enabled;
        self
    }

    #[must_use]
    pub fn log_handler_failures(mut self, enabled: bool) -> Self {
        self.config.log_handler_failures = enabled;
        self
    }

    #[must_use]
    pub fn rethrow_handler_failures(mut self, enabled: bool) -> Self {
        self.config.rethrow_handler_failures = enabled;
        self
    }

    #[must_use]
    pub fn emit_subscriber_exception_event(mut self, enabled: bool) -> Self {
        self.config.emit_subscriber_exception_event = enabled;
        self
    }

    #[must_use]
    pub fn emit_no_subscriber_event(mut self, enabled: bool) -> Self {
        self.config.emit_no_subscriber_event = enabled;
        self
    }

    /// Adds a descriptor source consulted before the subscriber's own
    /// `subscriber_info`. Sources are tried in insertion order.
    #[must_use]
    pub fn descriptor_source(mut self, source: Arc<dyn DescriptorSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Designates the host's single-consumer context for `Main` and
    /// `MainOrdered` handlers.
    #[must_use]
    pub fn main_context(mut self, context: Arc<dyn MainContext>) -> Self {
        self.main_context = Some(context);
        self
    }

    /// Runs detached deliveries on the given runtime instead of the ambient
    /// or bus-owned one.
    #[must_use]
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    #[must_use]
    pub fn build(self) -> EventBus {
        let executor = match self.runtime {
            Some(handle) => Executor::shared(handle),
            None => Executor::ambient_or_owned(),
        };
        let worker_handle = executor.handle().clone();
        let resolver =
            DescriptorResolver::new(self.sources, self.config.strict_handler_verification);

        let core = Arc::new_cyclic(|weak: &Weak<BusCore>| BusCore {
            config: self.config,
            registry: Registry::default(),
            sticky: StickyStore::default(),
            resolver,
            main_context: self.main_context,
            background: spawn_background_worker(&worker_handle, weak.clone()),
            executor,
            weak_self: weak.clone(),
        });
        EventBus { core }
    }
}

impl Default for EventBusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBusBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBusBuilder")
            .field("config", &self.config)
            .field("sources", &self.sources.len())
            .field("has_main_context", &self.main_context.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscribers::{HandlerDescriptor, SubscriberInfo};
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Mutex};
    use std::thread;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    // Run with RUST_LOG=postbus=debug to see the dispatch traces.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    // --- priority ordering ---

    #[derive(Debug)]
    struct Ping;
    impl Event for Ping {}

    struct HighRecorder {
        log: Log,
    }
    impl Subscriber for HighRecorder {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::new(
                "on_ping",
                ThreadMode::Immediate,
                |s: &Self, _: &Ping| s.log.lock().unwrap().push("high".into()),
            )
            .priority(9)])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct MidRecorder {
        log: Log,
        tag: &'static str,
    }
    impl Subscriber for MidRecorder {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::new(
                "on_ping",
                ThreadMode::Immediate,
                |s: &Self, _: &Ping| s.log.lock().unwrap().push(s.tag.into()),
            )
            .priority(5)])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct LowRecorder {
        log: Log,
    }
    impl Subscriber for LowRecorder {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::new(
                "on_ping",
                ThreadMode::Immediate,
                |s: &Self, _: &Ping| s.log.lock().unwrap().push("low".into()),
            )])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_delivery_in_priority_order_with_stable_ties() {
        let bus = EventBus::new();
        let log: Log = Log::default();

        let low = Arc::new(LowRecorder { log: log.clone() });
        let mid_a = Arc::new(MidRecorder {
            log: log.clone(),
            tag: "mid_a",
        });
        let mid_b = Arc::new(MidRecorder {
            log: log.clone(),
            tag: "mid_b",
        });
        let high = Arc::new(HighRecorder { log: log.clone() });

        // Deliberately registered lowest-priority first. The strong handles
        // stay on the stack: subscriptions only hold weak references.
        bus.register(low.clone()).unwrap();
        bus.register(mid_a.clone()).unwrap();
        bus.register(mid_b.clone()).unwrap();
        bus.register(high.clone()).unwrap();

        bus.post(Ping).unwrap();
        assert_eq!(entries(&log), vec!["high", "mid_a", "mid_b", "low"]);
        drop((low, mid_a, mid_b, high));
    }

    // --- reentrancy ---

    #[derive(Debug)]
    struct Begin;
    impl Event for Begin {}

    #[derive(Debug)]
    struct Follow;
    impl Event for Follow {}

    struct Chained {
        bus: EventBus,
        log: Log,
    }
    impl Subscriber for Chained {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![
                HandlerDescriptor::new(
                    "on_begin",
                    ThreadMode::Immediate,
                    |s: &Self, _: &Begin| {
                        s.log.lock().unwrap().push("begin:start".into());
                        s.bus.post(Follow).unwrap();
                        s.log.lock().unwrap().push("begin:end".into());
                    },
                ),
                HandlerDescriptor::new(
                    "on_follow",
                    ThreadMode::Immediate,
                    |s: &Self, _: &Follow| s.log.lock().unwrap().push("follow".into()),
                ),
            ])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_reentrant_post_queues_behind_current_batch() {
        let bus = EventBus::new();
        let log: Log = Log::default();
        let chained = Arc::new(Chained {
            bus: bus.clone(),
            log: log.clone(),
        });
        bus.register(chained.clone()).unwrap();

        bus.post(Begin).unwrap();
        assert_eq!(entries(&log), vec!["begin:start", "begin:end", "follow"]);
    }

    // --- lineage fan-out ---

    #[derive(Debug)]
    struct Alert {
        source: &'static str,
    }
    impl Event for Alert {}

    #[derive(Debug)]
    struct CriticalAlert {
        alert: Alert,
    }
    impl Event for CriticalAlert {
        fn lineage() -> Vec<EventTypeId> {
            vec![EventTypeId::of::<Alert>()]
        }
        fn as_lineage(&self, target: std::any::TypeId) -> Option<&(dyn Any + Send + Sync)> {
            if target == std::any::TypeId::of::<CriticalAlert>() {
                Some(self)
            } else {
                self.alert.as_lineage(target)
            }
        }
    }

    struct AlertSink {
        log: Log,
    }
    impl Subscriber for AlertSink {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![
                HandlerDescriptor::new(
                    "on_critical",
                    ThreadMode::Immediate,
                    |s: &Self, _: &CriticalAlert| s.log.lock().unwrap().push("on_critical".into()),
                ),
                HandlerDescriptor::new(
                    "on_alert",
                    ThreadMode::Immediate,
                    |s: &Self, alert: &Alert| {
                        s.log.lock().unwrap().push(format!("on_alert:{}", alert.source))
                    },
                ),
            ])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_lineage_fanout_delivers_derived_then_ancestor() {
        let bus = EventBus::new();
        let log: Log = Log::default();
        let sink = Arc::new(AlertSink { log: log.clone() });
        bus.register(sink.clone()).unwrap();

        bus.post(CriticalAlert {
            alert: Alert { source: "disk" },
        })
        .unwrap();
        assert_eq!(entries(&log), vec!["on_critical", "on_alert:disk"]);

        log.lock().unwrap().clear();
        bus.post(Alert { source: "net" }).unwrap();
        assert_eq!(entries(&log), vec!["on_alert:net"]);
    }

    #[test]
    fn test_exact_only_dispatch_without_inheritance() {
        let bus = EventBus::builder().event_inheritance(false).build();
        let log: Log = Log::default();
        let sink = Arc::new(AlertSink { log: log.clone() });
        bus.register(sink.clone()).unwrap();

        bus.post(CriticalAlert {
            alert: Alert { source: "disk" },
        })
        .unwrap();
        assert_eq!(entries(&log), vec!["on_critical"]);
    }

    #[test]
    fn test_has_subscriber_for_consults_lineage() {
        let bus = EventBus::new();
        assert!(!bus.has_subscriber_for::<Alert>());

        let sink = Arc::new(AlertSink { log: Log::default() });
        bus.register(sink.clone()).unwrap();
        assert!(bus.has_subscriber_for::<Alert>());
        assert!(bus.has_subscriber_for::<CriticalAlert>());

        bus.unregister(sink.as_ref());
        assert!(!bus.has_subscriber_for::<CriticalAlert>());
    }

    // --- cancellation ---

    #[derive(Debug)]
    struct RootNote;
    impl Event for RootNote {}

    #[derive(Debug)]
    struct Note {
        root: RootNote,
    }
    impl Event for Note {
        fn lineage() -> Vec<EventTypeId> {
            vec![EventTypeId::of::<RootNote>()]
        }
        fn as_lineage(&self, target: std::any::TypeId) -> Option<&(dyn Any + Send + Sync)> {
            if target == std::any::TypeId::of::<Note>() {
                Some(self)
            } else {
                self.root.as_lineage(target)
            }
        }
    }

    struct CancelingFirst {
        bus: EventBus,
        log: Log,
    }
    impl Subscriber for CancelingFirst {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::new(
                "on_note",
                ThreadMode::Immediate,
                |s: &Self, note: &Note| {
                    s.log.lock().unwrap().push("canceler".into());
                    s.bus.cancel_event_delivery(note).unwrap();
                },
            )
            .priority(2)])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct SkippedSecond {
        log: Log,
    }
    impl Subscriber for SkippedSecond {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::new(
                "on_note",
                ThreadMode::Immediate,
                |s: &Self, _: &Note| s.log.lock().unwrap().push("skipped".into()),
            )
            .priority(1)])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct RootWatcher {
        log: Log,
    }
    impl Subscriber for RootWatcher {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::new(
                "on_root",
                ThreadMode::Immediate,
                |s: &Self, _: &RootNote| s.log.lock().unwrap().push("root".into()),
            )])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_cancellation_stops_current_closure_but_not_ancestors() {
        let bus = EventBus::new();
        let log: Log = Log::default();

        let canceler = Arc::new(CancelingFirst {
            bus: bus.clone(),
            log: log.clone(),
        });
        let second = Arc::new(SkippedSecond { log: log.clone() });
        let root = Arc::new(RootWatcher { log: log.clone() });
        bus.register(canceler.clone()).unwrap();
        bus.register(second.clone()).unwrap();
        bus.register(root.clone()).unwrap();

        bus.post(Note { root: RootNote }).unwrap();
        // Later handlers of the Note closure are skipped; the RootNote
        // closure still runs.
        assert_eq!(entries(&log), vec!["canceler", "root"]);
    }

    #[derive(Debug)]
    struct Memo(u32);
    impl Event for Memo {}

    struct WrongEventCanceler {
        bus: EventBus,
        log: Log,
    }
    impl Subscriber for WrongEventCanceler {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::new(
                "on_memo",
                ThreadMode::Immediate,
                |s: &Self, _: &Memo| {
                    let err = s.bus.cancel_event_delivery(&Memo(99)).unwrap_err();
                    s.log.lock().unwrap().push(err.as_label().into());
                },
            )])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct DetachedCanceler {
        bus: EventBus,
        log: Log,
    }
    impl Subscriber for DetachedCanceler {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::new(
                "on_memo",
                ThreadMode::Background,
                |s: &Self, memo: &Memo| {
                    let err = s.bus.cancel_event_delivery(memo).unwrap_err();
                    s.log.lock().unwrap().push(err.as_label().into());
                },
            )])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct NeverMain;
    impl MainContext for NeverMain {
        fn is_main_context(&self) -> bool {
            false
        }
        fn enqueue(&self, _dispatch: MainDispatch) {}
    }

    #[test]
    fn test_cancellation_misuse_is_rejected() {
        let bus = EventBus::new();
        let err = bus.cancel_event_delivery(&Memo(1)).unwrap_err();
        assert_eq!(err.as_label(), "cancel_not_posting");

        let log: Log = Log::default();
        let canceler = Arc::new(WrongEventCanceler {
            bus: bus.clone(),
            log: log.clone(),
        });
        bus.register(canceler.clone()).unwrap();
        bus.post(Memo(1)).unwrap();
        assert_eq!(entries(&log), vec!["cancel_wrong_event"]);

        // With the poster away from the main context, a background handler
        // runs inline; canceling from it is a thread-mode error.
        let detached_bus = EventBus::builder()
            .main_context(Arc::new(NeverMain))
            .build();
        let detached_log: Log = Log::default();
        let detached = Arc::new(DetachedCanceler {
            bus: detached_bus.clone(),
            log: detached_log.clone(),
        });
        detached_bus.register(detached.clone()).unwrap();
        detached_bus.post(Memo(2)).unwrap();
        assert_eq!(entries(&detached_log), vec!["cancel_wrong_thread_mode"]);
    }

    // --- failure containment ---

    #[derive(Debug)]
    struct Boom;
    impl Event for Boom {}

    struct Faulty;
    impl Subscriber for Faulty {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::fallible(
                "on_boom",
                ThreadMode::Immediate,
                |_: &Self, _: &Boom| Err(HandlerError::failed("on_boom", "refused")),
            )
            .priority(1)])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Panicky;
    impl Subscriber for Panicky {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::new(
                "on_boom_panic",
                ThreadMode::Immediate,
                |_: &Self, _: &Boom| panic!("kaboom"),
            )
            .priority(1)])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Steady {
        log: Log,
    }
    impl Subscriber for Steady {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::new(
                "on_boom_steady",
                ThreadMode::Immediate,
                |s: &Self, _: &Boom| s.log.lock().unwrap().push("steady".into()),
            )])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct FailureWatcher {
        log: Log,
    }
    impl Subscriber for FailureWatcher {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::new(
                "on_failure",
                ThreadMode::Immediate,
                |s: &Self, e: &SubscriberExceptionEvent| {
                    let label = e.failure.as_label();
                    assert_eq!(e.failure.is_panic(), label == "handler_panicked");
                    s.log
                        .lock()
                        .unwrap()
                        .push(format!("{}:{}", e.failure.handler(), label));
                },
            )])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_handler_failure_is_contained_and_reposted() {
        init_tracing();
        let bus = EventBus::new();
        let log: Log = Log::default();
        let faulty = Arc::new(Faulty);
        let steady = Arc::new(Steady { log: log.clone() });
        let watcher = Arc::new(FailureWatcher { log: log.clone() });
        bus.register(faulty.clone()).unwrap();
        bus.register(steady.clone()).unwrap();
        bus.register(watcher.clone()).unwrap();

        bus.post(Boom).unwrap();
        // The exception event is queued behind the current batch, so it
        // arrives after the remaining Boom deliveries.
        assert_eq!(entries(&log), vec!["steady", "on_boom:handler_failed"]);
    }

    #[test]
    fn test_handler_panic_is_contained() {
        init_tracing();
        let bus = EventBus::new();
        let log: Log = Log::default();
        let panicky = Arc::new(Panicky);
        let steady = Arc::new(Steady { log: log.clone() });
        let watcher = Arc::new(FailureWatcher { log: log.clone() });
        bus.register(panicky.clone()).unwrap();
        bus.register(steady.clone()).unwrap();
        bus.register(watcher.clone()).unwrap();

        bus.post(Boom).unwrap();
        assert_eq!(
            entries(&log),
            vec!["steady", "on_boom_panic:handler_panicked"]
        );
    }

    #[test]
    fn test_rethrow_surfaces_failure_and_stops_delivery() {
        let bus = EventBus::builder().rethrow_handler_failures(true).build();
        let log: Log = Log::default();
        let faulty = Arc::new(Faulty);
        let steady = Arc::new(Steady { log: log.clone() });
        bus.register(faulty.clone()).unwrap();
        bus.register(steady.clone()).unwrap();

        let err = bus.post(Boom).unwrap_err();
        assert!(matches!(err, BusError::Handler(HandlerError::Failed { .. })));
        assert!(entries(&log).is_empty());
    }

    // --- meta events ---

    #[derive(Debug)]
    struct Orphan;
    impl Event for Orphan {}

    struct OrphanWatcher {
        count: AtomicUsize,
    }
    impl Subscriber for OrphanWatcher {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::new(
                "on_unclaimed",
                ThreadMode::Immediate,
                |s: &Self, e: &NoSubscriberEvent| {
                    if e.event.downcast_ref::<Orphan>().is_some() {
                        s.count.fetch_add(1, Ordering::Relaxed);
                    }
                },
            )])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_unclaimed_event_synthesizes_exactly_one_meta_event() {
        let bus = EventBus::new();
        let watcher = Arc::new(OrphanWatcher {
            count: AtomicUsize::new(0),
        });
        bus.register(watcher.clone()).unwrap();

        bus.post(Orphan).unwrap();
        assert_eq!(watcher.count.load(Ordering::Relaxed), 1);

        // A completely unobserved bus must not recurse on its own meta event.
        let empty = EventBus::new();
        empty.post(Orphan).unwrap();
    }

    // --- sticky events ---

    #[derive(Debug, PartialEq)]
    struct Level(u32);
    impl Event for Level {}

    struct LevelWatcher {
        seen: Mutex<Vec<u32>>,
    }
    impl Subscriber for LevelWatcher {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::new(
                "on_level",
                ThreadMode::Immediate,
                |s: &Self, level: &Level| s.seen.lock().unwrap().push(level.0),
            )
            .sticky(true)])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_sticky_replay_on_registration() {
        let bus = EventBus::new();
        bus.post_sticky(Level(1)).unwrap();

        let watcher = Arc::new(LevelWatcher {
            seen: Mutex::new(Vec::new()),
        });
        bus.register(watcher.clone()).unwrap();
        assert_eq!(*watcher.seen.lock().unwrap(), vec![1]);

        bus.post_sticky(Level(2)).unwrap();
        assert_eq!(*watcher.seen.lock().unwrap(), vec![1, 2]);

        assert_eq!(bus.get_sticky::<Level>().unwrap().0, 2);
        assert_eq!(bus.remove_sticky::<Level>().unwrap().0, 2);
        assert!(bus.get_sticky::<Level>().is_none());
    }

    #[test]
    fn test_remove_sticky_if_equals() {
        let bus = EventBus::new();
        bus.post_sticky(Level(3)).unwrap();

        assert!(!bus.remove_sticky_if_equals(&Level(4)));
        assert!(bus.get_sticky::<Level>().is_some());

        assert!(bus.remove_sticky_if_equals(&Level(3)));
        assert!(bus.get_sticky::<Level>().is_none());

        bus.post_sticky(Level(5)).unwrap();
        bus.remove_all_sticky();
        assert!(bus.get_sticky::<Level>().is_none());
    }

    struct StickyAlertWatcher {
        log: Log,
    }
    impl Subscriber for StickyAlertWatcher {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::new(
                "on_alert_sticky",
                ThreadMode::Immediate,
                |s: &Self, alert: &Alert| {
                    s.log.lock().unwrap().push(format!("sticky:{}", alert.source))
                },
            )
            .sticky(true)])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_sticky_replay_follows_lineage() {
        let bus = EventBus::new();
        bus.post_sticky(CriticalAlert {
            alert: Alert { source: "raid" },
        })
        .unwrap();

        let log: Log = Log::default();
        let watcher = Arc::new(StickyAlertWatcher { log: log.clone() });
        bus.register(watcher.clone()).unwrap();
        assert_eq!(entries(&log), vec!["sticky:raid"]);
    }

    // --- registration errors ---

    struct Silent;
    impl Subscriber for Silent {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(Vec::new())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_register_rejects_handlerless_subscriber() {
        let bus = EventBus::new();
        let silent = Arc::new(Silent);
        let err = bus.register(silent.clone()).unwrap_err();
        assert_eq!(err.as_label(), "no_handlers");
        assert!(!bus.is_registered(silent.as_ref()));
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let bus = EventBus::new();
        let sink = Arc::new(LowRecorder { log: Log::default() });

        bus.register(sink.clone()).unwrap();
        let err = bus.register(sink.clone()).unwrap_err();
        assert_eq!(err.as_label(), "already_registered");
        assert!(bus.is_registered(sink.as_ref()));

        bus.unregister(sink.as_ref());
        assert!(!bus.is_registered(sink.as_ref()));
        bus.register(sink).unwrap();
    }

    // --- detached contexts ---

    #[derive(Debug)]
    struct Job(u64);
    impl Event for Job {}

    struct BackgroundSink {
        tx: mpsc::Sender<(u64, thread::ThreadId)>,
    }
    impl Subscriber for BackgroundSink {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::new(
                "on_job",
                ThreadMode::Background,
                |s: &Self, job: &Job| {
                    let _ = s.tx.send((job.0, thread::current().id()));
                },
            )])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_background_delivery_is_serialized_in_order() {
        let bus = EventBus::new();
        let (tx, rx) = mpsc::channel();
        let sink = Arc::new(BackgroundSink { tx });
        bus.register(sink.clone()).unwrap();

        for n in 1..=3 {
            bus.post(Job(n)).unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            let (n, worker) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_ne!(worker, thread::current().id());
            seen.push(n);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    struct AsyncSink {
        tx: mpsc::Sender<thread::ThreadId>,
    }
    impl Subscriber for AsyncSink {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::new(
                "on_job_async",
                ThreadMode::Async,
                |s: &Self, _: &Job| {
                    let _ = s.tx.send(thread::current().id());
                },
            )])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_async_delivery_leaves_posting_thread() {
        let bus = EventBus::new();
        let (tx, rx) = mpsc::channel();
        let sink = Arc::new(AsyncSink { tx });
        bus.register(sink.clone()).unwrap();

        bus.post(Job(7)).unwrap();
        let worker = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_ne!(worker, thread::current().id());
    }

    #[derive(Debug)]
    struct Hold;
    impl Event for Hold {}

    #[derive(Debug)]
    struct Probe;
    impl Event for Probe {}

    struct Gate {
        started: mpsc::Sender<()>,
        release: Mutex<mpsc::Receiver<()>>,
    }
    impl Subscriber for Gate {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::new(
                "on_hold",
                ThreadMode::Background,
                |s: &Self, _: &Hold| {
                    let _ = s.started.send(());
                    let _ = s.release.lock().unwrap().recv();
                },
            )])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct ProbeSink {
        tx: mpsc::Sender<()>,
    }
    impl Subscriber for ProbeSink {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::new(
                "on_probe",
                ThreadMode::Background,
                |s: &Self, _: &Probe| {
                    let _ = s.tx.send(());
                },
            )])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_unregister_drops_inflight_detached_delivery() {
        let bus = EventBus::new();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let (probe_tx, probe_rx) = mpsc::channel();

        let gate = Arc::new(Gate {
            started: started_tx,
            release: Mutex::new(release_rx),
        });
        bus.register(gate.clone()).unwrap();
        let probe = Arc::new(ProbeSink { tx: probe_tx });
        bus.register(probe.clone()).unwrap();

        // Occupy the serialized worker, queue a probe behind it, then
        // unregister the probe before the worker reaches it.
        bus.post(Hold).unwrap();
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        bus.post(Probe).unwrap();
        bus.unregister(probe.as_ref());
        release_tx.send(()).unwrap();

        assert!(probe_rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    // --- main context ---

    struct ChannelMain {
        tx: mpsc::Sender<MainDispatch>,
        main_thread: thread::ThreadId,
    }
    impl MainContext for ChannelMain {
        fn is_main_context(&self) -> bool {
            thread::current().id() == self.main_thread
        }
        fn enqueue(&self, dispatch: MainDispatch) {
            let _ = self.tx.send(dispatch);
        }
    }

    struct MainSink {
        tx: mpsc::Sender<thread::ThreadId>,
    }
    impl Subscriber for MainSink {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::new(
                "on_job_main",
                ThreadMode::Main,
                |s: &Self, _: &Job| {
                    let _ = s.tx.send(thread::current().id());
                },
            )])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_main_mode_runs_on_the_designated_context() {
        let (dispatch_tx, dispatch_rx) = mpsc::channel::<MainDispatch>();
        let (id_tx, id_rx) = mpsc::channel();
        let consumer = thread::spawn(move || {
            id_tx.send(thread::current().id()).unwrap();
            while let Ok(dispatch) = dispatch_rx.recv() {
                dispatch.run();
            }
        });
        let main_thread = id_rx.recv().unwrap();

        let bus = EventBus::builder()
            .main_context(Arc::new(ChannelMain {
                tx: dispatch_tx,
                main_thread,
            }))
            .build();
        let (tx, rx) = mpsc::channel();
        let sink = Arc::new(MainSink { tx });
        bus.register(sink.clone()).unwrap();

        bus.post(Job(1)).unwrap();
        let handled_on = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(handled_on, main_thread);

        drop(bus);
        consumer.join().unwrap();
    }

    struct OrderedSink {
        log: Log,
    }
    impl Subscriber for OrderedSink {
        fn subscriber_info(&self) -> SubscriberInfo {
            SubscriberInfo::of::<Self>(vec![HandlerDescriptor::new(
                "on_memo_ordered",
                ThreadMode::MainOrdered,
                |s: &Self, memo: &Memo| s.log.lock().unwrap().push(format!("ordered:{}", memo.0)),
            )])
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_main_ordered_always_enqueues_even_on_the_main_context() {
        let (dispatch_tx, dispatch_rx) = mpsc::channel::<MainDispatch>();
        let bus = EventBus::builder()
            .main_context(Arc::new(ChannelMain {
                tx: dispatch_tx,
                main_thread: thread::current().id(),
            }))
            .build();
        let log: Log = Log::default();
        let sink = Arc::new(OrderedSink { log: log.clone() });
        bus.register(sink.clone()).unwrap();

        bus.post(Memo(1)).unwrap();
        bus.post(Memo(2)).unwrap();
        // The poster is the designated context, yet nothing may run inline.
        assert!(entries(&log).is_empty());

        while let Ok(dispatch) = dispatch_rx.try_recv() {
            dispatch.run();
        }
        assert_eq!(entries(&log), vec!["ordered:1", "ordered:2"]);
    }

    // --- descriptor sources ---

    struct TableServed {
        count: AtomicUsize,
    }
    impl Subscriber for TableServed {
        fn subscriber_info(&self) -> SubscriberInfo {
            unreachable!("the handler table comes from the registered source")
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct TableSource;
    impl DescriptorSource for TableSource {
        fn lookup(&self, subscriber_type: TypeId) -> Option<SubscriberInfo> {
            (subscriber_type == TypeId::of::<TableServed>()).then(|| {
                SubscriberInfo::of::<TableServed>(vec![HandlerDescriptor::new(
                    "on_ping_served",
                    ThreadMode::Immediate,
                    |s: &TableServed, _: &Ping| {
                        s.count.fetch_add(1, Ordering::Relaxed);
                    },
                )])
            })
        }
    }

    #[test]
    fn test_descriptor_source_preempts_subscriber_info() {
        let bus = EventBus::builder()
            .descriptor_source(Arc::new(TableSource))
            .build();
        let served = Arc::new(TableServed {
            count: AtomicUsize::new(0),
        });
        bus.register(served.clone()).unwrap();

        bus.post(Ping).unwrap();
        assert_eq!(served.count.load(Ordering::Relaxed), 1);
    }

    // --- global instance ---

    #[test]
    fn test_global_bus_is_a_singleton() {
        assert!(std::ptr::eq(EventBus::global(), EventBus::global()));
        EventBus::global().post(Orphan).unwrap();
    }
}
