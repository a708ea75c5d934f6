//! # Descriptor resolution.
//!
//! Turns a subscriber's concrete type into its final, deduplicated handler
//! list. The walk starts at the concrete type's table — taken from the first
//! [`DescriptorSource`] that knows the type, otherwise from
//! [`Subscriber::subscriber_info`] — and follows parent links up the emulated
//! inheritance chain.
//!
//! ## Override resolution
//! Two-level check, cheap in the common case:
//! 1. keyed by event type only — a subscriber rarely declares two handlers
//!    for one event type, so most candidates are accepted here;
//! 2. on collision, escalate to the full signature (handler name + event
//!    type) and compare declaring levels: the more-derived declaration wins
//!    (an override), distinct signatures for the same event type are all kept.
//!
//! ## Caching and pooling
//! The final list is cached process-wide per subscriber type until
//! [`EventBus::clear_caches`](crate::EventBus::clear_caches). The walk's
//! scratch maps come from a small bounded pool so a hot registration path does
//! not churn allocations.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use tracing::debug;

use crate::error::BusError;
use crate::subscribers::descriptor::{DescriptorSource, HandlerDescriptor, Subscriber, SubscriberInfo};

const SCRATCH_POOL_SIZE: usize = 4;

/// Resolution result for one subscriber type: its name and the final handler
/// list in declaration order after override resolution.
#[derive(Clone)]
pub(crate) struct ResolvedSubscriber {
    pub(crate) type_name: &'static str,
    pub(crate) handlers: Arc<[Arc<HandlerDescriptor>]>,
}

impl std::fmt::Debug for ResolvedSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSubscriber")
            .field("type_name", &self.type_name)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

type DescriptorCache = RwLock<HashMap<TypeId, ResolvedSubscriber>>;

fn cache() -> &'static DescriptorCache {
    static CACHE: OnceLock<DescriptorCache> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Drops every cached handler list.
pub(crate) fn clear_descriptor_cache() {
    if let Ok(mut map) = cache().write() {
        map.clear();
    }
}

/// Resolves and caches handler lists for subscriber types.
pub(crate) struct DescriptorResolver {
    sources: Vec<Arc<dyn DescriptorSource>>,
    strict: bool,
    scratch_pool: Mutex<Vec<FindState>>,
}

impl DescriptorResolver {
    pub(crate) fn new(sources: Vec<Arc<dyn DescriptorSource>>, strict: bool) -> Self {
        Self {
            sources,
            strict,
            scratch_pool: Mutex::new(Vec::new()),
        }
    }

    /// The final handler list for `subscriber`'s concrete type.
    ///
    /// Fails with [`BusError::NoHandlers`] when the type (including its parent
    /// chain) declares nothing usable, and with [`BusError::MalformedHandler`]
    /// for a malformed declaration under strict verification.
    pub(crate) fn resolve(&self, subscriber: &dyn Subscriber) -> Result<ResolvedSubscriber, BusError> {
        let subscriber_type = subscriber.as_any().type_id();
        if let Ok(map) = cache().read() {
            if let Some(hit) = map.get(&subscriber_type) {
                return Ok(hit.clone());
            }
        }

        let info = self
            .lookup_sources(subscriber_type)
            .unwrap_or_else(|| subscriber.subscriber_info());

        let mut state = self.checkout_scratch();
        let collected = self.collect(&info, &mut state);
        let handlers = state.take_handlers();
        self.release_scratch(state);
        collected?;

        if handlers.is_empty() {
            return Err(BusError::NoHandlers {
                subscriber: info.type_name(),
            });
        }

        let resolved = ResolvedSubscriber {
            type_name: info.type_name(),
            handlers: handlers.into(),
        };
        if let Ok(mut map) = cache().write() {
            return Ok(map.entry(subscriber_type).or_insert(resolved).clone());
        }
        Ok(resolved)
    }

    fn lookup_sources(&self, subscriber_type: TypeId) -> Option<SubscriberInfo> {
        self.sources
            .iter()
            .find_map(|source| source.lookup(subscriber_type))
    }

    /// Walks the level chain, accumulating accepted handlers into `state`.
    fn collect(&self, info: &SubscriberInfo, state: &mut FindState) -> Result<(), BusError> {
        let mut level = Some(info);
        let mut depth = 0usize;
        while let Some(current) = level {
            for malformed in current.malformed_handlers() {
                if self.strict {
                    return Err(BusError::MalformedHandler {
                        subscriber: info.type_name(),
                        handler: malformed.name,
                        detail: malformed.detail.clone(),
                    });
                }
                debug!(
                    subscriber = current.type_name(),
                    handler = malformed.name,
                    detail = %malformed.detail,
                    "skipping malformed handler declaration"
                );
            }
            for descriptor in current.handlers() {
                if state.check_add(descriptor, depth) {
                    state.accept(descriptor.clone());
                }
            }
            level = current.parent_info();
            depth += 1;
        }
        Ok(())
    }

    fn checkout_scratch(&self) -> FindState {
        if let Ok(mut pool) = self.scratch_pool.lock() {
            if let Some(state) = pool.pop() {
                return state;
            }
        }
        FindState::default()
    }

    fn release_scratch(&self, mut state: FindState) {
        state.reset();
        if let Ok(mut pool) = self.scratch_pool.lock() {
            if pool.len() < SCRATCH_POOL_SIZE {
                pool.push(state);
            }
        }
    }
}

/// How many handlers have claimed one event type at the current point of the
/// walk.
enum EventSeen {
    One { name: &'static str, depth: usize },
    Many,
}

/// Reusable working set for one resolution walk.
#[derive(Default)]
struct FindState {
    found: Vec<Arc<HandlerDescriptor>>,
    seen_by_event: HashMap<TypeId, EventSeen>,
    seen_by_signature: HashMap<(&'static str, TypeId), usize>,
}

impl FindState {
    fn accept(&mut self, descriptor: HandlerDescriptor) {
        self.found.push(Arc::new(descriptor));
    }

    fn take_handlers(&mut self) -> Vec<Arc<HandlerDescriptor>> {
        std::mem::take(&mut self.found)
    }

    fn reset(&mut self) {
        self.found.clear();
        self.seen_by_event.clear();
        self.seen_by_signature.clear();
    }

    /// Accepts `descriptor` unless a more-derived declaration of the same
    /// signature already claimed its event type.
    fn check_add(&mut self, descriptor: &HandlerDescriptor, depth: usize) -> bool {
        let event = descriptor.event_type().id();
        match self.seen_by_event.insert(
            event,
            EventSeen::One {
                name: descriptor.name(),
                depth,
            },
        ) {
            None => true,
            Some(existing) => {
                if let EventSeen::One { name, depth } = existing {
                    // Move the earlier claimant to the signature level before
                    // judging the newcomer against it.
                    self.check_signature(name, event, depth);
                }
                self.seen_by_event.insert(event, EventSeen::Many);
                self.check_signature(descriptor.name(), event, depth)
            }
        }
    }

    fn check_signature(&mut self, name: &'static str, event: TypeId, depth: usize) -> bool {
        match self.seen_by_signature.get(&(name, event)) {
            Some(&existing_depth) if existing_depth <= depth => false,
            _ => {
                self.seen_by_signature.insert((name, event), depth);
                true
            }
        }
    }
}
