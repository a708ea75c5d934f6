//! # Type-lineage resolver.
//!
//! Expands an event type's declared lineage into the full ordered set of
//! types considered for polymorphic fan-out: the type itself, then every
//! declared supertype and capability marker, transitively.
//!
//! ## Rules
//! - Order is deterministic: the concrete type first, then its declarations
//!   breadth-first in declaration order.
//! - Duplicates (diamond declarations) are kept once, at their first position.
//! - The expansion is computed lazily and cached process-wide for the life of
//!   the process; [`clear_lineage_cache`] exists for test isolation and is the
//!   only eviction path.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use super::event::EventTypeId;

type LineageCache = RwLock<HashMap<TypeId, Arc<[EventTypeId]>>>;

fn cache() -> &'static LineageCache {
    static CACHE: OnceLock<LineageCache> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Full ordered lineage of `ty`: the type itself plus everything it declares,
/// transitively, deduplicated.
pub(crate) fn full_lineage(ty: EventTypeId) -> Arc<[EventTypeId]> {
    if let Ok(map) = cache().read() {
        if let Some(hit) = map.get(&ty.id()) {
            return Arc::clone(hit);
        }
    }

    let expanded: Arc<[EventTypeId]> = expand(ty).into();
    if let Ok(mut map) = cache().write() {
        // A racing thread may have inserted the same expansion; both results
        // are identical, keep whichever landed first.
        return Arc::clone(map.entry(ty.id()).or_insert(expanded));
    }
    expanded
}

fn expand(ty: EventTypeId) -> Vec<EventTypeId> {
    let mut out = vec![ty];
    let mut i = 0;
    while i < out.len() {
        for parent in out[i].declared_lineage() {
            if !out.contains(&parent) {
                out.push(parent);
            }
        }
        i += 1;
    }
    out
}

/// Drops every cached expansion.
pub(crate) fn clear_lineage_cache() {
    if let Ok(mut map) = cache().write() {
        map.clear();
    }
}
