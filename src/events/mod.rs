//! Event types and the polymorphic-dispatch lineage resolver.

mod event;
mod lineage;

pub use event::{Event, EventTypeId, NoSubscriberEvent, PostedEvent, SubscriberExceptionEvent};

pub(crate) use lineage::{clear_lineage_cache, full_lineage};
