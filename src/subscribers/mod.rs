//! Subscriber-side types: handler descriptors, descriptor resolution, and the
//! subscription registry.

mod descriptor;
mod registry;
mod resolver;

pub use descriptor::{
    DescriptorSource, HandlerDescriptor, HandlerResult, MalformedHandler, Subscriber,
    SubscriberInfo, ThreadMode,
};
pub(crate) use registry::{Registry, Subscription};
pub(crate) use resolver::{clear_descriptor_cache, DescriptorResolver};
