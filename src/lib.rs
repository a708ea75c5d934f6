//! # postbus
//!
//! **Postbus** is an in-process typed publish/subscribe event bus for Rust.
//!
//! Posters and subscribers are decoupled through event types: a subscriber
//! declares which event types it handles and how each handler is scheduled,
//! and the bus fans every posted event out to all matching handlers across
//! the event's declared type lineage. The crate is designed as a building
//! block for applications that want loose coupling between components
//! without wiring explicit channels.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   register(subscriber)                         post(event)
//!         │                                           │
//!         ▼                                           ▼
//! ┌───────────────────┐                   ┌───────────────────────┐
//! │ DescriptorResolver│                   │ per-thread post queue │
//! │ - sources first   │                   │ (reentrant, FIFO)     │
//! │ - subscriber_info │                   └──────────┬────────────┘
//! │ - override dedup  │                              ▼
//! │ - process cache   │                   ┌───────────────────────┐
//! └─────────┬─────────┘                   │  lineage fan-out      │
//!           ▼                             │  (type + ancestors +  │
//! ┌───────────────────┐                   │   capability markers) │
//! │     Registry      │◄──── snapshot ────┴──────────┬────────────┘
//! │ by event type,    │                              ▼
//! │ priority ordered  │                   ┌───────────────────────┐
//! └─────────┬─────────┘                   │   per-subscription    │
//!           │ sticky handlers             │       routing         │
//!           ▼                             └──────────┬────────────┘
//! ┌───────────────────┐         ┌─────────────┬──────┴─────┬───────────────┐
//! │    StickyStore    │         ▼             ▼            ▼               ▼
//! │ latest per type,  │     Immediate    Main/Ordered   Background       Async
//! │ replay on register│     (inline)    (MainContext)  (one worker)   (blocking
//! └───────────────────┘                                                  pool)
//! ```
//!
//! ### Delivery rules
//! ```text
//! post(E)
//!   ├─► queue behind any in-progress batch on this thread (reentrancy)
//!   ├─► for each type in lineage(E):          # one "closure" per type
//!   │     for each subscription, priority desc, ties in registration order:
//!   │       ├─ Immediate   ─► run on the posting thread
//!   │       ├─ Main        ─► inline if already on the main context,
//!   │       │                 else enqueue to MainContext
//!   │       ├─ MainOrdered ─► always enqueue (FIFO among MainOrdered)
//!   │       ├─ Background  ─► serialized worker (inline when the poster
//!   │       │                 is not the main context)
//!   │       └─ Async       ─► blocking pool, concurrent
//!   │     cancel_event_delivery stops the REMAINDER OF THIS CLOSURE only
//!   └─► nothing matched anywhere ─► NoSubscriberEvent (if enabled)
//!
//! handler failure ─► contained: log / SubscriberExceptionEvent / rethrow
//!                    per BusConfig; other subscriptions still run
//! ```
//!
//! ## Features
//! | Area              | Description                                                       | Key types / traits                        |
//! |-------------------|-------------------------------------------------------------------|-------------------------------------------|
//! | **Bus API**       | Register, post, sticky events, cancellation.                      | [`EventBus`], [`EventBusBuilder`]         |
//! | **Subscribers**   | Declare handlers as data; emulated inheritance; external tables.  | [`Subscriber`], [`SubscriberInfo`], [`DescriptorSource`] |
//! | **Handlers**      | Per-handler scheduling, priority, sticky replay.                  | [`HandlerDescriptor`], [`ThreadMode`]     |
//! | **Events**        | Typed events with a declared lineage for polymorphic fan-out.     | [`Event`], [`EventTypeId`], [`PostedEvent`] |
//! | **Meta events**   | Built-in events about delivery itself.                            | [`NoSubscriberEvent`], [`SubscriberExceptionEvent`] |
//! | **Main context**  | Bridge to a host UI/game loop for main-thread handlers.           | [`MainContext`], [`MainDispatch`]         |
//! | **Errors**        | Typed errors for registration, cancellation, handler failures.    | [`BusError`], [`HandlerError`]            |
//! | **Configuration** | Centralize dispatch behavior.                                     | [`BusConfig`]                             |
//!
//! ## Example
//! ```rust
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::sync::Arc;
//! use postbus::{Event, EventBus, HandlerDescriptor, Subscriber, SubscriberInfo, ThreadMode};
//!
//! #[derive(Debug)]
//! struct OrderPlaced {
//!     amount_cents: u64,
//! }
//! impl Event for OrderPlaced {}
//!
//! #[derive(Default)]
//! struct Revenue {
//!     total: AtomicU64,
//! }
//!
//! impl Revenue {
//!     fn on_order(&self, order: &OrderPlaced) {
//!         self.total.fetch_add(order.amount_cents, Ordering::Relaxed);
//!     }
//! }
//!
//! impl Subscriber for Revenue {
//!     fn subscriber_info(&self) -> SubscriberInfo {
//!         SubscriberInfo::of::<Self>(vec![
//!             HandlerDescriptor::new("on_order", ThreadMode::Immediate, Revenue::on_order),
//!         ])
//!     }
//!
//!     fn as_any(&self) -> &dyn std::any::Any {
//!         self
//!     }
//! }
//!
//! fn main() -> Result<(), postbus::BusError> {
//!     let bus = EventBus::new();
//!
//!     let revenue = Arc::new(Revenue::default());
//!     bus.register(revenue.clone())?;
//!
//!     bus.post(OrderPlaced { amount_cents: 1250 })?;
//!     bus.post(OrderPlaced { amount_cents: 800 })?;
//!
//!     assert_eq!(revenue.total.load(Ordering::Relaxed), 2050);
//!
//!     bus.unregister(revenue.as_ref());
//!     Ok(())
//! }
//! ```

mod bus;
mod config;
mod dispatch;
mod error;
mod events;
mod sticky;
mod subscribers;

// ---- Public re-exports ----

pub use bus::{EventBus, EventBusBuilder};
pub use config::BusConfig;
pub use dispatch::{MainContext, MainDispatch};
pub use error::{BusError, HandlerError};
pub use events::{Event, EventTypeId, NoSubscriberEvent, PostedEvent, SubscriberExceptionEvent};
pub use subscribers::{
    DescriptorSource, HandlerDescriptor, HandlerResult, MalformedHandler, Subscriber,
    SubscriberInfo, ThreadMode,
};
