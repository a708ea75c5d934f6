//! # Bus behavior configuration.
//!
//! [`BusConfig`] holds the value-typed knobs of the dispatch engine: whether
//! fan-out follows the event's type lineage, how handler failures and
//! no-subscriber posts are reported, and how strictly handler declarations are
//! verified.
//!
//! Collaborator objects that are not plain values (descriptor sources, the
//! main-context provider, the runtime handle) are supplied through
//! [`EventBusBuilder`](crate::EventBusBuilder) instead.
//!
//! # Example
//! ```
//! use postbus::BusConfig;
//!
//! let mut cfg = BusConfig::default();
//! cfg.event_inheritance = false;
//! cfg.rethrow_handler_failures = true;
//!
//! assert!(cfg.log_handler_failures);
//! ```

/// Value-typed configuration for an [`EventBus`](crate::EventBus).
#[derive(Clone, Debug)]
pub struct BusConfig {
    /// Fan a posted event out to handlers of its whole type lineage
    /// (ancestors and capability markers), not just the exact type.
    pub event_inheritance: bool,
    /// Fail registration on a malformed handler declaration instead of
    /// silently skipping it.
    pub strict_handler_verification: bool,
    /// Log (debug level) when a posted event finds no subscriber.
    pub log_no_subscriber: bool,
    /// Log (error level) handler failures.
    pub log_handler_failures: bool,
    /// Surface an immediate-mode handler failure to the caller of `post`
    /// instead of containing it.
    pub rethrow_handler_failures: bool,
    /// Re-post a contained handler failure as a
    /// [`SubscriberExceptionEvent`](crate::SubscriberExceptionEvent).
    pub emit_subscriber_exception_event: bool,
    /// Post a [`NoSubscriberEvent`](crate::NoSubscriberEvent) when an event
    /// finds no subscriber across its whole lineage.
    pub emit_no_subscriber_event: bool,
}

impl Default for BusConfig {
    /// Provides a default configuration:
    /// - `event_inheritance = true`
    /// - `strict_handler_verification = false`
    /// - `log_no_subscriber = true`
    /// - `log_handler_failures = true`
    /// - `rethrow_handler_failures = false`
    /// - `emit_subscriber_exception_event = true`
    /// - `emit_no_subscriber_event = true`
    fn default() -> Self {
        Self {
            event_inheritance: true,
            strict_handler_verification: false,
            log_no_subscriber: true,
            log_handler_failures: true,
            rethrow_handler_failures: false,
            emit_subscriber_exception_event: true,
            emit_no_subscriber_event: true,
        }
    }
}
