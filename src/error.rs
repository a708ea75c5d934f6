//! Error types used by the bus and by handler invocations.
//!
//! This module defines two main error enums:
//!
//! - [`BusError`] — errors surfaced synchronously to the caller of a bus
//!   operation (`register`, `cancel_event_delivery`, and `post` when failure
//!   rethrow is enabled).
//! - [`HandlerError`] — failures raised by a single handler invocation. These
//!   are contained: they never abort delivery to the remaining subscribers and
//!   are reported through the configured side channels.
//!
//! Both types provide an `as_label` helper returning a short stable string for
//! logs/metrics.

use thiserror::Error;

/// # Errors surfaced to the caller of a bus operation.
///
/// Registration problems (no handlers, malformed declarations, duplicates) and
/// cancellation misuse are fatal to the call that triggered them and leave the
/// bus state untouched.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BusError {
    /// The subscriber type (including its declared parent chain) yields zero
    /// eligible handlers.
    #[error("subscriber {subscriber} declares no usable handlers")]
    NoHandlers {
        /// Type name of the offending subscriber.
        subscriber: &'static str,
    },

    /// A malformed handler declaration was encountered while strict
    /// verification is enabled.
    #[error("subscriber {subscriber} has a malformed handler `{handler}`: {detail}")]
    MalformedHandler {
        /// Type name of the offending subscriber.
        subscriber: &'static str,
        /// Name of the malformed handler declaration.
        handler: &'static str,
        /// What made the declaration ineligible.
        detail: String,
    },

    /// The same (subscriber, event type, handler) triple was registered twice.
    #[error("subscriber {subscriber} already registered for event {event}")]
    AlreadyRegistered {
        /// Type name of the subscriber.
        subscriber: &'static str,
        /// Type name of the event the duplicate handler is declared for.
        event: &'static str,
    },

    /// `cancel_event_delivery` was called outside a posting handler.
    #[error("delivery can only be canceled from a handler on the posting thread")]
    CancelNotPosting,

    /// `cancel_event_delivery` was called for an event other than the one
    /// currently being delivered.
    #[error("only the event currently being delivered can be canceled")]
    CancelWrongEvent,

    /// `cancel_event_delivery` was called from a handler whose thread mode is
    /// not [`ThreadMode::Immediate`](crate::ThreadMode::Immediate).
    #[error("only immediate-mode handlers can cancel delivery")]
    CancelWrongThreadMode,

    /// A handler failure rethrown to the posting caller
    /// (requires `rethrow_handler_failures`).
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl BusError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use postbus::BusError;
    ///
    /// let err = BusError::NoHandlers { subscriber: "app::Probe" };
    /// assert_eq!(err.as_label(), "no_handlers");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            BusError::NoHandlers { .. } => "no_handlers",
            BusError::MalformedHandler { .. } => "malformed_handler",
            BusError::AlreadyRegistered { .. } => "already_registered",
            BusError::CancelNotPosting => "cancel_not_posting",
            BusError::CancelWrongEvent => "cancel_wrong_event",
            BusError::CancelWrongThreadMode => "cancel_wrong_thread_mode",
            BusError::Handler(_) => "handler_failed",
        }
    }
}

/// # Failures raised while invoking a single handler.
///
/// Contained by the dispatch engine: a failing handler never corrupts delivery
/// to other subscriptions. Depending on configuration the failure is logged,
/// rethrown to the poster, and/or re-posted as a
/// [`SubscriberExceptionEvent`](crate::SubscriberExceptionEvent).
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum HandlerError {
    /// The handler returned an error.
    #[error("handler `{handler}` failed: {message}")]
    Failed {
        /// Name of the failing handler.
        handler: &'static str,
        /// The underlying error message.
        message: String,
    },

    /// The handler panicked; the panic was caught at the invocation boundary.
    #[error("handler `{handler}` panicked: {message}")]
    Panicked {
        /// Name of the panicking handler.
        handler: &'static str,
        /// Panic payload rendered as text.
        message: String,
    },

    /// The subscriber or event value could not be downcast to the types the
    /// handler was declared for. Indicates a broken descriptor table.
    #[error("handler `{handler}` cannot receive this subscriber/event pair")]
    TypeMismatch {
        /// Name of the handler with the mismatched declaration.
        handler: &'static str,
    },
}

impl HandlerError {
    /// Builds a [`HandlerError::Failed`] from any displayable error.
    pub fn failed(handler: &'static str, error: impl std::fmt::Display) -> Self {
        HandlerError::Failed {
            handler,
            message: error.to_string(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use postbus::HandlerError;
    ///
    /// let err = HandlerError::failed("on_tick", "boom");
    /// assert_eq!(err.as_label(), "handler_failed");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            HandlerError::Failed { .. } => "handler_failed",
            HandlerError::Panicked { .. } => "handler_panicked",
            HandlerError::TypeMismatch { .. } => "handler_type_mismatch",
        }
    }

    /// True if the failure came from a caught panic.
    pub fn is_panic(&self) -> bool {
        matches!(self, HandlerError::Panicked { .. })
    }

    /// Name of the handler the failure originated from.
    pub fn handler(&self) -> &'static str {
        match self {
            HandlerError::Failed { handler, .. }
            | HandlerError::Panicked { handler, .. }
            | HandlerError::TypeMismatch { handler } => handler,
        }
    }
}
