//! # Detached execution contexts.
//!
//! Non-immediate thread modes hand a captured `(subscription, event)` pair to
//! one of three contexts:
//!
//! ```text
//!  route(subscription, event)
//!      ├─ Main / MainOrdered ──► host's MainContext queue ─► MainDispatch::run()
//!      ├─ Background ─────────► [unbounded queue] ─► one worker, serialized
//!      └─ Async ──────────────► spawn_blocking (unordered pool, concurrent)
//! ```
//!
//! Every captured dispatch re-checks `Subscription::is_active` at execution
//! time and silently drops itself if the subscriber unregistered in between.
//!
//! The bus never implements a main loop itself: [`MainContext`] is the
//! abstract single-consumer context (a UI thread, a game loop) supplied at
//! construction. Without one, main-mode handlers run on the posting thread.

use std::sync::{Arc, Weak};

use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;

use crate::bus::BusCore;
use crate::events::PostedEvent;
use crate::subscribers::Subscription;

/// A captured non-immediate delivery.
pub(crate) struct PendingPost {
    pub(crate) subscription: Arc<Subscription>,
    pub(crate) event: PostedEvent,
}

/// One unit of work handed to the host's main context.
///
/// The host's single-consumer loop executes queued dispatches in FIFO order by
/// calling [`MainDispatch::run`]. Running after the bus is gone is a no-op.
pub struct MainDispatch {
    bus: Weak<BusCore>,
    pending: PendingPost,
}

impl MainDispatch {
    pub(crate) fn new(bus: Weak<BusCore>, pending: PendingPost) -> Self {
        Self { bus, pending }
    }

    /// Executes the captured delivery on the current thread.
    pub fn run(self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.invoke_pending(self.pending);
        }
    }
}

impl std::fmt::Debug for MainDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainDispatch")
            .field("subscriber", &self.pending.subscription.subscriber_name())
            .field("event", &self.pending.event.type_id())
            .finish()
    }
}

/// The designated single-consumer execution context for `Main` and
/// `MainOrdered` handlers.
///
/// Implementations must execute enqueued dispatches on one thread, in FIFO
/// order relative to other enqueues.
pub trait MainContext: Send + Sync {
    /// True if the calling thread is the context's consumer thread.
    fn is_main_context(&self) -> bool;

    /// Queues one dispatch for asynchronous execution on the consumer thread.
    fn enqueue(&self, dispatch: MainDispatch);
}

/// The tokio runtime the detached contexts execute on: either an externally
/// provided handle or a small runtime owned by the bus.
pub(crate) struct Executor {
    handle: Handle,
    owned: Option<Runtime>,
}

impl Executor {
    /// Adopts the caller's runtime.
    pub(crate) fn shared(handle: Handle) -> Self {
        Self {
            handle,
            owned: None,
        }
    }

    /// Adopts the ambient runtime when called from within one, otherwise
    /// builds and owns a small multi-thread runtime.
    pub(crate) fn ambient_or_owned() -> Self {
        if let Ok(handle) = Handle::try_current() {
            return Self::shared(handle);
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("postbus-dispatch")
            .build()
            .expect("failed to build the dispatch runtime");
        Self {
            handle: runtime.handle().clone(),
            owned: Some(runtime),
        }
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // An owned runtime may be dropped from inside another runtime's
        // worker; shutdown_background avoids the blocking-drop panic.
        if let Some(runtime) = self.owned.take() {
            runtime.shutdown_background();
        }
    }
}

/// Spawns the serialized background worker and returns its submission handle.
///
/// The worker holds only a weak reference to the bus: dropping the last bus
/// handle closes the channel and ends the loop.
pub(crate) fn spawn_background_worker(
    handle: &Handle,
    bus: Weak<BusCore>,
) -> mpsc::UnboundedSender<PendingPost> {
    let (tx, rx) = mpsc::unbounded_channel();
    handle.spawn(background_loop(bus, rx));
    tx
}

/// Drains background submissions one at a time. Handlers may block, so each
/// invocation moves to the blocking pool; awaiting it keeps at most one
/// in-flight handler across all background deliveries.
async fn background_loop(bus: Weak<BusCore>, mut rx: mpsc::UnboundedReceiver<PendingPost>) {
    while let Some(pending) = rx.recv().await {
        let Some(core) = bus.upgrade() else {
            break;
        };
        let handle = core.executor_handle().clone();
        // JoinError can only mean runtime shutdown; panics are already
        // contained inside invoke_pending.
        let _ = handle
            .spawn_blocking(move || core.invoke_pending(pending))
            .await;
    }
}
