//! Uniform close protocol for endpoints, connections and channels
//!
//! A component embeds a [`CloseTracker`] and implements
//! [`HandleableCloseable`]. `close()` is idempotent: the first caller runs the
//! component's `close_action`, every caller waits until the component reports
//! completion through [`CloseTracker::close_complete`]. A failing close action
//! is logged and handed to the close handlers; it never stops the close.

use crate::error::{RemotingError, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};

type Handler = Box<dyn FnOnce(Option<&RemotingError>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
    Closed,
}

struct Registered {
    handler: Handler,
    spawn: bool,
}

struct Inner {
    phase: Phase,
    next_key: u64,
    handlers: IndexMap<u64, Registered>,
    failure: Option<RemotingError>,
}

/// Close state shared by every closeable component
pub struct CloseTracker {
    name: String,
    inner: Arc<Mutex<Inner>>,
    closed: watch::Sender<bool>,
    executor: Handle,
}

/// Handle returned by `add_close_handler`; `remove` deregisters the handler
#[derive(Debug, Clone)]
pub struct CloseHandlerKey {
    key: u64,
    inner: Weak<Mutex<Inner>>,
}

impl CloseHandlerKey {
    /// Deregister the handler. No-op if it already ran or was removed.
    pub fn remove(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().handlers.shift_remove(&self.key);
        }
    }
}

impl CloseTracker {
    /// Create an open tracker. `name` only appears in logs.
    pub fn new(name: impl Into<String>, executor: Handle) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(Inner {
                phase: Phase::Open,
                next_key: 0,
                handlers: IndexMap::new(),
                failure: None,
            })),
            closed,
            executor,
        }
    }

    /// Executor used for spawned handlers and asynchronous closes
    pub fn executor(&self) -> &Handle {
        &self.executor
    }

    /// Momentary snapshot; the component may start closing right after
    pub fn is_open(&self) -> bool {
        self.inner.lock().phase == Phase::Open
    }

    /// Whether the close has fully completed
    pub fn is_closed(&self) -> bool {
        self.inner.lock().phase == Phase::Closed
    }

    /// Move from open to closing. Only the caller that gets `true` runs the
    /// close action.
    pub fn begin_close(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.phase != Phase::Open {
            return false;
        }
        inner.phase = Phase::Closing;
        debug!(resource = %self.name, "closing");
        true
    }

    /// Finish the close: run every registered handler once and release waiters.
    ///
    /// Only the first call has an effect.
    pub fn close_complete(&self, failure: Option<RemotingError>) {
        let handlers = {
            let mut inner = self.inner.lock();
            if inner.phase == Phase::Closed {
                return;
            }
            inner.phase = Phase::Closed;
            inner.failure = failure.clone();
            std::mem::take(&mut inner.handlers)
        };
        debug!(resource = %self.name, handlers = handlers.len(), "closed");
        for (_, registered) in handlers {
            self.dispatch(registered, failure.clone());
        }
        self.closed.send_replace(true);
    }

    fn dispatch(&self, registered: Registered, failure: Option<RemotingError>) {
        if registered.spawn {
            let handler = registered.handler;
            self.executor.spawn(async move {
                handler(failure.as_ref());
            });
        } else {
            (registered.handler)(failure.as_ref());
        }
    }

    fn register(&self, handler: Handler, spawn: bool) -> CloseHandlerKey {
        let mut inner = self.inner.lock();
        let key = inner.next_key;
        inner.next_key += 1;
        if inner.phase == Phase::Closed {
            let failure = inner.failure.clone();
            drop(inner);
            self.dispatch(Registered { handler, spawn }, failure);
        } else {
            inner.handlers.insert(key, Registered { handler, spawn });
        }
        CloseHandlerKey {
            key,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Run `handler` on the closing task once the close completes.
    ///
    /// If already closed the handler runs immediately, with no ordering
    /// relative to handlers that ran earlier.
    pub fn add_close_handler(
        &self,
        handler: impl FnOnce(Option<&RemotingError>) + Send + 'static,
    ) -> CloseHandlerKey {
        self.register(Box::new(handler), false)
    }

    /// Like [`add_close_handler`](Self::add_close_handler), but the handler is
    /// spawned on the executor instead of running inline.
    pub fn add_spawned_close_handler(
        &self,
        handler: impl FnOnce(Option<&RemotingError>) + Send + 'static,
    ) -> CloseHandlerKey {
        self.register(Box::new(handler), true)
    }

    /// Wait until the close has completed
    pub async fn await_closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|done| *done).await;
    }

    /// Fail with `NotOpen` unless the tracker is open
    pub fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(RemotingError::not_open(self.name.clone()))
        }
    }
}

/// A component with the uniform close protocol
#[async_trait]
pub trait HandleableCloseable: Send + Sync {
    /// The embedded close state
    fn close_tracker(&self) -> &CloseTracker;

    /// Tear the component down.
    ///
    /// Returning `Ok` means `close_complete` has been or will be called by
    /// the implementation; returning `Err` completes the close with that
    /// error.
    async fn close_action(&self) -> Result<()>;

    /// Close and wait for completion. Safe to call any number of times.
    async fn close(&self) {
        let tracker = self.close_tracker();
        if tracker.begin_close() {
            if let Err(err) = self.close_action().await {
                warn!(resource = %tracker.name, error = %err, "close action failed");
                tracker.close_complete(Some(err));
            }
        }
        tracker.await_closed().await;
    }

    /// Wait for the close to complete without initiating it
    async fn await_closed(&self) {
        self.close_tracker().await_closed().await;
    }

    /// Momentary open-state snapshot
    fn is_open(&self) -> bool {
        self.close_tracker().is_open()
    }

    /// Register a handler run when the component closes
    fn add_close_handler(
        &self,
        handler: Box<dyn FnOnce(Option<&RemotingError>) + Send>,
    ) -> CloseHandlerKey {
        self.close_tracker().add_close_handler(handler)
    }
}

/// Start closing `closeable` on its executor without waiting
pub fn close_async<C>(closeable: Arc<C>)
where
    C: HandleableCloseable + ?Sized + 'static,
{
    let executor = closeable.close_tracker().executor().clone();
    executor.spawn(async move {
        closeable.close().await;
    });
}
