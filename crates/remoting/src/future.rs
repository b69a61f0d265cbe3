//! Cancellable, shareable results
//!
//! [`FutureResult`] is the producing half: exactly one of `set_result`,
//! `set_exception` or `set_cancelled` takes effect. [`IoFuture`] is the
//! consuming half: it can be cloned freely, inspected without waiting,
//! awaited, and asked to cancel. Cancellation is a request that the producer
//! honours through its cancel handlers, and it surfaces as
//! [`Status::Cancelled`] rather than as a failure payload.

use crate::error::{RemotingError, Result};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::sync::watch;

type Notifier<T> = Box<dyn FnOnce(&Status<T>) + Send>;
type CancelHandler = Box<dyn FnOnce() + Send>;

/// Snapshot of a result's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status<T> {
    /// Not yet complete
    Waiting,
    /// Completed with a value
    Done(T),
    /// Completed with an error
    Failed(RemotingError),
    /// Cancelled before completion
    Cancelled,
}

impl<T> Status<T> {
    /// Whether the result is still pending
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting)
    }

    /// Convert a terminal status to a `Result`; `None` while waiting
    pub fn into_result(self) -> Option<Result<T>> {
        match self {
            Self::Waiting => None,
            Self::Done(value) => Some(Ok(value)),
            Self::Failed(err) => Some(Err(err)),
            Self::Cancelled => Some(Err(RemotingError::Cancelled)),
        }
    }
}

/// Something that can be asked to stop
pub trait Cancellable: Send + Sync {
    /// Request cancellation; a no-op if already complete
    fn cancel(&self);
}

/// Boxed cancel action returned by connection providers and handlers
pub struct CancelHandle(Box<dyn Fn() + Send + Sync>);

impl CancelHandle {
    /// Wrap a cancel action
    pub fn new(action: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Box::new(action))
    }

    /// A handle whose cancellation does nothing
    pub fn noop() -> Self {
        Self::new(|| {})
    }
}

impl Cancellable for CancelHandle {
    fn cancel(&self) {
        (self.0)();
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CancelHandle")
    }
}

struct Inner<T> {
    status: Status<T>,
    notifiers: Vec<Notifier<T>>,
    cancel_handlers: Vec<CancelHandler>,
    cancel_requested: bool,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    completed: watch::Sender<bool>,
}

impl<T: Clone + Send + 'static> Shared<T> {
    fn new(status: Status<T>) -> Self {
        let done = !status.is_waiting();
        let (completed, _) = watch::channel(done);
        Self {
            inner: Mutex::new(Inner {
                status,
                notifiers: Vec::new(),
                cancel_handlers: Vec::new(),
                cancel_requested: false,
            }),
            completed,
        }
    }

    fn complete(&self, status: Status<T>) -> bool {
        let notifiers = {
            let mut inner = self.inner.lock();
            if !inner.status.is_waiting() {
                return false;
            }
            inner.status = status.clone();
            inner.cancel_handlers.clear();
            std::mem::take(&mut inner.notifiers)
        };
        self.completed.send_replace(true);
        for notifier in notifiers {
            notifier(&status);
        }
        true
    }
}

/// Producing half of an asynchronous result
pub struct FutureResult<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for FutureResult<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> FutureResult<T> {
    /// Create a pending result
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new(Status::Waiting)),
        }
    }

    /// The consuming half
    pub fn future(&self) -> IoFuture<T> {
        IoFuture {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Complete with a value; `false` if already complete
    pub fn set_result(&self, value: T) -> bool {
        self.shared.complete(Status::Done(value))
    }

    /// Complete with an error; `false` if already complete
    pub fn set_exception(&self, err: RemotingError) -> bool {
        self.shared.complete(Status::Failed(err))
    }

    /// Complete as cancelled; `false` if already complete
    pub fn set_cancelled(&self) -> bool {
        self.shared.complete(Status::Cancelled)
    }

    /// Complete from a `Result`
    pub fn complete(&self, result: Result<T>) -> bool {
        match result {
            Ok(value) => self.set_result(value),
            Err(RemotingError::Cancelled) => self.set_cancelled(),
            Err(err) => self.set_exception(err),
        }
    }

    /// Register an action to run when a consumer requests cancellation.
    ///
    /// Runs immediately if cancellation was already requested; dropped if
    /// the result is already complete.
    pub fn add_cancel_handler(&self, handler: impl FnOnce() + Send + 'static) {
        {
            let mut inner = self.shared.inner.lock();
            if !inner.status.is_waiting() {
                return;
            }
            if !inner.cancel_requested {
                inner.cancel_handlers.push(Box::new(handler));
                return;
            }
        }
        handler();
    }

    /// Whether a consumer asked for cancellation
    pub fn is_cancel_requested(&self) -> bool {
        self.shared.inner.lock().cancel_requested
    }

    /// Complete this result when `source` completes. Cancelling this result
    /// leaves `source` alone.
    pub fn follow(&self, source: &IoFuture<T>) {
        let target = self.clone();
        source.add_notifier(move |status| match status {
            Status::Waiting => {}
            Status::Done(value) => {
                target.set_result(value.clone());
            }
            Status::Failed(err) => {
                target.set_exception(err.clone());
            }
            Status::Cancelled => {
                target.set_cancelled();
            }
        });
    }

    /// Complete this result when `source` completes, forwarding cancellation
    /// requests back to `source`.
    pub fn pipe_from(&self, source: &IoFuture<T>) {
        self.follow(source);
        let source = source.clone();
        self.add_cancel_handler(move || source.cancel());
    }
}

impl<T: Clone + Send + 'static> Default for FutureResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Consuming half of an asynchronous result
pub struct IoFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for IoFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for IoFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoFuture")
            .field("done", &*self.shared.completed.borrow())
            .finish()
    }
}

impl<T: Clone + Send + 'static> IoFuture<T> {
    /// An already successful result
    pub fn done(value: T) -> Self {
        Self {
            shared: Arc::new(Shared::new(Status::Done(value))),
        }
    }

    /// An already failed result
    pub fn failed(err: RemotingError) -> Self {
        Self {
            shared: Arc::new(Shared::new(Status::Failed(err))),
        }
    }

    /// Momentary status snapshot
    pub fn status(&self) -> Status<T> {
        self.shared.inner.lock().status.clone()
    }

    /// Whether both handles refer to the same underlying result
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Whether this is the only handle on the result, producers included
    pub(crate) fn is_sole_handle(&self) -> bool {
        Arc::strong_count(&self.shared) == 1
    }

    /// Wait for completion
    pub async fn get(&self) -> Result<T> {
        let mut completed = self.shared.completed.subscribe();
        // The sender lives in `shared`, which we hold, so this cannot fail.
        let _ = completed.wait_for(|done| *done).await;
        self.status()
            .into_result()
            .unwrap_or_else(|| Err(RemotingError::illegal_state("result signalled while waiting")))
    }

    /// Ask the producer to cancel. Cancel handlers run at most once.
    pub fn cancel(&self) {
        let handlers = {
            let mut inner = self.shared.inner.lock();
            if !inner.status.is_waiting() || inner.cancel_requested {
                return;
            }
            inner.cancel_requested = true;
            std::mem::take(&mut inner.cancel_handlers)
        };
        for handler in handlers {
            handler();
        }
    }

    /// Run `notifier` on completion; immediately if already complete
    pub fn add_notifier(&self, notifier: impl FnOnce(&Status<T>) + Send + 'static) {
        let status = {
            let mut inner = self.shared.inner.lock();
            if inner.status.is_waiting() {
                inner.notifiers.push(Box::new(notifier));
                return;
            }
            inner.status.clone()
        };
        notifier(&status);
    }

    /// Derive a result by transforming the value once it arrives.
    ///
    /// Cancelling the derived future cancels this one.
    pub fn map<U, F>(&self, f: F) -> IoFuture<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        let mapped = FutureResult::new();
        let target = mapped.clone();
        self.add_notifier(move |status| match status {
            Status::Waiting => {}
            Status::Done(value) => {
                target.complete(f(value.clone()));
            }
            Status::Failed(err) => {
                target.set_exception(err.clone());
            }
            Status::Cancelled => {
                target.set_cancelled();
            }
        });
        let source = self.clone();
        mapped.add_cancel_handler(move || source.cancel());
        mapped.future()
    }
}

impl<T: Clone + Send + Sync + 'static> Cancellable for IoFuture<T> {
    fn cancel(&self) {
        IoFuture::cancel(self);
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for IoFuture<T> {
    type Output = Result<T>;
    type IntoFuture = BoxFuture<'static, Result<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.get().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_first_completion_wins() {
        let result = FutureResult::new();
        let future = result.future();
        assert!(future.status().is_waiting());
        assert!(result.set_result(7u32));
        assert!(!result.set_exception(RemotingError::io("late")));
        assert!(!result.set_cancelled());
        assert_eq!(future.get().await, Ok(7));
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_completion() {
        let result = FutureResult::<u32>::new();
        let future = result.future();
        let waiter = tokio::spawn(async move { future.get().await });
        tokio::task::yield_now().await;
        result.set_exception(RemotingError::io("boom"));
        assert_eq!(waiter.await.unwrap(), Err(RemotingError::io("boom")));
    }

    #[tokio::test]
    async fn test_cancel_runs_handlers_once() {
        let result = FutureResult::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let producer = result.clone();
        result.add_cancel_handler(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            producer.set_cancelled();
        });
        let future = result.future();
        future.cancel();
        future.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(future.status(), Status::Cancelled);
        assert_eq!(future.get().await, Err(RemotingError::Cancelled));
    }

    #[test]
    fn test_cancel_handler_after_request_runs_immediately() {
        let result = FutureResult::<u32>::new();
        result.future().cancel();
        let ran = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&ran);
        result.add_cancel_handler(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(result.is_cancel_requested());
    }

    #[test]
    fn test_notifier_on_completed_future_fires_immediately() {
        let future = IoFuture::done(3u8);
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        future.add_notifier(move |status| *slot.lock() = Some(status.clone()));
        assert_eq!(*seen.lock(), Some(Status::Done(3)));
    }

    #[tokio::test]
    async fn test_map_and_cancel_propagation() {
        let source = FutureResult::<u32>::new();
        let producer = source.clone();
        source.add_cancel_handler(move || {
            producer.set_cancelled();
        });
        let mapped = source.future().map(|v| Ok(v * 2));
        mapped.cancel();
        assert_eq!(source.future().status(), Status::Cancelled);
        assert_eq!(mapped.get().await, Err(RemotingError::Cancelled));

        let ok = IoFuture::done(21u32).map(|v| Ok(v * 2));
        assert_eq!(ok.await, Ok(42));
    }

    #[tokio::test]
    async fn test_follow_keeps_cancellation_local() {
        let source = FutureResult::<u32>::new();
        let follower = FutureResult::new();
        follower.follow(&source.future());
        let canceller = follower.clone();
        follower.add_cancel_handler(move || {
            canceller.set_cancelled();
        });

        follower.future().cancel();
        assert_eq!(follower.future().status(), Status::Cancelled);
        assert!(!source.is_cancel_requested());
        assert!(source.set_result(5));

        let piped = FutureResult::new();
        piped.follow(&source.future());
        assert_eq!(piped.future().get().await, Ok(5));
    }
}
