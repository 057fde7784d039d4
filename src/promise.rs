//! Promise-state boxes around asynchronous units of work.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::error::{FetchError, SuspenseError};

static NEXT_PROMISE_ID: AtomicU64 = AtomicU64::new(1);

type Driver = Shared<BoxFuture<'static, ()>>;
type StateSlot<T> = Arc<Mutex<Arc<PromiseState<T>>>>;

/// Process-unique identifier of a [`PromiseBox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseId(pub u64);

impl PromiseId {
    fn next() -> Self {
        PromiseId(NEXT_PROMISE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Status of a [`PromiseBox`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromiseStatus {
    /// The unit of work has not settled yet.
    Pending,
    /// The unit of work produced a value.
    Fulfilled,
    /// The unit of work failed.
    Rejected,
}

/// Snapshot of a box's state.
///
/// A box moves from `Pending` to exactly one of the terminal variants and
/// never leaves it. Each transition installs a newly built state; snapshots
/// handed out earlier are never mutated.
pub enum PromiseState<T> {
    /// Not settled.
    Pending,
    /// Settled with a value.
    Fulfilled(Arc<T>),
    /// Settled with an error.
    Rejected(FetchError),
}

impl<T> PromiseState<T> {
    /// The status of this state.
    pub fn status(&self) -> PromiseStatus {
        match self {
            PromiseState::Pending => PromiseStatus::Pending,
            PromiseState::Fulfilled(_) => PromiseStatus::Fulfilled,
            PromiseState::Rejected(_) => PromiseStatus::Rejected,
        }
    }
}

impl<T> Clone for PromiseState<T> {
    fn clone(&self) -> Self {
        match self {
            PromiseState::Pending => PromiseState::Pending,
            PromiseState::Fulfilled(v) => PromiseState::Fulfilled(v.clone()),
            PromiseState::Rejected(e) => PromiseState::Rejected(e.clone()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PromiseState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromiseState::Pending => write!(f, "Pending"),
            PromiseState::Fulfilled(v) => write!(f, "Fulfilled({:?})", v),
            PromiseState::Rejected(e) => write!(f, "Rejected({})", e),
        }
    }
}

/// A pending-or-settled unit of work that can be read synchronously.
///
/// Cloning is cheap and yields a handle to the same box. The unit of work is
/// driven by whoever awaits [`settled`](Self::settled) (or
/// [`PendingPromise::wait`]) first, or by a spawner that was handed
/// [`driver`](Self::driver). All awaiters share a single run of the work.
pub struct PromiseBox<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    id: PromiseId,
    state: StateSlot<T>,
    driver: Driver,
}

impl<T> Clone for PromiseBox<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> PromiseBox<T> {
    /// Create a pending box around `work`.
    ///
    /// The outcome of `work`, success or failure, is captured into the box;
    /// it never escapes as an unhandled error.
    pub fn new<F>(work: F) -> Self
    where
        F: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        Self::observed(work, |_, _| {})
    }

    /// Like [`new`](Self::new), calling `on_settle` right after the box
    /// settles. `on_settle` receives the error when the work was rejected.
    pub(crate) fn observed<F, S>(work: F, on_settle: S) -> Self
    where
        F: Future<Output = Result<T, FetchError>> + Send + 'static,
        S: FnOnce(PromiseId, Option<&FetchError>) + Send + 'static,
    {
        let id = PromiseId::next();
        let state: StateSlot<T> = Arc::new(Mutex::new(Arc::new(PromiseState::Pending)));
        let slot = state.clone();
        let driver = async move {
            let outcome = work.await;
            let error = outcome.as_ref().err().cloned();
            if settle(&slot, outcome) {
                on_settle(id, error.as_ref());
            }
        }
        .boxed()
        .shared();
        Self::from_parts(id, state, driver)
    }

    /// Create a box that is already fulfilled.
    pub fn fulfilled(value: T) -> Self {
        Self::settled_with(PromiseState::Fulfilled(Arc::new(value)))
    }

    /// Create a box that is already rejected.
    pub fn rejected(error: impl Into<FetchError>) -> Self {
        Self::settled_with(PromiseState::Rejected(error.into()))
    }

    fn settled_with(state: PromiseState<T>) -> Self {
        let state = Arc::new(Mutex::new(Arc::new(state)));
        let driver = futures::future::ready(()).boxed().shared();
        Self::from_parts(PromiseId::next(), state, driver)
    }

    fn from_parts(id: PromiseId, state: StateSlot<T>, driver: Driver) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                state,
                driver,
            }),
        }
    }

    /// Force-read the box.
    ///
    /// - pending: `Err(SuspenseError::Suspend)`; retry once the carried
    ///   [`PendingPromise`] completes.
    /// - fulfilled: the value.
    /// - rejected: `Err(SuspenseError::Fetch)` with the original error. Every
    ///   read returns the same error object.
    pub fn read(&self) -> Result<Arc<T>, SuspenseError> {
        match &*self.state() {
            PromiseState::Pending => Err(SuspenseError::Suspend {
                pending: self.pending(),
            }),
            PromiseState::Fulfilled(value) => Ok(value.clone()),
            PromiseState::Rejected(error) => Err(SuspenseError::Fetch(error.clone())),
        }
    }

    /// Wait for the box to settle, driving the unit of work if nobody else is.
    pub fn settled(&self) -> impl Future<Output = Result<Arc<T>, FetchError>> + Send + 'static {
        let driver = self.inner.driver.clone();
        let state = self.inner.state.clone();
        async move {
            driver.await;
            let snapshot = state.lock().clone();
            match &*snapshot {
                PromiseState::Fulfilled(value) => Ok(value.clone()),
                PromiseState::Rejected(error) => Err(error.clone()),
                PromiseState::Pending => Err(FetchError::new(anyhow::anyhow!(
                    "unit of work finished without settling"
                ))),
            }
        }
    }

    /// The settlement future, for handing to an executor.
    ///
    /// Running it to completion settles the box. It is shared with
    /// [`settled`](Self::settled), so the work runs only once.
    pub fn driver(&self) -> BoxFuture<'static, ()> {
        self.inner.driver.clone().boxed()
    }

    /// A type-erased handle that can be awaited until this box settles.
    pub fn pending(&self) -> PendingPromise {
        let state = self.inner.state.clone();
        PendingPromise {
            id: self.inner.id,
            driver: self.inner.driver.clone(),
            status: Arc::new(move || state.lock().status()),
        }
    }

    /// Mark the box settled. Returns `false` if it already was.
    #[cfg(test)]
    pub(crate) fn settle(&self, outcome: Result<T, FetchError>) -> bool {
        settle(&self.inner.state, outcome)
    }
}

impl<T> PromiseBox<T> {
    /// Identifier of this box.
    pub fn id(&self) -> PromiseId {
        self.inner.id
    }

    /// Current state snapshot.
    pub fn state(&self) -> Arc<PromiseState<T>> {
        self.inner.state.lock().clone()
    }

    /// Current status.
    pub fn status(&self) -> PromiseStatus {
        self.inner.state.lock().status()
    }

    /// Whether the box has not settled yet.
    pub fn is_pending(&self) -> bool {
        self.status() == PromiseStatus::Pending
    }

    /// Whether the box has settled either way.
    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }

    /// The value, if fulfilled.
    pub fn value(&self) -> Option<Arc<T>> {
        match &*self.state() {
            PromiseState::Fulfilled(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// The error, if rejected.
    pub fn error(&self) -> Option<FetchError> {
        match &*self.state() {
            PromiseState::Rejected(error) => Some(error.clone()),
            _ => None,
        }
    }

    /// Whether both handles refer to the same box.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakPromise<T> {
        WeakPromise {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// A box handle that does not keep the box alive.
pub(crate) struct WeakPromise<T> {
    id: PromiseId,
    inner: Weak<Inner<T>>,
}

impl<T> WeakPromise<T> {
    pub(crate) fn id(&self) -> PromiseId {
        self.id
    }

    /// Whether some [`PromiseBox`] handle to the box still exists.
    pub(crate) fn is_held(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl<T> fmt::Debug for PromiseBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PromiseBox(#{}, {:?})", self.inner.id.0, self.status())
    }
}

fn settle<T>(slot: &Mutex<Arc<PromiseState<T>>>, outcome: Result<T, FetchError>) -> bool {
    let mut state = slot.lock();
    if !matches!(**state, PromiseState::Pending) {
        return false;
    }
    *state = Arc::new(match outcome {
        Ok(value) => PromiseState::Fulfilled(Arc::new(value)),
        Err(error) => PromiseState::Rejected(error),
    });
    true
}

/// Type-erased handle to a box that a force-read found pending.
///
/// Carried by [`SuspenseError::Suspend`]. Awaiting [`wait`](Self::wait)
/// drives the underlying work and completes once the box has settled.
#[derive(Clone)]
pub struct PendingPromise {
    id: PromiseId,
    driver: Driver,
    status: Arc<dyn Fn() -> PromiseStatus + Send + Sync>,
}

impl PendingPromise {
    /// Identifier of the box this handle waits on.
    pub fn id(&self) -> PromiseId {
        self.id
    }

    /// Current status of the box.
    pub fn status(&self) -> PromiseStatus {
        (self.status)()
    }

    /// Completes once the box has settled.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        self.driver.clone()
    }
}

impl fmt::Debug for PendingPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PendingPromise(#{})", self.id.0)
    }
}
