//! Query subscriptions: the unit of deduplication.
//!
//! A [`QuerySubscription`] binds one (operation, canonical key) pair to one
//! [`ObservableQuery`]. It owns the current [`PromiseBox`], replaces it on
//! refetch and fetch-more, forwards materially changed results to listeners,
//! and counts the consumers holding it.

use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use crate::cache::{CacheCore, Spawn};
use crate::error::{FetchError, SuspenseError};
use crate::key::CanonicalKey;
use crate::observable::{
    FetchMoreOptions, ListenerHandle, ObservableQuery, QueryEvent, QueryResult, UnitOfWork,
};
use crate::operation::{Operation, OperationId};
use crate::promise::{PromiseBox, PromiseId, WeakPromise};
use crate::result_eq::relevant_fields_eq;
use crate::tracer::{FetchKind, SettleOutcome, Tracer, TracerKey};

/// Bounds required of query data.
///
/// `PartialEq` drives change detection; `Send + Sync + 'static` lets results
/// be shared across consumers and threads.
pub trait QueryData: PartialEq + Send + Sync + 'static {}
impl<T: PartialEq + Send + Sync + 'static> QueryData for T {}

static NEXT_CONSUMER_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Stable identity of one consumer holding a subscription.
///
/// Acquiring with a token that is already held, or disposing a token that is
/// not held, has no effect on the ref count. Hosts whose lifecycle may
/// replay subscribe/unsubscribe pairs should keep one token per consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerToken(u64);

impl ConsumerToken {
    /// A fresh, process-unique token.
    pub fn new() -> Self {
        ConsumerToken(NEXT_CONSUMER_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConsumerToken {
    fn default() -> Self {
        Self::new()
    }
}

type Listener<D> = Arc<dyn Fn(&QueryResult<D>) + Send + Sync>;

struct SubscriptionState<D> {
    promise: PromiseBox<QueryResult<D>>,
    latest: QueryResult<D>,
    consumers: HashSet<ConsumerToken>,
    /// Our own subscription on the observable. `None` while no consumer holds us.
    observer: Option<ListenerHandle>,
    /// Arena slot in the owning cache, `None` once removed.
    slot: Option<usize>,
    /// Boxes indexed by the cache. Ones nobody holds are dropped on the next
    /// replacement.
    issued: Vec<WeakPromise<QueryResult<D>>>,
    disposed: bool,
}

struct Listeners<D> {
    next_id: u64,
    entries: BTreeMap<u64, Listener<D>>,
}

/// One deduplicated query: an observable source plus its current promise box.
pub struct QuerySubscription<D: QueryData> {
    operation: Operation<D>,
    canonical_key: CanonicalKey,
    variables: Value,
    tracer_key: TracerKey,
    observable: Arc<dyn ObservableQuery<Data = D>>,
    tracer: Arc<dyn Tracer>,
    spawner: Option<Arc<dyn Spawn>>,
    core: Weak<CacheCore>,
    weak_self: Weak<Self>,
    state: Mutex<SubscriptionState<D>>,
    listeners: Mutex<Listeners<D>>,
}

impl<D: QueryData> QuerySubscription<D> {
    /// Create a subscription in `slot` and issue its initial fetch.
    ///
    /// If the observable already holds a complete result, the first box is
    /// fulfilled with it and no fetch is issued. The observable is not
    /// subscribed to until the first consumer arrives.
    pub(crate) fn new(
        operation: Operation<D>,
        canonical_key: CanonicalKey,
        variables: Value,
        observable: Arc<dyn ObservableQuery<Data = D>>,
        core: &Arc<CacheCore>,
        slot: usize,
    ) -> Arc<Self> {
        let tracer_key = TracerKey::new(operation.name(), canonical_key.as_str());
        let tracer = core.tracer.clone();
        let spawner = core.spawner.clone();

        let current = observable.current_result();
        let promise = if current.is_complete() {
            let promise = PromiseBox::fulfilled(current.clone());
            tracer.on_promise_created(&tracer_key, promise.id(), FetchKind::Cached);
            promise
        } else {
            track(
                observable.reobserve(),
                FetchKind::Initial,
                &tracer,
                &tracer_key,
                spawner.as_deref(),
            )
        };

        let subscription = Arc::new_cyclic(|weak_self| Self {
            operation,
            canonical_key,
            variables,
            tracer_key,
            observable,
            tracer,
            spawner,
            core: Arc::downgrade(core),
            weak_self: weak_self.clone(),
            state: Mutex::new(SubscriptionState {
                issued: vec![promise.downgrade()],
                promise,
                latest: current,
                consumers: HashSet::new(),
                observer: None,
                slot: Some(slot),
                disposed: false,
            }),
            listeners: Mutex::new(Listeners {
                next_id: 0,
                entries: BTreeMap::new(),
            }),
        });
        subscription
    }

    /// The operation this subscription serves.
    pub fn operation(&self) -> &Operation<D> {
        &self.operation
    }

    /// The canonical key of the arguments.
    pub fn canonical_key(&self) -> &CanonicalKey {
        &self.canonical_key
    }

    /// The normalized arguments the observable was created with.
    pub fn variables(&self) -> &Value {
        &self.variables
    }

    /// The observable backing this subscription.
    pub fn observable(&self) -> &Arc<dyn ObservableQuery<Data = D>> {
        &self.observable
    }

    /// The current promise box.
    pub fn promise(&self) -> PromiseBox<QueryResult<D>> {
        self.state.lock().promise.clone()
    }

    /// Force-read the current promise box.
    pub fn read(&self) -> Result<Arc<QueryResult<D>>, SuspenseError> {
        self.promise().read()
    }

    /// The most recent result seen from the observable.
    ///
    /// Updated on every emission, independently of promise replacement.
    pub fn latest_result(&self) -> QueryResult<D> {
        self.state.lock().latest.clone()
    }

    /// Number of consumers holding this subscription.
    pub fn ref_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Whether the last consumer has released this subscription.
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Whether the observable still has observers.
    pub fn has_observers(&self) -> bool {
        self.observable.has_observers()
    }

    /// Whether the cache may drop this subscription: no consumers and no
    /// observers left on the observable.
    pub fn is_removable(&self) -> bool {
        self.ref_count() == 0 && !self.has_observers()
    }

    /// Register a new consumer, returning its token.
    pub fn acquire(&self) -> ConsumerToken {
        let token = ConsumerToken::new();
        self.acquire_as(token);
        token
    }

    /// Register the consumer identified by `token`.
    ///
    /// Returns `false` if the token was already held. Re-acquiring a
    /// disposed subscription resubscribes to the observable.
    pub fn acquire_as(&self, token: ConsumerToken) -> bool {
        if !self.register_consumer(token) {
            return false;
        }
        self.ensure_observer();
        true
    }

    /// Add `token` to the consumer set without touching the observable.
    ///
    /// Callers follow up with [`ensure_observer`](Self::ensure_observer) once
    /// they hold no cache lock.
    pub(crate) fn register_consumer(&self, token: ConsumerToken) -> bool {
        let (inserted, ref_count) = {
            let mut state = self.state.lock();
            let inserted = state.consumers.insert(token);
            if inserted {
                state.disposed = false;
            }
            (inserted, state.consumers.len())
        };
        if inserted {
            self.tracer.on_acquire(&self.tracer_key, ref_count);
        }
        inserted
    }

    /// Subscribe to the observable if someone holds us and we are not
    /// subscribed yet.
    ///
    /// The observable may deliver a result from inside `subscribe`, which
    /// runs listeners, so this must not be called under the table lock.
    pub(crate) fn ensure_observer(&self) {
        {
            let state = self.state.lock();
            if state.observer.is_some() || state.consumers.is_empty() {
                return;
            }
        }
        self.attach_observer();
    }

    /// Release the consumer identified by `token`.
    ///
    /// Returns `false`, without touching the ref count, if the token is not
    /// held. When the last consumer leaves, the internal observer is
    /// unsubscribed and the subscription becomes eligible for removal.
    pub fn dispose(&self, token: ConsumerToken) -> bool {
        let (released, ref_count, observer) = {
            let mut state = self.state.lock();
            let released = state.consumers.remove(&token);
            let ref_count = state.consumers.len();
            let observer = if released && ref_count == 0 {
                state.disposed = true;
                state.observer.take()
            } else {
                None
            };
            (released, ref_count, observer)
        };
        if !released {
            self.tracer.on_double_dispose(&self.tracer_key);
            return false;
        }
        if let Some(observer) = observer {
            observer.unsubscribe();
        }
        self.tracer.on_dispose(&self.tracer_key, ref_count);
        true
    }

    /// Fetch more results. The returned box becomes the current one.
    pub fn fetch_more(&self, options: FetchMoreOptions) -> PromiseBox<QueryResult<D>> {
        let work = self.observable.fetch_more(options);
        self.replace_promise(work, FetchKind::FetchMore)
    }

    /// Refetch, optionally with new variables. The returned box becomes the
    /// current one.
    ///
    /// The cache key of this subscription does not change. Callers that want
    /// a different key should request it from the cache instead.
    pub fn refetch(&self, variables: Option<Value>) -> PromiseBox<QueryResult<D>> {
        let work = self.observable.refetch(variables);
        self.replace_promise(work, FetchKind::Refetch)
    }

    /// Call `callback` whenever the observable emits a result that differs
    /// from the previous one in `loading`, `network_status` or `data`.
    ///
    /// Listeners run in registration order.
    pub fn listen(&self, callback: impl Fn(&QueryResult<D>) + Send + Sync + 'static) -> ListenerHandle {
        let id = {
            let mut listeners = self.listeners.lock();
            let id = listeners.next_id;
            listeners.next_id += 1;
            listeners.entries.insert(id, Arc::new(callback));
            id
        };
        let weak = self.weak_self.clone();
        ListenerHandle::new(move || {
            if let Some(subscription) = weak.upgrade() {
                subscription.listeners.lock().entries.remove(&id);
            }
        })
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }

    fn replace_promise(&self, work: UnitOfWork<D>, kind: FetchKind) -> PromiseBox<QueryResult<D>> {
        let promise = track(
            work,
            kind,
            &self.tracer,
            &self.tracer_key,
            self.spawner.as_deref(),
        );
        let retired = {
            let mut state = self.state.lock();
            state.promise = promise.clone();
            let mut retired = Vec::new();
            state.issued.retain(|issued| {
                let held = issued.is_held();
                if !held {
                    retired.push(issued.id());
                }
                held
            });
            state.issued.push(promise.downgrade());
            retired
        };
        if let (Some(core), Some(this)) = (self.core.upgrade(), self.weak_self.upgrade()) {
            core.register_promise(this, promise.id(), &retired);
        }
        promise
    }

    fn attach_observer(&self) {
        let weak = self.weak_self.clone();
        let handle = self.observable.subscribe(Arc::new(move |event: QueryEvent<D>| {
            if let Some(subscription) = weak.upgrade() {
                subscription.handle_event(event);
            }
        }));
        let mut state = self.state.lock();
        if state.observer.is_none() && !state.consumers.is_empty() {
            state.observer = Some(handle);
        } else {
            drop(state);
            handle.unsubscribe();
        }
    }

    fn handle_event(&self, event: QueryEvent<D>) {
        let (next, changed) = {
            let mut state = self.state.lock();
            let next = match event {
                QueryEvent::Next(result) => result,
                QueryEvent::Error(error) => state.latest.with_error(error),
            };
            let changed = !relevant_fields_eq(&state.latest, &next);
            state.latest = next.clone();
            (next, changed)
        };
        if !changed {
            self.tracer.on_result_suppressed(&self.tracer_key);
            return;
        }

        let listeners: Vec<Listener<D>> = self.listeners.lock().entries.values().cloned().collect();
        for listener in &listeners {
            listener(&next);
        }
        self.tracer.on_result_delivered(&self.tracer_key, listeners.len());
    }
}

/// Wrap a unit of work in a box that reports to the tracer and, when a
/// spawner is configured, starts driving it right away.
fn track<D: QueryData>(
    work: UnitOfWork<D>,
    kind: FetchKind,
    tracer: &Arc<dyn Tracer>,
    key: &TracerKey,
    spawner: Option<&dyn Spawn>,
) -> PromiseBox<QueryResult<D>> {
    let settle_tracer = tracer.clone();
    let settle_key = key.clone();
    let promise = PromiseBox::observed(work, move |id, error: Option<&FetchError>| {
        let outcome = match error {
            None => SettleOutcome::Fulfilled,
            Some(error) => SettleOutcome::Rejected {
                message: error.to_string(),
            },
        };
        settle_tracer.on_promise_settled(&settle_key, id, outcome);
    });
    tracer.on_promise_created(key, promise.id(), kind);
    if let Some(spawner) = spawner {
        spawner.spawn(promise.driver());
    }
    promise
}

impl<D: QueryData> fmt::Debug for QuerySubscription<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("QuerySubscription")
            .field("operation", &self.operation)
            .field("canonical_key", &self.canonical_key)
            .field("promise", &state.promise)
            .field("ref_count", &state.consumers.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

/// Type-erased view of a subscription, as stored in the cache arena.
pub(crate) trait ErasedSubscription: Send + Sync {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn operation_id(&self) -> OperationId;
    fn canonical_key(&self) -> &CanonicalKey;
    fn tracer_key(&self) -> &TracerKey;
    fn ref_count(&self) -> usize;
    fn is_removable(&self) -> bool;
    fn slot(&self) -> Option<usize>;
    fn set_slot(&self, slot: Option<usize>);
    fn promise_ids(&self) -> Vec<PromiseId>;
    /// Called once the cache no longer holds this subscription.
    fn detach(&self);
}

impl<D: QueryData> ErasedSubscription for QuerySubscription<D> {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn operation_id(&self) -> OperationId {
        self.operation.id()
    }

    fn canonical_key(&self) -> &CanonicalKey {
        &self.canonical_key
    }

    fn tracer_key(&self) -> &TracerKey {
        &self.tracer_key
    }

    fn ref_count(&self) -> usize {
        QuerySubscription::ref_count(self)
    }

    fn is_removable(&self) -> bool {
        QuerySubscription::is_removable(self)
    }

    fn slot(&self) -> Option<usize> {
        self.state.lock().slot
    }

    fn set_slot(&self, slot: Option<usize>) {
        self.state.lock().slot = slot;
    }

    fn promise_ids(&self) -> Vec<PromiseId> {
        self.state.lock().issued.iter().map(WeakPromise::id).collect()
    }

    fn detach(&self) {
        let observer = {
            let mut state = self.state.lock();
            state.slot = None;
            state.observer.take()
        };
        if let Some(observer) = observer {
            observer.unsubscribe();
        }
    }
}

/// A consumer's hold on a [`QuerySubscription`].
///
/// Returned by [`SuspenseCache::get_or_create`](crate::SuspenseCache::get_or_create).
/// Dereferences to the subscription. [`dispose`](Self::dispose) consumes the
/// handle, so one handle can release its hold only once. Dropping a handle
/// without disposing keeps the hold.
pub struct QueryRef<D: QueryData> {
    subscription: Arc<QuerySubscription<D>>,
    token: ConsumerToken,
}

impl<D: QueryData> QueryRef<D> {
    pub(crate) fn new(subscription: Arc<QuerySubscription<D>>, token: ConsumerToken) -> Self {
        Self {
            subscription,
            token,
        }
    }

    /// The shared subscription.
    pub fn subscription(&self) -> &Arc<QuerySubscription<D>> {
        &self.subscription
    }

    /// The token this handle holds.
    pub fn token(&self) -> ConsumerToken {
        self.token
    }

    /// Take an additional hold for another consumer.
    pub fn retain(&self) -> QueryRef<D> {
        let token = self.subscription.acquire();
        QueryRef::new(self.subscription.clone(), token)
    }

    /// Release this hold.
    pub fn dispose(self) -> bool {
        self.subscription.dispose(self.token)
    }
}

impl<D: QueryData> Deref for QueryRef<D> {
    type Target = QuerySubscription<D>;

    fn deref(&self) -> &Self::Target {
        &self.subscription
    }
}

impl<D: QueryData> fmt::Debug for QueryRef<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRef")
            .field("token", &self.token)
            .field("subscription", &self.subscription)
            .finish()
    }
}
