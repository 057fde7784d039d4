//! Shared fixtures: a scripted observable query and a recording tracer.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use query_suspense::{
    FetchError, FetchKind, FetchMoreOptions, ListenerHandle, ObservableQuery, Observer, PromiseId,
    QueryEvent, QueryResult, RemoveOutcome, SettleOutcome, Tracer, TracerKey, UnitOfWork,
};
use serde_json::Value;

// ============================================================================
// Test Data
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub name: String,
}

pub fn user(name: &str) -> QueryResult<User> {
    QueryResult::ready(User {
        name: name.to_string(),
    })
}

pub fn name_of(result: &QueryResult<User>) -> Option<&str> {
    result.data.as_deref().map(|user| user.name.as_str())
}

// ============================================================================
// Mock Observable
// ============================================================================

type Reply<D> = oneshot::Sender<Result<QueryResult<D>, FetchError>>;

struct MockInner<D> {
    current: Mutex<QueryResult<D>>,
    observers: Mutex<BTreeMap<u64, Observer<D>>>,
    next_observer: AtomicU64,
    requests: Mutex<VecDeque<Reply<D>>>,
    reobserve_calls: AtomicUsize,
    refetch_calls: AtomicUsize,
    fetch_more_calls: AtomicUsize,
    refetch_variables: Mutex<Vec<Option<Value>>>,
}

/// Observable whose requests stay pending until the test resolves them.
///
/// Every `reobserve`/`refetch`/`fetch_more` queues a request. Clones share
/// state, so a test can keep one clone and hand another to the cache.
pub struct MockQuery<D> {
    inner: Arc<MockInner<D>>,
}

impl<D> Clone for MockQuery<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Send + Sync + 'static> MockQuery<D> {
    pub fn new() -> Self {
        Self::with_current(QueryResult::loading())
    }

    /// A query that already knows `current`.
    pub fn with_current(current: QueryResult<D>) -> Self {
        Self {
            inner: Arc::new(MockInner {
                current: Mutex::new(current),
                observers: Mutex::new(BTreeMap::new()),
                next_observer: AtomicU64::new(0),
                requests: Mutex::new(VecDeque::new()),
                reobserve_calls: AtomicUsize::new(0),
                refetch_calls: AtomicUsize::new(0),
                fetch_more_calls: AtomicUsize::new(0),
                refetch_variables: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn reobserve_calls(&self) -> usize {
        self.inner.reobserve_calls.load(Ordering::SeqCst)
    }

    pub fn refetch_calls(&self) -> usize {
        self.inner.refetch_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_more_calls(&self) -> usize {
        self.inner.fetch_more_calls.load(Ordering::SeqCst)
    }

    pub fn refetch_variables(&self) -> Vec<Option<Value>> {
        self.inner.refetch_variables.lock().clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.requests.lock().len()
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.lock().len()
    }

    /// Resolve the oldest pending request with `result`, emitting it first.
    pub fn resolve(&self, result: QueryResult<D>) {
        let reply = self.inner.requests.lock().pop_front();
        self.finish(reply, result);
    }

    /// Resolve the newest pending request with `result`, emitting it first.
    pub fn resolve_latest(&self, result: QueryResult<D>) {
        let reply = self.inner.requests.lock().pop_back();
        self.finish(reply, result);
    }

    /// Reject the oldest pending request.
    pub fn reject(&self, error: FetchError) {
        let reply = self.inner.requests.lock().pop_front();
        if let Some(reply) = reply {
            let _ = reply.send(Err(error));
        }
    }

    /// Deliver `result` to every observer.
    pub fn emit(&self, result: QueryResult<D>) {
        *self.inner.current.lock() = result.clone();
        self.deliver(QueryEvent::Next(result));
    }

    /// Deliver an error event to every observer.
    pub fn emit_error(&self, error: FetchError) {
        self.deliver(QueryEvent::Error(error));
    }

    /// Subscribe an observer that is not the cache.
    pub fn subscribe_external(&self) -> ListenerHandle {
        self.subscribe(Arc::new(|_: QueryEvent<D>| {}))
    }

    fn finish(&self, reply: Option<Reply<D>>, result: QueryResult<D>) {
        self.emit(result.clone());
        if let Some(reply) = reply {
            let _ = reply.send(Ok(result));
        }
    }

    fn deliver(&self, event: QueryEvent<D>) {
        let observers: Vec<Observer<D>> = self.inner.observers.lock().values().cloned().collect();
        for observer in observers {
            observer(event.clone());
        }
    }

    fn request(&self) -> UnitOfWork<D> {
        let (tx, rx) = oneshot::channel();
        self.inner.requests.lock().push_back(tx);
        async move {
            rx.await
                .unwrap_or_else(|_| Err(FetchError::new(anyhow::anyhow!("request dropped"))))
        }
        .boxed()
    }
}

impl<D: Send + Sync + 'static> ObservableQuery for MockQuery<D> {
    type Data = D;

    fn current_result(&self) -> QueryResult<D> {
        self.inner.current.lock().clone()
    }

    fn subscribe(&self, observer: Observer<D>) -> ListenerHandle {
        let id = self.inner.next_observer.fetch_add(1, Ordering::SeqCst);
        self.inner.observers.lock().insert(id, observer);
        let weak: Weak<MockInner<D>> = Arc::downgrade(&self.inner);
        ListenerHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.observers.lock().remove(&id);
            }
        })
    }

    fn reobserve(&self) -> UnitOfWork<D> {
        self.inner.reobserve_calls.fetch_add(1, Ordering::SeqCst);
        self.request()
    }

    fn fetch_more(&self, _options: FetchMoreOptions) -> UnitOfWork<D> {
        self.inner.fetch_more_calls.fetch_add(1, Ordering::SeqCst);
        self.request()
    }

    fn refetch(&self, variables: Option<Value>) -> UnitOfWork<D> {
        self.inner.refetch_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.refetch_variables.lock().push(variables);
        self.request()
    }

    fn has_observers(&self) -> bool {
        !self.inner.observers.lock().is_empty()
    }
}

/// Observable that hands its current result to every new observer from
/// inside `subscribe`, the way sources with a last-value replay do.
pub struct ReplayQuery<D> {
    inner: MockQuery<D>,
}

impl<D> Clone for ReplayQuery<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Send + Sync + 'static> ReplayQuery<D> {
    pub fn new(inner: MockQuery<D>) -> Self {
        Self { inner }
    }
}

impl<D: Send + Sync + 'static> ObservableQuery for ReplayQuery<D> {
    type Data = D;

    fn current_result(&self) -> QueryResult<D> {
        self.inner.current_result()
    }

    fn subscribe(&self, observer: Observer<D>) -> ListenerHandle {
        let handle = self.inner.subscribe(observer.clone());
        observer(QueryEvent::Next(self.inner.current_result()));
        handle
    }

    fn reobserve(&self) -> UnitOfWork<D> {
        self.inner.reobserve()
    }

    fn fetch_more(&self, options: FetchMoreOptions) -> UnitOfWork<D> {
        self.inner.fetch_more(options)
    }

    fn refetch(&self, variables: Option<Value>) -> UnitOfWork<D> {
        self.inner.refetch(variables)
    }

    fn has_observers(&self) -> bool {
        self.inner.has_observers()
    }
}

// ============================================================================
// Spawner
// ============================================================================

/// Spawner that parks futures until the test runs them.
#[derive(Clone, Default)]
pub struct ManualSpawner {
    queue: Arc<Mutex<Vec<BoxFuture<'static, ()>>>>,
}

impl ManualSpawner {
    pub fn spawned(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run every parked future to completion.
    pub fn run_all(&self) {
        let parked: Vec<_> = self.queue.lock().drain(..).collect();
        for future in parked {
            futures::executor::block_on(future);
        }
    }
}

impl query_suspense::Spawn for ManualSpawner {
    fn spawn(&self, future: BoxFuture<'static, ()>) {
        self.queue.lock().push(future);
    }
}

// ============================================================================
// Recording Tracer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    SubscriptionCreated(String),
    CacheHit(String),
    PromiseCreated(PromiseId, FetchKind),
    PromiseSettled(PromiseId, SettleOutcome),
    ResultDelivered(usize),
    ResultSuppressed,
    Acquire(usize),
    Dispose(usize),
    DoubleDispose,
    Remove(RemoveOutcome),
}

#[derive(Clone, Default)]
pub struct RecordingTracer {
    events: Arc<Mutex<Vec<TraceEvent>>>,
}

impl RecordingTracer {
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<TraceEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    fn push(&self, event: TraceEvent) {
        self.events.lock().push(event);
    }
}

impl Tracer for RecordingTracer {
    fn on_subscription_created(&self, key: &TracerKey) {
        self.push(TraceEvent::SubscriptionCreated(key.to_string()));
    }

    fn on_cache_hit(&self, key: &TracerKey) {
        self.push(TraceEvent::CacheHit(key.to_string()));
    }

    fn on_promise_created(&self, _key: &TracerKey, promise: PromiseId, kind: FetchKind) {
        self.push(TraceEvent::PromiseCreated(promise, kind));
    }

    fn on_promise_settled(&self, _key: &TracerKey, promise: PromiseId, outcome: SettleOutcome) {
        self.push(TraceEvent::PromiseSettled(promise, outcome));
    }

    fn on_result_delivered(&self, _key: &TracerKey, listeners: usize) {
        self.push(TraceEvent::ResultDelivered(listeners));
    }

    fn on_result_suppressed(&self, _key: &TracerKey) {
        self.push(TraceEvent::ResultSuppressed);
    }

    fn on_acquire(&self, _key: &TracerKey, ref_count: usize) {
        self.push(TraceEvent::Acquire(ref_count));
    }

    fn on_dispose(&self, _key: &TracerKey, ref_count: usize) {
        self.push(TraceEvent::Dispose(ref_count));
    }

    fn on_double_dispose(&self, _key: &TracerKey) {
        self.push(TraceEvent::DoubleDispose);
    }

    fn on_remove(&self, _key: &TracerKey, outcome: RemoveOutcome) {
        self.push(TraceEvent::Remove(outcome));
    }
}
