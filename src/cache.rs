//! The suspense cache: the deduplication table.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use slab::Slab;

use crate::error::SuspenseError;
use crate::key::{self, CanonicalKey};
use crate::observable::{ObservableQuery, QueryResult, WatchQueryOptions};
use crate::operation::{Operation, OperationId};
use crate::promise::{PromiseBox, PromiseId};
use crate::subscription::{
    ConsumerToken, ErasedSubscription, QueryData, QueryRef, QuerySubscription,
};
use crate::tracer::{NoopTracer, RemoveOutcome, Tracer, TracerKey};

/// Executor hook for driving promise boxes eagerly.
///
/// When a spawner is configured, each new box's settlement future is handed
/// to it as soon as the box is created. Without one, a box settles when
/// someone awaits it.
///
/// Implemented for any `Fn(BoxFuture<'static, ()>) + Send + Sync`, so
/// `|fut: BoxFuture<'static, ()>| { tokio::spawn(fut); }` works as a spawner.
pub trait Spawn: Send + Sync + 'static {
    /// Run `future` to completion in the background.
    fn spawn(&self, future: BoxFuture<'static, ()>);
}

impl<F> Spawn for F
where
    F: Fn(BoxFuture<'static, ()>) + Send + Sync + 'static,
{
    fn spawn(&self, future: BoxFuture<'static, ()>) {
        self(future)
    }
}

type Entry = Arc<dyn ErasedSubscription>;

#[derive(Default)]
struct Table {
    slots: Slab<Entry>,
    by_key: HashMap<OperationId, HashMap<CanonicalKey, usize>>,
    by_promise: HashMap<PromiseId, usize>,
}

impl Table {
    fn find(&self, operation: OperationId, key: &CanonicalKey) -> Option<usize> {
        self.by_key.get(&operation)?.get(key).copied()
    }

    fn holds(&self, slot: usize, entry: &Entry) -> bool {
        self.slots
            .get(slot)
            .is_some_and(|held| same_subscription(held, entry))
    }

    fn insert(&mut self, entry: Entry) -> usize {
        let slot = self.slots.insert(entry.clone());
        self.by_key
            .entry(entry.operation_id())
            .or_default()
            .insert(entry.canonical_key().clone(), slot);
        entry.set_slot(Some(slot));
        for id in entry.promise_ids() {
            self.by_promise.insert(id, slot);
        }
        slot
    }

    fn remove(&mut self, slot: usize) -> Option<Entry> {
        let entry = self.slots.try_remove(slot)?;
        if let Some(keys) = self.by_key.get_mut(&entry.operation_id()) {
            if keys.get(entry.canonical_key()) == Some(&slot) {
                keys.remove(entry.canonical_key());
            }
            if keys.is_empty() {
                self.by_key.remove(&entry.operation_id());
            }
        }
        for id in entry.promise_ids() {
            if self.by_promise.get(&id) == Some(&slot) {
                self.by_promise.remove(&id);
            }
        }
        Some(entry)
    }
}

fn same_subscription(a: &Entry, b: &Entry) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Shared state behind a [`SuspenseCache`] and its clones.
pub(crate) struct CacheCore {
    table: Mutex<Table>,
    pub(crate) tracer: Arc<dyn Tracer>,
    pub(crate) spawner: Option<Arc<dyn Spawn>>,
}

impl CacheCore {
    /// Record that `subscription` issued `promise` and no longer tracks the
    /// `retired` boxes.
    ///
    /// A subscription that was removed from the table is put back, unless a
    /// newer subscription has taken its key in the meantime.
    pub(crate) fn register_promise(
        &self,
        subscription: Entry,
        promise: PromiseId,
        retired: &[PromiseId],
    ) {
        let mut table = self.table.lock();
        let slot = match subscription.slot() {
            Some(slot) if table.holds(slot, &subscription) => slot,
            _ => {
                if table
                    .find(subscription.operation_id(), subscription.canonical_key())
                    .is_some()
                {
                    return;
                }
                table.insert(subscription)
            }
        };
        for id in retired {
            if table.by_promise.get(id) == Some(&slot) {
                table.by_promise.remove(id);
            }
        }
        table.by_promise.insert(promise, slot);
    }
}

/// A deduplicating cache of query subscriptions.
///
/// Maps (operation identity, canonical arguments) to one
/// [`QuerySubscription`]. Concurrent requests for the same pair share the
/// subscription, its observable, and its in-flight fetch.
///
/// This is cheap to clone; clones share the same table. There is no global
/// instance: construct one per client and pass it to every entry point.
///
/// # Example
///
/// ```ignore
/// let cache = SuspenseCache::new();
/// let user = Operation::<User>::new("GetUser");
///
/// let query = cache.get_or_create(&user, &Variables::new().with("id", 1), |options| {
///     client.watch_query(options)
/// })?;
///
/// match query.read() {
///     Ok(result) => render(&result),
///     Err(SuspenseError::Suspend { pending }) => return stall_until(pending.wait()),
///     Err(error) => return Err(error),
/// }
///
/// query.dispose();
/// ```
#[derive(Clone)]
pub struct SuspenseCache {
    core: Arc<CacheCore>,
}

impl Default for SuspenseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SuspenseCache {
    /// Create a cache with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for customizing the cache.
    pub fn builder() -> SuspenseCacheBuilder {
        SuspenseCacheBuilder::new()
    }

    /// Return the subscription for `(operation, args)`, creating it on first
    /// request, and acquire it for the caller.
    ///
    /// `factory` runs only when no subscription exists yet. It receives the
    /// normalized variables and `fetch_on_first_subscribe: false`; the new
    /// subscription issues the initial fetch itself. Lookup, creation and
    /// taking the caller's hold happen under one lock, so two requests with
    /// equal arguments always share one subscription and one initial fetch.
    ///
    /// `factory` and, on creation, the observable's `reobserve` run while the
    /// table is locked and must not call back into this cache. The observable
    /// is subscribed to after the lock is released, so results it delivers
    /// from `subscribe` reach listeners that may use the cache.
    ///
    /// # Errors
    ///
    /// - [`SuspenseError::Key`] if `args` cannot be canonicalized.
    /// - [`SuspenseError::TypeMismatch`] if the slot holds another data type.
    pub fn get_or_create<D, Q, F>(
        &self,
        operation: &Operation<D>,
        args: &impl Serialize,
        factory: F,
    ) -> Result<QueryRef<D>, SuspenseError>
    where
        D: QueryData,
        Q: ObservableQuery<Data = D>,
        F: FnOnce(WatchQueryOptions) -> Q,
    {
        let variables = key::normalize(args)?;
        let canonical_key = key::canonicalize_value(&variables);

        let mut table = self.core.table.lock();
        let subscription = match table.find(operation.id(), &canonical_key) {
            Some(slot) => {
                let subscription = downcast::<D>(&table.slots[slot], operation)?;
                self.core.tracer.on_cache_hit(subscription.tracer_key());
                subscription
            }
            None => {
                let observable = factory(WatchQueryOptions {
                    variables: variables.clone(),
                    fetch_on_first_subscribe: false,
                });
                let slot = table.slots.vacant_key();
                let subscription = QuerySubscription::new(
                    operation.clone(),
                    canonical_key,
                    variables,
                    Arc::new(observable),
                    &self.core,
                    slot,
                );
                let inserted = table.insert(subscription.clone());
                debug_assert_eq!(inserted, slot);
                self.core
                    .tracer
                    .on_subscription_created(subscription.tracer_key());
                subscription
            }
        };
        let token = ConsumerToken::new();
        subscription.register_consumer(token);
        drop(table);

        subscription.ensure_observer();
        Ok(QueryRef::new(subscription, token))
    }

    /// The subscription for `(operation, args)`, if one exists. Does not
    /// create or acquire anything.
    pub fn lookup<D: QueryData>(
        &self,
        operation: &Operation<D>,
        args: &impl Serialize,
    ) -> Result<Option<Arc<QuerySubscription<D>>>, SuspenseError> {
        let canonical_key = key::canonicalize(args)?;
        let table = self.core.table.lock();
        match table.find(operation.id(), &canonical_key) {
            Some(slot) => downcast(&table.slots[slot], operation).map(Some),
            None => Ok(None),
        }
    }

    /// Find the subscription that issued `promise`.
    ///
    /// Works for any box issued by a subscription that is still in the
    /// cache, including replaced boxes that are still held somewhere. Once
    /// every handle to a replaced box is dropped, the cache forgets it.
    pub fn get_by_unit_of_work<D: QueryData>(
        &self,
        promise: &PromiseBox<QueryResult<D>>,
    ) -> Option<Arc<QuerySubscription<D>>> {
        let table = self.core.table.lock();
        let slot = *table.by_promise.get(&promise.id())?;
        let entry = table.slots.get(slot)?.clone();
        entry.into_any().downcast::<QuerySubscription<D>>().ok()
    }

    /// Remove the subscription for `(operation, args)` if nothing uses it.
    ///
    /// Returns `true` if an entry was removed. An entry that is still held
    /// by a consumer, or whose observable still has observers, is kept. A
    /// missing entry is not an error.
    pub fn remove<D: QueryData>(
        &self,
        operation: &Operation<D>,
        args: &impl Serialize,
    ) -> Result<bool, SuspenseError> {
        let canonical_key = key::canonicalize(args)?;
        let mut table = self.core.table.lock();
        let Some(slot) = table.find(operation.id(), &canonical_key) else {
            self.core.tracer.on_remove(
                &TracerKey::new(operation.name(), canonical_key.as_str()),
                RemoveOutcome::NotFound,
            );
            return Ok(false);
        };

        let entry = table.slots[slot].clone();
        if !entry.is_removable() {
            self.core.tracer.on_remove(
                entry.tracer_key(),
                RemoveOutcome::StillObserved {
                    ref_count: entry.ref_count(),
                },
            );
            return Ok(false);
        }

        table.remove(slot);
        drop(table);
        entry.detach();
        self.core
            .tracer
            .on_remove(entry.tracer_key(), RemoveOutcome::Removed);
        Ok(true)
    }

    /// Remove every subscription that nothing uses. Returns how many were
    /// removed.
    pub fn prune(&self) -> usize {
        let removed: Vec<Entry> = {
            let mut table = self.core.table.lock();
            let slots: Vec<usize> = table
                .slots
                .iter()
                .filter(|(_, entry)| entry.is_removable())
                .map(|(slot, _)| slot)
                .collect();
            slots
                .into_iter()
                .filter_map(|slot| table.remove(slot))
                .collect()
        };
        for entry in &removed {
            entry.detach();
            self.core
                .tracer
                .on_remove(entry.tracer_key(), RemoveOutcome::Removed);
        }
        removed.len()
    }

    /// Number of subscriptions in the cache.
    pub fn len(&self) -> usize {
        self.core.table.lock().slots.len()
    }

    /// Whether the cache holds no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All (operation, key) pairs currently in the cache.
    pub fn keys(&self) -> Vec<(OperationId, CanonicalKey)> {
        let table = self.core.table.lock();
        table
            .by_key
            .iter()
            .flat_map(|(operation, keys)| keys.keys().map(move |key| (*operation, key.clone())))
            .collect()
    }

    /// Drop every subscription regardless of use.
    ///
    /// Consumers still holding a [`QueryRef`] keep a working subscription,
    /// but it is no longer reachable through the cache until it issues a new
    /// fetch.
    pub fn clear(&self) {
        let removed: Vec<Entry> = {
            let mut table = self.core.table.lock();
            let removed = table.slots.drain().collect();
            table.by_key.clear();
            table.by_promise.clear();
            removed
        };
        for entry in removed {
            entry.detach();
        }
    }
}

fn downcast<D: QueryData>(
    entry: &Entry,
    operation: &Operation<D>,
) -> Result<Arc<QuerySubscription<D>>, SuspenseError> {
    entry
        .clone()
        .into_any()
        .downcast::<QuerySubscription<D>>()
        .map_err(|_| SuspenseError::TypeMismatch {
            operation: operation.name().to_string(),
        })
}

impl fmt::Debug for SuspenseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspenseCache")
            .field("subscriptions", &self.len())
            .finish()
    }
}

/// Builder for [`SuspenseCache`].
pub struct SuspenseCacheBuilder {
    tracer: Arc<dyn Tracer>,
    spawner: Option<Arc<dyn Spawn>>,
}

impl Default for SuspenseCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SuspenseCacheBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            tracer: Arc::new(NoopTracer),
            spawner: None,
        }
    }

    /// Set the tracer receiving cache events.
    ///
    /// Tracer hooks may run while the cache table is locked and must not
    /// call back into the cache.
    pub fn tracer(mut self, tracer: impl Tracer) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Drive every new promise box on `spawner` as soon as it is created.
    pub fn spawner(mut self, spawner: impl Spawn) -> Self {
        self.spawner = Some(Arc::new(spawner));
        self
    }

    /// Build the cache.
    pub fn build(self) -> SuspenseCache {
        SuspenseCache {
            core: Arc::new(CacheCore {
                table: Mutex::new(Table::default()),
                tracer: self.tracer,
                spawner: self.spawner,
            }),
        }
    }
}
