//! Query-Suspense: a deduplicating cache of observable query fetches for
//! suspense-style consumers.
//!
//! Many consumers may ask for the same query with the same arguments at the
//! same time. This crate makes them share one [`QuerySubscription`], one
//! [`ObservableQuery`] and one in-flight fetch, and lets each consumer read
//! the fetch synchronously: a pending read fails with
//! [`SuspenseError::Suspend`] carrying a handle to wait on.
//!
//! # Key Features
//!
//! - **Deduplication**: One subscription per (operation, canonical arguments)
//! - **Canonical keys**: Argument order and absent fields don't split the cache
//! - **Synchronous reads**: [`PromiseBox::read`] returns the value, the error, or suspends
//! - **Change gating**: Listeners only hear about results that actually changed
//! - **Explicit lifecycle**: Consumers acquire and dispose; unused entries can be removed
//! - **Observable**: Every cache event goes through the [`Tracer`] API
//!
//! # Example
//!
//! ```ignore
//! use query_suspense::{Operation, SuspenseCache, SuspenseError, Variables};
//!
//! let cache = SuspenseCache::new();
//! let get_user = Operation::<User>::new("GetUser");
//!
//! let query = cache.get_or_create(&get_user, &Variables::new().with("id", 1), |options| {
//!     client.watch_query(options)
//! })?;
//!
//! match query.read() {
//!     Ok(result) => render(&result),
//!     Err(SuspenseError::Suspend { pending }) => block_on(pending.wait()),
//!     Err(error) => return Err(error),
//! }
//!
//! query.dispose();
//! cache.remove(&get_user, &Variables::new().with("id", 1))?;
//! ```
//!
//! # Lifecycle
//!
//! The cache never drops a subscription on its own. Removal is explicit:
//!
//! - [`QueryRef::dispose`] / [`QuerySubscription::dispose`] - Release a consumer's hold
//! - [`SuspenseCache::remove`] - Remove one entry once nothing holds or observes it
//! - [`SuspenseCache::prune`] - Remove every such entry
//! - [`SuspenseCache::keys`] - Enumerate cached entries

mod cache;
mod error;
mod key;
mod observable;
mod operation;
mod promise;
pub mod result_eq;
mod subscription;
pub mod tracer;

pub use cache::{Spawn, SuspenseCache, SuspenseCacheBuilder};
pub use error::{FetchError, KeyError, SuspenseError};
pub use key::{canonicalize, normalize, same_key, CanonicalKey, Variables};
pub use observable::{
    FetchMoreOptions, ListenerHandle, NetworkStatus, ObservableQuery, Observer, QueryEvent,
    QueryResult, UnitOfWork, WatchQueryOptions,
};
pub use operation::{Operation, OperationId};
pub use promise::{PendingPromise, PromiseBox, PromiseId, PromiseState, PromiseStatus};
pub use subscription::{ConsumerToken, QueryData, QueryRef, QuerySubscription};
#[cfg(feature = "tracing")]
pub use tracer::TracingTracer;
pub use tracer::{FetchKind, NoopTracer, RemoveOutcome, SettleOutcome, Tracer, TracerKey};
