//! The observable query collaborator.
//!
//! The cache never fetches anything itself. Every query it tracks is backed
//! by an [`ObservableQuery`]: a long-lived reactive source that knows how to
//! fetch, refetch, page, and emit updated results. This module defines the
//! interface the cache needs from such a source and the result types that
//! flow through it.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::FetchError;

/// Network state of a query, mirroring the usual GraphQL client codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum NetworkStatus {
    /// The first fetch is in flight.
    #[default]
    Loading = 1,
    /// Variables changed and a fetch is in flight.
    SetVariables = 2,
    /// A fetch-more is in flight.
    FetchMore = 3,
    /// A refetch is in flight.
    Refetch = 4,
    /// A poll is in flight.
    Poll = 6,
    /// No request is in flight.
    Ready = 7,
    /// The last request failed.
    Error = 8,
}

impl NetworkStatus {
    /// Whether a request is in flight.
    pub fn is_in_flight(self) -> bool {
        !matches!(self, NetworkStatus::Ready | NetworkStatus::Error)
    }
}

/// One result emitted by an observable query.
pub struct QueryResult<D> {
    /// The data, if any has been received.
    pub data: Option<Arc<D>>,
    /// Whether a request is in flight.
    pub loading: bool,
    /// Detailed network state.
    pub network_status: NetworkStatus,
    /// The error of the last request, if it failed.
    pub error: Option<FetchError>,
}

impl<D> QueryResult<D> {
    /// A result with no data and a first fetch in flight.
    pub fn loading() -> Self {
        Self {
            data: None,
            loading: true,
            network_status: NetworkStatus::Loading,
            error: None,
        }
    }

    /// A settled result carrying `data`.
    pub fn ready(data: D) -> Self {
        Self::ready_arc(Arc::new(data))
    }

    /// A settled result carrying shared `data`.
    pub fn ready_arc(data: Arc<D>) -> Self {
        Self {
            data: Some(data),
            loading: false,
            network_status: NetworkStatus::Ready,
            error: None,
        }
    }

    /// Whether the result is usable without waiting: data present, nothing
    /// in flight, no error.
    pub fn is_complete(&self) -> bool {
        self.data.is_some() && !self.loading && self.error.is_none()
    }

    /// This result with the error recorded and the status set to
    /// [`NetworkStatus::Error`]. Existing data is kept.
    pub fn with_error(&self, error: FetchError) -> Self {
        Self {
            data: self.data.clone(),
            loading: false,
            network_status: NetworkStatus::Error,
            error: Some(error),
        }
    }
}

impl<D> Clone for QueryResult<D> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            loading: self.loading,
            network_status: self.network_status,
            error: self.error.clone(),
        }
    }
}

impl<D> Default for QueryResult<D> {
    fn default() -> Self {
        Self::loading()
    }
}

impl<D: fmt::Debug> fmt::Debug for QueryResult<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult")
            .field("data", &self.data)
            .field("loading", &self.loading)
            .field("network_status", &self.network_status)
            .field("error", &self.error)
            .finish()
    }
}

/// An event delivered to an observer of an [`ObservableQuery`].
pub enum QueryEvent<D> {
    /// A new result.
    Next(QueryResult<D>),
    /// The source failed.
    Error(FetchError),
}

impl<D> Clone for QueryEvent<D> {
    fn clone(&self) -> Self {
        match self {
            QueryEvent::Next(result) => QueryEvent::Next(result.clone()),
            QueryEvent::Error(error) => QueryEvent::Error(error.clone()),
        }
    }
}

/// Callback receiving [`QueryEvent`]s.
pub type Observer<D> = Arc<dyn Fn(QueryEvent<D>) + Send + Sync>;

/// A pending fetch issued through an [`ObservableQuery`].
pub type UnitOfWork<D> = BoxFuture<'static, Result<QueryResult<D>, FetchError>>;

/// Options handed to the factory that creates an [`ObservableQuery`].
#[derive(Debug, Clone, PartialEq)]
pub struct WatchQueryOptions {
    /// Normalized arguments of the query.
    pub variables: Value,
    /// Whether the first subscription should start a fetch on its own.
    ///
    /// The cache always passes `false`: it issues the initial fetch itself
    /// through [`ObservableQuery::reobserve`], and a second implicit fetch
    /// would race it.
    pub fetch_on_first_subscribe: bool,
}

/// Options for [`ObservableQuery::fetch_more`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchMoreOptions {
    /// Variables merged over the query's current variables for this fetch.
    pub variables: Option<Value>,
}

impl FetchMoreOptions {
    /// Fetch-more with the given variables.
    pub fn with_variables(variables: Value) -> Self {
        Self {
            variables: Some(variables),
        }
    }
}

/// A reactive query source.
///
/// One instance exists per (operation, canonical key) pair tracked by the
/// cache. Implementations must be cheap to call from any thread; the cache
/// calls them without holding its own locks except where noted.
pub trait ObservableQuery: Send + Sync + 'static {
    /// The data type of results.
    type Data: Send + Sync + 'static;

    /// The result known right now, without waiting.
    fn current_result(&self) -> QueryResult<Self::Data>;

    /// Register an observer for result updates.
    ///
    /// Every change must be delivered at least once. Dropping or
    /// unsubscribing the returned handle stops delivery.
    fn subscribe(&self, observer: Observer<Self::Data>) -> ListenerHandle;

    /// Issue the initial fetch according to the query's fetch policy.
    fn reobserve(&self) -> UnitOfWork<Self::Data>;

    /// Fetch an additional page of results.
    fn fetch_more(&self, options: FetchMoreOptions) -> UnitOfWork<Self::Data>;

    /// Fetch again, optionally with new variables.
    fn refetch(&self, variables: Option<Value>) -> UnitOfWork<Self::Data>;

    /// Whether any observer is still subscribed.
    fn has_observers(&self) -> bool;
}

/// Handle returned by subscribe/listen registrations.
///
/// [`unsubscribe`](Self::unsubscribe) runs the removal at most once; later
/// calls are no-ops. The handle does not unsubscribe on drop.
pub struct ListenerHandle {
    unsubscribe: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ListenerHandle {
    /// Create a handle that runs `f` on the first unsubscribe.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Mutex::new(Some(Box::new(f))),
        }
    }

    /// A handle with nothing to unsubscribe.
    pub fn noop() -> Self {
        Self {
            unsubscribe: Mutex::new(None),
        }
    }

    /// Stop the registration. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        let f = self.unsubscribe.lock().take();
        if let Some(f) = f {
            f();
        }
    }

    /// Whether [`unsubscribe`](Self::unsubscribe) has not run yet.
    pub fn is_active(&self) -> bool {
        self.unsubscribe.lock().is_some()
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("active", &self.is_active())
            .finish()
    }
}
