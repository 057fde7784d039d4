//! Tracer trait for observing the suspense cache.
//!
//! This module defines the [`Tracer`] trait and the event payload types. The
//! default [`NoopTracer`] discards everything. With the `tracing` feature,
//! [`TracingTracer`] forwards events to the `tracing` crate.
//!
//! # Example
//!
//! ```ignore
//! use query_suspense::{SuspenseCache, Tracer, TracerKey};
//!
//! struct PrintTracer;
//!
//! impl Tracer for PrintTracer {
//!     fn on_subscription_created(&self, key: &TracerKey) {
//!         println!("new subscription: {key}");
//!     }
//! }
//!
//! let cache = SuspenseCache::builder().tracer(PrintTracer).build();
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::promise::PromiseId;

/// Type-erased identity of a cache entry, for tracing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TracerKey {
    /// Operation name.
    pub operation: String,
    /// Canonical key of the arguments.
    pub canonical_key: String,
}

impl TracerKey {
    /// Create a new tracer key.
    #[inline]
    pub fn new(operation: impl Into<String>, canonical_key: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            canonical_key: canonical_key.into(),
        }
    }
}

impl fmt::Display for TracerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.operation, self.canonical_key)
    }
}

/// Why a promise box was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchKind {
    /// Initial fetch issued when the subscription was created.
    Initial,
    /// The observable already had a complete result; no fetch was issued.
    Cached,
    /// Refetch requested by a consumer.
    Refetch,
    /// Fetch-more requested by a consumer.
    FetchMore,
}

/// How a promise box settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettleOutcome {
    /// The unit of work produced a value.
    Fulfilled,
    /// The unit of work failed.
    Rejected {
        /// Display form of the error.
        message: String,
    },
}

/// Result of a removal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoveOutcome {
    /// The entry was removed.
    Removed,
    /// No entry existed.
    NotFound,
    /// The entry is still held by consumers or observers.
    StillObserved {
        /// Consumers still holding the subscription.
        ref_count: usize,
    },
}

/// Tracer trait for observing the suspense cache.
///
/// All methods have default empty implementations, so you only need to
/// override the events you're interested in.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; events may be emitted from whichever
/// thread drives a fetch.
pub trait Tracer: Send + Sync + 'static {
    /// A new subscription was created for a key.
    #[inline]
    fn on_subscription_created(&self, _key: &TracerKey) {}

    /// An existing subscription was returned for a key.
    #[inline]
    fn on_cache_hit(&self, _key: &TracerKey) {}

    /// A promise box was created.
    #[inline]
    fn on_promise_created(&self, _key: &TracerKey, _promise: PromiseId, _kind: FetchKind) {}

    /// A promise box settled.
    #[inline]
    fn on_promise_settled(&self, _key: &TracerKey, _promise: PromiseId, _outcome: SettleOutcome) {}

    /// A changed result was delivered to listeners.
    #[inline]
    fn on_result_delivered(&self, _key: &TracerKey, _listeners: usize) {}

    /// A result equal to the previous one was swallowed.
    #[inline]
    fn on_result_suppressed(&self, _key: &TracerKey) {}

    /// A consumer acquired the subscription.
    #[inline]
    fn on_acquire(&self, _key: &TracerKey, _ref_count: usize) {}

    /// A consumer released the subscription.
    #[inline]
    fn on_dispose(&self, _key: &TracerKey, _ref_count: usize) {}

    /// A consumer released a token it did not hold.
    #[inline]
    fn on_double_dispose(&self, _key: &TracerKey) {}

    /// A removal was requested.
    #[inline]
    fn on_remove(&self, _key: &TracerKey, _outcome: RemoveOutcome) {}
}

/// Zero-cost tracer that discards all events.
///
/// This is the default tracer for [`SuspenseCache`](crate::SuspenseCache).
pub struct NoopTracer;

impl Tracer for NoopTracer {}

/// Tracer that forwards events to the `tracing` crate.
#[cfg(feature = "tracing")]
pub struct TracingTracer;

#[cfg(feature = "tracing")]
impl Tracer for TracingTracer {
    fn on_subscription_created(&self, key: &TracerKey) {
        tracing::debug!(operation = %key.operation, key = %key.canonical_key, "subscription created");
    }

    fn on_cache_hit(&self, key: &TracerKey) {
        tracing::trace!(operation = %key.operation, key = %key.canonical_key, "cache hit");
    }

    fn on_promise_created(&self, key: &TracerKey, promise: PromiseId, kind: FetchKind) {
        tracing::debug!(
            operation = %key.operation,
            key = %key.canonical_key,
            promise = promise.0,
            ?kind,
            "promise created"
        );
    }

    fn on_promise_settled(&self, key: &TracerKey, promise: PromiseId, outcome: SettleOutcome) {
        match outcome {
            SettleOutcome::Fulfilled => tracing::debug!(
                operation = %key.operation,
                key = %key.canonical_key,
                promise = promise.0,
                "promise fulfilled"
            ),
            SettleOutcome::Rejected { message } => tracing::debug!(
                operation = %key.operation,
                key = %key.canonical_key,
                promise = promise.0,
                error = %message,
                "promise rejected"
            ),
        }
    }

    fn on_result_delivered(&self, key: &TracerKey, listeners: usize) {
        tracing::trace!(operation = %key.operation, key = %key.canonical_key, listeners, "result delivered");
    }

    fn on_result_suppressed(&self, key: &TracerKey) {
        tracing::trace!(operation = %key.operation, key = %key.canonical_key, "unchanged result suppressed");
    }

    fn on_acquire(&self, key: &TracerKey, ref_count: usize) {
        tracing::trace!(operation = %key.operation, key = %key.canonical_key, ref_count, "acquired");
    }

    fn on_dispose(&self, key: &TracerKey, ref_count: usize) {
        tracing::trace!(operation = %key.operation, key = %key.canonical_key, ref_count, "disposed");
    }

    fn on_double_dispose(&self, key: &TracerKey) {
        tracing::warn!(
            operation = %key.operation,
            key = %key.canonical_key,
            "dispose called with a token that is not held"
        );
    }

    fn on_remove(&self, key: &TracerKey, outcome: RemoveOutcome) {
        tracing::debug!(operation = %key.operation, key = %key.canonical_key, ?outcome, "remove");
    }
}
