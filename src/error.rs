//! Error types for suspense reads and cache operations.

use std::fmt;
use std::sync::Arc;

use crate::promise::PendingPromise;

/// The error a unit of work rejected with.
///
/// The original error is kept behind an `Arc`, so every read of a rejected
/// [`PromiseBox`](crate::PromiseBox) hands out the identical error object.
/// Any type implementing `Into<anyhow::Error>` converts into this with `?`.
#[derive(Clone)]
pub struct FetchError(Arc<anyhow::Error>);

impl FetchError {
    /// Wrap an error.
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// Returns a reference to the original error.
    pub fn inner(&self) -> &Arc<anyhow::Error> {
        &self.0
    }

    /// Attempts to downcast the original error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    /// Returns `true` if the original error is of type `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }

    /// Returns `true` if both values share the same underlying error object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T: Into<anyhow::Error>> From<T> for FetchError {
    fn from(err: T) -> Self {
        FetchError::new(err)
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

/// Arguments could not be reduced to a canonical key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyError {
    /// Serializing the arguments to plain data failed.
    #[error("arguments are not plain data: {message}")]
    NotPlainData {
        /// Message of the underlying serializer error.
        message: String,
    },

    /// The arguments serialized to something other than a map.
    #[error("arguments must serialize to a map, got {found}")]
    NotAMap {
        /// Kind of value that was found instead.
        found: &'static str,
    },
}

impl From<serde_json::Error> for KeyError {
    fn from(err: serde_json::Error) -> Self {
        KeyError::NotPlainData {
            message: err.to_string(),
        }
    }
}

/// Errors surfaced to a consumer of the suspense cache.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SuspenseError {
    /// The value is not ready yet.
    ///
    /// Returned by a force-read of a pending box. The caller should abandon
    /// its current pass and retry once `pending.wait()` completes.
    #[error("suspended: waiting for {pending:?}")]
    Suspend {
        /// Handle to the box the read is waiting on.
        pending: PendingPromise,
    },

    /// The unit of work rejected. The original error is preserved.
    #[error("{0}")]
    Fetch(FetchError),

    /// The arguments could not be canonicalized.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// A cache slot for this operation holds a subscription of another data type.
    #[error("subscription for operation `{operation}` has a different data type")]
    TypeMismatch {
        /// Name of the operation.
        operation: String,
    },
}

impl SuspenseError {
    /// Returns `true` if this is a [`SuspenseError::Suspend`].
    pub fn is_suspend(&self) -> bool {
        matches!(self, SuspenseError::Suspend { .. })
    }

    /// Returns the fetch error if this is a [`SuspenseError::Fetch`].
    pub fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            SuspenseError::Fetch(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast a fetch error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.fetch_error().and_then(|e| e.downcast_ref::<E>())
    }
}

impl From<FetchError> for SuspenseError {
    fn from(err: FetchError) -> Self {
        SuspenseError::Fetch(err)
    }
}
