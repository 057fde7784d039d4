//! Operation identity tokens.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u64);

/// Identity of "what is being queried", independent of its arguments.
///
/// `D` is the data type the operation produces. Clones share the identity of
/// the original. Identity is *not* structural: two operations created by
/// separate calls to [`Operation::new`] never compare equal, even with the
/// same name, so they never share cache entries. Create each operation once
/// and reuse it.
pub struct Operation<D> {
    id: OperationId,
    name: Arc<str>,
    _data: PhantomData<fn() -> D>,
}

impl<D> Operation<D> {
    /// Create a new operation with a fresh identity.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            id: OperationId(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            _data: PhantomData,
        }
    }

    /// The identity of this operation.
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// The display name given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<D> Clone for Operation<D> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            _data: PhantomData,
        }
    }
}

impl<D> fmt::Debug for Operation<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operation({}#{})", self.name, self.id.0)
    }
}

impl<D> PartialEq for Operation<D> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<D> Eq for Operation<D> {}

impl<D> Hash for Operation<D> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
