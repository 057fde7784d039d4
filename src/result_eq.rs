//! Equality used to decide whether a new result is worth delivering.
//!
//! Observable sources may emit the same result several times (a cache
//! broadcast after an unrelated write, a poll that returned identical data).
//! Listeners are only woken when [`relevant_fields_eq`] says the result
//! actually changed.

use std::sync::Arc;

use crate::observable::QueryResult;

/// Compare the fields a consumer renders from: `loading`, `network_status`
/// and `data`. The `error` field is not compared.
pub fn relevant_fields_eq<D: PartialEq>(a: &QueryResult<D>, b: &QueryResult<D>) -> bool {
    a.loading == b.loading && a.network_status == b.network_status && data_eq(&a.data, &b.data)
}

/// Deep equality of optional shared data, short-circuiting on shared pointers.
pub fn data_eq<D: PartialEq>(a: &Option<Arc<D>>, b: &Option<Arc<D>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b) || **a == **b,
        (None, None) => true,
        _ => false,
    }
}
