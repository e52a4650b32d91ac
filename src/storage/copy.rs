//! Detaching stored entities from the store.
//!
//! Stored entities live behind `Arc`s. Handing one out means producing an
//! owned value whose nested collections share nothing with the stored one,
//! so a caller mutating the result cannot reach back into the store.

use std::sync::Arc;

/// Produce an owned, independent copy of a stored entity.
///
/// Clones the inner value unless this was the last reference, in which case
/// the value is moved out without copying.
pub(crate) fn detach<T: Clone>(stored: Arc<T>) -> T {
    Arc::unwrap_or_clone(stored)
}

/// Detach a list of stored entities, keeping order.
pub(crate) fn detach_all<T: Clone>(stored: Vec<Arc<T>>) -> Vec<T> {
    stored.into_iter().map(detach).collect()
}
