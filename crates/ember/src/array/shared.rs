use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use super::NativeArray;

/// Reference-counted ownership of a [`NativeArray`].
///
/// Sharing is always explicit: a `SharedArray` only comes from
/// [`NativeArray::into_shared`]. Clones share one allocation, and the native
/// storage is released exactly once, when the last clone is dropped.
///
/// # Example
///
/// ```
/// use ember::dispatch::Engine;
/// use ember::engine::HostEngine;
/// use ember::types::DataDesc;
///
/// let host = HostEngine::new();
/// let engine = Engine::new(host.clone());
///
/// let shared = engine.ones(&DataDesc::new([4])).unwrap().into_shared();
/// let other = shared.clone();
/// drop(shared);
/// assert_eq!(host.live_allocations(), 1);
///
/// drop(other);
/// assert_eq!(host.live_allocations(), 0);
/// ```
#[derive(Clone)]
pub struct SharedArray(Arc<NativeArray>);

impl SharedArray {
    /// Exclusive ownership back, if this is the only owner left.
    ///
    /// Otherwise the shared handle is returned unchanged.
    pub fn try_unwrap(self) -> Result<NativeArray, SharedArray> {
        Arc::try_unwrap(self.0).map_err(SharedArray)
    }

    /// Number of owners currently sharing the allocation.
    pub fn owners(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Whether two shared handles point at the same allocation.
    pub fn ptr_eq(&self, other: &SharedArray) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl NativeArray {
    /// Moves this array into reference-counted ownership.
    pub fn into_shared(self) -> SharedArray {
        SharedArray(Arc::new(self))
    }
}

impl Deref for SharedArray {
    type Target = NativeArray;

    fn deref(&self) -> &NativeArray {
        &self.0
    }
}

impl From<NativeArray> for SharedArray {
    fn from(array: NativeArray) -> Self {
        array.into_shared()
    }
}

impl fmt::Debug for SharedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedArray")
            .field("owners", &self.owners())
            .field("array", &*self.0)
            .finish()
    }
}
