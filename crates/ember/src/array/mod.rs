//! # Native Arrays
//!
//! Owning wrappers around native-engine allocations.
//!
//! - [`NativeArray`] - exclusive ownership; released exactly once, explicitly
//!   or on drop
//! - [`SharedArray`] - explicit reference-counted ownership for arrays that
//!   must outlive a single scope

mod native_array;
mod shared;

pub use native_array::NativeArray;
pub use shared::SharedArray;
