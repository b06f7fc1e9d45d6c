//! # Metadata Model
//!
//! Immutable descriptors for everything the dispatch layer needs to know about
//! a native array without touching the native engine:
//!
//! * [`Shape`] - dimension sizes, `-1` marking an unknown extent
//! * [`DataType`] - element kind
//! * [`Layout`] - semantic axis ordering and the derived batch axis
//! * [`Context`] - symbolic device locator
//! * [`DataDesc`] - the bundle of all of the above plus a diagnostic name

mod context;
mod data_desc;
mod data_type;
mod layout;
mod shape;

pub use context::{Context, DeviceType, DEFAULT_CONTEXT_ENV};
pub use data_desc::DataDesc;
pub use data_type::DataType;
pub use layout::{Layout, LayoutType};
pub use shape::{Shape, UNKNOWN_DIM};
