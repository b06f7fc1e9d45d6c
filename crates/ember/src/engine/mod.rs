//! # Native Engines
//!
//! This module defines the narrow contract between the dispatch layer and the
//! numeric engines that actually own tensor storage, along with the engines
//! shipped with the crate.
//!
//! ## Feature Flags
//!
//! - `candle`: Enables the binding to the Candle tensor library
//! - `burn`: Enables the binding to the Burn tensor library
//!
//! The [`HostEngine`] is always available and needs no feature.
//!
//! ## Usage
//!
//! Callers rarely touch this module directly:
//!
//! 1. Construct an engine ([`HostEngine`], or `CandleEngine` / `BurnEngine`)
//! 2. Wrap it in an [`Engine`](crate::dispatch::Engine) handle
//! 3. Work with [`NativeArray`](crate::array::NativeArray) values from then on
//!
//! Implementing [`NativeEngine`] for another library makes it pluggable in the
//! same way.

mod core_trait;
mod handle;
mod host;
mod registry;

#[cfg_attr(docsrs, doc(cfg(feature = "candle")))]
#[cfg(feature = "candle")]
/// Candle engine binding.
///
/// This module is only available when the `candle` feature flag is enabled.
/// It keeps an arena of candle tensors and maps ember contexts onto candle
/// devices.
pub mod candle;

#[cfg_attr(docsrs, doc(cfg(feature = "burn")))]
#[cfg(feature = "burn")]
/// Burn engine binding.
///
/// This module is only available when the `burn` feature flag is enabled.
/// It works over any burn autodiff backend.
pub mod burn;

pub use core_trait::*;
pub use handle::{EngineKind, EngineTag, GraphId, NativeMeta, RawHandle, Recording};
pub use host::{HostDevice, HostEngine, HostStats};
pub use registry::DeviceRegistry;

#[cfg(test)]
/// Mock engine.
///
/// Counts native calls and can be told to misreport metadata.
pub(crate) mod mock_engine;
