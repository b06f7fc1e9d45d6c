//! # Ember
//!
//! An engine-agnostic core for native tensor lifecycles and autograd.
//!
//! ## Overview
//!
//! Numeric engines own tensor storage behind opaque handles. This crate is the
//! layer in front of them: it attaches metadata to those handles, keeps that
//! metadata in lock-step with what the engine actually holds, guarantees each
//! allocation is released exactly once, and scopes gradient recording.
//!
//! Key components include:
//!
//! - A metadata model: shapes, element types, layouts and contexts
//! - Owning wrappers around native allocations
//! - A dispatch layer that routes operations to the engine owning a handle
//! - Gradient sessions for recording and differentiating computations
//!
//! ## Architecture
//!
//! ### Metadata
//!
//! [`types::DataDesc`] bundles a [`types::Shape`], [`types::DataType`],
//! [`types::Layout`], optional [`types::Context`] and a diagnostic name. It is
//! a plain value: arrays keep their own copy.
//!
//! ### Engines
//!
//! The [`engine::NativeEngine`] trait is the narrow contract an engine binding
//! satisfies: allocate, free, query, a handful of operations and gradient
//! hooks. The [`engine::HostEngine`] is always available; candle and burn
//! bindings are behind features.
//!
//! ### Dispatch
//!
//! [`dispatch::Engine`] wraps one engine instance. Every operation checks
//! ownership and operand compatibility, computes the result's descriptor, and
//! verifies it against the engine's own report.
//!
//! ### Arrays
//!
//! [`array::NativeArray`] exclusively owns one allocation. Sharing is explicit
//! through [`array::SharedArray`].
//!
//! ### Gradient sessions
//!
//! [`autograd::GradientSession`] records operations on one engine while open
//! and runs backward passes over them. Sessions are bound to the thread that
//! opened them.
//!
//! ## Features
//!
//! - **candle** - Enables the candle engine
//! - **burn** - Enables the burn engine
//! - **serde** - Serialize/deserialize metadata and configuration
//!
//! ## Example
//!
//! ```
//! use ember::dispatch::Engine;
//! use ember::engine::HostEngine;
//! use ember::types::{DataDesc, Layout};
//!
//! # fn main() -> ember::Result<()> {
//! let engine = Engine::new(HostEngine::new());
//! let desc = DataDesc::new([2, 3]).with_layout(Layout::NC);
//!
//! let x = engine.ones(&desc)?;
//! x.set_requires_gradient(true)?;
//!
//! let mut session = engine.gradient_session()?;
//! let y = x.exp()?.sum()?;
//! session.backward(&y)?;
//! session.close()?;
//!
//! let grad = x.gradient()?.expect("x took part in the backward pass");
//! assert_eq!(grad.desc().shape(), x.shape());
//! # Ok(())
//! # }
//! ```

pub mod array;
pub mod autograd;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod types;

pub use error::{EmberError, Result};
