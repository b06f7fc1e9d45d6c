//! Error types for ember.
//!
//! Every fallible operation in the crate returns [`Result`]. Nothing here is
//! retried internally: errors surface synchronously to the immediate caller of
//! the failing operation, and any native storage acquired along the way is
//! still released by its owning wrapper.

use thiserror::Error;

use crate::engine::EngineTag;
use crate::types::{Context, DataType, Shape};

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EmberError>;

/// Errors that can occur while creating, transforming or differentiating
/// native arrays.
#[derive(Debug, Error)]
pub enum EmberError {
    /// The native engine could not satisfy the requested shape, type or context.
    #[error("allocation failed: {reason}")]
    Allocation { reason: String },

    /// A handle owned by one engine was handed to another.
    #[error("engine mismatch: operation bound to {expected} received a handle owned by {actual}")]
    EngineMismatch { expected: EngineTag, actual: EngineTag },

    /// A gradient session is already open on this engine.
    #[error("a gradient session is already open on {engine}")]
    SessionAlreadyOpen { engine: EngineTag },

    /// The session was never opened.
    #[error("gradient session is not open")]
    SessionNotOpen,

    /// Closing is one-way; a closed session cannot be reopened.
    #[error("gradient session is closed and cannot be reopened")]
    SessionClosed,

    /// Backward reached graph state that an earlier pass already discarded.
    #[error("computation graph was already consumed by a backward pass; pass keep_graph to retain it")]
    GraphConsumed,

    /// The target of a backward pass was never recorded by the open session.
    #[error("array was not recorded by the active gradient session")]
    NotRecorded,

    /// The handle's native storage has already been released.
    #[error("native handle used after release")]
    UseAfterRelease,

    /// The engine reports metadata that disagrees with the handle's descriptor.
    ///
    /// This is an invariant violation inside the dispatch layer, never a
    /// recoverable state.
    #[error("metadata drift: descriptor says {expected}, native engine reports {actual}")]
    MetadataDrift { expected: String, actual: String },

    /// Operands live on different contexts; copies are never implicit.
    #[error("context mismatch: {left} vs {right}; copy explicitly with to_context")]
    ContextMismatch { left: Context, right: Context },

    /// Operand shapes are incompatible.
    #[error("shape mismatch: {left} vs {right}")]
    ShapeMismatch { left: Shape, right: Shape },

    /// Operand element types are incompatible.
    #[error("data type mismatch: {left} vs {right}")]
    DataTypeMismatch { left: DataType, right: DataType },

    /// A shape could not be constructed or inferred.
    #[error("invalid shape: {reason}")]
    InvalidShape { reason: String },

    /// A textual descriptor could not be parsed.
    #[error("cannot parse `{input}` as {kind}")]
    Parse { kind: &'static str, input: String },

    /// The engine does not implement the requested capability.
    #[error("{engine} does not support {what}")]
    Unsupported { engine: EngineTag, what: String },

    /// A native library call failed for a reason of its own.
    #[error("{engine} failed: {message}")]
    Native { engine: EngineTag, message: String },
}

impl EmberError {
    pub(crate) fn allocation(reason: impl Into<String>) -> Self {
        EmberError::Allocation { reason: reason.into() }
    }

    pub(crate) fn invalid_shape(reason: impl Into<String>) -> Self {
        EmberError::InvalidShape { reason: reason.into() }
    }

    pub(crate) fn parse(kind: &'static str, input: impl Into<String>) -> Self {
        EmberError::Parse { kind, input: input.into() }
    }

    pub(crate) fn unsupported(engine: EngineTag, what: impl Into<String>) -> Self {
        EmberError::Unsupported { engine, what: what.into() }
    }

    #[cfg_attr(not(any(feature = "candle", feature = "burn")), allow(dead_code))]
    pub(crate) fn native(engine: EngineTag, message: impl ToString) -> Self {
        EmberError::Native { engine, message: message.to_string() }
    }
}
