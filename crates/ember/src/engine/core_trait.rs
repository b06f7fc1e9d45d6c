use std::fmt::Debug;

use super::handle::{EngineTag, GraphId, NativeMeta, RawHandle};
use crate::error::Result;
use crate::types::{Context, DataDesc, DataType};

/// Initial contents of a fresh allocation.
#[derive(Debug, Clone, Copy)]
pub enum Fill<'a> {
    Zeros,
    Ones,
    /// Row-major values, one per element, rounded to the requested type.
    Values(&'a [f64]),
}

/// Single-input operations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Neg,
    Exp,
    Log,
    AddScalar(f64),
    MulScalar(f64),
    /// Reduction of all elements to a rank-0 scalar.
    Sum,
}

/// Elementwise two-input operations over equally shaped operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Controls one backward pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackwardOptions {
    /// Retain graph-tracking state so the same graph can be walked again.
    pub keep_graph: bool,
    /// Record the backward computation itself, enabling higher-order
    /// derivatives. Implies `keep_graph` for this pass.
    pub create_graph: bool,
}

impl BackwardOptions {
    pub fn keep_graph() -> Self {
        Self {
            keep_graph: true,
            create_graph: false,
        }
    }

    pub fn create_graph() -> Self {
        Self {
            keep_graph: true,
            create_graph: true,
        }
    }

    /// Whether graph state survives this pass.
    pub fn retains_graph(&self) -> bool {
        self.keep_graph || self.create_graph
    }
}

/// The narrow contract every native engine binding satisfies.
///
/// Implementations own the actual storage and kernels; the dispatch layer
/// ([`Engine`](crate::dispatch::Engine)) owns metadata, validation and
/// ownership. Every method is synchronous from the caller's point of view:
/// an engine doing asynchronous device work must block until the result is
/// safe to hand back.
///
/// # Contract
///
/// * Raw handles are only meaningful to the engine that minted them.
/// * `free` must reject a handle it no longer knows instead of touching
///   freed memory.
/// * `query` reports what the engine actually holds; the dispatch layer
///   compares it against the descriptor it computed.
/// * Only one graph may record at a time per engine instance.
pub trait NativeEngine: Debug + Send + Sync + 'static {
    /// The identity stamped on every handle this engine mints.
    fn tag(&self) -> EngineTag;

    /// Context used when a descriptor does not name one.
    fn default_context(&self) -> Context {
        Context::cpu()
    }

    /// Allocates storage for `desc`. The descriptor's context is always set
    /// and its shape resolved by the time an engine sees it.
    fn allocate(&self, desc: &DataDesc, fill: Fill<'_>) -> Result<RawHandle>;

    /// Releases one allocation.
    fn free(&self, raw: RawHandle) -> Result<()>;

    /// Metadata of an allocation as the engine sees it.
    fn query(&self, raw: RawHandle) -> Result<NativeMeta>;

    /// Copies the contents out as row-major `f64` values.
    fn read(&self, raw: RawHandle) -> Result<Vec<f64>>;

    fn unary(&self, op: UnaryOp, x: RawHandle) -> Result<RawHandle>;

    fn binary(&self, op: BinaryOp, lhs: RawHandle, rhs: RawHandle) -> Result<RawHandle>;

    /// New allocation viewing the same elements under a new shape.
    fn reshape(&self, raw: RawHandle, shape: &[usize]) -> Result<RawHandle>;

    /// New allocation converted to `data_type`.
    fn cast(&self, raw: RawHandle, data_type: DataType) -> Result<RawHandle>;

    /// New allocation holding the same elements on `context`.
    fn copy_to(&self, raw: RawHandle, context: Context) -> Result<RawHandle>;

    /// Marks (or unmarks) an allocation as a gradient-bearing leaf.
    fn set_requires_grad(&self, raw: RawHandle, requires_grad: bool) -> Result<()>;

    fn requires_grad(&self, raw: RawHandle) -> Result<bool>;

    /// A new allocation holding the accumulated gradient, if any was written.
    fn grad(&self, raw: RawHandle) -> Result<Option<RawHandle>>;

    /// Clears the accumulated gradient.
    fn zero_grad(&self, raw: RawHandle) -> Result<()>;

    /// Starts recording a computation graph.
    ///
    /// Only operations issued from the calling thread are recorded; engines
    /// keep a [`Recording`](super::Recording) to tell.
    fn begin_graph(&self) -> Result<GraphId>;

    /// Walks `graph` backward from `target`, accumulating into every
    /// gradient-bearing leaf reached.
    fn backward(&self, graph: GraphId, target: RawHandle, options: BackwardOptions) -> Result<()>;

    /// Stops recording and releases all graph-tracking state of `graph`.
    fn end_graph(&self, graph: GraphId) -> Result<()>;
}
