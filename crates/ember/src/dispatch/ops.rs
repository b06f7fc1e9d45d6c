//! Array operations routed through an [`Engine`].
//!
//! Each operation recomputes the result descriptor itself; the native
//! engine's report is only ever used to check it.

use tracing::{debug, trace};

use super::Engine;
use crate::array::NativeArray;
use crate::engine::{BinaryOp, UnaryOp};
use crate::error::{EmberError, Result};
use crate::types::{Context, DataDesc, DataType, Layout, Shape};

/// Descriptor of a freshly computed array. Results carry no name and always
/// name their context.
fn derived(shape: Shape, data_type: DataType, layout: Layout, context: Context) -> DataDesc {
    DataDesc::from_parts(shape, data_type, None, layout, Some(context))
}

impl Engine {
    pub fn add(&self, lhs: &NativeArray, rhs: &NativeArray) -> Result<NativeArray> {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn sub(&self, lhs: &NativeArray, rhs: &NativeArray) -> Result<NativeArray> {
        self.binary(BinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(&self, lhs: &NativeArray, rhs: &NativeArray) -> Result<NativeArray> {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    pub fn div(&self, lhs: &NativeArray, rhs: &NativeArray) -> Result<NativeArray> {
        self.binary(BinaryOp::Div, lhs, rhs)
    }

    pub fn neg(&self, x: &NativeArray) -> Result<NativeArray> {
        self.unary(UnaryOp::Neg, x)
    }

    pub fn exp(&self, x: &NativeArray) -> Result<NativeArray> {
        self.unary(UnaryOp::Exp, x)
    }

    /// Natural logarithm.
    pub fn log(&self, x: &NativeArray) -> Result<NativeArray> {
        self.unary(UnaryOp::Log, x)
    }

    pub fn add_scalar(&self, x: &NativeArray, value: f64) -> Result<NativeArray> {
        self.unary(UnaryOp::AddScalar(value), x)
    }

    pub fn mul_scalar(&self, x: &NativeArray, value: f64) -> Result<NativeArray> {
        self.unary(UnaryOp::MulScalar(value), x)
    }

    /// Sum of all elements, as a rank-0 array with undefined layout.
    pub fn sum(&self, x: &NativeArray) -> Result<NativeArray> {
        self.unary(UnaryOp::Sum, x)
    }

    /// A new array holding the same elements under `shape`.
    ///
    /// One dimension of `shape` may be [`UNKNOWN_DIM`](crate::types::UNKNOWN_DIM)
    /// and is inferred. The layout survives only if the rank does.
    pub fn reshape(&self, x: &NativeArray, shape: impl Into<Shape>) -> Result<NativeArray> {
        let raw = x.as_typed(self.tag())?;
        let numel = x.shape().size().unwrap_or_default();
        let target = shape.into().infer(numel)?;
        let dims = target
            .to_usize()
            .ok_or_else(|| EmberError::invalid_shape(format!("{} is not resolved", target)))?;

        let layout = if target.rank() == x.shape().rank() {
            x.layout()
        } else {
            Layout::Undefined
        };
        trace!(handle = %raw, from = %x.shape(), to = %target, "reshape");
        let out = self.native().reshape(raw, &dims)?;
        self.adopt(out, derived(target, x.data_type(), layout, x.context()), x.context())
    }

    /// A new array converted to `data_type`; nothing else changes.
    pub fn cast(&self, x: &NativeArray, data_type: DataType) -> Result<NativeArray> {
        let raw = x.as_typed(self.tag())?;
        trace!(handle = %raw, from = %x.data_type(), to = %data_type, "cast");
        let out = self.native().cast(raw, data_type)?;
        let desc = derived(x.shape().clone(), data_type, x.layout(), x.context());
        self.adopt(out, desc, x.context())
    }

    /// An explicit copy of `x` onto `context`; nothing else changes.
    pub fn to_context(&self, x: &NativeArray, context: Context) -> Result<NativeArray> {
        let raw = x.as_typed(self.tag())?;
        debug!(handle = %raw, from = %x.context(), to = %context, "copying across contexts");
        let out = self.native().copy_to(raw, context)?;
        let desc = derived(x.shape().clone(), x.data_type(), x.layout(), context);
        self.adopt(out, desc, context)
    }

    /// A new allocation with the same contents and descriptor as `x`.
    pub fn duplicate(&self, x: &NativeArray) -> Result<NativeArray> {
        let raw = x.as_typed(self.tag())?;
        trace!(handle = %raw, "duplicate");
        let out = self.native().copy_to(raw, x.context())?;
        self.adopt(out, x.desc().clone(), x.context())
    }

    fn unary(&self, op: UnaryOp, x: &NativeArray) -> Result<NativeArray> {
        let raw = x.as_typed(self.tag())?;
        trace!(handle = %raw, ?op, "unary");
        let out = self.native().unary(op, raw)?;

        let desc = match op {
            UnaryOp::Sum => derived(Shape::scalar(), x.data_type(), Layout::Undefined, x.context()),
            _ => derived(x.shape().clone(), x.data_type(), x.layout(), x.context()),
        };
        self.adopt(out, desc, x.context())
    }

    fn binary(&self, op: BinaryOp, lhs: &NativeArray, rhs: &NativeArray) -> Result<NativeArray> {
        let left = lhs.as_typed(self.tag())?;
        let right = rhs.as_typed(self.tag())?;
        if lhs.context() != rhs.context() {
            return Err(EmberError::ContextMismatch {
                left: lhs.context(),
                right: rhs.context(),
            });
        }
        if lhs.shape() != rhs.shape() {
            return Err(EmberError::ShapeMismatch {
                left: lhs.shape().clone(),
                right: rhs.shape().clone(),
            });
        }
        if lhs.data_type() != rhs.data_type() {
            return Err(EmberError::DataTypeMismatch {
                left: lhs.data_type(),
                right: rhs.data_type(),
            });
        }

        trace!(lhs = %left, rhs = %right, ?op, "binary");
        let out = self.native().binary(op, left, right)?;
        // Layouts that disagree give no meaningful axis labels.
        let layout = if lhs.layout() == rhs.layout() {
            lhs.layout()
        } else {
            Layout::Undefined
        };
        let desc = derived(lhs.shape().clone(), lhs.data_type(), layout, lhs.context());
        self.adopt(out, desc, lhs.context())
    }
}
