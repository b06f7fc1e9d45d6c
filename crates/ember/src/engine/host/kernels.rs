//! Reference kernels over host buffers.
//!
//! Values are held as `f64` regardless of element type and rounded to the
//! element type on every write, so a `float32` buffer behaves like one.

use crate::engine::{BinaryOp, Fill, UnaryOp};
use crate::error::{EmberError, Result};
use crate::types::{DataType, Shape};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Value {
    pub data: Vec<f64>,
    pub shape: Vec<usize>,
    pub dtype: DataType,
}

/// Rounds `x` to what an element of `dtype` can hold.
pub(crate) fn round(dtype: DataType, x: f64) -> f64 {
    match dtype {
        DataType::Float64 => x,
        DataType::Float32 | DataType::Float16 => x as f32 as f64,
        DataType::Uint8 => x as u8 as f64,
        DataType::Int8 => x as i8 as f64,
        DataType::Int32 => x as i32 as f64,
        DataType::Int64 => x as i64 as f64,
        DataType::Boolean => {
            if x != 0.0 {
                1.0
            } else {
                0.0
            }
        }
    }
}

/// Element count of `shape`, or `None` if it overflows.
pub(crate) fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |n, d| n.checked_mul(*d))
}

fn bad_size(shape: &[usize]) -> EmberError {
    EmberError::allocation(format!(
        "bad size: {} elements overflow",
        Shape::from(shape.to_vec())
    ))
}

impl Value {
    pub fn new(data: Vec<f64>, shape: Vec<usize>, dtype: DataType) -> Self {
        let data = data.into_iter().map(|x| round(dtype, x)).collect();
        Self { data, shape, dtype }
    }

    pub fn filled(shape: &[usize], dtype: DataType, fill: Fill<'_>) -> Result<Self> {
        let numel = element_count(shape).ok_or_else(|| bad_size(shape))?;
        if let Fill::Values(values) = fill {
            if values.len() != numel {
                return Err(EmberError::allocation(format!(
                    "{} values supplied for {} elements",
                    values.len(),
                    numel
                )));
            }
        }
        let mut data = Vec::new();
        data.try_reserve_exact(numel).map_err(|err| {
            EmberError::allocation(format!("out of memory for {} elements: {}", numel, err))
        })?;
        match fill {
            Fill::Zeros => data.resize(numel, 0.0),
            Fill::Ones => data.resize(numel, 1.0),
            Fill::Values(values) => data.extend_from_slice(values),
        }
        Ok(Self::new(data, shape.to_vec(), dtype))
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn num_bytes(&self) -> usize {
        self.numel() * self.dtype.num_bytes()
    }

    fn map(&self, f: impl Fn(f64) -> f64) -> Value {
        Value::new(self.data.iter().map(|x| f(*x)).collect(), self.shape.clone(), self.dtype)
    }
}

pub(crate) fn unary(op: UnaryOp, x: &Value) -> Value {
    match op {
        UnaryOp::Neg => x.map(|v| -v),
        UnaryOp::Exp => x.map(f64::exp),
        UnaryOp::Log => x.map(f64::ln),
        UnaryOp::AddScalar(c) => x.map(|v| v + c),
        UnaryOp::MulScalar(c) => x.map(|v| v * c),
        UnaryOp::Sum => Value::new(vec![x.data.iter().sum()], Vec::new(), x.dtype),
    }
}

pub(crate) fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value> {
    if lhs.shape != rhs.shape {
        return Err(EmberError::ShapeMismatch {
            left: Shape::from(lhs.shape.clone()),
            right: Shape::from(rhs.shape.clone()),
        });
    }
    if lhs.dtype != rhs.dtype {
        return Err(EmberError::DataTypeMismatch {
            left: lhs.dtype,
            right: rhs.dtype,
        });
    }
    let f: fn(f64, f64) -> f64 = match op {
        BinaryOp::Add => |a: f64, b: f64| a + b,
        BinaryOp::Sub => |a: f64, b: f64| a - b,
        BinaryOp::Mul => |a: f64, b: f64| a * b,
        BinaryOp::Div => |a: f64, b: f64| a / b,
    };
    let data = lhs.data.iter().zip(&rhs.data).map(|(a, b)| f(*a, *b)).collect();
    Ok(Value::new(data, lhs.shape.clone(), lhs.dtype))
}

pub(crate) fn reshape(x: &Value, shape: &[usize]) -> Result<Value> {
    if element_count(shape) != Some(x.numel()) {
        return Err(EmberError::ShapeMismatch {
            left: Shape::from(x.shape.clone()),
            right: Shape::from(shape.to_vec()),
        });
    }
    Ok(Value {
        data: x.data.clone(),
        shape: shape.to_vec(),
        dtype: x.dtype,
    })
}

pub(crate) fn cast(x: &Value, dtype: DataType) -> Value {
    Value::new(x.data.clone(), x.shape.clone(), dtype)
}

/// Broadcasts a single-element value to `shape`.
pub(crate) fn expand(x: &Value, shape: &[usize]) -> Result<Value> {
    let [scalar] = x.data.as_slice() else {
        return Err(EmberError::ShapeMismatch {
            left: Shape::from(x.shape.clone()),
            right: Shape::from(shape.to_vec()),
        });
    };
    let numel = element_count(shape).ok_or_else(|| bad_size(shape))?;
    Ok(Value {
        data: vec![*scalar; numel],
        shape: shape.to_vec(),
        dtype: x.dtype,
    })
}
