use std::fmt;

use crate::error::{EmberError, Result};

/// Dimension value marking an unknown (inferred) extent.
pub const UNKNOWN_DIM: i64 = -1;

/// An ordered list of dimension sizes.
///
/// A dimension of [`UNKNOWN_DIM`] means "unknown/inferred". Shapes bound to
/// live native storage are always resolved; unresolved shapes only appear on
/// symbolic descriptors and as reshape targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Shape {
    dims: Vec<i64>,
}

impl Shape {
    /// Builds a shape from signed dimensions, rejecting anything below `-1`.
    pub fn new(dims: Vec<i64>) -> Result<Self> {
        if let Some(bad) = dims.iter().find(|d| **d < UNKNOWN_DIM) {
            return Err(EmberError::invalid_shape(format!(
                "dimension {} is negative",
                bad
            )));
        }
        Ok(Self { dims })
    }

    /// The rank-0 shape of a scalar.
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Size of dimension `axis`, if that axis exists.
    pub fn get(&self, axis: usize) -> Option<i64> {
        self.dims.get(axis).copied()
    }

    /// True when no dimension is [`UNKNOWN_DIM`].
    pub fn is_resolved(&self) -> bool {
        self.dims.iter().all(|d| *d >= 0)
    }

    /// Total number of elements, or `None` while any dimension is unknown or
    /// the count does not fit in a `usize`.
    pub fn size(&self) -> Option<usize> {
        self.to_usize()
            .and_then(|dims| dims.iter().try_fold(1usize, |n, d| n.checked_mul(*d)))
    }

    /// The dimensions as `usize`, or `None` while any dimension is unknown.
    pub fn to_usize(&self) -> Option<Vec<usize>> {
        self.dims
            .iter()
            .map(|d| usize::try_from(*d).ok())
            .collect()
    }

    /// Resolves this shape as a reshape target for `numel` elements.
    ///
    /// At most one dimension may be unknown; it is inferred so that the
    /// element count matches.
    pub fn infer(&self, numel: usize) -> Result<Shape> {
        let unknown: Vec<usize> = self
            .dims
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == UNKNOWN_DIM)
            .map(|(i, _)| i)
            .collect();

        match unknown.as_slice() {
            [] => {
                if self.size() != Some(numel) {
                    return Err(EmberError::invalid_shape(format!(
                        "cannot view {} elements as {}",
                        numel, self
                    )));
                }
                Ok(self.clone())
            }
            [axis] => {
                let known = self
                    .dims
                    .iter()
                    .filter(|d| **d >= 0)
                    .try_fold(1usize, |n, d| n.checked_mul(*d as usize))
                    .unwrap_or_default();
                if known == 0 || numel % known != 0 {
                    return Err(EmberError::invalid_shape(format!(
                        "cannot infer unknown dimension of {} for {} elements",
                        self, numel
                    )));
                }
                let mut dims = self.dims.clone();
                dims[*axis] = (numel / known) as i64;
                Ok(Shape { dims })
            }
            _ => Err(EmberError::invalid_shape(format!(
                "{} has more than one unknown dimension",
                self
            ))),
        }
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self {
            dims: dims.into_iter().map(|d| d as i64).collect(),
        }
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::from(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::from(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, ")")
    }
}
