use std::fmt;
use std::hash::{Hash, Hasher};

use super::{Context, DataType, Layout, Shape};

/// Metadata describing a native array: shape, element type, layout, context
/// and an optional diagnostic name.
///
/// `DataDesc` is a plain value. It carries no native resource, and arrays
/// keep their own copy, so editing a descriptor never affects an array that
/// was created from it.
///
/// # Equality
///
/// The name is a diagnostic label and is ignored by `PartialEq` and `Hash`.
/// Two descriptors with the same shape, type, layout and context are equal
/// whatever they are called.
///
/// # Example
///
/// ```
/// use ember::types::{DataDesc, DataType, Layout, Shape};
///
/// let desc = DataDesc::new(Shape::from([2, 3]))
///     .with_data_type(DataType::Float64)
///     .with_layout(Layout::NC);
/// assert_eq!(desc.major_axis(), Some(0));
/// assert_eq!(desc.context(), None);
/// ```
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DataDesc {
    shape: Shape,
    data_type: DataType,
    name: Option<String>,
    layout: Layout,
    context: Option<Context>,
}

impl DataDesc {
    /// Descriptor with the given shape and defaults for everything else:
    /// `float32`, no name, undefined layout, engine-chosen context.
    pub fn new(shape: impl Into<Shape>) -> Self {
        Self::from_parts(shape.into(), DataType::Float32, None, Layout::Undefined, None)
    }

    /// The canonical constructor every other one collapses into.
    pub fn from_parts(
        shape: Shape,
        data_type: DataType,
        name: Option<String>,
        layout: Layout,
        context: Option<Context>,
    ) -> Self {
        Self {
            shape,
            data_type,
            name,
            layout,
            context,
        }
    }

    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_shape(mut self, shape: impl Into<Shape>) -> Self {
        self.shape = shape.into();
        self
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// The requested context; `None` lets the engine pick its default.
    pub fn context(&self) -> Option<Context> {
        self.context
    }

    pub fn set_shape(&mut self, shape: impl Into<Shape>) {
        self.shape = shape.into();
    }

    pub fn set_data_type(&mut self, data_type: DataType) {
        self.data_type = data_type;
    }

    pub fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    pub fn set_layout(&mut self, layout: Layout) {
        self.layout = layout;
    }

    pub fn set_context(&mut self, context: Option<Context>) {
        self.context = context;
    }

    /// Index of the batch axis, derived from the layout only.
    pub fn major_axis(&self) -> Option<usize> {
        self.layout.batch_axis()
    }

    /// Size in bytes of the storage this descriptor asks for, if resolved and
    /// representable.
    pub fn num_bytes(&self) -> Option<usize> {
        self.shape
            .size()
            .and_then(|n| n.checked_mul(self.data_type.num_bytes()))
    }
}

impl PartialEq for DataDesc {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape
            && self.data_type == other.data_type
            && self.layout == other.layout
            && self.context == other.context
    }
}

impl Eq for DataDesc {}

impl Hash for DataDesc {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shape.hash(state);
        self.data_type.hash(state);
        self.layout.hash(state);
        self.context.hash(state);
    }
}

impl fmt::Display for DataDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "{}: ", name)?;
        }
        write!(f, "{} {} {}", self.shape, self.data_type, self.layout)?;
        if let Some(context) = self.context {
            write!(f, " @ {}", context)?;
        }
        Ok(())
    }
}
