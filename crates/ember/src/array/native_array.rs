use std::fmt;

use tracing::{debug, error, warn};

use crate::dispatch::Engine;
use crate::engine::{EngineTag, RawHandle};
use crate::error::{EmberError, Result};
use crate::types::{Context, DataDesc, DataType, Layout, Shape};

/// Owning wrapper around one allocation inside a native engine.
///
/// A `NativeArray` binds the engine's opaque handle to the [`DataDesc`] it
/// was created with and is the only thing responsible for releasing it. The
/// allocation is freed exactly once: by an explicit [`release`](Self::release)
/// or, failing that, when the wrapper is dropped. Any use after release fails
/// with [`EmberError::UseAfterRelease`] instead of reaching the engine.
///
/// Shape and element type are fixed for the wrapper's lifetime. Operations that
/// change them return a new wrapper.
///
/// # Example
///
/// ```
/// use ember::array::NativeArray;
/// use ember::dispatch::Engine;
/// use ember::engine::HostEngine;
/// use ember::types::{DataDesc, Layout};
/// use ember::EmberError;
///
/// let engine = Engine::new(HostEngine::new());
/// let desc = DataDesc::new([2, 3]).with_layout(Layout::NC);
///
/// let mut x = NativeArray::create(&desc, &engine).unwrap();
/// assert_eq!(x.desc(), &desc);
/// assert_eq!(x.desc().major_axis(), Some(0));
///
/// x.release().unwrap();
/// assert!(matches!(x.release(), Err(EmberError::UseAfterRelease)));
/// ```
pub struct NativeArray {
    engine: Engine,
    raw: Option<RawHandle>,
    desc: DataDesc,
    context: Context,
}

impl NativeArray {
    /// Allocates native storage for `desc` on `engine`.
    ///
    /// # Parameters
    ///
    /// * `desc` - The descriptor to allocate. A missing context falls back to
    ///   the engine's default.
    /// * `engine` - The engine that will own the storage.
    ///
    /// # Returns
    ///
    /// A wrapper exclusively owning the new allocation, or
    /// [`EmberError::Allocation`] if the engine cannot satisfy `desc`.
    pub fn create(desc: &DataDesc, engine: &Engine) -> Result<Self> {
        engine.create(desc)
    }

    pub(crate) fn from_raw(engine: Engine, raw: RawHandle, desc: DataDesc, context: Context) -> Self {
        Self {
            engine,
            raw: Some(raw),
            desc,
            context,
        }
    }

    /// Frees the native storage now.
    ///
    /// A second call, like any other use after release, fails with
    /// [`EmberError::UseAfterRelease`].
    pub fn release(&mut self) -> Result<()> {
        let raw = self.raw.take().ok_or(EmberError::UseAfterRelease)?;
        debug!(engine = %self.engine.tag(), handle = %raw, "releasing native array");
        self.engine.native().free(raw)
    }

    pub fn is_released(&self) -> bool {
        self.raw.is_none()
    }

    /// The raw handle, checked against the engine about to use it.
    ///
    /// # Returns
    ///
    /// * [`EmberError::UseAfterRelease`] if the storage is gone
    /// * [`EmberError::EngineMismatch`] if `tag` names a different engine
    ///   instance than the one owning this array
    pub fn as_typed(&self, tag: EngineTag) -> Result<RawHandle> {
        let raw = self.raw.ok_or(EmberError::UseAfterRelease)?;
        let owner = self.engine.tag();
        if owner != tag {
            return Err(EmberError::EngineMismatch {
                expected: tag,
                actual: owner,
            });
        }
        Ok(raw)
    }

    fn live(&self) -> Result<RawHandle> {
        self.raw.ok_or(EmberError::UseAfterRelease)
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The descriptor exactly as supplied at creation (or computed by the
    /// operation that produced this array).
    pub fn desc(&self) -> &DataDesc {
        &self.desc
    }

    pub fn shape(&self) -> &Shape {
        self.desc.shape()
    }

    pub fn data_type(&self) -> DataType {
        self.desc.data_type()
    }

    pub fn layout(&self) -> Layout {
        self.desc.layout()
    }

    pub fn name(&self) -> Option<&str> {
        self.desc.name()
    }

    /// The context the storage actually lives on. Unlike `desc().context()`
    /// this is always known.
    pub fn context(&self) -> Context {
        self.context
    }

    /// Changes the diagnostic name. Native storage is not touched.
    pub fn rename(&mut self, name: Option<String>) {
        self.desc.set_name(name);
    }

    /// Copies the contents out in row-major order.
    pub fn to_vec(&self) -> Result<Vec<f64>> {
        self.engine.native().read(self.live()?)
    }

    /// Checks the descriptor against what the native engine reports.
    ///
    /// Any difference is a bug in the dispatch layer or the engine binding, so
    /// it is logged at `error` as well as returned.
    pub fn verify(&self) -> Result<()> {
        let raw = self.live()?;
        let meta = self.engine.native().query(raw)?;
        let expected = self.desc.shape().to_usize();
        let agrees = expected.as_deref() == Some(meta.shape.as_slice())
            && meta.data_type == self.desc.data_type()
            && meta.context == self.context;
        if agrees {
            return Ok(());
        }

        let expected = format!("{} {} @ {}", self.desc.shape(), self.desc.data_type(), self.context);
        let actual = meta.to_string();
        error!(
            engine = %self.engine.tag(),
            handle = %raw,
            %expected,
            %actual,
            "native metadata drifted from descriptor"
        );
        Err(EmberError::MetadataDrift { expected, actual })
    }

    /// An independent copy with the same contents and descriptor.
    pub fn duplicate(&self) -> Result<NativeArray> {
        self.engine.duplicate(self)
    }

    /// Marks this array as a gradient-bearing leaf.
    ///
    /// Only floating-point arrays can carry gradients.
    pub fn set_requires_gradient(&self, requires: bool) -> Result<()> {
        self.engine.native().set_requires_grad(self.live()?, requires)
    }

    pub fn requires_gradient(&self) -> Result<bool> {
        self.engine.native().requires_grad(self.live()?)
    }

    /// The accumulated gradient as a new, independently owned array, or
    /// `None` if no backward pass has reached this array.
    pub fn gradient(&self) -> Result<Option<NativeArray>> {
        let Some(raw) = self.engine.native().grad(self.live()?)? else {
            return Ok(None);
        };
        let desc = DataDesc::from_parts(
            self.shape().clone(),
            self.data_type(),
            None,
            self.layout(),
            Some(self.context),
        );
        self.engine.adopt(raw, desc, self.context).map(Some)
    }

    /// Clears the accumulated gradient.
    pub fn zero_gradient(&self) -> Result<()> {
        self.engine.native().zero_grad(self.live()?)
    }

    pub fn add(&self, rhs: &NativeArray) -> Result<NativeArray> {
        self.engine.add(self, rhs)
    }

    pub fn sub(&self, rhs: &NativeArray) -> Result<NativeArray> {
        self.engine.sub(self, rhs)
    }

    pub fn mul(&self, rhs: &NativeArray) -> Result<NativeArray> {
        self.engine.mul(self, rhs)
    }

    pub fn div(&self, rhs: &NativeArray) -> Result<NativeArray> {
        self.engine.div(self, rhs)
    }

    pub fn neg(&self) -> Result<NativeArray> {
        self.engine.neg(self)
    }

    pub fn exp(&self) -> Result<NativeArray> {
        self.engine.exp(self)
    }

    pub fn log(&self) -> Result<NativeArray> {
        self.engine.log(self)
    }

    pub fn add_scalar(&self, value: f64) -> Result<NativeArray> {
        self.engine.add_scalar(self, value)
    }

    pub fn mul_scalar(&self, value: f64) -> Result<NativeArray> {
        self.engine.mul_scalar(self, value)
    }

    pub fn sum(&self) -> Result<NativeArray> {
        self.engine.sum(self)
    }

    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<NativeArray> {
        self.engine.reshape(self, shape)
    }

    pub fn cast(&self, data_type: DataType) -> Result<NativeArray> {
        self.engine.cast(self, data_type)
    }

    pub fn to_context(&self, context: Context) -> Result<NativeArray> {
        self.engine.to_context(self, context)
    }
}

impl Drop for NativeArray {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            if let Err(e) = self.engine.native().free(raw) {
                warn!(engine = %self.engine.tag(), handle = %raw, error = %e, "failed to free native array");
            }
        }
    }
}

impl fmt::Debug for NativeArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeArray")
            .field("engine", &self.engine.tag())
            .field("raw", &self.raw)
            .field("desc", &self.desc)
            .field("context", &self.context)
            .finish()
    }
}

impl fmt::Display for NativeArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.raw {
            Some(raw) => write!(f, "NativeArray({}, {} on {})", self.desc, raw, self.engine.tag()),
            None => write!(f, "NativeArray({}, released)", self.desc),
        }
    }
}
