//! # Engine Dispatch
//!
//! The single seam where metadata-bearing [`NativeArray`] wrappers meet native
//! calls.
//!
//! An [`Engine`] is a cheap, cloneable handle onto one [`NativeEngine`]
//! instance. Every operation:
//!
//! 1. checks that each operand belongs to this engine (by [`EngineTag`]) and
//!    has not been released,
//! 2. checks operand compatibility (context, shape, element type),
//! 3. calls the native engine,
//! 4. wraps the raw result immediately, so that any later failure still
//!    releases it,
//! 5. computes the result's [`DataDesc`] and, when
//!    [`EngineConfig::verify_metadata`] is set, checks it against what the
//!    native engine reports.
//!
//! Which engine runs an operation is decided by the handle the caller holds,
//! never by process-wide state, so any number of engines can coexist.

mod ops;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::array::NativeArray;
use crate::autograd::GradientSession;
use crate::config::EngineConfig;
use crate::engine::{EngineTag, Fill, GraphId, NativeEngine, RawHandle};
use crate::error::{EmberError, Result};
use crate::types::{Context, DataDesc};

struct EngineInner {
    native: Box<dyn NativeEngine>,
    config: EngineConfig,
    session_open: AtomicBool,
}

/// Handle onto one native engine instance.
///
/// Cloning is cheap and every clone dispatches to the same instance.
///
/// # Example
///
/// ```
/// use ember::dispatch::Engine;
/// use ember::engine::HostEngine;
/// use ember::types::{DataDesc, Layout};
///
/// let engine = Engine::new(HostEngine::new());
/// let desc = DataDesc::new([2, 3]).with_layout(Layout::NC);
///
/// let x = engine.ones(&desc).unwrap();
/// let y = engine.mul_scalar(&x, 2.0).unwrap();
/// assert_eq!(y.to_vec().unwrap(), vec![2.0; 6]);
/// assert_eq!(y.layout(), Layout::NC);
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(native: impl NativeEngine) -> Self {
        Self::with_config(native, EngineConfig::default())
    }

    pub fn with_config(native: impl NativeEngine, config: EngineConfig) -> Self {
        debug!(engine = %native.tag(), ?config, "engine handle created");
        Self {
            inner: Arc::new(EngineInner {
                native: Box::new(native),
                config,
                session_open: AtomicBool::new(false),
            }),
        }
    }

    pub fn tag(&self) -> EngineTag {
        self.inner.native.tag()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Context given to descriptors that name none.
    pub fn default_context(&self) -> Context {
        self.inner
            .config
            .default_context
            .unwrap_or_else(|| self.inner.native.default_context())
    }

    pub(crate) fn native(&self) -> &dyn NativeEngine {
        self.inner.native.as_ref()
    }

    /// Allocates storage matching `desc`, zero-filled.
    ///
    /// Fails with [`EmberError::Allocation`] when the engine cannot satisfy
    /// the shape, element type or context.
    pub fn create(&self, desc: &DataDesc) -> Result<NativeArray> {
        self.allocate(desc, Fill::Zeros)
    }

    pub fn zeros(&self, desc: &DataDesc) -> Result<NativeArray> {
        self.allocate(desc, Fill::Zeros)
    }

    pub fn ones(&self, desc: &DataDesc) -> Result<NativeArray> {
        self.allocate(desc, Fill::Ones)
    }

    /// Allocates `desc` holding `values` in row-major order.
    pub fn from_vec(&self, desc: &DataDesc, values: &[f64]) -> Result<NativeArray> {
        self.allocate(desc, Fill::Values(values))
    }

    fn allocate(&self, desc: &DataDesc, fill: Fill<'_>) -> Result<NativeArray> {
        if !desc.shape().is_resolved() {
            return Err(EmberError::allocation(format!(
                "shape {} has unresolved dimensions",
                desc.shape()
            )));
        }
        if desc.num_bytes().is_none() {
            return Err(EmberError::allocation(format!(
                "bad size: {} of {} does not fit in memory",
                desc.shape(),
                desc.data_type()
            )));
        }
        let context = desc.context().unwrap_or_else(|| self.default_context());
        let native_desc = desc.clone().with_context(context);

        let raw = self.native().allocate(&native_desc, fill)?;
        debug!(engine = %self.tag(), handle = %raw, %desc, "allocated native array");
        // The caller's descriptor is kept as given, context included.
        self.adopt(raw, desc.clone(), context)
    }

    /// Takes ownership of a raw handle the native engine just produced.
    pub(crate) fn adopt(
        &self,
        raw: RawHandle,
        desc: DataDesc,
        context: Context,
    ) -> Result<NativeArray> {
        let array = NativeArray::from_raw(self.clone(), raw, desc, context);
        if self.inner.config.verify_metadata {
            // On drift `array` is dropped here, releasing the native storage.
            array.verify()?;
        }
        Ok(array)
    }

    /// Opens a gradient session on this engine.
    ///
    /// Shorthand for [`GradientSession::new`] followed by
    /// [`GradientSession::open`].
    pub fn gradient_session(&self) -> Result<GradientSession> {
        let mut session = GradientSession::new(self);
        session.open()?;
        Ok(session)
    }

    /// Claims this engine's single session slot and starts native recording.
    pub(crate) fn begin_session(&self) -> Result<GraphId> {
        if self
            .inner
            .session_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EmberError::SessionAlreadyOpen { engine: self.tag() });
        }
        match self.native().begin_graph() {
            Ok(graph) => Ok(graph),
            Err(e) => {
                self.inner.session_open.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Releases native graph state and frees the session slot.
    pub(crate) fn end_session(&self, graph: GraphId) -> Result<()> {
        let result = self.native().end_graph(graph);
        self.inner.session_open.store(false, Ordering::Release);
        result
    }

    /// Whether a gradient session is currently open on this engine.
    pub fn session_open(&self) -> bool {
        self.inner.session_open.load(Ordering::Acquire)
    }

    /// Whether two handles dispatch to the same native engine instance.
    pub fn same_engine(&self, other: &Engine) -> bool {
        self.tag() == other.tag()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("tag", &self.tag())
            .field("config", &self.inner.config)
            .field("session_open", &self.session_open())
            .finish()
    }
}
