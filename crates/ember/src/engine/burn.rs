//! # Burn Engine
//!
//! Binds [`NativeEngine`] to any burn autodiff backend.
//!
//! ## Implementation Notes
//!
//! Burn tensors carry their rank as a const generic, while handles here are
//! rank-erased. Every allocation is therefore stored as a flat rank-1 float32
//! tensor, and the engine keeps the logical shape alongside it. All supported
//! operations are elementwise or full reductions, so the flat representation
//! computes the same values and gradients.
//!
//! Burn frees autodiff graph state as part of `backward`, so neither
//! `keep_graph` nor `create_graph` can be honoured; both are reported as
//! [`EmberError::Unsupported`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Tensor, TensorData};
use tracing::debug;

use super::{
    BackwardOptions, BinaryOp, DeviceRegistry, EngineKind, EngineTag, Fill, GraphId, NativeEngine,
    NativeMeta, RawHandle, Recording, UnaryOp,
};
use crate::error::{EmberError, Result};
use crate::types::{Context, DataDesc, DataType};

struct Entry<B: AutodiffBackend> {
    tensor: Tensor<B, 1>,
    shape: Vec<usize>,
    context: Context,
    grad: Option<Tensor<B::InnerBackend, 1>>,
    graph: Option<GraphId>,
}

struct BurnState<B: AutodiffBackend> {
    entries: HashMap<RawHandle, Entry<B>>,
    live_graphs: HashSet<GraphId>,
    consumed: HashSet<GraphId>,
    recording: Option<Recording>,
    next_handle: u64,
    next_graph: u64,
}

impl<B: AutodiffBackend> Default for BurnState<B> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            live_graphs: HashSet::new(),
            consumed: HashSet::new(),
            recording: None,
            next_handle: 0,
            next_graph: 0,
        }
    }
}

impl<B: AutodiffBackend> BurnState<B> {
    fn entry(&self, raw: RawHandle) -> Result<&Entry<B>> {
        self.entries.get(&raw).ok_or(EmberError::UseAfterRelease)
    }

    fn insert(
        &mut self,
        tensor: Tensor<B, 1>,
        shape: Vec<usize>,
        context: Context,
        graph: Option<GraphId>,
    ) -> Result<RawHandle> {
        self.next_handle += 1;
        let raw = RawHandle::from_raw(self.next_handle)
            .ok_or_else(|| EmberError::allocation("handle space exhausted"))?;
        self.entries.insert(
            raw,
            Entry {
                tensor,
                shape,
                context,
                grad: None,
                graph,
            },
        );
        Ok(raw)
    }

    fn graph_for(&self, inputs: &[&Entry<B>]) -> Option<GraphId> {
        let graph = self.recording?.active()?;
        inputs
            .iter()
            .any(|e| e.tensor.is_require_grad() || e.graph == Some(graph))
            .then_some(graph)
    }
}

/// Native engine over a burn autodiff backend `B`.
///
/// Only `float32` storage is supported. Contexts resolve to `B::Device`
/// through a caller-supplied resolver.
pub struct BurnEngine<B: AutodiffBackend> {
    tag: EngineTag,
    default_context: Context,
    devices: Arc<DeviceRegistry<B::Device>>,
    state: Arc<Mutex<BurnState<B>>>,
}

impl<B: AutodiffBackend> BurnEngine<B> {
    /// An engine placing everything on `device`, addressed as `cpu(0)`.
    pub fn new(device: B::Device) -> Self {
        Self::with_resolver(Context::cpu(), move |ctx: Context| {
            if ctx == Context::cpu() {
                Ok(device.clone())
            } else {
                Err(EmberError::allocation(format!("burn engine has no device for {}", ctx)))
            }
        })
    }

    /// An engine resolving contexts with `resolver`.
    ///
    /// # Parameters
    ///
    /// * `default_context` - Context for descriptors that name none
    /// * `resolver` - Maps a context to a burn device, or fails with
    ///   [`EmberError::Allocation`]
    pub fn with_resolver<F>(default_context: Context, resolver: F) -> Self
    where
        F: Fn(Context) -> Result<B::Device> + Send + Sync + 'static,
    {
        Self {
            tag: EngineTag::new(EngineKind::Burn),
            default_context,
            devices: Arc::new(DeviceRegistry::new(resolver)),
            state: Arc::new(Mutex::new(BurnState::default())),
        }
    }

    pub fn live_allocations(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, BurnState<B>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn float32_only(&self, data_type: DataType) -> Result<()> {
        if data_type != DataType::Float32 {
            return Err(EmberError::allocation(format!(
                "{} stores float32 only, not {}",
                self.tag, data_type
            )));
        }
        Ok(())
    }

    fn run<F>(&self, inputs: &[RawHandle], shape: Option<Vec<usize>>, op: F) -> Result<RawHandle>
    where
        F: FnOnce(Vec<Tensor<B, 1>>) -> Tensor<B, 1>,
    {
        let mut state = self.lock();
        let entries = inputs
            .iter()
            .map(|raw| state.entry(*raw))
            .collect::<Result<Vec<_>>>()?;
        let first = entries
            .first()
            .ok_or_else(|| EmberError::invalid_shape("operation without operands"))?;
        let (context, shape) = (first.context, shape.unwrap_or_else(|| first.shape.clone()));

        let out = op(entries.iter().map(|e| e.tensor.clone()).collect());
        let graph = state.graph_for(&entries);
        state.insert(out, shape, context, graph)
    }
}

impl<B: AutodiffBackend> Clone for BurnEngine<B> {
    fn clone(&self) -> Self {
        Self {
            tag: self.tag,
            default_context: self.default_context,
            devices: self.devices.clone(),
            state: self.state.clone(),
        }
    }
}

impl<B: AutodiffBackend> fmt::Debug for BurnEngine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BurnEngine")
            .field("tag", &self.tag)
            .field("default_context", &self.default_context)
            .field("live_allocations", &self.live_allocations())
            .finish()
    }
}

impl<B: AutodiffBackend> NativeEngine for BurnEngine<B> {
    fn tag(&self) -> EngineTag {
        self.tag
    }

    fn default_context(&self) -> Context {
        self.default_context
    }

    fn allocate(&self, desc: &DataDesc, fill: Fill<'_>) -> Result<RawHandle> {
        let context = desc.context().unwrap_or(self.default_context);
        let device = self.devices.resolve(context)?;
        self.float32_only(desc.data_type())?;
        let shape = desc.shape().to_usize().ok_or_else(|| {
            EmberError::allocation(format!("shape {} has unresolved dimensions", desc.shape()))
        })?;
        let numel = desc.shape().size().ok_or_else(|| {
            EmberError::allocation(format!("bad size: {} elements overflow", desc.shape()))
        })?;

        let tensor = match fill {
            Fill::Zeros => Tensor::<B, 1>::zeros([numel], &device),
            Fill::Ones => Tensor::<B, 1>::ones([numel], &device),
            Fill::Values(values) => {
                if values.len() != numel {
                    return Err(EmberError::allocation(format!(
                        "{} values supplied for {} elements",
                        values.len(),
                        numel
                    )));
                }
                let data: Vec<f32> = values.iter().map(|v| *v as f32).collect();
                Tensor::<B, 1>::from_data(TensorData::new(data, [numel]), &device)
            }
        };

        let raw = self.lock().insert(tensor, shape, context, None)?;
        debug!(handle = %raw, %desc, "burn allocate");
        Ok(raw)
    }

    fn free(&self, raw: RawHandle) -> Result<()> {
        self.lock()
            .entries
            .remove(&raw)
            .map(|_| ())
            .ok_or(EmberError::UseAfterRelease)
    }

    fn query(&self, raw: RawHandle) -> Result<NativeMeta> {
        let state = self.lock();
        let entry = state.entry(raw)?;
        let numel: usize = entry.shape.iter().product();
        if entry.tensor.dims() != [numel] {
            return Err(EmberError::native(
                self.tag,
                format!("flat storage {:?} does not hold {:?}", entry.tensor.dims(), entry.shape),
            ));
        }
        Ok(NativeMeta {
            shape: entry.shape.clone(),
            data_type: DataType::Float32,
            context: entry.context,
        })
    }

    fn read(&self, raw: RawHandle) -> Result<Vec<f64>> {
        let tensor = self.lock().entry(raw)?.tensor.clone();
        tensor
            .into_data()
            .convert::<f64>()
            .to_vec::<f64>()
            .map_err(|e| EmberError::native(self.tag, format!("{:?}", e)))
    }

    fn unary(&self, op: UnaryOp, x: RawHandle) -> Result<RawHandle> {
        let shape = matches!(op, UnaryOp::Sum).then(Vec::new);
        self.run(&[x], shape, |mut t| {
            let x = t.remove(0);
            match op {
                UnaryOp::Neg => x.neg(),
                UnaryOp::Exp => x.exp(),
                UnaryOp::Log => x.log(),
                UnaryOp::AddScalar(c) => x.add_scalar(c),
                UnaryOp::MulScalar(c) => x.mul_scalar(c),
                UnaryOp::Sum => x.sum(),
            }
        })
    }

    fn binary(&self, op: BinaryOp, lhs: RawHandle, rhs: RawHandle) -> Result<RawHandle> {
        {
            let state = self.lock();
            let (l, r) = (state.entry(lhs)?, state.entry(rhs)?);
            if l.context != r.context {
                return Err(EmberError::ContextMismatch {
                    left: l.context,
                    right: r.context,
                });
            }
        }
        self.run(&[lhs, rhs], None, |mut t| {
            let y = t.remove(1);
            let x = t.remove(0);
            match op {
                BinaryOp::Add => x.add(y),
                BinaryOp::Sub => x.sub(y),
                BinaryOp::Mul => x.mul(y),
                BinaryOp::Div => x.div(y),
            }
        })
    }

    fn reshape(&self, raw: RawHandle, shape: &[usize]) -> Result<RawHandle> {
        let numel = shape.iter().try_fold(1usize, |n, d| n.checked_mul(*d));
        let current: usize = self.lock().entry(raw)?.shape.iter().product();
        if numel != Some(current) {
            return Err(EmberError::invalid_shape(format!(
                "cannot view {} elements as {:?}",
                current, shape
            )));
        }
        self.run(&[raw], Some(shape.to_vec()), |mut t| t.remove(0))
    }

    fn cast(&self, raw: RawHandle, data_type: DataType) -> Result<RawHandle> {
        self.float32_only(data_type)?;
        self.run(&[raw], None, |mut t| t.remove(0))
    }

    fn copy_to(&self, raw: RawHandle, context: Context) -> Result<RawHandle> {
        let device = self.devices.resolve(context)?;
        let mut state = self.lock();
        let entry = state.entry(raw)?;
        let tensor = entry.tensor.clone().to_device(&device);
        let shape = entry.shape.clone();
        let graph = state.graph_for(&[entry]);
        state.insert(tensor, shape, context, graph)
    }

    fn set_requires_grad(&self, raw: RawHandle, requires_grad: bool) -> Result<()> {
        let mut state = self.lock();
        let entry = state.entries.get_mut(&raw).ok_or(EmberError::UseAfterRelease)?;
        entry.tensor = entry.tensor.clone().set_require_grad(requires_grad);
        Ok(())
    }

    fn requires_grad(&self, raw: RawHandle) -> Result<bool> {
        Ok(self.lock().entry(raw)?.tensor.is_require_grad())
    }

    fn grad(&self, raw: RawHandle) -> Result<Option<RawHandle>> {
        let mut state = self.lock();
        let entry = state.entry(raw)?;
        let Some(grad) = entry.grad.clone() else {
            return Ok(None);
        };
        let (shape, context) = (entry.shape.clone(), entry.context);
        state
            .insert(Tensor::from_inner(grad), shape, context, None)
            .map(Some)
    }

    fn zero_grad(&self, raw: RawHandle) -> Result<()> {
        let mut state = self.lock();
        let entry = state.entries.get_mut(&raw).ok_or(EmberError::UseAfterRelease)?;
        entry.grad = None;
        Ok(())
    }

    fn begin_graph(&self) -> Result<GraphId> {
        let mut state = self.lock();
        if state.recording.is_some() {
            return Err(EmberError::SessionAlreadyOpen { engine: self.tag });
        }
        state.next_graph += 1;
        let graph = GraphId::from_raw(state.next_graph)
            .ok_or_else(|| EmberError::allocation("graph id space exhausted"))?;
        state.live_graphs.insert(graph);
        state.recording = Some(Recording::on_current_thread(graph));
        Ok(graph)
    }

    fn backward(&self, graph: GraphId, target: RawHandle, options: BackwardOptions) -> Result<()> {
        if options.create_graph {
            return Err(EmberError::unsupported(self.tag, "create_graph"));
        }
        if options.keep_graph {
            return Err(EmberError::unsupported(self.tag, "keep_graph"));
        }
        let mut guard = self.lock();
        let state = &mut *guard;
        let entry = state.entry(target)?;
        if entry.graph != Some(graph) {
            return Err(EmberError::NotRecorded);
        }
        if !state.live_graphs.contains(&graph) || state.consumed.contains(&graph) {
            return Err(EmberError::GraphConsumed);
        }

        // Seeding a sum with ones is the same as seeding the target with ones.
        let grads = entry.tensor.clone().sum().backward();
        for entry in state.entries.values_mut() {
            if !entry.tensor.is_require_grad() {
                continue;
            }
            let Some(grad) = entry.tensor.grad(&grads) else {
                continue;
            };
            let merged = match entry.grad.take() {
                Some(prev) => prev.add(grad),
                None => grad,
            };
            entry.grad = Some(merged);
        }
        state.consumed.insert(graph);
        debug!(graph = graph.as_u64(), "burn backward");
        Ok(())
    }

    fn end_graph(&self, graph: GraphId) -> Result<()> {
        let mut state = self.lock();
        if !state.live_graphs.remove(&graph) {
            return Err(EmberError::GraphConsumed);
        }
        state.consumed.remove(&graph);
        if state.recording.map(|r| r.graph()) == Some(graph) {
            state.recording = None;
        }
        for entry in state.entries.values_mut() {
            if entry.graph == Some(graph) {
                entry.graph = None;
            }
        }
        Ok(())
    }
}
