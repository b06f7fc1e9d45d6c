//! # Candle Engine
//!
//! Binds [`NativeEngine`] to candle-core. Storage is an arena of candle
//! tensors; gradient-bearing leaves are candle `Var`s.
//!
//! ## Implementation Notes
//!
//! Candle tracks operations on variables unconditionally and has no notion of
//! a graph being consumed. This binding layers the session semantics on top:
//!
//! - results produced while a graph records, from a variable or from another
//!   recorded result, are tagged with that graph
//! - a backward pass without `keep_graph` marks the whole graph consumed
//! - `create_graph` is unsupported
//!
//! Candle has no `int8`, `int32` or `boolean` element types; asking for them
//! fails with [`EmberError::Allocation`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use candle_core::{DType, Device, DeviceLocation, Tensor, Var};
use tracing::debug;

use super::{
    BackwardOptions, BinaryOp, DeviceRegistry, EngineKind, EngineTag, Fill, GraphId, NativeEngine,
    NativeMeta, RawHandle, Recording, UnaryOp,
};
use crate::error::{EmberError, Result};
use crate::types::{Context, DataDesc, DataType, DeviceType};

fn to_dtype(data_type: DataType) -> Option<DType> {
    match data_type {
        DataType::Float32 => Some(DType::F32),
        DataType::Float64 => Some(DType::F64),
        DataType::Float16 => Some(DType::F16),
        DataType::Uint8 => Some(DType::U8),
        DataType::Int64 => Some(DType::I64),
        DataType::Int8 | DataType::Int32 | DataType::Boolean => None,
    }
}

fn from_dtype(dtype: DType) -> Option<DataType> {
    match dtype {
        DType::F32 => Some(DataType::Float32),
        DType::F64 => Some(DataType::Float64),
        DType::F16 => Some(DataType::Float16),
        DType::U8 => Some(DataType::Uint8),
        DType::I64 => Some(DataType::Int64),
        _ => None,
    }
}

#[derive(Debug)]
struct Entry {
    tensor: Tensor,
    context: Context,
    var: Option<Var>,
    grad: Option<Tensor>,
    graph: Option<GraphId>,
}

#[derive(Debug, Default)]
struct CandleState {
    entries: HashMap<RawHandle, Entry>,
    live_graphs: HashSet<GraphId>,
    consumed: HashSet<GraphId>,
    recording: Option<Recording>,
    next_handle: u64,
    next_graph: u64,
}

impl CandleState {
    fn entry(&self, raw: RawHandle) -> Result<&Entry> {
        self.entries.get(&raw).ok_or(EmberError::UseAfterRelease)
    }

    fn insert(&mut self, tensor: Tensor, context: Context, graph: Option<GraphId>) -> Result<RawHandle> {
        self.next_handle += 1;
        let raw = RawHandle::from_raw(self.next_handle)
            .ok_or_else(|| EmberError::allocation("handle space exhausted"))?;
        self.entries.insert(
            raw,
            Entry {
                tensor,
                context,
                var: None,
                grad: None,
                graph,
            },
        );
        Ok(raw)
    }

    /// The graph a result of `inputs` belongs to, if any.
    fn graph_for(&self, inputs: &[&Entry]) -> Option<GraphId> {
        let graph = self.recording?.active()?;
        inputs
            .iter()
            .any(|e| e.var.is_some() || e.graph == Some(graph))
            .then_some(graph)
    }
}

/// Native engine backed by candle-core.
///
/// Contexts map onto candle devices: `cpu(i)` to `Device::Cpu` and `gpu(i)` to
/// the i-th CUDA device.
#[derive(Debug, Clone)]
pub struct CandleEngine {
    tag: EngineTag,
    devices: Arc<DeviceRegistry<Device>>,
    state: Arc<Mutex<CandleState>>,
}

impl CandleEngine {
    pub fn new() -> Self {
        let devices = DeviceRegistry::new(|ctx: Context| match ctx.device_type() {
            DeviceType::Cpu => Ok(Device::Cpu),
            DeviceType::Gpu => Device::new_cuda(ctx.device_id()).map_err(|e| {
                EmberError::allocation(format!("cannot bind {}: {}", ctx, e))
            }),
        });
        Self {
            tag: EngineTag::new(EngineKind::Candle),
            devices: Arc::new(devices),
            state: Arc::new(Mutex::new(CandleState::default())),
        }
    }

    /// The candle tensor behind `raw`, for interop with candle code.
    pub fn tensor(&self, raw: RawHandle) -> Result<Tensor> {
        Ok(self.lock().entry(raw)?.tensor.clone())
    }

    pub fn live_allocations(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, CandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dtype(&self, data_type: DataType) -> Result<DType> {
        to_dtype(data_type)
            .ok_or_else(|| EmberError::allocation(format!("{} cannot store {}", self.tag, data_type)))
    }

    fn err(&self) -> impl Fn(candle_core::Error) -> EmberError + '_ {
        move |e| EmberError::native(self.tag, e)
    }

    /// Runs `op` over the tensors behind `inputs` and stores the result.
    fn run<F>(&self, inputs: &[RawHandle], context: Option<Context>, op: F) -> Result<RawHandle>
    where
        F: FnOnce(&[&Tensor]) -> candle_core::Result<Tensor>,
    {
        let mut state = self.lock();
        let entries = inputs
            .iter()
            .map(|raw| state.entry(*raw))
            .collect::<Result<Vec<_>>>()?;
        let context = match (context, entries.first()) {
            (Some(context), _) => context,
            (None, Some(first)) => first.context,
            (None, None) => return Err(EmberError::invalid_shape("operation without operands")),
        };
        let tensors: Vec<&Tensor> = entries.iter().map(|e| &e.tensor).collect();
        let out = op(&tensors).map_err(self.err())?;
        let graph = state.graph_for(&entries);
        state.insert(out, context, graph)
    }
}

impl Default for CandleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeEngine for CandleEngine {
    fn tag(&self) -> EngineTag {
        self.tag
    }

    fn allocate(&self, desc: &DataDesc, fill: Fill<'_>) -> Result<RawHandle> {
        let context = desc.context().unwrap_or_else(|| self.default_context());
        let device = self.devices.resolve(context)?;
        let dtype = self.dtype(desc.data_type())?;
        let dims = desc.shape().to_usize().ok_or_else(|| {
            EmberError::allocation(format!("shape {} has unresolved dimensions", desc.shape()))
        })?;
        if desc.num_bytes().is_none() {
            return Err(EmberError::allocation(format!(
                "bad size: {} elements overflow",
                desc.shape()
            )));
        }

        let tensor = match fill {
            Fill::Zeros => Tensor::zeros(dims, dtype, &device),
            Fill::Ones => Tensor::ones(dims, dtype, &device),
            Fill::Values(values) => {
                Tensor::from_vec(values.to_vec(), dims, &device).and_then(|t| t.to_dtype(dtype))
            }
        }
        .map_err(|e| EmberError::allocation(e.to_string()))?;

        let raw = self.lock().insert(tensor, context, None)?;
        debug!(handle = %raw, %desc, "candle allocate");
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
        let tensor = &entry.tensor;
        let data_type = from_dtype(tensor.dtype()).ok_or_else(|| {
            EmberError::native(self.tag, format!("unmapped dtype {:?}", tensor.dtype()))
        })?;
        let context = match tensor.device().location() {
            DeviceLocation::Cpu if entry.context.device_type() == DeviceType::Cpu => entry.context,
            DeviceLocation::Cpu => Context::cpu(),
            DeviceLocation::Cuda { gpu_id } | DeviceLocation::Metal { gpu_id } => Context::gpu(gpu_id),
        };
        Ok(NativeMeta {
            shape: tensor.dims().to_vec(),
            data_type,
            context,
        })
    }

    fn read(&self, raw: RawHandle) -> Result<Vec<f64>> {
        let tensor = self.tensor(raw)?;
        tensor
            .flatten_all()
            .and_then(|t| t.to_dtype(DType::F64))
            .and_then(|t| t.to_vec1::<f64>())
            .map_err(self.err())
    }

    fn unary(&self, op: UnaryOp, x: RawHandle) -> Result<RawHandle> {
        self.run(&[x], None, |t| match op {
            UnaryOp::Neg => t[0].neg(),
            UnaryOp::Exp => t[0].exp(),
            UnaryOp::Log => t[0].log(),
            UnaryOp::AddScalar(c) => t[0].affine(1.0, c),
            UnaryOp::MulScalar(c) => t[0].affine(c, 0.0),
            UnaryOp::Sum => t[0].sum_all(),
        })
    }

    fn binary(&self, op: BinaryOp, lhs: RawHandle, rhs: RawHandle) -> Result<RawHandle> {
        self.run(&[lhs, rhs], None, |t| match op {
            BinaryOp::Add => t[0].add(t[1]),
            BinaryOp::Sub => t[0].sub(t[1]),
            BinaryOp::Mul => t[0].mul(t[1]),
            BinaryOp::Div => t[0].div(t[1]),
        })
    }

    fn reshape(&self, raw: RawHandle, shape: &[usize]) -> Result<RawHandle> {
        self.run(&[raw], None, |t| t[0].reshape(shape.to_vec()))
    }

    fn cast(&self, raw: RawHandle, data_type: DataType) -> Result<RawHandle> {
        let dtype = self.dtype(data_type)?;
        self.run(&[raw], None, |t| t[0].to_dtype(dtype))
    }

    fn copy_to(&self, raw: RawHandle, context: Context) -> Result<RawHandle> {
        let device = self.devices.resolve(context)?;
        self.run(&[raw], Some(context), |t| t[0].to_device(&device))
    }

    fn set_requires_grad(&self, raw: RawHandle, requires_grad: bool) -> Result<()> {
        let mut state = self.lock();
        let entry = state.entries.get_mut(&raw).ok_or(EmberError::UseAfterRelease)?;
        if requires_grad == entry.var.is_some() {
            return Ok(());
        }
        if requires_grad {
            if !entry.tensor.dtype().is_float() {
                return Err(EmberError::unsupported(
                    self.tag,
                    format!("gradients on {:?} tensors", entry.tensor.dtype()),
                ));
            }
            let var = Var::from_tensor(&entry.tensor).map_err(self.err())?;
            entry.tensor = var.as_tensor().clone();
            entry.var = Some(var);
        } else {
            entry.tensor = entry.tensor.detach();
            entry.var = None;
        }
        Ok(())
    }

    fn requires_grad(&self, raw: RawHandle) -> Result<bool> {
        Ok(self.lock().entry(raw)?.var.is_some())
    }

    fn grad(&self, raw: RawHandle) -> Result<Option<RawHandle>> {
        let mut state = self.lock();
        let entry = state.entry(raw)?;
        let Some(grad) = entry.grad.clone() else {
            return Ok(None);
        };
        let context = entry.context;
        state.insert(grad, context, None).map(Some)
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
        let mut guard = self.lock();
        let state = &mut *guard;
        let entry = state.entry(target)?;
        if entry.graph != Some(graph) {
            return Err(EmberError::NotRecorded);
        }
        if !state.live_graphs.contains(&graph) || state.consumed.contains(&graph) {
            return Err(EmberError::GraphConsumed);
        }

        let grads = entry.tensor.backward().map_err(self.err())?;
        for entry in state.entries.values_mut() {
            let Some(var) = &entry.var else {
                continue;
            };
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let merged = match entry.grad.take() {
                Some(prev) => prev.add(grad).map_err(self.err())?,
                None => grad.clone(),
            };
            entry.grad = Some(merged);
        }
        if !options.keep_graph {
            state.consumed.insert(graph);
        }
        debug!(graph = graph.as_u64(), keep_graph = options.keep_graph, "candle backward");
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
