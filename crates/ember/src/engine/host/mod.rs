//! # Host Engine
//!
//! The in-process reference engine. Storage is an arena of host buffers keyed
//! by opaque non-zero handles; gradients come from a tape recorded while a
//! graph is open.
//!
//! It is always compiled and is what the crate's own tests run against, but it
//! follows exactly the same [`NativeEngine`] contract as the candle and burn
//! bindings: handles are opaque, unknown handles are rejected rather than
//! dereferenced, and only one graph records at a time.
//!
//! `HostEngine` is a cheap, cloneable handle onto shared state, so a caller
//! can keep a clone to inspect allocation accounting after handing another
//! clone to an [`Engine`](crate::dispatch::Engine).

mod kernels;
mod tape;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use self::kernels::{element_count, Value};
use self::tape::{apply, NodeId, Tape, TapeOp, Traced};
use super::{
    BackwardOptions, BinaryOp, DeviceRegistry, EngineKind, EngineTag, Fill, GraphId, NativeEngine,
    NativeMeta, RawHandle, Recording, UnaryOp,
};
use crate::config::HostConfig;
use crate::error::{EmberError, Result};
use crate::types::{Context, DataDesc, DataType, DeviceType};

/// The concrete device a host context resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostDevice {
    pub ordinal: usize,
}

/// Counters of native calls, for accounting and leak checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub allocations: usize,
    pub frees: usize,
    pub graphs_begun: usize,
    pub graphs_ended: usize,
    pub backward_passes: usize,
}

#[derive(Debug, Clone)]
struct Gradient {
    value: Value,
    node: Option<(GraphId, NodeId)>,
}

#[derive(Debug)]
struct Slot {
    value: Value,
    context: Context,
    requires_grad: bool,
    grad: Option<Gradient>,
    node: Option<(GraphId, NodeId)>,
}

#[derive(Debug, Default)]
struct HostState {
    slots: HashMap<RawHandle, Slot>,
    graphs: HashMap<GraphId, Tape>,
    recording: Option<Recording>,
    next_handle: u64,
    next_graph: u64,
    used_bytes: usize,
    stats: HostStats,
}

impl HostState {
    fn slot(&self, raw: RawHandle) -> Result<&Slot> {
        self.slots.get(&raw).ok_or(EmberError::UseAfterRelease)
    }

    /// The graph operations on the calling thread record into.
    fn active_graph(&self) -> Option<GraphId> {
        self.recording.and_then(|r| r.active())
    }

    /// Fails unless `bytes` more fit under `capacity`.
    fn ensure_room(&self, bytes: usize, capacity: Option<usize>) -> Result<()> {
        let Some(capacity) = capacity else {
            return Ok(());
        };
        match self.used_bytes.checked_add(bytes) {
            Some(total) if total <= capacity => Ok(()),
            _ => Err(EmberError::allocation(format!(
                "out of memory: {} bytes requested, {} of {} in use",
                bytes, self.used_bytes, capacity
            ))),
        }
    }

    fn insert(
        &mut self,
        value: Value,
        context: Context,
        node: Option<(GraphId, NodeId)>,
        capacity: Option<usize>,
    ) -> Result<RawHandle> {
        let bytes = value.num_bytes();
        self.ensure_room(bytes, capacity)?;
        self.next_handle += 1;
        let raw = RawHandle::from_raw(self.next_handle)
            .ok_or_else(|| EmberError::allocation("handle space exhausted"))?;
        self.used_bytes += bytes;
        self.stats.allocations += 1;
        self.slots.insert(
            raw,
            Slot {
                value,
                context,
                requires_grad: false,
                grad: None,
                node,
            },
        );
        Ok(raw)
    }

    /// The value behind `raw` as an operand, registering it as a leaf of the
    /// recording graph when it bears a gradient.
    fn operand(&mut self, raw: RawHandle) -> Result<Traced> {
        let recording = self.active_graph();
        let HostState { slots, graphs, .. } = self;
        let slot = slots.get_mut(&raw).ok_or(EmberError::UseAfterRelease)?;
        let node = match (recording, slot.node) {
            (Some(graph), Some((owner, node))) if owner == graph => Some(node),
            (Some(graph), _) if slot.requires_grad => match graphs.get_mut(&graph) {
                Some(tape) => {
                    let node = tape.leaf(raw);
                    slot.node = Some((graph, node));
                    Some(node)
                }
                None => None,
            },
            _ => None,
        };
        Ok(Traced {
            value: slot.value.clone(),
            node,
        })
    }

    /// Applies `op` to `inputs`, recording it if this thread's graph is open,
    /// and stores the result on `context`.
    fn run(
        &mut self,
        op: TapeOp,
        inputs: &[RawHandle],
        context: Context,
        capacity: Option<usize>,
    ) -> Result<RawHandle> {
        if let Some(first) = inputs.first() {
            let bytes = result_bytes(&op, &self.slot(*first)?.value).ok_or_else(|| {
                EmberError::allocation(format!("bad size for the result of {:?}", op))
            })?;
            self.ensure_room(bytes, capacity)?;
        }
        let operands = inputs
            .iter()
            .map(|raw| self.operand(*raw))
            .collect::<Result<Vec<_>>>()?;
        let refs: Vec<&Traced> = operands.iter().collect();
        let graph = self.active_graph();
        let tape = graph.and_then(|g| self.graphs.get_mut(&g));
        let out = apply(tape, &op, &refs)?;
        let node = match (graph, out.node) {
            (Some(graph), Some(node)) => Some((graph, node)),
            _ => None,
        };
        self.insert(out.value, context, node, capacity)
    }
}

/// Bytes the result of `op` over `input` will occupy.
fn result_bytes(op: &TapeOp, input: &Value) -> Option<usize> {
    let (numel, dtype) = match op {
        TapeOp::Unary(UnaryOp::Sum) => (1, input.dtype),
        TapeOp::Cast(dtype) => (input.numel(), *dtype),
        TapeOp::Reshape(shape) | TapeOp::Expand(shape) => (element_count(shape)?, input.dtype),
        TapeOp::Unary(_) | TapeOp::Binary(_) | TapeOp::Copy => (input.numel(), input.dtype),
    };
    numel.checked_mul(dtype.num_bytes())
}

/// The in-process reference engine.
#[derive(Debug, Clone)]
pub struct HostEngine {
    tag: EngineTag,
    config: HostConfig,
    devices: Arc<DeviceRegistry<HostDevice>>,
    state: Arc<Mutex<HostState>>,
}

impl HostEngine {
    pub fn new() -> Self {
        Self::with_config(HostConfig::default())
    }

    pub fn with_config(config: HostConfig) -> Self {
        let cpu_count = config.cpu_count;
        let devices = DeviceRegistry::new(move |ctx: Context| match ctx.device_type() {
            DeviceType::Cpu if ctx.device_id() < cpu_count => Ok(HostDevice {
                ordinal: ctx.device_id(),
            }),
            _ => Err(EmberError::allocation(format!(
                "host engine cannot address {}",
                ctx
            ))),
        });
        Self {
            tag: EngineTag::new(EngineKind::Host),
            config,
            devices: Arc::new(devices),
            state: Arc::new(Mutex::new(HostState::default())),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Allocations currently held, gradient buffers excluded.
    pub fn live_allocations(&self) -> usize {
        self.lock().slots.len()
    }

    /// Bytes currently held by live allocations.
    pub fn allocated_bytes(&self) -> usize {
        self.lock().used_bytes
    }

    /// Graphs begun and not yet ended.
    pub fn live_graphs(&self) -> usize {
        self.lock().graphs.len()
    }

    pub fn stats(&self) -> HostStats {
        self.lock().stats
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_dtype(&self, data_type: DataType) -> Result<()> {
        if data_type == DataType::Float16 {
            return Err(EmberError::allocation(format!(
                "{} cannot store {}",
                self.tag, data_type
            )));
        }
        Ok(())
    }
}

impl Default for HostEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeEngine for HostEngine {
    fn tag(&self) -> EngineTag {
        self.tag
    }

    fn allocate(&self, desc: &DataDesc, fill: Fill<'_>) -> Result<RawHandle> {
        let context = desc.context().unwrap_or_else(|| self.default_context());
        self.devices.resolve(context)?;
        self.check_dtype(desc.data_type())?;
        let shape = desc.shape().to_usize().ok_or_else(|| {
            EmberError::allocation(format!("shape {} has unresolved dimensions", desc.shape()))
        })?;
        let bytes = desc.num_bytes().ok_or_else(|| {
            EmberError::allocation(format!("bad size: {} of {}", desc.shape(), desc.data_type()))
        })?;
        self.lock().ensure_room(bytes, self.config.capacity_bytes)?;

        let value = Value::filled(&shape, desc.data_type(), fill)?;
        let raw = self
            .lock()
            .insert(value, context, None, self.config.capacity_bytes)?;
        trace!(handle = %raw, %desc, "host allocate");
        Ok(raw)
    }

    fn free(&self, raw: RawHandle) -> Result<()> {
        let mut state = self.lock();
        let slot = state.slots.remove(&raw).ok_or(EmberError::UseAfterRelease)?;
        state.used_bytes -= slot.value.num_bytes();
        state.stats.frees += 1;
        trace!(handle = %raw, "host free");
        Ok(())
    }

    fn query(&self, raw: RawHandle) -> Result<NativeMeta> {
        let state = self.lock();
        let slot = state.slot(raw)?;
        Ok(NativeMeta {
            shape: slot.value.shape.clone(),
            data_type: slot.value.dtype,
            context: slot.context,
        })
    }

    fn read(&self, raw: RawHandle) -> Result<Vec<f64>> {
        Ok(self.lock().slot(raw)?.value.data.clone())
    }

    fn unary(&self, op: UnaryOp, x: RawHandle) -> Result<RawHandle> {
        let mut state = self.lock();
        let context = state.slot(x)?.context;
        state.run(TapeOp::Unary(op), &[x], context, self.config.capacity_bytes)
    }

    fn binary(&self, op: BinaryOp, lhs: RawHandle, rhs: RawHandle) -> Result<RawHandle> {
        let mut state = self.lock();
        let left = state.slot(lhs)?.context;
        let right = state.slot(rhs)?.context;
        if left != right {
            return Err(EmberError::ContextMismatch { left, right });
        }
        state.run(TapeOp::Binary(op), &[lhs, rhs], left, self.config.capacity_bytes)
    }

    fn reshape(&self, raw: RawHandle, shape: &[usize]) -> Result<RawHandle> {
        let mut state = self.lock();
        let context = state.slot(raw)?.context;
        state.run(
            TapeOp::Reshape(shape.to_vec()),
            &[raw],
            context,
            self.config.capacity_bytes,
        )
    }

    fn cast(&self, raw: RawHandle, data_type: DataType) -> Result<RawHandle> {
        self.check_dtype(data_type)?;
        let mut state = self.lock();
        let context = state.slot(raw)?.context;
        state.run(TapeOp::Cast(data_type), &[raw], context, self.config.capacity_bytes)
    }

    fn copy_to(&self, raw: RawHandle, context: Context) -> Result<RawHandle> {
        self.devices.resolve(context)?;
        let mut state = self.lock();
        state.run(TapeOp::Copy, &[raw], context, self.config.capacity_bytes)
    }

    fn set_requires_grad(&self, raw: RawHandle, requires_grad: bool) -> Result<()> {
        let mut state = self.lock();
        let slot = state.slots.get_mut(&raw).ok_or(EmberError::UseAfterRelease)?;
        if requires_grad && !slot.value.dtype.is_floating() {
            return Err(EmberError::unsupported(
                self.tag,
                format!("gradients on {} arrays", slot.value.dtype),
            ));
        }
        slot.requires_grad = requires_grad;
        Ok(())
    }

    fn requires_grad(&self, raw: RawHandle) -> Result<bool> {
        Ok(self.lock().slot(raw)?.requires_grad)
    }

    fn grad(&self, raw: RawHandle) -> Result<Option<RawHandle>> {
        let mut state = self.lock();
        let slot = state.slot(raw)?;
        let context = slot.context;
        let Some(bytes) = slot.grad.as_ref().map(|g| g.value.num_bytes()) else {
            return Ok(None);
        };
        state.ensure_room(bytes, self.config.capacity_bytes)?;
        let Some(grad) = state.slot(raw)?.grad.clone() else {
            return Ok(None);
        };
        let copy = state.insert(grad.value, context, grad.node, self.config.capacity_bytes)?;
        Ok(Some(copy))
    }

    fn zero_grad(&self, raw: RawHandle) -> Result<()> {
        let mut state = self.lock();
        let slot = state.slots.get_mut(&raw).ok_or(EmberError::UseAfterRelease)?;
        slot.grad = None;
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
        state.graphs.insert(graph, Tape::default());
        state.recording = Some(Recording::on_current_thread(graph));
        state.stats.graphs_begun += 1;
        debug!(graph = graph.as_u64(), "host graph begun");
        Ok(graph)
    }

    fn backward(&self, graph: GraphId, target: RawHandle, options: BackwardOptions) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let slot = state.slot(target)?;
        let root = match slot.node {
            Some((owner, node)) if owner == graph => node,
            _ => return Err(EmberError::NotRecorded),
        };
        let seed = Traced::constant(Value::filled(
            &slot.value.shape,
            slot.value.dtype,
            Fill::Ones,
        )?);

        let tape = state.graphs.get_mut(&graph).ok_or(EmberError::GraphConsumed)?;
        let leaves = tape.backward(
            root,
            seed,
            options.retains_graph(),
            options.create_graph,
        )?;

        for (leaf, grad) in leaves {
            // Leaves released by their owner since recording are skipped.
            let Some(slot) = state.slots.get_mut(&leaf) else {
                continue;
            };
            let merged = match slot.grad.take() {
                Some(prev) => {
                    let prev = Traced {
                        value: prev.value,
                        node: prev.node.filter(|(owner, _)| *owner == graph).map(|(_, n)| n),
                    };
                    let tape = if options.create_graph { Some(&mut *tape) } else { None };
                    apply(tape, &TapeOp::Binary(BinaryOp::Add), &[&prev, &grad])?
                }
                None => grad,
            };
            slot.grad = Some(Gradient {
                value: merged.value,
                node: merged.node.map(|node| (graph, node)),
            });
        }
        state.stats.backward_passes += 1;
        debug!(
            graph = graph.as_u64(),
            keep_graph = options.keep_graph,
            create_graph = options.create_graph,
            "host backward"
        );
        Ok(())
    }

    fn end_graph(&self, graph: GraphId) -> Result<()> {
        let mut state = self.lock();
        if state.graphs.remove(&graph).is_none() {
            return Err(EmberError::GraphConsumed);
        }
        if state.recording.map(|r| r.graph()) == Some(graph) {
            state.recording = None;
        }
        state.stats.graphs_ended += 1;
        debug!(graph = graph.as_u64(), "host graph ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Layout, Shape};

    fn desc(shape: &[usize]) -> DataDesc {
        DataDesc::new(Shape::from(shape)).with_context(Context::cpu())
    }

    #[test]
    fn test_allocate_and_query() {
        let host = HostEngine::new();
        let d = desc(&[2, 3]).with_layout(Layout::NC);
        let raw = host.allocate(&d, Fill::Ones).unwrap();

        let meta = host.query(raw).unwrap();
        assert_eq!(meta.shape, vec![2, 3]);
        assert_eq!(meta.data_type, DataType::Float32);
        assert_eq!(meta.context, Context::cpu());
        assert_eq!(host.read(raw).unwrap(), vec![1.0; 6]);
        assert_eq!(host.allocated_bytes(), 24);
    }

    #[test]
    fn test_free_twice_is_rejected() {
        let host = HostEngine::new();
        let raw = host.allocate(&desc(&[1]), Fill::Zeros).unwrap();
        host.free(raw).unwrap();
        assert!(matches!(host.free(raw), Err(EmberError::UseAfterRelease)));
        assert!(matches!(host.read(raw), Err(EmberError::UseAfterRelease)));
        assert_eq!(host.live_allocations(), 0);
        assert_eq!(host.allocated_bytes(), 0);
    }

    #[test]
    fn test_unaddressable_context_fails_allocation() {
        let host = HostEngine::with_config(HostConfig::default().with_cpu_count(2));
        assert!(host.allocate(&desc(&[1]).with_context(Context::cpu_at(1)), Fill::Zeros).is_ok());
        assert!(matches!(
            host.allocate(&desc(&[1]).with_context(Context::cpu_at(2)), Fill::Zeros),
            Err(EmberError::Allocation { .. })
        ));
        assert!(matches!(
            host.allocate(&desc(&[1]).with_context(Context::gpu(0)), Fill::Zeros),
            Err(EmberError::Allocation { .. })
        ));
    }

    #[test]
    fn test_capacity_limit() {
        let host = HostEngine::with_config(HostConfig::default().with_capacity_bytes(32));
        let a = host.allocate(&desc(&[4]), Fill::Zeros).unwrap();
        let _b = host.allocate(&desc(&[4]), Fill::Zeros).unwrap();
        assert!(matches!(
            host.allocate(&desc(&[1]), Fill::Zeros),
            Err(EmberError::Allocation { .. })
        ));
        // Freeing makes room again
        host.free(a).unwrap();
        assert!(host.allocate(&desc(&[4]), Fill::Zeros).is_ok());
    }

    #[test]
    fn test_overflowing_shape_fails_allocation() {
        let host = HostEngine::with_config(HostConfig::default().with_capacity_bytes(64));
        assert!(matches!(
            host.allocate(&desc(&[1 << 33, 1 << 33]), Fill::Zeros),
            Err(EmberError::Allocation { .. })
        ));
        assert_eq!(host.stats().allocations, 0);
    }

    #[test]
    fn test_capacity_checked_before_materializing() {
        let host = HostEngine::with_config(HostConfig::default().with_capacity_bytes(64));
        assert!(matches!(
            host.allocate(&desc(&[1 << 40]), Fill::Ones),
            Err(EmberError::Allocation { .. })
        ));
        assert_eq!(host.allocated_bytes(), 0);
    }

    #[test]
    fn test_op_results_count_against_capacity() {
        let host = HostEngine::with_config(HostConfig::default().with_capacity_bytes(32));
        let x = host.allocate(&desc(&[4]), Fill::Ones).unwrap();
        assert!(matches!(
            host.cast(x, DataType::Float64),
            Err(EmberError::Allocation { .. })
        ));
        let y = host.unary(UnaryOp::MulScalar(2.0), x).unwrap();
        assert_eq!(host.allocated_bytes(), 32);
        assert!(matches!(
            host.unary(UnaryOp::Sum, y),
            Err(EmberError::Allocation { .. })
        ));
    }

    #[test]
    fn test_other_threads_do_not_record() {
        let host = HostEngine::new();
        let x = host
            .allocate(&desc(&[2]), Fill::Values(&[1.0, 2.0]))
            .unwrap();
        host.set_requires_grad(x, true).unwrap();
        let graph = host.begin_graph().unwrap();

        let remote = host.clone();
        let y = std::thread::spawn(move || remote.unary(UnaryOp::MulScalar(5.0), x).unwrap())
            .join()
            .unwrap();
        assert!(matches!(
            host.backward(graph, y, BackwardOptions::default()),
            Err(EmberError::NotRecorded)
        ));

        let z = host.unary(UnaryOp::MulScalar(2.0), x).unwrap();
        host.backward(graph, z, BackwardOptions::default()).unwrap();
        let g = host.grad(x).unwrap().unwrap();
        assert_eq!(host.read(g).unwrap(), vec![2.0, 2.0]);
    }

    #[test]
    fn test_float16_is_not_stored() {
        let host = HostEngine::new();
        let d = desc(&[2]).with_data_type(DataType::Float16);
        assert!(matches!(
            host.allocate(&d, Fill::Zeros),
            Err(EmberError::Allocation { .. })
        ));
    }

    #[test]
    fn test_unresolved_shape_fails_allocation() {
        let host = HostEngine::new();
        let d = DataDesc::new(Shape::new(vec![2, -1]).unwrap());
        assert!(matches!(
            host.allocate(&d, Fill::Zeros),
            Err(EmberError::Allocation { .. })
        ));
    }

    #[test]
    fn test_only_one_graph_records() {
        let host = HostEngine::new();
        let graph = host.begin_graph().unwrap();
        assert!(matches!(
            host.begin_graph(),
            Err(EmberError::SessionAlreadyOpen { .. })
        ));
        host.end_graph(graph).unwrap();
        assert!(host.begin_graph().is_ok());
    }

    #[test]
    fn test_gradient_flows_to_leaf() {
        let host = HostEngine::new();
        let x = host
            .allocate(&desc(&[2]), Fill::Values(&[1.0, 2.0]))
            .unwrap();
        host.set_requires_grad(x, true).unwrap();

        let graph = host.begin_graph().unwrap();
        let y = host.unary(UnaryOp::MulScalar(4.0), x).unwrap();
        host.backward(graph, y, BackwardOptions::default()).unwrap();

        let g = host.grad(x).unwrap().unwrap();
        assert_eq!(host.read(g).unwrap(), vec![4.0, 4.0]);
        assert!(matches!(
            host.backward(graph, y, BackwardOptions::default()),
            Err(EmberError::GraphConsumed)
        ));
        host.end_graph(graph).unwrap();
        assert_eq!(host.live_graphs(), 0);
    }

    #[test]
    fn test_integer_arrays_cannot_require_grad() {
        let host = HostEngine::new();
        let x = host
            .allocate(&desc(&[1]).with_data_type(DataType::Int32), Fill::Zeros)
            .unwrap();
        assert!(matches!(
            host.set_requires_grad(x, true),
            Err(EmberError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_untracked_target_is_not_recorded() {
        let host = HostEngine::new();
        let x = host.allocate(&desc(&[1]), Fill::Ones).unwrap();
        let graph = host.begin_graph().unwrap();
        let y = host.unary(UnaryOp::Exp, x).unwrap();
        assert!(matches!(
            host.backward(graph, y, BackwardOptions::default()),
            Err(EmberError::NotRecorded)
        ));
    }

    #[test]
    fn test_copy_to_keeps_values() {
        let host = HostEngine::with_config(HostConfig::default().with_cpu_count(2));
        let x = host
            .allocate(&desc(&[2]), Fill::Values(&[3.0, 4.0]))
            .unwrap();
        let y = host.copy_to(x, Context::cpu_at(1)).unwrap();
        assert_eq!(host.query(y).unwrap().context, Context::cpu_at(1));
        assert_eq!(host.read(y).unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_mixed_contexts_are_rejected() {
        let host = HostEngine::with_config(HostConfig::default().with_cpu_count(2));
        let a = host.allocate(&desc(&[1]), Fill::Ones).unwrap();
        let b = host
            .allocate(&desc(&[1]).with_context(Context::cpu_at(1)), Fill::Ones)
            .unwrap();
        assert!(matches!(
            host.binary(BinaryOp::Add, a, b),
            Err(EmberError::ContextMismatch { .. })
        ));
    }
}
