use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{
    BackwardOptions, BinaryOp, EngineTag, Fill, GraphId, HostEngine, NativeEngine, NativeMeta,
    RawHandle, UnaryOp,
};
use crate::error::Result;
use crate::types::{Context, DataDesc, DataType};

/// Native call counters shared between a [`MockEngine`] and the test that
/// built it.
#[derive(Debug, Default)]
pub struct MockCalls {
    pub allocations: AtomicUsize,
    pub frees: AtomicUsize,
    pub begin_graphs: AtomicUsize,
    pub end_graphs: AtomicUsize,
    pub backwards: AtomicUsize,
    /// When set, `query` reports one extra trailing dimension.
    pub misreport: AtomicBool,
}

impl MockCalls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

// Storage and math come from a host engine; the mock only observes and lies.
#[derive(Debug, Clone)]
pub struct MockEngine {
    inner: HostEngine,
    pub calls: Arc<MockCalls>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            inner: HostEngine::new(),
            calls: Arc::new(MockCalls::default()),
        }
    }

    pub fn set_misreport(&self, on: bool) {
        self.calls.misreport.store(on, Ordering::SeqCst);
    }

    pub fn live_allocations(&self) -> usize {
        self.inner.live_allocations()
    }
}

impl NativeEngine for MockEngine {
    fn tag(&self) -> EngineTag {
        self.inner.tag()
    }

    fn allocate(&self, desc: &DataDesc, fill: Fill<'_>) -> Result<RawHandle> {
        let raw = self.inner.allocate(desc, fill)?;
        self.calls.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(raw)
    }

    fn free(&self, raw: RawHandle) -> Result<()> {
        self.inner.free(raw)?;
        self.calls.frees.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn query(&self, raw: RawHandle) -> Result<NativeMeta> {
        let mut meta = self.inner.query(raw)?;
        if self.calls.misreport.load(Ordering::SeqCst) {
            meta.shape.push(1);
        }
        Ok(meta)
    }

    fn read(&self, raw: RawHandle) -> Result<Vec<f64>> {
        self.inner.read(raw)
    }

    fn unary(&self, op: UnaryOp, x: RawHandle) -> Result<RawHandle> {
        let raw = self.inner.unary(op, x)?;
        self.calls.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(raw)
    }

    fn binary(&self, op: BinaryOp, lhs: RawHandle, rhs: RawHandle) -> Result<RawHandle> {
        let raw = self.inner.binary(op, lhs, rhs)?;
        self.calls.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(raw)
    }

    fn reshape(&self, raw: RawHandle, shape: &[usize]) -> Result<RawHandle> {
        let raw = self.inner.reshape(raw, shape)?;
        self.calls.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(raw)
    }

    fn cast(&self, raw: RawHandle, data_type: DataType) -> Result<RawHandle> {
        let raw = self.inner.cast(raw, data_type)?;
        self.calls.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(raw)
    }

    fn copy_to(&self, raw: RawHandle, context: Context) -> Result<RawHandle> {
        let raw = self.inner.copy_to(raw, context)?;
        self.calls.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(raw)
    }

    fn set_requires_grad(&self, raw: RawHandle, requires_grad: bool) -> Result<()> {
        self.inner.set_requires_grad(raw, requires_grad)
    }

    fn requires_grad(&self, raw: RawHandle) -> Result<bool> {
        self.inner.requires_grad(raw)
    }

    fn grad(&self, raw: RawHandle) -> Result<Option<RawHandle>> {
        let grad = self.inner.grad(raw)?;
        if grad.is_some() {
            self.calls.allocations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(grad)
    }

    fn zero_grad(&self, raw: RawHandle) -> Result<()> {
        self.inner.zero_grad(raw)
    }

    fn begin_graph(&self) -> Result<GraphId> {
        let graph = self.inner.begin_graph()?;
        self.calls.begin_graphs.fetch_add(1, Ordering::SeqCst);
        Ok(graph)
    }

    fn backward(&self, graph: GraphId, target: RawHandle, options: BackwardOptions) -> Result<()> {
        self.calls.backwards.fetch_add(1, Ordering::SeqCst);
        self.inner.backward(graph, target, options)
    }

    fn end_graph(&self, graph: GraphId) -> Result<()> {
        self.calls.end_graphs.fetch_add(1, Ordering::SeqCst);
        self.inner.end_graph(graph)
    }
}
