use std::fmt;
use std::num::NonZeroU64;
use std::thread::{self, ThreadId};

use uuid::Uuid;

use crate::types::{Context, DataType, Shape};

/// Family of native engine behind an [`EngineTag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// The in-process reference engine.
    Host,
    /// candle-core.
    Candle,
    /// burn with an autodiff backend.
    Burn,
    /// Any other binding, identified by name.
    Other(&'static str),
}

impl EngineKind {
    pub fn name(&self) -> &'static str {
        match self {
            EngineKind::Host => "host",
            EngineKind::Candle => "candle",
            EngineKind::Burn => "burn",
            EngineKind::Other(name) => name,
        }
    }
}

/// Identity of one native engine instance.
///
/// Two instances of the same kind get different tags, so handles can never
/// travel between them unnoticed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineTag {
    kind: EngineKind,
    instance: Uuid,
}

impl EngineTag {
    /// Mints a fresh tag for a new engine instance.
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            instance: Uuid::new_v4(),
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }
}

impl fmt::Display for EngineTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.instance.simple().to_string();
        write!(f, "{}#{}", self.kind.name(), &id[..8])
    }
}

/// Opaque identifier of one allocation inside a native engine.
///
/// Only the engine that minted it can interpret it. Outside the dispatch
/// layer raw handles never appear; callers hold
/// [`NativeArray`](crate::array::NativeArray) wrappers instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(NonZeroU64);

impl RawHandle {
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0.get())
    }
}

/// Opaque identifier of the graph-tracking state an engine keeps for one
/// gradient session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphId(NonZeroU64);

impl GraphId {
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn as_u64(self) -> u64 {
        self.0.get()
    }
}

/// The graph an engine is recording into, bound to the thread that began it.
///
/// Native autograd state is thread-affine. Operations issued from any other
/// thread, even through a clone of the same engine, are not recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recording {
    graph: GraphId,
    thread: ThreadId,
}

impl Recording {
    /// Binds `graph` to the calling thread.
    pub fn on_current_thread(graph: GraphId) -> Self {
        Self {
            graph,
            thread: thread::current().id(),
        }
    }

    pub fn graph(&self) -> GraphId {
        self.graph
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// The graph, if the caller is on the recording thread.
    pub fn active(&self) -> Option<GraphId> {
        (thread::current().id() == self.thread).then_some(self.graph)
    }
}

/// What a native engine reports about one of its allocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeMeta {
    pub shape: Vec<usize>,
    pub data_type: DataType,
    pub context: Context,
}

impl fmt::Display for NativeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} @ {}",
            Shape::from(self.shape.clone()),
            self.data_type,
            self.context
        )
    }
}
