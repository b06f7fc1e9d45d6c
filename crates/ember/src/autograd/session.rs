use std::fmt;
use std::marker::PhantomData;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::array::NativeArray;
use crate::dispatch::Engine;
use crate::engine::{BackwardOptions, GraphId};
use crate::error::{EmberError, Result};

/// Lifecycle of a [`GradientSession`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unopened,
    Open,
    Closed,
}

/// A scope during which operations on one engine are recorded for
/// differentiation.
///
/// While the session is open, every operation dispatched through its engine
/// on the opening thread that touches a gradient-bearing array (see
/// [`NativeArray::set_requires_gradient`]) is recorded. [`backward`](Self::backward)
/// walks that record from a target array and accumulates gradients into the
/// leaves; [`close`](Self::close) discards whatever graph state the engine
/// still holds. Arrays that took part are untouched by closing; they are
/// released by whoever owns them.
///
/// At most one session is open per engine instance. Sessions on different
/// engines are independent.
///
/// # Thread affinity
///
/// Native autograd state is generally bound to the thread that created it, so
/// a session is neither `Send` nor `Sync`: it is opened, used and closed on
/// one thread, and the compiler rejects anything else. Operations other
/// threads issue through clones of the same [`Engine`] are not recorded, so
/// a backward pass from their results fails with [`EmberError::NotRecorded`].
///
/// ```compile_fail
/// use ember::autograd::GradientSession;
///
/// fn assert_send<T: Send>() {}
/// assert_send::<GradientSession>();
/// ```
///
/// # Example
///
/// ```
/// use ember::dispatch::Engine;
/// use ember::engine::HostEngine;
/// use ember::types::DataDesc;
/// use ember::EmberError;
///
/// let engine = Engine::new(HostEngine::new());
/// let x = engine.from_vec(&DataDesc::new([2]), &[1.0, 2.0]).unwrap();
/// x.set_requires_gradient(true).unwrap();
///
/// let mut session = engine.gradient_session().unwrap();
/// let y = x.mul(&x).unwrap();
/// session.backward(&y).unwrap();
///
/// let grad = x.gradient().unwrap().unwrap();
/// assert_eq!(grad.to_vec().unwrap(), vec![2.0, 4.0]);
///
/// assert!(matches!(session.backward(&y), Err(EmberError::GraphConsumed)));
/// session.close().unwrap();
/// ```
pub struct GradientSession {
    engine: Engine,
    id: Uuid,
    state: SessionState,
    graph: Option<GraphId>,
    _not_send: PhantomData<*const ()>,
}

impl GradientSession {
    /// A session bound to `engine`, not yet open.
    pub fn new(engine: &Engine) -> Self {
        Self {
            engine: engine.clone(),
            id: Uuid::new_v4(),
            state: SessionState::Unopened,
            graph: None,
            _not_send: PhantomData,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Starts recording.
    ///
    /// # Returns
    ///
    /// * [`EmberError::SessionAlreadyOpen`] if this or another session is
    ///   already open on the engine
    /// * [`EmberError::SessionClosed`] if this session was closed
    pub fn open(&mut self) -> Result<()> {
        match self.state {
            SessionState::Open => {
                return Err(EmberError::SessionAlreadyOpen {
                    engine: self.engine.tag(),
                })
            }
            SessionState::Closed => return Err(EmberError::SessionClosed),
            SessionState::Unopened => {}
        }
        let graph = self.engine.begin_session()?;
        self.graph = Some(graph);
        self.state = SessionState::Open;
        debug!(session = %self.id, engine = %self.engine.tag(), "gradient session opened");
        Ok(())
    }

    /// Backward pass from `target` with default options: the graph is
    /// consumed and no higher-order graph is built.
    pub fn backward(&mut self, target: &NativeArray) -> Result<()> {
        self.backward_with(target, BackwardOptions::default())
    }

    /// Walks the recorded graph backward from `target`, accumulating gradients
    /// into every gradient-bearing array it reaches.
    ///
    /// # Parameters
    ///
    /// * `target` - The array to differentiate. Its gradient is seeded with
    ///   ones of its own shape.
    /// * `options` - `keep_graph` retains graph state for another pass;
    ///   `create_graph` records the pass itself so the resulting gradients can
    ///   be differentiated again.
    ///
    /// # Returns
    ///
    /// * [`EmberError::SessionNotOpen`] before [`open`](Self::open)
    /// * [`EmberError::GraphConsumed`] after [`close`](Self::close), or when an
    ///   earlier pass discarded the graph
    /// * [`EmberError::NotRecorded`] if `target` was not produced while this
    ///   session recorded
    /// * [`EmberError::EngineMismatch`] if `target` belongs to another engine
    pub fn backward_with(&mut self, target: &NativeArray, options: BackwardOptions) -> Result<()> {
        let graph = match (self.state, self.graph) {
            (SessionState::Unopened, _) => return Err(EmberError::SessionNotOpen),
            (SessionState::Closed, _) | (SessionState::Open, None) => {
                return Err(EmberError::GraphConsumed)
            }
            (SessionState::Open, Some(graph)) => graph,
        };
        let raw = target.as_typed(self.engine.tag())?;
        debug!(
            session = %self.id,
            handle = %raw,
            keep_graph = options.keep_graph,
            create_graph = options.create_graph,
            "backward"
        );
        self.engine.native().backward(graph, raw, options)
    }

    /// Stops recording and releases the engine's graph state.
    ///
    /// Closing twice is a no-op, as is closing a session that never opened.
    /// Either way the session ends up `Closed`.
    pub fn close(&mut self) -> Result<()> {
        self.state = SessionState::Closed;
        let Some(graph) = self.graph.take() else {
            return Ok(());
        };
        debug!(session = %self.id, engine = %self.engine.tag(), "gradient session closed");
        self.engine.end_session(graph)
    }
}

impl Drop for GradientSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(session = %self.id, error = %e, "failed to close gradient session");
        }
    }
}

impl fmt::Debug for GradientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GradientSession")
            .field("id", &self.id)
            .field("engine", &self.engine.tag())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HostEngine;
    use crate::engine::mock_engine::{MockCalls, MockEngine};
    use crate::types::{DataDesc, DataType};
    use approx::assert_relative_eq;

    fn leaf(engine: &Engine, values: &[f64]) -> NativeArray {
        let x = engine
            .from_vec(&DataDesc::new([values.len()]).with_data_type(DataType::Float64), values)
            .unwrap();
        x.set_requires_gradient(true).unwrap();
        x
    }

    fn grad(x: &NativeArray) -> Vec<f64> {
        x.gradient().unwrap().unwrap().to_vec().unwrap()
    }

    #[test]
    fn test_state_transitions() {
        let engine = Engine::new(HostEngine::new());
        let mut session = GradientSession::new(&engine);
        assert_eq!(session.state(), SessionState::Unopened);

        session.open().unwrap();
        assert_eq!(session.state(), SessionState::Open);
        assert!(matches!(
            session.open(),
            Err(EmberError::SessionAlreadyOpen { .. })
        ));

        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(session.open(), Err(EmberError::SessionClosed)));
        assert!(!engine.session_open());
    }

    #[test]
    fn test_backward_before_open() {
        let engine = Engine::new(HostEngine::new());
        let x = leaf(&engine, &[1.0]);
        let mut session = GradientSession::new(&engine);
        assert!(matches!(session.backward(&x), Err(EmberError::SessionNotOpen)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mock = MockEngine::new();
        let engine = Engine::new(mock.clone());
        let mut session = engine.gradient_session().unwrap();

        session.close().unwrap();
        let after_first = session.state();
        session.close().unwrap();
        assert_eq!(session.state(), after_first);
        drop(session);

        assert_eq!(MockCalls::get(&mock.calls.begin_graphs), 1);
        assert_eq!(MockCalls::get(&mock.calls.end_graphs), 1);
    }

    #[test]
    fn test_drop_closes() {
        let host = HostEngine::new();
        let engine = Engine::new(host.clone());
        {
            let _session = engine.gradient_session().unwrap();
            assert_eq!(host.live_graphs(), 1);
        }
        assert_eq!(host.live_graphs(), 0);
        assert!(engine.gradient_session().is_ok());
    }

    #[test]
    fn test_keep_graph_allows_second_pass() {
        let engine = Engine::new(HostEngine::new());
        let x = leaf(&engine, &[3.0]);
        let mut session = engine.gradient_session().unwrap();
        let y = x.mul(&x).unwrap();

        session.backward_with(&y, BackwardOptions::keep_graph()).unwrap();
        assert_relative_eq!(grad(&x)[0], 6.0);
        session.backward_with(&y, BackwardOptions::keep_graph()).unwrap();
        // Gradients accumulate across passes
        assert_relative_eq!(grad(&x)[0], 12.0);

        x.zero_gradient().unwrap();
        session.backward(&y).unwrap();
        assert_relative_eq!(grad(&x)[0], 6.0);
        assert!(matches!(session.backward(&y), Err(EmberError::GraphConsumed)));
    }

    #[test]
    fn test_backward_after_close_is_consumed() {
        let engine = Engine::new(HostEngine::new());
        let x = leaf(&engine, &[1.0]);
        let mut session = engine.gradient_session().unwrap();
        let y = x.exp().unwrap();
        session.close().unwrap();
        assert!(matches!(session.backward(&y), Err(EmberError::GraphConsumed)));
    }

    #[test]
    fn test_create_graph_second_derivative() {
        let engine = Engine::new(HostEngine::new());
        let x = leaf(&engine, &[2.0]);
        let mut session = engine.gradient_session().unwrap();

        // y = x^3
        let y = x.mul(&x).unwrap().mul(&x).unwrap();
        session.backward_with(&y, BackwardOptions::create_graph()).unwrap();
        let dy = x.gradient().unwrap().unwrap();
        assert_relative_eq!(dy.to_vec().unwrap()[0], 12.0);

        x.zero_gradient().unwrap();
        session.backward(&dy).unwrap();
        assert_relative_eq!(grad(&x)[0], 12.0);
    }

    #[test]
    fn test_unrecorded_target() {
        let engine = Engine::new(HostEngine::new());
        let x = leaf(&engine, &[1.0]);
        let before = x.exp().unwrap();
        let mut session = engine.gradient_session().unwrap();
        assert!(matches!(session.backward(&before), Err(EmberError::NotRecorded)));
    }

    #[test]
    fn test_foreign_target() {
        let a = Engine::new(HostEngine::new());
        let b = Engine::new(HostEngine::new());
        let x = leaf(&b, &[1.0]);
        let y = x.exp().unwrap();
        let mut session = a.gradient_session().unwrap();
        assert!(matches!(
            session.backward(&y),
            Err(EmberError::EngineMismatch { .. })
        ));
    }

    #[test]
    fn test_gradient_matches_chain_rule() {
        let engine = Engine::new(HostEngine::new());
        let x = leaf(&engine, &[0.5, 1.0, 2.0]);
        let mut session = engine.gradient_session().unwrap();

        // z = sum(log(x) * 3 + exp(-x))
        let z = x
            .log()
            .unwrap()
            .mul_scalar(3.0)
            .unwrap()
            .add(&x.neg().unwrap().exp().unwrap())
            .unwrap()
            .sum()
            .unwrap();
        session.backward(&z).unwrap();

        let g = grad(&x);
        for (i, v) in [0.5f64, 1.0, 2.0].iter().enumerate() {
            assert_relative_eq!(g[i], 3.0 / v - (-v).exp(), epsilon = 1e-12);
        }
    }
}
