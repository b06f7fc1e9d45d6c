use approx::assert_relative_eq;
use ember::autograd::{BackwardOptions, GradientSession, SessionState};
use ember::dispatch::Engine;
use ember::engine::HostEngine;
use ember::types::{Context, DataDesc, DataType, Layout, Shape};
use ember::EmberError;

#[test]
fn test_end_to_end_gradient_scenario() {
    let host = HostEngine::new();
    let engine = Engine::new(host.clone());

    let desc = DataDesc::new([2, 3])
        .with_data_type(DataType::Float32)
        .with_layout(Layout::NC);
    assert_eq!(desc.major_axis(), Some(0));

    let x = engine
        .from_vec(&desc, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0])
        .unwrap();
    x.set_requires_gradient(true).unwrap();

    let mut session = engine.gradient_session().unwrap();
    assert_eq!(session.state(), SessionState::Open);

    let y = x.mul_scalar(3.0).unwrap();
    assert_eq!(y.shape(), &Shape::from([2, 3]));
    session.backward(&y).unwrap();

    let grad = x.gradient().unwrap().expect("gradient slot populated");
    for g in grad.to_vec().unwrap() {
        assert_relative_eq!(g, 3.0);
    }
    assert_eq!(x.desc(), &desc);
    assert_eq!(x.layout(), Layout::NC);

    session.close().unwrap();
    assert!(matches!(session.backward(&y), Err(EmberError::GraphConsumed)));

    drop((x, y, grad));
    assert_eq!(host.live_allocations(), 0);
    assert_eq!(host.live_graphs(), 0);
}

#[test]
fn test_exactly_once_release() {
    let host = HostEngine::new();
    let engine = Engine::new(host.clone());

    let mut arrays: Vec<_> = (1..=16)
        .map(|n| engine.zeros(&DataDesc::new([n])).unwrap())
        .collect();
    assert_eq!(host.live_allocations(), 16);

    for array in arrays.iter_mut() {
        array.release().unwrap();
    }
    assert_eq!(host.live_allocations(), 0);
    assert_eq!(host.allocated_bytes(), 0);

    for array in arrays.iter_mut() {
        assert!(matches!(array.release(), Err(EmberError::UseAfterRelease)));
    }
    drop(arrays);

    let stats = host.stats();
    assert_eq!(stats.allocations, 16);
    assert_eq!(stats.frees, 16);
}

#[test]
fn test_metadata_survives_until_explicit_transform() {
    let engine = Engine::new(HostEngine::with_config(
        ember::config::HostConfig::default().with_cpu_count(2),
    ));
    let desc = DataDesc::from_parts(
        Shape::from([4, 2]),
        DataType::Float64,
        Some("features".to_string()),
        Layout::NC,
        Some(Context::cpu_at(1)),
    );
    let x = engine.ones(&desc).unwrap();
    let y = x.add_scalar(1.0).unwrap();
    assert_eq!(x.desc(), &desc);
    assert!(x.verify().is_ok());

    let reshaped = engine.reshape(&y, [2, 2, 2]).unwrap();
    assert_eq!(reshaped.layout(), Layout::Undefined);
    assert_eq!(reshaped.context(), Context::cpu_at(1));
    let cast = engine.cast(&reshaped, DataType::Float32).unwrap();
    assert_eq!(cast.data_type(), DataType::Float32);
    assert_eq!(cast.shape(), reshaped.shape());
    assert_eq!(x.desc(), &desc);
}

#[test]
fn test_engine_mismatch_never_succeeds() {
    let a = Engine::new(HostEngine::new());
    let b = Engine::new(HostEngine::new());
    let on_a = a.ones(&DataDesc::new([2])).unwrap();
    let on_b = b.ones(&DataDesc::new([2])).unwrap();

    assert!(matches!(b.exp(&on_a), Err(EmberError::EngineMismatch { .. })));
    assert!(matches!(a.add(&on_a, &on_b), Err(EmberError::EngineMismatch { .. })));
    assert!(matches!(b.duplicate(&on_a), Err(EmberError::EngineMismatch { .. })));
    assert!(matches!(
        b.to_context(&on_a, Context::cpu()),
        Err(EmberError::EngineMismatch { .. })
    ));
}

#[test]
fn test_keep_graph_second_pass_matches_rerun() {
    let engine = Engine::new(HostEngine::new());
    let desc = DataDesc::new([3]).with_data_type(DataType::Float64);
    let x = engine.from_vec(&desc, &[1.0, 2.0, 3.0]).unwrap();
    x.set_requires_gradient(true).unwrap();

    let mut session = engine.gradient_session().unwrap();
    let shared = x.exp().unwrap();
    let y = shared.mul(&x).unwrap().sum().unwrap();

    session.backward_with(&y, BackwardOptions::keep_graph()).unwrap();
    let first = x.gradient().unwrap().unwrap().to_vec().unwrap();
    x.zero_gradient().unwrap();
    session.backward_with(&y, BackwardOptions::keep_graph()).unwrap();
    let second = x.gradient().unwrap().unwrap().to_vec().unwrap();

    for ((a, b), v) in first.iter().zip(&second).zip([1.0f64, 2.0, 3.0]) {
        assert_relative_eq!(*a, *b);
        // d/dx (x e^x) = (x + 1) e^x
        assert_relative_eq!(*a, (v + 1.0) * v.exp(), epsilon = 1e-12);
    }
}

#[test]
fn test_idempotent_close_and_reuse_of_engine() {
    let host = HostEngine::new();
    let engine = Engine::new(host.clone());

    let mut session = GradientSession::new(&engine);
    session.open().unwrap();
    session.close().unwrap();
    session.close().unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    drop(session);

    let stats = host.stats();
    assert_eq!(stats.graphs_begun, 1);
    assert_eq!(stats.graphs_ended, 1);

    // The slot is free again.
    let next = engine.gradient_session().unwrap();
    assert_eq!(next.state(), SessionState::Open);
}

#[test]
fn test_shared_array_single_release() {
    let host = HostEngine::new();
    let engine = Engine::new(host.clone());

    let shared = engine.ones(&DataDesc::new([8])).unwrap().into_shared();
    let copies: Vec<_> = (0..3).map(|_| shared.clone()).collect();
    let total: f64 = copies
        .iter()
        .map(|c| c.sum().unwrap().to_vec().unwrap()[0])
        .sum();
    assert_relative_eq!(total, 24.0);

    drop(copies);
    assert_eq!(host.live_allocations(), 1);
    drop(shared);
    assert_eq!(host.live_allocations(), 0);
    assert_eq!(host.stats().frees, host.stats().allocations);
}

#[test]
fn test_operations_on_other_threads_are_not_recorded() {
    let engine = Engine::new(HostEngine::new());
    let x = engine.ones(&DataDesc::new([2])).unwrap().into_shared();
    x.set_requires_gradient(true).unwrap();

    let mut session = engine.gradient_session().unwrap();
    let remote = x.clone();
    let y = std::thread::spawn(move || remote.mul_scalar(5.0).unwrap())
        .join()
        .unwrap();
    assert!(matches!(session.backward(&y), Err(EmberError::NotRecorded)));
    assert!(x.gradient().unwrap().is_none());

    let z = x.mul_scalar(2.0).unwrap();
    session.backward(&z).unwrap();
    assert_eq!(x.gradient().unwrap().unwrap().to_vec().unwrap(), vec![2.0, 2.0]);
}

#[test]
fn test_oversized_requests_are_rejected_not_materialized() {
    let engine = Engine::new(HostEngine::with_config(
        ember::config::HostConfig::default().with_capacity_bytes(64),
    ));
    assert!(matches!(
        engine.create(&DataDesc::new([1usize << 33, 1usize << 33])),
        Err(EmberError::Allocation { .. })
    ));
    assert!(matches!(
        engine.create(&DataDesc::new([1usize << 40])),
        Err(EmberError::Allocation { .. })
    ));
    assert!(engine.create(&DataDesc::new([16])).is_ok());
}

#[test]
fn test_allocation_errors_surface() {
    let engine = Engine::new(HostEngine::with_config(
        ember::config::HostConfig::default().with_capacity_bytes(64),
    ));
    assert!(matches!(
        engine.create(&DataDesc::new([100])),
        Err(EmberError::Allocation { .. })
    ));
    assert!(matches!(
        engine.create(&DataDesc::new([2]).with_context(Context::gpu(0))),
        Err(EmberError::Allocation { .. })
    ));
    assert!(matches!(
        engine.from_vec(&DataDesc::new([3]), &[1.0]),
        Err(EmberError::Allocation { .. })
    ));
}
