//! End-to-end compile runs through a [`Session`].

use anyhow::Result;
use opgraph_ir::{
    AllocError, CpuRuntime, DataType, GraphConfig, GraphError, GraphPhase,
    OptimizeConfig, UnaryOp,
};
use opgraph_runtime::{ArenaConfig, Session, SessionConfig, SessionError};

/// `sigmoid(relu(T(T(x))) x T(w))` with two-axis transposes on [2, 8, 4] operands.
fn build_block(session: &mut Session) -> Result<()> {
    let g = session.graph_mut();
    let x = g.add_tensor(vec![2, 8, 4], DataType::Float32);
    let t1 = g.add_transpose(x, vec![0, 2, 1])?;
    let t2 = g.add_transpose(g.output_of(t1).unwrap(), vec![0, 2, 1])?;
    let r = g.add_unary(UnaryOp::Relu, g.output_of(t2).unwrap())?;

    let w = g.add_tensor(vec![2, 6, 4], DataType::Float32);
    let wt = g.add_transpose(w, vec![0, 2, 1])?;
    let mm = g.add_matmul(g.output_of(r).unwrap(), g.output_of(wt).unwrap(), false, false)?;
    g.add_unary(UnaryOp::Sigmoid, g.output_of(mm).unwrap())?;
    Ok(())
}

#[test]
fn test_compile_pipeline() -> Result<()> {
    let config = SessionConfig::default()
        .with_graph(GraphConfig::default().with_validation(true));
    let mut session = Session::new(CpuRuntime::handle(), config)?;
    build_block(&mut session)?;

    let report = session.compile()?;
    assert_eq!(report.optimize.transposes_cancelled, 1);
    assert_eq!(report.optimize.transposes_fused, 1);
    // Relu, MatMul and Sigmoid survive.
    assert_eq!(report.operators, 3);
    assert_eq!(session.graph().phase(), GraphPhase::Allocated);
    session.graph().check_valid()?;

    // x, relu out, w, matmul out [2, 8, 6], sigmoid out [2, 8, 6]
    assert_eq!(report.tensors, 5);
    assert_eq!(report.memory.total_bytes, 4 * (64 + 64 + 48 + 96 + 96));
    assert!(report.memory.overlapping_pairs().is_empty());
    assert!(report.arena_peak_bytes >= report.memory.total_bytes);
    for id in session.graph().tensor_ids() {
        assert!(session.graph().tensor(id).unwrap().storage().is_some());
    }
    Ok(())
}

#[test]
fn test_fixpoint_session() -> Result<()> {
    let config = SessionConfig::default().with_graph(
        GraphConfig::default().with_optimize(OptimizeConfig::fixpoint(4)),
    );
    let mut session = Session::new(CpuRuntime::handle(), config)?;
    let g = session.graph_mut();
    let mut x = g.add_tensor(vec![3, 5], DataType::Float32);
    for _ in 0..4 {
        let t = g.add_transpose(x, vec![1, 0])?;
        x = g.output_of(t).unwrap();
    }
    g.add_unary(UnaryOp::Tanh, x)?;

    let report = session.compile()?;
    assert_eq!(report.optimize.transposes_cancelled, 2);
    assert_eq!(report.operators, 1);
    Ok(())
}

#[test]
fn test_arena_limit_surfaces_as_graph_error() -> Result<()> {
    let config = SessionConfig::default().with_arena(ArenaConfig::default().with_limit(64));
    let mut session = Session::new(CpuRuntime::handle(), config)?;
    let g = session.graph_mut();
    let x = g.add_tensor(vec![16, 16], DataType::Float32);
    g.add_unary(UnaryOp::Abs, x)?;

    let err = session.compile().unwrap_err();
    assert!(matches!(
        err,
        SessionError::Graph(GraphError::Allocation(AllocError::OutOfMemory { .. }))
    ));
    assert_eq!(session.graph().phase(), GraphPhase::ShapeResolved);
    assert_eq!(session.arena().stats().used, 0);
    Ok(())
}

#[test]
fn test_failed_recompile_leaves_no_tensor_bound() -> Result<()> {
    let config = SessionConfig::default().with_arena(ArenaConfig::default().with_limit(128));
    let mut session = Session::new(CpuRuntime::handle(), config)?;
    let g = session.graph_mut();
    let x = g.add_tensor(vec![4, 4], DataType::Float32);
    let relu = g.add_unary(UnaryOp::Relu, x)?;
    session.compile()?;
    assert!(session.graph().tensor(x).unwrap().has_storage());

    // A third 64-byte tensor no longer fits the arena.
    let y = session.graph().output_of(relu).unwrap();
    session.graph_mut().add_unary(UnaryOp::Exp, y)?;
    let err = session.compile().unwrap_err();
    assert!(matches!(
        err,
        SessionError::Graph(GraphError::Allocation(AllocError::OutOfMemory { .. }))
    ));

    assert_eq!(session.graph().phase(), GraphPhase::ShapeResolved);
    assert!(!session.arena().is_materialized());
    assert!(session.graph().memory_plan().is_none());
    assert!(session.graph().tensors().all(|t| !t.has_storage()));
    Ok(())
}

#[test]
fn test_cycle_is_reported() -> Result<()> {
    let mut session = Session::new(CpuRuntime::handle(), SessionConfig::default())?;
    let g = session.graph_mut();
    let a = g.add_tensor(vec![2, 2], DataType::Float32);
    let b = g.add_tensor(vec![2, 2], DataType::Float32);
    g.add_op(opgraph_ir::OpKind::Unary(UnaryOp::Neg), vec![a], Some(vec![b]))?;
    g.add_op(opgraph_ir::OpKind::Unary(UnaryOp::Neg), vec![b], Some(vec![a]))?;

    let err = session.compile().unwrap_err();
    assert!(matches!(
        err,
        SessionError::Graph(GraphError::CycleDetected { placed: 0, total: 2 })
    ));
    Ok(())
}

#[test]
fn test_config_file_roundtrip() -> Result<()> {
    let dir = std::env::temp_dir().join(format!("opgraph-session-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("session.json");
    std::fs::write(
        &path,
        r#"{"graph": {"broadcast": "largest_wins"}, "logging": {"format": "compact"}}"#,
    )?;

    let config = SessionConfig::load(&path)?;
    assert_eq!(config.graph.broadcast, opgraph_ir::BroadcastPolicy::LargestWins);
    assert!(config.logging.is_some());
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
