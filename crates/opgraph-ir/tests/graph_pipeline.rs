//! End-to-end tests of the build → sort → optimize → infer → bind pipeline.

use std::cell::Cell;
use std::ptr::NonNull;

use opgraph_ir::{
    AllocError, Allocator, CpuRuntime, DataType, Graph, GraphConfig, GraphError, GraphPhase,
    MatMul, OpId, OpKind, Operator, TensorId, UnaryOp,
};

/// Bump allocator over a heap buffer that records each request.
struct RecordingAllocator {
    buf: Vec<u64>,
    next: usize,
    requests: Vec<usize>,
    materialized: bool,
    info_calls: Cell<usize>,
}

impl RecordingAllocator {
    fn new() -> Self {
        RecordingAllocator {
            buf: Vec::new(),
            next: 0,
            requests: Vec::new(),
            materialized: false,
            info_calls: Cell::new(0),
        }
    }
}

impl Allocator for RecordingAllocator {
    fn alloc(&mut self, bytes: usize) -> Result<usize, AllocError> {
        if self.materialized {
            return Err(AllocError::Materialized);
        }
        self.requests.push(bytes);
        let offset = self.next;
        self.next += bytes.div_ceil(8) * 8;
        Ok(offset)
    }

    fn free(&mut self, offset: usize, bytes: usize) -> Result<(), AllocError> {
        Err(AllocError::InvalidFree { offset, bytes })
    }

    fn base_ptr(&mut self) -> Result<NonNull<u8>, AllocError> {
        self.materialized = true;
        self.buf = vec![0; self.next.div_ceil(8).max(1)];
        Ok(NonNull::from(self.buf.as_mut_slice()).cast())
    }

    fn info(&self) {
        self.info_calls.set(self.info_calls.get() + 1);
    }
}

fn position(order: &[OpId], op: OpId) -> usize {
    order.iter().position(|&o| o == op).unwrap()
}

#[test]
fn test_topo_sort_places_producers_first() -> anyhow::Result<()> {
    let mut g = Graph::new(CpuRuntime::handle());
    let y = g.add_tensor(vec![3, 2], DataType::Float32);
    let z = g.add_tensor(vec![3, 2], DataType::Float32);
    let w = g.add_tensor(vec![3, 2], DataType::Float32);

    // Inserted consumer-first.
    let c = g.add_op(OpKind::Unary(UnaryOp::Exp), vec![z], Some(vec![w]))?;
    let b = g.add_op(OpKind::Unary(UnaryOp::Relu), vec![y], Some(vec![z]))?;
    let d = g.add_transpose(w, vec![1, 0])?;

    g.topo_sort()?;
    let order = g.operator_ids();
    assert!(position(&order, b) < position(&order, c));
    assert!(position(&order, c) < position(&order, d));
    for op in g.operators() {
        for pred in op.predecessors() {
            assert!(position(&order, *pred) < position(&order, op.guid()));
        }
    }
    Ok(())
}

#[test]
fn test_cycle_is_reported() {
    let mut g = Graph::new(CpuRuntime::handle());
    let t1 = g.add_tensor(vec![4], DataType::Float32);
    let t2 = g.add_tensor(vec![4], DataType::Float32);
    let t3 = g.add_tensor(vec![4], DataType::Float32);
    g.add_op(OpKind::Unary(UnaryOp::Relu), vec![t1], Some(vec![t2]))
        .unwrap();
    g.add_op(OpKind::Unary(UnaryOp::Abs), vec![t2], Some(vec![t3]))
        .unwrap();
    g.add_op(OpKind::Unary(UnaryOp::Neg), vec![t3], Some(vec![t1]))
        .unwrap();

    assert!(matches!(
        g.topo_sort(),
        Err(GraphError::CycleDetected { placed: 0, total: 3 })
    ));
    assert!(matches!(g.optimize(), Err(GraphError::CycleDetected { .. })));
    assert!(!g.is_sorted());
}

#[test]
fn test_sort_is_idempotent_and_reset_by_mutation() -> anyhow::Result<()> {
    let mut g = Graph::new(CpuRuntime::handle());
    let x = g.add_tensor(vec![2, 2], DataType::Float32);
    let r = g.add_unary(UnaryOp::Sigmoid, x)?;
    g.topo_sort()?;
    let order = g.operator_ids();
    g.topo_sort()?;
    assert_eq!(g.operator_ids(), order);
    assert!(g.is_sorted());

    g.add_unary(UnaryOp::Tanh, g.output_of(r).unwrap())?;
    assert!(!g.is_sorted());
    g.topo_sort()?;
    assert!(g.is_sorted());
    Ok(())
}

#[test]
fn test_transpose_pair_cancellation_rebinds_consumer() -> anyhow::Result<()> {
    let mut g = Graph::new(CpuRuntime::handle());
    let x = g.add_tensor(vec![2, 3, 4], DataType::Float32);
    let t1 = g.add_transpose(x, vec![0, 2, 1])?;
    let t2 = g.add_transpose(g.output_of(t1).unwrap(), vec![0, 2, 1])?;
    let consumer = g.add_unary(UnaryOp::Relu, g.output_of(t2).unwrap())?;
    let (ops, tensors) = (g.num_operators(), g.num_tensors());

    let stats = g.optimize()?;
    assert_eq!(stats.transposes_cancelled, 1);
    assert_eq!(g.num_operators(), ops - 2);
    assert_eq!(g.num_tensors(), tensors - 2);
    assert_eq!(g.operator(consumer).unwrap().inputs(), &[x]);
    assert!(g.tensor(x).unwrap().targets().contains(&consumer));
    g.check_valid()?;

    let again = g.optimize()?;
    assert!(!again.changed());
    assert_eq!(g.num_operators(), ops - 2);
    Ok(())
}

#[test]
fn test_matmul_fusion_sets_flag_and_operand() -> anyhow::Result<()> {
    let mut g = Graph::new(CpuRuntime::handle());
    let x = g.add_tensor(vec![4, 3], DataType::Float32);
    let b = g.add_tensor(vec![4, 5], DataType::Float32);
    let tr = g.add_transpose(x, vec![1, 0])?;
    let mm = g.add_matmul(g.output_of(tr).unwrap(), b, false, false)?;

    let stats = g.optimize()?;
    assert_eq!(stats.transposes_fused, 1);
    assert!(g.operator(tr).is_none());
    let op = g.operator(mm).unwrap();
    assert_eq!(op.inputs(), &[x, b]);
    assert!(op.kind().as_matmul().unwrap().trans_a());
    g.check_valid()?;

    g.shape_infer()?;
    let c = g.output_of(mm).unwrap();
    assert_eq!(g.tensor(c).unwrap().shape(), &[3, 5]);
    Ok(())
}

#[test]
fn test_check_valid_on_built_graph_and_duplicate_fuid() -> anyhow::Result<()> {
    let rt = CpuRuntime::handle();
    let mut g = Graph::new(rt.clone());
    let a = g.add_tensor(vec![2, 3], DataType::Float32);
    let b = g.add_tensor(vec![3, 4], DataType::Float32);
    let mm = g.add_matmul(a, b, false, false)?;
    g.add_unary(UnaryOp::Relu, g.output_of(mm).unwrap())?;
    g.check_valid()?;

    let shared = g.tensor(a).unwrap().detached();
    let mut dup = Graph::new(rt);
    let first = dup.adopt_tensor(shared.clone())?;
    let second = dup.adopt_tensor(shared)?;
    dup.add_elementwise(opgraph_ir::BinaryOp::Add, first, second)?;

    match dup.check_valid() {
        Err(GraphError::DuplicateIdentity { first: f, second: s, .. }) => {
            assert_eq!((f, s), (first, second));
        }
        other => panic!("expected a duplicate fuid, got {:?}", other),
    }
    Ok(())
}

#[test]
fn test_matmul_shape_cases() -> anyhow::Result<()> {
    let mut g = Graph::new(CpuRuntime::handle());
    let mut case = |a: Vec<usize>, b: Vec<usize>, ta: bool| -> anyhow::Result<TensorId> {
        let a = g.add_tensor(a, DataType::Float32);
        let b = g.add_tensor(b, DataType::Float32);
        let c = g.add_tensor(vec![1], DataType::Float32);
        g.add_operator_and_connect(Operator::new(
            OpKind::MatMul(MatMul::new(ta, false)),
            vec![a, b],
            vec![c],
        ))?;
        Ok(c)
    };
    let batched = case(vec![2, 3, 4], vec![2, 4, 5], false)?;
    let transposed = case(vec![4, 3], vec![4, 5], true)?;
    let broadcast = case(vec![2, 3, 4], vec![4, 5], false)?;

    g.shape_infer()?;
    assert_eq!(g.tensor(batched).unwrap().shape(), &[2, 3, 5]);
    assert_eq!(g.tensor(transposed).unwrap().shape(), &[3, 5]);
    assert_eq!(g.tensor(broadcast).unwrap().shape(), &[2, 3, 5]);
    Ok(())
}

#[test]
fn test_data_malloc_binds_every_tensor_once() -> anyhow::Result<()> {
    let mut g = Graph::new(CpuRuntime::handle());
    let a = g.add_tensor(vec![2, 3], DataType::Float32);
    let b = g.add_tensor(vec![3, 4], DataType::Float64);
    let flags = g.add_tensor(vec![7], DataType::Bool);
    let tr = g.add_transpose(a, vec![1, 0])?;
    g.add_unary(UnaryOp::Identity, g.output_of(tr).unwrap())?;
    let tb = g.add_transpose(b, vec![1, 0])?;
    g.add_unary(UnaryOp::Neg, g.output_of(tb).unwrap())?;
    g.add_unary(UnaryOp::Abs, flags)?;

    g.optimize()?;
    g.shape_infer()?;

    let expected: Vec<usize> = g.tensors().filter_map(|t| t.bytes()).collect();
    assert_eq!(expected.len(), g.num_tensors());
    let mut alloc = RecordingAllocator::new();
    let plan = g.data_malloc(&mut alloc)?.clone();

    assert_eq!(alloc.requests, expected);
    assert_eq!(alloc.info_calls.get(), 1);
    assert_eq!(plan.allocations.len(), g.num_tensors());
    assert!(plan.overlapping_pairs().is_empty());
    for tensor in g.tensors() {
        let blob = tensor.storage().expect("bound");
        assert!(!blob.as_ptr().is_null());
        assert_eq!(Some(plan.find(tensor.guid()).unwrap().bytes), tensor.bytes());
    }
    assert_eq!(g.phase(), GraphPhase::Allocated);

    // Bound graphs refuse rewrites, a second bind is a no-op.
    assert!(matches!(g.optimize(), Err(GraphError::InvalidPhase { .. })));
    assert_eq!(g.data_malloc(&mut alloc)?.total_bytes, plan.total_bytes);
    assert_eq!(alloc.requests.len(), expected.len());
    Ok(())
}

#[test]
fn test_validation_after_each_phase() -> anyhow::Result<()> {
    let config = GraphConfig::default().with_validation(true);
    let mut g = Graph::with_config(CpuRuntime::handle(), config);
    let x = g.add_tensor(vec![3, 5], DataType::Float32);
    g.add_tensor(vec![1], DataType::Float32);
    g.add_unary(UnaryOp::Relu, x)?;

    assert!(matches!(
        g.topo_sort(),
        Err(GraphError::IsolatedTensor { .. })
    ));
    Ok(())
}
