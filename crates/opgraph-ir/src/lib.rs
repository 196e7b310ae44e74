//! # opgraph IR
//!
//! A tensor computation graph: tensors connected by operators, with the
//! passes that turn a freshly built graph into one that is ready to run.
//!
//! ## Overview
//!
//! A [`Graph`] owns its [`Tensor`]s and [`Operator`]s. Nodes refer to each
//! other through [`TensorId`] and [`OpId`]; every tensor knows its producing
//! operator (source) and its consumers (targets), and every operator knows
//! its predecessor and successor operators. Wiring is kept symmetric by the
//! graph itself.
//!
//! A graph moves through a fixed pipeline, tracked by [`GraphPhase`]:
//!
//! 1. **build**: [`Graph::add_tensor`], [`Graph::add_op`] and the typed
//!    wrappers, or [`Graph::add_operator_and_connect`] for pre-built
//!    operators. Any mutation puts the graph back into `Building`.
//! 2. **sort**: [`Graph::topo_sort`] orders operators so that producers come
//!    before consumers.
//! 3. **optimize**: [`Graph::optimize`] cancels adjacent identical two-axis
//!    transposes and folds last-two-axis transposes into MatMul flags.
//! 4. **infer**: [`Graph::shape_infer`] recomputes every output shape.
//! 5. **bind**: [`Graph::data_malloc`] gives every tensor its own byte range
//!    of an [`Allocator`].
//!
//! [`Graph::check_valid`] verifies the structural invariants at any point,
//! and `Display for Graph` prints a line-per-node dump.
//!
//! ## Quick Start
//!
//! ```rust
//! use opgraph_ir::{CpuRuntime, DataType, Graph};
//!
//! let mut graph = Graph::new(CpuRuntime::handle());
//! let a = graph.add_tensor(vec![4, 3], DataType::Float32);
//! let b = graph.add_tensor(vec![4, 5], DataType::Float32);
//!
//! // C = transpose(A) x B, with the transpose as its own operator
//! let t = graph.add_transpose(a, vec![1, 0]).unwrap();
//! let at = graph.output_of(t).unwrap();
//! let mm = graph.add_matmul(at, b, false, false).unwrap();
//!
//! let stats = graph.optimize().unwrap();
//! assert_eq!(stats.transposes_fused, 1);
//! assert!(graph.operator(mm).unwrap().kind().as_matmul().unwrap().trans_a());
//!
//! graph.shape_infer().unwrap();
//! let c = graph.output_of(mm).unwrap();
//! assert_eq!(graph.tensor(c).unwrap().shape(), &[3, 5]);
//! assert!(graph.check_valid().is_ok());
//! ```

pub mod config;
mod display;
mod error;
pub mod graph;
pub mod memory;
pub mod ops;
pub mod runtime;
mod tensor;

pub use config::{BroadcastPolicy, GraphConfig, OptimizeConfig};
pub use error::{AllocError, GraphError, NodeRef};
pub use graph::rewrite::{match_matmul_fusion, match_transpose_pair};
pub use graph::{
    Graph, GraphPhase, GraphValidationStats, OptimizeStats, Rebind, RewriteRule, Splice, Toggle,
    ValidationError, ValidationErrorKind, ValidationReport,
};
pub use memory::{Allocator, Blob, MemoryPlan, TensorAllocation};
pub use ops::{
    broadcast_shapes, BinaryOp, MatMul, MatMulOperand, OpId, OpKind, Operator, Transpose, UnaryOp,
};
pub use runtime::{same_runtime, CpuRuntime, Runtime, RuntimeHandle};
pub use tensor::{DataType, Shape, Tensor, TensorId};
