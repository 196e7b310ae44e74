//! Tensors: the typed, shaped edges of a computation graph.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::memory::Blob;
use crate::ops::OpId;
use crate::runtime::RuntimeHandle;

/// Ordered extents of a tensor, outermost axis first.
pub type Shape = Vec<usize>;

/// Functional ids are process-wide so that a tensor keeps a unique identity
/// when it is adopted by another graph.
static NEXT_FUID: AtomicUsize = AtomicUsize::new(1);

fn next_fuid() -> usize {
    NEXT_FUID.fetch_add(1, Ordering::Relaxed)
}

/// Creation-order id of a tensor within its graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(pub(crate) usize);

impl TensorId {
    pub fn guid(self) -> usize {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Element data types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Float16,
    BFloat16,
    Float64,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Bool,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size_of(self) -> usize {
        match self {
            DataType::Bool | DataType::Int8 | DataType::UInt8 => 1,
            DataType::Float16 | DataType::BFloat16 | DataType::Int16 | DataType::UInt16 => 2,
            DataType::Float32 | DataType::Int32 | DataType::UInt32 => 4,
            DataType::Float64 | DataType::Int64 | DataType::UInt64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::Float32 => "Float32",
            DataType::Float16 => "Float16",
            DataType::BFloat16 => "BFloat16",
            DataType::Float64 => "Float64",
            DataType::Int8 => "Int8",
            DataType::Int16 => "Int16",
            DataType::Int32 => "Int32",
            DataType::Int64 => "Int64",
            DataType::UInt8 => "UInt8",
            DataType::UInt16 => "UInt16",
            DataType::UInt32 => "UInt32",
            DataType::UInt64 => "UInt64",
            DataType::Bool => "Bool",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A tensor owned by a [`Graph`](crate::Graph).
///
/// The producing operator (`source`) and the consuming operators (`targets`)
/// are stored as ids and resolved through the owning graph.
#[derive(Clone, Debug)]
pub struct Tensor {
    pub(crate) guid: TensorId,
    pub(crate) fuid: usize,
    pub(crate) shape: Shape,
    pub(crate) dtype: DataType,
    pub(crate) runtime: RuntimeHandle,
    pub(crate) source: Option<OpId>,
    pub(crate) targets: IndexSet<OpId>,
    pub(crate) storage: Option<Blob>,
}

impl Tensor {
    pub(crate) fn new(guid: TensorId, shape: Shape, dtype: DataType, runtime: RuntimeHandle) -> Self {
        Tensor {
            guid,
            fuid: next_fuid(),
            shape,
            dtype,
            runtime,
            source: None,
            targets: IndexSet::new(),
            storage: None,
        }
    }

    pub fn guid(&self) -> TensorId {
        self.guid
    }

    /// Functional id; survives rewrites and adoption into another graph.
    pub fn fuid(&self) -> usize {
        self.fuid
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn runtime(&self) -> &RuntimeHandle {
        &self.runtime
    }

    /// Number of elements; a rank-0 tensor holds one element. `None` when
    /// the count does not fit in `usize`.
    pub fn element_count(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |acc, &extent| acc.checked_mul(extent))
    }

    /// Size of the tensor's data in bytes, `None` on overflow.
    pub fn bytes(&self) -> Option<usize> {
        self.element_count()?.checked_mul(self.dtype.size_of())
    }

    pub fn source(&self) -> Option<OpId> {
        self.source
    }

    pub fn targets(&self) -> &IndexSet<OpId> {
        &self.targets
    }

    pub fn storage(&self) -> Option<&Blob> {
        self.storage.as_ref()
    }

    pub fn has_storage(&self) -> bool {
        self.storage.is_some()
    }

    /// Copy of this tensor with its wiring and storage stripped, ready to be
    /// adopted by another graph on the same runtime. The fuid is kept.
    pub fn detached(&self) -> Tensor {
        Tensor {
            source: None,
            targets: IndexSet::new(),
            storage: None,
            ..self.clone()
        }
    }

    pub(crate) fn set_shape(&mut self, shape: Shape) {
        self.shape = shape;
    }

    pub(crate) fn set_source(&mut self, op: Option<OpId>) {
        self.source = op;
    }

    pub(crate) fn add_target(&mut self, op: OpId) {
        self.targets.insert(op);
    }

    pub(crate) fn remove_target(&mut self, op: OpId) {
        self.targets.shift_remove(&op);
    }

    pub(crate) fn set_storage(&mut self, blob: Blob) {
        self.storage = Some(blob);
    }

    pub(crate) fn clear_storage(&mut self) {
        self.storage = None;
    }
}
