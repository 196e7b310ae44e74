//! Binding tensors to allocator-backed storage.

use std::ptr::NonNull;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{AllocError, GraphError};
use crate::graph::{Graph, GraphPhase};
use crate::runtime::RuntimeHandle;
use crate::tensor::TensorId;

/// A linear arena handing out byte ranges as offsets.
///
/// Offsets are only turned into addresses once every range is requested:
/// [`Allocator::base_ptr`] yields the arena start, after which the arena is
/// free to refuse further allocations.
pub trait Allocator {
    /// Reserves `bytes` bytes and returns the offset of the range.
    fn alloc(&mut self, bytes: usize) -> Result<usize, AllocError>;

    /// Returns a range obtained from [`Allocator::alloc`].
    fn free(&mut self, offset: usize, bytes: usize) -> Result<(), AllocError>;

    /// Start of the arena.
    fn base_ptr(&mut self) -> Result<NonNull<u8>, AllocError>;

    /// Emits a diagnostic summary of the arena.
    fn info(&self);
}

/// Storage handle of a bound tensor: its runtime plus an address inside the
/// runtime's arena.
#[derive(Clone, Debug)]
pub struct Blob {
    runtime: RuntimeHandle,
    base: NonNull<u8>,
    offset: usize,
}

impl Blob {
    pub fn new(runtime: RuntimeHandle, base: NonNull<u8>, offset: usize) -> Self {
        Blob {
            runtime,
            base,
            offset,
        }
    }

    pub fn runtime(&self) -> &RuntimeHandle {
        &self.runtime
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Address of the first byte. Never null for a live arena; dereferencing
    /// is the caller's concern.
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr().wrapping_add(self.offset)
    }
}

/// One tensor's byte range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TensorAllocation {
    pub tensor: TensorId,
    pub fuid: usize,
    pub offset: usize,
    pub bytes: usize,
}

impl TensorAllocation {
    pub fn end(&self) -> usize {
        self.offset + self.bytes
    }
}

/// Ranges handed out by the last [`Graph::data_malloc`], in tensor order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryPlan {
    pub allocations: Vec<TensorAllocation>,
    /// Sum of all requested sizes.
    pub total_bytes: usize,
}

impl MemoryPlan {
    pub fn find(&self, tensor: TensorId) -> Option<&TensorAllocation> {
        self.allocations.iter().find(|a| a.tensor == tensor)
    }

    /// Pairs of tensors whose non-empty ranges intersect.
    pub fn overlapping_pairs(&self) -> Vec<(TensorId, TensorId)> {
        let mut ranges: Vec<&TensorAllocation> =
            self.allocations.iter().filter(|a| a.bytes > 0).collect();
        ranges.sort_by_key(|a| (a.offset, a.bytes));

        let mut pairs = Vec::new();
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                if b.offset >= a.end() {
                    break;
                }
                pairs.push((a.tensor, b.tensor));
            }
        }
        pairs
    }
}

fn release(allocator: &mut dyn Allocator, allocations: &[TensorAllocation]) {
    for a in allocations.iter().rev() {
        if let Err(e) = allocator.free(a.offset, a.bytes) {
            warn!(tensor = %a.tensor, error = %e, "failed to release range after aborted binding");
        }
    }
}

impl Graph {
    /// Binds every tensor to its own range of `allocator`.
    ///
    /// Each tensor requests exactly its byte size once; only after all
    /// requests succeed is the arena base fetched and every tensor bound.
    /// On failure the ranges obtained so far are returned to the allocator
    /// and no tensor is bound. Calling this again on an allocated graph
    /// returns the existing plan.
    pub fn data_malloc(&mut self, allocator: &mut dyn Allocator) -> Result<&MemoryPlan, GraphError> {
        self.topo_sort()?;
        if self.phase == GraphPhase::Allocated && self.memory_plan.is_some() {
            return self.memory_plan.as_ref().ok_or(GraphError::InvalidPhase {
                operation: "data_malloc",
                current: self.phase,
                required: "a memory plan",
            });
        }
        if self.phase != GraphPhase::ShapeResolved {
            return Err(GraphError::InvalidPhase {
                operation: "data_malloc",
                current: self.phase,
                required: "resolved shapes",
            });
        }

        let mut requests = Vec::with_capacity(self.tensors.len());
        for (&id, tensor) in &self.tensors {
            let bytes = tensor.bytes().ok_or_else(|| GraphError::SizeOverflow {
                tensor: id,
                shape: tensor.shape.clone(),
            })?;
            requests.push((id, tensor.fuid, bytes));
        }
        // Bindings from an earlier plan point into memory the allocator may
        // have reclaimed.
        self.clear_storage();

        let mut plan = MemoryPlan::default();
        for (tensor, fuid, bytes) in requests {
            match allocator.alloc(bytes) {
                Ok(offset) => {
                    plan.total_bytes = plan.total_bytes.saturating_add(bytes);
                    plan.allocations.push(TensorAllocation {
                        tensor,
                        fuid,
                        offset,
                        bytes,
                    });
                }
                Err(e) => {
                    release(allocator, &plan.allocations);
                    return Err(e.into());
                }
            }
        }

        let base = match allocator.base_ptr() {
            Ok(base) => base,
            Err(e) => {
                release(allocator, &plan.allocations);
                return Err(e.into());
            }
        };
        for a in &plan.allocations {
            if let Some(tensor) = self.tensors.get_mut(&a.tensor) {
                tensor.set_storage(Blob::new(self.runtime.clone(), base, a.offset));
            }
        }
        allocator.info();

        self.phase = GraphPhase::Allocated;
        info!(
            tensors = plan.allocations.len(),
            total_bytes = plan.total_bytes,
            "tensors bound to storage"
        );
        self.validate_if_configured()?;
        let plan: &MemoryPlan = self.memory_plan.insert(plan);
        Ok(plan)
    }
}
