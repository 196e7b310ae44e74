//! Runtime/device handles.
//!
//! The graph treats a runtime as opaque: it attaches the handle to every
//! tensor and storage blob and compares handles by identity, nothing more.

use std::fmt;
use std::sync::Arc;

/// An execution context that owns device memory and runs kernels.
pub trait Runtime: fmt::Debug + Send + Sync {
    /// Short human-readable name, used in diagnostics.
    fn name(&self) -> &str;
}

/// Shared handle to a runtime.
pub type RuntimeHandle = Arc<dyn Runtime>;

/// Whether two handles point at the same runtime instance.
pub fn same_runtime(a: &RuntimeHandle, b: &RuntimeHandle) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Diagnostic label for a handle, `name@address`.
pub fn describe_runtime(runtime: &RuntimeHandle) -> String {
    format!("{}@{:p}", runtime.name(), Arc::as_ptr(runtime))
}

/// Host CPU runtime.
#[derive(Debug, Default)]
pub struct CpuRuntime;

impl CpuRuntime {
    /// Creates a fresh runtime instance. Every call yields a distinct runtime;
    /// clone the handle to share it between graphs.
    pub fn handle() -> RuntimeHandle {
        Arc::new(CpuRuntime)
    }
}

impl Runtime for CpuRuntime {
    fn name(&self) -> &str {
        "cpu"
    }
}
