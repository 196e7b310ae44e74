//! Compile-time plumbing around an [`opgraph_ir::Graph`].
//!
//! - [`ArenaAllocator`]: the default [`opgraph_ir::Allocator`], a growable
//!   arena with best-fit reuse of freed ranges.
//! - [`logging`]: installs a `tracing-subscriber` for the events the graph
//!   passes emit.
//! - [`Session`]: owns a graph and its arena and runs the whole pipeline in
//!   one call.
//!
//! ```rust
//! use opgraph_ir::{CpuRuntime, DataType};
//! use opgraph_runtime::{Session, SessionConfig};
//!
//! let mut session = Session::new(CpuRuntime::handle(), SessionConfig::default()).unwrap();
//! let g = session.graph_mut();
//! let a = g.add_tensor(vec![2, 3], DataType::Float32);
//! let b = g.add_tensor(vec![3, 4], DataType::Float32);
//! g.add_matmul(a, b, false, false).unwrap();
//!
//! let report = session.compile().unwrap();
//! assert_eq!(report.memory.allocations.len(), 3);
//! ```

pub mod arena;
mod error;
pub mod logging;
pub mod session;

pub use arena::{ArenaAllocator, ArenaConfig, ArenaStats};
pub use error::{SessionError, SessionResult};
pub use logging::{init_logging, LogFormat, LogLevel, LoggingConfig};
pub use session::{CompileReport, Session, SessionConfig};
