//! Error types for compile sessions.

use opgraph_ir::{AllocError, GraphError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("arena error: {0}")]
    Alloc(#[from] AllocError),

    #[error("failed to initialize logging: {0}")]
    Logging(String),

    #[error("invalid session configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;
