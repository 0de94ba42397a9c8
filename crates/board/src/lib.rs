//! Shared brainstorm board: the ordered Board -> Group | Note tree and the
//! reversible commands that edit it.
use thiserror::Error;

mod model;
pub use model::*;
mod commands;
pub use commands::*;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BoardError {
    #[error("invalid operation: {0}")]
    InvalidOp(String),
    #[error("node already exists: {0}")]
    NodeExists(NodeId),
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("list not found: {0}")]
    ListNotFound(ListId),
    #[error("schema violation: {0}")]
    SchemaViolation(String),
}
