/// Collaborative editing layer for the brainstorm board
/// Shared tree replicas, undo/redo, session presence and container lifecycle
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use board::{
    Board, BoardCommand, BoardError, Group, GroupItem, Item, ItemRef, ListId, NodeId, NodeKind,
    NodeStatus, Note, UserId,
};

mod events;
pub use events::*;

mod operations;
pub use operations::*;

mod tree;
pub use tree::*;

pub mod mutations;

mod undo;
pub use undo::*;

mod presence;
pub use presence::*;

mod audience;
pub use audience::*;

mod container;
pub use container::*;

mod client;
pub use client::*;

mod binder;
pub use binder::*;

#[derive(Debug, Error)]
pub enum CollaborationError {
    #[error("sync error: {0}")]
    SyncError(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("container not found: {0}")]
    ContainerNotFound(ContainerId),

    #[error("container already exists: {0}")]
    ContainerExists(ContainerId),

    #[error("invalid operation: {0}")]
    InvalidOp(String),

    #[error("board error: {0}")]
    Board(#[from] BoardError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

/// Identifier of a hosted container. An empty string means "create new".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lamport timestamp for causality tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LamportClock(pub u64);

impl LamportClock {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn tick(&mut self) {
        self.0 += 1;
    }

    pub fn update(&mut self, other: LamportClock) {
        self.0 = self.0.max(other.0) + 1;
    }
}

impl Default for LamportClock {
    fn default() -> Self {
        Self::new()
    }
}
