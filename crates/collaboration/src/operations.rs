/// Replicated operations
/// A local edit travels to the container service as an encoded `Operation`
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;

use crate::{CollaborationError, LamportClock, Result, UserId};

/// Unique operation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub uuid::Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Command that can be replicated across clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Operation<C> {
    /// Unique operation ID
    pub id: OperationId,

    /// Client that produced this operation
    pub client_id: UserId,

    /// Lamport timestamp for causality
    pub clock: LamportClock,

    /// Timestamp when operation was created (client time)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// The command as applied by the producing client
    pub command: C,
}

impl<C> Operation<C> {
    pub fn new(client_id: UserId, clock: LamportClock, command: C) -> Self {
        Self {
            id: OperationId::new(),
            client_id,
            clock,
            timestamp: chrono::Utc::now(),
            command,
        }
    }
}

impl<C: Serialize + DeserializeOwned> Operation<C> {
    /// Wire encoding used between containers and the service
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| CollaborationError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| CollaborationError::SerializationError(e.to_string()))
    }
}

/// Ordered log of the operations a container has accepted
#[derive(Debug, Clone)]
pub struct OperationLog<C> {
    /// All operations in arrival order
    pub operations: Vec<Operation<C>>,

    /// Index by operation ID for fast lookup
    operation_index: HashMap<OperationId, usize>,
}

impl<C> OperationLog<C> {
    pub fn new() -> Self {
        Self {
            operations: Vec::new(),
            operation_index: HashMap::new(),
        }
    }

    /// Add an operation to the log. Returns false if it was already there.
    pub fn add_operation(&mut self, op: Operation<C>) -> bool {
        if self.operation_index.contains_key(&op.id) {
            return false;
        }
        let id = op.id;
        self.operations.push(op);
        self.operation_index.insert(id, self.operations.len() - 1);
        true
    }

    /// Operations at or after position `from`
    pub fn since(&self, from: usize) -> &[Operation<C>] {
        self.operations.get(from..).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl<C> Default for OperationLog<C> {
    fn default() -> Self {
        Self::new()
    }
}
