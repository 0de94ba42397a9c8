/// Shared tree replica
/// Applies local commands optimistically, queues them for the service and
/// reconciles them with the order the service assigns
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

use board::{apply_command, Board, BoardCommand, BoardError, Item, ListId, NodeId, NodeStatus};

use crate::{
    CollaborationError, EventEmitter, LamportClock, Operation, OperationId, Result, Subscription,
    UserId,
};

/// A document that can be hosted in a `SharedTree`.
pub trait Document: Clone + Default + Send + 'static {
    type Command: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;
    type Error: fmt::Display + Into<CollaborationError>;

    /// Applies `command` and returns the command that reverts it.
    fn apply(&mut self, command: Self::Command) -> std::result::Result<Self::Command, Self::Error>;

    /// Updates any edit timestamps carried by `command`.
    fn stamp(_command: &mut Self::Command, _at: DateTime<Utc>) {}
}

impl Document for Board {
    type Command = BoardCommand;
    type Error = BoardError;

    fn apply(&mut self, command: BoardCommand) -> std::result::Result<BoardCommand, BoardError> {
        apply_command(self, command)
    }

    fn stamp(command: &mut BoardCommand, at: DateTime<Utc>) {
        command.stamp(at);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// Emitted after every applied edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeChanged {
    pub origin: Origin,
    /// Client that produced the edit
    pub client_id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertibleKind {
    /// An ordinary local edit
    Default,
    /// Produced by reverting a `Default` or `Redo` record
    Undo,
    /// Produced by reverting an `Undo` record
    Redo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertResult {
    Success,
    Failure,
}

/// Handle to a local edit that can be reverted once.
#[derive(Debug, Clone)]
pub struct Revertible<C> {
    kind: RevertibleKind,
    inverse: C,
}

impl<C> Revertible<C> {
    pub fn kind(&self) -> RevertibleKind {
        self.kind
    }

    /// Gives up the ability to revert this edit.
    pub fn discard(self) {}

    /// Submits the inverse edit to `tree` as a new local edit. The tree
    /// reports it as an `Undo` record (or `Redo` when reverting an undo).
    pub fn revert<D>(self, tree: &mut SharedTree<D>) -> RevertResult
    where
        D: Document<Command = C>,
    {
        let kind = match self.kind {
            RevertibleKind::Default | RevertibleKind::Redo => RevertibleKind::Undo,
            RevertibleKind::Undo => RevertibleKind::Redo,
        };
        match tree.submit_as(kind, self.inverse) {
            Ok(()) => RevertResult::Success,
            Err(err) => {
                debug!("revert of {:?} edit failed: {}", self.kind, err);
                RevertResult::Failure
            }
        }
    }
}

/// A local edit the service has not sequenced yet
#[derive(Debug, Clone)]
struct LocalEdit<C> {
    op: Operation<C>,
    sent: bool,
    /// Whether the edit took effect the last time it was replayed
    applied: bool,
}

/// One client's replica of a shared document.
///
/// The service decides the order of all edits. `confirmed` holds every
/// sequenced operation applied in that order; `root` is `confirmed` with the
/// local edits the service has not acknowledged yet replayed on top. When a
/// remote operation arrives ahead of those edits, `root` is rebuilt, so every
/// replica ends up with the same document once its edits are acknowledged.
pub struct SharedTree<D: Document> {
    client_id: UserId,
    confirmed: D,
    root: D,
    clock: LamportClock,
    seen: HashSet<OperationId>,
    local: Vec<LocalEdit<D::Command>>,
    changes: EventEmitter<TreeChanged>,
    revertibles: EventEmitter<Revertible<D::Command>>,
}

impl<D: Document> SharedTree<D> {
    pub fn new(client_id: UserId) -> Self {
        Self {
            client_id,
            confirmed: D::default(),
            root: D::default(),
            clock: LamportClock::new(),
            seen: HashSet::new(),
            local: Vec::new(),
            changes: EventEmitter::new(),
            revertibles: EventEmitter::new(),
        }
    }

    pub fn client_id(&self) -> UserId {
        self.client_id
    }

    pub fn root(&self) -> &D {
        &self.root
    }

    pub fn clock(&self) -> LamportClock {
        self.clock
    }

    /// Applies a local edit, queues it for the service and reports it as a
    /// `Default` revertible.
    pub fn submit(&mut self, command: D::Command) -> Result<()> {
        self.submit_as(RevertibleKind::Default, command)
    }

    pub(crate) fn submit_as(
        &mut self,
        kind: RevertibleKind,
        mut command: D::Command,
    ) -> Result<()> {
        D::stamp(&mut command, Utc::now());
        let inverse = self
            .root
            .apply(command.clone())
            .map_err(Into::<CollaborationError>::into)?;

        self.clock.tick();
        let op = Operation::new(self.client_id, self.clock, command);
        self.seen.insert(op.id);
        self.local.push(LocalEdit {
            op,
            sent: false,
            applied: true,
        });

        self.changes.emit(&TreeChanged {
            origin: Origin::Local,
            client_id: self.client_id,
        });
        self.revertibles.emit(&Revertible { kind, inverse });
        Ok(())
    }

    /// Applies an operation in the order the service sequenced it. Echoes of
    /// this client's own edits acknowledge them; remote operations are
    /// applied beneath any unacknowledged local edits. Duplicates are
    /// skipped and operations that no longer apply are dropped.
    /// Returns whether the operation took effect.
    pub fn apply_sequenced(&mut self, op: Operation<D::Command>) -> bool {
        self.clock.update(op.clock);

        if let Some(position) = self.local.iter().position(|edit| edit.op.id == op.id) {
            let edit = self.local.remove(position);
            let applied = self.confirm(op);
            if position > 0 || applied != edit.applied {
                self.rebuild();
                self.changes.emit(&TreeChanged {
                    origin: Origin::Remote,
                    client_id: self.client_id,
                });
            }
            return applied;
        }

        if !self.seen.insert(op.id) {
            return false;
        }
        let client_id = op.client_id;
        if self.local.is_empty() {
            let command = op.command.clone();
            if !self.confirm(op) {
                return false;
            }
            if self.root.apply(command).is_err() {
                self.root = self.confirmed.clone();
            }
        } else {
            if !self.confirm(op) {
                return false;
            }
            self.rebuild();
        }

        self.changes.emit(&TreeChanged {
            origin: Origin::Remote,
            client_id,
        });
        true
    }

    fn confirm(&mut self, op: Operation<D::Command>) -> bool {
        match self.confirmed.apply(op.command) {
            Ok(_) => true,
            Err(err) => {
                debug!(
                    "dropping stale operation {:?} from {}: {}",
                    op.id, op.client_id, err
                );
                false
            }
        }
    }

    /// Replays the unacknowledged local edits on a copy of `confirmed`.
    /// Unsent edits that no longer apply are dropped; sent ones wait for the
    /// service, which may still sequence them somewhere they apply.
    fn rebuild(&mut self) {
        let mut root = self.confirmed.clone();
        self.local.retain_mut(|edit| {
            edit.applied = root.apply(edit.op.command.clone()).is_ok();
            if !edit.applied && !edit.sent {
                debug!("local edit {:?} no longer applies", edit.op.id);
                return false;
            }
            true
        });
        self.root = root;
    }

    /// Local operations not yet handed to the service, oldest first
    pub fn unsent(&self) -> Vec<Operation<D::Command>> {
        self.local
            .iter()
            .filter(|edit| !edit.sent)
            .map(|edit| edit.op.clone())
            .collect()
    }

    pub fn mark_sent(&mut self, id: OperationId) {
        if let Some(edit) = self.local.iter_mut().find(|edit| edit.op.id == id) {
            edit.sent = true;
        }
    }

    /// Whether local edits exist that the service has not acknowledged
    pub fn has_pending(&self) -> bool {
        !self.local.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn take_unsent(&mut self) -> Vec<Operation<D::Command>> {
        let ops = self.unsent();
        for op in &ops {
            self.mark_sent(op.id);
        }
        ops
    }

    pub fn on_change<F>(&self, listener: F) -> Subscription
    where
        F: FnMut(&TreeChanged) + Send + 'static,
    {
        self.changes.subscribe(listener)
    }

    pub fn on_revertible<F>(&self, listener: F) -> Subscription
    where
        F: FnMut(&Revertible<D::Command>) + Send + 'static,
    {
        self.revertibles.subscribe(listener)
    }
}

impl SharedTree<Board> {
    pub fn status(&self, id: NodeId) -> NodeStatus {
        self.root.status(id)
    }

    pub fn list_status(&self, list: ListId) -> NodeStatus {
        self.root.list_status(list)
    }

    pub fn parent(&self, id: NodeId) -> Option<ListId> {
        self.root.parent(id)
    }

    pub fn insert_at(&mut self, list: ListId, index: usize, items: Vec<Item>) -> Result<()> {
        self.submit(BoardCommand::InsertItems { list, index, items })
    }

    pub fn insert_at_end(&mut self, list: ListId, items: Vec<Item>) -> Result<()> {
        self.insert_at(list, usize::MAX, items)
    }

    pub fn remove_at(&mut self, list: ListId, index: usize) -> Result<()> {
        let id = self
            .root
            .list(list)
            .ok_or(BoardError::ListNotFound(list))?
            .get(index)
            .copied()
            .ok_or_else(|| {
                CollaborationError::InvalidOp(format!("no item at {} in {}", index, list))
            })?;
        self.submit(BoardCommand::RemoveItem { id })
    }

    /// Moves `source[start..end]` to the gap `index` of `destination`, where
    /// `index` is measured before the move.
    pub fn move_range_to_index(
        &mut self,
        destination: ListId,
        index: usize,
        source: ListId,
        start: usize,
        end: usize,
    ) -> Result<()> {
        let ids = self
            .root
            .list(source)
            .ok_or(BoardError::ListNotFound(source))?
            .get(start..end)
            .ok_or_else(|| {
                CollaborationError::InvalidOp(format!(
                    "range {}..{} out of bounds in {}",
                    start, end, source
                ))
            })?
            .to_vec();
        if ids.is_empty() {
            return Ok(());
        }
        self.submit(BoardCommand::MoveItems {
            ids,
            destination,
            index,
        })
    }
}
