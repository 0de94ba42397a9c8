/// Undo/redo history built from the revertible edits of one tree
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

use crate::{Document, RevertResult, Revertible, RevertibleKind, SharedTree, Subscription};

struct Stacks<C> {
    undo: Vec<Revertible<C>>,
    redo: Vec<Revertible<C>>,
}

impl<C> Stacks<C> {
    fn record(&mut self, revertible: Revertible<C>) {
        match revertible.kind() {
            RevertibleKind::Undo => self.redo.push(revertible),
            RevertibleKind::Default => {
                // a fresh edit invalidates everything that could be redone
                for stale in self.redo.drain(..) {
                    stale.discard();
                }
                self.undo.push(revertible);
            }
            RevertibleKind::Redo => self.undo.push(revertible),
        }
    }
}

/// Local undo and redo stacks for a tree. Only edits made through this
/// client's tree are recorded; remote edits never show up here.
pub struct UndoRedoStacks<C> {
    stacks: Arc<Mutex<Stacks<C>>>,
    _subscription: Subscription,
}

impl<C: Clone + Send + 'static> UndoRedoStacks<C> {
    pub fn attach<D>(tree: &SharedTree<D>) -> Self
    where
        D: Document<Command = C>,
    {
        let stacks = Arc::new(Mutex::new(Stacks {
            undo: Vec::new(),
            redo: Vec::new(),
        }));
        let recorder = Arc::clone(&stacks);
        let subscription = tree.on_revertible(move |revertible| {
            recorder.lock().record(revertible.clone());
        });
        Self {
            stacks,
            _subscription: subscription,
        }
    }

    /// Reverts the most recent edit. Returns `None` when there is nothing
    /// to undo.
    pub fn undo<D>(&self, tree: &mut SharedTree<D>) -> Option<RevertResult>
    where
        D: Document<Command = C>,
    {
        let revertible = self.stacks.lock().undo.pop()?;
        let result = revertible.revert(tree);
        if result == RevertResult::Failure {
            warn!("undo could not be applied, dropping it");
        }
        Some(result)
    }

    pub fn redo<D>(&self, tree: &mut SharedTree<D>) -> Option<RevertResult>
    where
        D: Document<Command = C>,
    {
        let revertible = self.stacks.lock().redo.pop()?;
        let result = revertible.revert(tree);
        if result == RevertResult::Failure {
            warn!("redo could not be applied, dropping it");
        }
        Some(result)
    }

    pub fn can_undo(&self) -> bool {
        !self.stacks.lock().undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.stacks.lock().redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.stacks.lock().undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.stacks.lock().redo.len()
    }

    /// Drops all history.
    pub fn reset(&self) {
        let mut stacks = self.stacks.lock();
        stacks.undo.clear();
        stacks.redo.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutations::{add_note, delete_note, update_note_text};
    use board::{Board, ListId, UserId};

    #[test]
    fn test_new_edit_after_undo_clears_redo() {
        let mut tree = SharedTree::<Board>::new(UserId::new());
        let stacks = UndoRedoStacks::attach(&tree);
        let author = tree.client_id();

        let e1 = add_note(&mut tree, ListId::Items, "e1", author).unwrap();
        let e2 = add_note(&mut tree, ListId::Items, "e2", author).unwrap();
        assert_eq!(stacks.undo(&mut tree), Some(RevertResult::Success));
        assert_eq!(tree.root().items(), &[e1]);
        assert_eq!(stacks.redo_len(), 1);

        let e3 = add_note(&mut tree, ListId::Items, "e3", author).unwrap();
        assert!(!stacks.can_redo());
        assert_eq!(stacks.undo_len(), 2);

        // the top of the undo stack is e3
        stacks.undo(&mut tree);
        assert_eq!(tree.root().items(), &[e1]);
        assert!(tree.root().note(e2).is_none());
        assert!(tree.root().note(e3).is_none());
    }

    #[test]
    fn test_undo_redo_round_trip() {
        let mut tree = SharedTree::<Board>::new(UserId::new());
        let stacks = UndoRedoStacks::attach(&tree);
        let author = tree.client_id();

        let id = add_note(&mut tree, ListId::Items, "draft", author).unwrap();
        update_note_text(&mut tree, id, "final");

        stacks.undo(&mut tree);
        assert_eq!(tree.root().note(id).unwrap().text, "draft");
        stacks.undo(&mut tree);
        assert!(tree.root().note(id).is_none());
        assert_eq!(stacks.undo(&mut tree), None);

        stacks.redo(&mut tree);
        stacks.redo(&mut tree);
        assert_eq!(tree.root().note(id).unwrap().text, "final");
        assert_eq!(stacks.redo(&mut tree), None);
        assert_eq!(stacks.undo_len(), 2);
    }

    #[test]
    fn test_redo_keeps_remaining_redo_entries() {
        let mut tree = SharedTree::<Board>::new(UserId::new());
        let stacks = UndoRedoStacks::attach(&tree);
        let author = tree.client_id();
        add_note(&mut tree, ListId::Items, "a", author);
        add_note(&mut tree, ListId::Items, "b", author);

        stacks.undo(&mut tree);
        stacks.undo(&mut tree);
        assert_eq!(stacks.redo_len(), 2);
        stacks.redo(&mut tree);
        assert_eq!(stacks.redo_len(), 1);
        assert_eq!(stacks.undo_len(), 1);
    }

    #[test]
    fn test_failed_undo_is_not_repushed() {
        let mut alice = SharedTree::<Board>::new(UserId::new());
        let mut bob = SharedTree::<Board>::new(UserId::new());
        let stacks = UndoRedoStacks::attach(&alice);
        let author = alice.client_id();

        let id = add_note(&mut alice, ListId::Items, "a", author).unwrap();
        for op in alice.take_unsent() {
            bob.apply_sequenced(op.clone());
            alice.apply_sequenced(op);
        }
        delete_note(&mut bob, id);
        for op in bob.take_unsent() {
            alice.apply_sequenced(op.clone());
            bob.apply_sequenced(op);
        }
        assert_eq!(stacks.undo_len(), 1);

        assert_eq!(stacks.undo(&mut alice), Some(RevertResult::Failure));
        assert!(!stacks.can_undo());
        assert!(!stacks.can_redo());
    }

    #[test]
    fn test_reset_empties_both_stacks() {
        let mut tree = SharedTree::<Board>::new(UserId::new());
        let stacks = UndoRedoStacks::attach(&tree);
        let author = tree.client_id();
        add_note(&mut tree, ListId::Items, "a", author);
        add_note(&mut tree, ListId::Items, "b", author);
        stacks.undo(&mut tree);

        stacks.reset();
        assert_eq!((stacks.undo_len(), stacks.redo_len()), (0, 0));
    }
}
