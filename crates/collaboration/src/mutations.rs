//! Edits a client makes to the shared board.
//!
//! Every operation first checks that the nodes it touches are still in the
//! document. A drag or a click may have started before a remote delete
//! arrived; in that case the operation does nothing.

use chrono::Utc;
use tracing::{debug, warn};

use board::{
    Board, BoardCommand, GroupItem, Item, ListId, NodeId, NodeKind, NodeStatus, Note, UserId,
};

use crate::SharedTree;

/// Target position for `move_item`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Desired position of the item once the move is done
    Index(usize),
    /// After the last item
    End,
}

fn submit(tree: &mut SharedTree<Board>, command: BoardCommand, what: &str) -> bool {
    match tree.submit(command) {
        Ok(()) => true,
        Err(err) => {
            warn!("{} failed: {}", what, err);
            false
        }
    }
}

fn live_note(tree: &SharedTree<Board>, id: NodeId) -> bool {
    tree.status(id) == NodeStatus::InDocument && tree.root().note(id).is_some()
}

fn live_group(tree: &SharedTree<Board>, id: NodeId) -> bool {
    tree.status(id) == NodeStatus::InDocument && tree.root().group(id).is_some()
}

/// Appends a new note to `list`. Returns `None` if `list` is gone.
pub fn add_note(
    tree: &mut SharedTree<Board>,
    list: ListId,
    text: &str,
    author: UserId,
) -> Option<NodeId> {
    if tree.list_status(list) != NodeStatus::InDocument {
        debug!("add_note: {} is no longer in the document", list);
        return None;
    }
    let note = Note::new(text, author);
    let id = note.id;
    submit(
        tree,
        BoardCommand::InsertItems {
            list,
            index: usize::MAX,
            items: vec![Item::Note(note)],
        },
        "add_note",
    )
    .then_some(id)
}

/// Inserts a new empty group at the start of the board.
pub fn add_group(tree: &mut SharedTree<Board>, name: &str) -> NodeId {
    let group = GroupItem::new(name);
    let id = group.id;
    submit(
        tree,
        BoardCommand::InsertItems {
            list: ListId::Items,
            index: 0,
            items: vec![Item::Group(group)],
        },
        "add_group",
    );
    id
}

pub fn update_note_text(tree: &mut SharedTree<Board>, note: NodeId, text: &str) {
    if !live_note(tree, note) {
        debug!("update_note_text: note {} is gone", note);
        return;
    }
    submit(
        tree,
        BoardCommand::SetNoteText {
            note_id: note,
            text: text.to_string(),
            changed_at: Utc::now(),
        },
        "update_note_text",
    );
}

pub fn rename_group(tree: &mut SharedTree<Board>, group: NodeId, name: &str) {
    if !live_group(tree, group) {
        debug!("rename_group: group {} is gone", group);
        return;
    }
    submit(
        tree,
        BoardCommand::RenameGroup {
            group_id: group,
            name: name.to_string(),
        },
        "rename_group",
    );
}

/// Moves `item` into `destination` so that it ends up at `destination_index`.
///
/// Within one list, moving forward targets the gap after the destination
/// slot, since the item's own slot closes up before it is reinserted.
pub fn move_item(
    tree: &mut SharedTree<Board>,
    item: NodeId,
    destination_index: Destination,
    destination: ListId,
) {
    if tree.status(item) != NodeStatus::InDocument
        || tree.list_status(destination) != NodeStatus::InDocument
    {
        debug!("move_item: {} or {} is no longer in the document", item, destination);
        return;
    }
    let kind = match tree.root().get(item) {
        Some(found) => found.kind(),
        None => return,
    };
    if kind == NodeKind::Group && matches!(destination, ListId::Notes(_)) {
        debug!("move_item: group {} cannot be moved into {}", item, destination);
        return;
    }
    let (Some(source), Some(index)) = (tree.parent(item), tree.root().index_of(item)) else {
        return;
    };
    let len = tree.root().list(destination).map_or(0, |l| l.len());

    let gap = match destination_index {
        Destination::End => len,
        Destination::Index(slot) if source == destination && index < slot => (slot + 1).min(len),
        Destination::Index(slot) => slot.min(len),
    };
    if let Err(err) = tree.move_range_to_index(destination, gap, source, index, index + 1) {
        warn!("move_item failed: {}", err);
    }
}

pub fn delete_note(tree: &mut SharedTree<Board>, note: NodeId) {
    if !live_note(tree, note) {
        debug!("delete_note: note {} is gone", note);
        return;
    }
    submit(tree, BoardCommand::RemoveItem { id: note }, "delete_note");
}

/// Removes a group. Its notes move to the board at the group's position,
/// in their original order. One undo step reverts the whole thing.
pub fn delete_group(tree: &mut SharedTree<Board>, group: NodeId) {
    if !live_group(tree, group) {
        debug!("delete_group: group {} is gone", group);
        return;
    }
    let notes = tree
        .root()
        .group(group)
        .map(|g| g.notes.clone())
        .unwrap_or_default();
    let index = tree.root().index_of(group).unwrap_or(0);

    let mut commands = Vec::with_capacity(2);
    if !notes.is_empty() {
        commands.push(BoardCommand::MoveItems {
            ids: notes,
            destination: ListId::Items,
            index,
        });
    }
    commands.push(BoardCommand::RemoveItem { id: group });
    submit(tree, BoardCommand::Batch { commands }, "delete_group");
}

/// Adds `voter` to the note's votes, or removes them if already there.
pub fn toggle_vote(tree: &mut SharedTree<Board>, note: NodeId, voter: UserId) {
    if !live_note(tree, note) {
        debug!("toggle_vote: note {} is gone", note);
        return;
    }
    submit(
        tree,
        BoardCommand::ToggleVote {
            note_id: note,
            voter,
            changed_at: Utc::now(),
        },
        "toggle_vote",
    );
}

/// Creates a group at the start of the board and moves the given notes into
/// it, in order. Notes that are gone are skipped.
pub fn group_notes(tree: &mut SharedTree<Board>, name: &str, notes: &[NodeId]) -> NodeId {
    let group = GroupItem::new(name);
    let group_id = group.id;

    let mut commands = vec![BoardCommand::InsertItems {
        list: ListId::Items,
        index: 0,
        items: vec![Item::Group(group)],
    }];
    let mut moved = Vec::new();
    for id in notes {
        if live_note(tree, *id) && !moved.contains(id) {
            moved.push(*id);
            commands.push(BoardCommand::MoveItems {
                ids: vec![*id],
                destination: ListId::Notes(group_id),
                index: usize::MAX,
            });
        }
    }
    submit(tree, BoardCommand::Batch { commands }, "group_notes");
    group_id
}

/// Deletes every note in `notes` that is still in the document.
pub fn delete_notes(tree: &mut SharedTree<Board>, notes: &[NodeId]) {
    let mut commands: Vec<BoardCommand> = Vec::new();
    for id in notes {
        let command = BoardCommand::RemoveItem { id: *id };
        if live_note(tree, *id) && !commands.contains(&command) {
            commands.push(command);
        }
    }
    if commands.is_empty() {
        debug!("delete_notes: nothing left to delete");
        return;
    }
    submit(tree, BoardCommand::Batch { commands }, "delete_notes");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RevertResult, UndoRedoStacks};

    fn tree() -> SharedTree<Board> {
        SharedTree::new(UserId::new())
    }

    fn notes(tree: &mut SharedTree<Board>, texts: &[&str]) -> Vec<NodeId> {
        let author = tree.client_id();
        texts
            .iter()
            .map(|t| add_note(tree, ListId::Items, t, author).unwrap())
            .collect()
    }

    #[test]
    fn test_add_note_and_group() {
        let mut tree = tree();
        let author = tree.client_id();
        let note = add_note(&mut tree, ListId::Items, "first", author).unwrap();
        let group = add_group(&mut tree, "Ideas");

        // groups go to the start
        assert_eq!(tree.root().items(), &[group, note]);
        let stored = tree.root().note(note).unwrap();
        assert_eq!(stored.author, author);
        assert!(stored.votes.is_empty());
        assert_eq!(stored.created, stored.last_changed);

        let inner = add_note(&mut tree, ListId::Notes(group), "inside", author).unwrap();
        assert_eq!(tree.parent(inner), Some(ListId::Notes(group)));
    }

    #[test]
    fn test_add_note_to_deleted_group_is_noop() {
        let mut tree = tree();
        let group = add_group(&mut tree, "gone");
        delete_group(&mut tree, group);
        let author = tree.client_id();
        assert_eq!(add_note(&mut tree, ListId::Notes(group), "x", author), None);
        assert_eq!(tree.root().note_count(), 0);
    }

    #[test]
    fn test_toggle_vote_never_duplicates_voter() {
        let mut tree = tree();
        let ids = notes(&mut tree, &["a"]);
        let voter = UserId::new();

        toggle_vote(&mut tree, ids[0], voter);
        assert_eq!(tree.root().note(ids[0]).unwrap().votes, vec![voter]);
        toggle_vote(&mut tree, ids[0], voter);
        assert!(tree.root().note(ids[0]).unwrap().votes.is_empty());

        let other = UserId::new();
        toggle_vote(&mut tree, ids[0], voter);
        toggle_vote(&mut tree, ids[0], other);
        assert_eq!(tree.root().note(ids[0]).unwrap().votes, vec![voter, other]);
    }

    #[test]
    fn test_toggle_vote_refreshes_last_changed() {
        let mut tree = tree();
        let ids = notes(&mut tree, &["a"]);
        let before = tree.root().note(ids[0]).unwrap().last_changed;
        std::thread::sleep(std::time::Duration::from_millis(2));
        toggle_vote(&mut tree, ids[0], UserId::new());
        assert!(tree.root().note(ids[0]).unwrap().last_changed > before);
    }

    #[test]
    fn test_move_forward_within_list_lands_on_requested_slot() {
        let mut tree = tree();
        let ids = notes(&mut tree, &["A", "B", "C", "D"]);

        move_item(&mut tree, ids[0], Destination::Index(2), ListId::Items);
        assert_eq!(tree.root().items(), &[ids[1], ids[2], ids[0], ids[3]]);
    }

    #[test]
    fn test_move_backward_and_to_end() {
        let mut tree = tree();
        let ids = notes(&mut tree, &["A", "B", "C", "D"]);

        move_item(&mut tree, ids[3], Destination::Index(0), ListId::Items);
        assert_eq!(tree.root().items(), &[ids[3], ids[0], ids[1], ids[2]]);

        move_item(&mut tree, ids[3], Destination::End, ListId::Items);
        assert_eq!(tree.root().items(), ids.as_slice());

        move_item(&mut tree, ids[1], Destination::Index(1), ListId::Items);
        assert_eq!(tree.root().items(), ids.as_slice());
    }

    #[test]
    fn test_move_into_group_needs_no_adjustment() {
        let mut tree = tree();
        let ids = notes(&mut tree, &["A", "B"]);
        let group = add_group(&mut tree, "g");
        let author = tree.client_id();
        let inner = add_note(&mut tree, ListId::Notes(group), "x", author).unwrap();

        move_item(&mut tree, ids[0], Destination::Index(0), ListId::Notes(group));
        let notes = tree.root().group(group).unwrap().notes.clone();
        assert_eq!(notes, vec![ids[0], inner]);
        assert_eq!(tree.root().items(), &[group, ids[1]]);
    }

    #[test]
    fn test_group_cannot_move_into_group() {
        let mut tree = tree();
        let outer = add_group(&mut tree, "outer");
        let inner = add_group(&mut tree, "inner");
        let before = tree.root().clone();

        move_item(&mut tree, inner, Destination::End, ListId::Notes(outer));
        assert_eq!(tree.root(), &before);
    }

    #[test]
    fn test_move_of_deleted_item_is_noop() {
        let mut tree = tree();
        let ids = notes(&mut tree, &["A", "B"]);
        delete_note(&mut tree, ids[0]);
        let before = tree.root().clone();

        move_item(&mut tree, ids[0], Destination::End, ListId::Items);
        assert_eq!(tree.root(), &before);
    }

    #[test]
    fn test_delete_group_keeps_notes_in_place() {
        let mut tree = tree();
        let author = tree.client_id();
        let loose = notes(&mut tree, &["before", "after"]);
        let group = add_group(&mut tree, "g");
        move_item(&mut tree, group, Destination::Index(1), ListId::Items);
        let n1 = add_note(&mut tree, ListId::Notes(group), "n1", author).unwrap();
        let n2 = add_note(&mut tree, ListId::Notes(group), "n2", author).unwrap();
        assert_eq!(tree.root().items(), &[loose[0], group, loose[1]]);
        assert_eq!(tree.root().note_count(), 4);

        delete_group(&mut tree, group);
        assert_eq!(tree.root().items(), &[loose[0], n1, n2, loose[1]]);
        assert_eq!(tree.root().note_count(), 4);
        assert!(tree.root().group(group).is_none());
        assert_eq!(tree.parent(n1), Some(ListId::Items));
    }

    #[test]
    fn test_double_delete_is_noop() {
        let mut tree = tree();
        let ids = notes(&mut tree, &["A", "B"]);
        delete_note(&mut tree, ids[0]);
        let before = tree.root().clone();
        let clock = tree.clock();

        delete_note(&mut tree, ids[0]);
        assert_eq!(tree.root(), &before);
        assert_eq!(tree.clock(), clock);

        let group = add_group(&mut tree, "g");
        delete_group(&mut tree, group);
        let before = tree.root().clone();
        delete_group(&mut tree, group);
        assert_eq!(tree.root(), &before);
    }

    #[test]
    fn test_stale_text_and_rename_are_noops() {
        let mut tree = tree();
        let ids = notes(&mut tree, &["A"]);
        let group = add_group(&mut tree, "g");
        rename_group(&mut tree, group, "renamed");
        assert_eq!(tree.root().group(group).unwrap().name, "renamed");

        delete_note(&mut tree, ids[0]);
        delete_group(&mut tree, group);
        let clock = tree.clock();
        update_note_text(&mut tree, ids[0], "late");
        rename_group(&mut tree, group, "late");
        toggle_vote(&mut tree, ids[0], UserId::new());
        assert_eq!(tree.clock(), clock);
    }

    #[test]
    fn test_update_note_text() {
        let mut tree = tree();
        let ids = notes(&mut tree, &["draft"]);
        update_note_text(&mut tree, ids[0], "final");
        let note = tree.root().note(ids[0]).unwrap();
        assert_eq!(note.text, "final");
        assert!(note.last_changed >= note.created);
    }

    #[test]
    fn test_group_notes_collects_live_selection() {
        let mut tree = tree();
        let ids = notes(&mut tree, &["A", "B", "C"]);
        delete_note(&mut tree, ids[1]);

        let group = group_notes(&mut tree, "picked", &[ids[2], ids[1], ids[0], ids[2]]);
        assert_eq!(tree.root().items(), &[group]);
        assert_eq!(tree.root().group(group).unwrap().notes, vec![ids[2], ids[0]]);
    }

    #[test]
    fn test_delete_notes_skips_missing() {
        let mut tree = tree();
        let ids = notes(&mut tree, &["A", "B", "C"]);
        delete_notes(&mut tree, &[ids[0], NodeId::new(), ids[2], ids[0]]);
        assert_eq!(tree.root().items(), &[ids[1]]);

        let clock = tree.clock();
        delete_notes(&mut tree, &[ids[0]]);
        assert_eq!(tree.clock(), clock);
    }

    #[test]
    fn test_delete_group_is_one_undo_step() {
        let mut tree = tree();
        let author = tree.client_id();
        let loose = notes(&mut tree, &["loose"]);
        let group = add_group(&mut tree, "g");
        let n1 = add_note(&mut tree, ListId::Notes(group), "n1", author).unwrap();
        let n2 = add_note(&mut tree, ListId::Notes(group), "n2", author).unwrap();
        let before = tree.root().clone();
        let history = UndoRedoStacks::attach(&tree);

        delete_group(&mut tree, group);
        let after = tree.root().clone();
        assert_eq!(history.undo_len(), 1);

        assert_eq!(history.undo(&mut tree), Some(RevertResult::Success));
        assert_eq!(tree.root().items(), before.items());
        assert_eq!(tree.root().group(group).unwrap().notes, vec![n1, n2]);
        assert!(!history.can_undo());

        assert_eq!(history.redo(&mut tree), Some(RevertResult::Success));
        assert_eq!(tree.root().items(), &[n1, n2, loose[0]]);
        assert_eq!(tree.root().items(), after.items());
        assert!(tree.root().group(group).is_none());
    }

    #[test]
    fn test_group_notes_is_one_undo_step() {
        let mut tree = tree();
        let ids = notes(&mut tree, &["A", "B", "C"]);
        let history = UndoRedoStacks::attach(&tree);

        let group = group_notes(&mut tree, "picked", &[ids[0], ids[2]]);
        assert_eq!(history.undo_len(), 1);

        history.undo(&mut tree);
        assert_eq!(tree.root().items(), ids.as_slice());
        assert!(tree.root().group(group).is_none());

        history.redo(&mut tree);
        assert_eq!(tree.root().items(), &[group, ids[1]]);
        assert_eq!(tree.root().group(group).unwrap().notes, vec![ids[0], ids[2]]);
        assert_eq!(tree.root().note_count(), 3);
    }
}
