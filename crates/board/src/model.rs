use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};
use uuid::Uuid;

use crate::BoardError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a connected client. Used for note authorship, votes and
/// session records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    /// Placeholder used before the roster has told us who we are.
    pub const UNDEFINED: UserId = UserId(Uuid::nil());

    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_undefined(&self) -> bool {
        *self == Self::UNDEFINED
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undefined() {
            f.write_str("[UNDEFINED]")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// A sequence in the board that can hold items.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ListId {
    /// `Board.items`, accepts groups and notes.
    Items,
    /// `Group.notes` of the given group, accepts notes only.
    Notes(NodeId),
}

impl fmt::Display for ListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListId::Items => f.write_str("items"),
            ListId::Notes(group) => write!(f, "notes of {}", group),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    InDocument,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Group,
    Note,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Note {
    pub id: NodeId,
    pub text: String,
    pub author: UserId,
    #[serde(default)]
    pub votes: Vec<UserId>,
    pub created: DateTime<Utc>,
    pub last_changed: DateTime<Utc>,
}

impl Note {
    pub fn new(text: impl Into<String>, author: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: NodeId::new(),
            text: text.into(),
            author,
            votes: Vec::new(),
            created: now,
            last_changed: now,
        }
    }

    // last_changed never moves backwards, even for replayed commands
    pub(crate) fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_changed {
            self.last_changed = at;
        }
    }
}

/// A group as stored in the board; its notes are referenced by id.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: NodeId,
    pub name: String,
    pub notes: Vec<NodeId>,
}

/// A detached group together with the notes it owns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupItem {
    pub id: NodeId,
    pub name: String,
    #[serde(default)]
    pub notes: Vec<Note>,
}

impl GroupItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(),
            name: name.into(),
            notes: Vec::new(),
        }
    }
}

/// Owned subtree for one entry of a list. Used to insert content, to hold
/// removed content for undo and to snapshot the board.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Item {
    Group(GroupItem),
    Note(Note),
}

impl Item {
    pub fn id(&self) -> NodeId {
        match self {
            Item::Group(group) => group.id,
            Item::Note(note) => note.id,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Item::Group(_) => NodeKind::Group,
            Item::Note(_) => NodeKind::Note,
        }
    }
}

/// Borrowed view of a stored node, narrowed to its type.
#[derive(Debug, Clone, Copy)]
pub enum ItemRef<'a> {
    Group(&'a Group),
    Note(&'a Note),
}

impl<'a> ItemRef<'a> {
    pub fn id(&self) -> NodeId {
        match self {
            ItemRef::Group(group) => group.id,
            ItemRef::Note(note) => note.id,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            ItemRef::Group(_) => NodeKind::Group,
            ItemRef::Note(_) => NodeKind::Note,
        }
    }

    pub fn as_note(&self) -> Option<&'a Note> {
        match *self {
            ItemRef::Note(note) => Some(note),
            ItemRef::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<&'a Group> {
        match *self {
            ItemRef::Group(group) => Some(group),
            ItemRef::Note(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Group(Group),
    Note(Note),
}

/// Where a relocated range came from and where it ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Relocation {
    pub source: ListId,
    pub source_start: usize,
    pub index: usize,
}

/// Root of the document. Nodes live in an arena keyed by id; every attached
/// node has exactly one entry in the parent map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Board {
    items: Vec<NodeId>,
    nodes: HashMap<NodeId, Node>,
    parents: HashMap<NodeId, ListId>,
}

impl Board {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[NodeId] {
        &self.items
    }

    pub fn status(&self, id: NodeId) -> NodeStatus {
        if self.parents.contains_key(&id) {
            NodeStatus::InDocument
        } else {
            NodeStatus::Removed
        }
    }

    /// `Items` is always live; a group's notes are live while the group is.
    pub fn list_status(&self, list: ListId) -> NodeStatus {
        match list {
            ListId::Items => NodeStatus::InDocument,
            ListId::Notes(group) => match self.nodes.get(&group) {
                Some(Node::Group(_)) => self.status(group),
                _ => NodeStatus::Removed,
            },
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<ListId> {
        self.parents.get(&id).copied()
    }

    pub fn list(&self, list: ListId) -> Option<&[NodeId]> {
        match list {
            ListId::Items => Some(&self.items),
            ListId::Notes(group) => match self.nodes.get(&group) {
                Some(Node::Group(group)) => Some(&group.notes),
                _ => None,
            },
        }
    }

    /// Position of a node inside its parent list.
    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        let parent = self.parent(id)?;
        self.list(parent)?.iter().position(|n| *n == id)
    }

    pub fn get(&self, id: NodeId) -> Option<ItemRef<'_>> {
        match self.nodes.get(&id)? {
            Node::Group(group) => Some(ItemRef::Group(group)),
            Node::Note(note) => Some(ItemRef::Note(note)),
        }
    }

    pub fn note(&self, id: NodeId) -> Option<&Note> {
        self.get(id).and_then(|item| item.as_note())
    }

    pub fn group(&self, id: NodeId) -> Option<&Group> {
        self.get(id).and_then(|item| item.as_group())
    }

    pub fn note_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|node| matches!(node, Node::Note(_)))
            .count()
    }

    pub fn group_count(&self) -> usize {
        self.nodes.len() - self.note_count()
    }

    /// Owned copy of the whole tree in display order.
    pub fn snapshot(&self) -> Vec<Item> {
        self.items
            .iter()
            .filter_map(|id| self.clone_tree(*id))
            .collect()
    }

    /// Owned copy of the subtree rooted at `id`.
    pub fn clone_tree(&self, id: NodeId) -> Option<Item> {
        match self.nodes.get(&id)? {
            Node::Note(note) => Some(Item::Note(note.clone())),
            Node::Group(group) => Some(Item::Group(GroupItem {
                id: group.id,
                name: group.name.clone(),
                notes: group
                    .notes
                    .iter()
                    .filter_map(|note| self.note(*note).cloned())
                    .collect(),
            })),
        }
    }

    pub(crate) fn note_mut(&mut self, id: NodeId) -> Option<&mut Note> {
        match self.nodes.get_mut(&id) {
            Some(Node::Note(note)) => Some(note),
            _ => None,
        }
    }

    pub(crate) fn group_mut(&mut self, id: NodeId) -> Option<&mut Group> {
        match self.nodes.get_mut(&id) {
            Some(Node::Group(group)) => Some(group),
            _ => None,
        }
    }

    fn list_mut(&mut self, list: ListId) -> Option<&mut Vec<NodeId>> {
        match list {
            ListId::Items => Some(&mut self.items),
            ListId::Notes(group) => self.group_mut(group).map(|group| &mut group.notes),
        }
    }

    /// Inserts detached subtrees into `list` starting at `index` (clamped to
    /// the list length). Validates everything before touching the board.
    pub(crate) fn attach(
        &mut self,
        list: ListId,
        index: usize,
        items: Vec<Item>,
    ) -> Result<(), BoardError> {
        let len = self
            .list(list)
            .map(|l| l.len())
            .ok_or(BoardError::ListNotFound(list))?;

        let mut incoming = Vec::new();
        for item in &items {
            if matches!(list, ListId::Notes(_)) && item.kind() == NodeKind::Group {
                return Err(BoardError::SchemaViolation(format!(
                    "group {} cannot be placed in {}",
                    item.id(),
                    list
                )));
            }
            incoming.push(item.id());
            if let Item::Group(group) = item {
                incoming.extend(group.notes.iter().map(|note| note.id));
            }
        }
        for (pos, id) in incoming.iter().enumerate() {
            if self.nodes.contains_key(id) || incoming[..pos].contains(id) {
                return Err(BoardError::NodeExists(*id));
            }
        }

        let ids: Vec<NodeId> = items
            .into_iter()
            .map(|item| self.insert_tree(list, item))
            .collect();
        let index = index.min(len);
        if let Some(seq) = self.list_mut(list) {
            seq.splice(index..index, ids);
        }
        Ok(())
    }

    fn insert_tree(&mut self, list: ListId, item: Item) -> NodeId {
        match item {
            Item::Note(note) => {
                let id = note.id;
                self.parents.insert(id, list);
                self.nodes.insert(id, Node::Note(note));
                id
            }
            Item::Group(group) => {
                let id = group.id;
                let mut notes = Vec::with_capacity(group.notes.len());
                for note in group.notes {
                    notes.push(note.id);
                    self.parents.insert(note.id, ListId::Notes(id));
                    self.nodes.insert(note.id, Node::Note(note));
                }
                self.parents.insert(id, list);
                self.nodes.insert(
                    id,
                    Node::Group(Group {
                        id,
                        name: group.name,
                        notes,
                    }),
                );
                id
            }
        }
    }

    /// Removes a node (and for groups, its notes) from the board and
    /// returns where it was together with the owned subtree.
    pub(crate) fn detach(&mut self, id: NodeId) -> Result<(ListId, usize, Item), BoardError> {
        let list = self.parent(id).ok_or(BoardError::NodeNotFound(id))?;
        let seq = self.list_mut(list).ok_or(BoardError::ListNotFound(list))?;
        let index = seq
            .iter()
            .position(|n| *n == id)
            .ok_or(BoardError::NodeNotFound(id))?;
        seq.remove(index);
        let item = self.take_tree(id).ok_or(BoardError::NodeNotFound(id))?;
        Ok((list, index, item))
    }

    fn take_tree(&mut self, id: NodeId) -> Option<Item> {
        self.parents.remove(&id);
        match self.nodes.remove(&id)? {
            Node::Note(note) => Some(Item::Note(note)),
            Node::Group(group) => {
                let mut notes = Vec::with_capacity(group.notes.len());
                for note_id in &group.notes {
                    self.parents.remove(note_id);
                    if let Some(Node::Note(note)) = self.nodes.remove(note_id) {
                        notes.push(note);
                    }
                }
                Some(Item::Group(GroupItem {
                    id: group.id,
                    name: group.name,
                    notes,
                }))
            }
        }
    }

    /// Moves a contiguous run of siblings to `gap` in `destination`.
    ///
    /// `gap` is measured in the destination as it is before the move. Inside
    /// a single list the run is taken out first, so a gap past the run is
    /// shifted back by the run length.
    pub(crate) fn relocate(
        &mut self,
        ids: &[NodeId],
        destination: ListId,
        gap: usize,
    ) -> Result<Relocation, BoardError> {
        let first = *ids
            .first()
            .ok_or_else(|| BoardError::InvalidOp("nothing to move".to_string()))?;
        let source = self.parent(first).ok_or(BoardError::NodeNotFound(first))?;
        let source_seq = self.list(source).ok_or(BoardError::ListNotFound(source))?;
        let start = source_seq
            .iter()
            .position(|n| *n == first)
            .ok_or(BoardError::NodeNotFound(first))?;
        let end = start + ids.len();
        if end > source_seq.len() || source_seq[start..end] != *ids {
            return Err(BoardError::InvalidOp(format!(
                "moved nodes are not a contiguous run of {}",
                source
            )));
        }

        let dest_len = self
            .list(destination)
            .map(|l| l.len())
            .ok_or(BoardError::ListNotFound(destination))?;
        if let ListId::Notes(group) = destination {
            if let Some(id) = ids.iter().find(|id| self.group(**id).is_some()) {
                return Err(BoardError::SchemaViolation(format!(
                    "group {} cannot be placed in notes of {}",
                    id, group
                )));
            }
        }

        let gap = gap.min(dest_len);
        let index = if source == destination && gap > start {
            gap.saturating_sub(ids.len()).max(start)
        } else {
            gap
        };

        let moved: Vec<NodeId> = match self.list_mut(source) {
            Some(seq) => seq.drain(start..end).collect(),
            None => return Err(BoardError::ListNotFound(source)),
        };
        for id in &moved {
            self.parents.insert(*id, destination);
        }
        match self.list_mut(destination) {
            Some(seq) => {
                seq.splice(index..index, moved);
            }
            None => return Err(BoardError::ListNotFound(destination)),
        }

        Ok(Relocation {
            source,
            source_start: start,
            index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board_with_notes(texts: &[&str]) -> (Board, Vec<NodeId>) {
        let mut board = Board::new();
        let author = UserId::new();
        let notes: Vec<Item> = texts
            .iter()
            .map(|t| Item::Note(Note::new(*t, author)))
            .collect();
        let ids = notes.iter().map(|n| n.id()).collect();
        board.attach(ListId::Items, 0, notes).unwrap();
        (board, ids)
    }

    #[test]
    fn test_attach_and_lookup() {
        let (board, ids) = board_with_notes(&["a", "b"]);
        assert_eq!(board.items(), ids.as_slice());
        assert_eq!(board.status(ids[0]), NodeStatus::InDocument);
        assert_eq!(board.parent(ids[1]), Some(ListId::Items));
        assert_eq!(board.index_of(ids[1]), Some(1));
        assert_eq!(board.note(ids[0]).unwrap().text, "a");
        assert!(board.group(ids[0]).is_none());
    }

    #[test]
    fn test_group_cannot_enter_notes_list() {
        let mut board = Board::new();
        let group = GroupItem::new("g");
        let group_id = group.id;
        board
            .attach(ListId::Items, 0, vec![Item::Group(group)])
            .unwrap();

        let nested = Item::Group(GroupItem::new("nested"));
        let err = board
            .attach(ListId::Notes(group_id), 0, vec![nested])
            .unwrap_err();
        assert!(matches!(err, BoardError::SchemaViolation(_)));
        assert_eq!(board.group_count(), 1);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let (mut board, ids) = board_with_notes(&["a"]);
        let copy = board.clone_tree(ids[0]).unwrap();
        assert_eq!(
            board.attach(ListId::Items, 0, vec![copy]),
            Err(BoardError::NodeExists(ids[0]))
        );
        assert_eq!(board.items().len(), 1);
    }

    #[test]
    fn test_detach_group_takes_its_notes() {
        let mut board = Board::new();
        let mut group = GroupItem::new("g");
        group.notes.push(Note::new("inside", UserId::new()));
        let note_id = group.notes[0].id;
        let group_id = group.id;
        board
            .attach(ListId::Items, 0, vec![Item::Group(group)])
            .unwrap();
        assert_eq!(board.parent(note_id), Some(ListId::Notes(group_id)));

        let (list, index, item) = board.detach(group_id).unwrap();
        assert_eq!((list, index), (ListId::Items, 0));
        assert_eq!(board.status(note_id), NodeStatus::Removed);
        assert_eq!(board.list_status(ListId::Notes(group_id)), NodeStatus::Removed);
        match item {
            Item::Group(group) => assert_eq!(group.notes[0].id, note_id),
            Item::Note(_) => panic!("expected a group"),
        }
    }

    #[test]
    fn test_relocate_forward_gap_shifts_back_by_one() {
        let (mut board, ids) = board_with_notes(&["a", "b", "c", "d"]);
        // gap 3 sits between c and d before the move
        let relocation = board.relocate(&ids[0..1], ListId::Items, 3).unwrap();
        assert_eq!(relocation.index, 2);
        assert_eq!(board.items(), &[ids[1], ids[2], ids[0], ids[3]]);
    }

    #[test]
    fn test_relocate_backward_keeps_gap() {
        let (mut board, ids) = board_with_notes(&["a", "b", "c", "d"]);
        board.relocate(&ids[3..4], ListId::Items, 1).unwrap();
        assert_eq!(board.items(), &[ids[0], ids[3], ids[1], ids[2]]);
    }

    #[test]
    fn test_relocate_rejects_non_contiguous_run() {
        let (mut board, ids) = board_with_notes(&["a", "b", "c"]);
        let err = board
            .relocate(&[ids[0], ids[2]], ListId::Items, 3)
            .unwrap_err();
        assert!(matches!(err, BoardError::InvalidOp(_)));
        assert_eq!(board.items(), ids.as_slice());
    }

    #[test]
    fn test_snapshot_serializes() {
        let (board, _) = board_with_notes(&["hello"]);
        let json = serde_json::to_value(board.snapshot()).unwrap();
        assert_eq!(json[0]["Note"]["text"], "hello");
    }
}
