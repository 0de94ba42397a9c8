use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Board, BoardError, Item, ListId, NodeId, UserId};

/// An edit to the board. Applying a command yields the command that undoes
/// it, so every edit can be replicated and reverted the same way.
///
/// Structural commands address nodes by id; list positions are clamped to
/// the current list length when applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BoardCommand {
    InsertItems {
        list: ListId,
        index: usize,
        items: Vec<Item>,
    },
    RemoveItem {
        id: NodeId,
    },
    /// `ids` must be a contiguous run of siblings. `index` is a gap in
    /// `destination` before the move.
    MoveItems {
        ids: Vec<NodeId>,
        destination: ListId,
        index: usize,
    },
    SetNoteText {
        note_id: NodeId,
        text: String,
        changed_at: DateTime<Utc>,
    },
    ToggleVote {
        note_id: NodeId,
        voter: UserId,
        changed_at: DateTime<Utc>,
    },
    RenameGroup {
        group_id: NodeId,
        name: String,
    },
    /// Applied all-or-nothing.
    Batch {
        commands: Vec<BoardCommand>,
    },
}

impl BoardCommand {
    /// Refreshes the change timestamp carried by note edits, including the
    /// ones nested in a batch.
    pub fn stamp(&mut self, at: DateTime<Utc>) {
        match self {
            BoardCommand::SetNoteText { changed_at, .. }
            | BoardCommand::ToggleVote { changed_at, .. } => *changed_at = at,
            BoardCommand::Batch { commands } => {
                for command in commands {
                    command.stamp(at);
                }
            }
            _ => {}
        }
    }
}

pub fn apply_command(board: &mut Board, command: BoardCommand) -> Result<BoardCommand, BoardError> {
    match command {
        BoardCommand::InsertItems { list, index, items } => insert_items(board, list, index, items),
        BoardCommand::RemoveItem { id } => remove_item(board, id),
        BoardCommand::MoveItems {
            ids,
            destination,
            index,
        } => move_items(board, ids, destination, index),
        BoardCommand::SetNoteText {
            note_id,
            text,
            changed_at,
        } => set_note_text(board, note_id, text, changed_at),
        BoardCommand::ToggleVote {
            note_id,
            voter,
            changed_at,
        } => toggle_vote(board, note_id, voter, changed_at),
        BoardCommand::RenameGroup { group_id, name } => rename_group(board, group_id, name),
        BoardCommand::Batch { commands } => apply_batch(board, commands),
    }
}

fn insert_items(
    board: &mut Board,
    list: ListId,
    index: usize,
    items: Vec<Item>,
) -> Result<BoardCommand, BoardError> {
    let ids: Vec<NodeId> = items.iter().map(Item::id).collect();
    board.attach(list, index, items)?;

    // removing back to front lets the inverse batch restore each position
    let mut inverse: Vec<BoardCommand> = ids
        .into_iter()
        .rev()
        .map(|id| BoardCommand::RemoveItem { id })
        .collect();
    if inverse.len() == 1 {
        Ok(inverse.remove(0))
    } else {
        Ok(BoardCommand::Batch { commands: inverse })
    }
}

fn remove_item(board: &mut Board, id: NodeId) -> Result<BoardCommand, BoardError> {
    let (list, index, item) = board.detach(id)?;
    Ok(BoardCommand::InsertItems {
        list,
        index,
        items: vec![item],
    })
}

fn move_items(
    board: &mut Board,
    ids: Vec<NodeId>,
    destination: ListId,
    index: usize,
) -> Result<BoardCommand, BoardError> {
    let relocation = board.relocate(&ids, destination, index)?;

    // a backward move inside one list needs the gap after the run's old slot
    let back = if relocation.source == destination && relocation.source_start > relocation.index {
        relocation.source_start + ids.len()
    } else {
        relocation.source_start
    };
    Ok(BoardCommand::MoveItems {
        ids,
        destination: relocation.source,
        index: back,
    })
}

fn set_note_text(
    board: &mut Board,
    note_id: NodeId,
    text: String,
    changed_at: DateTime<Utc>,
) -> Result<BoardCommand, BoardError> {
    let note = board
        .note_mut(note_id)
        .ok_or(BoardError::NodeNotFound(note_id))?;
    let previous = std::mem::replace(&mut note.text, text);
    note.touch(changed_at);
    Ok(BoardCommand::SetNoteText {
        note_id,
        text: previous,
        changed_at,
    })
}

fn toggle_vote(
    board: &mut Board,
    note_id: NodeId,
    voter: UserId,
    changed_at: DateTime<Utc>,
) -> Result<BoardCommand, BoardError> {
    let note = board
        .note_mut(note_id)
        .ok_or(BoardError::NodeNotFound(note_id))?;
    if let Some(idx) = note.votes.iter().position(|v| *v == voter) {
        note.votes.remove(idx);
    } else {
        note.votes.push(voter);
    }
    note.touch(changed_at);
    Ok(BoardCommand::ToggleVote {
        note_id,
        voter,
        changed_at,
    })
}

fn rename_group(
    board: &mut Board,
    group_id: NodeId,
    name: String,
) -> Result<BoardCommand, BoardError> {
    let group = board
        .group_mut(group_id)
        .ok_or(BoardError::NodeNotFound(group_id))?;
    let previous = std::mem::replace(&mut group.name, name);
    Ok(BoardCommand::RenameGroup {
        group_id,
        name: previous,
    })
}

fn apply_batch(board: &mut Board, commands: Vec<BoardCommand>) -> Result<BoardCommand, BoardError> {
    let mut inverses = Vec::with_capacity(commands.len());
    for command in commands {
        match apply_command(board, command) {
            Ok(inverse) => inverses.push(inverse),
            Err(err) => {
                for inverse in inverses.into_iter().rev() {
                    // inverses of commands applied a moment ago
                    let _ = apply_command(board, inverse);
                }
                return Err(err);
            }
        }
    }
    inverses.reverse();
    Ok(BoardCommand::Batch { commands: inverses })
}
