/// Session presence for collaborative editing
/// Tracks which items each connected client has selected
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

use board::NodeId;

use crate::{Document, SharedTree, UserId};

/// One connected client's presence record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub client_id: UserId,
    #[serde(default)]
    pub selected: Vec<NodeId>,
}

/// Shared, non-persistent presence document. Holds at most one `Client`
/// per client id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    clients: Vec<Client>,
}

impl Session {
    pub fn clients(&self) -> &[Client] {
        &self.clients
    }

    pub fn client(&self, client_id: UserId) -> Option<&Client> {
        self.clients.iter().find(|c| c.client_id == client_id)
    }

    fn position(&self, client_id: UserId) -> Option<usize> {
        self.clients.iter().position(|c| c.client_id == client_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionCommand {
    InsertClient { client: Client, index: usize },
    RemoveClient { client_id: UserId },
    SetSelection { client_id: UserId, selected: Vec<NodeId> },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("client already present: {0}")]
    ClientExists(UserId),

    #[error("client not found: {0}")]
    ClientNotFound(UserId),
}

impl Document for Session {
    type Command = SessionCommand;
    type Error = SessionError;

    fn apply(&mut self, command: SessionCommand) -> Result<SessionCommand, SessionError> {
        match command {
            SessionCommand::InsertClient { client, index } => {
                if self.position(client.client_id).is_some() {
                    return Err(SessionError::ClientExists(client.client_id));
                }
                let client_id = client.client_id;
                let index = index.min(self.clients.len());
                self.clients.insert(index, client);
                Ok(SessionCommand::RemoveClient { client_id })
            }
            SessionCommand::RemoveClient { client_id } => {
                let index = self
                    .position(client_id)
                    .ok_or(SessionError::ClientNotFound(client_id))?;
                let client = self.clients.remove(index);
                Ok(SessionCommand::InsertClient { client, index })
            }
            SessionCommand::SetSelection {
                client_id,
                selected,
            } => {
                let index = self
                    .position(client_id)
                    .ok_or(SessionError::ClientNotFound(client_id))?;
                let previous = std::mem::replace(&mut self.clients[index].selected, selected);
                Ok(SessionCommand::SetSelection {
                    client_id,
                    selected: previous,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectAction {
    /// Add to the current selection
    Multi,
    /// Drop from the current selection
    Remove,
    /// Replace the current selection
    Single,
}

/// How an item should be highlighted for this client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SelectionStatus {
    pub selected: bool,
    pub remote_selected: bool,
}

/// Next local selection after applying `action` for `item`. `Multi` never
/// adds an item twice.
pub fn update_local_selection(
    item: NodeId,
    current: &[NodeId],
    action: SelectAction,
) -> Vec<NodeId> {
    match action {
        SelectAction::Single => vec![item],
        SelectAction::Remove => current.iter().copied().filter(|id| *id != item).collect(),
        SelectAction::Multi => {
            let mut next = current.to_vec();
            if !next.contains(&item) {
                next.push(item);
            }
            next
        }
    }
}

/// Updates `local` and mirrors the change into the shared session record
/// for `client_id`, creating the record on first use.
pub fn update_remote_selection(
    session: &mut SharedTree<Session>,
    item: NodeId,
    action: SelectAction,
    client_id: UserId,
    local: &mut Vec<NodeId>,
) {
    if client_id.is_undefined() {
        return;
    }
    *local = update_local_selection(item, local, action);

    let command = match (session.root().client(client_id), action) {
        (None, SelectAction::Remove) => return,
        (None, _) => SessionCommand::InsertClient {
            client: Client {
                client_id,
                selected: vec![item],
            },
            index: usize::MAX,
        },
        (Some(record), SelectAction::Remove) => {
            if !record.selected.contains(&item) {
                return;
            }
            SessionCommand::SetSelection {
                client_id,
                selected: update_local_selection(item, &record.selected, action),
            }
        }
        (Some(record), SelectAction::Multi) => {
            if record.selected.contains(&item) {
                return;
            }
            SessionCommand::SetSelection {
                client_id,
                selected: update_local_selection(item, &record.selected, action),
            }
        }
        (Some(_), SelectAction::Single) => SessionCommand::SetSelection {
            client_id,
            selected: vec![item],
        },
    };
    if let Err(err) = session.submit(command) {
        debug!("selection update for {} skipped: {}", client_id, err);
    }
}

/// Whether `item` is selected by this client and whether any other client
/// still in the roster has it selected.
pub fn selection_status(
    session: &Session,
    item: NodeId,
    client_id: UserId,
    live: &HashSet<UserId>,
) -> SelectionStatus {
    if client_id.is_undefined() {
        return SelectionStatus::default();
    }
    let mut status = SelectionStatus::default();
    for client in session.clients() {
        if !client.selected.contains(&item) {
            continue;
        }
        if client.client_id == client_id {
            status.selected = true;
        } else if live.contains(&client.client_id) {
            status.remote_selected = true;
        }
    }
    status
}

/// Removes the records of clients that left. Returns how many were removed.
pub fn clean_session_data(session: &mut SharedTree<Session>, live: &HashSet<UserId>) -> usize {
    let stale: Vec<UserId> = session
        .root()
        .clients()
        .iter()
        .map(|c| c.client_id)
        .filter(|id| !live.contains(id))
        .collect();

    let mut removed = 0;
    for client_id in stale {
        match session.submit(SessionCommand::RemoveClient { client_id }) {
            Ok(()) => removed += 1,
            Err(err) => debug!("could not remove session record {}: {}", client_id, err),
        }
    }
    removed
}

/// Color assigned to a user for selection highlighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl UserColor {
    /// Generate a color based on user ID (deterministic)
    pub fn from_user_id(user_id: UserId) -> Self {
        let bytes = user_id.0.as_bytes();
        Self {
            r: bytes[0],
            g: bytes[1],
            b: bytes[2],
        }
    }

    /// Convert to hex color string
    pub fn to_hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}
