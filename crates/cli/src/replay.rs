use anyhow::{anyhow, bail, Context, Result};
use board::{Item, ListId, NodeId};
use chrono::{DateTime, Utc};
use collaboration::mutations::{
    add_group, add_note, delete_group, delete_note, delete_notes, group_notes, move_item,
    rename_group, toggle_vote, update_note_text, Destination,
};
use collaboration::{
    Binder, BoardClient, Client, ConnectionState, ContainerService, Member, RevertResult,
    SelectAction, UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// A scripted collaborative session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayScript {
    /// Display names of the participants, in join order
    pub users: Vec<String>,

    /// Exchange operations between every client after each step
    pub sync_each_step: bool,

    pub steps: Vec<Step>,
}

impl Default for ReplayScript {
    fn default() -> Self {
        Self {
            users: vec!["Alice".to_string(), "Bob".to_string()],
            sync_each_step: true,
            steps: Vec::new(),
        }
    }
}

fn default_action() -> SelectAction {
    SelectAction::Single
}

/// One user action. `user` is an index into `ReplayScript::users`; items
/// are referred to by the labels given when they were created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    AddNote {
        #[serde(default)]
        user: usize,
        text: String,
        #[serde(default)]
        group: Option<String>,
        #[serde(default)]
        label: Option<String>,
    },
    AddGroup {
        #[serde(default)]
        user: usize,
        name: String,
        #[serde(default)]
        label: Option<String>,
    },
    EditNote {
        #[serde(default)]
        user: usize,
        note: String,
        text: String,
    },
    RenameGroup {
        #[serde(default)]
        user: usize,
        group: String,
        name: String,
    },
    Move {
        #[serde(default)]
        user: usize,
        item: String,
        /// Final position; the end of the list when omitted
        #[serde(default)]
        index: Option<usize>,
        /// Target group; the board itself when omitted
        #[serde(default)]
        group: Option<String>,
    },
    DeleteNote {
        #[serde(default)]
        user: usize,
        note: String,
    },
    DeleteGroup {
        #[serde(default)]
        user: usize,
        group: String,
    },
    Vote {
        #[serde(default)]
        user: usize,
        note: String,
    },
    Select {
        #[serde(default)]
        user: usize,
        item: String,
        #[serde(default = "default_action")]
        action: SelectAction,
    },
    GroupSelection {
        #[serde(default)]
        user: usize,
        name: String,
        #[serde(default)]
        label: Option<String>,
    },
    DeleteSelection {
        #[serde(default)]
        user: usize,
    },
    Undo {
        #[serde(default)]
        user: usize,
    },
    Redo {
        #[serde(default)]
        user: usize,
    },
    AddPage {
        #[serde(default)]
        user: usize,
        name: String,
        #[serde(default)]
        label: Option<String>,
    },
    DeletePage {
        #[serde(default)]
        user: usize,
        page: String,
    },
    Sync,
    Disconnect {
        #[serde(default)]
        user: usize,
    },
    Reconnect {
        #[serde(default)]
        user: usize,
    },
}

/// What the first user sees once the script has run
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub container: String,
    pub generated_at: DateTime<Utc>,
    pub board: Vec<Item>,
    pub binder: Binder,
    pub session: Vec<Client>,
    pub members: Vec<Member>,
}

struct Replay {
    clients: Vec<BoardClient>,
    labels: HashMap<String, NodeId>,
}

impl Replay {
    fn client(&mut self, user: usize) -> Result<&mut BoardClient> {
        let count = self.clients.len();
        self.clients
            .get_mut(user)
            .ok_or_else(|| anyhow!("user {} does not exist ({} users)", user, count))
    }

    fn resolve(&self, label: &str) -> Result<NodeId> {
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| anyhow!("unknown label '{}'", label))
    }

    fn remember(&mut self, label: &Option<String>, id: NodeId) {
        if let Some(label) = label {
            self.labels.insert(label.clone(), id);
        }
    }

    async fn sync_all(&mut self) -> Result<()> {
        for client in &mut self.clients {
            if client.container().connection_state() != ConnectionState::Connected {
                continue;
            }
            let handled = client.sync().await?;
            debug!("{} handled {} messages", client.user_id(), handled);
        }
        Ok(())
    }

    async fn apply(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::AddNote {
                user,
                text,
                group,
                label,
            } => {
                let list = match group {
                    Some(group) => ListId::Notes(self.resolve(group)?),
                    None => ListId::Items,
                };
                let client = self.client(*user)?;
                let author = client.user_id();
                match add_note(client.tree_mut(), list, text, author) {
                    Some(id) => self.remember(label, id),
                    None => warn!("note '{}' was not added, {} is gone", text, list),
                }
            }
            Step::AddGroup { user, name, label } => {
                let id = add_group(self.client(*user)?.tree_mut(), name);
                self.remember(label, id);
            }
            Step::EditNote { user, note, text } => {
                let note = self.resolve(note)?;
                update_note_text(self.client(*user)?.tree_mut(), note, text);
            }
            Step::RenameGroup { user, group, name } => {
                let group = self.resolve(group)?;
                rename_group(self.client(*user)?.tree_mut(), group, name);
            }
            Step::Move {
                user,
                item,
                index,
                group,
            } => {
                let item = self.resolve(item)?;
                let destination = match group {
                    Some(group) => ListId::Notes(self.resolve(group)?),
                    None => ListId::Items,
                };
                let index = index.map_or(Destination::End, Destination::Index);
                move_item(self.client(*user)?.tree_mut(), item, index, destination);
            }
            Step::DeleteNote { user, note } => {
                let note = self.resolve(note)?;
                delete_note(self.client(*user)?.tree_mut(), note);
            }
            Step::DeleteGroup { user, group } => {
                let group = self.resolve(group)?;
                delete_group(self.client(*user)?.tree_mut(), group);
            }
            Step::Vote { user, note } => {
                let note = self.resolve(note)?;
                let client = self.client(*user)?;
                let voter = client.user_id();
                toggle_vote(client.tree_mut(), note, voter);
            }
            Step::Select { user, item, action } => {
                let item = self.resolve(item)?;
                self.client(*user)?.select(item, *action);
            }
            Step::GroupSelection { user, name, label } => {
                let client = self.client(*user)?;
                let selection = client.selection().to_vec();
                let id = group_notes(client.tree_mut(), name, &selection);
                client.clear_selection();
                self.remember(label, id);
            }
            Step::DeleteSelection { user } => {
                let client = self.client(*user)?;
                let selection = client.selection().to_vec();
                delete_notes(client.tree_mut(), &selection);
                client.clear_selection();
            }
            Step::Undo { user } => match self.client(*user)?.undo() {
                Some(RevertResult::Success) => {}
                Some(RevertResult::Failure) => warn!("undo for user {} failed", user),
                None => info!("user {} has nothing to undo", user),
            },
            Step::Redo { user } => match self.client(*user)?.redo() {
                Some(RevertResult::Success) => {}
                Some(RevertResult::Failure) => warn!("redo for user {} failed", user),
                None => info!("user {} has nothing to redo", user),
            },
            Step::AddPage { user, name, label } => {
                let page = self.client(*user)?.add_page(name);
                match page {
                    Some(page) => self.remember(label, page.id),
                    None => warn!("page '{}' was not added", name),
                }
            }
            Step::DeletePage { user, page } => {
                let page = self.resolve(page)?;
                self.client(*user)?.delete_page(page);
            }
            Step::Sync => self.sync_all().await?,
            Step::Disconnect { user } => self.client(*user)?.disconnect().await?,
            Step::Reconnect { user } => self.client(*user)?.reconnect().await?,
        }
        Ok(())
    }
}

pub async fn run(script: &ReplayScript) -> Result<Outcome> {
    if script.users.is_empty() {
        bail!("a replay needs at least one user");
    }

    let service = ContainerService::new();
    let mut clients = Vec::with_capacity(script.users.len());
    let mut container_id = String::new();
    for name in &script.users {
        let member = Member::new(UserId::new(), name.clone());
        let client = BoardClient::start(&service, &container_id, member)
            .await
            .with_context(|| format!("{} could not join", name))?;
        container_id = client.container().id().as_str().to_string();
        clients.push(client);
    }
    info!(
        "replaying {} steps for {} users in {}",
        script.steps.len(),
        script.users.len(),
        container_id
    );

    let mut replay = Replay {
        clients,
        labels: HashMap::new(),
    };
    for (n, step) in script.steps.iter().enumerate() {
        replay
            .apply(step)
            .await
            .with_context(|| format!("step {} ({:?}) failed", n + 1, step))?;
        if script.sync_each_step {
            replay.sync_all().await?;
        }
    }
    // a second round delivers what later clients flushed in the first
    replay.sync_all().await?;
    replay.sync_all().await?;

    let viewer = replay.client(0)?;
    Ok(Outcome {
        container: container_id,
        generated_at: Utc::now(),
        board: viewer.board().snapshot(),
        binder: viewer.binder().clone(),
        session: viewer.container().session().root().clients().to_vec(),
        members: viewer.container().audience().members(),
    })
}

/// Two users sorting a handful of ideas
pub fn demo_script() -> ReplayScript {
    use Step::*;

    let label = |s: &str| Some(s.to_string());
    ReplayScript {
        users: vec!["Alice".to_string(), "Bob".to_string()],
        sync_each_step: true,
        steps: vec![
            AddGroup {
                user: 0,
                name: "Ideas".to_string(),
                label: label("ideas"),
            },
            AddNote {
                user: 0,
                text: "Ship the CLI".to_string(),
                group: None,
                label: label("cli"),
            },
            AddNote {
                user: 1,
                text: "Write docs".to_string(),
                group: None,
                label: label("docs"),
            },
            AddNote {
                user: 1,
                text: "Fix flaky test".to_string(),
                group: label("ideas"),
                label: label("flaky"),
            },
            Move {
                user: 0,
                item: "cli".to_string(),
                index: Some(0),
                group: label("ideas"),
            },
            Vote {
                user: 1,
                note: "cli".to_string(),
            },
            Vote {
                user: 0,
                note: "cli".to_string(),
            },
            EditNote {
                user: 1,
                note: "docs".to_string(),
                text: "Write better docs".to_string(),
            },
            Undo { user: 0 },
            Redo { user: 0 },
            AddNote {
                user: 0,
                text: "Retro on Friday".to_string(),
                group: None,
                label: label("retro"),
            },
            Select {
                user: 0,
                item: "docs".to_string(),
                action: SelectAction::Single,
            },
            Select {
                user: 0,
                item: "retro".to_string(),
                action: SelectAction::Multi,
            },
            GroupSelection {
                user: 0,
                name: "Later".to_string(),
                label: label("later"),
            },
            Select {
                user: 1,
                item: "flaky".to_string(),
                action: SelectAction::Single,
            },
            RenameGroup {
                user: 1,
                group: "ideas".to_string(),
                name: "Now".to_string(),
            },
            AddPage {
                user: 1,
                name: "Sprint 12".to_string(),
                label: label("sprint"),
            },
        ],
    }
}
