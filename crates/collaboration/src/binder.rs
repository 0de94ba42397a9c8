/// Binder: the list of pages shown in the left navigation
use serde::{Deserialize, Serialize};
use tracing::debug;

use board::{BoardError, NodeId};

use crate::{Document, SharedTree};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub id: NodeId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binder {
    pub name: String,
    #[serde(default)]
    pub pages: Vec<Page>,
}

impl Default for Binder {
    fn default() -> Self {
        Self {
            name: "My Binder".to_string(),
            pages: Vec::new(),
        }
    }
}

impl Binder {
    pub fn page(&self, id: NodeId) -> Option<&Page> {
        self.pages.iter().find(|p| p.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BinderCommand {
    InsertPage { page: Page, index: usize },
    RemovePage { id: NodeId },
}

impl Document for Binder {
    type Command = BinderCommand;
    type Error = BoardError;

    fn apply(&mut self, command: BinderCommand) -> Result<BinderCommand, BoardError> {
        match command {
            BinderCommand::InsertPage { page, index } => {
                if self.page(page.id).is_some() {
                    return Err(BoardError::NodeExists(page.id));
                }
                let id = page.id;
                let index = index.min(self.pages.len());
                self.pages.insert(index, page);
                Ok(BinderCommand::RemovePage { id })
            }
            BinderCommand::RemovePage { id } => {
                let index = self
                    .pages
                    .iter()
                    .position(|p| p.id == id)
                    .ok_or(BoardError::NodeNotFound(id))?;
                let page = self.pages.remove(index);
                Ok(BinderCommand::InsertPage { page, index })
            }
        }
    }
}

/// Appends a page and returns it.
pub fn add_page(tree: &mut SharedTree<Binder>, id: NodeId, name: &str) -> Option<Page> {
    let page = Page {
        id,
        name: name.to_string(),
    };
    match tree.submit(BinderCommand::InsertPage {
        page: page.clone(),
        index: usize::MAX,
    }) {
        Ok(()) => Some(page),
        Err(err) => {
            debug!("add_page skipped: {}", err);
            None
        }
    }
}

pub fn delete_page(tree: &mut SharedTree<Binder>, id: NodeId) {
    if tree.root().page(id).is_none() {
        debug!("delete_page: page {} is gone", id);
        return;
    }
    if let Err(err) = tree.submit(BinderCommand::RemovePage { id }) {
        debug!("delete_page skipped: {}", err);
    }
}
