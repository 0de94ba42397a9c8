/// Per-user application context: one container, its undo history and the
/// local selection. Constructed once and passed to whatever needs it.
/// The binder (page list) shares the container but keeps no undo history.
use tracing::info;

use board::{Board, BoardCommand, NodeId};

use crate::{
    add_page, delete_page, load_container, selection_status, update_remote_selection, Binder,
    Container, ContainerService, Member, Page, Result, RevertResult, SelectAction,
    SelectionStatus, SharedTree, UndoRedoStacks, UserId,
};

pub struct BoardClient {
    container: Container,
    history: UndoRedoStacks<BoardCommand>,
    selection: Vec<NodeId>,
}

impl BoardClient {
    /// Loads (or with an empty id, creates) a container and wires up the
    /// undo history for its app tree.
    pub async fn start(
        service: &ContainerService,
        container_id: &str,
        user: Member,
    ) -> Result<Self> {
        let container = load_container(service, container_id, user).await?;
        let history = UndoRedoStacks::attach(container.app());
        info!("board client ready for {}", container.id());
        Ok(Self {
            container,
            history,
            selection: Vec::new(),
        })
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn user_id(&self) -> UserId {
        self.container.client_id()
    }

    pub fn board(&self) -> &Board {
        self.container.app().root()
    }

    pub fn tree_mut(&mut self) -> &mut SharedTree<Board> {
        self.container.app_mut()
    }

    pub fn binder(&self) -> &Binder {
        self.container.binder().root()
    }

    pub fn add_page(&mut self, name: &str) -> Option<Page> {
        add_page(self.container.binder_mut(), NodeId::new(), name)
    }

    pub fn delete_page(&mut self, id: NodeId) {
        delete_page(self.container.binder_mut(), id);
    }

    pub fn undo(&mut self) -> Option<RevertResult> {
        self.history.undo(self.container.app_mut())
    }

    pub fn redo(&mut self) -> Option<RevertResult> {
        self.history.redo(self.container.app_mut())
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn select(&mut self, item: NodeId, action: SelectAction) {
        let client_id = self.user_id();
        update_remote_selection(
            self.container.session_mut(),
            item,
            action,
            client_id,
            &mut self.selection,
        );
    }

    pub fn selection(&self) -> &[NodeId] {
        &self.selection
    }

    pub fn clear_selection(&mut self) {
        for item in std::mem::take(&mut self.selection) {
            self.select(item, SelectAction::Remove);
        }
    }

    pub fn selection_status(&self, item: NodeId) -> SelectionStatus {
        selection_status(
            self.container.session().root(),
            item,
            self.user_id(),
            &self.container.audience().member_ids(),
        )
    }

    /// Sends local edits and applies whatever the service delivered.
    pub async fn sync(&mut self) -> Result<usize> {
        self.container.flush().await?;
        Ok(self.container.process_incoming())
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.container.disconnect().await
    }

    /// Rebuilds the connection. Undo history does not survive it.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.history.reset();
        self.container.reconnect().await
    }

    pub async fn shutdown(self) -> Result<()> {
        self.container.dispose().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutations::add_note;
    use board::ListId;

    #[tokio::test]
    async fn test_reconnect_resets_history() {
        let service = ContainerService::new();
        let mut client = BoardClient::start(&service, "", Member::test_user())
            .await
            .unwrap();
        let author = client.user_id();
        add_note(client.tree_mut(), ListId::Items, "a", author);
        assert!(client.can_undo());

        client.reconnect().await.unwrap();
        assert!(!client.can_undo());
        assert_eq!(client.undo(), None);
        assert_eq!(client.board().items().len(), 1);
    }

    #[tokio::test]
    async fn test_select_and_clear() {
        let service = ContainerService::new();
        let mut client = BoardClient::start(&service, "", Member::test_user())
            .await
            .unwrap();
        let author = client.user_id();
        let a = add_note(client.tree_mut(), ListId::Items, "a", author).unwrap();
        let b = add_note(client.tree_mut(), ListId::Items, "b", author).unwrap();

        client.select(a, SelectAction::Single);
        client.select(b, SelectAction::Multi);
        assert_eq!(client.selection(), &[a, b]);
        assert!(client.selection_status(b).selected);

        client.clear_selection();
        assert!(client.selection().is_empty());
        assert!(!client.selection_status(a).selected);
    }

    #[tokio::test]
    async fn test_pages_are_not_undoable() {
        let service = ContainerService::new();
        let mut client = BoardClient::start(&service, "", Member::test_user())
            .await
            .unwrap();

        let page = client.add_page("Retro").unwrap();
        assert_eq!(client.binder().pages, vec![page.clone()]);
        assert!(!client.can_undo());

        client.delete_page(page.id);
        client.delete_page(page.id);
        assert!(client.binder().pages.is_empty());
        assert_eq!(client.sync().await.unwrap(), 2);
        assert!(!client.container().is_dirty());
    }
}
