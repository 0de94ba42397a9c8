/// Container hosting and connection lifecycle
/// An in-process service keeps the operation logs and roster of each
/// container, sequences encoded operations and relays them to every
/// connected client
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use board::{Board, BoardCommand};

use crate::{
    clean_session_data, Audience, Binder, BinderCommand, CollaborationError, ContainerId,
    Document, EventEmitter, Member, Operation, OperationLog, Origin, Result, Session,
    SessionCommand, SharedTree, Subscription, TreeChanged, UserId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    EstablishingConnection,
    CatchingUp,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::EstablishingConnection => "connecting",
            ConnectionState::CatchingUp => "catching up",
            ConnectionState::Connected => "connected",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEvent {
    Connected,
    Disconnected,
    /// Local edits exist that the service has not acknowledged
    Dirty,
    /// Every local edit has been acknowledged
    Saved,
    Disposed,
}

/// Which shared tree of a container a payload belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Channel {
    App,
    Session,
    Binder,
}

/// Messages delivered from the service to one connected client
#[derive(Debug, Clone)]
enum ServiceMessage {
    /// An operation and its position in the channel's log
    Operation {
        channel: Channel,
        seq: usize,
        payload: Vec<u8>,
    },
    Roster {
        members: Vec<Member>,
    },
}

/// Container information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub member_count: usize,
    pub app_operations: usize,
    pub session_operations: usize,
    pub binder_operations: usize,
}

/// How far a client has read each channel's log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Cursors {
    app: usize,
    session: usize,
    binder: usize,
}

struct Joined {
    inbox: mpsc::UnboundedReceiver<ServiceMessage>,
    app: Vec<Operation<BoardCommand>>,
    session: Vec<Operation<SessionCommand>>,
    binder: Vec<Operation<BinderCommand>>,
    members: Vec<Member>,
}

/// Service-side state of one container
struct HostedContainer {
    id: ContainerId,
    app_log: OperationLog<BoardCommand>,
    session_log: OperationLog<SessionCommand>,
    binder_log: OperationLog<BinderCommand>,
    members: Vec<Member>,
    inboxes: HashMap<UserId, mpsc::UnboundedSender<ServiceMessage>>,
}

/// Appends a decoded operation to `log`. Returns its position, or `None`
/// when the log already holds it.
fn sequence<C>(log: &mut OperationLog<C>, payload: &[u8]) -> Result<Option<usize>>
where
    C: Serialize + DeserializeOwned,
{
    let op = Operation::<C>::decode(payload)?;
    Ok(log.add_operation(op).then(|| log.len() - 1))
}

impl HostedContainer {
    fn new(id: ContainerId) -> Self {
        Self {
            id,
            app_log: OperationLog::new(),
            session_log: OperationLog::new(),
            binder_log: OperationLog::new(),
            members: Vec::new(),
            inboxes: HashMap::new(),
        }
    }

    fn broadcast(&self, message: ServiceMessage) {
        for (member, tx) in &self.inboxes {
            if tx.send(message.clone()).is_err() {
                debug!("inbox of {} in {} is closed", member, self.id);
            }
        }
    }

    fn broadcast_roster(&self) {
        self.broadcast(ServiceMessage::Roster {
            members: self.members.clone(),
        });
    }

    fn get_info(&self) -> ContainerInfo {
        ContainerInfo {
            id: self.id.clone(),
            member_count: self.members.len(),
            app_operations: self.app_log.len(),
            session_operations: self.session_log.len(),
            binder_operations: self.binder_log.len(),
        }
    }
}

/// In-process container service shared by every client of a process
#[derive(Clone, Default)]
pub struct ContainerService {
    containers: Arc<RwLock<HashMap<ContainerId, HostedContainer>>>,
}

impl ContainerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new, empty container with a generated id
    pub async fn create_container(&self) -> Result<ContainerId> {
        let id = ContainerId::generate();
        self.create_container_with_id(id.clone()).await?;
        Ok(id)
    }

    pub async fn create_container_with_id(&self, id: ContainerId) -> Result<()> {
        let mut containers = self.containers.write().await;

        if containers.contains_key(&id) {
            return Err(CollaborationError::ContainerExists(id));
        }

        info!("created container {}", id);
        containers.insert(id.clone(), HostedContainer::new(id));
        Ok(())
    }

    /// Get container info
    pub async fn container_info(&self, id: &ContainerId) -> Option<ContainerInfo> {
        let containers = self.containers.read().await;
        containers.get(id).map(|c| c.get_info())
    }

    /// Registers `member` and hands back every operation past `from`.
    async fn join(&self, id: &ContainerId, member: Member, from: Cursors) -> Result<Joined> {
        let mut containers = self.containers.write().await;

        let container = containers
            .get_mut(id)
            .ok_or_else(|| CollaborationError::ContainerNotFound(id.clone()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let member_id = member.id;
        container.members.retain(|m| m.id != member_id);
        container.members.push(member);
        container.inboxes.insert(member_id, tx);
        container.broadcast_roster();

        Ok(Joined {
            inbox: rx,
            app: container.app_log.since(from.app).to_vec(),
            session: container.session_log.since(from.session).to_vec(),
            binder: container.binder_log.since(from.binder).to_vec(),
            members: container.members.clone(),
        })
    }

    async fn leave(&self, id: &ContainerId, member_id: UserId) -> Result<()> {
        let mut containers = self.containers.write().await;

        let container = containers
            .get_mut(id)
            .ok_or_else(|| CollaborationError::ContainerNotFound(id.clone()))?;

        container.inboxes.remove(&member_id);
        container.members.retain(|m| m.id != member_id);
        container.broadcast_roster();
        Ok(())
    }

    /// Appends an encoded operation to the container's log and relays it,
    /// with its position, to every connected client including the sender.
    async fn submit(&self, id: &ContainerId, channel: Channel, payload: Vec<u8>) -> Result<()> {
        let mut containers = self.containers.write().await;

        let container = containers
            .get_mut(id)
            .ok_or_else(|| CollaborationError::ContainerNotFound(id.clone()))?;

        let seq = match channel {
            Channel::App => sequence(&mut container.app_log, &payload)?,
            Channel::Session => sequence(&mut container.session_log, &payload)?,
            Channel::Binder => sequence(&mut container.binder_log, &payload)?,
        };
        if let Some(seq) = seq {
            container.broadcast(ServiceMessage::Operation {
                channel,
                seq,
                payload,
            });
        }
        Ok(())
    }
}

/// Sends the unsent edits of `tree`, marking each one as it is accepted.
async fn send_unsent<D: Document>(
    service: &ContainerService,
    id: &ContainerId,
    channel: Channel,
    tree: &mut SharedTree<D>,
) -> Result<()> {
    for op in tree.unsent() {
        service.submit(id, channel, op.encode()?).await?;
        tree.mark_sent(op.id);
    }
    Ok(())
}

/// Applies one relayed operation unless `cursor` is already past it.
fn deliver<D: Document>(
    tree: &mut SharedTree<D>,
    cursor: &mut usize,
    seq: usize,
    payload: &[u8],
) {
    if seq < *cursor {
        return;
    }
    *cursor = seq + 1;
    match Operation::<D::Command>::decode(payload) {
        Ok(op) => {
            tree.apply_sequenced(op);
        }
        Err(err) => debug!("undecodable operation {}: {}", seq, err),
    }
}

/// A client's connection to one container: the app, session and binder
/// trees, the roster and the connection state.
pub struct Container {
    id: ContainerId,
    service: ContainerService,
    state: ConnectionState,
    app: SharedTree<Board>,
    session: SharedTree<Session>,
    binder: SharedTree<Binder>,
    cursors: Cursors,
    audience: Audience,
    inbox: Option<mpsc::UnboundedReceiver<ServiceMessage>>,
    events: Arc<EventEmitter<ContainerEvent>>,
    dirty: Arc<AtomicBool>,
    _dirty_tracking: [Subscription; 3],
}

impl Container {
    fn new(service: ContainerService, id: ContainerId, user: Member) -> Self {
        let app = SharedTree::new(user.id);
        let session = SharedTree::new(user.id);
        let binder = SharedTree::new(user.id);
        let events = Arc::new(EventEmitter::new());
        let dirty = Arc::new(AtomicBool::new(false));

        let tracker = |events: Arc<EventEmitter<ContainerEvent>>, dirty: Arc<AtomicBool>| {
            move |change: &TreeChanged| {
                if change.origin == Origin::Local && !dirty.swap(true, Ordering::SeqCst) {
                    events.emit(&ContainerEvent::Dirty);
                }
            }
        };
        let tracking = [
            app.on_change(tracker(events.clone(), dirty.clone())),
            session.on_change(tracker(events.clone(), dirty.clone())),
            binder.on_change(tracker(events.clone(), dirty.clone())),
        ];

        Self {
            id,
            service,
            state: ConnectionState::Disconnected,
            app,
            session,
            binder,
            cursors: Cursors::default(),
            audience: Audience::new(user),
            inbox: None,
            events,
            dirty,
            _dirty_tracking: tracking,
        }
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    pub fn client_id(&self) -> UserId {
        self.audience.myself().id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn app(&self) -> &SharedTree<Board> {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut SharedTree<Board> {
        &mut self.app
    }

    pub fn session(&self) -> &SharedTree<Session> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SharedTree<Session> {
        &mut self.session
    }

    pub fn binder(&self) -> &SharedTree<Binder> {
        &self.binder
    }

    pub fn binder_mut(&mut self) -> &mut SharedTree<Binder> {
        &mut self.binder
    }

    pub fn audience(&self) -> &Audience {
        &self.audience
    }

    pub fn on_event<F>(&self, listener: F) -> Subscription
    where
        F: FnMut(&ContainerEvent) + Send + 'static,
    {
        self.events.subscribe(listener)
    }

    fn set_state(&mut self, state: ConnectionState) {
        debug!("container {} is {}", self.id, state);
        self.state = state;
    }

    /// Joins the container on the service and catches up with everything
    /// sequenced since this client last read the logs.
    async fn connect(&mut self) -> Result<()> {
        self.set_state(ConnectionState::EstablishingConnection);
        let joined = match self
            .service
            .join(&self.id, self.audience.myself().clone(), self.cursors)
            .await
        {
            Ok(joined) => joined,
            Err(err) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(err);
            }
        };

        self.set_state(ConnectionState::CatchingUp);
        debug!(
            "catching up on {} app, {} session and {} binder operations",
            joined.app.len(),
            joined.session.len(),
            joined.binder.len()
        );
        for op in joined.app {
            self.app.apply_sequenced(op);
            self.cursors.app += 1;
        }
        for op in joined.session {
            self.session.apply_sequenced(op);
            self.cursors.session += 1;
        }
        for op in joined.binder {
            self.binder.apply_sequenced(op);
            self.cursors.binder += 1;
        }
        self.audience.replace(joined.members);
        self.inbox = Some(joined.inbox);

        self.set_state(ConnectionState::Connected);
        info!(
            "client {} connected to container {}",
            self.client_id(),
            self.id
        );
        self.events.emit(&ContainerEvent::Connected);

        clean_session_data(&mut self.session, &self.audience.member_ids());
        self.flush().await?;
        self.process_incoming();
        Ok(())
    }

    /// Sends pending local edits to the service. Edits that could not be
    /// sent stay queued for the next flush.
    pub async fn flush(&mut self) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(CollaborationError::NetworkError(format!(
                "container {} is {}",
                self.id, self.state
            )));
        }

        send_unsent(&self.service, &self.id, Channel::App, &mut self.app).await?;
        send_unsent(&self.service, &self.id, Channel::Session, &mut self.session).await?;
        send_unsent(&self.service, &self.id, Channel::Binder, &mut self.binder).await
    }

    /// Applies everything the service has delivered since the last call.
    /// Returns the number of messages handled.
    pub fn process_incoming(&mut self) -> usize {
        let Some(inbox) = self.inbox.as_mut() else {
            return 0;
        };

        let mut messages = Vec::new();
        while let Ok(message) = inbox.try_recv() {
            messages.push(message);
        }

        let handled = messages.len();
        let mut roster_changed = false;
        for message in messages {
            match message {
                ServiceMessage::Operation {
                    channel,
                    seq,
                    payload,
                } => match channel {
                    Channel::App => deliver(&mut self.app, &mut self.cursors.app, seq, &payload),
                    Channel::Session => {
                        deliver(&mut self.session, &mut self.cursors.session, seq, &payload)
                    }
                    Channel::Binder => {
                        deliver(&mut self.binder, &mut self.cursors.binder, seq, &payload)
                    }
                },
                ServiceMessage::Roster { members } => {
                    roster_changed |= self.audience.replace(members);
                }
            }
        }

        if roster_changed {
            let removed = clean_session_data(&mut self.session, &self.audience.member_ids());
            if removed > 0 {
                debug!("removed {} stale session records", removed);
            }
        }

        let pending =
            self.app.has_pending() || self.session.has_pending() || self.binder.has_pending();
        if !pending && self.dirty.swap(false, Ordering::SeqCst) {
            self.events.emit(&ContainerEvent::Saved);
        }
        handled
    }

    /// Leaves the container. Local edits are kept and sent on reconnect.
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.state == ConnectionState::Disconnected {
            return Ok(());
        }
        self.inbox = None;
        let result = self.service.leave(&self.id, self.client_id()).await;
        self.set_state(ConnectionState::Disconnected);
        self.events.emit(&ContainerEvent::Disconnected);
        result
    }

    /// Tears the connection down and joins again, catching up with every
    /// operation the service accepted in the meantime.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.disconnect().await?;
        self.connect().await
    }

    pub async fn dispose(mut self) -> Result<()> {
        let result = self.disconnect().await;
        self.events.emit(&ContainerEvent::Disposed);
        result
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

/// Opens a container. An empty `container_id` creates a new container;
/// any other id joins the existing one.
pub async fn load_container(
    service: &ContainerService,
    container_id: &str,
    user: Member,
) -> Result<Container> {
    let id = if container_id.is_empty() {
        service.create_container().await?
    } else {
        ContainerId(container_id.to_string())
    };

    let mut container = Container::new(service.clone(), id, user);
    container.connect().await?;
    Ok(container)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutations::add_note;
    use crate::{add_page, ListId};
    use parking_lot::Mutex;

    #[test]
    fn test_connection_state_labels() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
        assert_eq!(
            ConnectionState::EstablishingConnection.to_string(),
            "connecting"
        );
        assert_eq!(ConnectionState::CatchingUp.to_string(), "catching up");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }

    #[tokio::test]
    async fn test_container_creation() {
        let service = ContainerService::new();
        let id = ContainerId("board".to_string());

        let result = service.create_container_with_id(id.clone()).await;
        assert!(result.is_ok());

        // Try creating again - should fail
        let result = service.create_container_with_id(id).await;
        assert!(matches!(result, Err(CollaborationError::ContainerExists(_))));
    }

    #[tokio::test]
    async fn test_load_unknown_container_fails() {
        let service = ContainerService::new();
        let result = load_container(&service, "missing", Member::test_user()).await;
        assert!(matches!(
            result,
            Err(CollaborationError::ContainerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_id_creates_container() {
        let service = ContainerService::new();
        let container = load_container(&service, "", Member::test_user())
            .await
            .unwrap();

        assert_eq!(container.connection_state(), ConnectionState::Connected);
        assert!(!container.is_dirty());
        let info = service.container_info(container.id()).await.unwrap();
        assert_eq!(info.member_count, 1);
        assert_eq!(info.app_operations, 0);
    }

    #[tokio::test]
    async fn test_dirty_then_saved() {
        let service = ContainerService::new();
        let mut container = load_container(&service, "", Member::test_user())
            .await
            .unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        let _sub = container.on_event(move |ev| e.lock().push(*ev));

        let author = container.client_id();
        add_note(container.app_mut(), ListId::Items, "a", author);
        add_note(container.app_mut(), ListId::Items, "b", author);
        assert!(container.is_dirty());

        container.flush().await.unwrap();
        // sent, but the echo has not been read yet
        assert!(container.is_dirty());
        assert_eq!(container.process_incoming(), 2);
        assert!(!container.is_dirty());
        assert_eq!(
            *events.lock(),
            vec![ContainerEvent::Dirty, ContainerEvent::Saved]
        );
        let info = service.container_info(container.id()).await.unwrap();
        assert_eq!(info.app_operations, 2);
    }

    #[tokio::test]
    async fn test_flush_while_disconnected_fails() {
        let service = ContainerService::new();
        let mut container = load_container(&service, "", Member::test_user())
            .await
            .unwrap();
        container.disconnect().await.unwrap();

        let author = container.client_id();
        add_note(container.app_mut(), ListId::Items, "offline", author);
        assert!(matches!(
            container.flush().await,
            Err(CollaborationError::NetworkError(_))
        ));
        assert!(container.is_dirty());

        container.reconnect().await.unwrap();
        assert!(!container.is_dirty());
        let info = service.container_info(container.id()).await.unwrap();
        assert_eq!(info.app_operations, 1);
    }

    #[tokio::test]
    async fn test_dispose_emits_events() {
        let service = ContainerService::new();
        let container = load_container(&service, "", Member::test_user())
            .await
            .unwrap();
        let id = container.id().clone();
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        let _sub = container.on_event(move |ev| e.lock().push(*ev));

        container.dispose().await.unwrap();
        assert_eq!(
            *events.lock(),
            vec![ContainerEvent::Disconnected, ContainerEvent::Disposed]
        );
        assert_eq!(service.container_info(&id).await.unwrap().member_count, 0);
    }

    #[tokio::test]
    async fn test_reconnect_acknowledges_sent_edits_once() {
        let service = ContainerService::new();
        let mut container = load_container(&service, "", Member::test_user())
            .await
            .unwrap();
        let author = container.client_id();
        add_note(container.app_mut(), ListId::Items, "in flight", author);
        container.flush().await.unwrap();

        // the echo is dropped with the inbox
        container.disconnect().await.unwrap();
        assert!(container.is_dirty());

        container.reconnect().await.unwrap();
        assert!(!container.is_dirty());
        assert!(!container.app().has_pending());
        assert_eq!(container.app().root().items().len(), 1);
        let info = service.container_info(container.id()).await.unwrap();
        assert_eq!(info.app_operations, 1);
    }

    #[tokio::test]
    async fn test_binder_pages_replicate() {
        let service = ContainerService::new();
        let mut alice = load_container(&service, "", Member::test_user())
            .await
            .unwrap();
        let mut bob = load_container(&service, alice.id().as_str(), Member::test_user())
            .await
            .unwrap();

        let page = add_page(alice.binder_mut(), board::NodeId::new(), "Retro").unwrap();
        alice.flush().await.unwrap();
        alice.process_incoming();
        bob.process_incoming();

        assert_eq!(bob.binder().root().pages, vec![page]);
        let info = service.container_info(alice.id()).await.unwrap();
        assert_eq!(info.binder_operations, 1);
    }
}
