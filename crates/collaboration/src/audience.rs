/// Roster of the clients connected to a container
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::{EventEmitter, Subscription, UserColor, UserId};

/// A connected user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: UserId,
    pub name: String,
    pub color: UserColor,
}

impl Member {
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            color: UserColor::from_user_id(id),
        }
    }

    /// Throwaway identity for local sessions without sign-in
    pub fn test_user() -> Self {
        Self::new(UserId::new(), "[TEST USER]")
    }
}

/// Emitted whenever the roster changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembersChanged {
    pub joined: Vec<UserId>,
    pub left: Vec<UserId>,
}

/// The members currently connected, keyed by client id, as seen by one
/// client.
#[derive(Clone)]
pub struct Audience {
    myself: Member,
    members: Arc<RwLock<HashMap<UserId, Member>>>,
    changes: Arc<EventEmitter<MembersChanged>>,
}

impl Audience {
    pub fn new(myself: Member) -> Self {
        let members = HashMap::from([(myself.id, myself.clone())]);
        Self {
            members: Arc::new(RwLock::new(members)),
            myself,
            changes: Arc::new(EventEmitter::new()),
        }
    }

    pub fn myself(&self) -> &Member {
        &self.myself
    }

    /// Every member, ordered by name
    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.members.read().values().cloned().collect();
        members.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        members
    }

    pub fn member_ids(&self) -> HashSet<UserId> {
        self.members.read().keys().copied().collect()
    }

    pub fn on_members_changed<F>(&self, listener: F) -> Subscription
    where
        F: FnMut(&MembersChanged) + Send + 'static,
    {
        self.changes.subscribe(listener)
    }

    /// Replaces the roster and notifies listeners if it changed.
    /// Returns whether anything changed.
    pub(crate) fn replace(&self, roster: Vec<Member>) -> bool {
        let event = {
            let mut members = self.members.write();
            let roster: HashMap<UserId, Member> =
                roster.into_iter().map(|m| (m.id, m)).collect();
            let mut joined: Vec<UserId> = roster
                .keys()
                .filter(|id| !members.contains_key(id))
                .copied()
                .collect();
            let mut left: Vec<UserId> = members
                .keys()
                .filter(|id| !roster.contains_key(id))
                .copied()
                .collect();
            joined.sort();
            left.sort();
            *members = roster;
            MembersChanged { joined, left }
        };

        if event.joined.is_empty() && event.left.is_empty() {
            return false;
        }
        self.changes.emit(&event);
        true
    }
}

impl std::fmt::Debug for Audience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Audience")
            .field("myself", &self.myself)
            .field("members", &self.members())
            .finish()
    }
}
