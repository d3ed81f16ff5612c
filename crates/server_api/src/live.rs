//! Process-local view of who is connected: the presence registry, the
//! per-conversation broadcast groups and each connection's outbound channel.
//!
//! All of it is a cache rebuilt from nothing on restart. Each operation takes
//! the single lock once, so a register, join or disconnect is never observed
//! half-applied by another event.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::{
    domain::{ConnectionId, ConversationId, UserId},
    protocol::ServerEvent,
};
use tokio::sync::mpsc;

/// Outbound half of a live connection; the transport drains the receiver.
pub type ConnectionSender = mpsc::UnboundedSender<ServerEvent>;

#[derive(Clone, Default)]
pub struct LiveHub {
    inner: Arc<Mutex<HubState>>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, ConnectionSender>,
    presence: HashMap<UserId, ConnectionId>,
    groups: HashMap<ConversationId, HashSet<ConnectionId>>,
}

impl LiveHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        // A panic while holding the lock leaves the maps structurally valid.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connect(&self, sender: ConnectionSender) -> ConnectionId {
        let connection = ConnectionId::new();
        self.state().connections.insert(connection, sender);
        connection
    }

    /// Points `user_id` at `connection`, returning the connection it replaced.
    pub fn register(&self, user_id: UserId, connection: ConnectionId) -> Option<ConnectionId> {
        self.state().presence.insert(user_id, connection)
    }

    /// Drops whichever presence entry points at `connection`. Disconnects
    /// only know the connection, hence the reverse lookup.
    pub fn unregister_by_handle(&self, connection: ConnectionId) -> Option<UserId> {
        let mut state = self.state();
        remove_presence_for(&mut state, connection)
    }

    pub fn presence_of(&self, user_id: UserId) -> Option<ConnectionId> {
        self.state().presence.get(&user_id).copied()
    }

    pub fn registered_users(&self) -> usize {
        self.state().presence.len()
    }

    pub fn live_connections(&self) -> usize {
        self.state().connections.len()
    }

    /// Adds the connection to the conversation's group. Returns `false` when
    /// the connection is already gone.
    pub fn join(&self, connection: ConnectionId, conversation_id: ConversationId) -> bool {
        let mut state = self.state();
        if !state.connections.contains_key(&connection) {
            return false;
        }
        state
            .groups
            .entry(conversation_id)
            .or_default()
            .insert(connection);
        true
    }

    pub fn is_member(&self, conversation_id: ConversationId, connection: ConnectionId) -> bool {
        self.state()
            .groups
            .get(&conversation_id)
            .is_some_and(|members| members.contains(&connection))
    }

    pub fn group_size(&self, conversation_id: ConversationId) -> usize {
        self.state()
            .groups
            .get(&conversation_id)
            .map_or(0, HashSet::len)
    }

    /// Fire-and-forget push to every member. Returns how many channels
    /// accepted the event; a missing group is zero, not an error.
    pub fn broadcast(&self, conversation_id: ConversationId, event: &ServerEvent) -> usize {
        self.push_to_group(conversation_id, None, event)
    }

    /// Like [`broadcast`](Self::broadcast) but never echoes to `sender`.
    pub fn relay_typing(
        &self,
        conversation_id: ConversationId,
        sender: ConnectionId,
        event: &ServerEvent,
    ) -> usize {
        self.push_to_group(conversation_id, Some(sender), event)
    }

    pub fn send_to(&self, connection: ConnectionId, event: ServerEvent) -> bool {
        self.state()
            .connections
            .get(&connection)
            .is_some_and(|sender| sender.send(event).is_ok())
    }

    /// Forgets everything about `connection`: its presence entry, its group
    /// memberships and its outbound channel. Idempotent.
    pub fn disconnect(&self, connection: ConnectionId) -> Option<UserId> {
        let mut state = self.state();
        state.connections.remove(&connection);
        state.groups.retain(|_, members| {
            members.remove(&connection);
            !members.is_empty()
        });
        remove_presence_for(&mut state, connection)
    }

    fn push_to_group(
        &self,
        conversation_id: ConversationId,
        skip: Option<ConnectionId>,
        event: &ServerEvent,
    ) -> usize {
        let state = self.state();
        let Some(members) = state.groups.get(&conversation_id) else {
            return 0;
        };

        members
            .iter()
            .filter(|member| Some(**member) != skip)
            .filter_map(|member| state.connections.get(member))
            .filter(|sender| sender.send(event.clone()).is_ok())
            .count()
    }
}

fn remove_presence_for(state: &mut HubState, connection: ConnectionId) -> Option<UserId> {
    let user_id = state
        .presence
        .iter()
        .find_map(|(user_id, registered)| (*registered == connection).then_some(*user_id))?;
    state.presence.remove(&user_id);
    Some(user_id)
}

#[cfg(test)]
#[path = "tests/live_tests.rs"]
mod tests;
