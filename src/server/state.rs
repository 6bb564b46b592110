//! Shared chat state: connection registry, user directory, conversation store
//!
//! The three maps the whole server mutates live in one aggregate behind a
//! single lock, and every mutation goes through a compound operation that
//! holds the write guard from start to finish. A route racing a teardown
//! therefore observes either the pre- or the post-teardown state, never a
//! half-removed connection.
//!
//! Fan-out never writes to a socket directly: it enqueues pre-encoded
//! frames into each session's outbound queue, so one slow receiver cannot
//! stall delivery to the others.

use std::collections::HashMap;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info, warn};

use crate::protocol::codec;
use crate::protocol::messages::{
    ChatMessage, ConnId, ConversationEntry, ConversationKey, Package, RosterEntry, RosterSync,
    StoreSync,
};
use crate::server::session::SessionCommand;

/// Result of routing one chat package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Appended and fanned out
    Delivered,
    /// Sender has no directory name yet; dropped
    DroppedUnregistered,
    /// Target pair entry does not exist (unregistered or departed); dropped
    DroppedMissingPeer,
}

/// The coordinating owner of all shared chat state
pub struct ChatState {
    inner: RwLock<StateInner>,
}

struct StateInner {
    /// Next connection id; strictly increasing, never reused
    next_conn_id: ConnId,
    /// Connection registry: id -> outbound queue of the session's writer
    connections: HashMap<ConnId, mpsc::UnboundedSender<SessionCommand>>,
    /// User directory: id -> display name, absent until registration
    users: HashMap<ConnId, String>,
    /// Conversation store; the Global log is created once and never removed
    conversations: HashMap<ConversationKey, Vec<ChatMessage>>,
}

impl ChatState {
    pub fn new() -> Self {
        let mut conversations = HashMap::new();
        conversations.insert(ConversationKey::Global, Vec::new());

        Self {
            inner: RwLock::new(StateInner {
                next_conn_id: 0,
                connections: HashMap::new(),
                users: HashMap::new(),
                conversations,
            }),
        }
    }

    /// Register a newly accepted connection and assign its id
    pub async fn add_connection(&self, tx: mpsc::UnboundedSender<SessionCommand>) -> ConnId {
        let mut inner = self.inner.write().await;
        let id = inner.next_conn_id;
        inner.next_conn_id += 1;
        inner.connections.insert(id, tx);
        id
    }

    /// Number of live connections
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Apply a registration package: upsert the display name, seed private
    /// conversations against every other registered connection, announce
    /// the join, and push store + roster to everyone.
    pub async fn register(&self, id: ConnId, name: &str) {
        let mut inner = self.inner.write().await;

        // A registration racing its own teardown is a no-op
        if !inner.connections.contains_key(&id) {
            return;
        }

        let previous = inner.users.insert(id, name.to_string());
        match previous {
            Some(old) => info!(id, old = %old, new = name, "user renamed"),
            None => info!(id, name, "connection registered"),
        }

        // Seed mirrored empty entries so private chats are addressable
        // before any message is sent
        let others: Vec<ConnId> = inner
            .users
            .keys()
            .copied()
            .filter(|&other| other != id)
            .collect();
        for other in others {
            inner
                .conversations
                .entry(ConversationKey::direct(id, other))
                .or_default();
            inner
                .conversations
                .entry(ConversationKey::direct(other, id))
                .or_default();
        }

        inner.append_global(ChatMessage::system(format!("{name} joined. Welcome!")));
        inner.fan_out_store();
        inner.fan_out_roster();
        inner.log_roster();
    }

    /// Route one chat package from a registered sender
    pub async fn route(&self, package: &Package, sender_id: ConnId) -> RouteOutcome {
        let mut inner = self.inner.write().await;

        let sender = match inner.users.get(&sender_id) {
            Some(name) => name.clone(),
            None => {
                // Registration must precede chat
                warn!(sender_id, "dropping chat package from unregistered sender");
                return RouteOutcome::DroppedUnregistered;
            }
        };

        let message = ChatMessage::user(&sender, package.message.clone(), package.files.clone());

        if package.is_for_all {
            inner.append_global(message);
        } else {
            let out = ConversationKey::direct(sender_id, package.receiver_id);
            let back = out.mirror();
            if !inner.conversations.contains_key(&out) || !inner.conversations.contains_key(&back) {
                debug!(
                    sender_id,
                    receiver_id = package.receiver_id,
                    "dropping direct message: no such conversation"
                );
                return RouteOutcome::DroppedMissingPeer;
            }
            // Mirror the append so both orderings stay identical
            inner
                .conversations
                .entry(out)
                .or_default()
                .push(message.clone());
            inner.conversations.entry(back).or_default().push(message);
        }

        inner.fan_out_store();
        RouteOutcome::Delivered
    }

    /// Tear down one connection: registry entry, directory entry, and every
    /// conversation mentioning the id are removed as one unit. Idempotent.
    pub async fn teardown(&self, id: ConnId) {
        let mut inner = self.inner.write().await;

        let had_connection = inner.connections.remove(&id).is_some();
        let name = inner.users.remove(&id);
        if !had_connection && name.is_none() {
            return;
        }

        inner.conversations.retain(|key, _| !key.mentions(id));

        match name {
            Some(name) => {
                info!(id, name = %name, "user disconnected");
                inner.append_global(ChatMessage::system(format!("{name} left.")));
            }
            None => info!(id, "unregistered connection closed"),
        }

        inner.fan_out_store();
        inner.fan_out_roster();
        inner.log_roster();
    }

    /// Ask every live session to close (server shutdown)
    pub async fn close_all(&self) {
        let inner = self.inner.read().await;
        for tx in inner.connections.values() {
            let _ = tx.send(SessionCommand::Close);
        }
    }

    /// Snapshot of the full conversation store
    pub async fn store_snapshot(&self) -> StoreSync {
        self.inner.read().await.store_sync()
    }

    /// Snapshot of the roster as pushed to the given connection
    pub async fn roster_snapshot(&self, you: ConnId) -> RosterSync {
        self.inner.read().await.roster_sync(you)
    }
}

impl Default for ChatState {
    fn default() -> Self {
        Self::new()
    }
}

impl StateInner {
    fn append_global(&mut self, message: ChatMessage) {
        self.conversations
            .entry(ConversationKey::Global)
            .or_default()
            .push(message);
    }

    fn store_sync(&self) -> StoreSync {
        StoreSync {
            conversations: self
                .conversations
                .iter()
                .map(|(key, messages)| ConversationEntry {
                    key: *key,
                    messages: messages.clone(),
                })
                .collect(),
        }
    }

    fn roster_sync(&self, you: ConnId) -> RosterSync {
        let mut users: Vec<RosterEntry> = self
            .users
            .iter()
            .map(|(&id, name)| RosterEntry {
                id,
                name: name.clone(),
            })
            .collect();
        users.sort_by_key(|entry| entry.id);

        RosterSync { you, users }
    }

    /// Push the entire store to every live connection
    fn fan_out_store(&self) {
        let bytes = match codec::encode(&self.store_sync()) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to encode store sync: {e}");
                return;
            }
        };

        for tx in self.connections.values() {
            // A closed queue means the session is already on its way out
            let _ = tx.send(SessionCommand::Deliver(bytes.clone()));
        }
    }

    /// Push the roster to every live connection, personalized with the
    /// recipient's own id
    fn fan_out_roster(&self) {
        for (&id, tx) in &self.connections {
            match codec::encode(&self.roster_sync(id)) {
                Ok(bytes) => {
                    let _ = tx.send(SessionCommand::Deliver(bytes));
                }
                Err(e) => error!(id, "failed to encode roster sync: {e}"),
            }
        }
    }

    fn log_roster(&self) {
        let mut roster: Vec<(ConnId, &str)> = self
            .users
            .iter()
            .map(|(&id, name)| (id, name.as_str()))
            .collect();
        roster.sort_by_key(|(id, _)| *id);
        debug!(?roster, "active users");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::Inbound;
    use crate::protocol::frame::Frame;

    async fn connect(state: &ChatState) -> (ConnId, mpsc::UnboundedReceiver<SessionCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = state.add_connection(tx).await;
        (id, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionCommand>) -> Vec<Inbound> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            if let SessionCommand::Deliver(bytes) = cmd {
                let frame = Frame::decode_complete(&bytes).unwrap();
                out.push(Inbound::decode(&frame).unwrap());
            }
        }
        out
    }

    fn last_roster(events: &[Inbound]) -> Option<&RosterSync> {
        events.iter().rev().find_map(|event| match event {
            Inbound::RosterSync(roster) => Some(roster),
            _ => None,
        })
    }

    fn last_store(events: &[Inbound]) -> Option<&StoreSync> {
        events.iter().rev().find_map(|event| match event {
            Inbound::StoreSync(store) => Some(store),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_ids_monotonic_and_never_reused() {
        let state = ChatState::new();

        let (a, _rx_a) = connect(&state).await;
        let (b, _rx_b) = connect(&state).await;
        assert!(b > a);

        state.teardown(a).await;

        let (c, _rx_c) = connect(&state).await;
        assert!(c > b);
    }

    #[tokio::test]
    async fn test_register_seeds_mirrored_pairs() {
        let state = ChatState::new();
        let (a, _rx_a) = connect(&state).await;
        let (b, _rx_b) = connect(&state).await;

        state.register(a, "Alice").await;

        // Only one name registered: no pairs yet
        let store = state.store_snapshot().await;
        assert!(store.conversation(&ConversationKey::direct(a, b)).is_none());

        state.register(b, "Bob").await;

        // Second member registered: both orderings exist and are empty
        let store = state.store_snapshot().await;
        assert_eq!(
            store.conversation(&ConversationKey::direct(a, b)),
            Some(&[][..])
        );
        assert_eq!(
            store.conversation(&ConversationKey::direct(b, a)),
            Some(&[][..])
        );

        // Both joins were announced in the global log
        let joined: Vec<_> = store
            .global()
            .iter()
            .filter(|m| m.body.ends_with("joined. Welcome!"))
            .collect();
        assert_eq!(joined.len(), 2);
    }

    #[tokio::test]
    async fn test_direct_message_symmetry() {
        let state = ChatState::new();
        let (a, _rx_a) = connect(&state).await;
        let (b, _rx_b) = connect(&state).await;
        state.register(a, "Alice").await;
        state.register(b, "Bob").await;

        let global_before = state.store_snapshot().await.global().len();

        let outcome = state.route(&Package::direct(b, "hey", vec![]), a).await;
        assert_eq!(outcome, RouteOutcome::Delivered);

        let store = state.store_snapshot().await;
        let out = store.conversation(&ConversationKey::direct(a, b)).unwrap();
        let back = store.conversation(&ConversationKey::direct(b, a)).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out, back);
        assert_eq!(out[0].body, "hey");
        assert!(out[0].display_line().contains("Alice: hey"));

        // The global log is untouched by a direct message
        assert_eq!(store.global().len(), global_before);
    }

    #[tokio::test]
    async fn test_broadcast_appends_once_and_reaches_everyone() {
        let state = ChatState::new();
        let (a, mut rx_a) = connect(&state).await;
        let (b, mut rx_b) = connect(&state).await;
        state.register(a, "Alice").await;
        state.register(b, "Bob").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        let outcome = state.route(&Package::broadcast("hi", vec![]), a).await;
        assert_eq!(outcome, RouteOutcome::Delivered);

        let store = state.store_snapshot().await;
        let hits: Vec<_> = store.global().iter().filter(|m| m.body == "hi").collect();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].display_line().contains("Alice: hi"));

        // Every connection received the updated full store
        for rx in [&mut rx_a, &mut rx_b] {
            let events = drain(rx);
            let synced = last_store(&events).expect("no store sync pushed");
            assert!(synced.global().iter().any(|m| m.body == "hi"));
        }
    }

    #[tokio::test]
    async fn test_route_from_unregistered_sender_is_dropped() {
        let state = ChatState::new();
        let (a, _rx_a) = connect(&state).await;

        let outcome = state.route(&Package::broadcast("hi", vec![]), a).await;
        assert_eq!(outcome, RouteOutcome::DroppedUnregistered);

        assert!(state.store_snapshot().await.global().is_empty());
    }

    #[tokio::test]
    async fn test_route_to_missing_pair_is_dropped() {
        let state = ChatState::new();
        let (a, _rx_a) = connect(&state).await;
        state.register(a, "Alice").await;

        let outcome = state.route(&Package::direct(99, "hey", vec![]), a).await;
        assert_eq!(outcome, RouteOutcome::DroppedMissingPeer);

        let store = state.store_snapshot().await;
        assert!(store.conversation(&ConversationKey::direct(a, 99)).is_none());
        assert!(!store.global().iter().any(|m| m.body == "hey"));
    }

    #[tokio::test]
    async fn test_teardown_completeness() {
        let state = ChatState::new();
        let (a, mut rx_a) = connect(&state).await;
        let (b, _rx_b) = connect(&state).await;
        state.register(a, "Alice").await;
        state.register(b, "Bob").await;
        state.route(&Package::direct(b, "hey", vec![]), a).await;
        drain(&mut rx_a);

        state.teardown(b).await;

        let store = state.store_snapshot().await;
        assert!(store
            .conversations
            .iter()
            .all(|entry| !entry.key.mentions(b)));
        assert!(store.global().iter().any(|m| m.body == "Bob left."));

        let roster = state.roster_snapshot(a).await;
        assert_eq!(roster.users.len(), 1);
        assert_eq!(roster.name_of(a), Some("Alice"));
        assert_eq!(roster.name_of(b), None);

        // The survivor was pushed the post-teardown state
        let events = drain(&mut rx_a);
        let synced = last_store(&events).unwrap();
        assert!(synced.conversations.iter().all(|e| !e.key.mentions(b)));
        assert_eq!(last_roster(&events).unwrap().users.len(), 1);

        // Removing an already-removed connection is a no-op
        state.teardown(b).await;
        let store = state.store_snapshot().await;
        let leaves: Vec<_> = store
            .global()
            .iter()
            .filter(|m| m.body == "Bob left.")
            .collect();
        assert_eq!(leaves.len(), 1);
    }

    #[tokio::test]
    async fn test_teardown_of_unregistered_connection() {
        let state = ChatState::new();
        let (a, _rx_a) = connect(&state).await;

        state.teardown(a).await;

        assert_eq!(state.connection_count().await, 0);
        assert!(state.store_snapshot().await.global().is_empty());
    }

    #[tokio::test]
    async fn test_rename_overwrites() {
        let state = ChatState::new();
        let (a, _rx_a) = connect(&state).await;

        state.register(a, "Alice").await;
        state.register(a, "Alicia").await;

        let roster = state.roster_snapshot(a).await;
        assert_eq!(roster.users.len(), 1);
        assert_eq!(roster.name_of(a), Some("Alicia"));

        // Each registration is announced
        let store = state.store_snapshot().await;
        assert!(store
            .global()
            .iter()
            .any(|m| m.body == "Alicia joined. Welcome!"));
    }

    #[tokio::test]
    async fn test_roster_is_personalized() {
        let state = ChatState::new();
        let (a, mut rx_a) = connect(&state).await;
        let (b, mut rx_b) = connect(&state).await;
        state.register(a, "Alice").await;
        state.register(b, "Bob").await;

        let roster_a = drain(&mut rx_a);
        let roster_b = drain(&mut rx_b);

        assert_eq!(last_roster(&roster_a).unwrap().you, a);
        assert_eq!(last_roster(&roster_b).unwrap().you, b);
        assert_eq!(last_roster(&roster_a).unwrap().users.len(), 2);
    }

    #[tokio::test]
    async fn test_message_with_attachments_renders_file_clause() {
        let state = ChatState::new();
        let (a, _rx_a) = connect(&state).await;
        state.register(a, "Alice").await;

        state
            .route(&Package::broadcast("photos", vec![4, 5]), a)
            .await;

        let store = state.store_snapshot().await;
        let msg = store
            .global()
            .iter()
            .find(|m| m.body == "photos")
            .unwrap();
        assert_eq!(msg.files, vec![4, 5]);
        assert!(msg.display_line().contains("{2 files} Alice: photos"));
    }
}
