use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::mpsc;

use super::protocol::{self, ConversationMessageData, Envelope};
use crate::db;
use crate::error::AppError;
use crate::models::message::{MessageContent, MessageRow};
use crate::presence::PresenceStore;

/// What a session loop receives from the hub.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A serialized envelope to forward to the client.
    Frame(String),
    /// Instruction to close the socket (administrative disconnect).
    Close,
}

/// One live websocket connection for a user. A user may hold several of
/// these at once (multiple devices); `connection_id` disambiguates them.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub connection_id: String,
    pub user_id: String,
    pub display_name: String,
    pub tx: mpsc::UnboundedSender<Outbound>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedUser {
    pub user_id: String,
    pub display_name: String,
    pub connections: usize,
}

/// Central connection registry. Tracks which users are connected and which
/// live connections participate in which conversation, and fans envelopes
/// out to conversation members.
///
/// Lock discipline: per-conversation mutations and their broadcasts happen
/// under that conversation's map entry guard, so membership changes and
/// message fan-out serialize per conversation. Sends are non-blocking
/// unbounded pushes, so the guard is never held across an await. The
/// `clients` map may be read while a `conversations` guard is held, never
/// the other way around.
pub struct Hub {
    db: SqlitePool,
    presence: Arc<PresenceStore>,
    /// user id -> connection id -> handle.
    clients: DashMap<String, HashMap<String, ClientHandle>>,
    /// conversation id -> user ids with at least one live connection joined.
    conversations: DashMap<String, HashSet<String>>,
}

impl Hub {
    pub fn new(db: SqlitePool, presence: Arc<PresenceStore>) -> Self {
        Self {
            db,
            presence,
            clients: DashMap::new(),
            conversations: DashMap::new(),
        }
    }

    /// Register a freshly authenticated connection. Marks the user online
    /// and acknowledges with a `connect` envelope on the new connection.
    /// Re-registering the same connection id is a no-op.
    pub fn register_client(&self, handle: ClientHandle) {
        self.presence.set_online(&handle.user_id);

        let mut connections = self.clients.entry(handle.user_id.clone()).or_default();
        if connections.contains_key(&handle.connection_id) {
            return;
        }

        let ack = protocol::new_connect(&handle.user_id, &handle.display_name);
        let _ = handle.tx.send(Outbound::Frame(ack.to_json()));

        tracing::info!(
            user_id = %handle.user_id,
            connection_id = %handle.connection_id,
            "client registered"
        );
        connections.insert(handle.connection_id.clone(), handle);
    }

    /// Tear down one connection. Safe to call for a connection that never
    /// registered. When the user's last connection goes away their
    /// conversation memberships are stripped (with member-left broadcasts)
    /// and they are marked offline; otherwise their presence is refreshed.
    pub fn unregister_client(&self, user_id: &str, connection_id: &str) {
        // The user entry is removed under the same guard that observed the
        // connection set going empty; a reconnect landing concurrently can
        // never be evicted along with the old connection.
        let last_connection = match self.clients.entry(user_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().remove(connection_id);
                if occupied.get().is_empty() {
                    occupied.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => return,
        };

        if !last_connection {
            self.presence.set_online(user_id);
            tracing::debug!(user_id, connection_id, "connection closed, others remain");
            return;
        }

        // Snapshot first: taking entry guards while iterating the same map
        // could deadlock on a shard.
        let joined: Vec<String> = self
            .conversations
            .iter()
            .filter(|entry| entry.value().contains(user_id))
            .map(|entry| entry.key().clone())
            .collect();

        for conversation_id in joined {
            self.remove_member_and_notify(&conversation_id, user_id);
        }

        self.presence.set_offline(user_id);
        tracing::info!(user_id, connection_id, "client unregistered");
    }

    /// Add a user's live connections to a conversation's fan-out set.
    /// Joining twice is a no-op. The caller is responsible for authorizing
    /// the join against durable participation.
    pub fn join_conversation(&self, conversation_id: &str, user_id: &str) -> Result<(), AppError> {
        if !self.clients.contains_key(user_id) {
            return Err(AppError::NotConnected(
                "user has no live connection".to_string(),
            ));
        }

        let mut members = self
            .conversations
            .entry(conversation_id.to_string())
            .or_default();
        if !members.insert(user_id.to_string()) {
            return Ok(());
        }

        let notice = protocol::new_member_joined(conversation_id, user_id);
        self.send_to_members(&members, &notice);
        tracing::debug!(conversation_id, user_id, "member joined");
        Ok(())
    }

    /// Remove a user from a conversation's fan-out set. Leaving a
    /// conversation the user never joined is a no-op, but the leaver is
    /// always acknowledged so clients can settle their local state.
    pub fn leave_conversation(&self, conversation_id: &str, user_id: &str) {
        let notice = protocol::new_member_left(conversation_id, user_id);

        if let Some(mut entry) = self.conversations.get_mut(conversation_id) {
            let members = entry.value_mut();
            if members.remove(user_id) {
                self.send_to_members(members, &notice);
                tracing::debug!(conversation_id, user_id, "member left");
            }
            if members.is_empty() {
                drop(entry);
                self.conversations
                    .remove_if(conversation_id, |_, members| members.is_empty());
            }
        }

        self.send_to_user(user_id, &notice);
    }

    /// Validate, persist, then fan out a conversation message. The sender
    /// must be a live member of the conversation; nothing is broadcast if
    /// persistence fails.
    pub async fn handle_conversation_message(
        &self,
        data: &ConversationMessageData,
    ) -> Result<MessageRow, AppError> {
        if !data.has_content() {
            return Err(AppError::BadRequest(
                "message must have text, url, or fileName".to_string(),
            ));
        }

        let is_live_member = self
            .conversations
            .get(&data.conversation_id)
            .map(|members| members.contains(&data.sender_id))
            .unwrap_or(false);
        if !is_live_member {
            return Err(AppError::Forbidden(
                "sender has not joined this conversation".to_string(),
            ));
        }

        db::conversations::get_conversation(&self.db, &data.conversation_id).await?;

        let content = MessageContent {
            text: data.text.clone(),
            url: data.url.clone(),
            file_name: data.file_name.clone(),
        };
        let row =
            db::messages::create_message(&self.db, &data.conversation_id, &data.sender_id, &content)
                .await?;

        // Exclusive guard: concurrent sends to the same conversation fan
        // out one at a time, so every member observes the same order.
        let envelope = protocol::new_conversation_message(&row);
        if let Some(members) = self.conversations.get_mut(&data.conversation_id) {
            self.send_to_members(&members, &envelope);
        }

        tracing::debug!(
            conversation_id = %data.conversation_id,
            sender_id = %data.sender_id,
            message_id = %row.id,
            "message fanned out"
        );
        Ok(row)
    }

    /// Fan an envelope out to every connection of every given member.
    /// Connections whose session has gone away are skipped; their cleanup
    /// belongs to the session loop's unregister path.
    fn send_to_members(&self, members: &HashSet<String>, envelope: &Envelope) {
        let frame = envelope.to_json();
        for user_id in members {
            match self.clients.get(user_id) {
                Some(connections) => {
                    for handle in connections.values() {
                        let _ = handle.tx.send(Outbound::Frame(frame.clone()));
                    }
                }
                None => {
                    tracing::debug!(%user_id, "skipping member without a live connection");
                }
            }
        }
    }

    fn send_to_user(&self, user_id: &str, envelope: &Envelope) {
        let frame = envelope.to_json();
        if let Some(connections) = self.clients.get(user_id) {
            for handle in connections.values() {
                let _ = handle.tx.send(Outbound::Frame(frame.clone()));
            }
        }
    }

    fn remove_member_and_notify(&self, conversation_id: &str, user_id: &str) {
        if let Some(mut entry) = self.conversations.get_mut(conversation_id) {
            let members = entry.value_mut();
            if members.remove(user_id) {
                let notice = protocol::new_member_left(conversation_id, user_id);
                self.send_to_members(members, &notice);
            }
            if members.is_empty() {
                drop(entry);
                self.conversations
                    .remove_if(conversation_id, |_, members| members.is_empty());
            }
        }
    }

    // Administrative views.

    pub fn connected_users(&self) -> Vec<ConnectedUser> {
        self.clients
            .iter()
            .map(|entry| {
                let display_name = entry
                    .value()
                    .values()
                    .next()
                    .map(|h| h.display_name.clone())
                    .unwrap_or_default();
                ConnectedUser {
                    user_id: entry.key().clone(),
                    display_name,
                    connections: entry.value().len(),
                }
            })
            .collect()
    }

    pub fn connected_user_count(&self) -> usize {
        self.clients.len()
    }

    pub fn connection_count(&self) -> usize {
        self.clients.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.clients.contains_key(user_id)
    }

    /// Live members of one conversation, in no particular order.
    pub fn conversation_members(&self, conversation_id: &str) -> Vec<String> {
        self.conversations
            .get(conversation_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn member_count(&self, conversation_id: &str) -> usize {
        self.conversations
            .get(conversation_id)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    /// Conversations that currently have at least one live member.
    pub fn active_conversation_count(&self) -> usize {
        self.conversations.len()
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        self.conversations
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Signal every connection of a user to close. Returns how many
    /// connections were signaled; the actual unregister happens when each
    /// session loop observes the close and exits.
    pub fn disconnect_user(&self, user_id: &str) -> usize {
        match self.clients.get(user_id) {
            Some(connections) => {
                for handle in connections.values() {
                    let _ = handle.tx.send(Outbound::Close);
                }
                tracing::info!(user_id, count = connections.len(), "disconnect requested");
                connections.len()
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn test_hub() -> Hub {
        let pool = db::create_pool("sqlite::memory:").await.unwrap();
        Hub::new(pool, Arc::new(PresenceStore::default()))
    }

    async fn seed_user(hub: &Hub, user_id: &str) {
        sqlx::query("INSERT INTO users (id, username) VALUES (?, ?)")
            .bind(user_id)
            .bind(format!("user-{user_id}"))
            .execute(&hub.db)
            .await
            .unwrap();
    }

    async fn seed_conversation(hub: &Hub, conversation_id: &str, owner: &str) {
        sqlx::query("INSERT INTO conversations (id, kind, owner_id) VALUES (?, 'group', ?)")
            .bind(conversation_id)
            .bind(owner)
            .execute(&hub.db)
            .await
            .unwrap();
    }

    fn connect(hub: &Hub, user_id: &str, connection_id: &str) -> UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.register_client(ClientHandle {
            connection_id: connection_id.to_string(),
            user_id: user_id.to_string(),
            display_name: format!("User {user_id}"),
            tx,
        });
        rx
    }

    fn next_frame(rx: &mut UnboundedReceiver<Outbound>) -> serde_json::Value {
        match rx.try_recv().expect("expected a frame") {
            Outbound::Frame(text) => serde_json::from_str(&text).unwrap(),
            Outbound::Close => panic!("expected a frame, got close"),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) {
        while rx.try_recv().is_ok() {}
    }

    #[tokio::test]
    async fn register_acks_and_counts() {
        let hub = test_hub().await;
        let mut rx = connect(&hub, "u1", "c1");

        let ack = next_frame(&mut rx);
        assert_eq!(ack["type"], "connect");
        assert_eq!(ack["data"]["userId"], "u1");
        assert_eq!(hub.connected_user_count(), 1);
        assert!(hub.presence.is_user_online("u1"));
    }

    #[tokio::test]
    async fn re_registering_a_connection_is_a_no_op() {
        let hub = test_hub().await;
        let mut rx = connect(&hub, "u1", "c1");
        next_frame(&mut rx); // connect ack

        let mut rx_dup = connect(&hub, "u1", "c1");
        assert_eq!(hub.connection_count(), 1);
        assert!(rx.try_recv().is_err());
        assert!(rx_dup.try_recv().is_err());
    }

    #[tokio::test]
    async fn multi_device_unregister_keeps_user_until_last() {
        let hub = test_hub().await;
        let _rx_a = connect(&hub, "u1", "c1");
        let _rx_b = connect(&hub, "u1", "c2");
        assert_eq!(hub.connection_count(), 2);

        hub.unregister_client("u1", "c1");
        assert!(hub.is_connected("u1"));
        assert!(hub.presence.is_user_online("u1"));

        hub.unregister_client("u1", "c2");
        assert!(!hub.is_connected("u1"));
        assert!(!hub.presence.is_user_online("u1"));
    }

    #[tokio::test]
    async fn unregister_unknown_connection_is_safe() {
        let hub = test_hub().await;
        hub.unregister_client("ghost", "c1");
        assert_eq!(hub.connected_user_count(), 0);
    }

    #[tokio::test]
    async fn join_requires_live_connection() {
        let hub = test_hub().await;
        let err = hub.join_conversation("conv", "u1").unwrap_err();
        assert_eq!(err.code(), "not_connected");
    }

    #[tokio::test]
    async fn join_is_idempotent_and_broadcasts_once() {
        let hub = test_hub().await;
        let mut rx = connect(&hub, "u1", "c1");
        next_frame(&mut rx); // connect ack

        hub.join_conversation("conv", "u1").unwrap();
        hub.join_conversation("conv", "u1").unwrap();
        assert_eq!(hub.member_count("conv"), 1);

        let joined = next_frame(&mut rx);
        assert_eq!(joined["type"], "conversationJoin");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_notifies_existing_members() {
        let hub = test_hub().await;
        let mut rx_a = connect(&hub, "a", "ca");
        let mut rx_b = connect(&hub, "b", "cb");
        next_frame(&mut rx_a);
        next_frame(&mut rx_b);

        hub.join_conversation("conv", "a").unwrap();
        next_frame(&mut rx_a); // a's own join

        hub.join_conversation("conv", "b").unwrap();
        let seen_by_a = next_frame(&mut rx_a);
        assert_eq!(seen_by_a["type"], "conversationJoin");
        assert_eq!(seen_by_a["data"]["userId"], "b");
        let seen_by_b = next_frame(&mut rx_b);
        assert_eq!(seen_by_b["data"]["userId"], "b");
    }

    #[tokio::test]
    async fn leave_acks_even_when_not_a_member() {
        let hub = test_hub().await;
        let mut rx = connect(&hub, "u1", "c1");
        next_frame(&mut rx);

        hub.leave_conversation("conv", "u1");
        let ack = next_frame(&mut rx);
        assert_eq!(ack["type"], "conversationLeave");
        assert_eq!(ack["data"]["conversationId"], "conv");
    }

    #[tokio::test]
    async fn leave_notifies_remaining_members() {
        let hub = test_hub().await;
        let mut rx_a = connect(&hub, "a", "ca");
        let mut rx_b = connect(&hub, "b", "cb");
        next_frame(&mut rx_a);
        next_frame(&mut rx_b);
        hub.join_conversation("conv", "a").unwrap();
        hub.join_conversation("conv", "b").unwrap();
        next_frame(&mut rx_a);
        next_frame(&mut rx_a);
        next_frame(&mut rx_b);

        hub.leave_conversation("conv", "b");
        let seen_by_a = next_frame(&mut rx_a);
        assert_eq!(seen_by_a["type"], "conversationLeave");
        assert_eq!(seen_by_a["data"]["userId"], "b");
        assert_eq!(hub.member_count("conv"), 1);
    }

    #[tokio::test]
    async fn message_persists_then_broadcasts() {
        let hub = test_hub().await;
        seed_user(&hub, "a").await;
        seed_user(&hub, "b").await;
        seed_conversation(&hub, "conv", "a").await;

        let mut rx_a = connect(&hub, "a", "ca");
        let mut rx_b = connect(&hub, "b", "cb");
        next_frame(&mut rx_a);
        next_frame(&mut rx_b);
        hub.join_conversation("conv", "a").unwrap();
        hub.join_conversation("conv", "b").unwrap();
        next_frame(&mut rx_a);
        next_frame(&mut rx_a);
        next_frame(&mut rx_b);

        let row = hub
            .handle_conversation_message(&ConversationMessageData {
                conversation_id: "conv".to_string(),
                sender_id: "a".to_string(),
                text: Some("hello".to_string()),
                url: None,
                file_name: None,
            })
            .await
            .unwrap();

        let seen_by_b = next_frame(&mut rx_b);
        assert_eq!(seen_by_b["type"], "conversationMessage");
        assert_eq!(seen_by_b["id"], row.id.as_str());
        assert_eq!(seen_by_b["data"]["text"], "hello");
        let seen_by_a = next_frame(&mut rx_a);
        assert_eq!(seen_by_a["id"], row.id.as_str());

        let stored = db::messages::get_message_row(&hub.db, &row.id).await.unwrap();
        assert_eq!(stored.text.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn message_from_non_member_is_forbidden() {
        let hub = test_hub().await;
        seed_user(&hub, "a").await;
        seed_conversation(&hub, "conv", "a").await;
        let mut rx = connect(&hub, "a", "ca");
        next_frame(&mut rx);

        let err = hub
            .handle_conversation_message(&ConversationMessageData {
                conversation_id: "conv".to_string(),
                sender_id: "a".to_string(),
                text: Some("hi".to_string()),
                url: None,
                file_name: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn message_to_unknown_conversation_is_not_found() {
        let hub = test_hub().await;
        seed_user(&hub, "a").await;
        let mut rx = connect(&hub, "a", "ca");
        next_frame(&mut rx);
        hub.join_conversation("missing", "a").unwrap();
        next_frame(&mut rx);

        let err = hub
            .handle_conversation_message(&ConversationMessageData {
                conversation_id: "missing".to_string(),
                sender_id: "a".to_string(),
                text: Some("hi".to_string()),
                url: None,
                file_name: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
        // Nothing was broadcast.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_member_does_not_block_broadcast() {
        let hub = test_hub().await;
        seed_user(&hub, "a").await;
        seed_user(&hub, "b").await;
        seed_conversation(&hub, "conv", "a").await;

        let mut rx_a = connect(&hub, "a", "ca");
        let rx_b = connect(&hub, "b", "cb");
        next_frame(&mut rx_a);
        hub.join_conversation("conv", "a").unwrap();
        hub.join_conversation("conv", "b").unwrap();
        next_frame(&mut rx_a);
        next_frame(&mut rx_a);

        // b's session loop is gone but its registration lingers.
        drop(rx_b);

        let row = hub
            .handle_conversation_message(&ConversationMessageData {
                conversation_id: "conv".to_string(),
                sender_id: "a".to_string(),
                text: Some("still here".to_string()),
                url: None,
                file_name: None,
            })
            .await
            .unwrap();

        let seen_by_a = next_frame(&mut rx_a);
        assert_eq!(seen_by_a["id"], row.id.as_str());
    }

    #[tokio::test]
    async fn last_disconnect_strips_memberships() {
        let hub = test_hub().await;
        let mut rx_a = connect(&hub, "a", "ca");
        let mut rx_b = connect(&hub, "b", "cb");
        next_frame(&mut rx_a);
        next_frame(&mut rx_b);
        hub.join_conversation("conv", "a").unwrap();
        hub.join_conversation("conv", "b").unwrap();
        next_frame(&mut rx_a);
        next_frame(&mut rx_a);
        next_frame(&mut rx_b);

        hub.unregister_client("b", "cb");
        assert_eq!(hub.conversation_members("conv"), vec!["a".to_string()]);
        let seen_by_a = next_frame(&mut rx_a);
        assert_eq!(seen_by_a["type"], "conversationLeave");
        assert_eq!(seen_by_a["data"]["userId"], "b");
    }

    #[tokio::test]
    async fn empty_conversations_are_forgotten() {
        let hub = test_hub().await;
        let mut rx = connect(&hub, "a", "ca");
        next_frame(&mut rx);
        hub.join_conversation("conv", "a").unwrap();
        assert_eq!(hub.active_conversation_count(), 1);

        hub.leave_conversation("conv", "a");
        assert_eq!(hub.active_conversation_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_user_signals_all_connections() {
        let hub = test_hub().await;
        let mut rx_a = connect(&hub, "u1", "c1");
        let mut rx_b = connect(&hub, "u1", "c2");
        next_frame(&mut rx_a);
        next_frame(&mut rx_b);

        assert_eq!(hub.disconnect_user("u1"), 2);
        assert!(matches!(rx_a.try_recv(), Ok(Outbound::Close)));
        assert!(matches!(rx_b.try_recv(), Ok(Outbound::Close)));
        assert_eq!(hub.disconnect_user("ghost"), 0);
    }

    // Parallel senders so the fan-outs actually race; on a current-thread
    // runtime the loop never yields and the assertion is vacuous.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_messages_reach_all_members_in_one_order() {
        let users = ["a", "b", "c", "d"];
        let hub = Arc::new(test_hub().await);
        for user in users {
            seed_user(&hub, user).await;
        }
        seed_conversation(&hub, "conv", "a").await;

        let mut receivers: Vec<_> = users
            .iter()
            .map(|user| connect(&hub, user, &format!("c-{user}")))
            .collect();
        for user in users {
            hub.join_conversation("conv", user).unwrap();
        }
        for rx in &mut receivers {
            drain(rx);
        }

        let mut handles = Vec::new();
        for i in 0..8 {
            let hub = hub.clone();
            let data = ConversationMessageData {
                conversation_id: "conv".to_string(),
                sender_id: users[i % users.len()].to_string(),
                text: Some(format!("m{i}")),
                url: None,
                file_name: None,
            };
            handles.push(tokio::spawn(async move {
                hub.handle_conversation_message(&data).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let orders: Vec<Vec<String>> = receivers
            .iter_mut()
            .map(|rx| {
                (0..8)
                    .map(|_| next_frame(rx)["id"].as_str().unwrap().to_string())
                    .collect()
            })
            .collect();
        for order in &orders[1..] {
            assert_eq!(order, &orders[0]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reconnect_racing_teardown_keeps_the_new_connection() {
        for round in 0..25 {
            let hub = Arc::new(test_hub().await);
            let _rx_old = connect(&hub, "u1", "c-old");

            let teardown = {
                let hub = hub.clone();
                tokio::spawn(async move { hub.unregister_client("u1", "c-old") })
            };
            let reconnect = {
                let hub = hub.clone();
                tokio::spawn(async move { connect(&hub, "u1", "c-new") })
            };

            teardown.await.unwrap();
            let _rx_new = reconnect.await.unwrap();

            // Whichever order the race resolved in, the new connection
            // must survive the old one's teardown.
            assert!(hub.is_connected("u1"), "round {round}");
            assert_eq!(hub.connection_count(), 1, "round {round}");
        }
    }
}
