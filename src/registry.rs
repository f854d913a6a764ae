//! Connection registry — presence and chat-subscription tracking, plus
//! the chat fan-out broadcaster.
//!
//! All state is process-local and in-memory; it is rebuilt from zero on
//! restart and never shared across processes. The registry is owned by
//! `AppState` and passed by reference — there is no global instance.
//!
//! Each live connection is identified by a `ConnId` and reached through
//! a non-blocking mpsc queue drained by that connection's writer task,
//! so a stalled socket never blocks a broadcast. Broadcasting snapshots
//! the subscriber set, enqueues outside the map guard, and reacquires
//! only to prune connections whose queue has closed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{ChatEvent, ChatId, UserId};

/// Sender half of a connection's outbound queue. The ws writer task
/// owns the receiver; dropping it marks the connection dead.
pub type ConnectionSender = mpsc::UnboundedSender<Message>;

/// Opaque handle to one live connection. Unique for the process
/// lifetime; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

pub struct Registry {
    /// user_id -> connections currently open for that user.
    presence: DashMap<UserId, HashSet<ConnId>>,
    /// chat_id -> connections subscribed to that chat.
    chats: DashMap<ChatId, HashSet<ConnId>>,
    /// Outbound queues, keyed by connection.
    senders: DashMap<ConnId, ConnectionSender>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            presence: DashMap::new(),
            chats: DashMap::new(),
            senders: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a freshly authenticated connection under its user.
    /// Allocates the connection's handle; never fails.
    pub fn register(&self, user: UserId, tx: ConnectionSender) -> ConnId {
        let conn = ConnId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.senders.insert(conn, tx);
        self.presence.entry(user).or_default().insert(conn);
        debug!(user_id = user, conn = conn.0, "connection registered");
        conn
    }

    /// Remove a connection from its user's presence set and from every
    /// chat subscription. Idempotent: a second call is a no-op.
    pub fn unregister(&self, conn: ConnId, user: UserId) {
        self.senders.remove(&conn);

        let emptied = self
            .presence
            .get_mut(&user)
            .map(|mut set| {
                set.remove(&conn);
                set.is_empty()
            })
            .unwrap_or(false);
        if emptied {
            self.presence.remove_if(&user, |_, set| set.is_empty());
        }

        // Drop the connection from every chat, deleting emptied sets.
        self.chats.retain(|_, subs| {
            subs.remove(&conn);
            !subs.is_empty()
        });

        debug!(user_id = user, conn = conn.0, "connection unregistered");
    }

    /// Add a connection to a chat's subscriber set. Membership was
    /// already checked by the caller; idempotent. Never fails.
    pub fn subscribe(&self, user: UserId, chat: ChatId, conn: ConnId) {
        self.chats.entry(chat).or_default().insert(conn);
        debug!(user_id = user, chat_id = chat, conn = conn.0, "subscribed");
    }

    /// Remove a connection from a chat's subscriber set only; presence
    /// is untouched. Idempotent.
    pub fn unsubscribe(&self, chat: ChatId, conn: ConnId) {
        let emptied = self
            .chats
            .get_mut(&chat)
            .map(|mut subs| {
                subs.remove(&conn);
                subs.is_empty()
            })
            .unwrap_or(false);
        if emptied {
            self.chats.remove_if(&chat, |_, subs| subs.is_empty());
        }
    }

    /// Whether the user has at least one open connection.
    pub fn is_online(&self, user: UserId) -> bool {
        self.presence.contains_key(&user)
    }

    /// Users with at least one open connection.
    pub fn online_user_ids(&self) -> Vec<UserId> {
        self.presence.iter().map(|entry| *entry.key()).collect()
    }

    /// Push an event to every connection subscribed to `chat`.
    ///
    /// Best-effort, at-most-once per subscriber per call: no retry, no
    /// queueing beyond each connection's own outbound queue. A
    /// connection whose queue has closed is pruned from this chat's
    /// subscriber set and will not see future broadcasts. A chat with
    /// no subscribers is a no-op.
    ///
    /// Returns the number of connections the event was enqueued for.
    pub fn broadcast_to_chat(&self, chat: ChatId, event: &ChatEvent) -> usize {
        let snapshot: Vec<ConnId> = match self.chats.get(&chat) {
            Some(subs) => subs.iter().copied().collect(),
            None => return 0,
        };

        let json = match serde_json::to_string(&event.to_wire()) {
            Ok(json) => json,
            Err(e) => {
                debug!(chat_id = chat, "broadcast serialize error: {e}");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for conn in snapshot {
            let sent = self
                .senders
                .get(&conn)
                .map(|tx| tx.send(Message::Text(json.clone().into())).is_ok())
                .unwrap_or(false);
            if sent {
                delivered += 1;
            } else {
                dead.push(conn);
            }
        }

        if !dead.is_empty() {
            debug!(chat_id = chat, pruned = dead.len(), "pruning dead subscribers");
            let emptied = self
                .chats
                .get_mut(&chat)
                .map(|mut subs| {
                    for conn in &dead {
                        subs.remove(conn);
                    }
                    subs.is_empty()
                })
                .unwrap_or(false);
            if emptied {
                self.chats.remove_if(&chat, |_, subs| subs.is_empty());
            }
        }

        delivered
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;

    fn relay(n: i64) -> ChatEvent {
        ChatEvent::Relay(serde_json::json!({"action": "message", "chat_id": n}))
    }

    fn open(registry: &Registry, user: UserId) -> (ConnId, UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.register(user, tx), rx)
    }

    fn received(rx: &mut UnboundedReceiver<Message>) -> usize {
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    #[test]
    fn presence_follows_register_unregister() {
        let registry = Registry::new();
        let (c1, _rx1) = open(&registry, 10);
        let (c2, _rx2) = open(&registry, 10);

        assert!(registry.is_online(10));
        assert_eq!(registry.online_user_ids(), vec![10]);

        registry.unregister(c1, 10);
        assert!(registry.is_online(10));

        registry.unregister(c2, 10);
        assert!(!registry.is_online(10));
        // Last removal deletes the map entry entirely.
        assert!(registry.online_user_ids().is_empty());
    }

    #[test]
    fn unregister_twice_is_noop() {
        let registry = Registry::new();
        let (conn, _rx) = open(&registry, 5);
        registry.unregister(conn, 5);
        registry.unregister(conn, 5);
        assert!(!registry.is_online(5));

        // Unknown handle is also a no-op.
        registry.unregister(ConnId(9999), 5);
    }

    #[test]
    fn unregister_removes_every_subscription() {
        let registry = Registry::new();
        let (conn, _rx) = open(&registry, 1);
        registry.subscribe(1, 100, conn);
        registry.subscribe(1, 200, conn);

        registry.unregister(conn, 1);
        assert_eq!(registry.broadcast_to_chat(100, &relay(100)), 0);
        assert_eq!(registry.broadcast_to_chat(200, &relay(200)), 0);
    }

    #[test]
    fn unsubscribe_leaves_presence_alone() {
        let registry = Registry::new();
        let (conn, _rx) = open(&registry, 1);
        registry.subscribe(1, 100, conn);
        registry.unsubscribe(100, conn);
        // Idempotent.
        registry.unsubscribe(100, conn);

        assert_eq!(registry.broadcast_to_chat(100, &relay(100)), 0);
        assert!(registry.is_online(1));
    }

    #[test]
    fn subscribe_is_idempotent() {
        let registry = Registry::new();
        let (conn, mut rx) = open(&registry, 1);
        registry.subscribe(1, 100, conn);
        registry.subscribe(1, 100, conn);

        assert_eq!(registry.broadcast_to_chat(100, &relay(100)), 1);
        assert_eq!(received(&mut rx), 1);
    }

    #[test]
    fn broadcast_reaches_all_subscribers() {
        let registry = Registry::new();
        let (a, mut rx_a) = open(&registry, 1);
        let (b, mut rx_b) = open(&registry, 2);
        registry.subscribe(1, 100, a);
        registry.subscribe(2, 100, b);

        assert_eq!(registry.broadcast_to_chat(100, &relay(100)), 2);
        assert_eq!(received(&mut rx_a), 1);
        assert_eq!(received(&mut rx_b), 1);
    }

    #[test]
    fn failed_send_prunes_subscriber() {
        let registry = Registry::new();
        let (a, mut rx_a) = open(&registry, 1);
        let (b, rx_b) = open(&registry, 2);
        let (c, mut rx_c) = open(&registry, 3);
        registry.subscribe(1, 100, a);
        registry.subscribe(2, 100, b);
        registry.subscribe(3, 100, c);

        // B's writer task is gone.
        drop(rx_b);

        assert_eq!(registry.broadcast_to_chat(100, &relay(100)), 2);
        assert_eq!(received(&mut rx_a), 1);
        assert_eq!(received(&mut rx_c), 1);

        // B was pruned; the next broadcast reaches only A and C.
        assert_eq!(registry.broadcast_to_chat(100, &relay(100)), 2);
    }

    #[test]
    fn broadcast_without_subscribers_is_noop() {
        let registry = Registry::new();
        assert_eq!(registry.broadcast_to_chat(999, &relay(999)), 0);
    }

    #[test]
    fn broadcast_payload_is_the_wire_shape() {
        let registry = Registry::new();
        let (conn, mut rx) = open(&registry, 1);
        registry.subscribe(1, 100, conn);

        let event = ChatEvent::Relay(serde_json::json!({
            "action": "message", "chat_id": 100, "typing": true
        }));
        registry.broadcast_to_chat(100, &event);

        match rx.try_recv().unwrap() {
            Message::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(value, event.to_wire());
            }
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn second_device_does_not_receive_unsubscribed_chat() {
        let registry = Registry::new();
        // User 1 on two devices; only the first subscribes.
        let (h1, mut rx1) = open(&registry, 1);
        let (_h2, mut rx2) = open(&registry, 1);
        registry.subscribe(1, 100, h1);

        assert_eq!(registry.broadcast_to_chat(100, &relay(100)), 1);
        assert_eq!(received(&mut rx1), 1);
        assert_eq!(received(&mut rx2), 0);

        registry.unregister(h1, 1);
        assert_eq!(registry.broadcast_to_chat(100, &relay(100)), 0);
        assert!(registry.is_online(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_subscribes_all_receive() {
        let registry = Arc::new(Registry::new());
        let n = 32;

        let mut receivers = Vec::new();
        let mut handles = Vec::new();
        for user in 0..n {
            let (conn, rx) = open(&registry, user);
            receivers.push(rx);
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.subscribe(user, 100, conn);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.broadcast_to_chat(100, &relay(100)), n as usize);
        for mut rx in receivers {
            assert_eq!(received(&mut rx), 1);
        }
    }
}
