use std::collections::HashMap;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use confab_types::events::GatewayEvent;

pub type EventSender = mpsc::UnboundedSender<GatewayEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<GatewayEvent>;

struct UserSessions {
    username: String,
    senders: HashMap<Uuid, EventSender>,
}

/// Maps authenticated users to their live connections. A user may hold
/// several simultaneous connections; each gets its own handle and channel.
/// Process-local only — after a restart clients reconnect and the map
/// repopulates from new `register` calls.
pub struct SessionRegistry {
    users: RwLock<HashMap<Uuid, UserSessions>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Add a connection for a user. Returns the connection handle id, the
    /// receiving half of its channel, and whether the user was offline
    /// before this call.
    pub async fn register(&self, user_id: Uuid, username: &str) -> (Uuid, EventReceiver, bool) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut users = self.users.write().await;
        let was_offline = !users.contains_key(&user_id);
        users
            .entry(user_id)
            .or_insert_with(|| UserSessions {
                username: username.to_string(),
                senders: HashMap::new(),
            })
            .senders
            .insert(conn_id, tx);

        (conn_id, rx, was_offline)
    }

    /// Remove one connection handle. Returns true when that was the user's
    /// last connection, i.e. the user just went offline.
    pub async fn unregister(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut users = self.users.write().await;
        let Some(sessions) = users.get_mut(&user_id) else {
            return false;
        };
        sessions.senders.remove(&conn_id);
        if sessions.senders.is_empty() {
            users.remove(&user_id);
            true
        } else {
            false
        }
    }

    /// Snapshot of the user's live senders; empty if offline.
    pub async fn connections_for(&self, user_id: Uuid) -> Vec<EventSender> {
        let users = self.users.read().await;
        users
            .get(&user_id)
            .map(|s| s.senders.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.users.read().await.contains_key(&user_id)
    }

    pub async fn online_users(&self) -> Vec<(Uuid, String)> {
        self.users
            .read()
            .await
            .iter()
            .map(|(id, s)| (*id, s.username.clone()))
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_connection_keeps_user_online() {
        let registry = SessionRegistry::new();
        let user = Uuid::new_v4();

        let (conn_a, _rx_a, was_offline) = registry.register(user, "alice").await;
        assert!(was_offline);
        let (conn_b, _rx_b, was_offline) = registry.register(user, "alice").await;
        assert!(!was_offline);

        assert_eq!(registry.connections_for(user).await.len(), 2);

        assert!(!registry.unregister(user, conn_a).await);
        assert!(registry.is_online(user).await);
        assert!(registry.unregister(user, conn_b).await);
        assert!(!registry.is_online(user).await);
        assert!(registry.connections_for(user).await.is_empty());
    }

    #[tokio::test]
    async fn unregister_unknown_handle_is_harmless() {
        let registry = SessionRegistry::new();
        let user = Uuid::new_v4();
        assert!(!registry.unregister(user, Uuid::new_v4()).await);

        let (_conn, _rx, _) = registry.register(user, "alice").await;
        assert!(!registry.unregister(user, Uuid::new_v4()).await);
        assert!(registry.is_online(user).await);
    }
}
