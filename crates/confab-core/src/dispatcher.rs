use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use confab_types::events::GatewayEvent;

use crate::registry::{EventReceiver, SessionRegistry};

/// Fans domain events out to live connections.
///
/// Delivery is best-effort by design: the durable mutation has already been
/// committed by the time an event is published, so a missing or dead
/// connection is never an error. Targeted events go through the session
/// registry; only presence transitions use the broadcast channel.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: Arc<SessionRegistry>,
    /// Presence broadcast — every connected client observes online/offline
    /// transitions.
    broadcast_tx: broadcast::Sender<GatewayEvent>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                registry,
                broadcast_tx,
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Subscribe to the presence broadcast.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Push an event to every live connection of each target user. Offline
    /// targets are silently skipped; send failures on a closing connection
    /// are ignored.
    pub async fn publish(&self, event: GatewayEvent, targets: &[Uuid]) {
        for &user_id in targets {
            for tx in self.inner.registry.connections_for(user_id).await {
                let _ = tx.send(event.clone());
            }
        }
    }

    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) {
        self.publish(event, &[user_id]).await;
    }

    /// Register a connection and announce the user if this is their first.
    pub async fn connect(&self, user_id: Uuid, username: &str) -> (Uuid, EventReceiver) {
        let (conn_id, rx, was_offline) = self.inner.registry.register(user_id, username).await;
        if was_offline {
            let _ = self.inner.broadcast_tx.send(GatewayEvent::UserOnline {
                user_id,
                username: username.to_string(),
            });
        }
        (conn_id, rx)
    }

    /// Drop a connection handle and announce the user offline if it was the
    /// last one.
    pub async fn disconnect(&self, user_id: Uuid, username: &str, conn_id: Uuid) {
        let went_offline = self.inner.registry.unregister(user_id, conn_id).await;
        if went_offline {
            let _ = self.inner.broadcast_tx.send(GatewayEvent::UserOffline {
                user_id,
                username: username.to_string(),
            });
        }
    }

    pub async fn online_users(&self) -> Vec<(Uuid, String)> {
        self.inner.registry.online_users().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_connection_of_target_only() {
        let dispatcher = Dispatcher::new(Arc::new(SessionRegistry::new()));
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let (_c1, mut alice_rx1) = dispatcher.connect(alice, "alice").await;
        let (_c2, mut alice_rx2) = dispatcher.connect(alice, "alice").await;
        let (_c3, mut bob_rx) = dispatcher.connect(bob, "bob").await;

        dispatcher
            .send_to_user(alice, GatewayEvent::TypingStart { from_user_id: bob })
            .await;

        assert!(matches!(
            alice_rx1.try_recv(),
            Ok(GatewayEvent::TypingStart { .. })
        ));
        assert!(matches!(
            alice_rx2.try_recv(),
            Ok(GatewayEvent::TypingStart { .. })
        ));
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn presence_transitions_fire_on_first_and_last_connection() {
        let dispatcher = Dispatcher::new(Arc::new(SessionRegistry::new()));
        let mut presence = dispatcher.subscribe();
        let alice = Uuid::new_v4();

        let (conn_a, _rx_a) = dispatcher.connect(alice, "alice").await;
        assert!(matches!(
            presence.try_recv(),
            Ok(GatewayEvent::UserOnline { .. })
        ));

        // Second connection does not re-announce
        let (conn_b, _rx_b) = dispatcher.connect(alice, "alice").await;
        assert!(presence.try_recv().is_err());

        dispatcher.disconnect(alice, "alice", conn_a).await;
        assert!(presence.try_recv().is_err());
        dispatcher.disconnect(alice, "alice", conn_b).await;
        assert!(matches!(
            presence.try_recv(),
            Ok(GatewayEvent::UserOffline { .. })
        ));
    }

    #[tokio::test]
    async fn publish_to_offline_user_is_dropped() {
        let dispatcher = Dispatcher::new(Arc::new(SessionRegistry::new()));
        // No registration at all — must not panic or error
        dispatcher
            .send_to_user(
                Uuid::new_v4(),
                GatewayEvent::TypingStart {
                    from_user_id: Uuid::new_v4(),
                },
            )
            .await;
    }
}
