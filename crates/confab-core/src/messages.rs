use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use confab_db::Database;
use confab_db::models::encode_ts;
use confab_types::error::{ChatError, ChatResult};
use confab_types::events::GatewayEvent;
use confab_types::models::{ChatSession, MAX_CONTENT_LEN, Message, MessageStatus};

use crate::blocking;
use crate::dispatcher::Dispatcher;

/// Senders may edit a message for this long after sending it.
pub const EDIT_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Senders may recall a message for this long after sending it.
pub const RECALL_WINDOW: Duration = Duration::from_secs(5 * 60);

const MAX_PAGE_SIZE: u32 = 200;

/// Owns message persistence and the read/edit/recall lifecycle. Transitions
/// are conditional updates keyed on the current row state, so concurrent
/// recalls and edits race on the storage predicate and the loser gets a
/// state-machine error instead of clobbering the winner.
#[derive(Clone)]
pub struct MessageStore {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

impl MessageStore {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    /// Persist a message and push it to the receiver's live connections.
    /// An offline receiver is not an error — the message stays queryable
    /// through history.
    pub async fn send(
        &self,
        sender: Uuid,
        receiver: Uuid,
        content: String,
        metadata: Option<HashMap<String, String>>,
    ) -> ChatResult<Message> {
        validate_content(&content)?;

        let receiver_s = receiver.to_string();
        let exists = blocking(&self.db, move |db| db.user_exists(&receiver_s)).await?;
        if !exists {
            return Err(ChatError::NotFound("receiver"));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let metadata_json = metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| anyhow::anyhow!("metadata serialization failed: {e}"))?;

        let id_s = id.to_string();
        let sender_s = sender.to_string();
        let receiver_s = receiver.to_string();
        let content_c = content.clone();
        let now_s = encode_ts(now);
        blocking(&self.db, move |db| {
            db.insert_message(
                &id_s,
                &sender_s,
                &receiver_s,
                &content_c,
                metadata_json.as_deref(),
                &now_s,
            )
        })
        .await?;

        let message = Message {
            id,
            sender_id: sender,
            receiver_id: receiver,
            content,
            metadata,
            is_read: false,
            read_at: None,
            is_recalled: false,
            created_at: now,
            updated_at: now,
        };

        self.dispatcher
            .send_to_user(
                receiver,
                GatewayEvent::MessageReceived {
                    message: message.clone(),
                },
            )
            .await;

        Ok(message)
    }

    /// Receiver-only read receipt. Idempotent: repeat calls succeed without
    /// touching the stored read timestamp, and only the first one notifies
    /// the sender.
    pub async fn mark_read(&self, message_id: Uuid, reader: Uuid) -> ChatResult<Message> {
        let id_s = message_id.to_string();
        let reader_s = reader.to_string();
        let now_s = encode_ts(Utc::now());
        let changed = blocking(&self.db, move |db| db.mark_read(&id_s, &reader_s, &now_s)).await?;

        let message = self.fetch(message_id).await?;

        if changed == 0 {
            if message.receiver_id != reader {
                return Err(ChatError::Forbidden(
                    "only the receiver may mark a message read",
                ));
            }
            // Already read — idempotent success
            return Ok(message);
        }

        self.dispatcher
            .send_to_user(
                message.sender_id,
                GatewayEvent::MessageStatusUpdated {
                    message_id,
                    status: MessageStatus::Read,
                },
            )
            .await;

        Ok(message)
    }

    /// Sender-only content edit, allowed until the edit window closes and
    /// never after a recall.
    pub async fn edit(
        &self,
        message_id: Uuid,
        editor: Uuid,
        new_content: String,
    ) -> ChatResult<Message> {
        validate_content(&new_content)?;

        let now = Utc::now();
        let id_s = message_id.to_string();
        let editor_s = editor.to_string();
        let content_c = new_content.clone();
        let now_s = encode_ts(now);
        let cutoff = encode_ts(now - chrono::Duration::from_std(EDIT_WINDOW).expect("window fits"));
        let changed = blocking(&self.db, move |db| {
            db.edit_message(&id_s, &editor_s, &content_c, &now_s, &cutoff)
        })
        .await?;

        let message = self.fetch(message_id).await?;
        if changed == 0 {
            return Err(self.transition_failure(&message, editor, "edit", now, EDIT_WINDOW));
        }
        Ok(message)
    }

    /// Sender-only retraction within the recall window. The content is
    /// replaced by the placeholder and the message is frozen; the receiver
    /// is notified.
    pub async fn recall(&self, message_id: Uuid, requester: Uuid) -> ChatResult<Message> {
        let now = Utc::now();
        let id_s = message_id.to_string();
        let requester_s = requester.to_string();
        let now_s = encode_ts(now);
        let cutoff =
            encode_ts(now - chrono::Duration::from_std(RECALL_WINDOW).expect("window fits"));
        let changed = blocking(&self.db, move |db| {
            db.recall_message(&id_s, &requester_s, &now_s, &cutoff)
        })
        .await?;

        let message = self.fetch(message_id).await?;
        if changed == 0 {
            return Err(self.transition_failure(&message, requester, "recall", now, RECALL_WINDOW));
        }

        info!("{} recalled message {}", requester, message_id);
        self.dispatcher
            .send_to_user(
                message.receiver_id,
                GatewayEvent::MessageRecalled {
                    message_id,
                    recalled_by: requester,
                },
            )
            .await;

        Ok(message)
    }

    /// Conversation between two users, oldest first. Pure projection of the
    /// stored rows: the same page/page_size yields the same result until a
    /// new write lands.
    pub async fn history(
        &self,
        a: Uuid,
        b: Uuid,
        page: u32,
        page_size: u32,
    ) -> ChatResult<Vec<Message>> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let offset = (page - 1).saturating_mul(page_size);

        let a_s = a.to_string();
        let b_s = b.to_string();
        let rows =
            blocking(&self.db, move |db| db.history(&a_s, &b_s, page_size, offset)).await?;

        rows.iter().map(|r| Ok(r.to_message()?)).collect()
    }

    /// Derived chat-session list: latest exchange per counterpart plus the
    /// viewer's unread count, most recent conversation first.
    pub async fn sessions(&self, user: Uuid) -> ChatResult<Vec<ChatSession>> {
        let user_s = user.to_string();
        let rows = blocking(&self.db, move |db| db.messages_with_peers(&user_s)).await?;

        // Rows arrive newest-first, so the first row per counterpart is the
        // session head and insertion order is already the final order.
        let mut order: Vec<Uuid> = Vec::new();
        let mut sessions: HashMap<Uuid, ChatSession> = HashMap::new();
        for row in rows {
            let message = row.message.to_message()?;
            let peer = row.peer_summary()?;
            let unread = u32::from(message.receiver_id == user && !message.is_read);

            match sessions.entry(peer.id) {
                Entry::Occupied(mut entry) => entry.get_mut().unread_count += unread,
                Entry::Vacant(entry) => {
                    order.push(peer.id);
                    entry.insert(ChatSession {
                        peer,
                        last_message: message.content,
                        last_message_time: message.created_at,
                        unread_count: unread,
                    });
                }
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|id| sessions.remove(&id))
            .collect())
    }

    pub async fn unread_count(&self, user: Uuid) -> ChatResult<u32> {
        let user_s = user.to_string();
        blocking(&self.db, move |db| db.unread_count(&user_s)).await
    }

    async fn fetch(&self, message_id: Uuid) -> ChatResult<Message> {
        let id_s = message_id.to_string();
        let row = blocking(&self.db, move |db| db.get_message(&id_s))
            .await?
            .ok_or(ChatError::NotFound("message"))?;
        Ok(row.to_message()?)
    }

    /// Classify why a conditional edit/recall matched nothing.
    fn transition_failure(
        &self,
        message: &Message,
        caller: Uuid,
        op: &'static str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> ChatError {
        if message.sender_id != caller {
            return match op {
                "edit" => ChatError::Forbidden("only the sender may edit a message"),
                _ => ChatError::Forbidden("only the sender may recall a message"),
            };
        }
        if message.is_recalled {
            return ChatError::InvalidOperation("message already recalled");
        }
        let window = chrono::Duration::from_std(window).expect("window fits");
        if now - message.created_at > window {
            return match op {
                "edit" => ChatError::InvalidOperation("edit window has closed"),
                _ => ChatError::InvalidOperation("recall window has closed"),
            };
        }
        ChatError::Internal(anyhow::anyhow!(
            "{op} on message {} matched nothing unexpectedly",
            message.id
        ))
    }
}

fn validate_content(content: &str) -> ChatResult<()> {
    if content.trim().is_empty() {
        return Err(ChatError::Validation(
            "message content must not be empty".into(),
        ));
    }
    let len = content.chars().count();
    if len > MAX_CONTENT_LEN {
        return Err(ChatError::Validation(format!(
            "message content too long: {len} > {MAX_CONTENT_LEN} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use confab_types::models::RECALLED_PLACEHOLDER;

    fn store() -> MessageStore {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let dispatcher = Dispatcher::new(Arc::new(SessionRegistry::new()));
        MessageStore::new(db, dispatcher)
    }

    fn add_user(store: &MessageStore, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        store
            .db
            .create_user(
                &id.to_string(),
                name,
                &format!("{name}@example.com"),
                "hash",
                &encode_ts(Utc::now()),
            )
            .unwrap();
        id
    }

    /// Insert a message with a back-dated created_at, bypassing the store.
    fn add_stale_message(store: &MessageStore, sender: Uuid, receiver: Uuid, age_min: i64) -> Uuid {
        let id = Uuid::new_v4();
        let created = encode_ts(Utc::now() - chrono::Duration::minutes(age_min));
        store
            .db
            .insert_message(
                &id.to_string(),
                &sender.to_string(),
                &receiver.to_string(),
                "old news",
                None,
                &created,
            )
            .unwrap();
        id
    }

    #[tokio::test]
    async fn send_delivers_to_connected_receiver() {
        let store = store();
        let alice = add_user(&store, "alice");
        let bob = add_user(&store, "bob");
        let (_conn, mut bob_rx) = store.dispatcher.connect(bob, "bob").await;

        let sent = store.send(alice, bob, "hi".into(), None).await.unwrap();
        match bob_rx.try_recv() {
            Ok(GatewayEvent::MessageReceived { message }) => {
                assert_eq!(message.id, sent.id);
                assert_eq!(message.content, "hi");
            }
            other => panic!("expected MessageReceived, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_to_offline_receiver_still_persists() {
        let store = store();
        let alice = add_user(&store, "alice");
        let bob = add_user(&store, "bob");

        store.send(alice, bob, "hi".into(), None).await.unwrap();
        let history = store.history(alice, bob, 1, 50).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hi");
    }

    #[tokio::test]
    async fn send_validation_and_receiver_checks() {
        let store = store();
        let alice = add_user(&store, "alice");
        let bob = add_user(&store, "bob");

        let empty = store.send(alice, bob, "   ".into(), None).await;
        assert!(matches!(empty, Err(ChatError::Validation(_))));

        let long = "x".repeat(MAX_CONTENT_LEN + 1);
        let too_long = store.send(alice, bob, long, None).await;
        assert!(matches!(too_long, Err(ChatError::Validation(_))));

        let nobody = store.send(alice, Uuid::new_v4(), "hi".into(), None).await;
        assert!(matches!(nobody, Err(ChatError::NotFound("receiver"))));
    }

    #[tokio::test]
    async fn mark_read_is_idempotent_with_stable_timestamp() {
        let store = store();
        let alice = add_user(&store, "alice");
        let bob = add_user(&store, "bob");
        let (_conn, mut alice_rx) = store.dispatcher.connect(alice, "alice").await;

        let sent = store.send(alice, bob, "hi".into(), None).await.unwrap();

        let first = store.mark_read(sent.id, bob).await.unwrap();
        assert!(first.is_read);
        let first_read_at = first.read_at.unwrap();
        match alice_rx.try_recv() {
            Ok(GatewayEvent::MessageStatusUpdated { status, .. }) => {
                assert_eq!(status, MessageStatus::Read);
            }
            other => panic!("expected MessageStatusUpdated, got {other:?}"),
        }

        let second = store.mark_read(sent.id, bob).await.unwrap();
        assert_eq!(second.read_at.unwrap(), first_read_at);
        // No second receipt event
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn mark_read_rejects_non_receiver() {
        let store = store();
        let alice = add_user(&store, "alice");
        let bob = add_user(&store, "bob");
        let sent = store.send(alice, bob, "hi".into(), None).await.unwrap();

        let by_sender = store.mark_read(sent.id, alice).await;
        assert!(matches!(by_sender, Err(ChatError::Forbidden(_))));
        let missing = store.mark_read(Uuid::new_v4(), bob).await;
        assert!(matches!(missing, Err(ChatError::NotFound(_))));
    }

    #[tokio::test]
    async fn edit_rules() {
        let store = store();
        let alice = add_user(&store, "alice");
        let bob = add_user(&store, "bob");
        let sent = store.send(alice, bob, "hi".into(), None).await.unwrap();

        let edited = store.edit(sent.id, alice, "hello".into()).await.unwrap();
        assert_eq!(edited.content, "hello");

        let by_receiver = store.edit(sent.id, bob, "nope".into()).await;
        assert!(matches!(by_receiver, Err(ChatError::Forbidden(_))));

        let stale = add_stale_message(&store, alice, bob, 10);
        let late = store.edit(stale, alice, "late".into()).await;
        assert!(matches!(late, Err(ChatError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn recall_freezes_the_message() {
        let store = store();
        let alice = add_user(&store, "alice");
        let bob = add_user(&store, "bob");
        let (_conn, mut bob_rx) = store.dispatcher.connect(bob, "bob").await;

        let sent = store.send(alice, bob, "hi".into(), None).await.unwrap();
        let _ = bob_rx.try_recv(); // drop the MessageReceived

        let recalled = store.recall(sent.id, alice).await.unwrap();
        assert!(recalled.is_recalled);
        assert_eq!(recalled.content, RECALLED_PLACEHOLDER);
        match bob_rx.try_recv() {
            Ok(GatewayEvent::MessageRecalled { message_id, .. }) => {
                assert_eq!(message_id, sent.id);
            }
            other => panic!("expected MessageRecalled, got {other:?}"),
        }

        // Frozen: no second recall, no edit, in either order
        let again = store.recall(sent.id, alice).await;
        assert!(matches!(again, Err(ChatError::InvalidOperation(_))));
        let edit = store.edit(sent.id, alice, "rewrite".into()).await;
        assert!(matches!(edit, Err(ChatError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn edit_then_recall_still_freezes() {
        let store = store();
        let alice = add_user(&store, "alice");
        let bob = add_user(&store, "bob");
        let sent = store.send(alice, bob, "hi".into(), None).await.unwrap();

        store.edit(sent.id, alice, "hello".into()).await.unwrap();
        store.recall(sent.id, alice).await.unwrap();
        let edit = store.edit(sent.id, alice, "again".into()).await;
        assert!(matches!(edit, Err(ChatError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn recall_guards() {
        let store = store();
        let alice = add_user(&store, "alice");
        let bob = add_user(&store, "bob");
        let sent = store.send(alice, bob, "hi".into(), None).await.unwrap();

        let by_receiver = store.recall(sent.id, bob).await;
        assert!(matches!(by_receiver, Err(ChatError::Forbidden(_))));

        let stale = add_stale_message(&store, alice, bob, 10);
        let late = store.recall(stale, alice).await;
        assert!(matches!(late, Err(ChatError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn history_is_restartable() {
        let store = store();
        let alice = add_user(&store, "alice");
        let bob = add_user(&store, "bob");
        for i in 0..4 {
            store
                .send(alice, bob, format!("msg {i}"), None)
                .await
                .unwrap();
        }

        let first = store.history(alice, bob, 1, 3).await.unwrap();
        let second = store.history(alice, bob, 1, 3).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(
            first.iter().map(|m| m.id).collect::<Vec<_>>(),
            second.iter().map(|m| m.id).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn unread_count_matches_history() {
        let store = store();
        let alice = add_user(&store, "alice");
        let bob = add_user(&store, "bob");

        for i in 0..3 {
            store
                .send(alice, bob, format!("msg {i}"), None)
                .await
                .unwrap();
        }
        store.send(bob, alice, "reply".into(), None).await.unwrap();

        let history = store.history(alice, bob, 1, 50).await.unwrap();
        let unread_in_history = history
            .iter()
            .filter(|m| m.receiver_id == bob && !m.is_read)
            .count() as u32;
        assert_eq!(store.unread_count(bob).await.unwrap(), unread_in_history);

        // Reading one message keeps the two counts in lockstep
        let first_to_bob = history.iter().find(|m| m.receiver_id == bob).unwrap();
        store.mark_read(first_to_bob.id, bob).await.unwrap();
        let history = store.history(alice, bob, 1, 50).await.unwrap();
        let unread_in_history = history
            .iter()
            .filter(|m| m.receiver_id == bob && !m.is_read)
            .count() as u32;
        assert_eq!(store.unread_count(bob).await.unwrap(), unread_in_history);
    }

    #[tokio::test]
    async fn sessions_aggregate_per_counterpart() {
        let store = store();
        let alice = add_user(&store, "alice");
        let bob = add_user(&store, "bob");
        let carol = add_user(&store, "carol");

        store.send(bob, alice, "one".into(), None).await.unwrap();
        store.send(bob, alice, "two".into(), None).await.unwrap();
        let last = store.send(carol, alice, "hey".into(), None).await.unwrap();

        let sessions = store.sessions(alice).await.unwrap();
        assert_eq!(sessions.len(), 2);
        // Carol's message is the most recent conversation
        assert_eq!(sessions[0].peer.id, carol);
        assert_eq!(sessions[0].last_message, "hey");
        assert_eq!(sessions[0].last_message_time, last.created_at);
        assert_eq!(sessions[0].unread_count, 1);
        assert_eq!(sessions[1].peer.id, bob);
        assert_eq!(sessions[1].last_message, "two");
        assert_eq!(sessions[1].unread_count, 2);

        // Reading shrinks the unread counter
        let history = store.history(bob, alice, 1, 50).await.unwrap();
        store.mark_read(history[0].id, alice).await.unwrap();
        let sessions = store.sessions(alice).await.unwrap();
        assert_eq!(sessions[1].unread_count, 1);
    }
}
