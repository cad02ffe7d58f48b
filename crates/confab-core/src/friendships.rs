use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use confab_db::Database;
use confab_db::models::encode_ts;
use confab_db::queries::RequestOutcome;
use confab_types::api::{FriendDto, FriendshipDto, UpdateFriendshipRequest};
use confab_types::error::{ChatError, ChatResult};
use confab_types::events::{GatewayEvent, RespondDecision};
use confab_types::models::{Friendship, UserSummary};

use crate::blocking;
use crate::dispatcher::Dispatcher;

/// Owns the friend-relationship state machine: request, accept/reject,
/// metadata, deletion. Every transition is applied as a conditional update
/// in the storage layer, so concurrent callers race on the row predicate
/// rather than on read-then-write.
#[derive(Clone)]
pub struct FriendshipEngine {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

impl FriendshipEngine {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    /// Create a pending request from `requester` to `target` and notify the
    /// target's live connections.
    pub async fn send_request(
        &self,
        requester: Uuid,
        target: Uuid,
        remark: Option<String>,
        group_name: Option<String>,
    ) -> ChatResult<FriendshipDto> {
        if requester == target {
            return Err(ChatError::Validation(
                "cannot send a friend request to yourself".into(),
            ));
        }

        let target_s = target.to_string();
        let exists = blocking(&self.db, move |db| db.user_exists(&target_s)).await?;
        if !exists {
            return Err(ChatError::NotFound("user"));
        }

        let id = Uuid::new_v4();
        let id_s = id.to_string();
        let requester_s = requester.to_string();
        let target_s = target.to_string();
        let now_s = encode_ts(Utc::now());
        let remark_c = remark.clone();
        let group_c = group_name.clone();
        let outcome = blocking(&self.db, move |db| {
            db.create_friend_request(
                &id_s,
                &requester_s,
                &target_s,
                remark_c.as_deref(),
                group_c.as_deref(),
                &now_s,
            )
        })
        .await?;

        let row = match outcome {
            RequestOutcome::AlreadyFriends => {
                return Err(ChatError::Conflict("already friends"));
            }
            RequestOutcome::AlreadyPending => {
                return Err(ChatError::Conflict("friend request already pending"));
            }
            RequestOutcome::Created(row) => row,
        };

        let friendship = row.to_friendship()?;
        let requester_summary = self.summary(requester).await?;
        let target_summary = self.summary(target).await?;

        info!("{} -> friend request to {}", requester, target);
        self.dispatcher
            .send_to_user(
                target,
                GatewayEvent::FriendRequest {
                    friendship: friendship.clone(),
                    requester: requester_summary.clone(),
                },
            )
            .await;

        Ok(FriendshipDto {
            friendship,
            user: requester_summary,
            friend: target_summary,
        })
    }

    /// Accept or reject a pending request. Only the invitee may respond, and
    /// only once; of two concurrent responders exactly one succeeds and the
    /// other observes `AlreadyHandled`.
    pub async fn respond(
        &self,
        responder: Uuid,
        friendship_id: Uuid,
        decision: RespondDecision,
    ) -> ChatResult<Friendship> {
        let fid_s = friendship_id.to_string();
        let responder_s = responder.to_string();
        let status = decision.status().as_str();
        let now_s = encode_ts(Utc::now());
        let changed = blocking(&self.db, move |db| {
            db.respond_to_request(&fid_s, &responder_s, status, &now_s)
        })
        .await?;

        let fid_s = friendship_id.to_string();
        let row = blocking(&self.db, move |db| db.get_friendship(&fid_s)).await?;

        if changed == 0 {
            // The conditional update matched nothing; inspect the row to
            // report the right failure.
            return Err(match row {
                None => ChatError::NotFound("friend request"),
                Some(r) if r.friend_id != responder.to_string() => {
                    ChatError::NotFound("friend request")
                }
                Some(r) if r.status != "pending" => ChatError::AlreadyHandled,
                Some(_) => ChatError::Internal(anyhow::anyhow!(
                    "friend request {friendship_id} update matched nothing while pending"
                )),
            });
        }

        let friendship = row
            .ok_or_else(|| anyhow::anyhow!("friendship {friendship_id} vanished after update"))?
            .to_friendship()?;

        info!(
            "{} {:?} friend request {}",
            responder, decision, friendship_id
        );
        self.dispatcher
            .send_to_user(
                friendship.user_id,
                GatewayEvent::FriendRequestHandled {
                    friendship: friendship.clone(),
                },
            )
            .await;

        Ok(friendship)
    }

    /// Partial update of remark/group/pinned/muted on an accepted
    /// friendship involving the caller.
    pub async fn update_metadata(
        &self,
        user: Uuid,
        friendship_id: Uuid,
        patch: UpdateFriendshipRequest,
    ) -> ChatResult<Friendship> {
        let UpdateFriendshipRequest {
            remark,
            group_name,
            is_pinned,
            is_muted,
        } = patch;

        let fid_s = friendship_id.to_string();
        let user_s = user.to_string();
        let now_s = encode_ts(Utc::now());
        let changed = blocking(&self.db, move |db| {
            db.update_friendship_metadata(
                &fid_s,
                &user_s,
                remark.as_deref(),
                group_name.as_deref(),
                is_pinned,
                is_muted,
                &now_s,
            )
        })
        .await?;

        if changed == 0 {
            return Err(ChatError::NotFound("friendship"));
        }

        let fid_s = friendship_id.to_string();
        let friendship = blocking(&self.db, move |db| db.get_friendship(&fid_s))
            .await?
            .ok_or_else(|| anyhow::anyhow!("friendship {friendship_id} vanished after update"))?
            .to_friendship()?;

        self.dispatcher
            .send_to_user(
                friendship.counterpart(user),
                GatewayEvent::FriendStatusChanged {
                    friendship: friendship.clone(),
                },
            )
            .await;

        Ok(friendship)
    }

    /// Remove an accepted friendship. Either party may delete; the row is
    /// gone afterwards, so a fresh request may start the lifecycle over.
    pub async fn delete(&self, user: Uuid, friendship_id: Uuid) -> ChatResult<bool> {
        let fid_s = friendship_id.to_string();
        let user_s = user.to_string();
        let changed =
            blocking(&self.db, move |db| db.delete_friendship(&fid_s, &user_s)).await?;

        if changed == 0 {
            return Err(ChatError::NotFound("friendship"));
        }
        info!("{} deleted friendship {}", user, friendship_id);
        Ok(true)
    }

    pub async fn list_friends(&self, user: Uuid) -> ChatResult<Vec<FriendDto>> {
        let user_s = user.to_string();
        let rows = blocking(&self.db, move |db| db.list_friends(&user_s)).await?;

        rows.into_iter()
            .map(|row| {
                let friendship = row.friendship.to_friendship()?;
                Ok(FriendDto {
                    friendship_id: friendship.id,
                    user: row.peer_summary()?,
                    remark: friendship.remark,
                    group_name: friendship.group_name,
                    is_pinned: friendship.is_pinned,
                    is_muted: friendship.is_muted,
                    since: friendship.created_at,
                })
            })
            .collect()
    }

    /// Requests still waiting on this user to respond.
    pub async fn list_pending(&self, user: Uuid) -> ChatResult<Vec<FriendshipDto>> {
        let me = self.summary(user).await?;
        let user_s = user.to_string();
        let rows = blocking(&self.db, move |db| db.list_pending_requests(&user_s)).await?;

        rows.into_iter()
            .map(|row| {
                Ok(FriendshipDto {
                    friendship: row.friendship.to_friendship()?,
                    user: row.peer_summary()?,
                    friend: me.clone(),
                })
            })
            .collect()
    }

    async fn summary(&self, user: Uuid) -> ChatResult<UserSummary> {
        let user_s = user.to_string();
        let row = blocking(&self.db, move |db| db.get_user_by_id(&user_s))
            .await?
            .ok_or(ChatError::NotFound("user"))?;
        Ok(row.to_summary()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use confab_types::models::FriendshipStatus;

    fn engine() -> FriendshipEngine {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let dispatcher = Dispatcher::new(Arc::new(SessionRegistry::new()));
        FriendshipEngine::new(db, dispatcher)
    }

    fn add_user(engine: &FriendshipEngine, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        engine
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

    #[tokio::test]
    async fn accept_makes_both_sides_friends() {
        let engine = engine();
        let alice = add_user(&engine, "alice");
        let bob = add_user(&engine, "bob");

        let dto = engine
            .send_request(alice, bob, Some("from work".into()), None)
            .await
            .unwrap();
        assert_eq!(dto.friendship.status, FriendshipStatus::Pending);

        let pending = engine.list_pending(bob).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].user.username, "alice");

        let accepted = engine
            .respond(bob, dto.friendship.id, RespondDecision::Accepted)
            .await
            .unwrap();
        assert_eq!(accepted.status, FriendshipStatus::Accepted);

        let alice_friends = engine.list_friends(alice).await.unwrap();
        let bob_friends = engine.list_friends(bob).await.unwrap();
        assert_eq!(alice_friends[0].user.id, bob);
        assert_eq!(bob_friends[0].user.id, alice);
        assert!(engine.list_pending(bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn respond_succeeds_exactly_once() {
        let engine = engine();
        let alice = add_user(&engine, "alice");
        let bob = add_user(&engine, "bob");
        let dto = engine.send_request(alice, bob, None, None).await.unwrap();

        engine
            .respond(bob, dto.friendship.id, RespondDecision::Accepted)
            .await
            .unwrap();
        let second = engine
            .respond(bob, dto.friendship.id, RespondDecision::Rejected)
            .await;
        assert!(matches!(second, Err(ChatError::AlreadyHandled)));
    }

    #[tokio::test]
    async fn concurrent_respond_has_single_winner() {
        let engine = engine();
        let alice = add_user(&engine, "alice");
        let bob = add_user(&engine, "bob");
        let dto = engine.send_request(alice, bob, None, None).await.unwrap();

        let (a, b) = tokio::join!(
            engine.respond(bob, dto.friendship.id, RespondDecision::Accepted),
            engine.respond(bob, dto.friendship.id, RespondDecision::Rejected),
        );
        let winners = [a.is_ok(), b.is_ok()].iter().filter(|&&ok| ok).count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn only_invitee_may_respond() {
        let engine = engine();
        let alice = add_user(&engine, "alice");
        let bob = add_user(&engine, "bob");
        let eve = add_user(&engine, "eve");
        let dto = engine.send_request(alice, bob, None, None).await.unwrap();

        let by_requester = engine
            .respond(alice, dto.friendship.id, RespondDecision::Accepted)
            .await;
        assert!(matches!(by_requester, Err(ChatError::NotFound(_))));
        let by_stranger = engine
            .respond(eve, dto.friendship.id, RespondDecision::Accepted)
            .await;
        assert!(matches!(by_stranger, Err(ChatError::NotFound(_))));
    }

    #[tokio::test]
    async fn duplicate_request_conflicts_in_both_directions() {
        let engine = engine();
        let alice = add_user(&engine, "alice");
        let bob = add_user(&engine, "bob");
        engine.send_request(alice, bob, None, None).await.unwrap();

        let same = engine.send_request(alice, bob, None, None).await;
        assert!(matches!(same, Err(ChatError::Conflict(_))));
        let reverse = engine.send_request(bob, alice, None, None).await;
        assert!(matches!(reverse, Err(ChatError::Conflict(_))));
    }

    #[tokio::test]
    async fn request_to_existing_friend_fails() {
        let engine = engine();
        let alice = add_user(&engine, "alice");
        let bob = add_user(&engine, "bob");
        let dto = engine.send_request(alice, bob, None, None).await.unwrap();
        engine
            .respond(bob, dto.friendship.id, RespondDecision::Accepted)
            .await
            .unwrap();

        let again = engine.send_request(alice, bob, None, None).await;
        assert!(matches!(again, Err(ChatError::Conflict("already friends"))));
    }

    #[tokio::test]
    async fn self_request_and_unknown_target_are_rejected() {
        let engine = engine();
        let alice = add_user(&engine, "alice");

        let to_self = engine.send_request(alice, alice, None, None).await;
        assert!(matches!(to_self, Err(ChatError::Validation(_))));

        let to_nobody = engine.send_request(alice, Uuid::new_v4(), None, None).await;
        assert!(matches!(to_nobody, Err(ChatError::NotFound("user"))));
    }

    #[tokio::test]
    async fn rejected_request_allows_a_new_one() {
        let engine = engine();
        let alice = add_user(&engine, "alice");
        let bob = add_user(&engine, "bob");
        let dto = engine.send_request(alice, bob, None, None).await.unwrap();
        engine
            .respond(bob, dto.friendship.id, RespondDecision::Rejected)
            .await
            .unwrap();

        // The pair has no live row anymore; a fresh request starts over
        let retry = engine.send_request(bob, alice, None, None).await.unwrap();
        assert_eq!(retry.friendship.status, FriendshipStatus::Pending);
    }

    #[tokio::test]
    async fn metadata_update_is_partial_and_guarded() {
        let engine = engine();
        let alice = add_user(&engine, "alice");
        let bob = add_user(&engine, "bob");
        let eve = add_user(&engine, "eve");
        let dto = engine
            .send_request(alice, bob, Some("colleague".into()), Some("work".into()))
            .await
            .unwrap();

        // Not accepted yet
        let early = engine
            .update_metadata(
                alice,
                dto.friendship.id,
                UpdateFriendshipRequest {
                    is_pinned: Some(true),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(early, Err(ChatError::NotFound(_))));

        engine
            .respond(bob, dto.friendship.id, RespondDecision::Accepted)
            .await
            .unwrap();

        let updated = engine
            .update_metadata(
                alice,
                dto.friendship.id,
                UpdateFriendshipRequest {
                    is_pinned: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // Only the provided field changed
        assert!(updated.is_pinned);
        assert_eq!(updated.remark.as_deref(), Some("colleague"));
        assert_eq!(updated.group_name.as_deref(), Some("work"));

        let outsider = engine
            .update_metadata(
                eve,
                dto.friendship.id,
                UpdateFriendshipRequest {
                    is_muted: Some(true),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(outsider, Err(ChatError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_removes_the_row_and_allows_restart() {
        let engine = engine();
        let alice = add_user(&engine, "alice");
        let bob = add_user(&engine, "bob");
        let dto = engine.send_request(alice, bob, None, None).await.unwrap();

        // Pending rows cannot be deleted
        let early = engine.delete(alice, dto.friendship.id).await;
        assert!(matches!(early, Err(ChatError::NotFound(_))));

        engine
            .respond(bob, dto.friendship.id, RespondDecision::Accepted)
            .await
            .unwrap();
        assert!(engine.delete(bob, dto.friendship.id).await.unwrap());
        assert!(engine.list_friends(alice).await.unwrap().is_empty());

        let again = engine.delete(bob, dto.friendship.id).await;
        assert!(matches!(again, Err(ChatError::NotFound(_))));

        // Lifecycle can start over
        engine.send_request(bob, alice, None, None).await.unwrap();
    }

    #[tokio::test]
    async fn request_and_response_events_are_targeted() {
        let engine = engine();
        let alice = add_user(&engine, "alice");
        let bob = add_user(&engine, "bob");

        let (_ca, mut alice_rx) = engine.dispatcher.connect(alice, "alice").await;
        let (_cb, mut bob_rx) = engine.dispatcher.connect(bob, "bob").await;

        let dto = engine.send_request(alice, bob, None, None).await.unwrap();
        match bob_rx.try_recv() {
            Ok(GatewayEvent::FriendRequest { requester, .. }) => {
                assert_eq!(requester.username, "alice");
            }
            other => panic!("expected FriendRequest, got {other:?}"),
        }
        assert!(alice_rx.try_recv().is_err());

        engine
            .respond(bob, dto.friendship.id, RespondDecision::Accepted)
            .await
            .unwrap();
        match alice_rx.try_recv() {
            Ok(GatewayEvent::FriendRequestHandled { friendship }) => {
                assert_eq!(friendship.status, FriendshipStatus::Accepted);
            }
            other => panic!("expected FriendRequestHandled, got {other:?}"),
        }
        assert!(bob_rx.try_recv().is_err());
    }
}
