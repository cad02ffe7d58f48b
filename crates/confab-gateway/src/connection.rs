use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use confab_types::error::ChatError;
use confab_types::events::{GatewayCommand, GatewayEvent};

use crate::GatewayContext;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a single WebSocket connection: Identify handshake, Ready, then
/// the event loop. On any exit path the connection is unregistered promptly
/// so stale handles never linger in the session registry.
pub async fn handle_connection(socket: WebSocket, ctx: GatewayContext) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: Wait for Identify command with JWT
    let (user_id, username) = match wait_for_identify(&mut receiver, &ctx.jwt_secret).await {
        Some(id) => id,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", username, user_id);

    // Step 2: Send Ready event
    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    // Send currently online users so this client sees who is already here
    for (uid, uname) in ctx.dispatcher.online_users().await {
        let event = GatewayEvent::UserOnline {
            user_id: uid,
            username: uname,
        };
        if sender
            .send(Message::Text(serde_json::to_string(&event).unwrap().into()))
            .await
            .is_err()
        {
            return;
        }
    }

    // Register this connection (announces UserOnline if it is the first),
    // then subscribe to presence — after, so we don't echo our own arrival.
    let (conn_id, mut user_rx) = ctx.dispatcher.connect(user_id, &username).await;
    let mut presence_rx = ctx.dispatcher.subscribe();

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward targeted events + presence broadcasts to the client, with
    // heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = user_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                result = presence_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Presence receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client
    let ctx_recv = ctx.clone();
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&ctx_recv, user_id, &username_recv, cmd).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            &text[..text.len().min(200)]
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    ctx.dispatcher.disconnect(user_id, &username, conn_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn wait_for_identify(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    use confab_types::api::Claims;
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let timeout = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some((token_data.claims.sub, token_data.claims.username));
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

/// Apply a client command through the same engine operation as its REST
/// dual. Failures are reported back to the user's connections as an Error
/// event; the command never bypasses the state machines.
async fn handle_command(ctx: &GatewayContext, user_id: Uuid, username: &str, cmd: GatewayCommand) {
    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled

        GatewayCommand::SendMessage {
            receiver_id,
            content,
            metadata,
        } => {
            let result = ctx
                .messages
                .send(user_id, receiver_id, content, metadata)
                .await;
            report(ctx, user_id, username, "SendMessage", result.err()).await;
        }

        GatewayCommand::MarkRead { message_id } => {
            let result = ctx.messages.mark_read(message_id, user_id).await;
            report(ctx, user_id, username, "MarkRead", result.err()).await;
        }

        GatewayCommand::RecallMessage { message_id } => {
            let result = ctx.messages.recall(message_id, user_id).await;
            report(ctx, user_id, username, "RecallMessage", result.err()).await;
        }

        GatewayCommand::SendFriendRequest {
            target_id,
            remark,
            group_name,
        } => {
            let result = ctx
                .friendships
                .send_request(user_id, target_id, remark, group_name)
                .await;
            report(ctx, user_id, username, "SendFriendRequest", result.err()).await;
        }

        GatewayCommand::HandleFriendRequest {
            friendship_id,
            decision,
        } => {
            let result = ctx
                .friendships
                .respond(user_id, friendship_id, decision)
                .await;
            report(ctx, user_id, username, "HandleFriendRequest", result.err()).await;
        }

        GatewayCommand::StartTyping { peer_id } => {
            ctx.dispatcher
                .send_to_user(
                    peer_id,
                    GatewayEvent::TypingStart {
                        from_user_id: user_id,
                    },
                )
                .await;
        }
    }
}

async fn report(
    ctx: &GatewayContext,
    user_id: Uuid,
    username: &str,
    op: &str,
    err: Option<ChatError>,
) {
    let Some(err) = err else { return };
    warn!("{} ({}) {} failed: {}", username, user_id, op, err);
    ctx.dispatcher
        .send_to_user(
            user_id,
            GatewayEvent::Error {
                code: err.code().to_string(),
                message: err.to_string(),
            },
        )
        .await;
}
