use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Friendship, FriendshipStatus, Message, MessageStatus, UserSummary};

/// Events pushed to clients over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// A direct message addressed to this client was stored
    MessageReceived { message: Message },

    /// A message this client sent changed delivery state (read receipt)
    MessageStatusUpdated {
        message_id: Uuid,
        status: MessageStatus,
    },

    /// The sender retracted a message within the recall window
    MessageRecalled {
        message_id: Uuid,
        recalled_by: Uuid,
    },

    /// A user came online
    UserOnline { user_id: Uuid, username: String },

    /// A user went offline
    UserOffline { user_id: Uuid, username: String },

    /// Someone sent this client a friend request
    FriendRequest {
        friendship: Friendship,
        requester: UserSummary,
    },

    /// A request this client sent was accepted or rejected
    FriendRequestHandled { friendship: Friendship },

    /// Remark/group/pin/mute metadata changed on a friendship
    FriendStatusChanged { friendship: Friendship },

    /// The counterpart started typing
    TypingStart { from_user_id: Uuid },

    /// A client-initiated command failed its state-machine checks
    Error { code: String, message: String },
}

/// Commands sent FROM client TO server over the WebSocket.
///
/// Every mutating command runs through the same engine operation as its REST
/// dual, so the state machine cannot be bypassed from the live channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Send a direct message
    SendMessage {
        receiver_id: Uuid,
        content: String,
        #[serde(default)]
        metadata: Option<std::collections::HashMap<String, String>>,
    },

    /// Mark a received message as read
    MarkRead { message_id: Uuid },

    /// Retract a previously sent message
    RecallMessage { message_id: Uuid },

    /// Send a friend request
    SendFriendRequest {
        target_id: Uuid,
        #[serde(default)]
        remark: Option<String>,
        #[serde(default)]
        group_name: Option<String>,
    },

    /// Accept or reject a pending friend request
    HandleFriendRequest {
        friendship_id: Uuid,
        decision: RespondDecision,
    },

    /// Tell the counterpart we are typing
    StartTyping { peer_id: Uuid },
}

/// The invitee's verdict on a pending friend request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RespondDecision {
    Accepted,
    Rejected,
}

impl RespondDecision {
    pub fn status(self) -> FriendshipStatus {
        match self {
            Self::Accepted => FriendshipStatus::Accepted,
            Self::Rejected => FriendshipStatus::Rejected,
        }
    }
}
