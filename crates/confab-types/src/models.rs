use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Content stored in place of the original text once a message is recalled.
pub const RECALLED_PLACEHOLDER: &str = "[message recalled]";

/// Maximum message content length, in characters.
pub const MAX_CONTENT_LEN: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_active_at: Option<DateTime<Utc>>,
}

/// The slice of a user other people get to see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendshipStatus {
    Pending,
    Accepted,
    Rejected,
    Deleted,
    Blocked,
}

impl FriendshipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Deleted => "deleted",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "deleted" => Some(Self::Deleted),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

/// One relationship row. `user_id` is the requester, `friend_id` the invitee;
/// once accepted the relation is symmetric for querying. The remark/group/
/// pinned/muted metadata lives on this shared row and belongs to whichever
/// side writes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Friendship {
    pub id: Uuid,
    pub user_id: Uuid,
    pub friend_id: Uuid,
    pub status: FriendshipStatus,
    pub remark: Option<String>,
    pub group_name: Option<String>,
    pub is_pinned: bool,
    pub is_muted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Friendship {
    /// The other party of the relationship, from `viewer`'s perspective.
    pub fn counterpart(&self, viewer: Uuid) -> Uuid {
        if self.user_id == viewer {
            self.friend_id
        } else {
            self.user_id
        }
    }

    pub fn involves(&self, user: Uuid) -> bool {
        self.user_id == user || self.friend_id == user
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
    Recalled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub is_recalled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Recall wins over read in the derived status.
    pub fn status(&self) -> MessageStatus {
        if self.is_recalled {
            MessageStatus::Recalled
        } else if self.is_read {
            MessageStatus::Read
        } else {
            MessageStatus::Sent
        }
    }
}

/// Derived per-viewer summary of the latest exchange with one counterpart.
/// Never stored; recomputed from the message table on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub peer: UserSummary,
    pub last_message: String,
    pub last_message_time: DateTime<Utc>,
    pub unread_count: u32,
}
