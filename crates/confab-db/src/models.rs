//! Database row types — these map directly to SQLite rows.
//! Distinct from the confab-types API models to keep the DB layer
//! independent; conversions live here too.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use confab_types::models::{Friendship, FriendshipStatus, Message, User, UserSummary};

/// Timestamps are stored as RFC 3339 UTC with microsecond precision, so the
/// stored strings sort lexicographically in chronological order and the
/// recall/edit window checks can compare them directly in SQL.
pub fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp in database: {s}"))?
        .with_timezone(&Utc))
}

fn decode_ts_opt(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    s.map(decode_ts).transpose()
}

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password: String,
    pub avatar: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub last_login_at: Option<String>,
    pub last_active_at: Option<String>,
}

impl UserRow {
    pub fn to_user(&self) -> Result<User> {
        Ok(User {
            id: self.id.parse()?,
            username: self.username.clone(),
            email: self.email.clone(),
            avatar: self.avatar.clone(),
            created_at: decode_ts(&self.created_at)?,
            updated_at: decode_ts(&self.updated_at)?,
            last_login_at: decode_ts_opt(self.last_login_at.as_deref())?,
            last_active_at: decode_ts_opt(self.last_active_at.as_deref())?,
        })
    }

    pub fn to_summary(&self) -> Result<UserSummary> {
        Ok(UserSummary {
            id: self.id.parse()?,
            username: self.username.clone(),
            avatar: self.avatar.clone(),
        })
    }
}

pub struct FriendshipRow {
    pub id: String,
    pub user_id: String,
    pub friend_id: String,
    pub status: String,
    pub remark: Option<String>,
    pub group_name: Option<String>,
    pub is_pinned: bool,
    pub is_muted: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl FriendshipRow {
    pub fn to_friendship(&self) -> Result<Friendship> {
        Ok(Friendship {
            id: self.id.parse()?,
            user_id: self.user_id.parse()?,
            friend_id: self.friend_id.parse()?,
            status: FriendshipStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("bad friendship status in database: {}", self.status))?,
            remark: self.remark.clone(),
            group_name: self.group_name.clone(),
            is_pinned: self.is_pinned,
            is_muted: self.is_muted,
            created_at: decode_ts(&self.created_at)?,
            updated_at: decode_ts(&self.updated_at)?,
        })
    }
}

pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub metadata: Option<String>,
    pub is_read: bool,
    pub read_at: Option<String>,
    pub is_recalled: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl MessageRow {
    pub fn to_message(&self) -> Result<Message> {
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("bad message metadata in database")?;

        Ok(Message {
            id: self.id.parse()?,
            sender_id: self.sender_id.parse()?,
            receiver_id: self.receiver_id.parse()?,
            content: self.content.clone(),
            metadata,
            is_read: self.is_read,
            read_at: decode_ts_opt(self.read_at.as_deref())?,
            is_recalled: self.is_recalled,
            created_at: decode_ts(&self.created_at)?,
            updated_at: decode_ts(&self.updated_at)?,
        })
    }
}

/// A friendship joined with the counterpart's user summary.
pub struct FriendRow {
    pub friendship: FriendshipRow,
    pub peer_id: String,
    pub peer_username: String,
    pub peer_avatar: Option<String>,
}

impl FriendRow {
    pub fn peer_summary(&self) -> Result<UserSummary> {
        Ok(UserSummary {
            id: self.peer_id.parse()?,
            username: self.peer_username.clone(),
            avatar: self.peer_avatar.clone(),
        })
    }
}

/// A message joined with the counterpart's user summary, for the chat
/// session projection.
pub struct SessionRow {
    pub message: MessageRow,
    pub peer_id: String,
    pub peer_username: String,
    pub peer_avatar: Option<String>,
}

impl SessionRow {
    pub fn peer_summary(&self) -> Result<UserSummary> {
        Ok(UserSummary {
            id: self.peer_id.parse()?,
            username: self.peer_username.clone(),
            avatar: self.peer_avatar.clone(),
        })
    }
}
