use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Friendship, UserSummary};

// -- JWT Claims --

/// JWT claims shared across confab-api (REST middleware) and confab-gateway
/// (WebSocket authentication). Canonical definition lives here in
/// confab-types to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub avatar: Option<String>,
    pub token: String,
}

// -- Friendships --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendFriendRequestRequest {
    pub friend_id: Uuid,
    #[serde(default)]
    pub remark: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateFriendshipRequest {
    #[serde(default)]
    pub remark: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub is_pinned: Option<bool>,
    #[serde(default)]
    pub is_muted: Option<bool>,
}

/// A friendship row plus the user summaries of both parties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendshipDto {
    #[serde(flatten)]
    pub friendship: Friendship,
    pub user: UserSummary,
    pub friend: UserSummary,
}

/// One entry of the friend list: the counterpart plus the shared metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendDto {
    pub friendship_id: Uuid,
    pub user: UserSummary,
    pub remark: Option<String>,
    pub group_name: Option<String>,
    pub is_pinned: bool,
    pub is_muted: bool,
    pub since: chrono::DateTime<chrono::Utc>,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub receiver_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct UnreadCountResponse {
    pub count: u32,
}

// -- Users --

#[derive(Debug, Serialize)]
pub struct PagedUsers {
    pub items: Vec<UserSummary>,
    pub total: u32,
    pub page: u32,
    pub page_size: u32,
}
