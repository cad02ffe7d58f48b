use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use confab_types::api::{Claims, SendFriendRequestRequest, UpdateFriendshipRequest};
use confab_types::events::RespondDecision;

use crate::auth::AppState;
use crate::error::ApiResult;

pub async fn list_friends(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let friends = state.friendships.list_friends(claims.sub).await?;
    Ok(Json(friends))
}

pub async fn list_requests(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let requests = state.friendships.list_pending(claims.sub).await?;
    Ok(Json(requests))
}

pub async fn send_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendFriendRequestRequest>,
) -> ApiResult<impl IntoResponse> {
    let dto = state
        .friendships
        .send_request(claims.sub, req.friend_id, req.remark, req.group_name)
        .await?;
    Ok((StatusCode::CREATED, Json(dto)))
}

pub async fn accept_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(friendship_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let friendship = state
        .friendships
        .respond(claims.sub, friendship_id, RespondDecision::Accepted)
        .await?;
    Ok(Json(friendship))
}

pub async fn reject_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(friendship_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let friendship = state
        .friendships
        .respond(claims.sub, friendship_id, RespondDecision::Rejected)
        .await?;
    Ok(Json(friendship))
}

pub async fn update_friendship(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(friendship_id): Path<Uuid>,
    Json(patch): Json<UpdateFriendshipRequest>,
) -> ApiResult<impl IntoResponse> {
    let friendship = state
        .friendships
        .update_metadata(claims.sub, friendship_id, patch)
        .await?;
    Ok(Json(friendship))
}

pub async fn delete_friendship(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(friendship_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.friendships.delete(claims.sub, friendship_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
