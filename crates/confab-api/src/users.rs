use axum::{
    Extension, Json,
    extract::{Query, State},
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::error;

use confab_types::api::{Claims, PagedUsers};
use confab_types::error::ChatError;

use crate::auth::AppState;
use crate::error::ApiResult;

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

/// Prefix search over usernames and emails, excluding the caller.
pub async fn search_users(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<impl IntoResponse> {
    let q = query.q.trim().to_string();
    if q.is_empty() {
        return Err(ChatError::Validation("search query must not be empty".into()).into());
    }

    let page = query.page.max(1);
    let page_size = query.page_size.clamp(1, 100);
    let offset = (page - 1).saturating_mul(page_size);
    let me = claims.sub.to_string();

    // Run the blocking DB query off the async runtime
    let db = state.db.clone();
    let (rows, total) = tokio::task::spawn_blocking(move || {
        db.search_users(&q, &me, page_size, offset)
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {e}");
        anyhow::anyhow!("search task failed")
    })??;

    let items = rows
        .iter()
        .map(|r| r.to_summary())
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Json(PagedUsers {
        items,
        total,
        page,
        page_size,
    }))
}
