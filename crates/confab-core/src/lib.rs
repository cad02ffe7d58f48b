pub mod dispatcher;
pub mod friendships;
pub mod messages;
pub mod registry;

use std::sync::Arc;

use confab_db::Database;
use confab_types::error::{ChatError, ChatResult};

/// Run a blocking database closure off the async runtime.
pub(crate) async fn blocking<T, F>(db: &Arc<Database>, f: F) -> ChatResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
{
    let db = db.clone();
    let result = tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| ChatError::Internal(anyhow::anyhow!("blocking task failed: {e}")))?;
    result.map_err(ChatError::from)
}
