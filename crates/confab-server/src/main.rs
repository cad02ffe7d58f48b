use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{delete, get, patch, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use confab_api::auth::{self, AppState, AppStateInner};
use confab_api::friendships;
use confab_api::messages;
use confab_api::middleware::require_auth;
use confab_api::users;
use confab_core::dispatcher::Dispatcher;
use confab_core::friendships::FriendshipEngine;
use confab_core::messages::MessageStore;
use confab_core::registry::SessionRegistry;
use confab_gateway::{GatewayContext, connection};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "confab=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("CONFAB_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("CONFAB_DB_PATH").unwrap_or_else(|_| "confab.db".into());
    let host = std::env::var("CONFAB_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("CONFAB_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database
    let db = Arc::new(confab_db::Database::open(&PathBuf::from(&db_path))?);

    // The session registry is created here, once, and injected into the
    // dispatcher and the connection handler — it is cleared implicitly when
    // the process exits and repopulates as clients reconnect.
    let registry = Arc::new(SessionRegistry::new());
    let dispatcher = Dispatcher::new(registry);
    let friendship_engine = FriendshipEngine::new(db.clone(), dispatcher.clone());
    let message_store = MessageStore::new(db.clone(), dispatcher.clone());

    let app_state: AppState = Arc::new(AppStateInner {
        db,
        jwt_secret: jwt_secret.clone(),
        friendships: friendship_engine.clone(),
        messages: message_store.clone(),
    });

    let gateway = GatewayContext {
        dispatcher,
        friendships: friendship_engine,
        messages: message_store,
        jwt_secret,
    };

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/users/search", get(users::search_users))
        .route("/friends", get(friendships::list_friends))
        .route("/friends/requests", get(friendships::list_requests))
        .route("/friends/requests", post(friendships::send_request))
        .route(
            "/friends/requests/{friendship_id}/accept",
            post(friendships::accept_request),
        )
        .route(
            "/friends/requests/{friendship_id}/reject",
            post(friendships::reject_request),
        )
        .route(
            "/friends/{friendship_id}",
            patch(friendships::update_friendship),
        )
        .route(
            "/friends/{friendship_id}",
            delete(friendships::delete_friendship),
        )
        .route("/messages", post(messages::send_message))
        .route("/messages/sessions", get(messages::get_sessions))
        .route("/messages/unread/count", get(messages::unread_count))
        .route("/messages/users/{user_id}", get(messages::get_history))
        .route("/messages/{message_id}", patch(messages::edit_message))
        .route("/messages/{message_id}/read", post(messages::mark_read))
        .route(
            "/messages/{message_id}/recall",
            post(messages::recall_message),
        )
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            require_auth,
        ))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("confab server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(State(ctx): State<GatewayContext>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, ctx))
}
