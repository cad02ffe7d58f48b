pub mod connection;

use confab_core::dispatcher::Dispatcher;
use confab_core::friendships::FriendshipEngine;
use confab_core::messages::MessageStore;

/// Everything a live connection needs: the dispatcher for registration and
/// fan-out, and the engines so client commands run through the same state
/// machines as their REST duals.
#[derive(Clone)]
pub struct GatewayContext {
    pub dispatcher: Dispatcher,
    pub friendships: FriendshipEngine,
    pub messages: MessageStore,
    pub jwt_secret: String,
}
