pub mod auth;
pub mod error;
pub mod friendships;
pub mod messages;
pub mod middleware;
pub mod users;
