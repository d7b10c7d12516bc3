//! Network edge for a world: an axum WebSocket server hosting the
//! [`world_hub_core::Authority`] and a matching client transport.

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod events;
pub mod protocol;
