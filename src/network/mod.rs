//! Network Layer
//!
//! WebSocket server, wire protocol and the connection hub.
//! Nothing here mutates game documents directly: actions go through the queue
//! and connection changes through the game manager.

pub mod auth;
pub mod hub;
pub mod protocol;
pub mod server;

pub use auth::{authenticate, validate_token, AuthConfig, AuthError, TokenClaims};
pub use hub::{ConnectionHub, DisconnectReason, HubConfig, HubEvent, HubHandle, SessionId};
pub use protocol::{ClientMessage, ErrorCode, ServerError, ServerMessage};
pub use server::{GameServer, GameServerError, Relays, ServerConfig};
