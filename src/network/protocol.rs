//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is one JSON object discriminated by `type`.
//!
//! A connection must send `auth` first. Without a `gameId` it may then
//! `create-game` or `join-game`; once bound to a game, `action` frames are
//! queued for that game under the authenticated player.

use serde::{Deserialize, Serialize};

use crate::core::ids::{GameId, PlayerId};
use crate::game::events::GameEvent;
use crate::game::manager::GameError;
use crate::game::state::Game;
use crate::network::auth::AuthError;
use crate::queue::message::QueueAction;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Authenticate with the server.
    Auth(AuthRequest),

    /// Open a new lobby with this user as host.
    CreateGame {
        /// Host's token.
        token: String,
        /// Seat limit.
        #[serde(default)]
        max_players: Option<usize>,
        /// Players needed to start.
        #[serde(default)]
        min_players: Option<usize>,
    },

    /// Take a seat in a lobby by its join code.
    JoinGame {
        /// Join code.
        code: String,
        /// Requested token.
        token: String,
    },

    /// A game action for the bound game.
    Action(ActionRequest),

    /// Request current game state (for reconnection).
    SyncRequest,

    /// Ping for latency measurement.
    Ping { timestamp: u64 },

    /// Reply to a server heartbeat.
    Pong { timestamp: u64 },

    /// Close the connection cleanly.
    Leave,
}

/// Authentication request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    /// JWT (or raw user id in anonymous mode).
    pub token: String,
    /// Game to bind to. The user must hold a seat in it.
    #[serde(default)]
    pub game_id: Option<GameId>,
    /// Client version for compatibility check.
    #[serde(default)]
    pub client_version: Option<String>,
}

/// Action envelope. Game and player come from the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    /// Client-chosen id; makes resubmission idempotent.
    #[serde(default)]
    pub id: Option<String>,
    /// The action.
    pub action: QueueAction,
    /// Client timestamp.
    #[serde(default)]
    pub timestamp: Option<u64>,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Authentication result.
    AuthResult(AuthResult),

    /// Full game snapshot.
    State { game: Box<Game> },

    /// What the last committed action did.
    Event { game_id: GameId, events: Vec<GameEvent> },

    /// Action accepted onto the game's queue.
    Queued { action_id: String },

    /// Heartbeat; answer with `pong`.
    Ping { timestamp: u64 },

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown { reason: String },
}

/// Authentication result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResult {
    /// Whether auth succeeded.
    pub success: bool,
    /// Connection session id if successful.
    pub session_id: Option<String>,
    /// Bound game.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<GameId>,
    /// Seat in the bound game.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<PlayerId>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Server version.
    pub server_version: String,
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Action this error answers, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
}

impl ServerError {
    /// Error without an action reference.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            action_id: None,
        }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// Authentication failed.
    AuthFailed,
    /// Not authenticated.
    NotAuthenticated,
    /// JWT token has expired.
    TokenExpired,
    /// Invalid JWT token (signature, format, claims).
    InvalidToken,
    /// Invalid input.
    InvalidInput,
    /// Game not found.
    GameNotFound,
    /// Connection is not bound to a game (or user has no seat).
    NotInGame,
    /// Connection is already bound to a game.
    AlreadyInGame,
    /// Rules refused the action.
    ActionRejected,
    /// Storage is unavailable; try again.
    Unavailable,
    /// Internal error.
    InternalError,
}

impl From<&AuthError> for ErrorCode {
    fn from(err: &AuthError) -> Self {
        match err {
            AuthError::Expired => ErrorCode::TokenExpired,
            AuthError::InvalidFormat
            | AuthError::InvalidSignature
            | AuthError::InvalidIssuer
            | AuthError::InvalidAudience
            | AuthError::MissingClaim(_)
            | AuthError::DecodeError(_) => ErrorCode::InvalidToken,
            AuthError::NotConfigured => ErrorCode::AuthFailed,
        }
    }
}

impl From<&GameError> for ErrorCode {
    fn from(err: &GameError) -> Self {
        match err {
            GameError::Validation(_) => ErrorCode::ActionRejected,
            GameError::NotFound(_) | GameError::UnknownCode(_) => ErrorCode::GameNotFound,
            GameError::PlayerNotFound { .. } => ErrorCode::NotInGame,
            GameError::Malformed(_) => ErrorCode::InvalidInput,
            GameError::Transient(_) => ErrorCode::Unavailable,
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Error frame.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError::new(code, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::rules::RuleError;

    #[test]
    fn test_parse_auth() {
        let msg = ClientMessage::from_json(r#"{"type":"auth","token":"jwt","gameId":"g1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Auth(AuthRequest {
                token: "jwt".into(),
                game_id: Some(GameId::new("g1")),
                client_version: None,
            })
        );
    }

    #[test]
    fn test_parse_action() {
        let json = r#"{"type":"action","id":"a1","action":{"type":"buy-property","data":{"propertyId":"meme-alley"}}}"#;
        let msg = ClientMessage::from_json(json).unwrap();
        let ClientMessage::Action(req) = msg else {
            panic!("Wrong message type");
        };
        assert_eq!(req.id.as_deref(), Some("a1"));
        assert_eq!(req.action, QueueAction::BuyProperty { property_id: "meme-alley".into() });

        let roll = ClientMessage::from_json(r#"{"type":"action","action":{"type":"roll"}}"#).unwrap();
        assert!(matches!(roll, ClientMessage::Action(ActionRequest { action: QueueAction::Roll, .. })));
    }

    #[test]
    fn test_parse_create_and_join() {
        let create = ClientMessage::from_json(r#"{"type":"create-game","token":"rocket","maxPlayers":6}"#).unwrap();
        assert_eq!(
            create,
            ClientMessage::CreateGame { token: "rocket".into(), max_players: Some(6), min_players: None }
        );
        let join = ClientMessage::from_json(r#"{"type":"join-game","code":"ABC234","token":"comet"}"#).unwrap();
        assert!(matches!(join, ClientMessage::JoinGame { .. }));
    }

    #[test]
    fn test_unknown_message_rejected() {
        assert!(ClientMessage::from_json(r#"{"type":"matchmaking"}"#).is_err());
        assert!(ClientMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_server_message_shape() {
        let msg = ServerMessage::Pong { timestamp: 1, server_time: 2 };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "pong");
        assert_eq!(value["serverTime"], 2);

        let err = ServerMessage::Error(ServerError {
            code: ErrorCode::ActionRejected,
            message: "not your turn".into(),
            action_id: Some("a1".into()),
        });
        let value: serde_json::Value = serde_json::from_str(&err.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "action-rejected");
        assert_eq!(value["actionId"], "a1");
        assert_eq!(ServerMessage::from_json(&err.to_json().unwrap()).unwrap(), err);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ErrorCode::from(&AuthError::Expired), ErrorCode::TokenExpired);
        assert_eq!(ErrorCode::from(&AuthError::InvalidSignature), ErrorCode::InvalidToken);
        assert_eq!(
            ErrorCode::from(&GameError::Validation(RuleError::NotYourTurn)),
            ErrorCode::ActionRejected
        );
        assert_eq!(ErrorCode::from(&GameError::NotFound(GameId::new("g"))), ErrorCode::GameNotFound);
    }
}
