//! Queue Messages
//!
//! A queued action is stored as one JSON object:
//!
//! ```json
//! {"id":"…","type":"buy-property","data":{"propertyId":"meme-alley"},
//!  "gameId":"…","playerId":"…","timestamp":1700000000000,"attempts":0}
//! ```
//!
//! Dead-lettered messages keep exactly the same shape.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::ids::{now_millis, GameId, PlayerId, UserId};
use crate::game::rules::TradeTerms;

/// Typed payload of a queued action, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum QueueAction {
    /// Host starts the game.
    GameStart,
    /// A user takes a seat.
    PlayerJoined {
        /// Joining account.
        user_id: UserId,
        /// Requested token.
        token: String,
    },
    /// Player leaves the lobby.
    PlayerLeft,
    /// Player picks a different token.
    TokenUpdate {
        /// New token.
        token: String,
    },
    /// Player toggles ready.
    PlayerReady {
        /// Ready flag.
        ready: bool,
    },
    /// Roll the dice.
    Roll,
    /// Buy the property landed on.
    BuyProperty {
        /// Property id.
        property_id: String,
    },
    /// Settle pending rent.
    PayRent,
    /// Draw from the pending deck.
    DrawCard,
    /// Mortgage an owned property.
    Mortgage {
        /// Property id.
        property_id: String,
    },
    /// Lift a mortgage.
    Unmortgage {
        /// Property id.
        property_id: String,
    },
    /// Raise a build level.
    BuildEngagement {
        /// Property id.
        property_id: String,
    },
    /// Offer a trade.
    ProposeTrade(TradeTerms),
    /// Answer the pending trade.
    RespondTrade {
        /// Trade being answered.
        trade_id: String,
        /// Accept or reject.
        accept: bool,
    },
    /// Finish the current turn.
    EndTurn,
    /// Re-broadcast the current snapshot.
    StateUpdate,
    /// Give up.
    Forfeit,
    /// Host pauses.
    PauseGame,
    /// Host resumes.
    ResumeGame,
}

/// Dispatch key for [`QueueAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageType {
    /// See [`QueueAction::GameStart`].
    GameStart,
    /// See [`QueueAction::PlayerJoined`].
    PlayerJoined,
    /// See [`QueueAction::PlayerLeft`].
    PlayerLeft,
    /// See [`QueueAction::TokenUpdate`].
    TokenUpdate,
    /// See [`QueueAction::PlayerReady`].
    PlayerReady,
    /// See [`QueueAction::Roll`].
    Roll,
    /// See [`QueueAction::BuyProperty`].
    BuyProperty,
    /// See [`QueueAction::PayRent`].
    PayRent,
    /// See [`QueueAction::DrawCard`].
    DrawCard,
    /// See [`QueueAction::Mortgage`].
    Mortgage,
    /// See [`QueueAction::Unmortgage`].
    Unmortgage,
    /// See [`QueueAction::BuildEngagement`].
    BuildEngagement,
    /// See [`QueueAction::ProposeTrade`].
    ProposeTrade,
    /// See [`QueueAction::RespondTrade`].
    RespondTrade,
    /// See [`QueueAction::EndTurn`].
    EndTurn,
    /// See [`QueueAction::StateUpdate`].
    StateUpdate,
    /// See [`QueueAction::Forfeit`].
    Forfeit,
    /// See [`QueueAction::PauseGame`].
    PauseGame,
    /// See [`QueueAction::ResumeGame`].
    ResumeGame,
}

impl MessageType {
    /// Every message type, in declaration order.
    pub const ALL: [MessageType; 19] = [
        MessageType::GameStart,
        MessageType::PlayerJoined,
        MessageType::PlayerLeft,
        MessageType::TokenUpdate,
        MessageType::PlayerReady,
        MessageType::Roll,
        MessageType::BuyProperty,
        MessageType::PayRent,
        MessageType::DrawCard,
        MessageType::Mortgage,
        MessageType::Unmortgage,
        MessageType::BuildEngagement,
        MessageType::ProposeTrade,
        MessageType::RespondTrade,
        MessageType::EndTurn,
        MessageType::StateUpdate,
        MessageType::Forfeit,
        MessageType::PauseGame,
        MessageType::ResumeGame,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::GameStart => "game-start",
            MessageType::PlayerJoined => "player-joined",
            MessageType::PlayerLeft => "player-left",
            MessageType::TokenUpdate => "token-update",
            MessageType::PlayerReady => "player-ready",
            MessageType::Roll => "roll",
            MessageType::BuyProperty => "buy-property",
            MessageType::PayRent => "pay-rent",
            MessageType::DrawCard => "draw-card",
            MessageType::Mortgage => "mortgage",
            MessageType::Unmortgage => "unmortgage",
            MessageType::BuildEngagement => "build-engagement",
            MessageType::ProposeTrade => "propose-trade",
            MessageType::RespondTrade => "respond-trade",
            MessageType::EndTurn => "end-turn",
            MessageType::StateUpdate => "state-update",
            MessageType::Forfeit => "forfeit",
            MessageType::PauseGame => "pause-game",
            MessageType::ResumeGame => "resume-game",
        }
    }

    /// Whether the message acts on behalf of a seated player.
    pub fn requires_player(self) -> bool {
        !matches!(self, MessageType::PlayerJoined | MessageType::StateUpdate)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl QueueAction {
    /// Dispatch key.
    pub fn message_type(&self) -> MessageType {
        match self {
            QueueAction::GameStart => MessageType::GameStart,
            QueueAction::PlayerJoined { .. } => MessageType::PlayerJoined,
            QueueAction::PlayerLeft => MessageType::PlayerLeft,
            QueueAction::TokenUpdate { .. } => MessageType::TokenUpdate,
            QueueAction::PlayerReady { .. } => MessageType::PlayerReady,
            QueueAction::Roll => MessageType::Roll,
            QueueAction::BuyProperty { .. } => MessageType::BuyProperty,
            QueueAction::PayRent => MessageType::PayRent,
            QueueAction::DrawCard => MessageType::DrawCard,
            QueueAction::Mortgage { .. } => MessageType::Mortgage,
            QueueAction::Unmortgage { .. } => MessageType::Unmortgage,
            QueueAction::BuildEngagement { .. } => MessageType::BuildEngagement,
            QueueAction::ProposeTrade(_) => MessageType::ProposeTrade,
            QueueAction::RespondTrade { .. } => MessageType::RespondTrade,
            QueueAction::EndTurn => MessageType::EndTurn,
            QueueAction::StateUpdate => MessageType::StateUpdate,
            QueueAction::Forfeit => MessageType::Forfeit,
            QueueAction::PauseGame => MessageType::PauseGame,
            QueueAction::ResumeGame => MessageType::ResumeGame,
        }
    }
}

/// A queued action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    /// Unique id; doubles as the idempotency key.
    pub id: String,
    /// What to do.
    #[serde(flatten)]
    pub action: QueueAction,
    /// Target game.
    pub game_id: GameId,
    /// Acting player, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<PlayerId>,
    /// Enqueue time (ms since epoch).
    pub timestamp: u64,
    /// Failed processing attempts so far. Never decreases.
    #[serde(default)]
    pub attempts: u32,
}

impl QueueMessage {
    /// New message with a fresh id and zero attempts.
    pub fn new(game_id: GameId, player_id: Option<PlayerId>, action: QueueAction) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action,
            game_id,
            player_id,
            timestamp: now_millis(),
            attempts: 0,
        }
    }

    /// Use a caller-supplied id (client action ids, replays).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Dispatch key.
    pub fn message_type(&self) -> MessageType {
        self.action.message_type()
    }

    /// Copy for requeueing with the attempt counter bumped.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempts: self.attempts.saturating_add(1),
            ..self.clone()
        }
    }
}
