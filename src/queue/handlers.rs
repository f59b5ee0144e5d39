//! Action handlers
//!
//! One [`ActionHandler`] per [`MessageType`]. Each unpacks its payload and
//! makes the matching [`GameManager`] call, using the message id as the
//! idempotency key so a redelivered message is acknowledged without being
//! applied twice.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::core::ids::PlayerId;
use crate::game::manager::{GameError, GameManager};

use super::message::{MessageType, QueueAction, QueueMessage};

/// Result of a successful handler call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// State changed (or a snapshot was published).
    Applied,
    /// Already applied earlier; nothing changed.
    Duplicate,
}

impl HandlerOutcome {
    fn from_option<T>(applied: Option<T>) -> Self {
        match applied {
            Some(_) => HandlerOutcome::Applied,
            None => HandlerOutcome::Duplicate,
        }
    }
}

/// Executes one message type against the game manager.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Type this handler accepts.
    fn message_type(&self) -> MessageType;

    /// Apply the message.
    async fn handle(&self, manager: &GameManager, msg: &QueueMessage) -> Result<HandlerOutcome, GameError>;
}

fn actor(msg: &QueueMessage) -> Result<&PlayerId, GameError> {
    msg.player_id
        .as_ref()
        .ok_or_else(|| GameError::Malformed(format!("{} requires a playerId", msg.message_type())))
}

fn mismatch(expected: MessageType, msg: &QueueMessage) -> GameError {
    GameError::Malformed(format!("{} handler received {}", expected, msg.message_type()))
}

macro_rules! handler {
    ($(#[$meta:meta])* $name:ident, $kind:expr, |$manager:ident, $msg:ident| $body:block) => {
        $(#[$meta])*
        #[derive(Debug, Default, Clone, Copy)]
        pub struct $name;

        #[async_trait]
        impl ActionHandler for $name {
            fn message_type(&self) -> MessageType {
                $kind
            }

            async fn handle(
                &self,
                $manager: &GameManager,
                $msg: &QueueMessage,
            ) -> Result<HandlerOutcome, GameError> $body
        }
    };
}

handler!(
    /// Host starts the game.
    GameStartHandler, MessageType::GameStart, |manager, msg| {
        let player = actor(msg)?;
        let applied = manager.start_game(&msg.game_id, player, Some(&msg.id)).await?;
        Ok(HandlerOutcome::from_option(applied))
    }
);

handler!(
    /// Seats a user; a repeated join resolves to the existing seat.
    PlayerJoinedHandler, MessageType::PlayerJoined, |manager, msg| {
        let QueueAction::PlayerJoined { user_id, token } = &msg.action else {
            return Err(mismatch(MessageType::PlayerJoined, msg));
        };
        manager
            .join_game(&msg.game_id, user_id.clone(), token.clone(), Some(&msg.id))
            .await?;
        Ok(HandlerOutcome::Applied)
    }
);

handler!(
    PlayerLeftHandler, MessageType::PlayerLeft, |manager, msg| {
        let player = actor(msg)?;
        let applied = manager.leave_game(&msg.game_id, player, Some(&msg.id)).await?;
        Ok(HandlerOutcome::from_option(applied))
    }
);

handler!(
    TokenUpdateHandler, MessageType::TokenUpdate, |manager, msg| {
        let QueueAction::TokenUpdate { token } = &msg.action else {
            return Err(mismatch(MessageType::TokenUpdate, msg));
        };
        let player = actor(msg)?;
        let applied = manager.set_token(&msg.game_id, player, token, Some(&msg.id)).await?;
        Ok(HandlerOutcome::from_option(applied))
    }
);

handler!(
    PlayerReadyHandler, MessageType::PlayerReady, |manager, msg| {
        let QueueAction::PlayerReady { ready } = &msg.action else {
            return Err(mismatch(MessageType::PlayerReady, msg));
        };
        let player = actor(msg)?;
        let applied = manager.set_ready(&msg.game_id, player, *ready, Some(&msg.id)).await?;
        Ok(HandlerOutcome::from_option(applied))
    }
);

handler!(
    /// Rolls for the current player.
    RollHandler, MessageType::Roll, |manager, msg| {
        let player = actor(msg)?;
        let applied = manager.roll_dice(&msg.game_id, player, Some(&msg.id)).await?;
        Ok(HandlerOutcome::from_option(applied))
    }
);

handler!(
    BuyPropertyHandler, MessageType::BuyProperty, |manager, msg| {
        let QueueAction::BuyProperty { property_id } = &msg.action else {
            return Err(mismatch(MessageType::BuyProperty, msg));
        };
        let player = actor(msg)?;
        let applied = manager
            .buy_property(&msg.game_id, player, property_id, Some(&msg.id))
            .await?;
        Ok(HandlerOutcome::from_option(applied))
    }
);

handler!(
    PayRentHandler, MessageType::PayRent, |manager, msg| {
        let player = actor(msg)?;
        let applied = manager.pay_rent(&msg.game_id, player, Some(&msg.id)).await?;
        Ok(HandlerOutcome::from_option(applied))
    }
);

handler!(
    DrawCardHandler, MessageType::DrawCard, |manager, msg| {
        let player = actor(msg)?;
        let applied = manager.draw_card(&msg.game_id, player, Some(&msg.id)).await?;
        Ok(HandlerOutcome::from_option(applied))
    }
);

handler!(
    MortgageHandler, MessageType::Mortgage, |manager, msg| {
        let QueueAction::Mortgage { property_id } = &msg.action else {
            return Err(mismatch(MessageType::Mortgage, msg));
        };
        let player = actor(msg)?;
        let applied = manager.mortgage(&msg.game_id, player, property_id, Some(&msg.id)).await?;
        Ok(HandlerOutcome::from_option(applied))
    }
);

handler!(
    UnmortgageHandler, MessageType::Unmortgage, |manager, msg| {
        let QueueAction::Unmortgage { property_id } = &msg.action else {
            return Err(mismatch(MessageType::Unmortgage, msg));
        };
        let player = actor(msg)?;
        let applied = manager
            .unmortgage(&msg.game_id, player, property_id, Some(&msg.id))
            .await?;
        Ok(HandlerOutcome::from_option(applied))
    }
);

handler!(
    BuildEngagementHandler, MessageType::BuildEngagement, |manager, msg| {
        let QueueAction::BuildEngagement { property_id } = &msg.action else {
            return Err(mismatch(MessageType::BuildEngagement, msg));
        };
        let player = actor(msg)?;
        let applied = manager
            .build_engagement(&msg.game_id, player, property_id, Some(&msg.id))
            .await?;
        Ok(HandlerOutcome::from_option(applied))
    }
);

handler!(
    /// The message id becomes the trade id.
    ProposeTradeHandler, MessageType::ProposeTrade, |manager, msg| {
        let QueueAction::ProposeTrade(terms) = &msg.action else {
            return Err(mismatch(MessageType::ProposeTrade, msg));
        };
        let player = actor(msg)?;
        let applied = manager
            .propose_trade(&msg.game_id, player, terms.clone(), Some(&msg.id))
            .await?;
        Ok(HandlerOutcome::from_option(applied))
    }
);

handler!(
    RespondTradeHandler, MessageType::RespondTrade, |manager, msg| {
        let QueueAction::RespondTrade { trade_id, accept } = &msg.action else {
            return Err(mismatch(MessageType::RespondTrade, msg));
        };
        let player = actor(msg)?;
        let applied = manager
            .respond_trade(&msg.game_id, player, trade_id, *accept, Some(&msg.id))
            .await?;
        Ok(HandlerOutcome::from_option(applied))
    }
);

handler!(
    EndTurnHandler, MessageType::EndTurn, |manager, msg| {
        let player = actor(msg)?;
        let applied = manager.end_turn(&msg.game_id, player, Some(&msg.id)).await?;
        Ok(HandlerOutcome::from_option(applied))
    }
);

handler!(
    /// Publishes the current snapshot without mutating.
    StateUpdateHandler, MessageType::StateUpdate, |manager, msg| {
        manager.publish_snapshot(&msg.game_id).await?;
        Ok(HandlerOutcome::Applied)
    }
);

handler!(
    ForfeitHandler, MessageType::Forfeit, |manager, msg| {
        let player = actor(msg)?;
        let applied = manager.forfeit(&msg.game_id, player, Some(&msg.id)).await?;
        Ok(HandlerOutcome::from_option(applied))
    }
);

handler!(
    PauseGameHandler, MessageType::PauseGame, |manager, msg| {
        let player = actor(msg)?;
        let applied = manager.pause_game(&msg.game_id, player, Some(&msg.id)).await?;
        Ok(HandlerOutcome::from_option(applied))
    }
);

handler!(
    ResumeGameHandler, MessageType::ResumeGame, |manager, msg| {
        let player = actor(msg)?;
        let applied = manager.resume_game(&msg.game_id, player, Some(&msg.id)).await?;
        Ok(HandlerOutcome::from_option(applied))
    }
);

/// Dispatch table from message type to handler.
pub struct HandlerRegistry {
    handlers: BTreeMap<MessageType, Box<dyn ActionHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl HandlerRegistry {
    /// Registry with no handlers.
    pub fn empty() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    /// Registry with a handler for every message type.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(GameStartHandler);
        registry.register(PlayerJoinedHandler);
        registry.register(PlayerLeftHandler);
        registry.register(TokenUpdateHandler);
        registry.register(PlayerReadyHandler);
        registry.register(RollHandler);
        registry.register(BuyPropertyHandler);
        registry.register(PayRentHandler);
        registry.register(DrawCardHandler);
        registry.register(MortgageHandler);
        registry.register(UnmortgageHandler);
        registry.register(BuildEngagementHandler);
        registry.register(ProposeTradeHandler);
        registry.register(RespondTradeHandler);
        registry.register(EndTurnHandler);
        registry.register(StateUpdateHandler);
        registry.register(ForfeitHandler);
        registry.register(PauseGameHandler);
        registry.register(ResumeGameHandler);
        registry
    }

    /// Add or replace the handler for its message type.
    pub fn register(&mut self, handler: impl ActionHandler + 'static) {
        self.handlers.insert(handler.message_type(), Box::new(handler));
    }

    /// Handler for a message type.
    pub fn get(&self, kind: MessageType) -> Option<&dyn ActionHandler> {
        self.handlers.get(&kind).map(|h| h.as_ref())
    }

    /// Registered types.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// No handlers registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
