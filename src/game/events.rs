//! Game Events
//!
//! Everything a rule application did, in order. Events are broadcast to the
//! game's connections alongside the updated snapshot so clients can animate
//! without diffing documents.

use serde::{Deserialize, Serialize};

use crate::core::ids::PlayerId;
use crate::game::cards::CardDeck;
use crate::game::state::{EffectKind, MarketCondition};

/// Why a player went to jail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JailReason {
    /// Third consecutive double.
    TripleDoubles,
    /// Landed on the go-to-jail space.
    GoToJailSpace,
    /// Card effect.
    Card,
}

/// Game event data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum GameEventData {
    /// Player took a seat.
    PlayerJoined { player_id: PlayerId },
    /// Player left the lobby.
    PlayerLeft { player_id: PlayerId },
    /// Lobby host changed.
    HostChanged { player_id: PlayerId },
    /// Player picked a token.
    TokenChanged { player_id: PlayerId, token: String },
    /// Player toggled ready.
    PlayerReady { player_id: PlayerId, ready: bool },
    /// Game moved to active.
    GameStarted { turn_order: Vec<PlayerId> },
    /// Dice rolled.
    DiceRolled { player_id: PlayerId, dice: [u8; 2], doubles: bool },
    /// Token moved.
    PlayerMoved { player_id: PlayerId, from: u8, to: u8 },
    /// Start salary paid.
    SalaryCollected { player_id: PlayerId, amount: i64 },
    /// Bank sold a property.
    PropertyBought { player_id: PlayerId, property_id: String, price: i64 },
    /// Rent became due.
    RentDue { player_id: PlayerId, owner_id: PlayerId, property_id: String, amount: i64 },
    /// Rent settled.
    RentPaid { player_id: PlayerId, owner_id: PlayerId, property_id: String, amount: i64 },
    /// Tax paid to the bank.
    TaxPaid { player_id: PlayerId, amount: i64 },
    /// Card drawn.
    CardDrawn { player_id: PlayerId, deck: CardDeck, card_id: String },
    /// Deck refilled.
    DeckReshuffled { deck: CardDeck },
    /// Bank paid the player.
    FundsCollected { player_id: PlayerId, amount: i64 },
    /// Player paid the bank.
    FundsPaid { player_id: PlayerId, amount: i64 },
    /// Player jailed.
    SentToJail { player_id: PlayerId, reason: JailReason },
    /// Player freed.
    ReleasedFromJail { player_id: PlayerId, fine_paid: i64, used_card: bool },
    /// Jail turn served.
    JailTurnServed { player_id: PlayerId, turns_left: u8 },
    /// Property mortgaged.
    PropertyMortgaged { player_id: PlayerId, property_id: String, amount: i64 },
    /// Mortgage lifted.
    PropertyUnmortgaged { player_id: PlayerId, property_id: String, amount: i64 },
    /// Build level raised.
    EngagementBuilt { player_id: PlayerId, property_id: String, level: u8, cost: i64 },
    /// Market shifted.
    MarketChanged { condition: MarketCondition },
    /// Timed effect applied.
    EffectApplied { property_id: String, kind: EffectKind, turns: u8 },
    /// Timed effect ran out.
    EffectExpired { property_id: String, kind: EffectKind },
    /// Trade offered.
    TradeProposed { trade_id: String, from_player_id: PlayerId, to_player_id: PlayerId },
    /// Trade executed.
    TradeCompleted { trade_id: String },
    /// Trade declined.
    TradeRejected { trade_id: String },
    /// Turn passed.
    TurnEnded { player_id: PlayerId, next_player_id: Option<PlayerId> },
    /// Player could not cover a mandatory payment.
    PlayerBankrupt { player_id: PlayerId, creditor_id: Option<PlayerId> },
    /// Player forfeited.
    PlayerForfeited { player_id: PlayerId },
    /// Connection lost.
    PlayerDisconnected { player_id: PlayerId },
    /// Connection restored.
    PlayerReconnected { player_id: PlayerId },
    /// Host paused.
    GamePaused,
    /// Host resumed.
    GameResumed,
    /// Game over with a winner.
    GameCompleted { winner_id: PlayerId },
    /// Game over without a winner.
    GameAbandoned,
}

/// A game event stamped with the turn it happened in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameEvent {
    /// Turn number when the event occurred.
    pub turn: u32,
    /// Event data.
    #[serde(flatten)]
    pub data: GameEventData,
}

impl GameEvent {
    /// Create a new event.
    pub fn new(turn: u32, data: GameEventData) -> Self {
        Self { turn, data }
    }

    /// Player the event is about, if any.
    pub fn player_id(&self) -> Option<&PlayerId> {
        use GameEventData::*;
        match &self.data {
            PlayerJoined { player_id }
            | PlayerLeft { player_id }
            | HostChanged { player_id }
            | TokenChanged { player_id, .. }
            | PlayerReady { player_id, .. }
            | DiceRolled { player_id, .. }
            | PlayerMoved { player_id, .. }
            | SalaryCollected { player_id, .. }
            | PropertyBought { player_id, .. }
            | RentDue { player_id, .. }
            | RentPaid { player_id, .. }
            | TaxPaid { player_id, .. }
            | CardDrawn { player_id, .. }
            | FundsCollected { player_id, .. }
            | FundsPaid { player_id, .. }
            | SentToJail { player_id, .. }
            | ReleasedFromJail { player_id, .. }
            | JailTurnServed { player_id, .. }
            | PropertyMortgaged { player_id, .. }
            | PropertyUnmortgaged { player_id, .. }
            | EngagementBuilt { player_id, .. }
            | TurnEnded { player_id, .. }
            | PlayerBankrupt { player_id, .. }
            | PlayerForfeited { player_id }
            | PlayerDisconnected { player_id }
            | PlayerReconnected { player_id } => Some(player_id),
            GameCompleted { winner_id } => Some(winner_id),
            TradeProposed { from_player_id, .. } => Some(from_player_id),
            GameStarted { .. }
            | DeckReshuffled { .. }
            | MarketChanged { .. }
            | EffectApplied { .. }
            | EffectExpired { .. }
            | TradeCompleted { .. }
            | TradeRejected { .. }
            | GamePaused
            | GameResumed
            | GameAbandoned => None,
        }
    }
}

/// Collects events during one rule application.
#[derive(Debug, Default)]
pub struct EventLog {
    turn: u32,
    events: Vec<GameEvent>,
}

impl EventLog {
    /// Log for the given turn.
    pub fn new(turn: u32) -> Self {
        Self {
            turn,
            events: Vec::new(),
        }
    }

    /// Record an event.
    pub fn push(&mut self, data: GameEventData) {
        self.events.push(GameEvent::new(self.turn, data));
    }

    /// Update the turn stamp (after a turn passes).
    pub fn set_turn(&mut self, turn: u32) {
        self.turn = turn;
    }

    /// Events so far.
    pub fn events(&self) -> &[GameEvent] {
        &self.events
    }

    /// Take ownership of the events.
    pub fn into_events(self) -> Vec<GameEvent> {
        self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = GameEvent::new(
            3,
            GameEventData::DiceRolled {
                player_id: PlayerId::new("p1"),
                dice: [2, 2],
                doubles: true,
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "dice-rolled");
        assert_eq!(json["playerId"], "p1");
        assert_eq!(json["turn"], 3);
    }

    #[test]
    fn test_player_id_lookup() {
        let event = GameEvent::new(0, GameEventData::GameCompleted { winner_id: PlayerId::new("w") });
        assert_eq!(event.player_id(), Some(&PlayerId::new("w")));
        let event = GameEvent::new(0, GameEventData::GamePaused);
        assert_eq!(event.player_id(), None);
    }

    #[test]
    fn test_event_log_stamps_turn() {
        let mut log = EventLog::new(1);
        log.push(GameEventData::GamePaused);
        log.set_turn(2);
        log.push(GameEventData::GameResumed);
        let events = log.into_events();
        assert_eq!(events[0].turn, 1);
        assert_eq!(events[1].turn, 2);
    }
}
