//! Game State Definitions
//!
//! The persisted Game / Player / Property documents. Field names are part of
//! the storage contract (camelCase) and must round-trip unchanged.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::{GameId, PlayerId, UserId};
use crate::game::board::{BoardLayout, BUILD_RENT_PCT, MAX_ENGAGEMENTS};
use crate::game::cards::CardDeck;
use crate::game::rules::RuleError;

/// How many applied action ids a game remembers for duplicate suppression.
pub const PROCESSED_ACTIONS_WINDOW: usize = 64;

// =============================================================================
// STATUS ENUMS
// =============================================================================

/// Game lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameStatus {
    /// Waiting for players.
    Lobby,
    /// In play.
    Active,
    /// Temporarily halted by the host.
    Paused,
    /// Finished with a winner.
    Completed,
    /// Finished without a winner.
    Abandoned,
}

impl GameStatus {
    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, GameStatus::Completed | GameStatus::Abandoned)
    }

    /// Allowed transitions. Nothing ever returns to `Lobby`.
    pub fn can_transition_to(self, next: GameStatus) -> bool {
        use GameStatus::*;
        matches!(
            (self, next),
            (Lobby, Active)
                | (Lobby, Abandoned)
                | (Active, Paused)
                | (Active, Completed)
                | (Active, Abandoned)
                | (Paused, Active)
                | (Paused, Completed)
                | (Paused, Abandoned)
        )
    }
}

/// Player lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerStatus {
    /// Joined the lobby.
    Connected,
    /// Marked ready in the lobby.
    Ready,
    /// Playing.
    Active,
    /// Connection lost; may reconnect.
    Disconnected,
    /// Out of money. Terminal.
    Bankrupt,
    /// Left or timed out. Terminal.
    Forfeited,
}

impl PlayerStatus {
    /// Bankrupt and forfeited players never come back.
    pub fn is_terminal(self) -> bool {
        matches!(self, PlayerStatus::Bankrupt | PlayerStatus::Forfeited)
    }
}

/// Market condition; scales every rent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarketCondition {
    /// 100%.
    #[default]
    Stable,
    /// 150%.
    Bull,
    /// 50%.
    Bear,
}

impl MarketCondition {
    /// Rent scale in percent.
    pub fn rent_pct(self) -> i64 {
        match self {
            MarketCondition::Stable => 100,
            MarketCondition::Bull => 150,
            MarketCondition::Bear => 50,
        }
    }
}

/// Timed property effect kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EffectKind {
    /// Double rent.
    Trending,
    /// Half rent.
    Cancelled,
}

impl EffectKind {
    /// Rent scale in percent.
    pub fn rent_pct(self) -> i64 {
        match self {
            EffectKind::Trending => 200,
            EffectKind::Cancelled => 50,
        }
    }
}

// =============================================================================
// PROPERTY
// =============================================================================

/// Transient effect on a property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyEffect {
    /// Effect kind.
    pub kind: EffectKind,
    /// Turns until expiry.
    pub turns_remaining: u8,
}

/// A purchasable property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    /// Property identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Color group.
    pub group: String,
    /// Board position.
    pub position: u8,
    /// Owner (None = bank).
    pub owner_id: Option<PlayerId>,
    /// Purchase price.
    pub price: i64,
    /// Base rent.
    pub rent_base: i64,
    /// Rent currently due on landing.
    pub rent_current: i64,
    /// Mortgaged properties collect nothing.
    pub mortgaged: bool,
    /// Engagements built (0-4).
    pub engagements: u8,
    /// Top-tier build marker.
    pub checkmark: bool,
    /// Active timed effects.
    #[serde(default)]
    pub effects: Vec<PropertyEffect>,
}

impl Property {
    /// Combined build level, 0-5 (5 = checkmark).
    pub fn build_level(&self) -> u8 {
        if self.checkmark {
            MAX_ENGAGEMENTS + 1
        } else {
            self.engagements
        }
    }

    /// Anything built here.
    pub fn has_builds(&self) -> bool {
        self.engagements > 0 || self.checkmark
    }

    /// Return to the bank untouched.
    pub fn reset_to_bank(&mut self) {
        self.owner_id = None;
        self.mortgaged = false;
        self.engagements = 0;
        self.checkmark = false;
        self.effects.clear();
    }
}

// =============================================================================
// PLAYER
// =============================================================================

/// A participant in a game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    /// Player identifier.
    pub id: PlayerId,
    /// Linked account.
    pub user_id: UserId,
    /// Chosen board token.
    pub token: String,
    /// Board position.
    pub position: u8,
    /// Cash on hand.
    pub balance: i64,
    /// Held cards (e.g. jail-free cards).
    #[serde(default)]
    pub cards: Vec<String>,
    /// Owned property ids.
    #[serde(default)]
    pub properties: Vec<String>,
    /// Lifecycle status.
    pub status: PlayerStatus,
    /// Currently jailed.
    pub in_jail: bool,
    /// Jail turns left.
    pub jail_turns: u8,
    /// When the player's connection dropped.
    pub disconnected_at: Option<DateTime<Utc>>,
    /// Live connection session. Never persisted.
    #[serde(skip)]
    pub session_id: Option<String>,
}

impl Player {
    /// New lobby player.
    pub fn new(id: PlayerId, user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            id,
            user_id,
            token: token.into(),
            position: 0,
            balance: 0,
            cards: Vec::new(),
            properties: Vec::new(),
            status: PlayerStatus::Connected,
            in_jail: false,
            jail_turns: 0,
            disconnected_at: None,
            session_id: None,
        }
    }

    /// Still in the game.
    pub fn is_in_play(&self) -> bool {
        !self.status.is_terminal()
    }
}

// =============================================================================
// BOARD + TURN STATE
// =============================================================================

/// Mutable board state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardState {
    /// Properties keyed by id.
    pub properties: BTreeMap<String, Property>,
    /// Cards left before each deck reshuffles.
    pub remaining_cards: BTreeMap<CardDeck, u32>,
}

impl BoardState {
    /// Fresh board: everything owned by the bank, full decks.
    pub fn new(layout: &BoardLayout) -> Self {
        let properties = layout
            .properties()
            .iter()
            .map(|spec| {
                (
                    spec.id.to_string(),
                    Property {
                        id: spec.id.to_string(),
                        name: spec.name.to_string(),
                        group: spec.group.to_string(),
                        position: spec.position,
                        owner_id: None,
                        price: spec.price,
                        rent_base: spec.rent_base,
                        rent_current: spec.rent_base,
                        mortgaged: false,
                        engagements: 0,
                        checkmark: false,
                        effects: Vec::new(),
                    },
                )
            })
            .collect();

        let remaining_cards = CardDeck::ALL.iter().map(|d| (*d, d.size())).collect();

        Self {
            properties,
            remaining_cards,
        }
    }
}

/// Phase within the current turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TurnPhase {
    /// Waiting for a dice roll.
    #[default]
    Roll,
    /// Landed on an unowned property; may buy.
    Buy,
    /// Landed on an owned property; rent is due.
    PayRent,
    /// Landed on a card space; must draw.
    DrawCard,
    /// Landing resolved; trade, build, mortgage or end the turn.
    Manage,
}

/// Outstanding rent obligation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRent {
    /// Property landed on.
    pub property_id: String,
    /// Owner to be paid.
    pub owner_id: PlayerId,
    /// Amount due.
    pub amount: i64,
}

/// Per-turn bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnState {
    /// Current phase.
    pub phase: TurnPhase,
    /// Consecutive doubles rolled this turn.
    pub doubles_count: u8,
    /// Last dice rolled.
    pub last_roll: Option<[u8; 2]>,
    /// The last roll grants another.
    pub extra_roll: bool,
    /// Rent awaiting payment.
    pub pending_rent: Option<PendingRent>,
    /// Deck awaiting a draw.
    pub pending_deck: Option<CardDeck>,
}

/// A proposed trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeOffer {
    /// Trade identifier.
    pub id: String,
    /// Proposing player.
    pub from_player_id: PlayerId,
    /// Counterpart.
    pub to_player_id: PlayerId,
    /// Cash from proposer.
    #[serde(default)]
    pub offered_cash: i64,
    /// Cash from counterpart.
    #[serde(default)]
    pub requested_cash: i64,
    /// Properties from proposer.
    #[serde(default)]
    pub offered_properties: Vec<String>,
    /// Properties from counterpart.
    #[serde(default)]
    pub requested_properties: Vec<String>,
}

// =============================================================================
// GAME
// =============================================================================

/// Authoritative game document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    /// Game identifier.
    pub id: GameId,
    /// Short join code.
    pub code: String,
    /// Lifecycle status.
    pub status: GameStatus,
    /// Players in join order.
    pub players: Vec<Player>,
    /// Host player.
    pub host_id: PlayerId,
    /// Seat limit.
    pub max_players: usize,
    /// Players needed to start.
    pub min_players: usize,
    /// Whose turn it is (set while active).
    pub current_turn: Option<PlayerId>,
    /// Remaining turn sequence; only ever shrinks once set.
    pub turn_order: Vec<PlayerId>,
    /// Ownership, builds and decks.
    pub board: BoardState,
    /// Market condition.
    pub market_condition: MarketCondition,
    /// Winner once completed.
    pub winner_id: Option<PlayerId>,
    /// Per-turn bookkeeping.
    #[serde(default)]
    pub turn: TurnState,
    /// Completed turns.
    #[serde(default)]
    pub turn_number: u32,
    /// Trade awaiting a response.
    #[serde(default)]
    pub pending_trade: Option<TradeOffer>,
    /// Recently applied action ids.
    #[serde(default)]
    pub processed_actions: VecDeque<String>,
    /// Created.
    pub created_at: DateTime<Utc>,
    /// Last mutation.
    pub updated_at: DateTime<Utc>,
    /// Moved to active.
    pub started_at: Option<DateTime<Utc>>,
    /// Reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
}

impl Game {
    /// New lobby with the host seated.
    pub fn new(
        id: GameId,
        code: String,
        host: Player,
        max_players: usize,
        min_players: usize,
        layout: &BoardLayout,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            code,
            status: GameStatus::Lobby,
            host_id: host.id.clone(),
            players: vec![host],
            max_players,
            min_players,
            current_turn: None,
            turn_order: Vec::new(),
            board: BoardState::new(layout),
            market_condition: MarketCondition::Stable,
            winner_id: None,
            turn: TurnState::default(),
            turn_number: 0,
            pending_trade: None,
            processed_actions: VecDeque::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
        }
    }

    /// Find a player.
    pub fn player(&self, id: &PlayerId) -> Option<&Player> {
        self.players.iter().find(|p| &p.id == id)
    }

    /// Find a player mutably.
    pub fn player_mut(&mut self, id: &PlayerId) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| &p.id == id)
    }

    /// Find a player by linked account.
    pub fn player_by_user(&self, user_id: &UserId) -> Option<&Player> {
        self.players.iter().find(|p| &p.user_id == user_id)
    }

    /// Player or validation error.
    pub fn require_player(&self, id: &PlayerId) -> Result<&Player, RuleError> {
        self.player(id)
            .ok_or_else(|| RuleError::PlayerNotInGame(id.clone()))
    }

    /// Player (mutable) or validation error.
    pub fn require_player_mut(&mut self, id: &PlayerId) -> Result<&mut Player, RuleError> {
        self.player_mut(id)
            .ok_or_else(|| RuleError::PlayerNotInGame(id.clone()))
    }

    /// Property or validation error.
    pub fn require_property(&self, id: &str) -> Result<&Property, RuleError> {
        self.board
            .properties
            .get(id)
            .ok_or_else(|| RuleError::UnknownProperty(id.to_string()))
    }

    /// Property (mutable) or validation error.
    pub fn require_property_mut(&mut self, id: &str) -> Result<&mut Property, RuleError> {
        self.board
            .properties
            .get_mut(id)
            .ok_or_else(|| RuleError::UnknownProperty(id.to_string()))
    }

    /// Players neither bankrupt nor forfeited.
    pub fn players_in_play(&self) -> impl Iterator<Item = &Player> {
        self.players.iter().filter(|p| p.is_in_play())
    }

    /// Change status, refusing backwards or illegal moves.
    pub fn transition(&mut self, next: GameStatus) -> Result<(), RuleError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(RuleError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
            self.current_turn = None;
        }
        Ok(())
    }

    /// Whether an action id was already applied.
    pub fn has_processed(&self, action_id: &str) -> bool {
        self.processed_actions.iter().any(|id| id == action_id)
    }

    /// Remember an applied action id.
    pub fn record_action(&mut self, action_id: &str) {
        if self.has_processed(action_id) {
            return;
        }
        self.processed_actions.push_back(action_id.to_string());
        while self.processed_actions.len() > PROCESSED_ACTIONS_WINDOW {
            self.processed_actions.pop_front();
        }
    }

    /// Recompute `rent_current` for every property.
    pub fn refresh_rents(&mut self, layout: &BoardLayout) {
        let market_pct = self.market_condition.rent_pct();
        let full_groups: Vec<String> = {
            let mut groups: Vec<String> = self
                .board
                .properties
                .values()
                .map(|p| p.group.clone())
                .collect();
            groups.sort();
            groups.dedup();
            groups
                .into_iter()
                .filter(|g| self.group_owner(layout, g).is_some())
                .collect()
        };

        for property in self.board.properties.values_mut() {
            if property.owner_id.is_none() {
                property.rent_current = property.rent_base;
                continue;
            }
            if property.mortgaged {
                property.rent_current = 0;
                continue;
            }
            let level = property.build_level() as usize;
            let mut rent = property.rent_base * BUILD_RENT_PCT[level] / 100;
            if level == 0 && full_groups.contains(&property.group) {
                rent *= 2;
            }
            rent = rent * market_pct / 100;
            for effect in &property.effects {
                rent = rent * effect.kind.rent_pct() / 100;
            }
            property.rent_current = rent;
        }
    }

    /// The single player owning every property of a group.
    pub fn group_owner(&self, layout: &BoardLayout, group: &str) -> Option<PlayerId> {
        let members = layout.group_members(group);
        let mut owner: Option<&PlayerId> = None;
        for id in members {
            let current = self.board.properties.get(id)?.owner_id.as_ref()?;
            match owner {
                None => owner = Some(current),
                Some(o) if o == current => {}
                Some(_) => return None,
            }
        }
        owner.cloned()
    }

    /// Structural invariants; used by tests and debug assertions.
    pub fn check_invariants(&self) -> Result<(), String> {
        if matches!(self.status, GameStatus::Active | GameStatus::Paused) {
            match &self.current_turn {
                Some(current) if self.turn_order.contains(current) => {}
                other => {
                    return Err(format!(
                        "current turn {:?} not in turn order {:?}",
                        other, self.turn_order
                    ))
                }
            }
        }
        for id in &self.turn_order {
            match self.player(id) {
                Some(p) if p.is_in_play() => {}
                _ => return Err(format!("turn order holds inactive player {}", id)),
            }
        }
        for player in &self.players {
            if player.is_in_play() && player.balance < 0 {
                return Err(format!("player {} has negative balance", player.id));
            }
            for (i, pid) in player.properties.iter().enumerate() {
                if player.properties[..i].contains(pid) {
                    return Err(format!("player {} lists {} twice", player.id, pid));
                }
                let owned = self
                    .board
                    .properties
                    .get(pid)
                    .and_then(|p| p.owner_id.as_ref())
                    == Some(&player.id);
                if !owned {
                    return Err(format!("player {} lists {} without owning it", player.id, pid));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lobby() -> Game {
        let layout = BoardLayout::standard();
        let host = Player::new(PlayerId::new("h1"), UserId::new("u1"), "rocket");
        Game::new(GameId::new("g1"), "ABC123".into(), host, 4, 2, &layout)
    }

    #[test]
    fn test_status_transitions_are_forward_only() {
        use GameStatus::*;
        assert!(Lobby.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(!Active.can_transition_to(Lobby));
        assert!(!Paused.can_transition_to(Lobby));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Abandoned.can_transition_to(Lobby));
    }

    #[test]
    fn test_transition_rejects_going_back() {
        let mut game = lobby();
        game.transition(GameStatus::Abandoned).unwrap();
        assert!(game.ended_at.is_some());
        let err = game.transition(GameStatus::Lobby).unwrap_err();
        assert!(matches!(err, RuleError::InvalidTransition { .. }));
    }

    #[test]
    fn test_document_field_names() {
        let game = lobby();
        let json = serde_json::to_value(&game).unwrap();
        for field in ["id", "code", "status", "players", "hostId", "maxPlayers", "currentTurn", "turnOrder", "board", "marketCondition", "winnerId", "createdAt", "updatedAt"] {
            assert!(json.get(field).is_some(), "missing field {}", field);
        }
        assert_eq!(json["status"], "LOBBY");
        let player = &json["players"][0];
        for field in ["id", "userId", "token", "position", "balance", "cards", "properties", "status", "inJail", "jailTurns", "disconnectedAt"] {
            assert!(player.get(field).is_some(), "missing player field {}", field);
        }
        assert!(player.get("sessionId").is_none());
        let prop = &json["board"]["properties"]["meme-alley"];
        for field in ["ownerId", "price", "rentBase", "rentCurrent", "mortgaged", "engagements", "checkmark", "effects"] {
            assert!(prop.get(field).is_some(), "missing property field {}", field);
        }
        assert_eq!(json["board"]["remainingCards"]["opportunity"], 8);
    }

    #[test]
    fn test_document_roundtrip_drops_session() {
        let mut game = lobby();
        game.players[0].session_id = Some("sess".into());
        let json = serde_json::to_string(&game).unwrap();
        let back: Game = serde_json::from_str(&json).unwrap();
        assert_eq!(back.players[0].session_id, None);
        assert_eq!(back.id, game.id);
        assert_eq!(back.board, game.board);
    }

    #[test]
    fn test_processed_action_window() {
        let mut game = lobby();
        for i in 0..(PROCESSED_ACTIONS_WINDOW + 10) {
            game.record_action(&format!("a{}", i));
        }
        assert_eq!(game.processed_actions.len(), PROCESSED_ACTIONS_WINDOW);
        assert!(!game.has_processed("a0"));
        assert!(game.has_processed(&format!("a{}", PROCESSED_ACTIONS_WINDOW + 9)));
    }

    #[test]
    fn test_rent_refresh_full_group_and_market() {
        let layout = BoardLayout::standard();
        let mut game = lobby();
        let owner = PlayerId::new("h1");
        game.board.properties.get_mut("meme-alley").unwrap().owner_id = Some(owner.clone());
        game.refresh_rents(&layout);
        assert_eq!(game.board.properties["meme-alley"].rent_current, 2);

        game.board.properties.get_mut("lurker-lane").unwrap().owner_id = Some(owner.clone());
        game.refresh_rents(&layout);
        assert_eq!(game.board.properties["meme-alley"].rent_current, 4);
        assert_eq!(game.group_owner(&layout, "starter"), Some(owner));

        game.market_condition = MarketCondition::Bear;
        game.refresh_rents(&layout);
        assert_eq!(game.board.properties["meme-alley"].rent_current, 2);

        game.board.properties.get_mut("meme-alley").unwrap().mortgaged = true;
        game.refresh_rents(&layout);
        assert_eq!(game.board.properties["meme-alley"].rent_current, 0);
    }

    #[test]
    fn test_invariants_catch_repeated_property() {
        let mut game = lobby();
        let owner = game.players[0].id.clone();
        game.board.properties.get_mut("meme-alley").unwrap().owner_id = Some(owner.clone());
        game.player_mut(&owner).unwrap().properties.push("meme-alley".into());
        assert!(game.check_invariants().is_ok());

        game.player_mut(&owner).unwrap().properties.push("meme-alley".into());
        assert!(game.check_invariants().unwrap_err().contains("twice"));
    }
}
