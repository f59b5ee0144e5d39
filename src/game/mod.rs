//! Game Logic Module
//!
//! Rules, documents and the authoritative manager.
//!
//! ## Module Structure
//!
//! - `board`: Static layout (spaces, groups, prices)
//! - `cards`: Opportunity and Scandal decks
//! - `state`: Game, player and property documents
//! - `rules`: Pure rule functions over a game document
//! - `events`: Events emitted by rules
//! - `manager`: Active game table, persistence and update fan-out
//!
//! Rules never touch the clock for gameplay decisions and draw all randomness
//! from the game's [`RandomSource`](crate::core::rng::RandomSource), so a
//! scripted source replays a game exactly.

pub mod board;
pub mod cards;
pub mod events;
pub mod manager;
pub mod rules;
pub mod state;

// Re-export key types
pub use board::BoardLayout;
pub use events::{GameEvent, GameEventData};
pub use manager::{GameConfig, GameError, GameManager, GameUpdate, NewGame};
pub use rules::{RuleError, RulesConfig, TradeTerms};
pub use state::{Game, GameStatus, Player, PlayerStatus, TurnPhase};
