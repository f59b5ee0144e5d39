//! # Tycoon Game Server
//!
//! Authoritative session coordinator and turn engine for a multiplayer
//! property-trading board game.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TYCOON SERVER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Identifiers, clock, random sources        │
//! │                                                              │
//! │  game/           - Rules and the authoritative manager       │
//! │  ├── board.rs    - Static board layout                       │
//! │  ├── cards.rs    - Opportunity and Scandal decks             │
//! │  ├── state.rs    - Game and player documents                 │
//! │  ├── rules.rs    - Pure rule functions                       │
//! │  └── manager.rs  - Per-game locking, persistence, updates    │
//! │                                                              │
//! │  queue/          - Reliable action processing                │
//! │  ├── action_queue.rs - Per-game FIFO and dead-letter lists   │
//! │  ├── handlers.rs - One handler per message type              │
//! │  └── worker.rs   - Consumer with retry and dead-lettering    │
//! │                                                              │
//! │  store/          - Backends behind breakers and backoff      │
//! │                                                              │
//! │  network/        - WebSocket server and connection hub       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Flow
//!
//! A client action is queued, never applied on the connection task. The
//! worker takes one message at a time per game, the manager applies it to a
//! copy of the document under that game's lock, persists the copy and only
//! then swaps it in. Every committed change is published once and relayed by
//! the hub to every connection of the game.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod game;
pub mod network;
pub mod queue;
pub mod store;

// Re-export commonly used types
pub use crate::config::AppConfig;
pub use crate::core::ids::{GameId, PlayerId, UserId};
pub use crate::core::rng::{DeterministicRng, RandomSource};
pub use crate::game::{Game, GameError, GameManager, GameStatus};
pub use crate::queue::{ActionQueue, QueueMessage, Worker};
pub use crate::store::{ResilientStore, StoreError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
