//! Core primitives shared by every layer.
//!
//! Identifiers, clock helpers and the per-game random source.

pub mod ids;
pub mod rng;

// Re-export core types
pub use ids::{GameId, PlayerId, UserId, now_millis};
pub use rng::{DeterministicRng, RandomSource, ScriptedRng};
