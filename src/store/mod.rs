//! Persistence Layer
//!
//! A small Redis-like backend abstraction (values plus lists) with two
//! implementations, wrapped by [`ResilientStore`] which adds circuit breaking,
//! per-operation timeouts and connection backoff.
//!
//! Key layout:
//!
//! | Key                   | Kind  | Contents                     |
//! |-----------------------|-------|------------------------------|
//! | `game:{id}`           | value | Game document (JSON)         |
//! | `code:{CODE}`         | value | Game id for a join code      |
//! | `queue:{gameId}`      | list  | Pending queue messages       |
//! | `queue:{gameId}:dead` | list  | Dead-lettered queue messages |

pub mod backoff;
pub mod breaker;
pub mod file;
pub mod memory;
pub mod resilient;

pub use backoff::{retry_with_backoff, BackoffConfig};
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use resilient::{ResilientStore, StoreConfig};

use async_trait::async_trait;

use crate::core::ids::GameId;

/// Prefix of game document keys.
pub const GAME_PREFIX: &str = "game:";
/// Prefix of join code keys.
pub const CODE_PREFIX: &str = "code:";
/// Prefix of queue keys.
pub const QUEUE_PREFIX: &str = "queue:";
/// Suffix of dead-letter queue keys.
pub const DEAD_LETTER_SUFFIX: &str = ":dead";

/// Key of a game document.
pub fn game_key(id: &GameId) -> String {
    format!("{}{}", GAME_PREFIX, id)
}

/// Key of a join code entry. Codes are case-insensitive.
pub fn code_key(code: &str) -> String {
    format!("{}{}", CODE_PREFIX, code.to_ascii_uppercase())
}

/// Key of a game's action queue.
pub fn queue_key(id: &GameId) -> String {
    format!("{}{}", QUEUE_PREFIX, id)
}

/// Key of a game's dead-letter list.
pub fn dead_letter_key(id: &GameId) -> String {
    format!("{}{}{}", QUEUE_PREFIX, id, DEAD_LETTER_SUFFIX)
}

/// Game id of a live queue key. Dead-letter keys return `None`.
pub fn parse_queue_key(key: &str) -> Option<GameId> {
    let id = key.strip_prefix(QUEUE_PREFIX)?;
    if id.is_empty() || id.ends_with(DEAD_LETTER_SUFFIX) {
        return None;
    }
    Some(GameId::new(id))
}

/// Storage failures. All of them are transient from the caller's point of view.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Backend refused or dropped the operation.
    #[error("{backend} backend unavailable: {reason}")]
    Unavailable {
        /// Backend name.
        backend: String,
        /// Cause.
        reason: String,
    },
    /// Operation exceeded its deadline.
    #[error("{backend} {op} timed out after {after_ms}ms")]
    Timeout {
        /// Backend name.
        backend: String,
        /// Operation name.
        op: &'static str,
        /// Deadline in milliseconds.
        after_ms: u64,
    },
    /// Breaker is failing fast.
    #[error("circuit open for {0} backend")]
    CircuitOpen(String),
    /// Document could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(String),
    /// Initial connection never succeeded.
    #[error("could not connect to {backend} after {attempts} attempts: {last_error}")]
    ConnectFailed {
        /// Backend name.
        backend: String,
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        last_error: String,
    },
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Key/value plus list storage.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Liveness check.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value.
    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Remove a value or list. Returns whether anything was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Append to a list. Returns the new length.
    async fn push_back(&self, key: &str, value: String) -> Result<usize, StoreError>;

    /// Prepend to a list. Returns the new length.
    async fn push_front(&self, key: &str, value: String) -> Result<usize, StoreError>;

    /// Pop the head of a list.
    async fn pop_front(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Every element of a list, head first.
    async fn list(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Length of a list (0 when absent).
    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;

    /// All keys (values and lists) starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
