//! Resilient Store
//!
//! Wraps a documents backend (game documents, join codes) and a cache backend
//! (action queues). Every operation runs under that backend's circuit breaker
//! with a per-operation timeout; initial connection retries with backoff.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use super::backoff::{retry_with_backoff, BackoffConfig};
use super::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use super::file::FileBackend;
use super::memory::MemoryBackend;
use super::{code_key, game_key, Backend, StoreError};
use crate::core::ids::GameId;
use crate::game::state::Game;

/// Store tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Deadline for a single backend call.
    pub op_timeout: Duration,
    /// Breaker tuning (one breaker per backend).
    pub breaker: BreakerConfig,
    /// Connection backoff.
    pub backoff: BackoffConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(2),
            breaker: BreakerConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Which backend an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Documents,
    Cache,
}

/// Breaker-guarded access to both backends.
pub struct ResilientStore {
    documents: Arc<dyn Backend>,
    cache: Arc<dyn Backend>,
    documents_breaker: CircuitBreaker,
    cache_breaker: CircuitBreaker,
    op_timeout: Duration,
}

impl std::fmt::Debug for ResilientStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientStore")
            .field("documents", &self.documents.name())
            .field("cache", &self.cache.name())
            .field("documents_breaker", &self.documents_breaker.state())
            .field("cache_breaker", &self.cache_breaker.state())
            .finish()
    }
}

impl ResilientStore {
    /// Wrap two backends without checking connectivity.
    pub fn new(documents: Arc<dyn Backend>, cache: Arc<dyn Backend>, config: &StoreConfig) -> Self {
        Self {
            documents_breaker: CircuitBreaker::new(documents.name().to_string(), config.breaker),
            cache_breaker: CircuitBreaker::new(cache.name().to_string(), config.breaker),
            documents,
            cache,
            op_timeout: config.op_timeout,
        }
    }

    /// Wrap two backends, pinging each with exponential backoff first.
    pub async fn connect(
        documents: Arc<dyn Backend>,
        cache: Arc<dyn Backend>,
        config: &StoreConfig,
    ) -> Result<Self, StoreError> {
        for backend in [&documents, &cache] {
            let name = backend.name().to_string();
            retry_with_backoff(&config.backoff, &name, || backend.ping())
                .await
                .map_err(|(e, attempts)| StoreError::ConnectFailed {
                    backend: name.clone(),
                    attempts,
                    last_error: e.to_string(),
                })?;
            info!(backend = %name, "Backend connected");
        }
        Ok(Self::new(documents, cache, config))
    }

    /// Both tiers in memory. Used by tests and local runs.
    pub fn in_memory(config: &StoreConfig) -> Self {
        Self::new(
            Arc::new(MemoryBackend::new("documents")),
            Arc::new(MemoryBackend::new("cache")),
            config,
        )
    }

    /// Both tiers backed by JSON files under `dir`.
    pub async fn open_dir(dir: impl AsRef<Path>, config: &StoreConfig) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        let documents = FileBackend::open("documents", dir.join("documents.json")).await?;
        let cache = FileBackend::open("cache", dir.join("queues.json")).await?;
        Self::connect(Arc::new(documents), Arc::new(cache), config).await
    }

    /// Breaker states as `(documents, cache)`.
    pub fn breaker_states(&self) -> (CircuitState, CircuitState) {
        (self.documents_breaker.state(), self.cache_breaker.state())
    }

    async fn guarded<T, F, Fut>(&self, tier: Tier, op: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(Arc<dyn Backend>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let (backend, breaker) = match tier {
            Tier::Documents => (&self.documents, &self.documents_breaker),
            Tier::Cache => (&self.cache, &self.cache_breaker),
        };
        let timeout = self.op_timeout;
        let name = backend.name().to_string();
        let backend = Arc::clone(backend);
        breaker
            .call(|| async move {
                match tokio::time::timeout(timeout, f(backend)).await {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::Timeout {
                        backend: name,
                        op,
                        after_ms: timeout.as_millis() as u64,
                    }),
                }
            })
            .await
    }

    // =========================================================================
    // Documents
    // =========================================================================

    /// Load a game document.
    #[instrument(skip(self), fields(game_id = %id))]
    pub async fn load_game(&self, id: &GameId) -> Result<Option<Game>, StoreError> {
        let key = game_key(id);
        let raw = self
            .guarded(Tier::Documents, "get", |b| async move { b.get(&key).await })
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Persist a game document and its join code index entry.
    pub async fn save_game(&self, game: &Game) -> Result<(), StoreError> {
        let json = serde_json::to_string(game)?;
        let key = game_key(&game.id);
        self.guarded(Tier::Documents, "set", |b| async move { b.set(&key, json).await })
            .await?;

        let code = code_key(&game.code);
        let id = game.id.to_string();
        self.guarded(Tier::Documents, "set", |b| async move { b.set(&code, id).await })
            .await?;
        debug!(game_id = %game.id, status = ?game.status, "Saved game");
        Ok(())
    }

    /// Remove a game document and its join code.
    pub async fn delete_game(&self, id: &GameId) -> Result<bool, StoreError> {
        let Some(game) = self.load_game(id).await? else {
            return Ok(false);
        };
        let code = code_key(&game.code);
        self.guarded(Tier::Documents, "delete", |b| async move { b.delete(&code).await })
            .await?;
        let key = game_key(id);
        self.guarded(Tier::Documents, "delete", |b| async move { b.delete(&key).await })
            .await
    }

    /// Whether a game document exists.
    pub async fn game_exists(&self, id: &GameId) -> Result<bool, StoreError> {
        let key = game_key(id);
        let raw = self
            .guarded(Tier::Documents, "get", |b| async move { b.get(&key).await })
            .await?;
        Ok(raw.is_some())
    }

    /// Game id behind a join code.
    pub async fn resolve_code(&self, code: &str) -> Result<Option<GameId>, StoreError> {
        let key = code_key(code);
        let raw = self
            .guarded(Tier::Documents, "get", |b| async move { b.get(&key).await })
            .await?;
        Ok(raw.map(GameId::from))
    }

    // =========================================================================
    // Lists (cache tier)
    // =========================================================================

    pub async fn push_back(&self, key: &str, value: String) -> Result<usize, StoreError> {
        self.guarded(Tier::Cache, "push_back", |b| async move { b.push_back(key, value).await })
            .await
    }

    pub async fn push_front(&self, key: &str, value: String) -> Result<usize, StoreError> {
        self.guarded(Tier::Cache, "push_front", |b| async move { b.push_front(key, value).await })
            .await
    }

    pub async fn pop_front(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.guarded(Tier::Cache, "pop_front", |b| async move { b.pop_front(key).await })
            .await
    }

    pub async fn list(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.guarded(Tier::Cache, "list", |b| async move { b.list(key).await })
            .await
    }

    pub async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        self.guarded(Tier::Cache, "list_len", |b| async move { b.list_len(key).await })
            .await
    }

    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.guarded(Tier::Cache, "keys", |b| async move { b.keys(prefix).await })
            .await
    }

    pub async fn delete_key(&self, key: &str) -> Result<bool, StoreError> {
        self.guarded(Tier::Cache, "delete", |b| async move { b.delete(key).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::{PlayerId, UserId};
    use crate::game::board::BoardLayout;
    use crate::game::state::Player;

    fn game(id: &str, code: &str) -> Game {
        let host = Player::new(PlayerId::new("h1"), UserId::new("u1"), "rocket");
        Game::new(GameId::new(id), code.into(), host, 4, 2, &BoardLayout::standard())
    }

    fn fast_config() -> StoreConfig {
        StoreConfig {
            op_timeout: Duration::from_millis(50),
            breaker: BreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_millis(40),
            },
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                max_attempts: 3,
                jitter: false,
            },
        }
    }

    #[tokio::test]
    async fn test_game_roundtrip_and_code_index() {
        let store = ResilientStore::in_memory(&fast_config());
        let g = game("g1", "ABC234");
        store.save_game(&g).await.unwrap();

        let loaded = store.load_game(&g.id).await.unwrap().unwrap();
        assert_eq!(loaded, g);
        assert!(store.game_exists(&g.id).await.unwrap());
        assert_eq!(store.resolve_code("abc234").await.unwrap(), Some(g.id.clone()));

        assert!(store.delete_game(&g.id).await.unwrap());
        assert!(!store.game_exists(&g.id).await.unwrap());
        assert_eq!(store.resolve_code("ABC234").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_breaker_opens_on_backend_failure() {
        let documents = Arc::new(MemoryBackend::new("documents"));
        let cache = Arc::new(MemoryBackend::new("cache"));
        let store = ResilientStore::new(documents.clone(), cache.clone(), &fast_config());

        documents.set_available(false);
        for _ in 0..2 {
            let err = store.game_exists(&GameId::new("g1")).await.unwrap_err();
            assert!(matches!(err, StoreError::Unavailable { .. }));
        }
        assert_eq!(store.breaker_states().0, CircuitState::Open);

        // fails fast even though the backend is back
        documents.set_available(true);
        let err = store.game_exists(&GameId::new("g1")).await.unwrap_err();
        assert!(matches!(err, StoreError::CircuitOpen(_)));

        // cache tier is unaffected
        store.push_back("queue:g1", "m".into()).await.unwrap();
        assert_eq!(store.breaker_states().1, CircuitState::Closed);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!store.game_exists(&GameId::new("g1")).await.unwrap());
        assert_eq!(store.breaker_states().0, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let documents = Arc::new(MemoryBackend::new("documents"));
        let cache = Arc::new(MemoryBackend::new("cache"));
        cache.set_latency(Duration::from_millis(200));
        let store = ResilientStore::new(documents, cache, &fast_config());
        let err = store.list_len("queue:g1").await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout { op: "list_len", .. }));
    }

    #[tokio::test]
    async fn test_connect_retries_then_fails() {
        let documents = Arc::new(MemoryBackend::new("documents"));
        documents.set_available(false);
        let err = ResilientStore::connect(documents, Arc::new(MemoryBackend::new("cache")), &fast_config())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConnectFailed { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_open_dir_persists() {
        let dir = tempfile::tempdir().unwrap();
        let g = game("g9", "XYZ789");
        {
            let store = ResilientStore::open_dir(dir.path(), &fast_config()).await.unwrap();
            store.save_game(&g).await.unwrap();
            store.push_back("queue:g9", "m1".into()).await.unwrap();
        }
        let store = ResilientStore::open_dir(dir.path(), &fast_config()).await.unwrap();
        assert_eq!(store.load_game(&g.id).await.unwrap().unwrap().code, "XYZ789");
        assert_eq!(store.list("queue:g9").await.unwrap(), vec!["m1".to_string()]);
    }
}
