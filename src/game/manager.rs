//! Game Manager
//!
//! Owns the table of active games and is the only writer of game documents.
//!
//! Every mutation goes through [`GameManager::execute`]:
//!
//! 1. The game is loaded lazily into the active table on first access.
//! 2. The per-game lock is taken, so two actions for one game never interleave.
//! 3. The rule runs against a clone of the document.
//! 4. The clone is persisted; only on success does it replace the in-memory copy.
//! 5. A [`GameUpdate`] with the new snapshot and the rule's events is published.
//!
//! A failed rule leaves the document untouched ([`GameError::Validation`]); a
//! failed write leaves it untouched too ([`GameError::Transient`]), so the
//! caller may safely retry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::core::ids::{GameId, PlayerId, UserId};
use crate::core::rng::{DeterministicRng, RandomSource};
use crate::game::board::BoardLayout;
use crate::game::events::GameEvent;
use crate::game::rules::{self, RuleContext, RuleError, RulesConfig, TradeTerms};
use crate::game::state::{Game, GameStatus, Player};
use crate::store::{ResilientStore, StoreError};

/// Characters used in join codes. No 0/O or 1/I.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Attempts at finding an unused join code.
const CODE_ATTEMPTS: usize = 16;

/// Builds the random source for a newly loaded game.
pub type RngFactory = Arc<dyn Fn(&GameId) -> Box<dyn RandomSource> + Send + Sync>;

/// Game manager errors.
#[derive(Debug, thiserror::Error)]
pub enum GameError {
    /// Rule violation. Never retried.
    #[error(transparent)]
    Validation(#[from] RuleError),

    /// Game does not exist.
    #[error("game {0} not found")]
    NotFound(GameId),

    /// Player is not part of the game.
    #[error("player {player_id} not found in game {game_id}")]
    PlayerNotFound {
        /// Game.
        game_id: GameId,
        /// Missing player.
        player_id: PlayerId,
    },

    /// Join code does not resolve.
    #[error("no game with code {0}")]
    UnknownCode(String),

    /// Request cannot be applied as written (missing actor, wrong payload).
    #[error("malformed request: {0}")]
    Malformed(String),

    /// Storage failure. Safe to retry.
    #[error("storage failure: {0}")]
    Transient(#[from] StoreError),
}

impl GameError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GameError::Transient(_))
    }

    /// Whether the referenced game or player no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            GameError::NotFound(_) | GameError::PlayerNotFound { .. } | GameError::UnknownCode(_)
        )
    }

    fn from_rule(game_id: &GameId, err: RuleError) -> Self {
        match err {
            RuleError::PlayerNotInGame(player_id) => GameError::PlayerNotFound {
                game_id: game_id.clone(),
                player_id,
            },
            other => GameError::Validation(other),
        }
    }
}

/// Manager tuning.
#[derive(Debug, Clone)]
pub struct GameConfig {
    /// Smallest allowed `min_players`.
    pub min_players_floor: usize,
    /// Largest allowed `max_players`.
    pub max_players_cap: usize,
    /// Terminal games stay loaded this long after their last access.
    pub idle_expiry: Duration,
    /// Capacity of the update broadcast channel.
    pub update_capacity: usize,
    /// Economic rules.
    pub rules: RulesConfig,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            min_players_floor: 2,
            max_players_cap: 8,
            idle_expiry: Duration::from_secs(600),
            update_capacity: 256,
            rules: RulesConfig::default(),
        }
    }
}

/// Options for a new game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewGame {
    /// Seat limit.
    pub max_players: usize,
    /// Players needed to start.
    pub min_players: usize,
}

impl Default for NewGame {
    fn default() -> Self {
        Self {
            max_players: 4,
            min_players: 2,
        }
    }
}

/// Published after every committed mutation.
#[derive(Debug, Clone)]
pub struct GameUpdate {
    /// Snapshot after the mutation.
    pub game: Game,
    /// What happened.
    pub events: Vec<GameEvent>,
}

struct ActiveGame {
    game: Game,
    rng: Box<dyn RandomSource>,
    last_access: Instant,
}

impl ActiveGame {
    fn touch(&mut self) {
        self.last_access = Instant::now();
    }
}

/// Authoritative state machine for all games.
pub struct GameManager {
    store: Arc<ResilientStore>,
    config: GameConfig,
    layout: BoardLayout,
    games: RwLock<BTreeMap<GameId, Arc<Mutex<ActiveGame>>>>,
    updates: broadcast::Sender<GameUpdate>,
    rng_factory: RngFactory,
}

impl GameManager {
    /// Create a manager over a store.
    pub fn new(store: Arc<ResilientStore>, config: GameConfig) -> Self {
        let (updates, _) = broadcast::channel(config.update_capacity.max(1));
        Self {
            store,
            config,
            layout: BoardLayout::standard(),
            games: RwLock::new(BTreeMap::new()),
            updates,
            rng_factory: Arc::new(|id: &GameId| {
                Box::new(DeterministicRng::from_entropy(id.as_str())) as Box<dyn RandomSource>
            }),
        }
    }

    /// Replace how game random sources are built.
    pub fn with_rng_factory(mut self, factory: RngFactory) -> Self {
        self.rng_factory = factory;
        self
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<ResilientStore> {
        &self.store
    }

    /// Board layout shared by all games.
    pub fn layout(&self) -> &BoardLayout {
        &self.layout
    }

    /// Subscribe to committed updates.
    pub fn subscribe(&self) -> broadcast::Receiver<GameUpdate> {
        self.updates.subscribe()
    }

    /// Ids of games currently held in memory.
    pub async fn active_game_ids(&self) -> Vec<GameId> {
        self.games.read().await.keys().cloned().collect()
    }

    /// Whether a game is held in memory.
    pub async fn is_loaded(&self, game_id: &GameId) -> bool {
        self.games.read().await.contains_key(game_id)
    }

    // =========================================================================
    // Table management
    // =========================================================================

    async fn slot(&self, game_id: &GameId) -> Result<Arc<Mutex<ActiveGame>>, GameError> {
        if let Some(slot) = self.games.read().await.get(game_id) {
            return Ok(Arc::clone(slot));
        }

        let game = self
            .store
            .load_game(game_id)
            .await?
            .ok_or_else(|| GameError::NotFound(game_id.clone()))?;
        debug!(game_id = %game_id, status = ?game.status, "Loaded game into active table");

        let mut games = self.games.write().await;
        let slot = games.entry(game_id.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(ActiveGame {
                game,
                rng: (self.rng_factory)(game_id),
                last_access: Instant::now(),
            }))
        });
        Ok(Arc::clone(slot))
    }

    /// Drop terminal games that have been idle past the expiry window.
    pub async fn evict_idle(&self) -> usize {
        let expiry = self.config.idle_expiry;
        let mut games = self.games.write().await;
        let before = games.len();
        games.retain(|id, slot| match slot.try_lock() {
            Ok(active) => {
                let expired =
                    active.game.status.is_terminal() && active.last_access.elapsed() >= expiry;
                if expired {
                    debug!(game_id = %id, "Evicting idle game");
                }
                !expired
            }
            Err(_) => true,
        });
        before - games.len()
    }

    /// Run a rule against a game and commit the result.
    ///
    /// Returns `Ok(None)` when `action_id` was already applied.
    pub async fn execute<T, F>(
        &self,
        game_id: &GameId,
        action_id: Option<&str>,
        apply: F,
    ) -> Result<Option<T>, GameError>
    where
        F: FnOnce(&mut Game, &mut RuleContext<'_>) -> Result<T, RuleError> + Send,
        T: Send,
    {
        let slot = self.slot(game_id).await?;
        let mut active = slot.lock().await;
        active.touch();

        if let Some(id) = action_id {
            if active.game.has_processed(id) {
                debug!(game_id = %game_id, action_id = %id, "Skipping already applied action");
                return Ok(None);
            }
        }

        let mut next = active.game.clone();
        let (value, events) = {
            let ActiveGame { rng, .. } = &mut *active;
            let mut ctx = RuleContext::new(&self.layout, &self.config.rules, rng.as_mut(), next.turn_number);
            let value = apply(&mut next, &mut ctx).map_err(|e| GameError::from_rule(game_id, e))?;
            (value, ctx.log.into_events())
        };

        if let Some(id) = action_id {
            next.record_action(id);
        }
        next.updated_at = Utc::now();
        debug_assert!(next.check_invariants().is_ok(), "{:?}", next.check_invariants());

        if let Err(e) = self.store.save_game(&next).await {
            warn!(game_id = %game_id, error = %e, "Failed to persist game, mutation discarded");
            return Err(e.into());
        }

        if next.status != active.game.status {
            info!(game_id = %game_id, from = ?active.game.status, to = ?next.status, "Game status changed");
        }
        active.game = next.clone();
        drop(active);

        let _ = self.updates.send(GameUpdate { game: next, events });
        Ok(Some(value))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a lobby with the requesting user seated as host.
    pub async fn create_game(
        &self,
        host_user: UserId,
        token: impl Into<String>,
        options: NewGame,
    ) -> Result<Game, GameError> {
        if options.min_players < self.config.min_players_floor
            || options.max_players > self.config.max_players_cap
            || options.min_players > options.max_players
        {
            return Err(RuleError::InvalidConfig(format!(
                "players must satisfy {} <= min ({}) <= max ({}) <= {}",
                self.config.min_players_floor,
                options.min_players,
                options.max_players,
                self.config.max_players_cap
            ))
            .into());
        }

        let code = self.unused_code().await?;
        let host = Player::new(PlayerId::random(), host_user, token);
        let mut game = Game::new(
            GameId::random(),
            code,
            host,
            options.max_players,
            options.min_players,
            &self.layout,
        );
        game.refresh_rents(&self.layout);
        self.store.save_game(&game).await?;

        let id = game.id.clone();
        self.games.write().await.insert(
            id.clone(),
            Arc::new(Mutex::new(ActiveGame {
                game: game.clone(),
                rng: (self.rng_factory)(&id),
                last_access: Instant::now(),
            })),
        );
        info!(game_id = %id, code = %game.code, "Game created");
        let _ = self.updates.send(GameUpdate {
            game: game.clone(),
            events: Vec::new(),
        });
        Ok(game)
    }

    async fn unused_code(&self) -> Result<String, GameError> {
        for _ in 0..CODE_ATTEMPTS {
            let code = generate_code();
            if self.store.resolve_code(&code).await?.is_none() {
                return Ok(code);
            }
        }
        Err(RuleError::InvalidConfig("could not allocate a join code".into()).into())
    }

    /// Current snapshot.
    pub async fn get_game(&self, game_id: &GameId) -> Result<Game, GameError> {
        let slot = self.slot(game_id).await?;
        let mut active = slot.lock().await;
        active.touch();
        Ok(active.game.clone())
    }

    /// Re-publish the current snapshot without mutating.
    pub async fn publish_snapshot(&self, game_id: &GameId) -> Result<(), GameError> {
        let game = self.get_game(game_id).await?;
        let _ = self.updates.send(GameUpdate {
            game,
            events: Vec::new(),
        });
        Ok(())
    }

    /// Player seated for a user, if any.
    pub async fn player_for_user(
        &self,
        game_id: &GameId,
        user_id: &UserId,
    ) -> Result<Option<PlayerId>, GameError> {
        let game = self.get_game(game_id).await?;
        Ok(game.player_by_user(user_id).map(|p| p.id.clone()))
    }

    /// Seat a user in a lobby. A repeated join returns the existing seat.
    pub async fn join_game(
        &self,
        game_id: &GameId,
        user_id: UserId,
        token: impl Into<String>,
        action_id: Option<&str>,
    ) -> Result<PlayerId, GameError> {
        let player = Player::new(PlayerId::random(), user_id.clone(), token);
        let player_id = player.id.clone();
        let joined = self
            .execute(game_id, action_id, move |game, ctx| rules::join(game, player, ctx))
            .await?;
        if joined.is_some() {
            info!(game_id = %game_id, player_id = %player_id, "Player joined");
            return Ok(player_id);
        }
        self.player_for_user(game_id, &user_id)
            .await?
            .ok_or_else(|| GameError::PlayerNotFound {
                game_id: game_id.clone(),
                player_id,
            })
    }

    /// Seat a user in the lobby behind a join code.
    pub async fn join_by_code(
        &self,
        code: &str,
        user_id: UserId,
        token: impl Into<String>,
    ) -> Result<(GameId, PlayerId), GameError> {
        let game_id = self
            .store
            .resolve_code(code)
            .await?
            .ok_or_else(|| GameError::UnknownCode(code.to_string()))?;
        let player_id = self.join_game(&game_id, user_id, token, None).await?;
        Ok((game_id, player_id))
    }

    /// Leave a lobby.
    pub async fn leave_game(&self, game_id: &GameId, player_id: &PlayerId, action_id: Option<&str>) -> Result<Option<()>, GameError> {
        self.execute(game_id, action_id, |game, ctx| rules::leave_lobby(game, player_id, ctx))
            .await
    }

    /// Change token in the lobby.
    pub async fn set_token(&self, game_id: &GameId, player_id: &PlayerId, token: &str, action_id: Option<&str>) -> Result<Option<()>, GameError> {
        self.execute(game_id, action_id, |game, ctx| rules::set_token(game, player_id, token, ctx))
            .await
    }

    /// Toggle ready in the lobby.
    pub async fn set_ready(&self, game_id: &GameId, player_id: &PlayerId, ready: bool, action_id: Option<&str>) -> Result<Option<()>, GameError> {
        self.execute(game_id, action_id, |game, ctx| rules::set_ready(game, player_id, ready, ctx))
            .await
    }

    /// Start the game (host only).
    pub async fn start_game(&self, game_id: &GameId, requester: &PlayerId, action_id: Option<&str>) -> Result<Option<()>, GameError> {
        let result = self
            .execute(game_id, action_id, |game, ctx| rules::start_game(game, requester, ctx))
            .await?;
        if result.is_some() {
            info!(game_id = %game_id, "Game started");
        }
        Ok(result)
    }

    /// Pause (host only).
    pub async fn pause_game(&self, game_id: &GameId, requester: &PlayerId, action_id: Option<&str>) -> Result<Option<()>, GameError> {
        self.execute(game_id, action_id, |game, ctx| rules::pause(game, requester, ctx))
            .await
    }

    /// Resume (host only).
    pub async fn resume_game(&self, game_id: &GameId, requester: &PlayerId, action_id: Option<&str>) -> Result<Option<()>, GameError> {
        self.execute(game_id, action_id, |game, ctx| rules::resume(game, requester, ctx))
            .await
    }

    /// Forfeit a player. Repeating it is a no-op.
    pub async fn forfeit(&self, game_id: &GameId, player_id: &PlayerId, action_id: Option<&str>) -> Result<Option<()>, GameError> {
        self.execute(game_id, action_id, |game, ctx| rules::forfeit(game, player_id, ctx))
            .await
    }

    /// Record a dropped connection.
    pub async fn mark_disconnected(&self, game_id: &GameId, player_id: &PlayerId, at: DateTime<Utc>) -> Result<(), GameError> {
        self.execute(game_id, None, |game, ctx| rules::mark_disconnected(game, player_id, at, ctx))
            .await
            .map(|_| ())
    }

    /// Record a restored connection.
    pub async fn mark_connected(&self, game_id: &GameId, player_id: &PlayerId, session_id: Option<String>) -> Result<(), GameError> {
        self.execute(game_id, None, |game, ctx| rules::mark_connected(game, player_id, session_id, ctx))
            .await
            .map(|_| ())
    }

    // =========================================================================
    // Turn actions
    // =========================================================================

    /// Roll for the current player.
    pub async fn roll_dice(&self, game_id: &GameId, player_id: &PlayerId, action_id: Option<&str>) -> Result<Option<[u8; 2]>, GameError> {
        self.execute(game_id, action_id, |game, ctx| rules::roll_dice(game, player_id, ctx))
            .await
    }

    /// Buy the property under the current player.
    pub async fn buy_property(&self, game_id: &GameId, player_id: &PlayerId, property_id: &str, action_id: Option<&str>) -> Result<Option<()>, GameError> {
        self.execute(game_id, action_id, |game, ctx| rules::buy_property(game, player_id, property_id, ctx))
            .await
    }

    /// Pay the rent due.
    pub async fn pay_rent(&self, game_id: &GameId, player_id: &PlayerId, action_id: Option<&str>) -> Result<Option<()>, GameError> {
        self.execute(game_id, action_id, |game, ctx| rules::pay_rent(game, player_id, ctx))
            .await
    }

    /// Draw the pending card.
    pub async fn draw_card(&self, game_id: &GameId, player_id: &PlayerId, action_id: Option<&str>) -> Result<Option<String>, GameError> {
        self.execute(game_id, action_id, |game, ctx| rules::draw_card(game, player_id, ctx))
            .await
    }

    /// Mortgage a property.
    pub async fn mortgage(&self, game_id: &GameId, player_id: &PlayerId, property_id: &str, action_id: Option<&str>) -> Result<Option<()>, GameError> {
        self.execute(game_id, action_id, |game, ctx| rules::mortgage_property(game, player_id, property_id, ctx))
            .await
    }

    /// Lift a mortgage.
    pub async fn unmortgage(&self, game_id: &GameId, player_id: &PlayerId, property_id: &str, action_id: Option<&str>) -> Result<Option<()>, GameError> {
        self.execute(game_id, action_id, |game, ctx| rules::unmortgage_property(game, player_id, property_id, ctx))
            .await
    }

    /// Build one level.
    pub async fn build_engagement(&self, game_id: &GameId, player_id: &PlayerId, property_id: &str, action_id: Option<&str>) -> Result<Option<u8>, GameError> {
        self.execute(game_id, action_id, |game, ctx| rules::build_engagement(game, player_id, property_id, ctx))
            .await
    }

    /// Offer a trade. Returns the trade id.
    pub async fn propose_trade(&self, game_id: &GameId, player_id: &PlayerId, terms: TradeTerms, action_id: Option<&str>) -> Result<Option<String>, GameError> {
        let trade_id = action_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.execute(game_id, action_id, move |game, ctx| {
            rules::propose_trade(game, player_id, &trade_id, terms, ctx).map(|_| trade_id.clone())
        })
        .await
    }

    /// Answer the pending trade.
    pub async fn respond_trade(&self, game_id: &GameId, player_id: &PlayerId, trade_id: &str, accept: bool, action_id: Option<&str>) -> Result<Option<()>, GameError> {
        self.execute(game_id, action_id, |game, ctx| rules::respond_trade(game, player_id, trade_id, accept, ctx))
            .await
    }

    /// End the current turn. Returns the next player.
    pub async fn end_turn(&self, game_id: &GameId, player_id: &PlayerId, action_id: Option<&str>) -> Result<Option<Option<PlayerId>>, GameError> {
        self.execute(game_id, action_id, |game, ctx| rules::end_turn(game, player_id, ctx))
            .await
    }

    /// Whether a game's status still accepts play.
    pub async fn is_playable(&self, game_id: &GameId) -> Result<bool, GameError> {
        let game = self.get_game(game_id).await?;
        Ok(matches!(game.status, GameStatus::Active | GameStatus::Paused))
    }
}

/// Random join code from the unambiguous alphabet.
pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::ScriptedRng;
    use crate::game::state::TurnPhase;
    use crate::store::{MemoryBackend, StoreConfig};
    use std::time::Duration;

    fn scripted(faces: Vec<u8>) -> RngFactory {
        Arc::new(move |_id: &GameId| Box::new(ScriptedRng::new(faces.clone())) as Box<dyn RandomSource>)
    }

    fn manager() -> GameManager {
        let store = Arc::new(ResilientStore::in_memory(&StoreConfig::default()));
        GameManager::new(store, GameConfig::default())
    }

    async fn two_player_lobby(m: &GameManager) -> (GameId, PlayerId, PlayerId) {
        let game = m.create_game(UserId::new("u1"), "rocket", NewGame::default()).await.unwrap();
        let host = game.host_id.clone();
        let guest = m
            .join_game(&game.id, UserId::new("u2"), "comet", None)
            .await
            .unwrap();
        (game.id, host, guest)
    }

    #[test]
    fn test_generate_code_shape() {
        for _ in 0..50 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        }
    }

    #[tokio::test]
    async fn test_create_validates_bounds() {
        let m = manager();
        let err = m
            .create_game(UserId::new("u1"), "rocket", NewGame { max_players: 12, min_players: 2 })
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::Validation(RuleError::InvalidConfig(_))));
        let err = m
            .create_game(UserId::new("u1"), "rocket", NewGame { max_players: 3, min_players: 4 })
            .await
            .unwrap_err();
        assert!(matches!(err, GameError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_join_and_start() {
        let m = manager();
        let mut updates = m.subscribe();
        let (game_id, host, guest) = two_player_lobby(&m).await;

        let err = m.start_game(&game_id, &guest, None).await.unwrap_err();
        assert!(matches!(err, GameError::Validation(RuleError::NotHost)));
        m.start_game(&game_id, &host, None).await.unwrap();

        let game = m.get_game(&game_id).await.unwrap();
        assert_eq!(game.status, GameStatus::Active);
        assert_eq!(game.turn_order.len(), 2);
        assert!(game.turn_order.contains(game.current_turn.as_ref().unwrap()));

        // create, join, start
        let mut seen = 0;
        while let Ok(update) = updates.try_recv() {
            seen += 1;
            assert_eq!(update.game.id, game_id);
        }
        assert_eq!(seen, 3);

        let stored = m.store().load_game(&game_id).await.unwrap().unwrap();
        assert_eq!(stored.status, GameStatus::Active);
    }

    #[tokio::test]
    async fn test_join_by_code() {
        let m = manager();
        let game = m.create_game(UserId::new("u1"), "rocket", NewGame::default()).await.unwrap();
        let (id, _) = m
            .join_by_code(&game.code.to_lowercase(), UserId::new("u2"), "comet")
            .await
            .unwrap();
        assert_eq!(id, game.id);
        let err = m.join_by_code("ZZZZZZ", UserId::new("u3"), "star").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_duplicate_action_is_not_reapplied() {
        let store = Arc::new(ResilientStore::in_memory(&StoreConfig::default()));
        let m = GameManager::new(store, GameConfig::default()).with_rng_factory(scripted(vec![1, 2, 1, 2]));
        let (game_id, host, _) = two_player_lobby(&m).await;
        m.start_game(&game_id, &host, Some("start-1")).await.unwrap();
        assert_eq!(m.start_game(&game_id, &host, Some("start-1")).await.unwrap(), None);

        let game = m.get_game(&game_id).await.unwrap();
        let current = game.current_turn.clone().unwrap();
        let first = m.roll_dice(&game_id, &current, Some("roll-1")).await.unwrap();
        assert!(first.is_some());
        let again = m.roll_dice(&game_id, &current, Some("roll-1")).await.unwrap();
        assert_eq!(again, None);

        let game = m.get_game(&game_id).await.unwrap();
        assert_eq!(game.player(&current).unwrap().position, 3);
        assert!(game.has_processed("roll-1"));
    }

    #[tokio::test]
    async fn test_missing_game_and_player() {
        let m = manager();
        let err = m.get_game(&GameId::new("nope")).await.unwrap_err();
        assert!(matches!(err, GameError::NotFound(_)));
        assert!(err.is_not_found());

        let (game_id, _, _) = two_player_lobby(&m).await;
        let err = m.set_ready(&game_id, &PlayerId::new("ghost"), true, None).await.unwrap_err();
        assert!(matches!(err, GameError::PlayerNotFound { .. }));
    }

    #[tokio::test]
    async fn test_persist_failure_leaves_state_untouched() {
        let documents = Arc::new(MemoryBackend::new("documents"));
        let cache = Arc::new(MemoryBackend::new("cache"));
        let store = Arc::new(ResilientStore::new(documents.clone(), cache, &StoreConfig::default()));
        let m = GameManager::new(store, GameConfig::default());
        let (game_id, host, _) = two_player_lobby(&m).await;

        documents.set_available(false);
        let err = m.start_game(&game_id, &host, Some("s1")).await.unwrap_err();
        assert!(err.is_retryable());
        documents.set_available(true);

        let game = m.get_game(&game_id).await.unwrap();
        assert_eq!(game.status, GameStatus::Lobby);
        assert!(!game.has_processed("s1"));
        m.start_game(&game_id, &host, Some("s1")).await.unwrap();
        assert_eq!(m.get_game(&game_id).await.unwrap().status, GameStatus::Active);
    }

    #[tokio::test]
    async fn test_lazy_load_from_store() {
        let store = Arc::new(ResilientStore::in_memory(&StoreConfig::default()));
        let first = GameManager::new(store.clone(), GameConfig::default());
        let (game_id, _, _) = two_player_lobby(&first).await;

        let second = GameManager::new(store, GameConfig::default());
        assert!(!second.is_loaded(&game_id).await);
        let game = second.get_game(&game_id).await.unwrap();
        assert_eq!(game.players.len(), 2);
        assert!(second.is_loaded(&game_id).await);
    }

    #[tokio::test]
    async fn test_evicts_only_idle_terminal_games() {
        let store = Arc::new(ResilientStore::in_memory(&StoreConfig::default()));
        let config = GameConfig { idle_expiry: Duration::from_millis(20), ..GameConfig::default() };
        let m = GameManager::new(store, config);
        let (done, host, guest) = two_player_lobby(&m).await;
        let (live, _, _) = two_player_lobby(&m).await;

        m.leave_game(&done, &guest, None).await.unwrap();
        m.leave_game(&done, &host, None).await.unwrap();
        assert_eq!(m.get_game(&done).await.unwrap().status, GameStatus::Abandoned);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(m.evict_idle().await, 1);
        assert!(!m.is_loaded(&done).await);
        assert!(m.is_loaded(&live).await);
        // still in the store
        assert_eq!(m.get_game(&done).await.unwrap().status, GameStatus::Abandoned);
    }

    #[tokio::test]
    async fn test_buy_and_rent_through_manager() {
        let store = Arc::new(ResilientStore::in_memory(&StoreConfig::default()));
        // both players land on dial-up-station (5)
        let m = GameManager::new(store, GameConfig::default())
            .with_rng_factory(scripted(vec![2, 3, 2, 3]));
        let (game_id, host, _) = two_player_lobby(&m).await;
        m.start_game(&game_id, &host, None).await.unwrap();
        let game = m.get_game(&game_id).await.unwrap();
        let a = game.turn_order[0].clone();
        let b = game.turn_order[1].clone();

        m.roll_dice(&game_id, &a, None).await.unwrap();
        m.buy_property(&game_id, &a, "dial-up-station", None).await.unwrap();
        m.end_turn(&game_id, &a, None).await.unwrap();
        m.roll_dice(&game_id, &b, None).await.unwrap();
        let game = m.get_game(&game_id).await.unwrap();
        assert_eq!(game.turn.phase, TurnPhase::PayRent);
        let rent = game.board.properties["dial-up-station"].rent_current;
        m.pay_rent(&game_id, &b, None).await.unwrap();

        let game = m.get_game(&game_id).await.unwrap();
        assert_eq!(game.player(&a).unwrap().balance, 1300 + rent);
        assert_eq!(game.player(&b).unwrap().balance, 1500 - rent);
        assert_eq!(game.board.properties["dial-up-station"].owner_id, Some(a));
    }
}
