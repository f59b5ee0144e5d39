//! Queue Worker
//!
//! The single consumer of every game queue. Each cycle drains the queues of
//! known games in turn; within a game messages are handled strictly in order.
//!
//! ## Failure routing
//!
//! | Outcome                          | Route                                   |
//! |----------------------------------|-----------------------------------------|
//! | game or player gone, malformed   | dead-letter, never retried              |
//! | rule violation                   | dropped, reported to the acting player  |
//! | storage failure, attempts < max  | back to the queue head, attempts + 1    |
//! | storage failure, attempts >= max | dead-letter                             |
//!
//! A retried message holds up only its own game: that queue is skipped until
//! `attempts + 1` retry intervals have passed while other games keep flowing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::core::ids::{GameId, PlayerId};
use crate::game::manager::{GameError, GameManager};
use crate::store::StoreError;

use super::action_queue::ActionQueue;
use super::handlers::{HandlerOutcome, HandlerRegistry};
use super::message::{MessageType, QueueMessage};

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Failed attempts before a message is dead-lettered.
    pub max_attempts: u32,
    /// Unit of the linear retry delay (`attempts + 1` units).
    pub retry_interval: Duration,
    /// Sleep between cycles while games are active.
    pub active_poll_interval: Duration,
    /// Sleep between key scans while no game is active.
    pub idle_poll_interval: Duration,
    /// Ceiling for the idle sleep after repeated store errors.
    pub max_idle_backoff: Duration,
    /// Key scan cadence while games are active.
    pub scan_interval: Duration,
    /// Orphaned queue sweep cadence.
    pub cleanup_interval: Duration,
    /// Messages taken from one game per cycle.
    pub batch_per_game: usize,
    /// Capacity of the rejection channel.
    pub rejection_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_interval: Duration::from_secs(1),
            active_poll_interval: Duration::from_millis(100),
            idle_poll_interval: Duration::from_secs(2),
            max_idle_backoff: Duration::from_secs(30),
            scan_interval: Duration::from_secs(2),
            cleanup_interval: Duration::from_secs(30 * 60),
            batch_per_game: 16,
            rejection_capacity: 256,
        }
    }
}

/// A message refused by the rules, reported back to whoever sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Game.
    pub game_id: GameId,
    /// Acting player.
    pub player_id: Option<PlayerId>,
    /// Refused message.
    pub message_id: String,
    /// Refused type.
    pub message_type: MessageType,
    /// Why.
    pub reason: String,
}

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Applied.
    Processed,
    /// Already applied before.
    Duplicate,
    /// Refused by the rules and dropped.
    Rejected,
    /// Put back with its attempt counter bumped.
    Retried,
    /// Moved to dead-letter.
    DeadLettered,
    /// Could not be routed (store down); held for the next cycle.
    Held,
}

/// Worker counters.
#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    cycles: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatsSnapshot {
    /// Messages applied.
    pub processed: u64,
    /// Redeliveries skipped.
    pub duplicates: u64,
    /// Rule violations.
    pub rejected: u64,
    /// Requeues.
    pub retried: u64,
    /// Dead-lettered messages.
    pub dead_lettered: u64,
    /// Completed cycles.
    pub cycles: u64,
}

impl WorkerStats {
    /// Current values.
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
        }
    }

    fn record(&self, disposition: Disposition) {
        let counter = match disposition {
            Disposition::Processed => &self.processed,
            Disposition::Duplicate => &self.duplicates,
            Disposition::Rejected => &self.rejected,
            Disposition::Retried => &self.retried,
            Disposition::DeadLettered => &self.dead_lettered,
            Disposition::Held => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Single consumer of all game queues.
pub struct Worker {
    manager: Arc<GameManager>,
    queue: ActionQueue,
    registry: HandlerRegistry,
    config: WorkerConfig,
    retry_at: BTreeMap<GameId, Instant>,
    held: BTreeMap<GameId, Vec<QueueMessage>>,
    stats: Arc<WorkerStats>,
    rejections: broadcast::Sender<Rejection>,
    last_scan: Option<Instant>,
    last_cleanup: Option<Instant>,
}

impl Worker {
    /// Worker with the standard handler table.
    pub fn new(manager: Arc<GameManager>, queue: ActionQueue, config: WorkerConfig) -> Self {
        let (rejections, _) = broadcast::channel(config.rejection_capacity.max(1));
        Self {
            manager,
            queue,
            registry: HandlerRegistry::standard(),
            config,
            retry_at: BTreeMap::new(),
            held: BTreeMap::new(),
            stats: Arc::new(WorkerStats::default()),
            rejections,
            last_scan: None,
            last_cleanup: None,
        }
    }

    /// Replace the handler table.
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Rule rejections, for reporting to the acting player.
    pub fn subscribe_rejections(&self) -> broadcast::Receiver<Rejection> {
        self.rejections.subscribe()
    }

    /// Run until `shutdown` flips to `true`. The current cycle always finishes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(max_attempts = self.config.max_attempts, "Queue worker started");

        if let Err(e) = self.cleanup_sweep().await {
            warn!(error = %e, "Startup sweep failed");
        }

        let mut idle_delay = self.config.idle_poll_interval;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_cycle().await {
                Ok(report) if report.active_games > 0 || report.handled > 0 => {
                    idle_delay = self.config.idle_poll_interval;
                    self.config.active_poll_interval
                }
                Ok(_) => {
                    idle_delay = self.config.idle_poll_interval;
                    idle_delay
                }
                Err(e) => {
                    let delay = idle_delay;
                    idle_delay = (idle_delay * 2).min(self.config.max_idle_backoff);
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Worker cycle failed");
                    delay
                }
            };

            if self.cleanup_due() {
                if let Err(e) = self.cleanup_sweep().await {
                    warn!(error = %e, "Cleanup sweep failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(stats = ?self.stats.snapshot(), "Queue worker stopped");
    }

    fn cleanup_due(&self) -> bool {
        self.last_cleanup
            .map(|at| at.elapsed() >= self.config.cleanup_interval)
            .unwrap_or(true)
    }

    /// One pass over every known game.
    ///
    /// Games held in the manager are drained every cycle. Queue keys are
    /// scanned as well when nothing is active or the scan interval elapsed, so
    /// queues of games not yet loaded are picked up.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, StoreError> {
        let active = self.manager.active_game_ids().await;
        let mut targets: BTreeSet<GameId> = active.iter().cloned().collect();
        targets.extend(self.held.keys().cloned());

        let scan_due = self
            .last_scan
            .map(|at| at.elapsed() >= self.config.scan_interval)
            .unwrap_or(true);
        if active.is_empty() || scan_due {
            self.last_scan = Some(Instant::now());
            targets.extend(self.queue.queued_games().await?);
        }

        let mut report = CycleReport {
            active_games: active.len(),
            ..CycleReport::default()
        };
        let mut first_error = None;
        for game_id in targets {
            match self.drain_game(&game_id).await {
                Ok(handled) => report.handled += handled,
                Err(e) => {
                    warn!(game_id = %game_id, error = %e, "Failed to drain queue");
                    first_error.get_or_insert(e);
                }
            }
        }
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);

        match first_error {
            Some(e) if report.handled == 0 => Err(e),
            _ => Ok(report),
        }
    }

    /// Handle up to `batch_per_game` messages of one game, in order.
    pub async fn drain_game(&mut self, game_id: &GameId) -> Result<usize, StoreError> {
        if let Some(at) = self.retry_at.get(game_id) {
            if Instant::now() < *at {
                return Ok(0);
            }
            self.retry_at.remove(game_id);
        }

        if !self.restore_held(game_id).await? {
            return Ok(0);
        }

        let mut handled = 0;
        while handled < self.config.batch_per_game {
            let Some(msg) = self.queue.dequeue(game_id).await? else {
                break;
            };
            handled += 1;
            let disposition = self.process(msg).await;
            if matches!(disposition, Disposition::Retried | Disposition::Held) {
                break;
            }
        }
        Ok(handled)
    }

    /// Put messages that could not be requeued back at the head of their
    /// queue. Returns `false` while any are still held.
    async fn restore_held(&mut self, game_id: &GameId) -> Result<bool, StoreError> {
        let Some(mut held) = self.held.remove(game_id) else {
            return Ok(true);
        };
        while let Some(msg) = held.pop() {
            if let Err(e) = self.queue.requeue_front(&msg).await {
                held.push(msg);
                self.held.insert(game_id.clone(), held);
                return Err(e);
            }
        }
        Ok(true)
    }

    /// Dispatch one message and route its outcome.
    pub async fn process(&mut self, msg: QueueMessage) -> Disposition {
        let kind = msg.message_type();
        debug!(
            game_id = %msg.game_id,
            message_id = %msg.id,
            message_type = %kind,
            attempts = msg.attempts,
            "Processing message"
        );

        let result = match self.registry.get(kind) {
            Some(handler) => handler.handle(&self.manager, &msg).await,
            None => Err(GameError::Malformed(format!("no handler for {}", kind))),
        };

        let disposition = match result {
            Ok(HandlerOutcome::Applied) => Disposition::Processed,
            Ok(HandlerOutcome::Duplicate) => Disposition::Duplicate,
            Err(e) if e.is_not_found() || matches!(e, GameError::Malformed(_)) => {
                debug!(game_id = %msg.game_id, error = %e, "Message cannot be applied");
                self.dead_letter(msg).await
            }
            Err(GameError::Validation(rule)) => {
                debug!(game_id = %msg.game_id, message_type = %kind, reason = %rule, "Action rejected");
                let _ = self.rejections.send(Rejection {
                    game_id: msg.game_id.clone(),
                    player_id: msg.player_id.clone(),
                    message_id: msg.id.clone(),
                    message_type: kind,
                    reason: rule.to_string(),
                });
                Disposition::Rejected
            }
            Err(e) => self.retry_or_dead_letter(msg, e).await,
        };
        self.stats.record(disposition);
        disposition
    }

    async fn retry_or_dead_letter(&mut self, msg: QueueMessage, cause: GameError) -> Disposition {
        if msg.attempts >= self.config.max_attempts {
            error!(
                game_id = %msg.game_id,
                message_id = %msg.id,
                attempts = msg.attempts,
                error = %cause,
                "Retries exhausted"
            );
            return self.dead_letter(msg).await;
        }

        let retry = msg.next_attempt();
        let delay = self.config.retry_interval * retry.attempts;
        warn!(
            game_id = %msg.game_id,
            message_id = %msg.id,
            attempt = retry.attempts,
            max_attempts = self.config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %cause,
            "Transient failure, requeueing"
        );
        self.retry_at.insert(msg.game_id.clone(), Instant::now() + delay);
        match self.queue.requeue_front(&retry).await {
            Ok(_) => Disposition::Retried,
            Err(e) => {
                warn!(game_id = %msg.game_id, error = %e, "Requeue failed, holding message");
                self.held.entry(msg.game_id.clone()).or_default().push(retry);
                Disposition::Held
            }
        }
    }

    async fn dead_letter(&mut self, msg: QueueMessage) -> Disposition {
        match self.queue.dead_letter(&msg).await {
            Ok(()) => Disposition::DeadLettered,
            Err(e) => {
                warn!(game_id = %msg.game_id, error = %e, "Dead-letter write failed, holding message");
                self.held.entry(msg.game_id.clone()).or_default().push(msg);
                Disposition::Held
            }
        }
    }

    /// Dead-letter queues whose game no longer exists and evict idle games.
    pub async fn cleanup_sweep(&mut self) -> Result<usize, StoreError> {
        self.last_cleanup = Some(Instant::now());
        let mut drained = 0;
        for game_id in self.queue.queued_games().await? {
            if self.manager.store().game_exists(&game_id).await? {
                continue;
            }
            let moved = self.queue.drain_to_dead_letter(&game_id).await?;
            self.stats.dead_lettered.fetch_add(moved as u64, Ordering::Relaxed);
            drained += moved;
        }
        let evicted = self.manager.evict_idle().await;
        if drained > 0 || evicted > 0 {
            info!(drained, evicted, "Cleanup sweep finished");
        }
        Ok(drained)
    }
}

/// Summary of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Games held in the manager at cycle start.
    pub active_games: usize,
    /// Messages taken off queues.
    pub handled: usize,
}
