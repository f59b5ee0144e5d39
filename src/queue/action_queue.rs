//! Per-game action queues backed by the store's list tier.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::core::ids::GameId;
use crate::store::{dead_letter_key, parse_queue_key, queue_key, ResilientStore, StoreError, QUEUE_PREFIX};

use super::message::QueueMessage;

/// Ordered mailbox per game plus its dead-letter list.
#[derive(Debug, Clone)]
pub struct ActionQueue {
    store: Arc<ResilientStore>,
}

impl ActionQueue {
    /// Queue over a store.
    pub fn new(store: Arc<ResilientStore>) -> Self {
        Self { store }
    }

    /// Append to the game's queue. Returns the new length.
    pub async fn enqueue(&self, msg: &QueueMessage) -> Result<usize, StoreError> {
        let raw = serde_json::to_string(msg)?;
        let len = self.store.push_back(&queue_key(&msg.game_id), raw).await?;
        debug!(game_id = %msg.game_id, message_type = %msg.message_type(), len, "Enqueued action");
        Ok(len)
    }

    /// Put a message back at the head so it is the next one processed.
    pub async fn requeue_front(&self, msg: &QueueMessage) -> Result<usize, StoreError> {
        let raw = serde_json::to_string(msg)?;
        self.store.push_front(&queue_key(&msg.game_id), raw).await
    }

    /// Take the oldest message. Entries that fail to decode are moved to the
    /// dead-letter list untouched and skipped.
    pub async fn dequeue(&self, game_id: &GameId) -> Result<Option<QueueMessage>, StoreError> {
        let key = queue_key(game_id);
        loop {
            let Some(raw) = self.store.pop_front(&key).await? else {
                return Ok(None);
            };
            match serde_json::from_str::<QueueMessage>(&raw) {
                Ok(msg) => return Ok(Some(msg)),
                Err(e) => {
                    warn!(game_id = %game_id, error = %e, "Malformed queue entry, dead-lettering");
                    if let Err(push_err) = self.store.push_back(&dead_letter_key(game_id), raw.clone()).await {
                        // back to the head; the next dequeue tries again
                        if let Err(restore_err) = self.store.push_front(&key, raw.clone()).await {
                            error!(game_id = %game_id, error = %restore_err, entry = %raw, "Lost malformed queue entry");
                        }
                        return Err(push_err);
                    }
                }
            }
        }
    }

    /// Move a message to its game's dead-letter list.
    pub async fn dead_letter(&self, msg: &QueueMessage) -> Result<(), StoreError> {
        let raw = serde_json::to_string(msg)?;
        self.store.push_back(&dead_letter_key(&msg.game_id), raw).await?;
        warn!(
            game_id = %msg.game_id,
            message_id = %msg.id,
            message_type = %msg.message_type(),
            attempts = msg.attempts,
            "Message dead-lettered"
        );
        Ok(())
    }

    /// Decodable dead-lettered messages, oldest first.
    pub async fn dead_letters(&self, game_id: &GameId) -> Result<Vec<QueueMessage>, StoreError> {
        let raw = self.store.list(&dead_letter_key(game_id)).await?;
        Ok(raw
            .iter()
            .filter_map(|r| serde_json::from_str(r).ok())
            .collect())
    }

    /// Pending messages for a game.
    pub async fn len(&self, game_id: &GameId) -> Result<usize, StoreError> {
        self.store.list_len(&queue_key(game_id)).await
    }

    /// Snapshot of pending messages, oldest first.
    pub async fn pending(&self, game_id: &GameId) -> Result<Vec<QueueMessage>, StoreError> {
        let raw = self.store.list(&queue_key(game_id)).await?;
        Ok(raw
            .iter()
            .filter_map(|r| serde_json::from_str(r).ok())
            .collect())
    }

    /// Games with a non-empty queue.
    pub async fn queued_games(&self) -> Result<Vec<GameId>, StoreError> {
        let keys = self.store.keys(QUEUE_PREFIX).await?;
        Ok(keys.iter().filter_map(|k| parse_queue_key(k)).collect())
    }

    /// Move every pending message of a game to dead-letter, preserving order.
    pub async fn drain_to_dead_letter(&self, game_id: &GameId) -> Result<usize, StoreError> {
        let key = queue_key(game_id);
        let dead = dead_letter_key(game_id);
        let mut moved = 0;
        // Copy first, then pop, so a failed write leaves the entry queued.
        for raw in self.store.list(&key).await? {
            self.store.push_back(&dead, raw.clone()).await?;
            match self.store.pop_front(&key).await? {
                Some(popped) if popped == raw => moved += 1,
                Some(other) => {
                    // the head changed under us; keep it queued
                    self.store.push_front(&key, other).await?;
                    break;
                }
                None => break,
            }
        }
        if moved > 0 {
            warn!(game_id = %game_id, moved, "Drained orphaned queue to dead-letter");
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::message::QueueAction;
    use crate::store::{MemoryBackend, StoreConfig};

    fn queue() -> ActionQueue {
        ActionQueue::new(Arc::new(ResilientStore::in_memory(&StoreConfig::default())))
    }

    fn msg(game: &str, action: QueueAction) -> QueueMessage {
        QueueMessage::new(GameId::new(game), None, action)
    }

    #[tokio::test]
    async fn test_fifo_per_game() {
        let q = queue();
        let g = GameId::new("g1");
        let a = msg("g1", QueueAction::Roll);
        let b = msg("g1", QueueAction::EndTurn);
        q.enqueue(&a).await.unwrap();
        q.enqueue(&b).await.unwrap();
        q.enqueue(&msg("g2", QueueAction::Roll)).await.unwrap();

        assert_eq!(q.len(&g).await.unwrap(), 2);
        assert_eq!(q.dequeue(&g).await.unwrap().unwrap().id, a.id);
        assert_eq!(q.dequeue(&g).await.unwrap().unwrap().id, b.id);
        assert!(q.dequeue(&g).await.unwrap().is_none());
        assert_eq!(q.len(&GameId::new("g2")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_requeue_front_keeps_order() {
        let q = queue();
        let g = GameId::new("g1");
        let a = msg("g1", QueueAction::Roll);
        let b = msg("g1", QueueAction::EndTurn);
        q.enqueue(&a).await.unwrap();
        q.enqueue(&b).await.unwrap();

        let first = q.dequeue(&g).await.unwrap().unwrap();
        q.requeue_front(&first.next_attempt()).await.unwrap();
        let again = q.dequeue(&g).await.unwrap().unwrap();
        assert_eq!(again.id, a.id);
        assert_eq!(again.attempts, 1);
    }

    #[tokio::test]
    async fn test_malformed_entry_goes_to_dead_letter() {
        let store = Arc::new(ResilientStore::in_memory(&StoreConfig::default()));
        let q = ActionQueue::new(store.clone());
        let g = GameId::new("g1");
        store.push_back(&queue_key(&g), "{broken".into()).await.unwrap();
        let good = msg("g1", QueueAction::Roll);
        q.enqueue(&good).await.unwrap();

        assert_eq!(q.dequeue(&g).await.unwrap().unwrap().id, good.id);
        assert_eq!(store.list(&dead_letter_key(&g)).await.unwrap(), vec!["{broken".to_string()]);
    }

    #[tokio::test]
    async fn test_queued_games_skips_dead_letters() {
        let q = queue();
        q.enqueue(&msg("g1", QueueAction::Roll)).await.unwrap();
        q.dead_letter(&msg("g2", QueueAction::Roll)).await.unwrap();
        assert_eq!(q.queued_games().await.unwrap(), vec![GameId::new("g1")]);
    }

    #[tokio::test]
    async fn test_drain_to_dead_letter() {
        let q = queue();
        let g = GameId::new("gone");
        for _ in 0..3 {
            q.enqueue(&msg("gone", QueueAction::Roll)).await.unwrap();
        }
        assert_eq!(q.drain_to_dead_letter(&g).await.unwrap(), 3);
        assert_eq!(q.len(&g).await.unwrap(), 0);
        assert_eq!(q.dead_letters(&g).await.unwrap().len(), 3);
        assert!(q.queued_games().await.unwrap().is_empty());
    }

    fn failing_cache() -> (Arc<MemoryBackend>, Arc<ResilientStore>) {
        let cache = Arc::new(MemoryBackend::new("cache"));
        let store = Arc::new(ResilientStore::new(
            Arc::new(MemoryBackend::new("documents")),
            cache.clone(),
            &StoreConfig::default(),
        ));
        (cache, store)
    }

    #[tokio::test]
    async fn test_drain_keeps_messages_when_dead_letter_write_fails() {
        let (cache, store) = failing_cache();
        let q = ActionQueue::new(store);
        let g = GameId::new("gone");
        let first = msg("gone", QueueAction::Roll);
        q.enqueue(&first).await.unwrap();
        q.enqueue(&msg("gone", QueueAction::EndTurn)).await.unwrap();

        cache.fail_writes_to(&dead_letter_key(&g));
        assert!(q.drain_to_dead_letter(&g).await.is_err());
        assert_eq!(q.len(&g).await.unwrap(), 2);
        assert_eq!(q.pending(&g).await.unwrap()[0].id, first.id);

        cache.clear_failures();
        assert_eq!(q.drain_to_dead_letter(&g).await.unwrap(), 2);
        assert_eq!(q.len(&g).await.unwrap(), 0);
        assert_eq!(q.dead_letters(&g).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_entry_survives_failed_dead_letter_write() {
        let (cache, store) = failing_cache();
        let q = ActionQueue::new(store.clone());
        let g = GameId::new("g1");
        store.push_back(&queue_key(&g), "{broken".into()).await.unwrap();

        cache.fail_writes_to(&dead_letter_key(&g));
        assert!(q.dequeue(&g).await.is_err());
        assert_eq!(store.list(&queue_key(&g)).await.unwrap(), vec!["{broken".to_string()]);

        cache.clear_failures();
        assert!(q.dequeue(&g).await.unwrap().is_none());
        assert_eq!(store.list(&dead_letter_key(&g)).await.unwrap(), vec!["{broken".to_string()]);
        assert_eq!(q.len(&g).await.unwrap(), 0);
    }
}
