//! Action Queue Module
//!
//! - `message`: Typed queue messages and their JSON shape
//! - `action_queue`: Per-game FIFO plus dead-letter list over the store
//! - `handlers`: One handler per message type
//! - `worker`: The single consumer with retry and dead-letter routing

pub mod action_queue;
pub mod handlers;
pub mod message;
pub mod worker;

pub use action_queue::ActionQueue;
pub use handlers::{ActionHandler, HandlerOutcome, HandlerRegistry};
pub use message::{MessageType, QueueAction, QueueMessage};
pub use worker::{Disposition, Rejection, Worker, WorkerConfig, WorkerStats, WorkerStatsSnapshot};
