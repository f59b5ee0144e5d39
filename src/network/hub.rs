//! Connection Hub
//!
//! Owns every live connection, keyed by game and player. The table is only
//! ever touched by the hub loop; connection tasks and the server talk to it
//! through [`HubHandle`] commands.
//!
//! - **Register**: last writer wins. An older connection for the same seat is
//!   told to shut down and dropped.
//! - **Close**: every connection dropped from the table has its close signal
//!   fired, so the socket behind it is torn down and the client reconnects
//!   instead of talking into a seat the hub no longer routes to.
//! - **Broadcast**: fan-out over a snapshot of the game's connections. A
//!   connection whose outbound buffer is closed or full is dropped on its own;
//!   everyone else still receives the message.
//! - **Heartbeat**: every connection is pinged; one that stays silent past
//!   `pong_timeout` takes the normal disconnect path.
//! - **Disconnect timeout**: a seat that stays disconnected past
//!   `disconnect_timeout` is reported once as [`HubEvent::DisconnectTimeout`].
//!   A timer that ran out while the game could not act on it is re-armed with
//!   [`HubHandle::track_disconnected`], backdated to when the seat dropped.
//!
//! The hub never edits game documents. It reports [`HubEvent`]s and the
//! server turns them into game manager calls.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::ids::{now_millis, GameId, PlayerId};
use crate::network::protocol::ServerMessage;

/// Connection session identifier (hex, 32 chars).
pub type SessionId = String;

/// Fresh random session id.
pub fn new_session_id() -> SessionId {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Hub tuning.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How often connections are pinged.
    pub heartbeat_interval: Duration,
    /// Silence after which a connection counts as dead.
    pub pong_timeout: Duration,
    /// How long a seat may stay disconnected before it is reported.
    pub disconnect_timeout: Duration,
    /// How often disconnect timers are checked.
    pub sweep_interval: Duration,
    /// Outbound buffer per connection.
    pub outbound_capacity: usize,
    /// Command buffer of the hub loop.
    pub command_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(75),
            disconnect_timeout: Duration::from_secs(180),
            sweep_interval: Duration::from_secs(1),
            outbound_capacity: 64,
            command_capacity: 1024,
        }
    }
}

/// Why a connection left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client closed or sent `leave`.
    Closed,
    /// Read error on the socket.
    ReadError,
    /// Outbound buffer closed or full.
    WriteFailed,
    /// No traffic within the pong timeout.
    HeartbeatTimeout,
    /// A newer connection took the seat.
    Replaced,
    /// The hub is shutting down.
    Shutdown,
}

/// Reported by the hub loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// A seat got a live connection.
    Connected {
        /// Game.
        game_id: GameId,
        /// Seat.
        player_id: PlayerId,
        /// New connection.
        session_id: SessionId,
    },
    /// A seat lost its connection.
    Disconnected {
        /// Game.
        game_id: GameId,
        /// Seat.
        player_id: PlayerId,
        /// When.
        at: DateTime<Utc>,
        /// Why.
        reason: DisconnectReason,
    },
    /// A seat stayed disconnected past the timeout.
    DisconnectTimeout {
        /// Game.
        game_id: GameId,
        /// Seat.
        player_id: PlayerId,
    },
}

/// Hub loop is gone.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("connection hub is not running")]
pub struct HubClosed;

enum HubCommand {
    Register {
        game_id: GameId,
        player_id: PlayerId,
        session_id: SessionId,
        sender: mpsc::Sender<ServerMessage>,
        closer: Option<oneshot::Sender<DisconnectReason>>,
    },
    Unregister {
        game_id: GameId,
        player_id: PlayerId,
        session_id: SessionId,
        reason: DisconnectReason,
    },
    Broadcast {
        game_id: GameId,
        message: ServerMessage,
    },
    SendTo {
        game_id: GameId,
        player_id: PlayerId,
        message: ServerMessage,
    },
    Activity {
        game_id: GameId,
        player_id: PlayerId,
        session_id: SessionId,
    },
    ForgetGame {
        game_id: GameId,
    },
    TrackDisconnected {
        game_id: GameId,
        player_id: PlayerId,
        since: DateTime<Utc>,
    },
    Connections {
        game_id: GameId,
        reply: oneshot::Sender<Vec<(PlayerId, SessionId)>>,
    },
}

/// Cloneable handle to the hub loop.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    outbound_capacity: usize,
}

impl std::fmt::Debug for HubCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HubCommand::Register { .. } => "Register",
            HubCommand::Unregister { .. } => "Unregister",
            HubCommand::Broadcast { .. } => "Broadcast",
            HubCommand::SendTo { .. } => "SendTo",
            HubCommand::Activity { .. } => "Activity",
            HubCommand::ForgetGame { .. } => "ForgetGame",
            HubCommand::TrackDisconnected { .. } => "TrackDisconnected",
            HubCommand::Connections { .. } => "Connections",
        };
        f.write_str(name)
    }
}

impl HubHandle {
    async fn send(&self, command: HubCommand) -> Result<(), HubClosed> {
        self.commands.send(command).await.map_err(|_| HubClosed)
    }

    /// Outbound channel sized for one connection.
    pub fn outbound_channel(&self) -> (mpsc::Sender<ServerMessage>, mpsc::Receiver<ServerMessage>) {
        mpsc::channel(self.outbound_capacity.max(1))
    }

    /// Attach a connection to a seat, replacing any older one.
    pub async fn register(
        &self,
        game_id: GameId,
        player_id: PlayerId,
        session_id: SessionId,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Result<(), HubClosed> {
        self.send(HubCommand::Register {
            game_id,
            player_id,
            session_id,
            sender,
            closer: None,
        })
        .await
    }

    /// Like [`HubHandle::register`], with a signal the hub fires when it drops
    /// the connection for any reason.
    pub async fn register_closable(
        &self,
        game_id: GameId,
        player_id: PlayerId,
        session_id: SessionId,
        sender: mpsc::Sender<ServerMessage>,
        closer: oneshot::Sender<DisconnectReason>,
    ) -> Result<(), HubClosed> {
        self.send(HubCommand::Register {
            game_id,
            player_id,
            session_id,
            sender,
            closer: Some(closer),
        })
        .await
    }

    /// Detach a connection. Ignored if the seat has moved to a newer session.
    pub async fn unregister(
        &self,
        game_id: GameId,
        player_id: PlayerId,
        session_id: SessionId,
        reason: DisconnectReason,
    ) -> Result<(), HubClosed> {
        self.send(HubCommand::Unregister {
            game_id,
            player_id,
            session_id,
            reason,
        })
        .await
    }

    /// Send to every connection of a game.
    pub async fn broadcast(&self, game_id: GameId, message: ServerMessage) -> Result<(), HubClosed> {
        self.send(HubCommand::Broadcast { game_id, message }).await
    }

    /// Send to one seat, if connected.
    pub async fn send_to(
        &self,
        game_id: GameId,
        player_id: PlayerId,
        message: ServerMessage,
    ) -> Result<(), HubClosed> {
        self.send(HubCommand::SendTo {
            game_id,
            player_id,
            message,
        })
        .await
    }

    /// Record inbound traffic (resets the heartbeat deadline).
    pub async fn activity(
        &self,
        game_id: GameId,
        player_id: PlayerId,
        session_id: SessionId,
    ) -> Result<(), HubClosed> {
        self.send(HubCommand::Activity {
            game_id,
            player_id,
            session_id,
        })
        .await
    }

    /// Stop tracking disconnect timers for a finished game.
    pub async fn forget_game(&self, game_id: GameId) -> Result<(), HubClosed> {
        self.send(HubCommand::ForgetGame { game_id }).await
    }

    /// Start a disconnect timer for a seat that dropped at `since`. Ignored
    /// while the seat is connected or already timing.
    pub async fn track_disconnected(
        &self,
        game_id: GameId,
        player_id: PlayerId,
        since: DateTime<Utc>,
    ) -> Result<(), HubClosed> {
        self.send(HubCommand::TrackDisconnected {
            game_id,
            player_id,
            since,
        })
        .await
    }

    /// Live connections of a game.
    pub async fn connections(&self, game_id: GameId) -> Result<Vec<(PlayerId, SessionId)>, HubClosed> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Connections { game_id, reply }).await?;
        rx.await.map_err(|_| HubClosed)
    }
}

struct Connection {
    session_id: SessionId,
    sender: mpsc::Sender<ServerMessage>,
    closer: Option<oneshot::Sender<DisconnectReason>>,
    last_seen: Instant,
}

impl Connection {
    fn close(mut self, reason: DisconnectReason) {
        if let Some(closer) = self.closer.take() {
            let _ = closer.send(reason);
        }
    }
}

/// The hub loop state.
pub struct ConnectionHub {
    config: HubConfig,
    games: BTreeMap<GameId, BTreeMap<PlayerId, Connection>>,
    disconnected: BTreeMap<(GameId, PlayerId), Instant>,
    events: mpsc::UnboundedSender<HubEvent>,
}

impl ConnectionHub {
    /// Start the hub loop. Returns its handle, the event stream and the task.
    pub fn spawn(
        config: HubConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (HubHandle, mpsc::UnboundedReceiver<HubEvent>, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(config.command_capacity.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = HubHandle {
            commands: commands_tx,
            outbound_capacity: config.outbound_capacity,
        };
        let hub = ConnectionHub {
            config,
            games: BTreeMap::new(),
            disconnected: BTreeMap::new(),
            events: events_tx,
        };
        let task = tokio::spawn(hub.run(commands_rx, shutdown));
        (handle, events_rx, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<HubCommand>, mut shutdown: watch::Receiver<bool>) {
        info!(
            heartbeat_secs = self.config.heartbeat_interval.as_secs(),
            disconnect_timeout_secs = self.config.disconnect_timeout.as_secs(),
            "Connection hub started"
        );

        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = heartbeat.tick() => self.heartbeat(),
                _ = sweep.tick() => self.sweep_disconnected(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.close_all("Server shutting down");
        info!("Connection hub stopped");
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register {
                game_id,
                player_id,
                session_id,
                sender,
                closer,
            } => self.register(game_id, player_id, session_id, sender, closer),
            HubCommand::Unregister {
                game_id,
                player_id,
                session_id,
                reason,
            } => {
                let current = self
                    .games
                    .get(&game_id)
                    .and_then(|seats| seats.get(&player_id))
                    .map(|c| c.session_id == session_id)
                    .unwrap_or(false);
                if current {
                    self.disconnect(&game_id, &player_id, reason);
                } else {
                    debug!(game_id = %game_id, player_id = %player_id, "Ignoring unregister of a replaced session");
                }
            }
            HubCommand::Broadcast { game_id, message } => self.broadcast(&game_id, &message),
            HubCommand::SendTo {
                game_id,
                player_id,
                message,
            } => {
                let failed = match self.games.get(&game_id).and_then(|seats| seats.get(&player_id)) {
                    Some(conn) => conn.sender.try_send(message).is_err(),
                    None => false,
                };
                if failed {
                    self.disconnect(&game_id, &player_id, DisconnectReason::WriteFailed);
                }
            }
            HubCommand::Activity {
                game_id,
                player_id,
                session_id,
            } => {
                if let Some(conn) = self.games.get_mut(&game_id).and_then(|seats| seats.get_mut(&player_id)) {
                    if conn.session_id == session_id {
                        conn.last_seen = Instant::now();
                    }
                }
            }
            HubCommand::ForgetGame { game_id } => {
                self.disconnected.retain(|(g, _), _| g != &game_id);
            }
            HubCommand::TrackDisconnected {
                game_id,
                player_id,
                since,
            } => self.track_disconnected(game_id, player_id, since),
            HubCommand::Connections { game_id, reply } => {
                let list = self
                    .games
                    .get(&game_id)
                    .map(|seats| {
                        seats
                            .iter()
                            .map(|(p, c)| (p.clone(), c.session_id.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                let _ = reply.send(list);
            }
        }
    }

    fn register(
        &mut self,
        game_id: GameId,
        player_id: PlayerId,
        session_id: SessionId,
        sender: mpsc::Sender<ServerMessage>,
        closer: Option<oneshot::Sender<DisconnectReason>>,
    ) {
        let seats = self.games.entry(game_id.clone()).or_default();
        let previous = seats.insert(
            player_id.clone(),
            Connection {
                session_id: session_id.clone(),
                sender,
                closer,
                last_seen: Instant::now(),
            },
        );
        if let Some(old) = previous {
            info!(
                game_id = %game_id,
                player_id = %player_id,
                old_session = %old.session_id,
                new_session = %session_id,
                "Replacing existing connection"
            );
            let _ = old.sender.try_send(ServerMessage::Shutdown {
                reason: "Replaced by a newer connection".to_string(),
            });
            old.close(DisconnectReason::Replaced);
        } else {
            debug!(game_id = %game_id, player_id = %player_id, session_id = %session_id, "Connection registered");
        }

        self.disconnected.remove(&(game_id.clone(), player_id.clone()));
        let _ = self.events.send(HubEvent::Connected {
            game_id,
            player_id,
            session_id,
        });
    }

    fn disconnect(&mut self, game_id: &GameId, player_id: &PlayerId, reason: DisconnectReason) {
        let removed = match self.games.get_mut(game_id) {
            Some(seats) => {
                let removed = seats.remove(player_id);
                if seats.is_empty() {
                    self.games.remove(game_id);
                }
                removed
            }
            None => None,
        };
        let Some(conn) = removed else {
            return;
        };

        info!(game_id = %game_id, player_id = %player_id, reason = ?reason, "Player disconnected");
        conn.close(reason);
        self.disconnected
            .insert((game_id.clone(), player_id.clone()), Instant::now());
        let _ = self.events.send(HubEvent::Disconnected {
            game_id: game_id.clone(),
            player_id: player_id.clone(),
            at: Utc::now(),
            reason,
        });
    }

    fn track_disconnected(&mut self, game_id: GameId, player_id: PlayerId, since: DateTime<Utc>) {
        let connected = self
            .games
            .get(&game_id)
            .map(|seats| seats.contains_key(&player_id))
            .unwrap_or(false);
        let key = (game_id, player_id);
        if connected || self.disconnected.contains_key(&key) {
            return;
        }
        let elapsed = (Utc::now() - since)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(self.config.disconnect_timeout);
        let started = Instant::now().checked_sub(elapsed).unwrap_or_else(Instant::now);
        debug!(game_id = %key.0, player_id = %key.1, elapsed_ms = elapsed.as_millis() as u64, "Disconnect timer re-armed");
        self.disconnected.insert(key, started);
    }

    fn broadcast(&mut self, game_id: &GameId, message: &ServerMessage) {
        let targets: Vec<(PlayerId, mpsc::Sender<ServerMessage>)> = match self.games.get(game_id) {
            Some(seats) => seats
                .iter()
                .map(|(p, c)| (p.clone(), c.sender.clone()))
                .collect(),
            None => return,
        };

        let mut failed = Vec::new();
        for (player_id, sender) in targets {
            if let Err(e) = sender.try_send(message.clone()) {
                debug!(game_id = %game_id, player_id = %player_id, error = %e, "Broadcast write failed");
                failed.push(player_id);
            }
        }
        for player_id in failed {
            self.disconnect(game_id, &player_id, DisconnectReason::WriteFailed);
        }
    }

    fn heartbeat(&mut self) {
        let timeout = self.config.pong_timeout;
        let ping = ServerMessage::Ping {
            timestamp: now_millis(),
        };

        let mut dead = Vec::new();
        for (game_id, seats) in &self.games {
            for (player_id, conn) in seats {
                if conn.last_seen.elapsed() >= timeout {
                    dead.push((game_id.clone(), player_id.clone(), DisconnectReason::HeartbeatTimeout));
                } else if conn.sender.try_send(ping.clone()).is_err() {
                    dead.push((game_id.clone(), player_id.clone(), DisconnectReason::WriteFailed));
                }
            }
        }
        for (game_id, player_id, reason) in dead {
            warn!(game_id = %game_id, player_id = %player_id, reason = ?reason, "Heartbeat failed");
            self.disconnect(&game_id, &player_id, reason);
        }
    }

    fn sweep_disconnected(&mut self) {
        let timeout = self.config.disconnect_timeout;
        let expired: Vec<(GameId, PlayerId)> = self
            .disconnected
            .iter()
            .filter(|(_, since)| since.elapsed() >= timeout)
            .map(|(key, _)| key.clone())
            .collect();
        for (game_id, player_id) in expired {
            self.disconnected.remove(&(game_id.clone(), player_id.clone()));
            warn!(game_id = %game_id, player_id = %player_id, "Player disconnect timed out");
            let _ = self.events.send(HubEvent::DisconnectTimeout { game_id, player_id });
        }
    }

    fn close_all(&mut self, reason: &str) {
        for seats in std::mem::take(&mut self.games).into_values() {
            for conn in seats.into_values() {
                let _ = conn.sender.try_send(ServerMessage::Shutdown {
                    reason: reason.to_string(),
                });
                conn.close(DisconnectReason::Shutdown);
            }
        }
        self.disconnected.clear();
    }
}
