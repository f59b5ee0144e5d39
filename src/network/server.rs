//! WebSocket Game Server
//!
//! Async WebSocket server for multiplayer connections.
//! Handles authentication, lobby entry and action intake. Actions are never
//! applied here: they are queued for the worker, and results reach clients
//! through the hub.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::core::ids::{now_millis, GameId, PlayerId, UserId};
use crate::game::manager::{GameError, GameManager, GameUpdate, NewGame};
use crate::game::events::GameEventData;
use crate::game::state::{Game, GameStatus, PlayerStatus};
use crate::network::auth::{authenticate, AuthConfig};
use crate::network::hub::{new_session_id, DisconnectReason, HubClosed, HubEvent, HubHandle, SessionId};
use crate::network::protocol::{
    ActionRequest, AuthRequest, AuthResult, ClientMessage, ErrorCode, ServerError, ServerMessage,
};
use crate::queue::message::{QueueAction, QueueMessage};
use crate::queue::worker::Rejection;
use crate::queue::ActionQueue;
use crate::store::StoreError;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Time a new connection has to authenticate.
    pub auth_timeout: Duration,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            auth_timeout: Duration::from_secs(30),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Storage error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Everything a connection task needs.
struct Shared {
    config: ServerConfig,
    auth: AuthConfig,
    manager: Arc<GameManager>,
    queue: ActionQueue,
    hub: HubHandle,
    connections: AtomicUsize,
}

/// The game server.
pub struct GameServer {
    shared: Arc<Shared>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(
        config: ServerConfig,
        auth: AuthConfig,
        manager: Arc<GameManager>,
        queue: ActionQueue,
        hub: HubHandle,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                auth,
                manager,
                queue,
                hub,
                connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Open connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::Relaxed)
    }

    /// Bind and run until shutdown.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Accept on an already bound listener until shutdown.
    #[instrument(skip_all)]
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), GameServerError> {
        info!("Game server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let open = self.shared.connections.load(Ordering::Relaxed);
                            if open >= self.shared.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("New connection from {}", addr);
                            spawn_connection(Arc::clone(&self.shared), stream, addr, shutdown.clone());
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

// =============================================================================
// CONNECTIONS
// =============================================================================

/// Per-connection state.
struct ConnState {
    addr: SocketAddr,
    session_id: SessionId,
    user_id: Option<UserId>,
    seat: Option<(GameId, PlayerId)>,
    /// Handed to the hub on bind; fired when the hub drops this connection.
    closer: Option<oneshot::Sender<DisconnectReason>>,
}

enum Flow {
    Continue,
    Close(DisconnectReason),
}

fn spawn_connection(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WebSocket handshake failed for {}: {}", addr, e);
                return;
            }
        };
        shared.connections.fetch_add(1, Ordering::Relaxed);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (msg_tx, mut msg_rx) = shared.hub.outbound_channel();

        // Writer: ends after a shutdown frame (server stop or replaced session).
        let mut sender_task = tokio::spawn(async move {
            while let Some(msg) = msg_rx.recv().await {
                let closing = matches!(msg, ServerMessage::Shutdown { .. });
                let text = match msg.to_json() {
                    Ok(t) => t,
                    Err(e) => {
                        error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
                if closing {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        });

        let (closer, mut closed) = oneshot::channel();
        let mut state = ConnState {
            addr,
            session_id: new_session_id(),
            user_id: None,
            seat: None,
            closer: Some(closer),
        };
        let auth_deadline = tokio::time::sleep(shared.config.auth_timeout);
        tokio::pin!(auth_deadline);
        let mut writer_done = false;

        let reason = loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    let flow = match frame {
                        Some(Ok(Message::Text(text))) => match ClientMessage::from_json(&text) {
                            Ok(client_msg) => handle_client_message(&shared, &mut state, client_msg, &msg_tx).await,
                            Err(e) => {
                                debug!("Invalid message from {}: {}", addr, e);
                                let _ = msg_tx
                                    .send(ServerMessage::error(ErrorCode::InvalidInput, "Invalid message format"))
                                    .await;
                                Flow::Continue
                            }
                        },
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            touch(&shared, &state).await;
                            Flow::Continue
                        }
                        Some(Ok(Message::Close(_))) | None => Flow::Close(DisconnectReason::Closed),
                        Some(Err(e)) => {
                            debug!("WebSocket error for {}: {}", addr, e);
                            Flow::Close(DisconnectReason::ReadError)
                        }
                        Some(Ok(_)) => Flow::Continue,
                    };
                    if let Flow::Close(reason) = flow {
                        break reason;
                    }
                }
                _ = &mut auth_deadline, if state.user_id.is_none() => {
                    let _ = msg_tx
                        .send(ServerMessage::error(ErrorCode::NotAuthenticated, "Authentication timed out"))
                        .await;
                    break DisconnectReason::Closed;
                }
                _ = &mut sender_task, if !writer_done => {
                    writer_done = true;
                    break DisconnectReason::WriteFailed;
                }
                signal = &mut closed => {
                    // the hub already took the seat out of its table
                    let reason = signal.unwrap_or(DisconnectReason::Closed);
                    let _ = msg_tx.try_send(ServerMessage::Shutdown {
                        reason: close_message(reason).to_string(),
                    });
                    state.seat = None;
                    break reason;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break DisconnectReason::Closed;
                    }
                }
            }
        };

        if let Some((game_id, player_id)) = state.seat.take() {
            let _ = shared
                .hub
                .unregister(game_id, player_id, state.session_id.clone(), reason)
                .await;
        }
        drop(msg_tx);
        if !writer_done && tokio::time::timeout(Duration::from_secs(1), &mut sender_task).await.is_err() {
            sender_task.abort();
        }
        shared.connections.fetch_sub(1, Ordering::Relaxed);
        debug!("Client {} cleaned up ({:?})", addr, reason);
    });
}

fn close_message(reason: DisconnectReason) -> &'static str {
    match reason {
        DisconnectReason::HeartbeatTimeout => "Heartbeat timed out",
        DisconnectReason::WriteFailed => "Connection too slow",
        DisconnectReason::Replaced => "Replaced by a newer connection",
        DisconnectReason::Shutdown => "Server shutting down",
        DisconnectReason::Closed | DisconnectReason::ReadError => "Connection closed",
    }
}

async fn touch(shared: &Shared, state: &ConnState) {
    if let Some((game_id, player_id)) = &state.seat {
        let _ = shared
            .hub
            .activity(game_id.clone(), player_id.clone(), state.session_id.clone())
            .await;
    }
}

async fn send_error(tx: &mpsc::Sender<ServerMessage>, code: ErrorCode, message: impl Into<String>) {
    let _ = tx.send(ServerMessage::error(code, message)).await;
}

async fn send_game_error(tx: &mpsc::Sender<ServerMessage>, err: &GameError) {
    send_error(tx, ErrorCode::from(err), err.to_string()).await;
}

async fn handle_client_message(
    shared: &Shared,
    state: &mut ConnState,
    msg: ClientMessage,
    tx: &mpsc::Sender<ServerMessage>,
) -> Flow {
    touch(shared, state).await;

    match msg {
        ClientMessage::Auth(req) => handle_auth(shared, state, req, tx).await,
        ClientMessage::CreateGame {
            token,
            max_players,
            min_players,
        } => {
            let Some(user_id) = ready_for_lobby(state, tx).await else {
                return Flow::Continue;
            };
            let defaults = NewGame::default();
            let options = NewGame {
                max_players: max_players.unwrap_or(defaults.max_players),
                min_players: min_players.unwrap_or(defaults.min_players),
            };
            match shared.manager.create_game(user_id, token, options).await {
                Ok(game) => bind(shared, state, game.id.clone(), game.host_id.clone(), tx).await,
                Err(e) => send_game_error(tx, &e).await,
            }
            Flow::Continue
        }
        ClientMessage::JoinGame { code, token } => {
            let Some(user_id) = ready_for_lobby(state, tx).await else {
                return Flow::Continue;
            };
            match shared.manager.join_by_code(&code, user_id, token).await {
                Ok((game_id, player_id)) => bind(shared, state, game_id, player_id, tx).await,
                Err(e) => send_game_error(tx, &e).await,
            }
            Flow::Continue
        }
        ClientMessage::Action(req) => {
            handle_action(shared, state, req, tx).await;
            Flow::Continue
        }
        ClientMessage::SyncRequest => {
            match &state.seat {
                Some((game_id, _)) => match shared.manager.get_game(game_id).await {
                    Ok(game) => {
                        let _ = tx.send(ServerMessage::State { game: Box::new(game) }).await;
                    }
                    Err(e) => send_game_error(tx, &e).await,
                },
                None => send_error(tx, ErrorCode::NotInGame, "Not bound to a game").await,
            }
            Flow::Continue
        }
        ClientMessage::Ping { timestamp } => {
            let _ = tx
                .send(ServerMessage::Pong {
                    timestamp,
                    server_time: now_millis(),
                })
                .await;
            Flow::Continue
        }
        ClientMessage::Pong { .. } => Flow::Continue,
        ClientMessage::Leave => Flow::Close(DisconnectReason::Closed),
    }
}

/// The authenticated user, if the connection may still enter a lobby.
async fn ready_for_lobby(state: &ConnState, tx: &mpsc::Sender<ServerMessage>) -> Option<UserId> {
    let Some(user_id) = state.user_id.clone() else {
        send_error(tx, ErrorCode::NotAuthenticated, "Must authenticate first").await;
        return None;
    };
    if state.seat.is_some() {
        send_error(tx, ErrorCode::AlreadyInGame, "Connection is already bound to a game").await;
        return None;
    }
    Some(user_id)
}

async fn handle_auth(shared: &Shared, state: &mut ConnState, req: AuthRequest, tx: &mpsc::Sender<ServerMessage>) -> Flow {
    if state.user_id.is_some() {
        send_error(tx, ErrorCode::InvalidInput, "Already authenticated").await;
        return Flow::Continue;
    }

    let user_id = match authenticate(&req.token, &shared.auth) {
        Ok(user_id) => user_id,
        Err(e) => {
            warn!("Authentication failed for {}: {}", state.addr, e);
            let _ = tx
                .send(ServerMessage::AuthResult(AuthResult {
                    success: false,
                    session_id: None,
                    game_id: None,
                    player_id: None,
                    error: Some(e.to_string()),
                    server_version: shared.config.version.clone(),
                }))
                .await;
            send_error(tx, ErrorCode::from(&e), e.to_string()).await;
            return Flow::Close(DisconnectReason::Closed);
        }
    };
    state.user_id = Some(user_id.clone());
    debug!("Client {} authenticated as {}", state.addr, user_id);

    let Some(game_id) = req.game_id else {
        let _ = tx
            .send(ServerMessage::AuthResult(AuthResult {
                success: true,
                session_id: Some(state.session_id.clone()),
                game_id: None,
                player_id: None,
                error: None,
                server_version: shared.config.version.clone(),
            }))
            .await;
        return Flow::Continue;
    };

    match shared.manager.player_for_user(&game_id, &user_id).await {
        Ok(Some(player_id)) => bind(shared, state, game_id, player_id, tx).await,
        Ok(None) => send_error(tx, ErrorCode::NotInGame, "No seat in that game").await,
        Err(e) => send_game_error(tx, &e).await,
    }
    Flow::Continue
}

/// Tie the connection to a seat and register it with the hub.
async fn bind(
    shared: &Shared,
    state: &mut ConnState,
    game_id: GameId,
    player_id: PlayerId,
    tx: &mpsc::Sender<ServerMessage>,
) {
    let Some(closer) = state.closer.take() else {
        send_error(tx, ErrorCode::AlreadyInGame, "Connection is already bound to a game").await;
        return;
    };
    if let Err(e) = shared
        .hub
        .register_closable(game_id.clone(), player_id.clone(), state.session_id.clone(), tx.clone(), closer)
        .await
    {
        send_error(tx, ErrorCode::InternalError, e.to_string()).await;
        return;
    }
    state.seat = Some((game_id.clone(), player_id.clone()));
    info!(game_id = %game_id, player_id = %player_id, session_id = %state.session_id, "Connection bound to seat");

    let _ = tx
        .send(ServerMessage::AuthResult(AuthResult {
            success: true,
            session_id: Some(state.session_id.clone()),
            game_id: Some(game_id.clone()),
            player_id: Some(player_id),
            error: None,
            server_version: shared.config.version.clone(),
        }))
        .await;
    if let Ok(game) = shared.manager.get_game(&game_id).await {
        let _ = tx.send(ServerMessage::State { game: Box::new(game) }).await;
    }
}

async fn handle_action(shared: &Shared, state: &ConnState, req: ActionRequest, tx: &mpsc::Sender<ServerMessage>) {
    let Some((game_id, player_id)) = &state.seat else {
        send_error(tx, ErrorCode::NotInGame, "Not bound to a game").await;
        return;
    };
    if matches!(req.action, QueueAction::PlayerJoined { .. }) {
        send_error(tx, ErrorCode::InvalidInput, "Use join-game to take a seat").await;
        return;
    }

    let mut msg = QueueMessage::new(game_id.clone(), Some(player_id.clone()), req.action);
    if let Some(id) = req.id {
        // client ids are only unique per player
        msg = msg.with_id(format!("{}:{}", player_id, id));
    }
    if let Some(timestamp) = req.timestamp {
        msg.timestamp = timestamp;
    }

    match shared.queue.enqueue(&msg).await {
        Ok(_) => {
            let _ = tx.send(ServerMessage::Queued { action_id: msg.id }).await;
        }
        Err(e) => {
            warn!(game_id = %game_id, error = %e, "Failed to enqueue action");
            let _ = tx
                .send(ServerMessage::Error(ServerError {
                    code: ErrorCode::Unavailable,
                    message: e.to_string(),
                    action_id: Some(msg.id),
                }))
                .await;
        }
    }
}

// =============================================================================
// RELAYS
// =============================================================================

/// Background tasks that connect the manager, worker and hub.
#[derive(Debug)]
pub struct Relays {
    /// Manager updates to hub broadcasts.
    pub updates: JoinHandle<()>,
    /// Hub events to manager calls.
    pub hub_events: JoinHandle<()>,
    /// Worker rejections to the acting player.
    pub rejections: JoinHandle<()>,
}

impl Relays {
    /// Start all relays.
    pub fn spawn(
        manager: Arc<GameManager>,
        queue: ActionQueue,
        hub: HubHandle,
        hub_events: mpsc::UnboundedReceiver<HubEvent>,
        rejections: broadcast::Receiver<Rejection>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            updates: tokio::spawn(relay_updates(manager.subscribe(), hub.clone(), shutdown.clone())),
            hub_events: tokio::spawn(relay_hub_events(manager, queue, hub_events, shutdown.clone())),
            rejections: tokio::spawn(relay_rejections(rejections, hub, shutdown)),
        }
    }

    /// Wait for every relay to finish.
    pub async fn join(self) {
        let _ = tokio::join!(self.updates, self.hub_events, self.rejections);
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Broadcast every committed update to the game's connections. When a game
/// (re)enters ACTIVE, seats that are still disconnected get their timers back.
pub async fn relay_updates(
    mut updates: broadcast::Receiver<GameUpdate>,
    hub: HubHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let update = tokio::select! {
            received = updates.recv() => received,
            _ = stopped(&mut shutdown) => return,
        };
        let update = match update {
            Ok(update) => update,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Update relay lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let game_id = update.game.id.clone();
        let terminal = update.game.status.is_terminal();
        let became_active = update.game.status == GameStatus::Active
            && update
                .events
                .iter()
                .any(|e| matches!(e.data, GameEventData::GameStarted { .. } | GameEventData::GameResumed));
        if became_active && rearm_disconnect_timers(&hub, &update.game).await.is_err() {
            return;
        }
        if !update.events.is_empty() {
            let events = ServerMessage::Event {
                game_id: game_id.clone(),
                events: update.events,
            };
            if hub.broadcast(game_id.clone(), events).await.is_err() {
                return;
            }
        }
        let state = ServerMessage::State { game: Box::new(update.game) };
        if hub.broadcast(game_id.clone(), state).await.is_err() {
            return;
        }
        if terminal {
            let _ = hub.forget_game(game_id).await;
        }
    }
}

async fn rearm_disconnect_timers(hub: &HubHandle, game: &Game) -> Result<(), HubClosed> {
    for player in &game.players {
        if player.status != PlayerStatus::Disconnected {
            continue;
        }
        let since = player.disconnected_at.unwrap_or_else(chrono::Utc::now);
        hub.track_disconnected(game.id.clone(), player.id.clone(), since).await?;
    }
    Ok(())
}

/// Apply connection changes to game documents; forfeit seats that timed out.
pub async fn relay_hub_events(
    manager: Arc<GameManager>,
    queue: ActionQueue,
    mut events: mpsc::UnboundedReceiver<HubEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
            _ = stopped(&mut shutdown) => return,
        };

        let result = match event {
            HubEvent::Connected {
                game_id,
                player_id,
                session_id,
            } => {
                let result = manager.mark_connected(&game_id, &player_id, Some(session_id)).await;
                result.map_err(|e| (game_id, e))
            }
            HubEvent::Disconnected {
                game_id,
                player_id,
                at,
                ..
            } => {
                let result = manager.mark_disconnected(&game_id, &player_id, at).await;
                result.map_err(|e| (game_id, e))
            }
            HubEvent::DisconnectTimeout { game_id, player_id } => {
                forfeit_timed_out(&manager, &queue, game_id, player_id).await
            }
        };
        if let Err((game_id, e)) = result {
            match e {
                GameError::Validation(rule) => {
                    debug!(game_id = %game_id, reason = %rule, "Connection change not applied");
                }
                other => warn!(game_id = %game_id, error = %other, "Connection change failed"),
            }
        }
    }
}

async fn forfeit_timed_out(
    manager: &GameManager,
    queue: &ActionQueue,
    game_id: GameId,
    player_id: PlayerId,
) -> Result<(), (GameId, GameError)> {
    let game = manager.get_game(&game_id).await.map_err(|e| (game_id.clone(), e))?;
    if game.status != GameStatus::Active {
        return Ok(());
    }
    info!(game_id = %game_id, player_id = %player_id, "Forfeiting disconnected player");
    let msg = QueueMessage::new(game_id.clone(), Some(player_id), QueueAction::Forfeit);
    queue
        .enqueue(&msg)
        .await
        .map(|_| ())
        .map_err(|e| (game_id, GameError::Transient(e)))
}

/// Tell the acting player why the worker refused their action.
pub async fn relay_rejections(
    mut rejections: broadcast::Receiver<Rejection>,
    hub: HubHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let rejection = tokio::select! {
            received = rejections.recv() => received,
            _ = stopped(&mut shutdown) => return,
        };
        let rejection = match rejection {
            Ok(rejection) => rejection,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Rejection relay lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(player_id) = rejection.player_id else {
            continue;
        };
        let message = ServerMessage::Error(ServerError {
            code: ErrorCode::ActionRejected,
            message: rejection.reason,
            action_id: Some(rejection.message_id),
        });
        if hub.send_to(rejection.game_id, player_id, message).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::UserId;
    use crate::game::manager::GameConfig;
    use crate::network::hub::{ConnectionHub, HubConfig};
    use crate::store::{ResilientStore, StoreConfig};

    struct Fixture {
        manager: Arc<GameManager>,
        queue: ActionQueue,
        hub: HubHandle,
        events: mpsc::UnboundedReceiver<HubEvent>,
        shutdown: watch::Sender<bool>,
    }

    fn fixture(hub_config: HubConfig) -> Fixture {
        let store = Arc::new(ResilientStore::in_memory(&StoreConfig::default()));
        let manager = Arc::new(GameManager::new(store.clone(), GameConfig::default()));
        let queue = ActionQueue::new(store);
        let (shutdown, rx) = watch::channel(false);
        let (hub, events, _task) = ConnectionHub::spawn(hub_config, rx);
        Fixture { manager, queue, hub, events, shutdown }
    }

    async fn recv(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(config.max_connections > 0);
    }

    #[tokio::test]
    async fn test_updates_are_broadcast_as_events_and_state() {
        let f = fixture(HubConfig::default());
        let game = f.manager.create_game(UserId::new("h"), "rocket", NewGame::default()).await.unwrap();
        let (tx, mut rx) = f.hub.outbound_channel();
        f.hub.register(game.id.clone(), game.host_id.clone(), "s".into(), tx).await.unwrap();

        tokio::spawn(relay_updates(f.manager.subscribe(), f.hub.clone(), f.shutdown.subscribe()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        f.manager.join_game(&game.id, UserId::new("g"), "comet", None).await.unwrap();

        assert!(matches!(recv(&mut rx).await, ServerMessage::Event { .. }));
        match recv(&mut rx).await {
            ServerMessage::State { game: snapshot } => assert_eq!(snapshot.players.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hub_events_update_player_status() {
        let f = fixture(HubConfig::default());
        let game = f.manager.create_game(UserId::new("h"), "rocket", NewGame::default()).await.unwrap();
        tokio::spawn(relay_hub_events(f.manager.clone(), f.queue.clone(), f.events, f.shutdown.subscribe()));

        let (tx, _rx) = f.hub.outbound_channel();
        f.hub.register(game.id.clone(), game.host_id.clone(), "s1".into(), tx).await.unwrap();
        f.hub
            .unregister(game.id.clone(), game.host_id.clone(), "s1".into(), DisconnectReason::Closed)
            .await
            .unwrap();

        let mut status = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let snapshot = f.manager.get_game(&game.id).await.unwrap();
            let host = snapshot.player(&game.host_id).unwrap();
            if host.disconnected_at.is_some() {
                status = Some(host.status);
                break;
            }
        }
        assert_eq!(status, Some(PlayerStatus::Disconnected));
    }

    #[tokio::test]
    async fn test_disconnect_timeout_enqueues_forfeit_for_active_game() {
        let f = fixture(HubConfig::default());
        let game = f.manager.create_game(UserId::new("h"), "rocket", NewGame::default()).await.unwrap();
        let guest = f.manager.join_game(&game.id, UserId::new("g"), "comet", None).await.unwrap();

        // lobby: nothing queued
        forfeit_timed_out(&f.manager, &f.queue, game.id.clone(), guest.clone()).await.unwrap();
        assert_eq!(f.queue.len(&game.id).await.unwrap(), 0);

        f.manager.start_game(&game.id, &game.host_id, None).await.unwrap();
        forfeit_timed_out(&f.manager, &f.queue, game.id.clone(), guest.clone()).await.unwrap();
        let queued = f.queue.pending(&game.id).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].action, QueueAction::Forfeit);
        assert_eq!(queued[0].player_id, Some(guest));
    }

    fn short_timeout() -> HubConfig {
        HubConfig {
            disconnect_timeout: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(10),
            ..HubConfig::default()
        }
    }

    /// Drop a seat through the hub and wait until its timer has run out.
    async fn drop_and_expire(manager: &GameManager, hub: &HubHandle, game_id: &GameId, player_id: &PlayerId) {
        let (tx, _rx) = hub.outbound_channel();
        hub.register(game_id.clone(), player_id.clone(), "s1".into(), tx).await.unwrap();
        hub.unregister(game_id.clone(), player_id.clone(), "s1".into(), DisconnectReason::Closed)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let game = manager.get_game(game_id).await.unwrap();
        assert_eq!(game.player(player_id).unwrap().status, PlayerStatus::Disconnected);
    }

    async fn wait_for_queued(queue: &ActionQueue, game_id: &GameId) -> Vec<QueueMessage> {
        for _ in 0..100 {
            let pending = queue.pending(game_id).await.unwrap();
            if !pending.is_empty() {
                return pending;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("nothing queued for {}", game_id);
    }

    #[tokio::test]
    async fn test_lobby_timeout_forfeits_once_the_game_starts() {
        let Fixture { manager, queue, hub, events, shutdown } = fixture(short_timeout());
        let game = manager.create_game(UserId::new("h"), "rocket", NewGame::default()).await.unwrap();
        let guest = manager.join_game(&game.id, UserId::new("g"), "comet", None).await.unwrap();
        tokio::spawn(relay_updates(manager.subscribe(), hub.clone(), shutdown.subscribe()));
        tokio::spawn(relay_hub_events(manager.clone(), queue.clone(), events, shutdown.subscribe()));

        // the timer runs out while nobody can be forfeited
        drop_and_expire(&manager, &hub, &game.id, &guest).await;
        assert_eq!(queue.len(&game.id).await.unwrap(), 0);

        manager.start_game(&game.id, &game.host_id, None).await.unwrap();
        let queued = wait_for_queued(&queue, &game.id).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].action, QueueAction::Forfeit);
        assert_eq!(queued[0].player_id, Some(guest));
    }

    #[tokio::test]
    async fn test_pause_timeout_forfeits_once_the_game_resumes() {
        let Fixture { manager, queue, hub, events, shutdown } = fixture(short_timeout());
        let game = manager.create_game(UserId::new("h"), "rocket", NewGame::default()).await.unwrap();
        let guest = manager.join_game(&game.id, UserId::new("g"), "comet", None).await.unwrap();
        manager.start_game(&game.id, &game.host_id, None).await.unwrap();
        manager.pause_game(&game.id, &game.host_id, None).await.unwrap();
        tokio::spawn(relay_updates(manager.subscribe(), hub.clone(), shutdown.subscribe()));
        tokio::spawn(relay_hub_events(manager.clone(), queue.clone(), events, shutdown.subscribe()));

        drop_and_expire(&manager, &hub, &game.id, &guest).await;
        assert_eq!(queue.len(&game.id).await.unwrap(), 0);

        manager.resume_game(&game.id, &game.host_id, None).await.unwrap();
        let queued = wait_for_queued(&queue, &game.id).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].action, QueueAction::Forfeit);
        assert_eq!(queued[0].player_id, Some(guest));
    }

    #[tokio::test]
    async fn test_rejections_reach_the_acting_player() {
        let f = fixture(HubConfig::default());
        let (reject_tx, reject_rx) = broadcast::channel(8);
        let g = GameId::new("g");
        let p = PlayerId::new("p");
        let (tx, mut rx) = f.hub.outbound_channel();
        f.hub.register(g.clone(), p.clone(), "s".into(), tx).await.unwrap();
        tokio::spawn(relay_rejections(reject_rx, f.hub.clone(), f.shutdown.subscribe()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        reject_tx
            .send(Rejection {
                game_id: g,
                player_id: Some(p),
                message_id: "p:a1".into(),
                message_type: crate::queue::MessageType::Roll,
                reason: "not your turn".into(),
            })
            .unwrap();
        match recv(&mut rx).await {
            ServerMessage::Error(err) => {
                assert_eq!(err.code, ErrorCode::ActionRejected);
                assert_eq!(err.action_id.as_deref(), Some("p:a1"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
