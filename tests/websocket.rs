//! Full stack over a real socket: server, hub, relays and worker.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use tycoon::game::manager::GameConfig;
use tycoon::network::{
    AuthConfig, ClientMessage, ConnectionHub, ErrorCode, GameServer, HubConfig, Relays, ServerConfig, ServerMessage,
};
use tycoon::queue::{QueueAction, WorkerConfig};
use tycoon::store::StoreConfig;
use tycoon::{ActionQueue, GameManager, GameStatus, ResilientStore, Worker};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Stack {
    url: String,
    shutdown: watch::Sender<bool>,
}

async fn start_stack(hub_config: HubConfig) -> Stack {
    let store = Arc::new(ResilientStore::in_memory(&StoreConfig::default()));
    let manager = Arc::new(GameManager::new(store.clone(), GameConfig::default()));
    let queue = ActionQueue::new(store);
    let (shutdown, rx) = watch::channel(false);

    let (hub, hub_events, _hub_task) = ConnectionHub::spawn(hub_config, rx.clone());
    let worker = Worker::new(
        manager.clone(),
        queue.clone(),
        WorkerConfig {
            active_poll_interval: Duration::from_millis(10),
            idle_poll_interval: Duration::from_millis(10),
            ..WorkerConfig::default()
        },
    );
    let rejections = worker.subscribe_rejections();
    tokio::spawn(worker.run(rx.clone()));
    let _relays = Relays::spawn(manager.clone(), queue.clone(), hub.clone(), hub_events, rejections, rx.clone());

    let auth = AuthConfig {
        allow_anonymous: true,
        ..AuthConfig::default()
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = GameServer::new(ServerConfig::default(), auth, manager, queue, hub);
    tokio::spawn(async move { server.serve(listener, rx).await });

    Stack { url, shutdown }
}

async fn send(client: &mut Client, msg: &ClientMessage) {
    client.send(Message::Text(msg.to_json().unwrap())).await.unwrap();
}

/// Read frames until one matches.
async fn expect<F>(client: &mut Client, mut pred: F) -> ServerMessage
where
    F: FnMut(&ServerMessage) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let frame = client.next().await.unwrap().unwrap();
            if let Message::Text(text) = frame {
                let msg = ServerMessage::from_json(&text).unwrap();
                if pred(&msg) {
                    return msg;
                }
            }
        }
    })
    .await
    .expect("no matching frame")
}

/// Wait for the server to end the socket.
async fn expect_closed(client: &mut Client) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .expect("socket stayed open")
}

async fn connect_as(url: &str, user: &str) -> Client {
    let (mut client, _) = connect_async(url).await.unwrap();
    send(
        &mut client,
        &ClientMessage::from_json(&format!(r#"{{"type":"auth","token":"{}"}}"#, user)).unwrap(),
    )
    .await;
    expect(&mut client, |m| matches!(m, ServerMessage::AuthResult(r) if r.success)).await;
    client
}

#[tokio::test]
async fn lobby_to_active_over_websocket() {
    let stack = start_stack(HubConfig::default()).await;

    let mut alice = connect_as(&stack.url, "alice").await;
    send(
        &mut alice,
        &ClientMessage::CreateGame {
            token: "rocket".into(),
            max_players: None,
            min_players: None,
        },
    )
    .await;
    let ServerMessage::State { game } = expect(&mut alice, |m| matches!(m, ServerMessage::State { .. })).await else {
        unreachable!()
    };
    let code = game.code.clone();

    let mut bob = connect_as(&stack.url, "bob").await;
    send(
        &mut bob,
        &ClientMessage::JoinGame {
            code,
            token: "comet".into(),
        },
    )
    .await;
    expect(&mut bob, |m| matches!(m, ServerMessage::AuthResult(r) if r.game_id.is_some())).await;

    // alice hears about bob through the hub
    expect(&mut alice, |m| matches!(m, ServerMessage::State { game } if game.players.len() == 2)).await;

    send(
        &mut alice,
        &ClientMessage::from_json(r#"{"type":"action","id":"start-1","action":{"type":"game-start"}}"#).unwrap(),
    )
    .await;
    expect(&mut alice, |m| matches!(m, ServerMessage::Queued { .. })).await;

    for client in [&mut alice, &mut bob] {
        let ServerMessage::State { game } = expect(client, |m| {
            matches!(m, ServerMessage::State { game } if game.status == GameStatus::Active)
        })
        .await
        else {
            unreachable!()
        };
        assert_eq!(game.turn_order.len(), 2);
    }

    let _ = stack.shutdown.send(true);
}

#[tokio::test]
async fn rejected_action_reaches_only_the_actor() {
    let stack = start_stack(HubConfig::default()).await;

    let mut alice = connect_as(&stack.url, "alice").await;
    send(
        &mut alice,
        &ClientMessage::CreateGame {
            token: "rocket".into(),
            max_players: None,
            min_players: None,
        },
    )
    .await;
    expect(&mut alice, |m| matches!(m, ServerMessage::State { .. })).await;

    // one player is not enough to start
    send(
        &mut alice,
        &ClientMessage::from_json(r#"{"type":"action","id":"start-1","action":{"type":"game-start"}}"#).unwrap(),
    )
    .await;
    let ServerMessage::Error(err) = expect(&mut alice, |m| matches!(m, ServerMessage::Error(_))).await else {
        unreachable!()
    };
    assert_eq!(err.code, ErrorCode::ActionRejected);
    assert!(err.action_id.unwrap().ends_with(":start-1"));

    let _ = stack.shutdown.send(true);
}

#[tokio::test]
async fn actions_require_a_seat() {
    let stack = start_stack(HubConfig::default()).await;
    let mut carol = connect_as(&stack.url, "carol").await;

    let action = ClientMessage::Action(tycoon::network::protocol::ActionRequest {
        id: None,
        action: QueueAction::Roll,
        timestamp: None,
    });
    send(&mut carol, &action).await;
    let ServerMessage::Error(err) = expect(&mut carol, |m| matches!(m, ServerMessage::Error(_))).await else {
        unreachable!()
    };
    assert_eq!(err.code, ErrorCode::NotInGame);

    let _ = stack.shutdown.send(true);
}

#[tokio::test]
async fn silent_client_is_closed_and_can_rebind() {
    let stack = start_stack(HubConfig {
        heartbeat_interval: Duration::from_millis(50),
        pong_timeout: Duration::from_millis(150),
        ..HubConfig::default()
    })
    .await;

    let mut alice = connect_as(&stack.url, "alice").await;
    send(
        &mut alice,
        &ClientMessage::CreateGame {
            token: "rocket".into(),
            max_players: None,
            min_players: None,
        },
    )
    .await;
    let ServerMessage::State { game } = expect(&mut alice, |m| matches!(m, ServerMessage::State { .. })).await else {
        unreachable!()
    };

    // alice never answers pings; the hub drops her seat and the socket goes with it
    expect(&mut alice, |m| matches!(m, ServerMessage::Shutdown { .. })).await;
    expect_closed(&mut alice).await;

    let (mut again, _) = connect_async(&stack.url).await.unwrap();
    send(
        &mut again,
        &ClientMessage::Auth(tycoon::network::protocol::AuthRequest {
            token: "alice".into(),
            game_id: Some(game.id.clone()),
            client_version: None,
        }),
    )
    .await;
    let ServerMessage::AuthResult(result) =
        expect(&mut again, |m| matches!(m, ServerMessage::AuthResult(r) if r.success)).await
    else {
        unreachable!()
    };
    assert_eq!(result.game_id, Some(game.id.clone()));
    assert_eq!(result.player_id, Some(game.host_id.clone()));

    let _ = stack.shutdown.send(true);
}
