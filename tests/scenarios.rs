//! End-to-end scenarios: manager, queue and worker over in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use tycoon::core::rng::ScriptedRng;
use tycoon::game::manager::{GameConfig, NewGame, RngFactory};
use tycoon::game::state::TurnPhase;
use tycoon::queue::{Disposition, QueueAction, WorkerConfig};
use tycoon::store::{MemoryBackend, StoreConfig};
use tycoon::{
    ActionQueue, GameId, GameManager, GameStatus, PlayerId, QueueMessage, RandomSource, ResilientStore, UserId,
    Worker,
};

struct Harness {
    documents: Arc<MemoryBackend>,
    manager: Arc<GameManager>,
    queue: ActionQueue,
    worker: Worker,
}

fn harness(rng: Option<RngFactory>) -> Harness {
    let documents = Arc::new(MemoryBackend::new("documents"));
    let cache = Arc::new(MemoryBackend::new("cache"));
    let store = Arc::new(ResilientStore::new(documents.clone(), cache, &StoreConfig::default()));
    let mut manager = GameManager::new(store.clone(), GameConfig::default());
    if let Some(factory) = rng {
        manager = manager.with_rng_factory(factory);
    }
    let manager = Arc::new(manager);
    let queue = ActionQueue::new(store);
    let worker = Worker::new(
        manager.clone(),
        queue.clone(),
        WorkerConfig {
            retry_interval: Duration::from_millis(5),
            ..WorkerConfig::default()
        },
    );
    Harness {
        documents,
        manager,
        queue,
        worker,
    }
}

async fn two_player_lobby(manager: &GameManager) -> (GameId, PlayerId, PlayerId) {
    let game = manager
        .create_game(UserId::new("alice"), "rocket", NewGame::default())
        .await
        .unwrap();
    let guest = manager
        .join_game(&game.id, UserId::new("bob"), "comet", None)
        .await
        .unwrap();
    (game.id, game.host_id, guest)
}

async fn submit(h: &mut Harness, game_id: &GameId, player: &PlayerId, action: QueueAction) {
    let msg = QueueMessage::new(game_id.clone(), Some(player.clone()), action);
    h.queue.enqueue(&msg).await.unwrap();
    let report = h.worker.run_cycle().await.unwrap();
    assert_eq!(report.handled, 1, "message was not handled in one cycle");
}

#[tokio::test]
async fn game_start_through_the_queue() {
    let mut h = harness(None);
    let (game_id, host, guest) = two_player_lobby(&h.manager).await;

    submit(&mut h, &game_id, &host, QueueAction::GameStart).await;

    let game = h.manager.get_game(&game_id).await.unwrap();
    assert_eq!(game.status, GameStatus::Active);
    assert_eq!(game.turn_order.len(), 2);
    assert!(game.turn_order.contains(&host));
    assert!(game.turn_order.contains(&guest));
    let current = game.current_turn.clone().unwrap();
    assert!(game.turn_order.contains(&current));
    for player in &game.players {
        assert_eq!(player.balance, 1500);
    }
}

#[tokio::test]
async fn buy_then_rent_through_the_queue() {
    let factory: RngFactory =
        Arc::new(|_: &GameId| Box::new(ScriptedRng::new([2, 3, 2, 3])) as Box<dyn RandomSource>);
    let mut h = harness(Some(factory));
    let (game_id, host, _) = two_player_lobby(&h.manager).await;
    submit(&mut h, &game_id, &host, QueueAction::GameStart).await;

    let game = h.manager.get_game(&game_id).await.unwrap();
    let first = game.turn_order[0].clone();
    let second = game.turn_order[1].clone();

    submit(&mut h, &game_id, &first, QueueAction::Roll).await;
    submit(
        &mut h,
        &game_id,
        &first,
        QueueAction::BuyProperty {
            property_id: "dial-up-station".into(),
        },
    )
    .await;
    submit(&mut h, &game_id, &first, QueueAction::EndTurn).await;
    submit(&mut h, &game_id, &second, QueueAction::Roll).await;

    let game = h.manager.get_game(&game_id).await.unwrap();
    assert_eq!(game.turn.phase, TurnPhase::PayRent);
    let rent = game.board.properties["dial-up-station"].rent_current;
    assert!(rent > 0);

    submit(&mut h, &game_id, &second, QueueAction::PayRent).await;

    let game = h.manager.get_game(&game_id).await.unwrap();
    assert_eq!(game.player(&first).unwrap().balance, 1500 - 200 + rent);
    assert_eq!(game.player(&second).unwrap().balance, 1500 - rent);
    assert_eq!(game.board.properties["dial-up-station"].owner_id, Some(first));
    assert_eq!(h.worker.stats().snapshot().processed, 6);
}

#[tokio::test]
async fn out_of_turn_roll_is_rejected_without_side_effects() {
    let mut h = harness(None);
    let mut rejections = h.worker.subscribe_rejections();
    let (game_id, host, _) = two_player_lobby(&h.manager).await;
    submit(&mut h, &game_id, &host, QueueAction::GameStart).await;

    let before = h.manager.get_game(&game_id).await.unwrap();
    let waiting = before.turn_order[1].clone();
    submit(&mut h, &game_id, &waiting, QueueAction::Roll).await;

    let after = h.manager.get_game(&game_id).await.unwrap();
    assert_eq!(after.player(&waiting).unwrap().position, before.player(&waiting).unwrap().position);
    assert_eq!(after.current_turn, before.current_turn);

    let rejection = rejections.try_recv().unwrap();
    assert_eq!(rejection.player_id, Some(waiting));
    assert!(h.queue.dead_letters(&game_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn persistent_outage_ends_in_dead_letter() {
    let mut h = harness(None);
    let (game_id, host, _) = two_player_lobby(&h.manager).await;
    h.documents.set_available(false);

    let msg = QueueMessage::new(game_id.clone(), Some(host), QueueAction::GameStart);
    h.queue.enqueue(&msg).await.unwrap();

    let mut dispositions = Vec::new();
    for _ in 0..4 {
        let next = h.queue.dequeue(&game_id).await.unwrap().unwrap();
        dispositions.push(h.worker.process(next).await);
    }
    assert_eq!(
        dispositions,
        vec![
            Disposition::Retried,
            Disposition::Retried,
            Disposition::Retried,
            Disposition::DeadLettered
        ]
    );

    let dead = h.queue.dead_letters(&game_id).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, msg.id);
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(h.queue.len(&game_id).await.unwrap(), 0);

    // the cached document never saw the failed start
    h.documents.set_available(true);
    assert_eq!(h.manager.get_game(&game_id).await.unwrap().status, GameStatus::Lobby);
}

#[tokio::test]
async fn redelivered_action_applies_once() {
    let factory: RngFactory =
        Arc::new(|_: &GameId| Box::new(ScriptedRng::new([2, 3])) as Box<dyn RandomSource>);
    let mut h = harness(Some(factory));
    let (game_id, host, _) = two_player_lobby(&h.manager).await;
    submit(&mut h, &game_id, &host, QueueAction::GameStart).await;
    let first = h.manager.get_game(&game_id).await.unwrap().turn_order[0].clone();

    let roll = QueueMessage::new(game_id.clone(), Some(first.clone()), QueueAction::Roll);
    h.queue.enqueue(&roll).await.unwrap();
    h.queue.enqueue(&roll).await.unwrap();
    h.worker.run_cycle().await.unwrap();

    let game = h.manager.get_game(&game_id).await.unwrap();
    assert_eq!(game.player(&first).unwrap().position, 5);
    assert_eq!(h.worker.stats().snapshot().duplicates, 1);
}
