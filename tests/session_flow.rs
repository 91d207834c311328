//! End-to-end session flow over the in-memory store: room lifecycle, rounds,
//! scoring, and host hand-off as a client application would drive them.

use std::sync::Arc;
use std::time::Duration;

use songbuzz::{
    AnswerOutcome, AppConfig, KeyValueStore, MemoryStore, RoomError, RoomSession,
    model::GameModeType, session::RoomView,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

async fn wait_view(session: &RoomSession, mut predicate: impl FnMut(&RoomView) -> bool) {
    let mut rx = session.watch_view();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if predicate(&rx.borrow().clone()) {
                return;
            }
            rx.changed().await.expect("view channel closed");
        }
    })
    .await
    .expect("view did not converge in time");
}

#[tokio::test]
async fn a_full_game_session() {
    init_tracing();
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let config = Arc::new(AppConfig::default());

    // Host opens a room, two players join.
    let host = RoomSession::create(store.clone(), config.clone(), "Dana")
        .await
        .unwrap();
    let ada = RoomSession::join(store.clone(), config.clone(), host.code(), "Ada")
        .await
        .unwrap();
    let ben = RoomSession::join(store.clone(), config.clone(), host.code(), "Ben")
        .await
        .unwrap();
    wait_view(&host, |view| view.players.len() == 3).await;

    // Speed mode: 15 points per correct answer, 20 second rounds.
    host.set_game_mode(GameModeType::Speed).await.unwrap();
    wait_view(&ada, |view| view.game_mode.is_some()).await;
    host.start_round_timer().await.unwrap();
    wait_view(&ada, |view| {
        view.timer.as_ref().is_some_and(|timer| timer.total_time == 20.0)
    })
    .await;

    // Round one: Ada wins the buzz, Ben's attempt is stale.
    ada.buzz().await.unwrap();
    assert!(matches!(
        ben.buzz().await.unwrap_err(),
        RoomError::StaleRound
    ));
    ada.submit_answer("Bohemian Rhapsody").await.unwrap();
    wait_view(&host, |view| {
        view.winner
            .as_ref()
            .is_some_and(|winner| winner.answer.as_deref() == Some("Bohemian Rhapsody"))
    })
    .await;
    host.resolve_round(AnswerOutcome::Correct).await.unwrap();
    host.mark_song_played("Bohemian Rhapsody").await.unwrap();

    let ada_id = ada.player_id().to_owned();
    wait_view(&host, |view| {
        view.winner.is_none() && view.players[&ada_id].points == 15
    })
    .await;

    // Round two: Ben buzzes and gets it wrong; points never go below zero.
    wait_view(&ben, |view| view.winner.is_none()).await;
    ben.buzz().await.unwrap();
    let ben_id = ben.player_id().to_owned();
    wait_view(&host, |view| view.winner.is_some()).await;
    host.resolve_round(AnswerOutcome::Wrong).await.unwrap();
    wait_view(&host, |view| {
        view.winner.is_none()
            && view
                .players
                .get(&ben_id)
                .is_some_and(|player| player.points == 0 && player.wrong_answers == 1)
    })
    .await;

    // The host leaves; the earliest-joined player inherits the role.
    host.leave().await.unwrap();
    wait_view(&ada, |view| view.is_host && view.players.len() == 2).await;
    assert_eq!(ada.view().host_name, "Ada");

    // The new host can drive the next round.
    ada.set_buzz_gate(false).await.unwrap();
    wait_view(&ben, |view| !view.buzz_enabled).await;
    assert!(matches!(
        ben.buzz().await.unwrap_err(),
        RoomError::BuzzDisabled
    ));

    assert_eq!(ada.view().played_songs, vec!["Bohemian Rhapsody"]);
}

#[tokio::test]
async fn rejoining_preserves_identity_and_score() {
    init_tracing();
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let config = Arc::new(AppConfig::default());

    let host = RoomSession::create(store.clone(), config.clone(), "Dana")
        .await
        .unwrap();
    let ada = RoomSession::join(store.clone(), config.clone(), host.code(), "Ada")
        .await
        .unwrap();
    let ada_id = ada.player_id().to_owned();

    ada.buzz().await.unwrap();
    wait_view(&host, |view| view.winner.is_some()).await;
    host.resolve_round(AnswerOutcome::Correct).await.unwrap();
    wait_view(&host, |view| view.players[&ada_id].points == 10).await;

    // Connection drop: the session goes away without leaving the room.
    drop(ada);

    let again = RoomSession::join(store.clone(), config.clone(), host.code(), "  ADA ")
        .await
        .unwrap();
    assert_eq!(again.player_id(), ada_id);
    wait_view(&again, |view| view.players[&ada_id].points == 10).await;
}
