//! Live room membership: one [`RoomSession`] per joined client.
//!
//! A session owns the room subscription, keeps a derived [`RoomView`] up to
//! date, heartbeats `lastActivity`, feeds the local countdown, and exposes the
//! domain commands. Host-only commands are checked against the live host flag
//! so a promotion after the original host leaves takes effect immediately.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use indexmap::IndexMap;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use crate::{
    config::AppConfig,
    error::{RoomError, RoomResult},
    model::{
        GameMode, GameModeType, GameTimer, Player, PlayerId, Room, WinnerInfo, room_path,
    },
    repository::RoomRepository,
    scoring::{AnswerOutcome, ScorePolicy},
    signaling::{AudioRelay, MediaEndpoint, RelayRole},
    store::KeyValueStore,
    timer::TimerSynchronizer,
};

/// Broadcast capacity of the per-session event hub.
const EVENT_CAPACITY: usize = 64;
/// Countdown length used when the active mode does not set one.
const DEFAULT_ROUND_SECONDS: f64 = 30.0;
/// Response time assumed when no countdown was running at buzz time.
const DEFAULT_RESPONSE_TIME: f64 = 3.0;

/// Snapshot of the room as seen by one member.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomView {
    /// The 4-digit room code.
    pub room_code: String,
    /// Whether this member currently holds the host role.
    pub is_host: bool,
    /// Display name of the current host.
    pub host_name: String,
    /// Members in join order.
    pub players: IndexMap<PlayerId, Player>,
    /// The open round lock, if any.
    pub winner: Option<WinnerInfo>,
    /// Active game mode.
    pub game_mode: Option<GameMode>,
    /// Store-published countdown value (the locally extrapolated one lives on
    /// the timer watch channel).
    pub timer: Option<GameTimer>,
    /// Whether buzzes are currently accepted.
    pub buzz_enabled: bool,
    /// Titles already played this session.
    pub played_songs: Vec<String>,
}

impl RoomView {
    fn derive(code: &str, player_id: &str, room: &Room) -> Self {
        Self {
            room_code: code.to_owned(),
            is_host: room
                .players
                .get(player_id)
                .is_some_and(|player| player.is_host),
            host_name: room.host_name.clone(),
            players: room.players.clone(),
            winner: room.winner_info.clone(),
            game_mode: room.game_mode.clone(),
            timer: room.game_timer.clone(),
            buzz_enabled: room.buzz_enabled,
            played_songs: room.played_songs.clone(),
        }
    }
}

/// Session lifecycle notifications fanned out to observers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The room changed; carries the freshly derived view.
    Updated(RoomView),
    /// The session ended and no further updates will arrive.
    Closed {
        /// Human-readable cause (room deleted, member removed, left).
        reason: String,
    },
}

/// Broadcast hub fanning session events out to observers.
#[derive(Clone)]
pub struct SessionEventHub {
    sender: broadcast::Sender<SessionEvent>,
}

impl SessionEventHub {
    fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a new subscriber that will receive subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Send an event to all current subscribers, ignoring delivery errors.
    fn broadcast(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }
}

/// One member's live connection to a room.
pub struct RoomSession {
    code: String,
    player_id: PlayerId,
    player_name: String,
    repository: RoomRepository,
    config: Arc<AppConfig>,
    timer: Arc<TimerSynchronizer>,
    view_tx: watch::Sender<RoomView>,
    events: SessionEventHub,
    is_host: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RoomSession {
    /// Create a new room and attach as its host.
    pub async fn create(
        store: Arc<dyn KeyValueStore>,
        config: Arc<AppConfig>,
        host_name: &str,
    ) -> RoomResult<Self> {
        let repository = RoomRepository::new(store, config.clone());
        let (code, player_id) = repository.create_room(host_name).await?;
        Self::attach(repository, config, code, player_id, host_name.trim().to_owned()).await
    }

    /// Join an existing room and attach as a regular member (or re-attach to
    /// a matching previous identity).
    pub async fn join(
        store: Arc<dyn KeyValueStore>,
        config: Arc<AppConfig>,
        code: &str,
        name: &str,
    ) -> RoomResult<Self> {
        let repository = RoomRepository::new(store, config.clone());
        let player_id = repository.join_room(code, name).await?;
        Self::attach(
            repository,
            config,
            code.to_owned(),
            player_id,
            name.trim().to_owned(),
        )
        .await
    }

    async fn attach(
        repository: RoomRepository,
        config: Arc<AppConfig>,
        code: String,
        player_id: PlayerId,
        player_name: String,
    ) -> RoomResult<Self> {
        let room = repository
            .read_room(&code)
            .await?
            .ok_or_else(|| RoomError::RoomNotFound(code.clone()))?;

        let timer = Arc::new(TimerSynchronizer::new(config.timer_tick));
        timer.observe(room.game_timer.clone());

        let initial = RoomView::derive(&code, &player_id, &room);
        let is_host = Arc::new(AtomicBool::new(initial.is_host));
        let (view_tx, _) = watch::channel(initial);

        let session = Self {
            code: code.clone(),
            player_id: player_id.clone(),
            player_name,
            repository: repository.clone(),
            config,
            timer: timer.clone(),
            view_tx,
            events: SessionEventHub::new(EVENT_CAPACITY),
            is_host,
            closed: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        };

        let subscription = repository.store().subscribe(&room_path(&code)).await?;
        session.spawn_room_watch(subscription);
        session.spawn_heartbeat();
        session.spawn_expiry_watch();

        info!(code, player_id = %session.player_id, "session attached");
        Ok(session)
    }

    /// The 4-digit room code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// This member's identity inside the room.
    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    /// Whether this member currently holds the host role.
    pub fn is_host(&self) -> bool {
        self.is_host.load(Ordering::SeqCst)
    }

    /// Latest derived view of the room.
    pub fn view(&self) -> RoomView {
        self.view_tx.borrow().clone()
    }

    /// Watch channel carrying the derived view.
    pub fn watch_view(&self) -> watch::Receiver<RoomView> {
        self.view_tx.subscribe()
    }

    /// The derived view as an async stream.
    pub fn view_stream(&self) -> WatchStream<RoomView> {
        WatchStream::new(self.view_tx.subscribe())
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Watch channel carrying the locally extrapolated countdown.
    pub fn watch_timer(&self) -> watch::Receiver<Option<GameTimer>> {
        self.timer.watch()
    }

    /// Claim the round lock for this member.
    ///
    /// The gate and lock are checked against the local view first so the
    /// common rejections stay cheap; the authoritative check is the
    /// transactional claim in the store, which under concurrent buzzes admits
    /// exactly one winner.
    pub async fn buzz(&self) -> RoomResult<()> {
        self.ensure_open()?;
        let view = self.view();
        if !view.buzz_enabled {
            return Err(RoomError::BuzzDisabled);
        }
        if view.winner.is_some() {
            return Err(RoomError::StaleRound);
        }

        let time_left = self.timer.current().map(|timer| timer.time_left);
        self.repository
            .register_buzz(&self.code, &self.player_id, &self.player_name, time_left)
            .await
    }

    /// Attach answer text to this member's open buzz.
    pub async fn submit_answer(&self, text: &str) -> RoomResult<()> {
        self.ensure_open()?;
        self.repository.submit_answer(&self.code, text).await
    }

    /// Resolve the open round with the mode-aware flat award. Host only.
    pub async fn resolve_round(&self, outcome: AnswerOutcome) -> RoomResult<()> {
        self.require_host()?;
        let view = self.view();
        let policy = ScorePolicy::mode_aware(view.game_mode.as_ref());
        self.apply_resolution(&view, policy, outcome).await
    }

    /// Resolve the open round with the speed/streak formula. Host only.
    pub async fn resolve_round_speed(&self, outcome: AnswerOutcome) -> RoomResult<()> {
        self.require_host()?;
        let view = self.view();
        let policy = ScorePolicy::SpeedStreak(self.config.scoring.clone());
        self.apply_resolution(&view, policy, outcome).await
    }

    /// Dismiss the open round without touching any score. Host only.
    pub async fn reject_round(&self) -> RoomResult<()> {
        self.require_host()?;
        self.repository.reset_buzz(&self.code).await
    }

    async fn apply_resolution(
        &self,
        view: &RoomView,
        policy: ScorePolicy,
        outcome: AnswerOutcome,
    ) -> RoomResult<()> {
        let winner = view.winner.clone().ok_or(RoomError::StaleRound)?;
        let response_time = response_time(view, &winner);

        // The formula expects the streak in effect for this answer, i.e.
        // already incremented when the resolution is correct.
        let mut streak = view
            .players
            .get(&winner.player_id)
            .map(|player| player.current_streak)
            .unwrap_or(0);
        if outcome.is_correct() {
            streak += 1;
        }

        let delta = policy.delta(outcome, response_time, streak);
        debug!(
            code = %self.code,
            winner = %winner.player_id,
            delta,
            response_time,
            "resolving round"
        );
        self.repository
            .award_points(
                &self.code,
                &winner.player_id,
                delta,
                !outcome.is_correct(),
                Some(response_time),
            )
            .await
    }

    /// Directly award points to a player, counting as a correct answer for
    /// streak purposes. Host only.
    pub async fn award(&self, player_id: &str, points: i32) -> RoomResult<()> {
        self.require_host()?;
        self.repository
            .award_points(&self.code, player_id, points, false, None)
            .await
    }

    /// Directly deduct points from a player, breaking their streak. Host only.
    pub async fn penalize(&self, player_id: &str, points: i32) -> RoomResult<()> {
        self.require_host()?;
        self.repository
            .award_points(&self.code, player_id, -points, true, None)
            .await
    }

    /// Switch the active game mode to a built-in preset. Host only.
    pub async fn set_game_mode(&self, kind: GameModeType) -> RoomResult<()> {
        self.require_host()?;
        self.repository
            .set_game_mode(&self.code, &GameMode::preset(kind))
            .await
    }

    /// Start a countdown of the given length. Host only.
    pub async fn start_timer(&self, seconds: f64) -> RoomResult<()> {
        self.require_host()?;
        self.repository.start_timer(&self.code, seconds).await
    }

    /// Start a countdown sized by the active mode's time limit. Host only.
    pub async fn start_round_timer(&self) -> RoomResult<()> {
        let seconds = self
            .view()
            .game_mode
            .as_ref()
            .and_then(|mode| mode.settings.time_limit)
            .map(f64::from)
            .unwrap_or(DEFAULT_ROUND_SECONDS);
        self.start_timer(seconds).await
    }

    /// Clear the countdown for everyone. Host only.
    pub async fn stop_timer(&self) -> RoomResult<()> {
        self.require_host()?;
        self.repository.stop_timer(&self.code).await
    }

    /// Open or close the buzz gate. Host only.
    pub async fn set_buzz_gate(&self, enabled: bool) -> RoomResult<()> {
        self.require_host()?;
        self.repository.set_buzz_enabled(&self.code, enabled).await
    }

    /// Record a played title so it is not repeated. Host only.
    pub async fn mark_song_played(&self, title: &str) -> RoomResult<()> {
        self.require_host()?;
        self.repository.add_played_song(&self.code, title).await
    }

    /// Start the audio relay for this member's side of the channel.
    pub async fn start_audio_relay(
        &self,
        endpoint: Arc<dyn MediaEndpoint>,
    ) -> RoomResult<AudioRelay> {
        self.ensure_open()?;
        let role = if self.is_host() {
            RelayRole::Host
        } else {
            RelayRole::Listener
        };
        AudioRelay::start(
            self.repository.store(),
            endpoint,
            &self.config,
            &self.code,
            role,
        )
        .await
    }

    /// Leave the room, removing this member's entry and ending the session.
    pub async fn leave(self) -> RoomResult<()> {
        self.close("left the room");
        self.repository.leave_room(&self.code, &self.player_id).await
    }

    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handles = {
            let mut tasks = self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *tasks)
        };
        for handle in handles {
            handle.abort();
        }
        self.events.broadcast(SessionEvent::Closed {
            reason: reason.to_owned(),
        });
    }

    fn ensure_open(&self) -> RoomResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RoomError::RoomNotFound(self.code.clone()));
        }
        Ok(())
    }

    fn require_host(&self) -> RoomResult<()> {
        self.ensure_open()?;
        if !self.is_host() {
            return Err(RoomError::Unauthorized(
                "command requires the host role".into(),
            ));
        }
        Ok(())
    }

    fn spawn_room_watch(&self, mut subscription: crate::store::Subscription) {
        let code = self.code.clone();
        let player_id = self.player_id.clone();
        let view_tx = self.view_tx.clone();
        let events = self.events.clone();
        let timer = self.timer.clone();
        let is_host = self.is_host.clone();
        let closed = self.closed.clone();
        self.push_task(tokio::spawn(async move {
            while let Some(snapshot) = subscription.next_snapshot().await {
                let Some(value) = snapshot else {
                    closed.store(true, Ordering::SeqCst);
                    events.broadcast(SessionEvent::Closed {
                        reason: "room closed".into(),
                    });
                    return;
                };
                let room: Room = match serde_json::from_value(value) {
                    Ok(room) => room,
                    Err(err) => {
                        warn!(code, error = %err, "discarding malformed room snapshot");
                        continue;
                    }
                };

                if !room.players.contains_key(&player_id) {
                    closed.store(true, Ordering::SeqCst);
                    events.broadcast(SessionEvent::Closed {
                        reason: "removed from room".into(),
                    });
                    return;
                }

                let next = RoomView::derive(&code, &player_id, &room);
                is_host.store(next.is_host, Ordering::SeqCst);
                timer.observe(room.game_timer.clone());
                view_tx.send_replace(next.clone());
                events.broadcast(SessionEvent::Updated(next));
            }
        }));
    }

    fn spawn_heartbeat(&self) {
        let repository = self.repository.clone();
        let code = self.code.clone();
        let closed = self.closed.clone();
        let period = self.config.heartbeat_interval;
        self.push_task(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick of a tokio interval completes immediately; the
            // join/create path already touched the room.
            interval.tick().await;
            loop {
                interval.tick().await;
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(err) = repository.touch_activity(&code).await {
                    warn!(code, error = %err, "heartbeat failed");
                }
            }
        }));
    }

    /// The host reacts to local expiry by clearing the shared countdown,
    /// which stops it for every subscriber.
    fn spawn_expiry_watch(&self) {
        let Some(mut expirations) = self.timer.take_expirations() else {
            return;
        };
        let repository = self.repository.clone();
        let code = self.code.clone();
        let is_host = self.is_host.clone();
        self.push_task(tokio::spawn(async move {
            while expirations.recv().await.is_some() {
                if !is_host.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(err) = repository.stop_timer(&code).await {
                    warn!(code, error = %err, "failed to clear expired timer");
                }
            }
        }));
    }

    fn push_task(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.close("session dropped");
    }
}

/// Seconds between the countdown start and the winning buzz.
fn response_time(view: &RoomView, winner: &WinnerInfo) -> f64 {
    match (winner.time_left, view.timer.as_ref()) {
        (Some(left), Some(timer)) => (timer.total_time - left).max(0.0),
        _ => DEFAULT_RESPONSE_TIME,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::store::memory::MemoryStore;

    use super::*;

    fn store() -> Arc<dyn KeyValueStore> {
        Arc::new(MemoryStore::new())
    }

    fn config() -> Arc<AppConfig> {
        Arc::new(AppConfig::default())
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
    async fn full_round_flow_awards_mode_points() {
        let store = store();
        let config = config();
        let host = RoomSession::create(store.clone(), config.clone(), "Host")
            .await
            .unwrap();
        let player = RoomSession::join(store.clone(), config.clone(), host.code(), "Ada")
            .await
            .unwrap();

        wait_view(&host, |view| view.players.len() == 2).await;

        player.buzz().await.unwrap();
        player.submit_answer("Yesterday").await.unwrap();

        let ada = player.player_id().to_owned();
        wait_view(&host, |view| {
            view.winner
                .as_ref()
                .is_some_and(|winner| winner.answer.is_some())
        })
        .await;

        host.resolve_round(AnswerOutcome::Correct).await.unwrap();

        // No mode set: default award of 10, round lock released.
        wait_view(&host, |view| {
            view.winner.is_none() && view.players[&ada].points == 10
        })
        .await;
        let resolved = host.view().players[&ada].clone();
        assert_eq!(resolved.current_streak, 1);
        assert_eq!(resolved.correct_answers, 1);
    }

    #[tokio::test]
    async fn closed_gate_rejects_buzzes_locally() {
        let store = store();
        let config = config();
        let host = RoomSession::create(store.clone(), config.clone(), "Host")
            .await
            .unwrap();
        let player = RoomSession::join(store.clone(), config.clone(), host.code(), "Ada")
            .await
            .unwrap();

        host.set_buzz_gate(false).await.unwrap();
        wait_view(&player, |view| !view.buzz_enabled).await;

        let err = player.buzz().await.unwrap_err();
        assert!(matches!(err, RoomError::BuzzDisabled));
    }

    #[tokio::test]
    async fn second_buzz_loses_the_round() {
        let store = store();
        let config = config();
        let host = RoomSession::create(store.clone(), config.clone(), "Host")
            .await
            .unwrap();
        let ada = RoomSession::join(store.clone(), config.clone(), host.code(), "Ada")
            .await
            .unwrap();
        let ben = RoomSession::join(store.clone(), config.clone(), host.code(), "Ben")
            .await
            .unwrap();

        ada.buzz().await.unwrap();
        let err = ben.buzz().await.unwrap_err();
        assert!(matches!(err, RoomError::StaleRound));
    }

    #[tokio::test]
    async fn host_only_commands_are_rejected_for_members() {
        let store = store();
        let config = config();
        let host = RoomSession::create(store.clone(), config.clone(), "Host")
            .await
            .unwrap();
        let player = RoomSession::join(store.clone(), config.clone(), host.code(), "Ada")
            .await
            .unwrap();

        let err = player.set_buzz_gate(false).await.unwrap_err();
        assert!(matches!(err, RoomError::Unauthorized(_)));
        let err = player.start_timer(20.0).await.unwrap_err();
        assert!(matches!(err, RoomError::Unauthorized(_)));
        let err = player.resolve_round(AnswerOutcome::Correct).await.unwrap_err();
        assert!(matches!(err, RoomError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn room_deletion_closes_member_sessions() {
        let store = store();
        let config = config();
        let host = RoomSession::create(store.clone(), config.clone(), "Host")
            .await
            .unwrap();
        let player = RoomSession::join(store.clone(), config.clone(), host.code(), "Ada")
            .await
            .unwrap();
        let mut events = player.subscribe_events();

        let repository = RoomRepository::new(store.clone(), config.clone());
        repository.delete_room(host.code()).await.unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await.expect("event channel closed") {
                    SessionEvent::Closed { reason } => return reason,
                    SessionEvent::Updated(_) => continue,
                }
            }
        })
        .await
        .expect("no close event");
        assert_eq!(closed, "room closed");
        assert!(matches!(
            player.buzz().await.unwrap_err(),
            RoomError::RoomNotFound(_)
        ));
    }

    #[tokio::test]
    async fn host_departure_promotes_and_unlocks_host_commands() {
        let store = store();
        let config = config();
        let host = RoomSession::create(store.clone(), config.clone(), "Host")
            .await
            .unwrap();
        let player = RoomSession::join(store.clone(), config.clone(), host.code(), "Ada")
            .await
            .unwrap();
        wait_view(&host, |view| view.players.len() == 2).await;

        host.leave().await.unwrap();

        wait_view(&player, |view| view.is_host).await;
        player.set_buzz_gate(false).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_countdown_is_cleared_for_every_subscriber() {
        let store = store();
        let config = config();
        let host = RoomSession::create(store.clone(), config.clone(), "Host")
            .await
            .unwrap();
        let player = RoomSession::join(store.clone(), config.clone(), host.code(), "Ada")
            .await
            .unwrap();
        wait_view(&host, |view| view.players.len() == 2).await;

        host.start_timer(10.0).await.unwrap();
        wait_view(&player, |view| view.timer.is_some()).await;

        // The local countdown reaches zero after 10 virtual seconds; the host
        // reacts by clearing `gameTimer` in the store, which every subscriber
        // observes as a missing timer.
        let mut rx = player.watch_view();
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                if rx.borrow().timer.is_none() {
                    return;
                }
                rx.changed().await.expect("view channel closed");
            }
        })
        .await
        .expect("timer was never cleared");

        wait_view(&host, |view| view.timer.is_none()).await;
        // The player's local extrapolation is cleared along with its view.
        assert!(player.watch_timer().borrow().is_none());
    }

    #[tokio::test]
    async fn speed_resolution_uses_the_countdown() {
        let store = store();
        let config = config();
        let host = RoomSession::create(store.clone(), config.clone(), "Host")
            .await
            .unwrap();
        let player = RoomSession::join(store.clone(), config.clone(), host.code(), "Ada")
            .await
            .unwrap();
        wait_view(&host, |view| view.players.len() == 2).await;

        host.start_timer(20.0).await.unwrap();
        wait_view(&player, |view| view.timer.is_some()).await;

        player.buzz().await.unwrap();
        let ada = player.player_id().to_owned();
        wait_view(&host, |view| view.winner.is_some()).await;

        host.resolve_round_speed(AnswerOutcome::Correct)
            .await
            .unwrap();

        // Near-instant buzz: base 100 + capped bonus 50, one-streak multiplier.
        wait_view(&host, |view| view.winner.is_none()).await;
        let points = host.view().players[&ada].points;
        assert!(points >= 225, "unexpectedly low speed award: {points}");
        let response = host.view().players[&ada].average_response_time.unwrap();
        assert!(response < 2.0, "response time too high: {response}");
    }
}
