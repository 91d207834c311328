//! Translation of domain intents into store operations.
//!
//! The repository owns the rules the store does not enforce: room-code
//! uniqueness, player identity reconciliation, the buzz lock, and the single
//! clamped scoring funnel. All failures are logged here and surfaced as
//! typed [`RoomError`]s.

use std::sync::Arc;

use rand::Rng;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::{
    config::AppConfig,
    error::{RoomError, RoomResult},
    model::{
        GameMode, GameTimer, Player, PlayerId, Room, WinnerInfo, now_ms, played_songs_path,
        player_path, room_path, winner_info_path,
    },
    store::{KeyValueStore, StoreError, TransactionOutcome, TransactionVerdict},
    validation::{checked, validate_answer, validate_player_name, validate_room_code},
};

/// Store-facing gateway for all room mutations.
#[derive(Clone)]
pub struct RoomRepository {
    store: Arc<dyn KeyValueStore>,
    config: Arc<AppConfig>,
}

impl RoomRepository {
    /// Build a repository over the given store and configuration.
    pub fn new(store: Arc<dyn KeyValueStore>, config: Arc<AppConfig>) -> Self {
        Self { store, config }
    }

    /// Handle to the underlying store, shared with the signaling coordinator.
    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        self.store.clone()
    }

    /// Create a room under a fresh collision-checked 4-digit code.
    ///
    /// Returns the room code together with the generated host player id.
    pub async fn create_room(&self, host_name: &str) -> RoomResult<(String, PlayerId)> {
        checked("name", validate_player_name(host_name))?;
        let host_name = host_name.trim();

        for _ in 0..self.config.code_attempts {
            let code = generate_room_code();
            if self.store.exists(&room_path(&code)).await? {
                debug!(code, "room code collision, retrying");
                continue;
            }

            let now = now_ms();
            let host_id = derive_player_id(host_name, now);
            let room = Room::new(host_name.to_owned(), host_id.clone(), now);
            let value = serde_json::to_value(&room)
                .map_err(|err| StoreError::corrupted(room_path(&code), err))?;

            // The code was observed free; a failed write here must surface as
            // a creation error so the caller can retry with a new code.
            if let Err(err) = self.store.write(&room_path(&code), value).await {
                warn!(code, error = %err, "initial room write failed");
                return Err(RoomError::RoomCreation(err.to_string()));
            }

            info!(code, host = host_name, "room created");
            return Ok((code, host_id));
        }

        Err(RoomError::RoomCreation("room code space exhausted".into()))
    }

    /// Read and decode a room, `None` when the key does not exist.
    pub async fn read_room(&self, code: &str) -> RoomResult<Option<Room>> {
        let path = room_path(code);
        match self.store.read_once(&path).await? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|err| StoreError::corrupted(path, err).into()),
        }
    }

    async fn require_room(&self, code: &str) -> RoomResult<Room> {
        self.read_room(code)
            .await?
            .ok_or_else(|| RoomError::RoomNotFound(code.to_owned()))
    }

    /// Join a room, re-attaching to an existing identity when the normalized
    /// name matches a present player.
    ///
    /// A rejoin preserves the accumulated points and the stored host flag; it
    /// can never promote or demote host status.
    pub async fn join_room(&self, code: &str, name: &str) -> RoomResult<PlayerId> {
        checked("code", validate_room_code(code))?;
        checked("name", validate_player_name(name))?;
        let name = name.trim();

        let room = self.require_room(code).await?;
        let now = now_ms();
        if is_room_inactive(&room, now, &self.config) {
            warn!(code, "join refused: room expired from inactivity");
            return Err(RoomError::RoomNotFound(code.to_owned()));
        }

        let wanted = normalized_name(name);
        if let Some((id, existing)) = room
            .players
            .iter()
            .find(|(_, player)| normalized_name(&player.name) == wanted)
        {
            let mut fields = Map::new();
            fields.insert("name".into(), json!(name));
            fields.insert("joinedAt".into(), json!(now));
            fields.insert("points".into(), json!(existing.points.max(0)));
            fields.insert("isHost".into(), json!(existing.is_host));
            self.store.merge(&player_path(code, id), fields).await?;
            self.touch_activity(code).await?;

            info!(code, player_id = %id, "player re-attached to existing identity");
            return Ok(id.clone());
        }

        let player_id = derive_player_id(name, now);
        let player = Player::new(name.to_owned(), false, now);
        let value = serde_json::to_value(&player)
            .map_err(|err| StoreError::corrupted(player_path(code, &player_id), err))?;
        self.store.write(&player_path(code, &player_id), value).await?;
        self.touch_activity(code).await?;

        info!(code, player_id = %player_id, "player joined");
        Ok(player_id)
    }

    /// Hard-delete a player entry.
    ///
    /// When the departing player is the host and other players remain, the
    /// earliest-joined remaining player is promoted so host-only operations
    /// stay available.
    pub async fn leave_room(&self, code: &str, player_id: &str) -> RoomResult<()> {
        let Some(room) = self.read_room(code).await? else {
            // The room can be swept while the leave is in flight.
            return Ok(());
        };

        let was_host = room
            .players
            .get(player_id)
            .is_some_and(|player| player.is_host);

        self.store
            .write(&player_path(code, player_id), Value::Null)
            .await?;

        if was_host {
            let successor = room
                .players
                .iter()
                .filter(|(id, _)| id.as_str() != player_id)
                .min_by_key(|(_, player)| player.joined_at)
                .map(|(id, player)| (id.clone(), player.name.clone()));

            if let Some((successor_id, successor_name)) = successor {
                let mut player_fields = Map::new();
                player_fields.insert("isHost".into(), json!(true));
                self.store
                    .merge(&player_path(code, &successor_id), player_fields)
                    .await?;

                let mut room_fields = Map::new();
                room_fields.insert("hostName".into(), json!(successor_name));
                self.store.merge(&room_path(code), room_fields).await?;

                info!(code, new_host = %successor_id, "host left; promoted earliest-joined player");
            }
        }

        self.touch_activity(code).await?;
        Ok(())
    }

    /// Claim the round lock for a player.
    ///
    /// The check-and-write runs inside the store's transactional primitive,
    /// so under concurrent buzzes exactly one claim commits; every other
    /// claimant observes [`RoomError::StaleRound`].
    pub async fn register_buzz(
        &self,
        code: &str,
        player_id: &str,
        player_name: &str,
        time_left: Option<f64>,
    ) -> RoomResult<()> {
        if !self.store.exists(&room_path(code)).await? {
            return Err(RoomError::RoomNotFound(code.to_owned()));
        }

        let winner = WinnerInfo {
            player_id: player_id.to_owned(),
            player_name: player_name.to_owned(),
            timestamp: now_ms(),
            answer: None,
            time_left,
        };
        let payload =
            serde_json::to_value(&winner).map_err(|err| StoreError::corrupted("winnerInfo", err))?;

        let outcome = self
            .store
            .transactional_update(
                &winner_info_path(code),
                Box::new(move |current| {
                    if current.is_none() {
                        TransactionVerdict::Commit(payload)
                    } else {
                        TransactionVerdict::Abort
                    }
                }),
            )
            .await?;

        match outcome {
            TransactionOutcome::Committed => {
                self.touch_activity(code).await?;
                debug!(code, player_id, "buzz registered");
                Ok(())
            }
            TransactionOutcome::Aborted => {
                debug!(code, player_id, "buzz lost the race, round already locked");
                Err(RoomError::StaleRound)
            }
        }
    }

    /// Release the round lock. Idempotent.
    pub async fn reset_buzz(&self, code: &str) -> RoomResult<()> {
        self.store
            .write(&winner_info_path(code), Value::Null)
            .await?;
        Ok(())
    }

    /// Flip the buzz gate. Independent of the round lock.
    pub async fn set_buzz_enabled(&self, code: &str, enabled: bool) -> RoomResult<()> {
        let mut fields = Map::new();
        fields.insert("buzzEnabled".into(), json!(enabled));
        fields.insert("lastActivity".into(), json!(now_ms()));
        self.store.merge(&room_path(code), fields).await?;
        Ok(())
    }

    /// Attach answer text to the current round lock.
    ///
    /// If the round was reset between the buzz and this call there is no lock
    /// to attach to; that race is surfaced as [`RoomError::StaleRound`]
    /// instead of being silently discarded.
    pub async fn submit_answer(&self, code: &str, text: &str) -> RoomResult<()> {
        checked("answer", validate_answer(text))?;
        let answer = text.trim().to_owned();

        let outcome = self
            .store
            .transactional_update(
                &winner_info_path(code),
                Box::new(move |current| match current {
                    Some(mut winner) => {
                        if let Some(object) = winner.as_object_mut() {
                            object.insert("answer".into(), json!(answer));
                            TransactionVerdict::Commit(winner)
                        } else {
                            TransactionVerdict::Abort
                        }
                    }
                    None => TransactionVerdict::Abort,
                }),
            )
            .await?;

        match outcome {
            TransactionOutcome::Committed => {
                self.touch_activity(code).await?;
                Ok(())
            }
            TransactionOutcome::Aborted => {
                warn!(code, "answer arrived after the round was reset");
                Err(RoomError::StaleRound)
            }
        }
    }

    /// The single scoring funnel every resolution goes through.
    ///
    /// Applies the delta with a floor of zero, updates the streak, answer
    /// counters, and response-time average consistently, then releases the
    /// round lock. `resets_streak` marks the resolution as incorrect.
    pub async fn award_points(
        &self,
        code: &str,
        player_id: &str,
        delta: i32,
        resets_streak: bool,
        response_time: Option<f64>,
    ) -> RoomResult<()> {
        let now = now_ms();
        let outcome = self
            .store
            .transactional_update(
                &player_path(code, player_id),
                Box::new(move |current| {
                    let Some(value) = current else {
                        return TransactionVerdict::Abort;
                    };
                    let Ok(mut player) = serde_json::from_value::<Player>(value) else {
                        return TransactionVerdict::Abort;
                    };

                    player.points = (player.points + delta).max(0);
                    if resets_streak {
                        player.current_streak = 0;
                        player.wrong_answers += 1;
                    } else {
                        player.current_streak += 1;
                        player.best_streak = player.best_streak.max(player.current_streak);
                        player.correct_answers += 1;
                    }
                    if let Some(response_time) = response_time {
                        let samples = player.correct_answers + player.wrong_answers;
                        player.average_response_time = Some(match player.average_response_time {
                            Some(mean) if samples > 1 => {
                                (mean * f64::from(samples - 1) + response_time)
                                    / f64::from(samples)
                            }
                            _ => response_time,
                        });
                    }
                    player.last_answer_time = Some(now);

                    match serde_json::to_value(&player) {
                        Ok(value) => TransactionVerdict::Commit(value),
                        Err(_) => TransactionVerdict::Abort,
                    }
                }),
            )
            .await?;

        if outcome == TransactionOutcome::Aborted {
            // Player left (or was removed) between resolution and write.
            warn!(code, player_id, "score update skipped: player entry missing");
        }

        self.touch_activity(code).await?;
        self.reset_buzz(code).await
    }

    /// Set the active game mode for the room.
    pub async fn set_game_mode(&self, code: &str, mode: &GameMode) -> RoomResult<()> {
        let mut fields = Map::new();
        fields.insert(
            "gameMode".into(),
            serde_json::to_value(mode).map_err(|err| StoreError::corrupted("gameMode", err))?,
        );
        fields.insert("lastActivity".into(), json!(now_ms()));
        self.store.merge(&room_path(code), fields).await?;
        info!(code, mode = %mode.name, "game mode changed");
        Ok(())
    }

    /// Broadcast a running countdown. Host only, enforced by the caller.
    pub async fn start_timer(&self, code: &str, seconds: f64) -> RoomResult<()> {
        let timer = GameTimer {
            is_active: true,
            time_left: seconds,
            total_time: seconds,
        };
        let mut fields = Map::new();
        fields.insert(
            "gameTimer".into(),
            serde_json::to_value(&timer).map_err(|err| StoreError::corrupted("gameTimer", err))?,
        );
        fields.insert("lastActivity".into(), json!(now_ms()));
        self.store.merge(&room_path(code), fields).await?;
        Ok(())
    }

    /// Clear the countdown for every subscriber. Host only, enforced by the caller.
    pub async fn stop_timer(&self, code: &str) -> RoomResult<()> {
        let mut fields = Map::new();
        fields.insert("gameTimer".into(), Value::Null);
        fields.insert("lastActivity".into(), json!(now_ms()));
        self.store.merge(&room_path(code), fields).await?;
        Ok(())
    }

    /// Refresh `lastActivity` so the inactivity sweep keeps the room alive.
    ///
    /// Runs as a conditional update: a refresh racing a room deletion must
    /// not write a partial `rooms/{code}` entry back into existence.
    pub async fn touch_activity(&self, code: &str) -> RoomResult<()> {
        let now = now_ms();
        self.store
            .transactional_update(
                &room_path(code),
                Box::new(move |current| match current {
                    Some(mut room) => {
                        if let Some(object) = room.as_object_mut() {
                            object.insert("lastActivity".into(), json!(now));
                            TransactionVerdict::Commit(room)
                        } else {
                            TransactionVerdict::Abort
                        }
                    }
                    None => TransactionVerdict::Abort,
                }),
            )
            .await?;
        Ok(())
    }

    /// Record a played title, de-duplicated, via the transactional primitive.
    pub async fn add_played_song(&self, code: &str, song: &str) -> RoomResult<()> {
        let song = song.to_owned();
        self.store
            .transactional_update(
                &played_songs_path(code),
                Box::new(move |current| {
                    let mut songs: Vec<String> = current
                        .and_then(|value| serde_json::from_value(value).ok())
                        .unwrap_or_default();
                    if songs.iter().any(|existing| *existing == song) {
                        return TransactionVerdict::Abort;
                    }
                    songs.push(song);
                    TransactionVerdict::Commit(json!(songs))
                }),
            )
            .await?;
        Ok(())
    }

    /// Explicitly delete a room and everything under it.
    pub async fn delete_room(&self, code: &str) -> RoomResult<()> {
        self.store.write(&room_path(code), Value::Null).await?;
        info!(code, "room deleted");
        Ok(())
    }
}

/// Whether the room has been idle past the configured threshold.
pub(crate) fn is_room_inactive(room: &Room, now: u64, config: &AppConfig) -> bool {
    let last = room.last_activity.max(room.created_at);
    now.saturating_sub(last) > config.inactivity_timeout.as_millis() as u64
}

/// Draw a random 4-digit room code.
fn generate_room_code() -> String {
    rand::rng().random_range(1000..=9999).to_string()
}

/// Case- and space-insensitive name key used for identity reconciliation.
fn normalized_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Identity derived from the name plus a millisecond-timestamp suffix.
fn derive_player_id(name: &str, now: u64) -> PlayerId {
    let slug: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();
    format!("{slug}_{:06}", now % 1_000_000)
}
