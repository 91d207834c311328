//! Room/player/round entities persisted under `rooms/{code}` in the store.
//!
//! Field names and shapes match the existing deployment layout, so a session
//! built on this crate interoperates with rooms written by older clients.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Identifier of a player inside a room, derived from the normalized name at
/// join time plus a timestamp suffix.
pub type PlayerId = String;

/// Current wall-clock time in unix milliseconds, the timestamp unit used
/// throughout the stored layout.
pub fn now_ms() -> u64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64
}

/// One game session, addressed by a short numeric code.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    /// Display name of the player that created the room.
    pub host_name: String,
    /// Creation timestamp (unix ms).
    pub created_at: u64,
    /// Last time any member touched the room; drives the inactivity sweep.
    #[serde(default)]
    pub last_activity: u64,
    /// Gate controlling whether buzzes are accepted, independent of the round lock.
    #[serde(default = "default_buzz_enabled")]
    pub buzz_enabled: bool,
    /// The round lock: non-null exactly while a round is open.
    pub winner_info: Option<WinnerInfo>,
    /// Members keyed by identifier, in join order.
    #[serde(default)]
    pub players: IndexMap<PlayerId, Player>,
    /// Titles already played this session, to avoid repeats.
    #[serde(default)]
    pub played_songs: Vec<String>,
    /// Active game mode, or none for legacy flat scoring.
    pub game_mode: Option<GameMode>,
    /// Host-driven countdown, present only while running.
    pub game_timer: Option<GameTimer>,
    /// Handshake transport for the host audio relay.
    #[serde(default, skip_serializing_if = "SignalingEnvelope::is_empty")]
    pub signaling: SignalingEnvelope,
}

fn default_buzz_enabled() -> bool {
    true
}

impl Room {
    /// Build the initial room state written at creation time.
    pub fn new(host_name: String, host_id: PlayerId, now: u64) -> Self {
        let mut players = IndexMap::new();
        players.insert(host_id, Player::new(host_name.clone(), true, now));
        Self {
            host_name,
            created_at: now,
            last_activity: now,
            buzz_enabled: true,
            winner_info: None,
            players,
            played_songs: Vec::new(),
            game_mode: None,
            game_timer: None,
            signaling: SignalingEnvelope::default(),
        }
    }
}

/// A member of a room and their accumulated score state.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    /// Display name as entered at join time.
    pub name: String,
    /// Whether this player created the room. Exactly one per room.
    #[serde(default)]
    pub is_host: bool,
    /// Join timestamp (unix ms); also the host hand-off ordering key.
    pub joined_at: u64,
    /// Current score, never below zero.
    #[serde(default)]
    pub points: i32,
    /// Team assignment when the teams mode is active.
    pub team: Option<Team>,
    /// Consecutive correct resolutions; reset by any incorrect one.
    #[serde(default)]
    pub current_streak: u32,
    /// Highest streak ever reached; monotonically non-decreasing.
    #[serde(default)]
    pub best_streak: u32,
    /// Count of correct resolutions.
    #[serde(default)]
    pub correct_answers: u32,
    /// Count of incorrect resolutions.
    #[serde(default)]
    pub wrong_answers: u32,
    /// Timestamp of the last resolved answer (unix ms).
    pub last_answer_time: Option<u64>,
    /// Running mean of response times in seconds.
    pub average_response_time: Option<f64>,
}

impl Player {
    /// A fresh zero-score player.
    pub fn new(name: String, is_host: bool, joined_at: u64) -> Self {
        Self {
            name,
            is_host,
            joined_at,
            points: 0,
            team: None,
            current_streak: 0,
            best_streak: 0,
            correct_answers: 0,
            wrong_answers: 0,
            last_answer_time: None,
            average_response_time: None,
        }
    }
}

/// Team assignment used by the teams game mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Team {
    /// Team A.
    A,
    /// Team B.
    B,
}

/// The round lock. Its presence prevents any other buzz from succeeding.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WinnerInfo {
    /// Player that won the buzz race.
    pub player_id: PlayerId,
    /// Display name captured at buzz time.
    pub player_name: String,
    /// Buzz timestamp (unix ms).
    pub timestamp: u64,
    /// Answer text attached after the buzz, if any.
    pub answer: Option<String>,
    /// Countdown value at buzz time, used to derive the response time.
    pub time_left: Option<f64>,
}

/// Kind discriminant of a [`GameMode`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GameModeType {
    /// Traditional play without a time limit.
    Classic,
    /// Answer within the time limit for more points.
    Speed,
    /// Automatic playlist with no pauses.
    Marathon,
    /// Two teams competing against each other.
    Teams,
}

/// Per-mode tunables. Absent fields fall back to engine defaults.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GameModeSettings {
    /// Countdown length in seconds, when the mode uses one.
    pub time_limit: Option<u32>,
    /// Whether the next track starts automatically after a resolution.
    pub auto_next: Option<bool>,
    /// Whether players are split into teams.
    pub teams_enabled: Option<bool>,
    /// Points awarded on a correct resolution.
    pub points_correct: Option<i32>,
    /// Points deducted on a wrong resolution.
    pub points_wrong: Option<i32>,
}

/// Exactly one mode is active per room, or none for legacy flat scoring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GameMode {
    /// Mode discriminant.
    #[serde(rename = "type")]
    pub kind: GameModeType,
    /// Human readable mode name.
    pub name: String,
    /// Short description shown when selecting the mode.
    pub description: String,
    /// Mode tunables.
    #[serde(default)]
    pub settings: GameModeSettings,
}

impl GameMode {
    /// Built-in catalogue offered to hosts.
    pub fn presets() -> Vec<GameMode> {
        vec![
            Self::preset(GameModeType::Classic),
            Self::preset(GameModeType::Speed),
            Self::preset(GameModeType::Marathon),
            Self::preset(GameModeType::Teams),
        ]
    }

    /// The built-in preset for a mode kind.
    pub fn preset(kind: GameModeType) -> GameMode {
        match kind {
            GameModeType::Classic => GameMode {
                kind,
                name: "Classic".into(),
                description: "Traditional play without time limits".into(),
                settings: GameModeSettings {
                    points_correct: Some(10),
                    points_wrong: Some(5),
                    ..GameModeSettings::default()
                },
            },
            GameModeType::Speed => GameMode {
                kind,
                name: "Speed".into(),
                description: "Answer before the countdown runs out".into(),
                settings: GameModeSettings {
                    time_limit: Some(20),
                    points_correct: Some(15),
                    points_wrong: Some(5),
                    ..GameModeSettings::default()
                },
            },
            GameModeType::Marathon => GameMode {
                kind,
                name: "Marathon".into(),
                description: "Automatic playlist with no pauses".into(),
                settings: GameModeSettings {
                    auto_next: Some(true),
                    points_correct: Some(8),
                    points_wrong: Some(3),
                    ..GameModeSettings::default()
                },
            },
            GameModeType::Teams => GameMode {
                kind,
                name: "Teams".into(),
                description: "Team against team".into(),
                settings: GameModeSettings {
                    teams_enabled: Some(true),
                    points_correct: Some(12),
                    points_wrong: Some(4),
                    ..GameModeSettings::default()
                },
            },
        }
    }
}

/// Host-driven countdown state. Mutated only by the host; read-only elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameTimer {
    /// Whether the countdown is running.
    #[serde(default)]
    pub is_active: bool,
    /// Remaining seconds, possibly fractional.
    pub time_left: f64,
    /// Initial seconds the countdown started from.
    pub total_time: f64,
}

/// Which side of the handshake a description belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Host-produced connection offer.
    Offer,
    /// Listener-produced connection answer.
    Answer,
}

/// A session description exchanged through the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    /// Offer or answer.
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// Raw SDP payload.
    pub sdp: String,
}

/// One discovered network candidate for the direct media channel.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Raw candidate line.
    pub candidate: String,
    /// Media stream identification tag, when present.
    pub sdp_mid: Option<String>,
    /// Media description index, when present.
    pub sdp_m_line_index: Option<u32>,
}

/// Handshake transport scoped per room; overwritten on each new negotiation.
///
/// Candidates are append-only lists per side so none emitted before the peer
/// attaches are lost; each subscriber drains them through its own cursor.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignalingEnvelope {
    /// Host-produced offer, if published.
    pub offer: Option<SessionDescription>,
    /// Listener-produced answer, if published.
    pub answer: Option<SessionDescription>,
    /// Candidates discovered by the host, in emission order.
    #[serde(default)]
    pub host_candidates: Vec<IceCandidate>,
    /// Candidates discovered by the listener, in emission order.
    #[serde(default)]
    pub client_candidates: Vec<IceCandidate>,
}

impl SignalingEnvelope {
    /// Whether nothing has been negotiated yet.
    pub fn is_empty(&self) -> bool {
        self.offer.is_none()
            && self.answer.is_none()
            && self.host_candidates.is_empty()
            && self.client_candidates.is_empty()
    }
}

/// Store path of a room.
pub fn room_path(code: &str) -> String {
    format!("rooms/{code}")
}

/// Store path of one player entry.
pub fn player_path(code: &str, player_id: &str) -> String {
    format!("rooms/{code}/players/{player_id}")
}

/// Store path of the round lock.
pub fn winner_info_path(code: &str) -> String {
    format!("rooms/{code}/winnerInfo")
}

/// Store path of the played-songs list.
pub fn played_songs_path(code: &str) -> String {
    format!("rooms/{code}/playedSongs")
}

/// Store path of the signaling envelope.
pub fn signaling_path(code: &str) -> String {
    format!("rooms/{code}/signaling")
}

/// Store path of one signaling field (`offer`, `answer`, candidate lists).
pub fn signaling_field_path(code: &str, field: &str) -> String {
    format!("rooms/{code}/signaling/{field}")
}
