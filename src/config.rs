//! Application-level configuration loading for session tunables.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

use crate::scoring::ScoreSettings;

/// Default location on disk where the engine looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "SONGBUZZ_CONFIG_PATH";

/// Rooms with no players are swept after this long without activity.
const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
/// How often a joined session refreshes `lastActivity`.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// How often the inactivity sweeper scans for dead rooms.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Resolution of the local countdown extrapolation loop.
const DEFAULT_TIMER_TICK: Duration = Duration::from_millis(100);
/// Attempts at drawing an unused 4-digit room code before giving up.
const DEFAULT_CODE_ATTEMPTS: u32 = 32;

/// Immutable runtime configuration shared across the engine.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Inactivity threshold after which an empty room is deleted.
    pub inactivity_timeout: Duration,
    /// Interval between `lastActivity` refreshes while joined.
    pub heartbeat_interval: Duration,
    /// Interval between inactivity sweep passes.
    pub sweep_interval: Duration,
    /// Local countdown tick period.
    pub timer_tick: Duration,
    /// Room-code collision retry budget.
    pub code_attempts: u32,
    /// Speed/streak scoring tunables.
    pub scoring: ScoreSettings,
    /// Public reflection servers offered to the media endpoint.
    pub stun_servers: Vec<String>,
}

impl AppConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let config: Self = raw.into();
                    info!(path = %path.display(), "loaded session config");
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            timer_tick: DEFAULT_TIMER_TICK,
            code_attempts: DEFAULT_CODE_ATTEMPTS,
            scoring: ScoreSettings::default(),
            stun_servers: default_stun_servers(),
        }
    }
}

/// JSON representation of the configuration file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    inactivity_timeout_minutes: Option<u64>,
    heartbeat_interval_seconds: Option<u64>,
    sweep_interval_seconds: Option<u64>,
    timer_tick_millis: Option<u64>,
    room_code_attempts: Option<u32>,
    scoring: Option<ScoreSettings>,
    stun_servers: Option<Vec<String>>,
}

impl From<RawConfig> for AppConfig {
    fn from(raw: RawConfig) -> Self {
        let defaults = AppConfig::default();
        Self {
            inactivity_timeout: raw
                .inactivity_timeout_minutes
                .map(|minutes| Duration::from_secs(minutes * 60))
                .unwrap_or(defaults.inactivity_timeout),
            heartbeat_interval: raw
                .heartbeat_interval_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            sweep_interval: raw
                .sweep_interval_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            timer_tick: raw
                .timer_tick_millis
                .map(Duration::from_millis)
                .unwrap_or(defaults.timer_tick),
            code_attempts: raw.room_code_attempts.unwrap_or(defaults.code_attempts),
            scoring: raw.scoring.unwrap_or(defaults.scoring),
            stun_servers: raw.stun_servers.unwrap_or(defaults.stun_servers),
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Fixed pair of public reflection servers used for candidate discovery.
fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".into(),
        "stun:stun1.l.google.com:19302".into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_config_overrides_only_present_fields() {
        let raw: RawConfig = serde_json::from_str(
            r#"{ "inactivityTimeoutMinutes": 60, "scoring": { "penaltyPoints": 10 } }"#,
        )
        .unwrap();
        let config: AppConfig = raw.into();

        assert_eq!(config.inactivity_timeout, Duration::from_secs(3600));
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(config.scoring.penalty_points, 10);
        // Unlisted scoring fields keep their defaults thanks to serde(default).
        assert_eq!(config.scoring.base_points, 100);
    }
}
