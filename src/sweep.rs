//! Periodic deletion of rooms abandoned past the inactivity threshold.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::{
    config::AppConfig,
    error::RoomResult,
    model::{Room, now_ms},
    repository::{RoomRepository, is_room_inactive},
    store::KeyValueStore,
};

/// Supervisor loop scanning for dead rooms at the configured interval.
///
/// Runs until the owning task is dropped. Each pass is independent; a failed
/// pass is logged and the next one starts on schedule.
pub async fn run_inactivity_sweep(store: Arc<dyn KeyValueStore>, config: Arc<AppConfig>) {
    let repository = RoomRepository::new(store, config.clone());
    let mut interval = tokio::time::interval(config.sweep_interval);
    // The first tick of a tokio interval completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        if let Err(err) = sweep_once(&repository, &config).await {
            warn!(error = %err, "inactivity sweep pass failed");
        }
    }
}

/// One sweep pass. Returns the number of rooms deleted.
pub async fn sweep_once(repository: &RoomRepository, config: &AppConfig) -> RoomResult<usize> {
    let Some(Value::Object(rooms)) = repository.store().read_once("rooms").await? else {
        return Ok(0);
    };

    let now = now_ms();
    let mut deleted = 0;
    for (code, value) in rooms {
        let room: Room = match serde_json::from_value(value) {
            Ok(room) => room,
            Err(err) => {
                // A partial entry cannot carry a live session; leaving it
                // would leak it forever since it can never look active.
                warn!(code, error = %err, "deleting undecodable room entry");
                repository.delete_room(&code).await?;
                deleted += 1;
                continue;
            }
        };
        if is_room_inactive(&room, now, config) {
            repository.delete_room(&code).await?;
            deleted += 1;
        }
    }

    if deleted > 0 {
        info!(deleted, "swept inactive rooms");
    }
    Ok(deleted)
}
