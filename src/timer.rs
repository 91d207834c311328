//! Host-driven countdown with per-client local extrapolation.
//!
//! The host writes `{isActive, timeLeft, totalTime}` once when starting and
//! `null` when stopping; nothing in between. Each client that observes a
//! running timer drives its own decrement loop at the configured tick and
//! never re-reads `timeLeft` from the store, so independent clients can
//! disagree by up to one tick period plus delivery latency. That drift is an
//! accepted bound, not corrected.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::model::GameTimer;

/// Local countdown state fed from store snapshots.
pub struct TimerSynchronizer {
    tick: Duration,
    state: watch::Sender<Option<GameTimer>>,
    expired_tx: mpsc::UnboundedSender<()>,
    expired_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    last_observed: Mutex<Option<GameTimer>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TimerSynchronizer {
    /// Build a synchronizer ticking at the given resolution.
    pub fn new(tick: Duration) -> Self {
        let (state, _) = watch::channel(None);
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        Self {
            tick,
            state,
            expired_tx,
            expired_rx: Mutex::new(Some(expired_rx)),
            last_observed: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Watch the locally extrapolated countdown value.
    pub fn watch(&self) -> watch::Receiver<Option<GameTimer>> {
        self.state.subscribe()
    }

    /// Latest locally extrapolated countdown value.
    pub fn current(&self) -> Option<GameTimer> {
        self.state.borrow().clone()
    }

    /// Take the expiration channel. Yields one message each time a local
    /// countdown reaches zero; the host session reacts by stopping the timer
    /// in the store, which clears it for every subscriber.
    pub fn take_expirations(&self) -> Option<mpsc::UnboundedReceiver<()>> {
        self.expired_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Feed the store-observed timer value from the latest room snapshot.
    ///
    /// A running timer starts the local loop from the observed `timeLeft`;
    /// re-observing the identical value (every room snapshot redelivers it)
    /// leaves the running loop untouched. `None` or an inactive value stops
    /// the loop and clears the local state.
    pub fn observe(&self, timer: Option<GameTimer>) {
        let running = timer.filter(|timer| timer.is_active);

        {
            let mut last = self
                .last_observed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *last == running {
                return;
            }
            *last = running.clone();
        }

        self.stop_task();

        let Some(observed) = running else {
            self.state.send_replace(None);
            return;
        };

        debug!(total = observed.total_time, "local countdown started");
        self.state.send_replace(Some(observed.clone()));

        let tick = self.tick;
        let state = self.state.clone();
        let expired = self.expired_tx.clone();
        let handle = tokio::spawn(async move {
            let mut local = observed;
            let step = tick.as_secs_f64();
            let mut interval = tokio::time::interval(tick);
            // The first tick of a tokio interval completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                local.time_left = (local.time_left - step).max(0.0);
                state.send_replace(Some(local.clone()));
                if local.time_left <= 0.0 {
                    let _ = expired.send(());
                    break;
                }
            }
        });

        let mut task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *task = Some(handle);
    }

    fn stop_task(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for TimerSynchronizer {
    fn drop(&mut self) {
        self.stop_task();
    }
}
