//! Session engine for a real-time multiplayer music blind-test.
//!
//! Rooms live in a replicated keyed store (`rooms/{code}/...`); every member
//! mutates through [`RoomRepository`] and observes through a subscription, so
//! the store is the single source of truth and the engine carries no session
//! state that cannot be rebuilt from a snapshot. [`RoomSession`] bundles the
//! per-member lifecycle: the room watch, the activity heartbeat, the local
//! countdown, and the domain commands. The host's audio reaches listeners
//! over a direct media channel negotiated by [`signaling::AudioRelay`]
//! through the same store.

pub mod config;
pub mod error;
pub mod model;
pub mod repository;
pub mod scoring;
pub mod session;
pub mod signaling;
pub mod store;
pub mod sweep;
pub mod timer;
pub mod validation;

pub use config::AppConfig;
pub use error::{RoomError, RoomResult, SignalingFailure};
pub use repository::RoomRepository;
pub use scoring::{AnswerOutcome, ScorePolicy, ScoreSettings};
pub use session::{RoomSession, RoomView, SessionEvent};
pub use signaling::{AudioRelay, AudioSource, MediaEndpoint, RelayRole};
pub use store::{KeyValueStore, StoreError, memory::MemoryStore};
pub use timer::TimerSynchronizer;
