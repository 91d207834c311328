//! Audio-relay signaling over the room's `signaling` field.
//!
//! The store is the handshake transport: the host publishes an offer, each
//! listener answers, and both sides exchange network candidates through
//! append-only per-side lists drained with a local cursor, so candidates
//! emitted before the peer attaches are never lost.
//!
//! The platform media engine (peer connection, capture device, playback) sits
//! behind [`MediaEndpoint`] and is injected by the embedder; this module only
//! drives the store side of the negotiation.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    config::AppConfig,
    error::{RoomError, RoomResult, SignalingFailure},
    model::{IceCandidate, SessionDescription, SignalingEnvelope, signaling_field_path, signaling_path},
    store::{KeyValueStore, TransactionVerdict},
};

/// Result alias for media-endpoint operations.
pub type SignalingResult<T> = Result<T, SignalingFailure>;

/// Opaque handle to a platform audio source feeding the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSource {
    /// Platform identifier of the source (device, element, or track group).
    pub id: String,
}

/// Platform media engine driven by the coordinator.
///
/// Implementations wrap whatever peer-connection and capture machinery the
/// platform provides. `replace_outgoing_source` must remove the existing
/// senders before attaching the new source's tracks, so a source switch never
/// duplicates audio. `close` must release the capture device and is safe to
/// call more than once.
pub trait MediaEndpoint: Send + Sync {
    /// Provide the fixed public reflection servers used for candidate discovery.
    fn set_reflection_servers(&self, servers: Vec<String>) -> BoxFuture<'static, SignalingResult<()>>;
    /// Acquire the local audio capture source. Host side only.
    fn capture_audio(&self) -> BoxFuture<'static, SignalingResult<AudioSource>>;
    /// Attach (or replace) the outgoing audio source.
    fn replace_outgoing_source(&self, source: AudioSource) -> BoxFuture<'static, SignalingResult<()>>;
    /// Produce a connection offer describing the outgoing tracks.
    fn create_offer(&self) -> BoxFuture<'static, SignalingResult<SessionDescription>>;
    /// Apply a remote offer and produce the matching answer.
    fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> BoxFuture<'static, SignalingResult<SessionDescription>>;
    /// Complete the handshake with the remote answer.
    fn accept_answer(&self, answer: SessionDescription) -> BoxFuture<'static, SignalingResult<()>>;
    /// Apply a remote network candidate.
    fn add_remote_candidate(&self, candidate: IceCandidate) -> BoxFuture<'static, SignalingResult<()>>;
    /// Subscribe to locally discovered candidates.
    fn local_candidates(&self) -> broadcast::Receiver<IceCandidate>;
    /// Close the connection and release the capture device. Idempotent.
    fn close(&self) -> BoxFuture<'static, SignalingResult<()>>;
}

/// Which end of the relay this coordinator drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRole {
    /// Captures audio and offers the channel.
    Host,
    /// Answers the offer and plays the inbound track.
    Listener,
}

/// Store-side coordinator for one directed host-to-listener audio channel.
pub struct AudioRelay {
    code: String,
    role: RelayRole,
    store: Arc<dyn KeyValueStore>,
    endpoint: Arc<dyn MediaEndpoint>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl AudioRelay {
    /// Start the negotiation for the given role.
    ///
    /// The host captures audio, publishes its offer, and awaits the answer;
    /// a listener awaits the offer and publishes its answer. Both sides pump
    /// local candidates out and drain the peer's list.
    pub async fn start(
        store: Arc<dyn KeyValueStore>,
        endpoint: Arc<dyn MediaEndpoint>,
        config: &AppConfig,
        code: &str,
        role: RelayRole,
    ) -> RoomResult<Self> {
        endpoint
            .set_reflection_servers(config.stun_servers.clone())
            .await?;

        let relay = Self {
            code: code.to_owned(),
            role,
            store,
            endpoint,
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        };

        match role {
            RelayRole::Host => relay.start_host().await?,
            RelayRole::Listener => relay.start_listener().await?,
        }
        Ok(relay)
    }

    async fn start_host(&self) -> RoomResult<()> {
        let source = self.endpoint.capture_audio().await?;
        self.endpoint.replace_outgoing_source(source).await?;
        let offer = self.endpoint.create_offer().await?;

        // A fresh envelope overwrites any previous negotiation for this room.
        let envelope = SignalingEnvelope {
            offer: Some(offer),
            ..SignalingEnvelope::default()
        };
        let payload = serde_json::to_value(&envelope)
            .map_err(|err| SignalingFailure::Negotiation(err.to_string()))?;
        self.store
            .write(&signaling_path(&self.code), payload)
            .await?;

        self.spawn_answer_watch();
        self.spawn_candidate_pump("hostCandidates");
        self.spawn_candidate_drain("clientCandidates");
        Ok(())
    }

    async fn start_listener(&self) -> RoomResult<()> {
        self.spawn_offer_watch();
        self.spawn_candidate_pump("clientCandidates");
        self.spawn_candidate_drain("hostCandidates");
        Ok(())
    }

    /// Replace the outgoing audio with a freshly supplied source.
    ///
    /// Used when the host switches the currently playing track; the endpoint
    /// contract guarantees existing senders are removed first.
    pub async fn set_audio_source(&self, source: AudioSource) -> RoomResult<()> {
        if self.role != RelayRole::Host {
            return Err(SignalingFailure::Negotiation(
                "only the host streams audio".into(),
            )
            .into());
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SignalingFailure::Closed.into());
        }
        self.endpoint.replace_outgoing_source(source).await?;
        Ok(())
    }

    /// Tear down the relay: stop the background pumps, close the connection,
    /// and release the capture device. Safe to call repeatedly.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
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

        if let Err(err) = self.endpoint.close().await {
            warn!(code = %self.code, error = %err, "media endpoint close failed");
        }
    }

    /// Await the host answer and complete the handshake.
    fn spawn_answer_watch(&self) {
        let store = self.store.clone();
        let endpoint = self.endpoint.clone();
        let path = signaling_field_path(&self.code, "answer");
        let code = self.code.clone();
        self.push_task(tokio::spawn(async move {
            let mut subscription = match store.subscribe(&path).await {
                Ok(subscription) => subscription,
                Err(err) => {
                    warn!(code, error = %err, "answer subscription failed");
                    return;
                }
            };
            while let Some(snapshot) = subscription.next_snapshot().await {
                let Some(value) = snapshot else { continue };
                let answer: SessionDescription = match serde_json::from_value(value) {
                    Ok(answer) => answer,
                    Err(err) => {
                        warn!(code, error = %err, "discarding malformed answer");
                        continue;
                    }
                };
                match endpoint.accept_answer(answer).await {
                    Ok(()) => {
                        debug!(code, "handshake completed");
                        break;
                    }
                    Err(err) => warn!(code, error = %err, "failed to apply answer"),
                }
            }
        }));
    }

    /// Await the offer, produce the answer, and publish it. Re-answers when
    /// the host renegotiates with a new offer.
    fn spawn_offer_watch(&self) {
        let store = self.store.clone();
        let endpoint = self.endpoint.clone();
        let offer_path = signaling_field_path(&self.code, "offer");
        let answer_path = signaling_field_path(&self.code, "answer");
        let code = self.code.clone();
        self.push_task(tokio::spawn(async move {
            let mut subscription = match store.subscribe(&offer_path).await {
                Ok(subscription) => subscription,
                Err(err) => {
                    warn!(code, error = %err, "offer subscription failed");
                    return;
                }
            };
            let mut last_offer = None;
            while let Some(snapshot) = subscription.next_snapshot().await {
                let Some(value) = snapshot else { continue };
                let offer: SessionDescription = match serde_json::from_value(value) {
                    Ok(offer) => offer,
                    Err(err) => {
                        warn!(code, error = %err, "discarding malformed offer");
                        continue;
                    }
                };
                if last_offer.as_ref() == Some(&offer) {
                    continue;
                }
                last_offer = Some(offer.clone());

                let answer = match endpoint.accept_offer(offer).await {
                    Ok(answer) => answer,
                    Err(err) => {
                        warn!(code, error = %err, "failed to answer offer");
                        continue;
                    }
                };
                let payload = match serde_json::to_value(&answer) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(code, error = %err, "failed to encode answer");
                        continue;
                    }
                };
                if let Err(err) = store.write(&answer_path, payload).await {
                    warn!(code, error = %err, "failed to publish answer");
                }
            }
        }));
    }

    /// Append every locally discovered candidate to this side's list.
    fn spawn_candidate_pump(&self, field: &str) {
        let store = self.store.clone();
        let mut candidates = self.endpoint.local_candidates();
        let path = signaling_field_path(&self.code, field);
        let code = self.code.clone();
        self.push_task(tokio::spawn(async move {
            loop {
                let candidate = match candidates.recv().await {
                    Ok(candidate) => candidate,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(code, skipped, "candidate pump lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let Err(err) = append_candidate(store.as_ref(), &path, candidate).await {
                    warn!(code, error = %err, "failed to publish candidate");
                }
            }
        }));
    }

    /// Apply the peer's candidates in order, resuming from a local cursor so
    /// entries published before this side attached are still delivered.
    fn spawn_candidate_drain(&self, field: &str) {
        let store = self.store.clone();
        let endpoint = self.endpoint.clone();
        let path = signaling_field_path(&self.code, field);
        let code = self.code.clone();
        self.push_task(tokio::spawn(async move {
            let mut subscription = match store.subscribe(&path).await {
                Ok(subscription) => subscription,
                Err(err) => {
                    warn!(code, error = %err, "candidate subscription failed");
                    return;
                }
            };
            let mut cursor = 0usize;
            while let Some(snapshot) = subscription.next_snapshot().await {
                let list: Vec<IceCandidate> = match snapshot {
                    Some(value) => match serde_json::from_value(value) {
                        Ok(list) => list,
                        Err(err) => {
                            warn!(code, error = %err, "discarding malformed candidate list");
                            continue;
                        }
                    },
                    // A new negotiation reset the envelope.
                    None => {
                        cursor = 0;
                        continue;
                    }
                };
                while cursor < list.len() {
                    let candidate = list[cursor].clone();
                    cursor += 1;
                    if let Err(err) = endpoint.add_remote_candidate(candidate).await {
                        warn!(code, error = %err, "failed to apply remote candidate");
                    }
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

/// Append one candidate to the ordered per-side list.
async fn append_candidate(
    store: &dyn KeyValueStore,
    path: &str,
    candidate: IceCandidate,
) -> RoomResult<()> {
    store
        .transactional_update(
            path,
            Box::new(move |current| {
                let mut list: Vec<IceCandidate> = current
                    .and_then(|value| serde_json::from_value(value).ok())
                    .unwrap_or_default();
                list.push(candidate);
                TransactionVerdict::Commit(json!(list))
            }),
        )
        .await
        .map_err(RoomError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::model::SdpKind;
    use crate::store::memory::MemoryStore;

    use super::*;

    /// Scripted endpoint recording every call the coordinator makes.
    struct FakeEndpoint {
        candidates_tx: broadcast::Sender<IceCandidate>,
        outgoing: Mutex<Vec<AudioSource>>,
        remote_candidates: Mutex<Vec<IceCandidate>>,
        answers: Mutex<Vec<SessionDescription>>,
        close_calls: Mutex<u32>,
    }

    impl FakeEndpoint {
        fn new() -> Arc<Self> {
            let (candidates_tx, _) = broadcast::channel(16);
            Arc::new(Self {
                candidates_tx,
                outgoing: Mutex::new(Vec::new()),
                remote_candidates: Mutex::new(Vec::new()),
                answers: Mutex::new(Vec::new()),
                close_calls: Mutex::new(0),
            })
        }

        fn emit_candidate(&self, line: &str) {
            let _ = self.candidates_tx.send(IceCandidate {
                candidate: line.into(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            });
        }
    }

    impl MediaEndpoint for FakeEndpoint {
        fn set_reflection_servers(
            &self,
            _servers: Vec<String>,
        ) -> BoxFuture<'static, SignalingResult<()>> {
            Box::pin(async { Ok(()) })
        }

        fn capture_audio(&self) -> BoxFuture<'static, SignalingResult<AudioSource>> {
            Box::pin(async {
                Ok(AudioSource {
                    id: "capture-0".into(),
                })
            })
        }

        fn replace_outgoing_source(
            &self,
            source: AudioSource,
        ) -> BoxFuture<'static, SignalingResult<()>> {
            self.outgoing.lock().unwrap().push(source);
            Box::pin(async { Ok(()) })
        }

        fn create_offer(&self) -> BoxFuture<'static, SignalingResult<SessionDescription>> {
            Box::pin(async {
                Ok(SessionDescription {
                    kind: SdpKind::Offer,
                    sdp: "sdp-offer".into(),
                })
            })
        }

        fn accept_offer(
            &self,
            offer: SessionDescription,
        ) -> BoxFuture<'static, SignalingResult<SessionDescription>> {
            Box::pin(async move {
                assert_eq!(offer.kind, SdpKind::Offer);
                Ok(SessionDescription {
                    kind: SdpKind::Answer,
                    sdp: "sdp-answer".into(),
                })
            })
        }

        fn accept_answer(
            &self,
            answer: SessionDescription,
        ) -> BoxFuture<'static, SignalingResult<()>> {
            self.answers.lock().unwrap().push(answer);
            Box::pin(async { Ok(()) })
        }

        fn add_remote_candidate(
            &self,
            candidate: IceCandidate,
        ) -> BoxFuture<'static, SignalingResult<()>> {
            self.remote_candidates.lock().unwrap().push(candidate);
            Box::pin(async { Ok(()) })
        }

        fn local_candidates(&self) -> broadcast::Receiver<IceCandidate> {
            self.candidates_tx.subscribe()
        }

        fn close(&self) -> BoxFuture<'static, SignalingResult<()>> {
            *self.close_calls.lock().unwrap() += 1;
            Box::pin(async { Ok(()) })
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn host_and_listener_complete_the_handshake() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let config = AppConfig::default();
        let host_end = FakeEndpoint::new();
        let listener_end = FakeEndpoint::new();

        let host = AudioRelay::start(
            store.clone(),
            host_end.clone(),
            &config,
            "1234",
            RelayRole::Host,
        )
        .await
        .unwrap();
        let listener = AudioRelay::start(
            store.clone(),
            listener_end.clone(),
            &config,
            "1234",
            RelayRole::Listener,
        )
        .await
        .unwrap();

        // Listener answers the stored offer, host applies the answer.
        let host_probe = host_end.clone();
        eventually(move || !host_probe.answers.lock().unwrap().is_empty()).await;
        let answer = host_end.answers.lock().unwrap()[0].clone();
        assert_eq!(answer.kind, SdpKind::Answer);

        // The host captured audio and attached it before offering.
        assert_eq!(host_end.outgoing.lock().unwrap().len(), 1);

        host.stop().await;
        listener.stop().await;
    }

    #[tokio::test]
    async fn candidates_published_before_the_peer_attaches_are_delivered() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let config = AppConfig::default();
        let host_end = FakeEndpoint::new();

        let host = AudioRelay::start(
            store.clone(),
            host_end.clone(),
            &config,
            "1234",
            RelayRole::Host,
        )
        .await
        .unwrap();

        // Discovered before any listener exists; the list must retain them.
        host_end.emit_candidate("candidate-a");
        host_end.emit_candidate("candidate-b");
        let mut stored = None;
        for _ in 0..200 {
            stored = store
                .read_once("rooms/1234/signaling/hostCandidates")
                .await
                .unwrap()
                .and_then(|value| value.as_array().map(|list| list.len()));
            if stored == Some(2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(stored, Some(2));

        let listener_end = FakeEndpoint::new();
        let listener = AudioRelay::start(
            store.clone(),
            listener_end.clone(),
            &config,
            "1234",
            RelayRole::Listener,
        )
        .await
        .unwrap();

        let probe = listener_end.clone();
        eventually(move || probe.remote_candidates.lock().unwrap().len() == 2).await;
        let received = listener_end.remote_candidates.lock().unwrap().clone();
        assert_eq!(received[0].candidate, "candidate-a");
        assert_eq!(received[1].candidate, "candidate-b");

        host.stop().await;
        listener.stop().await;
    }

    #[tokio::test]
    async fn set_audio_source_is_host_only_and_replaces_tracks() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let config = AppConfig::default();
        let host_end = FakeEndpoint::new();
        let host = AudioRelay::start(
            store.clone(),
            host_end.clone(),
            &config,
            "1234",
            RelayRole::Host,
        )
        .await
        .unwrap();

        host.set_audio_source(AudioSource {
            id: "track-2".into(),
        })
        .await
        .unwrap();
        let outgoing = host_end.outgoing.lock().unwrap().clone();
        assert_eq!(outgoing.last().unwrap().id, "track-2");

        let listener_end = FakeEndpoint::new();
        let listener = AudioRelay::start(
            store.clone(),
            listener_end.clone(),
            &config,
            "1234",
            RelayRole::Listener,
        )
        .await
        .unwrap();
        let err = listener
            .set_audio_source(AudioSource { id: "nope".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::Signaling(_)));

        host.stop().await;
        listener.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_closes_once() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let config = AppConfig::default();
        let host_end = FakeEndpoint::new();
        let host = AudioRelay::start(
            store.clone(),
            host_end.clone(),
            &config,
            "1234",
            RelayRole::Host,
        )
        .await
        .unwrap();

        host.stop().await;
        host.stop().await;
        assert_eq!(*host_end.close_calls.lock().unwrap(), 1);

        let err = host
            .set_audio_source(AudioSource { id: "late".into() })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RoomError::Signaling(SignalingFailure::Closed)
        ));
    }
}
