//! WebRTC Transport
//!
//! Eine `RTCPeerConnection` pro Anruf. SDP und ICE Candidates laufen über
//! den Signaling-Server, Audio direkt zwischen den Peers.
//!
//! Audio-Pfad:
//! - Mikrofon → Opus-Encoder → ein gemeinsamer Track für alle Anrufe
//! - Remote-Track → Opus-Decoder → Mixer → Lautsprecher

use super::audio::{CaptureFrames, MicrophoneCapture, SpeakerPlayback, FRAME_DURATION, SAMPLE_RATE};
use super::codec::{VoiceDecoder, VoiceEncoder};
use super::{
    CallHandle, CallTransport, InboundCallRequest, LocalStream, RemoteStream, StreamRegistry,
    TransportError, TransportEvent,
};
use crate::config::TurnServer;
use crate::crypto::LocalIdentity;
use crate::signaling::{SignalingClient, SignalingError, SignalingEvent};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use url::Url;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}

fn rtc_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::WebRtc(e.to_string())
}

// ============================================================================
// AUDIO PIPELINE
// ============================================================================

/// Opus-Track, der an jede Peer Connection gehängt wird
fn opus_track() -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: SAMPLE_RATE,
            channels: 1,
            ..Default::default()
        },
        "audio".to_string(),
        "devverse".to_string(),
    ))
}

/// Kodiert Mikrofon-Frames und schreibt sie in den Track
///
/// Bei Mute kommen keine Frames an, es wird nichts gesendet.
async fn send_microphone(frames: CaptureFrames, track: Arc<TrackLocalStaticSample>) {
    let mut encoder = match VoiceEncoder::new() {
        Ok(encoder) => encoder,
        Err(e) => {
            tracing::error!("Microphone audio is not sent: {}", e);
            return;
        }
    };

    let mut ticker = tokio::time::interval(FRAME_DURATION);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        while let Some(frame) = frames.read_frame() {
            let packet = match encoder.encode(&frame) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::warn!("{}", e);
                    continue;
                }
            };
            let sample = Sample {
                data: packet.into(),
                duration: FRAME_DURATION,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                tracing::debug!("Failed to write audio sample: {}", e);
            }
        }
    }
}

/// Dekodiert einen Remote-Track bis zu seinem Ende
///
/// Ohne Lautsprecher werden die Pakete nur gelesen und verworfen.
async fn play_remote_track(
    track: Arc<TrackRemote>,
    call_id: Uuid,
    playback: Option<Arc<SpeakerPlayback>>,
) {
    let mut decoder = match playback {
        Some(_) => match VoiceDecoder::new() {
            Ok(decoder) => Some(decoder),
            Err(e) => {
                tracing::error!("Remote audio of call {} is dropped: {}", call_id, e);
                None
            }
        },
        None => None,
    };

    while let Ok((packet, _)) = track.read_rtp().await {
        let (Some(playback), Some(decoder)) = (playback.as_ref(), decoder.as_mut()) else {
            continue;
        };
        match decoder.decode(&packet.payload) {
            Ok(samples) => playback.queue(call_id, &samples),
            Err(e) => tracing::debug!("Dropping audio packet on call {}: {}", call_id, e),
        }
    }

    if let Some(playback) = playback {
        playback.remove(&call_id);
    }
}

/// Mikrofon samt Encoder-Task eines `LocalStream`
struct LocalMedia {
    capture: MicrophoneCapture,
    track: Arc<TrackLocalStaticSample>,
    sender: JoinHandle<()>,
}

impl LocalMedia {
    fn stop(mut self) {
        self.sender.abort();
        self.capture.stop();
    }
}

// ============================================================================
// WEBRTC TRANSPORT
// ============================================================================

struct PeerLink {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
}

struct RtcInner {
    signaling_url: Url,
    ice_servers: Vec<RTCIceServer>,
    signaling: RwLock<Option<Arc<SignalingClient>>>,
    links: Mutex<HashMap<Uuid, PeerLink>>,
    registry: StreamRegistry,
    local_media: Mutex<HashMap<Uuid, LocalMedia>>,
    /// Startet mit dem ersten Remote-Track
    playback: Mutex<Option<Arc<SpeakerPlayback>>>,
    event_tx: broadcast::Sender<TransportEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// WebRTC Call Transport
pub struct WebRtcTransport {
    inner: Arc<RtcInner>,
}

impl WebRtcTransport {
    pub fn new(signaling_url: Url, turn: Option<TurnServer>) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        let mut ice_servers = default_ice_servers();
        if let Some(turn) = turn {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.url],
                username: turn.username,
                credential: turn.credential,
                ..Default::default()
            });
        }

        Self {
            inner: Arc::new(RtcInner {
                signaling_url,
                ice_servers,
                signaling: RwLock::new(None),
                links: Mutex::new(HashMap::new()),
                registry: StreamRegistry::new(),
                local_media: Mutex::new(HashMap::new()),
                playback: Mutex::new(None),
                event_tx,
                pump: Mutex::new(None),
            }),
        }
    }

    fn signaling(&self) -> Result<Arc<SignalingClient>, TransportError> {
        self.inner
            .signaling
            .read()
            .clone()
            .ok_or(TransportError::NotRegistered)
    }

    fn local_track(&self, local: &LocalStream) -> Result<Arc<TrackLocalStaticSample>, TransportError> {
        self.inner
            .local_media
            .lock()
            .get(&local.id())
            .map(|media| Arc::clone(&media.track))
            .ok_or_else(|| TransportError::MediaAccessDenied("local audio was released".to_string()))
    }

    /// Erstellt eine Peer Connection für einen Anruf
    async fn create_peer_connection(
        &self,
        call_id: Uuid,
        peer_id: &str,
    ) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_err)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(rtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.inner.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(rtc_err)?);
        Self::setup_handlers(Arc::downgrade(&self.inner), &pc, call_id, peer_id.to_string());

        Ok(pc)
    }

    /// Registriert Event Handler für die Peer Connection
    fn setup_handlers(
        inner: Weak<RtcInner>,
        pc: &Arc<RTCPeerConnection>,
        call_id: Uuid,
        peer_id: String,
    ) {
        let weak = inner.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Call {} connection state: {:?}", call_id, s);

            if matches!(
                s,
                RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed
            ) {
                if let Some(inner) = weak.upgrade() {
                    inner.close_link(call_id, true);
                }
            }

            Box::pin(async {})
        }));

        let weak = inner.clone();
        let ice_peer = peer_id.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let client = weak
                .upgrade()
                .and_then(|inner| inner.signaling.read().clone());
            let peer_id = ice_peer.clone();

            Box::pin(async move {
                let (Some(candidate), Some(client)) = (candidate, client) else {
                    return;
                };
                let Ok(json) = candidate.to_json() else {
                    return;
                };
                let Ok(candidate_str) = serde_json::to_string(&json) else {
                    return;
                };
                if let Err(e) = client
                    .send_ice_candidate(&peer_id, &call_id.to_string(), candidate_str)
                    .await
                {
                    tracing::warn!("Failed to send ICE candidate to {}: {}", peer_id, e);
                }
            })
        }));

        let weak = inner;
        pc.on_track(Box::new(move |track, _, _| {
            let inner = weak.upgrade();
            let peer_id = peer_id.clone();

            Box::pin(async move {
                let Some(inner) = inner else {
                    return;
                };
                tracing::info!("Received track from {}: {:?}", peer_id, track.codec());

                let stream = RemoteStream {
                    id: track.id(),
                    peer_id,
                };
                inner.registry.insert(call_id, stream.clone());
                let _ = inner
                    .event_tx
                    .send(TransportEvent::StreamAttached { call_id, stream });

                let playback = inner.speaker().await;
                drop(inner);

                play_remote_track(track, call_id, playback).await;
            })
        }));
    }

    async fn add_audio_track(
        pc: &Arc<RTCPeerConnection>,
        track: Arc<TrackLocalStaticSample>,
    ) -> Result<(), TransportError> {
        pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_err)?;
        Ok(())
    }

    async fn handle_signaling_event(inner: &Arc<RtcInner>, event: SignalingEvent) {
        match event {
            SignalingEvent::IncomingCall {
                from_peer_id,
                call_id,
                sdp,
            } => {
                let Ok(call_id) = Uuid::parse_str(&call_id) else {
                    tracing::warn!("Ignoring offer with invalid call id from {}", from_peer_id);
                    return;
                };
                tracing::info!("Incoming call {} from {}", call_id, from_peer_id);
                let _ = inner
                    .event_tx
                    .send(TransportEvent::IncomingCall(InboundCallRequest {
                        call_id,
                        peer_id: from_peer_id,
                        sdp,
                    }));
            }

            SignalingEvent::AnswerReceived {
                from_peer_id,
                call_id,
                sdp,
            } => {
                let Some(pc) = inner.link_pc(&call_id) else {
                    tracing::debug!("Answer for unknown call {} from {}", call_id, from_peer_id);
                    return;
                };
                let result = match RTCSessionDescription::answer(sdp) {
                    Ok(answer) => pc.set_remote_description(answer).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    tracing::error!("Failed to handle answer from {}: {}", from_peer_id, e);
                }
            }

            SignalingEvent::IceCandidateReceived {
                from_peer_id,
                call_id,
                candidate,
            } => {
                let Some(pc) = inner.link_pc(&call_id) else {
                    return;
                };
                match serde_json::from_str::<RTCIceCandidateInit>(&candidate) {
                    Ok(init) => {
                        if let Err(e) = pc.add_ice_candidate(init).await {
                            tracing::error!("Failed to add ICE candidate from {}: {}", from_peer_id, e);
                        }
                    }
                    Err(e) => tracing::warn!("Malformed ICE candidate from {}: {}", from_peer_id, e),
                }
            }

            SignalingEvent::CallRejected {
                by_peer_id,
                call_id,
                reason,
            } => {
                tracing::info!("Call {} rejected by {} ({:?})", call_id, by_peer_id, reason);
                if let Ok(call_id) = Uuid::parse_str(&call_id) {
                    inner.close_link(call_id, true);
                }
            }

            SignalingEvent::CallEnded {
                by_peer_id,
                call_id,
            } => {
                tracing::info!("Call {} ended by {}", call_id, by_peer_id);
                if let Ok(call_id) = Uuid::parse_str(&call_id) {
                    inner.close_link(call_id, true);
                }
            }

            SignalingEvent::Disconnected => {
                tracing::warn!("Signaling connection lost; established calls keep running");
            }

            SignalingEvent::Error { code, message } => {
                tracing::warn!("Signaling error {}: {}", code, message);
            }

            SignalingEvent::Connected | SignalingEvent::Registered { .. } => {}
        }
    }
}

impl RtcInner {
    fn link_pc(&self, call_id: &str) -> Option<Arc<RTCPeerConnection>> {
        let call_id = Uuid::parse_str(call_id).ok()?;
        self.links.lock().get(&call_id).map(|link| Arc::clone(&link.pc))
    }

    /// Lautsprecher, beim ersten Aufruf geöffnet
    async fn speaker(&self) -> Option<Arc<SpeakerPlayback>> {
        let existing = self.playback.lock().clone();
        if existing.is_some() {
            return existing;
        }

        match tokio::task::spawn_blocking(SpeakerPlayback::start).await {
            Ok(Ok(playback)) => {
                let mut slot = self.playback.lock();
                Some(Arc::clone(slot.get_or_insert(Arc::new(playback))))
            }
            Ok(Err(e)) => {
                tracing::warn!("No speaker output, remote audio is dropped: {}", e);
                None
            }
            Err(e) => {
                tracing::warn!("Speaker setup panicked: {}", e);
                None
            }
        }
    }

    /// Entfernt die Verbindung eines Anrufs; `notify` meldet `CallClosed`
    fn close_link(&self, call_id: Uuid, notify: bool) -> Option<String> {
        self.registry.remove_call(call_id);
        if let Some(playback) = self.playback.lock().as_ref() {
            playback.remove(&call_id);
        }
        let link = self.links.lock().remove(&call_id)?;

        let pc = Arc::clone(&link.pc);
        tokio::spawn(async move {
            let _ = pc.close().await;
        });

        if notify {
            let _ = self.event_tx.send(TransportEvent::CallClosed {
                call_id,
                peer_id: link.peer_id.clone(),
            });
        }
        Some(link.peer_id)
    }
}

#[async_trait]
impl CallTransport for WebRtcTransport {
    async fn acquire_local_audio(&self) -> Result<LocalStream, TransportError> {
        let stream = LocalStream::new();
        let enabled = stream.enabled_flag();

        // Geräte-Öffnung blockiert
        let capture = tokio::task::spawn_blocking(move || MicrophoneCapture::start(enabled))
            .await
            .map_err(|e| TransportError::MediaAccessDenied(e.to_string()))?
            .map_err(|e| TransportError::MediaAccessDenied(e.to_string()))?;

        let track = opus_track();
        let sender = tokio::spawn(send_microphone(capture.frames(), Arc::clone(&track)));

        self.inner.local_media.lock().insert(
            stream.id(),
            LocalMedia {
                capture,
                track,
                sender,
            },
        );
        Ok(stream)
    }

    fn release_local_audio(&self, stream: &LocalStream) {
        stream.stop();
        let media = self.inner.local_media.lock().remove(&stream.id());
        if let Some(media) = media {
            media.stop();
        }
    }

    async fn create_local_identity(&self, user_id: &str) -> Result<(), TransportError> {
        let identity = LocalIdentity::load_or_create(user_id)
            .map_err(|e| SignalingError::RegistrationFailed(e.to_string()))?;

        let mut client = SignalingClient::new(self.inner.signaling_url.clone(), Arc::new(identity));
        let mut events = client.subscribe();

        match client.connect_and_register().await {
            Ok(peer_id) => tracing::info!("Reachable as {}", peer_id),
            Err(SignalingError::PeerIdTaken(_)) => {
                client.disconnect();
                return Err(TransportError::IdentityConflict(user_id.to_string()));
            }
            Err(e) => {
                client.disconnect();
                return Err(e.into());
            }
        }

        let client = Arc::new(client);
        client.start_heartbeat();
        *self.inner.signaling.write() = Some(Arc::clone(&client));

        let weak = Arc::downgrade(&self.inner);
        let pump = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        Self::handle_signaling_event(&inner, event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Signaling event pump lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(old) = self.inner.pump.lock().replace(pump) {
            old.abort();
        }
        Ok(())
    }

    async fn release_local_identity(&self) {
        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }

        let call_ids: Vec<Uuid> = self.inner.links.lock().keys().copied().collect();
        for call_id in call_ids {
            self.inner.close_link(call_id, false);
        }
        self.inner.registry.clear();
        self.inner.playback.lock().take();

        let client = self.inner.signaling.write().take();
        if let Some(client) = client {
            client.disconnect();
        }
    }

    async fn dial(&self, peer_id: &str, local: &LocalStream) -> Result<CallHandle, TransportError> {
        let client = self.signaling()?;
        let track = self.local_track(local)?;
        let call_id = Uuid::new_v4();

        let pc = self.create_peer_connection(call_id, peer_id).await?;
        Self::add_audio_track(&pc, track).await?;

        let offer = pc.create_offer(None).await.map_err(rtc_err)?;
        pc.set_local_description(offer.clone()).await.map_err(rtc_err)?;

        self.inner.links.lock().insert(
            call_id,
            PeerLink {
                peer_id: peer_id.to_string(),
                pc,
            },
        );

        if let Err(e) = client
            .send_offer(peer_id, &call_id.to_string(), offer.sdp)
            .await
        {
            self.inner.close_link(call_id, false);
            return Err(e.into());
        }

        Ok(CallHandle::outbound(call_id, peer_id))
    }

    async fn answer(
        &self,
        request: InboundCallRequest,
        local: &LocalStream,
    ) -> Result<CallHandle, TransportError> {
        let client = self.signaling()?;
        let track = self.local_track(local)?;
        let call_id = request.call_id;

        let pc = self.create_peer_connection(call_id, &request.peer_id).await?;

        let offer = RTCSessionDescription::offer(request.sdp).map_err(rtc_err)?;
        pc.set_remote_description(offer).await.map_err(rtc_err)?;

        Self::add_audio_track(&pc, track).await?;

        let answer = pc.create_answer(None).await.map_err(rtc_err)?;
        pc.set_local_description(answer.clone()).await.map_err(rtc_err)?;

        self.inner.links.lock().insert(
            call_id,
            PeerLink {
                peer_id: request.peer_id.clone(),
                pc,
            },
        );

        if let Err(e) = client
            .send_answer(&request.peer_id, &call_id.to_string(), answer.sdp)
            .await
        {
            self.inner.close_link(call_id, false);
            return Err(e.into());
        }

        // Kam der Track schon während der Aushandlung, ist der Anruf aktiv
        let remote = self.inner.registry.for_call(call_id);
        Ok(CallHandle::inbound(call_id, request.peer_id, remote))
    }

    async fn decline(&self, request: InboundCallRequest) {
        let Ok(client) = self.signaling() else {
            return;
        };
        if let Err(e) = client
            .reject_call(
                &request.peer_id,
                &request.call_id.to_string(),
                Some("busy".to_string()),
            )
            .await
        {
            tracing::warn!("Failed to decline call from {}: {}", request.peer_id, e);
        }
    }

    async fn hang_up(&self, call: &CallHandle) {
        if self.inner.close_link(call.id, false).is_none() {
            return;
        }

        if let Ok(client) = self.signaling() {
            if let Err(e) = client.hangup(&call.peer_id, &call.id.to_string()).await {
                tracing::warn!("Failed to signal hangup to {}: {}", call.peer_id, e);
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.event_tx.subscribe()
    }

    fn remote_streams(&self) -> Vec<RemoteStream> {
        self.inner.registry.snapshot()
    }
}

impl Drop for WebRtcTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for WebRtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransport")
            .field("signaling_url", &self.inner.signaling_url.as_str())
            .field("calls", &self.inner.links.lock().len())
            .field("remote_streams", &self.inner.registry.len())
            .field("local_media", &self.inner.local_media.lock().len())
            .finish()
    }
}
