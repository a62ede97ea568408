//! Call Transport - Peer-to-Peer Audio-Anrufe
//!
//! Dieses Modul abstrahiert die Anruf-Bibliothek:
//! - Lokale Identität registrieren
//! - Mikrofon-Stream anfordern
//! - Anrufe aufbauen, annehmen und beenden
//! - Registry der Remote-Streams pro Peer
//!
//! Die Session-Logik kennt nur den Trait `CallTransport`. Es gibt zwei
//! Implementierungen: WebRTC für echte Anrufe und eine prozessinterne
//! Vermittlung für Demo und Tests.

mod audio;
mod codec;
mod loopback;
mod registry;
mod rtc;

pub use audio::{AudioError, MicrophoneCapture, SpeakerPlayback};
pub use codec::CodecError;
pub use loopback::{LoopbackStats, LoopbackTransport, Switchboard};
pub use registry::StreamRegistry;
pub use rtc::{default_ice_servers, WebRtcTransport};

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::signaling::SignalingError;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Microphone access denied: {0}")]
    MediaAccessDenied(String),

    #[error("Identity '{0}' is already registered elsewhere")]
    IdentityConflict(String),

    #[error("Peer {0} is unreachable")]
    CallUnreachable(String),

    #[error("Local identity is not registered")]
    NotRegistered,

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("WebRTC error: {0}")]
    WebRtc(String),
}

// ============================================================================
// CALL TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Anruf ist raus, Remote-Stream fehlt noch
    Connecting,
    /// Remote-Stream ist angekommen
    Active,
    Closed,
}

/// Audio-Stream der Gegenseite (opaque)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteStream {
    pub id: String,
    pub peer_id: String,
}

/// Eine Audio-Verbindung zu genau einem Peer
#[derive(Debug, Clone)]
pub struct CallHandle {
    pub id: Uuid,
    pub peer_id: String,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub remote_stream: Option<RemoteStream>,
}

impl CallHandle {
    pub fn outbound(id: Uuid, peer_id: impl Into<String>) -> Self {
        Self {
            id,
            peer_id: peer_id.into(),
            direction: CallDirection::Outbound,
            status: CallStatus::Connecting,
            remote_stream: None,
        }
    }

    /// Angenommener Anruf; `Active` nur mit bereits angekommenem Stream
    pub fn inbound(id: Uuid, peer_id: impl Into<String>, remote_stream: Option<RemoteStream>) -> Self {
        let status = if remote_stream.is_some() {
            CallStatus::Active
        } else {
            CallStatus::Connecting
        };
        Self {
            id,
            peer_id: peer_id.into(),
            direction: CallDirection::Inbound,
            status,
            remote_stream,
        }
    }
}

/// Eingehende Anruf-Anfrage, bis sie angenommen oder abgelehnt wird
#[derive(Debug, Clone)]
pub struct InboundCallRequest {
    pub call_id: Uuid,
    pub peer_id: String,
    /// SDP Offer (leer beim Loopback-Transport)
    pub sdp: String,
}

/// Lokaler Mikrofon-Stream
///
/// Klone teilen sich den Zustand: Mute auf einem Klon gilt für alle.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: Uuid,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl LocalStream {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Track aktivieren/deaktivieren (Mute)
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Flag für die Capture-Schleife
    pub(crate) fn enabled_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.enabled)
    }
}

impl Default for LocalStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Events des Transports
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Jemand ruft an
    IncomingCall(InboundCallRequest),
    /// Remote-Audio eines Anrufs ist angekommen (beide Richtungen)
    StreamAttached { call_id: Uuid, stream: RemoteStream },
    /// Gegenseite hat aufgelegt oder die Verbindung ist weg
    CallClosed { call_id: Uuid, peer_id: String },
}

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

/// Schnittstelle zur Anruf-Bibliothek
#[async_trait]
pub trait CallTransport: Send + Sync + 'static {
    /// Fordert das Mikrofon an
    async fn acquire_local_audio(&self) -> Result<LocalStream, TransportError>;

    /// Stoppt alle Tracks des lokalen Streams
    fn release_local_audio(&self, stream: &LocalStream);

    /// Registriert diesen Client unter `user_id`
    async fn create_local_identity(&self, user_id: &str) -> Result<(), TransportError>;

    async fn release_local_identity(&self);

    /// Startet einen Anruf, der Handle ist zunächst `Connecting`
    async fn dial(&self, peer_id: &str, local: &LocalStream) -> Result<CallHandle, TransportError>;

    async fn answer(
        &self,
        request: InboundCallRequest,
        local: &LocalStream,
    ) -> Result<CallHandle, TransportError>;

    async fn decline(&self, request: InboundCallRequest);

    /// Beendet einen Anruf; mehrfach aufrufen ist harmlos
    async fn hang_up(&self, call: &CallHandle);

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Aktuelle Remote-Streams
    fn remote_streams(&self) -> Vec<RemoteStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_call_is_active_only_with_stream() {
        let stream = RemoteStream {
            id: "a".to_string(),
            peer_id: "bob".to_string(),
        };
        let pending = CallHandle::inbound(Uuid::new_v4(), "bob", None);
        let ready = CallHandle::inbound(Uuid::new_v4(), "bob", Some(stream));

        assert_eq!(pending.status, CallStatus::Connecting);
        assert_eq!(ready.status, CallStatus::Active);
        assert_eq!(ready.direction, CallDirection::Inbound);
    }

        #[test]
    fn test_local_stream_clones_share_state() {
        let stream = LocalStream::new();
        let clone = stream.clone();

        clone.set_enabled(false);
        assert!(!stream.is_enabled());

        stream.stop();
        assert!(clone.is_stopped());
        assert_eq!(stream.id(), clone.id());
    }
}
