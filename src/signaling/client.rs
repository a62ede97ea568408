//! WebSocket Client für den Signaling-Server
//!
//! Verwaltet die WebSocket-Verbindung:
//! - Registrierung unter der Benutzer-ID
//! - Heartbeat-Keeping
//! - Message Signing
//! - Event-basierte Kommunikation

use super::messages::*;
use crate::crypto::LocalIdentity;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Maximale Wartezeit auf die Registrierungs-Antwort
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle-Timeout des Servers liegt bei 30s
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Peer id '{0}' is already registered")]
    PeerIdTaken(String),

    #[error("Server error: {code} - {message}")]
    ServerError { code: i32, message: String },
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    Connected,
    Disconnected,

    /// Registrierung erfolgreich
    Registered { peer_id: String },

    /// Eingehender Anruf
    IncomingCall {
        from_peer_id: String,
        call_id: String,
        sdp: String,
    },

    /// SDP Answer erhalten
    AnswerReceived {
        from_peer_id: String,
        call_id: String,
        sdp: String,
    },

    /// ICE Candidate erhalten
    IceCandidateReceived {
        from_peer_id: String,
        call_id: String,
        candidate: String,
    },

    /// Anruf abgelehnt
    CallRejected {
        by_peer_id: String,
        call_id: String,
        reason: Option<String>,
    },

    /// Anruf von der Gegenseite beendet
    CallEnded { by_peer_id: String, call_id: String },

    /// Fehler vom Server
    Error { code: i32, message: String },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    peer_id: Option<String>,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Signaling-Server Kommunikation
pub struct SignalingClient {
    server_url: Url,
    identity: Arc<LocalIdentity>,
    state: Arc<RwLock<ClientState>>,
    tx: Option<mpsc::Sender<String>>,
    event_tx: broadcast::Sender<SignalingEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    pub fn new(server_url: Url, identity: Arc<LocalIdentity>) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            server_url,
            identity,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: None,
            event_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Peer-ID (falls registriert)
    pub fn peer_id(&self) -> Option<String> {
        self.state.read().peer_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// WebSocket-URL aus der HTTP(S)-URL ableiten
    pub fn websocket_url(server_url: &Url) -> String {
        let base = server_url.as_str().trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/ws", base)
    }

    /// Verbindet mit dem Signaling-Server und registriert die lokale Identität
    pub async fn connect_and_register(&mut self) -> Result<String, SignalingError> {
        let ws_url = Self::websocket_url(&self.server_url);
        tracing::info!("Connecting to signaling server: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        self.tx = Some(tx);
        self.state.write().is_connected = true;
        let _ = self.event_tx.send(SignalingEvent::Connected);

        // Channel für die Registrierungs-Antwort
        let (reg_tx, mut reg_rx) = mpsc::channel::<Result<String, SignalingError>>(1);

        let state_clone = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        let read_task = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => {
                            Self::handle_server_message(server_msg, &state_clone, &event_tx, &reg_tx)
                                .await;
                        }
                        Err(e) => tracing::warn!("Unparseable signaling message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state_clone.write().is_connected = false;
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        self.tasks.lock().extend([read_task, write_task]);

        let payload = RegisterPayload::new(
            self.identity.user_id().to_string(),
            self.identity.public_key_base64(),
        );
        self.send_signed_message(payload).await?;

        tokio::select! {
            result = reg_rx.recv() => match result {
                Some(Ok(peer_id)) => Ok(peer_id),
                Some(Err(e)) => Err(e),
                None => Err(SignalingError::RegistrationFailed("No response".to_string())),
            },
            _ = tokio::time::sleep(REGISTER_TIMEOUT) => {
                Err(SignalingError::RegistrationFailed("Timeout".to_string()))
            }
        }
    }

    pub async fn send_offer(
        &self,
        to_peer_id: &str,
        call_id: &str,
        sdp: String,
    ) -> Result<(), SignalingError> {
        let peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        let payload = SessionDescriptionPayload::offer(
            peer_id,
            to_peer_id.to_string(),
            call_id.to_string(),
            sdp,
        );
        self.send_signed_message(payload).await
    }

    pub async fn send_answer(
        &self,
        to_peer_id: &str,
        call_id: &str,
        sdp: String,
    ) -> Result<(), SignalingError> {
        let peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        let payload = SessionDescriptionPayload::answer(
            peer_id,
            to_peer_id.to_string(),
            call_id.to_string(),
            sdp,
        );
        self.send_signed_message(payload).await
    }

    pub async fn send_ice_candidate(
        &self,
        to_peer_id: &str,
        call_id: &str,
        candidate: String,
    ) -> Result<(), SignalingError> {
        let peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        let payload = IceCandidatePayload::new(
            peer_id,
            to_peer_id.to_string(),
            call_id.to_string(),
            candidate,
        );
        self.send_signed_message(payload).await
    }

    pub async fn reject_call(
        &self,
        to_peer_id: &str,
        call_id: &str,
        reason: Option<String>,
    ) -> Result<(), SignalingError> {
        let peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        let payload =
            CallControlPayload::reject(peer_id, to_peer_id.to_string(), call_id.to_string(), reason);
        self.send_signed_message(payload).await
    }

    pub async fn hangup(&self, to_peer_id: &str, call_id: &str) -> Result<(), SignalingError> {
        let peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        let payload = CallControlPayload::hangup(peer_id, to_peer_id.to_string(), call_id.to_string());
        self.send_signed_message(payload).await
    }

    pub async fn send_heartbeat(&self) -> Result<(), SignalingError> {
        let peer_id = self.peer_id().ok_or(SignalingError::NotConnected)?;
        self.send_signed_message(HeartbeatPayload::new(peer_id)).await
    }

    /// Startet den Heartbeat-Task, endet von selbst wenn die Verbindung weg ist
    pub fn start_heartbeat(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                interval.tick().await;
                if !client.is_connected() {
                    tracing::info!("Heartbeat: client disconnected, stopping");
                    break;
                }
                if let Err(e) = client.send_heartbeat().await {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });
        self.tasks.lock().push(task);
    }

    /// Trennt die Verbindung und stoppt alle Hintergrund-Tasks
    pub fn disconnect(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let was_connected = {
            let mut state = self.state.write();
            let was = state.is_connected;
            state.is_connected = false;
            state.peer_id = None;
            was
        };

        if was_connected {
            let _ = self.event_tx.send(SignalingEvent::Disconnected);
        }
    }

    /// Signiert und verschickt eine Nachricht
    async fn send_signed_message<T: serde::Serialize>(
        &self,
        payload: T,
    ) -> Result<(), SignalingError> {
        let tx = self.tx.as_ref().ok_or(SignalingError::NotConnected)?;
        let msg = self.sign_payload(payload)?;

        tx.send(msg)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Timestamp und Signatur ergänzen
    fn sign_payload<T: serde::Serialize>(&self, payload: T) -> Result<String, SignalingError> {
        let mut message = serde_json::to_value(&payload)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        let obj = message
            .as_object_mut()
            .ok_or_else(|| SignalingError::SendFailed("payload is not an object".to_string()))?;
        obj.insert(
            "timestamp".to_string(),
            serde_json::Value::Number(Utc::now().timestamp_millis().into()),
        );

        let signature = self.identity.sign_message(&message);
        if let Some(obj) = message.as_object_mut() {
            obj.insert("signature".to_string(), serde_json::Value::String(signature));
        }

        serde_json::to_string(&message).map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Verarbeitet eingehende Server-Nachrichten
    async fn handle_server_message(
        msg: ServerMessage,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<SignalingEvent>,
        reg_tx: &mpsc::Sender<Result<String, SignalingError>>,
    ) {
        match msg {
            ServerMessage::Registered { peer_id, .. } => {
                tracing::info!("Registered with peer_id {}", peer_id);
                state.write().peer_id = Some(peer_id.clone());
                let _ = reg_tx.try_send(Ok(peer_id.clone()));
                let _ = event_tx.send(SignalingEvent::Registered { peer_id });
            }

            ServerMessage::IncomingOffer {
                from_peer_id,
                call_id,
                sdp,
                ..
            } => {
                let _ = event_tx.send(SignalingEvent::IncomingCall {
                    from_peer_id,
                    call_id,
                    sdp,
                });
            }

            ServerMessage::IncomingAnswer {
                from_peer_id,
                call_id,
                sdp,
                ..
            } => {
                let _ = event_tx.send(SignalingEvent::AnswerReceived {
                    from_peer_id,
                    call_id,
                    sdp,
                });
            }

            ServerMessage::IncomingIceCandidate {
                from_peer_id,
                call_id,
                candidate,
                ..
            } => {
                let _ = event_tx.send(SignalingEvent::IceCandidateReceived {
                    from_peer_id,
                    call_id,
                    candidate,
                });
            }

            ServerMessage::CallRejected {
                by_peer_id,
                call_id,
                reason,
                ..
            } => {
                let _ = event_tx.send(SignalingEvent::CallRejected {
                    by_peer_id,
                    call_id,
                    reason,
                });
            }

            ServerMessage::CallEnded {
                by_peer_id,
                call_id,
                ..
            } => {
                let _ = event_tx.send(SignalingEvent::CallEnded {
                    by_peer_id,
                    call_id,
                });
            }

            ServerMessage::Error { code, message, .. } => {
                tracing::error!("Server error {}: {}", code, message);
                // Vor der Registrierung ist jeder Fehler ein Registrierungsfehler
                if state.read().peer_id.is_none() {
                    let err = if code == ERROR_PEER_ID_TAKEN {
                        SignalingError::PeerIdTaken(message.clone())
                    } else {
                        SignalingError::ServerError {
                            code,
                            message: message.clone(),
                        }
                    };
                    let _ = reg_tx.try_send(Err(err));
                }
                let _ = event_tx.send(SignalingEvent::Error { code, message });
            }

            ServerMessage::Pong { .. } => {}
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url.as_str())
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
