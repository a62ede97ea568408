//! Loopback Transport
//!
//! Vermittelt Anrufe zwischen Transports im selben Prozess über ein
//! gemeinsames `Switchboard`. Es fließt kein echtes Audio, aber der
//! Lebenszyklus (Anruf, Annahme, Stream, Auflegen) verhält sich wie beim
//! WebRTC-Transport: Remote-Streams kommen auf beiden Seiten als
//! `StreamAttached` an. Wird für den Demo-Modus und die Tests verwendet.

use super::{
    CallHandle, CallTransport, InboundCallRequest, LocalStream, RemoteStream, StreamRegistry,
    TransportError, TransportEvent,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// SWITCHBOARD
// ============================================================================

#[derive(Clone)]
struct Endpoint {
    owner: Uuid,
    events: broadcast::Sender<TransportEvent>,
    registry: Arc<StreamRegistry>,
}

#[derive(Debug, Clone)]
struct RoutedCall {
    caller: String,
    callee: String,
}

#[derive(Default)]
struct SwitchboardInner {
    endpoints: HashMap<String, Endpoint>,
    calls: HashMap<Uuid, RoutedCall>,
}

/// Gemeinsame Vermittlung für mehrere Loopback-Transports
#[derive(Clone, Default)]
pub struct Switchboard {
    inner: Arc<Mutex<SwitchboardInner>>,
}

impl Switchboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, peer_id: &str) -> bool {
        self.inner.lock().endpoints.contains_key(peer_id)
    }

    /// Anzahl vermittelter, noch nicht beendeter Anrufe
    pub fn open_calls(&self) -> usize {
        self.inner.lock().calls.len()
    }
}

impl std::fmt::Debug for Switchboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Switchboard")
            .field("endpoints", &inner.endpoints.keys().collect::<Vec<_>>())
            .field("calls", &inner.calls.len())
            .finish()
    }
}

// ============================================================================
// STATS
// ============================================================================

/// Zähler für alle Transport-Operationen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub audio_acquired: usize,
    pub audio_released: usize,
    pub identities_created: usize,
    pub identities_released: usize,
    pub dials: usize,
    pub answers: usize,
    pub declines: usize,
    pub hang_ups: usize,
}

impl LoopbackStats {
    /// Summe aller Aufrufe
    pub fn total(&self) -> usize {
        self.audio_acquired
            + self.audio_released
            + self.identities_created
            + self.identities_released
            + self.dials
            + self.answers
            + self.declines
            + self.hang_ups
    }
}

// ============================================================================
// LOOPBACK TRANSPORT
// ============================================================================

pub struct LoopbackTransport {
    id: Uuid,
    switchboard: Switchboard,
    user_id: Mutex<Option<String>>,
    event_tx: broadcast::Sender<TransportEvent>,
    registry: Arc<StreamRegistry>,
    microphone_available: AtomicBool,
    dial_delay: Mutex<Duration>,
    answer_delay: Mutex<Duration>,
    register_delay: Mutex<Duration>,
    stats: Mutex<LoopbackStats>,
}

impl LoopbackTransport {
    pub fn new(switchboard: Switchboard) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            id: Uuid::new_v4(),
            switchboard,
            user_id: Mutex::new(None),
            event_tx,
            registry: Arc::new(StreamRegistry::new()),
            microphone_available: AtomicBool::new(true),
            dial_delay: Mutex::new(Duration::ZERO),
            answer_delay: Mutex::new(Duration::ZERO),
            register_delay: Mutex::new(Duration::ZERO),
            stats: Mutex::new(LoopbackStats::default()),
        }
    }

    /// Simuliert ein verweigertes Mikrofon
    pub fn deny_microphone(&self, denied: bool) {
        self.microphone_available.store(!denied, Ordering::SeqCst);
    }

    /// Verzögert jeden `dial` um `delay`
    pub fn set_dial_delay(&self, delay: Duration) {
        *self.dial_delay.lock() = delay;
    }

    /// Verzögert das Ergebnis jedes `answer` um `delay`
    ///
    /// Der eigene `StreamAttached` geht vorher raus.
    pub fn set_answer_delay(&self, delay: Duration) {
        *self.answer_delay.lock() = delay;
    }

    /// Verzögert jede Registrierung um `delay`
    pub fn set_register_delay(&self, delay: Duration) {
        *self.register_delay.lock() = delay;
    }

    pub fn stats(&self) -> LoopbackStats {
        *self.stats.lock()
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_id.lock().clone()
    }

    fn require_user(&self) -> Result<String, TransportError> {
        self.user_id.lock().clone().ok_or(TransportError::NotRegistered)
    }
}

#[async_trait]
impl CallTransport for LoopbackTransport {
    async fn acquire_local_audio(&self) -> Result<LocalStream, TransportError> {
        self.stats.lock().audio_acquired += 1;

        if !self.microphone_available.load(Ordering::SeqCst) {
            return Err(TransportError::MediaAccessDenied(
                "microphone permission denied".to_string(),
            ));
        }
        Ok(LocalStream::new())
    }

    fn release_local_audio(&self, stream: &LocalStream) {
        self.stats.lock().audio_released += 1;
        stream.stop();
    }

    async fn create_local_identity(&self, user_id: &str) -> Result<(), TransportError> {
        self.stats.lock().identities_created += 1;

        let delay = *self.register_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.switchboard.inner.lock();
        if let Some(existing) = inner.endpoints.get(user_id) {
            if existing.owner != self.id {
                return Err(TransportError::IdentityConflict(user_id.to_string()));
            }
        }

        inner.endpoints.insert(
            user_id.to_string(),
            Endpoint {
                owner: self.id,
                events: self.event_tx.clone(),
                registry: Arc::clone(&self.registry),
            },
        );
        *self.user_id.lock() = Some(user_id.to_string());

        tracing::debug!("Loopback identity registered: {}", user_id);
        Ok(())
    }

    async fn release_local_identity(&self) {
        self.stats.lock().identities_released += 1;

        let Some(me) = self.user_id.lock().take() else {
            return;
        };

        let mut inner = self.switchboard.inner.lock();
        if inner.endpoints.get(&me).is_some_and(|e| e.owner == self.id) {
            inner.endpoints.remove(&me);
        }

        // Offene Anrufe dieses Endpunkts abbauen
        let mine: Vec<(Uuid, RoutedCall)> = inner
            .calls
            .iter()
            .filter(|(_, c)| c.caller == me || c.callee == me)
            .map(|(id, c)| (*id, c.clone()))
            .collect();

        for (call_id, call) in mine {
            inner.calls.remove(&call_id);
            let other = if call.caller == me { &call.callee } else { &call.caller };
            if let Some(endpoint) = inner.endpoints.get(other) {
                endpoint.registry.remove_call(call_id);
                let _ = endpoint.events.send(TransportEvent::CallClosed {
                    call_id,
                    peer_id: me.clone(),
                });
            }
        }

        self.registry.clear();
    }

    async fn dial(&self, peer_id: &str, _local: &LocalStream) -> Result<CallHandle, TransportError> {
        self.stats.lock().dials += 1;

        let delay = *self.dial_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let me = self.require_user()?;
        let call_id = Uuid::new_v4();

        let mut inner = self.switchboard.inner.lock();
        let callee = inner
            .endpoints
            .get(peer_id)
            .cloned()
            .ok_or_else(|| TransportError::CallUnreachable(peer_id.to_string()))?;

        inner.calls.insert(
            call_id,
            RoutedCall {
                caller: me.clone(),
                callee: peer_id.to_string(),
            },
        );

        let _ = callee
            .events
            .send(TransportEvent::IncomingCall(InboundCallRequest {
                call_id,
                peer_id: me,
                sdp: String::new(),
            }));

        Ok(CallHandle::outbound(call_id, peer_id))
    }

    async fn answer(
        &self,
        request: InboundCallRequest,
        _local: &LocalStream,
    ) -> Result<CallHandle, TransportError> {
        self.stats.lock().answers += 1;

        let me = self.require_user()?;

        let caller = {
            let inner = self.switchboard.inner.lock();
            // Anrufer hat schon wieder aufgelegt
            if !inner.calls.contains_key(&request.call_id) {
                return Err(TransportError::CallUnreachable(request.peer_id));
            }
            inner
                .endpoints
                .get(&request.peer_id)
                .cloned()
                .ok_or_else(|| TransportError::CallUnreachable(request.peer_id.clone()))?
        };

        let their_stream = RemoteStream {
            id: format!("{}:{}", request.call_id, request.peer_id),
            peer_id: request.peer_id.clone(),
        };
        self.registry.insert(request.call_id, their_stream.clone());

        let my_stream = RemoteStream {
            id: format!("{}:{}", request.call_id, me),
            peer_id: me,
        };
        caller.registry.insert(request.call_id, my_stream.clone());
        let _ = caller.events.send(TransportEvent::StreamAttached {
            call_id: request.call_id,
            stream: my_stream,
        });

        let _ = self.event_tx.send(TransportEvent::StreamAttached {
            call_id: request.call_id,
            stream: their_stream,
        });

        let delay = *self.answer_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        // Wie bei WebRTC: aktiv erst mit dem StreamAttached-Event
        Ok(CallHandle::inbound(request.call_id, request.peer_id, None))
    }

    async fn decline(&self, request: InboundCallRequest) {
        self.stats.lock().declines += 1;

        let me = self.user_id().unwrap_or_default();
        let mut inner = self.switchboard.inner.lock();
        if inner.calls.remove(&request.call_id).is_none() {
            return;
        }
        if let Some(caller) = inner.endpoints.get(&request.peer_id) {
            let _ = caller.events.send(TransportEvent::CallClosed {
                call_id: request.call_id,
                peer_id: me,
            });
        }
    }

    async fn hang_up(&self, call: &CallHandle) {
        self.stats.lock().hang_ups += 1;
        self.registry.remove_call(call.id);

        let me = self.user_id().unwrap_or_default();
        let mut inner = self.switchboard.inner.lock();
        let Some(routed) = inner.calls.remove(&call.id) else {
            return;
        };

        let other = if routed.caller == me { routed.callee } else { routed.caller };
        if let Some(endpoint) = inner.endpoints.get(&other) {
            endpoint.registry.remove_call(call.id);
            let _ = endpoint.events.send(TransportEvent::CallClosed {
                call_id: call.id,
                peer_id: me,
            });
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    fn remote_streams(&self) -> Vec<RemoteStream> {
        self.registry.snapshot()
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("user_id", &self.user_id())
            .field("stats", &self.stats())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
