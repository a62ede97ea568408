//! Voice Session
//!
//! Ein einzelner Actor-Task besitzt den gesamten Session-Zustand. Er
//! verarbeitet nacheinander:
//! - Befehle der UI (`join`, `leave`, `toggle_mute`, `close`)
//! - Live-Peer-Snapshots der Presence
//! - Events des Transports (eingehende Anrufe, Streams, Abbrüche)
//! - Ergebnisse der asynchronen Schritte (Join, Dial, Answer)
//!
//! Jedes asynchrone Ergebnis trägt die Epoche, in der es gestartet wurde.
//! Ergebnisse aus einer älteren Epoche werden freigegeben und verworfen.
//!
//! Zusätzlich gleicht der Actor einmal pro Erneuerungsintervall die Anrufe
//! mit dem letzten Snapshot ab, auch wenn kein neuer Snapshot kam.

use super::reconcile;
use super::state::{
    CallSummary, SessionConfig, SessionError, SessionEvent, SessionPhase, SessionSnapshot,
};
use crate::presence::{LivePeerSubscription, PresenceBinding, PresenceRecord, PresenceStore};
use crate::transport::{
    CallDirection, CallHandle, CallStatus, CallTransport, InboundCallRequest, LocalStream,
    RemoteStream, TransportError, TransportEvent,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

// ============================================================================
// MESSAGES
// ============================================================================

enum Command {
    Join(oneshot::Sender<Result<(), SessionError>>),
    Leave(oneshot::Sender<()>),
    ToggleMute(oneshot::Sender<Result<bool, SessionError>>),
    Close(oneshot::Sender<()>),
}

/// Ergebnis eines gespawnten Schritts
enum Completion {
    Join {
        epoch: u64,
        result: Result<LocalStream, TransportError>,
    },
    Dial {
        epoch: u64,
        peer_id: String,
        result: Result<CallHandle, TransportError>,
    },
    Answer {
        epoch: u64,
        call_id: Uuid,
        result: Result<CallHandle, TransportError>,
    },
}

impl Completion {
    /// Gibt alles frei, was der Schritt erworben hat
    async fn release(self, transport: &dyn CallTransport) {
        match self {
            Completion::Join {
                result: Ok(local), ..
            } => {
                transport.release_local_audio(&local);
                transport.release_local_identity().await;
            }
            Completion::Dial {
                result: Ok(call), ..
            }
            | Completion::Answer {
                result: Ok(call), ..
            } => transport.hang_up(&call).await,
            _ => {}
        }
    }
}

/// Stellt ein Ergebnis zu; ist der Actor weg, wird es freigegeben
async fn deliver(
    tx: &mpsc::UnboundedSender<Completion>,
    completion: Completion,
    transport: &Arc<dyn CallTransport>,
) {
    if let Err(mpsc::error::SendError(completion)) = tx.send(completion) {
        completion.release(transport.as_ref()).await;
    }
}

/// Mikrofon anfordern, dann Identität registrieren
///
/// Scheitert die Registrierung, wird das Mikrofon wieder freigegeben.
async fn acquire_media_and_identity(
    transport: &Arc<dyn CallTransport>,
    user_id: &str,
) -> Result<LocalStream, TransportError> {
    let local = transport.acquire_local_audio().await?;

    if let Err(e) = transport.create_local_identity(user_id).await {
        transport.release_local_audio(&local);
        return Err(e);
    }

    Ok(local)
}

async fn next_snapshot(
    subscription: &mut Option<LivePeerSubscription>,
) -> Option<Vec<PresenceRecord>> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// VOICE SESSION HANDLE
// ============================================================================

/// Handle auf eine laufende Voice Session
///
/// Klone teilen sich denselben Actor. Wird der letzte Klon gedroppt,
/// verlässt der Actor den Channel und beendet sich.
#[derive(Clone)]
pub struct VoiceSession {
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<SessionSnapshot>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl VoiceSession {
    /// Startet den Session-Actor
    pub fn spawn(
        config: SessionConfig,
        transport: Arc<dyn CallTransport>,
        store: Arc<dyn PresenceStore>,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::idle());
        let (event_tx, _) = broadcast::channel(100);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let transport_events = transport.subscribe();

        tracing::info!(
            "Voice session for {} in channel {}",
            config.user_id,
            config.channel
        );

        let actor = SessionActor::new(
            config,
            transport,
            store,
            state_tx,
            event_tx.clone(),
            completion_tx,
        );
        tokio::spawn(actor.run(commands_rx, completion_rx, transport_events));

        Ok(Self {
            commands: commands_tx,
            state_rx,
            event_tx,
        })
    }

    /// Tritt dem Voice-Channel bei
    ///
    /// Kehrt zurück, sobald die Session `Joined` ist oder der Join
    /// gescheitert bzw. durch `leave()` abgebrochen wurde.
    pub async fn join(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Join(tx)).await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Verlässt den Channel; im Idle-Zustand wirkungslos
    pub async fn leave(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Leave(tx)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Schaltet Mute um und gibt den neuen Zustand zurück
    pub async fn toggle_mute(&self) -> Result<bool, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ToggleMute(tx)).await?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Verlässt den Channel und beendet den Actor
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Close(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_rx.clone()
    }

    pub fn state(&self) -> SessionSnapshot {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

impl std::fmt::Debug for VoiceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceSession")
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

// ============================================================================
// SESSION ACTOR
// ============================================================================

struct SessionActor {
    config: SessionConfig,
    transport: Arc<dyn CallTransport>,
    presence: PresenceBinding,

    phase: SessionPhase,
    /// Wird bei jedem Join-Start und jedem Leave erhöht
    epoch: u64,
    muted: bool,
    local: Option<LocalStream>,

    calls: HashMap<Uuid, CallHandle>,
    pending_dials: HashSet<String>,
    pending_answers: HashMap<Uuid, String>,
    /// Streams, die vor dem Dial- oder Answer-Ergebnis ankamen
    attached_early: HashMap<Uuid, RemoteStream>,
    /// Anrufe (mit Peer), die vor dem Dial- oder Answer-Ergebnis beendet wurden
    closed_early: HashMap<Uuid, String>,

    live: Vec<PresenceRecord>,
    subscription: Option<LivePeerSubscription>,

    pending_join: Option<oneshot::Sender<Result<(), SessionError>>>,
    /// Ein Join-Task läuft noch (auch ein abgebrochener)
    join_in_flight: bool,
    /// Join wartet, bis der abgebrochene Join-Task aufgeräumt ist
    deferred_join: bool,

    state_tx: watch::Sender<SessionSnapshot>,
    event_tx: broadcast::Sender<SessionEvent>,
    completion_tx: mpsc::UnboundedSender<Completion>,
}

impl SessionActor {
    fn new(
        config: SessionConfig,
        transport: Arc<dyn CallTransport>,
        store: Arc<dyn PresenceStore>,
        state_tx: watch::Sender<SessionSnapshot>,
        event_tx: broadcast::Sender<SessionEvent>,
        completion_tx: mpsc::UnboundedSender<Completion>,
    ) -> Self {
        let presence = PresenceBinding::new(store, config.renew_interval, config.freshness_window);

        Self {
            config,
            transport,
            presence,
            phase: SessionPhase::Idle,
            epoch: 0,
            muted: false,
            local: None,
            calls: HashMap::new(),
            pending_dials: HashSet::new(),
            pending_answers: HashMap::new(),
            attached_early: HashMap::new(),
            closed_early: HashMap::new(),
            live: Vec::new(),
            subscription: None,
            pending_join: None,
            join_in_flight: false,
            deferred_join: false,
            state_tx,
            event_tx,
            completion_tx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut transport_events: broadcast::Receiver<TransportEvent>,
    ) {
        let mut ticker = tokio::time::interval(self.config.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close(reply)) => {
                        self.leave().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        tracing::debug!("Last session handle dropped");
                        self.leave().await;
                        break;
                    }
                },

                Some(completion) = completions.recv() => {
                    self.handle_completion(completion).await;
                }

                event = transport_events.recv() => match event {
                    Ok(event) => self.handle_transport_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Session lagged behind transport by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::error!("Transport event channel closed");
                        self.leave().await;
                        break;
                    }
                },

                Some(snapshot) = next_snapshot(&mut self.subscription) => {
                    self.handle_snapshot(snapshot).await;
                }

                _ = ticker.tick(), if self.phase == SessionPhase::Joined => {
                    self.reconcile().await;
                    self.publish();
                }
            }
        }

        tracing::info!("Voice session for {} stopped", self.config.user_id);
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join(reply) => {
                if self.phase != SessionPhase::Idle {
                    let _ = reply.send(Err(SessionError::AlreadyJoined));
                    return;
                }

                self.pending_join = Some(reply);
                self.phase = SessionPhase::Joining;
                if self.join_in_flight {
                    tracing::debug!("Join deferred until the cancelled join is cleaned up");
                    self.deferred_join = true;
                } else {
                    self.start_join();
                }
                self.publish();
            }

            Command::Leave(reply) => {
                self.leave().await;
                let _ = reply.send(());
            }

            Command::ToggleMute(reply) => {
                let _ = reply.send(self.toggle_mute());
            }

            // Wird in `run` behandelt
            Command::Close(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn start_join(&mut self) {
        self.epoch += 1;
        self.join_in_flight = true;

        let epoch = self.epoch;
        let transport = Arc::clone(&self.transport);
        let user_id = self.config.user_id.clone();
        let tx = self.completion_tx.clone();

        tracing::info!("Joining voice channel {} as {}", self.config.channel, user_id);

        tokio::spawn(async move {
            let result = acquire_media_and_identity(&transport, &user_id).await;
            deliver(&tx, Completion::Join { epoch, result }, &transport).await;
        });
    }

    fn toggle_mute(&mut self) -> Result<bool, SessionError> {
        if self.phase != SessionPhase::Joined {
            return Err(SessionError::NotJoined);
        }
        let Some(local) = &self.local else {
            return Err(SessionError::NotJoined);
        };

        self.muted = !self.muted;
        local.set_enabled(!self.muted);

        tracing::info!("Microphone {}", if self.muted { "muted" } else { "unmuted" });
        self.emit(SessionEvent::MuteChanged(self.muted));
        self.publish();
        Ok(self.muted)
    }

    /// Best-effort Teardown, jeder Schritt läuft auch nach Fehlern weiter
    async fn leave(&mut self) {
        match self.phase {
            SessionPhase::Idle => return,
            SessionPhase::Joining => {
                // Der Join-Task räumt sein Ergebnis selbst ab
                self.epoch += 1;
                self.phase = SessionPhase::Idle;
                self.deferred_join = false;
                if let Some(reply) = self.pending_join.take() {
                    let _ = reply.send(Err(SessionError::Cancelled));
                }
                tracing::info!("Join cancelled");
                self.emit(SessionEvent::Left);
                self.publish();
                return;
            }
            SessionPhase::Joined => {}
        }

        self.epoch += 1;
        tracing::info!("Leaving voice channel {}", self.config.channel);

        let calls: Vec<CallHandle> = self.calls.drain().map(|(_, call)| call).collect();
        for call in &calls {
            self.transport.hang_up(call).await;
            self.emit(SessionEvent::CallEnded {
                peer_id: call.peer_id.clone(),
            });
        }

        if let Some(mut subscription) = self.subscription.take() {
            subscription.dispose();
        }

        if let Err(e) = self.presence.leave(&self.config.channel, &self.config.user_id) {
            tracing::warn!("Failed to delete presence record: {}", e);
        }

        if let Some(local) = self.local.take() {
            self.transport.release_local_audio(&local);
        }

        self.transport.release_local_identity().await;

        self.pending_dials.clear();
        self.pending_answers.clear();
        self.attached_early.clear();
        self.closed_early.clear();
        self.live.clear();
        self.muted = false;
        self.phase = SessionPhase::Idle;

        self.emit(SessionEvent::Left);
        self.publish();
    }

    // ------------------------------------------------------------------------
    // Completions
    // ------------------------------------------------------------------------

    async fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Join { epoch, result } => {
                self.join_in_flight = false;

                if epoch != self.epoch || self.phase != SessionPhase::Joining {
                    tracing::debug!("Releasing result of cancelled join");
                    Completion::Join { epoch, result }
                        .release(self.transport.as_ref())
                        .await;

                    if self.deferred_join {
                        self.deferred_join = false;
                        self.start_join();
                    }
                    return;
                }

                match result {
                    Ok(local) => self.enter_joined(local),
                    Err(e) => {
                        tracing::error!("Join failed: {}", e);
                        let error = SessionError::Transport(e);
                        self.phase = SessionPhase::Idle;
                        if let Some(reply) = self.pending_join.take() {
                            let _ = reply.send(Err(error.clone()));
                        }
                        self.emit(SessionEvent::JoinFailed(error));
                        self.publish();
                    }
                }
            }

            Completion::Dial {
                epoch,
                peer_id,
                result,
            } => {
                if epoch != self.epoch || self.phase != SessionPhase::Joined {
                    Completion::Dial {
                        epoch,
                        peer_id,
                        result,
                    }
                    .release(self.transport.as_ref())
                    .await;
                    return;
                }

                self.pending_dials.remove(&peer_id);
                match result {
                    Ok(call) if !self.is_live_peer(&call.peer_id) => {
                        tracing::info!("{} left while dialing, hanging up", call.peer_id);
                        self.forget_early(call.id);
                        self.transport.hang_up(&call).await;
                    }
                    Ok(call) => self.install_call(call).await,
                    // Nächster Abgleich versucht es erneut
                    Err(e) => {
                        tracing::warn!("Dial to {} failed: {}", peer_id, e);
                        self.forget_early_dials(&peer_id);
                    }
                }
                self.publish();
            }

            Completion::Answer {
                epoch,
                call_id,
                result,
            } => {
                if epoch != self.epoch || self.phase != SessionPhase::Joined {
                    Completion::Answer {
                        epoch,
                        call_id,
                        result,
                    }
                    .release(self.transport.as_ref())
                    .await;
                    return;
                }

                let peer_id = self.pending_answers.remove(&call_id);
                match result {
                    Ok(call) => self.install_call(call).await,
                    Err(e) => {
                        tracing::warn!(
                            "Answering call {} from {:?} failed: {}",
                            call_id,
                            peer_id,
                            e
                        );
                        self.forget_early(call_id);
                    }
                }
                self.publish();
            }
        }
    }

    fn enter_joined(&mut self, local: LocalStream) {
        self.muted = false;
        local.set_enabled(true);
        self.local = Some(local);

        let record = PresenceRecord::new(
            self.config.user_id.clone(),
            self.config.display_name.clone(),
            self.config.avatar_url.clone(),
            self.config.user_id.clone(),
        );
        if let Err(e) = self.presence.join(&self.config.channel, record) {
            tracing::warn!("Presence write failed, renewal will retry: {}", e);
        }

        self.subscription = Some(
            self.presence
                .subscribe_live_peers(&self.config.channel, &self.config.user_id),
        );
        self.phase = SessionPhase::Joined;

        tracing::info!("Joined voice channel {}", self.config.channel);
        if let Some(reply) = self.pending_join.take() {
            let _ = reply.send(Ok(()));
        }
        self.emit(SessionEvent::Joined);
        self.publish();
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    async fn handle_snapshot(&mut self, snapshot: Vec<PresenceRecord>) {
        // Ein Snapshot kann noch unterwegs sein, wenn leave() lief
        if self.phase != SessionPhase::Joined {
            return;
        }

        self.live = snapshot;
        self.reconcile().await;
        self.publish();
    }

    async fn reconcile(&mut self) {
        let busy: HashSet<String> = self
            .pending_dials
            .iter()
            .chain(self.pending_answers.values())
            .cloned()
            .collect();

        let plan = reconcile::plan(
            self.live.iter().map(|r| r.peer_id.as_str()),
            &self.calls,
            &busy,
        );
        if plan.is_empty() {
            return;
        }

        tracing::debug!(
            "Reconcile: dial {:?}, hang up {} call(s)",
            plan.dial,
            plan.hang_up.len()
        );

        for call_id in plan.hang_up {
            if let Some(call) = self.calls.remove(&call_id) {
                tracing::info!("{} left the channel, hanging up", call.peer_id);
                self.transport.hang_up(&call).await;
                self.emit(SessionEvent::CallEnded {
                    peer_id: call.peer_id,
                });
            }
        }

        for peer_id in plan.dial {
            self.start_dial(peer_id);
        }
    }

    fn start_dial(&mut self, peer_id: String) {
        let Some(local) = self.local.clone() else {
            return;
        };
        self.pending_dials.insert(peer_id.clone());

        let epoch = self.epoch;
        let transport = Arc::clone(&self.transport);
        let tx = self.completion_tx.clone();

        tracing::info!("Calling {}", peer_id);
        tokio::spawn(async move {
            let result = transport.dial(&peer_id, &local).await;
            deliver(
                &tx,
                Completion::Dial {
                    epoch,
                    peer_id,
                    result,
                },
                &transport,
            )
            .await;
        });
    }

    // ------------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------------

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::IncomingCall(request) => self.handle_incoming_call(request).await,

            TransportEvent::StreamAttached { call_id, stream } => {
                if let Some(call) = self.calls.get_mut(&call_id) {
                    tracing::info!("Audio from {} attached", stream.peer_id);
                    call.status = CallStatus::Active;
                    call.remote_stream = Some(stream);
                    self.publish();
                } else if self.phase == SessionPhase::Joined
                    && (self.pending_dials.contains(&stream.peer_id)
                        || self.pending_answers.contains_key(&call_id))
                {
                    self.attached_early.insert(call_id, stream);
                }
            }

            TransportEvent::CallClosed { call_id, peer_id } => {
                if let Some(call) = self.calls.remove(&call_id) {
                    tracing::info!("Call with {} closed", call.peer_id);
                    self.emit(SessionEvent::CallEnded {
                        peer_id: call.peer_id,
                    });
                    self.publish();
                } else if self.phase == SessionPhase::Joined
                    && (self.pending_dials.contains(&peer_id)
                        || self.pending_answers.contains_key(&call_id))
                {
                    self.closed_early.insert(call_id, peer_id);
                }
            }
        }
    }

    async fn handle_incoming_call(&mut self, request: InboundCallRequest) {
        let local = match (&self.phase, &self.local) {
            (SessionPhase::Joined, Some(local)) => local.clone(),
            _ => {
                tracing::debug!("Declining call from {} while not joined", request.peer_id);
                self.transport.decline(request).await;
                return;
            }
        };

        // Beide Seiten haben sich gleichzeitig angerufen: es gilt der Anruf
        // des Peers mit der kleineren ID
        let dialing = self.pending_dials.contains(&request.peer_id)
            || self.calls.values().any(|c| {
                c.peer_id == request.peer_id && c.direction == CallDirection::Outbound
            });
        if dialing && self.config.user_id < request.peer_id {
            tracing::info!(
                "Declining call from {}, our own call takes precedence",
                request.peer_id
            );
            self.transport.decline(request).await;
            return;
        }

        tracing::info!("Answering call from {}", request.peer_id);
        self.pending_answers
            .insert(request.call_id, request.peer_id.clone());

        let epoch = self.epoch;
        let call_id = request.call_id;
        let transport = Arc::clone(&self.transport);
        let tx = self.completion_tx.clone();

        tokio::spawn(async move {
            let result = transport.answer(request, &local).await;
            deliver(
                &tx,
                Completion::Answer {
                    epoch,
                    call_id,
                    result,
                },
                &transport,
            )
            .await;
        });
    }

    // ------------------------------------------------------------------------
    // Call bookkeeping
    // ------------------------------------------------------------------------

    /// Übernimmt einen fertigen Anruf
    ///
    /// Existiert schon ein Anruf zum selben Peer, bleibt der Anruf des Peers
    /// mit der kleineren ID; bei gleicher Richtung der neuere.
    async fn install_call(&mut self, mut call: CallHandle) {
        if self.closed_early.remove(&call.id).is_some() {
            self.attached_early.remove(&call.id);
            tracing::debug!("Call {} with {} closed before setup finished", call.id, call.peer_id);
            self.transport.hang_up(&call).await;
            return;
        }

        if let Some(stream) = self.attached_early.remove(&call.id) {
            call.status = CallStatus::Active;
            call.remote_stream = Some(stream);
        }

        let existing = self
            .calls
            .values()
            .find(|c| c.peer_id == call.peer_id)
            .map(|c| {
                let keep_new = c.direction == call.direction
                    || self.placed_by(&call) < self.placed_by(c);
                (c.id, keep_new)
            });

        if let Some((existing_id, keep_new)) = existing {
            if keep_new {
                if let Some(old) = self.calls.remove(&existing_id) {
                    tracing::info!("Replacing duplicate call with {}", old.peer_id);
                    self.transport.hang_up(&old).await;
                }
            } else {
                tracing::info!("Dropping duplicate call with {}", call.peer_id);
                self.transport.hang_up(&call).await;
                return;
            }
        } else {
            self.emit(SessionEvent::CallStarted {
                peer_id: call.peer_id.clone(),
                direction: call.direction,
            });
        }

        self.calls.insert(call.id, call);
    }

    /// Verwirft gepufferte Events eines gescheiterten Anrufs
    fn forget_early(&mut self, call_id: Uuid) {
        self.attached_early.remove(&call_id);
        self.closed_early.remove(&call_id);
    }

    /// Wie `forget_early`, für einen Dial ohne Anruf-ID
    ///
    /// Einträge laufender Answers desselben Peers bleiben erhalten.
    fn forget_early_dials(&mut self, peer_id: &str) {
        let pending_answers = &self.pending_answers;
        self.attached_early
            .retain(|id, stream| stream.peer_id != peer_id || pending_answers.contains_key(id));
        self.closed_early
            .retain(|id, peer| peer != peer_id || pending_answers.contains_key(id));
    }

    /// ID des Peers, der den Anruf aufgebaut hat
    fn placed_by<'a>(&'a self, call: &'a CallHandle) -> &'a str {
        match call.direction {
            CallDirection::Outbound => &self.config.user_id,
            CallDirection::Inbound => &call.peer_id,
        }
    }

    fn is_live_peer(&self, peer_id: &str) -> bool {
        self.live.iter().any(|r| r.peer_id == peer_id)
    }

    // ------------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------------

    fn publish(&self) {
        let mut calls: Vec<CallSummary> = self.calls.values().map(CallSummary::from).collect();
        calls.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        let snapshot = SessionSnapshot {
            phase: self.phase,
            muted: self.muted,
            calls,
            live_peers: self.live.clone(),
        };

        self.state_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, StoreChange, StoreError};
    use crate::transport::{LoopbackTransport, Switchboard};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    const CHANNEL: &str = "gameWorld";
    const WAIT: Duration = Duration::from_secs(3);

    /// Zählt Schreibzugriffe auf den Presence-Store
    struct CountingStore {
        inner: Arc<Database>,
        writes: AtomicUsize,
    }

    impl CountingStore {
        fn new(inner: Arc<Database>) -> Arc<Self> {
            Arc::new(Self {
                inner,
                writes: AtomicUsize::new(0),
            })
        }

        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    impl PresenceStore for CountingStore {
        fn upsert_presence(&self, channel: &str, record: &PresenceRecord) -> Result<(), StoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.upsert_presence(channel, record)
        }

        fn delete_presence(&self, channel: &str, user_id: &str) -> Result<(), StoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.delete_presence(channel, user_id)
        }

        fn list_presence(&self, channel: &str) -> Result<Vec<PresenceRecord>, StoreError> {
            self.inner.list_presence(channel)
        }

        fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
            self.inner.subscribe_changes()
        }
    }

    struct Harness {
        board: Switchboard,
        db: Arc<Database>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                board: Switchboard::new(),
                db: Arc::new(Database::open_in_memory().unwrap()),
            }
        }

        fn config(user_id: &str) -> SessionConfig {
            SessionConfig {
                channel: CHANNEL.to_string(),
                user_id: user_id.to_string(),
                display_name: user_id.to_uppercase(),
                avatar_url: None,
                renew_interval: Duration::from_millis(50),
                freshness_window: Duration::from_secs(5),
            }
        }

        fn session(&self, user_id: &str) -> (Arc<LoopbackTransport>, VoiceSession) {
            self.session_with(Self::config(user_id))
        }

        fn session_with(&self, config: SessionConfig) -> (Arc<LoopbackTransport>, VoiceSession) {
            let transport = Arc::new(LoopbackTransport::new(self.board.clone()));
            let session = VoiceSession::spawn(
                config,
                Arc::clone(&transport) as Arc<dyn CallTransport>,
                Arc::clone(&self.db) as Arc<dyn PresenceStore>,
            )
            .unwrap();
            (transport, session)
        }

        /// Registrierter Peer mit Presence-Eintrag, der nie abhebt
        async fn passive_peer(&self, user_id: &str) -> LoopbackTransport {
            let transport = LoopbackTransport::new(self.board.clone());
            transport.create_local_identity(user_id).await.unwrap();
            self.db
                .upsert_presence(CHANNEL, &PresenceRecord::new(user_id, user_id, None, user_id))
                .unwrap();
            transport
        }

        fn own_record_exists(&self, user_id: &str) -> bool {
            self.db
                .list_presence(CHANNEL)
                .unwrap()
                .iter()
                .any(|r| r.user_id == user_id)
        }
    }

    async fn wait_for(
        session: &VoiceSession,
        what: &str,
        pred: impl FnMut(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        let mut rx = session.watch_state();
        let result = timeout(WAIT, rx.wait_for(pred)).await;
        match result {
            Ok(Ok(snapshot)) => snapshot.clone(),
            _ => panic!("timed out waiting for {}: {:?}", what, session.state()),
        }
    }

    async fn wait_for_calls(session: &VoiceSession, peers: &[&str]) -> SessionSnapshot {
        wait_for(session, &format!("calls to {:?}", peers), |s| s.call_peers() == peers).await
    }

    #[tokio::test]
    async fn test_join_writes_presence_and_leave_cleans_up() {
        let h = Harness::new();
        let (transport, session) = h.session("me");
        let mut events = session.subscribe_events();

        session.join().await.unwrap();
        assert!(session.state().is_joined());
        assert!(h.own_record_exists("me"));
        assert!(h.board.is_registered("me"));
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Joined));

        session.leave().await.unwrap();
        assert_eq!(session.state(), SessionSnapshot::idle());
        assert!(!h.own_record_exists("me"));
        assert!(!h.board.is_registered("me"));

        let stats = transport.stats();
        assert_eq!(stats.audio_acquired, 1);
        assert_eq!(stats.audio_released, 1);
        assert_eq!(stats.identities_released, 1);
    }

    #[tokio::test]
    async fn test_call_set_follows_snapshots() {
        let h = Harness::new();
        let (transport, session) = h.session("me");
        session.join().await.unwrap();
        wait_for_calls(&session, &[]).await;

        let _a = h.passive_peer("peer-a").await;
        wait_for_calls(&session, &["peer-a"]).await;

        let _b = h.passive_peer("peer-b").await;
        wait_for_calls(&session, &["peer-a", "peer-b"]).await;
        // Nur B wurde neu angerufen
        assert_eq!(transport.stats().dials, 2);

        h.db.delete_presence(CHANNEL, "peer-a").unwrap();
        let state = wait_for_calls(&session, &["peer-b"]).await;
        assert_eq!(state.calls[0].direction, CallDirection::Outbound);

        let stats = transport.stats();
        assert_eq!(stats.dials, 2);
        assert_eq!(stats.hang_ups, 1);
    }

    #[tokio::test]
    async fn test_inbound_call_from_non_live_peer_is_hung_up() {
        let h = Harness::new();
        let (transport, session) = h.session("me");
        let mut events = session.subscribe_events();
        session.join().await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Joined));

        // Registriert, aber ohne Presence-Eintrag: es kommt nie ein neuer Snapshot
        let stranger = LoopbackTransport::new(h.board.clone());
        stranger.create_local_identity("stranger").await.unwrap();
        let mut stranger_events = stranger.subscribe();
        stranger.dial("me", &LocalStream::new()).await.unwrap();

        let ended = timeout(WAIT, async {
            loop {
                match events.recv().await.unwrap() {
                    SessionEvent::CallEnded { peer_id } => break peer_id,
                    _ => continue,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(ended, "stranger");

        let state = wait_for_calls(&session, &[]).await;
        assert!(state.live_peers.is_empty());
        assert_eq!(transport.stats().answers, 1);
        assert_eq!(transport.stats().hang_ups, 1);
        assert_eq!(h.board.open_calls(), 0);

        let closed = timeout(WAIT, async {
            loop {
                if let TransportEvent::CallClosed { peer_id, .. } = stranger_events.recv().await.unwrap() {
                    break peer_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(closed, "me");
    }

    #[tokio::test]
    async fn test_stale_peer_is_hung_up_without_delete() {
        let h = Harness::new();
        let mut config = Harness::config("me");
        config.freshness_window = Duration::from_millis(400);
        let (transport, session) = h.session_with(config);
        session.join().await.unwrap();

        // Einmal geschrieben, nie erneuert
        let _a = h.passive_peer("peer-a").await;
        wait_for_calls(&session, &["peer-a"]).await;

        let state = wait_for(&session, "peer-a expired", |s| {
            s.calls.is_empty() && s.live_peers.is_empty()
        })
        .await;
        assert!(state.is_joined());
        // Eintrag liegt noch im Store
        assert!(h.db.list_presence(CHANNEL).unwrap().iter().any(|r| r.user_id == "peer-a"));

        let stats = transport.stats();
        assert_eq!(stats.dials, 1);
        assert_eq!(stats.hang_ups, 1);
    }

    #[tokio::test]
    async fn test_inbound_stream_attached_before_answer_completes() {
        let h = Harness::new();
        let mut config = Harness::config("me");
        // Kein Abgleich-Tick, bevor der Anruf geprüft ist
        config.renew_interval = Duration::from_secs(2);
        let (transport, session) = h.session_with(config);
        transport.set_answer_delay(Duration::from_millis(100));
        session.join().await.unwrap();

        let caller = LoopbackTransport::new(h.board.clone());
        caller.create_local_identity("caller").await.unwrap();
        caller.dial("me", &LocalStream::new()).await.unwrap();

        let state = wait_for(&session, "inbound call active", |s| {
            s.calls.len() == 1 && s.calls[0].status == CallStatus::Active
        })
        .await;
        assert_eq!(state.calls[0].peer_id, "caller");
        assert_eq!(state.calls[0].direction, CallDirection::Inbound);
        assert!(state.calls[0].has_remote_audio);
    }

    #[tokio::test]
    async fn test_failed_setup_forgets_early_events() {
        let h = Harness::new();
        let transport = Arc::new(LoopbackTransport::new(h.board.clone()));
        let (state_tx, _state_rx) = watch::channel(SessionSnapshot::idle());
        let (event_tx, _) = broadcast::channel(16);
        let (completion_tx, _completion_rx) = mpsc::unbounded_channel();
        let mut actor = SessionActor::new(
            Harness::config("me"),
            Arc::clone(&transport) as Arc<dyn CallTransport>,
            Arc::clone(&h.db) as Arc<dyn PresenceStore>,
            state_tx,
            event_tx,
            completion_tx,
        );
        actor.phase = SessionPhase::Joined;
        actor.local = Some(LocalStream::new());

        // Dial, dessen Anruf schon vor dem Ergebnis zu war
        let dialed = Uuid::new_v4();
        actor.pending_dials.insert("peer-a".to_string());
        actor
            .handle_transport_event(TransportEvent::StreamAttached {
                call_id: dialed,
                stream: RemoteStream {
                    id: "a".to_string(),
                    peer_id: "peer-a".to_string(),
                },
            })
            .await;
        actor
            .handle_transport_event(TransportEvent::CallClosed {
                call_id: dialed,
                peer_id: "peer-a".to_string(),
            })
            .await;

        // Answer desselben Peers läuft parallel und behält seine Einträge
        let answered = Uuid::new_v4();
        actor.pending_answers.insert(answered, "peer-a".to_string());
        actor
            .handle_transport_event(TransportEvent::CallClosed {
                call_id: answered,
                peer_id: "peer-a".to_string(),
            })
            .await;
        assert_eq!(actor.closed_early.len(), 2);
        assert_eq!(actor.attached_early.len(), 1);

        actor
            .handle_completion(Completion::Dial {
                epoch: actor.epoch,
                peer_id: "peer-a".to_string(),
                result: Err(TransportError::CallUnreachable("peer-a".to_string())),
            })
            .await;
        assert!(actor.attached_early.is_empty());
        assert_eq!(actor.closed_early.keys().collect::<Vec<_>>(), vec![&answered]);

        actor
            .handle_completion(Completion::Answer {
                epoch: actor.epoch,
                call_id: answered,
                result: Err(TransportError::CallUnreachable("peer-a".to_string())),
            })
            .await;
        assert!(actor.closed_early.is_empty());
        assert!(actor.pending_answers.is_empty());
    }

    #[tokio::test]
    async fn test_zero_renew_interval_is_rejected() {
        let h = Harness::new();
        let mut config = Harness::config("me");
        config.renew_interval = Duration::ZERO;

        let result = VoiceSession::spawn(
            config,
            Arc::new(LoopbackTransport::new(h.board.clone())) as Arc<dyn CallTransport>,
            Arc::clone(&h.db) as Arc<dyn PresenceStore>,
        );
        assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_repeated_snapshots_do_not_redial() {
        let h = Harness::new();
        let (transport, session) = h.session("me");
        session.join().await.unwrap();

        // Peer erneuert laufend, jede Erneuerung erzeugt einen Snapshot
        let _a = h.passive_peer("peer-a").await;
        let renewer = PresenceBinding::new(
            Arc::clone(&h.db) as Arc<dyn PresenceStore>,
            Duration::from_millis(20),
            Duration::from_secs(5),
        );
        renewer
            .join(CHANNEL, PresenceRecord::new("peer-a", "A", None, "peer-a"))
            .unwrap();

        wait_for_calls(&session, &["peer-a"]).await;
        sleep(Duration::from_millis(300)).await;

        assert_eq!(transport.stats().dials, 1);
        assert_eq!(transport.stats().hang_ups, 0);
        assert_eq!(session.state().call_peers(), vec!["peer-a"]);
    }

    #[tokio::test]
    async fn test_failed_dial_is_isolated_and_retried() {
        let h = Harness::new();
        let (transport, session) = h.session("me");
        session.join().await.unwrap();

        // Presence ohne registrierten Transport: Dial scheitert
        h.db
            .upsert_presence(CHANNEL, &PresenceRecord::new("ghost", "Ghost", None, "ghost"))
            .unwrap();
        let _a = h.passive_peer("peer-a").await;

        wait_for_calls(&session, &["peer-a"]).await;

        // Sobald ghost erreichbar ist, greift der nächste Snapshot
        let ghost = LoopbackTransport::new(h.board.clone());
        ghost.create_local_identity("ghost").await.unwrap();
        h.db
            .upsert_presence(CHANNEL, &PresenceRecord::new("ghost", "Ghost", None, "ghost"))
            .unwrap();

        wait_for_calls(&session, &["ghost", "peer-a"]).await;
        assert!(transport.stats().dials >= 3);
    }

    #[tokio::test]
    async fn test_leave_before_dial_completes_does_not_resurrect() {
        let h = Harness::new();
        let (transport, session) = h.session("me");
        transport.set_dial_delay(Duration::from_millis(200));
        let _a = h.passive_peer("peer-a").await;

        session.join().await.unwrap();
        timeout(WAIT, async {
            while transport.stats().dials == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        session.leave().await.unwrap();
        sleep(Duration::from_millis(400)).await;

        let state = session.state();
        assert_eq!(state.phase, SessionPhase::Idle);
        assert!(state.calls.is_empty());
        assert!(!h.own_record_exists("me"));
        assert_eq!(h.board.open_calls(), 0);
    }

    #[tokio::test]
    async fn test_media_denied_leaves_idle_without_presence_writes() {
        let h = Harness::new();
        let store = CountingStore::new(Arc::clone(&h.db));
        let transport = Arc::new(LoopbackTransport::new(h.board.clone()));
        transport.deny_microphone(true);
        let session = VoiceSession::spawn(
            Harness::config("me"),
            Arc::clone(&transport) as Arc<dyn CallTransport>,
            Arc::clone(&store) as Arc<dyn PresenceStore>,
        )
        .unwrap();
        let mut events = session.subscribe_events();

        let err = session.join().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport(TransportError::MediaAccessDenied(_))
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::JoinFailed(_)
        ));

        assert_eq!(session.state().phase, SessionPhase::Idle);
        assert_eq!(store.writes(), 0);
        assert_eq!(transport.stats().identities_created, 0);
    }

    #[tokio::test]
    async fn test_identity_conflict_releases_audio() {
        let h = Harness::new();
        let _other_tab = h.passive_peer("me").await;
        let (transport, session) = h.session("me");

        let err = session.join().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport(TransportError::IdentityConflict(_))
        ));

        let stats = transport.stats();
        assert_eq!(stats.audio_acquired, 1);
        assert_eq!(stats.audio_released, 1);
        assert_eq!(session.state().phase, SessionPhase::Idle);

        // Erneuter Versuch ist möglich
        let err = session.join().await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
    }

    #[tokio::test]
    async fn test_leave_when_idle_is_noop() {
        let h = Harness::new();
        let store = CountingStore::new(Arc::clone(&h.db));
        let transport = Arc::new(LoopbackTransport::new(h.board.clone()));
        let session = VoiceSession::spawn(
            Harness::config("me"),
            Arc::clone(&transport) as Arc<dyn CallTransport>,
            Arc::clone(&store) as Arc<dyn PresenceStore>,
        )
        .unwrap();

        session.leave().await.unwrap();
        session.leave().await.unwrap();

        assert_eq!(transport.stats().total(), 0);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_leave_twice_is_noop_the_second_time() {
        let h = Harness::new();
        let (transport, session) = h.session("me");
        session.join().await.unwrap();

        session.leave().await.unwrap();
        let after_first = transport.stats();
        session.leave().await.unwrap();
        assert_eq!(transport.stats(), after_first);
    }

    #[tokio::test]
    async fn test_join_twice_is_rejected() {
        let h = Harness::new();
        let (_transport, session) = h.session("me");
        session.join().await.unwrap();

        assert!(matches!(
            session.join().await,
            Err(SessionError::AlreadyJoined)
        ));
    }

    #[tokio::test]
    async fn test_mute_does_not_touch_calls() {
        let h = Harness::new();
        let (transport, session) = h.session("me");
        assert!(matches!(
            session.toggle_mute().await,
            Err(SessionError::NotJoined)
        ));

        session.join().await.unwrap();
        let _a = h.passive_peer("peer-a").await;
        let before = wait_for_calls(&session, &["peer-a"]).await;

        assert!(session.toggle_mute().await.unwrap());
        let muted = wait_for(&session, "muted", |s| s.muted).await;
        assert_eq!(muted.calls, before.calls);

        assert!(!session.toggle_mute().await.unwrap());
        assert_eq!(transport.stats().dials, 1);
        assert_eq!(transport.stats().hang_ups, 0);
    }

    #[tokio::test]
    async fn test_leave_during_join_cancels_it() {
        let h = Harness::new();
        let (transport, session) = h.session("me");
        transport.set_register_delay(Duration::from_millis(150));

        let joiner = session.clone();
        let pending = tokio::spawn(async move { joiner.join().await });
        wait_for(&session, "joining", |s| s.phase == SessionPhase::Joining).await;

        session.leave().await.unwrap();
        assert!(matches!(
            pending.await.unwrap(),
            Err(SessionError::Cancelled)
        ));

        // Nach Abschluss des Join-Tasks ist alles wieder freigegeben
        sleep(Duration::from_millis(300)).await;
        let stats = transport.stats();
        assert_eq!(stats.audio_released, 1);
        assert_eq!(stats.identities_released, 1);
        assert!(!h.board.is_registered("me"));
        assert!(!h.own_record_exists("me"));
        assert_eq!(session.state().phase, SessionPhase::Idle);
    }

    #[tokio::test]
    async fn test_rejoin_waits_for_cancelled_join() {
        let h = Harness::new();
        let (transport, session) = h.session("me");
        transport.set_register_delay(Duration::from_millis(100));

        let joiner = session.clone();
        let first = tokio::spawn(async move { joiner.join().await });
        wait_for(&session, "joining", |s| s.phase == SessionPhase::Joining).await;
        session.leave().await.unwrap();
        assert!(matches!(first.await.unwrap(), Err(SessionError::Cancelled)));

        session.join().await.unwrap();
        assert!(session.state().is_joined());
        assert!(h.board.is_registered("me"));
        assert!(h.own_record_exists("me"));
    }

    #[tokio::test]
    async fn test_inbound_call_while_idle_is_declined() {
        let h = Harness::new();
        let (transport, _session) = h.session("me");
        // Registriert, aber nicht beigetreten
        transport.create_local_identity("me").await.unwrap();

        let caller = h.passive_peer("peer-a").await;
        let mut caller_events = caller.subscribe();
        caller.dial("me", &LocalStream::new()).await.unwrap();

        let event = timeout(WAIT, caller_events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, TransportEvent::CallClosed { .. }));
        assert_eq!(transport.stats().declines, 1);
    }

    #[tokio::test]
    async fn test_mutual_dial_resolves_to_one_call_per_side() {
        let h = Harness::new();
        let (alice_transport, alice) = h.session("alice");
        let (bob_transport, bob) = h.session("bob");
        alice_transport.set_dial_delay(Duration::from_millis(50));
        bob_transport.set_dial_delay(Duration::from_millis(50));

        let (a, b) = tokio::join!(alice.join(), bob.join());
        a.unwrap();
        b.unwrap();

        let alice_state = wait_for(&alice, "alice active", |s| {
            s.calls.len() == 1 && s.calls[0].status == CallStatus::Active
        })
        .await;
        let bob_state = wait_for(&bob, "bob active", |s| {
            s.calls.len() == 1 && s.calls[0].status == CallStatus::Active
        })
        .await;

        // Beide Seiten sprechen über denselben Anruf
        assert_eq!(alice_state.calls[0].call_id, bob_state.calls[0].call_id);

        sleep(Duration::from_millis(300)).await;
        assert_eq!(alice.state().calls.len(), 1);
        assert_eq!(bob.state().calls.len(), 1);
        assert_eq!(h.board.open_calls(), 1);
        assert_eq!(alice_transport.remote_streams().len(), 1);
        assert_eq!(bob_transport.remote_streams().len(), 1);
    }

    #[tokio::test]
    async fn test_peer_leaving_ends_call_on_other_side() {
        let h = Harness::new();
        let (_alice_transport, alice) = h.session("alice");
        let (_bob_transport, bob) = h.session("bob");

        alice.join().await.unwrap();
        bob.join().await.unwrap();
        wait_for_calls(&alice, &["bob"]).await;
        wait_for_calls(&bob, &["alice"]).await;

        bob.leave().await.unwrap();
        wait_for(&alice, "bob gone", |s| s.calls.is_empty() && s.live_peers.is_empty()).await;
        timeout(WAIT, async {
            while h.board.open_calls() > 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_dropping_last_handle_forces_leave() {
        let h = Harness::new();
        let (transport, session) = h.session("me");
        session.join().await.unwrap();
        assert!(h.own_record_exists("me"));

        drop(session);
        timeout(WAIT, async {
            while h.board.is_registered("me") {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(!h.own_record_exists("me"));
        assert_eq!(transport.stats().audio_released, 1);
    }

    #[tokio::test]
    async fn test_close_stops_the_session() {
        let h = Harness::new();
        let (_transport, session) = h.session("me");
        session.join().await.unwrap();

        session.close().await;
        assert!(!h.own_record_exists("me"));
        assert!(matches!(session.join().await, Err(SessionError::Closed)));
    }
}
