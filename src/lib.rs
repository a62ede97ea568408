//! Dev Verse Voice - Voice-Presence und Peer-Anrufe
//!
//! Client für den Voice-Channel der Dev Verse Welt:
//! - Presence-Einträge in einem gemeinsamen Dokumenten-Store
//! - WebRTC für P2P Audio, Signaling über WebSocket
//! - Ed25519 Authentifizierung gegenüber dem Signaling-Server
//! - Raum-Chat im selben Store

pub mod chat;
pub mod config;
pub mod crypto;
pub mod database;
pub mod presence;
pub mod session;
pub mod shell;
pub mod signaling;
pub mod transport;

use anyhow::Context;
use chat::ChatRoom;
use config::{AppConfig, TransportKind};
use database::Database;
use once_cell::sync::OnceCell;
use presence::PresenceStore;
use session::{SessionConfig, SessionEvent, VoiceSession};
use shell::Intent;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use transport::{CallTransport, LoopbackTransport, Switchboard, WebRtcTransport};
use uuid::Uuid;

// ============================================================================
// LOGGING
// ============================================================================

static LOGGING: OnceCell<()> = OnceCell::new();

/// Initialisiert das Logging (nur beim ersten Aufruf)
pub fn init_logging() {
    LOGGING.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("devverse=debug,webrtc=warn"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Alles, was die Overlay-Shell braucht
pub struct AppState {
    pub config: AppConfig,
    pub database: Arc<Database>,
    pub session: VoiceSession,
    pub chat: ChatRoom,
}

impl AppState {
    /// Baut Store, Transport und Session aus der Konfiguration
    pub fn init(config: AppConfig) -> anyhow::Result<Self> {
        tracing::info!("Initializing Dev Verse voice for {}...", config.user_id);

        let database = Arc::new(
            Database::open(&config.db_path)
                .with_context(|| format!("failed to open database at {:?}", config.db_path))?,
        );

        let transport: Arc<dyn CallTransport> = match config.transport {
            TransportKind::WebRtc => {
                tracing::info!("Using WebRTC transport via {}", config.signaling_url);
                Arc::new(WebRtcTransport::new(
                    config.signaling_url.clone(),
                    config.turn.clone(),
                ))
            }
            TransportKind::Loopback => {
                tracing::info!("Using loopback transport (demo mode)");
                Arc::new(LoopbackTransport::new(Switchboard::new()))
            }
        };

        let session = VoiceSession::spawn(
            SessionConfig::from(&config),
            transport,
            Arc::clone(&database) as Arc<dyn PresenceStore>,
        )
        .context("invalid session configuration")?;

        let chat = ChatRoom::new(
            Arc::clone(&database),
            config.channel.clone(),
            config.user_id.clone(),
            config.display_name.clone(),
            config.avatar_url.clone(),
        );

        Ok(Self {
            config,
            database,
            session,
            chat,
        })
    }

    /// Führt einen Intent aus; `false` beendet die Shell
    pub async fn handle_intent(&self, intent: Intent) -> bool {
        match intent {
            Intent::Join => {
                println!("[voice] joining {}...", self.config.channel);
                if let Err(e) = self.session.join().await {
                    println!("[voice] could not join: {}", e);
                }
            }
            Intent::Leave => {
                if let Err(e) = self.session.leave().await {
                    println!("[voice] {}", e);
                }
            }
            Intent::Mute => match self.session.toggle_mute().await {
                Ok(true) => println!("[voice] microphone muted"),
                Ok(false) => println!("[voice] microphone live"),
                Err(e) => println!("[voice] {}", e),
            },
            Intent::Peers => println!("{}", shell::render_peers(&self.session.state())),
            Intent::Say(text) => {
                if let Err(e) = self.chat.send(&text) {
                    println!("[chat] {}", e);
                }
            }
            Intent::Help => println!("{}", shell::HELP),
            Intent::Close => return false,
        }
        true
    }
}

// ============================================================================
// ENTRY POINT
// ============================================================================

/// Startet die Overlay-Shell auf stdin/stdout
pub async fn run() -> anyhow::Result<()> {
    init_logging();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let app = AppState::init(config)?;

    let mut state_rx = app.session.watch_state();
    let mut events = app.session.subscribe_events();
    let mut chat = app.chat.subscribe();
    let mut last_seen: Option<Uuid> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("{}", shell::HELP);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if let Some(intent) = Intent::parse(&line) {
                    if !app.handle_intent(intent).await {
                        break;
                    }
                }
            }

            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow_and_update().clone();
                println!("{}", shell::render_state(&state));
            }

            Ok(event) = events.recv() => match event {
                SessionEvent::CallStarted { peer_id, .. } => println!("[voice] connected to {}", peer_id),
                SessionEvent::CallEnded { peer_id } => println!("[voice] {} hung up", peer_id),
                SessionEvent::JoinFailed(e) => println!("[voice] join failed: {}", e),
                _ => {}
            },

            Some(messages) = chat.next() => {
                for message in shell::unseen(&messages, last_seen) {
                    println!("{}", shell::render_message(message));
                }
                if let Some(last) = messages.last() {
                    last_seen = Some(last.id);
                }
            }
        }
    }

    // Overlay zu: Voice-Channel immer verlassen
    app.session.close().await;
    tracing::info!("Overlay closed");
    Ok(())
}
