//! Headless Overlay
//!
//! Liest Intents zeilenweise von stdin und gibt Session-Zustand und
//! Chat-Nachrichten auf stdout aus.

use crate::chat::ChatMessage;
use crate::session::{SessionPhase, SessionSnapshot};
use crate::transport::CallStatus;
use uuid::Uuid;

pub const HELP: &str = "commands: join | leave | mute | peers | say <text> | close";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Join,
    Leave,
    Mute,
    Peers,
    Say(String),
    Close,
    Help,
}

impl Intent {
    /// Parst eine Eingabezeile; leere Zeilen ergeben `None`
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_start();
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest),
            None => (line.trim_end(), ""),
        };

        let intent = match command.to_ascii_lowercase().as_str() {
            "" => return None,
            "join" => Intent::Join,
            "leave" => Intent::Leave,
            "mute" => Intent::Mute,
            "peers" => Intent::Peers,
            "say" => Intent::Say(rest.to_string()),
            "close" | "quit" | "exit" => Intent::Close,
            _ => Intent::Help,
        };
        Some(intent)
    }
}

pub fn render_state(state: &SessionSnapshot) -> String {
    let phase = match state.phase {
        SessionPhase::Idle => "idle",
        SessionPhase::Joining => "joining",
        SessionPhase::Joined => "joined",
    };

    let mut out = format!("[voice] {}", phase);
    if state.is_joined() {
        out.push_str(if state.muted { " (muted)" } else { " (live)" });
        let calls: Vec<String> = state
            .calls
            .iter()
            .map(|c| match c.status {
                CallStatus::Active => c.peer_id.clone(),
                _ => format!("{}…", c.peer_id),
            })
            .collect();
        out.push_str(&format!(
            " | {} peer(s) | calls: {}",
            state.live_peers.len(),
            if calls.is_empty() {
                "-".to_string()
            } else {
                calls.join(", ")
            }
        ));
    }
    out
}

pub fn render_peers(state: &SessionSnapshot) -> String {
    if state.live_peers.is_empty() {
        return "[voice] nobody else here".to_string();
    }

    state
        .live_peers
        .iter()
        .map(|p| {
            let in_call = state.calls.iter().any(|c| c.peer_id == p.peer_id);
            format!(
                "  {} ({}){}",
                p.display_name,
                p.user_id,
                if in_call { " *" } else { "" }
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_message(message: &ChatMessage) -> String {
    format!(
        "[{}] {}: {}",
        message.created_at.format("%H:%M"),
        message.user_name,
        message.text
    )
}

/// Nachrichten nach der zuletzt ausgegebenen
pub fn unseen(messages: &[ChatMessage], last_seen: Option<Uuid>) -> &[ChatMessage] {
    match last_seen.and_then(|id| messages.iter().position(|m| m.id == id)) {
        Some(index) => &messages[index + 1..],
        None => messages,
    }
}
