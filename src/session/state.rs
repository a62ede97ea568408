//! Session-Zustand, Events und Fehler

use crate::presence::PresenceRecord;
use crate::transport::{CallDirection, CallHandle, CallStatus, TransportError};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Already joined or joining")]
    AlreadyJoined,

    #[error("Not joined")]
    NotJoined,

    #[error("Join was cancelled by leave")]
    Cancelled,

    #[error("Session is closed")]
    Closed,

    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),
}

// ============================================================================
// SESSION STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    /// Mikrofon und Identität werden angefordert
    Joining,
    Joined,
}

/// Sicht der UI auf einen Anruf
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSummary {
    pub call_id: Uuid,
    pub peer_id: String,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub has_remote_audio: bool,
}

impl From<&CallHandle> for CallSummary {
    fn from(handle: &CallHandle) -> Self {
        Self {
            call_id: handle.id,
            peer_id: handle.peer_id.clone(),
            direction: handle.direction,
            status: handle.status,
            has_remote_audio: handle.remote_stream.is_some(),
        }
    }
}

/// Unveränderlicher Zustand für die UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub muted: bool,
    /// Nach `peer_id` sortiert
    pub calls: Vec<CallSummary>,
    pub live_peers: Vec<PresenceRecord>,
}

impl SessionSnapshot {
    pub fn idle() -> Self {
        Self {
            phase: SessionPhase::Idle,
            muted: false,
            calls: Vec::new(),
            live_peers: Vec::new(),
        }
    }

    pub fn is_joined(&self) -> bool {
        self.phase == SessionPhase::Joined
    }

    /// Peers mit einem Anruf, sortiert
    pub fn call_peers(&self) -> Vec<&str> {
        self.calls.iter().map(|c| c.peer_id.as_str()).collect()
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

/// Events für die UI
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Joined,
    JoinFailed(SessionError),
    Left,
    CallStarted { peer_id: String, direction: CallDirection },
    CallEnded { peer_id: String },
    MuteChanged(bool),
}

// ============================================================================
// SESSION CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub channel: String,
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub renew_interval: Duration,
    pub freshness_window: Duration,
}

impl SessionConfig {
    /// Erneuerung braucht ein Intervall > 0 und ein Fenster, das nicht kürzer ist
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.renew_interval.is_zero() {
            return Err(SessionError::InvalidConfig(
                "renew interval must be greater than zero".to_string(),
            ));
        }
        if self.freshness_window < self.renew_interval {
            return Err(SessionError::InvalidConfig(format!(
                "freshness window {:?} is shorter than renew interval {:?}",
                self.freshness_window, self.renew_interval
            )));
        }
        Ok(())
    }
}

impl From<&crate::config::AppConfig> for SessionConfig {
    fn from(config: &crate::config::AppConfig) -> Self {
        Self {
            channel: config.channel.clone(),
            user_id: config.user_id.clone(),
            display_name: config.display_name.clone(),
            avatar_url: config.avatar_url.clone(),
            renew_interval: config.renew_interval,
            freshness_window: config.freshness_window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(renew_ms: u64, window_ms: u64) -> SessionConfig {
        SessionConfig {
            channel: "gameWorld".to_string(),
            user_id: "me".to_string(),
            display_name: "Me".to_string(),
            avatar_url: None,
            renew_interval: Duration::from_millis(renew_ms),
            freshness_window: Duration::from_millis(window_ms),
        }
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        assert!(matches!(
            config(0, 1000).validate(),
            Err(SessionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_short_window() {
        assert!(config(500, 400).validate().is_err());
        assert!(config(500, 500).validate().is_ok());
    }
}
