//! Message Types für das Signaling-Protokoll
//!
//! Jede anruf-bezogene Nachricht trägt eine `callId`, damit mehrere
//! gleichzeitige Anrufe (auch zwei zum selben Peer) auseinandergehalten
//! werden können.

use serde::{Deserialize, Serialize};

/// Fehlercode des Servers wenn die Peer-ID schon vergeben ist
pub const ERROR_PEER_ID_TAKEN: i32 = 409;

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Registrierung unter einer Peer-ID
#[derive(Debug, Clone, Serialize)]
pub struct RegisterPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "peerId")]
    pub peer_id: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

impl RegisterPayload {
    pub fn new(peer_id: String, public_key: String) -> Self {
        Self {
            msg_type: "register",
            peer_id,
            public_key,
        }
    }
}

/// SDP Offer oder Answer
#[derive(Debug, Clone, Serialize)]
pub struct SessionDescriptionPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "fromPeerId")]
    pub from_peer_id: String,
    #[serde(rename = "toPeerId")]
    pub to_peer_id: String,
    #[serde(rename = "callId")]
    pub call_id: String,
    pub sdp: String,
}

impl SessionDescriptionPayload {
    pub fn offer(from_peer_id: String, to_peer_id: String, call_id: String, sdp: String) -> Self {
        Self {
            msg_type: "offer",
            from_peer_id,
            to_peer_id,
            call_id,
            sdp,
        }
    }

    pub fn answer(from_peer_id: String, to_peer_id: String, call_id: String, sdp: String) -> Self {
        Self {
            msg_type: "answer",
            from_peer_id,
            to_peer_id,
            call_id,
            sdp,
        }
    }
}

/// ICE Candidate
#[derive(Debug, Clone, Serialize)]
pub struct IceCandidatePayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "fromPeerId")]
    pub from_peer_id: String,
    #[serde(rename = "toPeerId")]
    pub to_peer_id: String,
    #[serde(rename = "callId")]
    pub call_id: String,
    pub candidate: String,
}

impl IceCandidatePayload {
    pub fn new(from_peer_id: String, to_peer_id: String, call_id: String, candidate: String) -> Self {
        Self {
            msg_type: "ice_candidate",
            from_peer_id,
            to_peer_id,
            call_id,
            candidate,
        }
    }
}

/// Anruf ablehnen oder beenden
#[derive(Debug, Clone, Serialize)]
pub struct CallControlPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "fromPeerId")]
    pub from_peer_id: String,
    #[serde(rename = "toPeerId")]
    pub to_peer_id: String,
    #[serde(rename = "callId")]
    pub call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CallControlPayload {
    pub fn reject(
        from_peer_id: String,
        to_peer_id: String,
        call_id: String,
        reason: Option<String>,
    ) -> Self {
        Self {
            msg_type: "reject_call",
            from_peer_id,
            to_peer_id,
            call_id,
            reason,
        }
    }

    pub fn hangup(from_peer_id: String, to_peer_id: String, call_id: String) -> Self {
        Self {
            msg_type: "hangup",
            from_peer_id,
            to_peer_id,
            call_id,
            reason: None,
        }
    }
}

/// Heartbeat
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "peerId")]
    pub peer_id: String,
}

impl HeartbeatPayload {
    pub fn new(peer_id: String) -> Self {
        Self {
            msg_type: "heartbeat",
            peer_id,
        }
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Server-Nachrichten
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Erfolgreiche Registrierung
    Registered {
        #[serde(rename = "peerId")]
        peer_id: String,
        timestamp: i64,
    },

    /// Eingehendes SDP Offer
    IncomingOffer {
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        sdp: String,
        timestamp: i64,
    },

    /// Eingehendes SDP Answer
    IncomingAnswer {
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        sdp: String,
        timestamp: i64,
    },

    /// Eingehender ICE Candidate
    IncomingIceCandidate {
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        candidate: String,
        timestamp: i64,
    },

    /// Anruf wurde abgelehnt
    CallRejected {
        #[serde(rename = "byPeerId")]
        by_peer_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        reason: Option<String>,
        timestamp: i64,
    },

    /// Anruf wurde beendet
    CallEnded {
        #[serde(rename = "byPeerId")]
        by_peer_id: String,
        #[serde(rename = "callId")]
        call_id: String,
        timestamp: i64,
    },

    /// Fehler
    Error {
        code: i32,
        message: String,
        timestamp: i64,
    },

    /// Heartbeat Antwort
    Pong { timestamp: i64 },
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_serialization() {
        let payload = SessionDescriptionPayload::offer(
            "alice".to_string(),
            "bob".to_string(),
            "call-1".to_string(),
            "v=0".to_string(),
        );
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["type"], "offer");
        assert_eq!(json["fromPeerId"], "alice");
        assert_eq!(json["toPeerId"], "bob");
        assert_eq!(json["callId"], "call-1");
    }

    #[test]
    fn test_hangup_omits_reason() {
        let payload =
            CallControlPayload::hangup("alice".to_string(), "bob".to_string(), "c".to_string());
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["type"], "hangup");
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn test_parse_incoming_offer() {
        let raw = r#"{"type":"incoming_offer","fromPeerId":"bob","callId":"c-9","sdp":"v=0","timestamp":1}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();

        match msg {
            ServerMessage::IncomingOffer {
                from_peer_id,
                call_id,
                ..
            } => {
                assert_eq!(from_peer_id, "bob");
                assert_eq!(call_id, "c-9");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_conflict_error() {
        let raw = r#"{"type":"error","code":409,"message":"peer id taken","timestamp":1}"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            msg,
            ServerMessage::Error {
                code: ERROR_PEER_ID_TAKEN,
                ..
            }
        ));
    }
}
