//! Signaling Module - WebSocket Client für den Signaling-Server
//!
//! Der WebRTC-Transport braucht einen Kanal, um SDP und ICE Candidates
//! mit der Gegenseite auszutauschen:
//! - WebSocket-Verbindung aufbauen und halten
//! - Nachrichten signieren und senden
//! - Eingehende Nachrichten parsen und weiterleiten
//!

mod client;
mod messages;

pub use client::{SignalingClient, SignalingError, SignalingEvent};
pub use messages::*;
