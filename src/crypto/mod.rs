//! Crypto Module - Lokale Identität
//!
//! Jeder Client besitzt pro Benutzer ein Ed25519 Schlüsselpaar:
//! - Generierung beim ersten Join
//! - Persistente Speicherung im App-Datenverzeichnis
//! - Signierung der Nachrichten an den Signaling-Server
//!

mod identity;

pub use identity::{verify_message, IdentityError, LocalIdentity};
