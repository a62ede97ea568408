//! Voice Session - Beitritt, Abgleich der Anrufe, Mute
//!
//! Zustände: `Idle -> Joining -> Joined -> Idle`. Im Zustand `Joined` wird
//! bei jedem Live-Peer-Snapshot die Menge der Anrufe an die Menge der
//! Peers angeglichen.

mod machine;
mod reconcile;
mod state;

pub use machine::VoiceSession;
pub use reconcile::{plan as plan_reconcile, ReconcilePlan};
pub use state::{
    CallSummary, SessionConfig, SessionError, SessionEvent, SessionPhase, SessionSnapshot,
};
