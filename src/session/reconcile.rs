//! Abgleich zwischen Live-Peers und Anrufen
//!
//! Reine Funktion ohne Seiteneffekte: bestimmt, wer angerufen und welcher
//! Anruf aufgelegt werden muss.

use crate::transport::CallHandle;
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Peers ohne Anruf und ohne laufenden Verbindungsaufbau, sortiert
    pub dial: Vec<String>,
    /// Anrufe zu Peers, die nicht mehr im Snapshot sind
    pub hang_up: Vec<Uuid>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.dial.is_empty() && self.hang_up.is_empty()
    }
}

/// Plant den Abgleich
///
/// `busy` enthält Peers mit laufendem `dial` oder `answer`.
pub fn plan<'a>(
    desired: impl IntoIterator<Item = &'a str>,
    calls: &HashMap<Uuid, CallHandle>,
    busy: &HashSet<String>,
) -> ReconcilePlan {
    let desired: BTreeSet<&str> = desired.into_iter().collect();
    let connected: HashSet<&str> = calls.values().map(|c| c.peer_id.as_str()).collect();

    let dial = desired
        .iter()
        .filter(|peer| !connected.contains(*peer) && !busy.contains(**peer))
        .map(|peer| peer.to_string())
        .collect();

    let mut hang_up: Vec<_> = calls
        .values()
        .filter(|c| !desired.contains(c.peer_id.as_str()))
        .map(|c| c.id)
        .collect();
    hang_up.sort();

    ReconcilePlan { dial, hang_up }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calls_to(peers: &[&str]) -> HashMap<Uuid, CallHandle> {
        peers
            .iter()
            .map(|p| {
                let handle = CallHandle::outbound(Uuid::new_v4(), *p);
                (handle.id, handle)
            })
            .collect()
    }

    #[test]
    fn test_dials_new_and_hangs_up_missing() {
        let calls = calls_to(&["a", "c"]);
        let plan = plan(["a", "b"], &calls, &HashSet::new());

        assert_eq!(plan.dial, vec!["b"]);
        assert_eq!(plan.hang_up.len(), 1);
        assert_eq!(calls[&plan.hang_up[0]].peer_id, "c");
    }

    #[test]
    fn test_matching_state_is_a_noop() {
        let calls = calls_to(&["a", "b"]);
        assert!(plan(["b", "a"], &calls, &HashSet::new()).is_empty());
    }

    #[test]
    fn test_busy_peers_are_not_dialed_twice() {
        let busy: HashSet<String> = ["a".to_string()].into_iter().collect();
        let plan = plan(["a", "b"], &HashMap::new(), &busy);
        assert_eq!(plan.dial, vec!["b"]);
    }

    #[test]
    fn test_empty_snapshot_hangs_up_everything() {
        let calls = calls_to(&["a", "b"]);
        let plan = plan(std::iter::empty(), &calls, &HashSet::new());
        assert!(plan.dial.is_empty());
        assert_eq!(plan.hang_up.len(), 2);
    }
}
