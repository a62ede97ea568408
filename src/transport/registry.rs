//! Registry der Remote-Streams
//!
//! Pro Peer höchstens ein Eintrag. Jeder Eintrag merkt sich den Anruf,
//! der ihn angelegt hat, und nur dieser Anruf darf ihn wieder entfernen.

use super::RemoteStream;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<String, (Uuid, RemoteStream)>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Legt den Stream ab; ein älterer Stream desselben Peers wird ersetzt
    pub fn insert(&self, call_id: Uuid, stream: RemoteStream) -> Option<RemoteStream> {
        self.streams
            .lock()
            .insert(stream.peer_id.clone(), (call_id, stream))
            .map(|(_, previous)| previous)
    }

    /// Entfernt den Stream des Anrufs, falls er noch registriert ist
    pub fn remove_call(&self, call_id: Uuid) -> Option<RemoteStream> {
        let mut streams = self.streams.lock();
        let peer_id = streams
            .iter()
            .find(|(_, (id, _))| *id == call_id)
            .map(|(peer_id, _)| peer_id.clone())?;
        streams.remove(&peer_id).map(|(_, stream)| stream)
    }

    /// Stream, den genau dieser Anruf registriert hat
    pub fn for_call(&self, call_id: Uuid) -> Option<RemoteStream> {
        self.streams
            .lock()
            .values()
            .find(|(id, _)| *id == call_id)
            .map(|(_, s)| s.clone())
    }

    pub fn get(&self, peer_id: &str) -> Option<RemoteStream> {
        self.streams.lock().get(peer_id).map(|(_, s)| s.clone())
    }

    pub fn snapshot(&self) -> Vec<RemoteStream> {
        let mut streams: Vec<_> = self
            .streams
            .lock()
            .values()
            .map(|(_, s)| s.clone())
            .collect();
        streams.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        streams
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }

    pub fn clear(&self) {
        self.streams.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(peer: &str) -> RemoteStream {
        RemoteStream {
            id: format!("{}-audio", peer),
            peer_id: peer.to_string(),
        }
    }

    #[test]
    fn test_only_owning_call_removes_entry() {
        let registry = StreamRegistry::new();
        let old_call = Uuid::new_v4();
        let new_call = Uuid::new_v4();

        registry.insert(old_call, stream("bob"));
        let replaced = registry.insert(new_call, stream("bob"));
        assert!(replaced.is_some());

        assert!(registry.for_call(old_call).is_none());
        assert_eq!(registry.for_call(new_call).unwrap().peer_id, "bob");

        // Der ersetzte Anruf darf den neuen Stream nicht entfernen
        assert!(registry.remove_call(old_call).is_none());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove_call(new_call).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_sorted_by_peer() {
        let registry = StreamRegistry::new();
        registry.insert(Uuid::new_v4(), stream("carol"));
        registry.insert(Uuid::new_v4(), stream("alice"));

        let peers: Vec<_> = registry.snapshot().into_iter().map(|s| s.peer_id).collect();
        assert_eq!(peers, vec!["alice", "carol"]);
        assert_eq!(registry.get("alice").unwrap().id, "alice-audio");
    }
}
