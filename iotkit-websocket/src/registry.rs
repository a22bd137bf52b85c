// Copyright 2025 The Drasi Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Registry of connected server peers.
//!
//! Owned by the server's hub task. Peer tasks and callers never touch it
//! directly; they send commands to the hub instead.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Server-assigned peer identifier, unique for the lifetime of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub(crate) u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PeerSendError {
    #[error("peer connection closed")]
    Closed,
    #[error("peer send queue full")]
    Full,
}

/// Outbound side of one registered peer.
pub trait PeerSink {
    /// Queue an encoded frame without waiting.
    fn deliver(&self, payload: &Arc<str>) -> Result<(), PeerSendError>;

    /// Ask the peer's connection to shut down.
    fn close(&self);
}

/// A peer removed because delivery to it failed.
#[derive(Debug)]
pub struct Pruned<S> {
    pub id: PeerId,
    pub sink: S,
    pub reason: PeerSendError,
}

#[derive(Debug)]
pub struct BroadcastReport<S> {
    pub delivered: usize,
    pub pruned: Vec<Pruned<S>>,
}

pub struct ClientRegistry<S> {
    peers: BTreeMap<PeerId, S>,
}

impl<S> Default for ClientRegistry<S> {
    fn default() -> Self {
        Self {
            peers: BTreeMap::new(),
        }
    }
}

impl<S: PeerSink> ClientRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: PeerId, sink: S) -> Option<S> {
        self.peers.insert(id, sink)
    }

    pub fn remove(&mut self, id: &PeerId) -> Option<S> {
        self.peers.remove(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<&S> {
        self.peers.get(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Deliver `payload` to every peer. Peers whose delivery fails are
    /// removed and returned; the rest still receive the frame.
    pub fn broadcast(&mut self, payload: &Arc<str>) -> BroadcastReport<S> {
        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, sink) in &self.peers {
            match sink.deliver(payload) {
                Ok(()) => delivered += 1,
                Err(reason) => failed.push((*id, reason)),
            }
        }

        let pruned = failed
            .into_iter()
            .filter_map(|(id, reason)| {
                self.peers
                    .remove(&id)
                    .map(|sink| Pruned { id, sink, reason })
            })
            .collect();
        BroadcastReport { delivered, pruned }
    }

    /// Remove every peer, in id order.
    pub fn drain(&mut self) -> Vec<(PeerId, S)> {
        std::mem::take(&mut self.peers).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FakePeer {
        fail_with: Option<PeerSendError>,
        received: Mutex<Vec<String>>,
        closed: AtomicBool,
    }

    impl PeerSink for Arc<FakePeer> {
        fn deliver(&self, payload: &Arc<str>) -> Result<(), PeerSendError> {
            if let Some(err) = self.fail_with {
                return Err(err);
            }
            self.received.lock().push(payload.to_string());
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_broadcast_prunes_only_failing_peers() {
        let mut registry = ClientRegistry::new();
        let healthy: Vec<Arc<FakePeer>> = (0..4).map(|_| Arc::new(FakePeer::default())).collect();
        let broken = Arc::new(FakePeer {
            fail_with: Some(PeerSendError::Closed),
            ..FakePeer::default()
        });

        registry.insert(PeerId(0), healthy[0].clone());
        registry.insert(PeerId(1), healthy[1].clone());
        registry.insert(PeerId(2), broken.clone());
        registry.insert(PeerId(3), healthy[2].clone());
        registry.insert(PeerId(4), healthy[3].clone());

        let payload: Arc<str> = Arc::from(r#"{"name":"t"}"#);
        let report = registry.broadcast(&payload);

        assert_eq!(report.delivered, 4);
        assert_eq!(report.pruned.len(), 1);
        assert_eq!(report.pruned[0].id, PeerId(2));
        assert_eq!(report.pruned[0].reason, PeerSendError::Closed);
        assert!(registry.get(&PeerId(2)).is_none());
        assert_eq!(registry.len(), 4);
        for peer in &healthy {
            assert_eq!(peer.received.lock().as_slice(), [r#"{"name":"t"}"#.to_string()]);
        }

        let report = registry.broadcast(&payload);
        assert_eq!(report.delivered, 4);
        assert!(report.pruned.is_empty());
    }

    #[test]
    fn test_full_queue_counts_as_failure() {
        let mut registry = ClientRegistry::new();
        registry.insert(
            PeerId(7),
            Arc::new(FakePeer {
                fail_with: Some(PeerSendError::Full),
                ..FakePeer::default()
            }),
        );

        let report = registry.broadcast(&Arc::from("{}"));
        assert_eq!(report.delivered, 0);
        assert_eq!(report.pruned[0].reason, PeerSendError::Full);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drain_empties_registry() {
        let mut registry = ClientRegistry::new();
        registry.insert(PeerId(2), Arc::new(FakePeer::default()));
        registry.insert(PeerId(1), Arc::new(FakePeer::default()));

        let drained: Vec<PeerId> = registry.drain().into_iter().map(|(id, _)| id).collect();
        assert_eq!(drained, vec![PeerId(1), PeerId(2)]);
        assert!(registry.is_empty());
        assert_eq!(PeerId(1).to_string(), "peer-1");
    }
}
