//! Peer roster
//!
//! Tracks every remote node this node exchanges flow units with, together
//! with its liveness and its bounded outbound queue.

use crate::graph::buffer::FlowUnitBuffer;
use crate::models::{FlowUnit, Timestamp};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Liveness of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Up,
    /// Silent for longer than the staleness window
    Stale,
}

/// One remote node
#[derive(Debug)]
pub struct PeerNode {
    pub address: String,
    pub last_seen: Timestamp,
    pub status: PeerStatus,
    queue: Arc<FlowUnitBuffer>,
}

impl PeerNode {
    fn new(address: String, queue_length: usize, now: Timestamp) -> Self {
        Self {
            address,
            last_seen: now,
            status: PeerStatus::Up,
            queue: Arc::new(FlowUnitBuffer::new(queue_length)),
        }
    }

    pub fn queue(&self) -> &Arc<FlowUnitBuffer> {
        &self.queue
    }
}

/// Serializable view of a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    pub address: String,
    pub status: PeerStatus,
    pub last_seen: Timestamp,
    pub queued: usize,
    pub evicted_total: u64,
}

/// Peer that just went stale
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalePeer {
    pub address: String,
    pub silent_for: Duration,
    pub dropped_units: usize,
}

/// Concurrent map of peers keyed by address
#[derive(Debug, Default)]
pub struct PeerRoster {
    peers: DashMap<String, PeerNode>,
}

impl PeerRoster {
    pub fn new<I, S>(addresses: I, queue_length: usize, now: Timestamp) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let peers = DashMap::new();
        for address in addresses {
            let address = address.into();
            peers.insert(address.clone(), PeerNode::new(address, queue_length, now));
        }
        Self { peers }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.peers.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn status(&self, address: &str) -> Option<PeerStatus> {
        self.peers.get(address).map(|p| p.status)
    }

    pub fn stale_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.status == PeerStatus::Stale)
            .count()
    }

    /// Outbound queue of a peer. The `Arc` is cloned so no map guard is held
    /// while the caller works with it.
    pub fn queue(&self, address: &str) -> Option<Arc<FlowUnitBuffer>> {
        self.peers.get(address).map(|p| Arc::clone(&p.queue))
    }

    /// Enqueue a unit; `None` when the peer is unknown
    pub fn enqueue(&self, address: &str, unit: Arc<FlowUnit>) -> Option<usize> {
        let queue = self.queue(address)?;
        Some(queue.push(unit).evicted)
    }

    /// Record traffic with a peer. Returns true when it was stale.
    pub fn touch(&self, address: &str, now: Timestamp) -> bool {
        match self.peers.get_mut(address) {
            Some(mut peer) => {
                let was_stale = peer.status == PeerStatus::Stale;
                peer.last_seen = peer.last_seen.max(now);
                peer.status = PeerStatus::Up;
                was_stale
            }
            None => false,
        }
    }

    /// Mark peers silent for longer than `staleness` as stale and discard
    /// their pending units. Only peers changing state are returned.
    pub fn sweep(&self, now: Timestamp, staleness: Duration) -> Vec<StalePeer> {
        let limit = staleness.as_millis() as i64;
        let mut newly_stale = Vec::new();

        for mut peer in self.peers.iter_mut() {
            let silent = now - peer.last_seen;
            if peer.status == PeerStatus::Up && silent > limit {
                peer.status = PeerStatus::Stale;
                let dropped_units = peer.queue.clear();
                newly_stale.push(StalePeer {
                    address: peer.address.clone(),
                    silent_for: Duration::from_millis(silent.max(0) as u64),
                    dropped_units,
                });
            }
        }

        newly_stale.sort_by(|a, b| a.address.cmp(&b.address));
        newly_stale
    }

    /// Align the roster with a new peer list. Existing peers keep their
    /// state and pending units; every queue takes the new length.
    pub fn reconcile(
        &self,
        addresses: &[String],
        queue_length: usize,
        now: Timestamp,
    ) -> (Vec<String>, Vec<String>) {
        let wanted: BTreeSet<&str> = addresses.iter().map(String::as_str).collect();

        let mut removed: Vec<String> = self
            .peers
            .iter()
            .filter(|p| !wanted.contains(p.key().as_str()))
            .map(|p| p.key().clone())
            .collect();
        for address in &removed {
            self.peers.remove(address);
        }
        removed.sort();

        let mut added = Vec::new();
        for address in wanted {
            match self.peers.get(address) {
                Some(peer) => {
                    peer.queue.set_capacity(queue_length);
                }
                None => {
                    self.peers.insert(
                        address.to_string(),
                        PeerNode::new(address.to_string(), queue_length, now),
                    );
                    added.push(address.to_string());
                }
            }
        }

        (added, removed)
    }

    /// Addresses in sorted order
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.peers.iter().map(|p| p.key().clone()).collect();
        addresses.sort();
        addresses
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self
            .peers
            .iter()
            .map(|p| {
                let stats = p.queue.stats();
                PeerSnapshot {
                    address: p.address.clone(),
                    status: p.status,
                    last_seen: p.last_seen,
                    queued: stats.entries,
                    evicted_total: stats.evicted_total,
                }
            })
            .collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "10.0.0.2:9650";
    const B: &str = "10.0.0.3:9650";

    fn unit(ts: i64) -> Arc<FlowUnit> {
        Arc::new(FlowUnit::empty(ts))
    }

    #[test]
    fn test_enqueue_unknown_peer() {
        let roster = PeerRoster::new([A], 2, 0);
        assert_eq!(roster.enqueue(A, unit(1)), Some(0));
        assert_eq!(roster.enqueue(B, unit(1)), None);
    }

    #[test]
    fn test_sweep_marks_silent_peers_once() {
        let roster = PeerRoster::new([A, B], 4, 0);
        roster.enqueue(A, unit(1));
        roster.touch(B, 9_000);

        let stale = roster.sweep(10_000, Duration::from_secs(5));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].address, A);
        assert_eq!(stale[0].dropped_units, 1);
        assert_eq!(roster.status(A), Some(PeerStatus::Stale));
        assert_eq!(roster.status(B), Some(PeerStatus::Up));

        // Already stale, not reported again
        assert!(roster.sweep(11_000, Duration::from_secs(5)).is_empty());
        assert_eq!(roster.stale_count(), 1);
    }

    #[test]
    fn test_touch_revives_stale_peer() {
        let roster = PeerRoster::new([A], 4, 0);
        roster.sweep(60_000, Duration::from_secs(5));
        assert!(roster.touch(A, 61_000));
        assert_eq!(roster.status(A), Some(PeerStatus::Up));
        assert!(!roster.touch(A, 62_000));
    }

    #[test]
    fn test_reconcile() {
        let roster = PeerRoster::new([A, B], 4, 0);
        roster.enqueue(A, unit(1));
        roster.enqueue(A, unit(2));
        roster.enqueue(A, unit(3));

        let c = "10.0.0.4:9650".to_string();
        let (added, removed) = roster.reconcile(&[A.to_string(), c.clone()], 2, 5);

        assert_eq!(added, vec![c.clone()]);
        assert_eq!(removed, vec![B.to_string()]);
        assert_eq!(roster.addresses(), vec![A.to_string(), c]);
        // Shrunk queue keeps the newest units
        let queue = roster.queue(A).unwrap();
        assert_eq!(queue.capacity(), 2);
        assert_eq!(queue.snapshot()[0].timestamp(), 2);
    }
}
