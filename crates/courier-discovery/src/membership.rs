//! The membership table: every peer this node knows about, keyed
//! `host:port`, behind one mutex. The lock is never held across a network
//! call.

use std::collections::HashMap;

use courier_types::{unix_now, Endpoint, Peer, PeerStatus};
use parking_lot::Mutex;
use tracing::{info, warn};

/// Reliability moves up by this much on success...
const RELIABILITY_REWARD: f64 = 0.1;
/// ...and down by this much on failure.
const RELIABILITY_PENALTY: f64 = 0.2;
/// Reliability never decays below this floor.
const RELIABILITY_FLOOR: f64 = 0.1;

pub struct MembershipTable {
    own: Endpoint,
    peers: Mutex<HashMap<String, Peer>>,
}

impl MembershipTable {
    pub fn new(own: Endpoint) -> Self {
        MembershipTable {
            own,
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn own_endpoint(&self) -> &Endpoint {
        &self.own
    }

    /// Upsert a peer on any inbound evidence of life. The node's own
    /// endpoint is never inserted.
    pub fn record_sighting(&self, host: &str, port: u16) {
        if host == self.own.host && port == self.own.port {
            return;
        }
        let key = format!("{host}:{port}");
        let mut peers = self.peers.lock();
        match peers.get_mut(&key) {
            Some(peer) => {
                peer.last_seen = unix_now();
                peer.status = PeerStatus::Active;
                if peer.failed_attempts > 0 {
                    peer.failed_attempts = 0;
                }
            }
            None => {
                peers.insert(key.clone(), Peer::sighted(host, port));
                info!(peer = %key, "new peer discovered");
            }
        }
    }

    /// One failed exchange: reliability drops, and enough consecutive
    /// failures park the peer as inactive.
    pub fn mark_failure(&self, host: &str, port: u16, max_retries: u32) {
        let key = format!("{host}:{port}");
        let mut peers = self.peers.lock();
        if let Some(peer) = peers.get_mut(&key) {
            peer.failed_attempts += 1;
            peer.reliability = (peer.reliability - RELIABILITY_PENALTY).max(RELIABILITY_FLOOR);
            if peer.failed_attempts >= max_retries && peer.status != PeerStatus::Inactive {
                peer.status = PeerStatus::Inactive;
                warn!(
                    peer = %key,
                    failures = peer.failed_attempts,
                    "peer marked inactive"
                );
            }
        }
    }

    /// One successful exchange: reliability recovers, failures reset, and
    /// the RTT sample is stored when one was measured.
    pub fn mark_success(&self, host: &str, port: u16, rtt: Option<f64>) {
        let key = format!("{host}:{port}");
        let mut peers = self.peers.lock();
        if let Some(peer) = peers.get_mut(&key) {
            peer.reliability = (peer.reliability + RELIABILITY_REWARD).min(1.0);
            peer.failed_attempts = 0;
            if let Some(rtt) = rtt {
                peer.rtt = rtt;
            }
        }
    }

    /// A health probe succeeded: the peer is live again.
    pub fn mark_recovered(&self, host: &str, port: u16) {
        let key = format!("{host}:{port}");
        let mut peers = self.peers.lock();
        if let Some(peer) = peers.get_mut(&key) {
            if peer.status != PeerStatus::Active {
                info!(peer = %key, "peer recovered through health check");
            }
            peer.status = PeerStatus::Active;
            peer.failed_attempts = 0;
            peer.last_seen = unix_now();
        }
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<Peer> {
        self.peers.lock().get(&endpoint.peer_id()).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Endpoints currently believed alive.
    pub fn active_peers(&self) -> Vec<Endpoint> {
        self.peers
            .lock()
            .values()
            .filter(|p| p.status == PeerStatus::Active)
            .map(Peer::endpoint)
            .collect()
    }

    /// Active peers at or above `threshold`, most reliable first.
    pub fn reliable_peers(&self, threshold: f64) -> Vec<(Endpoint, f64)> {
        let mut reliable: Vec<(Endpoint, f64)> = self
            .peers
            .lock()
            .values()
            .filter(|p| p.status == PeerStatus::Active && p.reliability >= threshold)
            .map(|p| (p.endpoint(), p.reliability))
            .collect();
        reliable.sort_by(|a, b| b.1.total_cmp(&a.1));
        reliable
    }

    /// Copy of the full table.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.lock().values().cloned().collect()
    }

    /// Copy of the active subset.
    pub fn active_snapshot(&self) -> Vec<Peer> {
        self.peers
            .lock()
            .values()
            .filter(|p| p.status == PeerStatus::Active)
            .cloned()
            .collect()
    }
}
