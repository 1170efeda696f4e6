use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A network endpoint another node can be reached at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// Canonical `host:port` key used by the membership table.
    pub fn peer_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Liveness state of a known peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Active,
    Inactive,
    Unknown,
}

/// A peer as tracked by the membership table and shared over gossip.
///
/// `last_seen` is unix seconds so the value survives the JSON wire format
/// unchanged between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub host: String,
    pub port: u16,
    pub last_seen: f64,
    pub status: PeerStatus,
    #[serde(default)]
    pub failed_attempts: u32,
    #[serde(default)]
    pub rtt: f64,
    #[serde(default = "full_reliability")]
    pub reliability: f64,
}

fn full_reliability() -> f64 {
    1.0
}

impl Peer {
    /// A freshly sighted peer: active, perfectly reliable until proven
    /// otherwise.
    pub fn sighted(host: impl Into<String>, port: u16) -> Self {
        Peer {
            host: host.into(),
            port,
            last_seen: unix_now(),
            status: PeerStatus::Active,
            failed_attempts: 0,
            rtt: 0.0,
            reliability: 1.0,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    pub fn peer_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
