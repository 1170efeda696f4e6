//! The gossip wire format: JSON datagrams discriminated by a `type` field.

use courier_types::{Endpoint, Peer};
use serde::{Deserialize, Serialize};

/// Every datagram the discovery layer sends or understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipMessage {
    /// Periodic push of the sender's active-peer view.
    Gossip {
        source: Endpoint,
        peers: Vec<Peer>,
        timestamp: f64,
    },
    /// A node announcing itself via a bootstrap peer.
    Join { peer: Endpoint, timestamp: f64 },
    /// Reply to `Join`, carrying the responder's active peers.
    JoinAck { peers: Vec<Peer> },
    /// Liveness probe for a peer that stopped responding.
    HealthCheck { source: Endpoint, timestamp: f64 },
    /// Reply to `HealthCheck`.
    HealthCheckAck { status: String, timestamp: f64 },
}

impl GossipMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::unix_now;

    #[test]
    fn type_discriminants_match_the_wire_names() {
        let cases: Vec<(GossipMessage, &str)> = vec![
            (
                GossipMessage::Gossip {
                    source: Endpoint::new("10.0.0.1", 5000),
                    peers: vec![],
                    timestamp: unix_now(),
                },
                "\"type\":\"gossip\"",
            ),
            (
                GossipMessage::Join {
                    peer: Endpoint::new("10.0.0.2", 5001),
                    timestamp: unix_now(),
                },
                "\"type\":\"join\"",
            ),
            (GossipMessage::JoinAck { peers: vec![] }, "\"type\":\"join_ack\""),
            (
                GossipMessage::HealthCheck {
                    source: Endpoint::new("10.0.0.3", 5002),
                    timestamp: unix_now(),
                },
                "\"type\":\"health_check\"",
            ),
            (
                GossipMessage::HealthCheckAck {
                    status: "healthy".into(),
                    timestamp: unix_now(),
                },
                "\"type\":\"health_check_ack\"",
            ),
        ];
        for (message, tag) in cases {
            let json = String::from_utf8(message.to_bytes().unwrap()).unwrap();
            assert!(json.contains(tag), "{json} missing {tag}");
        }
    }

    #[test]
    fn gossip_roundtrip_keeps_peer_metadata() {
        let message = GossipMessage::Gossip {
            source: Endpoint::new("192.168.0.9", 5000),
            peers: vec![Peer::sighted("192.168.0.10", 5001)],
            timestamp: 1234.5,
        };
        let back = GossipMessage::from_bytes(&message.to_bytes().unwrap()).unwrap();
        match back {
            GossipMessage::Gossip { peers, timestamp, .. } => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].peer_id(), "192.168.0.10:5001");
                assert!((timestamp - 1234.5).abs() < f64::EPSILON);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(GossipMessage::from_bytes(br#"{"type":"teleport","x":1}"#).is_err());
    }
}
