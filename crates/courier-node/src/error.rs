use courier_discovery::DiscoveryError;
use courier_transfer::TransferError;
use courier_types::Endpoint;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The membership table says this peer has exhausted its retries and a
    /// probe could not revive it.
    #[error("peer {0} is unreachable")]
    PeerUnreachable(Endpoint),
}
