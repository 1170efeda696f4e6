use courier_crypto::CryptoError;
use thiserror::Error;

/// Failure of a single transfer operation. The detecting layer closes its
/// sockets and files, records the error in the transfer stats, and returns
/// this to its caller; nothing unwinds across threads.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A record failed to decrypt. Fatal to the transfer the record
    /// belonged to.
    #[error("record decrypt failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransferError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        TransferError::Protocol(msg.into())
    }
}
