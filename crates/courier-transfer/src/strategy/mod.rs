//! The five transfer strategies, sharing one send/receive contract.
//!
//! A successful `send` delivers every byte of the source file into the
//! receiver's `received_<basename>` output file; strategy-specific pacing,
//! windowing and fan-out happen between those two facts.

mod aimd;
mod multicast;
mod normal;
mod parallel;
mod qos;
mod token_bucket;

pub use aimd::AimdTransport;
pub use multicast::{MulticastReport, MulticastTransport};
pub use normal::NormalTransport;
pub use parallel::ParallelTransport;
pub use qos::QosTransport;
pub use token_bucket::TokenBucketTransport;

use std::path::{Path, PathBuf};
use std::time::Duration;

use courier_types::Endpoint;

use crate::error::TransferError;

/// Chunk granularity shared by every strategy: 8 KiB.
pub const CHUNK_SIZE: usize = 8192;

/// Outcome of a completed send.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub bytes: u64,
    pub duration: Duration,
    pub average_rate_kbps: f64,
}

/// Outcome of a completed receive.
#[derive(Debug, Clone)]
pub struct Received {
    /// Path of the written output file.
    pub path: PathBuf,
    /// Original filename announced by the sender.
    pub filename: String,
    pub bytes: u64,
}

/// Common contract every strategy exposes to the orchestrator.
pub trait Strategy {
    /// Send `path` to `target`, blocking until delivered or failed.
    fn send(&mut self, path: &Path, target: &Endpoint) -> Result<TransferReport, TransferError>;

    /// Accept one inbound transfer on this strategy's listen endpoint.
    fn receive(&mut self) -> Result<Received, TransferError>;
}

/// `received_<basename>` inside the receiver's output directory.
pub(crate) fn output_path(dir: &Path, filename: &str) -> PathBuf {
    dir.join(format!("received_{filename}"))
}

/// The basename a sender announces in the handshake.
pub(crate) fn basename(path: &Path) -> Result<String, TransferError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned)
        .ok_or_else(|| {
            TransferError::Config(format!("{} has no usable file name", path.display()))
        })
}
