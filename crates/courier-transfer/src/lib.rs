//! Transfer strategies for the courier peer-to-peer file service.
//!
//! Five strategies share one send/receive contract over length-prefixed,
//! encrypted TCP records: `Normal` (plain streaming), `TokenBucket`
//! (rate-shaped), `Aimd` (sliding-window reliable transport with
//! Jacobson/Karels timers), `Parallel` (one file across N substreams),
//! `Qos` (weighted bandwidth sharing) and `Multicast` (one-to-many).
//! Supporting pieces (record framing, the token bucket, the AIMD
//! controller, the QoS allocator and per-transfer stats) are exposed for
//! reuse and testing.

pub mod congestion;
pub mod error;
pub mod framing;
pub mod qos;
pub mod stats;
pub mod strategy;
pub mod token_bucket;

pub use congestion::{AckOutcome, AimdController, AimdSnapshot, CongestionSignal};
pub use error::TransferError;
pub use qos::{QosManager, TransferPriority};
pub use stats::{StatsReport, TransferStats};
pub use strategy::{
    AimdTransport, MulticastReport, MulticastTransport, NormalTransport, ParallelTransport,
    QosTransport, Received, Strategy, TokenBucketTransport, TransferReport, CHUNK_SIZE,
};
pub use token_bucket::TokenBucket;
