use std::str::FromStr;
use std::time::Duration;

/// Options for the token-bucket shaped strategy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketOptions {
    /// Maximum tokens the bucket can hold. One token covers ~1 KiB.
    pub bucket_size: u64,
    /// Refill rate in tokens per second.
    pub token_rate: f64,
    /// How long the sender waits for the per-record ACK byte.
    pub ack_timeout: Duration,
}

impl Default for TokenBucketOptions {
    fn default() -> Self {
        TokenBucketOptions {
            bucket_size: 1024,
            token_rate: 100.0,
            ack_timeout: Duration::from_secs(5),
        }
    }
}

/// Options for the AIMD reliable strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AimdOptions {
    /// Starting congestion window in bytes.
    pub initial_window: u64,
    /// Floor the window never decreases below.
    pub min_window: u64,
    /// Ceiling for additive increase.
    pub max_window: u64,
    /// Detect congestion from retransmission timeouts.
    pub timeout_detection: bool,
    /// Detect congestion from duplicate ACK runs.
    pub dupack_detection: bool,
    /// Consecutive duplicate ACKs that trigger fast retransmit.
    pub dup_ack_threshold: u32,
}

impl Default for AimdOptions {
    fn default() -> Self {
        AimdOptions {
            initial_window: 1024,
            min_window: 1024,
            max_window: 65536,
            timeout_detection: true,
            dupack_detection: true,
            dup_ack_threshold: 3,
        }
    }
}

/// Options for the multi-stream parallel strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelOptions {
    /// Number of concurrent substreams (and consecutive ports).
    pub streams: usize,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        ParallelOptions { streams: 4 }
    }
}

/// Options for the QoS weighted strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosOptions {
    /// Priority level; weight is `1 / level`, so level 1 is fastest.
    pub priority_level: u32,
    /// Bandwidth floor in bytes per second.
    pub min_bandwidth: u64,
}

impl Default for QosOptions {
    fn default() -> Self {
        QosOptions {
            priority_level: 1,
            min_bandwidth: 100_000,
        }
    }
}

/// Options for the one-to-many multicast strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastOptions {
    /// Overall deadline for the fan-out send.
    pub timeout: Duration,
}

impl Default for MulticastOptions {
    fn default() -> Self {
        MulticastOptions {
            timeout: Duration::from_secs(30),
        }
    }
}

/// Transfer strategy selection, one variant per mode with its own options.
#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    Normal,
    TokenBucket(TokenBucketOptions),
    Aimd(AimdOptions),
    Parallel(ParallelOptions),
    Qos(QosOptions),
    Multicast(MulticastOptions),
}

impl Mode {
    /// Short label used in stats reports and log lines.
    pub fn label(&self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::TokenBucket(_) => "token-bucket",
            Mode::Aimd(_) => "aimd",
            Mode::Parallel(_) => "parallel",
            Mode::Qos(_) => "qos",
            Mode::Multicast(_) => "multicast",
        }
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Normal
    }
}

impl FromStr for Mode {
    type Err = String;

    /// Parses the mode names accepted by the `DEFAULT_MODE` environment
    /// variable, each with default options.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Mode::Normal),
            "token-bucket" | "token_bucket" => Ok(Mode::TokenBucket(Default::default())),
            "aimd" => Ok(Mode::Aimd(Default::default())),
            "parallel" => Ok(Mode::Parallel(Default::default())),
            "qos" => Ok(Mode::Qos(Default::default())),
            "multicast" => Ok(Mode::Multicast(Default::default())),
            other => Err(format!("unknown transfer mode: {other}")),
        }
    }
}
