//! Node configuration, including the environment mapping consumed at
//! startup: `DEFAULT_MODE`, `GOSSIP_INTERVAL`, `DISABLE_GOSSIP`,
//! `AIMD_WINDOW`, `AIMD_MIN_WINDOW`, `AIMD_MAX_WINDOW` and
//! `PARALLEL_THREADS`.

use std::path::PathBuf;
use std::time::Duration;

use courier_types::{AimdOptions, Mode, ParallelOptions};

use crate::error::NodeError;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Host this node binds transfer listeners and the discovery port on.
    pub host: String,
    /// Base port for inbound transfers.
    pub transfer_port: u16,
    /// UDP port for gossip, joins and health checks.
    pub discovery_port: u16,
    /// The pre-provisioned shared transfer key.
    pub key: [u8; 32],
    pub mode: Mode,
    pub gossip_interval: Duration,
    pub gossip_enabled: bool,
    /// Timeout for discovery requests (join, health check).
    pub discovery_timeout: Duration,
    /// Attempts for discovery requests before a peer counts as failed.
    pub discovery_retries: u32,
    /// AIMD settings applied whenever the mode switches to AIMD.
    pub aimd: AimdOptions,
    /// Parallel settings applied whenever the mode switches to Parallel.
    pub parallel: ParallelOptions,
    /// Where received files are written.
    pub output_dir: PathBuf,
    /// Where stats reports are persisted; `None` disables persistence.
    pub report_dir: Option<PathBuf>,
}

impl NodeConfig {
    pub fn new(host: impl Into<String>, transfer_port: u16, discovery_port: u16, key: [u8; 32]) -> Self {
        NodeConfig {
            host: host.into(),
            transfer_port,
            discovery_port,
            key,
            mode: Mode::Normal,
            gossip_interval: Duration::from_secs(5),
            gossip_enabled: true,
            discovery_timeout: Duration::from_secs(3),
            discovery_retries: 3,
            aimd: AimdOptions::default(),
            parallel: ParallelOptions::default(),
            output_dir: PathBuf::from("."),
            report_dir: Some(PathBuf::from(".")),
        }
    }

    /// Build a config from the environment, after loading `.env` if one is
    /// present. Unset variables keep their defaults; malformed values are
    /// rejected rather than guessed at.
    pub fn from_env(
        host: impl Into<String>,
        transfer_port: u16,
        discovery_port: u16,
        key: [u8; 32],
    ) -> Result<Self, NodeError> {
        let _ = dotenvy::dotenv();
        let mut config = Self::new(host, transfer_port, discovery_port, key);
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), NodeError> {
        if let Some(mode) = read_var("DEFAULT_MODE") {
            self.mode = mode.parse::<Mode>().map_err(NodeError::Config)?;
        }
        if let Some(interval) = read_var("GOSSIP_INTERVAL") {
            let secs: f64 = interval
                .parse()
                .map_err(|_| NodeError::Config(format!("GOSSIP_INTERVAL {interval:?} is not a number")))?;
            if !secs.is_finite() || secs <= 0.0 {
                return Err(NodeError::Config(format!(
                    "GOSSIP_INTERVAL {secs} must be positive"
                )));
            }
            self.gossip_interval = Duration::from_secs_f64(secs);
        }
        if let Some(disabled) = read_var("DISABLE_GOSSIP") {
            self.gossip_enabled = !parse_bool("DISABLE_GOSSIP", &disabled)?;
        }
        if let Some(window) = read_u64("AIMD_WINDOW")? {
            self.aimd.initial_window = window;
        }
        if let Some(window) = read_u64("AIMD_MIN_WINDOW")? {
            self.aimd.min_window = window;
        }
        if let Some(window) = read_u64("AIMD_MAX_WINDOW")? {
            self.aimd.max_window = window;
        }
        if let Some(threads) = read_u64("PARALLEL_THREADS")? {
            if threads == 0 {
                return Err(NodeError::Config("PARALLEL_THREADS must be at least 1".into()));
            }
            self.parallel.streams = threads as usize;
        }

        // Mode picked from the environment uses the overridden options.
        match &mut self.mode {
            Mode::Aimd(opts) => *opts = self.aimd,
            Mode::Parallel(opts) => *opts = self.parallel,
            _ => {}
        }
        Ok(())
    }
}

fn read_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_u64(name: &str) -> Result<Option<u64>, NodeError> {
    match read_var(name) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| NodeError::Config(format!("{name} {value:?} is not a whole number"))),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, NodeError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(NodeError::Config(format!("{name} {other:?} is not a boolean"))),
    }
}
