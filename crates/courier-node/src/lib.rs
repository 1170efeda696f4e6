//! The orchestrator façade a driver talks to: mode selection, sends,
//! receives, peer queries, health checks and gossip lifecycle, with
//! per-session counters and reliability feedback into the membership table.
//!
//! The node borrows the membership table through its discovery handle; the
//! discovery layer never reaches back into the node.

mod config;
mod error;

pub use config::NodeConfig;
pub use error::NodeError;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use courier_crypto::RecordCipher;
use courier_discovery::{DiscoveryConfig, MembershipTable, PeerDiscovery};
use courier_transfer::strategy::{
    AimdTransport, MulticastReport, MulticastTransport, NormalTransport, ParallelTransport,
    QosTransport, Received, Strategy, TokenBucketTransport, TransferReport,
};
use courier_transfer::QosManager;
use courier_types::{AimdOptions, Endpoint, Mode, Peer, PeerStatus};
use tracing::{info, warn};

/// Per-session transfer counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionCounters {
    pub total_bytes_transferred: u64,
    pub successful_transfers: u64,
    pub failed_transfers: u64,
}

pub struct Node {
    config: NodeConfig,
    cipher: Arc<RecordCipher>,
    qos_manager: Arc<QosManager>,
    discovery: PeerDiscovery,
    started: bool,
    counters: SessionCounters,
}

impl Node {
    fn discovery_config(config: &NodeConfig) -> DiscoveryConfig {
        DiscoveryConfig {
            timeout: config.discovery_timeout,
            max_retries: config.discovery_retries,
            ..DiscoveryConfig::new(config.host.clone(), config.discovery_port)
                .with_gossip_interval(config.gossip_interval)
        }
    }

    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let discovery = PeerDiscovery::new(Self::discovery_config(&config))?;
        Ok(Node {
            cipher: Arc::new(RecordCipher::new(config.key)),
            qos_manager: Arc::new(QosManager::new()),
            discovery,
            started: false,
            counters: SessionCounters::default(),
            config,
        })
    }

    /// Start background services (gossip, when enabled).
    pub fn start(&mut self) -> Result<(), NodeError> {
        if self.config.gossip_enabled {
            self.discovery.start()?;
        }
        self.started = true;
        info!(
            host = %self.config.host,
            transfer_port = self.config.transfer_port,
            discovery_port = self.config.discovery_port,
            mode = self.config.mode.label(),
            gossip = self.config.gossip_enabled,
            "node started"
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        self.discovery.stop();
        self.started = false;
        info!("node stopped");
    }

    pub fn set_mode(&mut self, mode: Mode) {
        info!(mode = mode.label(), "transfer mode set");
        self.config.mode = mode;
    }

    pub fn mode(&self) -> &Mode {
        &self.config.mode
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    /// Replace the AIMD settings used by future AIMD transfers.
    pub fn configure_aimd(&mut self, opts: AimdOptions) -> Result<(), NodeError> {
        // Validated the same way the transport will.
        courier_transfer::AimdController::new(opts)?;
        self.config.aimd = opts;
        if let Mode::Aimd(current) = &mut self.config.mode {
            *current = opts;
        }
        Ok(())
    }

    /// Reconfigure gossip. A changed interval rebuilds the discovery
    /// service (losing the learned membership, as a fresh service would);
    /// toggling only starts or stops the existing one.
    pub fn configure_gossip(&mut self, interval: Duration, enabled: bool) -> Result<(), NodeError> {
        if interval.is_zero() {
            return Err(NodeError::Config("gossip interval must be positive".into()));
        }
        if interval != self.config.gossip_interval {
            self.discovery.stop();
            self.config.gossip_interval = interval;
            self.discovery = PeerDiscovery::new(Self::discovery_config(&self.config))?;
        }
        self.config.gossip_enabled = enabled;
        if self.started {
            if enabled {
                self.discovery.start()?;
            } else {
                self.discovery.stop();
            }
        }
        Ok(())
    }

    pub fn join_network(&self, bootstrap: &Endpoint) -> Result<usize, NodeError> {
        Ok(self.discovery.join_network(bootstrap)?)
    }

    pub fn membership(&self) -> Arc<MembershipTable> {
        self.discovery.table()
    }

    /// Everything the node knows, active or not.
    pub fn list_peers(&self) -> Vec<Peer> {
        self.discovery.table().snapshot()
    }

    pub fn active_peers(&self) -> Vec<Endpoint> {
        self.discovery.table().active_peers()
    }

    pub fn reliable_peers(&self, threshold: f64) -> Vec<(Endpoint, f64)> {
        self.discovery.table().reliable_peers(threshold)
    }

    /// One-shot UDP liveness probe against a peer's discovery port.
    pub fn health_check(&self, target: &Endpoint) -> Result<Duration, NodeError> {
        Ok(self.discovery.probe(target)?)
    }

    fn build_strategy(&self) -> Box<dyn Strategy> {
        let listen = Endpoint::new(self.config.host.clone(), self.config.transfer_port);
        let cipher = Arc::clone(&self.cipher);
        match &self.config.mode {
            Mode::Normal => Box::new(
                NormalTransport::new(listen, cipher).with_output_dir(&self.config.output_dir),
            ),
            Mode::TokenBucket(opts) => {
                let mut transport = TokenBucketTransport::new(listen, cipher, *opts)
                    .with_output_dir(&self.config.output_dir);
                if let Some(dir) = &self.config.report_dir {
                    transport = transport.with_report_dir(dir);
                }
                Box::new(transport)
            }
            Mode::Aimd(opts) => {
                let mut transport = AimdTransport::new(listen, cipher, *opts)
                    .with_output_dir(&self.config.output_dir);
                if let Some(dir) = &self.config.report_dir {
                    transport = transport.with_report_dir(dir);
                }
                Box::new(transport)
            }
            Mode::Parallel(opts) => Box::new(
                ParallelTransport::new(listen, cipher, *opts)
                    .with_output_dir(&self.config.output_dir),
            ),
            Mode::Qos(opts) => Box::new(
                QosTransport::new(listen, cipher, Arc::clone(&self.qos_manager), *opts)
                    .with_output_dir(&self.config.output_dir),
            ),
            Mode::Multicast(opts) => Box::new(
                MulticastTransport::new(listen, cipher, *opts)
                    .with_output_dir(&self.config.output_dir),
            ),
        }
    }

    /// Refuse sends to peers the membership table has written off, unless a
    /// fresh probe revives them. Unknown peers are simply attempted.
    fn check_target(&self, target: &Endpoint) -> Result<(), NodeError> {
        let table = self.discovery.table();
        if let Some(peer) = table.get(target) {
            if peer.status == PeerStatus::Inactive {
                warn!(%target, "target is marked inactive, probing before send");
                if self.discovery.probe(target).is_err() {
                    return Err(NodeError::PeerUnreachable(target.clone()));
                }
            }
        }
        Ok(())
    }

    /// Feed the transfer outcome back into the peer's reliability score,
    /// mirroring gossip's own policy.
    fn record_outcome(&mut self, target: &Endpoint, bytes: u64, success: bool) {
        let table = self.discovery.table();
        if success {
            self.counters.successful_transfers += 1;
            self.counters.total_bytes_transferred += bytes;
            table.mark_success(&target.host, target.port, None);
        } else {
            self.counters.failed_transfers += 1;
            table.mark_failure(&target.host, target.port, self.discovery.config().max_retries);
        }
    }

    /// Send a file to one peer with the currently selected strategy.
    pub fn send_file(&mut self, path: &Path, target: &Endpoint) -> Result<TransferReport, NodeError> {
        self.check_target(target)?;
        let mut strategy = self.build_strategy();
        match strategy.send(path, target) {
            Ok(report) => {
                self.record_outcome(target, report.bytes, true);
                Ok(report)
            }
            Err(e) => {
                self.record_outcome(target, 0, false);
                Err(e.into())
            }
        }
    }

    /// Fan a file out to several peers at once, independent of the current
    /// mode.
    pub fn send_multicast(
        &mut self,
        path: &Path,
        targets: &[Endpoint],
    ) -> Result<MulticastReport, NodeError> {
        let opts = match &self.config.mode {
            Mode::Multicast(opts) => *opts,
            _ => Default::default(),
        };
        let listen = Endpoint::new(self.config.host.clone(), self.config.transfer_port);
        let mut transport = MulticastTransport::new(listen, Arc::clone(&self.cipher), opts)
            .with_output_dir(&self.config.output_dir);

        let report = transport.send_to_all(path, targets)?;
        for (target, success) in &report.results {
            self.record_outcome(target, if *success { report.bytes } else { 0 }, *success);
        }
        Ok(report)
    }

    /// Accept one inbound transfer with the currently selected strategy.
    pub fn receive_file(&mut self) -> Result<Received, NodeError> {
        let mut strategy = self.build_strategy();
        match strategy.receive() {
            Ok(received) => {
                self.counters.successful_transfers += 1;
                self.counters.total_bytes_transferred += received.bytes;
                Ok(received)
            }
            Err(e) => {
                self.counters.failed_transfers += 1;
                Err(e.into())
            }
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.started {
            self.stop();
        }
    }
}
