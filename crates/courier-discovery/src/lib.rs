//! Gossip-based peer discovery.
//!
//! One UDP port per node carries everything: periodic gossip pushes, join
//! handshakes and health probes. Three background threads (gossip,
//! listener, health) share a [`MembershipTable`] and stop cooperatively:
//! `stop()` lowers a flag and wakes the blocking listener with a sentinel
//! datagram to its own port.
//!
//! Reliability scoring steers the gossip fan-out: the two most reliable
//! active peers are always told, and the remaining slot goes to a
//! reliability-weighted random pick.

mod error;
mod membership;
mod messages;

pub use error::DiscoveryError;
pub use membership::MembershipTable;
pub use messages::GossipMessage;

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use courier_types::{unix_now, Endpoint, Peer, PeerStatus};
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use tracing::{debug, error, info, warn};

/// Datagram receive buffer; gossip messages stay far below the UDP MTU cap.
const RECV_BUF: usize = 65535;
/// Kernel-side receive buffer for the listener socket.
const SOCKET_RECV_BUF: usize = 1024 * 1024;
/// Gossip fan-out per round.
const GOSSIP_FANOUT: usize = 3;
/// Retry timeout growth factor and cap.
const RETRY_BACKOFF: f64 = 1.5;
const RETRY_TIMEOUT_CAP: Duration = Duration::from_secs(10);
/// Granularity of interruptible sleeps in the background loops.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub host: String,
    pub port: u16,
    pub gossip_interval: Duration,
    pub max_retries: u32,
    pub timeout: Duration,
}

impl DiscoveryConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        DiscoveryConfig {
            host: host.into(),
            port,
            gossip_interval: Duration::from_secs(5),
            max_retries: 3,
            timeout: Duration::from_secs(3),
        }
    }

    pub fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    fn validate(&self) -> Result<(), DiscoveryError> {
        if self.gossip_interval.is_zero() {
            return Err(DiscoveryError::Config("gossip interval must be positive".into()));
        }
        if self.max_retries == 0 {
            return Err(DiscoveryError::Config("max_retries must be at least 1".into()));
        }
        Ok(())
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

pub struct PeerDiscovery {
    config: DiscoveryConfig,
    table: Arc<MembershipTable>,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl PeerDiscovery {
    pub fn new(config: DiscoveryConfig) -> Result<Self, DiscoveryError> {
        config.validate()?;
        let table = Arc::new(MembershipTable::new(config.endpoint()));
        Ok(PeerDiscovery {
            config,
            table,
            running: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        })
    }

    /// Read-only view of the membership for the orchestrator. The
    /// orchestrator borrows the table through this handle; discovery never
    /// reaches back.
    pub fn table(&self) -> Arc<MembershipTable> {
        Arc::clone(&self.table)
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Bind the discovery port and start the gossip, listener and health
    /// threads.
    pub fn start(&mut self) -> Result<(), DiscoveryError> {
        if self.is_running() {
            return Ok(());
        }

        let listener = UdpSocket::bind((self.config.host.as_str(), self.config.port))?;
        {
            let sock_ref = socket2::SockRef::from(&listener);
            if let Err(e) = sock_ref.set_recv_buffer_size(SOCKET_RECV_BUF) {
                warn!(error = %e, "could not grow discovery receive buffer");
            }
        }

        self.running.store(true, Ordering::Relaxed);

        {
            let config = self.config.clone();
            let table = Arc::clone(&self.table);
            let running = Arc::clone(&self.running);
            let reply_socket = listener.try_clone()?;
            self.threads.push(
                thread::Builder::new()
                    .name(format!("gossip-listen-{}", self.config.port))
                    .spawn(move || listener_loop(listener, reply_socket, config, table, running))?,
            );
        }
        {
            let config = self.config.clone();
            let table = Arc::clone(&self.table);
            let running = Arc::clone(&self.running);
            self.threads.push(
                thread::Builder::new()
                    .name(format!("gossip-push-{}", self.config.port))
                    .spawn(move || gossip_loop(config, table, running))?,
            );
        }
        {
            let config = self.config.clone();
            let table = Arc::clone(&self.table);
            let running = Arc::clone(&self.running);
            self.threads.push(
                thread::Builder::new()
                    .name(format!("gossip-health-{}", self.config.port))
                    .spawn(move || health_loop(config, table, running))?,
            );
        }

        info!(
            endpoint = %self.config.endpoint(),
            interval_secs = self.config.gossip_interval.as_secs_f64(),
            "peer discovery started"
        );
        Ok(())
    }

    /// Lower the shutdown flag, wake the listener with a sentinel datagram
    /// and join every loop.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        // Empty datagram to our own port unblocks the listener's recv.
        if let Ok(waker) = UdpSocket::bind((self.config.host.as_str(), 0)) {
            let _ = waker.send_to(&[], (self.config.host.as_str(), self.config.port));
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        info!(endpoint = %self.config.endpoint(), "peer discovery stopped");
    }

    /// Announce this node through a bootstrap peer and merge the peers it
    /// returns. The per-attempt timeout grows linearly with the attempt.
    pub fn join_network(&self, bootstrap: &Endpoint) -> Result<usize, DiscoveryError> {
        let message = GossipMessage::Join {
            peer: self.config.endpoint(),
            timestamp: unix_now(),
        };
        let bytes = message.to_bytes()?;

        for attempt in 0..self.config.max_retries {
            info!(
                %bootstrap,
                attempt = attempt + 1,
                max = self.config.max_retries,
                "joining network"
            );
            let socket = UdpSocket::bind((self.config.host.as_str(), 0))?;
            socket.set_read_timeout(Some(self.config.timeout * (attempt + 1)))?;
            socket.send_to(&bytes, (bootstrap.host.as_str(), bootstrap.port))?;

            let mut buf = vec![0u8; RECV_BUF];
            match socket.recv_from(&mut buf) {
                Ok((len, _)) => match GossipMessage::from_bytes(&buf[..len]) {
                    Ok(GossipMessage::JoinAck { peers }) => {
                        for peer in &peers {
                            self.table.record_sighting(&peer.host, peer.port);
                        }
                        self.table.record_sighting(&bootstrap.host, bootstrap.port);
                        info!(peers = peers.len(), "joined network");
                        return Ok(peers.len());
                    }
                    Ok(other) => {
                        warn!(message = ?other, "unexpected reply to join");
                    }
                    Err(e) => warn!(error = %e, "malformed join reply"),
                },
                Err(e) if is_timeout(&e) || is_refused(&e) => {
                    warn!(attempt = attempt + 1, error = %e, "join attempt got no answer");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(DiscoveryError::Timeout(format!(
            "join via {bootstrap} after {} attempts",
            self.config.max_retries
        )))
    }

    /// One-shot liveness probe, also used by the orchestrator's
    /// health-check command. Updates the membership either way.
    pub fn probe(&self, target: &Endpoint) -> Result<Duration, DiscoveryError> {
        let message = GossipMessage::HealthCheck {
            source: self.config.endpoint(),
            timestamp: unix_now(),
        };
        match send_request(&self.config, &message, target) {
            Ok(rtt) => {
                self.table.record_sighting(&target.host, target.port);
                self.table.mark_recovered(&target.host, target.port);
                self.table
                    .mark_success(&target.host, target.port, Some(rtt.as_secs_f64()));
                Ok(rtt)
            }
            Err(e) => {
                self.table
                    .mark_failure(&target.host, target.port, self.config.max_retries);
                Err(e)
            }
        }
    }
}

impl Drop for PeerDiscovery {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// ICMP port-unreachable surfaces as a refused/reset receive on some
/// platforms; for a datagram probe that simply means "nobody there yet",
/// the same as a timeout.
fn is_refused(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
    )
}

/// Send a request datagram and wait for any reply, retrying with a timeout
/// that grows by half each attempt, capped at ten seconds.
fn send_request(
    config: &DiscoveryConfig,
    message: &GossipMessage,
    target: &Endpoint,
) -> Result<Duration, DiscoveryError> {
    let bytes = message.to_bytes()?;
    let socket = UdpSocket::bind((config.host.as_str(), 0))?;
    let mut timeout = config.timeout;
    let mut buf = vec![0u8; RECV_BUF];

    for attempt in 0..config.max_retries {
        let started = Instant::now();
        socket.set_read_timeout(Some(timeout))?;
        socket.send_to(&bytes, (target.host.as_str(), target.port))?;

        match socket.recv_from(&mut buf) {
            Ok((len, _)) => {
                // Any well-formed reply counts as life.
                if GossipMessage::from_bytes(&buf[..len]).is_ok() {
                    return Ok(started.elapsed());
                }
                warn!(%target, "malformed reply to request");
            }
            Err(e) if is_timeout(&e) || is_refused(&e) => {
                debug!(
                    %target,
                    attempt = attempt + 1,
                    timeout_secs = timeout.as_secs_f64(),
                    error = %e,
                    "request got no answer"
                );
                timeout = Duration::from_secs_f64(
                    (timeout.as_secs_f64() * RETRY_BACKOFF)
                        .min(RETRY_TIMEOUT_CAP.as_secs_f64()),
                );
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(DiscoveryError::Timeout(format!(
        "response from {target} after {} attempts",
        config.max_retries
    )))
}

/// Sleep `total` in slices, returning early once `running` drops.
fn interruptible_sleep(total: Duration, running: &AtomicBool) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::Relaxed) {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return;
        }
        thread::sleep(left.min(SLEEP_SLICE));
    }
}

/// Pick gossip targets: the top two by reliability unconditionally, the
/// rest by reliability-weighted random sampling without replacement.
fn select_gossip_targets(active: &[Peer], count: usize) -> Vec<Endpoint> {
    let mut sorted: Vec<&Peer> = active.iter().collect();
    sorted.sort_by(|a, b| b.reliability.total_cmp(&a.reliability));

    let guaranteed = sorted.len().min(2).min(count);
    let mut selected: Vec<Endpoint> = sorted[..guaranteed].iter().map(|p| p.endpoint()).collect();

    let mut remaining: Vec<&Peer> = sorted[guaranteed..].to_vec();
    let mut rng = rand::thread_rng();
    while selected.len() < count && !remaining.is_empty() {
        let weights: Vec<f64> = remaining.iter().map(|p| p.reliability.max(0.01)).collect();
        let index = match WeightedIndex::new(&weights) {
            Ok(dist) => dist.sample(&mut rng),
            Err(_) => 0,
        };
        selected.push(remaining.remove(index).endpoint());
    }
    selected
}

/// Periodic push of the active-peer view to a few targets.
fn gossip_loop(config: DiscoveryConfig, table: Arc<MembershipTable>, running: Arc<AtomicBool>) {
    let socket = match UdpSocket::bind((config.host.as_str(), 0)) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "gossip loop could not bind a send socket");
            return;
        }
    };

    while running.load(Ordering::Relaxed) {
        let active = table.active_snapshot();
        if !active.is_empty() {
            let targets = select_gossip_targets(&active, GOSSIP_FANOUT);
            let message = GossipMessage::Gossip {
                source: config.endpoint(),
                peers: active,
                timestamp: unix_now(),
            };
            match message.to_bytes() {
                Ok(bytes) => {
                    for target in targets {
                        if let Err(e) =
                            socket.send_to(&bytes, (target.host.as_str(), target.port))
                        {
                            warn!(%target, error = %e, "gossip send failed");
                            table.mark_failure(&target.host, target.port, config.max_retries);
                        } else {
                            debug!(%target, "gossip sent");
                        }
                    }
                }
                Err(e) => error!(error = %e, "gossip serialisation failed"),
            }
        }
        interruptible_sleep(config.gossip_interval, &running);
    }
}

/// Single blocking receive loop for gossip, joins and health checks.
/// Recoverable problems are logged and the loop keeps serving; only the
/// shutdown flag ends it.
fn listener_loop(
    socket: UdpSocket,
    reply_socket: UdpSocket,
    config: DiscoveryConfig,
    table: Arc<MembershipTable>,
    running: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; RECV_BUF];
    while running.load(Ordering::Relaxed) {
        let (len, addr) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) => {
                if running.load(Ordering::Relaxed) {
                    warn!(error = %e, "discovery recv failed");
                }
                continue;
            }
        };
        if len == 0 {
            // Shutdown sentinel (or an empty stray); the loop head decides.
            continue;
        }

        let message = match GossipMessage::from_bytes(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                warn!(%addr, error = %e, "invalid discovery datagram");
                continue;
            }
        };

        match message {
            GossipMessage::Gossip {
                source,
                peers,
                timestamp,
            } => {
                let age = (unix_now() - timestamp).abs();
                let max_age = config.gossip_interval.as_secs_f64() * 3.0;
                if age > max_age {
                    warn!(%addr, age_secs = age, "discarding outdated gossip");
                    continue;
                }
                table.record_sighting(&source.host, source.port);
                for peer in peers {
                    table.record_sighting(&peer.host, peer.port);
                }
            }
            GossipMessage::Join { peer, .. } => {
                // The membership entry uses the advertised listen endpoint;
                // the reply goes to whatever socket asked.
                table.record_sighting(&peer.host, peer.port);
                let reply = GossipMessage::JoinAck {
                    peers: table.active_snapshot(),
                };
                match reply.to_bytes() {
                    Ok(bytes) => {
                        if let Err(e) = reply_socket.send_to(&bytes, addr) {
                            warn!(%addr, error = %e, "join ack send failed");
                        } else {
                            info!(peer = %peer, "peer joined");
                        }
                    }
                    Err(e) => error!(error = %e, "join ack serialisation failed"),
                }
            }
            GossipMessage::HealthCheck { source, .. } => {
                let reply = GossipMessage::HealthCheckAck {
                    status: "healthy".into(),
                    timestamp: unix_now(),
                };
                match reply.to_bytes() {
                    Ok(bytes) => {
                        if let Err(e) = reply_socket.send_to(&bytes, addr) {
                            warn!(%addr, error = %e, "health ack send failed");
                        }
                    }
                    Err(e) => error!(error = %e, "health ack serialisation failed"),
                }
                table.record_sighting(&source.host, source.port);
            }
            // Acks to our own requests arrive on the ephemeral sockets that
            // sent them, not here.
            GossipMessage::JoinAck { .. } | GossipMessage::HealthCheckAck { .. } => {
                debug!(%addr, "stray ack on the discovery port");
            }
        }
    }
}

/// Probe peers that look dead and bring them back when they answer.
fn health_loop(config: DiscoveryConfig, table: Arc<MembershipTable>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        interruptible_sleep(config.gossip_interval * 2, &running);
        if !running.load(Ordering::Relaxed) {
            return;
        }

        let stale_after = config.gossip_interval.as_secs_f64() * 3.0;
        let now = unix_now();
        let candidates: Vec<Peer> = table
            .snapshot()
            .into_iter()
            .filter(|p| {
                (p.status == PeerStatus::Inactive || p.failed_attempts > 0)
                    && now - p.last_seen > stale_after
            })
            .collect();

        for peer in candidates {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            let target = peer.endpoint();
            let message = GossipMessage::HealthCheck {
                source: config.endpoint(),
                timestamp: unix_now(),
            };
            match send_request(&config, &message, &target) {
                Ok(rtt) => {
                    table.mark_recovered(&target.host, target.port);
                    table.mark_success(&target.host, target.port, Some(rtt.as_secs_f64()));
                }
                Err(e) => {
                    debug!(%target, error = %e, "health probe failed");
                    table.mark_failure(&target.host, target.port, config.max_retries);
                }
            }
        }
    }
}
