//! Node-to-node tests exercising the orchestrator façade end to end.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use courier_node::{Node, NodeConfig, NodeError};
use courier_types::{AimdOptions, Endpoint, Mode, MulticastOptions, PeerStatus};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("courier_node=debug,courier_transfer=info,courier_discovery=info")
        .try_init();
}

fn test_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    key[3] = 0x42;
    key[28] = 0x99;
    key
}

fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("courier_node_{name}"));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn make_source(dir: &Path, name: &str, size: usize) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    fs::write(&path, data).unwrap();
    path
}

fn quiet_node(
    transfer_port: u16,
    discovery_port: u16,
    output_dir: &Path,
) -> NodeConfig {
    let mut config = NodeConfig::new("127.0.0.1", transfer_port, discovery_port, test_key());
    config.gossip_enabled = false;
    config.output_dir = output_dir.to_path_buf();
    config.report_dir = None;
    config
}

#[test]
fn normal_transfer_updates_counters_and_reliability() {
    init_logging();
    let dir = test_dir("normal");
    let source = make_source(&dir, "payload.bin", 4096);

    let mut receiver = Node::new(quiet_node(58000, 58001, &dir)).unwrap();
    receiver.start().unwrap();
    let recv_thread = thread::spawn(move || {
        let result = receiver.receive_file();
        (receiver, result)
    });
    thread::sleep(Duration::from_millis(300));

    let mut sender = Node::new(quiet_node(58010, 58011, &dir)).unwrap();
    sender.start().unwrap();
    let target = Endpoint::new("127.0.0.1", 58000);

    // Pre-seed the membership and knock its reliability down so the
    // post-transfer reward is observable.
    let table = sender.membership();
    table.record_sighting(&target.host, target.port);
    table.mark_failure(&target.host, target.port, 99);

    let report = sender.send_file(&source, &target).expect("send failed");
    assert_eq!(report.bytes, 4096);

    let counters = sender.counters();
    assert_eq!(counters.successful_transfers, 1);
    assert_eq!(counters.failed_transfers, 0);
    assert_eq!(counters.total_bytes_transferred, 4096);

    let peer = table.get(&target).unwrap();
    assert!((peer.reliability - 0.9).abs() < 1e-9, "0.8 + 0.1 reward");
    assert_eq!(peer.failed_attempts, 0);

    let (mut receiver, result) = recv_thread.join().unwrap();
    let received = result.expect("receive failed");
    assert_eq!(received.bytes, 4096);
    assert_eq!(
        fs::read(&source).unwrap(),
        fs::read(&received.path).unwrap()
    );
    assert_eq!(receiver.counters().successful_transfers, 1);
    receiver.stop();
    sender.stop();
}

#[test]
fn send_to_written_off_peer_is_refused() {
    init_logging();
    let dir = test_dir("unreachable");
    let source = make_source(&dir, "payload.bin", 1024);

    let mut config = quiet_node(58020, 58021, &dir);
    config.discovery_timeout = Duration::from_millis(150);
    config.discovery_retries = 2;
    let mut sender = Node::new(config).unwrap();
    sender.start().unwrap();

    // Nothing listens at 58099; three strikes park the peer as inactive.
    let dead = Endpoint::new("127.0.0.1", 58099);
    let table = sender.membership();
    table.record_sighting(&dead.host, dead.port);
    for _ in 0..2 {
        table.mark_failure(&dead.host, dead.port, 2);
    }
    assert_eq!(table.get(&dead).unwrap().status, PeerStatus::Inactive);

    let started = Instant::now();
    match sender.send_file(&source, &dead) {
        Err(NodeError::PeerUnreachable(endpoint)) => assert_eq!(endpoint, dead),
        other => panic!("expected PeerUnreachable, got {other:?}"),
    }
    // The revival probe uses the configured short timeouts.
    assert!(started.elapsed() < Duration::from_secs(5));
    // A refused pre-flight is not a failed transfer.
    assert_eq!(sender.counters().failed_transfers, 0);
    sender.stop();
}

#[test]
fn aimd_mode_transfer_via_node() {
    init_logging();
    let dir = test_dir("aimd");
    let source = make_source(&dir, "windowed.bin", 24 * 1024);

    let mut recv_config = quiet_node(58030, 58031, &dir);
    recv_config.mode = Mode::Aimd(AimdOptions::default());
    let mut receiver = Node::new(recv_config).unwrap();
    receiver.start().unwrap();
    let recv_thread = thread::spawn(move || {
        let result = receiver.receive_file();
        (receiver, result)
    });
    thread::sleep(Duration::from_millis(300));

    let mut send_config = quiet_node(58032, 58033, &dir);
    send_config.mode = Mode::Aimd(AimdOptions::default());
    let mut sender = Node::new(send_config).unwrap();
    sender.start().unwrap();

    sender
        .send_file(&source, &Endpoint::new("127.0.0.1", 58030))
        .expect("send failed");

    let (_, result) = recv_thread.join().unwrap();
    let received = result.expect("receive failed");
    assert_eq!(
        fs::read(&source).unwrap(),
        fs::read(&received.path).unwrap()
    );
    sender.stop();
}

#[test]
fn multicast_fanout_counts_each_target() {
    init_logging();
    let dir = test_dir("multicast");
    let source = make_source(&dir, "fanout.bin", 8 * 1024);

    let mut receivers = Vec::new();
    for (transfer_port, discovery_port, sub) in
        [(58040u16, 58041u16, "a"), (58042, 58043, "b")]
    {
        let recv_dir = dir.join(sub);
        fs::create_dir_all(&recv_dir).unwrap();
        let mut config = quiet_node(transfer_port, discovery_port, &recv_dir);
        config.mode = Mode::Multicast(MulticastOptions::default());
        let mut node = Node::new(config).unwrap();
        node.start().unwrap();
        receivers.push(thread::spawn(move || {
            let result = node.receive_file();
            (node, result)
        }));
    }
    thread::sleep(Duration::from_millis(300));

    let mut config = quiet_node(58044, 58045, &dir);
    config.mode = Mode::Multicast(MulticastOptions::default());
    let mut sender = Node::new(config).unwrap();
    sender.start().unwrap();

    let report = sender
        .send_multicast(
            &source,
            &[
                Endpoint::new("127.0.0.1", 58040),
                Endpoint::new("127.0.0.1", 58042),
            ],
        )
        .expect("multicast failed");
    assert!(report.all_succeeded(), "errors: {:?}", report.errors);

    let counters = sender.counters();
    assert_eq!(counters.successful_transfers, 2);
    assert_eq!(counters.total_bytes_transferred, 2 * 8 * 1024);

    for handle in receivers {
        let (_, result) = handle.join().unwrap();
        let received = result.expect("receive failed");
        assert_eq!(
            fs::read(&source).unwrap(),
            fs::read(&received.path).unwrap()
        );
    }
    sender.stop();
}

#[test]
fn gossip_enabled_nodes_discover_each_other() {
    init_logging();
    let dir = test_dir("gossip");

    let mut a_config = quiet_node(58050, 58051, &dir);
    a_config.gossip_enabled = true;
    a_config.gossip_interval = Duration::from_millis(300);
    let mut a = Node::new(a_config).unwrap();
    a.start().unwrap();

    let mut b_config = quiet_node(58052, 58053, &dir);
    b_config.gossip_enabled = true;
    b_config.gossip_interval = Duration::from_millis(300);
    let mut b = Node::new(b_config).unwrap();
    b.start().unwrap();

    b.join_network(&Endpoint::new("127.0.0.1", 58051)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut mutual = false;
    while Instant::now() < deadline && !mutual {
        let a_sees = a.active_peers().iter().any(|e| e.port == 58053);
        let b_sees = b.active_peers().iter().any(|e| e.port == 58051);
        mutual = a_sees && b_sees;
        thread::sleep(Duration::from_millis(50));
    }
    assert!(mutual, "nodes failed to discover each other");

    // The façade health check answers against a live peer.
    let rtt = b.health_check(&Endpoint::new("127.0.0.1", 58051)).unwrap();
    assert!(rtt > Duration::ZERO);

    let reliable = b.reliable_peers(0.5);
    assert!(reliable.iter().any(|(e, _)| e.port == 58051));

    a.stop();
    b.stop();
}
