//! End-to-end loopback tests: every strategy sends a real file over
//! 127.0.0.1 and the received copy must match byte-for-byte.

use std::fs;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sha2::{Digest, Sha256};

use courier_crypto::RecordCipher;
use courier_transfer::strategy::{
    AimdTransport, MulticastTransport, NormalTransport, ParallelTransport, QosTransport,
    Strategy, TokenBucketTransport,
};
use courier_transfer::{QosManager, TransferError};
use courier_types::{
    AimdOptions, Endpoint, MulticastOptions, ParallelOptions, QosOptions, TokenBucketOptions,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("courier_transfer=debug")
        .try_init();
}

fn test_cipher() -> Arc<RecordCipher> {
    let mut key = [0u8; 32];
    key[0] = 0xDE;
    key[31] = 0xAD;
    Arc::new(RecordCipher::new(key))
}

fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("courier_loopback_{name}"));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Prime-modulus fill pattern so shifted or duplicated chunks never match.
fn make_source(dir: &Path, name: &str, size: usize) -> PathBuf {
    let path = dir.join(name);
    let mut data = vec![0u8; size];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    fs::write(&path, data).unwrap();
    path
}

fn sha256_of(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fs::read(path).unwrap());
    hex::encode(hasher.finalize())
}

fn assert_files_equal(a: &Path, b: &Path) {
    assert_eq!(
        fs::metadata(a).unwrap().len(),
        fs::metadata(b).unwrap().len(),
        "file sizes differ"
    );
    assert_eq!(sha256_of(a), sha256_of(b), "file contents differ");
}

const RECEIVER_SPINUP: Duration = Duration::from_millis(250);

#[test]
fn normal_delivers_1k_byte_for_byte() {
    init_logging();
    let dir = test_dir("normal_1k");
    let source = make_source(&dir, "test_1024.txt", 1024);
    let cipher = test_cipher();

    let recv_dir = dir.clone();
    let recv_cipher = cipher.clone();
    let receiver = thread::spawn(move || {
        NormalTransport::new(Endpoint::new("127.0.0.1", 56100), recv_cipher)
            .with_output_dir(recv_dir)
            .receive()
    });
    thread::sleep(RECEIVER_SPINUP);

    let report = NormalTransport::new(Endpoint::new("127.0.0.1", 0), cipher)
        .send(&source, &Endpoint::new("127.0.0.1", 56100))
        .expect("send failed");
    assert_eq!(report.bytes, 1024);

    let received = receiver.join().unwrap().expect("receive failed");
    assert_eq!(received.filename, "test_1024.txt");
    assert!(received.path.ends_with("received_test_1024.txt"));
    assert_files_equal(&source, &received.path);
}

#[test]
fn normal_zero_byte_file_produces_empty_output() {
    init_logging();
    let dir = test_dir("normal_zero");
    let source = make_source(&dir, "empty.bin", 0);
    let cipher = test_cipher();

    let recv_dir = dir.clone();
    let recv_cipher = cipher.clone();
    let receiver = thread::spawn(move || {
        NormalTransport::new(Endpoint::new("127.0.0.1", 56101), recv_cipher)
            .with_output_dir(recv_dir)
            .receive()
    });
    thread::sleep(RECEIVER_SPINUP);

    NormalTransport::new(Endpoint::new("127.0.0.1", 0), cipher)
        .send(&source, &Endpoint::new("127.0.0.1", 56101))
        .expect("send failed");

    let received = receiver.join().unwrap().expect("receive failed");
    assert_eq!(received.bytes, 0);
    assert_eq!(fs::metadata(&received.path).unwrap().len(), 0);
}

#[test]
fn token_bucket_delivers_and_persists_stats() {
    init_logging();
    let dir = test_dir("token_bucket");
    let source = make_source(&dir, "shaped_10k.bin", 10 * 1024);
    let cipher = test_cipher();
    let opts = TokenBucketOptions {
        bucket_size: 1024,
        token_rate: 512.0,
        ..Default::default()
    };

    let recv_dir = dir.clone();
    let recv_cipher = cipher.clone();
    let receiver = thread::spawn(move || {
        TokenBucketTransport::new(Endpoint::new("127.0.0.1", 56102), recv_cipher, opts)
            .with_output_dir(recv_dir)
            .receive()
    });
    thread::sleep(RECEIVER_SPINUP);

    let report = TokenBucketTransport::new(Endpoint::new("127.0.0.1", 0), cipher, opts)
        .with_report_dir(&dir)
        .send(&source, &Endpoint::new("127.0.0.1", 56102))
        .expect("send failed");
    assert_eq!(report.bytes, 10 * 1024);

    let received = receiver.join().unwrap().expect("receive failed");
    assert_files_equal(&source, &received.path);
    assert!(dir.join("transfer_stats_shaped_10k.bin.json").exists());
}

#[test]
fn token_bucket_zero_byte_file() {
    init_logging();
    let dir = test_dir("token_bucket_zero");
    let source = make_source(&dir, "empty.bin", 0);
    let cipher = test_cipher();
    let opts = TokenBucketOptions::default();

    let recv_dir = dir.clone();
    let recv_cipher = cipher.clone();
    let receiver = thread::spawn(move || {
        TokenBucketTransport::new(Endpoint::new("127.0.0.1", 56103), recv_cipher, opts)
            .with_output_dir(recv_dir)
            .receive()
    });
    thread::sleep(RECEIVER_SPINUP);

    TokenBucketTransport::new(Endpoint::new("127.0.0.1", 0), cipher, opts)
        .send(&source, &Endpoint::new("127.0.0.1", 56103))
        .expect("send failed");

    let received = receiver.join().unwrap().expect("receive failed");
    assert_eq!(received.bytes, 0);
}

#[test]
fn aimd_lossless_single_chunk() {
    init_logging();
    let dir = test_dir("aimd_1k");
    let source = make_source(&dir, "aimd_1024.bin", 1024);
    let cipher = test_cipher();
    let opts = AimdOptions::default();

    let recv_dir = dir.clone();
    let recv_cipher = cipher.clone();
    let receiver = thread::spawn(move || {
        AimdTransport::new(Endpoint::new("127.0.0.1", 56104), recv_cipher, opts)
            .with_output_dir(recv_dir)
            .receive()
    });
    thread::sleep(RECEIVER_SPINUP);

    let mut sender = AimdTransport::new(Endpoint::new("127.0.0.1", 0), cipher, opts);
    sender
        .send(&source, &Endpoint::new("127.0.0.1", 56104))
        .expect("send failed");

    let snapshot = sender.last_run().expect("no controller snapshot");
    assert_eq!(snapshot.total_retransmits, 0, "lossless loop must not retransmit");
    assert!(snapshot.window >= 1024);

    let received = receiver.join().unwrap().expect("receive failed");
    assert_files_equal(&source, &received.path);
}

#[test]
fn aimd_lossless_multi_chunk_with_reports() {
    init_logging();
    let dir = test_dir("aimd_96k");
    let source = make_source(&dir, "aimd_96k.bin", 96 * 1024);
    let cipher = test_cipher();
    let opts = AimdOptions::default();

    let recv_dir = dir.clone();
    let recv_cipher = cipher.clone();
    let receiver = thread::spawn(move || {
        AimdTransport::new(Endpoint::new("127.0.0.1", 56107), recv_cipher, opts)
            .with_output_dir(recv_dir)
            .receive()
    });
    thread::sleep(RECEIVER_SPINUP);

    let mut sender = AimdTransport::new(Endpoint::new("127.0.0.1", 0), cipher, opts)
        .with_report_dir(&dir);
    sender
        .send(&source, &Endpoint::new("127.0.0.1", 56107))
        .expect("send failed");

    let snapshot = sender.last_run().unwrap();
    assert_eq!(snapshot.total_retransmits, 0);
    // Twelve in-order ACKs grow the window past its starting point.
    assert!(snapshot.window > 1024);
    assert!(snapshot.srtt.unwrap_or(0.0) > 0.0);

    let received = receiver.join().unwrap().expect("receive failed");
    assert_files_equal(&source, &received.path);
    assert!(dir.join("bandwidth_stats.csv").exists());
    assert!(dir.join("transfer_stats_aimd_96k.bin.json").exists());
}

#[test]
fn aimd_file_of_exactly_one_chunk() {
    init_logging();
    let dir = test_dir("aimd_chunk");
    let source = make_source(&dir, "one_chunk.bin", 8192);
    let cipher = test_cipher();
    let opts = AimdOptions::default();

    let recv_dir = dir.clone();
    let recv_cipher = cipher.clone();
    let receiver = thread::spawn(move || {
        AimdTransport::new(Endpoint::new("127.0.0.1", 56108), recv_cipher, opts)
            .with_output_dir(recv_dir)
            .receive()
    });
    thread::sleep(RECEIVER_SPINUP);

    let mut sender = AimdTransport::new(Endpoint::new("127.0.0.1", 0), cipher, opts);
    sender
        .send(&source, &Endpoint::new("127.0.0.1", 56108))
        .expect("send failed");

    // One full chunk: exactly one data record went out before the EOT
    // sentinel, and nothing was retransmitted.
    assert_eq!(sender.stats().chunks_sent(), 1);
    assert_eq!(sender.last_run().unwrap().total_retransmits, 0);

    let received = receiver.join().unwrap().expect("receive failed");
    assert_eq!(received.bytes, 8192);
    assert_files_equal(&source, &received.path);
}

#[test]
fn qos_zero_byte_file() {
    init_logging();
    let dir = test_dir("qos_zero");
    let source = make_source(&dir, "empty.bin", 0);
    let cipher = test_cipher();
    let manager = Arc::new(QosManager::new());

    let recv_dir = dir.clone();
    let recv_cipher = cipher.clone();
    let recv_manager = manager.clone();
    let receiver = thread::spawn(move || {
        QosTransport::new(
            Endpoint::new("127.0.0.1", 56132),
            recv_cipher,
            recv_manager,
            QosOptions::default(),
        )
        .with_output_dir(recv_dir)
        .receive()
    });
    thread::sleep(RECEIVER_SPINUP);

    QosTransport::new(Endpoint::new("127.0.0.1", 0), cipher, manager, QosOptions::default())
        .send(&source, &Endpoint::new("127.0.0.1", 56132))
        .expect("send failed");

    let received = receiver.join().unwrap().expect("receive failed");
    assert_eq!(received.bytes, 0);
    assert_eq!(fs::metadata(&received.path).unwrap().len(), 0);
}

/// Forwards the data direction untouched and drops every `drop_every`-th
/// ACK line on the return path.
fn start_ack_dropping_proxy(listen_port: u16, upstream_port: u16, drop_every: u64) {
    let listener = TcpListener::bind(("127.0.0.1", listen_port)).unwrap();
    thread::spawn(move || {
        let (client, _) = listener.accept().unwrap();
        let upstream = TcpStream::connect(("127.0.0.1", upstream_port)).unwrap();

        let mut client_read = client.try_clone().unwrap();
        let mut upstream_write = upstream.try_clone().unwrap();
        let data_pump = thread::spawn(move || {
            let _ = std::io::copy(&mut client_read, &mut upstream_write);
            let _ = upstream_write.shutdown(Shutdown::Write);
        });

        let mut upstream_read = upstream;
        let mut client_write = client;
        let mut buf = [0u8; 512];
        let mut line = Vec::new();
        let mut counter: u64 = 0;
        'pump: loop {
            match upstream_read.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for &byte in &buf[..n] {
                        line.push(byte);
                        if byte == b'\n' {
                            counter += 1;
                            if counter % drop_every != 0
                                && client_write.write_all(&line).is_err()
                            {
                                break 'pump;
                            }
                            line.clear();
                        }
                    }
                }
            }
        }
        let _ = data_pump.join();
    });
}

#[test]
fn aimd_recovers_from_dropped_acks() {
    init_logging();
    let dir = test_dir("aimd_loss");
    let source = make_source(&dir, "aimd_loss.bin", 80 * 1024);
    let cipher = test_cipher();
    let opts = AimdOptions::default();

    let recv_dir = dir.clone();
    let recv_cipher = cipher.clone();
    let receiver = thread::spawn(move || {
        AimdTransport::new(Endpoint::new("127.0.0.1", 56105), recv_cipher, opts)
            .with_output_dir(recv_dir)
            .receive()
    });
    thread::sleep(RECEIVER_SPINUP);

    start_ack_dropping_proxy(56106, 56105, 4);
    thread::sleep(Duration::from_millis(100));

    let sender = thread::spawn(move || {
        let mut transport = AimdTransport::new(Endpoint::new("127.0.0.1", 0), cipher, opts);
        let result = transport.send(&source, &Endpoint::new("127.0.0.1", 56106));
        (result, transport.last_run())
    });

    let (result, snapshot) = sender.join().unwrap();
    result.expect("send failed despite recovery");
    let snapshot = snapshot.unwrap();
    assert!(
        snapshot.timeouts + snapshot.fast_retransmits > 0,
        "dropped ACKs must register as congestion events"
    );
    assert!(snapshot.total_retransmits > 0);
    assert!(snapshot.srtt.unwrap_or(0.0) > 0.0);

    let received = receiver.join().unwrap().expect("receive failed");
    let source_again = dir.join("aimd_loss.bin");
    assert_files_equal(&source_again, &received.path);
}

#[test]
fn parallel_reassembles_with_remainder() {
    init_logging();
    let dir = test_dir("parallel");
    // 10 000 bytes across 3 streams: the last range carries the remainder.
    let source = make_source(&dir, "parallel_10000.bin", 10_000);
    let cipher = test_cipher();
    let opts = ParallelOptions { streams: 3 };

    let recv_dir = dir.clone();
    let recv_cipher = cipher.clone();
    let receiver = thread::spawn(move || {
        ParallelTransport::new(Endpoint::new("127.0.0.1", 56110), recv_cipher, opts)
            .with_output_dir(recv_dir)
            .receive()
    });
    thread::sleep(Duration::from_millis(400));

    let report = ParallelTransport::new(Endpoint::new("127.0.0.1", 0), cipher, opts)
        .send(&source, &Endpoint::new("127.0.0.1", 56110))
        .expect("send failed");
    assert_eq!(report.bytes, 10_000);

    let received = receiver.join().unwrap().expect("receive failed");
    assert_files_equal(&source, &received.path);
    // Range temp files are cleaned up after concatenation.
    for i in 0..3 {
        assert!(!dir.join(format!("chunk_{i}_parallel_10000.bin")).exists());
    }
}

#[test]
fn parallel_receive_reports_port_in_use() {
    init_logging();
    let dir = test_dir("parallel_port");
    let cipher = test_cipher();
    // Occupy the second port of the range.
    let _blocker = TcpListener::bind(("127.0.0.1", 56121)).unwrap();

    let result = ParallelTransport::new(
        Endpoint::new("127.0.0.1", 56120),
        cipher,
        ParallelOptions { streams: 2 },
    )
    .with_output_dir(dir)
    .receive();

    match result {
        Err(TransferError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::AddrInUse),
        other => panic!("expected AddrInUse, got {other:?}"),
    }
}

#[test]
fn qos_higher_priority_finishes_first() {
    init_logging();
    let dir = test_dir("qos");
    let fast_source = make_source(&dir, "fast.bin", 128 * 1024);
    let slow_source = make_source(&dir, "slow.bin", 128 * 1024);
    let cipher = test_cipher();
    let manager = Arc::new(QosManager::new());

    let mut receivers = Vec::new();
    for (port, name) in [(56130u16, "fast"), (56131u16, "slow")] {
        let recv_dir = dir.clone();
        let recv_cipher = cipher.clone();
        let recv_manager = manager.clone();
        receivers.push(thread::spawn(move || {
            QosTransport::new(
                Endpoint::new("127.0.0.1", port),
                recv_cipher,
                recv_manager,
                QosOptions::default(),
            )
            .with_output_dir(recv_dir)
            .receive()
            .unwrap_or_else(|e| panic!("{name} receive failed: {e}"))
        }));
    }
    thread::sleep(Duration::from_millis(400));

    let mut senders = Vec::new();
    for (port, level, source) in [
        (56130u16, 1u32, fast_source.clone()),
        (56131u16, 3u32, slow_source.clone()),
    ] {
        let cipher = cipher.clone();
        let manager = manager.clone();
        senders.push(thread::spawn(move || {
            QosTransport::new(
                Endpoint::new("127.0.0.1", 0),
                cipher,
                manager,
                QosOptions {
                    priority_level: level,
                    min_bandwidth: 0,
                },
            )
            .send(&source, &Endpoint::new("127.0.0.1", port))
            .expect("send failed")
        }));
    }

    let fast_report = senders.remove(0).join().unwrap();
    let slow_report = senders.remove(0).join().unwrap();
    for receiver in receivers {
        receiver.join().unwrap();
    }

    assert_files_equal(&fast_source, &dir.join("received_fast.bin"));
    assert_files_equal(&slow_source, &dir.join("received_slow.bin"));
    assert!(
        fast_report.duration < slow_report.duration,
        "level 1 ({:?}) should finish before level 3 ({:?})",
        fast_report.duration,
        slow_report.duration
    );
}

#[test]
fn multicast_delivers_to_every_target() {
    init_logging();
    let dir = test_dir("multicast");
    let source = make_source(&dir, "fanout.bin", 32 * 1024);
    let cipher = test_cipher();
    let opts = MulticastOptions::default();

    let mut receivers = Vec::new();
    for (port, sub) in [(56140u16, "a"), (56141u16, "b")] {
        let recv_dir = dir.join(sub);
        fs::create_dir_all(&recv_dir).unwrap();
        let recv_cipher = cipher.clone();
        receivers.push(thread::spawn(move || {
            MulticastTransport::new(Endpoint::new("127.0.0.1", port), recv_cipher, opts)
                .with_output_dir(recv_dir)
                .receive()
        }));
    }
    thread::sleep(RECEIVER_SPINUP);

    let report = MulticastTransport::new(Endpoint::new("127.0.0.1", 0), cipher, opts)
        .send_to_all(
            &source,
            &[
                Endpoint::new("127.0.0.1", 56140),
                Endpoint::new("127.0.0.1", 56141),
            ],
        )
        .expect("multicast send failed");
    assert!(report.all_succeeded(), "errors: {:?}", report.errors);

    for receiver in receivers {
        let received = receiver.join().unwrap().expect("receive failed");
        assert_files_equal(&source, &received.path);
    }
}

#[test]
fn multicast_port_range_receiver_qualifies_by_source() {
    init_logging();
    let dir = test_dir("multicast_range");
    let source = make_source(&dir, "ranged.bin", 8 * 1024);
    let cipher = test_cipher();
    let opts = MulticastOptions::default();

    let shutdown = Arc::new(AtomicBool::new(false));
    let receiver = MulticastTransport::new(Endpoint::new("127.0.0.1", 56150), cipher.clone(), opts)
        .with_output_dir(&dir);
    let handles = receiver
        .spawn_receivers(2, shutdown.clone())
        .expect("could not bind receiver range");
    thread::sleep(RECEIVER_SPINUP);

    let report = MulticastTransport::new(Endpoint::new("127.0.0.1", 0), cipher, opts)
        .send_to_all(
            &source,
            &[
                Endpoint::new("127.0.0.1", 56150),
                Endpoint::new("127.0.0.1", 56151),
            ],
        )
        .expect("send failed");
    assert!(report.all_succeeded(), "errors: {:?}", report.errors);

    // Give the receiver threads a moment to finish writing, then stop them.
    thread::sleep(Duration::from_millis(300));
    shutdown.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }

    let qualified: Vec<_> = fs::read_dir(&dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("received_127.0.0.1_") && name.ends_with("_ranged.bin"))
        .collect();
    assert_eq!(qualified.len(), 2, "found: {qualified:?}");
    for name in qualified {
        assert_files_equal(&source, &dir.join(name));
    }
}
