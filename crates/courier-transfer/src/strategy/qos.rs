//! QoS strategy: Normal framing paced to the bandwidth share allocated by
//! the process-wide [`QosManager`].

use std::fs::File;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use courier_crypto::RecordCipher;
use courier_types::{Endpoint, QosOptions};
use tracing::{debug, info};

use crate::error::TransferError;
use crate::framing::{read_record, recv_handshake, send_handshake, write_record};
use crate::qos::{QosManager, TransferPriority};
use crate::stats::TransferStats;

use super::{basename, output_path, Received, Strategy, TransferReport, CHUNK_SIZE};

/// Receivers register at the lightest priority, mirroring the sender-side
/// default.
const RECEIVER_PRIORITY_LEVEL: u32 = 1;

pub struct QosTransport {
    listen: Endpoint,
    cipher: Arc<RecordCipher>,
    manager: Arc<QosManager>,
    opts: QosOptions,
    output_dir: PathBuf,
    stats: TransferStats,
}

impl QosTransport {
    pub fn new(
        listen: Endpoint,
        cipher: Arc<RecordCipher>,
        manager: Arc<QosManager>,
        opts: QosOptions,
    ) -> Self {
        QosTransport {
            listen,
            cipher,
            manager,
            opts,
            output_dir: PathBuf::from("."),
            stats: TransferStats::new(),
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }
}

/// Per-chunk pacing delay at the currently allocated bandwidth.
fn chunk_delay(bytes: usize, bandwidth: u64) -> Duration {
    if bandwidth == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(bytes as f64 / bandwidth as f64)
}

impl Strategy for QosTransport {
    fn send(&mut self, path: &Path, target: &Endpoint) -> Result<TransferReport, TransferError> {
        if self.opts.priority_level == 0 {
            return Err(TransferError::Config("priority level must be at least 1".into()));
        }
        self.stats = TransferStats::new();

        let handle = self.manager.register(TransferPriority::new(
            self.opts.priority_level,
            self.opts.min_bandwidth,
        ));

        let filename = basename(path)?;
        let file_size = std::fs::metadata(path)?.len();

        let mut stream = TcpStream::connect((target.host.as_str(), target.port))?;
        send_handshake(&mut stream, &filename, file_size, b"")?;

        let start = Instant::now();
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; CHUNK_SIZE];

        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            write_record(&mut stream, &self.cipher.encrypt(&buf[..n]))?;
            self.stats.record_chunk(n, n);

            // The allocation moves as transfers come and go, so it is read
            // fresh for every chunk.
            let delay = chunk_delay(n, handle.bandwidth());
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
        stream.flush()?;
        drop(handle);

        let duration = start.elapsed();
        info!(
            file = %filename,
            bytes = file_size,
            level = self.opts.priority_level,
            secs = duration.as_secs_f64(),
            "qos send complete"
        );
        Ok(TransferReport {
            bytes: file_size,
            duration,
            average_rate_kbps: self.stats.average_rate_kbps(),
        })
    }

    fn receive(&mut self) -> Result<Received, TransferError> {
        self.stats = TransferStats::new();
        let listener = TcpListener::bind((self.listen.host.as_str(), self.listen.port))?;
        let (mut stream, peer) = listener.accept()?;
        debug!(%peer, "qos receive: connection accepted");

        let hs = recv_handshake(&mut stream)?;
        let handle = self
            .manager
            .register(TransferPriority::new(RECEIVER_PRIORITY_LEVEL, self.opts.min_bandwidth));

        let out = output_path(&self.output_dir, &hs.filename);
        let mut file = File::create(&out)?;

        let mut received: u64 = 0;
        while received < hs.file_size {
            let record = read_record(&mut stream)?;
            let data = self.cipher.decrypt(&record)?;
            file.write_all(&data)?;
            received += data.len() as u64;
            self.stats.record_chunk(data.len(), record.len());
        }
        file.flush()?;
        drop(handle);

        info!(file = %hs.filename, bytes = received, "qos receive complete");
        Ok(Received {
            path: out,
            filename: hs.filename,
            bytes: received,
        })
    }
}
