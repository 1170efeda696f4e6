//! Baseline strategy: one TCP stream, encrypted 8 KiB chunks, no pacing.

use std::fs::File;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use courier_crypto::RecordCipher;
use courier_types::Endpoint;
use tracing::{debug, info};

use crate::error::TransferError;
use crate::framing::{read_record, recv_handshake, send_handshake, write_record};
use crate::stats::TransferStats;

use super::{basename, output_path, Received, Strategy, TransferReport, CHUNK_SIZE};

pub struct NormalTransport {
    listen: Endpoint,
    cipher: Arc<RecordCipher>,
    output_dir: PathBuf,
    stats: TransferStats,
}

impl NormalTransport {
    pub fn new(listen: Endpoint, cipher: Arc<RecordCipher>) -> Self {
        NormalTransport {
            listen,
            cipher,
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

impl Strategy for NormalTransport {
    fn send(&mut self, path: &Path, target: &Endpoint) -> Result<TransferReport, TransferError> {
        self.stats = TransferStats::new();
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
            let payload = self.cipher.encrypt(&buf[..n]);
            write_record(&mut stream, &payload)?;
            self.stats.record_chunk(n, n);
        }
        stream.flush()?;

        let duration = start.elapsed();
        info!(
            file = %filename,
            bytes = file_size,
            secs = duration.as_secs_f64(),
            "normal send complete"
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
        debug!(%peer, "normal receive: connection accepted");

        let hs = recv_handshake(&mut stream)?;
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

        info!(file = %hs.filename, bytes = received, "normal receive complete");
        Ok(Received {
            path: out,
            filename: hs.filename,
            bytes: received,
        })
    }
}
