//! Token-bucket shaped strategy: Normal framing plus a sender-side token
//! gate and a one-byte ACK per record.
//!
//! One token covers 1 KiB. When the bucket cannot grant a full chunk within
//! the wait cap the sender shrinks the chunk to whatever tokens are on hand;
//! the receiver soft-limits itself the same way (never waiting more than
//! 100 ms) and acknowledges every record with the single byte `'1'`.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use courier_crypto::RecordCipher;
use courier_types::{Endpoint, TokenBucketOptions};
use tracing::{debug, info};

use crate::error::TransferError;
use crate::framing::{read_record, recv_handshake, send_handshake, write_record};
use crate::stats::TransferStats;
use crate::token_bucket::TokenBucket;

use super::{basename, output_path, Received, Strategy, TransferReport, CHUNK_SIZE};

/// Longest the sender sleeps for a full chunk's tokens before shrinking.
const MAX_TOKEN_WAIT: Duration = Duration::from_secs(1);
/// The receiver's soft rate-limit wait cap.
const RECEIVER_TOKEN_WAIT: Duration = Duration::from_millis(100);
/// Pause when the bucket is completely dry.
const DRY_BUCKET_PAUSE: Duration = Duration::from_millis(100);

const ACK_BYTE: u8 = b'1';

pub struct TokenBucketTransport {
    listen: Endpoint,
    cipher: Arc<RecordCipher>,
    opts: TokenBucketOptions,
    output_dir: PathBuf,
    report_dir: Option<PathBuf>,
    stats: TransferStats,
}

impl TokenBucketTransport {
    pub fn new(listen: Endpoint, cipher: Arc<RecordCipher>, opts: TokenBucketOptions) -> Self {
        TokenBucketTransport {
            listen,
            cipher,
            opts,
            output_dir: PathBuf::from("."),
            report_dir: None,
            stats: TransferStats::new(),
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Persist `transfer_stats_<filename>.json` into `dir` after each
    /// operation.
    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = Some(dir.into());
        self
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    fn save_report(&self, filename: &str) {
        if let Some(dir) = &self.report_dir {
            if let Err(e) = self.stats.report("token-bucket", None).save(dir, filename) {
                debug!(error = %e, "could not persist transfer stats");
            }
        }
    }
}

/// Sleep for the bucket's own wait estimate, capped; returns whether the
/// tokens were ultimately granted.
fn wait_for_tokens(bucket: &mut TokenBucket, tokens: u64, max_wait: Duration) -> bool {
    let wait = bucket.wait_time_for(tokens);
    if wait.is_zero() {
        return bucket.try_consume(tokens);
    }
    if wait <= max_wait {
        thread::sleep(wait);
        return bucket.try_consume(tokens);
    }
    false
}

impl Strategy for TokenBucketTransport {
    fn send(&mut self, path: &Path, target: &Endpoint) -> Result<TransferReport, TransferError> {
        self.stats = TransferStats::new();
        let mut bucket = TokenBucket::new(self.opts.bucket_size, self.opts.token_rate)?;

        let filename = basename(path)?;
        let file_size = std::fs::metadata(path)?.len();

        let mut stream = TcpStream::connect((target.host.as_str(), target.port))?;
        send_handshake(&mut stream, &filename, file_size, b"")?;
        stream.set_read_timeout(Some(self.opts.ack_timeout))?;

        let start = Instant::now();
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut bytes_sent: u64 = 0;

        while bytes_sent < file_size {
            let remaining = (file_size - bytes_sent) as usize;
            let mut chunk_size = remaining.min(CHUNK_SIZE);
            let tokens_needed = (chunk_size as u64 / 1024).max(1);

            if !wait_for_tokens(&mut bucket, tokens_needed, MAX_TOKEN_WAIT) {
                // Could not get the full allowance in time: shrink the chunk
                // to the tokens actually on hand.
                let available = bucket.available();
                if available > 0 {
                    chunk_size = ((available * 1024) as usize).min(chunk_size);
                    bucket.try_consume((chunk_size as u64 / 1024).max(1).min(available));
                } else {
                    thread::sleep(DRY_BUCKET_PAUSE);
                    continue;
                }
            }

            let n = file.read(&mut buf[..chunk_size])?;
            if n == 0 {
                break;
            }
            let payload = self.cipher.encrypt(&buf[..n]);
            write_record(&mut stream, &payload)?;

            let mut ack = [0u8; 1];
            match stream.read_exact(&mut ack) {
                Ok(()) => {
                    if ack[0] != ACK_BYTE {
                        return Err(TransferError::protocol(format!(
                            "unexpected acknowledgement byte 0x{:02x}",
                            ack[0]
                        )));
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    self.stats.record_error();
                    return Err(TransferError::Timeout("record acknowledgement".into()));
                }
                Err(e) => return Err(e.into()),
            }

            bytes_sent += n as u64;
            self.stats.record_chunk(n, chunk_size);
        }

        let duration = start.elapsed();
        info!(
            file = %filename,
            bytes = bytes_sent,
            secs = duration.as_secs_f64(),
            rate_kbps = self.stats.average_rate_kbps(),
            "token-bucket send complete"
        );
        self.save_report(&filename);

        Ok(TransferReport {
            bytes: bytes_sent,
            duration,
            average_rate_kbps: self.stats.average_rate_kbps(),
        })
    }

    fn receive(&mut self) -> Result<Received, TransferError> {
        self.stats = TransferStats::new();
        let mut bucket = TokenBucket::new(self.opts.bucket_size, self.opts.token_rate)?;

        let listener = TcpListener::bind((self.listen.host.as_str(), self.listen.port))?;
        let (mut stream, peer) = listener.accept()?;
        debug!(%peer, "token-bucket receive: connection accepted");

        let hs = recv_handshake(&mut stream)?;
        let out = output_path(&self.output_dir, &hs.filename);
        let mut file = File::create(&out)?;

        let mut received: u64 = 0;
        while received < hs.file_size {
            let record = read_record(&mut stream)?;

            // Symmetric shaping, but only a soft wait: receiving must not
            // stall the sender's ACK window for long.
            let tokens_needed = (record.len() as u64 / 1024).max(1);
            let _ = wait_for_tokens(&mut bucket, tokens_needed, RECEIVER_TOKEN_WAIT);

            let data = self.cipher.decrypt(&record)?;
            file.write_all(&data)?;
            received += data.len() as u64;
            self.stats.record_chunk(data.len(), record.len());

            stream.write_all(&[ACK_BYTE])?;
        }
        file.flush()?;

        info!(file = %hs.filename, bytes = received, "token-bucket receive complete");
        self.save_report(&hs.filename);

        Ok(Received {
            path: out,
            filename: hs.filename,
            bytes: received,
        })
    }
}
