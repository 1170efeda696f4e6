//! Sliding-window AIMD reliable strategy.
//!
//! Each record is `[len:u32]["<seq>:"][encrypted chunk]`; the receiver
//! acknowledges cumulatively with newline-delimited ASCII decimals on the
//! same stream. The sender interleaves a non-blocking ACK poll with chunk
//! emission and a retransmission-timer check; congestion (an RTO expiry or a
//! triple duplicate ACK) halves the window and rewinds the file cursor to
//! the last acknowledged chunk. Congestion never aborts the transfer; only
//! an I/O failure or the `EOT` sentinel ends the loop.

use std::collections::HashMap;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use courier_crypto::RecordCipher;
use courier_types::{AimdOptions, Endpoint};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::congestion::{AimdController, AimdSnapshot, AckOutcome, CongestionSignal};
use crate::error::TransferError;
use crate::framing::{read_record, recv_handshake, send_handshake, write_record};
use crate::stats::{write_bandwidth_csv, TransferStats};

use super::{basename, output_path, Received, Strategy, TransferReport, CHUNK_SIZE};

/// Back-off while the congestion window is full.
const WINDOW_FULL_BACKOFF: Duration = Duration::from_millis(10);
/// End-of-transmission sentinel record.
const EOT: &[u8] = b"EOT";

/// The strategy options blob exchanged in the handshake. Strict JSON; an
/// unparseable blob falls back to both detectors enabled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DetectionOptions {
    timeout_detection: bool,
    dupack_detection: bool,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        DetectionOptions {
            timeout_detection: true,
            dupack_detection: true,
        }
    }
}

pub struct AimdTransport {
    listen: Endpoint,
    cipher: Arc<RecordCipher>,
    opts: AimdOptions,
    output_dir: PathBuf,
    report_dir: Option<PathBuf>,
    stats: TransferStats,
    last_run: Option<AimdSnapshot>,
}

impl AimdTransport {
    pub fn new(listen: Endpoint, cipher: Arc<RecordCipher>, opts: AimdOptions) -> Self {
        AimdTransport {
            listen,
            cipher,
            opts,
            output_dir: PathBuf::from("."),
            report_dir: None,
            stats: TransferStats::new(),
            last_run: None,
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Persist the JSON stats report and `bandwidth_stats.csv` into `dir`
    /// after each send.
    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = Some(dir.into());
        self
    }

    pub fn configure(&mut self, opts: AimdOptions) {
        self.opts = opts;
    }

    pub fn options(&self) -> AimdOptions {
        self.opts
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// Controller state frozen at the end of the last completed send.
    pub fn last_run(&self) -> Option<AimdSnapshot> {
        self.last_run
    }
}

/// Line-buffering reader for the non-blocking ACK channel.
struct AckReader {
    buf: Vec<u8>,
}

impl AckReader {
    fn new() -> Self {
        AckReader { buf: Vec::new() }
    }

    /// Drain everything currently readable and append complete ACK values
    /// to `acks`. `WouldBlock` means "nothing yet, keep sending".
    fn poll(&mut self, stream: &mut TcpStream, acks: &mut Vec<i64>) -> Result<(), TransferError> {
        let mut tmp = [0u8; 256];
        loop {
            match stream.read(&mut tmp) {
                Ok(0) => {
                    return Err(TransferError::protocol("receiver closed the ACK channel"));
                }
                Ok(n) => self.buf.extend_from_slice(&tmp[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(value) = std::str::from_utf8(&line[..line.len() - 1])
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok())
            {
                acks.push(value);
            }
        }
        Ok(())
    }
}

/// `write_all` for a socket that is in non-blocking mode for the benefit of
/// the ACK poll: short writes are resumed, `WouldBlock` waits a moment.
fn write_record_nonblocking(stream: &mut TcpStream, payload: &[u8]) -> Result<(), TransferError> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);

    let mut written = 0;
    while written < frame.len() {
        match stream.write(&frame[written..]) {
            Ok(0) => return Err(TransferError::protocol("connection closed mid-record")),
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(1)),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn send_ack(stream: &mut TcpStream, seq: u64) -> Result<(), TransferError> {
    stream.write_all(format!("{seq}\n").as_bytes())?;
    Ok(())
}

impl Strategy for AimdTransport {
    fn send(&mut self, path: &Path, target: &Endpoint) -> Result<TransferReport, TransferError> {
        self.stats = TransferStats::new();
        let controller = Mutex::new(AimdController::new(self.opts)?);

        let filename = basename(path)?;
        let file_size = std::fs::metadata(path)?.len();

        let detection = DetectionOptions {
            timeout_detection: self.opts.timeout_detection,
            dupack_detection: self.opts.dupack_detection,
        };
        let options_blob = serde_json::to_vec(&detection)
            .map_err(|e| TransferError::Config(format!("options blob serialisation: {e}")))?;

        let mut stream = TcpStream::connect((target.host.as_str(), target.port))?;
        send_handshake(&mut stream, &filename, file_size, &options_blob)?;
        stream.set_nonblocking(true)?;

        let start = Instant::now();
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut ack_reader = AckReader::new();
        let mut acks: Vec<i64> = Vec::new();
        let mut file_pos: u64 = 0;
        let chunk = CHUNK_SIZE as u64;

        while file_pos < file_size {
            // Retransmission timer.
            if controller.lock().check_timeouts().is_some() {
                let mut cc = controller.lock();
                cc.multiplicative_decrease(CongestionSignal::Timeout);
                file_pos = cc.rewind_after_timeout(chunk);
                self.stats.record_retry();
                debug!(
                    window = cc.window(),
                    rto = cc.rto(),
                    "congestion: retransmission timeout"
                );
            }

            // Non-blocking ACK poll.
            ack_reader.poll(&mut stream, &mut acks)?;
            for ack in acks.drain(..) {
                let outcome = controller.lock().handle_ack(ack);
                match outcome {
                    AckOutcome::FastRetransmit => {
                        let mut cc = controller.lock();
                        cc.multiplicative_decrease(CongestionSignal::TripleDupAck);
                        file_pos = cc.rewind_after_fast_retransmit(ack, chunk);
                        self.stats.record_retry();
                        debug!(window = cc.window(), ack, "congestion: triple duplicate ACK");
                    }
                    AckOutcome::NewAck => controller.lock().additive_increase(),
                    AckOutcome::DupAck | AckOutcome::Stale => {}
                }
            }

            // Emit while the window has room; otherwise back off briefly.
            if controller.lock().can_send(chunk) {
                file.seek(SeekFrom::Start(file_pos))?;
                let want = ((file_size - file_pos) as usize).min(CHUNK_SIZE);
                let n = file.read(&mut buf[..want])?;
                if n == 0 {
                    break;
                }

                let seq = controller.lock().next_seq();
                let mut payload = seq.to_string().into_bytes();
                payload.push(b':');
                payload.extend_from_slice(&self.cipher.encrypt(&buf[..n]));

                write_record_nonblocking(&mut stream, &payload)?;
                controller.lock().record_sent(seq);
                file_pos += n as u64;
                self.stats.record_chunk(n, n);
            } else {
                thread::sleep(WINDOW_FULL_BACKOFF);
            }
        }

        // Cursor at EOF: back to blocking I/O for the sentinel.
        stream.set_nonblocking(false)?;
        write_record(&mut stream, EOT)?;
        stream.flush()?;

        let snapshot = controller.lock().snapshot();
        self.last_run = Some(snapshot);
        let duration = start.elapsed();
        info!(
            file = %filename,
            bytes = file_size,
            secs = duration.as_secs_f64(),
            timeouts = snapshot.timeouts,
            fast_retransmits = snapshot.fast_retransmits,
            window = snapshot.window,
            "aimd send complete"
        );

        if let Some(dir) = &self.report_dir {
            if let Err(e) = write_bandwidth_csv(self.stats.rate_history(), &dir.join("bandwidth_stats.csv")) {
                warn!(error = %e, "could not write bandwidth csv");
            }
            if let Err(e) = self
                .stats
                .report("aimd", Some(snapshot))
                .save(dir, &filename)
            {
                warn!(error = %e, "could not persist transfer stats");
            }
        }

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
        debug!(%peer, "aimd receive: connection accepted");

        let hs = recv_handshake(&mut stream)?;
        let detection = if hs.options.is_empty() {
            DetectionOptions::default()
        } else {
            serde_json::from_slice(&hs.options).unwrap_or_else(|e| {
                warn!(error = %e, "malformed detection options, using defaults");
                DetectionOptions::default()
            })
        };
        debug!(
            timeout_detection = detection.timeout_detection,
            dupack_detection = detection.dupack_detection,
            "sender congestion detection settings"
        );

        let out = output_path(&self.output_dir, &hs.filename);
        let mut file = File::create(&out)?;

        let mut bytes_received: u64 = 0;
        let mut expected_seq: u64 = 0;
        let mut last_ack: i64 = -1;
        let mut pending: HashMap<u64, Vec<u8>> = HashMap::new();

        while bytes_received < hs.file_size {
            let record = read_record(&mut stream)?;
            if record == EOT {
                debug!("end-of-transmission sentinel received");
                break;
            }

            let Some(colon) = record.iter().position(|&b| b == b':') else {
                continue;
            };
            if colon == 0 {
                continue;
            }
            let seq: u64 = match std::str::from_utf8(&record[..colon])
                .ok()
                .and_then(|s| s.parse().ok())
            {
                Some(seq) => seq,
                None => continue,
            };
            let payload = &record[colon + 1..];

            if seq == expected_seq {
                let data = self.cipher.decrypt(payload)?;
                file.write_all(&data)?;
                bytes_received += data.len() as u64;
                self.stats.record_chunk(data.len(), payload.len());
                send_ack(&mut stream, seq)?;
                last_ack = seq as i64;
                expected_seq += 1;

                // Drain buffered chunks that are now contiguous.
                while let Some(data) = pending.remove(&expected_seq) {
                    file.write_all(&data)?;
                    bytes_received += data.len() as u64;
                    send_ack(&mut stream, expected_seq)?;
                    last_ack = expected_seq as i64;
                    expected_seq += 1;
                }
            } else if seq > expected_seq {
                // A gap: hold the chunk, re-advertise the last in-order
                // sequence so the sender sees the duplicate.
                let data = self.cipher.decrypt(payload)?;
                pending.insert(seq, data);
                if last_ack >= 0 {
                    send_ack(&mut stream, last_ack as u64)?;
                }
            } else {
                // Already written (sender rewound past us); acknowledge so
                // the sender converges. The data is not rewritten.
                send_ack(&mut stream, seq)?;
            }
        }
        file.flush()?;

        if bytes_received < hs.file_size {
            return Err(TransferError::protocol(format!(
                "stream ended after {bytes_received} of {} bytes",
                hs.file_size
            )));
        }

        info!(file = %hs.filename, bytes = bytes_received, "aimd receive complete");
        Ok(Received {
            path: out,
            filename: hs.filename,
            bytes: bytes_received,
        })
    }
}
