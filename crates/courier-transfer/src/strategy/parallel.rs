//! Multi-stream parallel strategy: the file is split into equal ranges and
//! each range travels on its own TCP connection to `target_port + i`. The
//! receiver reassembles the ranges by ascending start offset.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use courier_crypto::RecordCipher;
use courier_types::{Endpoint, ParallelOptions};
use tracing::{debug, info, warn};

use crate::error::TransferError;
use crate::framing::{read_record, write_record, ACK_OK};

use super::{basename, output_path, Received, Strategy, TransferReport, CHUNK_SIZE};

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ParallelTransport {
    listen: Endpoint,
    cipher: Arc<RecordCipher>,
    opts: ParallelOptions,
    output_dir: PathBuf,
}

impl ParallelTransport {
    pub fn new(listen: Endpoint, cipher: Arc<RecordCipher>, opts: ParallelOptions) -> Self {
        ParallelTransport {
            listen,
            cipher,
            opts,
            output_dir: PathBuf::from("."),
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    fn check_streams(&self) -> Result<usize, TransferError> {
        if self.opts.streams == 0 {
            return Err(TransferError::Config(
                "parallel transfer needs at least one stream".into(),
            ));
        }
        Ok(self.opts.streams)
    }
}

/// Equal ranges over `[0, file_size)`; the last range carries the
/// remainder. Every stream gets a range even when it is empty, so both
/// sides always open the same number of connections.
fn split_ranges(file_size: u64, streams: usize) -> Vec<(u64, u64)> {
    let streams = streams as u64;
    let mut range = file_size / streams;
    if file_size % streams != 0 {
        range += 1;
    }
    (0..streams)
        .map(|i| {
            let start = (i * range).min(file_size);
            let end = ((i + 1) * range).min(file_size);
            (start, end)
        })
        .collect()
}

fn connect_with_retry(host: &str, port: u16) -> Result<TcpStream, TransferError> {
    let addr: SocketAddr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| TransferError::Config(format!("{host}:{port} does not resolve")))?;

    let mut last_err = None;
    for attempt in 0..CONNECT_ATTEMPTS {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%addr, attempt = attempt + 1, error = %e, "substream connect failed");
                last_err = Some(e);
                if attempt + 1 < CONNECT_ATTEMPTS {
                    thread::sleep(CONNECT_RETRY_DELAY);
                }
            }
        }
    }
    Err(last_err.map(TransferError::Io).unwrap_or_else(|| {
        TransferError::protocol("substream connect failed without an error")
    }))
}

/// Drive one substream: header, then framed encrypted chunks, each awaiting
/// an `"OK"` record.
fn send_range(
    path: &Path,
    cipher: &RecordCipher,
    host: &str,
    port: u16,
    filename: &str,
    start: u64,
    end: u64,
) -> Result<u64, TransferError> {
    let mut stream = connect_with_retry(host, port)?;

    write_record(&mut stream, format!("{filename}:{start}:{end}").as_bytes())?;
    let ack = read_record(&mut stream)?;
    if ack != ACK_OK {
        return Err(TransferError::protocol("substream header not acknowledged"));
    }

    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut remaining = end - start;
    while remaining > 0 {
        let want = (remaining as usize).min(CHUNK_SIZE);
        let n = file.read(&mut buf[..want])?;
        if n == 0 {
            return Err(TransferError::protocol(format!(
                "source file ended {remaining} bytes before range end"
            )));
        }
        write_record(&mut stream, &cipher.encrypt(&buf[..n]))?;
        let ack = read_record(&mut stream)?;
        if ack != ACK_OK {
            return Err(TransferError::protocol("substream record not acknowledged"));
        }
        remaining -= n as u64;
    }
    Ok(end - start)
}

struct RangeFile {
    start: u64,
    path: PathBuf,
    filename: String,
    bytes: u64,
}

/// Receive one substream into its `chunk_<i>_<filename>` temp file.
fn recv_range(
    listener: TcpListener,
    cipher: &RecordCipher,
    output_dir: &Path,
    index: usize,
) -> Result<RangeFile, TransferError> {
    let (mut stream, peer) = listener.accept()?;
    debug!(%peer, index, "parallel receive: substream accepted");

    let header = read_record(&mut stream)?;
    let header = String::from_utf8(header)
        .map_err(|_| TransferError::protocol("substream header is not UTF-8"))?;
    // Split from the right: the filename may itself contain ':'.
    let mut parts = header.rsplitn(3, ':');
    let end: u64 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransferError::protocol("substream header missing range end"))?;
    let start: u64 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransferError::protocol("substream header missing range start"))?;
    let filename = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TransferError::protocol("substream header missing filename"))?
        .to_string();
    if end < start {
        return Err(TransferError::protocol("substream range is inverted"));
    }
    write_record(&mut stream, ACK_OK)?;

    let temp_path = output_dir.join(format!("chunk_{index}_{filename}"));
    let mut file = File::create(&temp_path)?;

    let mut received: u64 = 0;
    let expected = end - start;
    while received < expected {
        let record = read_record(&mut stream)?;
        let data = cipher.decrypt(&record)?;
        file.write_all(&data)?;
        received += data.len() as u64;
        write_record(&mut stream, ACK_OK)?;
    }
    file.flush()?;

    Ok(RangeFile {
        start,
        path: temp_path,
        filename,
        bytes: received,
    })
}

impl Strategy for ParallelTransport {
    fn send(&mut self, path: &Path, target: &Endpoint) -> Result<TransferReport, TransferError> {
        let streams = self.check_streams()?;
        let filename = basename(path)?;
        let file_size = std::fs::metadata(path)?.len();
        let ranges = split_ranges(file_size, streams);

        let start = Instant::now();
        let mut handles = Vec::with_capacity(streams);
        for (i, (range_start, range_end)) in ranges.into_iter().enumerate() {
            let path = path.to_path_buf();
            let cipher = Arc::clone(&self.cipher);
            let host = target.host.clone();
            let filename = filename.clone();
            let port = target
                .port
                .checked_add(i as u16)
                .ok_or_else(|| TransferError::Config("substream port overflows u16".into()))?;

            handles.push(thread::spawn(move || {
                send_range(&path, &cipher, &host, port, &filename, range_start, range_end)
            }));
        }

        let mut sent = 0u64;
        for handle in handles {
            let bytes = handle
                .join()
                .map_err(|_| TransferError::protocol("substream sender thread panicked"))??;
            sent += bytes;
        }

        let duration = start.elapsed();
        info!(
            file = %filename,
            bytes = sent,
            streams,
            secs = duration.as_secs_f64(),
            "parallel send complete"
        );
        Ok(TransferReport {
            bytes: sent,
            duration,
            average_rate_kbps: if duration.as_secs_f64() > 0.0 {
                sent as f64 / duration.as_secs_f64() / 1024.0
            } else {
                0.0
            },
        })
    }

    fn receive(&mut self) -> Result<Received, TransferError> {
        let streams = self.check_streams()?;

        // Bind every port up front so a taken port fails the whole receive
        // before any substream is accepted.
        let mut listeners = Vec::with_capacity(streams);
        for i in 0..streams {
            let port = self
                .listen
                .port
                .checked_add(i as u16)
                .ok_or_else(|| TransferError::Config("substream port overflows u16".into()))?;
            listeners.push(TcpListener::bind((self.listen.host.as_str(), port))?);
        }

        let mut handles = Vec::with_capacity(streams);
        for (i, listener) in listeners.into_iter().enumerate() {
            let cipher = Arc::clone(&self.cipher);
            let output_dir = self.output_dir.clone();
            handles.push(thread::spawn(move || {
                recv_range(listener, &cipher, &output_dir, i)
            }));
        }

        let mut ranges = Vec::with_capacity(streams);
        for handle in handles {
            ranges.push(
                handle
                    .join()
                    .map_err(|_| TransferError::protocol("substream receiver thread panicked"))??,
            );
        }
        ranges.sort_by_key(|r| r.start);

        let filename = ranges
            .first()
            .map(|r| r.filename.clone())
            .ok_or_else(|| TransferError::protocol("no substreams completed"))?;
        let declared: u64 = ranges.iter().map(|r| r.bytes).sum();
        let out = output_path(&self.output_dir, &filename);
        let mut outfile = File::create(&out)?;
        let mut total = 0u64;
        for range in &ranges {
            let mut part = File::open(&range.path)?;
            total += std::io::copy(&mut part, &mut outfile)?;
            if let Err(e) = std::fs::remove_file(&range.path) {
                warn!(path = %range.path.display(), error = %e, "could not remove range temp file");
            }
        }
        outfile.flush()?;
        if total != declared {
            return Err(TransferError::protocol(format!(
                "reassembled {total} bytes but substreams delivered {declared}"
            )));
        }

        info!(file = %filename, bytes = total, streams, "parallel receive complete");
        Ok(Received {
            path: out,
            filename,
            bytes: total,
        })
    }
}
