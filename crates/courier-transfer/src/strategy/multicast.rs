//! One-to-many strategy: the file is encrypted once, then a worker per
//! target streams the same ciphertext over its own TCP connection. Overall
//! success is the AND of the per-target results; the first fatal error per
//! target surfaces on a shared channel.

use std::fs::File;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use courier_crypto::RecordCipher;
use courier_types::{Endpoint, MulticastOptions};
use crossbeam_channel::unbounded;
use tracing::{debug, info, warn};

use crate::error::TransferError;
use crate::framing::{read_record, recv_handshake, send_handshake, write_record};

use super::{basename, output_path, Received, Strategy, TransferReport};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const COMPLETE: &[u8] = b"COMPLETE";
/// Poll interval for the shutdown flag in the port-range receiver.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Per-target outcome of a fan-out send.
#[derive(Debug)]
pub struct MulticastReport {
    pub results: Vec<(Endpoint, bool)>,
    pub errors: Vec<String>,
    pub bytes: u64,
    pub duration: Duration,
}

impl MulticastReport {
    pub fn all_succeeded(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(|(_, ok)| *ok)
    }
}

pub struct MulticastTransport {
    listen: Endpoint,
    cipher: Arc<RecordCipher>,
    opts: MulticastOptions,
    output_dir: PathBuf,
}

impl MulticastTransport {
    pub fn new(listen: Endpoint, cipher: Arc<RecordCipher>, opts: MulticastOptions) -> Self {
        MulticastTransport {
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

    /// Fan the file out to every target at once.
    pub fn send_to_all(
        &mut self,
        path: &Path,
        targets: &[Endpoint],
    ) -> Result<MulticastReport, TransferError> {
        if targets.is_empty() {
            return Err(TransferError::Config("multicast needs at least one target".into()));
        }

        let filename = basename(path)?;
        let plaintext = std::fs::read(path)?;
        let file_size = plaintext.len() as u64;
        // One encryption pass shared by every worker.
        let ciphertext = Arc::new(self.cipher.encrypt(&plaintext));
        drop(plaintext);

        info!(
            file = %filename,
            bytes = file_size,
            targets = targets.len(),
            "multicast send starting"
        );

        let (err_tx, err_rx) = unbounded::<String>();
        let start = Instant::now();
        let mut workers = Vec::with_capacity(targets.len());
        for target in targets {
            let target = target.clone();
            let filename = filename.clone();
            let ciphertext = Arc::clone(&ciphertext);
            let err_tx = err_tx.clone();
            let ack_timeout = self.opts.timeout;

            workers.push(thread::spawn(move || {
                match send_one(&target, &filename, file_size, &ciphertext, ack_timeout) {
                    Ok(()) => (target, true),
                    Err(e) => {
                        let _ = err_tx.send(format!("{target}: {e}"));
                        (target, false)
                    }
                }
            }));
        }
        drop(err_tx);

        let mut results = Vec::with_capacity(workers.len());
        for worker in workers {
            results.push(
                worker
                    .join()
                    .map_err(|_| TransferError::protocol("multicast worker thread panicked"))?,
            );
        }

        let errors: Vec<String> = err_rx.try_iter().collect();
        for error in &errors {
            warn!(%error, "multicast target failed");
        }

        let duration = start.elapsed();
        let delivered = results.iter().filter(|(_, ok)| *ok).count();
        info!(
            delivered,
            targets = results.len(),
            secs = duration.as_secs_f64(),
            "multicast send finished"
        );

        Ok(MulticastReport {
            results,
            errors,
            bytes: file_size,
            duration,
        })
    }

    /// Bind `count` consecutive ports and serve inbound transfers on each
    /// until `shutdown` is raised. Output files are qualified by the source
    /// address so concurrent senders cannot collide.
    pub fn spawn_receivers(
        &self,
        count: usize,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Vec<JoinHandle<()>>, TransferError> {
        if count == 0 {
            return Err(TransferError::Config("receiver port range is empty".into()));
        }

        let mut listeners = Vec::with_capacity(count);
        for i in 0..count {
            let port = self
                .listen
                .port
                .checked_add(i as u16)
                .ok_or_else(|| TransferError::Config("receiver port overflows u16".into()))?;
            let listener = TcpListener::bind((self.listen.host.as_str(), port))?;
            listener.set_nonblocking(true)?;
            listeners.push((port, listener));
        }

        let mut handles = Vec::with_capacity(count);
        for (port, listener) in listeners {
            let cipher = Arc::clone(&self.cipher);
            let output_dir = self.output_dir.clone();
            let shutdown = Arc::clone(&shutdown);

            handles.push(thread::spawn(move || {
                debug!(port, "multicast receiver listening");
                while !shutdown.load(Ordering::Relaxed) {
                    match listener.accept() {
                        Ok((mut stream, peer)) => {
                            if let Err(e) = stream.set_nonblocking(false) {
                                warn!(port, error = %e, "could not switch stream to blocking");
                                continue;
                            }
                            match receive_one(&mut stream, &cipher, &output_dir, Some(peer)) {
                                Ok(received) => {
                                    info!(
                                        port,
                                        %peer,
                                        file = %received.filename,
                                        bytes = received.bytes,
                                        "multicast receiver stored transfer"
                                    );
                                }
                                Err(e) => {
                                    // A bad sender must not take the port down.
                                    warn!(port, %peer, error = %e, "inbound transfer failed");
                                }
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(ACCEPT_POLL);
                        }
                        Err(e) => {
                            warn!(port, error = %e, "accept failed");
                            thread::sleep(ACCEPT_POLL);
                        }
                    }
                }
                debug!(port, "multicast receiver stopped");
            }));
        }
        Ok(handles)
    }
}

fn send_one(
    target: &Endpoint,
    filename: &str,
    file_size: u64,
    ciphertext: &[u8],
    ack_timeout: Duration,
) -> Result<(), TransferError> {
    let addr: SocketAddr = (target.host.as_str(), target.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| TransferError::Config(format!("{target} does not resolve")))?;
    let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;

    send_handshake(&mut stream, filename, file_size, b"")?;
    write_record(&mut stream, ciphertext)?;
    stream.flush()?;

    stream.set_read_timeout(Some(ack_timeout))?;
    match read_record(&mut stream) {
        Ok(record) if record == COMPLETE => Ok(()),
        Ok(_) => Err(TransferError::protocol("target sent an unexpected completion record")),
        Err(TransferError::Io(e))
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut =>
        {
            Err(TransferError::Timeout("multicast completion record".into()))
        }
        Err(e) => Err(e),
    }
}

/// Receive one whole-file record from an accepted stream.
fn receive_one(
    stream: &mut TcpStream,
    cipher: &RecordCipher,
    output_dir: &Path,
    source: Option<SocketAddr>,
) -> Result<Received, TransferError> {
    let hs = recv_handshake(stream)?;

    let out = match source {
        // Port-range receivers qualify the name by sender address.
        Some(peer) => output_dir.join(format!(
            "received_{}_{}_{}",
            peer.ip(),
            peer.port(),
            hs.filename
        )),
        None => output_path(output_dir, &hs.filename),
    };

    let record = read_record(stream)?;
    let data = cipher.decrypt(&record)?;
    let mut file = File::create(&out)?;
    file.write_all(&data)?;
    file.flush()?;

    write_record(stream, COMPLETE)?;

    Ok(Received {
        path: out,
        filename: hs.filename,
        bytes: data.len() as u64,
    })
}

impl Strategy for MulticastTransport {
    fn send(&mut self, path: &Path, target: &Endpoint) -> Result<TransferReport, TransferError> {
        let report = self.send_to_all(path, std::slice::from_ref(target))?;
        if !report.all_succeeded() {
            return Err(TransferError::Protocol(
                report
                    .errors
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "multicast target failed".into()),
            ));
        }
        Ok(TransferReport {
            bytes: report.bytes,
            duration: report.duration,
            average_rate_kbps: if report.duration.as_secs_f64() > 0.0 {
                report.bytes as f64 / report.duration.as_secs_f64() / 1024.0
            } else {
                0.0
            },
        })
    }

    fn receive(&mut self) -> Result<Received, TransferError> {
        let listener = TcpListener::bind((self.listen.host.as_str(), self.listen.port))?;
        let (mut stream, peer) = listener.accept()?;
        debug!(%peer, "multicast receive: connection accepted");
        let received = receive_one(&mut stream, &self.cipher, &self.output_dir, None)?;
        info!(file = %received.filename, bytes = received.bytes, "multicast receive complete");
        Ok(received)
    }
}
