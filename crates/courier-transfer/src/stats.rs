//! Rolling per-transfer statistics and their persisted snapshot.
//!
//! Each transfer owns one `TransferStats`; the driving thread updates it and
//! serialises a report on completion. Reports land next to the transferred
//! file as `transfer_stats_<filename>.json`; the AIMD sender additionally
//! writes its rate timeline as `bandwidth_stats.csv`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::congestion::AimdSnapshot;
use crate::error::TransferError;

/// How often a point is appended to the rate timeline.
const SAMPLE_INTERVAL_SECS: f64 = 1.0;

pub struct TransferStats {
    start: Instant,
    bytes_transferred: u64,
    chunks_sent: u64,
    retries: u64,
    errors: u64,
    rate_history: Vec<(f64, f64)>,
    chunk_size_history: Vec<(f64, u64)>,
    last_sample: Instant,
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferStats {
    pub fn new() -> Self {
        let now = Instant::now();
        TransferStats {
            start: now,
            bytes_transferred: 0,
            chunks_sent: 0,
            retries: 0,
            errors: 0,
            rate_history: Vec::new(),
            chunk_size_history: Vec::new(),
            last_sample: now,
        }
    }

    /// Account one transferred chunk and sample the timeline about once a
    /// second.
    pub fn record_chunk(&mut self, bytes: usize, chunk_size: usize) {
        self.bytes_transferred += bytes as u64;
        self.chunks_sent += 1;

        if self.last_sample.elapsed().as_secs_f64() >= SAMPLE_INTERVAL_SECS {
            let elapsed = self.elapsed_secs();
            if elapsed > 0.0 {
                let rate_kbps = self.bytes_transferred as f64 / elapsed / 1024.0;
                self.rate_history.push((elapsed, rate_kbps));
                self.chunk_size_history.push((elapsed, chunk_size as u64));
            }
            self.last_sample = Instant::now();
        }
    }

    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent
    }

    pub fn retries(&self) -> u64 {
        self.retries
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn average_rate_kbps(&self) -> f64 {
        let elapsed = self.elapsed_secs();
        if elapsed > 0.0 {
            self.bytes_transferred as f64 / elapsed / 1024.0
        } else {
            0.0
        }
    }

    pub fn rate_history(&self) -> &[(f64, f64)] {
        &self.rate_history
    }

    /// Freeze the stats into a serialisable report.
    pub fn report(&self, mode: &str, congestion: Option<AimdSnapshot>) -> StatsReport {
        StatsReport {
            mode: mode.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            duration_secs: self.elapsed_secs(),
            bytes_transferred: self.bytes_transferred,
            chunks_sent: self.chunks_sent,
            retries: self.retries,
            errors: self.errors,
            average_rate_kbps: self.average_rate_kbps(),
            rate_history: self.rate_history.clone(),
            chunk_size_history: self.chunk_size_history.clone(),
            congestion: congestion.map(AimdReport::from),
        }
    }
}

/// Serialised form of a completed transfer's statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub mode: String,
    pub timestamp: String,
    pub duration_secs: f64,
    pub bytes_transferred: u64,
    pub chunks_sent: u64,
    pub retries: u64,
    pub errors: u64,
    pub average_rate_kbps: f64,
    pub rate_history: Vec<(f64, f64)>,
    pub chunk_size_history: Vec<(f64, u64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub congestion: Option<AimdReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AimdReport {
    pub final_window: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srtt_ms: Option<f64>,
    pub final_rto_secs: f64,
    pub timeouts: u64,
    pub fast_retransmits: u64,
    pub total_retransmits: u64,
}

impl From<AimdSnapshot> for AimdReport {
    fn from(snap: AimdSnapshot) -> Self {
        AimdReport {
            final_window: snap.window,
            srtt_ms: snap.srtt.map(|s| s * 1000.0),
            final_rto_secs: snap.rto,
            timeouts: snap.timeouts,
            fast_retransmits: snap.fast_retransmits,
            total_retransmits: snap.total_retransmits,
        }
    }
}

impl StatsReport {
    /// Write the report as `transfer_stats_<filename>.json` inside `dir`.
    pub fn save(&self, dir: &Path, filename: &str) -> Result<PathBuf, TransferError> {
        let path = dir.join(format!("transfer_stats_{filename}.json"));
        let file = File::create(&path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .map_err(|e| TransferError::Protocol(format!("stats serialisation failed: {e}")))?;
        debug!(path = %path.display(), "saved transfer stats");
        Ok(path)
    }
}

/// Write the AIMD rate timeline as `Time(s),Bandwidth(KB/s)` rows.
pub fn write_bandwidth_csv(history: &[(f64, f64)], path: &Path) -> Result<(), TransferError> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "Time(s),Bandwidth(KB/s)")?;
    for (t, rate) in history {
        writeln!(out, "{t:.3},{rate:.2}")?;
    }
    out.flush()?;
    Ok(())
}
