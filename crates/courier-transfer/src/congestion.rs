//! Loss-signalled AIMD congestion control for the reliable transfer
//! strategy.
//!
//! The controller tracks a byte-denominated congestion window, a
//! Jacobson/Karels RTT estimator, and the per-sequence send times needed to
//! detect retransmission timeouts. Two congestion signals exist:
//!
//!   - a tracked sequence outliving the RTO, and
//!   - a run of duplicate ACKs reaching the configured threshold
//!     (fast retransmit).
//!
//! On a new ACK the window grows by one chunk (additive increase, capped);
//! on either congestion signal it halves (multiplicative decrease, floored).
//! Congestion never aborts a transfer: the sender retransmits until the
//! underlying connection breaks.

use std::collections::HashMap;
use std::time::Instant;

use courier_types::AimdOptions;

use crate::error::TransferError;

/// SRTT smoothing factor (1/8).
pub const SRTT_ALPHA: f64 = 0.125;
/// RTTVAR smoothing factor (1/4).
pub const RTTVAR_BETA: f64 = 0.25;
/// RTO clamp, seconds.
pub const RTO_MIN: f64 = 1.0;
pub const RTO_MAX: f64 = 60.0;
/// Additive increase step: one chunk worth of window per new ACK.
const WINDOW_STEP: u64 = 1024;

/// Why the window was shrunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionSignal {
    Timeout,
    TripleDupAck,
}

/// What an inbound ACK meant to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Cumulative progress: `last_ack` advanced.
    NewAck,
    /// Same ACK value again, below the fast-retransmit threshold.
    DupAck,
    /// The duplicate threshold was reached; rewind and resend.
    FastRetransmit,
    /// An ACK below `last_ack`; already superseded.
    Stale,
}

/// Counters and estimator state frozen at the end of a transfer.
#[derive(Debug, Clone, Copy)]
pub struct AimdSnapshot {
    pub window: u64,
    pub srtt: Option<f64>,
    pub rto: f64,
    pub timeouts: u64,
    pub fast_retransmits: u64,
    pub total_retransmits: u64,
}

pub struct AimdController {
    opts: AimdOptions,
    window: u64,
    srtt: Option<f64>,
    rttvar: f64,
    rto: f64,
    dup_acks: u32,
    /// Highest cumulative ACK; -1 before the first ACK.
    last_ack: i64,
    next_seq: u64,
    in_flight: HashMap<u64, Instant>,
    in_fast_recovery: bool,
    last_recovery: i64,
    timeouts: u64,
    fast_retransmits: u64,
    total_retransmits: u64,
}

impl AimdController {
    pub fn new(opts: AimdOptions) -> Result<Self, TransferError> {
        if opts.min_window == 0 {
            return Err(TransferError::Config("min_window must be positive".into()));
        }
        if opts.min_window > opts.max_window {
            return Err(TransferError::Config(format!(
                "min_window {} exceeds max_window {}",
                opts.min_window, opts.max_window
            )));
        }
        if opts.initial_window < opts.min_window || opts.initial_window > opts.max_window {
            return Err(TransferError::Config(format!(
                "initial_window {} outside [{}, {}]",
                opts.initial_window, opts.min_window, opts.max_window
            )));
        }
        if opts.dup_ack_threshold == 0 {
            return Err(TransferError::Config(
                "dup_ack_threshold must be at least 1".into(),
            ));
        }
        Ok(AimdController {
            window: opts.initial_window,
            opts,
            srtt: None,
            rttvar: 0.0,
            rto: RTO_MIN,
            dup_acks: 0,
            last_ack: -1,
            next_seq: 0,
            in_flight: HashMap::new(),
            in_fast_recovery: false,
            last_recovery: -1,
            timeouts: 0,
            fast_retransmits: 0,
            total_retransmits: 0,
        })
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    pub fn rto(&self) -> f64 {
        self.rto
    }

    pub fn srtt(&self) -> Option<f64> {
        self.srtt
    }

    pub fn last_ack(&self) -> i64 {
        self.last_ack
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn snapshot(&self) -> AimdSnapshot {
        AimdSnapshot {
            window: self.window,
            srtt: self.srtt,
            rto: self.rto,
            timeouts: self.timeouts,
            fast_retransmits: self.fast_retransmits,
            total_retransmits: self.total_retransmits,
        }
    }

    /// Whether the window has room for another chunk: the number of
    /// unacknowledged chunks must stay below `window / chunk_size` (at
    /// least one chunk is always allowed).
    pub fn can_send(&self, chunk_size: u64) -> bool {
        let window_chunks = (self.window / chunk_size).max(1) as i64;
        (self.next_seq as i64) < self.last_ack + 1 + window_chunks
    }

    /// Mark `seq` as sent now; advances `next_seq` past it.
    pub fn record_sent(&mut self, seq: u64) {
        self.in_flight.insert(seq, Instant::now());
        self.next_seq = seq + 1;
    }

    /// Process one cumulative ACK from the receiver. `-1` is a legal
    /// duplicate of the pre-transfer state.
    pub fn handle_ack(&mut self, ack_seq: i64) -> AckOutcome {
        if ack_seq >= 0 {
            if let Some(sent_at) = self.in_flight.remove(&(ack_seq as u64)) {
                self.update_rtt(sent_at.elapsed().as_secs_f64());
            }
        }

        if ack_seq == self.last_ack {
            if !self.opts.dupack_detection {
                return AckOutcome::DupAck;
            }
            self.dup_acks += 1;
            if self.dup_acks >= self.opts.dup_ack_threshold {
                self.dup_acks = 0;
                if !self.in_fast_recovery && self.last_recovery != ack_seq {
                    self.in_fast_recovery = true;
                    self.last_recovery = ack_seq;
                    return AckOutcome::FastRetransmit;
                }
            }
            AckOutcome::DupAck
        } else if ack_seq > self.last_ack {
            self.dup_acks = 0;
            self.last_ack = ack_seq;
            if self.in_fast_recovery && ack_seq > self.last_recovery {
                self.in_fast_recovery = false;
            }
            AckOutcome::NewAck
        } else {
            AckOutcome::Stale
        }
    }

    /// Jacobson/Karels update from one RTT sample in seconds.
    fn update_rtt(&mut self, rtt: f64) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2.0;
            }
            Some(srtt) => {
                self.rttvar = (1.0 - RTTVAR_BETA) * self.rttvar + RTTVAR_BETA * (srtt - rtt).abs();
                self.srtt = Some((1.0 - SRTT_ALPHA) * srtt + SRTT_ALPHA * rtt);
            }
        }
        let srtt = self.srtt.unwrap_or(rtt);
        self.rto = (srtt + 4.0 * self.rttvar).clamp(RTO_MIN, RTO_MAX);
    }

    /// Earliest tracked sequence whose timer has expired, if timeout
    /// detection is enabled.
    pub fn check_timeouts(&self) -> Option<u64> {
        self.check_timeouts_at(Instant::now())
    }

    pub fn check_timeouts_at(&self, now: Instant) -> Option<u64> {
        if !self.opts.timeout_detection {
            return None;
        }
        self.in_flight
            .iter()
            .filter(|(_, sent_at)| now.duration_since(**sent_at).as_secs_f64() > self.rto)
            .map(|(seq, _)| *seq)
            .min()
    }

    /// Additive increase on a new cumulative ACK.
    pub fn additive_increase(&mut self) {
        self.window = (self.window + WINDOW_STEP).min(self.opts.max_window);
    }

    /// Multiplicative decrease on a congestion signal.
    pub fn multiplicative_decrease(&mut self, signal: CongestionSignal) {
        self.window = (self.window / 2).max(self.opts.min_window);
        match signal {
            CongestionSignal::Timeout => self.timeouts += 1,
            CongestionSignal::TripleDupAck => self.fast_retransmits += 1,
        }
        self.total_retransmits += 1;
    }

    /// Go-back-N rewind after a timeout: resume at the first chunk past the
    /// highest cumulative ACK, keeping sequence labels and file offsets
    /// aligned. Returns the file offset to seek to. Every in-flight
    /// sequence at or past the new `next_seq` is forgotten so its stale
    /// send time cannot poison later RTT samples.
    pub fn rewind_after_timeout(&mut self, chunk_size: u64) -> u64 {
        let resume_seq = (self.last_ack + 1).max(0) as u64;
        self.next_seq = resume_seq;
        self.in_flight.retain(|seq, _| *seq < resume_seq);
        resume_seq * chunk_size
    }

    /// Rewind for a fast retransmit: resume at the chunk after the
    /// duplicated ACK.
    pub fn rewind_after_fast_retransmit(&mut self, ack_seq: i64, chunk_size: u64) -> u64 {
        let resume_seq = (ack_seq + 1).max(0) as u64;
        self.next_seq = resume_seq;
        self.in_flight.retain(|seq, _| *seq < resume_seq);
        resume_seq * chunk_size
    }
}
