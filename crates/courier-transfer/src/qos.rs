//! Weighted bandwidth allocation across the transfers sharing a process.
//!
//! Every QoS transfer registers a priority; the manager splits a fixed
//! aggregate bandwidth proportionally to weight, never allocating below a
//! transfer's configured floor. Registration hands back an RAII guard so a
//! transfer that ends, or fails, always deregisters and triggers
//! reallocation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// Aggregate bandwidth shared by all registered transfers: 1 MiB/s.
pub const DEFAULT_TOTAL_BANDWIDTH: u64 = 1024 * 1024;

/// Priority descriptor for one registered transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferPriority {
    pub level: u32,
    /// Bandwidth floor in bytes per second.
    pub min_bandwidth: u64,
    /// Share weight; lower levels carry more weight.
    pub weight: f64,
}

impl TransferPriority {
    pub fn new(level: u32, min_bandwidth: u64) -> Self {
        TransferPriority {
            level,
            min_bandwidth,
            weight: 1.0 / level.max(1) as f64,
        }
    }
}

struct QosEntry {
    priority: TransferPriority,
    allocated: u64,
}

struct QosInner {
    transfers: HashMap<u64, QosEntry>,
    total_bandwidth: u64,
}

pub struct QosManager {
    inner: Mutex<QosInner>,
    next_id: AtomicU64,
}

impl Default for QosManager {
    fn default() -> Self {
        Self::new()
    }
}

impl QosManager {
    pub fn new() -> Self {
        Self::with_total_bandwidth(DEFAULT_TOTAL_BANDWIDTH)
    }

    pub fn with_total_bandwidth(total_bandwidth: u64) -> Self {
        QosManager {
            inner: Mutex::new(QosInner {
                transfers: HashMap::new(),
                total_bandwidth,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a transfer; the returned guard deregisters it on drop.
    pub fn register(self: &Arc<Self>, priority: TransferPriority) -> QosHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock();
            inner.transfers.insert(
                id,
                QosEntry {
                    priority,
                    allocated: priority.min_bandwidth,
                },
            );
            Self::reallocate(&mut inner);
        }
        debug!(id, level = priority.level, "registered qos transfer");
        QosHandle {
            id,
            manager: Arc::clone(self),
        }
    }

    fn remove(&self, id: u64) {
        let mut inner = self.inner.lock();
        if inner.transfers.remove(&id).is_some() {
            Self::reallocate(&mut inner);
            debug!(id, "deregistered qos transfer");
        }
    }

    /// Split the aggregate proportionally to weight. The fair share is
    /// assigned outright; a transfer's configured floor is the only thing
    /// that can hold its allocation above that share.
    fn reallocate(inner: &mut QosInner) {
        let total_weight: f64 = inner.transfers.values().map(|e| e.priority.weight).sum();
        if total_weight <= 0.0 {
            return;
        }
        let total = inner.total_bandwidth as f64;
        for entry in inner.transfers.values_mut() {
            let share = (entry.priority.weight / total_weight * total).round() as u64;
            entry.allocated = share.max(entry.priority.min_bandwidth);
        }
    }

    /// Currently allocated bandwidth for a transfer, bytes per second.
    /// Zero means "not registered" and callers skip pacing.
    pub fn bandwidth_for(&self, id: u64) -> u64 {
        self.inner
            .lock()
            .transfers
            .get(&id)
            .map(|e| e.allocated)
            .unwrap_or(0)
    }

    pub fn active_transfers(&self) -> usize {
        self.inner.lock().transfers.len()
    }
}

/// RAII registration for one QoS transfer.
pub struct QosHandle {
    id: u64,
    manager: Arc<QosManager>,
}

impl QosHandle {
    pub fn bandwidth(&self) -> u64 {
        self.manager.bandwidth_for(self.id)
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for QosHandle {
    fn drop(&mut self) {
        self.manager.remove(self.id);
    }
}
