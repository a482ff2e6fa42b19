//! Scheduler counters
//!
//! Lock-free counters updated from the slot loop and the carrier tasks. Readers
//! take a serializable [`MetricsSnapshot`]; counts are monotonic and relaxed.

use common::types::{CarrierIndex, Direction};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters of one carrier
#[derive(Debug, Default)]
pub struct CarrierMetrics {
    dl_new_tx: AtomicU64,
    dl_retx: AtomicU64,
    ul_new_tx: AtomicU64,
    ul_retx: AtomicU64,
    dl_bytes: AtomicU64,
    ul_bytes: AtomicU64,
    late_slots: AtomicU64,
    validation_failures: AtomicU64,
    max_latency_us: AtomicU64,
}

impl CarrierMetrics {
    /// Account one published grant
    pub fn record_grant(&self, direction: Direction, is_retx: bool, tbs: u32) {
        let (new_tx, retx, bytes) = match direction {
            Direction::Downlink => (&self.dl_new_tx, &self.dl_retx, &self.dl_bytes),
            Direction::Uplink => (&self.ul_new_tx, &self.ul_retx, &self.ul_bytes),
        };
        if is_retx {
            retx.fetch_add(1, Ordering::Relaxed);
        } else {
            new_tx.fetch_add(1, Ordering::Relaxed);
            bytes.fetch_add(tbs as u64, Ordering::Relaxed);
        }
    }

    pub fn record_late(&self) {
        self.late_slots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, latency: Duration) {
        let micros = latency.as_micros().min(u64::MAX as u128) as u64;
        self.max_latency_us.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn late_slots(&self) -> u64 {
        self.late_slots.load(Ordering::Relaxed)
    }

    fn snapshot(&self, carrier: CarrierIndex) -> CarrierMetricsSnapshot {
        CarrierMetricsSnapshot {
            carrier,
            dl_new_tx: self.dl_new_tx.load(Ordering::Relaxed),
            dl_retx: self.dl_retx.load(Ordering::Relaxed),
            ul_new_tx: self.ul_new_tx.load(Ordering::Relaxed),
            ul_retx: self.ul_retx.load(Ordering::Relaxed),
            dl_bytes: self.dl_bytes.load(Ordering::Relaxed),
            ul_bytes: self.ul_bytes.load(Ordering::Relaxed),
            late_slots: self.late_slots.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            max_latency_us: self.max_latency_us.load(Ordering::Relaxed),
        }
    }
}

/// Scheduler-wide counters
#[derive(Debug)]
pub struct SchedulerMetrics {
    carriers: Vec<CarrierMetrics>,
    harq_losses: AtomicU64,
    stale_feedback: AtomicU64,
    flushed_processes: AtomicU64,
    config_faults: AtomicU64,
    void_slots: AtomicU64,
    published_slots: AtomicU64,
    acks: AtomicU64,
    nacks: AtomicU64,
}

impl SchedulerMetrics {
    pub fn new(nof_carriers: usize) -> Self {
        Self {
            carriers: (0..nof_carriers).map(|_| CarrierMetrics::default()).collect(),
            harq_losses: AtomicU64::new(0),
            stale_feedback: AtomicU64::new(0),
            flushed_processes: AtomicU64::new(0),
            config_faults: AtomicU64::new(0),
            void_slots: AtomicU64::new(0),
            published_slots: AtomicU64::new(0),
            acks: AtomicU64::new(0),
            nacks: AtomicU64::new(0),
        }
    }

    pub fn carrier(&self, carrier: CarrierIndex) -> Option<&CarrierMetrics> {
        self.carriers.get(carrier.index())
    }

    /// Transport blocks given up after exhausting retransmissions or expiring
    pub fn add_harq_losses(&self, count: u64) {
        self.harq_losses.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_stale_feedback(&self) {
        self.stale_feedback.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_flushed(&self, count: u64) {
        self.flushed_processes.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_config_fault(&self) {
        self.config_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_void_slot(&self) {
        self.void_slots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published_slot(&self) {
        self.published_slots.fetch_add(1, Ordering::Relaxed);
    }

    /// Feedback that reached an active process
    pub fn record_feedback(&self, ack: bool) {
        if ack {
            self.acks.fetch_add(1, Ordering::Relaxed);
        } else {
            self.nacks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            carriers: self
                .carriers
                .iter()
                .enumerate()
                .map(|(i, c)| c.snapshot(CarrierIndex(i as u8)))
                .collect(),
            harq_losses: self.harq_losses.load(Ordering::Relaxed),
            stale_feedback: self.stale_feedback.load(Ordering::Relaxed),
            flushed_processes: self.flushed_processes.load(Ordering::Relaxed),
            config_faults: self.config_faults.load(Ordering::Relaxed),
            void_slots: self.void_slots.load(Ordering::Relaxed),
            published_slots: self.published_slots.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            nacks: self.nacks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CarrierMetricsSnapshot {
    pub carrier: CarrierIndex,
    pub dl_new_tx: u64,
    pub dl_retx: u64,
    pub ul_new_tx: u64,
    pub ul_retx: u64,
    pub dl_bytes: u64,
    pub ul_bytes: u64,
    pub late_slots: u64,
    pub validation_failures: u64,
    pub max_latency_us: u64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub carriers: Vec<CarrierMetricsSnapshot>,
    pub harq_losses: u64,
    pub stale_feedback: u64,
    pub flushed_processes: u64,
    pub config_faults: u64,
    pub void_slots: u64,
    pub published_slots: u64,
    pub acks: u64,
    pub nacks: u64,
}

impl MetricsSnapshot {
    pub fn carrier(&self, carrier: CarrierIndex) -> Option<&CarrierMetricsSnapshot> {
        self.carriers.get(carrier.index())
    }

    /// Late slots summed over carriers
    pub fn late_slots(&self) -> u64 {
        self.carriers.iter().map(|c| c.late_slots).sum()
    }
}
