//! Scheduling decisions handed to the physical layer

use common::types::{CarrierIndex, Direction, Rnti, SlotIndex};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Contiguous PRB range `[start, start + len)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PrbInterval {
    /// First PRB
    pub start: u16,
    /// Number of PRBs
    pub len: u16,
}

impl PrbInterval {
    pub fn new(start: u16, len: u16) -> Self {
        Self { start, len }
    }

    /// One past the last PRB
    pub fn end(&self) -> u16 {
        self.start + self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the two ranges share at least one PRB
    pub fn overlaps(&self, other: &PrbInterval) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.start < other.end()
            && other.start < self.end()
    }
}

/// PDCCH candidate carrying the DCI of a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DciLocation {
    /// Aggregation level (1, 2, 4, 8 or 16 CCEs)
    pub aggregation_level: u8,
    /// First CCE of the candidate
    pub cce_start: u16,
}

/// One UE's allocation on one carrier and direction for one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub rnti: Rnti,
    /// HARQ process carrying the transport block
    pub pid: u8,
    pub prbs: PrbInterval,
    pub dci: DciLocation,
    /// Estimated transport block size in bytes
    pub tbs: u32,
    /// New-data indicator as signalled in the DCI
    pub ndi: bool,
    /// Retransmission of a block already sent on this process
    pub is_retx: bool,
}

/// Grants of one carrier for one slot.
///
/// Once published the result belongs to the physical layer; the scheduler
/// keeps no reference to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotResult {
    pub slot: SlotIndex,
    pub carrier: CarrierIndex,
    pub dl: Vec<Grant>,
    pub ul: Vec<Grant>,
    /// Wall time the carrier task spent planning and committing
    pub compute_latency: Duration,
    /// The carrier missed the slot deadline and contributes no grants
    pub late: bool,
}

impl SlotResult {
    /// Result with no grants
    pub fn empty(slot: SlotIndex, carrier: CarrierIndex) -> Self {
        Self {
            slot,
            carrier,
            dl: Vec::new(),
            ul: Vec::new(),
            compute_latency: Duration::ZERO,
            late: false,
        }
    }

    /// Grant list of one direction
    pub fn grants(&self, direction: Direction) -> &[Grant] {
        match direction {
            Direction::Downlink => &self.dl,
            Direction::Uplink => &self.ul,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dl.is_empty() && self.ul.is_empty()
    }
}
