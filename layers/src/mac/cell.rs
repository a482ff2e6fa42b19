//! Cell Parameter Registry
//!
//! Immutable per-carrier configuration shared read-only by every carrier task.

use super::ConfigError;
use common::types::{Bandwidth, CarrierIndex, CellId, SubcarrierSpacing};
use std::time::Duration;
use tracing::info;

/// Upper bound of HARQ processes per direction (TS 38.331 nrofHARQ-ProcessesForPDSCH)
pub const MAX_HARQ_PROCESSES: u8 = 16;

/// Largest FR1 resource grid
pub const MAX_PRBS: u16 = 275;

/// Default HARQ round trip, transmission to feedback, in slots
pub const DEFAULT_HARQ_RTT_SLOTS: u32 = 4;

/// Default control channel capacity per slot (one 48-REG CORESET, two of them)
pub const DEFAULT_NOF_CCES: u16 = 16;

/// Per-cell scheduling parameters.
///
/// Built once at startup and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct CellParams {
    /// Carrier index within this scheduler
    pub carrier: CarrierIndex,
    /// Cell identity
    pub cell_id: CellId,
    /// Numerology
    pub scs: SubcarrierSpacing,
    /// Channel bandwidth
    pub bandwidth: Bandwidth,
    /// Schedulable PRBs per slot and direction
    pub nof_prbs: u16,
    /// HARQ processes per UE and direction
    pub nof_harq_processes: u8,
    /// Slots between a transmission and its HARQ feedback
    pub harq_rtt_slots: u32,
    /// Control channel elements available per slot (shared by DL and UL DCIs)
    pub nof_cces: u16,
    /// Wall time a carrier task may spend on one slot
    pub deadline_budget: Duration,
}

impl CellParams {
    /// Create parameters with the full resource grid of the given bandwidth
    pub fn new(
        carrier: CarrierIndex,
        cell_id: CellId,
        scs: SubcarrierSpacing,
        bandwidth: Bandwidth,
    ) -> Result<Self, ConfigError> {
        let nof_prbs = bandwidth.max_prbs(scs).ok_or_else(|| ConfigError::InvalidCell {
            carrier,
            reason: format!("{} MHz undefined for {:?}", bandwidth.mhz(), scs),
        })?;

        Ok(Self {
            carrier,
            cell_id,
            scs,
            bandwidth,
            nof_prbs,
            nof_harq_processes: MAX_HARQ_PROCESSES,
            harq_rtt_slots: DEFAULT_HARQ_RTT_SLOTS,
            nof_cces: DEFAULT_NOF_CCES,
            deadline_budget: scs.slot_duration(),
        })
    }

    /// Override the number of HARQ processes
    pub fn with_harq_processes(mut self, nof: u8) -> Self {
        self.nof_harq_processes = nof;
        self
    }

    /// Override the HARQ round-trip time
    pub fn with_harq_rtt(mut self, slots: u32) -> Self {
        self.harq_rtt_slots = slots;
        self
    }

    /// Override the control channel capacity
    pub fn with_cces(mut self, nof: u16) -> Self {
        self.nof_cces = nof;
        self
    }

    /// Override the per-slot compute budget
    pub fn with_deadline_budget(mut self, budget: Duration) -> Self {
        self.deadline_budget = budget;
        self
    }

    /// Restrict the schedulable grid (e.g. to leave room for common channels)
    pub fn with_prbs(mut self, nof: u16) -> Self {
        self.nof_prbs = nof;
        self
    }

    /// Air-interface slot period of this cell
    pub fn slot_duration(&self) -> Duration {
        self.scs.slot_duration()
    }

    /// Check the parameters are internally consistent
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidCell {
            carrier: self.carrier,
            reason,
        };

        if self.nof_prbs == 0 || self.nof_prbs > MAX_PRBS {
            return Err(invalid(format!("nof_prbs {} outside 1..={}", self.nof_prbs, MAX_PRBS)));
        }
        if let Some(max) = self.bandwidth.max_prbs(self.scs) {
            if self.nof_prbs > max {
                return Err(invalid(format!(
                    "nof_prbs {} exceeds {} MHz grid of {} PRBs",
                    self.nof_prbs,
                    self.bandwidth.mhz(),
                    max
                )));
            }
        }
        if self.nof_harq_processes == 0 || self.nof_harq_processes > MAX_HARQ_PROCESSES {
            return Err(invalid(format!(
                "nof_harq_processes {} outside 1..={}",
                self.nof_harq_processes, MAX_HARQ_PROCESSES
            )));
        }
        if self.harq_rtt_slots == 0 {
            return Err(invalid("harq_rtt_slots must be at least 1".into()));
        }
        if self.nof_cces == 0 {
            return Err(invalid("nof_cces must be at least 1".into()));
        }
        if self.deadline_budget.is_zero() {
            return Err(invalid("deadline budget must be non-zero".into()));
        }
        Ok(())
    }
}

/// Registry of every configured cell, indexed by carrier.
#[derive(Debug, Clone)]
pub struct CellRegistry {
    cells: Vec<CellParams>,
}

impl CellRegistry {
    /// Validate and freeze the cell list.
    ///
    /// Carrier indices must be dense and listed in order (cc0, cc1, ...).
    pub fn new(cells: Vec<CellParams>) -> Result<Self, ConfigError> {
        if cells.is_empty() {
            return Err(ConfigError::NoCells);
        }
        for (position, cell) in cells.iter().enumerate() {
            if cell.carrier.index() != position {
                return Err(ConfigError::CarrierOutOfOrder {
                    expected: position,
                    found: cell.carrier,
                });
            }
            cell.validate()?;
            info!(
                "Cell {}: cell_id={}, scs={:?}, bw={} MHz, prbs={}, harq={}, rtt={} slots",
                cell.carrier,
                cell.cell_id.0,
                cell.scs,
                cell.bandwidth.mhz(),
                cell.nof_prbs,
                cell.nof_harq_processes,
                cell.harq_rtt_slots
            );
        }
        Ok(Self { cells })
    }

    /// Parameters of one carrier
    pub fn get(&self, carrier: CarrierIndex) -> Option<&CellParams> {
        self.cells.get(carrier.index())
    }

    /// Whether the carrier exists
    pub fn contains(&self, carrier: CarrierIndex) -> bool {
        carrier.index() < self.cells.len()
    }

    /// Number of configured carriers
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Always false; an empty registry cannot be built
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// All cells in carrier order
    pub fn iter(&self) -> impl Iterator<Item = &CellParams> {
        self.cells.iter()
    }

    /// Shortest slot period among all cells
    pub fn min_slot_duration(&self) -> Duration {
        self.cells
            .iter()
            .map(CellParams::slot_duration)
            .min()
            .unwrap_or(Duration::from_millis(1))
    }

    /// Tightest compute budget among all cells; bounds the per-slot barrier wait
    pub fn slot_deadline(&self) -> Duration {
        self.cells
            .iter()
            .map(|cell| cell.deadline_budget)
            .min()
            .unwrap_or(Duration::from_millis(1))
    }
}
