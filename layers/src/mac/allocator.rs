//! Slot Resource Allocator
//!
//! Planning is split from committing. [`SlotAllocator::plan`] reads the UE
//! snapshot and the carrier's HARQ tables and writes a [`SlotPlan`]; it never
//! mutates HARQ state, so an abandoned plan costs nothing. [`commit`] then
//! applies the plan to the HARQ tables and produces the grants.
//!
//! The default [`RoundRobinAllocator`] runs two passes per direction:
//! retransmissions first (same PRB count as the original transmission), then
//! new data in priority order with a slot-rotated round robin among equals.

use super::arena::CarrierWorkspace;
use super::carrier::UeCarrierState;
use super::cell::CellParams;
use super::coordinator::CancelToken;
use super::grant::{DciLocation, Grant, PrbInterval};
use super::harq::HarqError;
use super::ue::{UeCapabilities, UeSnapshot};
use common::types::{Direction, Rnti, SlotIndex};
use common::utils::div_ceil;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Bytes carried by one PRB for CQI 1..=15 (64QAM table)
const BYTES_PER_PRB: [u32; 15] = [2, 4, 6, 10, 15, 21, 26, 34, 43, 49, 59, 70, 81, 92, 99];

/// Bytes per PRB for CQI 12..=15 when the UE supports 256QAM
const BYTES_PER_PRB_256QAM: [u32; 4] = [99, 112, 124, 133];

/// Spectral efficiency estimate, `None` when the CQI allows no new data
pub fn bytes_per_prb(cqi: u8, qam256: bool) -> Option<u32> {
    match cqi {
        12..=15 if qam256 => Some(BYTES_PER_PRB_256QAM[(cqi - 12) as usize]),
        1..=15 => Some(BYTES_PER_PRB[(cqi - 1) as usize]),
        _ => None,
    }
}

/// PDCCH aggregation level for a CQI
pub fn aggregation_level(cqi: u8) -> u8 {
    match cqi {
        12..=u8::MAX => 1,
        8..=11 => 2,
        4..=7 => 4,
        _ => 8,
    }
}

/// What a planned grant carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantKind {
    NewData,
    /// Retransmission on an existing process
    Retx { pid: u8 },
}

/// A grant decided by the planner, not yet bound to a HARQ process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedGrant {
    pub rnti: Rnti,
    pub direction: Direction,
    pub kind: GrantKind,
    pub prbs: PrbInterval,
    pub dci: DciLocation,
    pub tbs: u32,
}

/// Why a UE got nothing in a direction this slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// PRB or CCE budget exhausted
    InsufficientResources,
    /// Every HARQ process is busy
    NoFreeProcess,
    /// Fault-flagged UE, or no HARQ tables on this carrier
    InvalidUeConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Skip {
    pub rnti: Rnti,
    pub direction: Direction,
    pub reason: SkipReason,
}

/// Output of one planning pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotPlan {
    pub dl: Vec<PlannedGrant>,
    pub ul: Vec<PlannedGrant>,
    pub skipped: Vec<Skip>,
}

impl SlotPlan {
    pub fn clear(&mut self) {
        self.dl.clear();
        self.ul.clear();
        self.skipped.clear();
    }

    pub fn grants(&self, direction: Direction) -> &[PlannedGrant] {
        match direction {
            Direction::Downlink => &self.dl,
            Direction::Uplink => &self.ul,
        }
    }

    pub fn push(&mut self, grant: PlannedGrant) {
        match grant.direction {
            Direction::Downlink => self.dl.push(grant),
            Direction::Uplink => self.ul.push(grant),
        }
    }

    pub fn skip(&mut self, rnti: Rnti, direction: Direction, reason: SkipReason) {
        self.skipped.push(Skip { rnti, direction, reason });
    }

    pub fn has_grant(&self, rnti: Rnti, direction: Direction) -> bool {
        self.grants(direction).iter().any(|g| g.rnti == rnti)
    }

    pub fn is_empty(&self) -> bool {
        self.dl.is_empty() && self.ul.is_empty()
    }
}

/// How a planning pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStatus {
    Complete,
    /// Stopped early on cancellation; the plan must not be committed
    Abandoned,
}

/// Read-only inputs of one carrier's allocation pass
pub struct AllocationContext<'a> {
    pub slot: SlotIndex,
    pub cell: &'a CellParams,
    pub ues: &'a UeSnapshot,
    /// HARQ tables and buffer status of the UEs served on this carrier
    pub state: &'a BTreeMap<Rnti, UeCarrierState>,
    pub cancel: &'a CancelToken<'a>,
}

/// Pluggable allocation strategy.
///
/// Implementations must be deterministic in their inputs and should poll
/// `ctx.cancel` regularly. A pass that ignores it still cannot delay the slot,
/// but its carrier publishes empty until the pass returns.
pub trait SlotAllocator: Send + Sync {
    fn plan(&self, ctx: &AllocationContext<'_>, workspace: &mut CarrierWorkspace) -> PlanStatus;
}

/// PRB cursors per direction and a CCE cursor shared by both
struct ResourceGrid {
    nof_prbs: u16,
    next_prb: [u16; 2],
    nof_cces: u16,
    next_cce: u16,
}

impl ResourceGrid {
    fn new(cell: &CellParams) -> Self {
        Self {
            nof_prbs: cell.nof_prbs,
            next_prb: [0; 2],
            nof_cces: cell.nof_cces,
            next_cce: 0,
        }
    }

    fn slot(direction: Direction) -> usize {
        match direction {
            Direction::Downlink => 0,
            Direction::Uplink => 1,
        }
    }

    fn remaining(&self, direction: Direction) -> u16 {
        self.nof_prbs - self.next_prb[Self::slot(direction)]
    }

    /// Contiguous PRBs plus a DCI candidate aligned to its aggregation level,
    /// both or neither
    fn reserve(
        &mut self,
        direction: Direction,
        len: u16,
        level: u8,
    ) -> Option<(PrbInterval, DciLocation)> {
        if len == 0 || len > self.remaining(direction) {
            return None;
        }
        let level16 = level as u16;
        let cce_start = div_ceil(self.next_cce as u32, level as u32) as u16 * level16;
        if cce_start + level16 > self.nof_cces {
            return None;
        }

        let prbs = PrbInterval::new(self.next_prb[Self::slot(direction)], len);
        self.next_prb[Self::slot(direction)] += len;
        self.next_cce = cce_start + level16;
        Some((
            prbs,
            DciLocation {
                aggregation_level: level,
                cce_start,
            },
        ))
    }
}

/// Priority-ordered round robin
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobinAllocator;

impl SlotAllocator for RoundRobinAllocator {
    fn plan(&self, ctx: &AllocationContext<'_>, ws: &mut CarrierWorkspace) -> PlanStatus {
        ws.plan.clear();
        ws.order.clear();

        let carrier = ctx.cell.carrier;
        for entry in ctx.ues.on_carrier(carrier) {
            let rnti = entry.config.rnti;
            if !entry.is_schedulable() || !ctx.state.contains_key(&rnti) {
                debug!("{}: UE {} excluded, invalid configuration", carrier, rnti);
                for direction in Direction::ALL {
                    ws.plan.skip(rnti, direction, SkipReason::InvalidUeConfig);
                }
                continue;
            }
            ws.order.push((entry.config.priority, rnti));
        }
        if !ws.order.is_empty() {
            let offset = ctx.slot.value() % ws.order.len() as u64;
            ws.order.rotate_left(offset as usize);
            // Stable, so the rotation survives among equal priorities
            ws.order.sort_by(|a, b| b.0.cmp(&a.0));
        }

        let mut grid = ResourceGrid::new(ctx.cell);

        for direction in Direction::ALL {
            for &(_, rnti) in &ws.order {
                if ctx.cancel.is_cancelled() {
                    return PlanStatus::Abandoned;
                }
                let Some(ue) = ctx.state.get(&rnti) else {
                    continue;
                };
                let Some(proc) = ue.harq(direction).pending_retx().next() else {
                    continue;
                };

                match grid.reserve(direction, proc.prbs().len, aggregation_level(ue.buffer.cqi)) {
                    Some((prbs, dci)) => ws.plan.push(PlannedGrant {
                        rnti,
                        direction,
                        kind: GrantKind::Retx { pid: proc.pid() },
                        prbs,
                        dci,
                        tbs: proc.tbs(),
                    }),
                    None => {
                        trace!(
                            "{}: no room to retransmit {} pid {} for {}",
                            carrier,
                            direction,
                            proc.pid(),
                            rnti
                        );
                        ws.plan.skip(rnti, direction, SkipReason::InsufficientResources);
                    }
                }
            }
        }

        for direction in Direction::ALL {
            for &(_, rnti) in &ws.order {
                if ctx.cancel.is_cancelled() {
                    return PlanStatus::Abandoned;
                }
                if ws.plan.has_grant(rnti, direction) {
                    continue;
                }
                let Some(ue) = ctx.state.get(&rnti) else {
                    continue;
                };
                let pending = ue.buffer.pending_bytes(direction);
                if pending == 0 {
                    continue;
                }
                let qam256 = ctx
                    .ues
                    .get(rnti)
                    .is_some_and(|e| e.config.capabilities.contains(UeCapabilities::QAM256));
                let Some(bpp) = bytes_per_prb(ue.buffer.cqi, qam256) else {
                    continue;
                };
                if !ue.harq(direction).has_free_process() {
                    ws.plan.skip(rnti, direction, SkipReason::NoFreeProcess);
                    continue;
                }

                let needed = div_ceil(pending, bpp).min(ctx.cell.nof_prbs as u32) as u16;
                let len = needed.min(grid.remaining(direction));
                match grid.reserve(direction, len, aggregation_level(ue.buffer.cqi)) {
                    Some((prbs, dci)) => ws.plan.push(PlannedGrant {
                        rnti,
                        direction,
                        kind: GrantKind::NewData,
                        prbs,
                        dci,
                        tbs: len as u32 * bpp,
                    }),
                    None => ws.plan.skip(rnti, direction, SkipReason::InsufficientResources),
                }
            }
        }

        PlanStatus::Complete
    }
}

/// Outcome counts of [`commit`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    /// Retransmissions refused because the bound was reached
    pub harq_losses: u32,
    /// Planned grants that no longer matched HARQ state
    pub dropped: u32,
}

/// Bind a plan to HARQ processes and emit the grants.
///
/// A planned grant the HARQ tables refuse is dropped; the rest still go out.
pub fn commit(
    slot: SlotIndex,
    plan: &SlotPlan,
    ues: &mut BTreeMap<Rnti, UeCarrierState>,
    dl: &mut Vec<Grant>,
    ul: &mut Vec<Grant>,
) -> CommitStats {
    let mut stats = CommitStats::default();

    for planned in plan.dl.iter().chain(plan.ul.iter()) {
        let Some(ue) = ues.get_mut(&planned.rnti) else {
            stats.dropped += 1;
            continue;
        };
        let harq = ue.harq_mut(planned.direction);
        let result = match planned.kind {
            GrantKind::Retx { pid } => harq
                .retransmit(pid, slot, planned.prbs, planned.dci)
                .map(|()| pid),
            GrantKind::NewData => harq.allocate_new(slot, planned.prbs, planned.dci, planned.tbs),
        };

        match result {
            Ok(pid) => {
                let ndi = harq.process(pid).is_some_and(|p| p.ndi());
                let is_retx = matches!(planned.kind, GrantKind::Retx { .. });
                if !is_retx {
                    ue.buffer.consume(planned.direction, planned.tbs);
                }
                trace!(
                    "Slot {}: {} {} pid={} prbs={}+{} cce={}@L{} tbs={} retx={}",
                    slot,
                    planned.direction,
                    planned.rnti,
                    pid,
                    planned.prbs.start,
                    planned.prbs.len,
                    planned.dci.cce_start,
                    planned.dci.aggregation_level,
                    planned.tbs,
                    is_retx
                );
                let grant = Grant {
                    rnti: planned.rnti,
                    pid,
                    prbs: planned.prbs,
                    dci: planned.dci,
                    tbs: planned.tbs,
                    ndi,
                    is_retx,
                };
                match planned.direction {
                    Direction::Downlink => dl.push(grant),
                    Direction::Uplink => ul.push(grant),
                }
            }
            Err(HarqError::MaxRetxExceeded { pid, max_harq_tx }) => {
                debug!(
                    "Slot {}: {} {} pid {} dropped after {} transmissions",
                    slot, planned.direction, planned.rnti, pid, max_harq_tx
                );
                stats.harq_losses += 1;
            }
            Err(e) => {
                debug!(
                    "Slot {}: {} grant for {} dropped: {}",
                    slot, planned.direction, planned.rnti, e
                );
                stats.dropped += 1;
            }
        }
    }

    stats
}
