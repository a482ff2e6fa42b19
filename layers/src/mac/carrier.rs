//! Per-carrier scheduling state
//!
//! Each carrier owns the HARQ entities and feedback queues of the UEs it
//! serves. During a slot the whole [`CarrierState`] is lent to exactly one
//! allocation task; between slots only the scheduler thread touches it.

use super::arena::CarrierWorkspace;
use super::cell::CellParams;
use super::feedback::PendingAck;
use super::harq::HarqEntity;
use common::types::{CarrierIndex, Direction, Rnti, SlotIndex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Buffer occupancy and channel quality reported for one UE on one carrier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BufferStatus {
    /// Bytes waiting for downlink transmission
    pub dl_pending_bytes: u32,
    /// Bytes the UE reported in its last BSR
    pub ul_pending_bytes: u32,
    /// Wideband CQI 0..=15; 0 means out of range and blocks new data
    pub cqi: u8,
}

impl BufferStatus {
    pub fn new(dl_pending_bytes: u32, ul_pending_bytes: u32, cqi: u8) -> Self {
        Self {
            dl_pending_bytes,
            ul_pending_bytes,
            cqi,
        }
    }

    pub fn pending_bytes(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Downlink => self.dl_pending_bytes,
            Direction::Uplink => self.ul_pending_bytes,
        }
    }

    /// Account bytes carried by a new grant
    pub fn consume(&mut self, direction: Direction, bytes: u32) {
        let pending = match direction {
            Direction::Downlink => &mut self.dl_pending_bytes,
            Direction::Uplink => &mut self.ul_pending_bytes,
        };
        *pending = pending.saturating_sub(bytes);
    }
}

/// HARQ tables and feedback queue of one UE on one carrier
#[derive(Debug, Clone)]
pub struct UeCarrierState {
    rnti: Rnti,
    carrier: CarrierIndex,
    dl: HarqEntity,
    ul: HarqEntity,
    pending_acks: Vec<PendingAck>,
    pub buffer: BufferStatus,
}

impl UeCarrierState {
    /// Fresh tables with every process idle
    pub fn new(rnti: Rnti, cell: &CellParams, max_harq_tx: u8) -> Self {
        Self {
            rnti,
            carrier: cell.carrier,
            dl: HarqEntity::new(
                Direction::Downlink,
                cell.nof_harq_processes,
                max_harq_tx,
                cell.harq_rtt_slots,
            ),
            ul: HarqEntity::new(
                Direction::Uplink,
                cell.nof_harq_processes,
                max_harq_tx,
                cell.harq_rtt_slots,
            ),
            pending_acks: Vec::new(),
            buffer: BufferStatus::default(),
        }
    }

    pub fn rnti(&self) -> Rnti {
        self.rnti
    }

    pub fn carrier(&self) -> CarrierIndex {
        self.carrier
    }

    pub fn harq(&self, direction: Direction) -> &HarqEntity {
        match direction {
            Direction::Downlink => &self.dl,
            Direction::Uplink => &self.ul,
        }
    }

    pub fn harq_mut(&mut self, direction: Direction) -> &mut HarqEntity {
        match direction {
            Direction::Downlink => &mut self.dl,
            Direction::Uplink => &mut self.ul,
        }
    }

    pub fn set_max_harq_tx(&mut self, max_harq_tx: u8) {
        self.dl.set_max_harq_tx(max_harq_tx);
        self.ul.set_max_harq_tx(max_harq_tx);
    }

    /// Queue feedback for the slot it concludes
    pub fn enqueue_ack(&mut self, ack: PendingAck) {
        self.pending_acks.push(ack);
    }

    pub fn pending_acks(&self) -> &[PendingAck] {
        &self.pending_acks
    }

    /// Move feedback observed at or before `now` into `due`, keeping arrival order
    pub fn take_due_acks(&mut self, now: SlotIndex, due: &mut Vec<PendingAck>) {
        let mut i = 0;
        while i < self.pending_acks.len() {
            if self.pending_acks[i].slot <= now {
                due.push(self.pending_acks.remove(i));
            } else {
                i += 1;
            }
        }
    }

    /// Release every process in both directions and drop queued feedback
    pub fn flush(&mut self) -> u32 {
        self.pending_acks.clear();
        self.dl.flush() + self.ul.flush()
    }

    /// Active processes over both directions
    pub fn nof_active(&self) -> usize {
        self.dl.nof_active() + self.ul.nof_active()
    }
}

/// Everything one carrier task needs for a slot
#[derive(Debug)]
pub struct CarrierState {
    params: CellParams,
    ues: BTreeMap<Rnti, UeCarrierState>,
    workspace: CarrierWorkspace,
}

impl CarrierState {
    pub fn new(params: CellParams) -> Self {
        Self {
            params,
            ues: BTreeMap::new(),
            workspace: CarrierWorkspace::default(),
        }
    }

    pub fn params(&self) -> &CellParams {
        &self.params
    }

    pub fn carrier(&self) -> CarrierIndex {
        self.params.carrier
    }

    pub fn ue(&self, rnti: Rnti) -> Option<&UeCarrierState> {
        self.ues.get(&rnti)
    }

    pub fn ue_mut(&mut self, rnti: Rnti) -> Option<&mut UeCarrierState> {
        self.ues.get_mut(&rnti)
    }

    pub fn ues(&self) -> &BTreeMap<Rnti, UeCarrierState> {
        &self.ues
    }

    pub fn ues_mut(&mut self) -> impl Iterator<Item = &mut UeCarrierState> {
        self.ues.values_mut()
    }

    /// Create tables for a UE newly served here; existing tables are kept
    pub fn attach(&mut self, rnti: Rnti, max_harq_tx: u8) -> &mut UeCarrierState {
        let params = &self.params;
        self.ues
            .entry(rnti)
            .or_insert_with(|| UeCarrierState::new(rnti, params, max_harq_tx))
    }

    /// Remove a UE's tables, returning how many processes were still active
    pub fn detach(&mut self, rnti: Rnti) -> Option<u32> {
        self.ues.remove(&rnti).map(|mut state| state.flush())
    }

    /// RNTIs with tables on this carrier
    pub fn rntis(&self) -> Vec<Rnti> {
        self.ues.keys().copied().collect()
    }

    /// Split borrow for an allocation task
    pub(crate) fn parts_mut(
        &mut self,
    ) -> (&CellParams, &mut BTreeMap<Rnti, UeCarrierState>, &mut CarrierWorkspace) {
        (&self.params, &mut self.ues, &mut self.workspace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::grant::{DciLocation, PrbInterval};
    use common::types::{Bandwidth, CellId, SubcarrierSpacing};

    fn cell() -> CellParams {
        CellParams::new(CarrierIndex(0), CellId(1), SubcarrierSpacing::Scs15, Bandwidth::Bw10)
            .unwrap()
            .with_harq_processes(8)
    }

    fn ack(pid: u8, slot: u64) -> PendingAck {
        PendingAck {
            rnti: Rnti(0x4601),
            carrier: CarrierIndex(0),
            direction: Direction::Downlink,
            pid,
            ack: true,
            slot: SlotIndex(slot),
        }
    }

    #[test]
    fn test_attach_creates_idle_tables() {
        let mut state = CarrierState::new(cell());
        let ue = state.attach(Rnti(0x4601), 4);
        assert_eq!(ue.harq(Direction::Downlink).processes().len(), 8);
        assert_eq!(ue.harq(Direction::Uplink).max_harq_tx(), 4);
        assert_eq!(ue.nof_active(), 0);
        assert_eq!(state.rntis(), vec![Rnti(0x4601)]);
    }

    #[test]
    fn test_detach_flushes() {
        let mut state = CarrierState::new(cell());
        let ue = state.attach(Rnti(0x4601), 4);
        ue.harq_mut(Direction::Downlink)
            .allocate_new(SlotIndex(0), PrbInterval::new(0, 2), DciLocation::default(), 20)
            .unwrap();
        ue.enqueue_ack(ack(0, 4));

        assert_eq!(state.detach(Rnti(0x4601)), Some(1));
        assert_eq!(state.detach(Rnti(0x4601)), None);
    }

    #[test]
    fn test_take_due_acks_keeps_future_feedback() {
        let mut ue = UeCarrierState::new(Rnti(0x4601), &cell(), 4);
        ue.enqueue_ack(ack(0, 5));
        ue.enqueue_ack(ack(1, 9));
        ue.enqueue_ack(ack(2, 3));

        let mut due = Vec::new();
        ue.take_due_acks(SlotIndex(5), &mut due);
        assert_eq!(due.iter().map(|a| a.pid).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(ue.pending_acks().len(), 1);
    }

    #[test]
    fn test_buffer_consume_saturates() {
        let mut buffer = BufferStatus::new(100, 10, 9);
        buffer.consume(Direction::Downlink, 60);
        buffer.consume(Direction::Uplink, 60);
        assert_eq!(buffer.pending_bytes(Direction::Downlink), 40);
        assert_eq!(buffer.pending_bytes(Direction::Uplink), 0);
    }
}
