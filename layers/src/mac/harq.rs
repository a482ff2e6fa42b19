//! HARQ Process Manager
//!
//! Stop-and-wait HARQ entities, one per (UE, carrier, direction). Each entity
//! owns a fixed array of processes indexed by process id. All transitions go
//! through [`HarqEntity`] so the retransmission bound holds by construction:
//! an active process always satisfies `nof_retxs + 1 <= max_harq_tx`, and a
//! transmission that would go past the bound deactivates the process instead.

use super::grant::{DciLocation, PrbInterval};
use common::types::{Direction, SlotIndex};
use thiserror::Error;

/// HARQ operation failures. None of them is fatal to the scheduler.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarqError {
    #[error("No free HARQ process")]
    NoFreeProcess,

    #[error("HARQ process {0} does not exist")]
    InvalidPid(u8),

    #[error("HARQ process {0} is not waiting for a retransmission")]
    NotPendingRetx(u8),

    #[error("HARQ process {pid} exhausted {max_harq_tx} transmissions")]
    MaxRetxExceeded { pid: u8, max_harq_tx: u8 },
}

/// Lifecycle of a single process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarqState {
    /// Free for new data
    Idle,
    /// Transmitted, feedback outstanding
    WaitingAck,
    /// NACKed, to be retransmitted on the next allocation pass
    PendingRetx,
}

/// Why feedback was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// Process id outside the entity
    InvalidPid,
    /// Process already concluded (duplicate or late feedback)
    Inactive,
    /// Process is already flagged for retransmission
    NotAwaitingAck,
    /// Observed before the current transmission's round trip could conclude,
    /// so it belongs to an earlier use of the process
    BeforeRoundTrip,
}

/// Effect of one ACK/NACK on an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Delivered; the process is free again
    Acked,
    /// NACK with retransmissions left; flagged for the next allocation pass
    RetxPending,
    /// NACK on the last allowed transmission; process freed, data lost
    MaxRetxExceeded,
    /// Discarded without touching state
    Stale(StaleReason),
}

/// One HARQ process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarqProcess {
    pid: u8,
    state: HarqState,
    ndi: bool,
    nof_txs: u32,
    nof_retxs: u32,
    prbs: PrbInterval,
    dci: DciLocation,
    tbs: u32,
    first_slot_tx: Option<SlotIndex>,
    last_slot_tx: Option<SlotIndex>,
    last_slot_ack: Option<SlotIndex>,
}

impl HarqProcess {
    fn new(pid: u8) -> Self {
        Self {
            pid,
            state: HarqState::Idle,
            ndi: false,
            nof_txs: 0,
            nof_retxs: 0,
            prbs: PrbInterval::default(),
            dci: DciLocation::default(),
            tbs: 0,
            first_slot_tx: None,
            last_slot_tx: None,
            last_slot_ack: None,
        }
    }

    pub fn pid(&self) -> u8 {
        self.pid
    }

    pub fn state(&self) -> HarqState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != HarqState::Idle
    }

    pub fn is_pending_retx(&self) -> bool {
        self.state == HarqState::PendingRetx
    }

    pub fn ndi(&self) -> bool {
        self.ndi
    }

    /// Transmissions of the current block, initial one included
    pub fn nof_txs(&self) -> u32 {
        self.nof_txs
    }

    /// Retransmissions of the current block
    pub fn nof_retxs(&self) -> u32 {
        self.nof_retxs
    }

    pub fn prbs(&self) -> PrbInterval {
        self.prbs
    }

    pub fn dci(&self) -> DciLocation {
        self.dci
    }

    /// Transport block size in bytes
    pub fn tbs(&self) -> u32 {
        self.tbs
    }

    pub fn first_slot_tx(&self) -> Option<SlotIndex> {
        self.first_slot_tx
    }

    pub fn last_slot_tx(&self) -> Option<SlotIndex> {
        self.last_slot_tx
    }

    pub fn last_slot_ack(&self) -> Option<SlotIndex> {
        self.last_slot_ack
    }

    // Slot stamps and NDI survive so the next use can toggle NDI and late
    // feedback can still be told apart.
    fn release(&mut self) {
        self.state = HarqState::Idle;
        self.nof_txs = 0;
        self.nof_retxs = 0;
        self.prbs = PrbInterval::default();
        self.dci = DciLocation::default();
        self.tbs = 0;
    }
}

/// HARQ processes of one UE on one carrier in one direction
#[derive(Debug, Clone)]
pub struct HarqEntity {
    direction: Direction,
    max_harq_tx: u8,
    rtt_slots: u32,
    procs: Vec<HarqProcess>,
}

impl HarqEntity {
    /// Create an entity with every process idle
    pub fn new(direction: Direction, nof_processes: u8, max_harq_tx: u8, rtt_slots: u32) -> Self {
        Self {
            direction,
            max_harq_tx,
            rtt_slots,
            procs: (0..nof_processes).map(HarqProcess::new).collect(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Maximum transmissions of one block
    pub fn max_harq_tx(&self) -> u8 {
        self.max_harq_tx
    }

    pub fn rtt_slots(&self) -> u32 {
        self.rtt_slots
    }

    /// Applies from the next transition on; in-flight blocks keep their counts
    pub fn set_max_harq_tx(&mut self, max_harq_tx: u8) {
        self.max_harq_tx = max_harq_tx;
    }

    pub fn processes(&self) -> &[HarqProcess] {
        &self.procs
    }

    pub fn process(&self, pid: u8) -> Option<&HarqProcess> {
        self.procs.get(pid as usize)
    }

    pub fn nof_active(&self) -> usize {
        self.procs.iter().filter(|p| p.is_active()).count()
    }

    pub fn has_free_process(&self) -> bool {
        self.procs.iter().any(|p| !p.is_active())
    }

    /// Processes flagged for retransmission, lowest pid first
    pub fn pending_retx(&self) -> impl Iterator<Item = &HarqProcess> {
        self.procs.iter().filter(|p| p.is_pending_retx())
    }

    /// Start a new transport block on the lowest free process
    pub fn allocate_new(
        &mut self,
        slot: SlotIndex,
        prbs: PrbInterval,
        dci: DciLocation,
        tbs: u32,
    ) -> Result<u8, HarqError> {
        let proc = self
            .procs
            .iter_mut()
            .find(|p| !p.is_active())
            .ok_or(HarqError::NoFreeProcess)?;

        proc.state = HarqState::WaitingAck;
        proc.ndi = !proc.ndi;
        proc.nof_txs = 1;
        proc.nof_retxs = 0;
        proc.prbs = prbs;
        proc.dci = dci;
        proc.tbs = tbs;
        proc.first_slot_tx = Some(slot);
        proc.last_slot_tx = Some(slot);
        proc.last_slot_ack = None;
        Ok(proc.pid)
    }

    /// Retransmit a NACKed block.
    ///
    /// When one more transmission would reach the bound the process is freed
    /// and `MaxRetxExceeded` returned; the caller accounts the lost block.
    pub fn retransmit(
        &mut self,
        pid: u8,
        slot: SlotIndex,
        prbs: PrbInterval,
        dci: DciLocation,
    ) -> Result<(), HarqError> {
        let max_harq_tx = self.max_harq_tx;
        let proc = self.procs.get_mut(pid as usize).ok_or(HarqError::InvalidPid(pid))?;

        if proc.state != HarqState::PendingRetx {
            return Err(HarqError::NotPendingRetx(pid));
        }
        if proc.nof_retxs + 1 >= max_harq_tx as u32 {
            proc.release();
            return Err(HarqError::MaxRetxExceeded { pid, max_harq_tx });
        }

        proc.state = HarqState::WaitingAck;
        proc.nof_retxs += 1;
        proc.nof_txs += 1;
        proc.prbs = prbs;
        proc.dci = dci;
        proc.last_slot_tx = Some(slot);
        Ok(())
    }

    /// Apply one ACK/NACK observed at `slot_observed`.
    ///
    /// Stale feedback leaves every process untouched.
    pub fn apply_ack(&mut self, pid: u8, ack: bool, slot_observed: SlotIndex) -> AckOutcome {
        let rtt = self.rtt_slots as u64;
        let max_harq_tx = self.max_harq_tx as u32;
        let Some(proc) = self.procs.get_mut(pid as usize) else {
            return AckOutcome::Stale(StaleReason::InvalidPid);
        };

        match proc.state {
            HarqState::Idle => return AckOutcome::Stale(StaleReason::Inactive),
            HarqState::PendingRetx => return AckOutcome::Stale(StaleReason::NotAwaitingAck),
            HarqState::WaitingAck => {}
        }
        if let Some(last_tx) = proc.last_slot_tx {
            if slot_observed < last_tx + rtt {
                return AckOutcome::Stale(StaleReason::BeforeRoundTrip);
            }
        }

        proc.last_slot_ack = Some(slot_observed);
        if ack {
            proc.release();
            AckOutcome::Acked
        } else if proc.nof_retxs + 1 < max_harq_tx {
            proc.state = HarqState::PendingRetx;
            AckOutcome::RetxPending
        } else {
            proc.release();
            AckOutcome::MaxRetxExceeded
        }
    }

    /// Free every process older than `rtt * max_harq_tx` slots.
    ///
    /// Returns how many blocks were given up.
    pub fn expire_stale(&mut self, now: SlotIndex) -> u32 {
        let budget = self.rtt_slots as u64 * self.max_harq_tx as u64;
        let mut expired = 0;
        for proc in self.procs.iter_mut().filter(|p| p.is_active()) {
            let age = proc.first_slot_tx.and_then(|first| now.since(first));
            if age.is_some_and(|age| age > budget) {
                proc.release();
                expired += 1;
            }
        }
        expired
    }

    /// Free every active process, returning how many were active
    pub fn flush(&mut self) -> u32 {
        let mut flushed = 0;
        for proc in self.procs.iter_mut().filter(|p| p.is_active()) {
            proc.release();
            flushed += 1;
        }
        flushed
    }
}
