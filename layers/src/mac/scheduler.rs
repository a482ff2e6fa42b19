//! MAC Scheduler Implementation
//!
//! Drives one slot at a time: UE snapshot, feedback, HARQ housekeeping,
//! parallel carrier allocation behind a deadline-bounded barrier, validation
//! and publication. A slot is either published with one result per configured
//! carrier or void; nothing partial leaves the scheduler.
//!
//! A carrier whose task is still out after its deadline has no state here
//! until the task returns. Meanwhile it publishes empty and late, and PHY
//! events addressed to it are parked.

use super::aggregator::{self, FeedbackSummary};
use super::allocator::{RoundRobinAllocator, SlotAllocator};
use super::arena::SlotArena;
use super::carrier::{BufferStatus, CarrierState, UeCarrierState};
use super::cell::CellRegistry;
use super::coordinator::{CarrierCoordinator, CarrierJob, CarrierReport, TaskReturn};
use super::feedback::{FeedbackGenerator, NoFeedback, PendingAck, UeSchedulingContext};
use super::grant::SlotResult;
use super::metrics::SchedulerMetrics;
use super::ue::{UeConfig, UeInsert, UeSnapshot, UeStatus, UeStore};
use super::SchedError;
use common::types::{CarrierIndex, Direction, Rnti, SlotIndex};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Construction parameters
#[derive(Debug, Clone)]
pub struct SchedulerArgs {
    /// Carrier worker threads, capped at the number of carriers
    pub nof_workers: usize,
    /// Barrier wait per slot; defaults to the tightest cell budget
    pub slot_deadline: Option<Duration>,
}

impl Default for SchedulerArgs {
    fn default() -> Self {
        Self {
            nof_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            slot_deadline: None,
        }
    }
}

/// Inputs the physical layer pushes between slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhyEvent {
    BufferStatus {
        rnti: Rnti,
        carrier: CarrierIndex,
        status: BufferStatus,
    },
    Feedback(PendingAck),
}

/// Cloneable sender for [`PhyEvent`]s, drained at the start of each slot
#[derive(Debug, Clone)]
pub struct PhyInbox(Sender<PhyEvent>);

impl PhyInbox {
    pub fn send(&self, event: PhyEvent) -> Result<(), SchedError> {
        self.0.send(event).map_err(|_| SchedError::ShutDown)
    }
}

/// Requests shutdown from any thread
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    /// In-flight carrier tasks abandon, the current slot is void, and
    /// every later `run_slot` fails with [`SchedError::ShutDown`]
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Every carrier's result for one slot, owned by the consumer
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedSlot {
    pub slot: SlotIndex,
    /// One entry per configured carrier, in carrier order
    pub results: Vec<SlotResult>,
}

impl PublishedSlot {
    pub fn result(&self, carrier: CarrierIndex) -> Option<&SlotResult> {
        self.results.get(carrier.index())
    }

    /// Grants over all carriers and directions
    pub fn nof_grants(&self) -> usize {
        self.results.iter().map(|r| r.dl.len() + r.ul.len()).sum()
    }
}

/// Why nothing was published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoidReason {
    Shutdown,
}

/// Result of [`MacScheduler::run_slot`]
#[derive(Debug, Clone, PartialEq)]
pub enum SlotOutcome {
    Published(PublishedSlot),
    Void { slot: SlotIndex, reason: VoidReason },
}

impl SlotOutcome {
    pub fn slot(&self) -> SlotIndex {
        match self {
            SlotOutcome::Published(published) => published.slot,
            SlotOutcome::Void { slot, .. } => *slot,
        }
    }

    pub fn published(&self) -> Option<&PublishedSlot> {
        match self {
            SlotOutcome::Published(published) => Some(published),
            SlotOutcome::Void { .. } => None,
        }
    }

    pub fn into_published(self) -> Option<PublishedSlot> {
        match self {
            SlotOutcome::Published(published) => Some(published),
            SlotOutcome::Void { .. } => None,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, SlotOutcome::Void { .. })
    }
}

/// Multi-carrier MAC scheduler
pub struct MacScheduler {
    cells: Arc<CellRegistry>,
    ue_db: Arc<UeStore>,
    /// UE view the carrier tables were last reconciled against
    snapshot: UeSnapshot,
    /// `None` while the carrier's task is still running past its deadline
    carriers: Vec<Option<CarrierState>>,
    /// Events for carriers that are out, replayed once they are back
    parked: Vec<PhyEvent>,
    coordinator: CarrierCoordinator,
    allocator: Arc<dyn SlotAllocator>,
    feedback: Box<dyn FeedbackGenerator>,
    metrics: Arc<SchedulerMetrics>,
    arena: SlotArena,
    shutdown: Arc<AtomicBool>,
    slot_deadline: Duration,
    last_slot: Option<SlotIndex>,
    inbox_tx: Sender<PhyEvent>,
    inbox_rx: Receiver<PhyEvent>,
}

impl MacScheduler {
    /// Create a scheduler over the given cells with the round-robin allocator
    /// and no feedback generator
    pub fn new(cells: CellRegistry, args: SchedulerArgs) -> Result<Self, SchedError> {
        let cells = Arc::new(cells);
        let metrics = Arc::new(SchedulerMetrics::new(cells.len()));
        let ue_db = Arc::new(UeStore::new(Arc::clone(&cells), Arc::clone(&metrics)));
        let coordinator = CarrierCoordinator::new(args.nof_workers.min(cells.len()))?;
        let slot_deadline = args.slot_deadline.unwrap_or_else(|| cells.slot_deadline());
        let carriers = cells.iter().cloned().map(|cell| Some(CarrierState::new(cell))).collect();
        let (inbox_tx, inbox_rx) = crossbeam_channel::unbounded();

        info!(
            "MAC scheduler ready: {} carriers, {} workers, slot deadline {:?}",
            cells.len(),
            coordinator.nof_workers(),
            slot_deadline
        );

        Ok(Self {
            snapshot: ue_db.snapshot(),
            arena: SlotArena::new(cells.len()),
            cells,
            ue_db,
            carriers,
            parked: Vec::new(),
            coordinator,
            allocator: Arc::new(RoundRobinAllocator),
            feedback: Box::new(NoFeedback),
            metrics,
            shutdown: Arc::new(AtomicBool::new(false)),
            slot_deadline,
            last_slot: None,
            inbox_tx,
            inbox_rx,
        })
    }

    /// Replace the allocation strategy
    pub fn with_allocator(mut self, allocator: Box<dyn SlotAllocator>) -> Self {
        self.allocator = Arc::from(allocator);
        self
    }

    /// Install a feedback source consulted at the start of each slot
    pub fn with_feedback_generator(mut self, feedback: Box<dyn FeedbackGenerator>) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn cells(&self) -> &CellRegistry {
        &self.cells
    }

    /// Shared handle to the UE store for control-plane threads
    pub fn ue_store(&self) -> Arc<UeStore> {
        Arc::clone(&self.ue_db)
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown))
    }

    pub fn phy_inbox(&self) -> PhyInbox {
        PhyInbox(self.inbox_tx.clone())
    }

    pub fn slot_deadline(&self) -> Duration {
        self.slot_deadline
    }

    /// Attach a UE (insert-or-find); its HARQ tables exist on return
    pub fn add_ue(&mut self, config: UeConfig) -> UeInsert {
        let insert = self.ue_db.add(config);
        self.sync_ues();
        insert
    }

    /// Replace a UE's configuration and resize its carrier tables accordingly
    pub fn reconfigure_ue(&mut self, config: UeConfig) -> Result<UeStatus, SchedError> {
        let status = self.ue_db.reconfigure(config)?;
        self.sync_ues();
        Ok(status)
    }

    /// Detach a UE, flushing its HARQ processes on every carrier
    pub fn remove_ue(&mut self, rnti: Rnti) -> Result<(), SchedError> {
        self.ue_db.remove(rnti).ok_or(SchedError::UnknownUe(rnti))?;
        self.sync_ues();
        Ok(())
    }

    /// Record a buffer-status / CQI report
    pub fn update_buffer_status(
        &mut self,
        rnti: Rnti,
        carrier: CarrierIndex,
        status: BufferStatus,
    ) -> Result<(), SchedError> {
        let entry = self
            .carriers
            .get_mut(carrier.index())
            .ok_or(SchedError::UnknownCarrier(carrier))?;
        let Some(state) = entry.as_mut() else {
            self.parked.push(PhyEvent::BufferStatus { rnti, carrier, status });
            return Ok(());
        };
        let ue = state.ue_mut(rnti).ok_or(SchedError::UnknownUe(rnti))?;
        ue.buffer = status;
        Ok(())
    }

    /// Queue an ACK/NACK; applied at the first slot not before `ack.slot`.
    ///
    /// Feedback for a UE without tables on the carrier, typically one that
    /// detached, is discarded and counted as stale.
    pub fn enqueue_feedback(&mut self, ack: PendingAck) -> Result<(), SchedError> {
        let Some(entry) = self.carriers.get_mut(ack.carrier.index()) else {
            self.metrics.record_stale_feedback();
            return Err(SchedError::UnknownCarrier(ack.carrier));
        };
        let Some(state) = entry.as_mut() else {
            self.parked.push(PhyEvent::Feedback(ack));
            return Ok(());
        };
        match state.ue_mut(ack.rnti) {
            Some(ue) => ue.enqueue_ack(ack),
            None => {
                debug!("{}: feedback for unknown UE {} discarded", ack.carrier, ack.rnti);
                self.metrics.record_stale_feedback();
            }
        }
        Ok(())
    }

    /// Per-carrier state, for inspection; `None` while the carrier is out
    pub fn carrier_state(&self, carrier: CarrierIndex) -> Option<&CarrierState> {
        self.carriers.get(carrier.index())?.as_ref()
    }

    /// A UE's configuration with its HARQ tables on every serving carrier
    pub fn ue_context(&self, rnti: Rnti) -> Option<UeSchedulingContext<'_>> {
        let entry = self.snapshot.get(rnti)?;
        Some(UeSchedulingContext {
            config: &entry.config,
            status: entry.status,
            carriers: self.carriers.iter().flatten().filter_map(|c| c.ue(rnti)).collect(),
        })
    }

    /// Take back carriers whose tasks finished after their deadline.
    ///
    /// Called at the start of every slot; returns how many came back.
    pub fn reclaim_carriers(&mut self) -> usize {
        let returned = self.coordinator.reclaim();
        let count = returned.len();
        for task in returned {
            debug!("Slot {} task of {} returned late", task.slot, task.carrier());
            self.release(task.report);
            self.restore(task.state);
        }
        count
    }

    /// Hand a consumed slot's buffers back for reuse
    pub fn recycle(&mut self, published: PublishedSlot) {
        self.arena.recycle(published);
    }

    /// Schedule one slot.
    ///
    /// Slots must strictly increase. Fails on a non-advancing slot or once shut
    /// down; every other problem degrades to missing grants plus a counter.
    pub fn run_slot(&mut self, slot: SlotIndex) -> Result<SlotOutcome, SchedError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(SchedError::ShutDown);
        }
        if let Some(last) = self.last_slot {
            if slot <= last {
                return Err(SchedError::SlotNotAdvancing { slot, last });
            }
        }
        self.last_slot = Some(slot);

        self.reclaim_carriers();
        self.sync_ues();
        self.replay_parked();
        self.drain_inbox();
        self.generate_feedback(slot);
        let summary =
            aggregator::apply_feedback(self.carriers.iter_mut().flatten(), slot, &self.metrics);
        let expired =
            aggregator::housekeeping(self.carriers.iter_mut().flatten(), slot, &self.metrics);
        if summary != FeedbackSummary::default() || expired > 0 {
            debug!(
                "Slot {}: feedback ack={} nack={} lost={} stale={}, expired={}",
                slot, summary.acked, summary.retx_pending, summary.lost, summary.stale, expired
            );
        }

        let mut jobs = Vec::with_capacity(self.carriers.len());
        for entry in &mut self.carriers {
            if let Some(state) = entry.take() {
                jobs.push(CarrierJob {
                    state,
                    dl: self.arena.take(),
                    ul: self.arena.take(),
                });
            }
        }
        let deadline = Instant::now() + self.slot_deadline;
        let returned = self.coordinator.run(
            slot,
            deadline,
            jobs,
            &self.allocator,
            &self.snapshot,
            &self.shutdown,
        );

        let mut results: Vec<SlotResult> = self
            .cells
            .iter()
            .map(|cell| SlotResult::empty(slot, cell.carrier))
            .collect();
        let mut cancelled = false;

        for task in returned {
            let TaskReturn {
                slot: dispatched,
                state,
                report,
            } = task;
            let carrier = state.carrier();
            self.restore(state);

            let current = dispatched == slot;
            let Some(result) = results.get_mut(carrier.index()).filter(|_| current) else {
                self.release(report);
                continue;
            };
            match report {
                CarrierReport::Completed(output) => {
                    result.dl = output.dl;
                    result.ul = output.ul;
                    result.compute_latency = output.latency;
                    self.metrics.add_harq_losses(output.stats.harq_losses as u64);
                }
                CarrierReport::Late { dl, ul, latency } => {
                    self.arena.give_back(dl);
                    self.arena.give_back(ul);
                    result.late = true;
                    result.compute_latency = latency;
                }
                CarrierReport::Cancelled { dl, ul } => {
                    self.arena.give_back(dl);
                    self.arena.give_back(ul);
                    cancelled = true;
                }
            }
        }

        if cancelled || self.shutdown.load(Ordering::Acquire) {
            for result in results {
                self.arena.give_back(result.dl);
                self.arena.give_back(result.ul);
            }
            self.metrics.record_void_slot();
            info!("Slot {} void: shutdown during allocation", slot);
            return Ok(SlotOutcome::Void {
                slot,
                reason: VoidReason::Shutdown,
            });
        }

        for result in results.iter_mut() {
            let Some(m) = self.metrics.carrier(result.carrier) else {
                continue;
            };
            let state = match self.carriers.get(result.carrier.index()).and_then(Option::as_ref) {
                Some(state) if !result.late => state,
                _ => {
                    warn!(
                        "Slot {}: {} missed the deadline, publishing no grants",
                        slot, result.carrier
                    );
                    result.late = true;
                    m.record_late();
                    continue;
                }
            };
            if let Err(e) = aggregator::validate(result, state) {
                error!(
                    "Slot {}: {} failed validation, publishing empty: {}",
                    slot, result.carrier, e
                );
                self.arena.give_back(std::mem::take(&mut result.dl));
                self.arena.give_back(std::mem::take(&mut result.ul));
                m.record_validation_failure();
            }
            for direction in Direction::ALL {
                for grant in result.grants(direction) {
                    m.record_grant(direction, grant.is_retx, grant.tbs);
                }
            }
            m.record_latency(result.compute_latency);
        }
        self.metrics.record_published_slot();

        let published = PublishedSlot { slot, results };
        if let Some(primary) = self.cells.get(CarrierIndex(0)) {
            let (sfn, slot_in_frame) = slot.frame_and_slot(primary.scs);
            debug!(
                "Slot {} (sfn {}.{}) published {} grants",
                slot,
                sfn,
                slot_in_frame,
                published.nof_grants()
            );
        }
        Ok(SlotOutcome::Published(published))
    }

    /// Put a returned carrier back and bring it up to date with the UE view
    fn restore(&mut self, mut state: CarrierState) {
        reconcile(&mut state, &self.snapshot, &self.metrics);
        if let Some(entry) = self.carriers.get_mut(state.carrier().index()) {
            *entry = Some(state);
        }
    }

    /// Return the grant lists of a report nobody publishes
    fn release(&mut self, report: CarrierReport) {
        let (dl, ul) = match report {
            CarrierReport::Completed(output) => (output.dl, output.ul),
            CarrierReport::Late { dl, ul, .. } | CarrierReport::Cancelled { dl, ul } => (dl, ul),
        };
        self.arena.give_back(dl);
        self.arena.give_back(ul);
    }

    /// Bring the carrier tables in line with the UE store
    fn sync_ues(&mut self) {
        let snapshot = self.ue_db.snapshot();
        if snapshot.generation() == self.snapshot.generation() {
            return;
        }
        for state in self.carriers.iter_mut().flatten() {
            reconcile(state, &snapshot, &self.metrics);
        }
        self.snapshot = snapshot;
    }

    fn replay_parked(&mut self) {
        if self.parked.is_empty() {
            return;
        }
        let parked = std::mem::take(&mut self.parked);
        for event in parked {
            self.apply_event(event);
        }
    }

    fn apply_event(&mut self, event: PhyEvent) {
        let applied = match event {
            PhyEvent::BufferStatus { rnti, carrier, status } => {
                self.update_buffer_status(rnti, carrier, status)
            }
            PhyEvent::Feedback(ack) => self.enqueue_feedback(ack),
        };
        if let Err(e) = applied {
            debug!("PHY event dropped: {}", e);
        }
    }

    fn drain_inbox(&mut self) {
        let events: Vec<PhyEvent> = self.inbox_rx.try_iter().collect();
        for event in events {
            self.apply_event(event);
        }
    }

    fn generate_feedback(&mut self, slot: SlotIndex) {
        let mut events = Vec::new();
        for (rnti, entry) in self.snapshot.iter() {
            let carriers: Vec<&UeCarrierState> =
                self.carriers.iter().flatten().filter_map(|c| c.ue(*rnti)).collect();
            if carriers.is_empty() {
                continue;
            }
            let ctx = UeSchedulingContext {
                config: &entry.config,
                status: entry.status,
                carriers,
            };
            events.extend(self.feedback.generate_feedback(slot, &ctx));
        }
        for ack in events {
            if let Err(e) = self.enqueue_feedback(ack) {
                debug!("Generated feedback dropped: {}", e);
            }
        }
    }
}

/// Detach UEs no longer served on the carrier and attach new ones
fn reconcile(state: &mut CarrierState, snapshot: &UeSnapshot, metrics: &SchedulerMetrics) {
    let carrier = state.carrier();
    for rnti in state.rntis() {
        let keep = snapshot
            .get(rnti)
            .is_some_and(|e| e.is_schedulable() && e.config.is_configured_on(carrier));
        if keep {
            continue;
        }
        if let Some(flushed) = state.detach(rnti) {
            debug!("{}: UE {} removed, {} processes flushed", carrier, rnti, flushed);
            metrics.add_flushed(flushed as u64);
        }
    }
    for entry in snapshot.on_carrier(carrier).filter(|e| e.is_schedulable()) {
        let max_harq_tx = entry.config.max_harq_tx;
        state.attach(entry.config.rnti, max_harq_tx).set_max_harq_tx(max_harq_tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::cell::CellParams;
    use common::types::{Bandwidth, CellId, SubcarrierSpacing};

    fn scheduler(nof_cells: u8) -> MacScheduler {
        let cells = (0..nof_cells)
            .map(|cc| {
                CellParams::new(
                    CarrierIndex(cc),
                    CellId(cc as u16 + 1),
                    SubcarrierSpacing::Scs15,
                    Bandwidth::Bw10,
                )
                .unwrap()
            })
            .collect();
        let args = SchedulerArgs {
            nof_workers: nof_cells as usize,
            slot_deadline: Some(Duration::from_millis(200)),
        };
        MacScheduler::new(CellRegistry::new(cells).unwrap(), args).unwrap()
    }

    #[test]
    fn test_empty_slot_publishes_every_carrier() {
        let mut sched = scheduler(2);
        let published = sched.run_slot(SlotIndex(0)).unwrap().into_published().unwrap();
        assert_eq!(published.results.len(), 2);
        assert!(published.results.iter().all(|r| r.is_empty() && !r.late));
        assert_eq!(sched.metrics().snapshot().published_slots, 1);
    }

    #[test]
    fn test_slots_must_advance() {
        let mut sched = scheduler(1);
        sched.run_slot(SlotIndex(5)).unwrap();
        assert_eq!(
            sched.run_slot(SlotIndex(5)),
            Err(SchedError::SlotNotAdvancing {
                slot: SlotIndex(5),
                last: SlotIndex(5)
            })
        );
        assert!(sched.run_slot(SlotIndex(9)).is_ok());
    }

    #[test]
    fn test_shutdown_rejects_slots() {
        let mut sched = scheduler(1);
        let handle = sched.shutdown_handle();
        handle.shutdown();
        assert!(handle.is_shutdown());
        assert_eq!(sched.run_slot(SlotIndex(0)), Err(SchedError::ShutDown));
    }

    #[test]
    fn test_phy_inbox_feeds_buffer_status() {
        let mut sched = scheduler(1);
        sched.add_ue(UeConfig::new(Rnti(0x4601), vec![CarrierIndex(0)]));
        sched
            .phy_inbox()
            .send(PhyEvent::BufferStatus {
                rnti: Rnti(0x4601),
                carrier: CarrierIndex(0),
                status: BufferStatus::new(500, 0, 12),
            })
            .unwrap();

        let published = sched.run_slot(SlotIndex(0)).unwrap().into_published().unwrap();
        assert_eq!(published.results[0].dl.len(), 1);
    }

    #[test]
    fn test_unknown_targets_rejected() {
        let mut sched = scheduler(1);
        assert_eq!(
            sched.update_buffer_status(Rnti(1), CarrierIndex(3), BufferStatus::default()),
            Err(SchedError::UnknownCarrier(CarrierIndex(3)))
        );
        assert_eq!(sched.remove_ue(Rnti(1)), Err(SchedError::UnknownUe(Rnti(1))));

        let ack = PendingAck {
            rnti: Rnti(1),
            carrier: CarrierIndex(0),
            direction: Direction::Uplink,
            pid: 0,
            ack: true,
            slot: SlotIndex(0),
        };
        // Feedback for a UE without tables is late, not an error
        assert_eq!(sched.enqueue_feedback(ack), Ok(()));
        assert_eq!(sched.metrics().snapshot().stale_feedback, 1);

        let misrouted = PendingAck {
            carrier: CarrierIndex(7),
            ..ack
        };
        assert_eq!(
            sched.enqueue_feedback(misrouted),
            Err(SchedError::UnknownCarrier(CarrierIndex(7)))
        );
        assert_eq!(sched.metrics().snapshot().stale_feedback, 2);
    }

    #[test]
    fn test_recycled_buffers_are_reused() {
        let mut sched = scheduler(1);
        sched.add_ue(UeConfig::new(Rnti(0x4601), vec![CarrierIndex(0)]));
        sched
            .update_buffer_status(Rnti(0x4601), CarrierIndex(0), BufferStatus::new(100, 100, 15))
            .unwrap();
        let published = sched.run_slot(SlotIndex(0)).unwrap().into_published().unwrap();
        sched.recycle(published);
        assert_eq!(sched.arena.cached(), 2);

        sched.run_slot(SlotIndex(1)).unwrap();
        assert_eq!(sched.arena.cached(), 0);
    }
}
