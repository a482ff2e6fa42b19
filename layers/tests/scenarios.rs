//! End-to-end slot scheduling scenarios

use common::types::{Bandwidth, CarrierIndex, CellId, Direction, Rnti, SlotIndex, SubcarrierSpacing};
use layers::mac::allocator::{
    AllocationContext, GrantKind, PlanStatus, PlannedGrant, RoundRobinAllocator, SlotAllocator,
};
use layers::mac::arena::CarrierWorkspace;
use layers::mac::{
    BlerFeedback, BufferStatus, CellParams, CellRegistry, DciLocation, Grant, MacScheduler,
    PendingAck, PrbInterval, PublishedSlot, SchedulerArgs, SlotOutcome, UeConfig, UeStatus,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const UE: Rnti = Rnti(0x4601);
const RTT: u64 = 4;

fn cells(nof_cells: u8, nof_harq: u8) -> CellRegistry {
    let cells = (0..nof_cells)
        .map(|cc| {
            CellParams::new(
                CarrierIndex(cc),
                CellId(100 + cc as u16),
                SubcarrierSpacing::Scs15,
                Bandwidth::Bw20,
            )
            .unwrap()
            .with_harq_processes(nof_harq)
            .with_harq_rtt(RTT as u32)
        })
        .collect();
    CellRegistry::new(cells).unwrap()
}

fn scheduler(nof_cells: u8, deadline: Duration) -> MacScheduler {
    let args = SchedulerArgs {
        nof_workers: nof_cells as usize,
        slot_deadline: Some(deadline),
    };
    MacScheduler::new(cells(nof_cells, 8), args).unwrap()
}

fn all_carriers(n: u8) -> Vec<CarrierIndex> {
    (0..n).map(CarrierIndex).collect()
}

fn dl_feedback(carrier: u8, pid: u8, ack: bool, slot: u64) -> PendingAck {
    PendingAck {
        rnti: UE,
        carrier: CarrierIndex(carrier),
        direction: Direction::Downlink,
        pid,
        ack,
        slot: SlotIndex(slot),
    }
}

fn publish(sched: &mut MacScheduler, slot: u64) -> PublishedSlot {
    match sched.run_slot(SlotIndex(slot)).unwrap() {
        SlotOutcome::Published(published) => published,
        SlotOutcome::Void { slot, reason } => panic!("slot {} void: {:?}", slot, reason),
    }
}

fn dl_grants(published: &PublishedSlot, carrier: u8) -> &[Grant] {
    &published.result(CarrierIndex(carrier)).unwrap().dl
}

/// Poll until a carrier abandoned at its deadline is handed back
fn wait_for_carrier(sched: &mut MacScheduler, carrier: CarrierIndex) {
    let give_up = Instant::now() + Duration::from_secs(5);
    while sched.carrier_state(carrier).is_none() {
        assert!(Instant::now() < give_up, "{} never came back", carrier);
        sched.reclaim_carriers();
        thread::sleep(Duration::from_millis(5));
    }
}

/// Holds planning on one carrier until cancelled
struct StallOn {
    carrier: CarrierIndex,
}

impl SlotAllocator for StallOn {
    fn plan(&self, ctx: &AllocationContext<'_>, workspace: &mut CarrierWorkspace) -> PlanStatus {
        if ctx.cell.carrier != self.carrier {
            return RoundRobinAllocator.plan(ctx, workspace);
        }
        let give_up = Instant::now() + Duration::from_secs(5);
        while !ctx.cancel.is_cancelled() && Instant::now() < give_up {
            thread::sleep(Duration::from_millis(1));
        }
        PlanStatus::Abandoned
    }
}

/// Blocks once on one carrier without ever looking at the cancel token
struct SleepOnce {
    carrier: CarrierIndex,
    stall: Duration,
    fired: AtomicBool,
}

impl SlotAllocator for SleepOnce {
    fn plan(&self, ctx: &AllocationContext<'_>, workspace: &mut CarrierWorkspace) -> PlanStatus {
        if ctx.cell.carrier == self.carrier && !self.fired.swap(true, Ordering::SeqCst) {
            thread::sleep(self.stall);
        }
        RoundRobinAllocator.plan(ctx, workspace)
    }
}

/// Panics on one carrier
struct PanicOn {
    carrier: CarrierIndex,
}

impl SlotAllocator for PanicOn {
    fn plan(&self, ctx: &AllocationContext<'_>, workspace: &mut CarrierWorkspace) -> PlanStatus {
        if ctx.cell.carrier == self.carrier {
            panic!("allocation bug on {}", self.carrier);
        }
        RoundRobinAllocator.plan(ctx, workspace)
    }
}

/// Gives the first two UEs of one carrier the same PRBs
struct OverlapOn {
    carrier: CarrierIndex,
}

impl SlotAllocator for OverlapOn {
    fn plan(&self, ctx: &AllocationContext<'_>, workspace: &mut CarrierWorkspace) -> PlanStatus {
        if ctx.cell.carrier != self.carrier {
            return RoundRobinAllocator.plan(ctx, workspace);
        }
        workspace.plan.clear();
        for (i, &rnti) in ctx.state.keys().take(2).enumerate() {
            workspace.plan.push(PlannedGrant {
                rnti,
                direction: Direction::Downlink,
                kind: GrantKind::NewData,
                prbs: PrbInterval::new(0, 4),
                dci: DciLocation {
                    aggregation_level: 1,
                    cce_start: i as u16,
                },
                tbs: 100,
            });
        }
        PlanStatus::Complete
    }
}

#[test]
fn single_ue_single_carrier_gets_one_grant() {
    let mut sched = scheduler(1, Duration::from_millis(500));
    sched.add_ue(UeConfig::new(UE, vec![CarrierIndex(0)]));
    sched
        .update_buffer_status(UE, CarrierIndex(0), BufferStatus::new(1000, 0, 15))
        .unwrap();

    let published = publish(&mut sched, 0);
    assert_eq!(published.results.len(), 1);
    let dl = dl_grants(&published, 0);
    assert_eq!(dl.len(), 1);
    assert_eq!(dl[0].rnti, UE);
    assert_eq!(dl[0].pid, 0);
    assert!(dl[0].ndi);
    assert!(!dl[0].is_retx);
    assert!(published.results[0].ul.is_empty());

    let state = sched.carrier_state(CarrierIndex(0)).unwrap().ue(UE).unwrap();
    assert_eq!(state.harq(Direction::Downlink).nof_active(), 1);
}

#[test]
fn nack_on_last_transmission_is_counted_as_loss() {
    let mut sched = scheduler(1, Duration::from_millis(500));
    sched.add_ue(UeConfig::new(UE, vec![CarrierIndex(0)]).with_max_harq_tx(4));
    sched
        .update_buffer_status(UE, CarrierIndex(0), BufferStatus::new(99, 0, 15))
        .unwrap();

    let first = publish(&mut sched, 0);
    let pid = dl_grants(&first, 0)[0].pid;

    let mut slot = 0;
    for retx in 1..=3 {
        slot += RTT;
        sched.enqueue_feedback(dl_feedback(0, pid, false, slot)).unwrap();
        let published = publish(&mut sched, slot);
        let dl = dl_grants(&published, 0);
        assert_eq!(dl.len(), 1);
        assert!(dl[0].is_retx);
        assert_eq!(dl[0].pid, pid);
        let ue = sched.carrier_state(CarrierIndex(0)).unwrap().ue(UE).unwrap();
        let harq = ue.harq(Direction::Downlink);
        assert_eq!(harq.process(pid).unwrap().nof_retxs(), retx);
    }

    // Retransmission count is one below the maximum: this NACK ends the block
    slot += RTT;
    sched.enqueue_feedback(dl_feedback(0, pid, false, slot)).unwrap();
    let published = publish(&mut sched, slot);
    assert!(dl_grants(&published, 0).is_empty());

    let metrics = sched.metrics().snapshot();
    assert_eq!(metrics.harq_losses, 1);
    assert_eq!(metrics.nacks, 4);
    assert_eq!(metrics.carrier(CarrierIndex(0)).unwrap().dl_retx, 3);
}

#[test]
fn late_carrier_publishes_empty_and_others_proceed() {
    let mut sched = scheduler(4, Duration::from_millis(100)).with_allocator(Box::new(StallOn {
        carrier: CarrierIndex(2),
    }));
    sched.add_ue(UeConfig::new(UE, all_carriers(4)));
    for cc in all_carriers(4) {
        sched.update_buffer_status(UE, cc, BufferStatus::new(500, 0, 12)).unwrap();
    }

    let published = publish(&mut sched, 0);
    assert_eq!(published.results.len(), 4);

    let late = published.result(CarrierIndex(2)).unwrap();
    assert!(late.late);
    assert!(late.is_empty());
    for cc in [0, 1, 3] {
        assert_eq!(dl_grants(&published, cc).len(), 1);
        assert!(!published.results[cc as usize].late);
    }

    // Abandoned before committing: no half-applied HARQ state
    wait_for_carrier(&mut sched, CarrierIndex(2));
    let cc2 = sched.carrier_state(CarrierIndex(2)).unwrap().ue(UE).unwrap();
    assert_eq!(cc2.nof_active(), 0);
    assert_eq!(cc2.buffer.dl_pending_bytes, 500);

    let metrics = sched.metrics().snapshot();
    assert_eq!(metrics.carrier(CarrierIndex(2)).unwrap().late_slots, 1);
    assert_eq!(metrics.carrier(CarrierIndex(0)).unwrap().late_slots, 0);
}

#[test]
fn barrier_joins_every_carrier() {
    let mut sched = scheduler(4, Duration::from_millis(500));
    sched.add_ue(UeConfig::new(UE, all_carriers(4)));
    for cc in all_carriers(4) {
        sched.update_buffer_status(UE, cc, BufferStatus::new(5000, 300, 10)).unwrap();
    }

    for slot in 0..6 {
        let published = publish(&mut sched, slot);
        assert_eq!(published.results.len(), 4);
        for (i, result) in published.results.iter().enumerate() {
            assert_eq!(result.carrier, CarrierIndex(i as u8));
            assert_eq!(result.slot, SlotIndex(slot));
            assert!(!result.late);
        }
        sched.recycle(published);
    }
    assert_eq!(sched.metrics().snapshot().published_slots, 6);
}

#[test]
fn acked_process_is_reused() {
    let mut sched = scheduler(1, Duration::from_millis(500));
    sched.add_ue(UeConfig::new(UE, vec![CarrierIndex(0)]));
    sched
        .update_buffer_status(UE, CarrierIndex(0), BufferStatus::new(300, 0, 15))
        .unwrap();

    let first = publish(&mut sched, 0);
    let grant = dl_grants(&first, 0)[0].clone();

    sched.enqueue_feedback(dl_feedback(0, grant.pid, true, RTT)).unwrap();
    sched
        .update_buffer_status(UE, CarrierIndex(0), BufferStatus::new(300, 0, 15))
        .unwrap();
    let second = publish(&mut sched, RTT);
    let reused = &dl_grants(&second, 0)[0];
    assert_eq!(reused.pid, grant.pid);
    assert!(!reused.is_retx);
    assert_ne!(reused.ndi, grant.ndi);
    assert_eq!(sched.metrics().snapshot().acks, 1);
}

#[test]
fn duplicate_ack_is_stale_and_harmless() {
    let mut sched = scheduler(1, Duration::from_millis(500));
    sched.add_ue(UeConfig::new(UE, vec![CarrierIndex(0)]));
    sched
        .update_buffer_status(UE, CarrierIndex(0), BufferStatus::new(300, 0, 15))
        .unwrap();
    let first = publish(&mut sched, 0);
    let pid = dl_grants(&first, 0)[0].pid;

    sched.enqueue_feedback(dl_feedback(0, pid, true, RTT)).unwrap();
    sched.enqueue_feedback(dl_feedback(0, pid, true, RTT)).unwrap();
    publish(&mut sched, RTT);

    // Early feedback for a process that has not completed its round trip
    sched
        .update_buffer_status(UE, CarrierIndex(0), BufferStatus::new(300, 0, 15))
        .unwrap();
    publish(&mut sched, RTT + 1);
    sched.enqueue_feedback(dl_feedback(0, pid, false, RTT + 2)).unwrap();
    publish(&mut sched, RTT + 2);

    let metrics = sched.metrics().snapshot();
    assert_eq!(metrics.acks, 1);
    assert_eq!(metrics.stale_feedback, 2);
    assert_eq!(metrics.harq_losses, 0);
    let ue = sched.carrier_state(CarrierIndex(0)).unwrap().ue(UE).unwrap();
    assert_eq!(ue.harq(Direction::Downlink).nof_active(), 1);
}

#[test]
fn active_processes_never_exceed_table_size() {
    let args = SchedulerArgs {
        nof_workers: 1,
        slot_deadline: Some(Duration::from_millis(500)),
    };
    let mut sched = MacScheduler::new(cells(1, 4), args).unwrap();
    sched.add_ue(UeConfig::new(UE, vec![CarrierIndex(0)]));

    for slot in 0..40 {
        sched
            .update_buffer_status(UE, CarrierIndex(0), BufferStatus::new(200, 200, 15))
            .unwrap();
        publish(&mut sched, slot);
        let ue = sched.carrier_state(CarrierIndex(0)).unwrap().ue(UE).unwrap();
        for direction in Direction::ALL {
            assert!(ue.harq(direction).nof_active() <= 4);
        }
    }
    // Unanswered blocks expire and free their processes again
    assert!(sched.metrics().snapshot().harq_losses > 0);
}

#[test]
fn identical_inputs_give_identical_grants() {
    let run = || {
        let mut sched = scheduler(2, Duration::from_millis(500))
            .with_feedback_generator(Box::new(BlerFeedback::new(0.3, 0.3, 42)));
        for rnti in 1..=5u16 {
            let carriers = if rnti % 2 == 0 { all_carriers(2) } else { vec![CarrierIndex(1)] };
            let config = UeConfig::new(Rnti(rnti), carriers.clone());
            sched.add_ue(config.with_priority((rnti % 3) as u8));
        }
        let mut trace: Vec<(u64, u8, Vec<Grant>, Vec<Grant>)> = Vec::new();
        for slot in 0..30 {
            for rnti in 1..=5u16 {
                for cc in all_carriers(2) {
                    let status = BufferStatus::new(400, 100, 9);
                    let _ = sched.update_buffer_status(Rnti(rnti), cc, status);
                }
            }
            let published = publish(&mut sched, slot);
            for result in &published.results {
                trace.push((slot, result.carrier.0, result.dl.clone(), result.ul.clone()));
            }
        }
        trace
    };
    assert_eq!(run(), run());
}

#[test]
fn shutdown_during_allocation_voids_the_slot() {
    let mut sched = scheduler(2, Duration::from_secs(10)).with_allocator(Box::new(StallOn {
        carrier: CarrierIndex(1),
    }));
    sched.add_ue(UeConfig::new(UE, all_carriers(2)));
    sched
        .update_buffer_status(UE, CarrierIndex(1), BufferStatus::new(500, 0, 12))
        .unwrap();

    let handle = sched.shutdown_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        handle.shutdown();
    });

    let outcome = sched.run_slot(SlotIndex(0)).unwrap();
    stopper.join().unwrap();
    assert!(outcome.is_void());
    assert_eq!(sched.metrics().snapshot().void_slots, 1);
    assert!(sched.run_slot(SlotIndex(1)).is_err());

    let cc1 = sched.carrier_state(CarrierIndex(1)).unwrap().ue(UE).unwrap();
    assert_eq!(cc1.nof_active(), 0);
}

#[test]
fn removing_a_ue_flushes_every_carrier() {
    let mut sched = scheduler(2, Duration::from_millis(500));
    sched.add_ue(UeConfig::new(UE, all_carriers(2)));
    for cc in all_carriers(2) {
        sched.update_buffer_status(UE, cc, BufferStatus::new(300, 0, 15)).unwrap();
    }
    publish(&mut sched, 0);

    sched.remove_ue(UE).unwrap();
    assert!(sched.carrier_state(CarrierIndex(0)).unwrap().ue(UE).is_none());
    assert!(sched.carrier_state(CarrierIndex(1)).unwrap().ue(UE).is_none());
    assert!(sched.ue_context(UE).is_none());

    let metrics = sched.metrics().snapshot();
    assert_eq!(metrics.flushed_processes, 2);
    assert_eq!(metrics.harq_losses, 0);

    // Feedback arriving after detach is discarded without an error
    assert_eq!(sched.enqueue_feedback(dl_feedback(0, 0, true, RTT)), Ok(()));
    assert_eq!(sched.metrics().snapshot().stale_feedback, 1);
}

#[test]
fn reconfiguration_keeps_remaining_carriers() {
    let mut sched = scheduler(2, Duration::from_millis(500));
    sched.add_ue(UeConfig::new(UE, all_carriers(2)));
    for cc in all_carriers(2) {
        sched.update_buffer_status(UE, cc, BufferStatus::new(300, 0, 15)).unwrap();
    }
    publish(&mut sched, 0);

    let status = sched.reconfigure_ue(UeConfig::new(UE, vec![CarrierIndex(0)])).unwrap();
    assert_eq!(status, UeStatus::Active);

    let cc0 = sched.carrier_state(CarrierIndex(0)).unwrap().ue(UE).unwrap();
    assert_eq!(cc0.harq(Direction::Downlink).nof_active(), 1);
    assert!(sched.carrier_state(CarrierIndex(1)).unwrap().ue(UE).is_none());
    assert_eq!(sched.metrics().snapshot().flushed_processes, 1);

    let context = sched.ue_context(UE).unwrap();
    assert_eq!(context.carriers.len(), 1);
    assert_eq!(context.config.primary_carrier(), Some(CarrierIndex(0)));
}

#[test]
fn faulty_ue_is_excluded_until_reconfigured() {
    let mut sched = scheduler(1, Duration::from_millis(500));
    let insert = sched.add_ue(UeConfig::new(UE, vec![CarrierIndex(0), CarrierIndex(5)]));
    assert_eq!(insert.status, UeStatus::ConfigFault);
    assert!(sched
        .update_buffer_status(UE, CarrierIndex(0), BufferStatus::new(300, 0, 15))
        .is_err());
    assert_eq!(publish(&mut sched, 0).nof_grants(), 0);
    assert_eq!(sched.metrics().snapshot().config_faults, 1);

    sched.reconfigure_ue(UeConfig::new(UE, vec![CarrierIndex(0)])).unwrap();
    sched
        .update_buffer_status(UE, CarrierIndex(0), BufferStatus::new(300, 0, 15))
        .unwrap();
    assert_eq!(publish(&mut sched, 1).nof_grants(), 1);
}

#[test]
fn simulated_feedback_acknowledges_after_round_trip() {
    let mut sched = scheduler(1, Duration::from_millis(500))
        .with_feedback_generator(Box::new(BlerFeedback::new(0.0, 0.0, 1)));
    sched.add_ue(UeConfig::new(UE, vec![CarrierIndex(0)]));
    sched
        .update_buffer_status(UE, CarrierIndex(0), BufferStatus::new(300, 300, 15))
        .unwrap();

    for slot in 0..=RTT {
        publish(&mut sched, slot);
    }
    let metrics = sched.metrics().snapshot();
    assert_eq!(metrics.acks, 2);
    assert_eq!(metrics.nacks, 0);
    let ue = sched.carrier_state(CarrierIndex(0)).unwrap().ue(UE).unwrap();
    assert_eq!(ue.nof_active(), 0);
}

#[test]
fn stuck_allocator_does_not_hold_the_slot() {
    let deadline = Duration::from_millis(50);
    let mut sched = scheduler(4, deadline).with_allocator(Box::new(SleepOnce {
        carrier: CarrierIndex(2),
        stall: Duration::from_millis(600),
        fired: AtomicBool::new(false),
    }));
    sched.add_ue(UeConfig::new(UE, all_carriers(4)));
    for cc in all_carriers(4) {
        sched.update_buffer_status(UE, cc, BufferStatus::new(500, 0, 12)).unwrap();
    }

    let started = Instant::now();
    let published = publish(&mut sched, 0);
    assert!(started.elapsed() < Duration::from_millis(400), "slot took {:?}", started.elapsed());
    assert!(published.result(CarrierIndex(2)).unwrap().late);
    for cc in [0, 1, 3] {
        assert_eq!(dl_grants(&published, cc).len(), 1);
    }

    // Still out: the next slot publishes it empty again and parks its reports
    assert!(sched.carrier_state(CarrierIndex(2)).is_none());
    sched
        .update_buffer_status(UE, CarrierIndex(2), BufferStatus::new(700, 0, 12))
        .unwrap();
    let next = publish(&mut sched, 1);
    let out = next.result(CarrierIndex(2)).unwrap();
    assert!(out.late);
    assert!(out.is_empty());

    wait_for_carrier(&mut sched, CarrierIndex(2));
    let cc2 = sched.carrier_state(CarrierIndex(2)).unwrap().ue(UE).unwrap();
    assert_eq!(cc2.nof_active(), 0);

    let back = publish(&mut sched, 2);
    assert!(!back.result(CarrierIndex(2)).unwrap().late);
    let dl = dl_grants(&back, 2);
    assert_eq!(dl.len(), 1);
    assert_eq!(dl[0].tbs, 700);
    assert_eq!(sched.metrics().snapshot().carrier(CarrierIndex(2)).unwrap().late_slots, 2);
}

#[test]
fn panicking_allocator_only_loses_its_carrier() {
    let mut sched = scheduler(2, Duration::from_millis(500)).with_allocator(Box::new(PanicOn {
        carrier: CarrierIndex(1),
    }));
    sched.add_ue(UeConfig::new(UE, all_carriers(2)));

    for slot in 0..2 {
        for cc in all_carriers(2) {
            sched.update_buffer_status(UE, cc, BufferStatus::new(300, 0, 15)).unwrap();
        }
        let published = publish(&mut sched, slot);
        assert_eq!(dl_grants(&published, 0).len(), 1);
        let failed = published.result(CarrierIndex(1)).unwrap();
        assert!(failed.late);
        assert!(failed.is_empty());
    }

    let cc1 = sched.carrier_state(CarrierIndex(1)).unwrap().ue(UE).unwrap();
    assert_eq!(cc1.nof_active(), 0);
    let metrics = sched.metrics().snapshot();
    assert_eq!(metrics.carrier(CarrierIndex(1)).unwrap().late_slots, 2);
    assert_eq!(metrics.published_slots, 2);
}

#[test]
fn carrier_failing_validation_publishes_empty() {
    let mut sched = scheduler(2, Duration::from_millis(500)).with_allocator(Box::new(OverlapOn {
        carrier: CarrierIndex(0),
    }));
    let other = Rnti(0x4602);
    for rnti in [UE, other] {
        sched.add_ue(UeConfig::new(rnti, all_carriers(2)));
        for cc in all_carriers(2) {
            sched.update_buffer_status(rnti, cc, BufferStatus::new(300, 0, 15)).unwrap();
        }
    }

    let published = publish(&mut sched, 0);
    let rejected = published.result(CarrierIndex(0)).unwrap();
    assert!(rejected.is_empty());
    assert!(!rejected.late);
    assert_eq!(dl_grants(&published, 1).len(), 2);

    let metrics = sched.metrics().snapshot();
    assert_eq!(metrics.carrier(CarrierIndex(0)).unwrap().validation_failures, 1);
    assert_eq!(metrics.carrier(CarrierIndex(1)).unwrap().validation_failures, 0);
    assert_eq!(metrics.published_slots, 1);
}
