//! Carrier Concurrency Coordinator
//!
//! Runs one allocation task per carrier on a fixed rayon pool. Each task takes
//! its [`CarrierState`] by value and hands it back over a completion channel,
//! so HARQ tables need no locks and the driving thread never joins a task: it
//! waits on the channel until every carrier reported or the slot deadline
//! passed, and publishes without whatever is still out.
//!
//! A per-task [`TaskGate`] settles the race between a task finishing and the
//! deadline: the task may only commit after moving the gate from pending to
//! committing, the coordinator may only give up on a task by moving it from
//! pending to abandoned. Whichever happens first wins, so a late carrier never
//! leaves half-applied HARQ state behind. An abandoned task keeps running until
//! its allocator returns; its state comes back through [`CarrierCoordinator::reclaim`].

use super::allocator::{commit, AllocationContext, CommitStats, PlanStatus, SlotAllocator};
use super::carrier::CarrierState;
use super::grant::Grant;
use super::ue::UeSnapshot;
use super::SchedError;
use common::types::{CarrierIndex, SlotIndex};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const GATE_PENDING: u8 = 0;
const GATE_COMMITTING: u8 = 1;
const GATE_ABANDONED: u8 = 2;

/// Commit-or-abandon arbiter of one carrier task
#[derive(Debug)]
pub struct TaskGate(AtomicU8);

impl TaskGate {
    pub const fn new() -> Self {
        Self(AtomicU8::new(GATE_PENDING))
    }

    /// Task side: claim the right to touch HARQ state
    pub fn try_begin_commit(&self) -> bool {
        self.0
            .compare_exchange(GATE_PENDING, GATE_COMMITTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Coordinator side: give up on a task that has not started committing
    pub fn try_abandon(&self) -> bool {
        self.0
            .compare_exchange(GATE_PENDING, GATE_ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_abandoned(&self) -> bool {
        self.0.load(Ordering::Acquire) == GATE_ABANDONED
    }
}

impl Default for TaskGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation seen by an allocation pass: deadline abandonment or shutdown
#[derive(Debug, Clone, Copy)]
pub struct CancelToken<'a> {
    gate: &'a TaskGate,
    shutdown: &'a AtomicBool,
}

impl<'a> CancelToken<'a> {
    pub fn new(gate: &'a TaskGate, shutdown: &'a AtomicBool) -> Self {
        Self { gate, shutdown }
    }

    pub fn is_cancelled(&self) -> bool {
        self.gate.is_abandoned() || self.is_shutdown()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl CancelToken<'static> {
    /// Token that never fires, for running an allocator outside the coordinator
    pub fn never() -> Self {
        static GATE: TaskGate = TaskGate::new();
        static SHUTDOWN: AtomicBool = AtomicBool::new(false);
        Self {
            gate: &GATE,
            shutdown: &SHUTDOWN,
        }
    }
}

/// What a carrier task is given for one slot
pub struct CarrierJob {
    pub state: CarrierState,
    pub dl: Vec<Grant>,
    pub ul: Vec<Grant>,
}

/// Grants of a carrier that committed in time
#[derive(Debug)]
pub struct CarrierOutput {
    pub dl: Vec<Grant>,
    pub ul: Vec<Grant>,
    pub stats: CommitStats,
    pub skipped: usize,
    pub latency: Duration,
}

/// How one carrier task ended
#[derive(Debug)]
pub enum CarrierReport {
    Completed(CarrierOutput),
    /// Abandoned at the deadline, or its allocator panicked, before committing
    Late {
        dl: Vec<Grant>,
        ul: Vec<Grant>,
        latency: Duration,
    },
    /// Stopped by shutdown before committing
    Cancelled { dl: Vec<Grant>, ul: Vec<Grant> },
}

/// A finished task: the carrier's state comes back with its report
#[derive(Debug)]
pub struct TaskReturn {
    /// Slot the task was dispatched for
    pub slot: SlotIndex,
    pub state: CarrierState,
    pub report: CarrierReport,
}

impl TaskReturn {
    pub fn carrier(&self) -> CarrierIndex {
        self.state.carrier()
    }
}

/// Fixed worker pool plus the per-slot barrier
pub struct CarrierCoordinator {
    pool: ThreadPool,
    nof_workers: usize,
    done_tx: Sender<TaskReturn>,
    done_rx: Receiver<TaskReturn>,
}

impl CarrierCoordinator {
    /// Build the pool; threads are named `mac-cc-<n>`
    pub fn new(nof_workers: usize) -> Result<Self, SchedError> {
        let nof_workers = nof_workers.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(nof_workers)
            .thread_name(|i| format!("mac-cc-{}", i))
            .build()
            .map_err(|e| SchedError::WorkerPool(e.to_string()))?;
        let (done_tx, done_rx) = crossbeam_channel::unbounded();

        info!("Carrier worker pool started with {} threads", nof_workers);
        Ok(Self {
            pool,
            nof_workers,
            done_tx,
            done_rx,
        })
    }

    pub fn nof_workers(&self) -> usize {
        self.nof_workers
    }

    /// Dispatch every carrier job for `slot` and wait for them until `deadline`.
    ///
    /// Returns the tasks that came back, including stragglers of earlier slots
    /// that finished meanwhile. A task of this slot still planning at the
    /// deadline is abandoned and left running; a task already committing is
    /// waited for, since commit does not call into the allocator.
    pub fn run(
        &self,
        slot: SlotIndex,
        deadline: Instant,
        jobs: Vec<CarrierJob>,
        allocator: &Arc<dyn SlotAllocator>,
        ues: &UeSnapshot,
        shutdown: &Arc<AtomicBool>,
    ) -> Vec<TaskReturn> {
        let mut pending: Vec<(CarrierIndex, Arc<TaskGate>)> = Vec::with_capacity(jobs.len());
        for job in jobs {
            let gate = Arc::new(TaskGate::new());
            pending.push((job.state.carrier(), Arc::clone(&gate)));

            let done_tx = self.done_tx.clone();
            let allocator = Arc::clone(allocator);
            let ues = ues.clone();
            let shutdown = Arc::clone(shutdown);
            self.pool.spawn(move || {
                let task = run_carrier(slot, job, allocator.as_ref(), &ues, &gate, &shutdown);
                // The scheduler may be gone by the time an abandoned task ends
                let _ = done_tx.send(task);
            });
        }

        let mut returned = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            match self.done_rx.recv_deadline(deadline) {
                Ok(task) => settle(slot, task, &mut pending, &mut returned),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        pending.retain(|(carrier, gate)| {
            if gate.try_abandon() {
                warn!("Slot {}: {} abandoned at deadline", slot, carrier);
                false
            } else {
                true
            }
        });
        while !pending.is_empty() {
            match self.done_rx.recv() {
                Ok(task) => settle(slot, task, &mut pending, &mut returned),
                Err(_) => break,
            }
        }

        returned
    }

    /// Tasks of earlier slots that finished since the last call
    pub fn reclaim(&self) -> Vec<TaskReturn> {
        self.done_rx.try_iter().collect()
    }
}

fn settle(
    slot: SlotIndex,
    task: TaskReturn,
    pending: &mut Vec<(CarrierIndex, Arc<TaskGate>)>,
    returned: &mut Vec<TaskReturn>,
) {
    if task.slot == slot {
        let carrier = task.carrier();
        pending.retain(|(c, _)| *c != carrier);
    }
    returned.push(task);
}

/// How an allocation pass ended, before the grant lists are attached
enum PassEnd {
    Committed { stats: CommitStats, skipped: usize },
    Late,
    Cancelled,
}

fn run_carrier(
    slot: SlotIndex,
    job: CarrierJob,
    allocator: &dyn SlotAllocator,
    ues: &UeSnapshot,
    gate: &TaskGate,
    shutdown: &AtomicBool,
) -> TaskReturn {
    let started = Instant::now();
    let CarrierJob {
        mut state,
        mut dl,
        mut ul,
    } = job;
    let carrier = state.carrier();
    let cancel = CancelToken::new(gate, shutdown);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        allocate(slot, &mut state, &mut dl, &mut ul, allocator, ues, &cancel, gate)
    }));
    let end = outcome.unwrap_or_else(|_| {
        error!("Slot {}: allocation task of {} panicked", slot, carrier);
        gate.try_abandon();
        dl.clear();
        ul.clear();
        PassEnd::Late
    });

    let latency = started.elapsed();
    let report = match end {
        PassEnd::Committed { stats, skipped } => {
            debug!(
                "Slot {}: {} planned {} DL / {} UL grants, {} skipped",
                slot,
                carrier,
                dl.len(),
                ul.len(),
                skipped
            );
            CarrierReport::Completed(CarrierOutput {
                dl,
                ul,
                stats,
                skipped,
                latency,
            })
        }
        PassEnd::Late => CarrierReport::Late { dl, ul, latency },
        PassEnd::Cancelled => {
            debug!("Slot {}: {} cancelled by shutdown", slot, carrier);
            CarrierReport::Cancelled { dl, ul }
        }
    };

    TaskReturn { slot, state, report }
}

#[allow(clippy::too_many_arguments)]
fn allocate(
    slot: SlotIndex,
    state: &mut CarrierState,
    dl: &mut Vec<Grant>,
    ul: &mut Vec<Grant>,
    allocator: &dyn SlotAllocator,
    ues: &UeSnapshot,
    cancel: &CancelToken<'_>,
    gate: &TaskGate,
) -> PassEnd {
    // Queued behind a stuck task past the deadline
    if cancel.is_cancelled() {
        return if cancel.is_shutdown() { PassEnd::Cancelled } else { PassEnd::Late };
    }

    let (params, ue_states, workspace) = state.parts_mut();
    let ctx = AllocationContext {
        slot,
        cell: params,
        ues,
        state: &*ue_states,
        cancel,
    };
    let status = allocator.plan(&ctx, workspace);

    if cancel.is_shutdown() {
        gate.try_abandon();
        return PassEnd::Cancelled;
    }
    if status == PlanStatus::Abandoned || !gate.try_begin_commit() {
        return PassEnd::Late;
    }

    let stats = commit(slot, &workspace.plan, ue_states, dl, ul);
    PassEnd::Committed {
        stats,
        skipped: workspace.plan.skipped.len(),
    }
}
