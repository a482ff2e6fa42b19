//! Scheduler-owned scratch memory
//!
//! Grant vectors and allocation workspaces are reused from slot to slot. The
//! arena belongs to one scheduler instance and is only touched from the slot
//! loop, so it needs no locking.

use super::allocator::SlotPlan;
use super::grant::Grant;
use super::scheduler::PublishedSlot;
use common::types::Rnti;

/// Per-carrier scratch reused by every allocation pass
#[derive(Debug, Default)]
pub struct CarrierWorkspace {
    pub plan: SlotPlan,
    /// Scheduling order of the current pass, as (priority, RNTI)
    pub order: Vec<(u8, Rnti)>,
}

/// Free list of grant vectors handed out to carrier tasks
#[derive(Debug)]
pub struct SlotArena {
    free: Vec<Vec<Grant>>,
    max_cached: usize,
}

impl SlotArena {
    /// Arena sized for one DL and one UL list per carrier across two slots in flight
    pub fn new(nof_carriers: usize) -> Self {
        Self {
            free: Vec::new(),
            max_cached: nof_carriers * 4,
        }
    }

    /// Empty grant vector, recycled when one is available
    pub fn take(&mut self) -> Vec<Grant> {
        self.free.pop().unwrap_or_default()
    }

    /// Return a vector once its contents are no longer needed
    pub fn give_back(&mut self, mut grants: Vec<Grant>) {
        grants.clear();
        if self.free.len() < self.max_cached && grants.capacity() > 0 {
            self.free.push(grants);
        }
    }

    /// Hand every list of a consumed slot back to the arena
    pub fn recycle(&mut self, published: PublishedSlot) {
        for result in published.results {
            self.give_back(result.dl);
            self.give_back(result.ul);
        }
    }

    /// Vectors ready for reuse
    pub fn cached(&self) -> usize {
        self.free.len()
    }
}
