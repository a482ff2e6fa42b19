//! HARQ feedback events and injectable feedback sources
//!
//! The physical layer reports ACK/NACK as [`PendingAck`] events. A
//! [`FeedbackGenerator`] lets a test bench or simulator produce those events
//! from the scheduler's own view of each UE, once per slot, before feedback is
//! applied.

use super::carrier::UeCarrierState;
use super::harq::HarqState;
use super::ue::{UeConfig, UeStatus};
use common::types::{CarrierIndex, Direction, Rnti, SlotIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// One ACK/NACK observed by the physical layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAck {
    pub rnti: Rnti,
    pub carrier: CarrierIndex,
    pub direction: Direction,
    pub pid: u8,
    pub ack: bool,
    /// Slot the feedback was observed in
    pub slot: SlotIndex,
}

/// Read-only view of one UE across its carriers
#[derive(Debug)]
pub struct UeSchedulingContext<'a> {
    pub config: &'a UeConfig,
    pub status: UeStatus,
    /// Per-carrier HARQ tables, in carrier order
    pub carriers: Vec<&'a UeCarrierState>,
}

/// Source of feedback events consulted at the start of every slot
pub trait FeedbackGenerator: Send {
    fn generate_feedback(
        &mut self,
        slot: SlotIndex,
        ue: &UeSchedulingContext<'_>,
    ) -> Vec<PendingAck>;
}

/// Produces nothing; feedback only arrives from the physical layer
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFeedback;

impl FeedbackGenerator for NoFeedback {
    fn generate_feedback(
        &mut self,
        _slot: SlotIndex,
        _ue: &UeSchedulingContext<'_>,
    ) -> Vec<PendingAck> {
        Vec::new()
    }
}

/// Simulated receiver: every transmission is answered exactly one round trip
/// later, NACKed with the configured block error rate.
#[derive(Debug)]
pub struct BlerFeedback {
    rng: StdRng,
    dl_bler: f64,
    ul_bler: f64,
}

impl BlerFeedback {
    pub fn new(dl_bler: f64, ul_bler: f64, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            dl_bler: dl_bler.clamp(0.0, 1.0),
            ul_bler: ul_bler.clamp(0.0, 1.0),
        }
    }

    fn bler(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Downlink => self.dl_bler,
            Direction::Uplink => self.ul_bler,
        }
    }
}

impl FeedbackGenerator for BlerFeedback {
    fn generate_feedback(
        &mut self,
        slot: SlotIndex,
        ue: &UeSchedulingContext<'_>,
    ) -> Vec<PendingAck> {
        let mut events = Vec::new();
        for state in &ue.carriers {
            for direction in Direction::ALL {
                let harq = state.harq(direction);
                let rtt = harq.rtt_slots() as u64;
                let bler = self.bler(direction);
                for proc in harq.processes() {
                    if proc.state() != HarqState::WaitingAck {
                        continue;
                    }
                    if proc.last_slot_tx().map(|tx| tx + rtt) != Some(slot) {
                        continue;
                    }
                    events.push(PendingAck {
                        rnti: state.rnti(),
                        carrier: state.carrier(),
                        direction,
                        pid: proc.pid(),
                        ack: self.rng.gen::<f64>() >= bler,
                        slot,
                    });
                }
            }
        }
        events
    }
}
