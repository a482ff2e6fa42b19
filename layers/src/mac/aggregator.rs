//! Slot Result Aggregator and Feedback Applier
//!
//! Runs on the scheduler thread around the carrier barrier: feedback and
//! housekeeping before the carriers are dispatched, validation after they
//! joined.

use super::carrier::CarrierState;
use super::feedback::PendingAck;
use super::grant::SlotResult;
use super::harq::AckOutcome;
use super::metrics::SchedulerMetrics;
use common::types::{Direction, Rnti, SlotIndex};
use thiserror::Error;
use tracing::{debug, trace};

/// Consistency violations in a carrier's result
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{direction} grant for unknown UE {rnti}")]
    UnknownUe { rnti: Rnti, direction: Direction },

    #[error("{direction} grant for {rnti} names pid {pid}, not transmitted this slot")]
    StaleProcess { rnti: Rnti, direction: Direction, pid: u8 },

    #[error("{direction} grants for {first} and {second} overlap")]
    Overlap { direction: Direction, first: Rnti, second: Rnti },

    #[error("{rnti} has more than one {direction} grant")]
    Duplicate { rnti: Rnti, direction: Direction },
}

/// Counts of one feedback pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedbackSummary {
    pub acked: u32,
    pub retx_pending: u32,
    pub lost: u32,
    pub stale: u32,
}

/// Apply every queued ACK/NACK observed at or before `slot`
pub fn apply_feedback<'a>(
    carriers: impl IntoIterator<Item = &'a mut CarrierState>,
    slot: SlotIndex,
    metrics: &SchedulerMetrics,
) -> FeedbackSummary {
    let mut summary = FeedbackSummary::default();
    let mut due: Vec<PendingAck> = Vec::new();

    for carrier in carriers {
        for ue in carrier.ues_mut() {
            due.clear();
            ue.take_due_acks(slot, &mut due);
            for ack in &due {
                let outcome = ue.harq_mut(ack.direction).apply_ack(ack.pid, ack.ack, ack.slot);
                match outcome {
                    AckOutcome::Acked => {
                        metrics.record_feedback(true);
                        summary.acked += 1;
                    }
                    AckOutcome::RetxPending => {
                        metrics.record_feedback(false);
                        summary.retx_pending += 1;
                    }
                    AckOutcome::MaxRetxExceeded => {
                        debug!(
                            "Slot {}: {} {} {} pid {} lost after max retransmissions",
                            slot, ack.carrier, ack.direction, ack.rnti, ack.pid
                        );
                        metrics.record_feedback(false);
                        metrics.add_harq_losses(1);
                        summary.lost += 1;
                    }
                    AckOutcome::Stale(reason) => {
                        trace!(
                            "Slot {}: stale feedback {} {} {} pid {}: {:?}",
                            slot,
                            ack.carrier,
                            ack.direction,
                            ack.rnti,
                            ack.pid,
                            reason
                        );
                        metrics.record_stale_feedback();
                        summary.stale += 1;
                    }
                }
            }
        }
    }

    summary
}

/// Expire processes whose feedback never concluded; returns the count
pub fn housekeeping<'a>(
    carriers: impl IntoIterator<Item = &'a mut CarrierState>,
    slot: SlotIndex,
    metrics: &SchedulerMetrics,
) -> u32 {
    let mut expired = 0;
    for carrier in carriers {
        let cc = carrier.carrier();
        for ue in carrier.ues_mut() {
            for direction in Direction::ALL {
                let n = ue.harq_mut(direction).expire_stale(slot);
                if n > 0 {
                    debug!(
                        "Slot {}: {} {} {} expired {} processes",
                        slot,
                        cc,
                        direction,
                        ue.rnti(),
                        n
                    );
                    expired += n;
                }
            }
        }
    }
    metrics.add_harq_losses(expired as u64);
    expired
}

/// Check a carrier's result against its HARQ tables after commit
pub fn validate(result: &SlotResult, state: &CarrierState) -> Result<(), ValidationError> {
    for direction in Direction::ALL {
        let grants = result.grants(direction);
        for (i, grant) in grants.iter().enumerate() {
            let ue = state.ue(grant.rnti).ok_or(ValidationError::UnknownUe {
                rnti: grant.rnti,
                direction,
            })?;
            let transmitted_now = ue
                .harq(direction)
                .process(grant.pid)
                .is_some_and(|p| p.is_active() && p.last_slot_tx() == Some(result.slot));
            if !transmitted_now {
                return Err(ValidationError::StaleProcess {
                    rnti: grant.rnti,
                    direction,
                    pid: grant.pid,
                });
            }

            for other in &grants[..i] {
                if other.rnti == grant.rnti {
                    return Err(ValidationError::Duplicate {
                        rnti: grant.rnti,
                        direction,
                    });
                }
                if other.prbs.overlaps(&grant.prbs) {
                    return Err(ValidationError::Overlap {
                        direction,
                        first: other.rnti,
                        second: grant.rnti,
                    });
                }
            }
        }
    }
    Ok(())
}
