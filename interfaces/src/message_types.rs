//! Message Types for the Scheduler-PHY boundary
//!
//! Defines the bincode-encoded frames carried over ZMQ

use crate::InterfaceError;
use common::types::{CarrierIndex, Rnti, SlotIndex};
use layers::mac::{BufferStatus, PendingAck, PhyEvent, SlotOutcome, SlotResult};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Message from scheduler to PHY, one per slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchedulerMessage {
    /// Every carrier's grants for the slot
    Slot {
        slot: SlotIndex,
        results: Vec<SlotResult>,
        /// Milliseconds since epoch
        timestamp: u64,
    },
    /// Nothing was decided for this slot
    SlotVoid { slot: SlotIndex, timestamp: u64 },
}

impl SchedulerMessage {
    /// Frame a slot outcome for the PHY
    pub fn from_outcome(outcome: &SlotOutcome) -> Self {
        match outcome {
            SlotOutcome::Published(published) => SchedulerMessage::Slot {
                slot: published.slot,
                results: published.results.clone(),
                timestamp: now_millis(),
            },
            SlotOutcome::Void { slot, .. } => SchedulerMessage::SlotVoid {
                slot: *slot,
                timestamp: now_millis(),
            },
        }
    }

    pub fn slot(&self) -> SlotIndex {
        match self {
            SchedulerMessage::Slot { slot, .. } | SchedulerMessage::SlotVoid { slot, .. } => *slot,
        }
    }
}

/// Message from PHY to scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhyMessage {
    /// Buffer occupancy and channel quality of one UE on one carrier
    BufferStatus {
        rnti: Rnti,
        carrier: CarrierIndex,
        status: BufferStatus,
    },
    /// HARQ ACK/NACK
    Feedback(PendingAck),
    /// Keep alive
    KeepAlive,
}

impl PhyMessage {
    /// Scheduler input carried by this message, if any
    pub fn into_event(self) -> Option<PhyEvent> {
        match self {
            PhyMessage::BufferStatus { rnti, carrier, status } => {
                Some(PhyEvent::BufferStatus { rnti, carrier, status })
            }
            PhyMessage::Feedback(ack) => Some(PhyEvent::Feedback(ack)),
            PhyMessage::KeepAlive => None,
        }
    }
}

/// Serialize a message into a wire frame
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, InterfaceError> {
    Ok(bincode::serialize(message)?)
}

/// Parse a wire frame
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, InterfaceError> {
    Ok(bincode::deserialize(frame)?)
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::Direction;
    use layers::mac::{DciLocation, Grant, PrbInterval, PublishedSlot, VoidReason};
    use std::time::Duration;

    #[test]
    fn test_slot_message_encoding() {
        let mut result = SlotResult::empty(SlotIndex(42), CarrierIndex(1));
        result.dl.push(Grant {
            rnti: Rnti(0x4601),
            pid: 3,
            prbs: PrbInterval::new(10, 6),
            dci: DciLocation {
                aggregation_level: 2,
                cce_start: 4,
            },
            tbs: 594,
            ndi: true,
            is_retx: false,
        });
        result.compute_latency = Duration::from_micros(35);
        let outcome = SlotOutcome::Published(PublishedSlot {
            slot: SlotIndex(42),
            results: vec![SlotResult::empty(SlotIndex(42), CarrierIndex(0)), result],
        });

        let message = SchedulerMessage::from_outcome(&outcome);
        let decoded: SchedulerMessage = decode(&encode(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.slot(), SlotIndex(42));
        match decoded {
            SchedulerMessage::Slot { results, .. } => {
                assert_eq!(results.len(), 2);
                assert_eq!(results[1].dl[0].prbs, PrbInterval::new(10, 6));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_void_slot_message() {
        let outcome = SlotOutcome::Void {
            slot: SlotIndex(7),
            reason: VoidReason::Shutdown,
        };
        let message = SchedulerMessage::from_outcome(&outcome);
        assert!(matches!(message, SchedulerMessage::SlotVoid { slot: SlotIndex(7), .. }));
    }

    #[test]
    fn test_phy_message_to_event() {
        let ack = PendingAck {
            rnti: Rnti(0x4601),
            carrier: CarrierIndex(0),
            direction: Direction::Uplink,
            pid: 5,
            ack: false,
            slot: SlotIndex(100),
        };
        let frame = encode(&PhyMessage::Feedback(ack)).unwrap();
        let message: PhyMessage = decode(&frame).unwrap();
        assert_eq!(message.into_event(), Some(PhyEvent::Feedback(ack)));
        assert_eq!(PhyMessage::KeepAlive.into_event(), None);
    }

    #[test]
    fn test_garbage_frame_rejected() {
        assert!(matches!(
            decode::<PhyMessage>(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
            Err(InterfaceError::SerializationError(_))
        ));
    }
}
