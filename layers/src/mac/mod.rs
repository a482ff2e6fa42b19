//! Medium Access Control (MAC) Layer Implementation
//!
//! Multi-carrier slot scheduler for 5G NR (3GPP TS 38.321). Once per slot the
//! scheduler applies HARQ feedback, runs one allocation task per component
//! carrier on a fixed worker pool, and publishes the validated grants of every
//! carrier together.

pub mod aggregator;
pub mod allocator;
pub mod arena;
pub mod carrier;
pub mod cell;
pub mod coordinator;
pub mod feedback;
pub mod grant;
pub mod harq;
pub mod metrics;
pub mod pdu;
pub mod scheduler;
pub mod ue;

use common::types::{CarrierIndex, Rnti, SlotIndex};
use thiserror::Error;

pub use allocator::{RoundRobinAllocator, SlotAllocator};
pub use carrier::BufferStatus;
pub use cell::{CellParams, CellRegistry};
pub use feedback::{BlerFeedback, FeedbackGenerator, NoFeedback, PendingAck};
pub use grant::{DciLocation, Grant, PrbInterval, SlotResult};
pub use harq::{AckOutcome, HarqEntity, HarqError, HarqProcess, HarqState};
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
pub use scheduler::{
    MacScheduler, PhyEvent, PhyInbox, PublishedSlot, SchedulerArgs, ShutdownHandle, SlotOutcome,
    VoidReason,
};
pub use ue::{UeCapabilities, UeConfig, UeStatus, UeStore};

/// Invalid cell or UE configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid cell {carrier}: {reason}")]
    InvalidCell { carrier: CarrierIndex, reason: String },

    #[error("No cells configured")]
    NoCells,

    #[error("Carrier {found} listed at position {expected}")]
    CarrierOutOfOrder { expected: usize, found: CarrierIndex },

    #[error("Invalid UE {rnti}: {reason}")]
    InvalidUe { rnti: Rnti, reason: String },

    #[error("UE {rnti} configured on unknown carrier {carrier}")]
    UnknownCarrier { rnti: Rnti, carrier: CarrierIndex },
}

/// Scheduler errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Unknown UE {0}")]
    UnknownUe(Rnti),

    #[error("Unknown carrier {0}")]
    UnknownCarrier(CarrierIndex),

    #[error("Scheduler is shut down")]
    ShutDown,

    #[error("Slot {slot} does not follow last scheduled slot {last}")]
    SlotNotAdvancing { slot: SlotIndex, last: SlotIndex },

    #[error("Worker pool error: {0}")]
    WorkerPool(String),
}
