//! UE Context Store
//!
//! Thread-safe keyed store of UE configurations. Writers (attach, reconfigure,
//! detach) take the write lock only long enough to swap in a new map; the slot
//! loop reads an immutable snapshot and never holds the lock while carriers
//! are being scheduled.

use super::cell::CellRegistry;
use super::metrics::SchedulerMetrics;
use super::{ConfigError, SchedError};
use bitflags::bitflags;
use common::types::{CarrierIndex, Rnti};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default maximum transmissions of one transport block
pub const DEFAULT_MAX_HARQ_TX: u8 = 4;

/// Upper bound accepted for `max_harq_tx`
pub const MAX_HARQ_TX_LIMIT: u8 = 8;

bitflags! {
    /// UE radio capabilities relevant to scheduling
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UeCapabilities: u8 {
        /// More than one serving cell
        const CARRIER_AGGREGATION = 0b0000_0001;
        /// 256QAM on the shared channels
        const QAM256 = 0b0000_0010;
    }
}

impl Default for UeCapabilities {
    fn default() -> Self {
        UeCapabilities::CARRIER_AGGREGATION
    }
}

/// Scheduling configuration of one UE, replaced wholesale on reconfiguration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UeConfig {
    pub rnti: Rnti,
    /// Serving carriers; the first entry is the primary cell
    pub carriers: Vec<CarrierIndex>,
    /// Maximum transmissions per HARQ process
    pub max_harq_tx: u8,
    pub capabilities: UeCapabilities,
    /// Higher is scheduled first
    pub priority: u8,
}

impl UeConfig {
    pub fn new(rnti: Rnti, carriers: Vec<CarrierIndex>) -> Self {
        Self {
            rnti,
            carriers,
            max_harq_tx: DEFAULT_MAX_HARQ_TX,
            capabilities: UeCapabilities::default(),
            priority: 0,
        }
    }

    pub fn with_max_harq_tx(mut self, max_harq_tx: u8) -> Self {
        self.max_harq_tx = max_harq_tx;
        self
    }

    pub fn with_capabilities(mut self, capabilities: UeCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Primary cell
    pub fn primary_carrier(&self) -> Option<CarrierIndex> {
        self.carriers.first().copied()
    }

    /// Whether the UE is served on `carrier`
    pub fn is_configured_on(&self, carrier: CarrierIndex) -> bool {
        self.carriers.contains(&carrier)
    }

    /// Check the configuration against the cell registry
    pub fn validate(&self, cells: &CellRegistry) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUe {
            rnti: self.rnti,
            reason,
        };

        if !self.rnti.is_crnti() {
            return Err(invalid("not a C-RNTI".into()));
        }
        if self.carriers.is_empty() {
            return Err(invalid("no serving carrier".into()));
        }
        for (i, carrier) in self.carriers.iter().enumerate() {
            if self.carriers[..i].contains(carrier) {
                return Err(invalid(format!("carrier {} listed twice", carrier)));
            }
            if !cells.contains(*carrier) {
                return Err(ConfigError::UnknownCarrier {
                    rnti: self.rnti,
                    carrier: *carrier,
                });
            }
        }
        let aggregation = self.capabilities.contains(UeCapabilities::CARRIER_AGGREGATION);
        if self.carriers.len() > 1 && !aggregation {
            return Err(invalid(format!(
                "{} carriers without carrier aggregation support",
                self.carriers.len()
            )));
        }
        if self.max_harq_tx == 0 || self.max_harq_tx > MAX_HARQ_TX_LIMIT {
            return Err(invalid(format!(
                "max_harq_tx {} outside 1..={}",
                self.max_harq_tx, MAX_HARQ_TX_LIMIT
            )));
        }
        Ok(())
    }
}

/// Whether a UE may be scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UeStatus {
    Active,
    /// Configuration failed validation; excluded until a valid reconfiguration
    ConfigFault,
}

/// Stored UE record
#[derive(Debug, Clone)]
pub struct UeEntry {
    pub config: Arc<UeConfig>,
    pub status: UeStatus,
}

impl UeEntry {
    pub fn is_schedulable(&self) -> bool {
        self.status == UeStatus::Active
    }
}

/// Result of [`UeStore::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UeInsert {
    /// False when the RNTI was already present and left untouched
    pub inserted: bool,
    pub status: UeStatus,
}

/// Immutable view of the store taken at the start of a slot
#[derive(Debug, Clone)]
pub struct UeSnapshot {
    generation: u64,
    ues: Arc<BTreeMap<Rnti, UeEntry>>,
}

impl UeSnapshot {
    /// Store generation this snapshot was taken at
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, rnti: Rnti) -> Option<&UeEntry> {
        self.ues.get(&rnti)
    }

    /// All UEs in RNTI order
    pub fn iter(&self) -> impl Iterator<Item = (&Rnti, &UeEntry)> {
        self.ues.iter()
    }

    /// UEs whose configuration lists `carrier`, in RNTI order
    pub fn on_carrier(&self, carrier: CarrierIndex) -> impl Iterator<Item = &UeEntry> {
        self.ues
            .values()
            .filter(move |entry| entry.config.is_configured_on(carrier))
    }

    pub fn len(&self) -> usize {
        self.ues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ues.is_empty()
    }
}

/// Thread-safe RNTI-keyed UE store
pub struct UeStore {
    cells: Arc<CellRegistry>,
    metrics: Arc<SchedulerMetrics>,
    inner: RwLock<StoreInner>,
}

struct StoreInner {
    generation: u64,
    ues: Arc<BTreeMap<Rnti, UeEntry>>,
}

impl UeStore {
    pub fn new(cells: Arc<CellRegistry>, metrics: Arc<SchedulerMetrics>) -> Self {
        Self {
            cells,
            metrics,
            inner: RwLock::new(StoreInner {
                generation: 0,
                ues: Arc::new(BTreeMap::new()),
            }),
        }
    }

    /// Insert-or-find. An existing UE is left as is.
    ///
    /// An invalid configuration is still stored, flagged as a fault, so later
    /// feedback and lifecycle calls for the RNTI resolve.
    pub fn add(&self, config: UeConfig) -> UeInsert {
        let rnti = config.rnti;
        let mut inner = self.inner.write();
        if let Some(existing) = inner.ues.get(&rnti) {
            debug!("UE {} already attached", rnti);
            return UeInsert {
                inserted: false,
                status: existing.status,
            };
        }

        let status = self.check(&config);
        Arc::make_mut(&mut inner.ues).insert(
            rnti,
            UeEntry {
                config: Arc::new(config),
                status,
            },
        );
        inner.generation += 1;
        if status == UeStatus::Active {
            info!("UE {} attached", rnti);
        }
        UeInsert { inserted: true, status }
    }

    /// Replace the configuration of an attached UE
    pub fn reconfigure(&self, config: UeConfig) -> Result<UeStatus, SchedError> {
        let rnti = config.rnti;
        let mut inner = self.inner.write();
        if !inner.ues.contains_key(&rnti) {
            return Err(SchedError::UnknownUe(rnti));
        }

        let status = self.check(&config);
        Arc::make_mut(&mut inner.ues).insert(
            rnti,
            UeEntry {
                config: Arc::new(config),
                status,
            },
        );
        inner.generation += 1;
        if status == UeStatus::Active {
            info!("UE {} reconfigured", rnti);
        }
        Ok(status)
    }

    /// Detach a UE, returning its last configuration
    pub fn remove(&self, rnti: Rnti) -> Option<Arc<UeConfig>> {
        let mut inner = self.inner.write();
        let removed = Arc::make_mut(&mut inner.ues).remove(&rnti)?;
        inner.generation += 1;
        info!("UE {} detached", rnti);
        Some(removed.config)
    }

    pub fn get(&self, rnti: Rnti) -> Option<UeEntry> {
        self.inner.read().ues.get(&rnti).cloned()
    }

    pub fn contains(&self, rnti: Rnti) -> bool {
        self.inner.read().ues.contains_key(&rnti)
    }

    pub fn len(&self) -> usize {
        self.inner.read().ues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().ues.is_empty()
    }

    /// Current generation, bumped on every change
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Cheap immutable view for one slot
    pub fn snapshot(&self) -> UeSnapshot {
        let inner = self.inner.read();
        UeSnapshot {
            generation: inner.generation,
            ues: Arc::clone(&inner.ues),
        }
    }

    fn check(&self, config: &UeConfig) -> UeStatus {
        match config.validate(&self.cells) {
            Ok(()) => UeStatus::Active,
            Err(e) => {
                warn!("UE {} flagged as configuration fault: {}", config.rnti, e);
                self.metrics.record_config_fault();
                UeStatus::ConfigFault
            }
        }
    }
}
