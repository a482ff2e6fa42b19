//! Scheduler Configuration Structures
//!
//! Loaded from YAML or TOML, picked by file extension. Every section except
//! `cells` may be omitted.

use anyhow::{anyhow, Context};
use common::types::{Bandwidth, CarrierIndex, CellId, Rnti, SubcarrierSpacing};
use layers::mac::{CellParams, CellRegistry, SchedulerArgs, UeCapabilities, UeConfig};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedConfig {
    /// Scheduler runtime
    #[serde(default)]
    pub scheduler: SchedulerSection,
    /// Serving cells in carrier order
    pub cells: Vec<CellConfig>,
    /// UEs attached at startup
    #[serde(default)]
    pub ues: Vec<UeSection>,
    /// Traffic and channel simulator
    #[serde(default)]
    pub traffic: TrafficConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// Scheduler runtime configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerSection {
    /// Carrier worker threads, defaults to one per carrier
    pub nof_workers: Option<usize>,
    /// Barrier wait per slot in microseconds, defaults to the cell budgets
    pub slot_deadline_us: Option<u64>,
    /// Stop after this many slots; runs until interrupted when absent
    pub nof_slots: Option<u64>,
    /// Pace slots to the air-interface slot period
    #[serde(default = "default_true")]
    pub realtime: bool,
    /// ZMQ endpoint slot results are pushed to
    pub publish_addr: Option<String>,
    /// ZMQ endpoint PHY messages are pulled from
    pub feedback_addr: Option<String>,
}

/// Cell configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CellConfig {
    /// Cell ID
    pub cell_id: u16,
    /// Channel bandwidth in MHz
    #[serde(rename = "channel_bandwidth_MHz", default = "default_bandwidth")]
    pub channel_bandwidth_mhz: u32,
    /// Common subcarrier spacing in kHz
    #[serde(default = "default_scs")]
    pub common_scs: u32,
    /// Restrict the schedulable grid
    pub nof_prbs: Option<u16>,
    #[serde(default = "default_harq_processes")]
    pub nof_harq_processes: u8,
    #[serde(default = "default_harq_rtt")]
    pub harq_rtt_slots: u32,
    #[serde(default = "default_nof_cces")]
    pub nof_cces: u16,
    /// Compute budget per slot in microseconds, defaults to the slot period
    pub deadline_budget_us: Option<u64>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            nof_workers: None,
            slot_deadline_us: None,
            nof_slots: None,
            realtime: true,
            publish_addr: None,
            feedback_addr: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_bandwidth() -> u32 {
    20
}

fn default_scs() -> u32 {
    30
}

fn default_harq_processes() -> u8 {
    16
}

fn default_harq_rtt() -> u32 {
    layers::mac::cell::DEFAULT_HARQ_RTT_SLOTS
}

fn default_nof_cces() -> u16 {
    layers::mac::cell::DEFAULT_NOF_CCES
}

/// UE configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UeSection {
    pub rnti: u16,
    /// Serving carrier indices, primary first
    pub carriers: Vec<u8>,
    #[serde(default = "default_max_harq_tx")]
    pub max_harq_tx: u8,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub qam256: bool,
}

fn default_max_harq_tx() -> u8 {
    layers::mac::ue::DEFAULT_MAX_HARQ_TX
}

/// Traffic simulator configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrafficConfig {
    /// Mean DL buffer reported per UE and carrier
    #[serde(default = "default_dl_bytes")]
    pub dl_bytes: u32,
    /// Mean UL buffer reported per UE and carrier
    #[serde(default = "default_ul_bytes")]
    pub ul_bytes: u32,
    #[serde(default = "default_cqi_min")]
    pub cqi_min: u8,
    #[serde(default = "default_cqi_max")]
    pub cqi_max: u8,
    #[serde(default = "default_bler")]
    pub dl_bler: f64,
    #[serde(default = "default_bler")]
    pub ul_bler: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            dl_bytes: default_dl_bytes(),
            ul_bytes: default_ul_bytes(),
            cqi_min: default_cqi_min(),
            cqi_max: default_cqi_max(),
            dl_bler: default_bler(),
            ul_bler: default_bler(),
            seed: default_seed(),
        }
    }
}

fn default_dl_bytes() -> u32 {
    4000
}

fn default_ul_bytes() -> u32 {
    1000
}

fn default_cqi_min() -> u8 {
    7
}

fn default_cqi_max() -> u8 {
    15
}

fn default_bler() -> f64 {
    0.1
}

fn default_seed() -> u64 {
    1
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level filter, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Seconds between metric reports
    #[serde(default = "default_stats_interval")]
    pub stats_interval_s: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stats_interval_s: default_stats_interval(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval() -> u64 {
    5
}

impl SchedConfig {
    /// Load configuration from a `.yml`/`.yaml` or `.toml` file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => Self::from_yaml(&contents),
            Some("toml") => Self::from_toml(&contents),
            other => Err(anyhow!("Unsupported configuration format: {:?}", other)),
        }
    }

    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Validated cell registry in carrier order
    pub fn cell_registry(&self) -> anyhow::Result<CellRegistry> {
        let mut cells = Vec::with_capacity(self.cells.len());
        for (i, cell) in self.cells.iter().enumerate() {
            let index = u8::try_from(i)
                .map_err(|_| anyhow!("Too many cells: {}", self.cells.len()))?;
            let carrier = CarrierIndex(index);
            let bandwidth = Bandwidth::from_mhz(cell.channel_bandwidth_mhz)
                .ok_or_else(|| anyhow!("Invalid bandwidth: {} MHz", cell.channel_bandwidth_mhz))?;
            let scs = SubcarrierSpacing::from_u32(cell.common_scs)
                .ok_or_else(|| anyhow!("Invalid subcarrier spacing: {} kHz", cell.common_scs))?;

            let mut params = CellParams::new(carrier, CellId(cell.cell_id), scs, bandwidth)?
                .with_harq_processes(cell.nof_harq_processes)
                .with_harq_rtt(cell.harq_rtt_slots)
                .with_cces(cell.nof_cces);
            if let Some(nof_prbs) = cell.nof_prbs {
                params = params.with_prbs(nof_prbs);
            }
            if let Some(us) = cell.deadline_budget_us {
                params = params.with_deadline_budget(Duration::from_micros(us));
            }
            cells.push(params);
        }
        Ok(CellRegistry::new(cells)?)
    }

    /// Startup UE configurations
    pub fn ue_configs(&self) -> Vec<UeConfig> {
        self.ues
            .iter()
            .map(|ue| {
                let mut capabilities = UeCapabilities::CARRIER_AGGREGATION;
                if ue.qam256 {
                    capabilities |= UeCapabilities::QAM256;
                }
                let carriers = ue.carriers.iter().copied().map(CarrierIndex).collect();
                UeConfig::new(Rnti(ue.rnti), carriers)
                    .with_max_harq_tx(ue.max_harq_tx)
                    .with_priority(ue.priority)
                    .with_capabilities(capabilities)
            })
            .collect()
    }

    pub fn scheduler_args(&self) -> SchedulerArgs {
        SchedulerArgs {
            nof_workers: self.scheduler.nof_workers.unwrap_or(self.cells.len()),
            slot_deadline: self.scheduler.slot_deadline_us.map(Duration::from_micros),
        }
    }
}
