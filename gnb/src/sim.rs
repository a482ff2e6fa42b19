//! Traffic and channel simulator
//!
//! Stands in for the PHY when no peer is connected: every slot each UE
//! reports a fresh buffer occupancy and CQI on each of its carriers.

use crate::config::TrafficConfig;
use layers::mac::{BufferStatus, PhyEvent, UeConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub struct TrafficModel {
    rng: StdRng,
    dl_bytes: u32,
    ul_bytes: u32,
    cqi_min: u8,
    cqi_max: u8,
}

impl TrafficModel {
    pub fn new(config: &TrafficConfig) -> Self {
        let cqi_min = config.cqi_min.clamp(1, 15);
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            dl_bytes: config.dl_bytes,
            ul_bytes: config.ul_bytes,
            cqi_min,
            cqi_max: config.cqi_max.clamp(cqi_min, 15),
        }
    }

    /// Buffer-status reports for one slot, uniform around the configured means
    pub fn next_reports(&mut self, ues: &[UeConfig]) -> Vec<PhyEvent> {
        let mut events = Vec::new();
        for ue in ues {
            for &carrier in &ue.carriers {
                let status = BufferStatus::new(
                    self.rng.gen_range(0..=self.dl_bytes.saturating_mul(2)),
                    self.rng.gen_range(0..=self.ul_bytes.saturating_mul(2)),
                    self.rng.gen_range(self.cqi_min..=self.cqi_max),
                );
                events.push(PhyEvent::BufferStatus {
                    rnti: ue.rnti,
                    carrier,
                    status,
                });
            }
        }
        events
    }
}
