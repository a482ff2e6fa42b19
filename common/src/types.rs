//! Common Types for the 5G MAC scheduler
//!
//! Defines fundamental types used throughout the protocol stack

use serde::{Deserialize, Serialize};
use num_derive::{FromPrimitive, ToPrimitive};
use std::fmt;
use std::ops::Add;
use std::time::Duration;

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// First C-RNTI value handed out by the scheduler
    pub const MIN_CRNTI: u16 = 0x0001;
    /// Last C-RNTI value (0xFFF0..=0xFFFF are reserved, TS 38.321 Table 7.1-1)
    pub const MAX_CRNTI: u16 = 0xFFEF;

    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }

    /// Whether this value may identify a connected UE
    pub fn is_crnti(&self) -> bool {
        (Self::MIN_CRNTI..=Self::MAX_CRNTI).contains(&self.0)
    }
}

impl fmt::Display for Rnti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellId(pub u16);

/// Component carrier index, dense from 0 within one scheduler instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct CarrierIndex(pub u8);

impl CarrierIndex {
    /// Position of this carrier in per-carrier tables
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CarrierIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cc{}", self.0)
    }
}

/// Link direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// gNB to UE
    Downlink,
    /// UE to gNB
    Uplink,
}

impl Direction {
    /// Both directions in scheduling order
    pub const ALL: [Direction; 2] = [Direction::Downlink, Direction::Uplink];
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Downlink => f.write_str("DL"),
            Direction::Uplink => f.write_str("UL"),
        }
    }
}

/// Absolute slot counter since scheduler start.
///
/// Frame/slot numbering on the air interface wraps every 1024 frames; the
/// scheduler keeps a monotonic count so HARQ age arithmetic never wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SlotIndex(pub u64);

impl SlotIndex {
    /// Create a slot index
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw counter value
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The following slot
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Slots elapsed since `earlier`, `None` if `earlier` is in the future
    pub fn since(&self, earlier: SlotIndex) -> Option<u64> {
        self.0.checked_sub(earlier.0)
    }

    /// System frame number (0..1024) and slot within the frame
    pub fn frame_and_slot(&self, scs: SubcarrierSpacing) -> (u32, u32) {
        let per_frame = scs.slots_per_frame() as u64;
        let sfn = (self.0 / per_frame) % 1024;
        (sfn as u32, (self.0 % per_frame) as u32)
    }
}

impl Add<u64> for SlotIndex {
    type Output = SlotIndex;

    fn add(self, rhs: u64) -> SlotIndex {
        SlotIndex(self.0 + rhs)
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subcarrier spacing values in kHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum SubcarrierSpacing {
    /// 15 kHz
    Scs15 = 15,
    /// 30 kHz
    Scs30 = 30,
    /// 60 kHz
    Scs60 = 60,
    /// 120 kHz
    Scs120 = 120,
    /// 240 kHz
    Scs240 = 240,
}

impl SubcarrierSpacing {
    /// Numerology index mu (TS 38.211 Table 4.2-1)
    pub fn numerology(&self) -> u32 {
        match self {
            SubcarrierSpacing::Scs15 => 0,
            SubcarrierSpacing::Scs30 => 1,
            SubcarrierSpacing::Scs60 => 2,
            SubcarrierSpacing::Scs120 => 3,
            SubcarrierSpacing::Scs240 => 4,
        }
    }

    /// Number of slots per 10 ms frame
    pub fn slots_per_frame(&self) -> u32 {
        10 << self.numerology()
    }

    /// Slot duration (1 ms / 2^mu)
    pub fn slot_duration(&self) -> Duration {
        Duration::from_nanos(1_000_000 >> self.numerology())
    }
}

/// Bandwidth values in MHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bandwidth {
    /// 5 MHz
    Bw5,
    /// 10 MHz
    Bw10,
    /// 15 MHz
    Bw15,
    /// 20 MHz
    Bw20,
    /// 25 MHz
    Bw25,
    /// 30 MHz
    Bw30,
    /// 40 MHz
    Bw40,
    /// 50 MHz
    Bw50,
    /// 60 MHz
    Bw60,
    /// 80 MHz
    Bw80,
    /// 100 MHz
    Bw100,
}

impl Bandwidth {
    /// Parse a channel bandwidth given in MHz
    pub fn from_mhz(mhz: u32) -> Option<Self> {
        let bw = match mhz {
            5 => Bandwidth::Bw5,
            10 => Bandwidth::Bw10,
            15 => Bandwidth::Bw15,
            20 => Bandwidth::Bw20,
            25 => Bandwidth::Bw25,
            30 => Bandwidth::Bw30,
            40 => Bandwidth::Bw40,
            50 => Bandwidth::Bw50,
            60 => Bandwidth::Bw60,
            80 => Bandwidth::Bw80,
            100 => Bandwidth::Bw100,
            _ => return None,
        };
        Some(bw)
    }

    /// Get bandwidth in MHz
    pub fn mhz(&self) -> u32 {
        match self {
            Bandwidth::Bw5 => 5,
            Bandwidth::Bw10 => 10,
            Bandwidth::Bw15 => 15,
            Bandwidth::Bw20 => 20,
            Bandwidth::Bw25 => 25,
            Bandwidth::Bw30 => 30,
            Bandwidth::Bw40 => 40,
            Bandwidth::Bw50 => 50,
            Bandwidth::Bw60 => 60,
            Bandwidth::Bw80 => 80,
            Bandwidth::Bw100 => 100,
        }
    }

    /// Maximum transmission bandwidth in PRBs for FR1 (TS 38.101-1 Table 5.3.2-1).
    ///
    /// Returns `None` for combinations the table leaves undefined.
    pub fn max_prbs(&self, scs: SubcarrierSpacing) -> Option<u16> {
        let nrb = match (scs, self) {
            (SubcarrierSpacing::Scs15, Bandwidth::Bw5) => 25,
            (SubcarrierSpacing::Scs15, Bandwidth::Bw10) => 52,
            (SubcarrierSpacing::Scs15, Bandwidth::Bw15) => 79,
            (SubcarrierSpacing::Scs15, Bandwidth::Bw20) => 106,
            (SubcarrierSpacing::Scs15, Bandwidth::Bw25) => 133,
            (SubcarrierSpacing::Scs15, Bandwidth::Bw30) => 160,
            (SubcarrierSpacing::Scs15, Bandwidth::Bw40) => 216,
            (SubcarrierSpacing::Scs15, Bandwidth::Bw50) => 270,
            (SubcarrierSpacing::Scs30, Bandwidth::Bw5) => 11,
            (SubcarrierSpacing::Scs30, Bandwidth::Bw10) => 24,
            (SubcarrierSpacing::Scs30, Bandwidth::Bw15) => 38,
            (SubcarrierSpacing::Scs30, Bandwidth::Bw20) => 51,
            (SubcarrierSpacing::Scs30, Bandwidth::Bw25) => 65,
            (SubcarrierSpacing::Scs30, Bandwidth::Bw30) => 78,
            (SubcarrierSpacing::Scs30, Bandwidth::Bw40) => 106,
            (SubcarrierSpacing::Scs30, Bandwidth::Bw50) => 133,
            (SubcarrierSpacing::Scs30, Bandwidth::Bw60) => 162,
            (SubcarrierSpacing::Scs30, Bandwidth::Bw80) => 217,
            (SubcarrierSpacing::Scs30, Bandwidth::Bw100) => 273,
            (SubcarrierSpacing::Scs60, Bandwidth::Bw10) => 11,
            (SubcarrierSpacing::Scs60, Bandwidth::Bw15) => 18,
            (SubcarrierSpacing::Scs60, Bandwidth::Bw20) => 24,
            (SubcarrierSpacing::Scs60, Bandwidth::Bw25) => 31,
            (SubcarrierSpacing::Scs60, Bandwidth::Bw30) => 38,
            (SubcarrierSpacing::Scs60, Bandwidth::Bw40) => 51,
            (SubcarrierSpacing::Scs60, Bandwidth::Bw50) => 65,
            (SubcarrierSpacing::Scs60, Bandwidth::Bw60) => 79,
            (SubcarrierSpacing::Scs60, Bandwidth::Bw80) => 107,
            (SubcarrierSpacing::Scs60, Bandwidth::Bw100) => 135,
            _ => return None,
        };
        Some(nrb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_rnti_range() {
        assert!(Rnti(0x4601).is_crnti());
        assert!(!Rnti(0).is_crnti());
        assert!(!Rnti(0xFFFF).is_crnti());
        assert_eq!(Rnti(0x4601).to_string(), "0x4601");
    }

    #[test]
    fn test_bandwidth_conversion() {
        assert_eq!(Bandwidth::from_mhz(20), Some(Bandwidth::Bw20));
        assert_eq!(Bandwidth::from_mhz(21), None);
        assert_eq!(Bandwidth::Bw100.mhz(), 100);
    }

    #[test]
    fn test_max_prbs() {
        assert_eq!(Bandwidth::Bw10.max_prbs(SubcarrierSpacing::Scs15), Some(52));
        assert_eq!(Bandwidth::Bw100.max_prbs(SubcarrierSpacing::Scs30), Some(273));
        assert_eq!(Bandwidth::Bw100.max_prbs(SubcarrierSpacing::Scs15), None);
    }

    #[test]
    fn test_numerology() {
        let scs = SubcarrierSpacing::from_u32(30).unwrap();
        assert_eq!(scs, SubcarrierSpacing::Scs30);
        assert_eq!(scs.slots_per_frame(), 20);
        assert_eq!(scs.slot_duration(), Duration::from_micros(500));
        assert!(SubcarrierSpacing::from_u32(45).is_none());
    }

    #[test]
    fn test_slot_index_arithmetic() {
        let slot = SlotIndex::new(10);
        assert_eq!(slot.next(), SlotIndex(11));
        assert_eq!((slot + 4).since(slot), Some(4));
        assert_eq!(slot.since(slot + 1), None);

        // 30 kHz: 20 slots per frame, SFN wraps at 1024
        let slot = SlotIndex::new(1024 * 20 + 45);
        assert_eq!(slot.frame_and_slot(SubcarrierSpacing::Scs30), (2, 5));
    }
}
