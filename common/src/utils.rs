//! Common Utilities
//!
//! Provides utility functions used across the scheduler workspace

/// Convert a byte slice to hex string for debugging
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Integer division rounding up, `0` when the divisor is zero
pub fn div_ceil(value: u32, divisor: u32) -> u32 {
    if divisor == 0 {
        return 0;
    }
    value.div_ceil(divisor)
}
