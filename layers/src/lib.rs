//! Protocol Stack Layers Library
//!
//! This crate implements the 5G NR MAC scheduler (slot scheduling, HARQ and
//! multi-carrier coordination) together with the fixed-format MAC and RLC
//! headers exchanged at the UE/PHY boundary.

pub mod mac;
pub mod rlc;

use thiserror::Error;

/// Common errors for protocol header handling
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LayerError {
    #[error("Invalid protocol data unit: {0}")]
    InvalidPdu(String),

    #[error("Truncated PDU: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
}

/// Map a streaming nom failure over `input` to a layer error
pub(crate) fn parse_error(err: nom::Err<nom::error::Error<&[u8]>>, input: &[u8]) -> LayerError {
    match err {
        nom::Err::Incomplete(nom::Needed::Size(more)) => LayerError::Truncated {
            needed: input.len() + more.get(),
            available: input.len(),
        },
        nom::Err::Incomplete(nom::Needed::Unknown) => LayerError::Truncated {
            needed: input.len() + 1,
            available: input.len(),
        },
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            let offset = input.len() - e.input.len();
            LayerError::InvalidPdu(format!("{:?} at offset {}", e.code, offset))
        }
    }
}
