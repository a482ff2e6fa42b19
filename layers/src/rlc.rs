//! Radio Link Control (RLC) Layer Implementation
//!
//! UM data PDU header (TS 36.322 6.2.1.3): framing info, extension bit and
//! sequence number, followed by an optional list of 11-bit length indicators
//! packed two per three bytes.

use crate::{parse_error, LayerError};
use bytes::{BufMut, BytesMut};
use nom::number::streaming::{be_u16, be_u8};
use nom::IResult;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

/// Largest value an 11-bit length indicator holds
pub const MAX_LI: u16 = 0x7FF;

/// SN field length of a UM entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UmSnSize {
    /// One-byte fixed header: FI(2) E(1) SN(5)
    Bits5,
    /// Two-byte fixed header: R(3) FI(2) E(1) SN(10)
    Bits10,
}

impl UmSnSize {
    pub fn max_sn(&self) -> u16 {
        match self {
            UmSnSize::Bits5 => 0x1F,
            UmSnSize::Bits10 => 0x3FF,
        }
    }

    /// Fixed header length in bytes
    pub fn fixed_header_len(&self) -> usize {
        match self {
            UmSnSize::Bits5 => 1,
            UmSnSize::Bits10 => 2,
        }
    }
}

/// Where the PDU's first and last bytes sit within their SDUs
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum FramingInfo {
    /// Starts and ends on SDU boundaries
    Complete = 0,
    /// Starts an SDU, ends inside one
    FirstSegment = 1,
    /// Starts inside an SDU, ends on a boundary
    LastSegment = 2,
    /// Starts and ends inside SDUs
    MiddleSegment = 3,
}

/// RLC UMD PDU header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UmdPduHeader {
    pub fi: FramingInfo,
    pub sn: u16,
    /// Length indicators, one per SDU (segment) except the last
    pub li: Vec<u16>,
}

impl UmdPduHeader {
    /// Encoded length in bytes
    pub fn len(&self, sn_size: UmSnSize) -> usize {
        let li_bits = self.li.len() * 12;
        sn_size.fixed_header_len() + li_bits.div_ceil(8)
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Append the header to `buf`
    pub fn encode(&self, sn_size: UmSnSize, buf: &mut BytesMut) -> Result<(), LayerError> {
        if self.sn > sn_size.max_sn() {
            return Err(LayerError::InvalidPdu(format!("SN {} exceeds {:?}", self.sn, sn_size)));
        }
        if let Some(li) = self.li.iter().find(|&&li| li == 0 || li > MAX_LI) {
            return Err(LayerError::InvalidPdu(format!("length indicator {} out of range", li)));
        }

        let fi = self.fi.to_u8().unwrap_or_default();
        let e = u8::from(!self.li.is_empty());
        match sn_size {
            UmSnSize::Bits5 => buf.put_u8((fi << 6) | (e << 5) | self.sn as u8),
            UmSnSize::Bits10 => {
                buf.put_u8((fi << 3) | (e << 2) | (self.sn >> 8) as u8);
                buf.put_u8(self.sn as u8);
            }
        }

        let last = self.li.len().saturating_sub(1);
        for (pair, chunk) in self.li.chunks(2).enumerate() {
            let first = pair * 2;
            let e1 = u32::from(first < last);
            let li1 = chunk[0] as u32;
            match chunk.get(1) {
                Some(&li2) => {
                    let e2 = u32::from(first + 1 < last);
                    let packed = (e1 << 23) | (li1 << 12) | (e2 << 11) | li2 as u32;
                    buf.put_uint(packed as u64, 3);
                }
                // Odd count: the last LI is padded to a byte boundary
                None => buf.put_u16(((e1 << 15) | (li1 << 4)) as u16),
            }
        }
        Ok(())
    }

    /// Parse a header, returning it with the number of bytes consumed
    pub fn decode(data: &[u8], sn_size: UmSnSize) -> Result<(Self, usize), LayerError> {
        let (rest, header) = parse_umd_header(data, sn_size).map_err(|e| parse_error(e, data))?;
        Ok((header, data.len() - rest.len()))
    }
}

fn parse_umd_header(input: &[u8], sn_size: UmSnSize) -> IResult<&[u8], UmdPduHeader> {
    let (mut input, (fi, mut more, sn)) = match sn_size {
        UmSnSize::Bits5 => {
            let (input, b0) = be_u8(input)?;
            (input, (b0 >> 6, b0 & 0x20 != 0, (b0 & 0x1F) as u16))
        }
        UmSnSize::Bits10 => {
            let (input, word) = be_u16(input)?;
            let b0 = (word >> 8) as u8;
            (input, ((b0 >> 3) & 0x03, b0 & 0x04 != 0, word & 0x3FF))
        }
    };

    let mut li = Vec::new();
    while more {
        // E1 LI1 and either E2 plus the top of LI2, or padding
        let (rest, word) = be_u16(input)?;
        li.push((word >> 4) & MAX_LI);
        if word & 0x8000 == 0 {
            input = rest;
            break;
        }
        let (rest, low) = be_u8(rest)?;
        li.push(((word & 0x07) << 8) | low as u16);
        more = word & 0x08 != 0;
        input = rest;
    }

    let fi = FramingInfo::from_u8(fi).unwrap_or(FramingInfo::Complete);
    Ok((input, UmdPduHeader { fi, sn, li }))
}
