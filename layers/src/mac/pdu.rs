//! MAC PDU subheaders (TS 38.321 6.1.2)
//!
//! Three subheader layouts exist on the DL-SCH:
//! - `R/R/LCID` (1 byte) for padding and fixed-size MAC CEs
//! - `R/F/LCID/L` with an 8-bit L (F=0, 2 bytes)
//! - `R/F/LCID/L` with a 16-bit L (F=1, 3 bytes)
//!
//! Whether L is present is a property of the LCID, never of the data.

use crate::{parse_error, LayerError};
use bytes::{BufMut, Bytes, BytesMut};
use nom::number::streaming::{be_u16, be_u8};
use nom::IResult;

/// Common control channel
pub const LCID_CCCH: u8 = 0;
/// Last dedicated logical channel
pub const LCID_MAX_DRB: u8 = 32;
pub const LCID_TIMING_ADVANCE: u8 = 61;
pub const LCID_CONTENTION_RESOLUTION: u8 = 62;
pub const LCID_PADDING: u8 = 63;

const LCID_MASK: u8 = 0x3F;
const F_BIT: u8 = 0x40;

/// Payload size of a fixed-size DL MAC CE, `None` for variable-size LCIDs
pub fn fixed_ce_size(lcid: u8) -> Option<usize> {
    let size = match lcid {
        47 => 2, // recommended bit rate
        48 => 2, // SP ZP CSI-RS resource set
        49 => 3, // PUCCH spatial relation
        51 => 2, // SP CSI reporting on PUCCH
        52 => 2, // TCI state indication for PDCCH
        56 => 1, // duplication activation
        57 => 4, // SCell activation, four octets
        58 => 1, // SCell activation, one octet
        59 | 60 => 0, // (long) DRX command
        LCID_TIMING_ADVANCE => 1,
        LCID_CONTENTION_RESOLUTION => 6,
        _ => return None,
    };
    Some(size)
}

/// Whether subheaders of this LCID carry an L field
pub fn has_length_field(lcid: u8) -> bool {
    lcid != LCID_PADDING && fixed_ce_size(lcid).is_none()
}

/// MAC subheader structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacSubheader {
    /// Logical channel ID
    pub lcid: u8,
    /// Length field
    pub length: Option<u16>,
}

impl MacSubheader {
    /// Subheader for an SDU or variable-size CE
    pub fn sdu(lcid: u8, length: u16) -> Self {
        Self {
            lcid,
            length: Some(length),
        }
    }

    /// Subheader without L (padding, fixed-size CE)
    pub fn fixed(lcid: u8) -> Self {
        Self { lcid, length: None }
    }

    /// Encoded size in bytes
    pub fn len(&self) -> usize {
        match self.length {
            None => 1,
            Some(l) if l <= u8::MAX as u16 => 2,
            Some(_) => 3,
        }
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Size of the payload that follows the subheader, `None` for padding
    pub fn payload_len(&self) -> Option<usize> {
        match self.length {
            Some(l) => Some(l as usize),
            None => fixed_ce_size(self.lcid),
        }
    }

    /// Append the subheader, picking the shortest L encoding
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), LayerError> {
        if self.lcid > LCID_MASK {
            return Err(LayerError::InvalidPdu(format!("LCID {} out of range", self.lcid)));
        }
        if has_length_field(self.lcid) != self.length.is_some() {
            return Err(LayerError::InvalidPdu(format!(
                "LCID {} {} an L field",
                self.lcid,
                if self.length.is_some() { "takes no" } else { "requires" }
            )));
        }

        match self.length {
            None => buf.put_u8(self.lcid),
            Some(l) if l <= u8::MAX as u16 => {
                buf.put_u8(self.lcid);
                buf.put_u8(l as u8);
            }
            Some(l) => {
                buf.put_u8(F_BIT | self.lcid);
                buf.put_u16(l);
            }
        }
        Ok(())
    }

    /// Parse one subheader, returning it with the number of bytes consumed
    pub fn decode(data: &[u8]) -> Result<(Self, usize), LayerError> {
        let (rest, header) = parse_subheader(data).map_err(|e| parse_error(e, data))?;
        Ok((header, data.len() - rest.len()))
    }
}

fn parse_subheader(input: &[u8]) -> IResult<&[u8], MacSubheader> {
    let (input, first) = be_u8(input)?;
    let lcid = first & LCID_MASK;
    if !has_length_field(lcid) {
        return Ok((input, MacSubheader::fixed(lcid)));
    }

    let (input, length) = if first & F_BIT != 0 {
        be_u16(input)?
    } else {
        let (input, l) = be_u8(input)?;
        (input, l as u16)
    };
    Ok((input, MacSubheader::sdu(lcid, length)))
}

/// MAC Service Data Unit (SDU) or control element with its subheader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacSdu {
    /// Subheader
    pub subheader: MacSubheader,
    /// Payload data
    pub data: Bytes,
}

/// Split a MAC PDU into its subPDUs; trailing padding is dropped
pub fn demux_pdu(pdu: &Bytes) -> Result<Vec<MacSdu>, LayerError> {
    let mut sdus = Vec::new();
    let mut offset = 0;

    while offset < pdu.len() {
        let (subheader, consumed) = MacSubheader::decode(&pdu[offset..])?;
        offset += consumed;
        let Some(len) = subheader.payload_len() else {
            break;
        };
        if offset + len > pdu.len() {
            return Err(LayerError::Truncated {
                needed: offset + len,
                available: pdu.len(),
            });
        }
        sdus.push(MacSdu {
            subheader,
            data: pdu.slice(offset..offset + len),
        });
        offset += len;
    }
    Ok(sdus)
}

/// Build a MAC PDU of exactly `tbs` bytes from `(lcid, payload)` pairs,
/// filling the remainder with a padding subPDU
pub fn mux_pdu(sdus: &[(u8, &[u8])], tbs: usize) -> Result<Bytes, LayerError> {
    let mut buf = BytesMut::with_capacity(tbs);
    for (lcid, payload) in sdus {
        let length = u16::try_from(payload.len())
            .map_err(|_| LayerError::InvalidPdu(format!("SDU of {} bytes", payload.len())))?;
        MacSubheader::sdu(*lcid, length).encode(&mut buf)?;
        buf.put_slice(payload);
    }
    if buf.len() > tbs {
        return Err(LayerError::InvalidPdu(format!(
            "{} bytes of subPDUs exceed TBS {}",
            buf.len(),
            tbs
        )));
    }
    if buf.len() < tbs {
        buf.put_u8(LCID_PADDING);
        buf.resize(tbs, 0);
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(header: MacSubheader) -> Vec<u8> {
        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn test_subheader_without_length() {
        let bytes = encoded(MacSubheader::fixed(LCID_TIMING_ADVANCE));
        assert_eq!(bytes, vec![0x3D]);
        assert_eq!(MacSubheader::decode(&bytes), Ok((MacSubheader::fixed(LCID_TIMING_ADVANCE), 1)));
    }

    #[test]
    fn test_subheader_with_8bit_length() {
        let header = MacSubheader::sdu(4, 200);
        let bytes = encoded(header);
        assert_eq!(bytes, vec![0x04, 0xC8]);
        assert_eq!(header.len(), 2);
        assert_eq!(MacSubheader::decode(&bytes), Ok((header, 2)));
    }

    #[test]
    fn test_subheader_with_16bit_length() {
        let header = MacSubheader::sdu(1, 1500);
        let bytes = encoded(header);
        assert_eq!(bytes, vec![0x41, 0x05, 0xDC]);
        assert_eq!(MacSubheader::decode(&bytes), Ok((header, 3)));
    }

    #[test]
    fn test_length_presence_follows_lcid() {
        let mut buf = BytesMut::new();
        assert!(MacSubheader::fixed(4).encode(&mut buf).is_err());
        assert!(MacSubheader::sdu(LCID_PADDING, 3).encode(&mut buf).is_err());
        assert!(MacSubheader::sdu(64, 3).encode(&mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_truncated_subheader() {
        assert_eq!(
            MacSubheader::decode(&[0x41, 0x05]),
            Err(LayerError::Truncated { needed: 3, available: 2 })
        );
        assert_eq!(
            MacSubheader::decode(&[]),
            Err(LayerError::Truncated { needed: 1, available: 0 })
        );
    }

    #[test]
    fn test_mux_demux_with_padding() {
        let bulk = [0xAAu8; 300];
        let pdu = mux_pdu(&[(LCID_CCCH, &b"hello"[..]), (5, &bulk[..])], 320).unwrap();
        assert_eq!(pdu.len(), 320);

        let sdus = demux_pdu(&pdu).unwrap();
        assert_eq!(sdus.len(), 2);
        assert_eq!(sdus[0].subheader, MacSubheader::sdu(LCID_CCCH, 5));
        assert_eq!(&sdus[0].data[..], b"hello");
        assert_eq!(sdus[1].subheader.length, Some(300));
        assert_eq!(sdus[1].data.len(), 300);

        assert!(mux_pdu(&[(1, &bulk[..10])], 5).is_err());
    }

    #[test]
    fn test_demux_fixed_ce() {
        let pdu = Bytes::from_static(&[0x3E, 1, 2, 3, 4, 5, 6, 0x3F, 0, 0]);
        let sdus = demux_pdu(&pdu).unwrap();
        assert_eq!(sdus.len(), 1);
        assert_eq!(sdus[0].subheader.lcid, LCID_CONTENTION_RESOLUTION);
        assert_eq!(&sdus[0].data[..], &[1, 2, 3, 4, 5, 6]);

        let short = Bytes::from_static(&[0x02, 0x08, 0xFF]);
        assert_eq!(
            demux_pdu(&short),
            Err(LayerError::Truncated { needed: 10, available: 3 })
        );
    }
}
