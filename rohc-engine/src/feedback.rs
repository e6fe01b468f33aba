//! Feedback elements (RFC 3095 sections 5.2.1-5.2.2 and 5.7.6)
//!
//! A feedback element is an envelope octet `11110 code` (code = size, or 0
//! with an explicit size octet), followed by feedback data: the CID
//! (Add-CID octet on small-CID channels, SDVL on large-CID channels) and
//! either FEEDBACK-1 (one SN LSB octet) or FEEDBACK-2 (acktype, mode, SN
//! and options).

use crate::{
    CidType,
    context::Mode,
    crc::{self, CRC8_INIT},
    cursor::ByteCursor,
    error::{RohcError, RohcResult},
    sdvl,
};

/// Acknowledgment class of a FEEDBACK-2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FeedbackAck {
    Ack,
    Nack,
    StaticNack,
}

impl FeedbackAck {
    fn to_bits(self) -> u8 {
        match self {
            Self::Ack => 0,
            Self::Nack => 1,
            Self::StaticNack => 2,
        }
    }

    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Ack),
            1 => Some(Self::Nack),
            2 => Some(Self::StaticNack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FeedbackKind {
    /// Implicit ACK carrying 8 SN LSBs
    Feedback1 { sn_lsb: u8 },
    Feedback2 {
        ack: FeedbackAck,
        mode: Option<Mode>,
        /// SN LSBs as carried (12 bits, 20 with the SN option)
        sn: u32,
        sn_bits: u8,
        /// Cleared by the SN-NOT-VALID option
        sn_valid: bool,
    },
}

/// One parsed feedback element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Feedback {
    pub cid: u16,
    pub kind: FeedbackKind,
}

const OPT_CRC: u8 = 1;
const OPT_REJECT: u8 = 2;
const OPT_SN_NOT_VALID: u8 = 3;
const OPT_SN: u8 = 4;

fn write_envelope(data_len: usize, out: &mut Vec<u8>) {
    debug_assert!(data_len > 0 && data_len < 256, "Unexpected feedback size");
    if data_len <= 7 {
        out.push(0b1111_0000 | data_len as u8);
    } else {
        out.push(0b1111_0000);
        out.push(data_len as u8);
    }
}

fn write_cid(cid_type: CidType, cid: u16, data: &mut Vec<u8>) -> RohcResult<()> {
    match cid_type {
        CidType::Small => {
            if cid > 15 {
                return Err(RohcError::Internal("small CID out of range"));
            }
            if cid != 0 {
                data.push(0b1110_0000 | cid as u8);
            }
        }
        CidType::Large => sdvl::encode(u32::from(cid), data)?,
    }
    Ok(())
}

fn read_cid(cursor: &mut ByteCursor<'_>, cid_type: CidType) -> RohcResult<u16> {
    match cid_type {
        CidType::Small => match cursor.peek_u8() {
            Some(byte) if byte & 0b1111_0000 == 0b1110_0000 && byte != 0b1110_0000 => {
                cursor.skip(1)?;
                Ok(u16::from(byte & 0x0f))
            }
            _ => Ok(0),
        },
        CidType::Large => {
            let cid = sdvl::decode(cursor)?;
            if cid > u32::from(u16::MAX) {
                return Err(RohcError::Malformed);
            }
            Ok(cid as u16)
        }
    }
}

/// Build a complete FEEDBACK-1 element (envelope included)
pub(crate) fn build_feedback1(
    cid_type: CidType,
    cid: u16,
    sn_lsb: u8,
    out: &mut Vec<u8>,
) -> RohcResult<()> {
    let mut data = Vec::with_capacity(4);
    write_cid(cid_type, cid, &mut data)?;
    data.push(sn_lsb);
    write_envelope(data.len(), out);
    out.extend_from_slice(&data);
    Ok(())
}

/// Build a complete FEEDBACK-2 element (envelope included)
///
/// The CRC option is always attached so the compressor can trust mode
/// transitions carried here.
pub(crate) fn build_feedback2(
    cid_type: CidType,
    cid: u16,
    ack: FeedbackAck,
    mode: Mode,
    sn: u32,
    out: &mut Vec<u8>,
) -> RohcResult<()> {
    let mut data = Vec::with_capacity(8);
    write_cid(cid_type, cid, &mut data)?;

    let sn = sn & 0x000f_ffff;
    let wide = sn > 0x0fff;
    let sn_msb = if wide { (sn >> 16) as u8 } else { (sn >> 8) as u8 };
    data.push((ack.to_bits() << 6) | (mode.to_bits() << 4) | (sn_msb & 0x0f));
    data.push(if wide { (sn >> 8) as u8 } else { sn as u8 });
    if wide {
        data.push((OPT_SN << 4) | 1);
        data.push(sn as u8);
    }

    // CRC option, computed with its value octet zeroed
    data.push((OPT_CRC << 4) | 1);
    let crc_pos = data.len();
    data.push(0);
    data[crc_pos] = crc::crc8(&data, CRC8_INIT);

    write_envelope(data.len(), out);
    out.extend_from_slice(&data);
    Ok(())
}

/// Parse the data part of one feedback element (envelope already removed)
pub(crate) fn parse(data: &[u8], cid_type: CidType) -> RohcResult<Feedback> {
    let mut cursor = ByteCursor::new(data);
    if matches!(cid_type, CidType::Small) && data.len() == 1 {
        // A lone octet can only be FEEDBACK-1 for CID 0, even when its
        // value looks like an Add-CID prefix
        return Ok(Feedback {
            cid: 0,
            kind: FeedbackKind::Feedback1 {
                sn_lsb: cursor.read_u8()?,
            },
        });
    }
    let cid = read_cid(&mut cursor, cid_type)?;

    if cursor.remaining_len() == 1 {
        return Ok(Feedback {
            cid,
            kind: FeedbackKind::Feedback1 {
                sn_lsb: cursor.read_u8()?,
            },
        });
    }

    let first = cursor.read_u8()?;
    let Some(ack) = FeedbackAck::from_bits(first >> 6) else {
        return Err(RohcError::Malformed);
    };
    let mode = Mode::from_bits((first >> 4) & 0b11);
    let mut sn = (u32::from(first & 0x0f) << 8) | u32::from(cursor.read_u8()?);
    let mut sn_bits = 12u8;
    let mut sn_valid = true;
    let mut crc_field: Option<(usize, u8)> = None;

    while cursor.remaining_len() > 0 {
        let opt = cursor.read_u8()?;
        let (opt_type, opt_len) = (opt >> 4, usize::from(opt & 0x0f));
        match opt_type {
            OPT_CRC if opt_len == 1 => {
                crc_field = Some((cursor.pos(), cursor.read_u8()?));
            }
            OPT_SN if opt_len == 1 => {
                sn = (sn << 8) | u32::from(cursor.read_u8()?);
                sn_bits += 8;
            }
            OPT_SN_NOT_VALID => {
                sn_valid = false;
                cursor.skip(opt_len)?;
            }
            OPT_REJECT => {
                cursor.skip(opt_len)?;
            }
            _ => {
                // Unknown or ill-sized option: skip its payload and keep
                // the rest of the element usable
                log::debug!("ignoring feedback option {opt_type} (len {opt_len})");
                cursor.skip(opt_len)?;
            }
        }
    }

    if let Some((pos, value)) = crc_field {
        let mut zeroed = data.to_vec();
        zeroed[pos] = 0;
        if crc::crc8(&zeroed, CRC8_INIT) != value {
            return Err(RohcError::Malformed);
        }
    }

    Ok(Feedback {
        cid,
        kind: FeedbackKind::Feedback2 {
            ack,
            mode,
            sn,
            sn_bits,
            sn_valid,
        },
    })
}

/// Split one enveloped feedback element off the cursor, returning its
/// data part
pub(crate) fn read_element<'a>(cursor: &mut ByteCursor<'a>) -> RohcResult<&'a [u8]> {
    let envelope = cursor.read_u8()?;
    debug_assert_eq!(envelope & 0b1111_1000, 0b1111_0000, "Not a feedback envelope");
    let code = envelope & 0b0000_0111;
    let size = if code == 0 {
        usize::from(cursor.read_u8()?)
    } else {
        usize::from(code)
    };
    if size == 0 {
        return Err(RohcError::Malformed);
    }
    cursor.take(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(element: &[u8], cid_type: CidType) -> Feedback {
        let mut cursor = ByteCursor::new(element);
        let data = read_element(&mut cursor).unwrap();
        assert_eq!(cursor.remaining_len(), 0);
        parse(data, cid_type).unwrap()
    }

    #[test]
    fn test_feedback1_small_cid_zero() {
        let mut element = Vec::new();
        build_feedback1(CidType::Small, 0, 42, &mut element).unwrap();
        assert_eq!(element, [0xf1, 42]);
        let parsed = round_trip(&element, CidType::Small);
        assert_eq!(parsed.cid, 0);
        assert_eq!(parsed.kind, FeedbackKind::Feedback1 { sn_lsb: 42 });
    }

    #[test]
    fn test_feedback2_round_trip_with_add_cid() {
        let mut element = Vec::new();
        build_feedback2(
            CidType::Small,
            7,
            FeedbackAck::Ack,
            Mode::Reliable,
            42,
            &mut element,
        )
        .unwrap();
        let parsed = round_trip(&element, CidType::Small);
        assert_eq!(parsed.cid, 7);
        let FeedbackKind::Feedback2 {
            ack,
            mode,
            sn,
            sn_bits,
            sn_valid,
        } = parsed.kind
        else {
            panic!("expected FEEDBACK-2");
        };
        assert_eq!(ack, FeedbackAck::Ack);
        assert_eq!(mode, Some(Mode::Reliable));
        assert_eq!(sn, 42);
        assert_eq!(sn_bits, 12);
        assert!(sn_valid);
    }

    #[test]
    fn test_feedback2_wide_sn_uses_option() {
        let mut element = Vec::new();
        build_feedback2(
            CidType::Large,
            500,
            FeedbackAck::Nack,
            Mode::Optimistic,
            0x1_2345,
            &mut element,
        )
        .unwrap();
        let parsed = round_trip(&element, CidType::Large);
        assert_eq!(parsed.cid, 500);
        let FeedbackKind::Feedback2 { sn, sn_bits, .. } = parsed.kind else {
            panic!("expected FEEDBACK-2");
        };
        assert_eq!(sn, 0x1_2345);
        assert_eq!(sn_bits, 20);
    }

    #[test]
    fn test_corrupt_crc_rejected() {
        let mut element = Vec::new();
        build_feedback2(
            CidType::Small,
            0,
            FeedbackAck::Ack,
            Mode::Optimistic,
            7,
            &mut element,
        )
        .unwrap();
        // Flip an SN bit after the CRC was computed
        let len = element.len();
        element[len - 3] ^= 0x01;
        let mut cursor = ByteCursor::new(&element);
        let data = read_element(&mut cursor).unwrap();
        assert_eq!(parse(data, CidType::Small), Err(RohcError::Malformed));
    }

    #[test]
    fn test_unknown_option_skipped() {
        // FEEDBACK-2 for CID 0, ACK, mode O, SN 5, then a CLOCK option
        let data = [0x20u8, 0x05, 0x51, 0x10];
        let parsed = parse(&data, CidType::Small).unwrap();
        let FeedbackKind::Feedback2 { sn, .. } = parsed.kind else {
            panic!("expected FEEDBACK-2");
        };
        assert_eq!(sn, 5);
    }
}
