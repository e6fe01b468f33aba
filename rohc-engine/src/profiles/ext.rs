//! Extension codec for UOR-2* and UO-1-ID (RFC 3095 section 5.7.5)
//!
//! Extensions 0-2 add SN LSBs plus bits of one or two more fields; which
//! fields those are depends on the base packet type (TS for UOR-2 and
//! UOR-2-TS, IP-ID for UOR-2-ID and the non-RTP UOR-2). Extension 3 is
//! flag-driven and can update nearly everything. Bits carried in an
//! extension are less significant than bits in the base header.

use crate::{
    context::Mode,
    cursor::ByteCursor,
    error::{RohcError, RohcResult},
    profiles::chains,
    sdvl,
};

/// Timestamp LSBs carried by EXT-3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ext3Ts {
    pub value: u32,
    /// LSB count, one of 7/14/21/29 per the SDVL length
    pub k: u8,
    /// Whether `value` is in the scaled domain (Tsc flag)
    pub scaled: bool,
}

/// Per-IP-header updates carried by EXT-3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ext3IpFields {
    pub tos: Option<u8>,
    pub ttl: Option<u8>,
    pub proto: Option<u8>,
    pub df: bool,
    pub nbo: bool,
    pub rnd: bool,
}

/// RTP flags and fields of EXT-3
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Ext3Rtp {
    pub mode: Mode,
    pub pt: Option<u8>,
    pub marker: bool,
    pub extension: bool,
    pub csrc: Option<Vec<u32>>,
    pub ts_stride: Option<u32>,
}

/// Parsed or to-be-built EXT-3
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Ext3 {
    pub sn8: Option<u8>,
    pub ts: Option<Ext3Ts>,
    /// Non-RTP profiles carry the mode in the flags octet
    pub mode: Option<Mode>,
    pub inner: Option<Ext3IpFields>,
    pub outer: Option<Ext3IpFields>,
    pub inner_ipid: Option<u16>,
    pub outer_ipid: Option<u16>,
    pub rtp: Option<Ext3Rtp>,
}

/// One extension, discriminated by its two leading bits
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Extension {
    Ext0 { sn: u8, field: u8 },
    Ext1 { sn: u8, field: u8, field2: u8 },
    Ext2 { sn: u8, field: u16, field2: u8 },
    Ext3(Box<Ext3>),
}

impl Extension {
    /// SN LSBs the extension contributes
    pub(crate) fn sn_bits(&self) -> (u32, u8) {
        match self {
            Self::Ext0 { sn, .. } | Self::Ext1 { sn, .. } | Self::Ext2 { sn, .. } => {
                (u32::from(*sn), 3)
            }
            Self::Ext3(ext3) => match ext3.sn8 {
                Some(sn8) => (u32::from(sn8), 8),
                None => (0, 0),
            },
        }
    }
}

pub(crate) fn build(extension: &Extension, rtp: bool, out: &mut Vec<u8>) {
    match extension {
        Extension::Ext0 { sn, field } => {
            out.push(((sn & 0x07) << 3) | (field & 0x07));
        }
        Extension::Ext1 { sn, field, field2 } => {
            out.push(0b0100_0000 | ((sn & 0x07) << 3) | (field & 0x07));
            out.push(*field2);
        }
        Extension::Ext2 { sn, field, field2 } => {
            out.push(0b1000_0000 | ((sn & 0x07) << 3) | ((field >> 8) as u8 & 0x07));
            out.push(*field as u8);
            out.push(*field2);
        }
        Extension::Ext3(ext3) => build_ext3(ext3, rtp, out),
    }
}

pub(crate) fn parse(
    cursor: &mut ByteCursor<'_>,
    rtp: bool,
    csrc_table: &mut [Option<u32>; 16],
) -> RohcResult<Extension> {
    let first = cursor.read_u8()?;
    let sn = (first >> 3) & 0x07;
    match first >> 6 {
        0b00 => Ok(Extension::Ext0 {
            sn,
            field: first & 0x07,
        }),
        0b01 => Ok(Extension::Ext1 {
            sn,
            field: first & 0x07,
            field2: cursor.read_u8()?,
        }),
        0b10 => Ok(Extension::Ext2 {
            sn,
            field: (u16::from(first & 0x07) << 8) | u16::from(cursor.read_u8()?),
            field2: cursor.read_u8()?,
        }),
        _ => Ok(Extension::Ext3(Box::new(parse_ext3(
            first, cursor, rtp, csrc_table,
        )?))),
    }
}

fn ip_fields_flags(fields: &Ext3IpFields, ip2: bool) -> u8 {
    (u8::from(fields.tos.is_some()) << 7)
        | (u8::from(fields.ttl.is_some()) << 6)
        | (u8::from(fields.df) << 5)
        | (u8::from(fields.proto.is_some()) << 4)
        | (u8::from(fields.nbo) << 2)
        | (u8::from(fields.rnd) << 1)
        | u8::from(ip2)
}

fn build_ext3(ext3: &Ext3, rtp: bool, out: &mut Vec<u8>) {
    let flags = if rtp {
        0b1100_0000
            | (u8::from(ext3.sn8.is_some()) << 5)
            | (u8::from(ext3.ts.is_some()) << 4)
            | (u8::from(ext3.ts.is_some_and(|ts| ts.scaled)) << 3)
            | (u8::from(ext3.inner_ipid.is_some()) << 2)
            | (u8::from(ext3.inner.is_some()) << 1)
            | u8::from(ext3.rtp.is_some())
    } else {
        let mode = ext3.mode.unwrap_or(Mode::Unidirectional);
        0b1100_0000
            | (u8::from(ext3.sn8.is_some()) << 5)
            | (mode.to_bits() << 3)
            | (u8::from(ext3.inner_ipid.is_some()) << 2)
            | (u8::from(ext3.inner.is_some()) << 1)
            | u8::from(ext3.outer.is_some())
    };
    out.push(flags);

    if let Some(inner) = &ext3.inner {
        out.push(ip_fields_flags(inner, rtp && ext3.outer.is_some()));
    }
    if let Some(outer) = &ext3.outer {
        let flags = ip_fields_flags(outer, false) & !0x01;
        out.push(flags | u8::from(ext3.outer_ipid.is_some()));
    }
    if let Some(sn8) = ext3.sn8 {
        out.push(sn8);
    }
    if let Some(ts) = &ext3.ts {
        let _ = sdvl::encode_forced(ts.value, sdvl::len_for_bits(ts.k), out);
    }
    if let Some(inner) = &ext3.inner {
        if let Some(tos) = inner.tos {
            out.push(tos);
        }
        if let Some(ttl) = inner.ttl {
            out.push(ttl);
        }
        if let Some(proto) = inner.proto {
            out.push(proto);
        }
    }
    if let Some(ipid) = ext3.inner_ipid {
        out.extend_from_slice(&ipid.to_be_bytes());
    }
    if let Some(outer) = &ext3.outer {
        if let Some(tos) = outer.tos {
            out.push(tos);
        }
        if let Some(ttl) = outer.ttl {
            out.push(ttl);
        }
        if let Some(proto) = outer.proto {
            out.push(proto);
        }
        if let Some(ipid) = ext3.outer_ipid {
            out.extend_from_slice(&ipid.to_be_bytes());
        }
    }
    if let Some(rtp_fields) = &ext3.rtp {
        out.push(
            (rtp_fields.mode.to_bits() << 6)
                | (u8::from(rtp_fields.pt.is_some()) << 5)
                | (u8::from(rtp_fields.marker) << 4)
                | (u8::from(rtp_fields.extension) << 3)
                | (u8::from(rtp_fields.csrc.is_some()) << 2)
                | (u8::from(rtp_fields.ts_stride.is_some()) << 1),
        );
        if let Some(pt) = rtp_fields.pt {
            out.push(pt & 0x7f);
        }
        if let Some(csrc) = &rtp_fields.csrc {
            chains::build_list_u32(csrc, out);
        }
        if let Some(stride) = rtp_fields.ts_stride {
            let _ = sdvl::encode(stride.min(sdvl::SDVL_MAX), out);
        }
    }
}

fn parse_ip_fields(
    cursor: &mut ByteCursor<'_>,
    flags: u8,
) -> RohcResult<Ext3IpFields> {
    let mut fields = Ext3IpFields {
        tos: None,
        ttl: None,
        proto: None,
        df: flags & 0x20 != 0,
        nbo: flags & 0x04 != 0,
        rnd: flags & 0x02 != 0,
    };
    if flags & 0x80 != 0 {
        fields.tos = Some(cursor.read_u8()?);
    }
    if flags & 0x40 != 0 {
        fields.ttl = Some(cursor.read_u8()?);
    }
    if flags & 0x10 != 0 {
        fields.proto = Some(cursor.read_u8()?);
    }
    if flags & 0x08 != 0 {
        // IPX: an extension header list is structurally valid here but
        // only the empty list can be reconstructed
        chains::parse_empty_list(cursor)?;
    }
    Ok(fields)
}

fn parse_ext3(
    first: u8,
    cursor: &mut ByteCursor<'_>,
    rtp: bool,
    csrc_table: &mut [Option<u32>; 16],
) -> RohcResult<Ext3> {
    let mut ext3 = Ext3::default();

    let (has_sn, has_ts, ts_scaled, has_ipid, has_ip, has_rtp, has_outer_flag);
    if rtp {
        has_sn = first & 0x20 != 0;
        has_ts = first & 0x10 != 0;
        ts_scaled = first & 0x08 != 0;
        has_ipid = first & 0x04 != 0;
        has_ip = first & 0x02 != 0;
        has_rtp = first & 0x01 != 0;
        has_outer_flag = false;
    } else {
        has_sn = first & 0x20 != 0;
        ext3.mode = Mode::from_bits((first >> 3) & 0b11);
        has_ipid = first & 0x04 != 0;
        has_ip = first & 0x02 != 0;
        has_outer_flag = first & 0x01 != 0;
        has_ts = false;
        ts_scaled = false;
        has_rtp = false;
    }

    let mut inner_flags = 0u8;
    let mut outer_flags = 0u8;
    let mut has_outer = has_outer_flag;
    if has_ip {
        inner_flags = cursor.read_u8()?;
        if rtp {
            has_outer = inner_flags & 0x01 != 0;
        }
    }
    if has_outer {
        outer_flags = cursor.read_u8()?;
    }

    if has_sn {
        ext3.sn8 = Some(cursor.read_u8()?);
    }
    if has_ts {
        let (value, k) = sdvl::decode_with_width(cursor)?;
        ext3.ts = Some(Ext3Ts {
            value,
            k,
            scaled: ts_scaled,
        });
    }
    if has_ip {
        ext3.inner = Some(parse_ip_fields(cursor, inner_flags)?);
    }
    if has_ipid {
        ext3.inner_ipid = Some(cursor.read_u16()?);
    }
    if has_outer {
        ext3.outer = Some(parse_ip_fields(cursor, outer_flags)?);
        if outer_flags & 0x01 != 0 {
            ext3.outer_ipid = Some(cursor.read_u16()?);
        }
    }
    if has_rtp {
        let flags = cursor.read_u8()?;
        let Some(mode) = Mode::from_bits(flags >> 6) else {
            return Err(RohcError::Malformed);
        };
        let mut fields = Ext3Rtp {
            mode,
            pt: None,
            marker: flags & 0x10 != 0,
            extension: flags & 0x08 != 0,
            csrc: None,
            ts_stride: None,
        };
        if flags & 0x20 != 0 {
            fields.pt = Some(cursor.read_u8()? & 0x7f);
        }
        if flags & 0x04 != 0 {
            fields.csrc = Some(chains::parse_list_u32(cursor, csrc_table)?);
        }
        if flags & 0x02 != 0 {
            fields.ts_stride = Some(sdvl::decode(cursor)?);
        }
        ext3.rtp = Some(fields);
    }

    Ok(ext3)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(extension: &Extension, rtp: bool) -> Extension {
        let mut out = Vec::new();
        build(extension, rtp, &mut out);
        let mut cursor = ByteCursor::new(&out);
        let mut table = [None; 16];
        let parsed = parse(&mut cursor, rtp, &mut table).unwrap();
        assert_eq!(cursor.remaining_len(), 0);
        parsed
    }

    #[test]
    fn test_ext0_through_ext2_round_trip() {
        for extension in [
            Extension::Ext0 { sn: 0b101, field: 0b011 },
            Extension::Ext1 {
                sn: 0b001,
                field: 0b111,
                field2: 0xab,
            },
            Extension::Ext2 {
                sn: 0b110,
                field: 0x5ff,
                field2: 0x12,
            },
        ] {
            assert_eq!(round_trip(&extension, true), extension);
            assert_eq!(round_trip(&extension, false), extension);
        }
    }

    #[test]
    fn test_ext3_rtp_full_round_trip() {
        let extension = Extension::Ext3(Box::new(Ext3 {
            sn8: Some(0x42),
            ts: Some(Ext3Ts {
                value: 12345,
                k: 14,
                scaled: true,
            }),
            inner: Some(Ext3IpFields {
                tos: Some(0x2e),
                ttl: Some(61),
                proto: None,
                df: true,
                nbo: true,
                rnd: true,
            }),
            inner_ipid: Some(0xbeef),
            rtp: Some(Ext3Rtp {
                mode: Mode::Optimistic,
                pt: Some(96),
                marker: true,
                extension: false,
                csrc: Some(vec![0x0102_0304]),
                ts_stride: Some(160),
            }),
            ..Ext3::default()
        }));
        assert_eq!(round_trip(&extension, true), extension);
    }

    #[test]
    fn test_ext3_non_rtp_mode_and_outer() {
        let extension = Extension::Ext3(Box::new(Ext3 {
            sn8: Some(7),
            mode: Some(Mode::Reliable),
            inner: Some(Ext3IpFields {
                tos: None,
                ttl: Some(63),
                proto: None,
                df: false,
                nbo: true,
                rnd: false,
            }),
            outer: Some(Ext3IpFields {
                tos: None,
                ttl: None,
                proto: None,
                df: true,
                nbo: true,
                rnd: true,
            }),
            outer_ipid: Some(0x1234),
            ..Ext3::default()
        }));
        assert_eq!(round_trip(&extension, false), extension);
    }

    #[test]
    fn test_sn_bits_contribution() {
        let ext0 = Extension::Ext0 { sn: 5, field: 0 };
        assert_eq!(ext0.sn_bits(), (5, 3));
        let ext3 = Extension::Ext3(Box::new(Ext3 {
            sn8: Some(0x99),
            ..Ext3::default()
        }));
        assert_eq!(ext3.sn_bits(), (0x99, 8));
    }
}
