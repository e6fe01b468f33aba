//! Static and dynamic chains of IR and IR-DYN packets
//! (RFC 3095 section 5.7.7, RFC 3843, RFC 4019)
//!
//! The static chain pins the flow-identifying fields, the dynamic chain
//! snapshots everything that may move. Chains list headers outer-first;
//! nesting is discriminated by the protocol field of the previous item.

use crate::{
    ProfileId,
    context::Mode,
    cursor::ByteCursor,
    encodings::IpIdBehavior,
    error::{RohcError, RohcResult},
    headers::{
        EspHeader, HeaderSet, IPPROTO_IPIP, IPPROTO_IPV6, IpHeader, Ipv4Header, Ipv6Header,
        RtpHeader, Transport, UdpHeader,
    },
    sdvl,
};

/// Values the dynamic chain carries besides the header fields proper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DynInfo {
    pub inner_behavior: IpIdBehavior,
    pub outer_behavior: IpIdBehavior,
    /// Compressor mode, carried in the RTP dynamic part
    pub mode: Option<Mode>,
    pub ts_stride: Option<u32>,
    /// SN of this packet (generated for the SN-less profiles)
    pub sn: u32,
}

impl Default for DynInfo {
    fn default() -> Self {
        Self {
            inner_behavior: IpIdBehavior::SEQUENTIAL,
            outer_behavior: IpIdBehavior::SEQUENTIAL,
            mode: None,
            ts_stride: None,
            sn: 0,
        }
    }
}

pub(crate) fn build_static_ip(ip: &IpHeader, out: &mut Vec<u8>) {
    match ip {
        IpHeader::V4(v4) => {
            out.push(0x40);
            out.push(v4.protocol);
            out.extend_from_slice(&v4.src);
            out.extend_from_slice(&v4.dst);
        }
        IpHeader::V6(v6) => {
            out.push(0x60 | ((v6.flow_label >> 16) & 0x0f) as u8);
            out.extend_from_slice(&(v6.flow_label as u16).to_be_bytes());
            out.push(v6.next_header);
            out.extend_from_slice(&v6.src);
            out.extend_from_slice(&v6.dst);
        }
    }
}

pub(crate) fn parse_static_ip(cursor: &mut ByteCursor<'_>) -> RohcResult<IpHeader> {
    let first = cursor.read_u8()?;
    match first >> 4 {
        4 => {
            let protocol = cursor.read_u8()?;
            let src = cursor.take_array::<4>()?;
            let dst = cursor.take_array::<4>()?;
            Ok(IpHeader::V4(Ipv4Header {
                tos: 0,
                id: 0,
                df: false,
                ttl: 0,
                protocol,
                src,
                dst,
            }))
        }
        6 => {
            let flow_label =
                (u32::from(first & 0x0f) << 16) | u32::from(cursor.read_u16()?);
            let next_header = cursor.read_u8()?;
            let src = cursor.take_array::<16>()?;
            let dst = cursor.take_array::<16>()?;
            Ok(IpHeader::V6(Ipv6Header {
                traffic_class: 0,
                flow_label,
                next_header,
                hop_limit: 0,
                src,
                dst,
            }))
        }
        _ => Err(RohcError::Malformed),
    }
}

/// Append the static chain of `headers` for `profile`
pub(crate) fn build_static_chain(headers: &HeaderSet, profile: ProfileId, out: &mut Vec<u8>) {
    if let Some(outer) = &headers.outer_ip {
        build_static_ip(outer, out);
    }
    build_static_ip(&headers.ip, out);

    match &headers.transport {
        Transport::None => {}
        Transport::Udp { udp, rtp } => {
            out.extend_from_slice(&udp.sport.to_be_bytes());
            out.extend_from_slice(&udp.dport.to_be_bytes());
            if profile.with_rtp() {
                if let Some(rtp) = rtp {
                    out.extend_from_slice(&rtp.ssrc.to_be_bytes());
                }
            }
        }
        Transport::UdpLite(udp) => {
            out.extend_from_slice(&udp.sport.to_be_bytes());
            out.extend_from_slice(&udp.dport.to_be_bytes());
        }
        Transport::Esp(esp) => out.extend_from_slice(&esp.spi.to_be_bytes()),
        Transport::Tcp(_) => {
            debug_assert!(false, "TCP chains live in the tcp module");
        }
    }
}

/// Parse a static chain into a header set with defaulted dynamic fields
pub(crate) fn parse_static_chain(
    cursor: &mut ByteCursor<'_>,
    profile: ProfileId,
) -> RohcResult<HeaderSet> {
    let first_ip = parse_static_ip(cursor)?;
    let (outer_ip, ip) = if matches!(first_ip.protocol(), IPPROTO_IPIP | IPPROTO_IPV6) {
        (Some(first_ip), parse_static_ip(cursor)?)
    } else {
        (None, first_ip)
    };

    let transport = match profile {
        ProfileId::Ip => Transport::None,
        ProfileId::Udp | ProfileId::UdpLite | ProfileId::Rtp => {
            let sport = cursor.read_u16()?;
            let dport = cursor.read_u16()?;
            let udp = UdpHeader {
                sport,
                dport,
                coverage: 0,
                checksum: 0,
            };
            if profile.with_rtp() {
                let ssrc = cursor.read_u32()?;
                Transport::Udp {
                    udp,
                    rtp: Some(RtpHeader {
                        padding: false,
                        extension: false,
                        marker: false,
                        payload_type: 0,
                        sn: 0,
                        ts: 0,
                        ssrc,
                        csrc: Vec::new(),
                    }),
                }
            } else if matches!(profile, ProfileId::UdpLite) {
                Transport::UdpLite(udp)
            } else {
                Transport::Udp { udp, rtp: None }
            }
        }
        ProfileId::Esp => Transport::Esp(EspHeader {
            spi: cursor.read_u32()?,
            sn: 0,
        }),
        ProfileId::Uncompressed | ProfileId::Tcp => {
            return Err(RohcError::Internal("profile has no generic static chain"));
        }
    };

    let base_len = outer_ip.as_ref().map_or(0, IpHeader::wire_len)
        + ip.wire_len()
        + match &transport {
            Transport::None => 0,
            Transport::Udp { .. } | Transport::UdpLite(_) | Transport::Esp(_) => 8,
            Transport::Tcp(tcp) => tcp.wire_len(),
        };
    let rtp_len = match &transport {
        Transport::Udp { rtp: Some(rtp), .. } => rtp.wire_len(),
        _ => 0,
    };

    Ok(HeaderSet {
        outer_ip,
        ip,
        transport,
        base_len,
        rtp_len,
    })
}

pub(crate) fn build_dynamic_ip(ip: &IpHeader, behavior: IpIdBehavior, out: &mut Vec<u8>) {
    match ip {
        IpHeader::V4(v4) => {
            out.push(v4.tos);
            out.push(v4.ttl);
            out.extend_from_slice(&v4.id.to_be_bytes());
            out.push(
                (u8::from(v4.df) << 7) | (u8::from(behavior.rnd) << 6)
                    | (u8::from(behavior.nbo) << 5),
            );
            // Empty generic extension header list
            out.push(0x00);
        }
        IpHeader::V6(v6) => {
            out.push(v6.traffic_class);
            out.push(v6.hop_limit);
            out.push(0x00);
        }
    }
}

pub(crate) fn parse_dynamic_ip(
    cursor: &mut ByteCursor<'_>,
    ip: &mut IpHeader,
) -> RohcResult<IpIdBehavior> {
    match ip {
        IpHeader::V4(v4) => {
            v4.tos = cursor.read_u8()?;
            v4.ttl = cursor.read_u8()?;
            v4.id = cursor.read_u16()?;
            let flags = cursor.read_u8()?;
            v4.df = flags & 0x80 != 0;
            parse_empty_list(cursor)?;
            Ok(IpIdBehavior {
                rnd: flags & 0x40 != 0,
                nbo: flags & 0x20 != 0,
            })
        }
        IpHeader::V6(v6) => {
            v6.traffic_class = cursor.read_u8()?;
            v6.hop_limit = cursor.read_u8()?;
            parse_empty_list(cursor)?;
            Ok(IpIdBehavior::SEQUENTIAL)
        }
    }
}

/// Append the dynamic chain of `headers` for `profile`
pub(crate) fn build_dynamic_chain(
    headers: &HeaderSet,
    profile: ProfileId,
    info: &DynInfo,
    out: &mut Vec<u8>,
) {
    if let Some(outer) = &headers.outer_ip {
        build_dynamic_ip(outer, info.outer_behavior, out);
    }
    build_dynamic_ip(&headers.ip, info.inner_behavior, out);

    match &headers.transport {
        Transport::None => {}
        Transport::Udp { udp, rtp } => {
            out.extend_from_slice(&udp.checksum.to_be_bytes());
            if profile.with_rtp() {
                if let Some(rtp) = rtp {
                    build_dynamic_rtp(rtp, info, out);
                }
            }
        }
        Transport::UdpLite(udp) => {
            out.extend_from_slice(&udp.coverage.to_be_bytes());
            out.extend_from_slice(&udp.checksum.to_be_bytes());
        }
        Transport::Esp(esp) => out.extend_from_slice(&esp.sn.to_be_bytes()),
        Transport::Tcp(_) => {
            debug_assert!(false, "TCP chains live in the tcp module");
        }
    }

    if matches!(
        profile,
        ProfileId::Ip | ProfileId::Udp | ProfileId::UdpLite
    ) {
        // The SN-less profiles close the chain with the generated SN
        out.extend_from_slice(&(info.sn as u16).to_be_bytes());
    }
}

fn build_dynamic_rtp(rtp: &RtpHeader, info: &DynInfo, out: &mut Vec<u8>) {
    out.push(
        0x80 | (u8::from(rtp.padding) << 5) | (1 << 4) | rtp.csrc.len() as u8,
    );
    out.push((u8::from(rtp.marker) << 7) | rtp.payload_type);
    out.extend_from_slice(&rtp.sn.to_be_bytes());
    out.extend_from_slice(&rtp.ts.to_be_bytes());
    build_list_u32(&rtp.csrc, out);
    // RX octet: X, mode, TIS, TSS
    let mode = info.mode.unwrap_or(Mode::Unidirectional);
    let tss = info.ts_stride.is_some();
    out.push(
        (u8::from(rtp.extension) << 7) | (mode.to_bits() << 5) | (u8::from(tss) << 3),
    );
    if let Some(stride) = info.ts_stride {
        // Stride fits SDVL by construction; the detector rejects wilder
        // strides long before scaled mode engages
        let _ = sdvl::encode(stride.min(sdvl::SDVL_MAX), out);
    }
}

/// Parse a dynamic chain over a header set obtained from the static
/// chain (or the context reference)
pub(crate) fn parse_dynamic_chain(
    cursor: &mut ByteCursor<'_>,
    profile: ProfileId,
    headers: &mut HeaderSet,
    csrc_table: &mut [Option<u32>; 16],
) -> RohcResult<DynInfo> {
    let mut info = DynInfo::default();

    if let Some(outer) = &mut headers.outer_ip {
        info.outer_behavior = parse_dynamic_ip(cursor, outer)?;
    }
    info.inner_behavior = parse_dynamic_ip(cursor, &mut headers.ip)?;

    match &mut headers.transport {
        Transport::None => {}
        Transport::Udp { udp, rtp } => {
            udp.checksum = cursor.read_u16()?;
            if profile.with_rtp() {
                let Some(rtp) = rtp else {
                    return Err(RohcError::Internal("RTP context without RTP header"));
                };
                parse_dynamic_rtp(cursor, rtp, &mut info, csrc_table)?;
                info.sn = u32::from(rtp.sn);
            }
        }
        Transport::UdpLite(udp) => {
            udp.coverage = cursor.read_u16()?;
            udp.checksum = cursor.read_u16()?;
        }
        Transport::Esp(esp) => {
            esp.sn = cursor.read_u32()?;
            info.sn = esp.sn;
        }
        Transport::Tcp(_) => {
            return Err(RohcError::Internal("TCP chains live in the tcp module"));
        }
    }

    if matches!(
        profile,
        ProfileId::Ip | ProfileId::Udp | ProfileId::UdpLite
    ) {
        info.sn = u32::from(cursor.read_u16()?);
    }

    headers.rtp_len = match &headers.transport {
        Transport::Udp { rtp: Some(rtp), .. } => rtp.wire_len(),
        _ => 0,
    };

    Ok(info)
}

fn parse_dynamic_rtp(
    cursor: &mut ByteCursor<'_>,
    rtp: &mut RtpHeader,
    info: &mut DynInfo,
    csrc_table: &mut [Option<u32>; 16],
) -> RohcResult<()> {
    let first = cursor.read_u8()?;
    if first >> 6 != 2 {
        return Err(RohcError::Malformed);
    }
    rtp.padding = first & 0x20 != 0;
    let rx = first & 0x10 != 0;
    let second = cursor.read_u8()?;
    rtp.marker = second & 0x80 != 0;
    rtp.payload_type = second & 0x7f;
    rtp.sn = cursor.read_u16()?;
    rtp.ts = cursor.read_u32()?;
    rtp.csrc = parse_list_u32(cursor, csrc_table)?;
    if rx {
        let flags = cursor.read_u8()?;
        rtp.extension = flags & 0x80 != 0;
        info.mode = Mode::from_bits((flags >> 5) & 0b11);
        if flags & 0x08 != 0 {
            info.ts_stride = Some(sdvl::decode(cursor)?);
        }
        if flags & 0x04 != 0 {
            // TIME_STRIDE is accepted but timer-based decompression is
            // not in use
            let _ = sdvl::decode(cursor)?;
        }
    }
    Ok(())
}

/// Append a generic list (encoding type 0, 8-bit XIs) of 32-bit items
pub(crate) fn build_list_u32(items: &[u32], out: &mut Vec<u8>) {
    debug_assert!(items.len() <= 15, "CSRC lists cap at 15 entries");
    if items.is_empty() {
        out.push(0x00);
        return;
    }
    out.push(0b0001_0000 | items.len() as u8);
    for index in 0..items.len() {
        out.push(0x80 | index as u8);
    }
    for item in items {
        out.extend_from_slice(&item.to_be_bytes());
    }
}

/// Parse a generic list of 32-bit items, maintaining the translation
/// table for XIs that reference earlier items
pub(crate) fn parse_list_u32(
    cursor: &mut ByteCursor<'_>,
    table: &mut [Option<u32>; 16],
) -> RohcResult<Vec<u32>> {
    let first = cursor.read_u8()?;
    if first == 0 {
        return Ok(Vec::new());
    }
    if first >> 6 != 0 {
        // Insertion/removal schemes (types 1-3) are never emitted here
        return Err(RohcError::Malformed);
    }
    let gp = first & 0x20 != 0;
    let ps = first & 0x10 != 0;
    let count = usize::from(first & 0x0f);
    if gp {
        let _gen_id = cursor.read_u8()?;
    }

    let mut xis = Vec::with_capacity(count);
    if ps {
        for _ in 0..count {
            let xi = cursor.read_u8()?;
            xis.push((xi & 0x80 != 0, usize::from(xi & 0x0f)));
        }
    } else {
        for pair in 0..count.div_ceil(2) {
            let byte = cursor.read_u8()?;
            xis.push((byte & 0x80 != 0, usize::from((byte >> 4) & 0x07)));
            if pair * 2 + 1 < count {
                xis.push((byte & 0x08 != 0, usize::from(byte & 0x07)));
            }
        }
    }

    let mut items = Vec::with_capacity(count);
    for (inline, index) in &xis {
        if *inline {
            let item = cursor.read_u32()?;
            table[*index] = Some(item);
        }
    }
    for (inline, index) in xis {
        if inline {
            let Some(item) = table[index] else {
                return Err(RohcError::Internal("inline item vanished"));
            };
            items.push(item);
        } else {
            let Some(item) = table[index] else {
                return Err(RohcError::Malformed);
            };
            items.push(item);
        }
    }

    Ok(items)
}

/// Accept only an empty generic list (extension headers are honored
/// structurally but cannot be reconstructed)
pub(crate) fn parse_empty_list(cursor: &mut ByteCursor<'_>) -> RohcResult<()> {
    let first = cursor.read_u8()?;
    if first != 0 {
        return Err(RohcError::Malformed);
    }
    Ok(())
}
