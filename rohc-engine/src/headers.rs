//! Uncompressed header model
//!
//! Parses the header chain the profiles compress (up to two IP headers,
//! then UDP/UDP-Lite/RTP/ESP/TCP) into field structs, and rebuilds the
//! exact wire bytes on the decompressor side. Inferred fields (IP total
//! length, IPv4 header checksum, UDP length) are recomputed on rebuild;
//! everything else is carried.
//!
//! A packet that cannot be modeled here (IP options, fragments, foreign
//! version) is not an error of the channel, it is merely uncompressible:
//! the compressor falls back to the Uncompressed profile.

use crate::{
    cursor::ByteCursor,
    error::{RohcError, RohcResult},
};

pub(crate) const IPPROTO_IPIP: u8 = 4;
pub(crate) const IPPROTO_TCP: u8 = 6;
pub(crate) const IPPROTO_UDP: u8 = 17;
pub(crate) const IPPROTO_IPV6: u8 = 41;
pub(crate) const IPPROTO_ESP: u8 = 50;
pub(crate) const IPPROTO_UDPLITE: u8 = 136;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Ipv4Header {
    pub tos: u8,
    pub id: u16,
    pub df: bool,
    pub ttl: u8,
    pub protocol: u8,
    pub src: [u8; 4],
    pub dst: [u8; 4],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Ipv6Header {
    pub traffic_class: u8,
    /// 20 significant bits
    pub flow_label: u32,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: [u8; 16],
    pub dst: [u8; 16],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum IpHeader {
    V4(Ipv4Header),
    V6(Ipv6Header),
}

impl IpHeader {
    pub(crate) fn protocol(&self) -> u8 {
        match self {
            Self::V4(v4) => v4.protocol,
            Self::V6(v6) => v6.next_header,
        }
    }

    pub(crate) fn wire_len(&self) -> usize {
        match self {
            Self::V4(_) => 20,
            Self::V6(_) => 40,
        }
    }

    /// The flow-identifying part is everything except TOS/TTL-class
    /// fields and the IPv4 ID
    pub(crate) fn same_static(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::V4(a), Self::V4(b)) => {
                a.protocol == b.protocol && a.src == b.src && a.dst == b.dst
            }
            (Self::V6(a), Self::V6(b)) => {
                a.next_header == b.next_header
                    && a.flow_label == b.flow_label
                    && a.src == b.src
                    && a.dst == b.dst
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UdpHeader {
    pub sport: u16,
    pub dport: u16,
    /// Checksum coverage; only meaningful for UDP-Lite, where the wire
    /// length field carries it
    pub coverage: u16,
    pub checksum: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RtpHeader {
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sn: u16,
    pub ts: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
}

impl RtpHeader {
    pub(crate) fn wire_len(&self) -> usize {
        12 + 4 * self.csrc.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EspHeader {
    pub spi: u32,
    pub sn: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TcpHeader {
    pub sport: u16,
    pub dport: u16,
    pub sn: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
    /// Raw option bytes, already padded to a 32-bit multiple
    pub options: Vec<u8>,
}

impl TcpHeader {
    pub(crate) fn wire_len(&self) -> usize {
        20 + self.options.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Transport {
    /// Payload follows the IP chain directly
    None,
    /// UDP, optionally with a parsed RTP header on top
    Udp {
        udp: UdpHeader,
        rtp: Option<RtpHeader>,
    },
    UdpLite(UdpHeader),
    Esp(EspHeader),
    Tcp(TcpHeader),
}

/// The parsed header chain of one uncompressed packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HeaderSet {
    pub outer_ip: Option<IpHeader>,
    pub ip: IpHeader,
    pub transport: Transport,
    /// Bytes from packet start through the transport header, RTP excluded
    pub base_len: usize,
    /// Additional bytes of the RTP header, when one was recognized
    pub rtp_len: usize,
}

impl HeaderSet {
    /// Length of the header chain a profile covers
    ///
    /// `with_rtp` selects whether the RTP header counts as header or as
    /// payload (the UDP profile treats it as payload).
    pub(crate) fn header_len(&self, with_rtp: bool) -> usize {
        if with_rtp {
            self.base_len + self.rtp_len
        } else {
            self.base_len
        }
    }

    pub(crate) fn rtp(&self) -> Option<&RtpHeader> {
        match &self.transport {
            Transport::Udp { rtp, .. } => rtp.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn rtp_mut(&mut self) -> Option<&mut RtpHeader> {
        match &mut self.transport {
            Transport::Udp { rtp, .. } => rtp.as_mut(),
            _ => None,
        }
    }

    pub(crate) fn udp(&self) -> Option<&UdpHeader> {
        match &self.transport {
            Transport::Udp { udp, .. } | Transport::UdpLite(udp) => Some(udp),
            _ => None,
        }
    }
}

fn parse_ipv4(cursor: &mut ByteCursor<'_>) -> RohcResult<Ipv4Header> {
    let version_ihl = cursor.read_u8()?;
    if version_ihl != 0x45 {
        // Options and foreign versions are uncompressible
        return Err(RohcError::Malformed);
    }
    let tos = cursor.read_u8()?;
    let total_len = cursor.read_u16()?;
    if usize::from(total_len) < 20 {
        return Err(RohcError::Malformed);
    }
    let id = cursor.read_u16()?;
    let flags_frag = cursor.read_u16()?;
    if flags_frag & 0x3fff != 0 {
        // Fragments cannot share a context
        return Err(RohcError::Malformed);
    }
    let df = flags_frag & 0x4000 != 0;
    let ttl = cursor.read_u8()?;
    let protocol = cursor.read_u8()?;
    let _checksum = cursor.read_u16()?;
    let src = cursor.take_array::<4>()?;
    let dst = cursor.take_array::<4>()?;

    Ok(Ipv4Header {
        tos,
        id,
        df,
        ttl,
        protocol,
        src,
        dst,
    })
}

fn parse_ipv6(cursor: &mut ByteCursor<'_>) -> RohcResult<Ipv6Header> {
    let first = cursor.read_u32()?;
    if first >> 28 != 6 {
        return Err(RohcError::Malformed);
    }
    let traffic_class = ((first >> 20) & 0xff) as u8;
    let flow_label = first & 0x000f_ffff;
    let _payload_len = cursor.read_u16()?;
    let next_header = cursor.read_u8()?;
    let hop_limit = cursor.read_u8()?;
    let src = cursor.take_array::<16>()?;
    let dst = cursor.take_array::<16>()?;

    Ok(Ipv6Header {
        traffic_class,
        flow_label,
        next_header,
        hop_limit,
        src,
        dst,
    })
}

fn parse_ip(cursor: &mut ByteCursor<'_>) -> RohcResult<IpHeader> {
    match cursor.peek_u8() {
        Some(byte) if byte >> 4 == 4 => Ok(IpHeader::V4(parse_ipv4(cursor)?)),
        Some(byte) if byte >> 4 == 6 => Ok(IpHeader::V6(parse_ipv6(cursor)?)),
        _ => Err(RohcError::Malformed),
    }
}

fn parse_rtp(cursor: &mut ByteCursor<'_>) -> RohcResult<RtpHeader> {
    let first = cursor.read_u8()?;
    if first >> 6 != 2 {
        return Err(RohcError::Malformed);
    }
    let padding = first & 0x20 != 0;
    let extension = first & 0x10 != 0;
    let cc = first & 0x0f;
    let second = cursor.read_u8()?;
    let marker = second & 0x80 != 0;
    let payload_type = second & 0x7f;
    let sn = cursor.read_u16()?;
    let ts = cursor.read_u32()?;
    let ssrc = cursor.read_u32()?;
    let mut csrc = Vec::with_capacity(usize::from(cc));
    for _ in 0..cc {
        csrc.push(cursor.read_u32()?);
    }

    Ok(RtpHeader {
        padding,
        extension,
        marker,
        payload_type,
        sn,
        ts,
        ssrc,
        csrc,
    })
}

fn parse_tcp(cursor: &mut ByteCursor<'_>) -> RohcResult<TcpHeader> {
    let sport = cursor.read_u16()?;
    let dport = cursor.read_u16()?;
    let sn = cursor.read_u32()?;
    let ack = cursor.read_u32()?;
    let offset_flags = cursor.read_u16()?;
    let data_offset = (offset_flags >> 12) as u8;
    if data_offset < 5 || offset_flags & 0x0e00 != 0 {
        // Reserved bits (including NS) make the packet uncompressible
        return Err(RohcError::Malformed);
    }
    let flags = (offset_flags & 0x00ff) as u8;
    let window = cursor.read_u16()?;
    let checksum = cursor.read_u16()?;
    let urgent = cursor.read_u16()?;
    let options = cursor.take(usize::from(data_offset - 5) * 4)?.to_vec();

    Ok(TcpHeader {
        sport,
        dport,
        sn,
        ack,
        flags,
        window,
        checksum,
        urgent,
        options,
    })
}

/// Parse the compressible header chain of `packet`
///
/// `try_rtp` controls whether a well-formed RTP header after UDP is
/// recognized; the classifier decides whether it is then compressed as
/// RTP or left as payload.
pub(crate) fn parse(packet: &[u8], try_rtp: bool) -> RohcResult<HeaderSet> {
    let mut cursor = ByteCursor::new(packet);

    let first_ip = parse_ip(&mut cursor)?;
    let (outer_ip, ip) = if matches!(
        first_ip.protocol(),
        IPPROTO_IPIP | IPPROTO_IPV6
    ) {
        let inner = parse_ip(&mut cursor)?;
        (Some(first_ip), inner)
    } else {
        (None, first_ip)
    };

    let mut rtp_len = 0;
    let transport = match ip.protocol() {
        IPPROTO_UDP => {
            let sport = cursor.read_u16()?;
            let dport = cursor.read_u16()?;
            let length = cursor.read_u16()?;
            // Checksum is still unread: wire length = 8 + payload
            if usize::from(length) != 6 + cursor.remaining_len() {
                return Err(RohcError::Malformed);
            }
            let checksum = cursor.read_u16()?;
            let udp = UdpHeader {
                sport,
                dport,
                coverage: 0,
                checksum,
            };
            let rtp = if try_rtp {
                let mut probe = cursor;
                match parse_rtp(&mut probe) {
                    Ok(rtp) => {
                        rtp_len = probe.pos() - cursor.pos();
                        Some(rtp)
                    }
                    Err(_) => None,
                }
            } else {
                None
            };
            Transport::Udp { udp, rtp }
        }
        IPPROTO_UDPLITE => {
            let sport = cursor.read_u16()?;
            let dport = cursor.read_u16()?;
            let coverage = cursor.read_u16()?;
            let checksum = cursor.read_u16()?;
            Transport::UdpLite(UdpHeader {
                sport,
                dport,
                coverage,
                checksum,
            })
        }
        IPPROTO_ESP => Transport::Esp(EspHeader {
            spi: cursor.read_u32()?,
            sn: cursor.read_u32()?,
        }),
        IPPROTO_TCP => Transport::Tcp(parse_tcp(&mut cursor)?),
        _ => Transport::None,
    };

    Ok(HeaderSet {
        outer_ip,
        ip,
        transport,
        base_len: cursor.pos(),
        rtp_len,
    })
}

fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in header.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += u32::from(word);
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn write_ipv4(v4: &Ipv4Header, inner_len: usize, out: &mut Vec<u8>) {
    let start = out.len();
    out.push(0x45);
    out.push(v4.tos);
    out.extend_from_slice(&((20 + inner_len) as u16).to_be_bytes());
    out.extend_from_slice(&v4.id.to_be_bytes());
    let flags_frag: u16 = if v4.df { 0x4000 } else { 0 };
    out.extend_from_slice(&flags_frag.to_be_bytes());
    out.push(v4.ttl);
    out.push(v4.protocol);
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&v4.src);
    out.extend_from_slice(&v4.dst);
    let checksum = ipv4_checksum(&out[start..start + 20]);
    out[start + 10..start + 12].copy_from_slice(&checksum.to_be_bytes());
}

fn write_ipv6(v6: &Ipv6Header, inner_len: usize, out: &mut Vec<u8>) {
    let first = (6u32 << 28) | (u32::from(v6.traffic_class) << 20) | v6.flow_label;
    out.extend_from_slice(&first.to_be_bytes());
    out.extend_from_slice(&(inner_len as u16).to_be_bytes());
    out.push(v6.next_header);
    out.push(v6.hop_limit);
    out.extend_from_slice(&v6.src);
    out.extend_from_slice(&v6.dst);
}

fn write_ip(ip: &IpHeader, inner_len: usize, out: &mut Vec<u8>) {
    match ip {
        IpHeader::V4(v4) => write_ipv4(v4, inner_len, out),
        IpHeader::V6(v6) => write_ipv6(v6, inner_len, out),
    }
}

fn write_rtp(rtp: &RtpHeader, out: &mut Vec<u8>) {
    out.push(
        0x80 | (u8::from(rtp.padding) << 5) | (u8::from(rtp.extension) << 4)
            | rtp.csrc.len() as u8,
    );
    out.push((u8::from(rtp.marker) << 7) | rtp.payload_type);
    out.extend_from_slice(&rtp.sn.to_be_bytes());
    out.extend_from_slice(&rtp.ts.to_be_bytes());
    out.extend_from_slice(&rtp.ssrc.to_be_bytes());
    for csrc in &rtp.csrc {
        out.extend_from_slice(&csrc.to_be_bytes());
    }
}

/// Rebuild the wire bytes of the header chain, followed by nothing
///
/// `payload_len` is the number of bytes that will follow the rebuilt
/// headers; length and checksum fields are computed from it.
pub(crate) fn write(headers: &HeaderSet, with_rtp: bool, payload_len: usize, out: &mut Vec<u8>) {
    let rtp = if with_rtp { headers.rtp() } else { None };
    let rtp_len = rtp.map_or(0, RtpHeader::wire_len);

    let transport_len = match &headers.transport {
        Transport::None => 0,
        Transport::Udp { .. } | Transport::UdpLite(_) => 8,
        Transport::Esp(_) => 8,
        Transport::Tcp(tcp) => tcp.wire_len(),
    };
    let after_inner = transport_len + rtp_len + payload_len;

    if let Some(outer) = &headers.outer_ip {
        write_ip(outer, headers.ip.wire_len() + after_inner, out);
    }
    write_ip(&headers.ip, after_inner, out);

    match &headers.transport {
        Transport::None => {}
        Transport::Udp { udp, .. } => {
            out.extend_from_slice(&udp.sport.to_be_bytes());
            out.extend_from_slice(&udp.dport.to_be_bytes());
            out.extend_from_slice(&((8 + rtp_len + payload_len) as u16).to_be_bytes());
            out.extend_from_slice(&udp.checksum.to_be_bytes());
        }
        Transport::UdpLite(udp) => {
            out.extend_from_slice(&udp.sport.to_be_bytes());
            out.extend_from_slice(&udp.dport.to_be_bytes());
            out.extend_from_slice(&udp.coverage.to_be_bytes());
            out.extend_from_slice(&udp.checksum.to_be_bytes());
        }
        Transport::Esp(esp) => {
            out.extend_from_slice(&esp.spi.to_be_bytes());
            out.extend_from_slice(&esp.sn.to_be_bytes());
        }
        Transport::Tcp(tcp) => {
            out.extend_from_slice(&tcp.sport.to_be_bytes());
            out.extend_from_slice(&tcp.dport.to_be_bytes());
            out.extend_from_slice(&tcp.sn.to_be_bytes());
            out.extend_from_slice(&tcp.ack.to_be_bytes());
            let data_offset = 5 + (tcp.options.len() / 4) as u16;
            out.extend_from_slice(&((data_offset << 12) | u16::from(tcp.flags)).to_be_bytes());
            out.extend_from_slice(&tcp.window.to_be_bytes());
            out.extend_from_slice(&tcp.checksum.to_be_bytes());
            out.extend_from_slice(&tcp.urgent.to_be_bytes());
            out.extend_from_slice(&tcp.options);
        }
    }

    if let Some(rtp) = rtp {
        write_rtp(rtp, out);
    }
}

fn crc_static_ip(ip: &IpHeader, out: &mut Vec<u8>) {
    match ip {
        IpHeader::V4(v4) => {
            out.push(0x45);
            out.push(v4.protocol);
            out.extend_from_slice(&v4.src);
            out.extend_from_slice(&v4.dst);
        }
        IpHeader::V6(v6) => {
            out.push(0x60);
            out.extend_from_slice(&v6.flow_label.to_be_bytes()[1..]);
            out.push(v6.next_header);
            out.extend_from_slice(&v6.src);
            out.extend_from_slice(&v6.dst);
        }
    }
}

fn crc_dynamic_ip(ip: &IpHeader, out: &mut Vec<u8>) {
    match ip {
        IpHeader::V4(v4) => {
            out.push(v4.tos);
            out.extend_from_slice(&v4.id.to_be_bytes());
            out.push(u8::from(v4.df) << 6);
            out.push(v4.ttl);
        }
        IpHeader::V6(v6) => {
            out.push(v6.traffic_class);
            out.push(v6.hop_limit);
        }
    }
}

impl HeaderSet {
    /// Flow-identifying fields, in the order CRC-STATIC covers them
    /// (RFC 3095 section 5.9.2)
    pub(crate) fn crc_static_bytes(&self, with_rtp: bool, out: &mut Vec<u8>) {
        if let Some(outer) = &self.outer_ip {
            crc_static_ip(outer, out);
        }
        crc_static_ip(&self.ip, out);
        match &self.transport {
            Transport::None => {}
            Transport::Udp { udp, .. } | Transport::UdpLite(udp) => {
                out.extend_from_slice(&udp.sport.to_be_bytes());
                out.extend_from_slice(&udp.dport.to_be_bytes());
            }
            Transport::Esp(esp) => out.extend_from_slice(&esp.spi.to_be_bytes()),
            Transport::Tcp(tcp) => {
                out.extend_from_slice(&tcp.sport.to_be_bytes());
                out.extend_from_slice(&tcp.dport.to_be_bytes());
            }
        }
        if with_rtp {
            if let Some(rtp) = self.rtp() {
                out.extend_from_slice(&rtp.ssrc.to_be_bytes());
            }
        }
    }

    /// Changing fields, in the order CRC-DYNAMIC covers them
    pub(crate) fn crc_dynamic_bytes(&self, with_rtp: bool, out: &mut Vec<u8>) {
        if let Some(outer) = &self.outer_ip {
            crc_dynamic_ip(outer, out);
        }
        crc_dynamic_ip(&self.ip, out);
        match &self.transport {
            Transport::None => {}
            Transport::Udp { udp, .. } => {
                out.extend_from_slice(&udp.checksum.to_be_bytes());
            }
            Transport::UdpLite(udp) => {
                out.extend_from_slice(&udp.coverage.to_be_bytes());
                out.extend_from_slice(&udp.checksum.to_be_bytes());
            }
            Transport::Esp(esp) => out.extend_from_slice(&esp.sn.to_be_bytes()),
            Transport::Tcp(tcp) => {
                out.extend_from_slice(&tcp.sn.to_be_bytes());
                out.extend_from_slice(&tcp.ack.to_be_bytes());
                out.push(tcp.flags);
                out.extend_from_slice(&tcp.window.to_be_bytes());
                out.extend_from_slice(&tcp.checksum.to_be_bytes());
                out.extend_from_slice(&tcp.urgent.to_be_bytes());
                out.extend_from_slice(&tcp.options);
            }
        }
        if with_rtp {
            if let Some(rtp) = self.rtp() {
                out.push(
                    (u8::from(rtp.padding) << 5) | (u8::from(rtp.extension) << 4)
                        | rtp.csrc.len() as u8,
                );
                out.push((u8::from(rtp.marker) << 7) | rtp.payload_type);
                out.extend_from_slice(&rtp.sn.to_be_bytes());
                out.extend_from_slice(&rtp.ts.to_be_bytes());
                for csrc in &rtp.csrc {
                    out.extend_from_slice(&csrc.to_be_bytes());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp_packet() -> Vec<u8> {
        let headers = HeaderSet {
            outer_ip: None,
            ip: IpHeader::V4(Ipv4Header {
                tos: 0,
                id: 0x1234,
                df: true,
                ttl: 64,
                protocol: IPPROTO_UDP,
                src: [192, 0, 2, 1],
                dst: [192, 0, 2, 2],
            }),
            transport: Transport::Udp {
                udp: UdpHeader {
                    sport: 5004,
                    dport: 5006,
                    coverage: 0,
                    checksum: 0xbeef,
                },
                rtp: Some(RtpHeader {
                    padding: false,
                    extension: false,
                    marker: true,
                    payload_type: 96,
                    sn: 42,
                    ts: 16_000,
                    ssrc: 0xdead_beef,
                    csrc: vec![],
                }),
            },
            base_len: 28,
            rtp_len: 12,
        };
        let mut out = Vec::new();
        write(&headers, true, 4, &mut out);
        out.extend_from_slice(&[1, 2, 3, 4]);
        out
    }

    #[test]
    fn test_parse_write_round_trip() {
        let wire = rtp_packet();
        let parsed = parse(&wire, true).unwrap();
        assert_eq!(parsed.base_len, 28);
        assert_eq!(parsed.rtp_len, 12);
        assert_eq!(parsed.rtp().unwrap().ssrc, 0xdead_beef);

        let mut rebuilt = Vec::new();
        write(&parsed, true, 4, &mut rebuilt);
        rebuilt.extend_from_slice(&wire[40..]);
        assert_eq!(rebuilt, wire);
    }

    #[test]
    fn test_fragment_is_uncompressible() {
        let mut wire = rtp_packet();
        // Set a fragment offset
        wire[6] = 0x20;
        wire[7] = 0x01;
        assert_eq!(parse(&wire, true), Err(RohcError::Malformed));
    }

    #[test]
    fn test_non_rtp_payload_not_misparsed() {
        let mut wire = rtp_packet();
        // Break the RTP version bits; UDP parse must survive
        let base = 28;
        wire[base] = 0x12;
        let parsed = parse(&wire, true).unwrap();
        assert!(parsed.rtp().is_none());
        assert_eq!(parsed.rtp_len, 0);
    }

    #[test]
    fn test_ipv6_round_trip() {
        let headers = HeaderSet {
            outer_ip: None,
            ip: IpHeader::V6(Ipv6Header {
                traffic_class: 0,
                flow_label: 0xabcde,
                next_header: IPPROTO_UDP,
                hop_limit: 64,
                src: [2; 16],
                dst: [3; 16],
            }),
            transport: Transport::Udp {
                udp: UdpHeader {
                    sport: 1000,
                    dport: 2000,
                    coverage: 0,
                    checksum: 0x1111,
                },
                rtp: None,
            },
            base_len: 48,
            rtp_len: 0,
        };
        let mut wire = Vec::new();
        write(&headers, false, 10, &mut wire);
        wire.extend_from_slice(&[0u8; 10]);

        let parsed = parse(&wire, false).unwrap();
        assert_eq!(parsed.ip, headers.ip);
        assert_eq!(parsed.base_len, 48);
    }

    #[test]
    fn test_ip_in_ip_chain() {
        let inner = Ipv4Header {
            tos: 0,
            id: 7,
            df: false,
            ttl: 63,
            protocol: IPPROTO_UDP,
            src: [10, 0, 0, 1],
            dst: [10, 0, 0, 2],
        };
        let outer = Ipv4Header {
            tos: 0,
            id: 9,
            df: false,
            ttl: 64,
            protocol: IPPROTO_IPIP,
            src: [198, 51, 100, 1],
            dst: [198, 51, 100, 2],
        };
        let headers = HeaderSet {
            outer_ip: Some(IpHeader::V4(outer)),
            ip: IpHeader::V4(inner),
            transport: Transport::Udp {
                udp: UdpHeader {
                    sport: 1,
                    dport: 2,
                    coverage: 0,
                    checksum: 0,
                },
                rtp: None,
            },
            base_len: 48,
            rtp_len: 0,
        };
        let mut wire = Vec::new();
        write(&headers, false, 0, &mut wire);

        let parsed = parse(&wire, false).unwrap();
        assert!(parsed.outer_ip.is_some());
        assert_eq!(parsed.ip, headers.ip);
    }

    #[test]
    fn test_crc_streams_differ_on_dynamic_change() {
        let wire = rtp_packet();
        let a = parse(&wire, true).unwrap();
        let mut b = a.clone();
        b.rtp_mut().unwrap().sn += 1;

        let (mut sa, mut sb, mut da, mut db) = (Vec::new(), Vec::new(), Vec::new(), Vec::new());
        a.crc_static_bytes(true, &mut sa);
        b.crc_static_bytes(true, &mut sb);
        a.crc_dynamic_bytes(true, &mut da);
        b.crc_dynamic_bytes(true, &mut db);
        assert_eq!(sa, sb);
        assert_ne!(da, db);
    }
}
