//! Profile 0x0006, IP/TCP (RFC 6846)
//!
//! Staged implementation: the full static and dynamic chains with exact
//! reconstruction, carried by IR and IR-DYN. The CO packet family of
//! RFC 6846 is a later stage; until then TCP flows refresh their dynamic
//! chain on every packet, which still removes the static fields and
//! keeps the context machinery uniform with the other profiles.

use crate::{
    context::CompressorState,
    cursor::ByteCursor,
    encodings::IpIdBehavior,
    error::{RohcError, RohcResult},
    headers::{HeaderSet, IPPROTO_IPIP, IPPROTO_IPV6, TcpHeader, Transport},
    profiles::chains,
};

/// Compressor context for the TCP profile
pub(crate) struct TcpCtx {
    pub state: CompressorState,
    run: u32,
    last: HeaderSet,
}

impl TcpCtx {
    pub(crate) fn new(headers: &HeaderSet) -> Self {
        Self {
            state: CompressorState::Ir,
            run: 0,
            last: headers.clone(),
        }
    }

    pub(crate) fn static_matches(&self, headers: &HeaderSet) -> bool {
        let chain_ok = self.last.ip.same_static(&headers.ip)
            && match (&self.last.outer_ip, &headers.outer_ip) {
                (None, None) => true,
                (Some(a), Some(b)) => a.same_static(b),
                _ => false,
            };
        chain_ok
            && match (&self.last.transport, &headers.transport) {
                (Transport::Tcp(a), Transport::Tcp(b)) => {
                    a.sport == b.sport && a.dport == b.dport
                }
                _ => false,
            }
    }
}

fn tcp_of(headers: &HeaderSet) -> RohcResult<&TcpHeader> {
    match &headers.transport {
        Transport::Tcp(tcp) => Ok(tcp),
        _ => Err(RohcError::Internal("TCP profile without TCP header")),
    }
}

fn build_static_chain(headers: &HeaderSet, out: &mut Vec<u8>) -> RohcResult<()> {
    if let Some(outer) = &headers.outer_ip {
        chains::build_static_ip(outer, out);
    }
    chains::build_static_ip(&headers.ip, out);
    let tcp = tcp_of(headers)?;
    out.extend_from_slice(&tcp.sport.to_be_bytes());
    out.extend_from_slice(&tcp.dport.to_be_bytes());
    Ok(())
}

fn build_dynamic_chain(headers: &HeaderSet, out: &mut Vec<u8>) -> RohcResult<()> {
    if let Some(outer) = &headers.outer_ip {
        chains::build_dynamic_ip(outer, IpIdBehavior::SEQUENTIAL, out);
    }
    chains::build_dynamic_ip(&headers.ip, IpIdBehavior::SEQUENTIAL, out);
    let tcp = tcp_of(headers)?;
    out.extend_from_slice(&tcp.sn.to_be_bytes());
    out.extend_from_slice(&tcp.ack.to_be_bytes());
    out.push(tcp.flags);
    out.extend_from_slice(&tcp.window.to_be_bytes());
    out.extend_from_slice(&tcp.checksum.to_be_bytes());
    out.extend_from_slice(&tcp.urgent.to_be_bytes());
    debug_assert!(tcp.options.len() <= 40 && tcp.options.len() % 4 == 0);
    out.push(tcp.options.len() as u8);
    out.extend_from_slice(&tcp.options);
    Ok(())
}

/// Build the IR (or IR-DYN once established) core packet
pub(crate) fn compress(
    ctx: &mut TcpCtx,
    optimistic_count: u32,
    profile_octet: u8,
    headers: &HeaderSet,
    payload: &[u8],
    out: &mut Vec<u8>,
) -> RohcResult<()> {
    let start = out.len();
    let full = ctx.state == CompressorState::Ir;
    out.push(if full { 0b1111_1101 } else { 0b1111_1000 });
    out.push(profile_octet);
    let crc_pos = out.len();
    out.push(0);
    if full {
        build_static_chain(headers, out)?;
    }
    build_dynamic_chain(headers, out)?;
    out[crc_pos] = 0;
    out[crc_pos] = crate::crc::crc8(&out[start..], crate::crc::CRC8_INIT);
    out.extend_from_slice(payload);

    if full {
        ctx.run += 1;
        if ctx.run >= optimistic_count {
            ctx.state = CompressorState::Fo;
            ctx.run = 0;
        }
    }
    ctx.last = headers.clone();
    Ok(())
}

/// Parse a TCP static chain into a header set with defaulted dynamics
pub(crate) fn parse_static_chain(cursor: &mut ByteCursor<'_>) -> RohcResult<HeaderSet> {
    let first_ip = chains::parse_static_ip(cursor)?;
    let (outer_ip, ip) = if matches!(first_ip.protocol(), IPPROTO_IPIP | IPPROTO_IPV6) {
        (Some(first_ip), chains::parse_static_ip(cursor)?)
    } else {
        (None, first_ip)
    };
    let sport = cursor.read_u16()?;
    let dport = cursor.read_u16()?;
    let transport = Transport::Tcp(TcpHeader {
        sport,
        dport,
        sn: 0,
        ack: 0,
        flags: 0,
        window: 0,
        checksum: 0,
        urgent: 0,
        options: Vec::new(),
    });
    let base_len = outer_ip.as_ref().map_or(0, crate::headers::IpHeader::wire_len)
        + ip.wire_len()
        + 20;

    Ok(HeaderSet {
        outer_ip,
        ip,
        transport,
        base_len,
        rtp_len: 0,
    })
}

/// Parse a TCP dynamic chain over a header set
pub(crate) fn parse_dynamic_chain(
    cursor: &mut ByteCursor<'_>,
    headers: &mut HeaderSet,
) -> RohcResult<()> {
    if let Some(outer) = &mut headers.outer_ip {
        chains::parse_dynamic_ip(cursor, outer)?;
    }
    chains::parse_dynamic_ip(cursor, &mut headers.ip)?;
    let Transport::Tcp(tcp) = &mut headers.transport else {
        return Err(RohcError::Internal("TCP chain without TCP transport"));
    };
    tcp.sn = cursor.read_u32()?;
    tcp.ack = cursor.read_u32()?;
    tcp.flags = cursor.read_u8()?;
    tcp.window = cursor.read_u16()?;
    tcp.checksum = cursor.read_u16()?;
    tcp.urgent = cursor.read_u16()?;
    let options_len = usize::from(cursor.read_u8()?);
    if options_len > 40 || options_len % 4 != 0 {
        return Err(RohcError::Malformed);
    }
    tcp.options = cursor.take(options_len)?.to_vec();
    headers.base_len = headers.outer_ip.as_ref().map_or(0, crate::headers::IpHeader::wire_len)
        + headers.ip.wire_len()
        + 20
        + options_len;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::{self, IPPROTO_TCP, IpHeader, Ipv4Header};

    fn tcp_headers() -> HeaderSet {
        HeaderSet {
            outer_ip: None,
            ip: IpHeader::V4(Ipv4Header {
                tos: 0,
                id: 0x0a0b,
                df: true,
                ttl: 62,
                protocol: IPPROTO_TCP,
                src: [10, 1, 1, 1],
                dst: [10, 1, 1, 2],
            }),
            transport: Transport::Tcp(TcpHeader {
                sport: 443,
                dport: 51234,
                sn: 0x1122_3344,
                ack: 0x5566_7788,
                flags: 0x18,
                window: 0xffff,
                checksum: 0xabcd,
                urgent: 0,
                options: vec![0x01, 0x01, 0x01, 0x00],
            }),
            base_len: 44,
            rtp_len: 0,
        }
    }

    #[test]
    fn test_ir_round_trip() {
        let headers = tcp_headers();
        let mut ctx = TcpCtx::new(&headers);
        let mut packet = Vec::new();
        compress(&mut ctx, 4, 0x06, &headers, b"hello", &mut packet).unwrap();

        let mut cursor = ByteCursor::new(&packet);
        assert_eq!(cursor.read_u8().unwrap(), 0xfd);
        assert_eq!(cursor.read_u8().unwrap(), 0x06);
        let _crc = cursor.read_u8().unwrap();
        let mut parsed = parse_static_chain(&mut cursor).unwrap();
        parse_dynamic_chain(&mut cursor, &mut parsed).unwrap();
        assert_eq!(parsed, headers);
        assert_eq!(cursor.remaining(), b"hello");

        let mut rebuilt = Vec::new();
        headers::write(&parsed, false, 5, &mut rebuilt);
        rebuilt.extend_from_slice(b"hello");
        assert_eq!(rebuilt.len(), 44 + 5);
    }

    #[test]
    fn test_ir_dyn_after_establishment() {
        let headers = tcp_headers();
        let mut ctx = TcpCtx::new(&headers);
        for _ in 0..4 {
            let mut packet = Vec::new();
            compress(&mut ctx, 4, 0x06, &headers, b"", &mut packet).unwrap();
        }
        let mut packet = Vec::new();
        compress(&mut ctx, 4, 0x06, &headers, b"", &mut packet).unwrap();
        assert_eq!(packet[0], 0xf8);
    }
}
