//! Profile handlers
//!
//! Each profile is a capability set (classify, chains, packet selection,
//! encode, parse, reconstruct) dispatched over a tagged per-profile
//! context variant. The RFC 3095 profiles (IP-only, UDP, UDP-Lite, RTP,
//! ESP) share one generic engine parameterized by the profile id; the
//! Uncompressed and TCP profiles have their own shapes.

pub(crate) mod chains;
pub(crate) mod comp;
pub(crate) mod decomp;
pub(crate) mod ext;
pub(crate) mod tcp;
pub(crate) mod uncompressed;

use crate::{
    ProfileId,
    headers::{HeaderSet, IpHeader, Transport},
    lsb::LsbShift,
};

/// Packed set of enabled profiles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ProfileSet {
    bits: u8,
}

impl ProfileSet {
    fn bit(profile: ProfileId) -> u8 {
        match profile {
            ProfileId::Uncompressed => 1 << 0,
            ProfileId::Rtp => 1 << 1,
            ProfileId::Udp => 1 << 2,
            ProfileId::Esp => 1 << 3,
            ProfileId::Ip => 1 << 4,
            ProfileId::Tcp => 1 << 5,
            ProfileId::UdpLite => 1 << 6,
        }
    }

    pub(crate) fn insert(&mut self, profile: ProfileId) {
        self.bits |= Self::bit(profile);
    }

    pub(crate) fn contains(self, profile: ProfileId) -> bool {
        self.bits & Self::bit(profile) != 0
    }
}

/// Map a parsed packet to the best enabled profile
///
/// Falls back to [`ProfileId::Uncompressed`] when nothing more specific
/// is enabled; that profile is always available.
pub(crate) fn classify(headers: &HeaderSet, enabled: ProfileSet) -> ProfileId {
    let candidate = match &headers.transport {
        Transport::Udp { rtp: Some(_), .. } if enabled.contains(ProfileId::Rtp) => ProfileId::Rtp,
        Transport::Udp { .. } => ProfileId::Udp,
        Transport::UdpLite(_) => ProfileId::UdpLite,
        Transport::Esp(_) => ProfileId::Esp,
        Transport::Tcp(_) => ProfileId::Tcp,
        Transport::None => ProfileId::Ip,
    };
    if enabled.contains(candidate) {
        return candidate;
    }
    // A flow whose transport profile is disabled can still have its IP
    // chain compressed
    if enabled.contains(ProfileId::Ip) {
        return ProfileId::Ip;
    }
    ProfileId::Uncompressed
}

/// Restrict a header set to what `profile` covers
///
/// The IP-only profile treats transport headers as payload; the UDP
/// profile does the same with a recognized RTP header.
pub(crate) fn scope_headers(headers: &HeaderSet, profile: ProfileId) -> HeaderSet {
    let mut scoped = headers.clone();
    match profile {
        ProfileId::Ip => {
            scoped.base_len = scoped.outer_ip.as_ref().map_or(0, IpHeader::wire_len)
                + scoped.ip.wire_len();
            scoped.transport = Transport::None;
            scoped.rtp_len = 0;
        }
        ProfileId::Udp | ProfileId::UdpLite | ProfileId::Esp | ProfileId::Tcp => {
            if let Transport::Udp { rtp, .. } = &mut scoped.transport {
                *rtp = None;
            }
            scoped.rtp_len = 0;
        }
        ProfileId::Rtp | ProfileId::Uncompressed => {}
    }
    scoped
}

/// The sequence number the profile compresses against
///
/// RTP and ESP carry their own; the other profiles use a
/// compressor-generated SN carried in the dynamic chain.
pub(crate) fn flow_sn(headers: &HeaderSet, profile: ProfileId, generated: u32) -> u32 {
    match (profile, &headers.transport) {
        (ProfileId::Rtp, Transport::Udp { rtp: Some(rtp), .. }) => u32::from(rtp.sn),
        (ProfileId::Esp, Transport::Esp(esp)) => esp.sn,
        _ => generated,
    }
}

/// SN field width in bits
pub(crate) fn sn_width(profile: ProfileId) -> u8 {
    match profile {
        ProfileId::Esp => 32,
        _ => 16,
    }
}

/// SN interpretation-interval policy
pub(crate) fn sn_shift(profile: ProfileId) -> LsbShift {
    match profile {
        ProfileId::Rtp => LsbShift::RtpSn,
        _ => LsbShift::Sn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::{EspHeader, Ipv4Header, UdpHeader};

    fn udp_headers() -> HeaderSet {
        HeaderSet {
            outer_ip: None,
            ip: IpHeader::V4(Ipv4Header {
                tos: 0,
                id: 1,
                df: false,
                ttl: 64,
                protocol: crate::headers::IPPROTO_UDP,
                src: [10, 0, 0, 1],
                dst: [10, 0, 0, 2],
            }),
            transport: Transport::Udp {
                udp: UdpHeader {
                    sport: 4000,
                    dport: 4001,
                    coverage: 0,
                    checksum: 0,
                },
                rtp: None,
            },
            base_len: 28,
            rtp_len: 0,
        }
    }

    #[test]
    fn test_classify_prefers_transport_profile() {
        let mut enabled = ProfileSet::default();
        enabled.insert(ProfileId::Udp);
        enabled.insert(ProfileId::Ip);
        assert_eq!(classify(&udp_headers(), enabled), ProfileId::Udp);
    }

    #[test]
    fn test_classify_falls_back_to_ip_then_uncompressed() {
        let mut ip_only = ProfileSet::default();
        ip_only.insert(ProfileId::Ip);
        assert_eq!(classify(&udp_headers(), ip_only), ProfileId::Ip);

        let none = ProfileSet::default();
        assert_eq!(classify(&udp_headers(), none), ProfileId::Uncompressed);
    }

    #[test]
    fn test_scope_ip_only_strips_transport() {
        let scoped = scope_headers(&udp_headers(), ProfileId::Ip);
        assert_eq!(scoped.transport, Transport::None);
        assert_eq!(scoped.base_len, 20);
    }

    #[test]
    fn test_flow_sn_sources() {
        let mut headers = udp_headers();
        assert_eq!(flow_sn(&headers, ProfileId::Udp, 77), 77);
        headers.transport = Transport::Esp(EspHeader { spi: 9, sn: 1234 });
        assert_eq!(flow_sn(&headers, ProfileId::Esp, 77), 1234);
    }
}
