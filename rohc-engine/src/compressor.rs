//! The compressor half of the engine
//!
//! Owns the context table, classifies packets onto profiles, drives the
//! per-context engines and wraps their core packets in the CID layer.
//! One instance per channel direction; calls never suspend and reuse the
//! engine-owned scratch buffers.

use hashbrown::HashMap;

use crate::{
    CidType, ProfileId,
    context::ContextTable,
    cursor::ByteCursor,
    error::{RohcError, RohcResult},
    feedback,
    headers::{self, HeaderSet, IpHeader, Transport},
    packet::{PacketKind, kind_of},
    profiles::{
        ProfileSet, classify,
        comp::{self, CompConfig, GenericCtx},
        scope_headers,
        tcp::{self, TcpCtx},
        uncompressed::{self, UncompCtx},
    },
    sdvl, segment,
};

/// Flow classifier key; contexts are matched on it before the static
/// chain is compared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    src: [u8; 16],
    dst: [u8; 16],
    proto: u8,
    sport: u16,
    dport: u16,
    spi: u32,
    profile: ProfileId,
}

fn addr_of(ip: &IpHeader) -> ([u8; 16], [u8; 16]) {
    match ip {
        IpHeader::V4(v4) => {
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src[..4].copy_from_slice(&v4.src);
            dst[..4].copy_from_slice(&v4.dst);
            (src, dst)
        }
        IpHeader::V6(v6) => (v6.src, v6.dst),
    }
}

fn flow_key(headers: Option<&HeaderSet>, profile: ProfileId) -> FlowKey {
    let mut key = FlowKey {
        src: [0; 16],
        dst: [0; 16],
        proto: 0,
        sport: 0,
        dport: 0,
        spi: 0,
        profile,
    };
    let Some(headers) = headers else {
        return key;
    };
    (key.src, key.dst) = addr_of(&headers.ip);
    key.proto = headers.ip.protocol();
    match &headers.transport {
        Transport::Udp { udp, .. } | Transport::UdpLite(udp) => {
            key.sport = udp.sport;
            key.dport = udp.dport;
        }
        Transport::Esp(esp) => key.spi = esp.spi,
        Transport::Tcp(tcp) => {
            key.sport = tcp.sport;
            key.dport = tcp.dport;
        }
        Transport::None => {}
    }
    key
}

/// Per-profile compressor context, dispatched by profile id
enum ProfCtx {
    Uncompressed(UncompCtx),
    Ip(GenericCtx),
    Udp(GenericCtx),
    UdpLite(GenericCtx),
    Rtp(GenericCtx),
    Esp(GenericCtx),
    Tcp(TcpCtx),
}

impl ProfCtx {
    fn generic_mut(&mut self) -> Option<&mut GenericCtx> {
        match self {
            Self::Ip(ctx) | Self::Udp(ctx) | Self::UdpLite(ctx) | Self::Rtp(ctx)
            | Self::Esp(ctx) => Some(ctx),
            Self::Uncompressed(_) | Self::Tcp(_) => None,
        }
    }
}

struct CContext {
    key: FlowKey,
    last_used: u64,
    prof: ProfCtx,
}

/// One compressed packet, borrowed from the engine's scratch buffer
pub struct CompressOutcome<'a> {
    /// Piggybacked feedback plus the ROHC packet
    pub packet: &'a [u8],
    /// Context the flow was mapped to
    pub cid: u16,
    /// Profile that compressed the packet
    pub profile: ProfileId,
}

/// ROHC compressor for one channel direction
pub struct Compressor {
    cid_type: CidType,
    contexts: ContextTable<CContext>,
    by_key: HashMap<FlowKey, u16>,
    enabled: ProfileSet,
    cfg: CompConfig,
    mrru: usize,
    scratch: Vec<u8>,
    core: Vec<u8>,
    piggyback: Vec<u8>,
    opcount: u64,
    rng: Option<fn() -> u32>,
}

impl Compressor {
    /// Create a compressor for up to `max_cid + 1` simultaneous flows
    ///
    /// `max_cid` must fit the CID space of `cid_type` (15 for small,
    /// 16383 for large). The Uncompressed profile is always enabled.
    #[must_use]
    pub fn new(max_cid: u16, cid_type: CidType, profiles: &[ProfileId]) -> Self {
        let max_cid = match cid_type {
            CidType::Small => max_cid.min(15),
            CidType::Large => max_cid.min(16383),
        };
        let mut enabled = ProfileSet::default();
        enabled.insert(ProfileId::Uncompressed);
        for profile in profiles {
            enabled.insert(*profile);
        }
        Self {
            cid_type,
            contexts: ContextTable::new(max_cid),
            by_key: HashMap::new(),
            enabled,
            cfg: CompConfig::default(),
            mrru: 0,
            scratch: Vec::with_capacity(2048),
            core: Vec::with_capacity(2048),
            piggyback: Vec::new(),
            opcount: 0,
            rng: None,
        }
    }

    /// Enable an additional profile
    pub fn enable_profile(&mut self, profile: ProfileId) {
        self.enabled.insert(profile);
    }

    /// Maximum reconstructed reception unit; 0 disables segmentation
    pub fn set_mrru(&mut self, mrru: usize) {
        self.mrru = mrru;
    }

    /// W-LSB window capacity, clamped to 4..=64 entries
    ///
    /// Applies to contexts created afterwards.
    pub fn set_wlsb_window_width(&mut self, width: usize) {
        self.cfg.window_width = width.clamp(4, 64);
    }

    /// Packet counts between forced IR and FO refreshes
    pub fn set_periodic_refresh(&mut self, ir_timeout: u32, fo_timeout: u32) {
        self.cfg.ir_timeout = ir_timeout.max(1);
        self.cfg.fo_timeout = fo_timeout.max(1);
    }

    /// Optimistic-approach repeat count (L)
    pub fn set_optimistic_count(&mut self, count: u32) {
        self.cfg.optimistic_count = count.max(1);
    }

    /// RNG used to seed the generated SN of the SN-less profiles
    pub fn set_rng(&mut self, rng: fn() -> u32) {
        self.rng = Some(rng);
    }

    /// Queue a feedback element (as produced by a local decompressor)
    /// for piggybacking on the next compressed packet
    pub fn queue_piggyback(&mut self, element: &[u8]) {
        self.piggyback.extend_from_slice(element);
    }

    /// Compress one IP packet into a ROHC packet
    pub fn compress(&mut self, packet: &[u8]) -> RohcResult<CompressOutcome<'_>> {
        self.opcount += 1;

        let parsed = headers::parse(packet, true).ok();
        let profile = parsed
            .as_ref()
            .map_or(ProfileId::Uncompressed, |headers| {
                classify(headers, self.enabled)
            });
        let scoped = if matches!(profile, ProfileId::Uncompressed) {
            None
        } else {
            parsed.as_ref().map(|headers| scope_headers(headers, profile))
        };
        let key = flow_key(scoped.as_ref(), profile);

        let cid = self.lookup_or_create(key, scoped.as_ref())?;
        let opcount = self.opcount;
        let cfg = self.cfg;

        self.core.clear();
        let context = self
            .contexts
            .get_mut(cid)
            .ok_or(RohcError::Internal("context vanished after lookup"))?;
        context.last_used = opcount;

        match (&mut context.prof, &scoped) {
            (ProfCtx::Uncompressed(ctx), _) => {
                uncompressed::compress(ctx, cfg.optimistic_count, packet, &mut self.core);
            }
            (ProfCtx::Tcp(ctx), Some(headers)) => {
                let payload = &packet[headers.header_len(false)..];
                tcp::compress(
                    ctx,
                    cfg.optimistic_count,
                    profile.to_octet(),
                    headers,
                    payload,
                    &mut self.core,
                )?;
            }
            (prof, Some(headers)) => {
                let Some(ctx) = prof.generic_mut() else {
                    return Err(RohcError::Internal("profile dispatch mismatch"));
                };
                let payload = &packet[headers.header_len(profile.with_rtp())..];
                comp::compress(ctx, &cfg, headers, payload, &mut self.core)?;
            }
            (_, None) => {
                return Err(RohcError::Internal("compressible profile without headers"));
            }
        }

        self.scratch.clear();
        self.scratch.extend_from_slice(&self.piggyback);
        self.piggyback.clear();
        frame_core(&self.core, cid, self.cid_type, &mut self.scratch)?;

        log::trace!(
            "compressed {} bytes to {} on CID {cid} ({profile})",
            packet.len(),
            self.scratch.len(),
        );
        Ok(CompressOutcome {
            packet: &self.scratch,
            cid,
            profile,
        })
    }

    /// Deliver feedback received from the remote decompressor
    ///
    /// Accepts one or more concatenated feedback elements, as returned
    /// in `received_feedback` by a decompressor or taken off a feedback
    /// channel.
    pub fn deliver_feedback(&mut self, bytes: &[u8]) -> RohcResult<()> {
        let mut cursor = ByteCursor::new(bytes);
        while cursor.remaining_len() > 0 {
            let Some(first) = cursor.peek_u8() else {
                break;
            };
            if kind_of(first) != PacketKind::Feedback {
                return Err(RohcError::Malformed);
            }
            let element = feedback::read_element(&mut cursor)?;
            match feedback::parse(element, self.cid_type) {
                Ok(parsed) => {
                    self.opcount += 1;
                    let opcount = self.opcount;
                    if let Some(context) = self.contexts.get_mut(parsed.cid) {
                        context.last_used = opcount;
                        if let Some(ctx) = context.prof.generic_mut() {
                            ctx.on_feedback(&parsed);
                        }
                    } else {
                        log::debug!("feedback for unknown CID {}", parsed.cid);
                    }
                }
                Err(_) => {
                    // A corrupt element is dropped; later elements in
                    // the same buffer are still usable
                    log::debug!("discarding malformed feedback element");
                }
            }
        }
        Ok(())
    }

    /// Split an already-compressed unit into link-sized segments
    ///
    /// Requires MRRU > 0 on both ends; the unit must fit the peer's
    /// MRRU including the 4-byte FCS.
    pub fn segment(&self, unit: &[u8], max_segment: usize) -> RohcResult<Vec<Vec<u8>>> {
        if self.mrru == 0 || unit.len() > self.mrru {
            return Err(RohcError::Segment);
        }
        let mut segments = Vec::new();
        segment::split(unit, max_segment, &mut segments)?;
        Ok(segments)
    }

    /// Drop the context for `cid`; its flow re-establishes with an IR
    pub fn flush(&mut self, cid: u16) {
        if let Some(context) = self.contexts.remove(cid) {
            self.by_key.remove(&context.key);
        }
    }

    /// Number of live contexts
    #[must_use]
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    fn lookup_or_create(
        &mut self,
        key: FlowKey,
        scoped: Option<&HeaderSet>,
    ) -> RohcResult<u16> {
        if let Some(&cid) = self.by_key.get(&key) {
            let context = self
                .contexts
                .get(cid)
                .ok_or(RohcError::Internal("flow map out of sync"))?;
            let matches = match (&context.prof, scoped) {
                (ProfCtx::Uncompressed(_), _) => true,
                (ProfCtx::Tcp(ctx), Some(headers)) => ctx.static_matches(headers),
                (ProfCtx::Ip(ctx), Some(headers))
                | (ProfCtx::Udp(ctx), Some(headers))
                | (ProfCtx::UdpLite(ctx), Some(headers))
                | (ProfCtx::Rtp(ctx), Some(headers))
                | (ProfCtx::Esp(ctx), Some(headers)) => ctx.static_matches(headers),
                _ => false,
            };
            if matches {
                return Ok(cid);
            }
            // Same flow key, new static chain (e.g. a fresh SSRC):
            // reinitialize in place and start over with IR
            log::debug!("static chain changed on CID {cid}, reinitializing");
            let prof = self.make_context(key.profile, scoped)?;
            self.contexts.insert(
                cid,
                CContext {
                    key,
                    last_used: self.opcount,
                    prof,
                },
            );
            return Ok(cid);
        }

        let cid = match self.contexts.free_cid() {
            Some(cid) => cid,
            None => {
                let victim = self.contexts.lru_cid().ok_or(RohcError::NoContext)?;
                let victim_ctx = self
                    .contexts
                    .get(victim)
                    .ok_or(RohcError::Internal("LRU points at empty slot"))?;
                if victim_ctx.last_used >= self.opcount {
                    // Everything is in use by the current call
                    return Err(RohcError::NoContext);
                }
                log::debug!("evicting LRU context on CID {victim}");
                self.flush(victim);
                victim
            }
        };

        let prof = self.make_context(key.profile, scoped)?;
        self.contexts.insert(
            cid,
            CContext {
                key,
                last_used: self.opcount,
                prof,
            },
        );
        self.by_key.insert(key, cid);
        Ok(cid)
    }

    fn make_context(
        &self,
        profile: ProfileId,
        scoped: Option<&HeaderSet>,
    ) -> RohcResult<ProfCtx> {
        let initial_sn = self.rng.map_or(0, |rng| rng());
        Ok(match (profile, scoped) {
            (ProfileId::Uncompressed, _) => ProfCtx::Uncompressed(UncompCtx::new()),
            (ProfileId::Tcp, Some(headers)) => ProfCtx::Tcp(TcpCtx::new(headers)),
            (ProfileId::Ip, Some(headers)) => {
                ProfCtx::Ip(GenericCtx::new(profile, headers, &self.cfg, initial_sn))
            }
            (ProfileId::Udp, Some(headers)) => {
                ProfCtx::Udp(GenericCtx::new(profile, headers, &self.cfg, initial_sn))
            }
            (ProfileId::UdpLite, Some(headers)) => {
                ProfCtx::UdpLite(GenericCtx::new(profile, headers, &self.cfg, initial_sn))
            }
            (ProfileId::Rtp, Some(headers)) => {
                ProfCtx::Rtp(GenericCtx::new(profile, headers, &self.cfg, initial_sn))
            }
            (ProfileId::Esp, Some(headers)) => {
                ProfCtx::Esp(GenericCtx::new(profile, headers, &self.cfg, initial_sn))
            }
            _ => return Err(RohcError::Internal("profile without parsed headers")),
        })
    }
}

/// Wrap a core packet in the CID layer
fn frame_core(core: &[u8], cid: u16, cid_type: CidType, out: &mut Vec<u8>) -> RohcResult<()> {
    let Some(first) = core.first() else {
        return Err(RohcError::Internal("empty core packet"));
    };
    match cid_type {
        CidType::Small => {
            if cid != 0 {
                out.push(0b1110_0000 | cid as u8);
            }
            out.extend_from_slice(core);
        }
        CidType::Large => {
            // Large CIDs ride between the type octet and the rest
            out.push(*first);
            sdvl::encode(u32::from(cid), out)?;
            out.extend_from_slice(&core[1..]);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp_packet(sport: u16, sn_like_id: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[0x45, 0x00]);
        out.extend_from_slice(&28u16.to_be_bytes());
        out.extend_from_slice(&sn_like_id.to_be_bytes());
        out.extend_from_slice(&[0x40, 0x00, 64, 17]);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&[10, 0, 0, 1]);
        out.extend_from_slice(&[10, 0, 0, 2]);
        // Fix the IPv4 checksum
        let mut sum = 0u32;
        for chunk in out.chunks(2) {
            sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        let checksum = !(sum as u16);
        out[10..12].copy_from_slice(&checksum.to_be_bytes());

        out.extend_from_slice(&sport.to_be_bytes());
        out.extend_from_slice(&9999u16.to_be_bytes());
        out.extend_from_slice(&8u16.to_be_bytes());
        out.extend_from_slice(&[0, 0]);
        out
    }

    #[test]
    fn test_contexts_multiplex_by_flow() {
        let mut compressor = Compressor::new(
            15,
            CidType::Small,
            &[ProfileId::Udp, ProfileId::Ip],
        );
        let first = compressor.compress(&udp_packet(1000, 1)).unwrap();
        assert_eq!(first.cid, 0);
        assert_eq!(first.profile, ProfileId::Udp);
        let second = compressor.compress(&udp_packet(2000, 1)).unwrap();
        assert_eq!(second.cid, 1);
        let again = compressor.compress(&udp_packet(1000, 2)).unwrap();
        assert_eq!(again.cid, 0);
        assert_eq!(compressor.context_count(), 2);
    }

    #[test]
    fn test_add_cid_only_for_nonzero() {
        let mut compressor =
            Compressor::new(15, CidType::Small, &[ProfileId::Udp]);
        let first = compressor.compress(&udp_packet(1000, 1)).unwrap();
        // CID 0: the IR type octet comes first
        assert_eq!(first.packet[0] & 0b1111_1110, 0b1111_1100);
        let second = compressor.compress(&udp_packet(2000, 1)).unwrap();
        assert_eq!(second.packet[0], 0b1110_0001);
    }

    #[test]
    fn test_lru_eviction_reuses_oldest() {
        let mut compressor = Compressor::new(1, CidType::Small, &[ProfileId::Udp]);
        compressor.compress(&udp_packet(1000, 1)).unwrap();
        compressor.compress(&udp_packet(2000, 1)).unwrap();
        assert_eq!(compressor.context_count(), 2);
        // A third flow evicts the least recently used (sport 1000)
        let outcome = compressor.compress(&udp_packet(3000, 1)).unwrap();
        assert_eq!(outcome.cid, 0);
        assert_eq!(compressor.context_count(), 2);
    }

    #[test]
    fn test_unparseable_falls_back_to_uncompressed() {
        let mut compressor = Compressor::new(15, CidType::Small, &[ProfileId::Udp]);
        let garbage = [0x12u8, 0x34, 0x56];
        let outcome = compressor.compress(&garbage).unwrap();
        assert_eq!(outcome.profile, ProfileId::Uncompressed);
        // IR for the Uncompressed profile carries the original bytes
        assert_eq!(&outcome.packet[3..], &garbage);
    }

    #[test]
    fn test_piggyback_precedes_packet() {
        let mut compressor = Compressor::new(15, CidType::Small, &[ProfileId::Udp]);
        compressor.queue_piggyback(&[0xf1, 0x2a]);
        let outcome = compressor.compress(&udp_packet(1000, 1)).unwrap();
        assert_eq!(&outcome.packet[..2], &[0xf1, 0x2a]);
        // Consumed: the next packet has no feedback in front
        let outcome = compressor.compress(&udp_packet(1000, 2)).unwrap();
        assert_ne!(outcome.packet[0], 0xf1);
    }
}
