//! Decompressor side of the generic RFC 3095 engine
//!
//! Parses the UO-0/UO-1*/UOR-2* families plus extensions, reconstructs
//! the header chain from the context reference, and accepts the result
//! only when the packet CRC matches. Repair attempts (SN wraparound,
//! older references) run before a failure is surfaced; repeated failures
//! drive the NC/SC/FC downgrades.

use crate::{
    ProfileId,
    context::{DecompressorState, Mode},
    crc::{self, CRC3_INIT, CRC7_INIT},
    cursor::ByteCursor,
    encodings::IpIdBehavior,
    error::{RohcError, RohcResult},
    headers::{self, HeaderSet, IpHeader, Transport},
    lsb::{LsbShift, decode_lsb},
    profiles::{
        chains::{self, DynInfo},
        ext::{Ext3, Extension, self},
        sn_shift, sn_width,
    },
};

/// Decompressor tuning knobs
#[derive(Debug, Clone, Copy)]
pub(crate) struct DecompConfig {
    /// Consecutive CRC failures before FC drops to SC
    pub k1: u32,
    /// Consecutive failures in SC before dropping to NC
    pub k2: u32,
}

impl Default for DecompConfig {
    fn default() -> Self {
        Self { k1: 2, k2: 2 }
    }
}

/// Reference values a repair attempt can decode against
#[derive(Debug, Clone, Copy)]
struct RefSnapshot {
    sn: u32,
    ts: u32,
    inner_off: u16,
    outer_off: u16,
}

/// Per-context decompressor state of the generic engine
pub(crate) struct GenericDctx {
    pub profile: ProfileId,
    pub state: DecompressorState,
    pub mode: Mode,
    reference: HeaderSet,
    sn_ref: u32,
    history: [Option<RefSnapshot>; 3],
    inner_behavior: IpIdBehavior,
    inner_off: u16,
    outer_behavior: IpIdBehavior,
    outer_off: u16,
    ts_stride: Option<u32>,
    udp_checksum_enabled: bool,
    pub csrc_table: [Option<u32>; 16],
    crc_failures: u32,
    crc3_static: u8,
    crc7_static: u8,
}

fn ref_ts(reference: &HeaderSet) -> u32 {
    reference.rtp().map_or(0, |rtp| rtp.ts)
}

fn offset_of(behavior: IpIdBehavior, ip: &IpHeader, sn: u32) -> u16 {
    match ip {
        IpHeader::V4(v4) => behavior.ordered(v4.id).wrapping_sub(sn as u16),
        IpHeader::V6(_) => 0,
    }
}

impl GenericDctx {
    /// Establish a context from a verified IR
    pub(crate) fn new_from_ir(
        profile: ProfileId,
        headers: HeaderSet,
        info: Option<&DynInfo>,
        csrc_table: [Option<u32>; 16],
    ) -> Self {
        let (crc3_static, crc7_static) = static_crcs(&headers, profile);
        let mut dctx = Self {
            profile,
            state: if info.is_some() {
                DecompressorState::FullContext
            } else {
                DecompressorState::StaticContext
            },
            mode: Mode::Unidirectional,
            reference: headers,
            sn_ref: 0,
            history: [None; 3],
            inner_behavior: IpIdBehavior::SEQUENTIAL,
            inner_off: 0,
            outer_behavior: IpIdBehavior::SEQUENTIAL,
            outer_off: 0,
            ts_stride: None,
            udp_checksum_enabled: false,
            csrc_table,
            crc_failures: 0,
            crc3_static,
            crc7_static,
        };
        if let Some(info) = info {
            dctx.install_dyn(info);
        }
        dctx
    }

    /// Install a freshly parsed dynamic chain (IR or IR-DYN)
    pub(crate) fn apply_ir_dyn(&mut self, headers: HeaderSet, info: &DynInfo) {
        self.reference = headers;
        self.install_dyn(info);
        let (crc3_static, crc7_static) = static_crcs(&self.reference, self.profile);
        self.crc3_static = crc3_static;
        self.crc7_static = crc7_static;
        self.state = DecompressorState::FullContext;
        self.crc_failures = 0;
    }

    fn install_dyn(&mut self, info: &DynInfo) {
        self.sn_ref = info.sn;
        self.inner_behavior = info.inner_behavior;
        self.outer_behavior = info.outer_behavior;
        self.inner_off = offset_of(info.inner_behavior, &self.reference.ip, info.sn);
        self.outer_off = self
            .reference
            .outer_ip
            .as_ref()
            .map_or(0, |outer| offset_of(info.outer_behavior, outer, info.sn));
        self.ts_stride = info.ts_stride;
        if let Some(mode) = info.mode {
            self.mode = mode;
        }
        self.udp_checksum_enabled = self
            .reference
            .udp()
            .is_some_and(|udp| udp.checksum != 0)
            && !matches!(self.reference.transport, Transport::UdpLite(_));
    }

    /// The header set compressed packets are reconstructed from
    pub(crate) fn reference(&self) -> &HeaderSet {
        &self.reference
    }

    fn snapshot(&self) -> RefSnapshot {
        RefSnapshot {
            sn: self.sn_ref,
            ts: ref_ts(&self.reference),
            inner_off: self.inner_off,
            outer_off: self.outer_off,
        }
    }

    fn record_failure(&mut self, cfg: &DecompConfig) {
        self.crc_failures += 1;
        match self.state {
            DecompressorState::FullContext if self.crc_failures >= cfg.k1 => {
                log::debug!("{} consecutive failures: FC -> SC", self.crc_failures);
                self.state = DecompressorState::StaticContext;
                self.crc_failures = 0;
            }
            DecompressorState::StaticContext if self.crc_failures >= cfg.k2 => {
                log::debug!("{} consecutive failures: SC -> NC", self.crc_failures);
                self.state = DecompressorState::NoContext;
                self.crc_failures = 0;
            }
            _ => {}
        }
    }
}

fn static_crcs(headers: &HeaderSet, profile: ProfileId) -> (u8, u8) {
    let mut stream = Vec::with_capacity(64);
    headers.crc_static_bytes(profile.with_rtp(), &mut stream);
    (
        crc::crc3(&stream, CRC3_INIT),
        crc::crc7(&stream, CRC7_INIT),
    )
}

/// Bits gathered off the wire before reconstruction
struct Wire {
    sn_bits: u32,
    sn_k: u8,
    /// TS LSBs from the base header or EXT-0..2 (domain chosen by the
    /// stride context)
    ts_bits: Option<(u32, u8)>,
    /// Inner IP-ID offset LSBs
    ipid_bits: Option<(u32, u8)>,
    /// Outer IP-ID offset LSBs (non-RTP EXT-2)
    outer_ipid_bits: Option<(u32, u8)>,
    marker: Option<bool>,
    crc: u8,
    crc_is_7: bool,
    ext3: Option<Box<Ext3>>,
    /// Verbatim IP-IDs appended for RND headers
    appended_outer_ipid: Option<u16>,
    appended_inner_ipid: Option<u16>,
    udp_checksum: Option<u16>,
    udplite: Option<(u16, u16)>,
}

/// Context updates staged from EXT-3, applied only on CRC success
struct Staged {
    inner_behavior: IpIdBehavior,
    outer_behavior: IpIdBehavior,
    ts_stride: Option<u32>,
    mode: Option<Mode>,
    static_touched: bool,
}

/// Decompress one UO-0/UO-1*/UOR-2* packet; returns the decoded SN
pub(crate) fn decompress(
    dctx: &mut GenericDctx,
    cfg: &DecompConfig,
    type_octet: u8,
    cursor: &mut ByteCursor<'_>,
    out: &mut Vec<u8>,
) -> RohcResult<u32> {
    let wire = match parse_wire(dctx, type_octet, cursor) {
        Ok(wire) => wire,
        Err(error) => {
            // A packet we cannot even parse does not damage the context
            return Err(error);
        }
    };
    let payload = cursor.remaining();

    let staged = stage_updates(dctx, wire.ext3.as_deref());

    // Decode against the current reference, then run the repair ladder:
    // SN wraparound first, then older references
    let current = dctx.snapshot();
    let mut attempts: Vec<(RefSnapshot, bool)> = vec![(current, false), (current, true)];
    for snapshot in dctx.history.iter().flatten() {
        attempts.push((*snapshot, false));
    }

    for (index, (snapshot, wraparound)) in attempts.iter().enumerate() {
        if let Some((candidate, sn)) = try_decode(dctx, &wire, &staged, snapshot, *wraparound) {
            if index > 0 {
                log::debug!("context repair succeeded on attempt {index}");
            }
            install_success(dctx, candidate, sn, &staged);
            headers::write(
                &dctx.reference,
                dctx.profile.with_rtp(),
                payload.len(),
                out,
            );
            out.extend_from_slice(payload);
            return Ok(sn);
        }
    }

    dctx.record_failure(cfg);
    Err(RohcError::CrcFailure { cid: 0 })
}

fn install_success(dctx: &mut GenericDctx, candidate: HeaderSet, sn: u32, staged: &Staged) {
    dctx.history.rotate_right(1);
    dctx.history[0] = Some(dctx.snapshot());

    dctx.inner_behavior = staged.inner_behavior;
    dctx.outer_behavior = staged.outer_behavior;
    dctx.ts_stride = staged.ts_stride;
    if let Some(mode) = staged.mode {
        dctx.mode = mode;
    }
    dctx.inner_off = offset_of(staged.inner_behavior, &candidate.ip, sn);
    dctx.outer_off = candidate
        .outer_ip
        .as_ref()
        .map_or(0, |outer| offset_of(staged.outer_behavior, outer, sn));
    dctx.reference = candidate;
    dctx.sn_ref = sn;
    dctx.crc_failures = 0;
    dctx.state = DecompressorState::FullContext;
    if staged.static_touched {
        let (crc3_static, crc7_static) = static_crcs(&dctx.reference, dctx.profile);
        dctx.crc3_static = crc3_static;
        dctx.crc7_static = crc7_static;
    }
}

fn parse_wire(
    dctx: &mut GenericDctx,
    type_octet: u8,
    cursor: &mut ByteCursor<'_>,
) -> RohcResult<Wire> {
    let rtp = dctx.profile.with_rtp();
    let has_t = matches!(dctx.reference.ip, IpHeader::V4(_)) && !dctx.inner_behavior.rnd;

    let mut wire = Wire {
        sn_bits: 0,
        sn_k: 0,
        ts_bits: None,
        ipid_bits: None,
        outer_ipid_bits: None,
        marker: None,
        crc: 0,
        crc_is_7: false,
        ext3: None,
        appended_outer_ipid: None,
        appended_inner_ipid: None,
        udp_checksum: None,
        udplite: None,
    };

    let mut extension = None;
    let mut id_base = false;

    if type_octet & 0x80 == 0 {
        // UO-0
        wire.sn_bits = u32::from((type_octet >> 3) & 0x0f);
        wire.sn_k = 4;
        wire.crc = type_octet & 0x07;
    } else if type_octet & 0xc0 == 0x80 {
        // UO-1 family
        let second = cursor.read_u8()?;
        if rtp {
            if has_t {
                if type_octet & 0x20 != 0 {
                    // UO-1-TS
                    wire.ts_bits = Some((u32::from(type_octet & 0x1f), 5));
                    wire.marker = Some(second & 0x80 != 0);
                } else {
                    // UO-1-ID
                    wire.ipid_bits = Some((u32::from(type_octet & 0x1f), 5));
                    id_base = true;
                    if second & 0x80 != 0 {
                        extension = Some(ext::parse(cursor, rtp, &mut dctx.csrc_table)?);
                    }
                }
            } else {
                // UO-1
                wire.ts_bits = Some((u32::from(type_octet & 0x3f), 6));
                wire.marker = Some(second & 0x80 != 0);
            }
            wire.sn_bits = u32::from((second >> 3) & 0x0f);
            wire.sn_k = 4;
            wire.crc = second & 0x07;
        } else {
            // Non-RTP UO-1
            wire.ipid_bits = Some((u32::from(type_octet & 0x3f), 6));
            wire.sn_bits = u32::from((second >> 3) & 0x1f);
            wire.sn_k = 5;
            wire.crc = second & 0x07;
        }
    } else if type_octet & 0xe0 == 0xc0 {
        // UOR-2 family
        wire.crc_is_7 = true;
        if rtp {
            let second = cursor.read_u8()?;
            let third = cursor.read_u8()?;
            wire.marker = Some(second & 0x40 != 0);
            wire.sn_bits = u32::from(second & 0x3f);
            wire.sn_k = 6;
            wire.crc = third & 0x7f;
            if has_t {
                if second & 0x80 != 0 {
                    wire.ts_bits = Some((u32::from(type_octet & 0x1f), 5));
                } else {
                    wire.ipid_bits = Some((u32::from(type_octet & 0x1f), 5));
                    id_base = true;
                }
            } else {
                wire.ts_bits = Some(
                    ((u32::from(type_octet & 0x1f) << 1) | u32::from(second >> 7), 6),
                );
            }
            if third & 0x80 != 0 {
                extension = Some(ext::parse(cursor, rtp, &mut dctx.csrc_table)?);
            }
        } else {
            let second = cursor.read_u8()?;
            wire.sn_bits = u32::from(type_octet & 0x1f);
            wire.sn_k = 5;
            wire.crc = second & 0x7f;
            if second & 0x80 != 0 {
                extension = Some(ext::parse(cursor, rtp, &mut dctx.csrc_table)?);
            }
        }
    } else {
        return Err(RohcError::Malformed);
    }

    // Fold extension bits below the base-header bits
    if let Some(extension) = extension {
        let (ext_sn, ext_sn_k) = extension.sn_bits();
        wire.sn_bits = (wire.sn_bits << ext_sn_k) | ext_sn;
        wire.sn_k += ext_sn_k;
        match &extension {
            Extension::Ext0 { field, .. } => {
                fold_small_ext(&mut wire, rtp, id_base, u32::from(*field), 3, None);
            }
            Extension::Ext1 { field, field2, .. } => {
                fold_small_ext(
                    &mut wire,
                    rtp,
                    id_base,
                    u32::from(*field),
                    3,
                    Some(u32::from(*field2)),
                );
            }
            Extension::Ext2 { field, field2, .. } => {
                fold_small_ext(
                    &mut wire,
                    rtp,
                    id_base,
                    u32::from(*field),
                    11,
                    Some(u32::from(*field2)),
                );
            }
            Extension::Ext3(_) => {}
        }
        if let Extension::Ext3(ext3) = extension {
            wire.ext3 = Some(ext3);
        }
    }

    // Appended fields, outer-first; EXT-3 flag flips take effect now
    let inner_rnd = wire
        .ext3
        .as_ref()
        .and_then(|ext3| ext3.inner.as_ref())
        .map_or(dctx.inner_behavior.rnd, |inner| inner.rnd);
    let outer_rnd = wire
        .ext3
        .as_ref()
        .and_then(|ext3| ext3.outer.as_ref())
        .map_or(dctx.outer_behavior.rnd, |outer| outer.rnd);
    if matches!(dctx.reference.outer_ip, Some(IpHeader::V4(_))) && outer_rnd {
        wire.appended_outer_ipid = Some(cursor.read_u16()?);
    }
    if matches!(dctx.reference.ip, IpHeader::V4(_)) && inner_rnd {
        wire.appended_inner_ipid = Some(cursor.read_u16()?);
    }
    match &dctx.reference.transport {
        Transport::Udp { .. } if dctx.udp_checksum_enabled => {
            wire.udp_checksum = Some(cursor.read_u16()?);
        }
        Transport::UdpLite(_) => {
            wire.udplite = Some((cursor.read_u16()?, cursor.read_u16()?));
        }
        _ => {}
    }

    Ok(wire)
}

fn fold_small_ext(
    wire: &mut Wire,
    rtp: bool,
    id_base: bool,
    field: u32,
    field_k: u8,
    field2: Option<u32>,
) {
    if !rtp {
        // Non-RTP: the fields extend the inner IP-ID, EXT-2's trailing
        // octet addresses the outer IP-ID
        match field2 {
            Some(second) if field_k == 11 => {
                wire.ipid_bits = Some((field, 11));
                wire.outer_ipid_bits = Some((second, 8));
            }
            Some(second) => {
                wire.ipid_bits = Some(((field << 8) | second, field_k + 8));
            }
            None => {
                wire.ipid_bits = Some((field, field_k));
            }
        }
        return;
    }

    if id_base {
        let (base, base_k) = wire.ipid_bits.unwrap_or((0, 0));
        wire.ipid_bits = Some(((base << field_k) | field, base_k + field_k));
        if let Some(second) = field2 {
            wire.ts_bits = Some((second, 8));
        }
    } else {
        let (base, base_k) = wire.ts_bits.unwrap_or((0, 0));
        wire.ts_bits = Some(((base << field_k) | field, base_k + field_k));
        if let Some(second) = field2 {
            wire.ipid_bits = Some((second, 8));
        }
    }
}

fn stage_updates(dctx: &GenericDctx, ext3: Option<&Ext3>) -> Staged {
    let mut staged = Staged {
        inner_behavior: dctx.inner_behavior,
        outer_behavior: dctx.outer_behavior,
        ts_stride: dctx.ts_stride,
        mode: None,
        static_touched: false,
    };
    let Some(ext3) = ext3 else {
        return staged;
    };

    if let Some(inner) = &ext3.inner {
        staged.inner_behavior = IpIdBehavior {
            rnd: inner.rnd,
            nbo: inner.nbo,
        };
        if inner.proto.is_some() {
            staged.static_touched = true;
        }
    }
    if let Some(outer) = &ext3.outer {
        staged.outer_behavior = IpIdBehavior {
            rnd: outer.rnd,
            nbo: outer.nbo,
        };
        if outer.proto.is_some() {
            staged.static_touched = true;
        }
    }
    staged.mode = ext3.mode;
    if let Some(rtp) = &ext3.rtp {
        staged.mode = Some(rtp.mode);
        if let Some(stride) = rtp.ts_stride {
            staged.ts_stride = Some(stride);
        }
    }
    if let Some(ts) = &ext3.ts {
        if !ts.scaled && ext3.rtp.as_ref().is_none_or(|rtp| rtp.ts_stride.is_none()) {
            // A raw TS invalidates the scaled interpretation until a
            // new stride is announced
            staged.ts_stride = None;
        }
    }
    staged
}

fn apply_ext3_fields(candidate: &mut HeaderSet, ext3: &Ext3) {
    if let Some(inner) = &ext3.inner {
        match &mut candidate.ip {
            IpHeader::V4(v4) => {
                if let Some(tos) = inner.tos {
                    v4.tos = tos;
                }
                if let Some(ttl) = inner.ttl {
                    v4.ttl = ttl;
                }
                if let Some(proto) = inner.proto {
                    v4.protocol = proto;
                }
                v4.df = inner.df;
            }
            IpHeader::V6(v6) => {
                if let Some(tos) = inner.tos {
                    v6.traffic_class = tos;
                }
                if let Some(ttl) = inner.ttl {
                    v6.hop_limit = ttl;
                }
                if let Some(proto) = inner.proto {
                    v6.next_header = proto;
                }
            }
        }
    }
    if let Some(outer_fields) = &ext3.outer {
        if let Some(outer) = &mut candidate.outer_ip {
            match outer {
                IpHeader::V4(v4) => {
                    if let Some(tos) = outer_fields.tos {
                        v4.tos = tos;
                    }
                    if let Some(ttl) = outer_fields.ttl {
                        v4.ttl = ttl;
                    }
                    if let Some(proto) = outer_fields.proto {
                        v4.protocol = proto;
                    }
                    v4.df = outer_fields.df;
                }
                IpHeader::V6(v6) => {
                    if let Some(tos) = outer_fields.tos {
                        v6.traffic_class = tos;
                    }
                    if let Some(ttl) = outer_fields.ttl {
                        v6.hop_limit = ttl;
                    }
                }
            }
        }
    }
    if let Some(rtp_fields) = &ext3.rtp {
        if let Some(rtp) = candidate.rtp_mut() {
            if let Some(pt) = rtp_fields.pt {
                rtp.payload_type = pt;
            }
            rtp.extension = rtp_fields.extension;
            if let Some(csrc) = &rtp_fields.csrc {
                rtp.csrc = csrc.clone();
            }
        }
    }
}

fn sign_extend_16(delta: u32) -> i64 {
    i64::from(delta as u16 as i16)
}

#[expect(clippy::too_many_lines)]
fn try_decode(
    dctx: &GenericDctx,
    wire: &Wire,
    staged: &Staged,
    snapshot: &RefSnapshot,
    wraparound: bool,
) -> Option<(HeaderSet, u32)> {
    let width = sn_width(dctx.profile);
    let shift = sn_shift(dctx.profile);

    let mut sn = decode_lsb(wire.sn_bits, wire.sn_k, snapshot.sn, width, shift);
    if wraparound {
        // Interpretation-interval slip by one LSB cycle
        let cycle = if wire.sn_k >= 32 { 0 } else { 1u32 << wire.sn_k };
        let mask = if width >= 32 { u32::MAX } else { (1 << width) - 1 };
        sn = sn.wrapping_add(cycle) & mask;
    }

    let mut candidate = dctx.reference.clone();
    if let Some(ext3) = &wire.ext3 {
        apply_ext3_fields(&mut candidate, ext3);
    }

    // Sequence number into the carried headers
    match &mut candidate.transport {
        Transport::Udp { rtp: Some(rtp), .. } => rtp.sn = sn as u16,
        Transport::Esp(esp) => esp.sn = sn,
        _ => {}
    }

    // Timestamp
    if dctx.profile.with_rtp() {
        let ts = decode_ts(dctx, wire, staged, snapshot, sn)?;
        if let Some(rtp) = candidate.rtp_mut() {
            rtp.ts = ts;
            if let Some(marker) = wire.marker {
                rtp.marker = marker;
            } else if let Some(ext3_marker) =
                wire.ext3.as_ref().and_then(|ext3| ext3.rtp.as_ref())
            {
                rtp.marker = ext3_marker.marker;
            } else {
                rtp.marker = false;
            }
        }
    }

    // Inner IP-ID
    if let IpHeader::V4(v4) = &mut candidate.ip {
        if staged.inner_behavior.rnd {
            v4.id = wire.appended_inner_ipid?;
        } else if let Some(full) = wire.ext3.as_ref().and_then(|ext3| ext3.inner_ipid) {
            v4.id = full;
        } else if let Some((bits, k)) = wire.ipid_bits {
            let offset = decode_lsb(bits, k, u32::from(snapshot.inner_off), 16, LsbShift::Zero);
            v4.id = staged
                .inner_behavior
                .to_wire((sn as u16).wrapping_add(offset as u16));
        } else {
            v4.id = staged
                .inner_behavior
                .to_wire((sn as u16).wrapping_add(snapshot.inner_off));
        }
    }

    // Outer IP-ID
    if let Some(IpHeader::V4(v4)) = &mut candidate.outer_ip {
        if staged.outer_behavior.rnd {
            v4.id = wire.appended_outer_ipid?;
        } else if let Some(full) = wire.ext3.as_ref().and_then(|ext3| ext3.outer_ipid) {
            v4.id = full;
        } else if let Some((bits, k)) = wire.outer_ipid_bits {
            let offset = decode_lsb(bits, k, u32::from(snapshot.outer_off), 16, LsbShift::Zero);
            v4.id = staged
                .outer_behavior
                .to_wire((sn as u16).wrapping_add(offset as u16));
        } else {
            v4.id = staged
                .outer_behavior
                .to_wire((sn as u16).wrapping_add(snapshot.outer_off));
        }
    }

    // Transport checksums travel uncompressed
    match &mut candidate.transport {
        Transport::Udp { udp, .. } => {
            if let Some(checksum) = wire.udp_checksum {
                udp.checksum = checksum;
            } else if dctx.udp_checksum_enabled {
                return None;
            } else {
                udp.checksum = 0;
            }
        }
        Transport::UdpLite(udp) => {
            let (coverage, checksum) = wire.udplite?;
            udp.coverage = coverage;
            udp.checksum = checksum;
        }
        _ => {}
    }

    // CRC is the correctness witness
    let with_rtp = dctx.profile.with_rtp();
    let mut stream = Vec::with_capacity(64);
    let computed = if staged.static_touched {
        candidate.crc_static_bytes(with_rtp, &mut stream);
        let split = stream.len();
        candidate.crc_dynamic_bytes(with_rtp, &mut stream);
        if wire.crc_is_7 {
            crc::crc7(&stream[split..], crc::crc7(&stream[..split], CRC7_INIT))
        } else {
            crc::crc3(&stream[split..], crc::crc3(&stream[..split], CRC3_INIT))
        }
    } else {
        candidate.crc_dynamic_bytes(with_rtp, &mut stream);
        if wire.crc_is_7 {
            crc::crc7(&stream, dctx.crc7_static)
        } else {
            crc::crc3(&stream, dctx.crc3_static)
        }
    };

    if computed == wire.crc {
        Some((candidate, sn))
    } else {
        None
    }
}

fn decode_ts(
    dctx: &GenericDctx,
    wire: &Wire,
    staged: &Staged,
    snapshot: &RefSnapshot,
    sn: u32,
) -> Option<u32> {
    if let Some(ts) = wire.ext3.as_ref().and_then(|ext3| ext3.ts) {
        if ts.scaled {
            let stride = staged.ts_stride?;
            let scaled_ref = snapshot.ts / stride;
            let offset = snapshot.ts % stride;
            let scaled = decode_lsb(ts.value, ts.k, scaled_ref, 32, LsbShift::Ts);
            return Some(scaled.wrapping_mul(stride).wrapping_add(offset));
        }
        return Some(decode_lsb(ts.value, ts.k, snapshot.ts, 32, LsbShift::Ts));
    }

    if let Some((bits, k)) = wire.ts_bits {
        return match staged.ts_stride {
            Some(stride) => {
                let scaled_ref = snapshot.ts / stride;
                let offset = snapshot.ts % stride;
                let scaled = decode_lsb(bits, k, scaled_ref, 32, LsbShift::Ts);
                Some(scaled.wrapping_mul(stride).wrapping_add(offset))
            }
            None => Some(decode_lsb(bits, k, snapshot.ts, 32, LsbShift::Ts)),
        };
    }

    // No TS bits: scaled prediction from the SN movement, or unchanged
    match staged.ts_stride {
        Some(stride) => {
            let delta = sign_extend_16(sn.wrapping_sub(snapshot.sn));
            let moved = delta.wrapping_mul(i64::from(stride));
            Some((i64::from(snapshot.ts).wrapping_add(moved)) as u32)
        }
        None => Some(snapshot.ts),
    }
}

/// Count a packet the current state cannot decode (UO-0/UO-1 while only
/// the static context survives)
pub(crate) fn undecodable(dctx: &mut GenericDctx, cfg: &DecompConfig) -> RohcError {
    dctx.record_failure(cfg);
    RohcError::NoContext
}

/// Parse the chains of an IR packet (type and profile octets already
/// consumed, CRC already verified by the caller)
pub(crate) fn parse_ir(
    profile: ProfileId,
    with_dynamic: bool,
    cursor: &mut ByteCursor<'_>,
    csrc_table: &mut [Option<u32>; 16],
) -> RohcResult<(HeaderSet, Option<DynInfo>)> {
    let mut headers = chains::parse_static_chain(cursor, profile)?;
    let info = if with_dynamic {
        Some(chains::parse_dynamic_chain(
            cursor, profile, &mut headers, csrc_table,
        )?)
    } else {
        None
    };
    Ok((headers, info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::comp::{self, CompConfig, GenericCtx};
    use crate::headers::{IPPROTO_UDP, Ipv4Header, RtpHeader, UdpHeader};

    fn rtp_flow(sn: u16, ts: u32, id: u16, marker: bool) -> HeaderSet {
        HeaderSet {
            outer_ip: None,
            ip: IpHeader::V4(Ipv4Header {
                tos: 0,
                id,
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
                    checksum: 0x8765,
                },
                rtp: Some(RtpHeader {
                    padding: false,
                    extension: false,
                    marker,
                    payload_type: 96,
                    sn,
                    ts,
                    ssrc: 0xdead_beef,
                    csrc: vec![],
                }),
            },
            base_len: 28,
            rtp_len: 12,
        }
    }

    /// Drive compressor output straight into a decompressor context
    fn round_trip_flow(count: u16) {
        let cfg = CompConfig::default();
        let dcfg = DecompConfig::default();
        let first = rtp_flow(100, 16_000, 50, false);
        let mut ctx = GenericCtx::new(ProfileId::Rtp, &first, &cfg, 0);
        let mut dctx: Option<GenericDctx> = None;

        for step in 0..count {
            let headers = rtp_flow(
                100 + step,
                16_000 + u32::from(step) * 160,
                50 + step,
                false,
            );
            let payload = [0xaau8, step as u8];
            let mut compressed = Vec::new();
            comp::compress(&mut ctx, &cfg, &headers, &payload, &mut compressed).unwrap();

            let mut cursor = ByteCursor::new(&compressed);
            let type_octet = cursor.read_u8().unwrap();
            let mut rebuilt = Vec::new();
            match crate::packet::kind_of(type_octet) {
                crate::packet::PacketKind::Ir => {
                    let profile = ProfileId::from_octet(cursor.read_u8().unwrap()).unwrap();
                    let _crc = cursor.read_u8().unwrap();
                    let mut table = [None; 16];
                    let (headers, info) =
                        parse_ir(profile, type_octet & 1 != 0, &mut cursor, &mut table).unwrap();
                    dctx = Some(GenericDctx::new_from_ir(
                        profile,
                        headers,
                        info.as_ref(),
                        table,
                    ));
                    continue;
                }
                _ => {
                    let dctx = dctx.as_mut().expect("IR must precede compressed packets");
                    decompress(dctx, &dcfg, type_octet, &mut cursor, &mut rebuilt).unwrap();
                }
            }

            let mut expected = Vec::new();
            headers::write(&headers, true, payload.len(), &mut expected);
            expected.extend_from_slice(&payload);
            assert_eq!(rebuilt, expected, "packet {step}");
        }
    }

    #[test]
    fn test_compressed_stream_round_trips() {
        round_trip_flow(30);
    }

    #[test]
    fn test_failure_counters_downgrade_state() {
        let cfg = DecompConfig::default();
        // IPv6/IP-only: the CRC stream is SN-independent, so a wrong
        // CRC fails every repair candidate deterministically
        let first = HeaderSet {
            outer_ip: None,
            ip: IpHeader::V6(crate::headers::Ipv6Header {
                traffic_class: 0,
                flow_label: 1,
                next_header: 59,
                hop_limit: 64,
                src: [1; 16],
                dst: [2; 16],
            }),
            transport: Transport::None,
            base_len: 40,
            rtp_len: 0,
        };
        let mut dctx = GenericDctx::new_from_ir(
            ProfileId::Ip,
            first.clone(),
            Some(&DynInfo {
                sn: 1,
                ..DynInfo::default()
            }),
            [None; 16],
        );
        assert_eq!(dctx.state, DecompressorState::FullContext);

        let mut stream = Vec::new();
        first.crc_static_bytes(false, &mut stream);
        let split = stream.len();
        first.crc_dynamic_bytes(false, &mut stream);
        let good = crate::crc::crc3(
            &stream[split..],
            crate::crc::crc3(&stream[..split], crate::crc::CRC3_INIT),
        );
        let bad = (good + 1) & 0x07;

        for _ in 0..cfg.k1 {
            // UO-0 with SN 2 and a CRC that cannot match
            let packet = [(2u8 << 3) | bad];
            let mut cursor = ByteCursor::new(&packet);
            let type_octet = cursor.read_u8().unwrap();
            let mut out = Vec::new();
            let outcome = decompress(&mut dctx, &cfg, type_octet, &mut cursor, &mut out);
            assert!(outcome.is_err());
        }
        assert_eq!(dctx.state, DecompressorState::StaticContext);
    }
}
