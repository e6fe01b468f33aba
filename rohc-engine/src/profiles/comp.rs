//! Compressor side of the generic RFC 3095 engine, shared by the
//! IP-only, UDP, UDP-Lite, RTP and ESP profiles
//!
//! Owns the per-context IR/FO/SO state machine, the change detectors,
//! packet-format selection and the UO-0/UO-1*/UOR-2*/IR/IR-DYN builders.
//! Everything built here is a core packet: the CID layer wraps it later.

use crate::{
    ProfileId,
    context::{CompressorState, Mode},
    crc::{self, CRC3_INIT, CRC7_INIT, CRC8_INIT},
    encodings::{IpIdAnalyzer, IpIdBehavior, TsEvent, TsStrideDetector, scale_ts},
    error::{RohcError, RohcResult},
    feedback::{Feedback, FeedbackAck, FeedbackKind},
    headers::{HeaderSet, IpHeader, Transport},
    lsb::WlsbWindow,
    profiles::{
        chains::{self, DynInfo},
        ext::{Ext3, Ext3IpFields, Ext3Rtp, Ext3Ts, Extension, self},
        flow_sn, sn_shift, sn_width,
    },
};

/// Compressor tuning knobs, owned by the engine and shared by all
/// contexts
#[derive(Debug, Clone, Copy)]
pub(crate) struct CompConfig {
    /// Optimistic-approach repeat count (L)
    pub optimistic_count: u32,
    /// Packets between forced IR refreshes
    pub ir_timeout: u32,
    /// Packets between forced FO refreshes
    pub fo_timeout: u32,
    /// W-LSB window capacity
    pub window_width: usize,
    /// Non-sequential observations before RND flips
    pub rnd_threshold: u8,
    /// Equal TS deltas before a stride is trusted
    pub stride_threshold: u8,
}

impl Default for CompConfig {
    fn default() -> Self {
        Self {
            optimistic_count: 4,
            ir_timeout: 1700,
            fo_timeout: 700,
            window_width: 4,
            rnd_threshold: 4,
            stride_threshold: 3,
        }
    }
}

/// IP-ID tracking for one IPv4 header
struct IpIdCtx {
    analyzer: IpIdAnalyzer,
    window: WlsbWindow,
    /// Behavior the peer currently assumes
    synced: IpIdBehavior,
}

impl IpIdCtx {
    fn new(cfg: &CompConfig) -> Self {
        Self {
            analyzer: IpIdAnalyzer::new(cfg.rnd_threshold),
            window: WlsbWindow::new(cfg.window_width, 16, crate::lsb::LsbShift::Zero),
            synced: IpIdBehavior::SEQUENTIAL,
        }
    }
}

/// Per-context compressor state of the generic engine
pub(crate) struct GenericCtx {
    pub profile: ProfileId,
    pub state: CompressorState,
    pub mode: Mode,
    last: HeaderSet,
    sn: u32,
    generated_sn: u32,
    sn_window: WlsbWindow,
    ts_detector: TsStrideDetector,
    ts_window: WlsbWindow,
    ts_offset: u32,
    /// Peer knows the current stride
    stride_synced: bool,
    inner_ipid: Option<IpIdCtx>,
    outer_ipid: Option<IpIdCtx>,
    udp_checksum_enabled: bool,
    /// Peer knows the current mode
    mode_synced: bool,
    state_run: u32,
    since_ir: u32,
    since_fo: u32,
}

/// What this packet must convey beyond SN movement
#[derive(Default)]
struct Pending {
    ir_dyn: bool,
    ext3_inner: bool,
    ext3_outer: bool,
    pt: bool,
    stride: bool,
    raw_ts: bool,
    mode: bool,
}

impl Pending {
    fn any_ext3(&self) -> bool {
        self.ext3_inner || self.ext3_outer || self.pt || self.stride || self.raw_ts || self.mode
    }
}

impl GenericCtx {
    pub(crate) fn new(
        profile: ProfileId,
        headers: &HeaderSet,
        cfg: &CompConfig,
        initial_sn: u32,
    ) -> Self {
        let width = sn_width(profile);
        let shift = sn_shift(profile);
        let inner_ipid = matches!(headers.ip, IpHeader::V4(_)).then(|| IpIdCtx::new(cfg));
        let outer_ipid = matches!(headers.outer_ip, Some(IpHeader::V4(_)))
            .then(|| IpIdCtx::new(cfg));
        let udp_checksum_enabled = headers.udp().is_some_and(|udp| udp.checksum != 0);

        Self {
            profile,
            state: CompressorState::Ir,
            mode: Mode::Unidirectional,
            last: headers.clone(),
            sn: 0,
            generated_sn: initial_sn & 0xffff,
            sn_window: WlsbWindow::new(cfg.window_width, width, shift),
            ts_detector: TsStrideDetector::new(cfg.stride_threshold),
            ts_window: WlsbWindow::new(cfg.window_width, 32, crate::lsb::LsbShift::Ts),
            ts_offset: 0,
            stride_synced: false,
            inner_ipid,
            outer_ipid,
            udp_checksum_enabled,
            mode_synced: true,
            state_run: 0,
            since_ir: 0,
            since_fo: 0,
        }
    }

    /// Whether `headers` still belong to the established flow
    pub(crate) fn static_matches(&self, headers: &HeaderSet) -> bool {
        let chain_ok = self.last.ip.same_static(&headers.ip)
            && match (&self.last.outer_ip, &headers.outer_ip) {
                (None, None) => true,
                (Some(a), Some(b)) => a.same_static(b),
                _ => false,
            };
        if !chain_ok {
            return false;
        }
        match (&self.last.transport, &headers.transport) {
            (Transport::None, Transport::None) => true,
            (
                Transport::Udp { udp: a, rtp: rtp_a },
                Transport::Udp { udp: b, rtp: rtp_b },
            ) => {
                a.sport == b.sport
                    && a.dport == b.dport
                    && match (rtp_a, rtp_b) {
                        (None, None) => true,
                        (Some(ra), Some(rb)) => ra.ssrc == rb.ssrc,
                        _ => false,
                    }
            }
            (Transport::UdpLite(a), Transport::UdpLite(b)) => {
                a.sport == b.sport && a.dport == b.dport
            }
            (Transport::Esp(a), Transport::Esp(b)) => a.spi == b.spi,
            _ => false,
        }
    }

    /// Consume one feedback element addressed to this context
    pub(crate) fn on_feedback(&mut self, feedback: &Feedback) {
        match feedback.kind {
            FeedbackKind::Feedback1 { sn_lsb } => {
                self.ack_sn_lsb(u32::from(sn_lsb), 8);
            }
            FeedbackKind::Feedback2 {
                ack,
                mode,
                sn,
                sn_bits,
                sn_valid,
            } => {
                if let Some(mode) = mode {
                    if mode != self.mode {
                        log::debug!("mode transition {} -> {}", self.mode, mode);
                        self.mode = mode;
                        self.mode_synced = false;
                        if self.state == CompressorState::So {
                            self.state = CompressorState::Fo;
                            self.state_run = 0;
                        }
                    }
                }
                match ack {
                    FeedbackAck::Ack => {
                        if sn_valid {
                            self.ack_sn_lsb(sn, sn_bits);
                        }
                        // ACK-gated transitions (the only ones in R-mode)
                        match self.state {
                            CompressorState::Ir => {
                                self.state = CompressorState::Fo;
                                self.state_run = 0;
                            }
                            CompressorState::Fo => {
                                self.state = CompressorState::So;
                                self.state_run = 0;
                                mark_synced(self);
                            }
                            CompressorState::So => {}
                        }
                    }
                    FeedbackAck::Nack => {
                        log::debug!("NACK: falling back to FO");
                        self.state = CompressorState::Fo;
                        self.state_run = 0;
                    }
                    FeedbackAck::StaticNack => {
                        log::debug!("STATIC-NACK: falling back to IR");
                        self.state = CompressorState::Ir;
                        self.state_run = 0;
                    }
                }
            }
        }
    }

    fn ack_sn_lsb(&mut self, sn_lsb: u32, bits: u8) {
        // The acknowledged SN is known by its LSBs; resolve against the
        // current SN, which the peer cannot be ahead of
        let width = sn_width(self.profile);
        let mask = if bits >= 32 { u32::MAX } else { (1 << bits) - 1 };
        let mut acked = (self.sn & !mask) | (sn_lsb & mask);
        let width_mask = if width >= 32 { u32::MAX } else { (1 << width) - 1 };
        if acked > self.sn {
            acked = acked.wrapping_sub(mask.wrapping_add(1)) & width_mask;
        }
        self.sn_window.ack(acked);
        self.ts_window.ack(acked);
        if let Some(inner) = &mut self.inner_ipid {
            inner.window.ack(acked);
        }
        if let Some(outer) = &mut self.outer_ipid {
            outer.window.ack(acked);
        }
    }

    fn optimistic(&self) -> bool {
        !matches!(self.mode, Mode::Reliable)
    }
}

fn ipid_of(ip: &IpHeader) -> u16 {
    match ip {
        IpHeader::V4(v4) => v4.id,
        IpHeader::V6(_) => 0,
    }
}

fn ip_fields_changed(old: &IpHeader, new: &IpHeader) -> bool {
    match (old, new) {
        (IpHeader::V4(a), IpHeader::V4(b)) => {
            a.tos != b.tos || a.ttl != b.ttl || a.df != b.df
        }
        (IpHeader::V6(a), IpHeader::V6(b)) => {
            a.traffic_class != b.traffic_class || a.hop_limit != b.hop_limit
        }
        _ => true,
    }
}

/// Compress one packet of an established flow into a core packet
pub(crate) fn compress(
    ctx: &mut GenericCtx,
    cfg: &CompConfig,
    headers: &HeaderSet,
    payload: &[u8],
    out: &mut Vec<u8>,
) -> RohcResult<()> {
    let with_rtp = ctx.profile.with_rtp();
    let sn = flow_sn(headers, ctx.profile, ctx.generated_sn);
    ctx.sn = sn;

    let mut pending = Pending::default();

    // IP-ID behavior detection, inner then outer
    if let Some(inner) = &mut ctx.inner_ipid {
        if inner.analyzer.observe(ipid_of(&headers.ip)) {
            pending.ext3_inner = true;
        }
    }
    if let (Some(outer), Some(outer_hdr)) = (&mut ctx.outer_ipid, &headers.outer_ip) {
        if outer.analyzer.observe(ipid_of(outer_hdr)) {
            pending.ext3_outer = true;
        }
    }

    // RTP timestamp stride
    if with_rtp {
        let ts = headers.rtp().map_or(0, |rtp| rtp.ts);
        match ctx.ts_detector.observe(ts) {
            TsEvent::Established => {
                let stride = ctx.ts_detector.stride().unwrap_or(1);
                ctx.ts_offset = ts % stride;
                ctx.ts_window.clear();
                ctx.stride_synced = false;
                pending.stride = true;
            }
            TsEvent::Broken => {
                ctx.ts_window.clear();
                ctx.stride_synced = false;
                pending.raw_ts = true;
            }
            TsEvent::None => {
                if let Some(stride) = ctx.ts_detector.stride() {
                    if ts % stride != ctx.ts_offset {
                        // Offset shifted: scaled interpretation is stale
                        ctx.ts_detector.reset();
                        ctx.ts_window.clear();
                        ctx.stride_synced = false;
                        pending.raw_ts = true;
                    } else if !ctx.stride_synced {
                        pending.stride = true;
                    }
                }
            }
        }
    }

    // Field changes against the last compressed packet
    if ip_fields_changed(&ctx.last.ip, &headers.ip) {
        pending.ext3_inner = true;
    }
    if let (Some(old), Some(new)) = (&ctx.last.outer_ip, &headers.outer_ip) {
        if ip_fields_changed(old, new) {
            pending.ext3_outer = true;
        }
    }
    match (&ctx.last.transport, &headers.transport) {
        (Transport::Udp { rtp: ra, .. }, Transport::Udp { udp: b, rtp: rb }) => {
            if ctx.udp_checksum_enabled != (b.checksum != 0) {
                ctx.udp_checksum_enabled = b.checksum != 0;
                pending.ir_dyn = true;
            }
            if let (Some(ra), Some(rb)) = (ra, rb) {
                if ra.payload_type != rb.payload_type {
                    pending.pt = true;
                }
                if ra.csrc != rb.csrc || ra.padding != rb.padding
                    || ra.extension != rb.extension
                {
                    pending.ir_dyn = true;
                }
            }
        }
        (Transport::UdpLite(a), Transport::UdpLite(b)) => {
            if a.coverage != b.coverage || ctx.udp_checksum_enabled != (b.checksum != 0) {
                ctx.udp_checksum_enabled = b.checksum != 0;
                pending.ir_dyn = true;
            }
        }
        _ => {}
    }
    if !ctx.mode_synced {
        pending.mode = true;
    }
    // Behavior flags the peer has not confirmed yet keep riding EXT-3
    if let Some(inner) = &ctx.inner_ipid {
        if inner.analyzer.behavior() != inner.synced {
            pending.ext3_inner = true;
        }
    }
    if let Some(outer) = &ctx.outer_ipid {
        if outer.analyzer.behavior() != outer.synced {
            pending.ext3_outer = true;
        }
    }

    // Periodic refresh, packet-count driven
    ctx.since_ir += 1;
    ctx.since_fo += 1;
    if ctx.since_ir >= cfg.ir_timeout {
        ctx.state = CompressorState::Ir;
        ctx.state_run = 0;
    } else if ctx.since_fo >= cfg.fo_timeout && ctx.state == CompressorState::So {
        ctx.state = CompressorState::Fo;
        ctx.state_run = 0;
    }

    // Changes that need a refresh demote SO
    if ctx.state == CompressorState::So && (pending.ir_dyn || pending.any_ext3()) {
        ctx.state = CompressorState::Fo;
        ctx.state_run = 0;
    }

    build_packet(ctx, cfg, headers, payload, &pending, out)?;

    // Window discipline: every transmitted packet is a reference the
    // peer may hold
    ctx.sn_window.push(sn, sn);
    if with_rtp {
        if let (Some(stride), Some(rtp)) = (ctx.ts_detector.stride(), headers.rtp()) {
            if ctx.stride_synced || pending.stride {
                let (scaled, _) = scale_ts(rtp.ts, stride);
                ctx.ts_window.push(sn, scaled);
            }
        }
    }
    if let Some(inner) = &mut ctx.inner_ipid {
        let behavior = inner.analyzer.behavior();
        if !behavior.rnd {
            let offset = behavior.ordered(ipid_of(&headers.ip)).wrapping_sub(sn as u16);
            inner.window.push(sn, u32::from(offset));
        }
    }
    if let (Some(outer), Some(outer_hdr)) = (&mut ctx.outer_ipid, &headers.outer_ip) {
        let behavior = outer.analyzer.behavior();
        if !behavior.rnd {
            let offset = behavior.ordered(ipid_of(outer_hdr)).wrapping_sub(sn as u16);
            outer.window.push(sn, u32::from(offset));
        }
    }

    ctx.last = headers.clone();
    if !matches!(ctx.profile, ProfileId::Rtp | ProfileId::Esp) {
        ctx.generated_sn = ctx.generated_sn.wrapping_add(1) & 0xffff;
    }

    Ok(())
}

fn build_packet(
    ctx: &mut GenericCtx,
    cfg: &CompConfig,
    headers: &HeaderSet,
    payload: &[u8],
    pending: &Pending,
    out: &mut Vec<u8>,
) -> RohcResult<()> {
    match ctx.state {
        CompressorState::Ir => {
            build_ir(ctx, headers, true, out);
            ctx.state_run += 1;
            ctx.since_ir = 0;
            ctx.since_fo = 0;
            if ctx.optimistic() && ctx.state_run >= cfg.optimistic_count {
                ctx.state = CompressorState::Fo;
                ctx.state_run = 0;
            }
            out.extend_from_slice(payload);
            Ok(())
        }
        CompressorState::Fo => {
            if pending.ir_dyn {
                build_ir_dyn(ctx, headers, out);
            } else {
                build_fo(ctx, headers, pending, out)?;
            }
            ctx.state_run += 1;
            ctx.since_fo = 0;
            if ctx.optimistic() && ctx.state_run >= cfg.optimistic_count {
                ctx.state = CompressorState::So;
                ctx.state_run = 0;
                mark_synced(ctx);
            }
            out.extend_from_slice(payload);
            Ok(())
        }
        CompressorState::So => {
            build_so(ctx, headers, out)?;
            out.extend_from_slice(payload);
            Ok(())
        }
    }
}

fn dyn_info(ctx: &GenericCtx) -> DynInfo {
    DynInfo {
        inner_behavior: ctx
            .inner_ipid
            .as_ref()
            .map_or(IpIdBehavior::SEQUENTIAL, |ipid| ipid.analyzer.behavior()),
        outer_behavior: ctx
            .outer_ipid
            .as_ref()
            .map_or(IpIdBehavior::SEQUENTIAL, |ipid| ipid.analyzer.behavior()),
        mode: Some(ctx.mode),
        ts_stride: ctx.ts_detector.stride(),
        sn: ctx.sn,
    }
}

fn build_ir(ctx: &mut GenericCtx, headers: &HeaderSet, with_dynamic: bool, out: &mut Vec<u8>) {
    let start = out.len();
    out.push(0b1111_1100 | u8::from(with_dynamic));
    out.push(ctx.profile.to_octet());
    let crc_pos = out.len();
    out.push(0);
    chains::build_static_chain(headers, ctx.profile, out);
    if with_dynamic {
        chains::build_dynamic_chain(headers, ctx.profile, &dyn_info(ctx), out);
        mark_synced(ctx);
    }
    out[crc_pos] = 0;
    let crc = crc::crc8(&out[start..], CRC8_INIT);
    out[crc_pos] = crc;
}

fn build_ir_dyn(ctx: &mut GenericCtx, headers: &HeaderSet, out: &mut Vec<u8>) {
    let start = out.len();
    out.push(0b1111_1000);
    out.push(ctx.profile.to_octet());
    let crc_pos = out.len();
    out.push(0);
    chains::build_dynamic_chain(headers, ctx.profile, &dyn_info(ctx), out);
    mark_synced(ctx);
    let crc = crc::crc8(&out[start..], CRC8_INIT);
    out[crc_pos] = crc;
}

/// A refresh packet told the peer about modes, strides and flags
fn mark_synced(ctx: &mut GenericCtx) {
    ctx.mode_synced = true;
    if ctx.ts_detector.stride().is_some() {
        ctx.stride_synced = true;
    }
    if let Some(inner) = &mut ctx.inner_ipid {
        inner.synced = inner.analyzer.behavior();
    }
    if let Some(outer) = &mut ctx.outer_ipid {
        outer.synced = outer.analyzer.behavior();
    }
}

struct FieldNeeds {
    sn_k: u8,
    /// None: no TS movement to convey; Some: scaled LSB count
    ts_k: Option<u8>,
    ts_raw: bool,
    /// None: IP-ID not offset-encoded (no IPv4 or RND); Some(0): offset
    /// unchanged
    ipid_k: Option<u8>,
    marker: bool,
    has_t: bool,
}

fn field_needs(ctx: &GenericCtx, headers: &HeaderSet) -> RohcResult<FieldNeeds> {
    let sn = ctx.sn;
    let Some(sn_k) = ctx.sn_window.k_required(sn) else {
        return Err(RohcError::Internal("empty SN window after IR"));
    };

    let mut ts_k = None;
    let mut ts_raw = false;
    let mut marker = false;
    if let Some(rtp) = headers.rtp() {
        marker = rtp.marker;
        let last_ts = ctx.last.rtp().map_or(0, |last| last.ts);
        let last_sn = ctx.last.rtp().map_or(0, |last| u32::from(last.sn));
        match ctx.ts_detector.stride() {
            Some(stride) if ctx.stride_synced => {
                let delta_sn = sn.wrapping_sub(last_sn) & 0xffff;
                let predicted = last_ts.wrapping_add(delta_sn.wrapping_mul(stride));
                if predicted != rtp.ts {
                    let (scaled, _) = scale_ts(rtp.ts, stride);
                    ts_k = Some(
                        ctx.ts_window
                            .k_required(scaled)
                            .ok_or(RohcError::Internal("empty TS window in scaled mode"))?,
                    );
                }
            }
            _ => {
                if rtp.ts != last_ts {
                    ts_raw = true;
                }
            }
        }
    }

    let mut ipid_k = None;
    let mut has_t = false;
    if let (Some(inner), IpHeader::V4(v4)) = (&ctx.inner_ipid, &headers.ip) {
        // Format interpretation follows the behavior the peer holds;
        // offset bits are only usable once the flags agree
        has_t = !inner.synced.rnd;
        let behavior = inner.analyzer.behavior();
        if !behavior.rnd && behavior == inner.synced {
            let offset = behavior.ordered(v4.id).wrapping_sub(sn as u16);
            ipid_k = inner.window.k_required(u32::from(offset));
        }
    }

    Ok(FieldNeeds {
        sn_k,
        ts_k,
        ts_raw,
        ipid_k,
        marker,
        has_t,
    })
}

fn crc_over_headers(ctx: &GenericCtx, headers: &HeaderSet, seven: bool) -> u8 {
    let with_rtp = ctx.profile.with_rtp();
    let mut stream = Vec::with_capacity(96);
    headers.crc_static_bytes(with_rtp, &mut stream);
    let split = stream.len();
    headers.crc_dynamic_bytes(with_rtp, &mut stream);
    if seven {
        crc::crc7(&stream[split..], crc::crc7(&stream[..split], CRC7_INIT))
    } else {
        crc::crc3(&stream[split..], crc::crc3(&stream[..split], CRC3_INIT))
    }
}

fn append_trailing_fields(ctx: &GenericCtx, headers: &HeaderSet, out: &mut Vec<u8>) {
    // Outer-first, like the chains
    if let (Some(outer), Some(outer_hdr)) = (&ctx.outer_ipid, &headers.outer_ip) {
        if outer.analyzer.behavior().rnd {
            out.extend_from_slice(&ipid_of(outer_hdr).to_be_bytes());
        }
    }
    if let Some(inner) = &ctx.inner_ipid {
        if inner.analyzer.behavior().rnd {
            out.extend_from_slice(&ipid_of(&headers.ip).to_be_bytes());
        }
    }
    match &headers.transport {
        Transport::Udp { udp, .. } if ctx.udp_checksum_enabled => {
            out.extend_from_slice(&udp.checksum.to_be_bytes());
        }
        Transport::UdpLite(udp) => {
            out.extend_from_slice(&udp.coverage.to_be_bytes());
            out.extend_from_slice(&udp.checksum.to_be_bytes());
        }
        _ => {}
    }
}

fn inner_offset(ctx: &GenericCtx, headers: &HeaderSet) -> u16 {
    let behavior = ctx
        .inner_ipid
        .as_ref()
        .map_or(IpIdBehavior::SEQUENTIAL, |ipid| ipid.analyzer.behavior());
    behavior.ordered(ipid_of(&headers.ip)).wrapping_sub(ctx.sn as u16)
}

fn scaled_ts(ctx: &GenericCtx, headers: &HeaderSet) -> u32 {
    match (ctx.ts_detector.stride(), headers.rtp()) {
        (Some(stride), Some(rtp)) => scale_ts(rtp.ts, stride).0,
        _ => 0,
    }
}

/// Build the steady-state (SO) packet: the smallest format whose fields
/// fit, per the selection table
fn build_so(ctx: &mut GenericCtx, headers: &HeaderSet, out: &mut Vec<u8>) -> RohcResult<()> {
    let needs = field_needs(ctx, headers)?;
    let sn = ctx.sn;
    let crc3 = crc_over_headers(ctx, headers, false);

    if ctx.profile.with_rtp() {
        let ts_fits_zero = needs.ts_k.is_none() && !needs.ts_raw;
        let ipid_zero = needs.ipid_k.unwrap_or(0) == 0;

        if !needs.marker && ts_fits_zero && ipid_zero && needs.sn_k <= 4 {
            out.push(((sn as u8) & 0x0f) << 3 | crc3);
        } else if ipid_zero && !needs.ts_raw && needs.sn_k <= 4
            && needs.ts_k.is_some_and(|k| k <= if needs.has_t { 5 } else { 6 })
        {
            let ts = scaled_ts(ctx, headers);
            if needs.has_t {
                // UO-1-TS
                out.push(0b1010_0000 | (ts as u8 & 0x1f));
            } else {
                // UO-1
                out.push(0b1000_0000 | (ts as u8 & 0x3f));
            }
            out.push((u8::from(needs.marker) << 7) | ((sn as u8 & 0x0f) << 3) | crc3);
        } else if needs.has_t && ts_fits_zero && !needs.marker && needs.sn_k <= 4
            && needs.ipid_k.is_some_and(|k| k <= 5)
        {
            // UO-1-ID without extension
            let offset = inner_offset(ctx, headers);
            out.push(0b1000_0000 | (offset as u8 & 0x1f));
            out.push(((sn as u8 & 0x0f) << 3) | crc3);
        } else {
            build_uor2_rtp(ctx, headers, &needs, out)?;
        }
    } else {
        let ipid_zero = needs.ipid_k.unwrap_or(0) == 0;
        if ipid_zero && needs.sn_k <= 4 {
            out.push(((sn as u8) & 0x0f) << 3 | crc3);
        } else if needs.has_t && needs.sn_k <= 5 && needs.ipid_k.is_some_and(|k| k <= 6) {
            // Non-RTP UO-1 carries IP-ID offset bits
            let offset = inner_offset(ctx, headers);
            out.push(0b1000_0000 | (offset as u8 & 0x3f));
            out.push(((sn as u8 & 0x1f) << 3) | crc3);
        } else {
            build_uor2_nonrtp(ctx, headers, &needs, out)?;
        }
    }

    append_trailing_fields(ctx, headers, out);
    Ok(())
}

/// FO packet: UOR-2 with an EXT-3 carrying every pending update
fn build_fo(
    ctx: &mut GenericCtx,
    headers: &HeaderSet,
    pending: &Pending,
    out: &mut Vec<u8>,
) -> RohcResult<()> {
    let needs = field_needs(ctx, headers)?;
    if needs.sn_k > 13 {
        // The window no longer covers the SN in any UOR-2 form
        build_ir(ctx, headers, true, out);
        ctx.since_ir = 0;
        return Ok(());
    }

    let ext3 = make_ext3(ctx, headers, &needs, pending);
    if ctx.profile.with_rtp() {
        let id_base = needs.has_t && needs.ipid_k.unwrap_or(0) > 0;
        build_uor2_rtp_with_ext(
            ctx,
            headers,
            &needs,
            Some(Extension::Ext3(Box::new(ext3))),
            id_base,
            out,
        )?;
    } else {
        build_uor2_nonrtp_with_ext(
            ctx,
            headers,
            &needs,
            Some(Extension::Ext3(Box::new(ext3))),
            out,
        )?;
    }
    append_trailing_fields(ctx, headers, out);
    Ok(())
}

fn make_ext3(
    ctx: &GenericCtx,
    headers: &HeaderSet,
    needs: &FieldNeeds,
    pending: &Pending,
) -> Ext3 {
    let mut ext3 = Ext3::default();
    // Extension bits are less significant than base-header bits
    ext3.sn8 = Some(ctx.sn as u8);

    let inner_behavior = ctx
        .inner_ipid
        .as_ref()
        .map(|ipid| ipid.analyzer.behavior());
    if pending.ext3_inner {
        let (df, tos, ttl) = match &headers.ip {
            IpHeader::V4(v4) => (v4.df, v4.tos, v4.ttl),
            IpHeader::V6(v6) => (false, v6.traffic_class, v6.hop_limit),
        };
        let behavior = inner_behavior.unwrap_or(IpIdBehavior::SEQUENTIAL);
        ext3.inner = Some(Ext3IpFields {
            tos: Some(tos),
            ttl: Some(ttl),
            proto: None,
            df,
            nbo: behavior.nbo,
            rnd: behavior.rnd,
        });
        if matches!(headers.ip, IpHeader::V4(_)) && !behavior.rnd {
            ext3.inner_ipid = Some(ipid_of(&headers.ip));
        }
    }
    if pending.ext3_outer {
        if let Some(outer_hdr) = &headers.outer_ip {
            let (df, tos, ttl) = match outer_hdr {
                IpHeader::V4(v4) => (v4.df, v4.tos, v4.ttl),
                IpHeader::V6(v6) => (false, v6.traffic_class, v6.hop_limit),
            };
            let behavior = ctx
                .outer_ipid
                .as_ref()
                .map_or(IpIdBehavior::SEQUENTIAL, |ipid| ipid.analyzer.behavior());
            ext3.outer = Some(Ext3IpFields {
                tos: Some(tos),
                ttl: Some(ttl),
                proto: None,
                df,
                nbo: behavior.nbo,
                rnd: behavior.rnd,
            });
            if matches!(outer_hdr, IpHeader::V4(_)) && !behavior.rnd {
                ext3.outer_ipid = Some(ipid_of(outer_hdr));
            }
        }
    }

    // In the RTP layout the ip2 flag rides in the inner flags octet, so
    // an outer update forces the inner octet along
    if ctx.profile.with_rtp() && ext3.outer.is_some() && ext3.inner.is_none() {
        let (df, tos, ttl) = match &headers.ip {
            IpHeader::V4(v4) => (v4.df, v4.tos, v4.ttl),
            IpHeader::V6(v6) => (false, v6.traffic_class, v6.hop_limit),
        };
        let behavior = inner_behavior.unwrap_or(IpIdBehavior::SEQUENTIAL);
        ext3.inner = Some(Ext3IpFields {
            tos: Some(tos),
            ttl: Some(ttl),
            proto: None,
            df,
            nbo: behavior.nbo,
            rnd: behavior.rnd,
        });
    }

    // An offset the window no longer covers is re-anchored with the
    // full IP-ID
    if ext3.inner_ipid.is_none()
        && needs.ipid_k.unwrap_or(0) > 0
        && matches!(headers.ip, IpHeader::V4(_))
    {
        ext3.inner_ipid = Some(ipid_of(&headers.ip));
    }

    if ctx.profile.with_rtp() {
        if needs.ts_raw || pending.raw_ts {
            let ts = headers.rtp().map_or(0, |rtp| rtp.ts);
            let last_ts = ctx.last.rtp().map_or(0, |rtp| rtp.ts);
            let k = crate::lsb::bits_needed(ts, last_ts, 32, crate::lsb::LsbShift::Ts);
            if k > 29 {
                log::debug!("TS jump exceeds the 29-bit SDVL window");
            }
            ext3.ts = Some(Ext3Ts {
                value: ts,
                k: k.min(29),
                scaled: false,
            });
        } else if let Some(k) = needs.ts_k {
            ext3.ts = Some(Ext3Ts {
                value: scaled_ts(ctx, headers),
                k: k.min(29),
                scaled: true,
            });
        }
        let rtp = headers.rtp();
        ext3.rtp = Some(Ext3Rtp {
            mode: ctx.mode,
            pt: pending.pt.then(|| rtp.map_or(0, |rtp| rtp.payload_type)),
            marker: rtp.is_some_and(|rtp| rtp.marker),
            extension: rtp.is_some_and(|rtp| rtp.extension),
            csrc: None,
            ts_stride: pending.stride.then(|| ctx.ts_detector.stride().unwrap_or(1)),
        });
    } else {
        ext3.mode = Some(ctx.mode);
    }

    ext3
}

fn build_uor2_rtp(
    ctx: &mut GenericCtx,
    headers: &HeaderSet,
    needs: &FieldNeeds,
    out: &mut Vec<u8>,
) -> RohcResult<()> {
    // Steady-state UOR-2: smallest extension first, fewer octets win
    // (EXT-0 < EXT-1 < EXT-2 < EXT-3)
    let ts_base = if needs.has_t { 5 } else { 6 };
    let ts_need = needs.ts_k.unwrap_or(0);
    let ipid_need = needs.ipid_k.unwrap_or(0);
    let sn3 = ctx.sn as u8 & 0x07;
    let scaled = scaled_ts(ctx, headers);
    let offset = inner_offset(ctx, headers);

    let (extension, id_base) = if needs.ts_raw {
        let pending = Pending::default();
        (
            Some(Extension::Ext3(Box::new(make_ext3(ctx, headers, needs, &pending)))),
            needs.has_t && ipid_need > 0,
        )
    } else if needs.sn_k <= 6 && ipid_need == 0 && ts_need <= ts_base {
        (None, false)
    } else if needs.has_t && needs.sn_k <= 6 && ts_need == 0 && ipid_need <= 5 {
        (None, true)
    } else if needs.sn_k <= 9 && ipid_need == 0 && ts_need <= ts_base + 3 {
        (
            Some(Extension::Ext0 {
                sn: sn3,
                field: scaled as u8 & 0x07,
            }),
            false,
        )
    } else if needs.has_t && needs.sn_k <= 9 && ts_need == 0 && ipid_need <= 8 {
        (
            Some(Extension::Ext0 {
                sn: sn3,
                field: offset as u8 & 0x07,
            }),
            true,
        )
    } else if needs.sn_k <= 9 && ipid_need <= 8 && ts_need <= ts_base + 3 {
        // TS keeps the base bits, the trailing octet re-anchors the
        // IP-ID offset
        (
            Some(Extension::Ext1 {
                sn: sn3,
                field: scaled as u8 & 0x07,
                field2: offset as u8,
            }),
            false,
        )
    } else if needs.has_t && needs.sn_k <= 9 && ipid_need <= 8 && ts_need <= 8 {
        (
            Some(Extension::Ext1 {
                sn: sn3,
                field: offset as u8 & 0x07,
                field2: scaled as u8,
            }),
            true,
        )
    } else if needs.sn_k <= 9 && ipid_need <= 8 && ts_need <= ts_base + 11 {
        (
            Some(Extension::Ext2 {
                sn: sn3,
                field: scaled as u16 & 0x07ff,
                field2: offset as u8,
            }),
            false,
        )
    } else if needs.has_t && needs.sn_k <= 9 && ipid_need <= 16 && ts_need <= 8 {
        (
            Some(Extension::Ext2 {
                sn: sn3,
                field: offset & 0x07ff,
                field2: scaled as u8,
            }),
            true,
        )
    } else {
        let pending = Pending::default();
        (
            Some(Extension::Ext3(Box::new(make_ext3(ctx, headers, needs, &pending)))),
            needs.has_t && ipid_need > 0,
        )
    };

    build_uor2_rtp_with_ext(ctx, headers, needs, extension, id_base, out)
}

fn build_uor2_rtp_with_ext(
    ctx: &mut GenericCtx,
    headers: &HeaderSet,
    needs: &FieldNeeds,
    extension: Option<Extension>,
    id_base: bool,
    out: &mut Vec<u8>,
) -> RohcResult<()> {
    let sn = ctx.sn;
    let marker = needs.marker;
    let crc7 = crc_over_headers(ctx, headers, true);

    // With EXT-3 the SN travels as 6 + 8 bits; base-only needs 6
    let sn_base = match &extension {
        Some(Extension::Ext3(_)) => (sn >> 8) as u8 & 0x3f,
        Some(_) => (sn >> 3) as u8 & 0x3f,
        None => sn as u8 & 0x3f,
    };
    // Bits the extension's own field carries, below the base bits
    let ext_shift = match &extension {
        Some(Extension::Ext0 { .. } | Extension::Ext1 { .. }) => 3,
        Some(Extension::Ext2 { .. }) => 11,
        _ => 0,
    };

    // Base field: IP-ID offset for UOR-2-ID, TS (scaled) otherwise
    let (first, second_top) = if id_base {
        let offset = inner_offset(ctx, headers);
        let base = (offset >> ext_shift) as u8 & 0x1f;
        (0b1100_0000 | base, 0u8)
    } else {
        let scaled = scaled_ts(ctx, headers);
        if needs.has_t {
            let base = (scaled >> ext_shift) as u8 & 0x1f;
            (0b1100_0000 | base, 0x80u8)
        } else {
            let hi = (scaled >> (ext_shift + 1)) as u8 & 0x1f;
            let lo = (scaled >> ext_shift) as u8 & 0x01;
            (0b1100_0000 | hi, lo << 7)
        }
    };

    out.push(first);
    out.push(second_top | (u8::from(marker) << 6) | (sn_base & 0x3f));
    out.push((u8::from(extension.is_some()) << 7) | crc7);
    if let Some(extension) = &extension {
        ext::build(extension, true, out);
    }
    Ok(())
}

fn build_uor2_nonrtp(
    ctx: &mut GenericCtx,
    headers: &HeaderSet,
    needs: &FieldNeeds,
    out: &mut Vec<u8>,
) -> RohcResult<()> {
    let extension = if needs.sn_k <= 5 && needs.ipid_k.unwrap_or(0) == 0 {
        None
    } else if needs.sn_k <= 8 && needs.ipid_k.is_some_and(|k| k <= 3) {
        let offset = inner_offset(ctx, headers);
        Some(Extension::Ext0 {
            sn: ctx.sn as u8 & 0x07,
            field: offset as u8 & 0x07,
        })
    } else if needs.sn_k <= 8 && needs.ipid_k.is_some_and(|k| k <= 11) {
        let offset = inner_offset(ctx, headers);
        Some(Extension::Ext1 {
            sn: ctx.sn as u8 & 0x07,
            field: (offset >> 8) as u8 & 0x07,
            field2: offset as u8,
        })
    } else {
        let pending = Pending::default();
        Some(Extension::Ext3(Box::new(make_ext3(ctx, headers, needs, &pending))))
    };

    build_uor2_nonrtp_with_ext(ctx, headers, needs, extension, out)
}

fn build_uor2_nonrtp_with_ext(
    ctx: &mut GenericCtx,
    headers: &HeaderSet,
    _needs: &FieldNeeds,
    extension: Option<Extension>,
    out: &mut Vec<u8>,
) -> RohcResult<()> {
    let sn = ctx.sn;
    let crc7 = crc_over_headers(ctx, headers, true);
    let sn_base = match &extension {
        Some(Extension::Ext3(_)) => (sn >> 8) as u8 & 0x1f,
        Some(_) => (sn >> 3) as u8 & 0x1f,
        None => sn as u8 & 0x1f,
    };
    out.push(0b1100_0000 | sn_base);
    out.push((u8::from(extension.is_some()) << 7) | crc7);
    if let Some(extension) = &extension {
        ext::build(extension, false, out);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::{IPPROTO_UDP, Ipv4Header, RtpHeader, UdpHeader};

    fn rtp_flow(sn: u16, ts: u32, id: u16) -> HeaderSet {
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
                    marker: false,
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

    #[test]
    fn test_state_progression_and_uo0() {
        let cfg = CompConfig::default();
        let first = rtp_flow(100, 16_000, 50);
        let mut ctx = GenericCtx::new(ProfileId::Rtp, &first, &cfg, 0);

        let mut sizes = Vec::new();
        for step in 0u16..16 {
            let headers = rtp_flow(100 + step, 16_000 + u32::from(step) * 160, 50 + step);
            let mut out = Vec::new();
            compress(&mut ctx, &cfg, &headers, b"x", &mut out).unwrap();
            sizes.push(out.len());
        }
        // First packets are IR (static + dynamic chains), steady state
        // reaches the 1-octet UO-0 plus checksum and payload
        assert!(sizes[0] > 30);
        assert_eq!(ctx.state, CompressorState::So);
        assert_eq!(*sizes.last().unwrap(), 1 + 2 + 1);
    }

    #[test]
    fn test_uor2_extension_ladder() {
        let cfg = CompConfig::default();
        let first = rtp_flow(0, 16_000, 0);
        let mut ctx = GenericCtx::new(ProfileId::Rtp, &first, &cfg, 0);
        for step in 0u16..12 {
            let headers = rtp_flow(step, 16_000 + u32::from(step) * 160, step);
            let mut out = Vec::new();
            compress(&mut ctx, &cfg, &headers, b"", &mut out).unwrap();
        }
        assert_eq!(ctx.state, CompressorState::So);

        // A scaled-TS jump past EXT-0/EXT-1 range still fits EXT-2
        let headers = rtp_flow(12, 16_000 + (12 + 600) * 160, 12);
        let mut out = Vec::new();
        compress(&mut ctx, &cfg, &headers, b"", &mut out).unwrap();
        assert_eq!(out[0] & 0xe0, 0xc0, "UOR-2 expected");
        assert_ne!(out[2] & 0x80, 0, "extension bit expected");
        assert_eq!(out[3] >> 6, 0b10, "EXT-2 expected");

        // Let the window refill with post-jump references
        for step in 13u16..17 {
            let headers = rtp_flow(step, 16_000 + (u32::from(step) + 600) * 160, step);
            let mut out = Vec::new();
            compress(&mut ctx, &cfg, &headers, b"", &mut out).unwrap();
        }

        // A modest IP-ID-offset move alongside a small TS move fits EXT-1
        let headers = rtp_flow(17, 16_000 + (17 + 601) * 160, 17 + 7);
        let mut out = Vec::new();
        compress(&mut ctx, &cfg, &headers, b"", &mut out).unwrap();
        assert_eq!(out[0] & 0xe0, 0xc0, "UOR-2 expected");
        assert_ne!(out[2] & 0x80, 0, "extension bit expected");
        assert_eq!(out[3] >> 6, 0b01, "EXT-1 expected");
    }

    #[test]
    fn test_static_match_detects_ssrc_change() {
        let cfg = CompConfig::default();
        let first = rtp_flow(1, 0, 1);
        let ctx = GenericCtx::new(ProfileId::Rtp, &first, &cfg, 0);
        let mut changed = rtp_flow(2, 160, 2);
        if let Some(rtp) = changed.rtp_mut() {
            rtp.ssrc = 0x0bad_cafe;
        }
        assert!(ctx.static_matches(&rtp_flow(2, 160, 2)));
        assert!(!ctx.static_matches(&changed));
    }

    #[test]
    fn test_nack_demotes_state() {
        let cfg = CompConfig::default();
        let first = rtp_flow(1, 0, 1);
        let mut ctx = GenericCtx::new(ProfileId::Rtp, &first, &cfg, 0);
        for step in 0u16..10 {
            let headers = rtp_flow(1 + step, u32::from(step) * 160, 1 + step);
            let mut out = Vec::new();
            compress(&mut ctx, &cfg, &headers, b"", &mut out).unwrap();
        }
        assert_eq!(ctx.state, CompressorState::So);
        ctx.on_feedback(&Feedback {
            cid: 0,
            kind: FeedbackKind::Feedback2 {
                ack: FeedbackAck::Nack,
                mode: Some(Mode::Optimistic),
                sn: 5,
                sn_bits: 12,
                sn_valid: true,
            },
        });
        assert_eq!(ctx.state, CompressorState::Fo);
        assert_eq!(ctx.mode, Mode::Optimistic);
    }

    #[test]
    fn test_reliable_mode_holds_state_until_ack() {
        let cfg = CompConfig::default();
        let first = rtp_flow(1, 0, 1);
        let mut ctx = GenericCtx::new(ProfileId::Rtp, &first, &cfg, 0);
        ctx.mode = Mode::Reliable;
        for step in 0u16..10 {
            let headers = rtp_flow(1 + step, u32::from(step) * 160, 1 + step);
            let mut out = Vec::new();
            compress(&mut ctx, &cfg, &headers, b"", &mut out).unwrap();
        }
        assert_eq!(ctx.state, CompressorState::Ir);
        ctx.on_feedback(&Feedback {
            cid: 0,
            kind: FeedbackKind::Feedback2 {
                ack: FeedbackAck::Ack,
                mode: Some(Mode::Reliable),
                sn: 9,
                sn_bits: 12,
                sn_valid: true,
            },
        });
        assert_eq!(ctx.state, CompressorState::Fo);
    }

    #[test]
    fn test_periodic_ir_refresh() {
        let mut cfg = CompConfig::default();
        cfg.ir_timeout = 20;
        cfg.fo_timeout = 10;
        let first = rtp_flow(1, 0, 1);
        let mut ctx = GenericCtx::new(ProfileId::Rtp, &first, &cfg, 0);
        let mut saw_ir_again = false;
        for step in 0u16..40 {
            let headers = rtp_flow(1 + step, u32::from(step) * 160, 1 + step);
            let mut out = Vec::new();
            compress(&mut ctx, &cfg, &headers, b"", &mut out).unwrap();
            if step > 10 && out[0] & 0b1111_1110 == 0b1111_1100 {
                saw_ir_again = true;
            }
        }
        assert!(saw_ir_again);
    }
}
