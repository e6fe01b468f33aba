//! The decompressor half of the engine
//!
//! Walks the channel framing (padding, feedback elements, segments,
//! CIDs), dispatches to the per-profile decoders and generates feedback
//! per the mode policy: nothing in U-mode, NACKs on downgrade plus
//! establishment ACKs in O-mode, an ACK per reference advance in R-mode.

use derive_more::Display;

use crate::{
    CidType, ProfileId,
    context::{ContextTable, DecompressorState, Mode},
    crc::{self, CRC8_INIT},
    cursor::ByteCursor,
    error::{RohcError, RohcResult},
    feedback::{self, FeedbackAck},
    headers,
    packet::{PacketKind, kind_of},
    profiles::{
        ProfileSet,
        decomp::{self, DecompConfig, GenericDctx},
        tcp,
    },
    sdvl, segment,
};

/// What one `decompress` call produced
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum DecompressStatus {
    /// A full uncompressed packet was reconstructed
    #[display("packet")]
    Packet,
    /// The input held only padding and/or feedback
    #[display("feedback-only")]
    FeedbackOnly,
    /// A non-final segment was absorbed into the reassembly buffer
    #[display("segment")]
    Segment,
}

/// Result of one `decompress` call
///
/// `packet` borrows the engine's scratch buffer and is valid until the
/// next call.
pub struct DecompressOutcome<'a> {
    pub status: DecompressStatus,
    /// The reconstructed packet, when `status` is `Packet`
    pub packet: Option<&'a [u8]>,
    /// Feedback generated for the remote compressor; send it on the
    /// feedback channel or piggyback it
    pub feedback: Option<Vec<u8>>,
    /// Piggybacked feedback found in the input, addressed to the local
    /// compressor (`Compressor::deliver_feedback`)
    pub received_feedback: Option<Vec<u8>>,
    /// Context the packet was routed to
    pub cid: Option<u16>,
}

/// Per-profile decompressor context, dispatched by profile id
enum DProfCtx {
    Uncompressed,
    Ip(GenericDctx),
    Udp(GenericDctx),
    UdpLite(GenericDctx),
    Rtp(GenericDctx),
    Esp(GenericDctx),
    Tcp(TcpDctx),
}

struct TcpDctx {
    reference: headers::HeaderSet,
    state: DecompressorState,
}

impl DProfCtx {
    fn generic_mut(&mut self) -> Option<&mut GenericDctx> {
        match self {
            Self::Ip(ctx) | Self::Udp(ctx) | Self::UdpLite(ctx) | Self::Rtp(ctx)
            | Self::Esp(ctx) => Some(ctx),
            Self::Uncompressed | Self::Tcp(_) => None,
        }
    }
}

struct DContext {
    last_used: u64,
    prof: DProfCtx,
}

/// ROHC decompressor for one channel direction
pub struct Decompressor {
    cid_type: CidType,
    contexts: ContextTable<DContext>,
    enabled: ProfileSet,
    cfg: DecompConfig,
    mrru: usize,
    target_mode: Mode,
    scratch: Vec<u8>,
    reasm: segment::Reassembler,
    pending_feedback: Vec<u8>,
    opcount: u64,
}

impl Decompressor {
    /// Create a decompressor; the parameters must mirror the remote
    /// compressor's
    ///
    /// There is no associated-compressor reference: piggybacked feedback
    /// is returned from [`Self::decompress`] for the caller to hand to
    /// its local compressor.
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
            enabled,
            cfg: DecompConfig::default(),
            mrru: 0,
            target_mode: Mode::Unidirectional,
            scratch: Vec::with_capacity(2048),
            reasm: segment::Reassembler::default(),
            pending_feedback: Vec::new(),
            opcount: 0,
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

    /// Mode this end asks the compressor to operate in
    ///
    /// U sends no feedback at all; O and R require a feedback channel.
    pub fn set_target_mode(&mut self, mode: Mode) {
        self.target_mode = mode;
    }

    /// CRC-failure counts for the FC to SC and SC to NC downgrades
    pub fn set_failure_thresholds(&mut self, k1: u32, k2: u32) {
        self.cfg.k1 = k1.max(1);
        self.cfg.k2 = k2.max(1);
    }

    /// Feedback generated by calls that returned an error
    pub fn poll_feedback(&mut self) -> Option<Vec<u8>> {
        if self.pending_feedback.is_empty() {
            None
        } else {
            Some(core::mem::take(&mut self.pending_feedback))
        }
    }

    /// Drop the context for `cid`
    pub fn flush(&mut self, cid: u16) {
        self.contexts.remove(cid);
    }

    /// Decompress one ROHC packet
    pub fn decompress(&mut self, packet: &[u8]) -> RohcResult<DecompressOutcome<'_>> {
        self.opcount += 1;
        self.scratch.clear();

        let mut cursor = ByteCursor::new(packet);
        let mut received_feedback: Vec<u8> = Vec::new();

        // Padding and feedback elements precede at most one header
        loop {
            let Some(first) = cursor.peek_u8() else {
                return Ok(self.outcome(DecompressStatus::FeedbackOnly, None, received_feedback));
            };
            match kind_of(first) {
                PacketKind::Padding => cursor.skip(1)?,
                PacketKind::Feedback => {
                    let start = cursor.pos();
                    feedback::read_element(&mut cursor)?;
                    received_feedback.extend_from_slice(&packet[start..cursor.pos()]);
                }
                _ => break,
            }
        }

        let first = cursor
            .peek_u8()
            .ok_or(RohcError::Internal("prefix loop lost the packet"))?;
        if kind_of(first) == PacketKind::Segment {
            cursor.skip(1)?;
            let is_final = first & 1 != 0;
            return match self.reasm.push(cursor.remaining(), is_final, self.mrru)? {
                Some(unit) => {
                    let (cid, status) = self.decompress_core(&unit)?;
                    Ok(self.outcome_with_cid(status, cid, received_feedback))
                }
                None => Ok(self.outcome(DecompressStatus::Segment, None, received_feedback)),
            };
        }
        if self.reasm.is_active() {
            // A packet turnaround passed without the final segment
            self.reasm.abort();
        }

        let (cid, status) = self.decompress_core(cursor.remaining())?;
        Ok(self.outcome_with_cid(status, cid, received_feedback))
    }

    /// Parse CID framing and dispatch one core packet into the scratch
    /// buffer
    fn decompress_core(&mut self, data: &[u8]) -> RohcResult<(u16, DecompressStatus)> {
        let mut cursor = ByteCursor::new(data);

        let mut cid = 0u16;
        if matches!(self.cid_type, CidType::Small) {
            if let Some(first) = cursor.peek_u8() {
                if kind_of(first) == PacketKind::AddCid {
                    cursor.skip(1)?;
                    cid = u16::from(first & 0x0f);
                }
            }
        }
        let type_octet = cursor.read_u8()?;
        if matches!(self.cid_type, CidType::Large) {
            let value = sdvl::decode(&mut cursor)?;
            if value > u32::from(self.contexts.max_cid()) {
                return Err(RohcError::Malformed);
            }
            cid = value as u16;
        }
        if cid > self.contexts.max_cid() {
            return Err(RohcError::Malformed);
        }

        let kind = kind_of(type_octet);
        let result = match kind {
            PacketKind::Ir => self.handle_ir(cid, type_octet, data, &mut cursor),
            PacketKind::IrDyn => self.handle_ir_dyn(cid, data, &mut cursor),
            PacketKind::Uo0 | PacketKind::Uo1 | PacketKind::Uor2 => {
                self.handle_compressed(cid, kind, type_octet, &mut cursor)
            }
            _ => Err(RohcError::Malformed),
        };
        result.map(|status| (cid, status))
    }

    fn effective_feedback(&self) -> bool {
        !matches!(self.target_mode, Mode::Unidirectional)
    }

    fn queue_ack(&mut self, cid: u16, sn: u32) {
        if !self.effective_feedback() {
            return;
        }
        let mut element = Vec::with_capacity(8);
        if feedback::build_feedback2(
            self.cid_type,
            cid,
            FeedbackAck::Ack,
            self.target_mode,
            sn & 0x000f_ffff,
            &mut element,
        )
        .is_ok()
        {
            self.pending_feedback.extend_from_slice(&element);
        }
    }

    fn queue_nack(&mut self, cid: u16, ack: FeedbackAck, sn: u32) {
        if !self.effective_feedback() {
            return;
        }
        let mut element = Vec::with_capacity(8);
        if feedback::build_feedback2(
            self.cid_type,
            cid,
            ack,
            self.target_mode,
            sn & 0x000f_ffff,
            &mut element,
        )
        .is_ok()
        {
            self.pending_feedback.extend_from_slice(&element);
        }
    }

    fn handle_ir(
        &mut self,
        cid: u16,
        type_octet: u8,
        data: &[u8],
        cursor: &mut ByteCursor<'_>,
    ) -> RohcResult<DecompressStatus> {
        let with_dynamic = type_octet & 1 != 0;
        let chain_start = cursor.pos();
        let profile_octet = cursor.read_u8()?;
        let Some(profile) = ProfileId::from_octet(profile_octet) else {
            return Err(RohcError::ProfileUnsupported(u16::from(profile_octet)));
        };
        if !self.enabled.contains(profile) {
            return Err(RohcError::ProfileUnsupported(profile.id()));
        }
        let crc_value = cursor.read_u8()?;
        let crc_offset = cursor.pos() - 1;

        let status = match profile {
            ProfileId::Uncompressed => {
                verify_ir_crc(cid, type_octet, data, chain_start, cursor.pos(), crc_offset, crc_value)?;
                self.install(cid, DProfCtx::Uncompressed);
                self.scratch.extend_from_slice(cursor.remaining());
                if self.scratch.is_empty() {
                    DecompressStatus::FeedbackOnly
                } else {
                    DecompressStatus::Packet
                }
            }
            ProfileId::Tcp => {
                let mut headers = tcp::parse_static_chain(cursor)?;
                if with_dynamic {
                    tcp::parse_dynamic_chain(cursor, &mut headers)?;
                }
                verify_ir_crc(cid, type_octet, data, chain_start, cursor.pos(), crc_offset, crc_value)?;
                let payload = cursor.remaining();
                if with_dynamic {
                    headers::write(&headers, false, payload.len(), &mut self.scratch);
                    self.scratch.extend_from_slice(payload);
                }
                self.install(
                    cid,
                    DProfCtx::Tcp(TcpDctx {
                        reference: headers,
                        state: if with_dynamic {
                            DecompressorState::FullContext
                        } else {
                            DecompressorState::StaticContext
                        },
                    }),
                );
                if with_dynamic {
                    DecompressStatus::Packet
                } else {
                    DecompressStatus::FeedbackOnly
                }
            }
            _ => {
                let mut table = [None; 16];
                let (parsed, info) =
                    decomp::parse_ir(profile, with_dynamic, cursor, &mut table)?;
                verify_ir_crc(cid, type_octet, data, chain_start, cursor.pos(), crc_offset, crc_value)?;
                let payload = cursor.remaining();
                let sn = info.as_ref().map(|info| info.sn);
                if with_dynamic {
                    headers::write(&parsed, profile.with_rtp(), payload.len(), &mut self.scratch);
                    self.scratch.extend_from_slice(payload);
                }
                let dctx = GenericDctx::new_from_ir(profile, parsed, info.as_ref(), table);
                let prof = match profile {
                    ProfileId::Ip => DProfCtx::Ip(dctx),
                    ProfileId::Udp => DProfCtx::Udp(dctx),
                    ProfileId::UdpLite => DProfCtx::UdpLite(dctx),
                    ProfileId::Rtp => DProfCtx::Rtp(dctx),
                    ProfileId::Esp => DProfCtx::Esp(dctx),
                    _ => return Err(RohcError::Internal("generic IR for non-generic profile")),
                };
                self.install(cid, prof);
                if let Some(sn) = sn {
                    self.queue_ack(cid, sn);
                }
                if with_dynamic {
                    DecompressStatus::Packet
                } else {
                    DecompressStatus::FeedbackOnly
                }
            }
        };

        log::debug!("IR established CID {cid} ({profile})");
        Ok(status)
    }

    fn handle_ir_dyn(
        &mut self,
        cid: u16,
        data: &[u8],
        cursor: &mut ByteCursor<'_>,
    ) -> RohcResult<DecompressStatus> {
        let chain_start = cursor.pos();
        let profile_octet = cursor.read_u8()?;
        let Some(profile) = ProfileId::from_octet(profile_octet) else {
            return Err(RohcError::ProfileUnsupported(u16::from(profile_octet)));
        };
        let crc_value = cursor.read_u8()?;
        let crc_offset = cursor.pos() - 1;

        let opcount = self.opcount;
        let Some(context) = self.contexts.get_mut(cid) else {
            self.queue_nack(cid, FeedbackAck::StaticNack, 0);
            return Err(RohcError::NoContext);
        };
        context.last_used = opcount;

        match &mut context.prof {
            DProfCtx::Tcp(tcp_ctx) => {
                let mut headers = tcp_ctx.reference.clone();
                tcp::parse_dynamic_chain(cursor, &mut headers)?;
                verify_ir_crc(cid, 0b1111_1000, data, chain_start, cursor.pos(), crc_offset, crc_value)?;
                let payload = cursor.remaining();
                headers::write(&headers, false, payload.len(), &mut self.scratch);
                self.scratch.extend_from_slice(payload);
                tcp_ctx.reference = headers;
                tcp_ctx.state = DecompressorState::FullContext;
                Ok(DecompressStatus::Packet)
            }
            DProfCtx::Uncompressed => Err(RohcError::Malformed),
            prof => {
                let Some(dctx) = prof.generic_mut() else {
                    return Err(RohcError::Internal("generic dispatch mismatch"));
                };
                if dctx.profile != profile {
                    return Err(RohcError::Malformed);
                }
                let mut headers = dctx.reference().clone();
                let info = crate::profiles::chains::parse_dynamic_chain(
                    cursor,
                    profile,
                    &mut headers,
                    &mut dctx.csrc_table,
                )?;
                verify_ir_crc(cid, 0b1111_1000, data, chain_start, cursor.pos(), crc_offset, crc_value)?;
                let payload = cursor.remaining();
                headers::write(&headers, profile.with_rtp(), payload.len(), &mut self.scratch);
                self.scratch.extend_from_slice(payload);
                dctx.apply_ir_dyn(headers, &info);
                let sn = info.sn;
                self.queue_ack(cid, sn);
                Ok(DecompressStatus::Packet)
            }
        }
    }

    fn handle_compressed(
        &mut self,
        cid: u16,
        kind: PacketKind,
        type_octet: u8,
        cursor: &mut ByteCursor<'_>,
    ) -> RohcResult<DecompressStatus> {
        let opcount = self.opcount;
        let cfg = self.cfg;
        let Some(context) = self.contexts.get_mut(cid) else {
            self.queue_nack(cid, FeedbackAck::StaticNack, 0);
            return Err(RohcError::NoContext);
        };
        context.last_used = opcount;

        match &mut context.prof {
            DProfCtx::Uncompressed => {
                // Normal packet: type octet is the first original byte
                self.scratch.push(type_octet);
                self.scratch.extend_from_slice(cursor.remaining());
                Ok(DecompressStatus::Packet)
            }
            DProfCtx::Tcp(_) => Err(RohcError::Malformed),
            prof => {
                let Some(dctx) = prof.generic_mut() else {
                    return Err(RohcError::Internal("generic dispatch mismatch"));
                };
                match dctx.state {
                    DecompressorState::NoContext => {
                        self.queue_nack(cid, FeedbackAck::StaticNack, 0);
                        return Err(RohcError::NoContext);
                    }
                    DecompressorState::StaticContext
                        if !matches!(kind, PacketKind::Uor2) =>
                    {
                        // Only the 7-bit-CRC family is trusted to
                        // rebuild a lost dynamic context
                        let error = decomp::undecodable(dctx, &cfg);
                        let downgraded = dctx.state == DecompressorState::NoContext;
                        self.queue_nack(
                            cid,
                            if downgraded {
                                FeedbackAck::StaticNack
                            } else {
                                FeedbackAck::Nack
                            },
                            0,
                        );
                        return Err(error);
                    }
                    _ => {}
                }

                let state_before = dctx.state;
                match decomp::decompress(dctx, &cfg, type_octet, cursor, &mut self.scratch) {
                    Ok(sn) => {
                        if matches!(self.target_mode, Mode::Reliable) {
                            self.queue_ack(cid, sn);
                        } else if state_before != DecompressorState::FullContext {
                            // O-mode acknowledges context repairs
                            self.queue_ack(cid, sn);
                        }
                        Ok(DecompressStatus::Packet)
                    }
                    Err(RohcError::CrcFailure { .. }) => {
                        let state_after = dctx.state;
                        if state_after != state_before {
                            let ack = if state_after == DecompressorState::NoContext {
                                FeedbackAck::StaticNack
                            } else {
                                FeedbackAck::Nack
                            };
                            self.queue_nack(cid, ack, 0);
                        }
                        Err(RohcError::CrcFailure { cid })
                    }
                    Err(error) => Err(error),
                }
            }
        }
    }

    fn install(&mut self, cid: u16, prof: DProfCtx) {
        let last_used = self.opcount;
        self.contexts.insert(cid, DContext { last_used, prof });
    }

    fn outcome(
        &mut self,
        status: DecompressStatus,
        cid: Option<u16>,
        received_feedback: Vec<u8>,
    ) -> DecompressOutcome<'_> {
        let feedback = self.poll_feedback();
        DecompressOutcome {
            status,
            packet: if matches!(status, DecompressStatus::Packet) {
                Some(&self.scratch)
            } else {
                None
            },
            feedback,
            received_feedback: if received_feedback.is_empty() {
                None
            } else {
                Some(received_feedback)
            },
            cid,
        }
    }

    fn outcome_with_cid(
        &mut self,
        status: DecompressStatus,
        cid: u16,
        received_feedback: Vec<u8>,
    ) -> DecompressOutcome<'_> {
        self.outcome(status, Some(cid), received_feedback)
    }
}

/// Verify the CRC-8 of an IR or IR-DYN header
///
/// The CRC covers the type octet and everything from the profile octet
/// through the chains, with the CRC octet itself zeroed; CID bytes
/// between the type octet and the profile octet are excluded.
fn verify_ir_crc(
    cid: u16,
    type_octet: u8,
    data: &[u8],
    chain_start: usize,
    chain_end: usize,
    crc_offset: usize,
    crc_value: u8,
) -> RohcResult<()> {
    let crc = crc::crc8(&[type_octet], CRC8_INIT);
    let crc = crc::crc8(&data[chain_start..crc_offset], crc);
    let crc = crc::crc8(&[0], crc);
    let crc = crc::crc8(&data[crc_offset + 1..chain_end], crc);
    if crc != crc_value {
        log::debug!("IR CRC mismatch on CID {cid}");
        return Err(RohcError::CrcFailure { cid });
    }
    Ok(())
}
