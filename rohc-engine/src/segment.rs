//! Segmentation (RFC 3095 section 5.2.5)
//!
//! With MRRU > 0, a unit too large for the link is carried as
//! `1111111F`-tagged segments; the final segment (F = 1) ends with an
//! FCS-32 over the reconstructed unit. Reassembly is per channel: the CID
//! lives inside the reconstructed unit.

use crate::{
    crc,
    error::{RohcError, RohcResult},
};

const FCS_LEN: usize = 4;

/// Per-channel reassembly buffer on the decompressor side
#[derive(Default)]
pub(crate) struct Reassembler {
    buf: Vec<u8>,
    active: bool,
}

impl Reassembler {
    /// Absorb one segment payload
    ///
    /// Returns the reassembled unit once the final segment arrived and
    /// its FCS-32 verified; `None` while more segments are expected.
    pub(crate) fn push(
        &mut self,
        payload: &[u8],
        is_final: bool,
        mrru: usize,
    ) -> RohcResult<Option<Vec<u8>>> {
        if mrru == 0 {
            return Err(RohcError::Segment);
        }
        self.active = true;
        self.buf.extend_from_slice(payload);
        if self.buf.len() > mrru + FCS_LEN {
            self.abort();
            return Err(RohcError::Segment);
        }
        if !is_final {
            return Ok(None);
        }

        let mut unit = core::mem::take(&mut self.buf);
        self.active = false;
        if unit.len() < FCS_LEN {
            return Err(RohcError::Segment);
        }
        let fcs_pos = unit.len() - FCS_LEN;
        let expected = u32::from_be_bytes([
            unit[fcs_pos],
            unit[fcs_pos + 1],
            unit[fcs_pos + 2],
            unit[fcs_pos + 3],
        ]);
        unit.truncate(fcs_pos);
        if crc::fcs32(&unit) != expected {
            return Err(RohcError::Segment);
        }

        Ok(Some(unit))
    }

    /// Discard a partial unit; called when a non-segment packet arrives
    /// mid-reassembly (one packet turnaround has passed)
    pub(crate) fn abort(&mut self) {
        if self.active {
            log::debug!("discarding partial reassembly of {} bytes", self.buf.len());
        }
        self.buf.clear();
        self.active = false;
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active
    }
}

/// Split `unit` into ready-to-send segments of at most `max_segment`
/// bytes each (header octet included), appending the FCS-32
pub(crate) fn split(unit: &[u8], max_segment: usize, out: &mut Vec<Vec<u8>>) -> RohcResult<()> {
    if max_segment < 2 {
        return Err(RohcError::Internal("segment size too small"));
    }

    let mut tagged = Vec::with_capacity(unit.len() + FCS_LEN);
    tagged.extend_from_slice(unit);
    tagged.extend_from_slice(&crc::fcs32(unit).to_be_bytes());

    let chunk_len = max_segment - 1;
    let chunks: Vec<&[u8]> = tagged.chunks(chunk_len).collect();
    for (index, chunk) in chunks.iter().enumerate() {
        let is_final = index + 1 == chunks.len();
        let mut segment = Vec::with_capacity(chunk.len() + 1);
        segment.push(0b1111_1110 | u8::from(is_final));
        segment.extend_from_slice(chunk);
        out.push(segment);
    }

    Ok(())
}
