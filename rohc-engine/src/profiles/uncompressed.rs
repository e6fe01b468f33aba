//! Profile 0x0000, Uncompressed (RFC 3095 section 5.10)
//!
//! Carries packets verbatim: an IR establishes the context, after which
//! Normal packets are the original bytes with only the CID layer in
//! front. This profile is always enabled; it is also the fallback for
//! anything the classifier finds uncompressible.

use crate::{
    ProfileId,
    context::CompressorState,
    crc::{self, CRC8_INIT},
};

/// Compressor context for the Uncompressed profile
pub(crate) struct UncompCtx {
    pub state: CompressorState,
    run: u32,
}

impl UncompCtx {
    pub(crate) fn new() -> Self {
        Self {
            state: CompressorState::Ir,
            run: 0,
        }
    }
}

/// Emit one packet; `optimistic_count` is the IR repeat count (L)
pub(crate) fn compress(
    ctx: &mut UncompCtx,
    optimistic_count: u32,
    packet: &[u8],
    out: &mut Vec<u8>,
) {
    match ctx.state {
        CompressorState::Ir => {
            let start = out.len();
            out.push(0b1111_1100);
            out.push(ProfileId::Uncompressed.to_octet());
            let crc_pos = out.len();
            out.push(0);
            out[crc_pos] = crc::crc8(&out[start..], CRC8_INIT);
            out.extend_from_slice(packet);
            ctx.run += 1;
            if ctx.run >= optimistic_count {
                ctx.state = CompressorState::Fo;
            }
        }
        CompressorState::Fo | CompressorState::So => {
            // Normal packet: the original bytes, CID framing excepted
            out.extend_from_slice(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ir_then_normal() {
        let mut ctx = UncompCtx::new();
        let packet = [0x45u8, 0x00, 0x00, 0x14];

        let mut first = Vec::new();
        compress(&mut ctx, 1, &packet, &mut first);
        assert_eq!(first[0], 0xfc);
        assert_eq!(first[1], 0x00);
        assert_eq!(&first[3..], &packet);
        let crc = crc::crc8(&[0xfc, 0x00, 0x00], CRC8_INIT);
        assert_eq!(first[2], crc);

        let mut second = Vec::new();
        compress(&mut ctx, 1, &packet, &mut second);
        assert_eq!(second, packet);
    }
}
