//! Packet-type discriminator
//!
//! The first octet of a ROHC packet (after any Add-CID) selects the
//! format. Some codepoints only make sense combined with the context
//! profile; that refinement happens in the profile parsers, this table is
//! the channel-level classification only.

use derive_more::Display;

/// Channel-level class of a first octet
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Padding octet, skipped
    Padding,
    /// Add-CID prefix carrying CID 1..15
    AddCid,
    /// Feedback element envelope
    Feedback,
    /// Segment of a larger unit (MRRU in effect)
    Segment,
    /// Initialization and Refresh
    Ir,
    /// Dynamic-chain refresh
    IrDyn,
    /// Smallest compressed format
    Uo0,
    /// UO-1 family (UO-1, UO-1-ID, UO-1-TS per context)
    Uo1,
    /// UOR-2 family (UOR-2, UOR-2-ID, UOR-2-TS per context)
    Uor2,
    /// Reserved codepoint
    Invalid,
}

const KINDS: [PacketKind; 256] = const {
    let mut kinds = [PacketKind::Invalid; 256];

    let mut index = 0;
    loop {
        if index >= 256 {
            break;
        }
        let cur_index = index;
        index += 1;

        let byte = cur_index as u8;
        let kind = if byte == 0b1110_0000 {
            // 11100000
            PacketKind::Padding
        } else if byte & 0b1111_0000 == 0b1110_0000 {
            // 1110xxxx, xxxx != 0
            PacketKind::AddCid
        } else if byte & 0b1111_1000 == 0b1111_0000 {
            // 11110xxx
            PacketKind::Feedback
        } else if byte & 0b1111_1110 == 0b1111_1110 {
            // 1111111x
            PacketKind::Segment
        } else if byte & 0b1111_1110 == 0b1111_1100 {
            // 1111110x
            PacketKind::Ir
        } else if byte == 0b1111_1000 {
            // 11111000
            PacketKind::IrDyn
        } else if byte & 0b1000_0000 == 0 {
            // 0xxxxxxx
            PacketKind::Uo0
        } else if byte & 0b1100_0000 == 0b1000_0000 {
            // 10xxxxxx
            PacketKind::Uo1
        } else if byte & 0b1110_0000 == 0b1100_0000 {
            // 110xxxxx
            PacketKind::Uor2
        } else {
            // 11111001..11111011
            PacketKind::Invalid
        };

        kinds[cur_index] = kind;
    }

    kinds
};

/// Classify a first octet
#[must_use]
pub fn kind_of(byte: u8) -> PacketKind {
    KINDS[usize::from(byte)]
}
