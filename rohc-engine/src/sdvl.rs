//! Self-Describing Variable-Length values (RFC 3095 section 4.4.5)
//!
//! The number of octets is discriminated by the leading bits of the first
//! octet: `0` one octet (7 bits), `10` two octets (14 bits), `110` three
//! octets (21 bits), `111` four octets (29 bits).

use crate::{
    cursor::ByteCursor,
    error::{RohcError, RohcResult},
};

/// Largest value SDVL can carry
pub const SDVL_MAX: u32 = (1 << 29) - 1;

/// Number of octets `encode` will use for `value`
#[must_use]
pub fn encoded_len(value: u32) -> usize {
    if value < (1 << 7) {
        1
    } else if value < (1 << 14) {
        2
    } else if value < (1 << 21) {
        3
    } else {
        4
    }
}

/// Append the SDVL encoding of `value` to `out`
///
/// Fails with [`RohcError::Internal`] if `value` exceeds [`SDVL_MAX`];
/// callers bound their fields before encoding.
pub fn encode(value: u32, out: &mut Vec<u8>) -> RohcResult<()> {
    if value > SDVL_MAX {
        return Err(RohcError::Internal("SDVL value out of range"));
    }

    match encoded_len(value) {
        1 => out.push(value as u8),
        2 => {
            out.push(0b1000_0000 | (value >> 8) as u8);
            out.push(value as u8);
        }
        3 => {
            out.push(0b1100_0000 | (value >> 16) as u8);
            out.push((value >> 8) as u8);
            out.push(value as u8);
        }
        _ => {
            out.push(0b1110_0000 | (value >> 24) as u8);
            out.push((value >> 16) as u8);
            out.push((value >> 8) as u8);
            out.push(value as u8);
        }
    }

    Ok(())
}

/// Bits of value an SDVL field of `octets` octets carries
#[must_use]
pub fn bits_for_len(octets: usize) -> u8 {
    match octets {
        1 => 7,
        2 => 14,
        3 => 21,
        _ => 29,
    }
}

/// Smallest SDVL length carrying at least `k` bits
#[must_use]
pub fn len_for_bits(k: u8) -> usize {
    match k {
        0..=7 => 1,
        8..=14 => 2,
        15..=21 => 3,
        _ => 4,
    }
}

/// Append `value` in exactly `octets` octets; the field then carries
/// [`bits_for_len`]`(octets)` LSBs of the original value
pub fn encode_forced(value: u32, octets: usize, out: &mut Vec<u8>) -> RohcResult<()> {
    match octets {
        1 => out.push(value as u8 & 0x7f),
        2 => {
            out.push(0b1000_0000 | ((value >> 8) as u8 & 0x3f));
            out.push(value as u8);
        }
        3 => {
            out.push(0b1100_0000 | ((value >> 16) as u8 & 0x1f));
            out.push((value >> 8) as u8);
            out.push(value as u8);
        }
        4 => {
            out.push(0b1110_0000 | ((value >> 24) as u8 & 0x1f));
            out.push((value >> 16) as u8);
            out.push((value >> 8) as u8);
            out.push(value as u8);
        }
        _ => return Err(RohcError::Internal("SDVL length out of range")),
    }
    Ok(())
}

/// Read one SDVL value plus the number of LSBs it carried
pub fn decode_with_width(cursor: &mut ByteCursor<'_>) -> RohcResult<(u32, u8)> {
    let start = cursor.pos();
    let value = decode(cursor)?;
    Ok((value, bits_for_len(cursor.pos() - start)))
}

/// Read one SDVL value from the cursor
pub fn decode(cursor: &mut ByteCursor<'_>) -> RohcResult<u32> {
    let first = cursor.read_u8()?;

    let value = if first & 0b1000_0000 == 0 {
        // 0xxxxxxx
        u32::from(first)
    } else if first & 0b0100_0000 == 0 {
        // 10xxxxxx
        (u32::from(first & 0b0011_1111) << 8) | u32::from(cursor.read_u8()?)
    } else if first & 0b0010_0000 == 0 {
        // 110xxxxx
        (u32::from(first & 0b0001_1111) << 16) | (u32::from(cursor.read_u8()?) << 8)
            | u32::from(cursor.read_u8()?)
    } else {
        // 111xxxxx
        (u32::from(first & 0b0001_1111) << 24)
            | (u32::from(cursor.read_u8()?) << 16)
            | (u32::from(cursor.read_u8()?) << 8)
            | u32::from(cursor.read_u8()?)
    };

    Ok(value)
}
