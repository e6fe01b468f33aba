//! RObust Header Compression (ROHC v1) engine
//!
//! Implements the compressor and decompressor halves of RFC 3095 and the
//! related profile RFCs (RFC 3843 IP-only, RFC 4019 UDP-Lite, RFC 4815
//! corrigenda): per-context state machines, W-LSB encoding, profile
//! header serialization and reconstruction, CRC validation, feedback
//! handling and CID multiplexing.
//!
//! The engine consumes raw packet buffers and produces raw packet
//! buffers. Packet I/O, configuration files and front-ends live outside;
//! logging goes through the [`log`] facade.
//!
//! Both halves are synchronous and single-threaded: a [`Compressor`] and
//! a [`Decompressor`] share no state, so one of each may live on
//! different threads without synchronization.
//!
//! ```
//! use rohc_engine::{CidType, Compressor, Decompressor, ProfileId};
//!
//! let profiles = [ProfileId::Ip, ProfileId::Udp, ProfileId::Rtp];
//! let mut compressor = Compressor::new(15, CidType::Small, &profiles);
//! let mut decompressor = Decompressor::new(15, CidType::Small, &profiles);
//! # let packet: &[u8] = &[];
//! # let _ = (&mut compressor, &mut decompressor, packet);
//! ```

mod compressor;
mod context;
mod crc;
mod cursor;
mod decompressor;
mod encodings;
mod error;
mod feedback;
mod headers;
mod lsb;
mod packet;
mod profiles;
mod sdvl;
mod segment;

use derive_more::Display;

pub use compressor::{CompressOutcome, Compressor};
pub use context::{CompressorState, DecompressorState, Mode};
pub use decompressor::{DecompressOutcome, DecompressStatus, Decompressor};
pub use error::RohcError;
pub use lsb::{LsbShift, bits_needed, decode_lsb};
pub use packet::{PacketKind, kind_of};

/// CID addressing scheme of a channel
///
/// Both ends of a channel must agree on it out of band.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum CidType {
    /// CIDs 0..15, carried in an Add-CID octet (absent for CID 0)
    #[display("small")]
    Small,
    /// CIDs 0..16383, SDVL-encoded after the packet type octet
    #[display("large")]
    Large,
}

/// Compression profile (RFC 3095 section 8, RFC 3843, RFC 4019, RFC 6846)
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileId {
    /// 0x0000, pass-through
    #[display("Uncompressed")]
    Uncompressed,
    /// 0x0001, IP/UDP/RTP
    #[display("RTP")]
    Rtp,
    /// 0x0002, IP/UDP
    #[display("UDP")]
    Udp,
    /// 0x0003, IP/ESP
    #[display("ESP")]
    Esp,
    /// 0x0004, IP only
    #[display("IP")]
    Ip,
    /// 0x0006, IP/TCP
    #[display("TCP")]
    Tcp,
    /// 0x0008, IP/UDP-Lite
    #[display("UDP-Lite")]
    UdpLite,
}

impl ProfileId {
    /// The 16-bit profile identifier
    #[must_use]
    pub fn id(self) -> u16 {
        match self {
            Self::Uncompressed => 0x0000,
            Self::Rtp => 0x0001,
            Self::Udp => 0x0002,
            Self::Esp => 0x0003,
            Self::Ip => 0x0004,
            Self::Tcp => 0x0006,
            Self::UdpLite => 0x0008,
        }
    }

    /// Single-octet form used in IR and IR-DYN headers
    pub(crate) fn to_octet(self) -> u8 {
        self.id() as u8
    }

    pub(crate) fn from_octet(octet: u8) -> Option<Self> {
        match octet {
            0x00 => Some(Self::Uncompressed),
            0x01 => Some(Self::Rtp),
            0x02 => Some(Self::Udp),
            0x03 => Some(Self::Esp),
            0x04 => Some(Self::Ip),
            0x06 => Some(Self::Tcp),
            0x08 => Some(Self::UdpLite),
            _ => None,
        }
    }

    /// Whether the profile compresses an RTP header
    pub(crate) fn with_rtp(self) -> bool {
        matches!(self, Self::Rtp)
    }
}
