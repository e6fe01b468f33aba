//! This module contains definition of errors surfaced by the engine

use thiserror::Error;

/// Error for compression and decompression
///
/// No variant is fatal to the engine: a failed call leaves every context
/// in a consistent state and the next packet may succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RohcError {
    /// Short packet, invalid version, or an impossible field combination
    #[error("Malformed packet")]
    Malformed,
    /// The reconstructed header failed its CRC after all repair attempts
    #[error("CRC failure on CID {cid}")]
    CrcFailure {
        /// Context the packet was routed to
        cid: u16,
    },
    /// No context exists for the packet and none could be created
    #[error("No context available")]
    NoContext,
    /// The packet names a profile that is not enabled on this channel
    #[error("Profile {0:#06x} not supported")]
    ProfileUnsupported(u16),
    /// A segment arrived while segmentation is disabled (MRRU = 0), or
    /// the reassembled unit failed its FCS-32
    #[error("Invalid segment")]
    Segment,
    /// Impossible internal state
    ///
    /// Seeing this variant is a bug in the engine, never a property of
    /// the input.
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

pub(crate) type RohcResult<T> = core::result::Result<T, RohcError>;
