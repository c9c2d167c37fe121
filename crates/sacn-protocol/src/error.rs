use thiserror::Error;

/// Reasons a datagram is not a usable sACN packet.
///
/// Decoding stops at the first problem found; every variant is final for
/// that datagram.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer ends before the field currently being read
    #[error("packet too short")]
    TooShort,

    /// ACN packet identifier mismatch
    #[error("invalid sACN header")]
    InvalidHeader,

    /// A layer vector or DMP address/data type is not the expected constant
    #[error("invalid vector")]
    InvalidVector,
}
