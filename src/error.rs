use thiserror::Error;

/// Errors surfaced by the PGM endpoint core.
///
/// Framing and window errors stay internal to the receive path (counted and
/// dropped, with window misses reported as statuses); only configuration,
/// send-side and I/O faults reach the caller.
#[derive(Debug, Error)]
pub enum PgmError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("message too large for transmit window")]
    MessageTooLarge,
    #[error("Reed-Solomon coding error: {0}")]
    Fec(String),
    #[error("socket destroyed")]
    Destroyed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a received TPDU was discarded before reaching a window.
///
/// Never propagated to the caller. Carried on the internal parse result so
/// the socket can bump the right counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("TPDU shorter than the PGM header")]
    Truncated,
    #[error("unknown PGM type")]
    UnknownType,
    #[error("checksum mismatch")]
    Checksum,
    #[error("ODATA/RDATA without checksum")]
    MissingChecksum,
    #[error("malformed option chain")]
    BadOptions,
    #[error("unknown network-significant option")]
    UnknownNetworkOption,
    #[error("unrecognised NLA address family")]
    BadAfi,
}
