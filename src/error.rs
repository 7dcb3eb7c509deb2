// ABOUTME: Error types for the framer and endpoint engine
// ABOUTME: One variant per failure kind named by the wire protocol's error handling design

use thiserror::Error;

/// Errors surfaced by the framer (`PacketWrapper` / `PacketUnwrapper`).
///
/// Framer-level decoding errors are absorbed internally by
/// [`crate::framer::PacketUnwrapper`] and are not surfaced per-packet to its
/// caller except through the `Ok`/`Err` of a single `read_packet` call —
/// a bad frame simply causes that call to retry against the next bytes the
/// transport yields.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The caller's buffer is smaller than the payload length on the wire,
    /// or an outgoing payload exceeds the 127-byte framer limit.
    #[error("buffer too small for payload")]
    BufferTooSmall,

    /// Sync byte, header CRC, or payload CRC mismatch.
    #[error("bad frame: sync byte or CRC mismatch")]
    BadFrame,

    /// The underlying transfer was cancelled.
    #[error("transfer cancelled")]
    Cancelled,

    /// The underlying byte stream is closed.
    #[error("underlying transport closed")]
    Closed,

    /// Any other transport failure.
    #[error("underlying transport error")]
    Error,
}

/// Errors surfaced by [`crate::endpoint::EndpointProtocol`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EndpointError {
    /// `tx_payload.len() + 4` exceeds the configured MTU, or a reply
    /// exceeded the caller's `rx_buffer` (the latter is clamped rather than
    /// rejected — this variant is only for the outgoing-side check).
    #[error("payload exceeds MTU")]
    BufferTooSmall,

    /// Both the transmitting slot and the single-depth pending slot are
    /// occupied; the caller must retry once one frees up.
    #[error("endpoint busy: a transmit and a queued operation are already outstanding")]
    Busy,

    /// The operation was cancelled via [`crate::endpoint::TransferHandle::cancel`].
    #[error("operation cancelled")]
    Cancelled,

    /// The underlying packet transport closed; the engine has stopped.
    #[error("endpoint transport closed")]
    Closed,

    /// Any other transport-level failure; treated the same as `Closed` at
    /// the engine level.
    #[error("endpoint transport error")]
    Error,
}

impl From<FrameError> for EndpointError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::BufferTooSmall => EndpointError::BufferTooSmall,
            FrameError::Cancelled => EndpointError::Cancelled,
            FrameError::Closed => EndpointError::Closed,
            FrameError::BadFrame | FrameError::Error => EndpointError::Error,
        }
    }
}
