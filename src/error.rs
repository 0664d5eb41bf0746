//! Crate-wide error kinds.
//!
//! Most of these are recovered from at the point they are raised (logged,
//! folded into the status snapshot) rather than propagated to `main` — see
//! the policy note on each variant and the coordinator's handling of it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// A controller descriptor failed to parse or its arithmetic fields did
    /// not validate. The offending descriptor is skipped; others still load.
    #[error("invalid controller descriptor {path}: {reason}")]
    DescriptorInvalid { path: String, reason: String },

    /// A MIDI port required by the current operation could not be opened.
    /// Recoverable everywhere except the virtual output port at startup.
    #[error("MIDI port unavailable: {0}")]
    PortUnavailable(#[from] crate::connection::MidiConnectionError),

    /// The hot thread's inbound queue was full; the newest message was
    /// dropped rather than applying backpressure to the MIDI callback.
    #[error("remap queue overflowed, message dropped")]
    QueueOverflow,

    /// A SysEx programming stream received no ACK within the configured
    /// timeout.
    #[error("timed out waiting for ACK on message {index}")]
    AckTimeout { index: usize },

    /// The device's ACK response explicitly requested abort.
    #[error("device sent ABORT on message {index}")]
    AckAbort { index: usize },

    /// The ACK response's status byte did not match any configured action.
    #[error("unrecognized ACK status byte {status:#04x} on message {index}")]
    AckUnknownStatus { index: usize, status: u8 },

    /// The device asked to retry after a delay; carries the requested delay
    /// so the caller can decide whether the retry cap has been exceeded.
    #[error("device busy, retry after {0}ms")]
    AckBusy(u64),

    /// A programming stream was cancelled because the generation counter
    /// advanced underneath it. Not a failure — surfaced only for logging.
    #[error("stream cancelled (superseded by a newer generation)")]
    StreamCancelled,

    /// A byte sequence could not be parsed as a MIDI message.
    #[error("invalid MIDI status byte {0:#04x}")]
    InvalidMidiByte(u8),
}
