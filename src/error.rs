use std::io;

use thiserror::Error;

/// Errors surfaced by the reception pipeline itself.
///
/// Packet-level problems never show up here. A handler that rejects a
/// datagram is logged and skipped, and cryptographic rejections are reported
/// through [`crate::srtp::SrtpError`]. This type covers misuse of the API
/// and the fatal I/O conditions that shut the flow down.
#[derive(Debug, Error)]
pub enum Error {
    /// An argument referenced an unknown entry, for example installing an
    /// auxiliary handler against a key that was never issued.
    #[error("invalid value")]
    InvalidValue,

    /// The operation requires the reception threads to be stopped.
    #[error("reception flow is running")]
    Running,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
