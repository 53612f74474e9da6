//! Crate-wide error type.

use std::io;

use thiserror::Error;

/// An error occurring in the transport core.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A channel send or receive error.
    #[error("channel error: {0}")]
    Channel(Box<dyn std::error::Error + Send + Sync + 'static>),

    /// `connect`/`send_to_all`/etc. called before `start`.
    #[error("the manager is not running")]
    NotRunning,

    /// A configuration value could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Classification of a failed outbound send, per the socket-send-error taxonomy in §7: message-
/// too-large is logged and dropped, host-unreachable/connection-reset tear the owning peer down,
/// anything else is surfaced to the listener as an `Error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The datagram exceeded what the transport could send in one piece (`EMSGSIZE`).
    MessageSize,
    /// The remote host is unreachable (`EHOSTUNREACH`).
    HostUnreachable,
    /// The remote actively reset the connection (`ECONNRESET`).
    ConnectionReset,
    /// Any other failure, carrying a raw OS error code for the `Error` event.
    Other(i32),
}

impl Error {
    /// Classify a send failure for the caller to act on.
    ///
    /// Matches on `io::ErrorKind` where the standard library already distinguishes the case
    /// (`ConnectionReset`), and falls back to the raw OS error code for the cases it does not
    /// (`EHOSTUNREACH`, `EMSGSIZE`), since those are Linux/BSD errno values rather than portable
    /// `ErrorKind` variants.
    pub fn classify_send_failure(&self) -> SendFailure {
        const EMSGSIZE: i32 = 90;
        const EHOSTUNREACH: i32 = 113;

        match self {
            Error::Io(io_err) => match io_err.kind() {
                io::ErrorKind::ConnectionReset => SendFailure::ConnectionReset,
                _ => match io_err.raw_os_error() {
                    Some(EHOSTUNREACH) => SendFailure::HostUnreachable,
                    Some(EMSGSIZE) => SendFailure::MessageSize,
                    Some(code) => SendFailure::Other(code),
                    None => SendFailure::Other(-1),
                },
            },
            _ => SendFailure::Other(-1),
        }
    }
}
