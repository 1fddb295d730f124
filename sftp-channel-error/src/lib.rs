#![forbid(unsafe_code)]

use std::io;

use thiserror::Error as ThisError;

/// Error returned by [`sftp-channel-client`](https://docs.rs/sftp-channel-client).
#[non_exhaustive]
#[derive(Debug, ThisError)]
pub enum Error {
    /// A blocking wait exceeded its deadline.
    ///
    /// The operation had no side effect on the channel state and
    /// may be retried by the caller.
    #[error("operation timed out")]
    Timeout,

    /// An operation was attempted while the channel or stream is
    /// not in a state that permits it, e.g. reading after close,
    /// or the transport closed concurrently with a blocking wait.
    #[error("inoperable channel status")]
    InvalidStatus,

    /// The remote peer answered with an explicit SSH_FXP_STATUS
    /// error response.
    #[error("server reported status code {code} for request {request_id}: {message}")]
    Protocol {
        /// Request id the status response was correlated to.
        request_id: u32,
        /// Numeric SSH_FX_* status code.
        code: u32,
        /// Human readable message sent by the server.
        message: String,
        /// RFC 3066 language tag of `message`.
        language_tag: String,
    },

    /// A wait completed without the expected response message, or a
    /// response payload was malformed.
    ///
    /// This indicates a protocol invariant violation. It is fatal to
    /// the one call that observed it; the client stays usable.
    #[error("response from server is invalid: {0}")]
    InvalidResponse(&'static str),

    /// The channel layer reported a failure.
    ///
    /// Any wait that is in flight when this happens is converted
    /// into a terminal failure instead of running out its timeout.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Local I/O error, from the transport send path or from
    /// reading/writing a local file during a transfer.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A failure captured during the transmit loop of a file
    /// transfer, re-raised after the remote handle was closed.
    #[error("file transfer failed: {0}")]
    Transfer(#[source] Box<Error>),
}

impl Error {
    /// Wraps a failure that was held back while transfer cleanup ran.
    pub fn transfer(pending: Error) -> Self {
        Error::Transfer(Box::new(pending))
    }
}
