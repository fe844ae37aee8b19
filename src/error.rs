//! Error types for the bulk-ingestion paths.

use thiserror::Error;

/// Result type alias using this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the bulk loader and bulk copy operations.
///
/// Failures that occur while the connection is inside the LOCAL INFILE
/// sub-protocol are only surfaced after the empty trailer packet has been
/// sent and the server's final reply consumed, so the session is always left
/// command-ready.
#[derive(Error, Debug)]
pub enum Error {
    /// The operation was configured inconsistently and was never started.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A client-side source path could not be opened. Missing files on the
    /// server's own filesystem are reported by the server and surface as
    /// [`Error::Server`] instead.
    #[error("local file `{path}` not found")]
    FileNotFound {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The server answered with an ERR packet.
    #[error("server error {code} ({sql_state}): {message}")]
    Server {
        code: u16,
        sql_state: String,
        message: String,
    },

    /// Malformed server reply, unexpected packet, or sequence-id skew.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A single encoded row does not fit in one protocol packet.
    #[error("row {row_index} exceeds the maximum packet payload")]
    RowTooLarge {
        row_index: u64,
        #[source]
        source: EncodeError,
    },

    /// A field value could not be encoded for its destination column.
    #[error("cannot encode row {row_index}, column `{column}`")]
    Encode {
        row_index: u64,
        column: String,
        #[source]
        source: EncodeError,
    },

    /// The operation's overall deadline expired.
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a single value cannot be written to the row stream.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// The value has no representation in the stream (non-finite floats,
    /// values too large for a packet).
    #[error("value is not supported in a load data stream")]
    UnsupportedValue,

    /// The value's tag does not match the destination column's logical type.
    #[error("value does not match the destination column type (expected {expected})")]
    TypeMismatch { expected: &'static str },
}
