//! Bulk-ingestion paths for MySQL and MariaDB compatible servers.
//!
//! Two cooperating facades insert large volumes of rows without paying the
//! per-row cost of individual `INSERT` statements:
//!
//! - [`BulkLoader`] drives the server-side `LOAD DATA [LOCAL] INFILE`
//!   statement. With `LOCAL`, the client answers the server's request packet
//!   by streaming a file or an arbitrary byte stream as framed packets.
//! - [`BulkCopy`] writes every row of a [`RowSource`] to a destination
//!   table by synthesizing an equivalent `LOAD DATA LOCAL INFILE` session,
//!   encoding a column-mapped, tab-separated byte stream on the fly.
//!
//! Both operate on a [`Session`] wrapping an already-connected,
//! authenticated stream. Connection establishment, TLS, and transaction
//! management belong to the caller.

pub mod copy;
pub mod error;
pub mod loader;
pub mod protocol;
pub mod session;
pub mod source;
pub mod value;

mod infile;
mod row_stream;

pub use copy::{BulkCopy, BulkCopyColumnMapping, RowsCopiedEvent};
pub use error::{EncodeError, Error, Result};
pub use loader::{BulkLoader, DuplicateHandling, LoadPriority};
pub use session::Session;
pub use source::{MemoryTable, RowCursor, RowSource, SourceColumn};
pub use value::{Value, ValueType};
