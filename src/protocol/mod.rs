//! MySQL client/server wire-protocol pieces used by the bulk-ingestion paths.

pub mod framer;
pub mod packet;
