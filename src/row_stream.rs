//! Builds the lazy byte stream of encoded rows for the bulk copy path.

use crate::error::{EncodeError, Error, Result};
use crate::source::RowSource;
use crate::value::{encode_value, FieldFormat, Value};
use bytes::{Bytes, BytesMut};

/// One output field: which source column feeds it, the destination column
/// name for error context, and whether it travels hex-encoded.
#[derive(Debug, Clone)]
pub(crate) struct OutputColumn {
    pub source_ordinal: usize,
    pub name: String,
    pub hex: bool,
}

/// Encodes rows one at a time, never holding more than the current row.
///
/// Every row must fit in a single packet payload; `max_row_bytes` is the
/// effective chunk size of the session. Once aborted, no further rows are
/// produced and no partial row is ever emitted.
pub(crate) struct RowStream<'a, R> {
    source: &'a mut R,
    columns: Vec<OutputColumn>,
    format: FieldFormat,
    max_row_bytes: usize,
    rows_encoded: u64,
    aborted: bool,
    buf: BytesMut,
}

impl<'a, R> RowStream<'a, R>
where
    R: RowSource,
{
    pub(crate) fn new(
        source: &'a mut R,
        columns: Vec<OutputColumn>,
        format: FieldFormat,
        max_row_bytes: usize,
    ) -> Self {
        Self {
            source,
            columns,
            format,
            max_row_bytes,
            rows_encoded: 0,
            aborted: false,
            buf: BytesMut::new(),
        }
    }

    /// Stops emission after the current row.
    pub(crate) fn abort(&mut self) {
        self.aborted = true;
    }

    pub(crate) fn rows_encoded(&self) -> u64 {
        self.rows_encoded
    }

    /// Encodes and returns the next row, terminators included, or `None`
    /// when the source is exhausted or emission was aborted.
    pub(crate) async fn next_row(&mut self) -> Result<Option<Bytes>> {
        if self.aborted {
            return Ok(None);
        }
        if !self.source.advance().await? {
            return Ok(None);
        }

        let row_index = self.rows_encoded;
        self.buf.clear();
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                self.buf.extend_from_slice(&self.format.field_terminator);
            }
            let value = self.source.field(column.source_ordinal);
            if column.hex {
                if let Value::Bytes(bytes) = value {
                    if bytes.len().saturating_mul(2) > self.max_row_bytes {
                        return Err(Error::RowTooLarge {
                            row_index,
                            source: EncodeError::UnsupportedValue,
                        });
                    }
                }
            }
            encode_value(value, column.hex, &self.format, &mut self.buf).map_err(|source| {
                Error::Encode {
                    row_index,
                    column: column.name.clone(),
                    source,
                }
            })?;
            if self.buf.len() + self.format.line_terminator.len() > self.max_row_bytes {
                return Err(Error::RowTooLarge {
                    row_index,
                    source: EncodeError::UnsupportedValue,
                });
            }
        }
        self.buf.extend_from_slice(&self.format.line_terminator);
        self.rows_encoded += 1;
        Ok(Some(self.buf.split().freeze()))
    }
}
