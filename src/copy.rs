//! Bulk copy: writes every row of a [`RowSource`] to a destination table
//! through a synthesized `LOAD DATA LOCAL INFILE` session.

use crate::error::{Error, Result};
use crate::infile::{self, Control, InfileStart};
use crate::loader::quote_identifier;
use crate::protocol::framer::{effective_chunk, PacketFramer};
use crate::protocol::packet::{self, ColumnDefinition};
use crate::row_stream::{OutputColumn, RowStream};
use crate::session::Session;
use crate::source::RowSource;
use crate::value::FieldFormat;
use std::collections::HashSet;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Pairs a source column ordinal with a destination column name.
#[derive(Debug, Clone)]
pub struct BulkCopyColumnMapping {
    pub source_ordinal: usize,
    pub destination_column: String,
}

impl BulkCopyColumnMapping {
    pub fn new(source_ordinal: usize, destination_column: impl Into<String>) -> Self {
        Self {
            source_ordinal,
            destination_column: destination_column.into(),
        }
    }
}

/// Passed to the progress handler every `notify_after` rows. Setting `abort`
/// stops sending rows; the transfer still terminates cleanly and the server
/// keeps what it already received (unless the surrounding transaction rolls
/// back).
#[derive(Debug)]
pub struct RowsCopiedEvent {
    pub rows_copied: u64,
    pub abort: bool,
}

type RowsCopiedHandler = Box<dyn FnMut(&mut RowsCopiedEvent) + Send>;

/// Copies all rows of a [`RowSource`] into a destination table.
///
/// Destination column metadata is looked up per call; binary destination
/// columns receive their bytes hex-encoded through a user variable and a
/// `SET col = UNHEX(@colN)` clause.
pub struct BulkCopy<'a, S> {
    session: &'a mut Session<S>,
    pub destination_table_name: String,
    pub bulk_copy_timeout: Option<Duration>,
    /// Rows between progress notifications; 0 disables them.
    pub notify_after: u64,
    /// Explicit column mappings. Empty means: map by ordinal over the first
    /// `min(source columns, destination columns)` positions.
    pub column_mappings: Vec<BulkCopyColumnMapping>,
    pub cancellation: Option<CancellationToken>,
    handler: Option<RowsCopiedHandler>,
    rows_copied: u64,
}

impl<'a, S> BulkCopy<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(session: &'a mut Session<S>) -> Self {
        Self {
            session,
            destination_table_name: String::new(),
            bulk_copy_timeout: None,
            notify_after: 0,
            column_mappings: Vec::new(),
            cancellation: None,
            handler: None,
            rows_copied: 0,
        }
    }

    /// Registers the progress handler invoked every `notify_after` rows.
    pub fn on_rows_copied(&mut self, handler: impl FnMut(&mut RowsCopiedEvent) + Send + 'static) {
        self.handler = Some(Box::new(handler));
    }

    /// Rows copied so far; monotonic during a call, and equal to the
    /// server's affected-row count after a successful one.
    pub fn rows_copied(&self) -> u64 {
        self.rows_copied
    }

    /// Streams every row of `source` to the destination table and returns
    /// the server's affected-row count.
    #[instrument(skip(self, source), fields(table = %self.destination_table_name))]
    pub async fn write_to_server<R>(&mut self, source: &mut R) -> Result<u64>
    where
        R: RowSource,
    {
        if self.destination_table_name.is_empty() {
            return Err(Error::Configuration(
                "destination_table_name must not be empty".to_string(),
            ));
        }
        if !self.session.capabilities().local_files() {
            return Err(Error::Configuration(
                "the session does not permit LOCAL INFILE".to_string(),
            ));
        }

        let ctl = Control::new(self.bulk_copy_timeout, self.cancellation.clone());
        self.rows_copied = 0;

        let destination =
            destination_columns(self.session, &self.destination_table_name, &ctl).await?;
        let columns = resolve_mappings(&self.column_mappings, source.column_count(), &destination)?;
        if columns.is_empty() {
            return Err(Error::Configuration(
                "no columns are mapped for the copy".to_string(),
            ));
        }
        let sql = build_statement(&self.destination_table_name, &columns);
        tracing::debug!(statement = %sql, "starting bulk copy");

        match infile::start(self.session, &sql, &ctl).await? {
            InfileStart::Done(ok) => {
                self.rows_copied = ok.affected_rows;
                return Ok(ok.affected_rows);
            }
            InfileStart::Request => {}
        }

        let chunk = effective_chunk(self.session.max_allowed_packet());
        let mut rows = RowStream::new(source, columns, FieldFormat::default(), chunk);
        let mut pending: Option<Error> = None;
        {
            let mut framer = PacketFramer::new(&mut *self.session);
            loop {
                if let Err(err) = ctl.interrupted() {
                    pending = Some(err);
                    break;
                }
                let row = match rows.next_row().await {
                    Ok(Some(row)) => row,
                    Ok(None) => break,
                    Err(err) => {
                        pending = Some(err);
                        break;
                    }
                };
                framer.write(&row).await?;
                let sent = rows.rows_encoded();
                self.rows_copied = sent;
                if self.notify_after > 0 && sent % self.notify_after == 0 {
                    if let Some(handler) = self.handler.as_mut() {
                        let mut event = RowsCopiedEvent {
                            rows_copied: sent,
                            abort: false,
                        };
                        handler(&mut event);
                        if event.abort {
                            tracing::debug!(rows = sent, "copy aborted by progress handler");
                            rows.abort();
                        }
                    }
                }
            }
            match &pending {
                None => {
                    framer.finish().await?;
                }
                Some(_) => {
                    framer.abort().await?;
                }
            }
        }

        let sent = rows.rows_encoded();
        let ok = infile::confirm(self.session, &ctl, pending).await?;
        self.rows_copied = ok.affected_rows;
        tracing::debug!(
            rows_sent = sent,
            affected = ok.affected_rows,
            "bulk copy complete"
        );
        Ok(ok.affected_rows)
    }
}

/// Fetches the destination table's column metadata with a zero-row select.
async fn destination_columns<S>(
    session: &mut Session<S>,
    table: &str,
    ctl: &Control,
) -> Result<Vec<ColumnDefinition>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut sql = String::from("SELECT * FROM ");
    quote_identifier(&mut sql, table);
    sql.push_str(" LIMIT 0");
    session.send_command(&sql).await?;

    let mut first = ctl.bound(session.read_frame()).await?;
    match first.first().copied() {
        Some(0xff) => {
            return Err(packet::parse_err_packet(&mut first, session.capabilities())?.into_error())
        }
        Some(0x00) | None => {
            return Err(Error::Protocol(
                "expected a result set from the metadata query".to_string(),
            ))
        }
        Some(_) => {}
    }
    let column_count = packet::read_lenenc_int(&mut first)? as usize;

    let mut columns = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        let mut frame = ctl.bound(session.read_frame()).await?;
        columns.push(packet::parse_column_definition(&mut frame)?);
    }

    if !session.capabilities().deprecate_eof() {
        // EOF closing the metadata section
        let _ = ctl.bound(session.read_frame()).await?;
    }
    // terminator of the (empty) row section: EOF, or an OK with an 0xfe
    // header when DEPRECATE_EOF is on
    let terminator = ctl.bound(session.read_frame()).await?;
    match terminator.first().copied() {
        Some(0xfe) => Ok(columns),
        Some(0xff) => {
            let mut frame = terminator;
            Err(packet::parse_err_packet(&mut frame, session.capabilities())?.into_error())
        }
        _ => Err(Error::Protocol(
            "expected the end of the metadata result set".to_string(),
        )),
    }
}

fn resolve_mappings(
    mappings: &[BulkCopyColumnMapping],
    source_columns: usize,
    destination: &[ColumnDefinition],
) -> Result<Vec<OutputColumn>> {
    if mappings.is_empty() {
        let n = source_columns.min(destination.len());
        return Ok(destination[..n]
            .iter()
            .enumerate()
            .map(|(i, column)| OutputColumn {
                source_ordinal: i,
                name: column.name.clone(),
                hex: column.is_binary(),
            })
            .collect());
    }

    let mut seen = HashSet::new();
    let mut resolved = Vec::with_capacity(mappings.len());
    for mapping in mappings {
        if !seen.insert(mapping.destination_column.to_ascii_lowercase()) {
            return Err(Error::Configuration(format!(
                "destination column `{}` is mapped more than once",
                mapping.destination_column
            )));
        }
        if mapping.source_ordinal >= source_columns {
            return Err(Error::Configuration(format!(
                "column count mismatch: mapping references source ordinal {} but the source has {} columns",
                mapping.source_ordinal, source_columns
            )));
        }
        let column = destination
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(&mapping.destination_column))
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "destination table has no column `{}`",
                    mapping.destination_column
                ))
            })?;
        resolved.push(OutputColumn {
            source_ordinal: mapping.source_ordinal,
            name: column.name.clone(),
            hex: column.is_binary(),
        });
    }
    Ok(resolved)
}

fn build_statement(table: &str, columns: &[OutputColumn]) -> String {
    let mut sql = String::from("LOAD DATA LOCAL INFILE 'bulk_copy.csv' INTO TABLE ");
    quote_identifier(&mut sql, table);
    sql.push_str(
        " CHARACTER SET utf8mb4 FIELDS TERMINATED BY '\\t' ESCAPED BY '\\\\' \
         LINES TERMINATED BY '\\n' (",
    );
    let mut assignments = Vec::new();
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            sql.push_str(", ");
        }
        if column.hex {
            let variable = format!("@col{}", i);
            sql.push_str(&variable);
            let mut assignment = String::new();
            quote_identifier(&mut assignment, &column.name);
            assignment.push_str(" = UNHEX(");
            assignment.push_str(&variable);
            assignment.push(')');
            assignments.push(assignment);
        } else {
            quote_identifier(&mut sql, &column.name);
        }
    }
    sql.push(')');
    if !assignments.is_empty() {
        sql.push_str(" SET ");
        sql.push_str(&assignments.join(", "));
    }
    sql
}
