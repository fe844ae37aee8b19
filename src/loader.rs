//! Bulk loader: drives the server's `LOAD DATA [LOCAL] INFILE` statement.

use crate::error::{Error, Result};
use crate::infile::{self, ByteSource, Control};
use crate::protocol::packet::ServerReply;
use crate::session::Session;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Load priority emitted into the statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPriority {
    #[default]
    None,
    LowPriority,
    Concurrent,
}

/// What the server does with rows that collide with existing keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateHandling {
    #[default]
    None,
    Ignore,
    Replace,
}

/// Streams a file (or the server's own file) into a table with
/// `LOAD DATA [LOCAL] INFILE`.
///
/// Configure the public fields, then call [`load`](BulkLoader::load). The
/// configuration is read once when the load starts. Exactly one of
/// `file_name` and `source` must be set; a byte-stream source requires
/// `local = true`.
pub struct BulkLoader<'a, S> {
    session: &'a mut Session<S>,
    pub file_name: Option<String>,
    /// Arbitrary byte stream to send instead of reading a file. Consumed by
    /// the load.
    pub source: Option<Box<dyn AsyncRead + Unpin + Send>>,
    pub table_name: String,
    pub character_set: Option<String>,
    /// When true the client streams the data; when false the server reads
    /// its own filesystem.
    pub local: bool,
    pub priority: LoadPriority,
    pub conflict: DuplicateHandling,
    pub field_terminator: Vec<u8>,
    pub line_terminator: Vec<u8>,
    pub field_quotation_character: Option<u8>,
    pub field_quotation_optional: bool,
    pub escape_character: Option<u8>,
    pub lines_prefix: Option<String>,
    pub number_of_lines_to_skip: u32,
    /// Target columns, in file order. Entries starting with `@` are user
    /// variables.
    pub columns: Vec<String>,
    /// `SET` assignments appended to the statement, e.g. ``"`col` = UNHEX(@v)"``.
    pub expressions: Vec<String>,
    pub timeout: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
}

impl<'a, S> BulkLoader<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(session: &'a mut Session<S>) -> Self {
        Self {
            session,
            file_name: None,
            source: None,
            table_name: String::new(),
            character_set: None,
            local: true,
            priority: LoadPriority::None,
            conflict: DuplicateHandling::None,
            field_terminator: b"\t".to_vec(),
            line_terminator: b"\n".to_vec(),
            field_quotation_character: None,
            field_quotation_optional: false,
            escape_character: Some(b'\\'),
            lines_prefix: None,
            number_of_lines_to_skip: 0,
            columns: Vec::new(),
            expressions: Vec::new(),
            timeout: None,
            cancellation: None,
        }
    }

    /// Executes the load and returns the server's affected-row count.
    #[instrument(skip(self), fields(table = %self.table_name, local = self.local))]
    pub async fn load(&mut self) -> Result<u64> {
        self.validate()?;
        let sql = self.build_sql()?;
        let ctl = Control::new(self.timeout, self.cancellation.clone());

        if !self.local {
            self.session.send_command(&sql).await?;
            return match ctl.bound(self.session.receive_reply()).await? {
                ServerReply::Ok(ok) => Ok(ok.affected_rows),
                ServerReply::Err(err) => Err(err.into_error()),
                ServerReply::LocalInfile(_) => {
                    // re-sync before failing so the session stays usable
                    self.session.write_frame(&[]).await?;
                    let _ = self.session.receive_reply().await;
                    Err(Error::Protocol(
                        "server requested local data for a non-LOCAL load".to_string(),
                    ))
                }
                ServerReply::Raw(_) => Err(Error::Protocol(
                    "unexpected result set in response to LOAD DATA".to_string(),
                )),
            };
        }

        let ok = match self.source.take() {
            Some(mut stream) => {
                infile::run(self.session, &sql, ByteSource::Stream(&mut *stream), &ctl).await?
            }
            None => {
                // validated: file_name is present when no stream is set
                let path = self.file_name.clone().unwrap_or_default();
                infile::run(self.session, &sql, ByteSource::Path(&path), &ctl).await?
            }
        };
        Ok(ok.affected_rows)
    }

    fn validate(&self) -> Result<()> {
        if self.table_name.is_empty() {
            return Err(Error::Configuration(
                "table_name must not be empty".to_string(),
            ));
        }
        match (&self.file_name, &self.source) {
            (Some(_), Some(_)) => {
                return Err(Error::Configuration(
                    "file_name and source are mutually exclusive".to_string(),
                ));
            }
            (None, None) => {
                return Err(Error::Configuration(
                    "either file_name or source must be set".to_string(),
                ));
            }
            _ => {}
        }
        if self.source.is_some() && !self.local {
            return Err(Error::Configuration(
                "a source stream requires local = true".to_string(),
            ));
        }
        if self.local && !self.session.capabilities().local_files() {
            return Err(Error::Configuration(
                "the session does not permit LOCAL INFILE".to_string(),
            ));
        }
        if self.field_terminator.is_empty() || self.line_terminator.is_empty() {
            return Err(Error::Configuration(
                "field and line terminators must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn build_sql(&self) -> Result<String> {
        let mut sql = String::from("LOAD DATA ");
        match self.priority {
            LoadPriority::None => {}
            LoadPriority::LowPriority => sql.push_str("LOW_PRIORITY "),
            LoadPriority::Concurrent => sql.push_str("CONCURRENT "),
        }
        if self.local {
            sql.push_str("LOCAL ");
        }
        sql.push_str("INFILE '");
        let name = match (&self.file_name, &self.source) {
            (Some(name), _) => name.as_str(),
            // the name is advisory when a stream is configured
            (None, Some(_)) => "stream",
            (None, None) => unreachable!("validated"),
        };
        escape_string_into(&mut sql, name);
        sql.push_str("' ");
        match self.conflict {
            DuplicateHandling::None => {}
            DuplicateHandling::Ignore => sql.push_str("IGNORE "),
            DuplicateHandling::Replace => sql.push_str("REPLACE "),
        }
        sql.push_str("INTO TABLE ");
        quote_identifier(&mut sql, &self.table_name);
        if let Some(cs) = &self.character_set {
            sql.push_str(" CHARACTER SET ");
            sql.push_str(cs);
        }

        sql.push_str(" FIELDS TERMINATED BY '");
        escape_string_into(&mut sql, bytes_as_str(&self.field_terminator)?);
        sql.push('\'');
        if let Some(quote) = self.field_quotation_character {
            if self.field_quotation_optional {
                sql.push_str(" OPTIONALLY");
            }
            sql.push_str(" ENCLOSED BY '");
            escape_string_into(&mut sql, bytes_as_str(&[quote])?);
            sql.push('\'');
        }
        if let Some(escape) = self.escape_character {
            sql.push_str(" ESCAPED BY '");
            escape_string_into(&mut sql, bytes_as_str(&[escape])?);
            sql.push('\'');
        }

        sql.push_str(" LINES");
        if let Some(prefix) = &self.lines_prefix {
            sql.push_str(" STARTING BY '");
            escape_string_into(&mut sql, prefix);
            sql.push('\'');
        }
        sql.push_str(" TERMINATED BY '");
        escape_string_into(&mut sql, bytes_as_str(&self.line_terminator)?);
        sql.push('\'');

        if self.number_of_lines_to_skip > 0 {
            sql.push_str(&format!(" IGNORE {} LINES", self.number_of_lines_to_skip));
        }
        if !self.columns.is_empty() {
            sql.push_str(" (");
            for (i, column) in self.columns.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                if column.starts_with('@') {
                    sql.push_str(column);
                } else {
                    quote_identifier(&mut sql, column);
                }
            }
            sql.push(')');
        }
        if !self.expressions.is_empty() {
            sql.push_str(" SET ");
            sql.push_str(&self.expressions.join(", "));
        }
        Ok(sql)
    }
}

fn bytes_as_str(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|_| {
        Error::Configuration("terminators and quote characters must be valid UTF-8".to_string())
    })
}

/// Backtick-quotes an identifier, doubling embedded backticks.
pub(crate) fn quote_identifier(out: &mut String, name: &str) {
    out.push('`');
    for c in name.chars() {
        if c == '`' {
            out.push('`');
        }
        out.push(c);
    }
    out.push('`');
}

/// MySQL string-literal escaping for single-quoted strings.
pub(crate) fn escape_string_into(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            '\u{1a}' => out.push_str("\\Z"),
            _ => out.push(c),
        }
    }
}
