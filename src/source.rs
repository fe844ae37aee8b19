//! Row sources feeding the bulk copy path.

use crate::error::{Error, Result};
use crate::value::{Value, ValueType};
use futures::stream::{Stream, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;

/// Name and logical type of one source column.
#[derive(Debug, Clone)]
pub struct SourceColumn {
    pub name: String,
    pub ty: ValueType,
}

impl SourceColumn {
    pub fn new(name: impl Into<String>, ty: ValueType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// A forward-only supply of typed rows.
///
/// `field` may only be called after `advance` has returned `true`; the
/// current row stays valid until the next `advance`. A source is borrowed
/// for the duration of one bulk copy and never retained afterwards.
pub trait RowSource: Send {
    fn column_count(&self) -> usize;

    fn column_name(&self, index: usize) -> &str;

    fn column_type(&self, index: usize) -> ValueType;

    /// Moves to the next row. Returns `false` once the source is exhausted.
    fn advance(&mut self) -> impl Future<Output = Result<bool>> + Send;

    /// The value of column `index` in the current row.
    fn field(&self, index: usize) -> &Value;
}

/// An in-memory table of typed rows.
#[derive(Debug)]
pub struct MemoryTable {
    columns: Vec<SourceColumn>,
    rows: VecDeque<Vec<Value>>,
    current: Option<Vec<Value>>,
}

impl MemoryTable {
    pub fn new(columns: Vec<SourceColumn>) -> Self {
        Self {
            columns,
            rows: VecDeque::new(),
            current: None,
        }
    }

    /// Appends a row; its arity must match the declared columns.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::Configuration(format!(
                "row has {} values but the table declares {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push_back(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl RowSource for MemoryTable {
    fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn column_name(&self, index: usize) -> &str {
        &self.columns[index].name
    }

    fn column_type(&self, index: usize) -> ValueType {
        self.columns[index].ty
    }

    async fn advance(&mut self) -> Result<bool> {
        self.current = self.rows.pop_front();
        Ok(self.current.is_some())
    }

    fn field(&self, index: usize) -> &Value {
        let row = self
            .current
            .as_ref()
            .expect("field() called before advance() produced a row");
        &row[index]
    }
}

/// A forward-only cursor over an asynchronous stream of rows, e.g. a result
/// set being read from another connection.
pub struct RowCursor {
    columns: Vec<SourceColumn>,
    rows: Pin<Box<dyn Stream<Item = Result<Vec<Value>>> + Send>>,
    current: Option<Vec<Value>>,
}

impl RowCursor {
    pub fn new(
        columns: Vec<SourceColumn>,
        rows: impl Stream<Item = Result<Vec<Value>>> + Send + 'static,
    ) -> Self {
        Self {
            columns,
            rows: Box::pin(rows),
            current: None,
        }
    }
}

impl RowSource for RowCursor {
    fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn column_name(&self, index: usize) -> &str {
        &self.columns[index].name
    }

    fn column_type(&self, index: usize) -> ValueType {
        self.columns[index].ty
    }

    async fn advance(&mut self) -> Result<bool> {
        match self.rows.next().await {
            Some(row) => {
                let row = row?;
                if row.len() != self.columns.len() {
                    return Err(Error::Configuration(format!(
                        "cursor row has {} values but the cursor declares {} columns",
                        row.len(),
                        self.columns.len()
                    )));
                }
                self.current = Some(row);
                Ok(true)
            }
            None => {
                self.current = None;
                Ok(false)
            }
        }
    }

    fn field(&self, index: usize) -> &Value {
        let row = self
            .current
            .as_ref()
            .expect("field() called before advance() produced a row");
        &row[index]
    }
}
