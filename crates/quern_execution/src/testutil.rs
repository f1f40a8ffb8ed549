//! Utilities for testing the aggregate operator.

use quern_error::Result;

use crate::arrays::datum::Datum;
use crate::arrays::row::Row;
use crate::execution::operators::TupleSource;

/// A rescannable source backed by a vector of rows.
#[derive(Debug)]
pub struct RowVecSource {
    rows: Vec<Row>,
    pos: usize,
}

impl RowVecSource {
    pub fn new(rows: Vec<Row>) -> Self {
        RowVecSource { rows, pos: 0 }
    }
}

impl TupleSource for RowVecSource {
    fn next(&mut self) -> Result<Option<Row>> {
        let row = self.rows.get(self.pos).cloned();
        if row.is_some() {
            self.pos += 1;
        }
        Ok(row)
    }

    fn rescan(&mut self) -> Result<()> {
        self.pos = 0;
        Ok(())
    }
}

/// Drain a source into a vector.
pub fn collect_rows(source: &mut dyn TupleSource) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    while let Some(row) = source.next()? {
        rows.push(row);
    }
    Ok(rows)
}

/// Build a row of int64 datums, with `None` as SQL null.
pub fn int_row(values: &[Option<i64>]) -> Row {
    Row::new(
        values
            .iter()
            .map(|v| match v {
                Some(v) => Datum::Int64(*v),
                None => Datum::Null,
            })
            .collect(),
    )
}
