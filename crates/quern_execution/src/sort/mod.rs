//! External sort collaborator.
//!
//! The aggregate operator treats sorting as a black box with a put/sort/get
//! contract: feed rows (or single datums), perform the sort, then stream the
//! results back. Inter-phase re-sorts use the row form; per-aggregate
//! DISTINCT/ORDER BY uses the datum form when the aggregate has exactly one
//! input.

use std::cmp::Ordering;

use quern_error::{QuernError, Result};

use crate::arrays::datum::Datum;
use crate::arrays::row::Row;
use crate::expr::{compare_rows, SortKey};

#[derive(Debug)]
enum SorterState {
    BuildingRows(Vec<Row>),
    BuildingDatums(Vec<Datum>),
    DrainingRows { rows: std::vec::IntoIter<Row> },
    DrainingDatums { datums: std::vec::IntoIter<Datum> },
}

/// An external sort handle.
#[derive(Debug)]
pub struct ExternalSorter {
    keys: Vec<SortKey>,
    state: SorterState,
}

impl ExternalSorter {
    /// Sorter over whole rows; `keys` index into the rows.
    pub fn new_for_rows(keys: Vec<SortKey>) -> Self {
        ExternalSorter {
            keys,
            state: SorterState::BuildingRows(Vec::new()),
        }
    }

    /// Sorter over single datums. Exactly one key; its column index is
    /// ignored.
    pub fn new_for_datums(key: SortKey) -> Self {
        ExternalSorter {
            keys: vec![key],
            state: SorterState::BuildingDatums(Vec::new()),
        }
    }

    pub fn put_row(&mut self, row: Row) -> Result<()> {
        match &mut self.state {
            SorterState::BuildingRows(rows) => {
                rows.push(row);
                Ok(())
            }
            _ => Err(QuernError::new("Sorter is not accepting rows")),
        }
    }

    pub fn put_datum(&mut self, datum: Datum) -> Result<()> {
        match &mut self.state {
            SorterState::BuildingDatums(datums) => {
                datums.push(datum);
                Ok(())
            }
            _ => Err(QuernError::new("Sorter is not accepting datums")),
        }
    }

    /// Sort the accumulated input and switch to draining.
    pub fn perform_sort(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, SorterState::BuildingRows(Vec::new())) {
            SorterState::BuildingRows(mut rows) => {
                let keys = self.keys.clone();
                rows.sort_unstable_by(|a, b| compare_rows(&keys, a, b));
                self.state = SorterState::DrainingRows {
                    rows: rows.into_iter(),
                };
                Ok(())
            }
            SorterState::BuildingDatums(mut datums) => {
                let key = self.keys[0];
                datums.sort_unstable_by(|a, b| key.compare(a, b));
                self.state = SorterState::DrainingDatums {
                    datums: datums.into_iter(),
                };
                Ok(())
            }
            _ => Err(QuernError::new("Sort already performed")),
        }
    }

    pub fn next_row(&mut self) -> Result<Option<Row>> {
        match &mut self.state {
            SorterState::DrainingRows { rows } => Ok(rows.next()),
            _ => Err(QuernError::new("Sorter is not draining rows")),
        }
    }

    pub fn next_datum(&mut self) -> Result<Option<Datum>> {
        match &mut self.state {
            SorterState::DrainingDatums { datums } => Ok(datums.next()),
            _ => Err(QuernError::new("Sorter is not draining datums")),
        }
    }

    /// Release everything held by the sort.
    pub fn end(self) {}

    /// Compare two already-extracted key datums under the first sort key.
    pub fn compare_first_key(&self, a: &Datum, b: &Datum) -> Ordering {
        self.keys[0].compare(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datum_sort_streams_in_order() {
        let mut sorter = ExternalSorter::new_for_datums(SortKey::asc(0));
        for v in [3i64, 1, 2] {
            sorter.put_datum(Datum::Int64(v)).unwrap();
        }
        sorter.perform_sort().unwrap();

        let mut out = Vec::new();
        while let Some(datum) = sorter.next_datum().unwrap() {
            out.push(datum.try_as_i64().unwrap());
        }
        assert_eq!(vec![1, 2, 3], out);
    }

    #[test]
    fn row_sort_honors_descending_and_nulls_first() {
        let keys = vec![SortKey {
            column: 0,
            descending: true,
            nulls_first: true,
        }];
        let mut sorter = ExternalSorter::new_for_rows(keys);
        sorter.put_row(Row::from([Datum::Int64(1)])).unwrap();
        sorter.put_row(Row::from([Datum::Null])).unwrap();
        sorter.put_row(Row::from([Datum::Int64(5)])).unwrap();
        sorter.perform_sort().unwrap();

        let mut out = Vec::new();
        while let Some(row) = sorter.next_row().unwrap() {
            out.push(row.values[0].clone());
        }
        assert_eq!(
            vec![Datum::Null, Datum::Int64(5), Datum::Int64(1)],
            out
        );
    }

    #[test]
    fn put_after_sort_errors() {
        let mut sorter = ExternalSorter::new_for_datums(SortKey::asc(0));
        sorter.perform_sort().unwrap();
        assert!(sorter.put_datum(Datum::Int64(1)).is_err());
    }
}
