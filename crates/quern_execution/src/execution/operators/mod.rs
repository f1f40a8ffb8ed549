pub mod aggregate;

use std::fmt::Debug;

use quern_error::Result;

use crate::arrays::row::Row;

/// Pull-based row source.
///
/// Each call returns one row or end-of-input. Operators implement the same
/// trait they consume; suspension points exist only at pull boundaries.
pub trait TupleSource: Debug + Send {
    fn next(&mut self) -> Result<Option<Row>>;

    /// Restart the source from the beginning with unchanged parameters.
    fn rescan(&mut self) -> Result<()>;
}
