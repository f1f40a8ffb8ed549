pub mod datum;
pub mod row;
