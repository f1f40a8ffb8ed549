use quern_error::{QuernError, Result};

use super::datum::{take_array, take_bytes, Datum};
use crate::arrays::datum::DataType;

/// An owned row of datums.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub values: Vec<Datum>,
}

/// Wire form of a row image.
///
/// A given redistribution buffer carries exactly one kind; the kind is fixed
/// by the first record written and mixing kinds is a fatal invariant
/// violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowImageKind {
    /// Every datum carries its own type tag. Decodable without a schema.
    SelfDescribing,
    /// Schema-relative: a presence byte followed by the raw payload. Decoding
    /// requires the row layout the image was produced against.
    Packed,
}

impl RowImageKind {
    pub const fn as_u8(self) -> u8 {
        match self {
            RowImageKind::SelfDescribing => 1,
            RowImageKind::Packed => 2,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(RowImageKind::SelfDescribing),
            2 => Ok(RowImageKind::Packed),
            other => Err(QuernError::new(format!("Unknown row image kind: {other}"))),
        }
    }
}

impl Row {
    pub fn new(values: Vec<Datum>) -> Self {
        Row { values }
    }

    pub fn empty() -> Self {
        Row { values: Vec::new() }
    }

    pub fn num_columns(&self) -> usize {
        self.values.len()
    }

    pub fn column(&self, idx: usize) -> Result<&Datum> {
        self.values
            .get(idx)
            .ok_or_else(|| QuernError::new(format!("Column index out of bounds: {idx}")))
    }

    /// Copy out a subset of columns in the given order.
    pub fn project(&self, columns: &[usize]) -> Result<Row> {
        let mut values = Vec::with_capacity(columns.len());
        for &idx in columns {
            values.push(self.column(idx)?.clone());
        }
        Ok(Row { values })
    }

    /// Self-describing image: u32 column count, then tagged datums.
    pub fn encode_tagged(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        for datum in &self.values {
            datum.encode(buf)?;
        }
        Ok(())
    }

    pub fn decode_tagged(cursor: &mut &[u8]) -> Result<Row> {
        let len = u32::from_le_bytes(take_array(cursor)?) as usize;
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            values.push(Datum::decode(cursor)?);
        }
        Ok(Row { values })
    }

    /// Packed image against a row layout: one presence byte per column
    /// followed by the untagged payload. All scalars little-endian.
    pub fn encode_packed(&self, layout: &[DataType], buf: &mut Vec<u8>) -> Result<()> {
        if self.values.len() != layout.len() {
            return Err(QuernError::new(format!(
                "Row has {} columns, layout expects {}",
                self.values.len(),
                layout.len()
            )));
        }
        for (datum, ty) in self.values.iter().zip(layout) {
            if datum.is_null() {
                buf.push(0);
                continue;
            }
            buf.push(1);
            match (datum, ty) {
                (Datum::Bool(v), DataType::Bool) => buf.push(*v as u8),
                (Datum::Int32(v), DataType::Int32) => buf.extend_from_slice(&v.to_le_bytes()),
                (Datum::Int64(v), DataType::Int64) => buf.extend_from_slice(&v.to_le_bytes()),
                (Datum::Float64(v), DataType::Float64) => buf.extend_from_slice(&v.to_le_bytes()),
                (Datum::Utf8(v), DataType::Utf8) => {
                    buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                    buf.extend_from_slice(v.as_bytes());
                }
                (Datum::Binary(v), DataType::Binary) => {
                    buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                    buf.extend_from_slice(v);
                }
                (Datum::List(v), DataType::List) => {
                    buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                    for d in v {
                        d.encode(buf)?;
                    }
                }
                (datum, ty) => {
                    return Err(QuernError::new(format!(
                        "Datum {datum:?} does not match layout type {ty}"
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn decode_packed(layout: &[DataType], cursor: &mut &[u8]) -> Result<Row> {
        let mut values = Vec::with_capacity(layout.len());
        for ty in layout {
            let present = take_bytes(cursor, 1)?[0];
            if present == 0 {
                values.push(Datum::Null);
                continue;
            }
            let datum = match ty {
                DataType::Bool => Datum::Bool(take_bytes(cursor, 1)?[0] != 0),
                DataType::Int32 => Datum::Int32(i32::from_le_bytes(take_array(cursor)?)),
                DataType::Int64 => Datum::Int64(i64::from_le_bytes(take_array(cursor)?)),
                DataType::Float64 => Datum::Float64(f64::from_le_bytes(take_array(cursor)?)),
                DataType::Utf8 => {
                    let len = u32::from_le_bytes(take_array(cursor)?) as usize;
                    Datum::Utf8(
                        String::from_utf8(take_bytes(cursor, len)?.to_vec())
                            .map_err(|_| QuernError::new("Invalid utf8 in row image"))?,
                    )
                }
                DataType::Binary => {
                    let len = u32::from_le_bytes(take_array(cursor)?) as usize;
                    Datum::Binary(take_bytes(cursor, len)?.to_vec())
                }
                DataType::List => {
                    let len = u32::from_le_bytes(take_array(cursor)?) as usize;
                    let mut items = Vec::with_capacity(len);
                    for _ in 0..len {
                        items.push(Datum::decode(cursor)?);
                    }
                    Datum::List(items)
                }
                DataType::Internal => {
                    return Err(QuernError::new("Internal states cannot appear in rows"))
                }
            };
            values.push(datum);
        }
        Ok(Row { values })
    }
}

impl<const N: usize> From<[Datum; N]> for Row {
    fn from(values: [Datum; N]) -> Self {
        Row {
            values: values.into(),
        }
    }
}
