use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};

use ahash::RandomState;
use quern_error::{QuernError, Result};

use crate::runtime::arena::ArenaId;

/// Data types a datum can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    Int32,
    Int64,
    Float64,
    Utf8,
    Binary,
    /// Variable-length list of datums (e.g. the result of array building
    /// aggregates).
    List,
    /// Opaque aggregate accumulator. Never stored in user rows; only valid as
    /// a transition state. Moving one across a serialization boundary
    /// requires the owning aggregate's serialize/deserialize functions.
    Internal,
}

impl DataType {
    /// Whether values of this type are stored inline ("by value") as opposed
    /// to being variable-length heap values.
    pub const fn is_by_val(&self) -> bool {
        match self {
            DataType::Bool | DataType::Int32 | DataType::Int64 | DataType::Float64 => true,
            DataType::Utf8 | DataType::Binary | DataType::List => false,
            // Internal states are opaque handles, passed around by value.
            DataType::Internal => true,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Opaque in-memory accumulator for aggregates with an `Internal` transition
/// type.
pub trait InternalState: fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn clone_state(&self) -> Box<dyn InternalState>;
}

/// Handle to a read-write expanded object registered with an arena.
///
/// The handle carries the owning arena so that transition result handling can
/// decide between adopting the object in place and flattening it into a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpandedRef {
    pub arena: ArenaId,
    pub slot: usize,
    /// Generation of the owning arena when the object was registered. A
    /// handle that outlives an arena reset is stale and refused.
    pub generation: u64,
    /// Read-only wrapped handles are handed to final/serialize functions; the
    /// arena refuses mutable access through them.
    pub read_only: bool,
}

impl ExpandedRef {
    pub const fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// A single runtime value.
#[derive(Debug)]
pub enum Datum {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Binary(Vec<u8>),
    List(Vec<Datum>),
    Internal(Box<dyn InternalState>),
    Expanded(ExpandedRef),
}

impl Clone for Datum {
    fn clone(&self) -> Self {
        match self {
            Datum::Null => Datum::Null,
            Datum::Bool(v) => Datum::Bool(*v),
            Datum::Int32(v) => Datum::Int32(*v),
            Datum::Int64(v) => Datum::Int64(*v),
            Datum::Float64(v) => Datum::Float64(*v),
            Datum::Utf8(v) => Datum::Utf8(v.clone()),
            Datum::Binary(v) => Datum::Binary(v.clone()),
            Datum::List(v) => Datum::List(v.clone()),
            Datum::Internal(v) => Datum::Internal(v.clone_state()),
            Datum::Expanded(r) => Datum::Expanded(*r),
        }
    }
}

impl Datum {
    pub const fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Runtime type of this datum, if it has one. Nulls are untyped.
    pub fn datatype(&self) -> Option<DataType> {
        Some(match self {
            Datum::Null => return None,
            Datum::Bool(_) => DataType::Bool,
            Datum::Int32(_) => DataType::Int32,
            Datum::Int64(_) => DataType::Int64,
            Datum::Float64(_) => DataType::Float64,
            Datum::Utf8(_) => DataType::Utf8,
            Datum::Binary(_) => DataType::Binary,
            Datum::List(_) => DataType::List,
            Datum::Internal(_) => DataType::Internal,
            // Expanded handles stand in for the list they will flatten to.
            Datum::Expanded(_) => DataType::List,
        })
    }

    pub fn try_as_bool(&self) -> Result<Option<bool>> {
        match self {
            Datum::Null => Ok(None),
            Datum::Bool(b) => Ok(Some(*b)),
            other => Err(QuernError::new(format!("Not a boolean: {other:?}"))),
        }
    }

    pub fn try_as_i64(&self) -> Result<i64> {
        match self {
            Datum::Int32(v) => Ok(*v as i64),
            Datum::Int64(v) => Ok(*v),
            other => Err(QuernError::new(format!("Not an integer: {other:?}"))),
        }
    }

    pub fn try_as_f64(&self) -> Result<f64> {
        match self {
            Datum::Int32(v) => Ok(*v as f64),
            Datum::Int64(v) => Ok(*v as f64),
            Datum::Float64(v) => Ok(*v),
            other => Err(QuernError::new(format!("Not a float: {other:?}"))),
        }
    }

    /// Grouping equality. Nulls compare equal to each other, matching GROUP
    /// BY and DISTINCT semantics.
    pub fn group_eq(&self, other: &Datum) -> bool {
        self.total_cmp(other) == Ordering::Equal
    }

    /// Total order over datums of the same type. Nulls order last and equal
    /// to each other; callers that need nulls-first reorder explicitly.
    ///
    /// Internal and expanded datums have no order; they never appear in
    /// grouping keys or sort keys.
    pub fn total_cmp(&self, other: &Datum) -> Ordering {
        use Datum::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Greater,
            (_, Null) => Ordering::Less,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int32(a), Int32(b)) => a.cmp(b),
            (Int64(a), Int64(b)) => a.cmp(b),
            (Int32(a), Int64(b)) => (*a as i64).cmp(b),
            (Int64(a), Int32(b)) => a.cmp(&(*b as i64)),
            (Float64(a), Float64(b)) => a.total_cmp(b),
            (Utf8(a), Utf8(b)) => a.cmp(b),
            (Binary(a), Binary(b)) => a.cmp(b),
            (List(a), List(b)) => {
                for (l, r) in a.iter().zip(b.iter()) {
                    match l.total_cmp(r) {
                        Ordering::Equal => {}
                        other => return other,
                    }
                }
                a.len().cmp(&b.len())
            }
            (a, b) => panic!("attempted to compare incomparable datums: {a:?} vs {b:?}"),
        }
    }

    /// Stable 64-bit hash of this datum. Consistent across worker processes.
    pub fn stable_hash(&self, state: &RandomState) -> u64 {
        let mut hasher = state.build_hasher();
        self.hash_into(&mut hasher);
        hasher.finish()
    }

    fn hash_into<H: Hasher>(&self, hasher: &mut H) {
        match self {
            Datum::Null => 0xfeu8.hash(hasher),
            Datum::Bool(v) => (1u8, v).hash(hasher),
            Datum::Int32(v) => (2u8, *v as i64).hash(hasher),
            // Int32 and Int64 of equal value hash identically; grouping
            // compares them equal.
            Datum::Int64(v) => (2u8, *v).hash(hasher),
            Datum::Float64(v) => (3u8, v.to_bits()).hash(hasher),
            Datum::Utf8(v) => (4u8, v).hash(hasher),
            Datum::Binary(v) => (5u8, v).hash(hasher),
            Datum::List(v) => {
                (6u8, v.len()).hash(hasher);
                for d in v {
                    d.hash_into(hasher);
                }
            }
            Datum::Internal(_) | Datum::Expanded(_) => {
                panic!("attempted to hash an aggregate state datum")
            }
        }
    }

    /// Append the self-describing image of this datum: a type tag followed by
    /// the value payload. All scalars little-endian.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Datum::Null => buf.push(0),
            Datum::Bool(v) => {
                buf.push(1);
                buf.push(*v as u8);
            }
            Datum::Int32(v) => {
                buf.push(2);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Datum::Int64(v) => {
                buf.push(3);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Datum::Float64(v) => {
                buf.push(4);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Datum::Utf8(v) => {
                buf.push(5);
                buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                buf.extend_from_slice(v.as_bytes());
            }
            Datum::Binary(v) => {
                buf.push(6);
                buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                buf.extend_from_slice(v);
            }
            Datum::List(v) => {
                buf.push(7);
                buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                for d in v {
                    d.encode(buf)?;
                }
            }
            Datum::Internal(_) => {
                return Err(QuernError::new(
                    "Internal transition state requires a serialize function to encode",
                ))
            }
            Datum::Expanded(_) => {
                return Err(QuernError::new(
                    "Expanded state must be flattened before encoding",
                ))
            }
        }
        Ok(())
    }

    /// Decode one self-describing datum image, advancing the cursor.
    pub fn decode(cursor: &mut &[u8]) -> Result<Datum> {
        let tag = take_bytes(cursor, 1)?[0];
        Ok(match tag {
            0 => Datum::Null,
            1 => Datum::Bool(take_bytes(cursor, 1)?[0] != 0),
            2 => Datum::Int32(i32::from_le_bytes(take_array(cursor)?)),
            3 => Datum::Int64(i64::from_le_bytes(take_array(cursor)?)),
            4 => Datum::Float64(f64::from_le_bytes(take_array(cursor)?)),
            5 => {
                let len = u32::from_le_bytes(take_array(cursor)?) as usize;
                let bytes = take_bytes(cursor, len)?;
                Datum::Utf8(
                    String::from_utf8(bytes.to_vec())
                        .map_err(|_| QuernError::new("Invalid utf8 in datum image"))?,
                )
            }
            6 => {
                let len = u32::from_le_bytes(take_array(cursor)?) as usize;
                Datum::Binary(take_bytes(cursor, len)?.to_vec())
            }
            7 => {
                let len = u32::from_le_bytes(take_array(cursor)?) as usize;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(Datum::decode(cursor)?);
                }
                Datum::List(items)
            }
            other => return Err(QuernError::new(format!("Unknown datum tag: {other}"))),
        })
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Datum::Internal(_), _) | (_, Datum::Internal(_)) => false,
            (Datum::Expanded(a), Datum::Expanded(b)) => a == b,
            _ => self.total_cmp(other) == Ordering::Equal,
        }
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int64(v)
    }
}

impl From<i32> for Datum {
    fn from(v: i32) -> Self {
        Datum::Int32(v)
    }
}

impl From<f64> for Datum {
    fn from(v: f64) -> Self {
        Datum::Float64(v)
    }
}

impl From<bool> for Datum {
    fn from(v: bool) -> Self {
        Datum::Bool(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::Utf8(v.to_string())
    }
}

pub(crate) fn take_bytes<'a>(cursor: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if cursor.len() < len {
        return Err(QuernError::new("Datum image truncated"));
    }
    let (head, rest) = cursor.split_at(len);
    *cursor = rest;
    Ok(head)
}

pub(crate) fn take_array<const N: usize>(cursor: &mut &[u8]) -> Result<[u8; N]> {
    let bytes = take_bytes(cursor, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}
