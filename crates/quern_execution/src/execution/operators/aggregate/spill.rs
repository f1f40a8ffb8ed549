//! Hybrid hash aggregation: partition-on-overflow spilling.
//!
//! When a capped hash table fills, every entry is written to one of
//! `num_files` batch files chosen by `hashkey % num_files`, and the table is
//! reset for further input. After input ends the batches are streamed back
//! one file at a time: records whose group is already in memory combine into
//! it, new groups repopulate the table, and a record arriving at a full table
//! is pushed down into a child spill set with one more file than its parent.
//! Each descent strictly grows the fan-out, so the recursion terminates once
//! a file reloads without overflow.
//!
//! Record format, all scalars little-endian: `u32` hash key, `u64` payload
//! size, then the payload: the packed representative row, one flag byte per
//! transition, and the transition values in transition order (by-reference
//! values as tagged datum images, internal by-value states as length-prefixed
//! blobs produced by the serialize function, other by-value datums as tagged
//! images).

use quern_error::{OptionExt, QuernError, Result};
use smallvec::SmallVec;
use tracing::debug;

use super::hash_table::{PerHash, TableInsert};
use super::state::{GroupState, PerTrans, TransValue};
use crate::arrays::datum::{take_array, take_bytes, DataType, Datum};
use crate::arrays::row::Row;
use crate::functions::AggCallFrame;
use crate::runtime::arena::{ArenaId, MemoryContexts};

/// One level of batch files.
#[derive(Debug)]
pub struct SpillSet {
    pub level: usize,
    pub num_files: usize,
    /// Read cursor over `files`.
    pub current_file: usize,
    pub files: Vec<Option<SpillFile>>,
}

impl SpillSet {
    pub fn new(level: usize, num_files: usize) -> Self {
        SpillSet {
            level,
            num_files,
            current_file: 0,
            files: (0..num_files).map(|_| None).collect(),
        }
    }
}

#[derive(Debug)]
pub struct SpillFile {
    pub file: crate::io::buffered_file::BufFile,
    pub ntups_read: u64,
    pub ntups_write: u64,
    /// Set when this batch itself overflowed during reload.
    pub spilled: bool,
    pub child: Option<Box<SpillSet>>,
}

impl SpillFile {
    fn create() -> Result<Self> {
        Ok(SpillFile {
            file: crate::io::buffered_file::BufFile::create_temp()?,
            ntups_read: 0,
            ntups_write: 0,
            spilled: false,
            child: None,
        })
    }

    fn write_record(&mut self, hash: u32, payload: &[u8]) -> Result<()> {
        self.file.write_u32(hash)?;
        self.file.write_u64(payload.len() as u64)?;
        self.file.write_all(payload)?;
        self.ntups_write += 1;
        Ok(())
    }
}

/// Rough bytes per in-memory hash entry, used to size the entry cap from the
/// work-memory budget.
pub fn estimate_entry_size(num_trans: usize, num_slot_cols: usize) -> usize {
    64 + num_slot_cols * 16 + num_trans * 24
}

/// Write out the full hash table and reset it for new inserts.
pub fn dump_hash_table(
    perhash: &mut PerHash,
    pertrans: &[PerTrans],
    contexts: &mut MemoryContexts,
    slot_layout: &[DataType],
) -> Result<()> {
    let config = perhash
        .hybrid
        .ok_or_else(|| QuernError::new("Hash table overflow without hybrid mode"))?;

    if perhash.spill.is_none() {
        perhash.spill = Some(SpillSet::new(0, config.nbatches));
        debug!(
            setno = perhash.setno,
            num_files = config.nbatches,
            "hash table spilled, creating spill set"
        );
    }

    let hybrid_arena = perhash.hybrid_arena;
    let PerHash { spill, table, .. } = perhash;
    let set = spill.as_mut().expect("spill set created above");

    let mut payload = Vec::new();
    for entry_idx in 0..table.num_entries() {
        let hash = table.entry_hash(entry_idx) as u32;

        payload.clear();
        table
            .entry_key(entry_idx)
            .encode_packed(slot_layout, &mut payload)?;
        encode_group_states(table.entry_states(entry_idx), pertrans, contexts, &mut payload)?;

        let file_idx = hash as usize % set.num_files;
        if set.files[file_idx].is_none() {
            set.files[file_idx] = Some(SpillFile::create()?);
        }
        set.files[file_idx]
            .as_mut()
            .expect("file created above")
            .write_record(hash, &payload)?;
    }

    table.reset();
    if let Some(arena) = hybrid_arena {
        contexts.reset(arena)?;
    }
    Ok(())
}

/// Load the next unread batch file into the (reset) hash table.
///
/// Returns false once every file of every spill set has been consumed; the
/// table then holds the final resident batch, already iterated by the caller.
pub fn load_next_batch(
    perhash: &mut PerHash,
    pertrans: &mut [PerTrans],
    contexts: &mut MemoryContexts,
    tmp_arena: ArenaId,
    spill_path: &mut Vec<usize>,
    slot_layout: &[DataType],
) -> Result<bool> {
    if perhash.spill.is_none() {
        return Ok(false);
    }

    loop {
        let (file_idx, level, num_files) = {
            let set = navigate_mut(
                perhash.spill.as_mut().expect("checked above"),
                spill_path,
            )?;
            if set.current_file >= set.num_files {
                if spill_path.is_empty() {
                    // Root exhausted.
                    return Ok(false);
                }
                spill_path.pop();
                continue;
            }
            let file_idx = set.current_file;
            set.current_file += 1;
            if set.files[file_idx].is_none() {
                // Batch never received a record.
                continue;
            }
            (file_idx, set.level, set.num_files)
        };

        perhash.table.reset();
        if let Some(arena) = perhash.hybrid_arena {
            contexts.reset(arena)?;
        }

        read_batch_file(perhash, pertrans, contexts, tmp_arena, spill_path, slot_layout, file_idx, level, num_files)?;

        // Descend into the child set if this batch overflowed while loading;
        // its files are read after the caller drains the table.
        let set = navigate_mut(perhash.spill.as_mut().expect("spill set"), spill_path)?;
        let file = set.files[file_idx].as_mut().expect("file present");
        if file.spilled {
            spill_path.push(file_idx);
        }
        return Ok(true);
    }
}

fn navigate_mut<'a>(root: &'a mut SpillSet, path: &[usize]) -> Result<&'a mut SpillSet> {
    let mut set = root;
    for &idx in path {
        set = set.files[idx]
            .as_mut()
            .and_then(|file| file.child.as_deref_mut())
            .ok_or_else(|| QuernError::new("Spill path no longer valid"))?;
    }
    Ok(set)
}

#[allow(clippy::too_many_arguments)]
fn read_batch_file(
    perhash: &mut PerHash,
    pertrans: &mut [PerTrans],
    contexts: &mut MemoryContexts,
    tmp_arena: ArenaId,
    spill_path: &[usize],
    slot_layout: &[DataType],
    file_idx: usize,
    level: usize,
    num_files: usize,
) -> Result<()> {
    // Rewind once, then stream every record.
    {
        let set = navigate_mut(perhash.spill.as_mut().expect("spill set"), spill_path)?;
        let file = set.files[file_idx].as_mut().expect("file present");
        file.file.rewind_for_read()?;
    }

    loop {
        let record = {
            let set = navigate_mut(perhash.spill.as_mut().expect("spill set"), spill_path)?;
            let file = set.files[file_idx].as_mut().expect("file present");
            match file.file.read_u32_opt()? {
                None => {
                    // Sanity check that the file gave back every record it
                    // received.
                    if file.ntups_read != file.ntups_write {
                        return Err(QuernError::new(format!(
                            "Data corrupted in spill file: read {} tuples, wrote {}",
                            file.ntups_read, file.ntups_write
                        )));
                    }
                    break;
                }
                Some(hash) => {
                    let size = file.file.read_u64()? as usize;
                    let mut payload = vec![0u8; size];
                    file.file.read_exact(&mut payload)?;
                    file.ntups_read += 1;
                    (hash, payload)
                }
            }
        };

        apply_record(
            perhash, pertrans, contexts, tmp_arena, spill_path, slot_layout, file_idx, level,
            num_files, record.0, record.1,
        )?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_record(
    perhash: &mut PerHash,
    pertrans: &mut [PerTrans],
    contexts: &mut MemoryContexts,
    tmp_arena: ArenaId,
    spill_path: &[usize],
    slot_layout: &[DataType],
    file_idx: usize,
    level: usize,
    num_files: usize,
    hash: u32,
    payload: Vec<u8>,
) -> Result<()> {
    let mut cursor = payload.as_slice();
    let key = Row::decode_packed(slot_layout, &mut cursor)?;

    let arena = perhash
        .hybrid_arena
        .required("hybrid arena for spill reload")?;

    match perhash
        .table
        .lookup_or_insert_hashed(hash as u64, &key, |_| {})?
    {
        TableInsert::Found(entry_idx) => {
            // Merge the incoming states into the resident entry.
            let incoming = decode_group_states(pertrans, &mut cursor, arena)?;
            for (transno, incoming) in incoming.into_iter().enumerate() {
                let pt = &mut pertrans[transno];
                let state = &mut perhash.table.entry_states_mut(entry_idx)[transno];
                combine_loaded_state(pt, contexts, arena, tmp_arena, state, incoming)?;
            }
        }
        TableInsert::Inserted(entry_idx) => {
            let incoming = decode_group_states(pertrans, &mut cursor, arena)?;
            let states = perhash.table.entry_states_mut(entry_idx);
            for (state, incoming) in states.iter_mut().zip(incoming) {
                *state = incoming;
            }
        }
        TableInsert::Full => {
            // Push the raw record down one level; the child set has one more
            // file than its parent so repeated descents spread the keys.
            let set = navigate_mut(perhash.spill.as_mut().expect("spill set"), spill_path)?;
            let file = set.files[file_idx].as_mut().expect("file present");
            if !file.spilled {
                file.spilled = true;
                file.child = Some(Box::new(SpillSet::new(level + 1, num_files + 1)));
                debug!(
                    level = level + 1,
                    num_files = num_files + 1,
                    "spill file overflowed into new set"
                );
            }
            let child = file.child.as_mut().expect("child created above");
            let child_idx = hash as usize % child.num_files;
            if child.files[child_idx].is_none() {
                child.files[child_idx] = Some(SpillFile::create()?);
            }
            child.files[child_idx]
                .as_mut()
                .expect("file created above")
                .write_record(hash, &payload)?;
        }
    }
    Ok(())
}

/// Combine an incoming spilled state into a resident one using the combine
/// function, independent of the plan's split mode.
fn combine_loaded_state(
    pt: &mut PerTrans,
    contexts: &mut MemoryContexts,
    set_arena: ArenaId,
    tmp_arena: ArenaId,
    state: &mut GroupState,
    incoming: GroupState,
) -> Result<()> {
    let combine = pt
        .desc
        .combine_fn
        .required("combine function for spill reload")?;

    let incoming_datum = if incoming.is_null {
        Datum::Null
    } else {
        incoming.value.datum()
    };

    if pt.desc.combine_fn_strict {
        if incoming_datum.is_null() {
            return Ok(());
        }
        if state.no_value {
            state.value = TransValue::store(incoming_datum, pt.trans_by_val, set_arena);
            state.is_null = false;
            state.no_value = false;
            return Ok(());
        }
        if state.is_null {
            return Ok(());
        }
    }

    let state_datum = state.value.take_datum();
    let mut frame = AggCallFrame::with_context(
        SmallVec::from_iter([state_datum, incoming_datum]),
        crate::functions::CallContext::Aggregate(crate::functions::AggContext {
            contexts: &mut *contexts,
            set_arena,
            temp_arena: tmp_arena,
            aggref: Some(pt.aggref.clone()),
        }),
    );
    combine(&mut frame)?;
    let AggCallFrame { result, .. } = frame;
    let result_is_null = result.is_null();
    state.value = TransValue::store(result, pt.trans_by_val, set_arena);
    state.is_null = result_is_null;
    if !result_is_null {
        state.no_value = false;
    }
    Ok(())
}

/// Append the per-group flag bytes and transition-value images for one entry.
fn encode_group_states(
    states: &[GroupState],
    pertrans: &[PerTrans],
    contexts: &MemoryContexts,
    buf: &mut Vec<u8>,
) -> Result<()> {
    for state in states {
        let mut flags = 0u8;
        if state.is_null {
            flags |= 1;
        }
        if state.no_value {
            flags |= 2;
        }
        buf.push(flags);
    }

    for (state, pt) in states.iter().zip(pertrans) {
        if state.is_null {
            continue;
        }
        let mut datum = state.value.datum();
        if let Datum::Expanded(eref) = datum {
            datum = contexts.expanded(eref)?.flatten();
        }
        if pt.trans_by_val && pt.trans_type == DataType::Internal {
            let serialize = pt
                .serialize_fn
                .ok_or_else(|| QuernError::new("Could not serialize the transition value"))?;
            let mut frame = AggCallFrame::plain(SmallVec::from_iter([datum]));
            serialize(&mut frame)?;
            match frame.result {
                Datum::Binary(bytes) => {
                    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                    buf.extend_from_slice(&bytes);
                }
                other => {
                    return Err(QuernError::new(format!(
                        "Serialize function returned a non-binary value: {other:?}"
                    )))
                }
            }
        } else {
            // By-reference and plain by-value states travel as datum images.
            datum.encode(buf)?;
        }
    }
    Ok(())
}

/// Decode the states written by [`encode_group_states`], deserializing
/// internal blobs. Reloaded values are owned by the hybrid arena.
fn decode_group_states(
    pertrans: &[PerTrans],
    cursor: &mut &[u8],
    arena: ArenaId,
) -> Result<Vec<GroupState>> {
    let num_trans = pertrans.len();
    let flags = take_bytes(cursor, num_trans)?.to_vec();

    let mut states = Vec::with_capacity(num_trans);
    for (transno, pt) in pertrans.iter().enumerate() {
        let is_null = flags[transno] & 1 != 0;
        let no_value = flags[transno] & 2 != 0;
        if is_null {
            states.push(GroupState {
                value: TransValue::null(),
                is_null,
                no_value,
            });
            continue;
        }

        let datum = if pt.trans_by_val && pt.trans_type == DataType::Internal {
            let len = u32::from_le_bytes(take_array(cursor)?) as usize;
            let blob = Datum::Binary(take_bytes(cursor, len)?.to_vec());
            super::transition::call_deserialize(pt, blob)?
        } else {
            Datum::decode(cursor)?
        };

        states.push(GroupState {
            value: TransValue::store(datum, pt.trans_by_val, arena),
            is_null: false,
            no_value,
        });
    }
    Ok(states)
}
