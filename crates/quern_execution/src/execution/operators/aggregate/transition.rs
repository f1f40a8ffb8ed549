//! The per-tuple hot path.
//!
//! Each input row has its combined argument projection evaluated exactly
//! once; every per-transition descriptor then either routes the inputs into
//! its DISTINCT/ORDER BY sort or advances the transition state for every
//! target group: the flat pergroup array of the current sorted phase, and the
//! looked-up hash entries of every hashed grouping set.

use quern_error::{OptionExt, QuernError, Result};
use smallvec::SmallVec;

use super::hash_table::PerHash;
use super::state::{GroupState, PerTrans, TransValue};
use crate::arrays::datum::Datum;
use crate::arrays::row::Row;
use crate::expr::EvalContext;
use crate::functions::{AggCallFrame, AggContext, CallContext, FrameArgs};
use crate::runtime::arena::{ArenaId, MemoryContexts};
use crate::sort::ExternalSorter;

/// A hashed target group for the current input row.
#[derive(Debug, Clone, Copy)]
pub struct HashTarget {
    pub perhash_idx: usize,
    pub entry_idx: usize,
}

/// Advance every transition for one input row.
#[allow(clippy::too_many_arguments)]
pub fn advance_row(
    pertrans: &mut [PerTrans],
    contexts: &mut MemoryContexts,
    tmp_arena: ArenaId,
    row: &Row,
    trans_input: &[Datum],
    mut sorted_pergroups: Option<&mut [GroupState]>,
    set_arenas: &[ArenaId],
    num_sorted_sets: usize,
    perhash: &mut [PerHash],
    hash_targets: &[HashTarget],
    hash_arena: ArenaId,
) -> Result<()> {
    let num_trans = pertrans.len();

    for transno in 0..num_trans {
        let pt = &mut pertrans[transno];

        if let Some(filter) = &pt.aggref.filter {
            // A null or false filter skips this aggregate for the row.
            if !filter.eval_qual(row, &EvalContext::default())? {
                continue;
            }
        }

        if pt.has_ordered_input() {
            // Not aggregated now; buffered for the group-boundary sort.
            route_ordered_input(pt, trans_input, num_sorted_sets)?;
            continue;
        }

        load_trans_args(pt, trans_input)?;

        if let Some(pergroups) = sorted_pergroups.as_deref_mut() {
            for setno in 0..num_sorted_sets {
                let state = &mut pergroups[setno * num_trans + transno];
                advance_one(pt, contexts, set_arenas[setno], tmp_arena, state)?;
            }
        }

        for target in hash_targets {
            let ph = &mut perhash[target.perhash_idx];
            let arena = ph.hybrid_arena.unwrap_or(hash_arena);
            let state = &mut ph.table.entry_states_mut(target.entry_idx)[transno];
            advance_one(pt, contexts, arena, tmp_arena, state)?;
        }
    }

    Ok(())
}

/// Fill the per-transition argument cache from the combined projection,
/// deserializing incoming partial states when the plan calls for it.
pub fn load_trans_args(pt: &mut PerTrans, trans_input: &[Datum]) -> Result<()> {
    pt.frame_args.clear();
    if pt.combine_mode {
        let mut incoming = trans_input[pt.input_offset].clone();
        if pt.deserialize_input && !incoming.is_null() {
            // A null state passes through untouched (the deserialize function
            // is strict).
            incoming = call_deserialize(pt, incoming)?;
        }
        pt.frame_args.push(incoming);
    } else {
        for i in 0..pt.num_trans_args {
            pt.frame_args.push(trans_input[pt.input_offset + i].clone());
        }
    }
    Ok(())
}

pub fn call_deserialize(pt: &PerTrans, blob: Datum) -> Result<Datum> {
    let deserialize = pt
        .deserialize_fn
        .required("deserialize function for transition state")?;
    let mut frame = AggCallFrame::plain(SmallVec::from_iter([blob]));
    deserialize(&mut frame)?;
    Ok(frame.result)
}

/// Advance one (group, transition) pair using the cached arguments.
pub fn advance_one(
    pt: &mut PerTrans,
    contexts: &mut MemoryContexts,
    set_arena: ArenaId,
    tmp_arena: ArenaId,
    state: &mut GroupState,
) -> Result<()> {
    if pt.combine_mode {
        advance_combine(pt, contexts, set_arena, tmp_arena, state)
    } else {
        advance_transition(pt, contexts, set_arena, tmp_arena, state)
    }
}

fn advance_transition(
    pt: &mut PerTrans,
    contexts: &mut MemoryContexts,
    set_arena: ArenaId,
    tmp_arena: ArenaId,
    state: &mut GroupState,
) -> Result<()> {
    if pt.advance_fn_strict {
        if pt.frame_args[..pt.num_trans_args]
            .iter()
            .any(Datum::is_null)
        {
            // Strict functions never see null arguments; keep prior state.
            return Ok(());
        }
        if state.no_value {
            // The first non-null input becomes the transition value without
            // invoking the function. Sound because construction verified the
            // input type is binary-compatible with the transition type.
            let first = pt.frame_args[0].clone();
            state.value = TransValue::store(first, pt.trans_by_val, set_arena);
            state.is_null = false;
            state.no_value = false;
            return Ok(());
        }
        if state.is_null {
            // A strict function that returned null sticks at null.
            return Ok(());
        }
    }

    invoke_advance(pt, contexts, set_arena, tmp_arena, state)
}

fn advance_combine(
    pt: &mut PerTrans,
    contexts: &mut MemoryContexts,
    set_arena: ArenaId,
    tmp_arena: ArenaId,
    state: &mut GroupState,
) -> Result<()> {
    if pt.advance_fn_strict {
        if pt.frame_args[0].is_null() {
            return Ok(());
        }
        if state.no_value {
            // First-input initialization applies in combine mode too; the
            // initial-value shortcut above is transition-mode only.
            let incoming = pt.frame_args[0].clone();
            state.value = TransValue::store(incoming, pt.trans_by_val, set_arena);
            state.is_null = false;
            state.no_value = false;
            return Ok(());
        }
        if state.is_null {
            return Ok(());
        }
    }

    invoke_advance(pt, contexts, set_arena, tmp_arena, state)
}

fn invoke_advance(
    pt: &mut PerTrans,
    contexts: &mut MemoryContexts,
    set_arena: ArenaId,
    tmp_arena: ArenaId,
    state: &mut GroupState,
) -> Result<()> {
    let old_expanded = state.value.expanded_ref();
    let state_datum = state.value.take_datum();

    let mut args = FrameArgs::with_capacity(1 + pt.frame_args.len());
    args.push(state_datum);
    args.extend(pt.frame_args.iter().cloned());

    let mut frame = AggCallFrame::with_context(
        args,
        CallContext::Aggregate(AggContext {
            contexts: &mut *contexts,
            set_arena,
            temp_arena: tmp_arena,
            aggref: Some(pt.aggref.clone()),
        }),
    );
    (pt.advance_fn)(&mut frame)?;
    let AggCallFrame { result, .. } = frame;
    let mut result = result;
    let result_is_null = result.is_null();

    if !pt.trans_by_val {
        match &result {
            // The function handed back the value it was given; adopt in
            // place and do not free the old value (it is the same one).
            Datum::Expanded(new) if Some(*new) == old_expanded => {}
            // A read-write expanded object already owned by the current
            // grouping-set arena: adopt without copying.
            Datum::Expanded(new) if new.arena == set_arena && !new.read_only => {
                if let Some(old) = old_expanded {
                    contexts.delete_expanded(old)?;
                }
            }
            // Foreign or read-only expanded object: flatten-copy.
            Datum::Expanded(new) => {
                result = contexts.expanded(*new)?.flatten();
                if let Some(old) = old_expanded {
                    contexts.delete_expanded(old)?;
                }
            }
            _ => {
                if let Some(old) = old_expanded {
                    contexts.delete_expanded(old)?;
                }
            }
        }
    }

    state.value = TransValue::store(result, pt.trans_by_val, set_arena);
    state.is_null = result_is_null;
    if !result_is_null {
        state.no_value = false;
    }
    Ok(())
}

/// Push a DISTINCT/ORDER BY aggregate's inputs into the per-set sort.
fn route_ordered_input(
    pt: &mut PerTrans,
    trans_input: &[Datum],
    num_sorted_sets: usize,
) -> Result<()> {
    let inputs = &trans_input[pt.input_offset..pt.input_offset + pt.num_inputs];

    // A strict transition function would ignore these rows anyway; skipping
    // the push saves sort work.
    if pt.advance_fn_strict
        && inputs[..pt.num_trans_args]
            .iter()
            .any(Datum::is_null)
    {
        return Ok(());
    }

    for setno in 0..num_sorted_sets {
        if setno >= pt.sorters.len() {
            return Err(QuernError::new("Sorter array smaller than grouping sets"));
        }
        let single = pt.num_inputs == 1;
        let sort_keys = &pt.sort_keys;
        let sorter = pt.sorters[setno].get_or_insert_with(|| {
            if single {
                ExternalSorter::new_for_datums(sort_keys[0])
            } else {
                ExternalSorter::new_for_rows(sort_keys.clone())
            }
        });
        if single {
            sorter.put_datum(inputs[0].clone())?;
        } else {
            sorter.put_row(Row::new(inputs.to_vec()))?;
        }
    }
    Ok(())
}
