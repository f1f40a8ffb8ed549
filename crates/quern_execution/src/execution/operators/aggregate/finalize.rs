//! Finalization of completed groups.
//!
//! For each completed group and grouping set: run any deferred
//! DISTINCT/ORDER BY sorts, then per aggregate either invoke the final
//! function (transition value read-only at position 0, direct arguments
//! after, remaining positions padded with nulls) or, in skip-final mode,
//! emit the transition state itself, serialized when it is internal.

use quern_error::Result;
use smallvec::SmallVec;

use super::ordered::process_ordered_aggregate;
use super::state::{GroupState, PerAgg, PerTrans, TransValue};
use crate::arrays::datum::{DataType, Datum};
use crate::arrays::row::Row;
use crate::functions::{AggCallFrame, AggContext, CallContext, FrameArgs};
use crate::plan::AggSplit;
use crate::runtime::arena::{ArenaId, MemoryContexts};

/// Produce the finalized value of every aggregate for one group of one
/// grouping set, into `agg_values` (indexed by peragg position).
#[allow(clippy::too_many_arguments)]
pub fn finalize_aggregates(
    pertrans: &mut [PerTrans],
    peraggs: &[PerAgg],
    contexts: &mut MemoryContexts,
    set_arena: ArenaId,
    tmp_arena: ArenaId,
    setno: usize,
    run_ordered: bool,
    pergroup: &mut [GroupState],
    rep_row: &Row,
    split: AggSplit,
    agg_values: &mut Vec<Datum>,
) -> Result<()> {
    if run_ordered {
        for (transno, pt) in pertrans.iter_mut().enumerate() {
            if pt.has_ordered_input() {
                process_ordered_aggregate(
                    pt,
                    contexts,
                    set_arena,
                    tmp_arena,
                    setno,
                    &mut pergroup[transno],
                )?;
            }
        }
    }

    agg_values.clear();
    for peragg in peraggs {
        let value = if split.skip_final {
            finalize_partial(&pertrans[peragg.transno], contexts, &pergroup[peragg.transno], split)?
        } else {
            finalize_one(
                peragg,
                contexts,
                set_arena,
                tmp_arena,
                &pergroup[peragg.transno],
                rep_row,
            )?
        };
        agg_values.push(value);
    }
    Ok(())
}

/// Invoke the final function (or emit the transition value when there is
/// none).
fn finalize_one(
    peragg: &PerAgg,
    contexts: &mut MemoryContexts,
    set_arena: ArenaId,
    tmp_arena: ArenaId,
    state: &GroupState,
    rep_row: &Row,
) -> Result<Datum> {
    let final_fn = match peragg.final_fn {
        Some(final_fn) => final_fn,
        None => return flatten(contexts, state_datum_readonly(state)),
    };

    let mut args = FrameArgs::with_capacity(peragg.num_final_args);
    args.push(state_datum_readonly(state));
    for expr in &peragg.aggref.direct_args {
        if args.len() >= peragg.num_final_args {
            break;
        }
        args.push(expr.eval(rep_row)?);
    }
    while args.len() < peragg.num_final_args {
        args.push(Datum::Null);
    }

    if peragg.final_fn_strict && args.iter().any(Datum::is_null) {
        return Ok(Datum::Null);
    }

    let mut frame = AggCallFrame::with_context(
        args,
        CallContext::Aggregate(AggContext {
            contexts: &mut *contexts,
            set_arena,
            temp_arena: tmp_arena,
            aggref: Some(peragg.aggref.clone()),
        }),
    );
    final_fn(&mut frame)?;
    let AggCallFrame { result, .. } = frame;

    // Any by-reference result is owned by the caller from here on; expanded
    // handles must not escape the operator.
    flatten(contexts, result)
}

/// Skip-final mode: emit the transition state, serializing internal states
/// when the plan says so.
pub fn finalize_partial(
    pt: &PerTrans,
    contexts: &mut MemoryContexts,
    state: &GroupState,
    split: AggSplit,
) -> Result<Datum> {
    if split.serialize && pt.trans_type == DataType::Internal {
        if let Some(serialize) = pt.serialize_fn {
            // Null in, null out: the serialize function is strict.
            if state.is_null {
                return Ok(Datum::Null);
            }
            let mut frame =
                AggCallFrame::plain(SmallVec::from_iter([state_datum_readonly(state)]));
            serialize(&mut frame)?;
            return Ok(frame.result);
        }
    }

    flatten(contexts, state_datum_readonly(state))
}

/// The transition value as a datum safe to hand to a final or serialize
/// function: expanded objects are wrapped read-only.
fn state_datum_readonly(state: &GroupState) -> Datum {
    if state.is_null {
        return Datum::Null;
    }
    match &state.value {
        TransValue::Expanded(eref) => Datum::Expanded(eref.read_only()),
        other => other.datum(),
    }
}

fn flatten(contexts: &MemoryContexts, datum: Datum) -> Result<Datum> {
    match datum {
        Datum::Expanded(eref) => Ok(contexts.expanded(eref)?.flatten()),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::operators::aggregate::state::build_aggregates;
    use crate::execution::operators::aggregate::transition::advance_one;
    use crate::expr::PhysicalExpr;
    use crate::functions::aggregate::{builtin, AggregateCatalog};
    use crate::plan::{AggNode, AggPlan, AggStrategy, Aggref};

    fn build(aggs: Vec<Aggref>, split: AggSplit) -> (Vec<PerTrans>, Vec<PerAgg>) {
        let plan = AggPlan {
            strategy: AggStrategy::Plain,
            split,
            nodes: vec![AggNode::plain()],
            aggs,
            having: None,
            output: vec![],
            input_types: vec![DataType::Float64],
            hybrid: false,
            num_groups_estimate: 1,
        };
        let built = build_aggregates(&plan, AggregateCatalog::system(), 1).unwrap();
        (built.pertrans, built.peraggs)
    }

    #[test]
    fn strict_final_on_empty_group_yields_null() {
        let (mut pertrans, peraggs) = build(
            vec![Aggref::new(builtin::AVG_FLOAT64, vec![PhysicalExpr::column(0)])],
            AggSplit::NONE,
        );
        let (mut contexts, root) = MemoryContexts::new();
        let mut pergroup = vec![GroupState::initial(&pertrans[0], root)];

        let mut agg_values = Vec::new();
        finalize_aggregates(
            &mut pertrans,
            &peraggs,
            &mut contexts,
            root,
            root,
            0,
            true,
            &mut pergroup,
            &Row::empty(),
            AggSplit::NONE,
            &mut agg_values,
        )
        .unwrap();
        assert_eq!(vec![Datum::Null], agg_values);
    }

    #[test]
    fn skip_final_serializes_internal_state() {
        let (mut pertrans, peraggs) = build(
            vec![Aggref::new(builtin::AVG_FLOAT64, vec![PhysicalExpr::column(0)])],
            AggSplit::INITIAL_SERIAL,
        );
        let (mut contexts, root) = MemoryContexts::new();
        let mut pergroup = vec![GroupState::initial(&pertrans[0], root)];

        // Feed two values.
        for v in [1.0f64, 3.0] {
            pertrans[0].frame_args.clear();
            pertrans[0].frame_args.push(Datum::Float64(v));
            advance_one(&mut pertrans[0], &mut contexts, root, root, &mut pergroup[0]).unwrap();
        }

        let mut agg_values = Vec::new();
        finalize_aggregates(
            &mut pertrans,
            &peraggs,
            &mut contexts,
            root,
            root,
            0,
            true,
            &mut pergroup,
            &Row::empty(),
            AggSplit::INITIAL_SERIAL,
            &mut agg_values,
        )
        .unwrap();

        match &agg_values[0] {
            Datum::Binary(bytes) => assert_eq!(24, bytes.len()),
            other => panic!("expected serialized state: {other:?}"),
        }
    }

    #[test]
    fn ordered_set_final_receives_direct_args() {
        let mut aggref =
            Aggref::new(builtin::PERCENTILE_DISC, vec![PhysicalExpr::column(0)]);
        aggref.direct_args = vec![PhysicalExpr::literal(0.5f64)];
        aggref = aggref.with_order_by(vec![crate::expr::SortKey::asc(0)]);

        let (mut pertrans, peraggs) = build(vec![aggref], AggSplit::NONE);
        let (mut contexts, root) = MemoryContexts::new();
        let mut pergroup = vec![GroupState::initial(&pertrans[0], root)];

        // Push unordered values through the sort path.
        for v in [4.0f64, 1.0, 3.0, 2.0] {
            pertrans[0].sorters[0]
                .get_or_insert_with(|| {
                    crate::sort::ExternalSorter::new_for_datums(crate::expr::SortKey::asc(0))
                })
                .put_datum(Datum::Float64(v))
                .unwrap();
        }

        let mut agg_values = Vec::new();
        finalize_aggregates(
            &mut pertrans,
            &peraggs,
            &mut contexts,
            root,
            root,
            0,
            true,
            &mut pergroup,
            &Row::empty(),
            AggSplit::NONE,
            &mut agg_values,
        )
        .unwrap();

        assert_eq!(vec![Datum::Float64(2.0)], agg_values);
    }

    #[test]
    fn missing_final_fn_emits_transition_value() {
        let (mut pertrans, peraggs) = build(
            vec![Aggref::new(builtin::SUM_INT64, vec![PhysicalExpr::column(0)])],
            AggSplit::NONE,
        );
        let (mut contexts, root) = MemoryContexts::new();
        let mut pergroup = vec![GroupState::initial(&pertrans[0], root)];

        pertrans[0].frame_args.clear();
        pertrans[0].frame_args.push(Datum::Int64(41));
        advance_one(&mut pertrans[0], &mut contexts, root, root, &mut pergroup[0]).unwrap();

        let mut agg_values = Vec::new();
        finalize_aggregates(
            &mut pertrans,
            &peraggs,
            &mut contexts,
            root,
            root,
            0,
            true,
            &mut pergroup,
            &Row::empty(),
            AggSplit::NONE,
            &mut agg_values,
        )
        .unwrap();
        assert_eq!(vec![Datum::Int64(41)], agg_values);
    }
}
