//! Group-boundary processing for DISTINCT/ORDER BY aggregates.
//!
//! Inputs were diverted into a per-(transition, grouping set) sort during the
//! scan; at the group boundary the sort is performed and its output streamed
//! through the transition function, deduplicating adjacent equal values when
//! the aggregate is DISTINCT. Equality here deliberately ignores collation,
//! matching the original engine; a known limitation for collated text.

use quern_error::Result;

use super::state::{GroupState, PerTrans};
use super::transition::advance_one;
use crate::arrays::row::Row;
use crate::runtime::arena::{ArenaId, MemoryContexts};

/// Run the deferred sort for one (transition, grouping set) pair and advance
/// the transition over the sorted, deduplicated stream.
pub fn process_ordered_aggregate(
    pt: &mut PerTrans,
    contexts: &mut MemoryContexts,
    set_arena: ArenaId,
    tmp_arena: ArenaId,
    setno: usize,
    state: &mut GroupState,
) -> Result<()> {
    if pt.sorters.get(setno).map(Option::is_none).unwrap_or(true) {
        // No rows reached the sort for this group.
        return Ok(());
    }
    if pt.num_inputs == 1 {
        process_ordered_single(pt, contexts, set_arena, tmp_arena, setno, state)
    } else {
        process_ordered_multi(pt, contexts, set_arena, tmp_arena, setno, state)
    }
}

/// Single-input form: the sort holds bare datums.
fn process_ordered_single(
    pt: &mut PerTrans,
    contexts: &mut MemoryContexts,
    set_arena: ArenaId,
    tmp_arena: ArenaId,
    setno: usize,
    state: &mut GroupState,
) -> Result<()> {
    let mut sorter = pt.sorters[setno].take().expect("sorter checked above");
    sorter.perform_sort()?;

    let distinct = pt.num_distinct_cols > 0;
    let mut prev = None;

    while let Some(datum) = sorter.next_datum()? {
        if distinct {
            if let Some(prev) = &prev {
                if datum.group_eq(prev) {
                    continue;
                }
            }
        }

        pt.frame_args.clear();
        pt.frame_args.push(datum.clone());
        advance_one(pt, contexts, set_arena, tmp_arena, state)?;

        // The prior held value is released once the comparison is done with
        // it; ownership simply moves to `prev`.
        prev = Some(datum);
    }

    sorter.end();
    Ok(())
}

/// Multi-input form: the sort holds rows of the transition's arguments,
/// including any sort-only trailing columns.
fn process_ordered_multi(
    pt: &mut PerTrans,
    contexts: &mut MemoryContexts,
    set_arena: ArenaId,
    tmp_arena: ArenaId,
    setno: usize,
    state: &mut GroupState,
) -> Result<()> {
    let mut sorter = pt.sorters[setno].take().expect("sorter checked above");
    sorter.perform_sort()?;

    let distinct = pt.num_distinct_cols > 0;
    let mut prev: Option<Row> = None;

    while let Some(row) = sorter.next_row()? {
        let duplicate = distinct
            && prev.as_ref().is_some_and(|prev| {
                row.values[..pt.num_trans_args]
                    .iter()
                    .zip(&prev.values[..pt.num_trans_args])
                    .all(|(a, b)| a.group_eq(b))
            });

        if !duplicate {
            pt.frame_args.clear();
            for value in &row.values[..pt.num_trans_args] {
                pt.frame_args.push(value.clone());
            }
            advance_one(pt, contexts, set_arena, tmp_arena, state)?;

            // Hold the just-accepted row as the next comparison point.
            prev = Some(row);
        }

        contexts.reset(tmp_arena)?;
    }

    sorter.end();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::datum::{DataType, Datum};
    use crate::execution::operators::aggregate::state::build_aggregates;
    use crate::execution::operators::aggregate::transition::advance_row;
    use crate::expr::{PhysicalExpr, SortKey};
    use crate::functions::aggregate::{builtin, AggregateCatalog};
    use crate::plan::{AggNode, AggPlan, AggSplit, AggStrategy, Aggref};

    fn run_ordered(aggref: Aggref, input_types: Vec<DataType>, rows: Vec<Row>) -> GroupState {
        let plan = AggPlan {
            strategy: AggStrategy::Plain,
            split: AggSplit::NONE,
            nodes: vec![AggNode::plain()],
            aggs: vec![aggref],
            having: None,
            output: vec![],
            input_types,
            hybrid: false,
            num_groups_estimate: 1,
        };
        let mut built = build_aggregates(&plan, AggregateCatalog::system(), 1).unwrap();
        let (mut contexts, root) = MemoryContexts::new();
        let mut pergroups = vec![GroupState::initial(&built.pertrans[0], root)];

        for row in rows {
            let mut trans_input = Vec::new();
            for expr in &built.combined_projection {
                trans_input.push(expr.eval(&row).unwrap());
            }
            advance_row(
                &mut built.pertrans,
                &mut contexts,
                root,
                &row,
                &trans_input,
                Some(&mut pergroups),
                &[root],
                1,
                &mut [],
                &[],
                root,
            )
            .unwrap();
        }

        let mut state = pergroups.remove(0);
        process_ordered_aggregate(
            &mut built.pertrans[0],
            &mut contexts,
            root,
            root,
            0,
            &mut state,
        )
        .unwrap();

        // The sort handle is cleared once processed.
        assert!(built.pertrans[0].sorters[0].is_none());

        // Resolve expanded states for inspection.
        if let Some(eref) = state.value.expanded_ref() {
            state.value = super::super::state::TransValue::ByVal(
                contexts.expanded(eref).unwrap().flatten(),
            );
        }
        state
    }

    #[test]
    fn count_distinct_single_input() {
        // count(distinct x order by x) over [3,1,2,1,3,2] => 3.
        let aggref =
            Aggref::new(builtin::COUNT, vec![PhysicalExpr::column(0)]).with_distinct();
        let rows = [3i64, 1, 2, 1, 3, 2]
            .into_iter()
            .map(|v| Row::from([Datum::Int64(v)]))
            .collect();
        let state = run_ordered(aggref, vec![DataType::Int64], rows);
        assert_eq!(Datum::Int64(3), state.value.datum());
    }

    #[test]
    fn distinct_treats_nulls_as_one_value() {
        // array_agg collects nulls; distinct collapses them to one.
        let aggref =
            Aggref::new(builtin::ARRAY_AGG, vec![PhysicalExpr::column(0)]).with_distinct();
        let rows = [
            Datum::Null,
            Datum::Int64(1),
            Datum::Null,
            Datum::Int64(1),
        ]
        .into_iter()
        .map(|v| Row::from([v]))
        .collect();
        let state = run_ordered(aggref, vec![DataType::Int64], rows);
        // Ascending order with nulls last.
        assert_eq!(
            Datum::List(vec![Datum::Int64(1), Datum::Null]),
            state.value.datum()
        );
    }

    #[test]
    fn multi_input_order_by_trailing_column() {
        // array_agg(x order by y desc): x is the only transition argument,
        // y exists in the sort only.
        let mut aggref = Aggref::new(
            builtin::ARRAY_AGG,
            vec![PhysicalExpr::column(0), PhysicalExpr::column(1)],
        );
        aggref.num_trans_args = 1;
        aggref = aggref.with_order_by(vec![SortKey {
            column: 1,
            descending: true,
            nulls_first: false,
        }]);

        let rows = vec![
            Row::from([Datum::Utf8("low".into()), Datum::Int64(1)]),
            Row::from([Datum::Utf8("high".into()), Datum::Int64(9)]),
            Row::from([Datum::Utf8("mid".into()), Datum::Int64(5)]),
        ];
        // array_agg's registered arg types don't constrain the datum kind.
        let state = run_ordered(aggref, vec![DataType::Utf8, DataType::Int64], rows);
        assert_eq!(
            Datum::List(vec![
                Datum::Utf8("high".into()),
                Datum::Utf8("mid".into()),
                Datum::Utf8("low".into()),
            ]),
            state.value.datum()
        );
    }
}
