//! Descriptors and working storage for aggregates.
//!
//! Construction walks the plan's aggregate call sites and assigns each a
//! (possibly shared) per-aggregate and per-transition descriptor. Two calls
//! share a per-aggregate entry only when every identifying field matches and
//! nothing volatile is involved; calls that share inputs but differ in final
//! function still share transition state.

use std::sync::Arc;

use quern_error::{QuernError, Result};

use crate::arrays::datum::{DataType, Datum, ExpandedRef};
use crate::expr::{PhysicalExpr, SortKey};
use crate::functions::aggregate::{AggKind, AggregateCatalog, AggregateDesc};
use crate::functions::{AggregateFn, FrameArgs};
use crate::plan::{AggPlan, Aggref};
use crate::runtime::arena::ArenaId;
use crate::sort::ExternalSorter;

/// A transition value with its ownership recorded.
///
/// Raw pointer aliasing is never used to track ownership; by-reference values
/// carry the arena they belong to, and expanded objects are arena handles.
#[derive(Debug, Clone)]
pub enum TransValue {
    /// Fixed-length value stored inline (also the null placeholder).
    ByVal(Datum),
    /// Variable-length value owned by a grouping-set arena.
    Owned { arena: ArenaId, value: Datum },
    /// Read-write expanded object registered with a grouping-set arena.
    Expanded(ExpandedRef),
}

impl TransValue {
    pub fn null() -> Self {
        TransValue::ByVal(Datum::Null)
    }

    /// Wrap a function result for storage in the given arena.
    pub fn store(datum: Datum, by_val: bool, arena: ArenaId) -> Self {
        match datum {
            Datum::Expanded(eref) => TransValue::Expanded(eref),
            datum if by_val => TransValue::ByVal(datum),
            datum => TransValue::Owned { arena, value: datum },
        }
    }

    /// Move the value out as a datum for a function call frame.
    pub fn take_datum(&mut self) -> Datum {
        match std::mem::replace(self, TransValue::ByVal(Datum::Null)) {
            TransValue::ByVal(datum) => datum,
            TransValue::Owned { value, .. } => value,
            TransValue::Expanded(eref) => Datum::Expanded(eref),
        }
    }

    /// Clone the value as a datum without disturbing ownership.
    pub fn datum(&self) -> Datum {
        match self {
            TransValue::ByVal(datum) => datum.clone(),
            TransValue::Owned { value, .. } => value.clone(),
            TransValue::Expanded(eref) => Datum::Expanded(*eref),
        }
    }

    pub fn expanded_ref(&self) -> Option<ExpandedRef> {
        match self {
            TransValue::Expanded(eref) => Some(*eref),
            _ => None,
        }
    }
}

/// Working state for one (group, transition) pair.
#[derive(Debug, Clone)]
pub struct GroupState {
    pub value: TransValue,
    pub is_null: bool,
    /// True while the transition value has not been initialized from input.
    /// Clears together with `is_null` on the first non-null input; once a
    /// strict transition function returns null, `is_null` sticks without
    /// reviving `no_value`.
    pub no_value: bool,
}

impl GroupState {
    /// State at group start, before any input.
    pub fn initial(pertrans: &PerTrans, arena: ArenaId) -> Self {
        match &pertrans.initial {
            Some(init) => GroupState {
                value: TransValue::store(init.clone(), pertrans.trans_by_val, arena),
                is_null: false,
                no_value: false,
            },
            None => GroupState {
                value: TransValue::null(),
                is_null: true,
                no_value: true,
            },
        }
    }
}

/// Per-transition-state descriptor. One per unique transition identity;
/// multiple per-aggregate entries may point at one of these.
#[derive(Debug)]
pub struct PerTrans {
    pub aggref: Arc<Aggref>,
    pub desc: AggregateDesc,

    /// Function advancing the state: the transition function, or the combine
    /// function when the plan runs in combine mode.
    pub advance_fn: AggregateFn,
    pub advance_fn_strict: bool,
    pub combine_mode: bool,
    /// Deserialize incoming states before combining (combine-deserial mode).
    pub deserialize_input: bool,
    pub deserialize_fn: Option<AggregateFn>,
    pub serialize_fn: Option<AggregateFn>,

    pub trans_type: DataType,
    pub trans_by_val: bool,
    /// None represents a null initial value.
    pub initial: Option<Datum>,

    /// Offset of this transition's arguments in the combined projection.
    pub input_offset: usize,
    /// Number of evaluated arguments (including sort-only trailing columns).
    pub num_inputs: usize,
    /// Leading arguments actually passed to the transition function.
    pub num_trans_args: usize,

    pub sort_keys: Vec<SortKey>,
    pub num_distinct_cols: usize,
    /// One sort handle per sorted grouping set; present only while a group
    /// with DISTINCT/ORDER BY input is being accumulated.
    pub sorters: Vec<Option<ExternalSorter>>,

    /// Reusable argument buffer for the advance-function call frame.
    pub frame_args: FrameArgs,
}

impl PerTrans {
    pub fn has_ordered_input(&self) -> bool {
        !self.sort_keys.is_empty()
    }
}

/// Per-aggregate-call descriptor.
#[derive(Debug)]
pub struct PerAgg {
    pub aggref: Arc<Aggref>,
    /// Which per-transition entry supplies this aggregate's state.
    pub transno: usize,

    pub final_fn: Option<AggregateFn>,
    pub final_fn_strict: bool,
    /// Arguments passed to the finalfn: the transition value plus direct
    /// arguments when the function takes them.
    pub num_final_args: usize,

    pub result_type: DataType,
}

/// Output of aggregate-state construction.
#[derive(Debug)]
pub struct BuiltAggregates {
    pub pertrans: Vec<PerTrans>,
    pub peraggs: Vec<PerAgg>,
    /// Maps plan aggregate index to its (possibly shared) peragg.
    pub agg_map: Vec<usize>,
    /// Every transition's argument expressions concatenated in transition
    /// order; evaluated exactly once per input row.
    pub combined_projection: Vec<PhysicalExpr>,
}

impl BuiltAggregates {
    pub fn num_trans(&self) -> usize {
        self.pertrans.len()
    }
}

/// Walk the plan's aggregate calls, deduplicating shared state.
pub fn build_aggregates(
    plan: &AggPlan,
    catalog: &AggregateCatalog,
    num_sorted_sets: usize,
) -> Result<BuiltAggregates> {
    let has_hashing = plan
        .nodes
        .iter()
        .any(|n| n.strategy == crate::plan::AggStrategy::Hashed);

    let mut built = BuiltAggregates {
        pertrans: Vec::new(),
        peraggs: Vec::new(),
        agg_map: Vec::with_capacity(plan.aggs.len()),
        combined_projection: Vec::new(),
    };

    for aggref in &plan.aggs {
        let desc = catalog.lookup(aggref.func)?.clone();
        catalog.check_permission(aggref.func)?;
        validate_aggref(aggref, &desc, plan, has_hashing)?;

        // A fully matching, non-volatile call shares everything.
        if let Some(existing) = find_compatible_peragg(aggref, &built.peraggs) {
            built.agg_map.push(existing);
            continue;
        }

        let aggref = Arc::new(aggref.clone());

        // Calls with identical inputs may still share transition state even
        // when their final functions differ.
        let same_input: Vec<usize> = built
            .peraggs
            .iter()
            .filter(|peragg| shares_inputs(&peragg.aggref, &aggref))
            .map(|peragg| peragg.transno)
            .collect();

        let transno =
            match find_compatible_pertrans(&desc, plan, &same_input, &built.pertrans) {
                Some(transno) => transno,
                None => {
                    let pertrans =
                        build_pertrans(aggref.clone(), desc.clone(), plan, &mut built, num_sorted_sets)?;
                    built.pertrans.push(pertrans);
                    built.pertrans.len() - 1
                }
            };

        let num_final_args = 1 + if desc.final_fn_extra_args {
            aggref.direct_args.len()
        } else {
            0
        };

        built.peraggs.push(PerAgg {
            aggref,
            transno,
            final_fn: desc.final_fn,
            final_fn_strict: desc.final_fn_strict,
            num_final_args,
            result_type: desc.result_type,
        });
        built.agg_map.push(built.peraggs.len() - 1);
    }

    Ok(built)
}

fn validate_aggref(
    aggref: &Aggref,
    desc: &AggregateDesc,
    plan: &AggPlan,
    has_hashing: bool,
) -> Result<()> {
    let nested = aggref.args.iter().any(PhysicalExpr::contains_aggregate_ref)
        || aggref
            .direct_args
            .iter()
            .any(PhysicalExpr::contains_aggregate_ref)
        || aggref
            .filter
            .as_ref()
            .is_some_and(PhysicalExpr::contains_aggregate_ref);
    if nested {
        return Err(QuernError::new("Aggregate function calls cannot be nested"));
    }

    if desc.kind == AggKind::OrderedSet && aggref.sort_keys.is_empty() {
        return Err(QuernError::new(format!(
            "Ordered-set aggregate {} requires ordered input",
            desc.name
        )));
    }

    if aggref.num_trans_args > aggref.args.len() {
        return Err(QuernError::new(
            "Aggregate has more transition arguments than arguments",
        ));
    }

    // DISTINCT/ORDER BY are only implemented for the sorted strategies.
    if !aggref.sort_keys.is_empty() && has_hashing {
        return Err(QuernError::new(
            "DISTINCT and ordered-input aggregates are not supported with hashed grouping",
        ));
    }

    if plan.split.combine {
        if desc.combine_fn.is_none() {
            return Err(QuernError::new(format!(
                "Aggregate {} has no combine function",
                desc.name
            )));
        }
        // A combine function over an opaque internal state cannot be strict:
        // the state is not the declared input type, so strictness would be
        // meaningless at best.
        if desc.trans_type == DataType::Internal && desc.combine_fn_strict {
            return Err(QuernError::new("invalid function definition"));
        }
    }

    if plan.split.serialize
        && desc.trans_type == DataType::Internal
        && desc.serialize_fn.is_none()
    {
        return Err(QuernError::new(format!(
            "Aggregate {} requires a serialize function",
            desc.name
        )));
    }
    if (plan.split.deserialize || (plan.split.combine && plan.hybrid))
        && desc.trans_type == DataType::Internal
        && desc.deserialize_fn.is_none()
    {
        return Err(QuernError::new(format!(
            "Aggregate {} requires a deserialize function",
            desc.name
        )));
    }

    // The strict-transition shortcut stores the first input datum as the
    // transition value without calling the function, which is only sound
    // when the input type is binary-compatible with the transition type.
    if !plan.split.combine && desc.trans_fn_strict && desc.init_value.is_none() {
        let input_ty = desc.arg_types.first().copied();
        let compatible = match input_ty {
            Some(ty) => {
                ty == desc.trans_type
                    || (ty == DataType::Int32 && desc.trans_type == DataType::Int64)
            }
            None => false,
        };
        if !compatible {
            return Err(QuernError::new(format!(
                "Aggregate {} needs its input type binary-compatible with its transition type",
                desc.name
            )));
        }
    }

    Ok(())
}

/// Full-identity match for sharing a per-aggregate entry.
fn find_compatible_peragg(aggref: &Aggref, peraggs: &[PerAgg]) -> Option<usize> {
    if aggref.volatile {
        return None;
    }
    peraggs
        .iter()
        .position(|peragg| peragg.aggref.as_ref() == aggref)
}

/// Input-identity match: everything except the function itself.
fn shares_inputs(a: &Aggref, b: &Aggref) -> bool {
    !a.volatile
        && !b.volatile
        && a.args == b.args
        && a.num_trans_args == b.num_trans_args
        && a.direct_args == b.direct_args
        && a.sort_keys == b.sort_keys
        && a.distinct == b.distinct
        && a.filter == b.filter
        && a.collation == b.collation
}

fn find_compatible_pertrans(
    desc: &AggregateDesc,
    plan: &AggPlan,
    candidates: &[usize],
    pertrans: &[PerTrans],
) -> Option<usize> {
    candidates.iter().copied().find(|&transno| {
        let existing = &pertrans[transno];
        let advance: AggregateFn = if plan.split.combine {
            match desc.combine_fn {
                Some(f) => f,
                None => return false,
            }
        } else {
            desc.trans_fn
        };
        fn_eq(existing.advance_fn, advance)
            && existing.trans_type == desc.trans_type
            && opt_fn_eq(existing.serialize_fn, desc.serialize_fn)
            && opt_fn_eq(existing.deserialize_fn, desc.deserialize_fn)
            && init_value_eq(&existing.initial, &desc.init_value)
    })
}

fn fn_eq(a: AggregateFn, b: AggregateFn) -> bool {
    a as usize == b as usize
}

fn opt_fn_eq(a: Option<AggregateFn>, b: Option<AggregateFn>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => fn_eq(a, b),
        _ => false,
    }
}

/// Null initial values compare equal to each other.
fn init_value_eq(a: &Option<Datum>, b: &Option<Datum>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn build_pertrans(
    aggref: Arc<Aggref>,
    desc: AggregateDesc,
    plan: &AggPlan,
    built: &mut BuiltAggregates,
    num_sorted_sets: usize,
) -> Result<PerTrans> {
    let combine_mode = plan.split.combine;

    let (advance_fn, advance_fn_strict) = if combine_mode {
        let combine = desc
            .combine_fn
            .ok_or_else(|| QuernError::new(format!("Aggregate {} has no combine function", desc.name)))?;
        (combine, desc.combine_fn_strict)
    } else {
        (desc.trans_fn, desc.trans_fn_strict)
    };

    let input_offset = built.combined_projection.len();
    built.combined_projection.extend(aggref.args.iter().cloned());

    let sort_keys = if combine_mode {
        Vec::new()
    } else {
        aggref.sort_keys.clone()
    };
    let num_distinct_cols = aggref.num_distinct_cols();
    let sorters = if sort_keys.is_empty() {
        Vec::new()
    } else {
        (0..num_sorted_sets).map(|_| None).collect()
    };

    Ok(PerTrans {
        advance_fn,
        advance_fn_strict,
        combine_mode,
        deserialize_input: plan.split.deserialize && desc.deserialize_fn.is_some(),
        deserialize_fn: desc.deserialize_fn,
        serialize_fn: desc.serialize_fn,
        trans_type: desc.trans_type,
        trans_by_val: desc.trans_type.is_by_val(),
        initial: desc.init_value.clone(),
        input_offset,
        num_inputs: aggref.args.len(),
        num_trans_args: aggref.num_trans_args,
        sort_keys,
        num_distinct_cols,
        sorters,
        frame_args: FrameArgs::new(),
        aggref,
        desc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::aggregate::builtin;
    use crate::plan::{AggNode, AggSplit, AggStrategy};

    fn plain_plan(aggs: Vec<Aggref>) -> AggPlan {
        AggPlan {
            strategy: AggStrategy::Plain,
            split: AggSplit::NONE,
            nodes: vec![AggNode::plain()],
            aggs,
            having: None,
            output: vec![],
            input_types: vec![DataType::Float64],
            hybrid: false,
            num_groups_estimate: 1,
        }
    }

    #[test]
    fn identical_calls_share_peragg() {
        let agg = Aggref::new(builtin::SUM_INT64, vec![PhysicalExpr::column(0)]);
        let plan = plain_plan(vec![agg.clone(), agg]);
        let built = build_aggregates(&plan, AggregateCatalog::system(), 1).unwrap();

        assert_eq!(1, built.peraggs.len());
        assert_eq!(1, built.pertrans.len());
        assert_eq!(vec![0, 0], built.agg_map);
    }

    #[test]
    fn volatile_calls_never_share() {
        let mut agg = Aggref::new(builtin::SUM_INT64, vec![PhysicalExpr::column(0)]);
        agg.volatile = true;
        let plan = plain_plan(vec![agg.clone(), agg]);
        let built = build_aggregates(&plan, AggregateCatalog::system(), 1).unwrap();

        assert_eq!(2, built.peraggs.len());
        assert_eq!(2, built.pertrans.len());
    }

    #[test]
    fn same_inputs_different_final_share_pertrans() {
        // avg and var_samp share a transition function and state.
        let avg = Aggref::new(builtin::AVG_FLOAT64, vec![PhysicalExpr::column(0)]);
        let var = Aggref::new(builtin::VAR_SAMP_FLOAT64, vec![PhysicalExpr::column(0)]);
        let plan = plain_plan(vec![avg, var]);
        let built = build_aggregates(&plan, AggregateCatalog::system(), 1).unwrap();

        assert_eq!(2, built.peraggs.len());
        assert_eq!(1, built.pertrans.len());
        assert_eq!(built.peraggs[0].transno, built.peraggs[1].transno);
    }

    #[test]
    fn combined_projection_covers_all_transitions() {
        let sum = Aggref::new(builtin::SUM_INT64, vec![PhysicalExpr::column(2)]);
        let count = Aggref::new(builtin::COUNT, vec![PhysicalExpr::column(1)]);
        let plan = plain_plan(vec![sum, count]);
        let built = build_aggregates(&plan, AggregateCatalog::system(), 1).unwrap();

        assert_eq!(2, built.combined_projection.len());
        assert_eq!(0, built.pertrans[0].input_offset);
        assert_eq!(1, built.pertrans[1].input_offset);
    }

    #[test]
    fn nested_aggregate_is_fatal() {
        let agg = Aggref::new(builtin::SUM_INT64, vec![PhysicalExpr::AggregateRef(0)]);
        let plan = plain_plan(vec![agg]);
        assert!(build_aggregates(&plan, AggregateCatalog::system(), 1).is_err());
    }

    #[test]
    fn permission_denial_is_fatal() {
        let agg = Aggref::new(builtin::SUM_INT64, vec![PhysicalExpr::column(0)]);
        let plan = plain_plan(vec![agg]);
        let catalog = AggregateCatalog::with_denied([builtin::SUM_INT64]);
        assert!(build_aggregates(&plan, &catalog, 1).is_err());
    }

    #[test]
    fn strict_combine_over_internal_is_invalid() {
        // Forge a combine-mode plan over an internal-state aggregate whose
        // combine function claims strictness.
        let agg = Aggref::new(builtin::AVG_FLOAT64, vec![PhysicalExpr::column(0)]);
        let mut plan = plain_plan(vec![agg]);
        plan.split = AggSplit::COMBINE;

        let mut catalog_entries = builtin::builtin_aggregates();
        catalog_entries[builtin::AVG_FLOAT64.0 as usize].combine_fn_strict = true;
        // Validation reads from the catalog; patching the system registry is
        // not possible, so exercise validate_aggref directly.
        let desc = &catalog_entries[builtin::AVG_FLOAT64.0 as usize];
        let err = validate_aggref(&plan.aggs[0], desc, &plan, false).unwrap_err();
        assert!(err.to_string().contains("invalid function definition"));
    }

    #[test]
    fn ordered_set_requires_order_by() {
        let agg = Aggref::new(builtin::PERCENTILE_DISC, vec![PhysicalExpr::column(0)]);
        let plan = plain_plan(vec![agg]);
        assert!(build_aggregates(&plan, AggregateCatalog::system(), 1).is_err());
    }

    #[test]
    fn group_state_initial_follows_init_value() {
        let sum = Aggref::new(builtin::SUM_INT64, vec![PhysicalExpr::column(0)]);
        let count = Aggref::new(builtin::COUNT_STAR, vec![]);
        let plan = plain_plan(vec![sum, count]);
        let built = build_aggregates(&plan, AggregateCatalog::system(), 1).unwrap();

        let arena = ArenaId(0);
        let sum_state = GroupState::initial(&built.pertrans[0], arena);
        assert!(sum_state.is_null && sum_state.no_value);

        let count_state = GroupState::initial(&built.pertrans[1], arena);
        assert!(!count_state.is_null && !count_state.no_value);
        assert_eq!(Datum::Int64(0), count_state.value.datum());
    }
}
