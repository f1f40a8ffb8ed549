//! Built-in aggregate functions.
//!
//! Every function follows the frame convention from the parent module:
//! argument 0 is the transition state for transition/combine/serialize calls,
//! strictness is enforced by the drivers, and state datums are moved through
//! the frame rather than cloned.

use std::any::Any;

use quern_error::{OptionExt, QuernError, Result};

use super::{AggKind, AggregateDesc};
use crate::arrays::datum::{take_array, DataType, Datum, InternalState};
use crate::functions::{AggCallFrame, FunctionId};
use crate::runtime::arena::ExpandedObject;

pub const COUNT_STAR: FunctionId = FunctionId(0);
pub const COUNT: FunctionId = FunctionId(1);
pub const SUM_INT64: FunctionId = FunctionId(2);
pub const SUM_FLOAT64: FunctionId = FunctionId(3);
pub const AVG_FLOAT64: FunctionId = FunctionId(4);
pub const MIN_INT64: FunctionId = FunctionId(5);
pub const MAX_INT64: FunctionId = FunctionId(6);
pub const MIN_UTF8: FunctionId = FunctionId(7);
pub const MAX_UTF8: FunctionId = FunctionId(8);
pub const BOOL_AND: FunctionId = FunctionId(9);
pub const BOOL_OR: FunctionId = FunctionId(10);
pub const ARRAY_AGG: FunctionId = FunctionId(11);
pub const STRING_AGG: FunctionId = FunctionId(12);
pub const PERCENTILE_DISC: FunctionId = FunctionId(13);
pub const VAR_SAMP_FLOAT64: FunctionId = FunctionId(14);

/// Registry of built-in aggregates. Entry index is the function id.
pub fn builtin_aggregates() -> Vec<AggregateDesc> {
    vec![
        AggregateDesc {
            name: "count_star",
            kind: AggKind::Normal,
            trans_fn: count_transfn,
            trans_fn_strict: false,
            final_fn: None,
            final_fn_strict: false,
            final_fn_extra_args: false,
            combine_fn: Some(int64_sum_combine),
            combine_fn_strict: true,
            serialize_fn: None,
            deserialize_fn: None,
            arg_types: vec![],
            trans_type: DataType::Int64,
            result_type: DataType::Int64,
            init_value: Some(Datum::Int64(0)),
        },
        AggregateDesc {
            name: "count",
            kind: AggKind::Normal,
            trans_fn: count_transfn,
            // Null inputs are skipped by the strict rule before the function
            // runs; count only sees rows it should count.
            trans_fn_strict: true,
            final_fn: None,
            final_fn_strict: false,
            final_fn_extra_args: false,
            combine_fn: Some(int64_sum_combine),
            combine_fn_strict: true,
            serialize_fn: None,
            deserialize_fn: None,
            arg_types: vec![DataType::Int64],
            trans_type: DataType::Int64,
            result_type: DataType::Int64,
            init_value: Some(Datum::Int64(0)),
        },
        AggregateDesc {
            name: "sum_int64",
            kind: AggKind::Normal,
            trans_fn: sum_int64_transfn,
            trans_fn_strict: true,
            final_fn: None,
            final_fn_strict: false,
            final_fn_extra_args: false,
            combine_fn: Some(int64_sum_combine),
            combine_fn_strict: true,
            serialize_fn: None,
            deserialize_fn: None,
            arg_types: vec![DataType::Int64],
            trans_type: DataType::Int64,
            result_type: DataType::Int64,
            init_value: None,
        },
        AggregateDesc {
            name: "sum_float64",
            kind: AggKind::Normal,
            trans_fn: sum_float64_transfn,
            trans_fn_strict: true,
            final_fn: None,
            final_fn_strict: false,
            final_fn_extra_args: false,
            combine_fn: Some(float64_sum_combine),
            combine_fn_strict: true,
            serialize_fn: None,
            deserialize_fn: None,
            arg_types: vec![DataType::Float64],
            trans_type: DataType::Float64,
            result_type: DataType::Float64,
            init_value: None,
        },
        AggregateDesc {
            name: "avg_float64",
            kind: AggKind::Normal,
            trans_fn: avg_transfn,
            // Creates its own state on the first non-null input; cannot be
            // strict since the input type is not the transition type.
            trans_fn_strict: false,
            final_fn: Some(avg_finalfn),
            final_fn_strict: true,
            final_fn_extra_args: false,
            combine_fn: Some(avg_combine),
            combine_fn_strict: false,
            serialize_fn: Some(avg_serialize),
            deserialize_fn: Some(avg_deserialize),
            arg_types: vec![DataType::Float64],
            trans_type: DataType::Internal,
            result_type: DataType::Float64,
            init_value: None,
        },
        minmax_desc("min_int64", DataType::Int64, datum_min_transfn),
        minmax_desc("max_int64", DataType::Int64, datum_max_transfn),
        minmax_desc("min_utf8", DataType::Utf8, datum_min_transfn),
        minmax_desc("max_utf8", DataType::Utf8, datum_max_transfn),
        AggregateDesc {
            name: "bool_and",
            kind: AggKind::Normal,
            trans_fn: bool_and_transfn,
            trans_fn_strict: true,
            final_fn: None,
            final_fn_strict: false,
            final_fn_extra_args: false,
            combine_fn: Some(bool_and_transfn),
            combine_fn_strict: true,
            serialize_fn: None,
            deserialize_fn: None,
            arg_types: vec![DataType::Bool],
            trans_type: DataType::Bool,
            result_type: DataType::Bool,
            init_value: None,
        },
        AggregateDesc {
            name: "bool_or",
            kind: AggKind::Normal,
            trans_fn: bool_or_transfn,
            trans_fn_strict: true,
            final_fn: None,
            final_fn_strict: false,
            final_fn_extra_args: false,
            combine_fn: Some(bool_or_transfn),
            combine_fn_strict: true,
            serialize_fn: None,
            deserialize_fn: None,
            arg_types: vec![DataType::Bool],
            trans_type: DataType::Bool,
            result_type: DataType::Bool,
            init_value: None,
        },
        AggregateDesc {
            name: "array_agg",
            kind: AggKind::Normal,
            trans_fn: array_agg_transfn,
            // Collects nulls too.
            trans_fn_strict: false,
            final_fn: Some(array_agg_finalfn),
            final_fn_strict: false,
            final_fn_extra_args: false,
            // No combine function: plans using array_agg cannot run in
            // hybrid or partial modes.
            combine_fn: None,
            combine_fn_strict: false,
            serialize_fn: None,
            deserialize_fn: None,
            arg_types: vec![DataType::Int64],
            trans_type: DataType::List,
            result_type: DataType::List,
            init_value: None,
        },
        AggregateDesc {
            name: "string_agg",
            kind: AggKind::Normal,
            trans_fn: string_agg_transfn,
            trans_fn_strict: false,
            final_fn: None,
            final_fn_strict: false,
            final_fn_extra_args: false,
            combine_fn: None,
            combine_fn_strict: false,
            serialize_fn: None,
            deserialize_fn: None,
            arg_types: vec![DataType::Utf8, DataType::Utf8],
            trans_type: DataType::Utf8,
            result_type: DataType::Utf8,
            init_value: None,
        },
        AggregateDesc {
            name: "percentile_disc",
            kind: AggKind::OrderedSet,
            trans_fn: percentile_disc_transfn,
            trans_fn_strict: false,
            final_fn: Some(percentile_disc_finalfn),
            final_fn_strict: true,
            final_fn_extra_args: true,
            combine_fn: None,
            combine_fn_strict: false,
            serialize_fn: None,
            deserialize_fn: None,
            arg_types: vec![DataType::Float64],
            trans_type: DataType::List,
            result_type: DataType::Float64,
            init_value: None,
        },
        AggregateDesc {
            name: "var_samp_float64",
            kind: AggKind::Normal,
            trans_fn: avg_transfn,
            trans_fn_strict: false,
            final_fn: Some(var_samp_finalfn),
            final_fn_strict: true,
            final_fn_extra_args: false,
            combine_fn: Some(avg_combine),
            combine_fn_strict: false,
            serialize_fn: Some(avg_serialize),
            deserialize_fn: Some(avg_deserialize),
            arg_types: vec![DataType::Float64],
            trans_type: DataType::Internal,
            result_type: DataType::Float64,
            init_value: None,
        },
    ]
}

fn minmax_desc(
    name: &'static str,
    ty: DataType,
    trans_fn: fn(&mut AggCallFrame) -> Result<()>,
) -> AggregateDesc {
    AggregateDesc {
        name,
        kind: AggKind::Normal,
        trans_fn,
        trans_fn_strict: true,
        final_fn: None,
        final_fn_strict: false,
        final_fn_extra_args: false,
        combine_fn: Some(trans_fn),
        combine_fn_strict: true,
        serialize_fn: None,
        deserialize_fn: None,
        arg_types: vec![ty],
        trans_type: ty,
        result_type: ty,
        init_value: None,
    }
}

// --- count / sum ------------------------------------------------------------

fn count_transfn(frame: &mut AggCallFrame) -> Result<()> {
    let count = frame.arg(0)?.try_as_i64()?;
    frame.set_result(Datum::Int64(count.wrapping_add(1)));
    Ok(())
}

fn sum_int64_transfn(frame: &mut AggCallFrame) -> Result<()> {
    let state = frame.arg(0)?.try_as_i64()?;
    let input = frame.arg(1)?.try_as_i64()?;
    frame.set_result(Datum::Int64(state.wrapping_add(input)));
    Ok(())
}

fn sum_float64_transfn(frame: &mut AggCallFrame) -> Result<()> {
    let state = frame.arg(0)?.try_as_f64()?;
    let input = frame.arg(1)?.try_as_f64()?;
    frame.set_result(Datum::Float64(state + input));
    Ok(())
}

fn int64_sum_combine(frame: &mut AggCallFrame) -> Result<()> {
    let state = frame.arg(0)?.try_as_i64()?;
    let incoming = frame.arg(1)?.try_as_i64()?;
    frame.set_result(Datum::Int64(state.wrapping_add(incoming)));
    Ok(())
}

fn float64_sum_combine(frame: &mut AggCallFrame) -> Result<()> {
    let state = frame.arg(0)?.try_as_f64()?;
    let incoming = frame.arg(1)?.try_as_f64()?;
    frame.set_result(Datum::Float64(state + incoming));
    Ok(())
}

// --- min / max / bool -------------------------------------------------------

fn datum_min_transfn(frame: &mut AggCallFrame) -> Result<()> {
    let state = frame.take_arg(0)?;
    let input = frame.take_arg(1)?;
    let keep = if input.total_cmp(&state).is_lt() {
        input
    } else {
        state
    };
    frame.set_result(keep);
    Ok(())
}

fn datum_max_transfn(frame: &mut AggCallFrame) -> Result<()> {
    let state = frame.take_arg(0)?;
    let input = frame.take_arg(1)?;
    let keep = if input.total_cmp(&state).is_gt() {
        input
    } else {
        state
    };
    frame.set_result(keep);
    Ok(())
}

fn bool_and_transfn(frame: &mut AggCallFrame) -> Result<()> {
    let state = frame.arg(0)?.try_as_bool()?.required("bool state")?;
    let input = frame.arg(1)?.try_as_bool()?.required("bool input")?;
    frame.set_result(Datum::Bool(state && input));
    Ok(())
}

fn bool_or_transfn(frame: &mut AggCallFrame) -> Result<()> {
    let state = frame.arg(0)?.try_as_bool()?.required("bool state")?;
    let input = frame.arg(1)?.try_as_bool()?.required("bool input")?;
    frame.set_result(Datum::Bool(state || input));
    Ok(())
}

// --- avg (internal transition state) ----------------------------------------

/// Accumulator shared by `avg_float64` and `var_samp_float64`. Lives behind a
/// `Datum::Internal` handle; the two aggregates share one transition state
/// and differ only in their final functions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AvgState {
    pub sum: f64,
    pub sumsq: f64,
    pub count: i64,
}

impl InternalState for AvgState {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
    fn clone_state(&self) -> Box<dyn InternalState> {
        Box::new(self.clone())
    }
}

fn downcast_avg(datum: &mut Datum) -> Result<&mut AvgState> {
    match datum {
        Datum::Internal(state) => state
            .as_any_mut()
            .downcast_mut::<AvgState>()
            .ok_or_else(|| QuernError::new("Transition state is not an AvgState")),
        other => Err(QuernError::new(format!(
            "Expected internal transition state, got {other:?}"
        ))),
    }
}

fn avg_transfn(frame: &mut AggCallFrame) -> Result<()> {
    let input = frame.take_arg(1)?;
    let mut state = frame.take_arg(0)?;

    if input.is_null() {
        // Keep whatever state we had, including none at all.
        frame.set_result(state);
        return Ok(());
    }
    let value = input.try_as_f64()?;

    if state.is_null() {
        state = Datum::Internal(Box::new(AvgState::default()));
    }
    let avg = downcast_avg(&mut state)?;
    avg.sum += value;
    avg.sumsq += value * value;
    avg.count += 1;

    frame.set_result(state);
    Ok(())
}

fn avg_combine(frame: &mut AggCallFrame) -> Result<()> {
    let incoming = frame.take_arg(1)?;
    let mut state = frame.take_arg(0)?;

    if incoming.is_null() {
        frame.set_result(state);
        return Ok(());
    }
    if state.is_null() {
        frame.set_result(incoming);
        return Ok(());
    }

    let mut incoming = incoming;
    let incoming = downcast_avg(&mut incoming)?;
    let avg = downcast_avg(&mut state)?;
    avg.sum += incoming.sum;
    avg.sumsq += incoming.sumsq;
    avg.count += incoming.count;

    frame.set_result(state);
    Ok(())
}

fn avg_serialize(frame: &mut AggCallFrame) -> Result<()> {
    let mut state = frame.take_arg(0)?;
    let avg = downcast_avg(&mut state)?;

    let mut bytes = Vec::with_capacity(24);
    bytes.extend_from_slice(&avg.sum.to_le_bytes());
    bytes.extend_from_slice(&avg.sumsq.to_le_bytes());
    bytes.extend_from_slice(&avg.count.to_le_bytes());
    frame.set_result(Datum::Binary(bytes));
    Ok(())
}

fn avg_deserialize(frame: &mut AggCallFrame) -> Result<()> {
    let blob = match frame.arg(0)? {
        Datum::Binary(bytes) => bytes.as_slice(),
        other => {
            return Err(QuernError::new(format!(
                "Expected serialized transition state, got {other:?}"
            )))
        }
    };
    let mut cursor = blob;
    let sum = f64::from_le_bytes(take_array(&mut cursor)?);
    let sumsq = f64::from_le_bytes(take_array(&mut cursor)?);
    let count = i64::from_le_bytes(take_array(&mut cursor)?);
    frame.set_result(Datum::Internal(Box::new(AvgState { sum, sumsq, count })));
    Ok(())
}

fn avg_finalfn(frame: &mut AggCallFrame) -> Result<()> {
    let mut state = frame.take_arg(0)?;
    let avg = downcast_avg(&mut state)?;
    if avg.count == 0 {
        frame.set_result(Datum::Null);
    } else {
        frame.set_result(Datum::Float64(avg.sum / avg.count as f64));
    }
    Ok(())
}

fn var_samp_finalfn(frame: &mut AggCallFrame) -> Result<()> {
    let mut state = frame.take_arg(0)?;
    let avg = downcast_avg(&mut state)?;
    if avg.count < 2 {
        frame.set_result(Datum::Null);
        return Ok(());
    }
    let n = avg.count as f64;
    let variance = (avg.sumsq - avg.sum * avg.sum / n) / (n - 1.0);
    frame.set_result(Datum::Float64(variance.max(0.0)));
    Ok(())
}

// --- array_agg (expanded transition state) ----------------------------------

/// Expanded build state for array_agg: appended in place across rows of the
/// same group while owned by that group's arena.
#[derive(Debug, Default)]
pub struct ArrayBuildState {
    pub items: Vec<Datum>,
}

impl ExpandedObject for ArrayBuildState {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
    fn flatten(&self) -> Datum {
        Datum::List(self.items.clone())
    }
}

fn array_agg_transfn(frame: &mut AggCallFrame) -> Result<()> {
    let input = frame.take_arg(1)?;
    let state = frame.take_arg(0)?;

    match state {
        Datum::Null => {
            let ctx = frame.agg_context_mut()?;
            let set_arena = ctx.set_arena;
            let eref = ctx.contexts.register_expanded(
                set_arena,
                Box::new(ArrayBuildState { items: vec![input] }),
            )?;
            frame.set_result(Datum::Expanded(eref));
        }
        Datum::Expanded(eref) => {
            let ctx = frame.agg_context_mut()?;
            let obj = ctx.contexts.expanded_mut(eref)?;
            obj.as_any_mut()
                .downcast_mut::<ArrayBuildState>()
                .ok_or_else(|| QuernError::new("Transition state is not an ArrayBuildState"))?
                .items
                .push(input);
            // Returning the same handle lets the driver adopt the state in
            // place without a copy.
            frame.set_result(Datum::Expanded(eref));
        }
        other => {
            return Err(QuernError::new(format!(
                "Unexpected array_agg transition state: {other:?}"
            )))
        }
    }
    Ok(())
}

fn array_agg_finalfn(frame: &mut AggCallFrame) -> Result<()> {
    let state = frame.take_arg(0)?;
    match state {
        Datum::Null => frame.set_result(Datum::Null),
        Datum::Expanded(eref) => {
            let ctx = frame.agg_context_mut()?;
            let flattened = ctx.contexts.expanded(eref)?.flatten();
            frame.set_result(flattened);
        }
        // Flattened already, e.g. when the state crossed a copy boundary.
        Datum::List(items) => frame.set_result(Datum::List(items)),
        other => {
            return Err(QuernError::new(format!(
                "Unexpected array_agg transition state: {other:?}"
            )))
        }
    }
    Ok(())
}

// --- string_agg -------------------------------------------------------------

fn string_agg_transfn(frame: &mut AggCallFrame) -> Result<()> {
    let delim = frame.take_arg(2)?;
    let input = frame.take_arg(1)?;
    let state = frame.take_arg(0)?;

    let value = match input {
        Datum::Null => {
            frame.set_result(state);
            return Ok(());
        }
        Datum::Utf8(s) => s,
        other => return Err(QuernError::new(format!("string_agg expects text: {other:?}"))),
    };

    let result = match state {
        Datum::Null => value,
        Datum::Utf8(mut acc) => {
            if let Datum::Utf8(d) = delim {
                acc.push_str(&d);
            }
            acc.push_str(&value);
            acc
        }
        other => {
            return Err(QuernError::new(format!(
                "Unexpected string_agg transition state: {other:?}"
            )))
        }
    };
    frame.set_result(Datum::Utf8(result));
    Ok(())
}

// --- percentile_disc (ordered-set) ------------------------------------------

fn percentile_disc_transfn(frame: &mut AggCallFrame) -> Result<()> {
    let input = frame.take_arg(1)?;
    let state = frame.take_arg(0)?;

    if input.is_null() {
        frame.set_result(state);
        return Ok(());
    }

    let result = match state {
        Datum::Null => Datum::List(vec![input]),
        Datum::List(mut items) => {
            items.push(input);
            Datum::List(items)
        }
        other => {
            return Err(QuernError::new(format!(
                "Unexpected percentile_disc transition state: {other:?}"
            )))
        }
    };
    frame.set_result(result);
    Ok(())
}

fn percentile_disc_finalfn(frame: &mut AggCallFrame) -> Result<()> {
    // Inputs arrived through the ordered-input path, so the collected list is
    // already sorted.
    let fraction = frame.arg(1)?.try_as_f64()?;
    let state = frame.take_arg(0)?;

    let items = match state {
        Datum::List(items) => items,
        other => {
            return Err(QuernError::new(format!(
                "Unexpected percentile_disc transition state: {other:?}"
            )))
        }
    };
    if !(0.0..=1.0).contains(&fraction) {
        return Err(QuernError::new(format!(
            "percentile fraction out of range: {fraction}"
        )));
    }

    let n = items.len();
    let rank = ((fraction * n as f64).ceil() as usize).clamp(1, n);
    frame.set_result(items[rank - 1].clone());
    Ok(())
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;
    use crate::functions::{AggContext, CallContext};
    use crate::runtime::arena::MemoryContexts;

    #[test]
    fn ids_match_registry_order() {
        let aggs = builtin_aggregates();
        assert_eq!("count_star", aggs[COUNT_STAR.0 as usize].name);
        assert_eq!("sum_int64", aggs[SUM_INT64.0 as usize].name);
        assert_eq!("avg_float64", aggs[AVG_FLOAT64.0 as usize].name);
        assert_eq!("array_agg", aggs[ARRAY_AGG.0 as usize].name);
        assert_eq!("percentile_disc", aggs[PERCENTILE_DISC.0 as usize].name);
    }

    #[test]
    fn sum_accumulates() {
        let mut frame = AggCallFrame::plain(smallvec![Datum::Int64(5), Datum::Int64(4)]);
        sum_int64_transfn(&mut frame).unwrap();
        assert_eq!(Datum::Int64(9), frame.result);
    }

    #[test]
    fn avg_state_roundtrips_through_serialize() {
        let state = Datum::Internal(Box::new(AvgState {
            sum: 7.5,
            sumsq: 20.25,
            count: 3,
        }));
        let mut frame = AggCallFrame::plain(smallvec![state]);
        avg_serialize(&mut frame).unwrap();
        let blob = std::mem::replace(&mut frame.result, Datum::Null);

        let mut frame = AggCallFrame::plain(smallvec![blob]);
        avg_deserialize(&mut frame).unwrap();
        let mut restored = std::mem::replace(&mut frame.result, Datum::Null);
        assert_eq!(
            &AvgState {
                sum: 7.5,
                sumsq: 20.25,
                count: 3
            },
            downcast_avg(&mut restored).unwrap()
        );
    }

    #[test]
    fn avg_combine_adopts_incoming_on_empty_state() {
        let incoming = Datum::Internal(Box::new(AvgState {
            sum: 2.0,
            sumsq: 2.0,
            count: 2,
        }));
        let mut frame = AggCallFrame::plain(smallvec![Datum::Null, incoming]);
        avg_combine(&mut frame).unwrap();
        let mut result = std::mem::replace(&mut frame.result, Datum::Null);
        assert_eq!(
            &AvgState {
                sum: 2.0,
                sumsq: 2.0,
                count: 2
            },
            downcast_avg(&mut result).unwrap()
        );
    }

    #[test]
    fn var_samp_of_constant_inputs_is_zero() {
        let state = Datum::Internal(Box::new(AvgState {
            sum: 6.0,
            sumsq: 12.0,
            count: 3,
        }));
        let mut frame = AggCallFrame::plain(smallvec![state]);
        var_samp_finalfn(&mut frame).unwrap();
        assert_eq!(Datum::Float64(0.0), frame.result);
    }

    #[test]
    fn array_agg_builds_in_place() {
        let (mut contexts, root) = MemoryContexts::new();

        fn make_ctx(contexts: &mut MemoryContexts) -> CallContext<'_> {
            CallContext::Aggregate(AggContext {
                contexts,
                set_arena: crate::runtime::arena::ArenaId(0),
                temp_arena: crate::runtime::arena::ArenaId(0),
                aggref: None,
            })
        }
        let _ = root;

        let mut frame = AggCallFrame::with_context(
            smallvec![Datum::Null, Datum::Int64(1)],
            make_ctx(&mut contexts),
        );
        array_agg_transfn(&mut frame).unwrap();
        let state = std::mem::replace(&mut frame.result, Datum::Null);
        let eref = match state {
            Datum::Expanded(eref) => eref,
            other => panic!("expected expanded state: {other:?}"),
        };

        let mut frame = AggCallFrame::with_context(
            smallvec![Datum::Expanded(eref), Datum::Int64(2)],
            make_ctx(&mut contexts),
        );
        array_agg_transfn(&mut frame).unwrap();
        // Same handle back means the driver can adopt without copying.
        assert_eq!(Datum::Expanded(eref), frame.result);

        assert_eq!(
            Datum::List(vec![Datum::Int64(1), Datum::Int64(2)]),
            contexts.expanded(eref).unwrap().flatten()
        );
    }

    #[test]
    fn percentile_disc_picks_discrete_value() {
        let items = Datum::List(vec![
            Datum::Float64(1.0),
            Datum::Float64(2.0),
            Datum::Float64(3.0),
            Datum::Float64(4.0),
        ]);
        let mut frame = AggCallFrame::plain(smallvec![items, Datum::Float64(0.5)]);
        percentile_disc_finalfn(&mut frame).unwrap();
        assert_eq!(Datum::Float64(2.0), frame.result);
    }

    #[test]
    fn string_agg_skips_null_values() {
        let mut frame = AggCallFrame::plain(smallvec![
            Datum::Utf8("a".to_string()),
            Datum::Null,
            Datum::Utf8(",".to_string()),
        ]);
        string_agg_transfn(&mut frame).unwrap();
        assert_eq!(Datum::Utf8("a".to_string()), frame.result);
    }
}
