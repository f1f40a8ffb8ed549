//! Physical expressions.
//!
//! The aggregate operator only depends on a narrow expression surface:
//! column references and literals for aggregate arguments, comparisons and
//! boolean logic for FILTER and HAVING quals, and the GROUPING function over
//! the active grouping set. Expressions evaluate against a row plus the
//! per-group aggregate results.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use quern_error::{QuernError, Result};

use crate::arrays::datum::Datum;
use crate::arrays::row::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl ComparisonOperator {
    fn matches(&self, ord: Ordering) -> bool {
        match self {
            ComparisonOperator::Eq => ord == Ordering::Equal,
            ComparisonOperator::NotEq => ord != Ordering::Equal,
            ComparisonOperator::Lt => ord == Ordering::Less,
            ComparisonOperator::LtEq => ord != Ordering::Greater,
            ComparisonOperator::Gt => ord == Ordering::Greater,
            ComparisonOperator::GtEq => ord != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhysicalExpr {
    /// Reference to an input column.
    Column(usize),
    Literal(Datum),
    /// Reference to a finalized aggregate result, by aggregate index. Valid
    /// in output projections and HAVING quals only; an aggregate reference
    /// inside another aggregate's arguments is a nesting error surfaced at
    /// operator construction.
    AggregateRef(usize),
    /// GROUPING(cols...): an integer with one bit per listed column, set when
    /// that column is not part of the active grouping set.
    GroupingFunc(Vec<usize>),
    Compare {
        op: ComparisonOperator,
        left: Box<PhysicalExpr>,
        right: Box<PhysicalExpr>,
    },
    And(Vec<PhysicalExpr>),
    Or(Vec<PhysicalExpr>),
    Not(Box<PhysicalExpr>),
    IsNull(Box<PhysicalExpr>),
}

/// Evaluation environment for expressions that may reference aggregate
/// results or the active grouping set.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvalContext<'a> {
    pub agg_values: &'a [Datum],
    pub grouped_cols: Option<&'a BTreeSet<usize>>,
}

impl PhysicalExpr {
    pub fn column(idx: usize) -> Self {
        PhysicalExpr::Column(idx)
    }

    pub fn literal(datum: impl Into<Datum>) -> Self {
        PhysicalExpr::Literal(datum.into())
    }

    /// Evaluate against a bare row; aggregate references error.
    pub fn eval(&self, row: &Row) -> Result<Datum> {
        self.eval_with(row, &EvalContext::default())
    }

    pub fn eval_with(&self, row: &Row, ctx: &EvalContext) -> Result<Datum> {
        Ok(match self {
            PhysicalExpr::Column(idx) => row.column(*idx)?.clone(),
            PhysicalExpr::Literal(datum) => datum.clone(),
            PhysicalExpr::AggregateRef(idx) => ctx
                .agg_values
                .get(*idx)
                .cloned()
                .ok_or_else(|| QuernError::new("Aggregate value referenced outside finalization"))?,
            PhysicalExpr::GroupingFunc(cols) => {
                let grouped = ctx.grouped_cols.ok_or_else(|| {
                    QuernError::new("GROUPING() referenced outside grouping-set evaluation")
                })?;
                let mut value: i64 = 0;
                for &col in cols {
                    value <<= 1;
                    if !grouped.contains(&col) {
                        value |= 1;
                    }
                }
                Datum::Int64(value)
            }
            PhysicalExpr::Compare { op, left, right } => {
                let left = left.eval_with(row, ctx)?;
                let right = right.eval_with(row, ctx)?;
                if left.is_null() || right.is_null() {
                    Datum::Null
                } else {
                    Datum::Bool(op.matches(left.total_cmp(&right)))
                }
            }
            PhysicalExpr::And(exprs) => {
                let mut saw_null = false;
                for expr in exprs {
                    match expr.eval_with(row, ctx)?.try_as_bool()? {
                        Some(false) => return Ok(Datum::Bool(false)),
                        Some(true) => {}
                        None => saw_null = true,
                    }
                }
                if saw_null {
                    Datum::Null
                } else {
                    Datum::Bool(true)
                }
            }
            PhysicalExpr::Or(exprs) => {
                let mut saw_null = false;
                for expr in exprs {
                    match expr.eval_with(row, ctx)?.try_as_bool()? {
                        Some(true) => return Ok(Datum::Bool(true)),
                        Some(false) => {}
                        None => saw_null = true,
                    }
                }
                if saw_null {
                    Datum::Null
                } else {
                    Datum::Bool(false)
                }
            }
            PhysicalExpr::Not(expr) => match expr.eval_with(row, ctx)?.try_as_bool()? {
                Some(v) => Datum::Bool(!v),
                None => Datum::Null,
            },
            PhysicalExpr::IsNull(expr) => Datum::Bool(expr.eval_with(row, ctx)?.is_null()),
        })
    }

    /// Evaluate as a qual: null counts as not passing.
    pub fn eval_qual(&self, row: &Row, ctx: &EvalContext) -> Result<bool> {
        Ok(self.eval_with(row, ctx)?.try_as_bool()?.unwrap_or(false))
    }

    /// Collect every input column this expression reads.
    pub fn collect_columns(&self, out: &mut BTreeSet<usize>) {
        match self {
            PhysicalExpr::Column(idx) => {
                out.insert(*idx);
            }
            PhysicalExpr::Literal(_)
            | PhysicalExpr::AggregateRef(_)
            | PhysicalExpr::GroupingFunc(_) => {}
            PhysicalExpr::Compare { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            PhysicalExpr::And(exprs) | PhysicalExpr::Or(exprs) => {
                for expr in exprs {
                    expr.collect_columns(out);
                }
            }
            PhysicalExpr::Not(expr) | PhysicalExpr::IsNull(expr) => expr.collect_columns(out),
        }
    }

    pub fn contains_aggregate_ref(&self) -> bool {
        match self {
            PhysicalExpr::AggregateRef(_) => true,
            PhysicalExpr::Column(_)
            | PhysicalExpr::Literal(_)
            | PhysicalExpr::GroupingFunc(_) => false,
            PhysicalExpr::Compare { left, right, .. } => {
                left.contains_aggregate_ref() || right.contains_aggregate_ref()
            }
            PhysicalExpr::And(exprs) | PhysicalExpr::Or(exprs) => {
                exprs.iter().any(PhysicalExpr::contains_aggregate_ref)
            }
            PhysicalExpr::Not(expr) | PhysicalExpr::IsNull(expr) => expr.contains_aggregate_ref(),
        }
    }
}

/// Evaluate a projection into a reusable output buffer.
pub fn eval_projection(
    exprs: &[PhysicalExpr],
    row: &Row,
    ctx: &EvalContext,
    out: &mut Vec<Datum>,
) -> Result<()> {
    out.clear();
    for expr in exprs {
        out.push(expr.eval_with(row, ctx)?);
    }
    Ok(())
}

/// One key of a sort specification. The ordering operator and nulls placement
/// come from the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub column: usize,
    pub descending: bool,
    pub nulls_first: bool,
}

impl SortKey {
    pub fn asc(column: usize) -> Self {
        SortKey {
            column,
            descending: false,
            nulls_first: false,
        }
    }

    pub fn compare(&self, a: &Datum, b: &Datum) -> Ordering {
        match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => {
                if self.nulls_first {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (false, true) => {
                if self.nulls_first {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (false, false) => {
                let ord = a.total_cmp(b);
                if self.descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
        }
    }
}

/// Compare two rows under a sort specification where `keys[i].column` indexes
/// into the rows.
pub fn compare_rows(keys: &[SortKey], a: &Row, b: &Row) -> Ordering {
    for key in keys {
        let ord = key.compare(
            a.values.get(key.column).unwrap_or(&Datum::Null),
            b.values.get(key.column).unwrap_or(&Datum::Null),
        );
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qual_treats_null_as_false() {
        let expr = PhysicalExpr::Compare {
            op: ComparisonOperator::Gt,
            left: Box::new(PhysicalExpr::column(0)),
            right: Box::new(PhysicalExpr::literal(10i64)),
        };
        let row = Row::from([Datum::Null]);
        assert!(!expr.eval_qual(&row, &EvalContext::default()).unwrap());
    }

    #[test]
    fn grouping_func_bitmap() {
        let grouped: BTreeSet<usize> = [0].into();
        let ctx = EvalContext {
            agg_values: &[],
            grouped_cols: Some(&grouped),
        };
        // GROUPING(col0, col1) with only col0 grouped => 0b01.
        let expr = PhysicalExpr::GroupingFunc(vec![0, 1]);
        let value = expr.eval_with(&Row::empty(), &ctx).unwrap();
        assert_eq!(Datum::Int64(1), value);
    }

    #[test]
    fn sort_key_nulls_first() {
        let key = SortKey {
            column: 0,
            descending: false,
            nulls_first: true,
        };
        assert_eq!(
            Ordering::Less,
            key.compare(&Datum::Null, &Datum::Int64(1))
        );
    }

    #[test]
    fn nested_aggregate_detection() {
        let expr = PhysicalExpr::And(vec![PhysicalExpr::Compare {
            op: ComparisonOperator::Eq,
            left: Box::new(PhysicalExpr::AggregateRef(0)),
            right: Box::new(PhysicalExpr::literal(1i64)),
        }]);
        assert!(expr.contains_aggregate_ref());
    }
}
