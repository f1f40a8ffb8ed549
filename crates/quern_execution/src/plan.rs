//! Aggregate plan node contract.
//!
//! The planner hands the operator a root description plus a chain of nodes:
//! hashed chained nodes first (one grouping set each), then sorted chained
//! nodes (each a rollup over its own column order, possibly prefixed by a
//! re-sort). The operator asserts the planner invariants it depends on; it
//! does not re-plan.

use std::collections::BTreeSet;

use quern_error::{QuernError, Result};

use crate::arrays::datum::DataType;
use crate::expr::{PhysicalExpr, SortKey};
use crate::functions::FunctionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggStrategy {
    /// Single group, no grouping keys.
    Plain,
    /// Input arrives grouped by the planner-arranged sort order.
    Sorted,
    /// Hash table per grouping set, input in any order.
    Hashed,
    /// Hashed sets populated while the first sorted phase runs, emitted after
    /// the last sorted phase.
    Mixed,
}

/// Partial-aggregation mode, encoded as independent bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggSplit {
    /// Emit transition values instead of running final functions.
    pub skip_final: bool,
    /// Inputs are partial transition states; use the combine function.
    pub combine: bool,
    /// Serialize emitted internal states.
    pub serialize: bool,
    /// Deserialize incoming internal states.
    pub deserialize: bool,
}

impl AggSplit {
    pub const NONE: AggSplit = AggSplit {
        skip_final: false,
        combine: false,
        serialize: false,
        deserialize: false,
    };

    /// Partial aggregation feeding a same-process combine stage.
    pub const PARTIAL: AggSplit = AggSplit {
        skip_final: true,
        combine: false,
        serialize: false,
        deserialize: false,
    };

    /// Partial aggregation whose output crosses a process boundary.
    pub const INITIAL_SERIAL: AggSplit = AggSplit {
        skip_final: true,
        combine: false,
        serialize: true,
        deserialize: false,
    };

    /// Combine stage over same-process partials.
    pub const COMBINE: AggSplit = AggSplit {
        skip_final: false,
        combine: true,
        serialize: false,
        deserialize: false,
    };

    /// Final combine stage over serialized partials.
    pub const COMBINE_DESERIAL: AggSplit = AggSplit {
        skip_final: false,
        combine: true,
        serialize: false,
        deserialize: true,
    };
}

/// One aggregate call site.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggref {
    pub func: FunctionId,
    /// Evaluated argument expressions. The first `num_trans_args` feed the
    /// transition function; any trailing expressions exist only for ORDER BY.
    pub args: Vec<PhysicalExpr>,
    pub num_trans_args: usize,
    /// Ordered-set direct arguments, evaluated once per group at finalize.
    pub direct_args: Vec<PhysicalExpr>,
    /// Sort keys over positions in `args`.
    pub sort_keys: Vec<SortKey>,
    pub distinct: bool,
    pub filter: Option<PhysicalExpr>,
    pub collation: Option<u32>,
    pub result_collation: Option<u32>,
    /// An aggregate containing a volatile function is never shared.
    pub volatile: bool,
}

impl Aggref {
    pub fn new(func: FunctionId, args: Vec<PhysicalExpr>) -> Self {
        let num_trans_args = args.len();
        Aggref {
            func,
            args,
            num_trans_args,
            direct_args: Vec::new(),
            sort_keys: Vec::new(),
            distinct: false,
            filter: None,
            collation: None,
            result_collation: None,
            volatile: false,
        }
    }

    pub fn with_distinct(mut self) -> Self {
        self.distinct = true;
        if self.sort_keys.is_empty() {
            self.sort_keys = (0..self.args.len()).map(SortKey::asc).collect();
        }
        self
    }

    pub fn with_order_by(mut self, keys: Vec<SortKey>) -> Self {
        self.sort_keys = keys;
        self
    }

    pub fn with_filter(mut self, filter: PhysicalExpr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn num_sort_cols(&self) -> usize {
        self.sort_keys.len()
    }

    /// Zero, or equal to the number of sort columns.
    pub fn num_distinct_cols(&self) -> usize {
        if self.distinct {
            self.sort_keys.len()
        } else {
            0
        }
    }
}

/// One node of the plan chain.
#[derive(Debug, Clone)]
pub struct AggNode {
    pub strategy: AggStrategy,
    /// Input columns used for grouping, in sort order for sorted strategies.
    /// A hashed node contributes exactly one grouping set: these columns.
    pub group_cols: Vec<usize>,
    /// For sorted and plain nodes: prefix lengths of `group_cols`, one per
    /// grouping set, most specific first (e.g. `[3, 2, 1, 0]` for a rollup).
    pub gset_prefix_lens: Vec<usize>,
    /// Sort required to produce this node's input. None for hashed nodes and
    /// for the first sorted phase (the child already delivers that order).
    pub sort: Option<Vec<SortKey>>,
}

impl AggNode {
    pub fn plain() -> Self {
        AggNode {
            strategy: AggStrategy::Plain,
            group_cols: Vec::new(),
            gset_prefix_lens: vec![0],
            sort: None,
        }
    }

    pub fn sorted(group_cols: Vec<usize>) -> Self {
        let len = group_cols.len();
        AggNode {
            strategy: AggStrategy::Sorted,
            group_cols,
            gset_prefix_lens: vec![len],
            sort: None,
        }
    }

    pub fn sorted_rollup(group_cols: Vec<usize>, gset_prefix_lens: Vec<usize>) -> Self {
        AggNode {
            strategy: AggStrategy::Sorted,
            group_cols,
            gset_prefix_lens,
            sort: None,
        }
    }

    pub fn hashed(group_cols: Vec<usize>) -> Self {
        AggNode {
            strategy: AggStrategy::Hashed,
            group_cols,
            gset_prefix_lens: Vec::new(),
            sort: None,
        }
    }

    pub fn with_input_sort(mut self, keys: Vec<SortKey>) -> Self {
        self.sort = Some(keys);
        self
    }

    /// The grouping sets this node contributes, as input-column sets.
    pub fn grouping_sets(&self) -> Vec<BTreeSet<usize>> {
        match self.strategy {
            AggStrategy::Hashed => vec![self.group_cols.iter().copied().collect()],
            _ => self
                .gset_prefix_lens
                .iter()
                .map(|&len| self.group_cols[..len].iter().copied().collect())
                .collect(),
        }
    }
}

/// The aggregate plan handed to the operator.
#[derive(Debug, Clone)]
pub struct AggPlan {
    pub strategy: AggStrategy,
    pub split: AggSplit,
    /// Plan chain. `nodes[0]` is the root; hashed chained nodes precede
    /// sorted chained nodes.
    pub nodes: Vec<AggNode>,
    pub aggs: Vec<Aggref>,
    pub having: Option<PhysicalExpr>,
    /// Output projection over the representative row, `AggregateRef`s, and
    /// `GroupingFunc`s.
    pub output: Vec<PhysicalExpr>,
    pub input_types: Vec<DataType>,
    /// Planner marked the hash tables as allowed to spill.
    pub hybrid: bool,
    pub num_groups_estimate: usize,
}

impl AggPlan {
    /// All grouping columns across every node, in first-appearance order.
    pub fn all_group_cols(&self) -> Vec<usize> {
        let mut cols = Vec::new();
        for node in &self.nodes {
            for &col in &node.group_cols {
                if !cols.contains(&col) {
                    cols.push(col);
                }
            }
        }
        cols
    }

    /// Check the invariants the planner must satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(QuernError::new("Aggregate plan has no nodes"));
        }

        let num_hashed = self
            .nodes
            .iter()
            .filter(|n| n.strategy == AggStrategy::Hashed)
            .count();
        let num_sorted = self
            .nodes
            .iter()
            .filter(|n| matches!(n.strategy, AggStrategy::Sorted | AggStrategy::Plain))
            .count();

        // Hashed chained nodes precede sorted chained nodes.
        let first_sorted = self
            .nodes
            .iter()
            .position(|n| n.strategy != AggStrategy::Hashed);
        if let Some(first_sorted) = first_sorted {
            if self.nodes[first_sorted..]
                .iter()
                .any(|n| n.strategy == AggStrategy::Hashed)
            {
                return Err(QuernError::new(
                    "Hashed chained nodes must precede sorted chained nodes",
                ));
            }
        }

        let expected = match (num_hashed > 0, num_sorted > 0) {
            (true, true) => AggStrategy::Mixed,
            (true, false) => AggStrategy::Hashed,
            (false, true) => {
                if self.nodes.len() == 1 && self.nodes[0].strategy == AggStrategy::Plain {
                    AggStrategy::Plain
                } else {
                    AggStrategy::Sorted
                }
            }
            (false, false) => return Err(QuernError::new("Aggregate plan has no usable nodes")),
        };
        if expected != self.strategy {
            return Err(QuernError::new(format!(
                "Plan strategy {:?} does not match node strategies (expected {expected:?})",
                self.strategy
            )));
        }

        if self.strategy == AggStrategy::Plain && self.nodes.len() > 1 {
            return Err(QuernError::new("Plain aggregation cannot have chained nodes"));
        }

        for node in &self.nodes {
            match node.strategy {
                AggStrategy::Hashed => {}
                _ => {
                    let mut prev = None;
                    for &len in &node.gset_prefix_lens {
                        if len > node.group_cols.len() {
                            return Err(QuernError::new(
                                "Grouping-set prefix exceeds the node's grouping columns",
                            ));
                        }
                        if let Some(prev) = prev {
                            if len > prev {
                                return Err(QuernError::new(
                                    "Grouping sets must be listed most specific first",
                                ));
                            }
                        }
                        prev = Some(len);
                    }
                }
            }
        }

        if self.split.combine {
            for agg in &self.aggs {
                if agg.distinct || !agg.sort_keys.is_empty() {
                    return Err(QuernError::new(
                        "Combine mode cannot aggregate DISTINCT or ordered inputs",
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::aggregate::builtin;

    fn count_plan(nodes: Vec<AggNode>, strategy: AggStrategy) -> AggPlan {
        AggPlan {
            strategy,
            split: AggSplit::NONE,
            nodes,
            aggs: vec![Aggref::new(builtin::COUNT_STAR, vec![])],
            having: None,
            output: vec![PhysicalExpr::AggregateRef(0)],
            input_types: vec![DataType::Int64],
            hybrid: false,
            num_groups_estimate: 1,
        }
    }

    #[test]
    fn strategy_must_match_nodes() {
        let plan = count_plan(vec![AggNode::hashed(vec![0])], AggStrategy::Sorted);
        assert!(plan.validate().is_err());

        let plan = count_plan(vec![AggNode::hashed(vec![0])], AggStrategy::Hashed);
        plan.validate().unwrap();
    }

    #[test]
    fn hashed_nodes_must_come_first() {
        let plan = count_plan(
            vec![AggNode::sorted(vec![0]), AggNode::hashed(vec![0])],
            AggStrategy::Mixed,
        );
        assert!(plan.validate().is_err());
    }

    #[test]
    fn combine_mode_rejects_distinct() {
        let mut plan = count_plan(vec![AggNode::plain()], AggStrategy::Plain);
        plan.split = AggSplit::COMBINE;
        plan.aggs =
            vec![Aggref::new(builtin::SUM_INT64, vec![PhysicalExpr::column(0)]).with_distinct()];
        assert!(plan.validate().is_err());
    }

    #[test]
    fn rollup_prefixes_must_descend() {
        let node = AggNode::sorted_rollup(vec![0, 1], vec![1, 2]);
        let plan = count_plan(vec![node], AggStrategy::Sorted);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn grouping_sets_from_prefixes() {
        let node = AggNode::sorted_rollup(vec![4, 2], vec![2, 1, 0]);
        let sets = node.grouping_sets();
        assert_eq!(3, sets.len());
        assert!(sets[0].contains(&4) && sets[0].contains(&2));
        assert!(sets[1].contains(&4) && !sets[1].contains(&2));
        assert!(sets[2].is_empty());
    }
}
