//! Phase scheduling for grouping sets.
//!
//! Phases are numbered with phase 0 reserved for hashing and sorted phases
//! counting up from 1. The first sorted phase consumes the child's
//! planner-arranged order; each later sorted phase consumes a re-sort of the
//! phase-1 input. In mixed strategy the hash tables fill while phase 1 runs
//! and drain after the last sorted phase.

use std::collections::BTreeSet;

use quern_error::{QuernError, Result};

use crate::arrays::row::Row;
use crate::expr::SortKey;
use crate::plan::{AggPlan, AggStrategy};

/// One phase of execution.
#[derive(Debug)]
pub struct PerPhase {
    pub strategy: AggStrategy,
    /// Grouping columns in this phase's sort order. Empty for the hash phase.
    pub group_cols: Vec<usize>,
    /// Per grouping set: prefix length into `group_cols`, most specific
    /// first. Empty for the hash phase.
    pub gset_lengths: Vec<usize>,
    /// Per grouping set: membership over input columns.
    pub grouped_cols: Vec<BTreeSet<usize>>,
    /// Sort producing this phase's input. None for the hash phase and for
    /// the first sorted phase.
    pub sort_spec: Option<Vec<SortKey>>,
}

impl PerPhase {
    pub fn num_sets(&self) -> usize {
        self.grouped_cols.len()
    }

    /// Index of the first grouping column where the two rows differ, or the
    /// full column count when they match on every grouping column.
    pub fn first_changed_col(&self, prev: &Row, curr: &Row) -> Result<usize> {
        for (idx, &col) in self.group_cols.iter().enumerate() {
            if !prev.column(col)?.group_eq(curr.column(col)?) {
                return Ok(idx);
            }
        }
        Ok(self.group_cols.len())
    }

    /// How many grouping sets cross a boundary when the grouping columns
    /// changed at `changed_col`. Sets are most specific first, so the crossed
    /// sets are exactly the leading ones whose prefix covers the change.
    pub fn sets_crossed(&self, changed_col: usize) -> usize {
        self.gset_lengths
            .iter()
            .take_while(|&&len| len > changed_col)
            .count()
    }
}

/// The full phase table for a plan.
#[derive(Debug)]
pub struct Phases {
    /// `phases[0]` is the hash phase (present only when hashed sets exist);
    /// `phases[1..]` are the sorted phases in execution order.
    pub phases: Vec<Option<PerPhase>>,
    /// Grouping sets handled by the hash phase, one per hashed node.
    pub hashed_sets: Vec<Vec<usize>>,
    pub num_sorted_phases: usize,
    /// Largest number of concurrent grouping sets in any sorted phase; sizes
    /// the per-set arenas and flat pergroup arrays.
    pub max_sorted_sets: usize,
}

impl Phases {
    pub fn build(plan: &AggPlan) -> Result<Phases> {
        plan.validate()?;

        let mut hashed_sets = Vec::new();
        let mut sorted_phases = Vec::new();

        for node in &plan.nodes {
            match node.strategy {
                AggStrategy::Hashed => hashed_sets.push(node.group_cols.clone()),
                AggStrategy::Sorted | AggStrategy::Plain => {
                    let grouped_cols = node.grouping_sets();
                    sorted_phases.push(PerPhase {
                        strategy: node.strategy,
                        group_cols: node.group_cols.clone(),
                        gset_lengths: node.gset_prefix_lens.clone(),
                        grouped_cols,
                        sort_spec: node.sort.clone(),
                    });
                }
                AggStrategy::Mixed => {
                    return Err(QuernError::new("Mixed is not a per-node strategy"))
                }
            }
        }

        let num_sorted_phases = sorted_phases.len();
        let max_sorted_sets = sorted_phases
            .iter()
            .map(PerPhase::num_sets)
            .max()
            .unwrap_or(0);

        let hash_phase = if hashed_sets.is_empty() {
            None
        } else {
            Some(PerPhase {
                strategy: AggStrategy::Hashed,
                group_cols: Vec::new(),
                gset_lengths: Vec::new(),
                grouped_cols: hashed_sets
                    .iter()
                    .map(|cols| cols.iter().copied().collect())
                    .collect(),
                sort_spec: None,
            })
        };

        let mut phases = Vec::with_capacity(1 + num_sorted_phases);
        phases.push(hash_phase);
        phases.extend(sorted_phases.into_iter().map(Some));

        Ok(Phases {
            phases,
            hashed_sets,
            num_sorted_phases,
            max_sorted_sets,
        })
    }

    pub fn sorted_phase(&self, phase_idx: usize) -> Result<&PerPhase> {
        self.phases
            .get(phase_idx)
            .and_then(|p| p.as_ref())
            .ok_or_else(|| QuernError::new(format!("No phase {phase_idx}")))
    }

    pub fn has_hash_phase(&self) -> bool {
        self.phases[0].is_some()
    }

    /// First phase the scheduler enters: phase 1 when sorted phases exist,
    /// otherwise the hash phase.
    pub fn initial_phase(&self) -> usize {
        if self.num_sorted_phases > 0 {
            1
        } else {
            0
        }
    }
}
