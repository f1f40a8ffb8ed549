//! Group hash table for hashed grouping sets.
//!
//! The table is keyed by a projected grouping-column row: the grouping keys
//! occupy the first `num_key_cols` positions of the stored representative
//! row, followed by any extra columns the target list or HAVING qual needs.
//! Each entry owns a contiguous run of per-transition group states.

use std::collections::BTreeSet;

use hashbrown::raw::RawTable;
use quern_error::Result;

use super::state::{GroupState, PerTrans};
use crate::arrays::datum::Datum;
use crate::arrays::row::Row;
use crate::plan::AggPlan;
use crate::runtime::arena::ArenaId;
use crate::util::hash::hash_row;

/// Outcome of a lookup-or-insert probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableInsert {
    /// Entry already existed.
    Found(usize),
    /// New entry created and initialized.
    Inserted(usize),
    /// The table is at its entry cap; the caller must spill before retrying.
    Full,
}

#[derive(Debug)]
struct GroupEntry {
    hash: u64,
    /// Representative row in hash-slot layout: key columns first.
    key: Row,
}

/// Open-addressed hash table mapping a grouping-key row to a representative
/// row plus one group state per transition.
pub struct GroupHashTable {
    table: RawTable<(u64, usize)>,
    entries: Vec<GroupEntry>,
    /// Flat states, `num_trans` per entry.
    group_states: Vec<GroupState>,
    num_trans: usize,
    num_key_cols: usize,
    /// Hybrid entry cap; the table never grows past this once set.
    max_entries: Option<usize>,
}

impl std::fmt::Debug for GroupHashTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupHashTable")
            .field("num_entries", &self.entries.len())
            .field("num_trans", &self.num_trans)
            .field("num_key_cols", &self.num_key_cols)
            .field("max_entries", &self.max_entries)
            .finish_non_exhaustive()
    }
}

impl GroupHashTable {
    pub fn new(num_trans: usize, num_key_cols: usize) -> Self {
        GroupHashTable {
            table: RawTable::new(),
            entries: Vec::new(),
            group_states: Vec::new(),
            num_trans,
            num_key_cols,
            max_entries: None,
        }
    }

    /// Cap the number of in-memory entries. Static for the table's life.
    pub fn set_entry_cap(&mut self, max_entries: usize) {
        self.max_entries = Some(max_entries.max(1));
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn at_capacity(&self) -> bool {
        match self.max_entries {
            Some(cap) => self.entries.len() >= cap,
            None => false,
        }
    }

    /// Hash of the key columns of a hash-slot row.
    pub fn hash_slot(&self, slot: &Row) -> u64 {
        hash_row(&slot.values[..self.num_key_cols])
    }

    /// Probe with an externally supplied hash (spill reload uses the exact
    /// stored hash key). On miss, inserts the row with per-transition states
    /// initialized by `init`, unless the table is at capacity.
    pub fn lookup_or_insert_hashed<F>(
        &mut self,
        hash: u64,
        slot: &Row,
        init: F,
    ) -> Result<TableInsert>
    where
        F: FnOnce(&mut [GroupState]),
    {
        let num_key_cols = self.num_key_cols;
        let entries = &self.entries;
        let existing = self.table.get(hash, |(entry_hash, entry_idx)| {
            *entry_hash == hash && keys_equal(&entries[*entry_idx].key, slot, num_key_cols)
        });
        if let Some((_, entry_idx)) = existing {
            return Ok(TableInsert::Found(*entry_idx));
        }

        if self.at_capacity() {
            return Ok(TableInsert::Full);
        }

        let entry_idx = self.entries.len();
        self.entries.push(GroupEntry {
            hash,
            key: slot.clone(),
        });
        self.group_states.extend(
            std::iter::repeat_with(|| GroupState {
                value: super::state::TransValue::null(),
                is_null: true,
                no_value: true,
            })
            .take(self.num_trans),
        );
        init(self.entry_states_mut(entry_idx));

        self.table
            .insert(hash, (hash, entry_idx), |(hash, _)| *hash);
        Ok(TableInsert::Inserted(entry_idx))
    }

    /// Lookup-or-insert with the hash computed from the slot's key columns.
    pub fn lookup_or_insert<F>(&mut self, slot: &Row, init: F) -> Result<TableInsert>
    where
        F: FnOnce(&mut [GroupState]),
    {
        let hash = self.hash_slot(slot);
        self.lookup_or_insert_hashed(hash, slot, init)
    }

    pub fn entry_hash(&self, entry_idx: usize) -> u64 {
        self.entries[entry_idx].hash
    }

    pub fn entry_key(&self, entry_idx: usize) -> &Row {
        &self.entries[entry_idx].key
    }

    pub fn entry_states(&self, entry_idx: usize) -> &[GroupState] {
        let start = entry_idx * self.num_trans;
        &self.group_states[start..start + self.num_trans]
    }

    pub fn entry_states_mut(&mut self, entry_idx: usize) -> &mut [GroupState] {
        let start = entry_idx * self.num_trans;
        &mut self.group_states[start..start + self.num_trans]
    }

    /// Drop every entry. The arena holding spilled-in state is reset by the
    /// caller; the cap is retained.
    pub fn reset(&mut self) {
        self.table.clear();
        self.entries.clear();
        self.group_states.clear();
    }
}

fn keys_equal(a: &Row, b: &Row, num_key_cols: usize) -> bool {
    a.values[..num_key_cols]
        .iter()
        .zip(&b.values[..num_key_cols])
        .all(|(x, y)| x.group_eq(y))
}

/// Per-hashed-grouping-set state: the hash table plus the projection from
/// input rows into hash-slot rows.
#[derive(Debug)]
pub struct PerHash {
    /// Index of this set among hashed sets.
    pub setno: usize,
    pub grouping_set: BTreeSet<usize>,
    /// Input columns in hash-slot order: grouping keys first, then extra
    /// columns referenced downstream.
    pub slot_cols: Vec<usize>,
    pub num_key_cols: usize,
    pub table: GroupHashTable,
    /// Hybrid spill state, present once the table has spilled.
    pub spill: Option<super::spill::SpillSet>,
    /// Arena holding reloaded spill state.
    pub hybrid_arena: Option<ArenaId>,
    /// Entry cap and batch count when hybrid mode is enabled.
    pub hybrid: Option<HybridConfig>,
    /// Iteration cursor for draining the table.
    pub iter_pos: usize,
    /// Whether the drain pass has flushed residual entries to the spill set.
    pub drain_prepared: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct HybridConfig {
    pub nentries: usize,
    pub nbatches: usize,
}

impl PerHash {
    /// Build the per-hash state for one hashed grouping set.
    ///
    /// The hash slot keeps only columns referenced by the target list, the
    /// HAVING qual, or the set's keys, with the keys first so hashing and
    /// equality read a contiguous prefix.
    pub fn build(setno: usize, key_cols: &[usize], plan: &AggPlan, num_trans: usize) -> PerHash {
        let mut referenced = BTreeSet::new();
        for expr in &plan.output {
            expr.collect_columns(&mut referenced);
        }
        if let Some(having) = &plan.having {
            having.collect_columns(&mut referenced);
        }

        let mut slot_cols: Vec<usize> = key_cols.to_vec();
        for col in referenced {
            if !slot_cols.contains(&col) {
                slot_cols.push(col);
            }
        }

        let num_key_cols = key_cols.len();
        PerHash {
            setno,
            grouping_set: key_cols.iter().copied().collect(),
            table: GroupHashTable::new(num_trans, num_key_cols),
            slot_cols,
            num_key_cols,
            spill: None,
            hybrid_arena: None,
            hybrid: None,
            iter_pos: 0,
            drain_prepared: false,
        }
    }

    /// Project an input row into this set's hash-slot layout.
    pub fn hash_slot_row(&self, input: &Row) -> Result<Row> {
        input.project(&self.slot_cols)
    }

    /// Map a stored hash-slot row back to input shape, nulling columns the
    /// slot does not carry.
    pub fn slot_to_input_row(&self, slot: &Row, num_input_cols: usize) -> Result<Row> {
        let mut values = vec![Datum::Null; num_input_cols];
        for (slot_idx, &input_idx) in self.slot_cols.iter().enumerate() {
            values[input_idx] = slot.column(slot_idx)?.clone();
        }
        Ok(Row::new(values))
    }

    /// Initialize states for a fresh entry.
    pub fn init_entry_states(pertrans: &[PerTrans], arena: ArenaId, states: &mut [GroupState]) {
        for (state, pt) in states.iter_mut().zip(pertrans) {
            *state = GroupState::initial(pt, arena);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::datum::Datum;

    fn slot(values: Vec<Datum>) -> Row {
        Row::new(values)
    }

    #[test]
    fn one_entry_per_equivalence_class() {
        let mut table = GroupHashTable::new(0, 1);

        let a = slot(vec![Datum::Int64(1), Datum::Utf8("x".into())]);
        let a_again = slot(vec![Datum::Int64(1), Datum::Utf8("y".into())]);
        let b = slot(vec![Datum::Int64(2), Datum::Utf8("x".into())]);

        assert_eq!(
            TableInsert::Inserted(0),
            table.lookup_or_insert(&a, |_| {}).unwrap()
        );
        // Same key column, different extra column: same equivalence class.
        assert_eq!(
            TableInsert::Found(0),
            table.lookup_or_insert(&a_again, |_| {}).unwrap()
        );
        assert_eq!(
            TableInsert::Inserted(1),
            table.lookup_or_insert(&b, |_| {}).unwrap()
        );
        assert_eq!(2, table.num_entries());
    }

    #[test]
    fn null_keys_group_together() {
        let mut table = GroupHashTable::new(0, 1);
        let null_key = slot(vec![Datum::Null]);
        assert_eq!(
            TableInsert::Inserted(0),
            table.lookup_or_insert(&null_key, |_| {}).unwrap()
        );
        assert_eq!(
            TableInsert::Found(0),
            table.lookup_or_insert(&null_key, |_| {}).unwrap()
        );
    }

    #[test]
    fn entry_cap_reports_full() {
        let mut table = GroupHashTable::new(1, 1);
        table.set_entry_cap(2);

        for v in 0..2 {
            let row = slot(vec![Datum::Int64(v)]);
            assert!(matches!(
                table.lookup_or_insert(&row, |_| {}).unwrap(),
                TableInsert::Inserted(_)
            ));
        }

        // Existing entries still resolve.
        let row = slot(vec![Datum::Int64(1)]);
        assert_eq!(
            TableInsert::Found(1),
            table.lookup_or_insert(&row, |_| {}).unwrap()
        );
        // New keys cannot enter.
        let row = slot(vec![Datum::Int64(9)]);
        assert_eq!(TableInsert::Full, table.lookup_or_insert(&row, |_| {}).unwrap());

        // Reset keeps the cap but empties the table.
        table.reset();
        assert!(table.is_empty());
        let row = slot(vec![Datum::Int64(9)]);
        assert!(matches!(
            table.lookup_or_insert(&row, |_| {}).unwrap(),
            TableInsert::Inserted(_)
        ));
    }
}
