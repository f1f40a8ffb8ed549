use ahash::RandomState;

use crate::arrays::datum::Datum;

/// Fixed seeds so that every worker process computes identical hashes.
///
/// Redistribution and spill partitioning both rely on sibling workers agreeing
/// on the hash of a datum.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x5149_9e6c_7c7a_1b4d,
    0x9b3c_0d6a_22e1_55f0,
    0x1f0e_8d2b_64c9_a773,
    0xd4a6_45b8_30fe_9c21,
);

pub fn hash_state() -> RandomState {
    RandomState::with_seeds(HASH_SEEDS.0, HASH_SEEDS.1, HASH_SEEDS.2, HASH_SEEDS.3)
}

/// Hash a projected group-key row.
pub fn hash_row(datums: &[Datum]) -> u64 {
    let state = hash_state();
    let mut h = state.hash_one(datums.len() as u64);
    for datum in datums {
        h = h
            .rotate_left(31)
            .wrapping_mul(0x9e37_79b9_7f4a_7c15)
            .wrapping_add(datum.stable_hash(&state));
    }
    h
}

/// Get the partition to use for a hash.
///
/// This should be used anywhere a consistent hash to partition mapping is
/// required (hash aggregates, spill batches, redistribution).
pub const fn partition_for_hash(hash: u64, partitions: usize) -> usize {
    hash as usize % partitions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_across_states() {
        let row = [Datum::Int64(42), Datum::Utf8("group".to_string())];
        assert_eq!(hash_row(&row), hash_row(&row));
    }

    #[test]
    fn null_and_zero_hash_differently() {
        assert_ne!(hash_row(&[Datum::Null]), hash_row(&[Datum::Int64(0)]));
    }
}
