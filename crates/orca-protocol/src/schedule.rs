//! Deterministic pseudorandom orderings of oracles.
//!
//! Leader election and transmission scheduling both derive a permutation of
//! `[0, n)` from a keyed hash, so every honest oracle computes the same
//! ordering without communicating.

use std::time::Duration;

use orca_core::{expand_seed, keyed_hash, DigestBuilder, Epoch, Hash, OracleId, SeqNr};

/// Fisher-Yates shuffle of `[0, n)` driven by the expansion of `seed`
pub fn permutation(n: usize, seed: &Hash) -> Vec<OracleId> {
    let mut order: Vec<OracleId> = OracleId::all(n).collect();
    let mut words = expand_seed(seed);
    for i in (1..n).rev() {
        let word = words.next().unwrap_or_default();
        let j = (word % (i as u64 + 1)) as usize;
        order.swap(i, j);
    }
    order
}

/// Leader of `epoch`.
///
/// Epochs are grouped into spans of `n` consecutive epochs; within a span
/// every oracle leads exactly once.
pub fn leader(epoch: Epoch, n: usize, key: &[u8; 32]) -> OracleId {
    let span = epoch / n as u64;
    let position = (epoch % n as u64) as usize;
    let seed = keyed_hash(key, &span.to_be_bytes());
    permutation(n, &seed)[position]
}

/// Stage an oracle belongs to for one report, given the stage weights
pub fn transmission_stage(
    key: &[u8; 32],
    seq_nr: SeqNr,
    report_index: usize,
    stages: &[usize],
    id: OracleId,
) -> Option<usize> {
    let n: usize = stages.iter().sum();
    let input = DigestBuilder::new(b"orca/transmission-schedule")
        .u64(seq_nr)
        .u64(report_index as u64)
        .finish();
    let order = permutation(n, &keyed_hash(key, input.as_bytes()));
    let position = order.iter().position(|&o| o == id)?;

    let mut cumulative = 0;
    stages.iter().position(|&weight| {
        cumulative += weight;
        position < cumulative
    })
}

/// Delay before this oracle transmits the given report
pub fn transmission_delay(
    key: &[u8; 32],
    seq_nr: SeqNr,
    report_index: usize,
    stages: &[usize],
    delta_stage: Duration,
    id: OracleId,
) -> Option<Duration> {
    transmission_stage(key, seq_nr, report_index, stages, id)
        .map(|stage| delta_stage * stage as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orca_core::hash_blake3;
    use std::collections::BTreeSet;

    #[test]
    fn test_permutation_covers_every_oracle() {
        for n in 1..20 {
            let order = permutation(n, &hash_blake3(&[n as u8]));
            let unique: BTreeSet<_> = order.iter().copied().collect();
            assert_eq!(unique.len(), n);
            assert!(order.iter().all(|id| id.index() < n));
        }
    }

    #[test]
    fn test_leader_is_pure() {
        let key = [9u8; 32];
        for epoch in 0..50 {
            assert_eq!(leader(epoch, 7, &key), leader(epoch, 7, &key));
        }
    }

    #[test]
    fn test_leader_permutes_each_span() {
        let key = [5u8; 32];
        let n = 7;
        for span in 0..10u64 {
            let leaders: BTreeSet<_> = (span * n as u64..(span + 1) * n as u64)
                .map(|epoch| leader(epoch, n, &key))
                .collect();
            assert_eq!(leaders.len(), n);
        }
    }

    #[test]
    fn test_leader_depends_on_key() {
        let n = 16;
        let a: Vec<_> = (0..n as u64).map(|e| leader(e, n, &[1u8; 32])).collect();
        let b: Vec<_> = (0..n as u64).map(|e| leader(e, n, &[2u8; 32])).collect();
        assert_ne!(a, b);
    }

    #[test]
    fn test_every_oracle_gets_exactly_one_stage() {
        let key = [4u8; 32];
        let stages = [1, 2, 3, 1];
        let n: usize = stages.iter().sum();
        for seq_nr in 1..20 {
            for index in 0..3 {
                let mut per_stage = vec![0usize; stages.len()];
                for id in OracleId::all(n) {
                    let stage = transmission_stage(&key, seq_nr, index, &stages, id).unwrap();
                    per_stage[stage] += 1;
                }
                assert_eq!(per_stage, stages.to_vec());
            }
        }
    }

    #[test]
    fn test_transmission_delay_scales_with_stage() {
        let key = [4u8; 32];
        let stages = [1, 1, 1, 1];
        let delays: BTreeSet<_> = OracleId::all(4)
            .map(|id| {
                transmission_delay(&key, 3, 0, &stages, Duration::from_millis(100), id).unwrap()
            })
            .collect();
        let expected: BTreeSet<_> = (0..4).map(|s| Duration::from_millis(100 * s)).collect();
        assert_eq!(delays, expected);
    }

    #[test]
    fn test_unknown_oracle_has_no_stage() {
        assert_eq!(transmission_stage(&[0u8; 32], 1, 0, &[2, 2], OracleId(9)), None);
    }
}
