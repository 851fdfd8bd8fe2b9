//! Prune a row-normalized type-to-type transition matrix into a
//! sparse parent distribution per type.
//!
//! Row `i` keeps at most `n_par` parents among types `j != i` that
//! start no later than `i` (`t_init[j] <= t_init[i]`). Every kept
//! parent and every strictly earlier type receives the floor weight
//! `e`, so types of a lineage stay reachable from its root; the
//! remaining mass `1 - m e` is shared among kept parents in proportion
//! to their weight above the floor.
//!
//! A row with nothing above the floor takes the `n_par` most recent
//! strictly earlier types as its kept parents, in equal shares, and
//! floors the older ones. A type with no earlier type at all is a root
//! with self weight 1.
//!
//! Only weight above the floor counts when choosing parents, which
//! makes pruning a pruned matrix a no-op.

use crate::common::*;

/// Floor weight given to every admissible earlier type
pub const FLOOR_WEIGHT: f32 = 1e-3;

/// Prune `p_raw` (rows = child types, columns = parent types)
///
/// * `p_raw` - row-normalized transition frequencies
/// * `t_init` - initial time of each type
/// * `n_par` - maximum number of parents to keep per type
pub fn prune_transition(p_raw: &Mat, t_init: &[f32], n_par: usize) -> Mat {
    let n_type = p_raw.nrows();
    debug_assert_eq!(p_raw.ncols(), n_type);
    debug_assert_eq!(t_init.len(), n_type);

    let mut ret = Mat::zeros(n_type, n_type);

    for i in 0..n_type {
        let cand: Vec<usize> = (0..n_type)
            .filter(|&j| j != i && t_init[j] <= t_init[i])
            .collect();
        let earlier: Vec<usize> = cand
            .iter()
            .copied()
            .filter(|&j| t_init[j] < t_init[i])
            .collect();

        let floor = if cand.is_empty() {
            FLOOR_WEIGHT
        } else {
            FLOOR_WEIGHT.min(0.5 / cand.len() as f32)
        };

        // strongest candidates above the floor; ties by index
        let mut kept: Vec<usize> = cand
            .iter()
            .copied()
            .filter(|&j| p_raw[(i, j)] > floor)
            .collect();
        kept.sort_by(|&a, &b| p_raw[(i, b)].total_cmp(&p_raw[(i, a)]).then(a.cmp(&b)));
        kept.truncate(n_par);

        let share: Vec<f32> = if !kept.is_empty() {
            let excess: Vec<f32> = kept.iter().map(|&j| p_raw[(i, j)] - floor).collect();
            let tot: f32 = excess.iter().sum();
            excess.into_iter().map(|x| x / tot).collect()
        } else if !earlier.is_empty() {
            // nothing observed: lean on the most recent earlier types
            let mut latest = earlier.clone();
            latest.sort_by(|&a, &b| t_init[b].total_cmp(&t_init[a]).then(a.cmp(&b)));
            latest.truncate(n_par.max(1));
            kept = latest;
            vec![1.0 / kept.len() as f32; kept.len()]
        } else {
            // a root without any admissible parent points to itself
            ret[(i, i)] = 1.0;
            continue;
        };

        let floored: Vec<usize> = earlier
            .iter()
            .copied()
            .filter(|j| !kept.contains(j))
            .collect();

        let m = (kept.len() + floored.len()) as f32;
        let free = 1.0 - m * floor;

        for (&j, &w) in kept.iter().zip(share.iter()) {
            ret[(i, j)] = floor + free * w;
        }
        for &j in floored.iter() {
            ret[(i, j)] = floor;
        }

        assert!(ret[(i, i)] == 0.0, "type {} became its own parent", i);
    }

    ret
}

/// Whether row `i` is the isolated-root fallback (self weight 1)
pub fn is_self_rooted(p: &Mat, i: usize) -> bool {
    p[(i, i)] == 1.0
}
