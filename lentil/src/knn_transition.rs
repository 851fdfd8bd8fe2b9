use crate::common::*;

use indicatif::ParallelProgressIterator;
use matrix_util::utils::quantile;
use rayon::prelude::*;

#[derive(Debug, Clone)]
pub struct KnnTransitionArgs {
    /// time window `(lo, hi)` as fractions of the time range; a cell at
    /// `t` looks for parents in `[t - hi * range, t - lo * range)`
    pub dt: (f32, f32),
    /// number of nearest neighbours within the window
    pub k: usize,
    /// distance-weighted votes (true) or a single majority vote (false)
    pub soft_assign: bool,
}

impl Default for KnnTransitionArgs {
    fn default() -> Self {
        Self {
            dt: (0.01, 0.03),
            k: 5,
            soft_assign: true,
        }
    }
}

/// Time span used for the window: `q99(t) - q01(t)`
pub fn time_range(time: &[f32]) -> f32 {
    match (quantile(time, 0.99), quantile(time, 0.01)) {
        (Some(hi), Some(lo)) => hi - lo,
        _ => 0.0,
    }
}

/// Count how often cells of each type appear among the nearest
/// earlier-time neighbours of each type.
///
/// * `time` - cell time (n)
/// * `embed` - cell embedding (n x d)
/// * `label` - cell type codes (n)
/// * `n_type` - number of cell types
///
/// Returns unnormalized counts `(child type, parent type)`
pub fn knn_transition_counts(
    time: &[f32],
    embed: &Mat,
    label: &[usize],
    n_type: usize,
    args: &KnnTransitionArgs,
) -> anyhow::Result<Mat> {
    let nn = time.len();
    if embed.nrows() != nn || label.len() != nn {
        anyhow::bail!(
            "{} times, {} embedding rows, {} labels",
            nn,
            embed.nrows(),
            label.len()
        );
    }
    if let Some(&bad) = label.iter().find(|&&y| y >= n_type) {
        anyhow::bail!("cell type code {} out of {}", bad, n_type);
    }

    let range_t = time_range(time);
    let (w_lo, w_hi) = (args.dt.0 * range_t, args.dt.1 * range_t);
    info!(
        "KNN transition: {} cells, k={}, window [{:.4}, {:.4}) before each cell",
        nn, args.k, w_lo, w_hi
    );

    // sort once so each window is a contiguous slice
    let mut order: Vec<usize> = (0..nn).filter(|&i| !time[i].is_nan()).collect();
    order.sort_by(|&a, &b| time[a].total_cmp(&time[b]));
    let sorted_t: Vec<f32> = order.iter().map(|&i| time[i]).collect();

    let zt = embed.transpose();
    let knn = args.k.max(1);

    let counts = (0..nn)
        .into_par_iter()
        .progress_count(nn as u64)
        .fold(
            || Mat::zeros(n_type, n_type),
            |mut acc, i| {
                let t = time[i];
                if t.is_nan() {
                    return acc;
                }
                let lb = sorted_t.partition_point(|&x| x < t - w_hi);
                let ub = sorted_t.partition_point(|&x| x < t - w_lo);
                if lb >= ub {
                    return acc;
                }

                let z_i = zt.column(i);
                let mut cand: Vec<(f32, usize)> = order[lb..ub]
                    .iter()
                    .filter(|&&j| j != i)
                    .map(|&j| ((zt.column(j) - z_i).norm(), j))
                    .collect();
                if cand.is_empty() {
                    return acc;
                }

                if cand.len() > knn {
                    cand.select_nth_unstable_by(knn - 1, |a, b| a.0.total_cmp(&b.0));
                    cand.truncate(knn);
                }

                let child = label[i];
                if args.soft_assign {
                    for (w, j) in soft_votes(&cand) {
                        acc[(child, label[j])] += w;
                    }
                } else {
                    let parent = majority_vote(&cand, label, n_type);
                    acc[(child, parent)] += 1.0;
                }
                acc
            },
        )
        .reduce(|| Mat::zeros(n_type, n_type), |a, b| a + b);

    Ok(counts)
}

/// `softmax(-d / mean(d))` weights of the neighbours
fn soft_votes(neighbours: &[(f32, usize)]) -> Vec<(f32, usize)> {
    let nk = neighbours.len() as f32;
    let mean_d = neighbours.iter().map(|(d, _)| d).sum::<f32>() / nk;
    if mean_d <= 0.0 {
        return neighbours.iter().map(|&(_, j)| (1.0 / nk, j)).collect();
    }
    let d_min = neighbours.iter().map(|(d, _)| *d).fold(f32::INFINITY, f32::min);
    let expd: Vec<f32> = neighbours
        .iter()
        .map(|(d, _)| (-(d - d_min) / mean_d).exp())
        .collect();
    let tot: f32 = expd.iter().sum();
    expd.into_iter()
        .zip(neighbours.iter())
        .map(|(w, &(_, j))| (w / tot, j))
        .collect()
}

/// The most frequent type among the neighbours (ties: smallest code)
fn majority_vote(neighbours: &[(f32, usize)], label: &[usize], n_type: usize) -> usize {
    let mut freq = vec![0usize; n_type];
    for &(_, j) in neighbours {
        freq[label[j]] += 1;
    }
    let mut best = 0;
    for (k, &f) in freq.iter().enumerate() {
        if f > freq[best] {
            best = k;
        }
    }
    best
}

/// Divide each non-zero row by its sum; all-zero rows stay zero
pub fn normalize_rows(counts: &Mat) -> Mat {
    let mut ret = counts.clone();
    for mut row in ret.row_iter_mut() {
        let tot = row.sum();
        if tot > 0.0 {
            row /= tot;
        }
    }
    ret
}
