use fnv::FnvHashMap as HashMap;
use std::hash::Hash;

/// partition membership vector into groups of indexes
/// # Arguments
/// * `membership` - a vector of membership (E.g., cluster assignment)
/// # Returns
/// A hashmap: cluster/group name -> indexes of the elements
pub fn partition_by_membership<T>(membership: &[T]) -> HashMap<T, Vec<usize>>
where
    T: Eq + Hash + Clone,
{
    let mut groups: HashMap<T, Vec<usize>> = HashMap::default();
    for (cell, k) in membership.iter().enumerate() {
        groups.entry(k.clone()).or_default().push(cell);
    }
    groups
}

/// Generate minibatch intervals
/// * `ntot` - number of total samples
/// * `batch_size` - the size of each batch
pub fn generate_minibatch_intervals(ntot: usize, batch_size: usize) -> Vec<(usize, usize)> {
    let num_batches = ntot.div_ceil(batch_size);
    (0..num_batches)
        .map(|b| {
            let lb: usize = b * batch_size;
            let ub: usize = ((b + 1) * batch_size).min(ntot);
            (lb, ub)
        })
        .collect::<Vec<_>>()
}

/// Linear-interpolation quantile (numpy's default) of unsorted values
/// * `values` - data; NaN entries are ignored
/// * `q` - quantile in [0, 1]
pub fn quantile(values: &[f32], q: f32) -> Option<f32> {
    let mut sorted: Vec<f32> = values.iter().copied().filter(|x| !x.is_nan()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f32;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f32;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}
