use crate::knn_match::ColumnDict;
use crate::utils::generate_minibatch_intervals;

use dashmap::DashMap;
use indicatif::ParallelProgressIterator;
use log::info;
use nalgebra::DMatrix;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use rayon::prelude::*;

/// Undirected kNN graph over the rows of a matrix
pub struct KnnGraph {
    /// Symmetric CSC adjacency matrix of distances (n_nodes x n_nodes)
    pub adjacency: CscMatrix<f32>,
    /// Sorted edge list (i < j), deduplicated
    pub edges: Vec<(usize, usize)>,
    /// Edge distances, parallel to `edges`
    pub distances: Vec<f32>,
    pub n_nodes: usize,
}

pub struct KnnGraphArgs {
    pub knn: usize,
    pub block_size: usize,
    /// If true, keep only reciprocal edges (i→j AND j→i).
    /// If false, keep union edges (i→j OR j→i), using min distance.
    pub reciprocal: bool,
}

impl Default for KnnGraphArgs {
    fn default() -> Self {
        Self {
            knn: 10,
            block_size: 1000,
            reciprocal: false,
        }
    }
}

fn median_f32(values: &[f32]) -> f32 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n == 0 {
        0.0
    } else if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

impl KnnGraph {
    /// Build a KNN graph from row vectors (cells × features).
    ///
    /// * `data` - matrix (n x d), where each row is a point
    /// * `args` - KNN graph construction parameters
    pub fn from_rows(data: &DMatrix<f32>, args: &KnnGraphArgs) -> anyhow::Result<KnnGraph> {
        let nn = data.nrows();
        if nn < 2 {
            anyhow::bail!("need at least 2 points for a kNN graph, got {}", nn);
        }

        let points = data.transpose();
        let dict = ColumnDict::from_dvector_views(points.column_iter().collect(), (0..nn).collect());

        let knn = args.knn.clamp(1, nn - 1);
        let jobs = generate_minibatch_intervals(nn, args.block_size.max(1));
        let njobs = jobs.len() as u64;

        /////////////////////////////////
        // step 1: nearest neighbours  //
        /////////////////////////////////

        let triplets: DashMap<(usize, usize), f32> = DashMap::new();

        jobs.into_par_iter().progress_count(njobs).try_for_each(
            |(lb, ub)| -> anyhow::Result<()> {
                for i in lb..ub {
                    let (neighbours, distances) = dict.search_others(&i, knn)?;
                    for (j, d_ij) in neighbours.into_iter().zip(distances) {
                        triplets.insert((i, j), d_ij);
                    }
                }
                Ok(())
            },
        )?;

        if triplets.is_empty() {
            return Err(anyhow::anyhow!("empty triplets"));
        }

        /////////////////////////////////////////////////
        // step 2: edge filtering (reciprocal or union) //
        /////////////////////////////////////////////////

        let mut edges: Vec<((usize, usize), f32)> = triplets
            .par_iter()
            .filter_map(|entry| {
                let &(i, j) = entry.key();
                let d_ij = *entry.value();
                let back = triplets.get(&(j, i)).map(|e| *e);
                match (args.reciprocal, back) {
                    (_, Some(d_ji)) if i < j => Some(((i, j), d_ij.min(d_ji))),
                    (false, None) => Some(((i.min(j), i.max(j)), d_ij)),
                    _ => None,
                }
            })
            .collect();

        edges.par_sort_by_key(|&(ij, _)| ij);
        edges.dedup_by_key(|&mut (ij, _)| ij);

        info!(
            "{} edges over {} nodes after {} matching",
            edges.len(),
            nn,
            if args.reciprocal { "reciprocal" } else { "union" }
        );

        ////////////////////////////////
        // step 3: sparse backbone     //
        ////////////////////////////////

        let mut coo = CooMatrix::new(nn, nn);
        for &((i, j), v) in edges.iter() {
            coo.push(i, j, v);
            coo.push(j, i, v);
        }

        let adjacency = CscMatrix::from(&coo);
        let (edge_pairs, distances): (Vec<_>, Vec<_>) = edges.into_iter().unzip();

        Ok(KnnGraph {
            adjacency,
            edges: edge_pairs,
            distances,
            n_nodes: nn,
        })
    }

    /// Get neighbors of a node from the CSC adjacency matrix
    pub fn neighbors(&self, node: usize) -> &[usize] {
        let offsets = self.adjacency.col_offsets();
        &self.adjacency.row_indices()[offsets[node]..offsets[node + 1]]
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.n_nodes
    }

    /// Convert distances to similarity weights using an exponential kernel:
    /// `w = exp(-d / σ)` where σ = median distance.
    ///
    /// Returns weights parallel to `self.edges`, all in (0, 1].
    pub fn exp_kernel_weights(&self) -> Vec<f32> {
        if self.distances.is_empty() {
            return Vec::new();
        }
        let sigma = median_f32(&self.distances);
        let sigma = if sigma <= 0.0 { 1.0 } else { sigma };
        self.distances.iter().map(|&d| (-d / sigma).exp()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two tight clusters of 5 points each in 2D, well separated
    fn two_cluster_matrix() -> DMatrix<f32> {
        DMatrix::from_row_slice(
            10,
            2,
            &[
                0.0, 0.0, //
                0.1, 0.0, //
                0.0, 0.1, //
                0.1, 0.1, //
                0.05, 0.05, //
                10.0, 10.0, //
                10.1, 10.0, //
                10.0, 10.1, //
                10.1, 10.1, //
                10.05, 10.05, //
            ],
        )
    }

    #[test]
    fn edges_stay_within_clusters() {
        let data = two_cluster_matrix();
        let args = KnnGraphArgs {
            knn: 3,
            block_size: 4,
            reciprocal: false,
        };
        let graph = KnnGraph::from_rows(&data, &args).unwrap();

        assert_eq!(graph.num_nodes(), 10);
        assert_eq!(graph.edges.len(), graph.distances.len());

        for &(i, j) in &graph.edges {
            assert!(i < j, "Edge ({}, {}) not canonical", i, j);
            assert_eq!(i < 5, j < 5, "edge ({}, {}) crosses clusters", i, j);
        }

        for node in 0..10 {
            assert!(!graph.neighbors(node).is_empty());
        }
    }

    #[test]
    fn kernel_weights_in_unit_interval() {
        let data = two_cluster_matrix();
        let graph = KnnGraph::from_rows(&data, &KnnGraphArgs::default()).unwrap();
        let w = graph.exp_kernel_weights();
        assert_eq!(w.len(), graph.num_edges());
        assert!(w.iter().all(|&x| x > 0.0 && x <= 1.0));
    }
}
