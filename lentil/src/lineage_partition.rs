//! Split cells into disconnected lineages by Louvain community
//! detection on a kNN graph of the embedding.

use crate::common::*;

use fnv::FnvHashMap as HashMap;
use graphrs::algorithms::community::louvain::louvain_communities;
use graphrs::{Edge, Graph, GraphSpecs};
use matrix_util::knn_graph::{KnnGraph, KnnGraphArgs};
use matrix_util::traits::MatOps;

#[derive(Debug, Clone)]
pub struct PartitionArgs {
    /// neighbours per cell in the kNN graph
    pub knn: usize,
    /// modularity resolution γ; small values merge aggressively
    pub resolution: f64,
    pub seed: u64,
}

impl Default for PartitionArgs {
    fn default() -> Self {
        Self {
            knn: 5,
            resolution: 0.005,
            seed: 42,
        }
    }
}

/// Partition cells (rows of `embed`) into lineages
///
/// Returns compact partition ids `0..k` in order of first appearance
pub fn partition_cells(embed: &Mat, args: &PartitionArgs) -> anyhow::Result<Vec<usize>> {
    let nn = embed.nrows();
    if nn < 2 {
        return Ok(vec![0; nn]);
    }

    let z = embed.scale_columns();
    let knn = KnnGraph::from_rows(
        &z,
        &KnnGraphArgs {
            knn: args.knn,
            block_size: 1000,
            reciprocal: false,
        },
    )?;
    info!(
        "kNN graph: {} nodes, {} edges, mean degree {:.1}",
        knn.num_nodes(),
        knn.num_edges(),
        2.0 * knn.num_edges() as f32 / nn as f32
    );

    let membership = louvain_membership(&knn, args.resolution, args.seed)?;
    let n_part = membership.iter().max().map_or(0, |&k| k + 1);
    info!(
        "Louvain (γ={}) found {} lineage partition(s) over {} cells",
        args.resolution, n_part, nn
    );
    Ok(membership)
}

/// Louvain communities of a kNN graph with `exp(-d / median d)` edge
/// weights
///
/// A node that ends up in no community gets a community of its own.
pub fn louvain_membership(knn: &KnnGraph, resolution: f64, seed: u64) -> anyhow::Result<Vec<usize>> {
    let nn = knn.num_nodes();
    if knn.num_edges() == 0 {
        return Ok((0..nn).collect());
    }

    let weights = knn.exp_kernel_weights();
    let edges = knn
        .edges
        .iter()
        .zip(weights.iter())
        .map(|(&(i, j), &w)| Edge::with_weight(i, j, w as f64))
        .collect::<Vec<_>>();

    let mut graph = Graph::<usize, ()>::new(GraphSpecs::undirected_create_missing());
    graph
        .add_edges(edges)
        .map_err(|e| anyhow::anyhow!("kNN graph: {:?}", e))?;

    let communities = louvain_communities(&graph, true, Some(resolution), None, Some(seed))
        .map_err(|e| anyhow::anyhow!("Louvain: {:?}", e))?;
    debug!("{} raw communities", communities.len());

    let mut raw = vec![usize::MAX; nn];
    for (k, members) in communities.iter().enumerate() {
        for &i in members.iter() {
            if i < nn {
                raw[i] = k;
            }
        }
    }
    let mut next = communities.len();
    for x in raw.iter_mut().filter(|x| **x == usize::MAX) {
        *x = next;
        next += 1;
    }

    Ok(compact(&raw))
}

/// Relabel to `0..k` by first appearance
fn compact(raw: &[usize]) -> Vec<usize> {
    let mut remap: HashMap<usize, usize> = HashMap::default();
    raw.iter()
        .map(|&x| {
            let k = remap.len();
            *remap.entry(x).or_insert(k)
        })
        .collect()
}
