use crate::arborescence::{max_arborescence, ArborescenceArgs};
use crate::cell_types::CellTypes;
use crate::common::*;
use crate::graph_prune::{prune_transition, FLOOR_WEIGHT};
use crate::knn_transition::{knn_transition_counts, normalize_rows, KnnTransitionArgs};
use crate::lineage_partition::{partition_cells, PartitionArgs};

use matrix_util::utils::{partition_by_membership, quantile};
use std::collections::BTreeMap;

/// Quantile of each type's cell times taken as its initial time
pub const T_INIT_QUANTILE: f32 = 0.01;

#[derive(Debug, Clone)]
pub struct TransitionGraphArgs {
    pub partition: PartitionArgs,
    pub transition: KnnTransitionArgs,
    /// maximum number of parents kept per type before tree extraction
    pub n_par: usize,
    pub solver: ArborescenceArgs,
}

impl Default for TransitionGraphArgs {
    fn default() -> Self {
        Self {
            partition: PartitionArgs::default(),
            transition: KnnTransitionArgs::default(),
            n_par: 2,
            solver: ArborescenceArgs::default(),
        }
    }
}

/// Lineage structure over cell types
#[derive(Debug, Clone)]
pub struct TransitionGraph {
    /// pruned transition matrix (child type, parent type)
    pub transition: Mat,
    /// 0/1 tree matrix: `weights[(c, parent(c))] = 1`, roots point to themselves
    pub weights: Mat,
    /// parent of each type; a root is its own parent
    pub parents: Vec<usize>,
    /// lineage partition of each type
    pub partition: Vec<usize>,
    /// one root per partition
    pub roots: Vec<usize>,
    /// initial time of each type
    pub t_init: Vec<f32>,
}

impl TransitionGraph {
    /// Estimate the lineage tree from cell times and embedding
    ///
    /// * `time` - cell time (n)
    /// * `embed` - cell embedding (n x d)
    /// * `label` - cell type codes (n)
    /// * `n_type` - number of types
    /// * `cell_partition` - precomputed lineage partition of cells
    pub fn build(
        time: &[f32],
        embed: &Mat,
        label: &[usize],
        n_type: usize,
        cell_partition: Option<&[usize]>,
        args: &TransitionGraphArgs,
    ) -> anyhow::Result<Self> {
        let cell_partition = match cell_partition {
            Some(part) => {
                if part.len() != label.len() {
                    anyhow::bail!("{} partition entries for {} cells", part.len(), label.len());
                }
                part.to_vec()
            }
            None => partition_cells(embed, &args.partition)?,
        };

        let partition = type_partition(label, &cell_partition, n_type);
        let t_init = initial_times(time, label, n_type)?;

        let counts = knn_transition_counts(time, embed, label, n_type, &args.transition)?;
        let p_raw = normalize_rows(&counts);
        let mut transition = prune_transition(&p_raw, &t_init, args.n_par);

        let mut weights = Mat::zeros(n_type, n_type);
        let mut roots = vec![];

        let mut groups: Vec<(usize, Vec<usize>)> =
            partition_by_membership(&partition).into_iter().collect();
        groups.sort_by_key(|(k, _)| *k);

        for (k, members) in groups {
            let root_local = (0..members.len())
                .min_by(|&a, &b| t_init[members[a]].total_cmp(&t_init[members[b]]))
                .unwrap_or(0);
            let root = members[root_local];
            roots.push(root);

            let mut block = sub_block(&transition, &members);
            if !reaches_all(&block, root_local) {
                warn!(
                    "partition {}: pruned graph is disconnected, using unpruned transitions",
                    k
                );
                block = sub_block(&p_raw, &members);
                block.fill_diagonal(0.0);
                block = normalize_rows(&block);

                if !reaches_all(&block, root_local) {
                    warn!(
                        "partition {}: unpruned graph is disconnected, using a fully connected graph",
                        k
                    );
                    block.add_scalar_mut(FLOOR_WEIGHT);
                    block.fill_diagonal(0.0);
                    block = normalize_rows(&block);
                }

                // the root has no parent: same self weight as after pruning
                block.row_mut(root_local).fill(0.0);
                block[(root_local, root_local)] = 1.0;

                for (a, &ca) in members.iter().enumerate() {
                    for (b, &cb) in members.iter().enumerate() {
                        transition[(ca, cb)] = block[(a, b)];
                    }
                }
            }

            let log_block = block.map(|x| if x > 0.0 { x.ln() } else { f32::NEG_INFINITY });
            let tree = max_arborescence(&log_block, root_local, &args.solver)?;
            debug!(
                "partition {}: {} types, root {}, {} edges",
                k,
                members.len(),
                root,
                tree.num_edges()
            );

            for (a, p) in tree.parent.iter().enumerate() {
                let c = members[a];
                weights[(c, p.map_or(c, |b| members[b]))] = 1.0;
            }
        }

        let parents = row_argmax(&weights);
        info!(
            "transition graph: {} types, {} lineage(s)",
            n_type,
            roots.len()
        );

        Ok(Self {
            transition,
            weights,
            parents,
            partition,
            roots,
            t_init,
        })
    }

    /// Use a caller-supplied lineage `{parent: [children]}` as the tree
    ///
    /// Types that appear as nobody's child are roots; every child must
    /// have exactly one parent and the result must be acyclic.
    pub fn from_lineage(
        types: &CellTypes,
        lineage: &BTreeMap<String, Vec<String>>,
        time: &[f32],
        label: &[usize],
    ) -> anyhow::Result<Self> {
        let n_type = types.len();
        let code = |x: &str| {
            types
                .code(x)
                .ok_or(anyhow::anyhow!("lineage graph names unknown type `{}`", x))
        };

        let mut parent_of: Vec<Option<usize>> = vec![None; n_type];
        for (par, children) in lineage.iter() {
            let p = code(par.as_str())?;
            for child in children.iter() {
                let c = code(child.as_str())?;
                if c == p {
                    anyhow::bail!("type `{}` is listed as its own child", child);
                }
                if let Some(q) = parent_of[c] {
                    if q != p {
                        anyhow::bail!(
                            "type `{}` has two parents: `{}` and `{}`",
                            child,
                            types.name(q).unwrap_or("?"),
                            par
                        );
                    }
                }
                parent_of[c] = Some(p);
            }
        }

        let parents: Vec<usize> = (0..n_type).map(|c| parent_of[c].unwrap_or(c)).collect();
        let ret = Self::from_parents(&parents, time, label).map_err(|e| {
            anyhow::anyhow!("lineage graph from configuration: {}", e)
        })?;
        info!(
            "lineage graph from configuration: {} types, {} root(s)",
            n_type,
            ret.roots.len()
        );
        Ok(ret)
    }

    /// Tree given by the parent of each type (roots are their own parent)
    pub fn from_parents(parents: &[usize], time: &[f32], label: &[usize]) -> anyhow::Result<Self> {
        let n_type = parents.len();
        if let Some(&bad) = parents.iter().find(|&&p| p >= n_type) {
            anyhow::bail!("parent {} out of {} types", bad, n_type);
        }

        let mut root_of = vec![0; n_type];
        for c in 0..n_type {
            let mut v = c;
            let mut steps = 0;
            while parents[v] != v {
                v = parents[v];
                steps += 1;
                if steps > n_type {
                    anyhow::bail!("cycle through type {}", c);
                }
            }
            root_of[c] = v;
        }

        let roots: Vec<usize> = (0..n_type).filter(|&c| parents[c] == c).collect();
        let partition: Vec<usize> = root_of
            .iter()
            .map(|r| roots.iter().position(|x| x == r).unwrap_or(0))
            .collect();

        let mut weights = Mat::zeros(n_type, n_type);
        for (c, &p) in parents.iter().enumerate() {
            weights[(c, p)] = 1.0;
        }

        let t_init = initial_times(time, label, n_type)?;

        Ok(Self {
            transition: weights.clone(),
            weights,
            parents: parents.to_vec(),
            partition,
            roots,
            t_init,
        })
    }

    pub fn num_types(&self) -> usize {
        self.parents.len()
    }

    pub fn is_root(&self, c: usize) -> bool {
        self.parents[c] == c
    }

    /// `A[(c, a)] = 1` if `a` is `c` or one of its ancestors
    pub fn ancestor_matrix(&self) -> Mat {
        let n = self.num_types();
        let mut a = Mat::zeros(n, n);
        for c in 0..n {
            let mut v = c;
            a[(c, v)] = 1.0;
            for _ in 0..n {
                if self.is_root(v) {
                    break;
                }
                v = self.parents[v];
                a[(c, v)] = 1.0;
            }
        }
        a
    }
}

/// Plurality partition of each type's cells (ties: smaller id), compacted
fn type_partition(label: &[usize], cell_partition: &[usize], n_type: usize) -> Vec<usize> {
    let n_part = cell_partition.iter().max().map_or(0, |&k| k + 1);
    let mut freq = vec![vec![0usize; n_part]; n_type];
    for (&y, &k) in label.iter().zip(cell_partition.iter()) {
        freq[y][k] += 1;
    }

    let raw: Vec<usize> = freq
        .iter()
        .map(|f| {
            let mut best = 0;
            for (k, &x) in f.iter().enumerate() {
                if x > f[best] {
                    best = k;
                }
            }
            best
        })
        .collect();

    let mut ids: Vec<Option<usize>> = vec![None; n_part.max(1)];
    let mut next = 0;
    raw.iter()
        .map(|&k| {
            *ids[k].get_or_insert_with(|| {
                next += 1;
                next - 1
            })
        })
        .collect()
}

/// `q01` of each type's cell times
pub fn initial_times(time: &[f32], label: &[usize], n_type: usize) -> anyhow::Result<Vec<f32>> {
    let mut by_type: Vec<Vec<f32>> = vec![vec![]; n_type];
    for (&t, &y) in time.iter().zip(label.iter()) {
        by_type[y].push(t);
    }
    by_type
        .iter()
        .enumerate()
        .map(|(c, tt)| {
            quantile(tt, T_INIT_QUANTILE)
                .ok_or(anyhow::anyhow!("cell type {} has no cell with a valid time", c))
        })
        .collect()
}

fn sub_block(mat: &Mat, members: &[usize]) -> Mat {
    Mat::from_fn(members.len(), members.len(), |a, b| {
        mat[(members[a], members[b])]
    })
}

/// Every node reachable from `root` along positive off-diagonal
/// entries (`block[(i, j)] > 0` is an edge `j -> i`)
fn reaches_all(block: &Mat, root: usize) -> bool {
    let n = block.nrows();
    let mut seen = vec![false; n];
    let mut stack = vec![root];
    seen[root] = true;
    while let Some(j) = stack.pop() {
        for i in 0..n {
            if !seen[i] && i != j && block[(i, j)] > 0.0 {
                seen[i] = true;
                stack.push(i);
            }
        }
    }
    seen.into_iter().all(|x| x)
}

fn row_argmax(mat: &Mat) -> Vec<usize> {
    mat.row_iter()
        .map(|row| {
            let mut best = 0;
            for (j, &x) in row.iter().enumerate() {
                if x > row[best] {
                    best = j;
                }
            }
            best
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_prune::is_self_rooted;

    /// types 0 -> 1 -> 2 along time and the first embedding axis
    fn chain_cells(per_type: usize) -> (Vec<f32>, Mat, Vec<usize>) {
        let mut time = vec![];
        let mut label = vec![];
        for y in 0..3 {
            for c in 0..per_type {
                time.push(y as f32 + c as f32 / per_type as f32);
                label.push(y);
            }
        }
        let embed = Mat::from_fn(time.len(), 2, |i, j| if j == 0 { time[i] } else { 0.0 });
        (time, embed, label)
    }

    fn chain_args() -> TransitionGraphArgs {
        TransitionGraphArgs::default()
    }

    #[test]
    fn chain_of_three_types() -> anyhow::Result<()> {
        let (time, embed, label) = chain_cells(40);
        let part = vec![0; time.len()];
        let g = TransitionGraph::build(&time, &embed, &label, 3, Some(&part), &chain_args())?;

        assert_eq!(g.parents, vec![0, 0, 1]);
        assert_eq!(g.roots, vec![0]);
        assert!(g.transition[(1, 0)] > 0.99);
        assert!(g.transition[(2, 1)] > 0.99);
        assert_eq!(g.weights[(0, 0)], 1.0);
        assert_eq!(g.weights.sum(), 3.0);
        assert!(g.t_init[0] < g.t_init[1] && g.t_init[1] < g.t_init[2]);
        Ok(())
    }

    #[test]
    fn louvain_partition_keeps_one_lineage() -> anyhow::Result<()> {
        let (time, embed, label) = chain_cells(40);
        let g = TransitionGraph::build(&time, &embed, &label, 3, None, &chain_args())?;
        assert_eq!(g.partition, vec![0, 0, 0]);
        assert_eq!(g.parents, vec![0, 0, 1]);
        Ok(())
    }

    #[test]
    fn disconnected_block_falls_back() -> anyhow::Result<()> {
        // type 2 shares its time with type 0 and sits far away, so no
        // transition ever reaches it
        let (mut time, mut embed, label) = chain_cells(40);
        for i in 80..120 {
            time[i] -= 2.0;
            embed[(i, 1)] = 100.0;
        }
        let part = vec![0; time.len()];
        let mut args = chain_args();
        args.transition.k = 1;
        let g = TransitionGraph::build(&time, &embed, &label, 3, Some(&part), &args)?;

        assert_eq!(g.roots.len(), 1);
        assert_eq!(g.weights.sum(), 3.0);
        let root = g.roots[0];
        assert!(g.is_root(root));
        assert!((0..3).filter(|&c| g.is_root(c)).count() == 1);
        for c in 0..3 {
            let s: f32 = g.transition.row(c).sum();
            assert!((s - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn fallback_keeps_root_row_stochastic() -> anyhow::Result<()> {
        // types 0 and 1 start together; type 1 only descends from the
        // later type 2, so pruning isolates it and the unpruned
        // fallback applies while the root sees nothing but itself
        let cells: [(f32, f32, f32, usize); 8] = [
            (0.0, 0.0, 0.0, 0),
            (0.0, 0.0, 0.1, 0),
            (1.0, 0.0, 0.2, 0),
            (0.0, 10.0, 0.0, 1),
            (0.0, 10.0, 0.1, 1),
            (3.0, 20.0, 0.1, 1),
            (1.0, 1.0, 0.0, 2),
            (2.0, 20.0, 0.0, 2),
        ];
        let time: Vec<f32> = cells.iter().map(|c| c.0).collect();
        let embed = Mat::from_fn(cells.len(), 2, |i, j| if j == 0 { cells[i].1 } else { cells[i].2 });
        let label: Vec<usize> = cells.iter().map(|c| c.3).collect();
        let part = vec![0; cells.len()];

        let mut args = chain_args();
        args.transition.k = 1;
        args.transition.dt = (0.0, 1.0);
        args.transition.soft_assign = false;

        let counts = knn_transition_counts(&time, &embed, &label, 3, &args.transition)?;
        let pruned = prune_transition(&normalize_rows(&counts), &[0.0, 0.0, 1.01], args.n_par);
        assert!(is_self_rooted(&pruned, 1));

        let g = TransitionGraph::build(&time, &embed, &label, 3, Some(&part), &args)?;
        assert_eq!(g.roots, vec![0]);
        assert_eq!(g.parents, vec![0, 2, 0]);
        assert!(is_self_rooted(&g.transition, 0));
        for c in 0..3 {
            let s: f32 = g.transition.row(c).sum();
            assert!((s - 1.0).abs() < 1e-5, "row {} sums to {}", c, s);
        }
        Ok(())
    }

    #[test]
    fn preset_lineage() -> anyhow::Result<()> {
        let types = CellTypes::from_labels(&["stem", "a", "b", "c", "other"]);
        let label = vec![0, 1, 2, 3, 4];
        let time = vec![0.0, 1.0, 1.0, 2.0, 0.5];

        let mut lineage = BTreeMap::new();
        lineage.insert("stem".to_string(), vec!["a".to_string(), "b".to_string()]);
        lineage.insert("a".to_string(), vec!["c".to_string()]);

        let g = TransitionGraph::from_lineage(&types, &lineage, &time, &label)?;
        assert_eq!(g.parents, vec![0, 0, 0, 1, 4]);
        assert_eq!(g.roots, vec![0, 4]);
        assert_eq!(g.partition, vec![0, 0, 0, 0, 1]);

        let a = g.ancestor_matrix();
        assert_eq!(a.row(3).iter().copied().collect::<Vec<_>>(), vec![1.0, 1.0, 0.0, 1.0, 0.0]);
        assert_eq!(a[(4, 4)], 1.0);
        assert_eq!(a.row(4).sum(), 1.0);
        Ok(())
    }

    #[test]
    fn preset_lineage_rejects_bad_graphs() {
        let types = CellTypes::from_labels(&["x", "y", "z"]);
        let (time, label) = (vec![0.0, 1.0, 2.0], vec![0, 1, 2]);

        let mut two_parents = BTreeMap::new();
        two_parents.insert("x".to_string(), vec!["z".to_string()]);
        two_parents.insert("y".to_string(), vec!["z".to_string()]);
        assert!(TransitionGraph::from_lineage(&types, &two_parents, &time, &label).is_err());

        let mut cycle = BTreeMap::new();
        cycle.insert("x".to_string(), vec!["y".to_string()]);
        cycle.insert("y".to_string(), vec!["x".to_string()]);
        assert!(TransitionGraph::from_lineage(&types, &cycle, &time, &label).is_err());

        let mut unknown = BTreeMap::new();
        unknown.insert("x".to_string(), vec!["w".to_string()]);
        assert!(TransitionGraph::from_lineage(&types, &unknown, &time, &label).is_err());
    }

    #[test]
    fn plurality_partition_is_compacted() {
        let label = [0, 0, 0, 1, 1, 2];
        let part = [5, 5, 3, 3, 5, 3];
        // type 0 -> 5, type 1 ties -> 3, type 2 -> 3
        assert_eq!(type_partition(&label, &part, 3), vec![0, 1, 1]);
    }
}
