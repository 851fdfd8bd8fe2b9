//! Maximum-weight spanning arborescence (Chu–Liu/Edmonds).
//!
//! `graph[(i, j)]` holds the log-weight of the edge `j -> i` (parent
//! `j`, child `i`); non-finite entries mean no edge. Cycles found among
//! the greedy best parents are contracted into a super-node, solved on
//! a freshly built smaller graph, then expanded back. Every recursion
//! level owns its matrix and index remap.

use crate::common::*;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;

type Dense = Vec<Vec<f64>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArborescenceError {
    NotSquare { nrows: usize, ncols: usize },
    RootOutOfRange { root: usize, n: usize },
    NoIncomingEdge(usize),
    Unreachable(usize),
}

impl fmt::Display for ArborescenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSquare { nrows, ncols } => {
                write!(f, "graph must be square, got {} x {}", nrows, ncols)
            }
            Self::RootOutOfRange { root, n } => {
                write!(f, "root {} out of range for {} nodes", root, n)
            }
            Self::NoIncomingEdge(v) => write!(f, "node {} has no incoming edge", v),
            Self::Unreachable(v) => write!(f, "node {} is not reachable from the root", v),
        }
    }
}

impl std::error::Error for ArborescenceError {}

#[derive(Debug, Clone)]
pub struct ArborescenceArgs {
    /// attach nodes without a usable incoming edge to a random parent
    /// instead of failing
    pub permissive: bool,
    /// seed for the permissive random parents
    pub seed: u64,
}

impl Default for ArborescenceArgs {
    fn default() -> Self {
        Self {
            permissive: false,
            seed: 42,
        }
    }
}

/// A directed spanning tree: `parent[root] == None`, every other node
/// has exactly one parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arborescence {
    pub root: usize,
    pub parent: Vec<Option<usize>>,
}

impl Arborescence {
    pub fn num_nodes(&self) -> usize {
        self.parent.len()
    }

    pub fn num_edges(&self) -> usize {
        self.parent.iter().flatten().count()
    }

    /// 0/1 matrix with `adj[(i, parent(i))] = 1` and `adj[(root, root)] = 1`
    pub fn to_adjacency(&self) -> Mat {
        let n = self.num_nodes();
        let mut adj = Mat::zeros(n, n);
        for (i, p) in self.parent.iter().enumerate() {
            adj[(i, p.unwrap_or(i))] = 1.0;
        }
        adj
    }

    pub fn children(&self, node: usize) -> Vec<usize> {
        (0..self.num_nodes())
            .filter(|&i| self.parent[i] == Some(node))
            .collect()
    }

    /// Sum of `graph` over the tree edges
    pub fn total_weight(&self, graph: &Mat) -> f32 {
        self.parent
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.map(|j| graph[(i, j)]))
            .sum()
    }

    /// Walking up from any node never revisits a node
    pub fn is_acyclic(&self) -> bool {
        let n = self.num_nodes();
        (0..n).all(|i| {
            let mut v = i;
            for _ in 0..=n {
                match self.parent[v] {
                    Some(p) => v = p,
                    None => return true,
                }
            }
            false
        })
    }

    /// Every node walks up to the root, and only the root has no parent
    pub fn reaches_all(&self) -> bool {
        let n = self.num_nodes();
        self.root < n
            && self.parent[self.root].is_none()
            && self.num_edges() + 1 == n
            && self.is_acyclic()
    }
}

/// Find the maximum-weight arborescence of `graph` rooted at `root`
///
/// * `graph` - `graph[(i, j)]` = log-weight of `j -> i`
/// * `root` - node without a parent
/// * `args` - strict or permissive handling of unsupported nodes
pub fn max_arborescence(
    graph: &Mat,
    root: usize,
    args: &ArborescenceArgs,
) -> Result<Arborescence, ArborescenceError> {
    let n = graph.nrows();
    if graph.ncols() != n {
        return Err(ArborescenceError::NotSquare {
            nrows: n,
            ncols: graph.ncols(),
        });
    }
    if root >= n {
        return Err(ArborescenceError::RootOutOfRange { root, n });
    }

    let mut g: Dense = (0..n)
        .map(|v| {
            (0..n)
                .map(|u| {
                    let w = graph[(v, u)] as f64;
                    if u == v || v == root || !w.is_finite() {
                        f64::NEG_INFINITY
                    } else {
                        w
                    }
                })
                .collect()
        })
        .collect();

    let lowest = g
        .iter()
        .flatten()
        .copied()
        .filter(|w| w.is_finite())
        .fold(0_f64, f64::min);
    let penalty = lowest - 1.0;

    let mut rng = StdRng::seed_from_u64(args.seed);

    for v in (0..n).filter(|&v| v != root) {
        if g[v].iter().any(|w| w.is_finite()) {
            continue;
        }
        if !args.permissive {
            return Err(ArborescenceError::NoIncomingEdge(v));
        }
        let u = (v + rng.random_range(1..n)) % n;
        warn!("node {} has no incoming edge, attaching it to node {}", v, u);
        g[v][u] = penalty;
    }

    loop {
        let seen = reachable_from(&g, root);
        let Some(v) = (0..n).find(|&v| !seen[v]) else {
            break;
        };
        if !args.permissive {
            return Err(ArborescenceError::Unreachable(v));
        }
        let pool: Vec<usize> = (0..n).filter(|&u| seen[u]).collect();
        let u = pool[rng.random_range(0..pool.len())];
        warn!("node {} is unreachable, attaching it to node {}", v, u);
        g[v][u] = penalty;
    }

    let best = solve(&g, root)?;

    Ok(Arborescence {
        root,
        parent: (0..n)
            .map(|v| if v == root { None } else { Some(best[v]) })
            .collect(),
    })
}

fn reachable_from(g: &Dense, root: usize) -> Vec<bool> {
    let n = g.len();
    let mut seen = vec![false; n];
    let mut stack = vec![root];
    seen[root] = true;
    while let Some(u) = stack.pop() {
        for v in 0..n {
            if !seen[v] && g[v][u].is_finite() {
                seen[v] = true;
                stack.push(v);
            }
        }
    }
    seen
}

/// Greedy best parent of every node; `best[root] == root`
fn best_parents(g: &Dense, root: usize) -> Result<Vec<usize>, ArborescenceError> {
    let n = g.len();
    let mut best = vec![root; n];
    for v in (0..n).filter(|&v| v != root) {
        let mut arg: Option<usize> = None;
        for u in (0..n).filter(|&u| u != v && g[v][u].is_finite()) {
            if arg.map_or(true, |a| g[v][u] > g[v][a]) {
                arg = Some(u);
            }
        }
        best[v] = arg.ok_or(ArborescenceError::Unreachable(v))?;
    }
    Ok(best)
}

/// First cycle of the functional graph `v -> best[v]`
fn find_cycle(best: &[usize], root: usize) -> Option<Vec<usize>> {
    const NEW: u8 = 0;
    const ON_PATH: u8 = 1;
    const DONE: u8 = 2;

    let n = best.len();
    let mut state = vec![NEW; n];
    state[root] = DONE;

    for s in 0..n {
        let mut path = vec![];
        let mut v = s;
        while state[v] == NEW {
            state[v] = ON_PATH;
            path.push(v);
            v = best[v];
        }
        if state[v] == ON_PATH {
            let mut cycle = vec![v];
            let mut x = best[v];
            while x != v {
                cycle.push(x);
                x = best[x];
            }
            return Some(cycle);
        }
        for x in path {
            state[x] = DONE;
        }
    }
    None
}

fn solve(g: &Dense, root: usize) -> Result<Vec<usize>, ArborescenceError> {
    let n = g.len();
    let best = best_parents(g, root)?;

    let Some(cycle) = find_cycle(&best, root) else {
        return Ok(best);
    };

    let mut in_cycle = vec![false; n];
    for &v in cycle.iter() {
        in_cycle[v] = true;
    }
    let outside: Vec<usize> = (0..n).filter(|&v| !in_cycle[v]).collect();

    // old index -> contracted index
    let sup = outside.len();
    let mut remap = vec![sup; n];
    for (k, &v) in outside.iter().enumerate() {
        remap[v] = k;
    }

    let m = sup + 1;
    let mut h: Dense = vec![vec![f64::NEG_INFINITY; m]; m];
    let mut enter_at: Vec<Option<usize>> = vec![None; n];
    let mut leave_from: Vec<Option<usize>> = vec![None; n];

    for &v in outside.iter() {
        for &u in outside.iter() {
            h[remap[v]][remap[u]] = g[v][u];
        }
    }

    for &x in outside.iter() {
        // x -> cycle, scored by how much it beats the cycle edge it replaces
        for &v in cycle.iter() {
            let w = g[v][x];
            if !w.is_finite() {
                continue;
            }
            let reduced = w - g[v][best[v]];
            if enter_at[x].is_none() || reduced > h[sup][remap[x]] {
                h[sup][remap[x]] = reduced;
                enter_at[x] = Some(v);
            }
        }
        // cycle -> x
        for &v in cycle.iter() {
            let w = g[x][v];
            if w.is_finite() && (leave_from[x].is_none() || w > h[remap[x]][sup]) {
                h[remap[x]][sup] = w;
                leave_from[x] = Some(v);
            }
        }
    }

    let sub = solve(&h, remap[root])?;

    let mut parent = best;
    for &v in outside.iter().filter(|&&v| v != root) {
        let p = sub[remap[v]];
        parent[v] = if p == sup {
            leave_from[v].ok_or(ArborescenceError::Unreachable(v))?
        } else {
            outside[p]
        };
    }

    // break the cycle where the entering edge lands
    let entry = outside[sub[sup]];
    let target = enter_at[entry].ok_or(ArborescenceError::Unreachable(cycle[0]))?;
    parent[target] = entry;

    Ok(parent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const NO: f32 = f32::NEG_INFINITY;

    fn brute_force(g: &Mat, root: usize) -> f32 {
        let n = g.nrows();
        let others: Vec<usize> = (0..n).filter(|&v| v != root).collect();
        let mut best = NO;
        for code in 0..n.pow(others.len() as u32) {
            let mut parent = vec![None; n];
            let mut c = code;
            for &v in others.iter() {
                parent[v] = Some(c % n);
                c /= n;
            }
            let tree = Arborescence { root, parent };
            if !tree.reaches_all() {
                continue;
            }
            let w = tree.total_weight(g);
            if w.is_finite() && w > best {
                best = w;
            }
        }
        best
    }

    fn random_graph(seed: u64, n: usize, root: usize) -> Mat {
        let mut rng = StdRng::seed_from_u64(seed);
        Mat::from_fn(n, n, |i, j| {
            if i == j || (j != root && rng.random_bool(0.3)) {
                NO
            } else {
                rng.random_range(0.01_f32..1.0).ln()
            }
        })
    }

    #[test]
    fn chain_is_recovered() -> anyhow::Result<()> {
        let g = Mat::from_row_slice(
            3,
            3,
            &[NO, NO, NO, 0.0, NO, -3.0, -3.0, 0.0, NO],
        );
        let tree = max_arborescence(&g, 0, &ArborescenceArgs::default())?;
        assert_eq!(tree.parent, vec![None, Some(0), Some(1)]);

        let adj = tree.to_adjacency();
        assert_eq!(adj[(0, 0)], 1.0);
        assert_eq!(adj[(1, 0)], 1.0);
        assert_eq!(adj[(2, 1)], 1.0);
        assert_eq!(adj.sum(), 3.0);
        Ok(())
    }

    #[test]
    fn three_cycle_is_contracted() -> anyhow::Result<()> {
        // root 0 feeds every node weakly; 1 -> 2 -> 3 -> 1 strongly
        let w = -0.1;
        let r = -2.0;
        let g = Mat::from_row_slice(
            4,
            4,
            &[
                NO, NO, NO, NO, //
                r, NO, NO, w, //
                r, w, NO, NO, //
                r, NO, w, NO,
            ],
        );
        let tree = max_arborescence(&g, 0, &ArborescenceArgs::default())?;

        assert_eq!(tree.num_edges(), 3);
        assert!(tree.is_acyclic());
        assert!(tree.reaches_all());
        assert_eq!(tree.children(0).len(), 1);
        assert_abs_diff_eq!(tree.total_weight(&g), r + 2.0 * w, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn matches_brute_force_on_small_graphs() -> anyhow::Result<()> {
        for seed in 0..30 {
            let n = 3 + (seed as usize % 3);
            let root = seed as usize % n;
            let g = random_graph(seed, n, root);
            let tree = max_arborescence(&g, root, &ArborescenceArgs::default())?;

            assert!(tree.reaches_all());
            assert_eq!(tree.num_edges(), n - 1);
            assert!(tree.total_weight(&g).is_finite());
            assert_abs_diff_eq!(tree.total_weight(&g), brute_force(&g, root), epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn repeated_runs_agree() -> anyhow::Result<()> {
        let g = random_graph(7, 6, 2);
        let a = max_arborescence(&g, 2, &ArborescenceArgs::default())?;
        let b = max_arborescence(&g, 2, &ArborescenceArgs::default())?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn strict_mode_rejects_unsupported_nodes() {
        // node 2 has no incoming edge
        let g = Mat::from_row_slice(3, 3, &[NO, NO, NO, 0.0, NO, NO, NO, NO, NO]);
        let strict = max_arborescence(&g, 0, &ArborescenceArgs::default());
        assert_eq!(strict, Err(ArborescenceError::NoIncomingEdge(2)));

        let args = ArborescenceArgs {
            permissive: true,
            seed: 1,
        };
        let loose = max_arborescence(&g, 0, &args).unwrap();
        assert!(loose.reaches_all());
        assert_eq!(loose.parent[1], Some(0));
        assert_eq!(loose, max_arborescence(&g, 0, &args).unwrap());
    }

    #[test]
    fn strict_mode_rejects_detached_cycles() {
        // 1 and 2 only point at each other
        let g = Mat::from_row_slice(3, 3, &[NO, NO, NO, NO, NO, 0.0, NO, 0.0, NO]);
        let strict = max_arborescence(&g, 0, &ArborescenceArgs::default());
        assert!(matches!(strict, Err(ArborescenceError::Unreachable(_))));

        let args = ArborescenceArgs {
            permissive: true,
            seed: 3,
        };
        let loose = max_arborescence(&g, 0, &args).unwrap();
        assert!(loose.reaches_all());
        assert_eq!(loose.num_edges(), 2);
    }

    #[test]
    fn bad_inputs() {
        let g = Mat::zeros(2, 3);
        assert!(matches!(
            max_arborescence(&g, 0, &ArborescenceArgs::default()),
            Err(ArborescenceError::NotSquare { .. })
        ));
        let g = Mat::zeros(2, 2);
        assert_eq!(
            max_arborescence(&g, 5, &ArborescenceArgs::default()),
            Err(ArborescenceError::RootOutOfRange { root: 5, n: 2 })
        );
        let single = max_arborescence(&Mat::zeros(1, 1), 0, &ArborescenceArgs::default()).unwrap();
        assert_eq!(single.num_edges(), 0);
        assert!(single.reaches_all());
    }
}
