//! Branching ODE decoder.
//!
//! Every cell type switches on at `ts[c] = ts[parent(c)] + exp(offset[c])`
//! per gene and from there follows closed-form kinetics with its own
//! rates, starting where its parent's trajectory is at that moment.
//! A cell observed before its type switched on is explained by the
//! parent branch.

use crate::common::*;
use crate::init_params::KineticParams;
use crate::kinetics::{leaky, pred_su};

use candle_util::candle_core::{self, DType, Device, Tensor, Var};
use candle_util::candle_data_loader::{dmatrix_to_tensor, tensor_to_dmatrix};
use candle_util::candle_model_traits::BranchDecoderT;
use candle_util::candle_nn::{Init, VarBuilder, VarMap};

const LOG_ALPHA: &str = "log_alpha";
const LOG_BETA: &str = "log_beta";
const LOG_GAMMA: &str = "log_gamma";
const LOG_U0: &str = "log_u0";
const LOG_S0: &str = "log_s0";
const LOG_OFFSET: &str = "log_ts_offset";
const LOG_SCALING: &str = "log_scaling";
const LOG_SIGMA_U: &str = "log_sigma_u";
const LOG_SIGMA_S: &str = "log_sigma_s";
const TREE: &str = "w";

/// Which optional parameter groups receive gradient steps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrainableFlags {
    pub switch_time: bool,
    pub scaling: bool,
    pub std: bool,
}

pub struct BrodeDecoder {
    varmap: VarMap,
    device: Device,
    n_type: usize,
    n_gene: usize,
    flags: TrainableFlags,

    parents: Vec<usize>,
    depth: usize,
    parent_idx: Tensor,
    /// row of each type's root in `log_u0` / `log_s0`
    root_row: Tensor,
    ancestors: Tensor,

    log_alpha: Tensor,
    log_beta: Tensor,
    log_gamma: Tensor,
    log_u0: Tensor,
    log_s0: Tensor,
    log_offset: Tensor,
    log_scaling: Tensor,
    log_sigma_u: Tensor,
    log_sigma_s: Tensor,
}

impl BrodeDecoder {
    /// Decoder starting from `params` on the lineage tree `weights`
    /// (`weights[(c, parent(c))] = 1`, roots on the diagonal)
    pub fn new(
        params: &KineticParams,
        weights: &Mat,
        flags: TrainableFlags,
        device: &Device,
    ) -> anyhow::Result<Self> {
        let (n_type, n_gene) = (params.num_types(), params.num_genes());
        if weights.shape() != (n_type, n_type) {
            anyhow::bail!(
                "tree is {:?} but parameters cover {} types",
                weights.shape(),
                n_type
            );
        }

        let tree = LineageTree::from_weights(weights)?;
        let roots = tree.roots.clone();
        let dec = Self::allocate(n_type, n_gene, tree, flags, device)?;

        let ln = |x: f32| x.max(f32::MIN_POSITIVE).ln();
        dec.set_mat(LOG_ALPHA, &params.alpha.map(ln))?;
        dec.set_mat(LOG_BETA, &params.beta.map(ln))?;
        dec.set_mat(LOG_GAMMA, &params.gamma.map(ln))?;
        dec.set_mat(LOG_U0, &params.u0.select_rows(&roots).map(ln))?;
        dec.set_mat(LOG_S0, &params.s0.select_rows(&roots).map(ln))?;
        dec.set_mat(LOG_OFFSET, &params.ts_offset.map(ln))?;
        dec.set_vec(LOG_SCALING, &params.scaling.map(ln))?;
        dec.set_vec(LOG_SIGMA_U, &params.sigma_u.map(ln))?;
        dec.set_vec(LOG_SIGMA_S, &params.sigma_s.map(ln))?;
        dec.set_mat(TREE, weights)?;
        Ok(dec)
    }

    /// Restore a decoder saved by [`BrodeDecoder::save`]
    pub fn load(
        path: &str,
        n_type: usize,
        n_gene: usize,
        flags: TrainableFlags,
        device: &Device,
    ) -> anyhow::Result<Self> {
        let stored = candle_core::safetensors::load(path, &Device::Cpu)?;
        let get = |name: &str| {
            stored
                .get(name)
                .ok_or(anyhow::anyhow!("{} has no `{}`", path, name))
        };

        let (nt, ng) = get(LOG_ALPHA)?.dims2()?;
        if (nt, ng) != (n_type, n_gene) {
            anyhow::bail!(
                "checkpoint {} holds {} types x {} genes, but the data have {} x {}",
                path,
                nt,
                ng,
                n_type,
                n_gene
            );
        }

        let tree = LineageTree::from_weights(&tensor_to_dmatrix(get(TREE)?)?)?;
        let mut dec = Self::allocate(n_type, n_gene, tree, flags, device)?;
        dec.varmap.load(path)?;
        info!("restored decoder from {}", path);
        Ok(dec)
    }

    pub fn save(&self, path: &str) -> anyhow::Result<()> {
        matrix_util::common_io::mkdir(path)?;
        self.varmap.save(path)?;
        info!("saved decoder to {}", path);
        Ok(())
    }

    fn allocate(
        n_type: usize,
        n_gene: usize,
        tree: LineageTree,
        flags: TrainableFlags,
        device: &Device,
    ) -> anyhow::Result<Self> {
        if tree.parents.len() != n_type {
            anyhow::bail!(
                "lineage tree covers {} types, expected {}",
                tree.parents.len(),
                n_type
            );
        }
        let n_root = tree.roots.len();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let zero = Init::Const(0.0);

        let log_alpha = vb.get_with_hints((n_type, n_gene), LOG_ALPHA, zero)?;
        let log_beta = vb.get_with_hints((n_type, n_gene), LOG_BETA, zero)?;
        let log_gamma = vb.get_with_hints((n_type, n_gene), LOG_GAMMA, zero)?;
        let log_u0 = vb.get_with_hints((n_root, n_gene), LOG_U0, zero)?;
        let log_s0 = vb.get_with_hints((n_root, n_gene), LOG_S0, zero)?;
        let log_offset = vb.get_with_hints((n_type, n_gene), LOG_OFFSET, zero)?;
        let log_scaling = vb.get_with_hints(n_gene, LOG_SCALING, zero)?;
        let log_sigma_u = vb.get_with_hints(n_gene, LOG_SIGMA_U, zero)?;
        let log_sigma_s = vb.get_with_hints(n_gene, LOG_SIGMA_S, zero)?;
        vb.get_with_hints((n_type, n_type), TREE, zero)?;

        let index = |x: &[usize]| Tensor::from_iter(x.iter().map(|&i| i as u32), device);

        Ok(Self {
            device: device.clone(),
            n_type,
            n_gene,
            flags,
            parent_idx: index(&tree.parents)?,
            root_row: index(&tree.root_row)?,
            ancestors: dmatrix_to_tensor(&tree.ancestors, device)?,
            parents: tree.parents,
            depth: tree.depth,
            varmap,
            log_alpha,
            log_beta,
            log_gamma,
            log_u0,
            log_s0,
            log_offset,
            log_scaling,
            log_sigma_u,
            log_sigma_s,
        })
    }

    fn var(&self, name: &str) -> anyhow::Result<Var> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| anyhow::anyhow!("variable map: {}", e))?;
        data.get(name)
            .cloned()
            .ok_or(anyhow::anyhow!("no variable `{}`", name))
    }

    fn set_mat(&self, name: &str, value: &Mat) -> anyhow::Result<()> {
        self.var(name)?.set(&dmatrix_to_tensor(value, &self.device)?)?;
        Ok(())
    }

    fn set_vec(&self, name: &str, value: &DVec) -> anyhow::Result<()> {
        let x = Tensor::from_slice(value.as_slice(), value.len(), &self.device)?;
        self.var(name)?.set(&x)?;
        Ok(())
    }

    /// Variables updated by the optimizer
    ///
    /// Initial states exist for lineage roots only; every other branch
    /// starts from its parent's trajectory.
    pub fn trainable_vars(&self) -> anyhow::Result<Vec<Var>> {
        let mut names = vec![LOG_ALPHA, LOG_BETA, LOG_GAMMA, LOG_U0, LOG_S0];
        if self.flags.switch_time {
            names.push(LOG_OFFSET);
        }
        if self.flags.scaling {
            names.push(LOG_SCALING);
        }
        if self.flags.std {
            names.extend([LOG_SIGMA_U, LOG_SIGMA_S]);
        }
        names.into_iter().map(|x| self.var(x)).collect()
    }

    /// Noise levels `(σu, σs)` as tensors (g)
    pub fn sigma_tensors(&self) -> candle_core::Result<(Tensor, Tensor)> {
        Ok((self.log_sigma_u.exp()?, self.log_sigma_s.exp()?))
    }

    /// Overwrite the noise levels
    pub fn set_sigma(&self, sigma_u: &DVec, sigma_s: &DVec) -> anyhow::Result<()> {
        if sigma_u.len() != self.n_gene || sigma_s.len() != self.n_gene {
            anyhow::bail!("{} noise levels for {} genes", sigma_u.len(), self.n_gene);
        }
        self.set_vec(LOG_SIGMA_U, &sigma_u.map(|x| x.ln()))?;
        self.set_vec(LOG_SIGMA_S, &sigma_s.map(|x| x.ln()))
    }

    /// Switch-on time of each type and gene (type x gene)
    fn switch_time_tensor(&self) -> candle_core::Result<Tensor> {
        self.ancestors.matmul(&self.log_offset.exp()?)
    }

    /// State of each branch at its switch time, propagated from the roots
    fn branch_states(
        &self,
        ts: &Tensor,
        rates: &[Tensor; 3],
        neg_slope: f64,
    ) -> candle_core::Result<(Tensor, Tensor)> {
        let par = &self.parent_idx;
        let tau = leaky(&ts.sub(&ts.index_select(par, 0)?)?, neg_slope)?;
        let [a_p, b_p, g_p] = [
            rates[0].index_select(par, 0)?,
            rates[1].index_select(par, 0)?,
            rates[2].index_select(par, 0)?,
        ];

        let mut u_init = self.log_u0.exp()?.index_select(&self.root_row, 0)?;
        let mut s_init = self.log_s0.exp()?.index_select(&self.root_row, 0)?;
        for _ in 0..self.depth {
            let (u, s) = pred_su(
                &tau,
                &u_init.index_select(par, 0)?,
                &s_init.index_select(par, 0)?,
                &a_p,
                &b_p,
                &g_p,
            )?;
            u_init = u;
            s_init = s;
        }
        Ok((u_init, s_init))
    }

    pub fn parents(&self) -> &[usize] {
        &self.parents
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn flags(&self) -> TrainableFlags {
        self.flags
    }

    pub fn alpha(&self) -> anyhow::Result<Mat> {
        Ok(tensor_to_dmatrix(&self.log_alpha.exp()?)?)
    }

    pub fn beta(&self) -> anyhow::Result<Mat> {
        Ok(tensor_to_dmatrix(&self.log_beta.exp()?)?)
    }

    pub fn gamma(&self) -> anyhow::Result<Mat> {
        Ok(tensor_to_dmatrix(&self.log_gamma.exp()?)?)
    }

    /// Unspliced starting state of each branch (type x gene)
    pub fn u0(&self) -> anyhow::Result<Mat> {
        Ok(self.initial_states()?.0)
    }

    pub fn s0(&self) -> anyhow::Result<Mat> {
        Ok(self.initial_states()?.1)
    }

    /// Switch-on times (type x gene)
    pub fn switch_times(&self) -> anyhow::Result<Mat> {
        Ok(tensor_to_dmatrix(&self.switch_time_tensor()?)?)
    }

    /// Branch starting states `(û0, ŝ0)` (type x gene), unscaled
    pub fn initial_states(&self) -> anyhow::Result<(Mat, Mat)> {
        let rates = [
            self.log_alpha.exp()?,
            self.log_beta.exp()?,
            self.log_gamma.exp()?,
        ];
        let (u, s) = self.branch_states(&self.switch_time_tensor()?, &rates, 0.0)?;
        Ok((tensor_to_dmatrix(&u)?, tensor_to_dmatrix(&s)?))
    }

    pub fn scaling(&self) -> anyhow::Result<DVec> {
        to_dvec(&self.log_scaling.exp()?)
    }

    pub fn sigma_u(&self) -> anyhow::Result<DVec> {
        to_dvec(&self.log_sigma_u.exp()?)
    }

    pub fn sigma_s(&self) -> anyhow::Result<DVec> {
        to_dvec(&self.log_sigma_s.exp()?)
    }
}

/// Parent structure of a 0/1 tree matrix
struct LineageTree {
    parents: Vec<usize>,
    roots: Vec<usize>,
    root_row: Vec<usize>,
    /// `ancestors[(c, a)] = 1` if `a` is `c` or above it
    ancestors: Mat,
    depth: usize,
}

impl LineageTree {
    /// Parents by row argmax; rejects cycles
    fn from_weights(weights: &Mat) -> anyhow::Result<Self> {
        let n = weights.nrows();
        if weights.ncols() != n {
            anyhow::bail!("tree matrix is {:?}", weights.shape());
        }

        let parents: Vec<usize> = weights
            .row_iter()
            .map(|row| {
                let mut best = 0;
                for (j, &x) in row.iter().enumerate() {
                    if x > row[best] {
                        best = j;
                    }
                }
                best
            })
            .collect();

        let roots: Vec<usize> = (0..n).filter(|&c| parents[c] == c).collect();
        let mut root_row = vec![0; n];
        let mut ancestors = Mat::zeros(n, n);
        let mut depth = 0;
        for c in 0..n {
            let mut v = c;
            ancestors[(c, v)] = 1.0;
            let mut steps = 0;
            while parents[v] != v {
                v = parents[v];
                ancestors[(c, v)] = 1.0;
                steps += 1;
                if steps > n {
                    anyhow::bail!("lineage tree has a cycle through type {}", c);
                }
            }
            root_row[c] = roots.iter().position(|&r| r == v).unwrap_or(0);
            depth = depth.max(steps);
        }

        Ok(Self {
            parents,
            roots,
            root_row,
            ancestors,
            depth,
        })
    }
}

fn to_dvec(x: &Tensor) -> anyhow::Result<DVec> {
    Ok(DVec::from_vec(x.to_device(&Device::Cpu)?.to_vec1::<f32>()?))
}

impl BranchDecoderT for BrodeDecoder {
    fn forward_t(
        &self,
        t_n1: &Tensor,
        y_n: &Tensor,
        neg_slope: f64,
    ) -> candle_core::Result<(Tensor, Tensor)> {
        let rates = [
            self.log_alpha.exp()?,
            self.log_beta.exp()?,
            self.log_gamma.exp()?,
        ];
        let ts = self.switch_time_tensor()?;
        let (u_init, s_init) = self.branch_states(&ts, &rates, neg_slope)?;

        let par_n = self.parent_idx.index_select(y_n, 0)?;
        let own = |x: &Tensor| x.index_select(y_n, 0);
        let parent = |x: &Tensor| x.index_select(&par_n, 0);

        // which cells have entered their own branch (n x g)
        let ts_own = own(&ts)?;
        let ts_par = parent(&ts)?;
        let on = t_n1.broadcast_ge(&ts_own)?;

        let tau = on.where_cond(&t_n1.broadcast_sub(&ts_own)?, &t_n1.broadcast_sub(&ts_par)?)?;
        let tau = leaky(&tau, neg_slope)?;

        let pick = |x: &Tensor| -> candle_core::Result<Tensor> {
            on.where_cond(&own(x)?, &parent(x)?)
        };

        let (u, s) = pred_su(
            &tau,
            &pick(&u_init)?,
            &pick(&s_init)?,
            &pick(&rates[0])?,
            &pick(&rates[1])?,
            &pick(&rates[2])?,
        )?;

        let uhat = leaky(&u, neg_slope)?.broadcast_mul(&self.log_scaling.exp()?)?;
        let shat = leaky(&s, neg_slope)?;
        Ok((uhat, shat))
    }

    fn dim_obs(&self) -> usize {
        self.n_gene
    }

    fn num_types(&self) -> usize {
        self.n_type
    }
}
