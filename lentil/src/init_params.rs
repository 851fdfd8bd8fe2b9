//! Starting values of the kinetic parameters from a per-type
//! steady-state fit.

use crate::common::*;

use matrix_util::utils::{partition_by_membership, quantile};
use rand::Rng;
use rayon::prelude::*;

const MIN_RATE: f32 = 1e-2;
const MAX_RATE: f32 = 1e2;
const MIN_LEVEL: f32 = 1e-4;
const MIN_SD: f32 = 1e-3;

/// Per-gene table supplied by the caller
#[derive(Debug, Clone)]
pub struct GeneParams {
    pub scaling: DVec,
    pub sigma_u: DVec,
    pub sigma_s: DVec,
}

#[derive(Debug, Clone)]
pub struct SteadyStateArgs {
    /// percentile (0-100) of `u + s` marking steady-state cells
    pub percentile: f32,
    /// fraction of each type's earliest cells averaged into `(u0, s0)`
    pub early_frac: f32,
    /// upper bound of the random jitter added to switch-time offsets
    pub offset_jitter: f32,
}

impl Default for SteadyStateArgs {
    fn default() -> Self {
        Self {
            percentile: 98.0,
            early_frac: 0.1,
            offset_jitter: 0.01,
        }
    }
}

/// Positive kinetic parameters (not yet in log space)
#[derive(Debug, Clone)]
pub struct KineticParams {
    /// type x gene
    pub alpha: Mat,
    pub beta: Mat,
    pub gamma: Mat,
    pub u0: Mat,
    pub s0: Mat,
    /// switch-time increments over the parent type (type x gene)
    pub ts_offset: Mat,
    /// gene
    pub scaling: DVec,
    pub sigma_u: DVec,
    pub sigma_s: DVec,
}

impl KineticParams {
    /// Fit starting values on training cells
    ///
    /// * `u`, `s` - observed unspliced and spliced (cells x genes)
    /// * `time` - cell time
    /// * `label` - cell type codes
    /// * `parents` - parent of each type (roots are their own parent)
    /// * `t_init` - initial time of each type
    /// * `genes` - caller-supplied scaling and noise levels
    #[allow(clippy::too_many_arguments)]
    pub fn steady_state<R: Rng + ?Sized>(
        u: &Mat,
        s: &Mat,
        time: &[f32],
        label: &[usize],
        parents: &[usize],
        t_init: &[f32],
        genes: Option<&GeneParams>,
        args: &SteadyStateArgs,
        rng: &mut R,
    ) -> anyhow::Result<Self> {
        let (nn, n_gene) = u.shape();
        let n_type = parents.len();
        if s.shape() != u.shape() || time.len() != nn || label.len() != nn {
            anyhow::bail!(
                "u {:?}, s {:?}, {} times, {} labels",
                u.shape(),
                s.shape(),
                time.len(),
                label.len()
            );
        }
        if nn == 0 {
            anyhow::bail!("no cells to initialize from");
        }

        let (scaling, sigma_u, sigma_s) = match genes {
            Some(g) => {
                if g.scaling.len() != n_gene {
                    anyhow::bail!("gene table has {} rows for {} genes", g.scaling.len(), n_gene);
                }
                (g.scaling.clone(), g.sigma_u.clone(), g.sigma_s.clone())
            }
            None => {
                let sd_u = column_sd(u);
                let sd_s = column_sd(s);
                let scaling = DVec::from_iterator(
                    n_gene,
                    sd_u.iter()
                        .zip(sd_s.iter())
                        .map(|(&a, &b)| if a > 0.0 && b > 0.0 { a / b } else { 1.0 }),
                );
                (
                    scaling,
                    sd_u.map(|x| x.max(MIN_SD)),
                    sd_s.map(|x| x.max(MIN_SD)),
                )
            }
        };

        let mut u_scaled = u.clone();
        for (g, mut u_g) in u_scaled.column_iter_mut().enumerate() {
            u_g /= scaling[g];
        }

        let everyone: Vec<usize> = (0..nn).collect();
        let by_type = partition_by_membership(label);
        let cells_of: Vec<Vec<usize>> = (0..n_type)
            .map(|c| by_type.get(&c).cloned().unwrap_or_else(|| everyone.clone()))
            .collect();

        let early_of: Vec<Vec<usize>> = cells_of
            .iter()
            .map(|cells| earliest_cells(cells, time, args.early_frac))
            .collect();

        let q = args.percentile / 100.0;
        let per_gene: Vec<Vec<[f32; 5]>> = (0..n_gene)
            .into_par_iter()
            .map(|g| {
                let u_g = u_scaled.column(g);
                let s_g = s.column(g);
                (0..n_type)
                    .map(|c| fit_one(u_g.as_slice(), s_g.as_slice(), &cells_of[c], &early_of[c], q))
                    .collect()
            })
            .collect();

        let pick = |k: usize| Mat::from_fn(n_type, n_gene, |c, g| per_gene[g][c][k]);

        let ts_offset = Mat::from_fn(n_type, n_gene, |c, _| {
            let p = parents[c];
            let base = if p == c {
                t_init[c]
            } else {
                t_init[c] - t_init[p]
            };
            base.max(MIN_LEVEL) + rng.random::<f32>() * args.offset_jitter
        });

        info!(
            "initialized kinetics of {} types x {} genes from {} cells",
            n_type, n_gene, nn
        );

        Ok(Self {
            alpha: pick(0),
            beta: pick(1),
            gamma: pick(2),
            u0: pick(3),
            s0: pick(4),
            ts_offset,
            scaling,
            sigma_u,
            sigma_s,
        })
    }

    pub fn num_types(&self) -> usize {
        self.alpha.nrows()
    }

    pub fn num_genes(&self) -> usize {
        self.alpha.ncols()
    }
}

/// `[α, β, γ, u0, s0]` of one gene in one type with `β = 1`
///
/// At steady state `u = α/β` and `γ s = β u`, so `γ` is the slope of
/// `u` on `s` through the origin among the top cells.
fn fit_one(u: &[f32], s: &[f32], cells: &[usize], early: &[usize], q: f32) -> [f32; 5] {
    let total: Vec<f32> = cells.iter().map(|&i| u[i] + s[i]).collect();
    let cutoff = quantile(&total, q).unwrap_or(0.0);
    let top: Vec<usize> = cells
        .iter()
        .zip(total.iter())
        .filter(|&(_, &x)| x >= cutoff)
        .map(|(&i, _)| i)
        .collect();

    let (us, ss) = top
        .iter()
        .fold((0_f32, 0_f32), |(a, b), &i| (a + u[i] * s[i], b + s[i] * s[i]));
    let gamma = if ss > 0.0 { us / ss } else { 1.0 };

    let u_top = top.iter().map(|&i| u[i]).sum::<f32>() / top.len().max(1) as f32;
    let alpha = u_top.max(MIN_LEVEL);

    let ne = early.len().max(1) as f32;
    let u0 = early.iter().map(|&i| u[i]).sum::<f32>() / ne;
    let s0 = early.iter().map(|&i| s[i]).sum::<f32>() / ne;

    [
        alpha,
        1.0,
        gamma.clamp(MIN_RATE, MAX_RATE),
        u0.max(MIN_LEVEL),
        s0.max(MIN_LEVEL),
    ]
}

fn earliest_cells(cells: &[usize], time: &[f32], frac: f32) -> Vec<usize> {
    let mut sorted = cells.to_vec();
    sorted.sort_by(|&a, &b| time[a].total_cmp(&time[b]));
    let n_early = ((cells.len() as f32 * frac).ceil() as usize).clamp(1, cells.len().max(1));
    sorted.truncate(n_early);
    sorted
}

fn column_sd(x: &Mat) -> DVec {
    let nn = (x.nrows().max(2) - 1) as f32;
    DVec::from_iterator(
        x.ncols(),
        x.column_iter().map(|x_j| {
            let mu = x_j.mean();
            (x_j.map(|v| (v - mu) * (v - mu)).sum() / nn).sqrt()
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn steady_state_ratio_is_recovered() -> anyhow::Result<()> {
        // type 0 ramps up towards u = 2, s = 4 (γ/β = 0.5)
        let nn = 100;
        let time: Vec<f32> = (0..nn).map(|i| i as f32 / nn as f32).collect();
        let u = Mat::from_fn(nn, 1, |i, _| 2.0 * time[i]);
        let s = Mat::from_fn(nn, 1, |i, _| 4.0 * time[i]);
        let label = vec![0; nn];

        let genes = GeneParams {
            scaling: DVec::from_element(1, 1.0),
            sigma_u: DVec::from_element(1, 0.1),
            sigma_s: DVec::from_element(1, 0.1),
        };
        let mut rng = StdRng::seed_from_u64(0);
        let p = KineticParams::steady_state(
            &u,
            &s,
            &time,
            &label,
            &[0],
            &[0.0],
            Some(&genes),
            &SteadyStateArgs::default(),
            &mut rng,
        )?;

        assert_abs_diff_eq!(p.gamma[(0, 0)], 0.5, epsilon = 1e-4);
        assert_eq!(p.beta[(0, 0)], 1.0);
        assert!(p.alpha[(0, 0)] > 1.9);
        assert!(p.u0[(0, 0)] < 0.2);
        assert!(p.ts_offset[(0, 0)] > 0.0);
        Ok(())
    }

    #[test]
    fn all_parameters_are_positive() -> anyhow::Result<()> {
        let nn = 60;
        let time: Vec<f32> = (0..nn).map(|i| i as f32).collect();
        let u = Mat::from_fn(nn, 3, |i, g| if g == 2 { 0.0 } else { (i % 7) as f32 });
        let s = Mat::from_fn(nn, 3, |i, g| ((i + g) % 5) as f32);
        let label: Vec<usize> = (0..nn).map(|i| i / 20).collect();
        let t_init = [0.0, 20.0, 40.0];
        // type 3 has no cells
        let parents = [0, 0, 1, 2];

        let mut rng = StdRng::seed_from_u64(1);
        let p = KineticParams::steady_state(
            &u,
            &s,
            &time,
            &label,
            &parents,
            &[t_init[0], t_init[1], t_init[2], 41.0],
            None,
            &SteadyStateArgs::default(),
            &mut rng,
        )?;

        assert_eq!((p.num_types(), p.num_genes()), (4, 3));
        for m in [&p.alpha, &p.beta, &p.gamma, &p.u0, &p.s0, &p.ts_offset] {
            assert!(m.iter().all(|&x| x > 0.0 && x.is_finite()));
        }
        for v in [&p.scaling, &p.sigma_u, &p.sigma_s] {
            assert!(v.iter().all(|&x| x > 0.0 && x.is_finite()));
        }
        // switch-time increments follow the initial times
        assert!(p.ts_offset[(1, 0)] >= 20.0);
        Ok(())
    }
}
