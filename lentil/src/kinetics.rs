//! Closed-form transcription, splicing and degradation kinetics.

use candle_util::candle_core::{Result, Tensor};

/// Below this `|γ - β|` the spliced solution switches to its limit
pub const NEAR_EQUAL_RATES: f64 = 1e-3;

/// `relu(x) - neg_slope * relu(-x)`
pub fn leaky(x: &Tensor, neg_slope: f64) -> Result<Tensor> {
    let pos = x.relu()?;
    if neg_slope == 0.0 {
        return Ok(pos);
    }
    pos - x.neg()?.relu()?.affine(neg_slope, 0.0)?
}

/// Unspliced and spliced abundance after time `tau` from `(u0, s0)`
///
/// * `u = u0 e^{-βτ} + α/β (1 - e^{-βτ})`
/// * `s = s0 e^{-γτ} + α/γ (1 - e^{-γτ}) + (α - β u0)/(γ - β) (e^{-γτ} - e^{-βτ})`
///
/// with the last term replaced by `(α - β u0) τ e^{-γτ}` when `γ ≈ β`.
/// All arguments share one shape.
pub fn pred_su(
    tau: &Tensor,
    u0: &Tensor,
    s0: &Tensor,
    alpha: &Tensor,
    beta: &Tensor,
    gamma: &Tensor,
) -> Result<(Tensor, Tensor)> {
    let eb = beta.mul(tau)?.neg()?.exp()?;
    let eg = gamma.mul(tau)?.neg()?.exp()?;

    let u = u0
        .mul(&eb)?
        .add(&alpha.div(beta)?.mul(&eb.affine(-1.0, 1.0)?)?)?;

    let drive = alpha.sub(&beta.mul(u0)?)?;
    let diff = gamma.sub(beta)?;
    let near = diff.abs()?.lt(NEAR_EQUAL_RATES)?;
    let safe_diff = near.where_cond(&diff.ones_like()?, &diff)?;

    let far_term = drive.div(&safe_diff)?.mul(&eg.sub(&eb)?)?;
    let near_term = drive.mul(tau)?.mul(&eg)?;
    let cross = near.where_cond(&near_term, &far_term)?;

    let s = s0
        .mul(&eg)?
        .add(&alpha.div(gamma)?.mul(&eg.affine(-1.0, 1.0)?)?)?
        .add(&cross)?;

    Ok((u, s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_util::candle_core::Device;

    fn reference(tau: f64, u0: f64, s0: f64, a: f64, b: f64, g: f64) -> (f64, f64) {
        let eb = (-b * tau).exp();
        let eg = (-g * tau).exp();
        let u = u0 * eb + a / b * (1.0 - eb);
        let cross = if (g - b).abs() < NEAR_EQUAL_RATES {
            (a - b * u0) * tau * eg
        } else {
            (a - b * u0) / (g - b) * (eg - eb)
        };
        (u, s0 * eg + a / g * (1.0 - eg) + cross)
    }

    fn col(x: &[f32]) -> Tensor {
        Tensor::from_slice(x, (x.len(), 1), &Device::Cpu).unwrap()
    }

    fn flat(x: &Tensor) -> Vec<f32> {
        x.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn matches_scalar_solution() {
        let tau = [0.0, 0.3, 1.0, 2.5, 4.0];
        let u0 = [0.1, 0.5, 1.0, 0.0, 2.0];
        let s0 = [0.2, 0.1, 0.0, 1.0, 0.5];
        let a = [1.0, 2.0, 0.5, 1.5, 0.1];
        let b = [0.5, 1.0, 1.0, 2.0, 0.3];
        // last two rows: equal and nearly equal rates
        let g = [0.2, 3.0, 0.4, 2.0, 0.3005];

        let (u, s) = pred_su(&col(&tau), &col(&u0), &col(&s0), &col(&a), &col(&b), &col(&g)).unwrap();
        let (u, s) = (flat(&u), flat(&s));

        for i in 0..tau.len() {
            let (ue, se) = reference(
                tau[i] as f64,
                u0[i] as f64,
                s0[i] as f64,
                a[i] as f64,
                b[i] as f64,
                g[i] as f64,
            );
            assert_abs_diff_eq!(u[i] as f64, ue, epsilon = 1e-4);
            assert_abs_diff_eq!(s[i] as f64, se, epsilon = 1e-4);
        }
    }

    #[test]
    fn zero_elapsed_time_keeps_initial_state() {
        let zero = col(&[0.0, 0.0]);
        let u0 = col(&[0.7, 1.3]);
        let s0 = col(&[0.4, 2.0]);
        let rate = col(&[1.1, 0.9]);
        let (u, s) = pred_su(&zero, &u0, &s0, &rate, &rate, &col(&[0.5, 0.9])).unwrap();
        assert_eq!(flat(&u), vec![0.7, 1.3]);
        assert_eq!(flat(&s), vec![0.4, 2.0]);
    }

    #[test]
    fn long_time_reaches_steady_state() {
        let (u, s) = pred_su(
            &col(&[200.0]),
            &col(&[3.0]),
            &col(&[0.0]),
            &col(&[2.0]),
            &col(&[0.5]),
            &col(&[0.25]),
        )
        .unwrap();
        assert_abs_diff_eq!(flat(&u)[0], 4.0, epsilon = 1e-4);
        assert_abs_diff_eq!(flat(&s)[0], 8.0, epsilon = 1e-3);
    }

    #[test]
    fn leaky_clipping() {
        let x = col(&[-2.0, 0.0, 3.0]);
        assert_eq!(flat(&leaky(&x, 0.0).unwrap()), vec![0.0, 0.0, 3.0]);
        assert_eq!(flat(&leaky(&x, 0.1).unwrap()), vec![-0.2, 0.0, 3.0]);
    }
}
