use candle_core::{Result, Tensor};

const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// Gaussian log-likelihood of count-ish data
///
/// llik(i) = -0.5 * sum_w [ x(i,w) - xhat(i,w) ]^2
///
/// * `x_nd` - data tensor (observed data)
/// * `hat_nd` - mean tensor (reconstruction)
///
pub fn gaussian_likelihood(x_nd: &Tensor, hat_nd: &Tensor) -> Result<Tensor> {
    x_nd.sub(hat_nd)?.powf(2.)?.sum(1)? * (-0.5)
}

/// Gaussian negative log-likelihood with a per-feature standard
/// deviation
///
/// nll(i,w) = 0.5 * ((x(i,w) - xhat(i,w)) / sd(w))^2 + ln sd(w) + 0.5 ln(2π)
///
/// * `x_nd` - data tensor (observed data)
/// * `hat_nd` - mean tensor (reconstruction)
/// * `sd_d` - standard deviation per feature (d)
///
/// Returns `nll(i,w)` (n x d)
pub fn gaussian_nll_elementwise(x_nd: &Tensor, hat_nd: &Tensor, sd_d: &Tensor) -> Result<Tensor> {
    let z_nd = x_nd.sub(hat_nd)?.broadcast_div(sd_d)?;
    let log_sd = sd_d.log()?;
    (z_nd.sqr()? * 0.5)?
        .broadcast_add(&log_sd)?
        .affine(1.0, 0.5 * LN_2PI)
}

/// Negative log-likelihood of paired unspliced/spliced observations
///
/// risk(i) = sum_w 0.5((uhat-u)/σu)^2 + 0.5((shat-s)/σs)^2 + ln σu + ln(2π σs)
///
/// * `u_nd`, `s_nd` - observed unspliced and spliced (n x d)
/// * `uhat_nd`, `shat_nd` - predicted means (n x d)
/// * `sigma_u_d`, `sigma_s_d` - standard deviations (d)
/// * `weight_n1` - optional sample weights (n x 1)
///
/// Returns `risk(i)` (n)
pub fn paired_gaussian_risk(
    u_nd: &Tensor,
    s_nd: &Tensor,
    uhat_nd: &Tensor,
    shat_nd: &Tensor,
    sigma_u_d: &Tensor,
    sigma_s_d: &Tensor,
    weight_n1: Option<&Tensor>,
) -> Result<Tensor> {
    let nll_u = gaussian_nll_elementwise(u_nd, uhat_nd, sigma_u_d)?.affine(1.0, -0.5 * LN_2PI)?;
    let nll_s = gaussian_nll_elementwise(s_nd, shat_nd, sigma_s_d)?.affine(1.0, 0.5 * LN_2PI)?;
    let nll = (nll_u + nll_s)?;
    let nll = match weight_n1 {
        Some(w) => nll.broadcast_mul(w)?,
        None => nll,
    };
    nll.sum(1)
}
