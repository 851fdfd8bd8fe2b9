use crate::common::*;
use crate::decoder::BrodeDecoder;

/// RNA velocity of fitted cells
///
/// With rates `(α, β, γ)` of the branch a cell sits on (its own type
/// once past the switch time, else the parent type):
/// * `du/dt = α - β û / scaling`
/// * `ds/dt = β û / scaling - γ ŝ`
///
/// Returns `(velocity_u, velocity_s)`, both cells x genes
pub fn rna_velocity(
    decoder: &BrodeDecoder,
    uhat: &Mat,
    shat: &Mat,
    time: &[f32],
    label: &[usize],
) -> anyhow::Result<(Mat, Mat)> {
    let (nn, ng) = uhat.shape();
    if shat.shape() != (nn, ng) || time.len() != nn || label.len() != nn {
        anyhow::bail!(
            "uhat {:?}, shat {:?}, {} times, {} labels",
            uhat.shape(),
            shat.shape(),
            time.len(),
            label.len()
        );
    }

    let alpha = decoder.alpha()?;
    let beta = decoder.beta()?;
    let gamma = decoder.gamma()?;
    let ts = decoder.switch_times()?;
    let scaling = decoder.scaling()?;
    let parents = decoder.parents();

    let mut vu = Mat::zeros(nn, ng);
    let mut vs = Mat::zeros(nn, ng);
    for i in 0..nn {
        let y = label[i];
        for g in 0..ng {
            let c = if time[i] >= ts[(y, g)] { y } else { parents[y] };
            let u = uhat[(i, g)] / scaling[g];
            vu[(i, g)] = alpha[(c, g)] - beta[(c, g)] * u;
            vs[(i, g)] = beta[(c, g)] * u - gamma[(c, g)] * shat[(i, g)];
        }
    }
    Ok((vu, vs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::TrainableFlags;
    use crate::init_params::KineticParams;
    use approx::assert_abs_diff_eq;
    use candle_util::candle_core::Device;

    #[test]
    fn steady_state_has_no_velocity() -> anyhow::Result<()> {
        let params = KineticParams {
            alpha: Mat::from_element(1, 1, 2.0),
            beta: Mat::from_element(1, 1, 0.5),
            gamma: Mat::from_element(1, 1, 0.25),
            u0: Mat::from_element(1, 1, 1.0),
            s0: Mat::from_element(1, 1, 1.0),
            ts_offset: Mat::from_element(1, 1, 0.1),
            scaling: DVec::from_element(1, 3.0),
            sigma_u: DVec::from_element(1, 1.0),
            sigma_s: DVec::from_element(1, 1.0),
        };
        let dec = BrodeDecoder::new(
            &params,
            &Mat::from_element(1, 1, 1.0),
            TrainableFlags::default(),
            &Device::Cpu,
        )?;

        // u* = α/β = 4 (observed 12 after scaling), s* = α/γ = 8
        let uhat = Mat::from_row_slice(2, 1, &[12.0, 3.0]);
        let shat = Mat::from_row_slice(2, 1, &[8.0, 0.0]);
        let (vu, vs) = rna_velocity(&dec, &uhat, &shat, &[5.0, 0.2], &[0, 0])?;

        assert_abs_diff_eq!(vu[(0, 0)], 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(vs[(0, 0)], 0.0, epsilon = 1e-5);
        // induction: unspliced rising, spliced rising
        assert_abs_diff_eq!(vu[(1, 0)], 1.5, epsilon = 1e-5);
        assert_abs_diff_eq!(vs[(1, 0)], 0.5, epsilon = 1e-5);
        Ok(())
    }
}
