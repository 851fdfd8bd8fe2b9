use crate::common::*;
use crate::config::FitConfig;
use crate::decoder::BrodeDecoder;

use candle_util::candle_core::{Device, Tensor};
use candle_util::candle_data_loader::{tensor_to_dmatrix, DataLoader, InMemoryData, MinibatchData};
use candle_util::candle_inference::TrainConfig;
use candle_util::candle_loss_functions::paired_gaussian_risk;
use candle_util::candle_model_traits::BranchDecoderT;
use candle_util::candle_nn::{AdamW, Optimizer, ParamsAdamW};

use indicatif::{ProgressBar, ProgressDrawTarget};
use matrix_util::utils::partition_by_membership;
use rand::Rng;

/// Cells per forward pass when predicting a whole dataset
pub const PREDICT_CHUNK: usize = 4096;

const NOISE_FLOOR: f32 = 1e-10;

/// Stops when the held-out log-likelihood stalls `patience` times in a row
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    thred: f32,
    n_drop: usize,
    ll_prev: Option<f32>,
}

impl EarlyStopping {
    /// `patience = 0` never stops
    pub fn new(patience: usize, thred: f32) -> Self {
        Self {
            patience,
            thred,
            n_drop: 0,
            ll_prev: None,
        }
    }

    /// Record a new log-likelihood; `true` means stop
    pub fn update(&mut self, ll: f32) -> bool {
        if let Some(prev) = self.ll_prev {
            if ll - prev <= self.thred {
                self.n_drop += 1;
            } else {
                self.n_drop = 0;
            }
        }
        self.ll_prev = Some(ll);
        self.patience > 0 && self.n_drop >= self.patience
    }

    pub fn num_drops(&self) -> usize {
        self.n_drop
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrainTrace {
    /// loss of every minibatch step
    pub train_loss: Vec<f32>,
    /// mean held-out log-likelihood per evaluation
    pub test_llik: Vec<f32>,
    /// updates done before each evaluation (0: the starting point)
    pub test_steps: Vec<usize>,
    /// minibatch steps between evaluations
    pub test_iter: usize,
    /// epochs (1-based) after which the noise levels were re-estimated
    pub noise_updates: Vec<usize>,
    pub stopped_early: bool,
    pub epochs_run: usize,
}

///
/// Fit the decoder's trainable variables by minibatch AdamW
///
/// * `train` - training cells (reshuffled every epoch)
/// * `test` - held-out cells for early stopping
/// * `config` - schedule of evaluation, noise updates and stopping
/// * `train_config` - learning rate, batch size, epochs and device
///
pub fn fit<R: Rng + ?Sized>(
    decoder: &BrodeDecoder,
    train: &mut InMemoryData,
    test: Option<&InMemoryData>,
    config: &FitConfig,
    train_config: &TrainConfig,
    rng: &mut R,
) -> anyhow::Result<TrainTrace> {
    let device = &train_config.device;

    let params = ParamsAdamW {
        lr: train_config.learning_rate.into(),
        weight_decay: 0.0,
        ..Default::default()
    };
    let mut adam = AdamW::new(decoder.trainable_vars()?, params)?;

    let mut trace = TrainTrace {
        test_iter: config.test_iter_for(train.num_data()),
        ..Default::default()
    };
    let mut stopper = EarlyStopping::new(
        config.early_stop,
        config.early_stop_thred_for(decoder.dim_obs()),
    );

    let test_data = match test {
        Some(d) if d.num_data() > 0 => Some(d.full_data(device)?),
        _ => None,
    };

    let pb = ProgressBar::new(train_config.num_epochs as u64);
    if !train_config.show_progress || train_config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    // step 0 scores the starting point before any update
    let mut counter = 0_usize;

    'epochs: for epoch in 0..train_config.num_epochs {
        trace.epochs_run = epoch + 1;
        train.shuffle_minibatch(train_config.batch_size, rng)?;

        let mut loss_tot = 0_f32;
        for b in 0..train.num_minibatch() {
            if let Some(test_mb) = test_data.as_ref() {
                if counter == 1 || counter % trace.test_iter == 0 {
                    let ll = mean_llik(decoder, test_mb)?;
                    trace.test_llik.push(ll);
                    trace.test_steps.push(counter);
                    if stopper.update(ll) {
                        info!(
                            "early stop at epoch {} (step {}): held-out log-likelihood {:.4}",
                            epoch + 1,
                            counter,
                            ll
                        );
                        trace.stopped_early = true;
                        break 'epochs;
                    }
                }
            }

            let mb = train.minibatch_data(b, device)?;
            let loss = batch_loss(decoder, &mb, config.neg_slope)?;
            adam.backward_step(&loss)?;

            let loss_val = loss.to_scalar::<f32>()?;
            trace.train_loss.push(loss_val);
            loss_tot += loss_val;
            counter += 1;
        }

        if config.n_update_noise > 0 && (epoch + 1) % config.n_update_noise == 0 {
            update_noise(decoder, train, device)?;
            trace.noise_updates.push(epoch + 1);
        }

        pb.inc(1);

        if epoch == 0 || (config.save_epoch > 0 && (epoch + 1) % config.save_epoch == 0) {
            let train_ll = -loss_tot / train.num_minibatch().max(1) as f32;
            match trace.test_llik.last() {
                Some(test_ll) => info!(
                    "[{}] train log-likelihood: {:.4}, test log-likelihood: {:.4}",
                    epoch + 1,
                    train_ll,
                    test_ll
                ),
                None => info!("[{}] train log-likelihood: {:.4}", epoch + 1, train_ll),
            }
        }
    }
    pb.finish_and_clear();

    info!(
        "trained {} epochs, {} steps{}",
        trace.epochs_run,
        trace.train_loss.len(),
        if trace.stopped_early { " (early stop)" } else { "" }
    );
    Ok(trace)
}

/// Mean weighted negative log-likelihood of a minibatch
fn batch_loss(decoder: &BrodeDecoder, mb: &MinibatchData, neg_slope: f64) -> anyhow::Result<Tensor> {
    let (uhat, shat) = decoder.forward_t(&mb.time, &mb.label, neg_slope)?;
    let (sigma_u, sigma_s) = decoder.sigma_tensors()?;
    let risk = paired_gaussian_risk(
        &mb.u,
        &mb.s,
        &uhat,
        &shat,
        &sigma_u,
        &sigma_s,
        mb.weight.as_ref(),
    )?;
    Ok(risk.mean_all()?)
}

/// Mean log-likelihood per cell, unweighted and hard-clipped
fn mean_llik(decoder: &BrodeDecoder, mb: &MinibatchData) -> anyhow::Result<f32> {
    let (uhat, shat) = decoder.forward_t(&mb.time, &mb.label, 0.0)?;
    let (sigma_u, sigma_s) = decoder.sigma_tensors()?;
    let risk = paired_gaussian_risk(&mb.u, &mb.s, &uhat, &shat, &sigma_u, &sigma_s, None)?;
    Ok(-risk.mean_all()?.to_scalar::<f32>()?)
}

/// Prediction over all cells of `data`, in loader order
pub struct Prediction {
    pub uhat: Mat,
    pub shat: Mat,
    /// log-likelihood of each cell
    pub llik: Vec<f32>,
}

/// Predict every cell of `data` in chunks of `chunk` cells
pub fn predict_all(
    decoder: &BrodeDecoder,
    data: &InMemoryData,
    device: &Device,
    chunk: usize,
) -> anyhow::Result<Prediction> {
    let full = data.full_data(device)?;
    let nn = data.num_data();
    let ng = decoder.dim_obs();
    let (sigma_u, sigma_s) = decoder.sigma_tensors()?;

    let mut uhat = Mat::zeros(nn, ng);
    let mut shat = Mat::zeros(nn, ng);
    let mut llik = Vec::with_capacity(nn);

    let chunk = chunk.max(1);
    let mut lb = 0;
    while lb < nn {
        let len = chunk.min(nn - lb);
        let take = |x: &Tensor| x.narrow(0, lb, len);

        let (u_c, s_c) = decoder.forward_t(&take(&full.time)?, &take(&full.label)?, 0.0)?;
        let (u_c, s_c) = (u_c.detach(), s_c.detach());
        let risk = paired_gaussian_risk(
            &take(&full.u)?,
            &take(&full.s)?,
            &u_c,
            &s_c,
            &sigma_u,
            &sigma_s,
            None,
        )?;

        uhat.rows_mut(lb, len).copy_from(&tensor_to_dmatrix(&u_c)?);
        shat.rows_mut(lb, len).copy_from(&tensor_to_dmatrix(&s_c)?);
        llik.extend(risk.to_device(&Device::Cpu)?.to_vec1::<f32>()?.into_iter().map(|r| -r));
        lb += len;
    }

    Ok(Prediction { uhat, shat, llik })
}

/// Reset `σ` to the residual standard deviation on the training cells
pub fn update_noise(decoder: &BrodeDecoder, train: &InMemoryData, device: &Device) -> anyhow::Result<()> {
    let pred = predict_all(decoder, train, device, PREDICT_CHUNK)?;
    let full = train.full_data(&Device::Cpu)?;
    let u = tensor_to_dmatrix(&full.u)?;
    let s = tensor_to_dmatrix(&full.s)?;

    let sigma_u = residual_sd(&(u - pred.uhat));
    let sigma_s = residual_sd(&(s - pred.shat));
    debug!(
        "noise update: mean sigma_u {:.4}, mean sigma_s {:.4}",
        sigma_u.mean(),
        sigma_s.mean()
    );
    decoder.set_sigma(&sigma_u, &sigma_s)
}

/// Population standard deviation of each column plus a floor
fn residual_sd(resid: &Mat) -> DVec {
    let nn = resid.nrows().max(1) as f32;
    DVec::from_iterator(
        resid.ncols(),
        resid.column_iter().map(|r| {
            let mu = r.sum() / nn;
            (r.map(|x| (x - mu) * (x - mu)).sum() / nn).sqrt() + NOISE_FLOOR
        }),
    )
}

/// Inverse type-frequency weights of `rows`, normalized to mean one
pub fn inverse_frequency_weights(label: &[usize], rows: &[usize]) -> Vec<f32> {
    let sub: Vec<usize> = rows.iter().map(|&r| label[r]).collect();
    let counts = partition_by_membership(&sub);
    let raw: Vec<f32> = sub
        .iter()
        .map(|k| 1.0 / counts.get(k).map_or(1, |c| c.len()) as f32)
        .collect();
    let mean = raw.iter().sum::<f32>() / raw.len().max(1) as f32;
    raw.into_iter().map(|w| w / mean).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stalls_count_towards_patience() {
        let mut stop = EarlyStopping::new(3, 0.01);
        assert!(!stop.update(-10.0));
        assert!(!stop.update(-9.0));
        assert!(!stop.update(-9.005));
        assert!(!stop.update(-9.001));
        assert_eq!(stop.num_drops(), 2);
        // improvement resets the counter
        assert!(!stop.update(-8.0));
        assert_eq!(stop.num_drops(), 0);
        assert!(!stop.update(-8.0));
        assert!(!stop.update(-8.0));
        assert!(stop.update(-8.0));
    }

    #[test]
    fn zero_patience_never_stops() {
        let mut stop = EarlyStopping::new(0, 0.0);
        assert!((0..20).all(|_| !stop.update(1.0)));
    }

    #[test]
    fn weights_balance_types() {
        let label = [0, 0, 0, 1, 2, 2];
        let w = inverse_frequency_weights(&label, &[0, 1, 2, 3]);
        assert_eq!(w.len(), 4);
        approx::assert_abs_diff_eq!(w.iter().sum::<f32>() / 4.0, 1.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(w[3], 3.0 * w[0], epsilon = 1e-6);
    }

    #[test]
    fn residual_sd_is_population_sd() {
        let r = Mat::from_column_slice(4, 2, &[1.0, -1.0, 1.0, -1.0, 0.0, 0.0, 0.0, 0.0]);
        let sd = residual_sd(&r);
        approx::assert_abs_diff_eq!(sd[0], 1.0, epsilon = 1e-6);
        assert!(sd[1] > 0.0 && sd[1] < 1e-9);
    }
}
