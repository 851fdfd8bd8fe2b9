use lentil::common::*;
use lentil::config::FitConfig;
use lentil::decoder::{BrodeDecoder, TrainableFlags};
use lentil::init_params::{KineticParams, SteadyStateArgs};
use lentil::run_fit::{fit_brode, split_cells, FitArgs};
use lentil::trainer;
use lentil::transition_graph::{TransitionGraph, TransitionGraphArgs};

use candle_util::candle_core::{Device, Tensor};
use candle_util::candle_data_loader::{tensor_to_dmatrix, InMemoryData};
use candle_util::candle_model_traits::BranchDecoderT;
use approx::assert_abs_diff_eq;
use clap::Parser;
use matrix_util::common_io::{read_lines, write_lines};
use matrix_util::traits::IoOps;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

const N_GENE: usize = 3;

/// Kinetics of a chain 0 -> 1 -> 2 switching at about 0, 1 and 2
fn chain_truth() -> (KineticParams, Mat) {
    let params = KineticParams {
        alpha: Mat::from_row_slice(3, N_GENE, &[2.0, 1.0, 3.0, 0.5, 3.0, 1.0, 4.0, 0.3, 2.0]),
        beta: Mat::from_element(3, N_GENE, 1.0),
        gamma: Mat::from_row_slice(3, N_GENE, &[0.5, 1.0, 0.8, 0.7, 0.4, 1.5, 1.2, 0.6, 0.3]),
        u0: Mat::from_element(3, N_GENE, 0.1),
        s0: Mat::from_element(3, N_GENE, 0.1),
        ts_offset: Mat::from_row_slice(3, N_GENE, &[0.05, 0.05, 0.05, 0.95, 0.95, 0.95, 1.0, 1.0, 1.0]),
        scaling: DVec::from_element(N_GENE, 1.0),
        sigma_u: DVec::from_element(N_GENE, 1.0),
        sigma_s: DVec::from_element(N_GENE, 1.0),
    };
    let weights = Mat::from_row_slice(3, 3, &[1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
    (params, weights)
}

struct Sim {
    u: Mat,
    s: Mat,
    time: Vec<f32>,
    label: Vec<usize>,
    embed: Mat,
}

/// Cells of each type spread over `[y, y + 1)` with Gaussian noise
fn simulate(per_type: usize, sigma_u: f32, sigma_s: f32, seed: u64) -> anyhow::Result<Sim> {
    let (params, weights) = chain_truth();
    let truth = BrodeDecoder::new(&params, &weights, TrainableFlags::default(), &Device::Cpu)?;

    let mut time = vec![];
    let mut label = vec![];
    for y in 0..3 {
        for c in 0..per_type {
            time.push(y as f32 + c as f32 / per_type as f32);
            label.push(y);
        }
    }
    let nn = time.len();

    let t = Tensor::from_slice(&time, (nn, 1), &Device::Cpu)?;
    let y = Tensor::from_iter(label.iter().map(|&x| x as u32), &Device::Cpu)?;
    let (uhat, shat) = truth.forward_t(&t, &y, 0.0)?;

    let mut rng = StdRng::seed_from_u64(seed);
    let eps_u = Normal::new(0.0, sigma_u)?;
    let eps_s = Normal::new(0.0, sigma_s)?;
    let u = tensor_to_dmatrix(&uhat)?.map(|x| x + eps_u.sample(&mut rng));
    let s = tensor_to_dmatrix(&shat)?.map(|x| x + eps_s.sample(&mut rng));

    let embed = Mat::from_fn(nn, 2, |i, j| if j == 0 { time[i] } else { 0.0 });
    Ok(Sim {
        u,
        s,
        time,
        label,
        embed,
    })
}

fn loaders(sim: &Sim, seed: u64) -> anyhow::Result<(InMemoryData, InMemoryData, Vec<usize>)> {
    let (train_idx, test_idx) = split_cells(sim.time.len(), 0.7, &mut StdRng::seed_from_u64(seed));
    let train = InMemoryData::new(&sim.u, &sim.s, &sim.time, &sim.label, &train_idx)?;
    let test = InMemoryData::new(&sim.u, &sim.s, &sim.time, &sim.label, &test_idx)?;
    Ok((train, test, train_idx))
}

#[test]
fn chain_is_recovered_and_training_improves_fit() -> anyhow::Result<()> {
    let sim = simulate(200, 0.2, 0.2, 1)?;
    let part = vec![0; sim.time.len()];
    let graph = TransitionGraph::build(
        &sim.time,
        &sim.embed,
        &sim.label,
        3,
        Some(&part),
        &TransitionGraphArgs::default(),
    )?;
    assert_eq!(graph.parents, vec![0, 0, 1]);
    assert!(graph.weights[(1, 0)] > 0.99 && graph.weights[(2, 1)] > 0.99);

    let (mut train, test, train_idx) = loaders(&sim, 2)?;
    let mut rng = StdRng::seed_from_u64(3);
    let time: Vec<f32> = train_idx.iter().map(|&i| sim.time[i]).collect();
    let label: Vec<usize> = train_idx.iter().map(|&i| sim.label[i]).collect();
    let init = KineticParams::steady_state(
        &sim.u.select_rows(&train_idx),
        &sim.s.select_rows(&train_idx),
        &time,
        &label,
        &graph.parents,
        &graph.t_init,
        None,
        &SteadyStateArgs::default(),
        &mut rng,
    )?;
    let decoder = BrodeDecoder::new(&init, &graph.weights, TrainableFlags::default(), &Device::Cpu)?;

    let config = FitConfig {
        n_epochs: 20,
        learning_rate: 1e-2,
        early_stop: 0,
        test_iter: Some(4),
        ..Default::default()
    };
    let train_config = config.train_config(Device::Cpu, true);
    let trace = trainer::fit(&decoder, &mut train, Some(&test), &config, &train_config, &mut rng)?;

    assert!(!trace.stopped_early);
    assert_eq!(trace.epochs_run, 20);
    assert_eq!(trace.test_steps[..2], [0, 1]);
    let first = trace.test_llik[0];
    let last = *trace.test_llik.last().expect("evaluations");
    assert!(last > first, "held-out log-likelihood {} -> {}", first, last);
    Ok(())
}

#[test]
fn plateau_stops_early() -> anyhow::Result<()> {
    let sim = simulate(100, 0.2, 0.2, 4)?;
    let (mut train, test, _) = loaders(&sim, 5)?;
    let (params, weights) = chain_truth();
    let decoder = BrodeDecoder::new(&params, &weights, TrainableFlags::default(), &Device::Cpu)?;

    let config = FitConfig {
        n_epochs: 50,
        learning_rate: 1e-8,
        batch_size: 16,
        early_stop: 3,
        test_iter: Some(1),
        ..Default::default()
    };
    let train_config = config.train_config(Device::Cpu, true);
    let mut rng = StdRng::seed_from_u64(6);
    let trace = trainer::fit(&decoder, &mut train, Some(&test), &config, &train_config, &mut rng)?;

    assert!(trace.stopped_early);
    assert!(trace.epochs_run < config.n_epochs);
    assert_eq!(trace.test_llik.len(), 4);
    assert_eq!(trace.test_steps, vec![0, 1, 2, 3]);
    Ok(())
}

#[test]
fn noise_levels_are_re_estimated() -> anyhow::Result<()> {
    let (true_su, true_ss) = (0.3, 0.15);
    let sim = simulate(500, true_su, true_ss, 7)?;
    let (mut train, _, _) = loaders(&sim, 8)?;

    // true kinetics, wrong noise
    let (params, weights) = chain_truth();
    let decoder = BrodeDecoder::new(&params, &weights, TrainableFlags::default(), &Device::Cpu)?;

    let config = FitConfig {
        n_epochs: 1,
        n_update_noise: 1,
        learning_rate: 1e-8,
        ..Default::default()
    };
    let train_config = config.train_config(Device::Cpu, true);
    let mut rng = StdRng::seed_from_u64(9);
    trainer::fit(&decoder, &mut train, None, &config, &train_config, &mut rng)?;

    for &x in decoder.sigma_u()?.iter() {
        assert!((x - true_su).abs() < 0.03, "sigma_u {}", x);
    }
    for &x in decoder.sigma_s()?.iter() {
        assert!((x - true_ss).abs() < 0.02, "sigma_s {}", x);
    }
    Ok(())
}

#[test]
fn noise_follows_residuals_only_on_schedule() -> anyhow::Result<()> {
    let sim = simulate(200, 0.3, 0.15, 11)?;
    let (mut train, _, _) = loaders(&sim, 12)?;

    // biased kinetics so the residuals carry more than the noise
    let (mut params, weights) = chain_truth();
    params.alpha *= 1.5;

    let config = FitConfig {
        n_epochs: 2,
        n_update_noise: 3,
        learning_rate: 1e-8,
        ..Default::default()
    };
    let train_config = config.train_config(Device::Cpu, true);
    let mut rng = StdRng::seed_from_u64(13);

    // not yet at the first boundary: σ untouched
    let decoder = BrodeDecoder::new(&params, &weights, TrainableFlags::default(), &Device::Cpu)?;
    let trace = trainer::fit(&decoder, &mut train, None, &config, &train_config, &mut rng)?;
    assert!(trace.noise_updates.is_empty());
    for &x in decoder.sigma_u()?.iter().chain(decoder.sigma_s()?.iter()) {
        assert_abs_diff_eq!(x, 1.0, epsilon = 1e-6);
    }

    // one update at epoch 3, none at 4 or 5
    let config = FitConfig {
        n_epochs: 5,
        ..config
    };
    let decoder = BrodeDecoder::new(&params, &weights, TrainableFlags::default(), &Device::Cpu)?;
    let trace = trainer::fit(&decoder, &mut train, None, &config, &train_config, &mut rng)?;
    assert_eq!(trace.noise_updates, vec![3]);

    let pred = trainer::predict_all(&decoder, &train, &Device::Cpu, trainer::PREDICT_CHUNK)?;
    let full = train.full_data(&Device::Cpu)?;
    let population_sd = |resid: Mat| -> Vec<f32> {
        resid
            .column_iter()
            .map(|r| {
                let mu = r.mean();
                r.map(|x| (x - mu) * (x - mu)).mean().sqrt()
            })
            .collect()
    };
    let sd_u = population_sd(tensor_to_dmatrix(&full.u)? - &pred.uhat);
    let sd_s = population_sd(tensor_to_dmatrix(&full.s)? - &pred.shat);

    let sigma_u = decoder.sigma_u()?;
    let sigma_s = decoder.sigma_s()?;
    for g in 0..N_GENE {
        assert_abs_diff_eq!(sigma_u[g], sd_u[g], epsilon = 1e-3);
        assert_abs_diff_eq!(sigma_s[g], sd_s[g], epsilon = 1e-3);
    }
    Ok(())
}

#[derive(Parser)]
struct TestCli {
    #[command(flatten)]
    fit: FitArgs,
}

fn write_inputs(dir: &std::path::Path, sim: &Sim) -> anyhow::Result<Vec<String>> {
    let path = |x: &str| dir.join(x).to_str().unwrap_or_default().to_string();
    let nn = sim.time.len();
    let cells: Vec<Box<str>> = (0..nn).map(|i| format!("cell{}", i).into_boxed_str()).collect();
    let genes: Vec<Box<str>> = (0..N_GENE).map(|g| format!("gene{}", g).into_boxed_str()).collect();
    let dims: Vec<Box<str>> = vec!["x".into(), "y".into()];

    sim.u.write_named(&path("u.tsv.gz"), &cells, &genes)?;
    sim.s.write_named(&path("s.tsv.gz"), &cells, &genes)?;
    sim.embed.write_named(&path("umap.tsv.gz"), &cells, &dims)?;

    let names = ["progenitor", "intermediate", "mature"];
    let mut annot: Vec<Box<str>> = vec!["cell\tclusters\tlatent_time\tlineage".into()];
    for i in 0..nn {
        annot.push(
            format!("{}\t{}\t{}\tL1", cells[i], names[sim.label[i]], sim.time[i]).into_boxed_str(),
        );
    }
    write_lines(&annot, &path("obs.tsv"))?;

    Ok(vec![path("u.tsv.gz"), path("s.tsv.gz"), path("obs.tsv"), path("umap.tsv.gz")])
}

#[test]
fn command_line_fit_writes_results_and_restores() -> anyhow::Result<()> {
    let sim = simulate(60, 0.2, 0.2, 10)?;
    let dir = tempfile::tempdir()?;
    let inputs = write_inputs(dir.path(), &sim)?;
    let out = dir.path().join("res").join("chain");
    let out = out.to_str().unwrap_or_default().to_string();

    let base = |out: &str| -> Vec<String> {
        vec![
            "lentil".into(),
            "-u".into(),
            inputs[0].clone(),
            "-s".into(),
            inputs[1].clone(),
            "-a".into(),
            inputs[2].clone(),
            "-e".into(),
            inputs[3].clone(),
            "-o".into(),
            out.into(),
            "--partition-column".into(),
            "lineage".into(),
            "--epochs".into(),
            "2".into(),
        ]
    };

    let cli = TestCli::try_parse_from(base(&out))?;
    fit_brode(&cli.fit)?;

    for name in [
        "cells", "genes", "alpha", "beta", "gamma", "u0", "s0", "ts", "t_trans", "w", "transition",
        "uhat", "shat", "velocity_u", "velocity_s", "train_idx", "test_idx", "label_dic", "loss",
    ] {
        let file = format!("{}.brode_{}.tsv.gz", out, name);
        assert!(std::path::Path::new(&file).exists(), "missing {}", file);
    }
    let checkpoint = format!("{}.brode.safetensors", out);
    assert!(std::path::Path::new(&checkpoint).exists());

    assert_eq!(read_lines(&format!("{}.brode_cells.tsv.gz", out))?.len(), 181);
    let uhat = Mat::read_named(&format!("{}.brode_uhat.tsv.gz", out), "\t")?;
    assert_eq!(uhat.mat.shape(), (180, N_GENE));
    let t_trans = read_lines(&format!("{}.brode_t_trans.tsv.gz", out))?;
    assert!(t_trans[2].ends_with("progenitor"));
    assert!(t_trans[3].ends_with("intermediate"));

    let out2 = format!("{}_restored", out);
    let mut args = base(&out2);
    args.extend(["--checkpoint".to_string(), checkpoint]);
    fit_brode(&TestCli::try_parse_from(args)?.fit)?;
    let t_trans2 = read_lines(&format!("{}.brode_t_trans.tsv.gz", out2))?;
    assert!(t_trans2[3].ends_with("intermediate"));
    Ok(())
}
