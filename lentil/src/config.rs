use crate::arborescence::ArborescenceArgs;
use crate::common::*;
use crate::knn_transition::KnnTransitionArgs;
use crate::lineage_partition::PartitionArgs;
use crate::transition_graph::TransitionGraphArgs;

use candle_util::candle_core::Device;
use candle_util::candle_inference::TrainConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Transition graph hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// neighbours in the partition kNN graph
    pub partition_k: usize,
    /// Louvain resolution of the partition
    pub partition_res: f64,
    /// parents kept per type when pruning
    pub n_par: usize,
    /// parent time window as fractions of the time range
    pub dt: (f32, f32),
    /// neighbours counted inside the time window
    pub k: usize,
    pub soft_assign: bool,
    /// random parents for unsupported types instead of an error
    pub permissive: bool,
    /// fixed lineage `{parent: [children]}` replacing the estimate
    pub lineage_graph: Option<BTreeMap<String, Vec<String>>>,

    /// keys this version does not know about
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            partition_k: 5,
            partition_res: 0.005,
            n_par: 2,
            dt: (0.01, 0.03),
            k: 5,
            soft_assign: true,
            permissive: false,
            lineage_graph: None,
            extra: BTreeMap::new(),
        }
    }
}

impl GraphConfig {
    pub fn to_args(&self, seed: u64) -> TransitionGraphArgs {
        TransitionGraphArgs {
            partition: PartitionArgs {
                knn: self.partition_k,
                resolution: self.partition_res,
                seed,
            },
            transition: KnnTransitionArgs {
                dt: self.dt,
                k: self.k,
                soft_assign: self.soft_assign,
            },
            n_par: self.n_par,
            solver: ArborescenceArgs {
                permissive: self.permissive,
                seed,
            },
        }
    }
}

/// Training hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub n_epochs: usize,
    pub learning_rate: f64,
    /// leak of the non-negativity clipping while training
    pub neg_slope: f64,
    /// minibatch steps between held-out evaluations
    /// (default: two passes over the training set)
    pub test_iter: Option<usize>,
    /// epochs between progress reports
    pub save_epoch: usize,
    /// epochs between noise re-estimation
    pub n_update_noise: usize,
    pub batch_size: usize,
    /// stop after this many evaluations without improvement (0: never)
    pub early_stop: usize,
    /// minimum improvement of held-out log-likelihood
    /// (default: `1e-3` per gene)
    pub early_stop_thred: Option<f32>,
    /// fraction of cells used for training
    pub train_test_split: f32,
    pub train_scaling: bool,
    pub train_std: bool,
    /// weight cells by inverse type frequency
    pub weight_sample: bool,
    pub train_switch_time: bool,
    pub graph: GraphConfig,

    /// keys this version does not know about
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            n_epochs: 500,
            learning_rate: 2e-4,
            neg_slope: 0.0,
            test_iter: None,
            save_epoch: 100,
            n_update_noise: 25,
            batch_size: 128,
            early_stop: 5,
            early_stop_thred: None,
            train_test_split: 0.7,
            train_scaling: false,
            train_std: false,
            weight_sample: false,
            train_switch_time: false,
            graph: GraphConfig::default(),
            extra: BTreeMap::new(),
        }
    }
}

impl FitConfig {
    /// Parse JSON; missing keys take defaults
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        for key in config.extra.keys() {
            warn!("Added new hyperparameter: {}", key);
        }
        for key in config.graph.extra.keys() {
            warn!("Added new graph hyperparameter: {}", key);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(file: &str) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(file)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {}", file, e))?;
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.train_test_split > 0.0 && self.train_test_split <= 1.0) {
            anyhow::bail!("train_test_split must be in (0, 1], got {}", self.train_test_split);
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }
        if self.learning_rate <= 0.0 {
            anyhow::bail!("learning_rate must be positive, got {}", self.learning_rate);
        }
        let (lo, hi) = self.graph.dt;
        if !(0.0 <= lo && lo < hi) {
            anyhow::bail!("dt must satisfy 0 <= dt.0 < dt.1, got ({}, {})", lo, hi);
        }
        if self.graph.n_par == 0 {
            anyhow::bail!("n_par must be positive");
        }
        Ok(())
    }

    /// Optimizer schedule on `device`
    pub fn train_config(&self, device: Device, verbose: bool) -> TrainConfig {
        TrainConfig {
            learning_rate: self.learning_rate as f32,
            batch_size: self.batch_size,
            num_epochs: self.n_epochs,
            device,
            verbose,
            show_progress: true,
        }
    }

    /// `test_iter`, or `2 * (n_train / batch_size)` (at least 1)
    pub fn test_iter_for(&self, n_train: usize) -> usize {
        self.test_iter
            .unwrap_or(2 * (n_train / self.batch_size.max(1)))
            .max(1)
    }

    /// `early_stop_thred`, or `1e-3` per gene
    pub fn early_stop_thred_for(&self, n_gene: usize) -> f32 {
        self.early_stop_thred.unwrap_or(n_gene as f32 * 1e-3)
    }
}
