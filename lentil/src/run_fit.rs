use crate::common::*;
use crate::config::FitConfig;
use crate::decoder::{BrodeDecoder, TrainableFlags};
use crate::init_params::{KineticParams, SteadyStateArgs};
use crate::input::{VeloData, VeloFiles};
use crate::output::{FitResults, OutputPrefix};
use crate::trainer::{self, inverse_frequency_weights, predict_all, PREDICT_CHUNK};
use crate::transition_graph::TransitionGraph;
use crate::velocity::rna_velocity;

use candle_util::candle_data_loader::InMemoryData;
use candle_util::candle_inference::ComputeDevice;
use clap::Args;
use matrix_util::common_io::write_lines;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

#[derive(Args, Debug)]
pub struct FitArgs {
    #[arg(
        long,
        short = 'u',
        required = true,
        help = "Unspliced count matrix",
        long_help = "Unspliced count matrix (cells x genes).\n\
		     Header of gene names, first column of cell names.\n\
		     `.tsv`, `.csv` or their `.gz` versions."
    )]
    unspliced: Box<str>,

    #[arg(
        long,
        short = 's',
        required = true,
        help = "Spliced count matrix",
        long_help = "Spliced count matrix (cells x genes).\n\
		     Must have the same cells and genes as the unspliced matrix."
    )]
    spliced: Box<str>,

    #[arg(
        long,
        short = 'a',
        required = true,
        help = "Cell annotation table",
        long_help = "Cell annotation table with a header line.\n\
		     First column: cell names. Must contain the type\n\
		     and time columns (see --type-column, --time-column)."
    )]
    annotation: Box<str>,

    #[arg(
        long,
        short = 'e',
        required = true,
        help = "Cell embedding",
        long_help = "Cell embedding matrix (cells x dims), e.g., UMAP or PCA.\n\
		     Used to find neighbouring cells across time."
    )]
    embedding: Box<str>,

    #[arg(
        long,
        help = "Per-gene parameter table",
        long_help = "Per-gene table (genes x columns) providing\n\
		     `{key}_scaling`, `{key}_sigma_u` and `{key}_sigma_s`.\n\
		     Estimated from the data if not given."
    )]
    gene_params: Option<Box<str>>,

    #[arg(long, default_value = "clusters", help = "Cell type column")]
    type_column: Box<str>,

    #[arg(long, default_value = "latent_time", help = "Cell time column")]
    time_column: Box<str>,

    #[arg(
        long,
        help = "Lineage partition column",
        long_help = "Annotation column of precomputed lineage partitions.\n\
		     Cells are partitioned by Louvain clustering of\n\
		     the embedding kNN graph if not given."
    )]
    partition_column: Option<Box<str>>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for results:\n\
		     - {out}.{key}_*.tsv.gz\n\
		     - {out}.{key}.safetensors\n\
		     - {out}.{key}_config.json"
    )]
    out: Box<str>,

    #[arg(long, default_value = "brode", help = "Key of this fit in output names")]
    key: Box<str>,

    #[arg(
        long,
        short = 'c',
        help = "Hyperparameter JSON file",
        long_help = "Hyperparameter JSON file.\n\
		     Missing keys take default values;\n\
		     unknown keys are kept with a warning."
    )]
    config: Option<Box<str>>,

    #[arg(
        long,
        help = "Restore a saved model",
        long_help = "Restore decoder parameters and the lineage tree\n\
		     from a `.safetensors` checkpoint, skipping\n\
		     initialization and graph construction."
    )]
    checkpoint: Option<Box<str>>,

    #[arg(long, help = "Number of epochs (overrides the config)")]
    epochs: Option<usize>,

    #[arg(long, help = "Learning rate (overrides the config)")]
    learning_rate: Option<f64>,

    #[arg(long, help = "Minibatch size (overrides the config)")]
    batch_size: Option<usize>,

    #[arg(long, default_value_t = 42, help = "Random seed")]
    seed: u64,

    #[arg(long, value_enum, default_value = "cpu", help = "Candle device")]
    device: ComputeDevice,

    #[arg(long, default_value_t = 0, help = "Device number")]
    device_no: usize,

    #[arg(long, short, help = "Verbosity")]
    verbose: bool,
}

impl FitArgs {
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    fn files(&self) -> VeloFiles {
        VeloFiles {
            unspliced: self.unspliced.clone(),
            spliced: self.spliced.clone(),
            annotation: self.annotation.clone(),
            embedding: self.embedding.clone(),
            gene_params: self.gene_params.clone(),
            type_column: self.type_column.clone(),
            time_column: self.time_column.clone(),
            partition_column: self.partition_column.clone(),
            key: self.key.clone(),
        }
    }

    fn fit_config(&self) -> anyhow::Result<FitConfig> {
        let mut config = match self.config.as_deref() {
            Some(file) => FitConfig::from_file(file)?,
            None => FitConfig::default(),
        };
        if let Some(x) = self.epochs {
            config.n_epochs = x;
        }
        if let Some(x) = self.learning_rate {
            config.learning_rate = x;
        }
        if let Some(x) = self.batch_size {
            config.batch_size = x;
        }
        config.validate()?;
        Ok(config)
    }
}

pub fn fit_brode(args: &FitArgs) -> anyhow::Result<()> {
    let config = args.fit_config()?;
    let data = VeloData::load(&args.files())?;
    let device = args.device.to_device_or_cpu(args.device_no);
    let mut rng = StdRng::seed_from_u64(args.seed);

    let (train_idx, test_idx) = split_cells(data.num_cells(), config.train_test_split, &mut rng);
    info!("{} training and {} held-out cells", train_idx.len(), test_idx.len());

    let flags = TrainableFlags {
        switch_time: config.train_switch_time,
        scaling: config.train_scaling,
        std: config.train_std,
    };

    let (graph, decoder) = match args.checkpoint.as_deref() {
        Some(path) => {
            let decoder =
                BrodeDecoder::load(path, data.num_types(), data.num_genes(), flags, &device)?;
            let time: Vec<f32> = train_idx.iter().map(|&i| data.time[i]).collect();
            let label: Vec<usize> = train_idx.iter().map(|&i| data.label[i]).collect();
            let graph = TransitionGraph::from_parents(decoder.parents(), &time, &label)?;
            (graph, decoder)
        }
        None => {
            let graph = build_graph(&data, &train_idx, &config, args.seed)?;
            log_weight_table(&graph, &data);
            let params = initialize(&data, &graph, &train_idx, &mut rng)?;
            let decoder = BrodeDecoder::new(&params, &graph.weights, flags, &device)?;
            (graph, decoder)
        }
    };

    let mut train = InMemoryData::new(&data.u, &data.s, &data.time, &data.label, &train_idx)?;
    if config.weight_sample {
        train = train.with_weight(&inverse_frequency_weights(&data.label, &train_idx))?;
    }
    let test = if test_idx.is_empty() {
        None
    } else {
        Some(InMemoryData::new(&data.u, &data.s, &data.time, &data.label, &test_idx)?)
    };

    let train_config = config.train_config(device.clone(), args.verbose);
    let trace = trainer::fit(&decoder, &mut train, test.as_ref(), &config, &train_config, &mut rng)?;

    let prefix = OutputPrefix::new(&args.out, &args.key)?;
    decoder.save(&prefix.checkpoint())?;
    write_lines(&[config.to_json_pretty()?.into_boxed_str()], &prefix.config())?;

    let everyone: Vec<usize> = (0..data.num_cells()).collect();
    let all_cells = InMemoryData::new(&data.u, &data.s, &data.time, &data.label, &everyone)?;
    let prediction = predict_all(&decoder, &all_cells, &device, PREDICT_CHUNK)?;
    info!(
        "mean log-likelihood over all cells: {:.4}",
        prediction.llik.iter().sum::<f32>() / prediction.llik.len().max(1) as f32
    );

    let (velocity_u, velocity_s) =
        rna_velocity(&decoder, &prediction.uhat, &prediction.shat, &data.time, &data.label)?;

    FitResults {
        data: &data,
        graph: &graph,
        decoder: &decoder,
        prediction: &prediction,
        velocity_u: &velocity_u,
        velocity_s: &velocity_s,
        train_idx: &train_idx,
        test_idx: &test_idx,
        trace: &trace,
    }
    .write(&prefix)
}

/// Configured lineage if any, else the estimate from time and embedding
/// of the cells in `rows`
pub fn build_graph(
    data: &VeloData,
    rows: &[usize],
    config: &FitConfig,
    seed: u64,
) -> anyhow::Result<TransitionGraph> {
    let time: Vec<f32> = rows.iter().map(|&i| data.time[i]).collect();
    let label: Vec<usize> = rows.iter().map(|&i| data.label[i]).collect();

    match config.graph.lineage_graph.as_ref() {
        Some(lineage) => TransitionGraph::from_lineage(&data.cell_types, lineage, &time, &label),
        None => {
            let partition: Option<Vec<usize>> = data
                .partition
                .as_ref()
                .map(|part| rows.iter().map(|&i| part[i]).collect());
            TransitionGraph::build(
                &time,
                &data.embed.select_rows(rows),
                &label,
                data.num_types(),
                partition.as_deref(),
                &config.graph.to_args(seed),
            )
        }
    }
}

/// Steady-state starting values from the training cells
fn initialize<R: Rng + ?Sized>(
    data: &VeloData,
    graph: &TransitionGraph,
    train_idx: &[usize],
    rng: &mut R,
) -> anyhow::Result<KineticParams> {
    let time: Vec<f32> = train_idx.iter().map(|&i| data.time[i]).collect();
    let label: Vec<usize> = train_idx.iter().map(|&i| data.label[i]).collect();
    KineticParams::steady_state(
        &data.u.select_rows(train_idx),
        &data.s.select_rows(train_idx),
        &time,
        &label,
        &graph.parents,
        &graph.t_init,
        data.gene_params.as_ref(),
        &SteadyStateArgs::default(),
        rng,
    )
}

/// Random train/test split of `nn` cells, each part sorted
pub fn split_cells<R: Rng + ?Sized>(nn: usize, frac: f32, rng: &mut R) -> (Vec<usize>, Vec<usize>) {
    let mut cells: Vec<usize> = (0..nn).collect();
    cells.shuffle(rng);
    let n_train = ((nn as f32 * frac).round() as usize).min(nn);
    let mut test = cells.split_off(n_train);
    cells.sort_unstable();
    test.sort_unstable();
    (cells, test)
}

fn log_weight_table(graph: &TransitionGraph, data: &VeloData) {
    let names = data.cell_types.names();
    info!("transition weights (row: child, column: parent)");
    info!(
        "{:>12} {}",
        "",
        names.iter().map(|x| format!("{:>8.8}", x)).collect::<Vec<_>>().join(" ")
    );
    for (c, row) in graph.transition.row_iter().enumerate() {
        info!(
            "{:>12.12} {}",
            names[c],
            row.iter().map(|x| format!("{:>8.3}", x)).collect::<Vec<_>>().join(" ")
        );
    }
    for (c, &p) in graph.parents.iter().enumerate() {
        if p != c {
            debug!("{} <- {}", names[c], names[p]);
        }
    }
}
