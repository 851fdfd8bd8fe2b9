use crate::common::*;
use crate::decoder::BrodeDecoder;
use crate::input::VeloData;
use crate::trainer::{Prediction, TrainTrace};
use crate::transition_graph::TransitionGraph;

use matrix_util::common_io::{mkdir, write_lines, write_types};
use matrix_util::traits::IoOps;

/// Output files named `{out}.{key}_{name}.tsv.gz`
pub struct OutputPrefix {
    out: Box<str>,
    key: Box<str>,
}

impl OutputPrefix {
    pub fn new(out: &str, key: &str) -> anyhow::Result<Self> {
        let ret = Self {
            out: out.into(),
            key: key.into(),
        };
        mkdir(&ret.file("cells"))?;
        Ok(ret)
    }

    pub fn file(&self, name: &str) -> String {
        format!("{}.{}_{}.tsv.gz", self.out, self.key, name)
    }

    pub fn checkpoint(&self) -> String {
        format!("{}.{}.safetensors", self.out, self.key)
    }

    pub fn config(&self) -> String {
        format!("{}.{}_config.json", self.out, self.key)
    }
}

/// Everything a finished fit writes back
pub struct FitResults<'a> {
    pub data: &'a VeloData,
    pub graph: &'a TransitionGraph,
    pub decoder: &'a BrodeDecoder,
    /// prediction of every cell in data order
    pub prediction: &'a Prediction,
    pub velocity_u: &'a Mat,
    pub velocity_s: &'a Mat,
    pub train_idx: &'a [usize],
    pub test_idx: &'a [usize],
    pub trace: &'a TrainTrace,
}

impl FitResults<'_> {
    pub fn write(&self, prefix: &OutputPrefix) -> anyhow::Result<()> {
        let data = self.data;
        let types: Vec<Box<str>> = data.cell_types.names().to_vec();

        self.write_cells(prefix)?;

        let gene_cols: Vec<Box<str>> = ["scaling", "sigma_u", "sigma_s"]
            .into_iter()
            .map(Box::from)
            .collect();
        let gene_mat = Mat::from_columns(&[
            self.decoder.scaling()?,
            self.decoder.sigma_u()?,
            self.decoder.sigma_s()?,
        ]);
        gene_mat.write_named(&prefix.file("genes"), &data.genes, &gene_cols)?;

        for (name, mat) in [
            ("alpha", self.decoder.alpha()?),
            ("beta", self.decoder.beta()?),
            ("gamma", self.decoder.gamma()?),
            ("u0", self.decoder.u0()?),
            ("s0", self.decoder.s0()?),
            ("ts", self.decoder.switch_times()?),
        ] {
            mat.write_named(&prefix.file(name), &types, &data.genes)?;
        }

        self.write_switch_times(prefix, &types)?;

        self.graph.weights.write_named(&prefix.file("w"), &types, &types)?;
        self.graph
            .transition
            .write_named(&prefix.file("transition"), &types, &types)?;

        let pred = self.prediction;
        pred.uhat.write_named(&prefix.file("uhat"), &data.cells, &data.genes)?;
        pred.shat.write_named(&prefix.file("shat"), &data.cells, &data.genes)?;
        self.velocity_u
            .write_named(&prefix.file("velocity_u"), &data.cells, &data.genes)?;
        self.velocity_s
            .write_named(&prefix.file("velocity_s"), &data.cells, &data.genes)?;

        write_types(self.train_idx, &prefix.file("train_idx"))?;
        write_types(self.test_idx, &prefix.file("test_idx"))?;

        let label_dic: Vec<Box<str>> = std::iter::once("label\tcode".into())
            .chain(
                types
                    .iter()
                    .enumerate()
                    .map(|(k, x)| format!("{}\t{}", x, k).into_boxed_str()),
            )
            .collect();
        write_lines(&label_dic, &prefix.file("label_dic"))?;

        self.write_loss(prefix)?;

        info!("wrote results to {}.{}_*", prefix.out, prefix.key);
        Ok(())
    }

    fn write_cells(&self, prefix: &OutputPrefix) -> anyhow::Result<()> {
        let data = self.data;
        let mut split = vec!["none"; data.num_cells()];
        for &i in self.train_idx {
            split[i] = "train";
        }
        for &i in self.test_idx {
            split[i] = "test";
        }

        let mut lines: Vec<Box<str>> = vec!["cell\ttime\tlabel\tcode\tsplit".into()];
        for (i, cell) in data.cells.iter().enumerate() {
            let k = data.label[i];
            lines.push(
                format!(
                    "{}\t{}\t{}\t{}\t{}",
                    cell,
                    data.time[i],
                    data.cell_types.name(k).unwrap_or("?"),
                    k,
                    split[i]
                )
                .into_boxed_str(),
            );
        }
        write_lines(&lines, &prefix.file("cells"))
    }

    /// Per-type switch time averaged over genes with the tree structure
    fn write_switch_times(&self, prefix: &OutputPrefix, types: &[Box<str>]) -> anyhow::Result<()> {
        let ts = self.decoder.switch_times()?;
        let graph = self.graph;

        let mut lines: Vec<Box<str>> = vec!["type\tswitch_time\tt_init\tpartition\tparent".into()];
        for (c, name) in types.iter().enumerate() {
            let parent = if graph.is_root(c) {
                "-"
            } else {
                types[graph.parents[c]].as_ref()
            };
            lines.push(
                format!(
                    "{}\t{}\t{}\t{}\t{}",
                    name,
                    ts.row(c).mean(),
                    graph.t_init[c],
                    graph.partition[c],
                    parent
                )
                .into_boxed_str(),
            );
        }
        write_lines(&lines, &prefix.file("t_trans"))
    }

    fn write_loss(&self, prefix: &OutputPrefix) -> anyhow::Result<()> {
        let trace = self.trace;
        let mut lines: Vec<Box<str>> = vec!["series\tstep\tvalue".into()];
        for (i, x) in trace.train_loss.iter().enumerate() {
            lines.push(format!("train_loss\t{}\t{}", i + 1, x).into_boxed_str());
        }
        for (step, x) in trace.test_steps.iter().zip(trace.test_llik.iter()) {
            lines.push(format!("test_llik\t{}\t{}", step, x).into_boxed_str());
        }
        write_lines(&lines, &prefix.file("loss"))
    }
}
