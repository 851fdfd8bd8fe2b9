use crate::cell_types::CellTypes;
use crate::common::*;
use crate::init_params::GeneParams;

use fnv::FnvHashMap as HashMap;
use matrix_util::common_io::{detect_delimiter, read_lines_of_words_delim};
use matrix_util::traits::{IoOps, MatWithNames};

/// Where the dataset lives and which annotation columns to use
#[derive(Debug, Clone)]
pub struct VeloFiles {
    /// unspliced counts (cells x genes)
    pub unspliced: Box<str>,
    /// spliced counts (cells x genes)
    pub spliced: Box<str>,
    /// per-cell annotation table
    pub annotation: Box<str>,
    /// cell embedding (cells x dims)
    pub embedding: Box<str>,
    /// optional per-gene table with `{key}_scaling`, `{key}_sigma_u`, `{key}_sigma_s`
    pub gene_params: Option<Box<str>>,
    pub type_column: Box<str>,
    pub time_column: Box<str>,
    pub partition_column: Option<Box<str>>,
    pub key: Box<str>,
}

/// Timed, typed cells with their unspliced and spliced counts
pub struct VeloData {
    pub cells: Vec<Box<str>>,
    pub genes: Vec<Box<str>>,
    /// unspliced (cells x genes)
    pub u: Mat,
    /// spliced (cells x genes)
    pub s: Mat,
    pub time: Vec<f32>,
    pub cell_types: CellTypes,
    /// type code of each cell
    pub label: Vec<usize>,
    /// embedding (cells x dims)
    pub embed: Mat,
    /// precomputed lineage partition of each cell
    pub partition: Option<Vec<usize>>,
    pub gene_params: Option<GeneParams>,
}

impl VeloData {
    pub fn load(files: &VeloFiles) -> anyhow::Result<Self> {
        let u = read_table(&files.unspliced)?;
        let s = read_table(&files.spliced)?;

        if u.mat.shape() != s.mat.shape() {
            anyhow::bail!(
                "unspliced {:?} and spliced {:?} have different shapes",
                u.mat.shape(),
                s.mat.shape()
            );
        }
        if u.rows != s.rows || u.cols != s.cols {
            anyhow::bail!(
                "{} and {} disagree on cell or gene names",
                files.unspliced,
                files.spliced
            );
        }
        let cells = u.rows;
        let genes = u.cols;

        let annot = Annotation::read(&files.annotation)?;
        let rows = annot.align(&cells)?;
        let type_col = annot.column(&files.type_column)?;
        let time_col = annot.column(&files.time_column)?;

        let labels: Vec<&str> = rows.iter().map(|&r| annot.get(r, type_col)).collect();
        let cell_types = CellTypes::from_labels(&labels);
        let label = cell_types.encode(&labels)?;

        let time = rows
            .iter()
            .map(|&r| {
                let x = annot.get(r, time_col);
                x.parse::<f32>().map_err(|_| {
                    anyhow::anyhow!(
                        "{}: cell `{}` has a non-numeric `{}`: `{}`",
                        files.annotation,
                        annot.names[r],
                        files.time_column,
                        x
                    )
                })
            })
            .collect::<anyhow::Result<Vec<f32>>>()?;

        let partition = match files.partition_column.as_deref() {
            Some(col) => {
                let j = annot.column(col)?;
                let values: Vec<&str> = rows.iter().map(|&r| annot.get(r, j)).collect();
                let groups = CellTypes::from_labels(&values);
                Some(groups.encode(&values)?)
            }
            None => None,
        };

        let embed = read_table(&files.embedding)?;
        let embed = align_rows(&embed, &cells, &files.embedding)?;

        let gene_params = match files.gene_params.as_deref() {
            Some(file) => Some(read_gene_params(file, &genes, &files.key)?),
            None => None,
        };

        info!(
            "loaded {} cells x {} genes, {} cell types, {}-dimensional embedding",
            cells.len(),
            genes.len(),
            cell_types.len(),
            embed.ncols()
        );

        Ok(Self {
            cells,
            genes,
            u: u.mat,
            s: s.mat,
            time,
            cell_types,
            label,
            embed,
            partition,
            gene_params,
        })
    }

    pub fn num_cells(&self) -> usize {
        self.u.nrows()
    }

    pub fn num_genes(&self) -> usize {
        self.u.ncols()
    }

    pub fn num_types(&self) -> usize {
        self.cell_types.len()
    }
}

fn read_table(file: &str) -> anyhow::Result<MatWithNames<Mat>> {
    Mat::read_named(file, detect_delimiter(file))
        .map_err(|e| anyhow::anyhow!("failed to read {}: {}", file, e))
}

/// Rows of `table` reordered to follow `names`
fn align_rows(table: &MatWithNames<Mat>, names: &[Box<str>], file: &str) -> anyhow::Result<Mat> {
    if table.rows == names {
        return Ok(table.mat.clone());
    }
    let pos: HashMap<&str, usize> = table
        .rows
        .iter()
        .enumerate()
        .map(|(i, x)| (x.as_ref(), i))
        .collect();
    let rows = names
        .iter()
        .map(|x| {
            pos.get(x.as_ref())
                .copied()
                .ok_or(anyhow::anyhow!("{} has no row for `{}`", file, x))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(table.mat.select_rows(&rows))
}

/// Per-gene scaling and noise levels, `{key}_`-prefixed columns
fn read_gene_params(file: &str, genes: &[Box<str>], key: &str) -> anyhow::Result<GeneParams> {
    let table = read_table(file)?;
    let mat = align_rows(&table, genes, file)?;

    let column = |suffix: &str| -> anyhow::Result<DVec> {
        let name = format!("{}_{}", key, suffix);
        let j = table
            .cols
            .iter()
            .position(|x| x.as_ref() == name)
            .ok_or(anyhow::anyhow!("{} has no column `{}`", file, name))?;
        let v = mat.column(j).clone_owned();
        if let Some(bad) = v.iter().find(|x| !(x.is_finite() && **x > 0.0)) {
            anyhow::bail!("{}: `{}` must be positive, found {}", file, name, bad);
        }
        Ok(v)
    };

    Ok(GeneParams {
        scaling: column("scaling")?,
        sigma_u: column("sigma_u")?,
        sigma_s: column("sigma_s")?,
    })
}

/// Text table of cell annotations, first column holding cell names
struct Annotation {
    file: Box<str>,
    header: Vec<Box<str>>,
    names: Vec<Box<str>>,
    fields: Vec<Vec<Box<str>>>,
}

impl Annotation {
    fn read(file: &str) -> anyhow::Result<Self> {
        let out = read_lines_of_words_delim(file, detect_delimiter(file), 0)?;
        let nfields = out.lines.first().map_or(0, |x| x.len());
        if nfields < 2 {
            anyhow::bail!("{}: expected cell names and at least one column", file);
        }

        // with or without a corner cell
        let header = if out.header.len() == nfields {
            out.header[1..].to_vec()
        } else if out.header.len() + 1 == nfields {
            out.header
        } else {
            anyhow::bail!(
                "{}: header has {} fields but rows have {}",
                file,
                out.header.len(),
                nfields
            );
        };

        let mut names = Vec::with_capacity(out.lines.len());
        let mut fields = Vec::with_capacity(out.lines.len());
        for (i, mut words) in out.lines.into_iter().enumerate() {
            if words.len() != nfields {
                anyhow::bail!("{}: ragged line {}", file, i + 2);
            }
            let rest = words.split_off(1);
            names.push(words.swap_remove(0));
            fields.push(rest);
        }

        Ok(Self {
            file: file.into(),
            header,
            names,
            fields,
        })
    }

    fn column(&self, name: &str) -> anyhow::Result<usize> {
        self.header
            .iter()
            .position(|x| x.as_ref() == name)
            .ok_or(anyhow::anyhow!(
                "{}: missing column `{}` (have: {})",
                self.file,
                name,
                self.header.join(", ")
            ))
    }

    fn get(&self, row: usize, col: usize) -> &str {
        &self.fields[row][col]
    }

    /// Annotation row of every cell in `cells`
    fn align(&self, cells: &[Box<str>]) -> anyhow::Result<Vec<usize>> {
        let pos: HashMap<&str, usize> = self
            .names
            .iter()
            .enumerate()
            .map(|(i, x)| (x.as_ref(), i))
            .collect();
        cells
            .iter()
            .map(|x| {
                pos.get(x.as_ref())
                    .copied()
                    .ok_or(anyhow::anyhow!("{} has no annotation for cell `{}`", self.file, x))
            })
            .collect()
    }
}
