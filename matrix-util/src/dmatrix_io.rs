use crate::common_io::{read_lines_of_words_delim, write_lines, Delimiter};
use crate::traits::*;
pub use nalgebra::{DMatrix, DVector};
use num_traits::Float;

use std::fmt::{Debug, Display};
use std::str::FromStr;

fn parse_cell<T>(x: &str, file: &str, line: usize) -> anyhow::Result<T>
where
    T: Float + FromStr,
{
    match x {
        "" | "NA" | "NaN" | "nan" => Ok(T::nan()),
        _ => x
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("{}: line {}: not a number `{}`", file, line + 1, x)),
    }
}

impl<T> IoOps for DMatrix<T>
where
    T: Float + nalgebra::Scalar + Send + Sync + FromStr + Display + Copy,
    <T as FromStr>::Err: Debug,
{
    type Scalar = T;
    type Mat = Self;

    fn read_file_delim(
        tsv_file: &str,
        delim: impl Into<Delimiter>,
        skip: Option<usize>,
    ) -> anyhow::Result<Self::Mat> {
        let hdr_line = match skip {
            Some(skip) => skip as i64,
            None => -1, // no skipping
        };

        let words = read_lines_of_words_delim(tsv_file, delim, hdr_line)?.lines;

        if words.is_empty() {
            return Err(anyhow::anyhow!("No data in file {}", tsv_file));
        }

        let ncols = words[0].len();
        let nrows = words.len();
        let mut data = Vec::with_capacity(nrows * ncols);
        for (i, row) in words.iter().enumerate() {
            if row.len() != ncols {
                anyhow::bail!("{}: ragged line {}", tsv_file, i + 1);
            }
            for x in row.iter() {
                data.push(parse_cell::<T>(x, tsv_file, i)?);
            }
        }

        Ok(DMatrix::<T>::from_row_iterator(nrows, ncols, data))
    }

    fn write_file_delim(&self, tsv_file: &str, delim: &str) -> anyhow::Result<()> {
        // par_iter() or par_bridge() will
        // mess up the order of the rows
        let lines = self
            .row_iter()
            .map(|row| {
                row.iter()
                    .map(|x| format!("{}", *x))
                    .collect::<Vec<String>>()
                    .join(delim)
                    .into_boxed_str()
            })
            .collect::<Vec<_>>();

        write_lines(&lines, tsv_file)?;
        Ok(())
    }

    fn read_named(
        file: &str,
        delim: impl Into<Delimiter>,
    ) -> anyhow::Result<MatWithNames<Self::Mat>> {
        let out = read_lines_of_words_delim(file, delim, 0)?;

        if out.lines.is_empty() {
            return Err(anyhow::anyhow!("No data in file {}", file));
        }

        let nfields = out.lines[0].len();
        if nfields < 2 {
            anyhow::bail!("{}: expected row names and at least one column", file);
        }
        let ncols = nfields - 1;

        // the header may or may not carry a corner cell
        let cols: Vec<Box<str>> = if out.header.len() == nfields {
            out.header[1..].to_vec()
        } else if out.header.len() == ncols {
            out.header.clone()
        } else {
            anyhow::bail!(
                "{}: header has {} fields but rows have {}",
                file,
                out.header.len(),
                nfields
            );
        };

        let nrows = out.lines.len();
        let mut rows = Vec::with_capacity(nrows);
        let mut data = Vec::with_capacity(nrows * ncols);

        for (i, words) in out.lines.iter().enumerate() {
            if words.len() != nfields {
                anyhow::bail!("{}: ragged line {}", file, i + 2);
            }
            rows.push(words[0].clone());
            for x in words[1..].iter() {
                data.push(parse_cell::<T>(x, file, i + 1)?);
            }
        }

        Ok(MatWithNames {
            rows,
            cols,
            mat: DMatrix::<T>::from_row_iterator(nrows, ncols, data),
        })
    }

    fn write_named(
        &self,
        file: &str,
        rows: &[Box<str>],
        cols: &[Box<str>],
    ) -> anyhow::Result<()> {
        if rows.len() != self.nrows() || cols.len() != self.ncols() {
            anyhow::bail!(
                "names ({} x {}) don't match the matrix ({} x {})",
                rows.len(),
                cols.len(),
                self.nrows(),
                self.ncols()
            );
        }

        let mut lines = Vec::with_capacity(self.nrows() + 1);
        let header = std::iter::once("name")
            .chain(cols.iter().map(|x| x.as_ref()))
            .collect::<Vec<_>>()
            .join("\t");
        lines.push(header.into_boxed_str());

        for (r, row) in rows.iter().zip(self.row_iter()) {
            let line = std::iter::once(r.to_string())
                .chain(row.iter().map(|x| format!("{}", *x)))
                .collect::<Vec<_>>()
                .join("\t");
            lines.push(line.into_boxed_str());
        }

        write_lines(&lines, file)
    }
}

impl MatOps for DMatrix<f32> {
    type Mat = Self;
    type Scalar = f32;

    fn centre_columns_inplace(&mut self) {
        for mut x_j in self.column_iter_mut() {
            let mu = x_j.mean();
            x_j.add_scalar_mut(-mu);
        }
    }

    fn scale_columns_inplace(&mut self) {
        let nn = (self.nrows().max(2) - 1) as f32;
        for mut x_j in self.column_iter_mut() {
            let mu = x_j.mean();
            x_j.add_scalar_mut(-mu);
            let sd = (x_j.norm_squared() / nn).sqrt();
            x_j.scale_mut(1.0 / (sd + 1e-8));
        }
    }

    fn scale_columns(&self) -> Self::Mat {
        let mut ret = self.clone();
        ret.scale_columns_inplace();
        ret
    }
}

impl SampleOps for DMatrix<f32> {
    type Mat = Self;
    type Scalar = f32;

    fn runif(dd: usize, nn: usize) -> Self::Mat {
        use rand::Rng;
        let mut rng = rand::rng();
        DMatrix::from_fn(dd, nn, |_, _| rng.random::<f32>())
    }

    fn rnorm(dd: usize, nn: usize) -> Self::Mat {
        use rand_distr::{Distribution, StandardNormal};
        let mut rng = rand::rng();
        DMatrix::from_fn(dd, nn, |_, _| StandardNormal.sample(&mut rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common_io::create_temp_dir_file;

    #[test]
    fn named_table_round_trip() -> anyhow::Result<()> {
        let xx = DMatrix::<f32>::runif(7, 3);
        let rows = (0..7).map(|i| format!("c{}", i).into_boxed_str()).collect::<Vec<_>>();
        let cols = (0..3).map(|j| format!("g{}", j).into_boxed_str()).collect::<Vec<_>>();

        let file = create_temp_dir_file(".tsv.gz")?;
        let file = file.to_str().unwrap();
        xx.write_named(file, &rows, &cols)?;

        let back = DMatrix::<f32>::read_named(file, "\t")?;
        assert_eq!(back.rows, rows);
        assert_eq!(back.cols, cols);
        approx::assert_abs_diff_eq!(back.mat, xx, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn scaled_columns_have_unit_sd() {
        let mut xx = DMatrix::<f32>::rnorm(200, 4) * 5.0;
        xx.scale_columns_inplace();
        for x_j in xx.column_iter() {
            let sd = (x_j.norm_squared() / 199.0).sqrt();
            approx::assert_abs_diff_eq!(x_j.mean(), 0.0, epsilon = 1e-4);
            approx::assert_abs_diff_eq!(sd, 1.0, epsilon = 1e-3);
        }
    }
}
