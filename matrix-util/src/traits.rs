use crate::common_io::Delimiter;

/// A matrix together with its row and column names
pub struct MatWithNames<M> {
    pub rows: Vec<Box<str>>,
    pub cols: Vec<Box<str>>,
    pub mat: M,
}

/// Normalize or scale columns
pub trait MatOps {
    type Mat;
    type Scalar;

    fn scale_columns_inplace(&mut self);
    fn scale_columns(&self) -> Self::Mat;
    fn centre_columns_inplace(&mut self);
}

/// Operations to sample random matrices
pub trait SampleOps {
    type Mat;
    type Scalar;

    /// Sample a matrix from a uniform distribution `U(0,1)`
    fn runif(dd: usize, nn: usize) -> Self::Mat;

    /// Sample a matrix from a normal distribution `N(0,1)`
    fn rnorm(dd: usize, nn: usize) -> Self::Mat;
}

/// Read and write matrices from and to files
pub trait IoOps {
    type Scalar;
    type Mat;

    fn read_file_delim(
        file: &str,
        delim: impl Into<Delimiter>,
        skip: Option<usize>,
    ) -> anyhow::Result<Self::Mat>;

    fn from_tsv(tsv_file: &str, skip: Option<usize>) -> anyhow::Result<Self::Mat> {
        Self::read_file_delim(tsv_file, "\t", skip)
    }

    fn write_file_delim(&self, file: &str, delim: &str) -> anyhow::Result<()>;

    fn to_tsv(&self, tsv_file: &str) -> anyhow::Result<()> {
        self.write_file_delim(tsv_file, "\t")
    }

    /// Read a table with a header line of column names and the
    /// first column holding row names.
    fn read_named(file: &str, delim: impl Into<Delimiter>)
        -> anyhow::Result<MatWithNames<Self::Mat>>;

    /// Write a table with a header line and row names
    fn write_named(
        &self,
        file: &str,
        rows: &[Box<str>],
        cols: &[Box<str>],
    ) -> anyhow::Result<()>;
}
