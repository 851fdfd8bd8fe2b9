use crate::candle_data_loader_util::Minibatches;

use candle_core::{Device, Tensor};
use nalgebra::DMatrix;
use rand::Rng;

/// One minibatch of timed, labelled cells
pub struct MinibatchData {
    /// unspliced (n x g)
    pub u: Tensor,
    /// spliced (n x g)
    pub s: Tensor,
    /// cell time (n x 1)
    pub time: Tensor,
    /// cell type code (n), `u32`
    pub label: Tensor,
    /// sample weight (n x 1)
    pub weight: Option<Tensor>,
    /// positions of these cells in the loader
    pub index: Vec<usize>,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    fn num_data(&self) -> usize;

    fn shuffle_minibatch<R: Rng + ?Sized>(
        &mut self,
        batch_size: usize,
        rng: &mut R,
    ) -> anyhow::Result<()>;
}

/// Row-major `Tensor` (n x m) from a `DMatrix`
pub fn dmatrix_to_tensor(mat: &DMatrix<f32>, dev: &Device) -> candle_core::Result<Tensor> {
    let (nn, mm) = mat.shape();
    Tensor::from_iter(mat.transpose().iter().copied(), dev)?.reshape((nn, mm))
}

/// `DMatrix` from a 2d `Tensor`
pub fn tensor_to_dmatrix(x: &Tensor) -> candle_core::Result<DMatrix<f32>> {
    let (nn, mm) = x.dims2()?;
    let data = x
        .to_device(&Device::Cpu)?
        .to_dtype(candle_core::DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    Ok(DMatrix::from_row_slice(nn, mm, &data))
}

///
/// Timed cells held in memory. Each row is a cell; `u` and `s`
/// share the same genes (columns).
///
pub struct InMemoryData {
    u: Tensor,
    s: Tensor,
    time: Tensor,
    label: Tensor,
    weight: Option<Tensor>,
    minibatches: Minibatches,
}

impl InMemoryData {
    ///
    /// Create a data loader over the selected `rows`
    ///
    /// * `u` - unspliced (cells x genes)
    /// * `s` - spliced (cells x genes)
    /// * `time` - cell time
    /// * `label` - cell type codes
    /// * `rows` - cells to include
    ///
    pub fn new(
        u: &DMatrix<f32>,
        s: &DMatrix<f32>,
        time: &[f32],
        label: &[usize],
        rows: &[usize],
    ) -> anyhow::Result<Self> {
        if u.shape() != s.shape() {
            anyhow::bail!("unspliced {:?} and spliced {:?} differ", u.shape(), s.shape());
        }
        if time.len() != u.nrows() || label.len() != u.nrows() {
            anyhow::bail!(
                "{} cells, but {} times and {} labels",
                u.nrows(),
                time.len(),
                label.len()
            );
        }
        if let Some(&bad) = rows.iter().find(|&&r| r >= u.nrows()) {
            anyhow::bail!("row {} out of range {}", bad, u.nrows());
        }

        let dev = Device::Cpu;
        let u_sub = u.select_rows(rows);
        let s_sub = s.select_rows(rows);

        Ok(Self {
            u: dmatrix_to_tensor(&u_sub, &dev)?,
            s: dmatrix_to_tensor(&s_sub, &dev)?,
            time: Tensor::from_iter(rows.iter().map(|&r| time[r]), &dev)?.reshape((rows.len(), 1))?,
            label: Tensor::from_iter(rows.iter().map(|&r| label[r] as u32), &dev)?,
            weight: None,
            minibatches: Minibatches::new((0..rows.len()).collect()),
        })
    }

    /// Attach per-cell weights, one for each included row
    pub fn with_weight(mut self, weight: &[f32]) -> anyhow::Result<Self> {
        let nn = self.minibatches.size();
        if weight.len() != nn {
            anyhow::bail!("{} weights for {} cells", weight.len(), nn);
        }
        self.weight = Some(Tensor::from_slice(weight, (nn, 1), &Device::Cpu)?);
        Ok(self)
    }

    pub fn num_genes(&self) -> usize {
        self.u.dims()[1]
    }

    /// All data at once on the target device
    pub fn full_data(&self, target_device: &Device) -> anyhow::Result<MinibatchData> {
        self.take(&(0..self.minibatches.size()).collect::<Vec<_>>(), target_device)
    }

    fn take(&self, index: &[usize], target_device: &Device) -> anyhow::Result<MinibatchData> {
        let idx = Tensor::from_iter(index.iter().map(|&i| i as u32), &Device::Cpu)?;
        let pick = |x: &Tensor| -> anyhow::Result<Tensor> {
            Ok(x.index_select(&idx, 0)?.to_device(target_device)?)
        };
        Ok(MinibatchData {
            u: pick(&self.u)?,
            s: pick(&self.s)?,
            time: pick(&self.time)?,
            label: pick(&self.label)?,
            weight: self.weight.as_ref().map(pick).transpose()?,
            index: index.to_vec(),
        })
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        let chunk = self.minibatches.chunks.get(batch_idx).ok_or(anyhow::anyhow!(
            "minibatch #{} out of {}; shuffle first",
            batch_idx,
            self.minibatches.num_chunks()
        ))?;
        self.take(chunk, target_device)
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.num_chunks()
    }

    fn num_data(&self) -> usize {
        self.minibatches.size()
    }

    fn shuffle_minibatch<R: Rng + ?Sized>(
        &mut self,
        batch_size: usize,
        rng: &mut R,
    ) -> anyhow::Result<()> {
        self.minibatches.shuffle_minibatch(batch_size, rng);
        Ok(())
    }
}
