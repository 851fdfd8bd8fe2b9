use candle_core::{Result, Tensor};

/// A decoder that maps (time, cell type) of each cell to its
/// predicted unspliced and spliced abundance
pub trait BranchDecoderT {
    /// Predict unspliced and spliced means
    ///
    /// # Arguments
    /// * `t_n1` - cell time (n x 1)
    /// * `y_n` - cell type codes (n), `u32`
    /// * `neg_slope` - leak of the non-negativity clipping (0 = hard clip)
    ///
    /// # Returns `(uhat_nd, shat_nd)`
    fn forward_t(&self, t_n1: &Tensor, y_n: &Tensor, neg_slope: f64) -> Result<(Tensor, Tensor)>;

    /// Predict and evaluate the log-likelihood of observed data
    /// * `llik` - fn (observed u, observed s, uhat, shat) -> log-likelihood (n)
    fn forward_with_llik<LlikFn>(
        &self,
        t_n1: &Tensor,
        y_n: &Tensor,
        u_nd: &Tensor,
        s_nd: &Tensor,
        neg_slope: f64,
        llik: &LlikFn,
    ) -> Result<(Tensor, Tensor, Tensor)>
    where
        LlikFn: Fn(&Tensor, &Tensor, &Tensor, &Tensor) -> Result<Tensor>,
    {
        let (uhat, shat) = self.forward_t(t_n1, y_n, neg_slope)?;
        let llik = llik(u_nd, s_nd, &uhat, &shat)?;
        Ok((uhat, shat, llik))
    }

    /// number of genes
    fn dim_obs(&self) -> usize;

    /// number of cell types
    fn num_types(&self) -> usize;
}
