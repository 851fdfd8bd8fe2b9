use rand::prelude::SliceRandom;
use rand::Rng;

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition `samples`.
///
pub struct Minibatches {
    pub samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn new(samples: Vec<usize>) -> Self {
        Self {
            samples,
            chunks: vec![],
        }
    }

    /// Shuffle samples and cut them into consecutive chunks of
    /// `batch_size` (the last one may be smaller)
    pub fn shuffle_minibatch<R: Rng + ?Sized>(&mut self, batch_size: usize, rng: &mut R) {
        self.samples.shuffle(rng);
        let batch_size = batch_size.max(1);
        self.chunks = self
            .samples
            .chunks(batch_size)
            .map(|c| c.to_vec())
            .collect();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }
}
