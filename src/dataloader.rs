//! Data loader

use std::collections::HashSet;

use rand::{Rng, seq::SliceRandom, seq::index};
use thiserror::Error;

use crate::tensor::{Tensor, TensorError};

/// Errors for the dataloader
#[derive(Debug, Error)]
pub enum DataLoaderError {
    #[error(
        "All input vectors must have the same dimension. Received different sizes: {input_dims:?}"
    )]
    InputDimensionMismatch { input_dims: HashSet<usize> },
    #[error("Targets must have the same length as the data")]
    TargetLengthMismatch { target_len: usize, data_len: usize },
    #[error("Batch size must be between 1 and the dataset size ({data_len}), got {batch_size}")]
    InvalidBatchSize { batch_size: usize, data_len: usize },
    #[error("The dataset is empty")]
    Empty,
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Data loader, returns batches of inputs and targets optionally shuffled
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
pub struct DataLoader {
    data: Vec<Vec<f32>>,
    targets: Vec<Vec<f32>>,
    batch_size: usize,
    shuffle: bool,
}

fn common_dim(rows: &[Vec<f32>]) -> Result<usize, DataLoaderError> {
    let input_dims = rows.iter().map(|d| d.len()).collect::<HashSet<_>>();
    if input_dims.len() > 1 || input_dims.contains(&0) {
        return Err(DataLoaderError::InputDimensionMismatch { input_dims });
    }
    input_dims.into_iter().next().ok_or(DataLoaderError::Empty)
}

impl DataLoader {
    pub fn new(
        data: Vec<Vec<f32>>,
        targets: Vec<Vec<f32>>,
        batch_size: usize,
        shuffle: bool,
    ) -> Result<Self, DataLoaderError> {
        if data.len() != targets.len() {
            return Err(DataLoaderError::TargetLengthMismatch {
                target_len: targets.len(),
                data_len: data.len(),
            });
        }
        common_dim(&data)?;
        common_dim(&targets)?;
        if batch_size == 0 || batch_size > data.len() {
            return Err(DataLoaderError::InvalidBatchSize {
                batch_size,
                data_len: data.len(),
            });
        }
        Ok(Self {
            data,
            targets,
            batch_size,
            shuffle,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn batch(&self, indices: &[usize]) -> Result<(Tensor, Tensor), DataLoaderError> {
        let inputs = indices.iter().map(|&i| &self.data[i]).collect::<Vec<_>>();
        let targets = indices.iter().map(|&i| &self.targets[i]).collect::<Vec<_>>();
        Ok((Tensor::from_rows(&inputs)?, Tensor::from_rows(&targets)?))
    }

    /// Draws `batch_size` distinct examples at random, as `(inputs, targets)` tensors
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Result<(Tensor, Tensor), DataLoaderError> {
        let indices = index::sample(rng, self.data.len(), self.batch_size).into_vec();
        self.batch(&indices)
    }

    /// One pass over the dataset, shuffled with `rng` if the loader shuffles
    pub fn iter_with_rng<R: Rng>(&self, rng: &mut R) -> DataLoaderIterator<'_> {
        let mut indices = (0..self.data.len()).collect::<Vec<_>>();
        if self.shuffle {
            indices.shuffle(rng);
        }
        DataLoaderIterator {
            loader: self,
            indices,
            curr_iter: 0,
        }
    }

    pub fn iter(&self) -> DataLoaderIterator<'_> {
        self.iter_with_rng(&mut rand::rng())
    }
}

/// An iterator which returns full mini batches of inputs and targets until the end of the dataset.
/// A trailing partial batch is dropped, so every batch has the same shape.
pub struct DataLoaderIterator<'a> {
    loader: &'a DataLoader,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

impl Iterator for DataLoaderIterator<'_> {
    type Item = (Tensor, Tensor);

    fn next(&mut self) -> Option<Self::Item> {
        let end = self.curr_iter + self.loader.batch_size;
        if end > self.indices.len() {
            return None;
        }
        // rows were checked for a common width in `DataLoader::new`, so building cannot fail
        let batch = self.loader.batch(&self.indices[self.curr_iter..end]);
        debug_assert!(batch.is_ok(), "batch construction failed: {:?}", batch.as_ref().err());
        self.curr_iter = end;
        batch.ok()
    }
}
