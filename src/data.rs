//! Fixed-size batching over an in-memory feature block, the narrow data
//! interface consumed by the training loops.

use thiserror::Error;

use crate::tensor::Matrix;

/// Errors raised while constructing a batched dataset.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataError {
    /// The feature block has no rows.
    #[error("dataset has no rows")]
    Empty,
    /// The label column has a different number of rows than the features.
    #[error("labels have {labels} rows but features have {features}")]
    LabelRowMismatch {
        /// Label row count.
        labels: usize,
        /// Feature row count.
        features: usize,
    },
    /// The batch size must be positive.
    #[error("batch size must be positive")]
    ZeroBatchSize,
}

/// One fixed-size slice of features, with labels where the role holds them.
#[derive(Debug, Clone)]
pub struct Batch {
    /// The feature rows of this batch.
    pub x: Matrix,
    /// The matching label rows, absent for label-free roles.
    pub y: Option<Matrix>,
}

/// An in-memory feature block sliced into fixed-size batches; the last batch
/// may be short.
#[derive(Debug, Clone)]
pub struct BatchedDataset {
    features: Matrix,
    labels: Option<Matrix>,
    batch_size: usize,
}

impl BatchedDataset {
    /// Wraps a feature block (and labels, for label-holding roles) for
    /// batched iteration.
    pub fn new(
        features: Matrix,
        labels: Option<Matrix>,
        batch_size: usize,
    ) -> Result<Self, DataError> {
        if features.rows() == 0 {
            return Err(DataError::Empty);
        }
        if batch_size == 0 {
            return Err(DataError::ZeroBatchSize);
        }
        if let Some(y) = &labels {
            if y.rows() != features.rows() {
                return Err(DataError::LabelRowMismatch {
                    labels: y.rows(),
                    features: features.rows(),
                });
            }
        }
        Ok(Self {
            features,
            labels,
            batch_size,
        })
    }

    /// Total number of rows.
    pub fn num_rows(&self) -> usize {
        self.features.rows()
    }

    /// Number of feature columns.
    pub fn num_features(&self) -> usize {
        self.features.cols()
    }

    /// Number of batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.features.rows().div_ceil(self.batch_size)
    }

    /// The `i`-th batch of the epoch.
    ///
    /// # Panics
    /// Panics if `i >= num_batches()`.
    pub fn batch(&self, i: usize) -> Batch {
        assert!(i < self.num_batches(), "batch index out of range");
        let start = i * self.batch_size;
        let end = (start + self.batch_size).min(self.features.rows());
        Batch {
            x: self.features.slice_rows(start, end),
            y: self.labels.as_ref().map(|y| y.slice_rows(start, end)),
        }
    }

    /// Iterates over the epoch's batches in order.
    pub fn iter(&self) -> impl Iterator<Item = Batch> + '_ {
        (0..self.num_batches()).map(|i| self.batch(i))
    }
}
