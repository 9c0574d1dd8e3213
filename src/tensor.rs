//! Dense row-major numeric blocks used throughout the protocols.
//!
//! Two closed numeric kinds exist: [`Matrix`] for real-valued data and
//! [`IntMatrix`] for fixed-point encoded integers. Both expose the same small
//! aggregate interface (`sum`, `min`, `max`), resolved once per block instead
//! of dispatching on an underlying backend per call.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// A dense row-major matrix of `f64` values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// Creates a matrix from row-major data; `data.len()` must be `rows * cols`.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        assert_eq!(data.len(), rows * cols, "row-major data must fill the matrix");
        Self { rows, cols, data }
    }

    /// Creates a matrix from a slice of equally sized rows.
    pub fn from_rows(rows: &[Vec<f64>]) -> Self {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            assert_eq!(row.len(), cols, "all rows must have the same length");
            data.extend_from_slice(row);
        }
        Self {
            rows: rows.len(),
            cols,
            data,
        }
    }

    /// A `rows` x `cols` matrix of zeros.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// A matrix with entries drawn uniformly from `[lo, hi)`.
    pub fn random(rows: usize, cols: usize, lo: f64, hi: f64, rng: &mut impl Rng) -> Self {
        let data = (0..rows * cols).map(|_| rng.random_range(lo..hi)).collect();
        Self { rows, cols, data }
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// The entry at `(r, c)`.
    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.data[r * self.cols + c]
    }

    /// Sets the entry at `(r, c)`.
    pub fn set(&mut self, r: usize, c: usize, v: f64) {
        self.data[r * self.cols + c] = v;
    }

    /// The underlying row-major data.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// The rows `range.0..range.1` as a new matrix.
    pub fn slice_rows(&self, start: usize, end: usize) -> Self {
        Self {
            rows: end - start,
            cols: self.cols,
            data: self.data[start * self.cols..end * self.cols].to_vec(),
        }
    }

    /// Appends a column of ones (used for intercept terms).
    pub fn with_ones_column(&self) -> Self {
        let cols = self.cols + 1;
        let mut data = Vec::with_capacity(self.rows * cols);
        for r in 0..self.rows {
            data.extend_from_slice(&self.data[r * self.cols..(r + 1) * self.cols]);
            data.push(1.0);
        }
        Self {
            rows: self.rows,
            cols,
            data,
        }
    }

    /// The transpose.
    pub fn transpose(&self) -> Self {
        let mut data = vec![0.0; self.data.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Self {
            rows: self.cols,
            cols: self.rows,
            data,
        }
    }

    /// Matrix product `self @ other`.
    pub fn matmul(&self, other: &Self) -> Self {
        assert_eq!(self.cols, other.rows, "inner dimensions must match");
        let mut out = Matrix::zeros(self.rows, other.cols);
        for r in 0..self.rows {
            for k in 0..self.cols {
                let a = self.data[r * self.cols + k];
                if a == 0.0 {
                    continue;
                }
                for c in 0..other.cols {
                    out.data[r * other.cols + c] += a * other.data[k * other.cols + c];
                }
            }
        }
        out
    }

    /// Element-wise sum.
    pub fn add(&self, other: &Self) -> Self {
        assert_eq!(self.shape(), other.shape(), "shapes must match");
        let data = self.data.iter().zip(&other.data).map(|(a, b)| a + b).collect();
        Self {
            rows: self.rows,
            cols: self.cols,
            data,
        }
    }

    /// Element-wise difference.
    pub fn sub(&self, other: &Self) -> Self {
        assert_eq!(self.shape(), other.shape(), "shapes must match");
        let data = self.data.iter().zip(&other.data).map(|(a, b)| a - b).collect();
        Self {
            rows: self.rows,
            cols: self.cols,
            data,
        }
    }

    /// Element-wise (Hadamard) product.
    pub fn hadamard(&self, other: &Self) -> Self {
        assert_eq!(self.shape(), other.shape(), "shapes must match");
        let data = self.data.iter().zip(&other.data).map(|(a, b)| a * b).collect();
        Self {
            rows: self.rows,
            cols: self.cols,
            data,
        }
    }

    /// Multiplies every entry by `factor`.
    pub fn scale(&self, factor: f64) -> Self {
        self.map(|x| x * factor)
    }

    /// Applies `f` to every entry.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|x| f(*x)).collect(),
        }
    }

    /// Sum of all entries.
    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Smallest entry (`NAN` for an empty matrix).
    pub fn min(&self) -> f64 {
        self.data.iter().copied().fold(f64::NAN, f64::min)
    }

    /// Largest entry (`NAN` for an empty matrix).
    pub fn max(&self) -> f64 {
        self.data.iter().copied().fold(f64::NAN, f64::max)
    }

    /// The Frobenius (l2) norm.
    pub fn norm(&self) -> f64 {
        self.data.iter().map(|x| x * x).sum::<f64>().sqrt()
    }
}

/// A dense row-major matrix of `i128` values, the carrier for fixed-point
/// encoded tensors and additive secret shares.
///
/// Arithmetic wraps mod 2^128: shares are elements of that ring, and a
/// recombined value is exact whenever the underlying plaintext fits `i128`,
/// no matter how far the individual shares wrapped on the way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntMatrix {
    rows: usize,
    cols: usize,
    data: Vec<i128>,
}

impl IntMatrix {
    /// Creates a matrix from row-major data; `data.len()` must be `rows * cols`.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<i128>) -> Self {
        assert_eq!(data.len(), rows * cols, "row-major data must fill the matrix");
        Self { rows, cols, data }
    }

    /// A `rows` x `cols` matrix of zeros.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0; rows * cols],
        }
    }

    /// A masking matrix with entries uniform over the full `i128` ring.
    ///
    /// A fresh full-ring mask makes the complementary share of any plaintext
    /// perfectly uniform, so a single share carries no information.
    pub fn random_mask(rows: usize, cols: usize, rng: &mut impl Rng) -> Self {
        let data = (0..rows * cols).map(|_| rng.random::<i128>()).collect();
        Self { rows, cols, data }
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// The entry at `(r, c)`.
    pub fn get(&self, r: usize, c: usize) -> i128 {
        self.data[r * self.cols + c]
    }

    /// The underlying row-major data.
    pub fn data(&self) -> &[i128] {
        &self.data
    }

    /// The transpose.
    pub fn transpose(&self) -> Self {
        let mut data = vec![0; self.data.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Self {
            rows: self.cols,
            cols: self.rows,
            data,
        }
    }

    /// Matrix product `self @ other`.
    pub fn matmul(&self, other: &Self) -> Self {
        assert_eq!(self.cols, other.rows, "inner dimensions must match");
        let mut out = IntMatrix::zeros(self.rows, other.cols);
        for r in 0..self.rows {
            for k in 0..self.cols {
                let a = self.data[r * self.cols + k];
                if a == 0 {
                    continue;
                }
                for c in 0..other.cols {
                    let cell = &mut out.data[r * other.cols + c];
                    *cell = cell.wrapping_add(a.wrapping_mul(other.data[k * other.cols + c]));
                }
            }
        }
        out
    }

    /// Element-wise sum.
    pub fn add(&self, other: &Self) -> Self {
        assert_eq!(self.shape(), other.shape(), "shapes must match");
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a.wrapping_add(*b))
            .collect();
        Self {
            rows: self.rows,
            cols: self.cols,
            data,
        }
    }

    /// Element-wise difference.
    pub fn sub(&self, other: &Self) -> Self {
        assert_eq!(self.shape(), other.shape(), "shapes must match");
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a.wrapping_sub(*b))
            .collect();
        Self {
            rows: self.rows,
            cols: self.cols,
            data,
        }
    }

    /// Element-wise bitwise xor.
    pub fn xor(&self, other: &Self) -> Self {
        assert_eq!(self.shape(), other.shape(), "shapes must match");
        let data = self.data.iter().zip(&other.data).map(|(a, b)| a ^ b).collect();
        Self {
            rows: self.rows,
            cols: self.cols,
            data,
        }
    }

    /// Negates every entry.
    pub fn neg(&self) -> Self {
        Self {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|x| x.wrapping_neg()).collect(),
        }
    }

    /// Multiplies every entry by `factor`.
    pub fn scale(&self, factor: i128) -> Self {
        Self {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|x| x.wrapping_mul(factor)).collect(),
        }
    }

    /// Flooring division of every entry by `divisor`.
    pub fn div_floor(&self, divisor: i128) -> Self {
        Self {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|x| x.div_euclid(divisor)).collect(),
        }
    }

    /// Sum of all entries as `f64`.
    pub fn sum(&self) -> f64 {
        self.data.iter().map(|x| *x as f64).sum()
    }

    /// Smallest entry (`NAN` for an empty matrix).
    pub fn min(&self) -> f64 {
        self.data.iter().map(|x| *x as f64).fold(f64::NAN, f64::min)
    }

    /// Largest entry (`NAN` for an empty matrix).
    pub fn max(&self) -> f64 {
        self.data.iter().map(|x| *x as f64).fold(f64::NAN, f64::max)
    }
}
