//! Lossy fixed-point codec between real tensors and scaled integers.
//!
//! Real values are represented as integers scaled by `2^precision_bits`. The
//! encoding is exact for integers and accurate to `2^-precision_bits` for
//! everything else. A product of two encoded tensors carries the scale twice;
//! protocol code pairs every such multiplication with exactly one
//! [`FixedPointEncoder::truncate`] (or decodes with the matching power via
//! [`FixedPointEncoder::decode_scaled`]) to return to single precision.

use serde::{Deserialize, Serialize};

use crate::tensor::{IntMatrix, Matrix};

/// Default number of fractional bits.
pub const DEFAULT_PRECISION_BITS: u32 = 16;

/// Encoder/decoder between [`Matrix`] and fixed-point [`IntMatrix`] blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedPointEncoder {
    precision_bits: u32,
}

impl Default for FixedPointEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_PRECISION_BITS)
    }
}

impl FixedPointEncoder {
    /// An encoder with the given number of fractional bits.
    pub fn new(precision_bits: u32) -> Self {
        Self { precision_bits }
    }

    /// The number of fractional bits.
    pub fn precision_bits(&self) -> u32 {
        self.precision_bits
    }

    /// The scale factor `2^precision_bits`.
    pub fn scale(&self) -> i128 {
        1i128 << self.precision_bits
    }

    /// Encodes a single real value as a scaled integer.
    pub fn encode_scalar(&self, x: f64) -> i128 {
        (x * self.scale() as f64).round() as i128
    }

    /// Encodes a real tensor as a singly scaled integer tensor.
    pub fn encode(&self, m: &Matrix) -> IntMatrix {
        self.encode_scaled(m, 1)
    }

    /// Encodes a real tensor at scale `2^(precision_bits * pow)`.
    ///
    /// Used when a plaintext term must be added to a ciphertext that already
    /// carries the scale `pow` times.
    pub fn encode_scaled(&self, m: &Matrix, pow: u32) -> IntMatrix {
        let factor = (self.scale() as f64).powi(pow as i32);
        let data = m.data().iter().map(|x| (x * factor).round() as i128).collect();
        IntMatrix::from_vec(m.rows(), m.cols(), data)
    }

    /// Decodes a singly scaled integer tensor back to reals.
    pub fn decode(&self, m: &IntMatrix) -> Matrix {
        self.decode_scaled(m, 1)
    }

    /// Decodes an integer tensor carrying the scale `pow` times.
    pub fn decode_scaled(&self, m: &IntMatrix, pow: u32) -> Matrix {
        let factor = (self.scale() as f64).powi(pow as i32);
        let data = m.data().iter().map(|x| *x as f64 / factor).collect();
        Matrix::from_vec(m.rows(), m.cols(), data)
    }

    /// Divides once by the scale, reducing a double-scale product back to
    /// single precision. Must be paired 1:1 with each multiplication of two
    /// encoded tensors.
    pub fn truncate(&self, m: &IntMatrix) -> IntMatrix {
        m.div_floor(self.scale())
    }
}
