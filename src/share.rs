//! Additive arithmetic shares of fixed-point matrices.
//!
//! A plaintext matrix is encoded to integers (see [`crate::fixedpoint`]) and
//! split into per-party summands: the summands carry no information about
//! the plaintext individually, and summing all of them recovers the encoded
//! value exactly. Shares are elements of the wrapping `i128` ring, split
//! with masks uniform over the full ring, so one share is perfectly uniform
//! and the recombined sum is exact for any plaintext that fits the ring.

use rand::Rng;
use thiserror::Error;

use crate::channel::{ChannelError, Communicator, ReduceOp};
use crate::fixedpoint::FixedPointEncoder;
use crate::tensor::{IntMatrix, Matrix};
use crate::transport::Transport;

/// Errors raised by the sharing layer.
#[derive(Debug, Error)]
pub enum ShareError {
    /// A channel operation failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// Two shares (or a share and a plaintext) have different shapes.
    #[error("shape mismatch: ({0}, {1}) vs ({2}, {3})")]
    ShapeMismatch(usize, usize, usize, usize),
    /// Two shares carry the fixed-point scale a different number of times.
    #[error("scale mismatch: shares at scale powers {0} and {1}")]
    ScaleMismatch(u32, u32),
    /// The local rank is not a member of the active group.
    #[error("rank {rank} is not a member of the active group")]
    NotAMember {
        /// The local rank.
        rank: usize,
    },
}

/// One party's additive share of an encoded matrix.
///
/// `scale_pow` records how many factors of the fixed-point scale the encoded
/// value carries; fresh shares of a plaintext carry one, products of two
/// single-scale values carry two until truncated.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ArithmeticShare {
    value: IntMatrix,
    scale_pow: u32,
}

impl ArithmeticShare {
    /// Wraps an already-encoded matrix as a share.
    pub fn from_encoded(value: IntMatrix, scale_pow: u32) -> Self {
        Self { value, scale_pow }
    }

    /// A zero share of the given shape at a single scale.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            value: IntMatrix::zeros(rows, cols),
            scale_pow: 1,
        }
    }

    /// The share's shape.
    pub fn shape(&self) -> (usize, usize) {
        self.value.shape()
    }

    /// How many factors of the fixed-point scale this share carries.
    pub fn scale_pow(&self) -> u32 {
        self.scale_pow
    }

    /// The raw encoded matrix.
    pub fn encoded(&self) -> &IntMatrix {
        &self.value
    }

    /// Consumes the share, returning the raw encoded matrix.
    pub fn into_encoded(self) -> IntMatrix {
        self.value
    }

    /// Element-wise sum of two shares; shares of `x` and `y` become a share
    /// of `x + y`.
    pub fn add(&self, other: &Self) -> Result<Self, ShareError> {
        self.check_compatible(other)?;
        Ok(Self {
            value: self.value.add(&other.value),
            scale_pow: self.scale_pow,
        })
    }

    /// Element-wise difference of two shares.
    pub fn sub(&self, other: &Self) -> Result<Self, ShareError> {
        self.check_compatible(other)?;
        Ok(Self {
            value: self.value.sub(&other.value),
            scale_pow: self.scale_pow,
        })
    }

    /// Negation; a share of `x` becomes a share of `-x`.
    pub fn neg(&self) -> Self {
        Self {
            value: self.value.neg(),
            scale_pow: self.scale_pow,
        }
    }

    /// Multiplies by a public plaintext scalar. The factor is encoded to the
    /// ring and the extra scale is truncated away immediately, so the result
    /// stays at this share's scale power.
    pub fn scale_by(&self, factor: f64, encoder: &FixedPointEncoder) -> Self {
        let encoded = encoder.encode_scalar(factor);
        Self {
            value: encoder.truncate(&self.value.scale(encoded)),
            scale_pow: self.scale_pow,
        }
    }

    /// Divides out one factor of the scale, e.g. after a product of two
    /// single-scale shares.
    pub fn truncate(&self, encoder: &FixedPointEncoder) -> Self {
        Self {
            value: encoder.truncate(&self.value),
            scale_pow: self.scale_pow.saturating_sub(1),
        }
    }

    fn check_compatible(&self, other: &Self) -> Result<(), ShareError> {
        let (r, c) = self.value.shape();
        let (or, oc) = other.value.shape();
        if (r, c) != (or, oc) {
            return Err(ShareError::ShapeMismatch(r, c, or, oc));
        }
        if self.scale_pow != other.scale_pow {
            return Err(ShareError::ScaleMismatch(self.scale_pow, other.scale_pow));
        }
        Ok(())
    }
}

/// Splits `src`'s plaintext into additive shares across the active group.
///
/// The source encodes its input, hands a fresh uniform mask to every other
/// member and keeps the difference; every other member passes `None` and
/// receives its mask as its share. One tensor send/recv index is consumed
/// per pairing.
pub async fn share_from<T, R>(
    comm: &mut Communicator<T>,
    plain: Option<&Matrix>,
    src: usize,
    encoder: &FixedPointEncoder,
    rng: &mut R,
) -> Result<ArithmeticShare, ShareError>
where
    T: Transport,
    R: Rng,
{
    let ranks = comm.active_ranks();
    if !ranks.contains(&comm.rank()) {
        return Err(ShareError::NotAMember { rank: comm.rank() });
    }
    if comm.rank() == src {
        let plain = plain.ok_or(ChannelError::MissingInput("share_from source plaintext"))?;
        let mut keep = encoder.encode(plain);
        for dst in ranks.iter().filter(|r| **r != src) {
            let (rows, cols) = keep.shape();
            let mask = IntMatrix::random_mask(rows, cols, rng);
            keep = keep.sub(&mask);
            comm.send(&mask, *dst).await?;
        }
        Ok(ArithmeticShare::from_encoded(keep, 1))
    } else {
        let mask: IntMatrix = comm.recv(src).await?;
        Ok(ArithmeticShare::from_encoded(mask, 1))
    }
}

/// Reconstructs the plaintext at `dst` only: shares are summed there via a
/// reduce and decoded at the share's scale power. All other members return
/// `Ok(None)` and learn nothing.
pub async fn reveal<T: Transport>(
    comm: &mut Communicator<T>,
    share: &ArithmeticShare,
    dst: usize,
    encoder: &FixedPointEncoder,
) -> Result<Option<Matrix>, ShareError> {
    let scale_pow = share.scale_pow;
    let summed = comm
        .reduce(share.value.clone(), dst, ReduceOp::Sum)
        .await?;
    Ok(summed.map(|m| encoder.decode_scaled(&m, scale_pow)))
}

/// Reconstructs the plaintext at every member of the active group.
pub async fn reveal_all<T: Transport>(
    comm: &mut Communicator<T>,
    share: &ArithmeticShare,
    encoder: &FixedPointEncoder,
) -> Result<Matrix, ShareError> {
    let scale_pow = share.scale_pow;
    let summed = comm.all_reduce(share.value.clone(), ReduceOp::Sum).await?;
    Ok(encoder.decode_scaled(&summed, scale_pow))
}
