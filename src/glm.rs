//! Coordinated generalized-linear-model training across guest, host and
//! arbiter.
//!
//! The guest holds features and labels, the host holds additional features
//! for the same rows, and the arbiter holds the Paillier private key but no
//! data. Per batch, guest and host exchange encrypted partial predictions,
//! derive encrypted gradient contributions and ship them to the arbiter,
//! which decrypts, returns plaintext gradients and tracks convergence. The
//! nonlinearity of each family is folded into the encrypted residual via a
//! Taylor approximation, since the cipher only supports addition and
//! plaintext multiplication.
//!
//! All traffic flows through three pair-wise sub-groups (guest-host,
//! guest-arbiter, host-arbiter) so each pairing's tag counters advance in
//! lockstep regardless of what the third party is doing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::{ChannelError, Communicator, GroupId};
use crate::data::DataError;
use crate::fixedpoint::{DEFAULT_PRECISION_BITS, FixedPointEncoder};
use crate::optim::{ConvergeCriterion, LrMethod, LrScheduler, Optimizer, Penalty};
use crate::phe::{CipherMatrix, PheError};
use crate::tensor::Matrix;
use crate::transport::Transport;

pub mod arbiter;
pub mod guest;
pub mod host;

/// Errors raised by the coordinated training loop.
#[derive(Debug, Error)]
pub enum GlmError {
    /// A channel operation failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// A cipher operation failed.
    #[error(transparent)]
    Phe(#[from] PheError),
    /// The dataset is malformed.
    #[error(transparent)]
    Data(#[from] DataError),
    /// The guest dataset carries no labels.
    #[error("the guest role requires labels")]
    MissingLabels,
    /// The peers disagree on per-epoch structure.
    #[error("batch count mismatch: local {local}, peer {peer}")]
    BatchCountMismatch {
        /// Locally derived batch count.
        local: usize,
        /// The peer's batch count.
        peer: usize,
    },
    /// The host's partials are missing a field this family requires.
    #[error("host partials are missing {0} for this family")]
    MissingPartial(&'static str),
}

/// The model family, which fixes the link function and the encrypted
/// residual/loss approximations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlmFamily {
    /// Logistic regression with a second-order Taylor loss around 0.
    Logistic,
    /// Ordinary least squares.
    Linear,
    /// Poisson regression with log link and a first-order loss surrogate.
    Poisson,
}

impl GlmFamily {
    /// Applies the inverse link function to a linear predictor.
    pub fn link(&self, z: &Matrix) -> Matrix {
        match self {
            GlmFamily::Logistic => z.map(|v| 1.0 / (1.0 + (-v).exp())),
            GlmFamily::Linear => z.clone(),
            GlmFamily::Poisson => z.map(f64::exp),
        }
    }
}

/// Training configuration shared by all three roles of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlmConfig {
    /// The model family.
    pub family: GlmFamily,
    /// The label-holding rank.
    pub guest_rank: usize,
    /// The feature-only rank.
    pub host_rank: usize,
    /// The key-holding, data-free rank.
    pub arbiter_rank: usize,
    /// Maximum number of epochs.
    pub epochs: usize,
    /// Rows per batch.
    pub batch_size: usize,
    /// Whether the guest appends an intercept column.
    pub fit_intercept: bool,
    /// Gradient penalty.
    pub penalty: Penalty,
    /// Penalty strength.
    pub alpha: f64,
    /// Learning-rate schedule.
    pub lr_method: LrMethod,
    /// Initial learning rate.
    pub base_lr: f64,
    /// The arbiter's convergence criterion.
    pub criterion: ConvergeCriterion,
    /// Paillier modulus width for the arbiter's keypair.
    pub key_bits: u64,
    /// Fixed-point fractional bits.
    pub precision_bits: u32,
}

impl GlmConfig {
    /// A session with ranks `(guest=0, host=1, arbiter=2)` and default
    /// numeric parameters.
    pub fn new(family: GlmFamily, epochs: usize, batch_size: usize) -> Self {
        Self {
            family,
            guest_rank: 0,
            host_rank: 1,
            arbiter_rank: 2,
            epochs,
            batch_size,
            fit_intercept: false,
            penalty: Penalty::None,
            alpha: 0.0,
            lr_method: LrMethod::Constant,
            base_lr: 0.15,
            criterion: ConvergeCriterion::DiffLoss { eps: 1e-4 },
            key_bits: crate::sshe::DEFAULT_KEY_BITS,
            precision_bits: DEFAULT_PRECISION_BITS,
        }
    }

    /// The fixed-point codec for this configuration.
    pub fn encoder(&self) -> FixedPointEncoder {
        FixedPointEncoder::new(self.precision_bits)
    }

    /// A fresh optimizer for this configuration. `fit_intercept` is true
    /// only for the role whose weight column carries the intercept row,
    /// i.e. the guest; the host's column is all coefficients.
    pub fn optimizer(&self, fit_intercept: bool) -> Optimizer {
        Optimizer::new(self.penalty, self.alpha, fit_intercept)
    }

    /// A fresh learning-rate schedule for this configuration.
    pub fn scheduler(&self) -> LrScheduler {
        LrScheduler::new(self.lr_method, self.base_lr)
    }
}

/// The three pair-wise sub-groups of one session. Every party registers all
/// three in the same order so group identifiers agree across ranks.
#[derive(Debug, Clone, Copy)]
pub struct GlmGroups {
    /// Guest-host pairing.
    pub gh: GroupId,
    /// Guest-arbiter pairing.
    pub ga: GroupId,
    /// Host-arbiter pairing.
    pub ha: GroupId,
}

impl GlmGroups {
    /// Registers the pair-wise groups on this party's fabric.
    pub fn new<T: Transport>(
        comm: &mut Communicator<T>,
        config: &GlmConfig,
    ) -> Result<Self, ChannelError> {
        let gh = comm.new_group(&[config.guest_rank, config.host_rank], "glm_gh")?;
        let ga = comm.new_group(&[config.guest_rank, config.arbiter_rank], "glm_ga")?;
        let ha = comm.new_group(&[config.host_rank, config.arbiter_rank], "glm_ha")?;
        Ok(Self { gh, ga, ha })
    }
}

/// The host's encrypted per-batch contribution, sent to the guest.
///
/// Which fields are present depends on the family: logistic and linear carry
/// the squared predictor for the Taylor loss, Poisson carries the
/// exponentiated predictor instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostPartials {
    /// `enc(X_h @ w_h)`.
    pub enc_xw: CipherMatrix,
    /// `enc((X_h @ w_h)^2)`, element-wise.
    pub enc_xw_sq: Option<CipherMatrix>,
    /// `enc(exp(X_h @ w_h))`, element-wise.
    pub enc_mu: Option<CipherMatrix>,
    /// The host's encrypted regularization loss, a 1x1 tensor.
    pub enc_loss: Option<CipherMatrix>,
}

/// The encrypted local gradient `(1/n) Xᵀ d` plus the penalty term, encoded
/// at the product's scale power. Shared by guest and host.
pub(crate) fn encrypted_gradient(
    encoder: &FixedPointEncoder,
    pk: &crate::phe::PhePublicKey,
    x: &Matrix,
    enc_d: &CipherMatrix,
    w: &Matrix,
    optimizer: &Optimizer,
) -> Result<CipherMatrix, GlmError> {
    let n = x.rows() as f64;
    let xt = encoder.encode(&x.transpose());
    let g = CipherMatrix::matmul_left(&xt, enc_d, pk)?
        .scale_by(encoder.encode_scalar(1.0 / n), pk);
    let reg = optimizer.add_regularization(&Matrix::zeros(w.rows(), w.cols()), w);
    Ok(g.add_plain(&encoder.encode_scaled(&reg, g.scale_pow()), pk)?)
}

/// One data-holding party's persistent model state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlmModel {
    /// The local weight column.
    pub w: Matrix,
    /// Optimizer state.
    pub optimizer: Optimizer,
    /// Learning-rate schedule state.
    pub scheduler: LrScheduler,
    /// The epoch training stopped at: the converged epoch index, or the
    /// configured epoch count when the budget was exhausted. `None` before
    /// the first fit.
    pub end_epoch: Option<usize>,
    /// Whether the arbiter signalled convergence.
    pub is_converged: bool,
}
