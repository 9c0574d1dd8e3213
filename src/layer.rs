//! The two-party secure linear layer built on additive weight shares and the
//! masked homomorphic products of [`crate::sshe`].
//!
//! Both weight blocks stay additively shared for the lifetime of the layer:
//! they are created as shares of a random initialization, updated share-wise
//! on every backward pass and only ever reconstructed through the explicit
//! plaintext export.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::channel::Communicator;
use crate::fixedpoint::FixedPointEncoder;
use crate::share::{self, ArithmeticShare};
use crate::sshe::{self, CipherPair, SsheError};
use crate::tensor::Matrix;
use crate::transport::Transport;

/// Construction parameters of an [`SsheAggregator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Feature width of rank A's input block.
    pub in_features_a: usize,
    /// Feature width of rank B's input block.
    pub in_features_b: usize,
    /// Output width of the layer.
    pub out_features: usize,
    /// The rank holding the A-side features.
    pub rank_a: usize,
    /// The rank holding the B-side features and labels.
    pub rank_b: usize,
    /// Step size applied by each party to its own weight shares.
    pub learning_rate: f64,
    /// Paillier modulus width.
    pub key_bits: u64,
    /// Fixed-point fractional bits.
    pub precision_bits: u32,
}

impl AggregatorConfig {
    /// Sensible defaults for a two-party session with ranks `(0, 1)`.
    pub fn new(in_features_a: usize, in_features_b: usize, out_features: usize) -> Self {
        Self {
            in_features_a,
            in_features_b,
            out_features,
            rank_a: 0,
            rank_b: 1,
            learning_rate: 0.05,
            key_bits: sshe::DEFAULT_KEY_BITS,
            precision_bits: crate::fixedpoint::DEFAULT_PRECISION_BITS,
        }
    }
}

/// Serializable weight and bookkeeping state of one party's layer half.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorState {
    /// The rank holding the A-side features.
    pub rank_a: usize,
    /// The rank holding the B-side features and labels.
    pub rank_b: usize,
    /// Step size applied to the local weight shares.
    pub learning_rate: f64,
    /// Fixed-point fractional bits.
    pub precision_bits: u32,
    /// The local share of the A-side weight block.
    pub wa: ArithmeticShare,
    /// The local share of the B-side weight block.
    pub wb: ArithmeticShare,
}

/// One party's half of the secure two-party linear layer.
pub struct SsheAggregator {
    rank_a: usize,
    rank_b: usize,
    learning_rate: f64,
    encoder: FixedPointEncoder,
    ciphers: CipherPair,
    wa: ArithmeticShare,
    wb: ArithmeticShare,
}

impl SsheAggregator {
    /// Sets up one party's half of the layer: exchanges public keys with the
    /// peer and shares a random initialization of both weight blocks, drawn
    /// at the owning rank.
    pub async fn new<T: Transport, R: Rng>(
        comm: &mut Communicator<T>,
        config: &AggregatorConfig,
        rng: &mut R,
    ) -> Result<Self, SsheError> {
        let encoder = FixedPointEncoder::new(config.precision_bits);
        let ciphers = sshe::exchange_keys(comm, config.key_bits, rng).await?;
        let wa_init = (comm.rank() == config.rank_a)
            .then(|| Matrix::random(config.in_features_a, config.out_features, -0.1, 0.1, rng));
        let wa = share::share_from(comm, wa_init.as_ref(), config.rank_a, &encoder, rng).await?;
        let wb_init = (comm.rank() == config.rank_b)
            .then(|| Matrix::random(config.in_features_b, config.out_features, -0.1, 0.1, rng));
        let wb = share::share_from(comm, wb_init.as_ref(), config.rank_b, &encoder, rng).await?;
        Ok(Self {
            rank_a: config.rank_a,
            rank_b: config.rank_b,
            learning_rate: config.learning_rate,
            encoder,
            ciphers,
            wa,
            wb,
        })
    }

    /// Rebuilds a party's layer half from persisted state plus a (fresh or
    /// persisted) cipher pairing.
    pub fn restore(state: AggregatorState, ciphers: CipherPair) -> Self {
        Self {
            rank_a: state.rank_a,
            rank_b: state.rank_b,
            learning_rate: state.learning_rate,
            encoder: FixedPointEncoder::new(state.precision_bits),
            ciphers,
            wa: state.wa,
            wb: state.wb,
        }
    }

    /// Snapshots the local weight shares and bookkeeping for persistence.
    pub fn state(&self) -> AggregatorState {
        AggregatorState {
            rank_a: self.rank_a,
            rank_b: self.rank_b,
            learning_rate: self.learning_rate,
            precision_bits: self.encoder.precision_bits(),
            wa: self.wa.clone(),
            wb: self.wb.clone(),
        }
    }

    /// Adjusts the step size applied to the local shares.
    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    /// The fixed-point codec of this layer.
    pub fn encoder(&self) -> &FixedPointEncoder {
        &self.encoder
    }

    /// Secure forward pass over this party's feature block `x`.
    ///
    /// The joint output `xa @ wa + xb @ wb` is revealed only to rank B, the
    /// label holder. Rank A receives a 1x1 zero placeholder instead of the
    /// true output: it has no use for the plaintext and must not see it.
    pub async fn forward<T: Transport, R: Rng>(
        &self,
        comm: &mut Communicator<T>,
        x: &Matrix,
        rng: &mut R,
    ) -> Result<Matrix, SsheError> {
        let (xa, xb) = if comm.rank() == self.rank_a {
            (Some(x), None)
        } else {
            (None, Some(x))
        };
        let out = sshe::cross_smm(
            comm,
            &self.ciphers,
            xa,
            xb,
            &self.wa,
            &self.wb,
            self.rank_a,
            self.rank_b,
            &self.encoder,
            rng,
        )
        .await?;
        let revealed = share::reveal(comm, &out, self.rank_b, &self.encoder).await?;
        Ok(revealed.unwrap_or_else(|| Matrix::zeros(1, 1)))
    }

    /// Secure backward pass: updates both weight shares from the upstream
    /// gradient `dz` held at rank B, and returns the plaintext gradient with
    /// respect to this party's own feature block.
    ///
    /// `input` is the feature block this party fed into the matching
    /// [`forward`](Self::forward) call. The two secure exchanges inside must
    /// mirror the forward ordering exactly; a mismatch desynchronizes the
    /// tag counters and is unrecoverable for the session.
    pub async fn backward<T: Transport, R: Rng>(
        &mut self,
        comm: &mut Communicator<T>,
        input: &Matrix,
        dz: Option<&Matrix>,
        rng: &mut R,
    ) -> Result<Matrix, SsheError> {
        let is_b = comm.rank() == self.rank_b;
        let dz_encoded = if is_b {
            let dz = dz.ok_or(SsheError::MissingInput("backward upstream gradient"))?;
            Some(self.encoder.encode(dz))
        } else {
            None
        };

        let dh = sshe::input_gradients(
            comm,
            &self.ciphers,
            &self.wa,
            &self.wb,
            dz_encoded.as_ref(),
            self.rank_a,
            self.rank_b,
            &self.encoder,
            rng,
        )
        .await?;

        // wa gradient as shares: xaᵀ @ dz across the two parties.
        let ha_encoded_t = (!is_b).then(|| self.encoder.encode(input).transpose());
        let ga = sshe::smm_lc(
            comm,
            ha_encoded_t.as_ref(),
            dz_encoded.as_ref(),
            self.rank_a,
            self.rank_b,
            &self.ciphers,
            rng,
        )
        .await?
        .truncate(&self.encoder);
        self.wa = self
            .wa
            .sub(&ga.scale_by(self.learning_rate, &self.encoder))?;

        // wb gradient is local to rank B, which applies it to its share
        // alone; the sum of shares still moves by -lr * gb.
        if let Some(dz) = dz.filter(|_| is_b) {
            let gb = input.transpose().matmul(dz);
            let step = self.encoder.encode(&gb.scale(self.learning_rate));
            self.wb = ArithmeticShare::from_encoded(self.wb.encoded().sub(&step), 1);
        }
        Ok(dh)
    }

    /// Reconstructs both weight blocks in plaintext at every party. Debug
    /// and export use only.
    pub async fn weights_plaintext<T: Transport>(
        &self,
        comm: &mut Communicator<T>,
    ) -> Result<(Matrix, Matrix), SsheError> {
        let wa = share::reveal_all(comm, &self.wa, &self.encoder).await?;
        let wb = share::reveal_all(comm, &self.wb, &self.encoder).await?;
        Ok((wa, wb))
    }
}
