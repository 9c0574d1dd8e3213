//! The guest role: holds features and labels, assembles the encrypted
//! residual from both parties' partial predictions and drives the loss
//! bookkeeping.

use std::f64::consts::LN_2;

use tracing::info;

use crate::channel::Communicator;
use crate::data::BatchedDataset;
use crate::fixedpoint::FixedPointEncoder;
use crate::glm::{GlmConfig, GlmError, GlmFamily, GlmGroups, GlmModel, HostPartials};
use crate::optim::{LrScheduler, Optimizer};
use crate::phe::{CipherMatrix, PheCipher, PhePublicKey};
use crate::tensor::Matrix;
use crate::transport::Transport;

/// The guest's half of the coordinated GLM.
pub struct CoordinatedGlmGuest {
    config: GlmConfig,
    w: Option<Matrix>,
    optimizer: Optimizer,
    scheduler: LrScheduler,
    end_epoch: Option<usize>,
    is_converged: bool,
}

impl CoordinatedGlmGuest {
    /// A fresh guest for the given configuration.
    pub fn new(config: GlmConfig) -> Self {
        let optimizer = config.optimizer(config.fit_intercept);
        let scheduler = config.scheduler();
        Self {
            config,
            w: None,
            optimizer,
            scheduler,
            end_epoch: None,
            is_converged: false,
        }
    }

    /// Restores a guest from persisted model state.
    pub fn restore(config: GlmConfig, model: GlmModel) -> Self {
        Self {
            config,
            w: Some(model.w),
            optimizer: model.optimizer,
            scheduler: model.scheduler,
            end_epoch: model.end_epoch,
            is_converged: model.is_converged,
        }
    }

    /// Snapshots the model state for persistence.
    ///
    /// # Panics
    /// Panics if called before the first [`fit`](Self::fit).
    pub fn model(&self) -> GlmModel {
        GlmModel {
            w: self.w.clone().expect("model requested before fit"),
            optimizer: self.optimizer.clone(),
            scheduler: self.scheduler.clone(),
            end_epoch: self.end_epoch,
            is_converged: self.is_converged,
        }
    }

    /// The epoch training stopped at, `None` before the first fit.
    pub fn end_epoch(&self) -> Option<usize> {
        self.end_epoch
    }

    /// Whether the arbiter signalled convergence.
    pub fn is_converged(&self) -> bool {
        self.is_converged
    }

    fn batch_features(&self, x: &Matrix) -> Matrix {
        if self.config.fit_intercept {
            x.with_ones_column()
        } else {
            x.clone()
        }
    }

    /// Runs the training loop from the guest's side.
    pub async fn fit<T: Transport>(
        &mut self,
        comm: &mut Communicator<T>,
        groups: &GlmGroups,
        data: &BatchedDataset,
    ) -> Result<(), GlmError> {
        let cfg = self.config.clone();
        let encoder = cfg.encoder();

        // INIT: receive the arbiter's public key and align the per-epoch
        // batch count with it.
        let pk: PhePublicKey = comm.broadcast_obj(None, cfg.arbiter_rank).await?;
        let cipher = PheCipher::from_public(pk);
        let num_batches = data.num_batches();
        {
            let mut ga = comm.scoped(groups.ga);
            ga.send_obj(&num_batches, cfg.arbiter_rank).await?;
        }
        {
            let mut gh = comm.scoped(groups.gh);
            gh.send_obj(&num_batches, cfg.host_rank).await?;
        }

        let coef_count = data.num_features() + usize::from(cfg.fit_intercept);
        let mut w = self.w.take().unwrap_or_else(|| Matrix::zeros(coef_count, 1));

        for epoch in 0..cfg.epochs {
            self.optimizer.set_iters(epoch as u64);
            let mut epoch_loss: Option<CipherMatrix> = None;
            for batch in data.iter() {
                let x = self.batch_features(&batch.x);
                let y = batch.y.as_ref().ok_or(GlmError::MissingLabels)?;
                let zg = x.matmul(&w);

                let partials: HostPartials = {
                    let mut gh = comm.scoped(groups.gh);
                    gh.recv(cfg.host_rank).await?
                };

                let (enc_d, batch_loss) =
                    residual_and_loss(&cfg, &encoder, &cipher, &partials, &zg, y, &w, &self.optimizer)?;
                {
                    let mut gh = comm.scoped(groups.gh);
                    gh.send(&enc_d, cfg.host_rank).await?;
                }

                let g_enc = crate::glm::encrypted_gradient(
                    &encoder,
                    &cipher.public,
                    &x,
                    &enc_d,
                    &w,
                    &self.optimizer,
                )?;
                let g: Matrix = {
                    let mut ga = comm.scoped(groups.ga);
                    ga.send(&g_enc, cfg.arbiter_rank).await?;
                    ga.recv(cfg.arbiter_rank).await?
                };
                w = self.optimizer.update_weights(&w, &g, self.scheduler.lr());

                epoch_loss = Some(match epoch_loss {
                    None => batch_loss,
                    Some(acc) => acc.add(&batch_loss, &cipher.public)?,
                });
            }

            let converged = {
                let mut ga = comm.scoped(groups.ga);
                let loss = epoch_loss.expect("dataset yields at least one batch");
                ga.send(&loss, cfg.arbiter_rank).await?;
                ga.recv_obj::<bool>(cfg.arbiter_rank).await?
            };
            info!(epoch, converged, "guest epoch finished");
            if converged {
                self.is_converged = true;
                self.end_epoch = Some(epoch);
                break;
            }
            if epoch < cfg.epochs - 1 {
                self.scheduler.step();
            }
        }
        if !self.is_converged {
            self.end_epoch = Some(cfg.epochs);
        }
        self.w = Some(w);
        Ok(())
    }

    /// Coordinated prediction: combines the host's partial predictor with
    /// the local one and applies the family's link function.
    ///
    /// # Panics
    /// Panics if called before the first [`fit`](Self::fit).
    pub async fn predict<T: Transport>(
        &self,
        comm: &mut Communicator<T>,
        groups: &GlmGroups,
        features: &Matrix,
    ) -> Result<Matrix, GlmError> {
        let w = self.w.as_ref().expect("predict requested before fit");
        let x = self.batch_features(features);
        let zg = x.matmul(w);
        let zh: Matrix = {
            let mut gh = comm.scoped(groups.gh);
            gh.recv(self.config.host_rank).await?
        };
        Ok(self.config.family.link(&zg.add(&zh)))
    }
}

/// Builds the encrypted residual `d` and the encrypted batch loss for the
/// configured family.
///
/// Every term is tracked by its scale power: the residual ends at one scale
/// (linear) or two (logistic, Poisson), and the batch loss uniformly at
/// three, so epoch accumulation never mixes scales.
#[allow(clippy::too_many_arguments)]
fn residual_and_loss(
    cfg: &GlmConfig,
    encoder: &FixedPointEncoder,
    cipher: &PheCipher,
    partials: &HostPartials,
    zg: &Matrix,
    y: &Matrix,
    w: &Matrix,
    optimizer: &Optimizer,
) -> Result<(CipherMatrix, CipherMatrix), GlmError> {
    let pk = &cipher.public;
    let n = zg.rows() as f64;
    let scale = encoder.scale();
    let reg_g = optimizer.loss_norm(w).unwrap_or(0.0);

    let (enc_d, enc_loss_sum, plain_loss) = match cfg.family {
        GlmFamily::Logistic => {
            // Taylor expansion around 0: d = 0.25 z - 0.5 y and
            // loss = ln 2 + mean(0.125 z^2 - 0.5 y z), with z = zg + zh.
            let q = zg.scale(0.25).sub(&y.scale(0.5));
            let enc_d = partials
                .enc_xw
                .scale_by(encoder.encode_scalar(0.25), pk)
                .add_plain(&encoder.encode_scaled(&q, 2), pk)?;
            let enc_xw_sq = partials
                .enc_xw_sq
                .as_ref()
                .ok_or(GlmError::MissingPartial("enc_xw_sq"))?;
            let cross = partials
                .enc_xw
                .hadamard_enc(&encoder.encode(&q), pk)?
                .sum_elements(pk);
            let sq = enc_xw_sq
                .scale_by(encoder.encode_scalar(0.125), pk)
                .sum_elements(pk);
            let enc_sum = cross.add(&sq, pk)?;
            let plain = (zg.hadamard(zg).scale(0.125).sum() - y.hadamard(zg).scale(0.5).sum())
                / n
                + LN_2
                + reg_g;
            (enc_d, enc_sum, plain)
        }
        GlmFamily::Linear => {
            // d = z - y and loss = mean((z - y)^2) / 2.
            let e = zg.sub(y);
            let enc_d = partials
                .enc_xw
                .add_plain(&encoder.encode(&e), pk)?;
            let enc_xw_sq = partials
                .enc_xw_sq
                .as_ref()
                .ok_or(GlmError::MissingPartial("enc_xw_sq"))?;
            let cross = partials
                .enc_xw
                .hadamard_enc(&encoder.encode(&e), pk)?
                .sum_elements(pk);
            let sq = enc_xw_sq.sum_elements(pk).lift(scale, pk);
            // (e + zh)^2 = e^2 + 2 e zh + zh^2, halved below.
            let enc_sum = cross.add(&cross, pk)?.add(&sq, pk)?;
            let plain = e.hadamard(&e).sum() / (2.0 * n) + reg_g;
            (enc_d, enc_sum, plain)
        }
        GlmFamily::Poisson => {
            // Log link: mu = exp(zg) * exp(zh); d = mu - y and the loss
            // surrogate is mean(mu - y z).
            let enc_mu = partials
                .enc_mu
                .as_ref()
                .ok_or(GlmError::MissingPartial("enc_mu"))?;
            let mu_g = zg.map(f64::exp);
            let mu = enc_mu.hadamard_enc(&encoder.encode(&mu_g), pk)?;
            let enc_d = mu.add_plain(&encoder.encode_scaled(&y.scale(-1.0), 2), pk)?;
            let yzh = partials
                .enc_xw
                .hadamard_enc(&encoder.encode(&y.scale(-1.0)), pk)?
                .sum_elements(pk);
            // mu already carries both parties' exponential factors.
            let enc_sum = mu.sum_elements(pk).add(&yzh, pk)?;
            let plain = -y.hadamard(zg).sum() / n + reg_g;
            (enc_d, enc_sum, plain)
        }
    };

    // Mean over the batch in ciphertext, then the plaintext terms and the
    // host's encrypted regularization loss, all at three scale powers.
    let mean_factor = match cfg.family {
        GlmFamily::Linear => 1.0 / (2.0 * n),
        _ => 1.0 / n,
    };
    let mut batch_loss = enc_loss_sum
        .scale_by(encoder.encode_scalar(mean_factor), pk)
        .add_plain(
            &encoder.encode_scaled(&Matrix::from_vec(1, 1, vec![plain_loss]), 3),
            pk,
        )?;
    if let Some(h_loss) = &partials.enc_loss {
        batch_loss = batch_loss.add(&h_loss.lift(scale, pk).lift(scale, pk), pk)?;
    }
    Ok((enc_d, batch_loss))
}

