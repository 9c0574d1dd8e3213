//! The host role: holds a feature block but no labels, ships encrypted
//! partial predictions to the guest and updates its weight column from
//! arbiter-decrypted gradients.

use rand::Rng;
use tracing::info;

use crate::channel::Communicator;
use crate::data::BatchedDataset;
use crate::fixedpoint::FixedPointEncoder;
use crate::glm::{GlmConfig, GlmError, GlmFamily, GlmGroups, GlmModel, HostPartials};
use crate::optim::{LrScheduler, Optimizer};
use crate::phe::{CipherMatrix, PheCipher, PhePublicKey};
use crate::tensor::Matrix;
use crate::transport::Transport;

/// The host's half of the coordinated GLM.
pub struct CoordinatedGlmHost {
    config: GlmConfig,
    w: Option<Matrix>,
    optimizer: Optimizer,
    scheduler: LrScheduler,
    end_epoch: Option<usize>,
    is_converged: bool,
}

impl CoordinatedGlmHost {
    /// A fresh host for the given configuration. The host never fits an
    /// intercept; the guest owns it.
    pub fn new(config: GlmConfig) -> Self {
        let optimizer = config.optimizer(false);
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

    /// Restores a host from persisted model state.
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

    /// Runs the training loop from the host's side.
    pub async fn fit<T: Transport, R: Rng>(
        &mut self,
        comm: &mut Communicator<T>,
        groups: &GlmGroups,
        data: &BatchedDataset,
        rng: &mut R,
    ) -> Result<(), GlmError> {
        let cfg = self.config.clone();
        let encoder = cfg.encoder();
        let pk: PhePublicKey = comm.broadcast_obj(None, cfg.arbiter_rank).await?;
        let cipher = PheCipher::from_public(pk);
        let num_batches: usize = {
            let mut gh = comm.scoped(groups.gh);
            gh.recv_obj(cfg.guest_rank).await?
        };
        if num_batches != data.num_batches() {
            return Err(GlmError::BatchCountMismatch {
                local: data.num_batches(),
                peer: num_batches,
            });
        }

        let mut w = self
            .w
            .take()
            .unwrap_or_else(|| Matrix::zeros(data.num_features(), 1));

        for epoch in 0..cfg.epochs {
            self.optimizer.set_iters(epoch as u64);
            for batch in data.iter() {
                let x = &batch.x;
                let zh = x.matmul(&w);
                let partials = self.partials(&encoder, &cipher, &zh, &w, rng);

                let enc_d: CipherMatrix = {
                    let mut gh = comm.scoped(groups.gh);
                    gh.send(&partials, cfg.guest_rank).await?;
                    gh.recv(cfg.guest_rank).await?
                };

                let g_enc = crate::glm::encrypted_gradient(
                    &encoder,
                    &cipher.public,
                    x,
                    &enc_d,
                    &w,
                    &self.optimizer,
                )?;
                let g: Matrix = {
                    let mut ha = comm.scoped(groups.ha);
                    ha.send(&g_enc, cfg.arbiter_rank).await?;
                    ha.recv(cfg.arbiter_rank).await?
                };
                w = self.optimizer.update_weights(&w, &g, self.scheduler.lr());
            }

            let converged = {
                let mut ha = comm.scoped(groups.ha);
                ha.recv_obj::<bool>(cfg.arbiter_rank).await?
            };
            info!(epoch, converged, "host epoch finished");
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

    /// The family-specific encrypted partials for one batch.
    fn partials<R: Rng>(
        &self,
        encoder: &FixedPointEncoder,
        cipher: &PheCipher,
        zh: &Matrix,
        w: &Matrix,
        rng: &mut R,
    ) -> HostPartials {
        let enc_xw = cipher.encrypt_matrix(&encoder.encode(zh), 1, rng);
        let (enc_xw_sq, enc_mu) = match self.config.family {
            GlmFamily::Logistic | GlmFamily::Linear => (
                Some(cipher.encrypt_matrix(&encoder.encode(&zh.hadamard(zh)), 1, rng)),
                None,
            ),
            GlmFamily::Poisson => (
                None,
                Some(cipher.encrypt_matrix(&encoder.encode(&zh.map(f64::exp)), 1, rng)),
            ),
        };
        let enc_loss = self.optimizer.loss_norm(w).map(|l| {
            cipher.encrypt_matrix(&encoder.encode(&Matrix::from_vec(1, 1, vec![l])), 1, rng)
        });
        HostPartials {
            enc_xw,
            enc_xw_sq,
            enc_mu,
            enc_loss,
        }
    }

    /// Coordinated prediction: ships the local partial predictor to the
    /// guest, which applies the link function.
    ///
    /// # Panics
    /// Panics if called before the first [`fit`](Self::fit).
    pub async fn predict<T: Transport>(
        &self,
        comm: &mut Communicator<T>,
        groups: &GlmGroups,
        features: &Matrix,
    ) -> Result<(), GlmError> {
        let w = self.w.as_ref().expect("predict requested before fit");
        let zh = features.matmul(w);
        let mut gh = comm.scoped(groups.gh);
        gh.send(&zh, self.config.guest_rank).await?;
        Ok(())
    }
}
