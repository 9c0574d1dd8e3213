//! The arbiter role: holds the Paillier private key but no data. It
//! decrypts the gradient aggregates, returns them in plaintext and decides
//! convergence once per epoch.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::channel::Communicator;
use crate::glm::{GlmConfig, GlmError, GlmGroups};
use crate::optim::{ConvergeMonitor, LrScheduler};
use crate::phe::{CipherMatrix, PheCipher};
use crate::tensor::Matrix;
use crate::transport::Transport;

/// The arbiter's persistent convergence bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbiterState {
    /// Convergence statistics.
    pub monitor: ConvergeMonitor,
    /// The arbiter's mirror of the data parties' schedule.
    pub scheduler: LrScheduler,
    /// The epoch training stopped at, `None` before the first fit.
    pub end_epoch: Option<usize>,
    /// Whether convergence was signalled.
    pub is_converged: bool,
}

/// The arbiter of the coordinated GLM.
pub struct CoordinatedGlmArbiter {
    config: GlmConfig,
    monitor: ConvergeMonitor,
    scheduler: LrScheduler,
    end_epoch: Option<usize>,
    is_converged: bool,
}

impl CoordinatedGlmArbiter {
    /// A fresh arbiter for the given configuration. The schedule mirrors
    /// the data parties' so weight-delta estimates use the same step size.
    pub fn new(config: GlmConfig) -> Self {
        let monitor = ConvergeMonitor::new(config.criterion);
        let scheduler = config.scheduler();
        Self {
            config,
            monitor,
            scheduler,
            end_epoch: None,
            is_converged: false,
        }
    }

    /// Restores an arbiter from persisted state.
    pub fn restore(config: GlmConfig, state: ArbiterState) -> Self {
        Self {
            config,
            monitor: state.monitor,
            scheduler: state.scheduler,
            end_epoch: state.end_epoch,
            is_converged: state.is_converged,
        }
    }

    /// Snapshots the bookkeeping for persistence.
    pub fn state(&self) -> ArbiterState {
        ArbiterState {
            monitor: self.monitor.clone(),
            scheduler: self.scheduler.clone(),
            end_epoch: self.end_epoch,
            is_converged: self.is_converged,
        }
    }

    /// The epoch training stopped at, `None` before the first fit.
    pub fn end_epoch(&self) -> Option<usize> {
        self.end_epoch
    }

    /// Whether convergence was signalled.
    pub fn is_converged(&self) -> bool {
        self.is_converged
    }

    /// The per-epoch losses observed so far.
    pub fn loss_history(&self) -> &[f64] {
        self.monitor.loss_history()
    }

    /// Runs the training loop from the arbiter's side: generates the
    /// session keypair, serves one decrypt round per batch and party, and
    /// evaluates the convergence criterion at every epoch boundary.
    pub async fn fit<T: Transport, R: Rng>(
        &mut self,
        comm: &mut Communicator<T>,
        groups: &GlmGroups,
        rng: &mut R,
    ) -> Result<(), GlmError> {
        let cfg = self.config.clone();
        let encoder = cfg.encoder();
        let cipher = PheCipher::generate(cfg.key_bits, rng)?;
        comm.broadcast_obj(Some(cipher.public.clone()), cfg.arbiter_rank)
            .await?;
        let num_batches: usize = {
            let mut ga = comm.scoped(groups.ga);
            ga.recv_obj(cfg.guest_rank).await?
        };

        for epoch in 0..cfg.epochs {
            let mut weight_delta = 0.0;
            for _ in 0..num_batches {
                for (group, rank) in [(groups.ga, cfg.guest_rank), (groups.ha, cfg.host_rank)] {
                    let mut pair = comm.scoped(group);
                    let g_enc: CipherMatrix = pair.recv(rank).await?;
                    let g = encoder
                        .decode_scaled(&cipher.decrypt_matrix(&g_enc)?, g_enc.scale_pow());
                    pair.send(&g, rank).await?;
                    weight_delta += self.scheduler.lr() * g.norm();
                }
            }

            let epoch_loss: CipherMatrix = {
                let mut ga = comm.scoped(groups.ga);
                ga.recv(cfg.guest_rank).await?
            };
            let loss = decode_loss(&encoder, &cipher, &epoch_loss)? / num_batches as f64;
            let converged = self.monitor.check(Some(loss), Some(weight_delta));
            info!(epoch, loss, weight_delta, converged, "arbiter epoch summary");
            {
                let mut ga = comm.scoped(groups.ga);
                ga.send_obj(&converged, cfg.guest_rank).await?;
            }
            {
                let mut ha = comm.scoped(groups.ha);
                ha.send_obj(&converged, cfg.host_rank).await?;
            }
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
        Ok(())
    }
}

fn decode_loss(
    encoder: &crate::fixedpoint::FixedPointEncoder,
    cipher: &PheCipher,
    enc: &CipherMatrix,
) -> Result<f64, GlmError> {
    let decoded: Matrix = encoder.decode_scaled(&cipher.decrypt_matrix(enc)?, enc.scale_pow());
    Ok(decoded.get(0, 0))
}
