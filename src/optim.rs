//! Plaintext optimizer, learning-rate schedule and convergence bookkeeping
//! for the coordinated training loop.
//!
//! These run on values that are already plaintext at their owner (local
//! weights at guest/host, decrypted aggregates at the arbiter); nothing here
//! touches the channel fabric.

use serde::{Deserialize, Serialize};

use crate::tensor::Matrix;

/// Regularization penalty applied to gradients and tracked in the loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Penalty {
    /// No regularization.
    None,
    /// `alpha * sum(|w|)`, subgradient `alpha * sign(w)`.
    L1,
    /// `alpha / 2 * ||w||^2`, gradient `alpha * w`.
    L2,
}

/// Plain SGD with an optional penalty term.
///
/// When `fit_intercept` is set, the weight column's last row is the
/// intercept and the penalty skips it, in both the loss and the gradient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Optimizer {
    penalty: Penalty,
    alpha: f64,
    fit_intercept: bool,
    iters: u64,
}

impl Optimizer {
    /// A fresh optimizer.
    pub fn new(penalty: Penalty, alpha: f64, fit_intercept: bool) -> Self {
        Self {
            penalty,
            alpha,
            fit_intercept,
            iters: 0,
        }
    }

    /// Records the current epoch index (bookkeeping only).
    pub fn set_iters(&mut self, iters: u64) {
        self.iters = iters;
    }

    /// The weight rows the penalty applies to.
    fn coefficients(&self, w: &Matrix) -> Matrix {
        if self.fit_intercept && w.rows() > 0 {
            w.slice_rows(0, w.rows() - 1)
        } else {
            w.clone()
        }
    }

    /// The penalty's contribution to the loss for the given weights, `None`
    /// when no penalty is configured.
    pub fn loss_norm(&self, w: &Matrix) -> Option<f64> {
        let coef = self.coefficients(w);
        match self.penalty {
            Penalty::None => None,
            Penalty::L1 => Some(self.alpha * coef.map(f64::abs).sum()),
            Penalty::L2 => Some(0.5 * self.alpha * coef.norm().powi(2)),
        }
    }

    /// Adds the penalty's gradient to `g`, leaving the intercept row
    /// untouched.
    pub fn add_regularization(&self, g: &Matrix, w: &Matrix) -> Matrix {
        let mut reg = match self.penalty {
            Penalty::None => return g.clone(),
            Penalty::L1 => w.map(f64::signum).scale(self.alpha),
            Penalty::L2 => w.scale(self.alpha),
        };
        if self.fit_intercept && w.rows() > 0 {
            for c in 0..reg.cols() {
                reg.set(w.rows() - 1, c, 0.0);
            }
        }
        g.add(&reg)
    }

    /// One SGD step: `w - lr * g`.
    pub fn update_weights(&self, w: &Matrix, g: &Matrix, lr: f64) -> Matrix {
        w.sub(&g.scale(lr))
    }
}

/// How the learning rate evolves across epochs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LrMethod {
    /// The base rate forever.
    Constant,
    /// `base * gamma^(steps / step_size)`.
    Step {
        /// Multiplicative decay factor.
        gamma: f64,
        /// Number of steps between decays.
        step_size: u64,
    },
    /// `max(base - decay * steps, 0)`.
    Linear {
        /// Subtractive decay per step.
        decay: f64,
    },
}

/// Learning-rate schedule, advanced once per completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrScheduler {
    method: LrMethod,
    base_lr: f64,
    steps: u64,
}

impl LrScheduler {
    /// A fresh schedule starting at `base_lr`.
    pub fn new(method: LrMethod, base_lr: f64) -> Self {
        Self {
            method,
            base_lr,
            steps: 0,
        }
    }

    /// The current learning rate.
    pub fn lr(&self) -> f64 {
        match self.method {
            LrMethod::Constant => self.base_lr,
            LrMethod::Step { gamma, step_size } => {
                self.base_lr * gamma.powi((self.steps / step_size.max(1)) as i32)
            }
            LrMethod::Linear { decay } => (self.base_lr - decay * self.steps as f64).max(0.0),
        }
    }

    /// Advances the schedule by one epoch.
    pub fn step(&mut self) {
        self.steps += 1;
    }

    /// How many epochs the schedule has advanced.
    pub fn steps(&self) -> u64 {
        self.steps
    }
}

/// The convergence criterion evaluated by the arbiter once per epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ConvergeCriterion {
    /// `|loss| < eps`.
    AbsLoss {
        /// Convergence threshold.
        eps: f64,
    },
    /// `|loss - previous_loss| < eps`.
    DiffLoss {
        /// Convergence threshold.
        eps: f64,
    },
    /// `||delta_w|| < eps`.
    WeightDiff {
        /// Convergence threshold.
        eps: f64,
    },
}

/// Tracks per-epoch statistics and decides convergence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergeMonitor {
    criterion: ConvergeCriterion,
    prev_loss: Option<f64>,
    loss_history: Vec<f64>,
}

impl ConvergeMonitor {
    /// A fresh monitor for the given criterion.
    pub fn new(criterion: ConvergeCriterion) -> Self {
        Self {
            criterion,
            prev_loss: None,
            loss_history: Vec::new(),
        }
    }

    /// Records this epoch's statistics and returns whether the criterion is
    /// met. `loss` feeds the loss-based criteria, `weight_diff_norm` the
    /// weight-based one; a criterion whose statistic is absent this epoch
    /// reports not-converged.
    pub fn check(&mut self, loss: Option<f64>, weight_diff_norm: Option<f64>) -> bool {
        if let Some(loss) = loss {
            self.loss_history.push(loss);
        }
        let converged = match self.criterion {
            ConvergeCriterion::AbsLoss { eps } => loss.map(|l| l.abs() < eps),
            ConvergeCriterion::DiffLoss { eps } => loss
                .and_then(|l| self.prev_loss.map(|p| (l - p).abs() < eps)),
            ConvergeCriterion::WeightDiff { eps } => weight_diff_norm.map(|d| d < eps),
        };
        if let Some(loss) = loss {
            self.prev_loss = Some(loss);
        }
        converged.unwrap_or(false)
    }

    /// The losses recorded so far, one per epoch that reported a loss.
    pub fn loss_history(&self) -> &[f64] {
        &self.loss_history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sgd_step_moves_against_gradient() {
        let opt = Optimizer::new(Penalty::None, 0.0, false);
        let w = Matrix::from_vec(2, 1, vec![1.0, -1.0]);
        let g = Matrix::from_vec(2, 1, vec![0.5, -0.5]);
        let w2 = opt.update_weights(&w, &g, 0.1);
        assert!((w2.get(0, 0) - 0.95).abs() < 1e-12);
        assert!((w2.get(1, 0) + 0.95).abs() < 1e-12);
    }

    #[test]
    fn l2_penalty_shapes_loss_and_gradient() {
        let opt = Optimizer::new(Penalty::L2, 0.1, false);
        let w = Matrix::from_vec(2, 1, vec![3.0, 4.0]);
        assert!((opt.loss_norm(&w).unwrap() - 0.5 * 0.1 * 25.0).abs() < 1e-12);
        let g = opt.add_regularization(&Matrix::zeros(2, 1), &w);
        assert!((g.get(0, 0) - 0.3).abs() < 1e-12);
        assert!((g.get(1, 0) - 0.4).abs() < 1e-12);
    }

    #[test]
    fn no_penalty_reports_no_loss_norm() {
        let opt = Optimizer::new(Penalty::None, 1.0, false);
        assert!(opt.loss_norm(&Matrix::zeros(2, 1)).is_none());
    }

    #[test]
    fn penalty_skips_the_intercept_row() {
        let w = Matrix::from_vec(3, 1, vec![3.0, 4.0, 10.0]);

        let l2 = Optimizer::new(Penalty::L2, 0.1, true);
        assert!((l2.loss_norm(&w).unwrap() - 0.5 * 0.1 * 25.0).abs() < 1e-12);
        let g = l2.add_regularization(&Matrix::zeros(3, 1), &w);
        assert!((g.get(0, 0) - 0.3).abs() < 1e-12);
        assert!((g.get(1, 0) - 0.4).abs() < 1e-12);
        assert_eq!(g.get(2, 0), 0.0);

        let l1 = Optimizer::new(Penalty::L1, 0.2, true);
        assert!((l1.loss_norm(&w).unwrap() - 0.2 * 7.0).abs() < 1e-12);
        let g = l1.add_regularization(&Matrix::zeros(3, 1), &w);
        assert!((g.get(0, 0) - 0.2).abs() < 1e-12);
        assert_eq!(g.get(2, 0), 0.0);
    }

    #[test]
    fn step_schedule_decays_by_gamma() {
        let mut sched = LrScheduler::new(
            LrMethod::Step {
                gamma: 0.5,
                step_size: 2,
            },
            0.4,
        );
        assert_eq!(sched.lr(), 0.4);
        sched.step();
        assert_eq!(sched.lr(), 0.4);
        sched.step();
        assert_eq!(sched.lr(), 0.2);
    }

    #[test]
    fn linear_schedule_never_goes_negative() {
        let mut sched = LrScheduler::new(LrMethod::Linear { decay: 0.3 }, 0.5);
        sched.step();
        assert!((sched.lr() - 0.2).abs() < 1e-12);
        sched.step();
        assert_eq!(sched.lr(), 0.0);
    }

    #[test]
    fn diff_loss_needs_two_epochs() {
        let mut monitor = ConvergeMonitor::new(ConvergeCriterion::DiffLoss { eps: 1e-3 });
        assert!(!monitor.check(Some(0.7), None));
        assert!(!monitor.check(Some(0.5), None));
        assert!(monitor.check(Some(0.5000001), None));
        assert_eq!(monitor.loss_history().len(), 3);
    }

    #[test]
    fn weight_diff_ignores_loss() {
        let mut monitor = ConvergeMonitor::new(ConvergeCriterion::WeightDiff { eps: 0.01 });
        assert!(!monitor.check(None, Some(0.5)));
        assert!(monitor.check(None, Some(0.005)));
    }

    #[test]
    fn optimizer_and_scheduler_round_trip_through_bincode() {
        let mut opt = Optimizer::new(Penalty::L1, 0.2, true);
        opt.set_iters(3);
        let back: Optimizer = bincode::deserialize(&bincode::serialize(&opt).unwrap()).unwrap();
        assert_eq!(back, opt);

        let mut sched = LrScheduler::new(LrMethod::Linear { decay: 0.1 }, 0.5);
        sched.step();
        let back: LrScheduler =
            bincode::deserialize(&bincode::serialize(&sched).unwrap()).unwrap();
        assert_eq!(back, sched);
        assert_eq!(back.lr(), sched.lr());
    }
}
