//! Bayesian linear regression posterior bank
//!
//! One Normal-Inverse-Gamma posterior per action over the latent features:
//!
//!   sigma^2        ~ InvGamma(a, b)
//!   beta | sigma^2 ~ N(mu, sigma^2 · cov)
//!
//! ## Refresh (closed-form, full recompute)
//!
//! With design matrix Z (latent rows where the action was taken) and rewards y:
//!   precision = ZᵀZ + lambda·I
//!   cov       = precision⁻¹
//!   mu        = cov · Zᵀy
//!   a         = a0 + n/2
//!   b         = b0 + ½ yᵀy − ½ muᵀ · precision · mu
//!
//! ## Thompson sampling
//!
//! Per action: sigma^2 from the noise belief, beta from N(mu, sigma^2·cov) via a
//! Cholesky factor, score = beta · z. A factorization failure only affects the
//! failing action, which is drawn from N(0, I) instead.

use crate::belief::NoiseBelief;
use crate::buffer::ContextBuffer;
use crate::error::{BanditError, Result};
use nalgebra::{Cholesky, DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Floor for the inverse-gamma scale after a refresh.
const MIN_NOISE_SCALE: f64 = 1e-8;

/// Diagonal jitter tried once when a sampling covariance will not factor.
const SAMPLING_JITTER: f64 = 1e-8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPosterior {
    pub mu: Array1<f64>,
    pub cov: Array2<f64>,
    pub precision: Array2<f64>,
    pub noise: NoiseBelief,
    /// Rows used in the last refresh.
    pub observations: usize,
}

impl ActionPosterior {
    /// Zero mean, `cov = I / lambda`, `InvGamma(a0, b0)`.
    pub fn prior(latent_dim: usize, lambda_prior: f64, a0: f64, b0: f64) -> Self {
        let eye = Array2::<f64>::eye(latent_dim);
        Self {
            mu: Array1::zeros(latent_dim),
            cov: &eye / lambda_prior,
            precision: &eye * lambda_prior,
            noise: NoiseBelief::new(a0, b0),
            observations: 0,
        }
    }

    /// Draw one weight vector. `None` if the scaled covariance cannot be
    /// factored even after jitter.
    fn draw_weights<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Array1<f64>> {
        let d = self.mu.len();
        let sigma2 = self.noise.sample_variance(rng);
        let cov = to_dmatrix(&self.cov) * sigma2;

        let chol = Cholesky::new(cov.clone()).or_else(|| {
            let jitter = SAMPLING_JITTER * (cov.trace().abs() / d.max(1) as f64).max(1.0);
            Cholesky::new(cov + DMatrix::identity(d, d) * jitter)
        })?;

        let eps: DVector<f64> = DVector::from_fn(d, |_, _| StandardNormal.sample(rng));
        let draw = chol.l() * eps;
        let beta = Array1::from_shape_fn(d, |i| self.mu[i] + draw[i]);
        beta.iter().all(|v| v.is_finite()).then_some(beta)
    }

    fn sample_score<R: Rng + ?Sized>(&self, action: usize, z: ArrayView1<f64>, rng: &mut R) -> f64 {
        match self.draw_weights(rng) {
            Some(beta) => beta.dot(&z),
            None => {
                warn!(
                    "Covariance sampling failed for action {}, falling back to N(0, I)",
                    action
                );
                let beta: Array1<f64> =
                    Array1::from_shape_fn(z.len(), |_| StandardNormal.sample(rng));
                beta.dot(&z)
            }
        }
    }
}

/// Outcome of one [`PosteriorBank::refresh`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshReport {
    pub updated: Vec<usize>,
    /// Actions with no rows; left as they were.
    pub skipped: Vec<usize>,
    /// Actions whose recompute failed; their previous posterior is kept.
    pub failed: Vec<(usize, BanditError)>,
}

impl RefreshReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorBank {
    latent_dim: usize,
    lambda_prior: f64,
    a0: f64,
    b0: f64,
    actions: Vec<ActionPosterior>,
}

impl PosteriorBank {
    pub fn new(num_actions: usize, latent_dim: usize, lambda_prior: f64, a0: f64, b0: f64) -> Self {
        Self {
            latent_dim,
            lambda_prior,
            a0,
            b0,
            actions: (0..num_actions)
                .map(|_| ActionPosterior::prior(latent_dim, lambda_prior, a0, b0))
                .collect(),
        }
    }

    pub fn num_actions(&self) -> usize {
        self.actions.len()
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    pub fn action(&self, action: usize) -> Option<&ActionPosterior> {
        self.actions.get(action)
    }

    pub fn actions(&self) -> &[ActionPosterior] {
        &self.actions
    }

    /// Put every action back on the prior for a new latent dimension.
    pub fn reset_priors(&mut self, latent_dim: usize) {
        let (lambda, a0, b0) = (self.lambda_prior, self.a0, self.b0);
        self.latent_dim = latent_dim;
        for post in &mut self.actions {
            *post = ActionPosterior::prior(latent_dim, lambda, a0, b0);
        }
    }

    /// Recompute every action that has rows in `latent`, from scratch.
    pub fn refresh(&mut self, latent: &ContextBuffer<usize>) -> RefreshReport {
        let dim = latent.row_dim();
        if dim != self.latent_dim {
            info!(
                "Latent dimension changed {} -> {}, resetting posteriors",
                self.latent_dim, dim
            );
            self.reset_priors(dim);
        }

        let mut report = RefreshReport::default();
        for action in 0..self.actions.len() {
            let rows = latent.rows_for_action(action);
            if rows.is_empty() {
                report.skipped.push(action);
                continue;
            }

            match self.fit(&rows.contexts, &rows.rewards) {
                Ok(post) => {
                    self.actions[action] = post;
                    report.updated.push(action);
                }
                Err(e) => {
                    warn!("Posterior refresh failed for action {}: {}", action, e);
                    report.failed.push((action, e));
                }
            }
        }

        debug!(
            "Posterior refresh: updated={:?}, skipped={:?}, failed={}",
            report.updated,
            report.skipped,
            report.failed.len()
        );
        report
    }

    fn fit(&self, z: &Array2<f64>, y: &Array1<f64>) -> Result<ActionPosterior> {
        let n = z.nrows();
        let precision = z.t().dot(z) + &(Array2::<f64>::eye(self.latent_dim) * self.lambda_prior);
        let cov = invert_spd(&precision)?;
        let mu = cov.dot(&z.t().dot(y));

        let a = self.a0 + n as f64 / 2.0;
        let mut b = self.b0 + 0.5 * y.dot(y) - 0.5 * mu.dot(&precision.dot(&mu));
        if !b.is_finite() {
            return Err(BanditError::LinearAlgebra(format!(
                "non-finite inverse-gamma scale ({})",
                b
            )));
        }
        if b <= 0.0 {
            warn!("Non-positive inverse-gamma scale {:.3e}, clamping", b);
            b = MIN_NOISE_SCALE;
        }

        Ok(ActionPosterior {
            mu,
            cov,
            precision,
            noise: NoiseBelief::new(a, b),
            observations: n,
        })
    }

    fn check_latent(&self, z: &ArrayView1<f64>) -> Result<()> {
        if z.len() != self.latent_dim {
            return Err(BanditError::ContextLength {
                expected: self.latent_dim,
                actual: z.len(),
            });
        }
        Ok(())
    }

    /// One Thompson draw per action.
    pub fn sample<R: Rng + ?Sized>(&self, z: ArrayView1<f64>, rng: &mut R) -> Result<Array1<f64>> {
        self.check_latent(&z)?;
        Ok(self
            .actions
            .iter()
            .enumerate()
            .map(|(a, post)| post.sample_score(a, z, rng))
            .collect())
    }

    /// Same as [`sample`](Self::sample) but draws actions on the rayon pool.
    /// Each action gets its own RNG seeded from `rng`, so results are
    /// reproducible for a given caller seed (not equal to the sequential draw).
    pub fn sample_parallel<R: Rng + ?Sized>(
        &self,
        z: ArrayView1<f64>,
        rng: &mut R,
    ) -> Result<Array1<f64>> {
        self.check_latent(&z)?;
        let seeds: Vec<u64> = (0..self.actions.len()).map(|_| rng.gen()).collect();
        let scores: Vec<f64> = self
            .actions
            .par_iter()
            .zip(seeds.par_iter())
            .enumerate()
            .map(|(a, (post, &seed))| {
                let mut local = StdRng::seed_from_u64(seed);
                post.sample_score(a, z, &mut local)
            })
            .collect();
        Ok(Array1::from_vec(scores))
    }

    /// Posterior mean score per action, `mu · z`.
    pub fn expected_value(&self, z: ArrayView1<f64>) -> Result<Array1<f64>> {
        self.check_latent(&z)?;
        Ok(self.actions.iter().map(|post| post.mu.dot(&z)).collect())
    }

    /// Predictive variance per action, `E[sigma^2] · (1 + zᵀ cov z)`.
    pub fn predictive_variance(&self, z: ArrayView1<f64>) -> Result<Array1<f64>> {
        self.check_latent(&z)?;
        Ok(self
            .actions
            .iter()
            .map(|post| {
                let noise = post.noise.mean().unwrap_or(post.noise.b);
                noise * (1.0 + z.dot(&post.cov.dot(&z)))
            })
            .collect())
    }
}

fn to_dmatrix(m: &Array2<f64>) -> DMatrix<f64> {
    let (rows, cols) = m.dim();
    DMatrix::from_fn(rows, cols, |i, j| m[[i, j]])
}

/// Inverse of a symmetric positive-definite matrix: Cholesky first, LU as a
/// second attempt. Errors if neither yields a finite result.
pub fn invert_spd(m: &Array2<f64>) -> Result<Array2<f64>> {
    let (rows, cols) = m.dim();
    if rows != cols {
        return Err(BanditError::LinearAlgebra(format!(
            "cannot invert {}x{} matrix",
            rows, cols
        )));
    }

    let dm = to_dmatrix(m);
    let finite = |inv: &DMatrix<f64>| inv.iter().all(|v| v.is_finite());
    let inverse = Cholesky::new(dm.clone())
        .map(|c| c.inverse())
        .filter(finite)
        .or_else(|| dm.try_inverse().filter(finite))
        .ok_or_else(|| {
            BanditError::LinearAlgebra("matrix is singular or ill-conditioned".to_string())
        })?;

    // Symmetrize to absorb round-off before it reaches a sampling factorization.
    Ok(Array2::from_shape_fn((rows, cols), |(i, j)| {
        0.5 * (inverse[(i, j)] + inverse[(j, i)])
    }))
}
