//! Belief over the observation noise variance
//!
//! A per-action posterior mean is meaningless without knowing how noisy the
//! rewards are. The noise variance follows an Inverse-Gamma(a, b): `a` grows
//! with the number of observations, `b` with the residual sum of squares.

use rand::Rng;
use rand_distr::{Distribution, Gamma};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Inverse-Gamma(a, b) belief over sigma^2.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseBelief {
    pub a: f64,
    pub b: f64,
}

impl NoiseBelief {
    pub fn new(a: f64, b: f64) -> Self {
        Self { a, b }
    }

    /// Posterior mean `b / (a - 1)`; only defined for `a > 1`.
    pub fn mean(&self) -> Option<f64> {
        (self.a > 1.0).then(|| self.b / (self.a - 1.0))
    }

    /// Thompson sampling: sigma^2 = b / Gamma(a, 1).
    ///
    /// Falls back to the scale `b` if the shape is unusable or the Gamma draw
    /// underflows to zero.
    pub fn sample_variance<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match Gamma::new(self.a, 1.0) {
            Ok(dist) => {
                let g: f64 = dist.sample(rng);
                if g > 0.0 && g.is_finite() {
                    self.b / g
                } else {
                    self.b
                }
            }
            Err(e) => {
                warn!("Invalid noise belief (a={}, b={}): {}", self.a, self.b, e);
                self.b
            }
        }
    }
}
