//! RMSprop with named parameter groups.
//!
//! Each group follows an inverse-time decay schedule
//! `lr(step) = base_lr / (1 + decay_rate * step)`. Gradients are clipped to a
//! global L2 norm before the update.

use ndarray::{Array1, ArrayD, ArrayViewMutD};
use serde::{Deserialize, Serialize};
use std::fmt;

const RMS_ALPHA: f64 = 0.99;
const RMS_EPS: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamGroup {
    /// Memorization path: user embedding and its head.
    Wide,
    /// Generalization path: the context MLP.
    Deep,
    /// Layers joining wide and deep outputs.
    Combine,
}

impl fmt::Display for ParamGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Wide => "wide",
            Self::Deep => "deep",
            Self::Combine => "combine",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupSchedule {
    pub base_lr: f64,
    pub decay_rate: f64,
    pub lr: f64,
}

impl GroupSchedule {
    pub fn new(base_lr: f64, decay_rate: f64) -> Self {
        Self {
            base_lr,
            decay_rate,
            lr: base_lr,
        }
    }

    pub fn lr_at(&self, step: u64) -> f64 {
        self.base_lr / (1.0 + self.decay_rate * step as f64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmsProp {
    schedules: Vec<(ParamGroup, GroupSchedule)>,
    /// Running mean of squared gradients, one flat buffer per parameter.
    square_avg: Vec<Array1<f64>>,
}

impl RmsProp {
    pub fn new(schedules: Vec<(ParamGroup, GroupSchedule)>) -> Self {
        Self {
            schedules,
            square_avg: Vec::new(),
        }
    }

    pub fn lr(&self, group: ParamGroup) -> f64 {
        self.schedule(group).map(|s| s.lr).unwrap_or(0.0)
    }

    pub fn learning_rates(&self) -> Vec<(ParamGroup, f64)> {
        self.schedules.iter().map(|(g, s)| (*g, s.lr)).collect()
    }

    fn schedule(&self, group: ParamGroup) -> Option<&GroupSchedule> {
        self.schedules
            .iter()
            .find(|(g, _)| *g == group)
            .map(|(_, s)| s)
    }

    /// Move every group to its scheduled rate for `step`.
    pub fn set_step(&mut self, step: u64) {
        for (_, s) in &mut self.schedules {
            s.lr = s.lr_at(step);
        }
    }

    /// Restore every group to its base rate.
    pub fn reset(&mut self) {
        for (_, s) in &mut self.schedules {
            s.lr = s.base_lr;
        }
    }

    /// Apply one update. `params` and `grads` must line up one-to-one and keep
    /// the same order across calls.
    pub fn step(
        &mut self,
        params: Vec<(ParamGroup, ArrayViewMutD<'_, f64>)>,
        grads: &[ArrayD<f64>],
    ) {
        assert_eq!(params.len(), grads.len(), "parameter/gradient count mismatch");

        if self.square_avg.len() != params.len() {
            self.square_avg = params.iter().map(|(_, p)| Array1::zeros(p.len())).collect();
        }

        let lrs: Vec<f64> = params.iter().map(|(group, _)| self.lr(*group)).collect();

        for ((((_, mut param), grad), avg), lr) in params
            .into_iter()
            .zip(grads)
            .zip(self.square_avg.iter_mut())
            .zip(lrs)
        {
            for ((p, &g), v) in param.iter_mut().zip(grad.iter()).zip(avg.iter_mut()) {
                *v = RMS_ALPHA * *v + (1.0 - RMS_ALPHA) * g * g;
                *p -= lr * g / (v.sqrt() + RMS_EPS);
            }
        }
    }
}

/// Scale `grads` in place so their joint L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut [ArrayD<f64>], max_norm: f64) -> f64 {
    let total = grads
        .iter()
        .map(|g| g.iter().map(|v| v * v).sum::<f64>())
        .sum::<f64>()
        .sqrt();

    let coef = max_norm / (total + 1e-6);
    if coef < 1.0 {
        for g in grads.iter_mut() {
            g.mapv_inplace(|v| v * coef);
        }
    }
    total
}
