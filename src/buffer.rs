//! Contextual data buffer
//!
//! Append-only store of `(user, context, action, reward)` events with an
//! optional FIFO capacity. Rewards are kept as a dense `(events x actions)`
//! matrix holding the observed reward in the taken action's column and zero
//! elsewhere.
//!
//! Eviction only advances a head offset; the evicted prefix is dropped in one
//! copy once it grows to `memory_size` rows, so a full buffer appends in
//! amortized O(row width).
//!
//! The agent keeps two of these: the raw buffer (keyed by [`UserId`]) and the
//! latent buffer, whose context rows are network representations and whose
//! user column holds dense user indices.
//!
//! [`UserId`]: crate::users::UserId

use crate::error::{BanditError, Result};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Per-column mean/std snapshot used to standardize contexts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingStats {
    pub means: Array1<f64>,
    pub stds: Array1<f64>,
}

impl ScalingStats {
    /// Standardize the first `means.len()` columns of a single row.
    /// Trailing columns (the intercept) pass through.
    pub fn apply(&self, row: ArrayView1<f64>) -> Array1<f64> {
        let mut out = row.to_owned();
        for (col, v) in out.iter_mut().enumerate().take(self.means.len()) {
            *v = (*v - self.means[col]) / self.stds[col];
        }
        out
    }

    fn apply_rows(&self, rows: ArrayView2<f64>) -> Array2<f64> {
        let mut out = rows.to_owned();
        for mut row in out.rows_mut() {
            for col in 0..self.means.len() {
                row[col] = (row[col] - self.means[col]) / self.stds[col];
            }
        }
        out
    }
}

/// A minibatch drawn from the buffer.
#[derive(Debug, Clone)]
pub struct Batch<U> {
    pub user_ids: Vec<U>,
    pub contexts: Array2<f64>,
    pub rewards: Array2<f64>,
    /// One-hot rows marking the action taken for each sample.
    pub weights: Array2<f64>,
    pub actions: Vec<usize>,
}

impl<U> Batch<U> {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// All rows recorded for one action, in arrival order.
#[derive(Debug, Clone)]
pub struct ActionRows<U> {
    pub user_ids: Vec<U>,
    pub contexts: Array2<f64>,
    pub rewards: Array1<f64>,
}

impl<U> ActionRows<U> {
    pub fn len(&self) -> usize {
        self.rewards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Scaled {
    stats: ScalingStats,
    contexts: Array2<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBuffer<U> {
    context_dim: usize,
    num_actions: usize,
    memory_size: Option<usize>,
    intercept: bool,
    user_ids: Vec<U>,
    contexts: Array2<f64>,
    rewards: Array2<f64>,
    actions: Vec<usize>,
    /// Rows before `head` have been evicted but not yet compacted away.
    #[serde(default)]
    head: usize,
    /// Cleared on every mutation; only trusted after `rescale()`.
    #[serde(default)]
    scaled: Option<Scaled>,
}

impl<U: Clone> ContextBuffer<U> {
    pub fn new(
        context_dim: usize,
        num_actions: usize,
        memory_size: Option<usize>,
        intercept: bool,
    ) -> Self {
        let row_dim = context_dim + usize::from(intercept);
        Self {
            context_dim,
            num_actions,
            memory_size,
            intercept,
            user_ids: Vec::new(),
            contexts: Array2::zeros((0, row_dim)),
            rewards: Array2::zeros((0, num_actions)),
            actions: Vec::new(),
            head: 0,
            scaled: None,
        }
    }

    pub fn len(&self) -> usize {
        self.actions.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn context_dim(&self) -> usize {
        self.context_dim
    }

    /// Stored row width: `context_dim` plus one if the intercept is enabled.
    pub fn row_dim(&self) -> usize {
        self.context_dim + usize::from(self.intercept)
    }

    pub fn num_actions(&self) -> usize {
        self.num_actions
    }

    pub fn memory_size(&self) -> Option<usize> {
        self.memory_size
    }

    pub fn user_ids(&self) -> &[U] {
        &self.user_ids[self.head..]
    }

    pub fn contexts(&self) -> ArrayView2<'_, f64> {
        self.contexts.slice(s![self.head.., ..])
    }

    pub fn rewards(&self) -> ArrayView2<'_, f64> {
        self.rewards.slice(s![self.head.., ..])
    }

    pub fn actions(&self) -> &[usize] {
        &self.actions[self.head..]
    }

    /// Validate a raw context and append the intercept column if enabled.
    pub fn prepare_context<'a>(
        &self,
        context: impl Into<ArrayView1<'a, f64>>,
    ) -> Result<Array1<f64>> {
        let context = context.into();
        if context.len() != self.context_dim {
            return Err(BanditError::ContextLength {
                expected: self.context_dim,
                actual: context.len(),
            });
        }
        let mut row = Array1::zeros(self.row_dim());
        row.slice_mut(s![..self.context_dim]).assign(&context);
        if self.intercept {
            row[self.context_dim] = 1.0;
        }
        Ok(row)
    }

    fn check_action(&self, action: usize) -> Result<()> {
        if action >= self.num_actions {
            return Err(BanditError::InvalidAction {
                action,
                num_actions: self.num_actions,
            });
        }
        Ok(())
    }

    /// Append one event, evicting the oldest row if over capacity.
    pub fn append<'a>(
        &mut self,
        user: U,
        context: impl Into<ArrayView1<'a, f64>>,
        action: usize,
        reward: f64,
    ) -> Result<()> {
        self.check_action(action)?;
        let row = self.prepare_context(context)?;

        let mut reward_row = Array1::zeros(self.num_actions);
        reward_row[action] = reward;

        self.contexts
            .push_row(row.view())
            .map_err(|e| BanditError::LengthMismatch(e.to_string()))?;
        self.rewards
            .push_row(reward_row.view())
            .map_err(|e| BanditError::LengthMismatch(e.to_string()))?;
        self.actions.push(action);
        self.user_ids.push(user);
        self.scaled = None;

        if let Some(cap) = self.memory_size {
            if self.len() > cap {
                self.head += 1;
                if self.head >= cap {
                    self.compact();
                }
            }
        }

        debug_assert!(self.is_consistent());
        Ok(())
    }

    /// Drop the evicted prefix from storage.
    fn compact(&mut self) {
        if self.head == 0 {
            return;
        }
        let head = self.head;
        self.contexts = self.contexts.slice(s![head.., ..]).to_owned();
        self.rewards = self.rewards.slice(s![head.., ..]).to_owned();
        self.actions.drain(..head);
        self.user_ids.drain(..head);
        self.head = 0;
    }

    /// Bulk-load events. Fails without mutating if the batch is malformed or
    /// would push the buffer past `memory_size`.
    pub fn ingest(
        &mut self,
        user_ids: Vec<U>,
        contexts: ArrayView2<f64>,
        actions: &[usize],
        rewards: &[f64],
    ) -> Result<()> {
        let n = rewards.len();

        if let Some(cap) = self.memory_size {
            let current = self.len();
            if n + current > cap {
                return Err(BanditError::CapacityExceeded {
                    incoming: n,
                    current,
                    capacity: cap,
                });
            }
        }

        if contexts.dim() != (n, self.context_dim) {
            return Err(BanditError::ContextShape {
                expected: (n, self.context_dim),
                actual: contexts.dim(),
            });
        }

        if actions.len() != n || user_ids.len() != n {
            return Err(BanditError::LengthMismatch(format!(
                "{} rewards, {} actions, {} user ids",
                n,
                actions.len(),
                user_ids.len()
            )));
        }
        for &a in actions {
            self.check_action(a)?;
        }

        self.compact();
        let mut rows = Array2::ones((n, self.row_dim()));
        rows.slice_mut(s![.., ..self.context_dim]).assign(&contexts);

        // Sparse (row = event, column = action) triplets, densified.
        let mut reward_rows = Array2::zeros((n, self.num_actions));
        for (i, (&a, &r)) in actions.iter().zip(rewards).enumerate() {
            reward_rows[[i, a]] = r;
        }

        let contexts = ndarray::concatenate(Axis(0), &[self.contexts.view(), rows.view()])
            .map_err(|e| BanditError::LengthMismatch(e.to_string()))?;
        let rewards = ndarray::concatenate(Axis(0), &[self.rewards.view(), reward_rows.view()])
            .map_err(|e| BanditError::LengthMismatch(e.to_string()))?;

        self.contexts = contexts;
        self.rewards = rewards;
        self.actions.extend_from_slice(actions);
        self.user_ids.extend(user_ids);
        self.scaled = None;

        debug!("Ingested {} events ({} total)", n, self.len());
        Ok(())
    }

    fn gather(&self, indices: &[usize], scaled: bool) -> Result<Batch<U>> {
        let source = if scaled {
            self.scaled_contexts()?.view()
        } else {
            self.contexts()
        };
        let (all_actions, all_users) = (self.actions(), self.user_ids());

        let mut weights = Array2::zeros((indices.len(), self.num_actions));
        let mut actions = Vec::with_capacity(indices.len());
        for (row, &i) in indices.iter().enumerate() {
            let a = all_actions[i];
            weights[[row, a]] = 1.0;
            actions.push(a);
        }

        Ok(Batch {
            user_ids: indices.iter().map(|&i| all_users[i].clone()).collect(),
            contexts: source.select(Axis(0), indices),
            rewards: self.rewards().select(Axis(0), indices),
            weights,
            actions,
        })
    }

    /// Uniform minibatch of `size` rows, drawn with replacement.
    pub fn sample_batch<R: Rng + ?Sized>(
        &self,
        size: usize,
        scaled: bool,
        rng: &mut R,
    ) -> Result<Batch<U>> {
        self.sample_batch_recent(size, 0, scaled, rng)
    }

    /// Like [`sample_batch`](Self::sample_batch), but the first
    /// `min(n_recent, size, len)` rows are the most recently appended events.
    pub fn sample_batch_recent<R: Rng + ?Sized>(
        &self,
        size: usize,
        n_recent: usize,
        scaled: bool,
        rng: &mut R,
    ) -> Result<Batch<U>> {
        let n = self.len();
        if n == 0 {
            return Err(BanditError::EmptyBuffer);
        }

        let mut indices: Vec<usize> = (0..size).map(|_| rng.gen_range(0..n)).collect();
        let n_recent = n_recent.min(size).min(n);
        for (slot, idx) in indices.iter_mut().take(n_recent).zip(n - n_recent..n) {
            *slot = idx;
        }

        self.gather(&indices, scaled)
    }

    /// Recompute per-column mean/std over the current contexts and cache the
    /// standardized copy. Zero (or undefined) deviations are treated as 1.
    pub fn rescale(&mut self) -> Result<&ScalingStats> {
        let n = self.len();
        if n == 0 {
            return Err(BanditError::EmptyBuffer);
        }

        let contexts = self.contexts();
        let features = contexts.slice(s![.., ..self.context_dim]);
        let means = features
            .mean_axis(Axis(0))
            .ok_or(BanditError::EmptyBuffer)?;
        let stds = if n > 1 {
            features.std_axis(Axis(0), 1.0)
        } else {
            Array1::zeros(self.context_dim)
        };
        let stds = stds.mapv(|s| if s == 0.0 || !s.is_finite() { 1.0 } else { s });

        let stats = ScalingStats { means, stds };
        let contexts = stats.apply_rows(contexts);
        let scaled = self.scaled.insert(Scaled { stats, contexts });
        Ok(&scaled.stats)
    }

    /// Statistics from the last `rescale()`, if still valid.
    pub fn scaling_stats(&self) -> Option<&ScalingStats> {
        self.scaled.as_ref().map(|s| &s.stats)
    }

    pub fn scaled_contexts(&self) -> Result<&Array2<f64>> {
        self.scaled
            .as_ref()
            .map(|s| &s.contexts)
            .ok_or(BanditError::NotScaled)
    }

    /// Rescale with current data and standardize one prepared row.
    pub fn scale_row(&mut self, row: ArrayView1<f64>) -> Result<Array1<f64>> {
        let stats = self.rescale()?;
        Ok(stats.apply(row))
    }

    /// Every `(user, context, reward)` where `action` was taken, in order.
    pub fn rows_for_action(&self, action: usize) -> ActionRows<U> {
        let indices: Vec<usize> = self
            .actions()
            .iter()
            .enumerate()
            .filter(|(_, a)| **a == action)
            .map(|(i, _)| i)
            .collect();

        let rewards = if action < self.num_actions {
            let rewards = self.rewards();
            indices.iter().map(|&i| rewards[[i, action]]).collect()
        } else {
            Array1::zeros(0)
        };

        ActionRows {
            user_ids: indices.iter().map(|&i| self.user_ids()[i].clone()).collect(),
            contexts: self.contexts().select(Axis(0), &indices),
            rewards,
        }
    }

    /// Overwrite all context rows. The row count must match; the width may
    /// differ when the representation size changes.
    pub fn replace_contexts(&mut self, contexts: Array2<f64>) -> Result<()> {
        if contexts.nrows() != self.len() {
            return Err(BanditError::LengthMismatch(format!(
                "replacement has {} rows, buffer has {}",
                contexts.nrows(),
                self.len()
            )));
        }
        self.compact();
        self.context_dim = contexts.ncols() - usize::from(self.intercept).min(contexts.ncols());
        self.contexts = contexts;
        self.scaled = None;
        Ok(())
    }

    /// Reject a deserialized buffer whose parallel columns disagree.
    pub fn check_layout(&self) -> Result<()> {
        if self.is_consistent() {
            Ok(())
        } else {
            Err(BanditError::LengthMismatch(format!(
                "buffer columns disagree: {} actions, {} users, {} contexts, {} rewards, head {}",
                self.actions.len(),
                self.user_ids.len(),
                self.contexts.nrows(),
                self.rewards.nrows(),
                self.head
            )))
        }
    }

    fn is_consistent(&self) -> bool {
        let n = self.actions.len();
        self.head <= n
            && self.user_ids.len() == n
            && self.contexts.nrows() == n
            && self.rewards.nrows() == n
    }
}

impl<U: Clone + PartialEq> ContextBuffer<U> {
    /// Number of stored events for `user`.
    pub fn user_frequency(&self, user: &U) -> usize {
        self.user_ids().iter().filter(|u| *u == user).count()
    }
}
