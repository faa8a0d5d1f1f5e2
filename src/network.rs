//! Function approximator
//!
//! ## Architecture
//!
//! Wide (memorization):
//!   user index → embedding row (latent) → linear → reward per action
//!
//! Deep (generalization):
//!   context → [linear → ReLU] x n (last activation = latent) → linear → reward per action
//!
//! Wide & deep joins the two according to [`CombineMethod`]. Its latent vector
//! is always `concat(wide_latent, deep_latent)`, whatever the combine method.
//!
//! ## Training
//!
//! Masked MSE: only the taken action's slot contributes to the loss. One
//! RMSprop step per minibatch, after clipping the global gradient norm.

use crate::config::{AgentConfig, CombineMethod, ModelType};
use crate::error::Result;
use crate::layers::{relu, relu_backward, Embedding, Linear, LinearGrad};
use crate::optim::{clip_grad_norm, GroupSchedule, ParamGroup, RmsProp};
use ndarray::{s, Array1, Array2, ArrayD, ArrayView1, ArrayView2, ArrayViewMutD, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Minibatch handed to [`Approximator::train_step`].
#[derive(Debug, Clone, Copy)]
pub struct TrainingBatch<'a> {
    pub user_indices: &'a [usize],
    pub contexts: ArrayView2<'a, f64>,
    /// Observed rewards, non-zero only in the taken action's column.
    pub targets: ArrayView2<'a, f64>,
    /// One-hot mask of the taken action.
    pub weights: ArrayView2<'a, f64>,
}

impl TrainingBatch<'_> {
    pub fn len(&self) -> usize {
        self.user_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.user_indices.is_empty()
    }
}

/// Reward model the agent trains and reads latent features from.
pub trait Approximator {
    fn num_actions(&self) -> usize;

    fn latent_dim(&self) -> usize;

    /// Point estimate of the reward for every action.
    fn forward(&self, user_index: usize, context: ArrayView1<f64>) -> Array1<f64>;

    /// Last-layer features used as the regression design vector. Must not
    /// touch trainable state.
    fn representation(&self, user_index: usize, context: ArrayView1<f64>) -> Array1<f64>;

    fn representations(&self, user_indices: &[usize], contexts: ArrayView2<f64>) -> Array2<f64> {
        let mut out = Array2::zeros((user_indices.len(), self.latent_dim()));
        for (i, (&u, ctx)) in user_indices.iter().zip(contexts.rows()).enumerate() {
            out.row_mut(i).assign(&self.representation(u, ctx));
        }
        out
    }

    /// One gradient step. `step` drives the per-group learning-rate decay.
    /// Returns the minibatch loss before the update.
    fn train_step(&mut self, batch: &TrainingBatch<'_>, step: u64) -> f64;

    /// Put every parameter group back on its base learning rate.
    fn reset_learning_rates(&mut self);

    fn learning_rates(&self) -> Vec<(ParamGroup, f64)>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WideModel {
    embedding: Embedding,
    head: Linear,
}

struct WideGrads {
    table: Array2<f64>,
    head: LinearGrad,
}

impl WideModel {
    fn new(vocab: usize, dim: usize, num_actions: usize, rng: &mut StdRng) -> Self {
        Self {
            embedding: Embedding::new(vocab, dim, rng),
            head: Linear::new(dim, num_actions, rng),
        }
    }

    /// (latent, reward estimate)
    fn forward(&self, users: &[usize]) -> (Array2<f64>, Array2<f64>) {
        let rep = self.embedding.forward(users);
        let out = self.head.forward(rep.view());
        (rep, out)
    }

    fn backward(
        &self,
        users: &[usize],
        rep: &Array2<f64>,
        grad_out: Option<ArrayView2<f64>>,
        grad_rep: Option<ArrayView2<f64>>,
    ) -> WideGrads {
        let (head, mut g_rep) = match grad_out {
            Some(g) => self.head.backward(rep.view(), g),
            None => (self.head.zero_grad(), Array2::zeros(rep.raw_dim())),
        };
        if let Some(extra) = grad_rep {
            g_rep += &extra;
        }
        WideGrads {
            table: self.embedding.backward(users, g_rep.view()),
            head,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeepModel {
    hidden: Vec<Linear>,
    head: Linear,
}

struct DeepCache {
    inputs: Vec<Array2<f64>>,
    pre: Vec<Array2<f64>>,
    rep: Array2<f64>,
}

struct DeepGrads {
    hidden: Vec<LinearGrad>,
    head: LinearGrad,
}

impl DeepModel {
    fn new(input_dim: usize, layer_sizes: &[usize], num_actions: usize, rng: &mut StdRng) -> Self {
        let mut hidden = Vec::with_capacity(layer_sizes.len());
        let mut in_dim = input_dim;
        for &width in layer_sizes {
            hidden.push(Linear::new(in_dim, width, rng));
            in_dim = width;
        }
        Self {
            hidden,
            head: Linear::new(in_dim, num_actions, rng),
        }
    }

    fn latent_dim(&self) -> usize {
        self.head.in_dim()
    }

    fn forward(&self, x: ArrayView2<f64>) -> (DeepCache, Array2<f64>) {
        let mut inputs = Vec::with_capacity(self.hidden.len());
        let mut pre = Vec::with_capacity(self.hidden.len());
        let mut h = x.to_owned();
        for layer in &self.hidden {
            let z = layer.forward(h.view());
            let a = relu(&z);
            inputs.push(h);
            pre.push(z);
            h = a;
        }
        let out = self.head.forward(h.view());
        (DeepCache { inputs, pre, rep: h }, out)
    }

    fn backward(
        &self,
        cache: &DeepCache,
        grad_out: Option<ArrayView2<f64>>,
        grad_rep: Option<ArrayView2<f64>>,
    ) -> DeepGrads {
        let (head, mut g_h) = match grad_out {
            Some(g) => self.head.backward(cache.rep.view(), g),
            None => (self.head.zero_grad(), Array2::zeros(cache.rep.raw_dim())),
        };
        if let Some(extra) = grad_rep {
            g_h += &extra;
        }

        let mut hidden = Vec::with_capacity(self.hidden.len());
        for i in (0..self.hidden.len()).rev() {
            let g_pre = relu_backward(&cache.pre[i], &g_h);
            let (grad, g_in) = self.hidden[i].backward(cache.inputs[i].view(), g_pre.view());
            hidden.push(grad);
            g_h = g_in;
        }
        hidden.reverse();

        DeepGrads { hidden, head }
    }
}

/// Everything one batched forward pass produces, kept for backprop.
struct Pass {
    wide: Option<(Array2<f64>, Array2<f64>)>,
    deep: Option<(DeepCache, Array2<f64>)>,
    combine_input: Option<Array2<f64>>,
    output: Array2<f64>,
}

struct NetworkGrads {
    wide: Option<WideGrads>,
    deep: Option<DeepGrads>,
    combine: Option<LinearGrad>,
}

impl NetworkGrads {
    /// Flatten in the same order as [`collect_params`].
    fn into_flat(self) -> Vec<ArrayD<f64>> {
        let mut flat = Vec::new();
        if let Some(w) = self.wide {
            flat.push(w.table.into_dyn());
            flat.push(w.head.weight.into_dyn());
            flat.push(w.head.bias.into_dyn());
        }
        if let Some(d) = self.deep {
            for g in d.hidden {
                flat.push(g.weight.into_dyn());
                flat.push(g.bias.into_dyn());
            }
            flat.push(d.head.weight.into_dyn());
            flat.push(d.head.bias.into_dyn());
        }
        if let Some(c) = self.combine {
            flat.push(c.weight.into_dyn());
            flat.push(c.bias.into_dyn());
        }
        flat
    }
}

fn collect_params<'a>(
    wide: Option<&'a mut WideModel>,
    deep: Option<&'a mut DeepModel>,
    combine: Option<&'a mut Linear>,
) -> Vec<(ParamGroup, ArrayViewMutD<'a, f64>)> {
    let mut params = Vec::new();
    if let Some(w) = wide {
        params.push((ParamGroup::Wide, w.embedding.table.view_mut().into_dyn()));
        params.push((ParamGroup::Wide, w.head.weight.view_mut().into_dyn()));
        params.push((ParamGroup::Wide, w.head.bias.view_mut().into_dyn()));
    }
    if let Some(d) = deep {
        for layer in d.hidden.iter_mut() {
            params.push((ParamGroup::Deep, layer.weight.view_mut().into_dyn()));
            params.push((ParamGroup::Deep, layer.bias.view_mut().into_dyn()));
        }
        params.push((ParamGroup::Deep, d.head.weight.view_mut().into_dyn()));
        params.push((ParamGroup::Deep, d.head.bias.view_mut().into_dyn()));
    }
    if let Some(c) = combine {
        params.push((ParamGroup::Combine, c.weight.view_mut().into_dyn()));
        params.push((ParamGroup::Combine, c.bias.view_mut().into_dyn()));
    }
    params
}

fn hstack(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Array2<f64> {
    let (rows, ca) = a.dim();
    let mut out = Array2::zeros((rows, ca + b.ncols()));
    out.slice_mut(s![.., ..ca]).assign(&a);
    out.slice_mut(s![.., ca..]).assign(&b);
    out
}

/// Wide, deep or wide & deep reward network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WideDeepNetwork {
    model_type: ModelType,
    combine_method: CombineMethod,
    num_actions: usize,
    max_grad_norm: f64,
    wide: Option<WideModel>,
    deep: Option<DeepModel>,
    /// Joining layer for the `*_llr` combine methods.
    combine: Option<Linear>,
    optimizer: RmsProp,
}

impl WideDeepNetwork {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let a = config.num_actions;

        let wide = matches!(config.model_type, ModelType::Wide | ModelType::WideDeep)
            .then(|| WideModel::new(config.wide_embed_size, config.wide_embed_dim, a, &mut rng));
        let deep = matches!(config.model_type, ModelType::Deep | ModelType::WideDeep)
            .then(|| DeepModel::new(config.input_dim(), &config.deep_layer_sizes, a, &mut rng));

        let combine = match (config.model_type, config.combine_method) {
            (ModelType::WideDeep, CombineMethod::ConcatRewardLlr) => {
                Some(Linear::new(2 * a, a, &mut rng))
            }
            (ModelType::WideDeep, CombineMethod::ConcatRepresentationLlr) => {
                Some(Linear::new(config.latent_dim(), a, &mut rng))
            }
            _ => None,
        };

        let mut schedules = Vec::new();
        if wide.is_some() {
            schedules.push((
                ParamGroup::Wide,
                GroupSchedule::new(config.initial_lr_wide, config.lr_decay_rate_wide),
            ));
        }
        if deep.is_some() {
            schedules.push((
                ParamGroup::Deep,
                GroupSchedule::new(config.initial_lr_deep, config.lr_decay_rate_deep),
            ));
        }
        if combine.is_some() {
            schedules.push((
                ParamGroup::Combine,
                GroupSchedule::new(config.initial_lr_combine, config.lr_decay_rate_combine),
            ));
        }

        info!(
            "Built {:?} network ({:?}): latent_dim={}, actions={}",
            config.model_type,
            config.combine_method,
            config.latent_dim(),
            a
        );

        Ok(Self {
            model_type: config.model_type,
            combine_method: config.combine_method,
            num_actions: a,
            max_grad_norm: config.max_grad_norm,
            wide,
            deep,
            combine,
            optimizer: RmsProp::new(schedules),
        })
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    pub fn combine_method(&self) -> CombineMethod {
        self.combine_method
    }

    fn concat_reward(&self) -> bool {
        self.model_type == ModelType::WideDeep && self.combine_method == CombineMethod::ConcatReward
    }

    fn run(&self, users: &[usize], contexts: ArrayView2<f64>) -> Pass {
        let wide = self.wide.as_ref().map(|w| w.forward(users));
        let deep = self.deep.as_ref().map(|d| d.forward(contexts));

        let mut combine_input = None;
        let output = match (&wide, &deep) {
            (Some((_, w_out)), None) => w_out.clone(),
            (None, Some((_, d_out))) => d_out.clone(),
            (Some((w_rep, w_out)), Some((cache, d_out))) => match self.combine_method {
                CombineMethod::Add => w_out + d_out,
                CombineMethod::ConcatReward => hstack(w_out.view(), d_out.view()),
                CombineMethod::ConcatRewardLlr | CombineMethod::ConcatRepresentationLlr => {
                    let input = if self.combine_method == CombineMethod::ConcatRewardLlr {
                        hstack(w_out.view(), d_out.view())
                    } else {
                        hstack(w_rep.view(), cache.rep.view())
                    };
                    let out = match &self.combine {
                        Some(layer) => layer.forward(input.view()),
                        None => Array2::zeros((users.len(), self.num_actions)),
                    };
                    combine_input = Some(input);
                    out
                }
            },
            (None, None) => Array2::zeros((users.len(), self.num_actions)),
        };

        Pass {
            wide,
            deep,
            combine_input,
            output,
        }
    }

    fn backward(&self, pass: &Pass, users: &[usize], grad_out: &Array2<f64>) -> NetworkGrads {
        let a = self.num_actions;
        let g = grad_out.view();

        // Split the output gradient into (wide_out, wide_rep, deep_out, deep_rep) parts.
        let mut combine = None;
        let (w_out, w_rep, d_out, d_rep): (
            Option<Array2<f64>>,
            Option<Array2<f64>>,
            Option<Array2<f64>>,
            Option<Array2<f64>>,
        ) = match (self.model_type, self.combine_method) {
            (ModelType::Wide, _) => (Some(grad_out.clone()), None, None, None),
            (ModelType::Deep, _) => (None, None, Some(grad_out.clone()), None),
            (ModelType::WideDeep, CombineMethod::Add) => {
                (Some(grad_out.clone()), None, Some(grad_out.clone()), None)
            }
            (ModelType::WideDeep, CombineMethod::ConcatReward) => (
                Some(g.slice(s![.., ..a]).to_owned()),
                None,
                Some(g.slice(s![.., a..]).to_owned()),
                None,
            ),
            (ModelType::WideDeep, method) => {
                let (layer, input) = match (&self.combine, &pass.combine_input) {
                    (Some(layer), Some(input)) => (layer, input),
                    _ => return NetworkGrads { wide: None, deep: None, combine: None },
                };
                let (grad, g_in) = layer.backward(input.view(), g);
                combine = Some(grad);
                let split = if method == CombineMethod::ConcatRewardLlr {
                    a
                } else {
                    self.wide.as_ref().map(|w| w.embedding.dim()).unwrap_or(0)
                };
                let left = g_in.slice(s![.., ..split]).to_owned();
                let right = g_in.slice(s![.., split..]).to_owned();
                if method == CombineMethod::ConcatRewardLlr {
                    (Some(left), None, Some(right), None)
                } else {
                    (None, Some(left), None, Some(right))
                }
            }
        };

        let wide = match (&self.wide, &pass.wide) {
            (Some(model), Some((rep, _))) => Some(model.backward(
                users,
                rep,
                w_out.as_ref().map(|x| x.view()),
                w_rep.as_ref().map(|x| x.view()),
            )),
            _ => None,
        };
        let deep = match (&self.deep, &pass.deep) {
            (Some(model), Some((cache, _))) => Some(model.backward(
                cache,
                d_out.as_ref().map(|x| x.view()),
                d_rep.as_ref().map(|x| x.view()),
            )),
            _ => None,
        };

        NetworkGrads { wide, deep, combine }
    }

    /// Masked MSE and its unclipped gradients, in parameter order.
    fn loss_and_gradients(&self, batch: &TrainingBatch<'_>) -> (f64, Vec<ArrayD<f64>>) {
        let pass = self.run(batch.user_indices, batch.contexts);

        let (targets, weights) = if self.concat_reward() {
            (
                hstack(batch.targets, batch.targets),
                hstack(batch.weights, batch.weights),
            )
        } else {
            (batch.targets.to_owned(), batch.weights.to_owned())
        };

        let diff = &pass.output * &weights - &targets;
        let k = diff.len().max(1) as f64;
        let loss = diff.iter().map(|v| v * v).sum::<f64>() / k;
        let grad_out = (&diff * &weights) * (2.0 / k);

        let grads = self.backward(&pass, batch.user_indices, &grad_out);
        (loss, grads.into_flat())
    }
}

impl Approximator for WideDeepNetwork {
    fn num_actions(&self) -> usize {
        self.num_actions
    }

    fn latent_dim(&self) -> usize {
        let wide = self.wide.as_ref().map(|w| w.embedding.dim()).unwrap_or(0);
        let deep = self.deep.as_ref().map(DeepModel::latent_dim).unwrap_or(0);
        wide + deep
    }

    fn forward(&self, user_index: usize, context: ArrayView1<f64>) -> Array1<f64> {
        let contexts = context.insert_axis(Axis(0));
        let pass = self.run(&[user_index], contexts);
        let out = pass.output.row(0).to_owned();
        if self.concat_reward() {
            let a = self.num_actions;
            &out.slice(s![..a]) + &out.slice(s![a..])
        } else {
            out
        }
    }

    fn representation(&self, user_index: usize, context: ArrayView1<f64>) -> Array1<f64> {
        self.representations(&[user_index], context.insert_axis(Axis(0)))
            .row(0)
            .to_owned()
    }

    fn representations(&self, user_indices: &[usize], contexts: ArrayView2<f64>) -> Array2<f64> {
        let wide = self.wide.as_ref().map(|w| w.embedding.forward(user_indices));
        let deep = self.deep.as_ref().map(|d| d.forward(contexts).0.rep);
        match (wide, deep) {
            (Some(w), Some(d)) => hstack(w.view(), d.view()),
            (Some(w), None) => w,
            (None, Some(d)) => d,
            (None, None) => Array2::zeros((user_indices.len(), 0)),
        }
    }

    fn train_step(&mut self, batch: &TrainingBatch<'_>, step: u64) -> f64 {
        if batch.is_empty() {
            return 0.0;
        }

        let (loss, mut grads) = self.loss_and_gradients(batch);
        let norm = clip_grad_norm(&mut grads, self.max_grad_norm);

        let Self {
            wide,
            deep,
            combine,
            optimizer,
            ..
        } = self;
        optimizer.set_step(step);
        let params = collect_params(wide.as_mut(), deep.as_mut(), combine.as_mut());
        optimizer.step(params, &grads);

        debug!("Train step {}: loss={:.5}, grad_norm={:.4}", step, loss, norm);
        loss
    }

    fn reset_learning_rates(&mut self) {
        self.optimizer.reset();
    }

    fn learning_rates(&self) -> Vec<(ParamGroup, f64)> {
        self.optimizer.learning_rates()
    }
}
