//! Configuration for wide-deep-bandit
//!
//! TOML config at ~/.wide-deep-bandit/config.toml
//! All fields have defaults matching the reference wide & deep bandit setup.

use crate::error::{BanditError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::{debug, info};

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Which sub-models make up the function approximator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    /// Memorization only: per-user embedding.
    Wide,
    /// Generalization only: MLP over the context.
    Deep,
    /// Both, joined by a [`CombineMethod`].
    WideDeep,
}

impl FromStr for ModelType {
    type Err = BanditError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "wide" => Ok(Self::Wide),
            "deep" => Ok(Self::Deep),
            "wide_deep" => Ok(Self::WideDeep),
            _ => Err(BanditError::UnknownVariant {
                kind: "model_type",
                value: s.to_string(),
                expected: "\"wide\", \"deep\", \"wide_deep\"",
            }),
        }
    }
}

/// How the wide and deep sub-models are joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineMethod {
    /// Sum the two reward estimates.
    Add,
    /// Concatenate the two reward estimates.
    ConcatReward,
    /// Concatenate the reward estimates, then a learned linear layer.
    ConcatRewardLlr,
    /// Concatenate the latent representations, then a learned linear layer.
    ConcatRepresentationLlr,
}

impl FromStr for CombineMethod {
    type Err = BanditError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(Self::Add),
            "concat_reward" => Ok(Self::ConcatReward),
            "concat_reward_llr" => Ok(Self::ConcatRewardLlr),
            "concat_representation_llr" => Ok(Self::ConcatRepresentationLlr),
            _ => Err(BanditError::UnknownVariant {
                kind: "combine_method",
                value: s.to_string(),
                expected: "\"add\", \"concat_reward\", \"concat_reward_llr\", \"concat_representation_llr\"",
            }),
        }
    }
}

/// Action-selection strategy used by `decide`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Network forward pass.
    Forward,
    /// Posterior mean of the Bayesian linear regression.
    ExpectedValue,
    /// Bayesian linear regression + Thompson sampling.
    #[default]
    ThompsonSampling,
}

impl FromStr for Strategy {
    type Err = BanditError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "forward" => Ok(Self::Forward),
            "expected_value" | "BLR" => Ok(Self::ExpectedValue),
            "thompson_sampling" | "BLR_TS" => Ok(Self::ThompsonSampling),
            _ => Err(BanditError::UnknownVariant {
                kind: "strategy",
                value: s.to_string(),
                expected: "\"thompson_sampling\" (BLR_TS), \"expected_value\" (BLR), \"forward\"",
            }),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Forward => "forward",
            Self::ExpectedValue => "expected_value",
            Self::ThompsonSampling => "thompson_sampling",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_num_actions")]
    pub num_actions: usize,
    #[serde(default = "default_num_features")]
    pub num_features: usize,
    /// Rows in the wide model's user embedding table.
    #[serde(default = "default_wide_embed_size")]
    pub wide_embed_size: usize,
    #[serde(default = "default_wide_embed_dim")]
    pub wide_embed_dim: usize,
    /// Hidden layer widths of the deep model; the last one is its latent size.
    #[serde(default = "default_deep_layer_sizes")]
    pub deep_layer_sizes: Vec<usize>,
    #[serde(default = "default_model_type")]
    pub model_type: ModelType,
    #[serde(default = "default_combine_method")]
    pub combine_method: CombineMethod,
    /// Retrain the network every this many `record` calls.
    #[serde(default = "default_update_freq")]
    pub update_freq_network: u64,
    /// Refresh the posteriors every this many `record` calls.
    #[serde(default = "default_update_freq")]
    pub update_freq_posterior: u64,
    /// Minibatches per retrain.
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    #[serde(default = "default_a0")]
    pub a0: f64,
    #[serde(default = "default_b0")]
    pub b0: f64,
    #[serde(default = "default_lambda_prior")]
    pub lambda_prior: f64,
    /// Round-robin pulls per action before the learned policy is used.
    #[serde(default = "default_initial_pulls")]
    pub initial_pulls: u64,
    #[serde(default = "default_initial_lr")]
    pub initial_lr_wide: f64,
    #[serde(default = "default_initial_lr")]
    pub initial_lr_deep: f64,
    #[serde(default = "default_initial_lr")]
    pub initial_lr_combine: f64,
    #[serde(default)]
    pub lr_decay_rate_wide: f64,
    #[serde(default)]
    pub lr_decay_rate_deep: f64,
    #[serde(default)]
    pub lr_decay_rate_combine: f64,
    #[serde(default = "default_true")]
    pub reset_lr: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,
    #[serde(default = "default_true")]
    pub do_scaling: bool,
    /// Raw buffer capacity; `None` keeps everything.
    #[serde(default)]
    pub memory_size: Option<usize>,
    /// Append a constant 1.0 column to every raw context.
    #[serde(default)]
    pub intercept: bool,
    #[serde(default)]
    pub seed: u64,
    /// Draw per-action Thompson samples on the rayon pool.
    #[serde(default)]
    pub parallel_sampling: bool,
}

fn default_num_actions() -> usize {
    2
}

fn default_num_features() -> usize {
    5
}

fn default_wide_embed_size() -> usize {
    100
}

fn default_wide_embed_dim() -> usize {
    64
}

fn default_deep_layer_sizes() -> Vec<usize> {
    vec![50]
}

fn default_model_type() -> ModelType {
    ModelType::WideDeep
}

fn default_combine_method() -> CombineMethod {
    CombineMethod::ConcatRepresentationLlr
}

fn default_update_freq() -> u64 {
    1
}

fn default_num_epochs() -> usize {
    1
}

fn default_a0() -> f64 {
    6.0
}

fn default_b0() -> f64 {
    6.0
}

fn default_lambda_prior() -> f64 {
    0.25
}

fn default_initial_pulls() -> u64 {
    100
}

fn default_initial_lr() -> f64 {
    0.01
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    512
}

fn default_max_grad_norm() -> f64 {
    5.0
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            num_actions: default_num_actions(),
            num_features: default_num_features(),
            wide_embed_size: default_wide_embed_size(),
            wide_embed_dim: default_wide_embed_dim(),
            deep_layer_sizes: default_deep_layer_sizes(),
            model_type: default_model_type(),
            combine_method: default_combine_method(),
            update_freq_network: default_update_freq(),
            update_freq_posterior: default_update_freq(),
            num_epochs: default_num_epochs(),
            a0: default_a0(),
            b0: default_b0(),
            lambda_prior: default_lambda_prior(),
            initial_pulls: default_initial_pulls(),
            initial_lr_wide: default_initial_lr(),
            initial_lr_deep: default_initial_lr(),
            initial_lr_combine: default_initial_lr(),
            lr_decay_rate_wide: 0.0,
            lr_decay_rate_deep: 0.0,
            lr_decay_rate_combine: 0.0,
            reset_lr: true,
            batch_size: default_batch_size(),
            max_grad_norm: default_max_grad_norm(),
            do_scaling: true,
            memory_size: None,
            intercept: false,
            seed: 0,
            parallel_sampling: false,
        }
    }
}

impl AgentConfig {
    /// Width of a raw buffer row (features plus the optional intercept column).
    pub fn input_dim(&self) -> usize {
        self.num_features + usize::from(self.intercept)
    }

    /// Dimension of the latent vector the posteriors regress on.
    pub fn latent_dim(&self) -> usize {
        let deep = self.deep_layer_sizes.last().copied().unwrap_or(0);
        match self.model_type {
            ModelType::Wide => self.wide_embed_dim,
            ModelType::Deep => deep,
            ModelType::WideDeep => self.wide_embed_dim + deep,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(BanditError::InvalidConfig(msg.to_string()));

        if self.num_actions == 0 {
            return fail("num_actions must be >= 1");
        }
        if self.num_features == 0 {
            return fail("num_features must be >= 1");
        }
        if self.update_freq_network == 0 || self.update_freq_posterior == 0 {
            return fail("update frequencies must be >= 1");
        }
        if self.num_epochs == 0 || self.batch_size == 0 {
            return fail("num_epochs and batch_size must be >= 1");
        }
        if matches!(self.model_type, ModelType::Wide | ModelType::WideDeep) {
            if self.wide_embed_size == 0 || self.wide_embed_dim == 0 {
                return fail("wide_embed_size and wide_embed_dim must be >= 1");
            }
        }
        if matches!(self.model_type, ModelType::Deep | ModelType::WideDeep) {
            if self.deep_layer_sizes.is_empty() || self.deep_layer_sizes.contains(&0) {
                return fail("deep_layer_sizes must be non-empty with non-zero widths");
            }
        }
        if !(self.a0 > 0.0 && self.b0 > 0.0) {
            return fail("a0 and b0 must be > 0");
        }
        if !(self.lambda_prior > 0.0 && self.lambda_prior.is_finite()) {
            return fail("lambda_prior must be finite and > 0");
        }
        let rates = [
            self.initial_lr_wide,
            self.initial_lr_deep,
            self.initial_lr_combine,
            self.lr_decay_rate_wide,
            self.lr_decay_rate_deep,
            self.lr_decay_rate_combine,
        ];
        if rates.iter().any(|r| !r.is_finite() || *r < 0.0) {
            return fail("learning rates and decay rates must be finite and >= 0");
        }
        if !(self.max_grad_norm > 0.0) {
            return fail("max_grad_norm must be > 0");
        }
        if self.memory_size == Some(0) {
            return fail("memory_size must be >= 1 when set");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Snapshot name under the storage directory.
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
    /// Save a snapshot every this many `record` calls (0 disables).
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every: u64,
}

fn default_agent_name() -> String {
    "default".to_string()
}

fn default_snapshot_every() -> u64 {
    100
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            agent_name: default_agent_name(),
            snapshot_every: default_snapshot_every(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    pub fn base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".wide-deep-bandit")
    }

    pub fn config_path() -> PathBuf {
        Self::base_dir().join("config.toml")
    }

    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        debug!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        debug!("Failed to parse config: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    debug!("Failed to read config: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    pub fn global() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            info!(
                "Config: actions={}, features={}, model={:?}, combine={:?}, agent={}",
                config.agent.num_actions,
                config.agent.num_features,
                config.agent.model_type,
                config.agent.combine_method,
                config.server.agent_name,
            );
            config
        })
    }

    pub fn create_default_if_missing() -> bool {
        let path = Self::config_path();
        if path.exists() {
            return false;
        }
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let config = Self::default();
        if let Ok(content) = toml::to_string_pretty(&config) {
            if std::fs::write(&path, content).is_ok() {
                info!("Created default config at {:?}", path);
                return true;
            }
        }
        false
    }
}
