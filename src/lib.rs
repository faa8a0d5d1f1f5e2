//! Contextual bandit with a wide & deep neural representation and per-action
//! Bayesian linear regression posteriors.
//!
//! The [`WideDeepBandit`] agent decides with Thompson sampling (or the
//! posterior mean, or a plain network forward pass) over latent features
//! learned by a [`WideDeepNetwork`], and can be served over MCP stdio by the
//! `wide-deep-bandit` binary.

pub mod agent;
pub mod belief;
pub mod buffer;
pub mod config;
pub mod error;
pub mod layers;
pub mod mcp;
pub mod network;
pub mod optim;
pub mod posterior;
pub mod storage;
pub mod tools;
pub mod users;

pub use agent::{AgentSnapshot, Decision, WideDeepBandit};
pub use buffer::ContextBuffer;
pub use config::{AgentConfig, CombineMethod, Config, ModelType, Strategy};
pub use error::{BanditError, Result};
pub use network::{Approximator, WideDeepNetwork};
pub use posterior::PosteriorBank;
pub use users::UserId;
