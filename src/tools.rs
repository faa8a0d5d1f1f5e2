//! MCP Tool definitions and handlers
//!
//! Four tools: decide, record, save_agent, agent_status.
//! The agent sits behind one mutex: `record` is a multi-step
//! read-modify-write and must never interleave with another call. A panic
//! while the lock is held poisons it, and every later call fails with an
//! internal error rather than touching a half-updated agent.

use crate::agent::WideDeepBandit;
use crate::config::Strategy;
use crate::mcp::{RpcError, Tool};
use crate::network::Approximator;
use crate::storage::StorageManager;
use crate::users::UserId;
use anyhow::{bail, Result};
use ndarray::Array1;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ToolHandler {
    agent: Arc<Mutex<WideDeepBandit>>,
    storage: StorageManager,
    agent_name: String,
    /// Auto-save every this many recorded events; 0 disables.
    snapshot_every: u64,
}

fn parse_user(args: &Value) -> Result<UserId, RpcError> {
    match &args["user_id"] {
        Value::String(s) => Ok(UserId::from(s.as_str())),
        Value::Number(n) => Ok(UserId::new(n.to_string())),
        _ => Err(RpcError::invalid_params("user_id is required (string or number)")),
    }
}

fn parse_context(args: &Value) -> Result<Array1<f64>, RpcError> {
    let values = args["context"]
        .as_array()
        .ok_or_else(|| RpcError::invalid_params("context is required (array of numbers)"))?
        .iter()
        .map(|v| {
            v.as_f64()
                .ok_or_else(|| RpcError::invalid_params("context must contain only numbers"))
        })
        .collect::<Result<Vec<f64>, RpcError>>()?;
    Ok(Array1::from_vec(values))
}

fn parse_strategy(args: &Value) -> Result<Strategy, RpcError> {
    match args["strategy"].as_str() {
        Some(s) => s.parse::<Strategy>().map_err(|e| RpcError::invalid_params(e.to_string())),
        None => Ok(Strategy::default()),
    }
}

fn parse_action(args: &Value) -> Result<usize, RpcError> {
    let raw = args["action"]
        .as_u64()
        .ok_or_else(|| RpcError::invalid_params("action is required (non-negative integer)"))?;
    usize::try_from(raw)
        .map_err(|_| RpcError::invalid_params(format!("action {} does not fit in usize", raw)))
}

impl ToolHandler {
    pub fn new(
        agent: WideDeepBandit,
        storage: StorageManager,
        agent_name: impl Into<String>,
        snapshot_every: u64,
    ) -> Self {
        Self {
            agent: Arc::new(Mutex::new(agent)),
            storage,
            agent_name: agent_name.into(),
            snapshot_every,
        }
    }

    fn agent(&self) -> Result<MutexGuard<'_, WideDeepBandit>, RpcError> {
        self.agent.lock().map_err(|_| {
            RpcError::internal("agent state is unusable after a failed update; restart the server")
        })
    }

    pub fn get_tools() -> Vec<Tool> {
        vec![
            Tool {
                name: "decide".to_string(),
                description: r#"Choose an action for a user in a given context.

During the warm-up phase actions are assigned round-robin and no scores are returned.
Afterwards the action with the highest score under the chosen strategy is returned."#
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "user_id": {
                            "type": ["string", "integer"],
                            "description": "Caller-side user identifier"
                        },
                        "context": {
                            "type": "array",
                            "items": { "type": "number" },
                            "description": "Context feature vector (num_features values)"
                        },
                        "strategy": {
                            "type": "string",
                            "enum": ["thompson_sampling", "expected_value", "forward", "BLR_TS", "BLR"],
                            "default": "thompson_sampling"
                        }
                    },
                    "required": ["user_id", "context"]
                }),
            },
            Tool {
                name: "record".to_string(),
                description: r#"Record the observed reward for an action taken in a context.

Updates the data buffers and, on their configured cadence, retrains the network
and refreshes the per-action posteriors."#
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "user_id": { "type": ["string", "integer"] },
                        "context": {
                            "type": "array",
                            "items": { "type": "number" }
                        },
                        "action": { "type": "integer", "minimum": 0 },
                        "reward": { "type": "number" }
                    },
                    "required": ["user_id", "context", "action", "reward"]
                }),
            },
            Tool {
                name: "save_agent".to_string(),
                description: "Write a full snapshot of the agent to disk.".to_string(),
                input_schema: json!({ "type": "object", "properties": {} }),
            },
            Tool {
                name: "agent_status".to_string(),
                description: "Report the event counter, buffer sizes, learning rates and posterior summaries."
                    .to_string(),
                input_schema: json!({ "type": "object", "properties": {} }),
            },
        ]
    }

    pub fn handle_decide(&self, args: Value) -> Result<Value> {
        let user = parse_user(&args)?;
        let context = parse_context(&args)?;
        let strategy = parse_strategy(&args)?;

        let mut agent = self.agent()?;
        let decision = agent.decide_with_scores(&user, context.view(), strategy)?;
        debug!("decide: user={} action={} ({})", user, decision.action, strategy);

        Ok(json!({
            "action": decision.action,
            "warm_up": decision.is_warm_up(),
            "known_user": agent.users().contains(&user),
            "strategy": strategy.to_string(),
            "scores": decision.scores.map(|s| s.to_vec()),
            "t": agent.t()
        }))
    }

    pub fn handle_record(&self, args: Value) -> Result<Value> {
        let user = parse_user(&args)?;
        let context = parse_context(&args)?;
        let action = parse_action(&args)?;
        let reward = args["reward"]
            .as_f64()
            .ok_or_else(|| RpcError::invalid_params("reward is required (number)"))?;

        let mut agent = self.agent()?;
        agent.record(&user, context.view(), action, reward)?;
        let t = agent.t();

        let mut saved = false;
        if self.snapshot_every > 0 && t % self.snapshot_every == 0 {
            match self.storage.save_agent(&self.agent_name, &*agent) {
                Ok(_) => saved = true,
                Err(e) => warn!("Auto-save failed at t={}: {:#}", t, e),
            }
        }

        Ok(json!({
            "success": true,
            "t": t,
            "snapshot_saved": saved
        }))
    }

    pub fn handle_save_agent(&self, _args: Value) -> Result<Value> {
        let agent = self.agent()?;
        let path = self.storage.save_agent(&self.agent_name, &*agent)?;
        Ok(json!({
            "success": true,
            "agent": self.agent_name,
            "path": path.display().to_string(),
            "t": agent.t()
        }))
    }

    pub fn handle_agent_status(&self, _args: Value) -> Result<Value> {
        let agent = self.agent()?;
        let config = agent.config();
        let network = agent.approximator();

        let learning_rates: serde_json::Map<String, Value> = network
            .learning_rates()
            .into_iter()
            .map(|(group, lr)| (group.to_string(), json!(lr)))
            .collect();

        let posteriors: Vec<Value> = agent
            .posteriors()
            .actions()
            .iter()
            .enumerate()
            .map(|(action, post)| {
                json!({
                    "action": action,
                    "observations": post.observations,
                    "noise_a": post.noise.a,
                    "noise_b": post.noise.b,
                    "noise_mean": post.noise.mean()
                })
            })
            .collect();

        let saved: Vec<Value> = match self.storage.list_agents() {
            Ok(list) => list
                .into_iter()
                .map(|a| json!({ "name": a.name, "saved_at": a.saved_at, "t": a.t }))
                .collect(),
            Err(e) => {
                debug!("Could not list saved agents: {:#}", e);
                Vec::new()
            }
        };

        Ok(json!({
            "agent": self.agent_name,
            "t": agent.t(),
            "in_warm_up": agent.in_warm_up(),
            "events": agent.raw_buffer().len(),
            "users": agent.users().len() - 1,
            "num_actions": config.num_actions,
            "num_features": config.num_features,
            "model_type": network.model_type(),
            "combine_method": network.combine_method(),
            "latent_dim": network.latent_dim(),
            "learning_rates": learning_rates,
            "posteriors": posteriors,
            "saved_agents": saved
        }))
    }

    /// Route a tool call to the appropriate handler
    pub fn handle(&self, tool_name: &str, args: Value) -> Result<Value> {
        match tool_name {
            "decide" => self.handle_decide(args),
            "record" => self.handle_record(args),
            "save_agent" => self.handle_save_agent(args),
            "agent_status" => self.handle_agent_status(args),
            _ => bail!("Unknown tool: {}", tool_name),
        }
    }

    /// Save on shutdown so no recorded events are lost.
    pub fn flush(&self) -> Result<()> {
        let agent = self.agent()?;
        if agent.t() > 0 {
            self.storage.save_agent(&self.agent_name, &*agent)?;
            info!("Flushed agent {} at t={}", self.agent_name, agent.t());
        }
        Ok(())
    }
}
