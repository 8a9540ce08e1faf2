//! Agent configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// AgentInfo object name; defaults to the node name
    #[serde(default)]
    pub agent_name: Option<String>,

    /// API server port for health/metrics and the collector feeds
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Unconditional AgentInfo sync interval in seconds
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Delay before retrying a failed sync, in milliseconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_channel_capacity")]
    pub learning_channel_capacity: usize,

    #[serde(default = "default_channel_capacity")]
    pub table_update_channel_capacity: usize,

    /// Persist AgentInfo to the Kubernetes API server. When false an
    /// in-memory store is used.
    #[serde(default = "default_use_kube")]
    pub use_kube: bool,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME")
        .ok()
        .filter(|name| !name.is_empty())
        .or_else(ovs_agent_lib::builder::local_hostname)
        .unwrap_or_else(|| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_sync_interval() -> u64 {
    60
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_use_kube() -> bool {
    true
}

impl AgentConfig {
    /// Load configuration from `AGENT_*` environment variables
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("AGENT"))
            .build()?;

        let config: AgentConfig = config
            .try_deserialize()
            .context("invalid agent configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.sync_interval_secs == 0 {
            anyhow::bail!("sync_interval_secs must be greater than zero");
        }
        if self.learning_channel_capacity == 0 || self.table_update_channel_capacity == 0 {
            anyhow::bail!("channel capacities must be greater than zero");
        }
        Ok(())
    }

    /// Identity of this agent
    pub fn agent_name(&self) -> &str {
        self.agent_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.node_name)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
