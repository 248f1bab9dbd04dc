use std::{path::PathBuf, time::Duration};

use clap::Parser;

const DEFAULT_AGENT_DIR_NAME: &str = "ssh-agents";

#[derive(Debug, Parser, Clone)]
#[command(name = "agent-broker")]
#[command(about = "Delegates SSH key operations to out-of-process agents")]
pub struct Config {
    /// Directory holding `<agent>.sock` sockets.
    #[arg(long)]
    pub agent_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 30_000)]
    pub invoke_timeout_ms: u64,

    #[arg(long, default_value_t = 8)]
    pub max_interaction_hops: u32,

    #[arg(long, default_value_t = 300)]
    pub resolved_ttl_secs: u64,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long, default_value_t = false)]
    pub json_output: bool,
}

impl Config {
    pub fn agent_dir(&self) -> PathBuf {
        self.agent_dir.clone().unwrap_or_else(|| {
            dirs::runtime_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(DEFAULT_AGENT_DIR_NAME)
        })
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            invoke_timeout: Duration::from_millis(self.invoke_timeout_ms),
            max_interaction_hops: self.max_interaction_hops,
            resolved_ttl: Duration::from_secs(self.resolved_ttl_secs),
        }
    }
}

/// Broker tuning, independent of how the process was configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub invoke_timeout: Duration,
    pub max_interaction_hops: u32,
    pub resolved_ttl: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            invoke_timeout: Duration::from_secs(30),
            max_interaction_hops: 8,
            resolved_ttl: Duration::from_secs(300),
        }
    }
}
