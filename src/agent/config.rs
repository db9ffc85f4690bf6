use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

/// Base URLs of the two supported upstream providers.
///
/// Only overridden in tests and unusual network setups; the agent is not a
/// general-purpose router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub anthropic_base_url: String,
    pub openai_base_url: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            openai_base_url: "https://api.openai.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub upstreams: UpstreamConfig,
    /// Directory holding usage-data.json and budget-config.json.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("agentcost-data")
}

fn default_request_timeout() -> u64 {
    120
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            upstreams: UpstreamConfig::default(),
            data_dir: default_data_dir(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl AgentConfig {
    /// Load from a toml file; a missing file means defaults, a malformed one
    /// is a startup error (unlike the stores, config does not fail open).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let cfg = toml::from_str(&text)?;
        Ok(cfg)
    }

    pub fn usage_file(&self) -> PathBuf {
        self.data_dir.join("usage-data.json")
    }

    pub fn budget_file(&self) -> PathBuf {
        self.data_dir.join("budget-config.json")
    }
}
