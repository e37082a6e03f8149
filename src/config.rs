use serde::Deserialize;
use std::path::Path;

use crate::policy::DEFAULT_ALLOWED_TOOLS;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// Reported as `agent` by the health endpoint
    #[serde(default = "default_agent_name")]
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutorConfig {
    /// Used when an execute request carries no `timeout`
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Shell interpreting the command line (`<shell> -c <command>`)
    #[serde(default = "default_shell")]
    pub shell: String,
    /// How long to keep reading output after a process was killed
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
    /// How long a stopped job may take to exit after SIGTERM before
    /// its process group is sent SIGKILL
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Per-stream cap on captured output; the rest is read and discarded
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_agent_name() -> String {
    "kali-pentest-agent".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_drain_grace_ms() -> u64 {
    250
}

fn default_stop_grace_ms() -> u64 {
    5000
}

fn default_max_output_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_allowed_tools() -> Vec<String> {
    DEFAULT_ALLOWED_TOOLS.iter().map(|t| t.to_string()).collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            shell: default_shell(),
            drain_grace_ms: default_drain_grace_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_tools: default_allowed_tools(),
        }
    }
}

impl ServerConfig {
    /// `host:port` string passed to the listener
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Loads `path` if it exists, otherwise falls back to built-in defaults.
    ///
    /// Only used for the implicit default path: a path given on the
    /// command line must exist.
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${AGENT_PORT}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}
