//! Node configuration from a JSON file or command-line flags.
//!
//! A config file is one JSON object whose `type` picks the role:
//!
//! ```json
//! {"type": "blender", "addr": "127.0.0.1", "port": 5000, "threads": 4}
//! {"type": "jondo", "addr": "127.0.0.1", "port": 6000, "threads": 4,
//!  "blenderAddr": "127.0.0.1", "blenderPort": 5000}
//! ```
//!
//! Jondo configs may also set `bias` (percent, default 66) and
//! `excludeSource` (default false).

use clap::{Parser, Subcommand};
use crowds_core::{Bias, BiasError, DEFAULT_BIAS, Node, RelayPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("threads must be at least 1")]
    NoThreads,
    #[error(transparent)]
    Bias(#[from] BiasError),
    #[error("Either a role subcommand or --config is required")]
    MissingRole,
    #[error("--config cannot be combined with role flags")]
    ConfigWithFlags,
}

/// Settings for a directory node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlenderConfig {
    pub addr: String,
    pub port: u16,
    pub threads: usize,
}

/// Settings for a forwarder node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JondoConfig {
    pub addr: String,
    pub port: u16,
    pub threads: usize,
    pub blender_addr: String,
    pub blender_port: u16,
    #[serde(default = "default_bias")]
    pub bias: u8,
    #[serde(default)]
    pub exclude_source: bool,
}

fn default_bias() -> u8 {
    DEFAULT_BIAS
}

impl JondoConfig {
    pub fn node(&self) -> Node {
        Node::new(self.addr.clone(), self.port)
    }

    pub fn directory(&self) -> Node {
        Node::new(self.blender_addr.clone(), self.blender_port)
    }

    pub fn policy(&self) -> Result<RelayPolicy, BiasError> {
        Ok(RelayPolicy::new(Bias::new(self.bias)?, self.exclude_source))
    }
}

impl BlenderConfig {
    pub fn node(&self) -> Node {
        Node::new(self.addr.clone(), self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeConfig {
    Blender(BlenderConfig),
    Jondo(JondoConfig),
}

impl NodeConfig {
    /// Parse and validate a config object.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn threads(&self) -> usize {
        match self {
            NodeConfig::Blender(c) => c.threads,
            NodeConfig::Jondo(c) => c.threads,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.threads() == 0 {
            return Err(ConfigError::NoThreads);
        }
        if let NodeConfig::Jondo(jondo) = self {
            jondo.policy()?;
        }
        Ok(())
    }
}

// ============================================================================
// Command line
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "crowds")]
#[command(about = "Crowds anonymity overlay: directory (blender) and forwarder (jondo) nodes")]
pub struct Cli {
    /// Load all settings from a JSON config file instead of flags
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub role: Option<Role>,
}

#[derive(Subcommand, Debug)]
pub enum Role {
    /// Run the directory node
    Blender {
        /// Address to listen on
        #[arg(short, long)]
        ip: String,
        /// Port to listen on
        #[arg(short, long)]
        port: u16,
        /// Number of connections handled concurrently
        #[arg(short, long)]
        threads: usize,
    },
    /// Run a forwarder node
    Jondo {
        /// Address to listen on (and to advertise)
        #[arg(short, long)]
        ip: String,
        /// Port to listen on
        #[arg(short, long)]
        port: u16,
        /// Number of connections handled concurrently
        #[arg(short, long)]
        threads: usize,
        /// Directory address
        #[arg(long)]
        blender_ip: String,
        /// Directory port
        #[arg(long)]
        blender_port: u16,
        /// Percent chance of relaying to a random member at each hop
        #[arg(long, default_value_t = DEFAULT_BIAS)]
        bias: u8,
        /// Never relay a ballot back to its declared source
        #[arg(long)]
        exclude_source: bool,
    },
}

impl Cli {
    /// Resolve flags or the config file into a validated config.
    pub fn into_config(self) -> Result<NodeConfig, ConfigError> {
        let config = match (self.config, self.role) {
            (Some(_), Some(_)) => return Err(ConfigError::ConfigWithFlags),
            (Some(path), None) => return NodeConfig::load(&path),
            (None, None) => return Err(ConfigError::MissingRole),
            (None, Some(Role::Blender { ip, port, threads })) => {
                NodeConfig::Blender(BlenderConfig {
                    addr: ip,
                    port,
                    threads,
                })
            }
            (
                None,
                Some(Role::Jondo {
                    ip,
                    port,
                    threads,
                    blender_ip,
                    blender_port,
                    bias,
                    exclude_source,
                }),
            ) => NodeConfig::Jondo(JondoConfig {
                addr: ip,
                port,
                threads,
                blender_addr: blender_ip,
                blender_port,
                bias,
                exclude_source,
            }),
        };
        config.validate()?;
        Ok(config)
    }
}
