//! Serving node configuration
//!
//! Loaded from a JSON file. Every field has a default so an empty object is
//! a valid leader listening on the loopback interface.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{ServerError, ServerResult};
use super::gate::QuorumRole;
use super::node::NodeSettings;

/// Node configuration file structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Listen address (default "127.0.0.1:2181")
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Node name used in logs (default "node1")
    #[serde(default = "default_name")]
    pub name: String,

    /// Quorum role: "leading", "following" or "looking" (default "leading")
    #[serde(default = "default_role")]
    pub role: String,

    /// Whether a follower's leader is active (default true)
    #[serde(default = "default_leader_active")]
    pub leader_active: bool,

    /// Tick in milliseconds (default 2000)
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Token every client must present (default none)
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn default_listen() -> String {
    "127.0.0.1:2181".to_string()
}
fn default_name() -> String {
    "node1".to_string()
}
fn default_role() -> String {
    "leading".to_string()
}
fn default_leader_active() -> bool {
    true
}
fn default_tick_ms() -> u64 {
    2000
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            name: default_name(),
            role: default_role(),
            leader_active: default_leader_active(),
            tick_ms: default_tick_ms(),
            auth_token: None,
        }
    }
}

impl NodeConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> ServerResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| ServerError::config(format!("Failed to read config: {}", e)))?;

        let config: NodeConfig = serde_json::from_str(&content)
            .map_err(|e| ServerError::config(format!("Invalid config JSON: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> ServerResult<()> {
        self.listen_addr()?;
        self.quorum_role()?;

        if self.tick_ms == 0 {
            return Err(ServerError::config("tick_ms must be > 0"));
        }
        if self.name.trim().is_empty() {
            return Err(ServerError::config("name must not be empty"));
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> ServerResult<SocketAddr> {
        self.listen.parse().map_err(|_| {
            ServerError::config(format!("Invalid listen address: '{}'", self.listen))
        })
    }

    pub fn quorum_role(&self) -> ServerResult<QuorumRole> {
        match self.role.as_str() {
            "leading" => Ok(QuorumRole::Leading),
            "following" => Ok(QuorumRole::Following {
                leader_active: self.leader_active,
            }),
            "looking" => Ok(QuorumRole::Looking),
            other => Err(ServerError::config(format!(
                "Invalid role: '{}'. Expected leading, following or looking.",
                other
            ))),
        }
    }

    pub fn settings(&self) -> NodeSettings {
        NodeSettings {
            name: self.name.clone(),
            tick: Duration::from_millis(self.tick_ms),
            auth_token: self.auth_token.clone(),
            local_session_prefix: 1,
        }
    }
}
