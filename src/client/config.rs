//! Client configuration
//!
//! JSON file or `Default`; every field is optional in the file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{ClientError, ClientResult};

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Requested session timeout (default 30s)
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Bound on one handshake (default 5s)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Period between majority probes while read-only (default 2s)
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Bound on one probe handshake, shorter than `connect_timeout_ms`
    /// (default 1s)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Deadline for one operation, queueing included (default 10s)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Operations queued ahead of the session task (default 1024)
    #[serde(default = "default_request_queue_capacity")]
    pub request_queue_capacity: usize,

    /// Events queued per watcher (default 64)
    #[serde(default = "default_watcher_queue_capacity")]
    pub watcher_queue_capacity: usize,

    /// Accept read-only connections when no quorum is reachable
    #[serde(default)]
    pub allow_read_only: bool,

    /// Shuffle the roster before the first connection (default true)
    #[serde(default = "default_shuffle_roster")]
    pub shuffle_roster: bool,

    /// Pause after a full pass over the roster fails; doubles per pass
    /// (default 100ms)
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// Upper bound for the reconnect pause (default 2s)
    #[serde(default = "default_max_reconnect_backoff_ms")]
    pub max_reconnect_backoff_ms: u64,

    /// Authentication token presented on every handshake
    #[serde(default)]
    pub auth: Option<String>,
}

fn default_session_timeout_ms() -> u64 {
    30_000
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_probe_interval_ms() -> u64 {
    2_000
}
fn default_probe_timeout_ms() -> u64 {
    1_000
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_request_queue_capacity() -> usize {
    1024
}
fn default_watcher_queue_capacity() -> usize {
    64
}
fn default_shuffle_roster() -> bool {
    true
}
fn default_reconnect_backoff_ms() -> u64 {
    100
}
fn default_max_reconnect_backoff_ms() -> u64 {
    2_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: default_session_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            request_queue_capacity: default_request_queue_capacity(),
            watcher_queue_capacity: default_watcher_queue_capacity(),
            allow_read_only: false,
            shuffle_roster: default_shuffle_roster(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            max_reconnect_backoff_ms: default_max_reconnect_backoff_ms(),
            auth: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> ClientResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("Failed to read config: {}", e)))?;

        let config: ClientConfig = serde_json::from_str(&content)
            .map_err(|e| ClientError::Config(format!("Invalid config JSON: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> ClientResult<()> {
        let timeouts = [
            ("session_timeout_ms", self.session_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("probe_interval_ms", self.probe_interval_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("reconnect_backoff_ms", self.reconnect_backoff_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ClientError::Config(format!("{} must be > 0", name)));
            }
        }

        if self.probe_timeout_ms >= self.connect_timeout_ms {
            return Err(ClientError::Config(format!(
                "probe_timeout_ms ({}) must be shorter than connect_timeout_ms ({})",
                self.probe_timeout_ms, self.connect_timeout_ms
            )));
        }

        if self.max_reconnect_backoff_ms < self.reconnect_backoff_ms {
            return Err(ClientError::Config(
                "max_reconnect_backoff_ms must be >= reconnect_backoff_ms".to_string(),
            ));
        }

        if self.request_queue_capacity == 0 {
            return Err(ClientError::Config(
                "request_queue_capacity must be > 0".to_string(),
            ));
        }
        if self.watcher_queue_capacity == 0 {
            return Err(ClientError::Config(
                "watcher_queue_capacity must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_allow_read_only(mut self, allow_read_only: bool) -> Self {
        self.allow_read_only = allow_read_only;
        self
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn max_reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_backoff_ms)
    }
}
