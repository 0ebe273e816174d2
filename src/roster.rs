//! Server roster
//!
//! The list of ensemble endpoints a client may connect to, plus the
//! per-endpoint role hint learned from handshakes and probes.
//!
//! - The list is swapped as a whole (`replace`); readers take snapshots.
//! - Each hint is a single atomic cell, written by the session task and the
//!   prober without further coordination.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use rand::seq::SliceRandom;
use thiserror::Error;

/// Roster errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RosterError {
    /// A roster must contain at least one endpoint
    #[error("roster is empty")]
    Empty,

    /// Endpoint is not `host:port`
    #[error("invalid endpoint '{0}': expected host:port")]
    InvalidEndpoint(String),

    /// More members than distinct local session prefixes
    #[error("{size} members requested, at most {max} supported")]
    TooLarge { size: usize, max: usize },
}

/// Last known role of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RoleHint {
    Unknown = 0,
    ReadOnly = 1,
    ReadWrite = 2,
}

impl RoleHint {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RoleHint::ReadOnly,
            2 => RoleHint::ReadWrite,
            _ => RoleHint::Unknown,
        }
    }

    /// Selection rank: lower is tried first.
    fn rank(&self) -> u8 {
        match self {
            RoleHint::ReadWrite => 0,
            RoleHint::Unknown => 1,
            RoleHint::ReadOnly => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoleHint::Unknown => "unknown",
            RoleHint::ReadOnly => "read_only",
            RoleHint::ReadWrite => "read_write",
        }
    }
}

/// One ensemble member address.
#[derive(Debug)]
pub struct ServerEndpoint {
    host: String,
    port: u16,
    hint: AtomicU8,
}

/// Shared endpoint handle.
pub type EndpointRef = Arc<ServerEndpoint>;

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            hint: AtomicU8::new(RoleHint::Unknown as u8),
        }
    }

    /// Parse `host:port`.
    pub fn parse(input: &str) -> Result<Self, RosterError> {
        let input = input.trim();
        let (host, port) = input
            .rsplit_once(':')
            .ok_or_else(|| RosterError::InvalidEndpoint(input.to_string()))?;
        if host.is_empty() {
            return Err(RosterError::InvalidEndpoint(input.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| RosterError::InvalidEndpoint(input.to_string()))?;
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, also the endpoint's identity within a roster.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn role_hint(&self) -> RoleHint {
        RoleHint::from_u8(self.hint.load(Ordering::Acquire))
    }

    pub fn set_role_hint(&self, hint: RoleHint) {
        self.hint.store(hint as u8, Ordering::Release);
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Refreshable list of ensemble endpoints.
#[derive(Debug)]
pub struct ServerRoster {
    endpoints: RwLock<Arc<[EndpointRef]>>,
}

impl ServerRoster {
    /// Build a roster. Duplicate addresses are kept once.
    pub fn new(endpoints: Vec<ServerEndpoint>) -> Result<Self, RosterError> {
        let endpoints = Self::dedup(endpoints.into_iter().map(Arc::new).collect());
        if endpoints.is_empty() {
            return Err(RosterError::Empty);
        }
        Ok(Self {
            endpoints: RwLock::new(endpoints.into()),
        })
    }

    /// Parse a comma separated connect string (`host:port,host:port`).
    pub fn parse(connect_string: &str) -> Result<Self, RosterError> {
        let endpoints = connect_string
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ServerEndpoint::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(endpoints)
    }

    /// Current endpoint list.
    pub fn snapshot(&self) -> Arc<[EndpointRef]> {
        Arc::clone(&self.endpoints.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Randomize connection order.
    pub fn shuffle(&self) {
        let mut guard = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
        let mut shuffled = guard.to_vec();
        shuffled.shuffle(&mut rand::thread_rng());
        *guard = shuffled.into();
    }

    /// Swap in a new endpoint list. Endpoints already present keep their
    /// role hint.
    pub fn replace(&self, endpoints: Vec<ServerEndpoint>) -> Result<(), RosterError> {
        let mut guard = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
        let replacement: Vec<EndpointRef> = endpoints
            .into_iter()
            .map(|endpoint| {
                let address = endpoint.address();
                guard
                    .iter()
                    .find(|existing| existing.address() == address)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(endpoint))
            })
            .collect();
        let replacement = Self::dedup(replacement);
        if replacement.is_empty() {
            return Err(RosterError::Empty);
        }
        *guard = replacement.into();
        Ok(())
    }

    /// Look up an endpoint by `host:port`.
    pub fn find(&self, address: &str) -> Option<EndpointRef> {
        self.snapshot()
            .iter()
            .find(|endpoint| endpoint.address() == address)
            .cloned()
    }

    fn dedup(endpoints: Vec<EndpointRef>) -> Vec<EndpointRef> {
        let mut seen = HashSet::new();
        endpoints
            .into_iter()
            .filter(|endpoint| seen.insert(endpoint.address()))
            .collect()
    }
}

/// Picks the next endpoint within one reconnection episode.
///
/// Each endpoint is tried at most once per episode. Among untried endpoints
/// the best hint wins (read-write, then unknown, then read-only); ties go to
/// the next endpoint in round-robin order. `None` means the roster is
/// exhausted and the caller should back off before a new episode.
#[derive(Debug, Default)]
pub struct EndpointSelector {
    cursor: usize,
    tried: HashSet<String>,
    preferred: Option<String>,
}

impl EndpointSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget which endpoints were tried.
    pub fn begin_episode(&mut self) {
        self.tried.clear();
    }

    /// Try `address` first in the next selection, regardless of hints.
    pub fn prefer(&mut self, address: impl Into<String>) {
        self.preferred = Some(address.into());
    }

    pub fn next(&mut self, endpoints: &[EndpointRef]) -> Option<EndpointRef> {
        if endpoints.is_empty() {
            return None;
        }

        if let Some(preferred) = self.preferred.take() {
            if let Some(index) = endpoints.iter().position(|e| e.address() == preferred) {
                if !self.tried.contains(&preferred) {
                    return Some(self.take(endpoints, index));
                }
            }
        }

        let len = endpoints.len();
        let mut best: Option<(u8, usize)> = None;
        for offset in 0..len {
            let index = (self.cursor + offset) % len;
            let endpoint = &endpoints[index];
            if self.tried.contains(&endpoint.address()) {
                continue;
            }
            let rank = endpoint.role_hint().rank();
            if best.map_or(true, |(best_rank, _)| rank < best_rank) {
                best = Some((rank, index));
            }
        }

        best.map(|(_, index)| self.take(endpoints, index))
    }

    fn take(&mut self, endpoints: &[EndpointRef], index: usize) -> EndpointRef {
        let endpoint = Arc::clone(&endpoints[index]);
        self.tried.insert(endpoint.address());
        self.cursor = (index + 1) % endpoints.len();
        endpoint
    }
}
