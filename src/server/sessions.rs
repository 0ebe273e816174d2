//! Session table
//!
//! Tracks live sessions, their secrets and how many connections are attached
//! to each. A session with no attached connection expires once it has been
//! idle for its timeout. Closed and expired ids are remembered as retired and
//! can never be resumed while remembered; a retired id is forgotten once it
//! has been retired for longer than the longest timeout the table granted.
//!
//! Expired sessions are swept on `create` and `touch` (at most once per
//! `SWEEP_GAP`), on every `sweep` call and before `is_alive` answers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::protocol::HandshakeRejection;

const SECRET_LEN: usize = 16;

/// Minimum time between opportunistic sweeps.
const SWEEP_GAP: Duration = Duration::from_millis(50);

/// Hands out session ids. The top byte is a fixed prefix so ids minted by
/// different tables never collide.
#[derive(Debug)]
pub struct SessionIdAllocator {
    next: AtomicU64,
}

impl SessionIdAllocator {
    pub fn new(prefix: u8) -> Self {
        let base = ((prefix as u64) << 56) | ((rand::thread_rng().gen::<u32>() as u64) << 16);
        Self {
            next: AtomicU64::new(base),
        }
    }

    /// Never returns `NO_SESSION`.
    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Identity handed to a connection on a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGrant {
    pub session_id: u64,
    pub secret: Vec<u8>,
    pub timeout: Duration,
}

#[derive(Debug)]
struct SessionEntry {
    secret: Vec<u8>,
    timeout: Duration,
    attached: usize,
    last_seen: Instant,
}

impl SessionEntry {
    fn idle_expired(&self, now: Instant) -> bool {
        self.attached == 0 && now.duration_since(self.last_seen) > self.timeout
    }
}

#[derive(Debug)]
struct TableState {
    live: HashMap<u64, SessionEntry>,
    /// Retired id and when it was retired
    retired: HashMap<u64, Instant>,
    longest_timeout: Duration,
    last_sweep: Instant,
}

impl TableState {
    fn new() -> Self {
        Self {
            live: HashMap::new(),
            retired: HashMap::new(),
            longest_timeout: Duration::ZERO,
            last_sweep: Instant::now(),
        }
    }

    fn retire(&mut self, session_id: u64, now: Instant) -> bool {
        let was_live = self.live.remove(&session_id).is_some();
        self.retired.insert(session_id, now);
        was_live
    }

    /// Retire idle sessions and forget old retirements. Returns how many
    /// sessions expired.
    fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<u64> = self
            .live
            .iter()
            .filter(|(_, entry)| entry.idle_expired(now))
            .map(|(session_id, _)| *session_id)
            .collect();
        for session_id in &expired {
            self.retire(*session_id, now);
        }

        let keep_for = self.longest_timeout;
        self.retired
            .retain(|_, retired_at| now.duration_since(*retired_at) <= keep_for);
        self.last_sweep = now;
        expired.len()
    }

    fn maybe_sweep(&mut self, now: Instant) {
        if now.duration_since(self.last_sweep) >= SWEEP_GAP {
            self.sweep(now);
        }
    }
}

/// Live and retired sessions for one scope (an ensemble, or one node's
/// read-only sessions).
#[derive(Debug)]
pub struct SessionTable {
    ids: SessionIdAllocator,
    state: Mutex<TableState>,
}

impl SessionTable {
    pub fn new(prefix: u8) -> Self {
        Self {
            ids: SessionIdAllocator::new(prefix),
            state: Mutex::new(TableState::new()),
        }
    }

    /// Mint a session with one attached connection.
    pub fn create(&self, timeout: Duration) -> SessionGrant {
        let session_id = self.ids.allocate();
        let mut secret = vec![0u8; SECRET_LEN];
        rand::thread_rng().fill(&mut secret[..]);

        let now = Instant::now();
        let mut state = self.lock();
        state.maybe_sweep(now);
        state.longest_timeout = state.longest_timeout.max(timeout);
        state.live.insert(
            session_id,
            SessionEntry {
                secret: secret.clone(),
                timeout,
                attached: 1,
                last_seen: now,
            },
        );
        SessionGrant {
            session_id,
            secret,
            timeout,
        }
    }

    /// Attach to an existing session.
    ///
    /// `Ok(None)` if the id is unknown to this table. Retired ids, idle
    /// expired sessions and wrong secrets are `SessionExpired`.
    pub fn resume(
        &self,
        session_id: u64,
        secret: &[u8],
    ) -> Result<Option<SessionGrant>, HandshakeRejection> {
        let mut state = self.lock();
        if state.retired.contains_key(&session_id) {
            return Err(HandshakeRejection::SessionExpired);
        }

        let now = Instant::now();
        let expired = match state.live.get(&session_id) {
            None => return Ok(None),
            Some(entry) => entry.idle_expired(now),
        };
        if expired {
            state.retire(session_id, now);
            return Err(HandshakeRejection::SessionExpired);
        }

        let entry = state
            .live
            .get_mut(&session_id)
            .ok_or(HandshakeRejection::SessionExpired)?;
        if entry.secret != secret {
            return Err(HandshakeRejection::SessionExpired);
        }
        entry.attached += 1;
        entry.last_seen = now;
        Ok(Some(SessionGrant {
            session_id,
            secret: entry.secret.clone(),
            timeout: entry.timeout,
        }))
    }

    /// Record activity. False if the session is no longer live.
    pub fn touch(&self, session_id: u64) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        state.maybe_sweep(now);
        match state.live.get_mut(&session_id) {
            Some(entry) => {
                entry.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// A connection let go of the session.
    pub fn detach(&self, session_id: u64) {
        if let Some(entry) = self.lock().live.get_mut(&session_id) {
            entry.attached = entry.attached.saturating_sub(1);
            entry.last_seen = Instant::now();
        }
    }

    /// Close or expire a session for good. False if it was not live.
    pub fn retire(&self, session_id: u64) -> bool {
        self.lock().retire(session_id, Instant::now())
    }

    /// Expire idle sessions now. Returns how many expired.
    pub fn sweep(&self) -> usize {
        self.lock().sweep(Instant::now())
    }

    pub fn is_alive(&self, session_id: u64) -> bool {
        let mut state = self.lock();
        state.sweep(Instant::now());
        state.live.contains_key(&session_id)
    }

    pub fn is_retired(&self, session_id: u64) -> bool {
        self.lock().retired.contains_key(&session_id)
    }

    pub fn retired_len(&self) -> usize {
        self.lock().retired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
