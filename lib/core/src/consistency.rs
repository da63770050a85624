//! Per-query configurable consistency levels.
//!
//! Callers ask whether a replica with a given lag and log position may serve
//! a read under a requested level. Session consistency tracks read-your-writes
//! positions in a fixed-size table keyed by session token, evicting the
//! oldest session when full.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAX_SESSIONS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ConsistencyLevel {
    Strong = 0,
    Eventual = 1,
    BoundedStaleness = 2,
    Session = 3,
}

/// Per-query consistency requirement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    pub level: ConsistencyLevel,
    pub max_staleness_ms: u64,
    pub session_token: u64,
}

impl ConsistencyConfig {
    pub fn strong() -> Self {
        Self { level: ConsistencyLevel::Strong, max_staleness_ms: 0, session_token: 0 }
    }

    pub fn eventual() -> Self {
        Self { level: ConsistencyLevel::Eventual, max_staleness_ms: 0, session_token: 0 }
    }

    pub fn bounded(max_staleness_ms: u64) -> Self {
        Self { level: ConsistencyLevel::BoundedStaleness, max_staleness_ms, session_token: 0 }
    }

    pub fn session(token: u64) -> Self {
        Self { level: ConsistencyLevel::Session, max_staleness_ms: 0, session_token: token }
    }
}

#[derive(Debug, Clone, Copy)]
struct SessionEntry {
    token: u64,
    write_position: u64,
}

struct SessionTable {
    default_level: ConsistencyLevel,
    sessions: Vec<SessionEntry>,
}

impl SessionTable {
    fn lookup(&self, token: u64) -> Option<u64> {
        self.sessions
            .iter()
            .find(|s| s.token == token)
            .map(|s| s.write_position)
    }
}

/// Consistency manager: default level plus the session table.
pub struct ConsistencyManager {
    state: Mutex<SessionTable>,
    next_token: AtomicU64,
}

impl ConsistencyManager {
    pub fn new(default_level: ConsistencyLevel) -> Self {
        Self {
            state: Mutex::new(SessionTable {
                default_level,
                sessions: Vec::new(),
            }),
            // Tokens start at 1; 0 is reserved for "no session".
            next_token: AtomicU64::new(1),
        }
    }

    pub fn set_default(&self, level: ConsistencyLevel) {
        self.state.lock().default_level = level;
    }

    pub fn default_level(&self) -> ConsistencyLevel {
        self.state.lock().default_level
    }

    /// Decide whether a replica may serve a read under `config`.
    ///
    /// `replica_lag_ms` is the replica's current replication lag and
    /// `replica_position` its applied log position. Strong reads always
    /// refuse the replica (the caller routes to the leader).
    pub fn check(
        &self,
        config: &ConsistencyConfig,
        replica_lag_ms: u64,
        replica_position: u64,
    ) -> bool {
        match config.level {
            ConsistencyLevel::Strong => false,
            ConsistencyLevel::Eventual => true,
            ConsistencyLevel::BoundedStaleness => replica_lag_ms <= config.max_staleness_ms,
            ConsistencyLevel::Session => {
                let required = self.state.lock().lookup(config.session_token);
                match required {
                    // Unknown session or no writes recorded yet.
                    None | Some(0) => true,
                    Some(pos) => replica_position >= pos,
                }
            }
        }
    }

    /// Open a new session and return its token.
    ///
    /// When the table is full the oldest session is evicted.
    pub fn new_session(&self) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        if state.sessions.len() >= MAX_SESSIONS {
            state.sessions.remove(0);
        }
        state.sessions.push(SessionEntry { token, write_position: 0 });
        token
    }

    /// Record a write position for a session. Positions only move forward;
    /// a regression is silently ignored.
    pub fn update_session(&self, session_token: u64, write_position: u64) -> Result<()> {
        if session_token == 0 {
            return Err(Error::InvalidArgument("session token 0 is reserved".into()));
        }
        let mut state = self.state.lock();
        let entry = state
            .sessions
            .iter_mut()
            .find(|s| s.token == session_token)
            .ok_or(Error::SessionNotFound(session_token))?;
        if write_position > entry.write_position {
            entry.write_position = write_position;
        }
        Ok(())
    }

    /// Last write position recorded for a session; 0 for unknown sessions.
    pub fn session_position(&self, session_token: u64) -> u64 {
        if session_token == 0 {
            return 0;
        }
        self.state.lock().lookup(session_token).unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strong_never_admits_replica() {
        let mgr = ConsistencyManager::new(ConsistencyLevel::Strong);
        assert!(!mgr.check(&ConsistencyConfig::strong(), 0, u64::MAX));
    }

    #[test]
    fn eventual_always_admits() {
        let mgr = ConsistencyManager::new(ConsistencyLevel::Eventual);
        assert!(mgr.check(&ConsistencyConfig::eventual(), u64::MAX, 0));
    }

    #[test]
    fn bounded_staleness_compares_lag() {
        let mgr = ConsistencyManager::new(ConsistencyLevel::Eventual);
        let config = ConsistencyConfig::bounded(100);
        assert!(mgr.check(&config, 100, 0));
        assert!(!mgr.check(&config, 101, 0));
    }

    #[test]
    fn session_read_your_writes() {
        let mgr = ConsistencyManager::new(ConsistencyLevel::Session);
        let token = mgr.new_session();
        let config = ConsistencyConfig::session(token);

        // No writes yet: any replica works.
        assert!(mgr.check(&config, 0, 0));

        mgr.update_session(token, 500).unwrap();
        assert!(!mgr.check(&config, 0, 499));
        assert!(mgr.check(&config, 0, 500));
    }

    #[test]
    fn unknown_session_admits() {
        let mgr = ConsistencyManager::new(ConsistencyLevel::Session);
        assert!(mgr.check(&ConsistencyConfig::session(9999), 0, 0));
    }

    #[test]
    fn session_position_is_monotonic() {
        let mgr = ConsistencyManager::new(ConsistencyLevel::Session);
        let token = mgr.new_session();
        mgr.update_session(token, 100).unwrap();
        mgr.update_session(token, 50).unwrap();
        assert_eq!(mgr.session_position(token), 100);
    }

    #[test]
    fn update_unknown_session_fails() {
        let mgr = ConsistencyManager::new(ConsistencyLevel::Session);
        assert!(matches!(
            mgr.update_session(4242, 1),
            Err(Error::SessionNotFound(4242))
        ));
        assert!(mgr.update_session(0, 1).is_err());
    }

    #[test]
    fn full_table_evicts_oldest() {
        let mgr = ConsistencyManager::new(ConsistencyLevel::Session);
        let first = mgr.new_session();
        mgr.update_session(first, 77).unwrap();

        for _ in 0..MAX_SESSIONS {
            mgr.new_session();
        }
        assert_eq!(mgr.session_count(), MAX_SESSIONS);

        // The first session was evicted; its position is gone.
        assert_eq!(mgr.session_position(first), 0);
        assert!(mgr.update_session(first, 80).is_err());
    }

    #[test]
    fn tokens_are_unique_and_nonzero() {
        let mgr = ConsistencyManager::new(ConsistencyLevel::Eventual);
        let a = mgr.new_session();
        let b = mgr.new_session();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn default_level_settable() {
        let mgr = ConsistencyManager::new(ConsistencyLevel::Strong);
        assert_eq!(mgr.default_level(), ConsistencyLevel::Strong);
        mgr.set_default(ConsistencyLevel::Eventual);
        assert_eq!(mgr.default_level(), ConsistencyLevel::Eventual);
    }
}
