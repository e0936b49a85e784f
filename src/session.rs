//! In-memory store for multi-step edit sessions.
//!
//! A session holds the latest encoded result of a chain of transforms
//! (resize → rotate → …) until it is downloaded, expires, or is evicted.
//!
//! ```text
//! create ──► Live ──update──► Live (created_at refreshed)
//!              │
//!              ├── take (download) ──► gone
//!              ├── TTL elapsed ──────► gone (reads already miss; sweep removes)
//!              ├── capacity full ────► oldest gone
//!              └── clear (pressure) ─► gone
//! ```
//!
//! The map sits behind a single `parking_lot::Mutex` that is only held for
//! the map operation itself. Concurrent updates to one id are
//! last-writer-wins: chaining reads the current version, transforms it
//! outside the lock, and replaces the whole value.
//!
//! Ids are UUID v4 (122 random bits) rendered as 32 lowercase hex chars.

use crate::clock::Clock;
use crate::imaging::OutputFormat;
use crate::tasks::PeriodicTask;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session '{0}' not found or expired")]
    NotFound(String),
}

/// The stored result of the latest transform in a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPayload {
    pub bytes: Bytes,
    pub format: OutputFormat,
    pub original_filename: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct TransformSession {
    pub id: String,
    pub payload: SessionPayload,
    /// Time of the last write; the TTL counts from here.
    pub created_at: Instant,
}

pub struct SessionStore {
    sessions: Mutex<HashMap<String, TransformSession>>,
    ttl: Duration,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl SessionStore {
    pub fn new(ttl: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
            clock,
        }
    }

    fn is_expired(&self, session: &TransformSession, now: Instant) -> bool {
        now.saturating_duration_since(session.created_at) >= self.ttl
    }

    /// Store a new session and return its id. At capacity, expired entries
    /// go first, then the oldest live one.
    pub fn create(&self, payload: SessionPayload) -> String {
        let now = self.clock.now();
        let id = new_session_id();
        let mut sessions = self.sessions.lock();

        if sessions.len() >= self.capacity {
            sessions.retain(|_, s| !self.is_expired(s, now));
        }
        while sessions.len() >= self.capacity {
            let oldest = sessions
                .values()
                .min_by_key(|s| s.created_at)
                .map(|s| s.id.clone());
            match oldest {
                Some(oldest) => {
                    debug!(session = %oldest, "evicting oldest session at capacity");
                    sessions.remove(&oldest);
                }
                None => break,
            }
        }

        sessions.insert(
            id.clone(),
            TransformSession {
                id: id.clone(),
                payload,
                created_at: now,
            },
        );
        id
    }

    /// Current version of a session. Expired entries miss even before a sweep.
    pub fn get(&self, id: &str) -> Result<TransformSession, SessionError> {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock();
        let live = sessions
            .get(id)
            .filter(|s| !self.is_expired(s, now))
            .cloned();
        live.ok_or_else(|| {
            sessions.remove(id);
            SessionError::NotFound(id.to_string())
        })
    }

    /// Replace the payload and restart the TTL.
    pub fn update(&self, id: &str, payload: SessionPayload) -> Result<(), SessionError> {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(id) {
            Some(s) if !self.is_expired(s, now) => {
                s.payload = payload;
                s.created_at = now;
                Ok(())
            }
            _ => {
                sessions.remove(id);
                Err(SessionError::NotFound(id.to_string()))
            }
        }
    }

    /// Remove a session. Returns whether a live one was removed.
    pub fn delete(&self, id: &str) -> bool {
        let now = self.clock.now();
        self.sessions
            .lock()
            .remove(id)
            .is_some_and(|s| !self.is_expired(&s, now))
    }

    /// Atomically read and remove a session (download consumes it).
    pub fn take(&self, id: &str) -> Result<TransformSession, SessionError> {
        let now = self.clock.now();
        match self.sessions.lock().remove(id) {
            Some(s) if !self.is_expired(&s, now) => Ok(s),
            _ => Err(SessionError::NotFound(id.to_string())),
        }
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| !self.is_expired(s, now));
        before - sessions.len()
    }

    /// Drop every session. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let removed = sessions.len();
        sessions.clear();
        sessions.shrink_to_fit();
        removed
    }

    /// Give back map capacity left over from earlier peaks.
    pub fn shrink(&self) {
        self.sessions.lock().shrink_to_fit();
    }

    /// Number of stored sessions, expired-but-unswept included.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep expired sessions every `interval` until the task is stopped.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> PeriodicTask {
        PeriodicTask::spawn("session-sweeper", interval, move || {
            let removed = self.sweep();
            if removed > 0 {
                debug!(removed, remaining = self.len(), "swept expired sessions");
            }
        })
    }

    /// Total encoded bytes currently held.
    pub fn stored_bytes(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .map(|s| s.payload.bytes.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn payload(tag: &str) -> SessionPayload {
        SessionPayload {
            bytes: Bytes::from(tag.as_bytes().to_vec()),
            format: OutputFormat::Png,
            original_filename: format!("{tag}.png"),
            width: 10,
            height: 10,
        }
    }

    fn store() -> (SessionStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (SessionStore::new(DEFAULT_TTL, DEFAULT_CAPACITY, clock.clone()), clock)
    }

    #[test]
    fn ids_are_32_hex_chars_and_unique() {
        let (store, _) = store();
        let a = store.create(payload("a"));
        let b = store.create(payload("b"));
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn create_then_get_returns_identical_payload() {
        let (store, _) = store();
        let id = store.create(payload("first"));
        assert_eq!(store.get(&id).unwrap().payload, payload("first"));
    }

    #[test]
    fn update_replaces_payload_and_resets_ttl() {
        let (store, clock) = store();
        let id = store.create(payload("v1"));
        let created = store.get(&id).unwrap().created_at;

        clock.advance(Duration::from_secs(8 * 60));
        store.update(&id, payload("v2")).unwrap();

        let session = store.get(&id).unwrap();
        assert_eq!(session.payload, payload("v2"));
        assert!(session.created_at > created);

        // 8 + 8 minutes since create, but only 8 since the update.
        clock.advance(Duration::from_secs(8 * 60));
        assert!(store.get(&id).is_ok());
    }

    #[test]
    fn delete_then_get_is_not_found() {
        let (store, _) = store();
        let id = store.create(payload("x"));
        assert!(store.delete(&id));
        assert_eq!(store.get(&id).unwrap_err(), SessionError::NotFound(id.clone()));
        assert!(!store.delete(&id));
    }

    #[test]
    fn expiry_without_access_is_not_found_before_sweep() {
        let (store, clock) = store();
        let id = store.create(payload("x"));
        clock.advance(DEFAULT_TTL);
        assert!(matches!(store.get(&id), Err(SessionError::NotFound(_))));
    }

    #[test]
    fn update_of_expired_session_is_not_found() {
        let (store, clock) = store();
        let id = store.create(payload("x"));
        clock.advance(DEFAULT_TTL + Duration::from_secs(1));
        assert!(store.update(&id, payload("y")).is_err());
    }

    #[test]
    fn take_consumes_session() {
        let (store, _) = store();
        let id = store.create(payload("dl"));
        assert_eq!(store.take(&id).unwrap().payload, payload("dl"));
        assert!(store.take(&id).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn sweep_removes_only_expired() {
        let (store, clock) = store();
        let old = store.create(payload("old"));
        clock.advance(Duration::from_secs(6 * 60));
        let fresh = store.create(payload("fresh"));
        clock.advance(Duration::from_secs(5 * 60));

        assert_eq!(store.sweep(), 1);
        assert!(store.get(&old).is_err());
        assert!(store.get(&fresh).is_ok());
    }

    #[test]
    fn clear_removes_everything() {
        let (store, _) = store();
        for i in 0..5 {
            store.create(payload(&i.to_string()));
        }
        assert_eq!(store.clear(), 5);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let clock = Arc::new(ManualClock::new());
        let store = SessionStore::new(DEFAULT_TTL, 2, clock.clone());
        let first = store.create(payload("1"));
        clock.advance(Duration::from_secs(1));
        let second = store.create(payload("2"));
        clock.advance(Duration::from_secs(1));
        let third = store.create(payload("3"));

        assert_eq!(store.len(), 2);
        assert!(store.get(&first).is_err());
        assert!(store.get(&second).is_ok());
        assert!(store.get(&third).is_ok());
    }

    #[test]
    fn stored_bytes_sums_payloads() {
        let (store, _) = store();
        store.create(payload("abc"));
        store.create(payload("de"));
        assert_eq!(store.stored_bytes(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_removes_expired_sessions_on_schedule() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(SessionStore::new(DEFAULT_TTL, DEFAULT_CAPACITY, clock.clone()));
        store.create(payload("stale"));
        clock.advance(DEFAULT_TTL);

        let task = store.clone().spawn_sweeper(DEFAULT_SWEEP_INTERVAL);
        assert_eq!(store.len(), 1);
        tokio::time::sleep(DEFAULT_SWEEP_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(store.len(), 0);

        task.stop().await;
    }
}
