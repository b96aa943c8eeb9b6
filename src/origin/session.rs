//! In-memory session records opened by non-short-circuit routes.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::cache::now_ms;

/// What a session was opened with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub path: String,
    pub query: String,
    pub opened_at_ms: i64,
}

#[derive(Debug)]
struct Slot {
    record: SessionRecord,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct SessionStore {
    ttl: Duration,
    sessions: DashMap<Uuid, Slot>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: DashMap::new(),
        }
    }

    pub fn open(&self, path: &str, query: &str) -> SessionRecord {
        let record = SessionRecord {
            id: Uuid::new_v4(),
            path: path.to_string(),
            query: query.to_string(),
            opened_at_ms: now_ms(),
        };
        self.sessions.insert(
            record.id,
            Slot {
                record: record.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        record
    }

    pub fn get(&self, id: &Uuid) -> Option<SessionRecord> {
        let now = Instant::now();
        let record = self
            .sessions
            .get(id)
            .filter(|slot| slot.expires_at > now)
            .map(|slot| slot.record.clone());
        if record.is_none() {
            self.sessions.remove_if(id, |_, slot| slot.expires_at <= now);
        }
        record
    }

    pub fn remove(&self, id: &Uuid) {
        self.sessions.remove(id);
    }

    /// Drop expired sessions and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, slot| slot.expires_at > now);
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_then_get() {
        let store = SessionStore::new(Duration::from_secs(60));
        let record = store.open("/api/agent/session", "artistName=Goya");
        assert_eq!(store.get(&record.id), Some(record.clone()));
        store.remove(&record.id);
        assert!(store.get(&record.id).is_none());
    }

    #[test]
    fn expired_sessions_are_purged() {
        let store = SessionStore::new(Duration::ZERO);
        let record = store.open("/api/agent/session", "");
        assert!(store.get(&record.id).is_none());

        store.open("/api/agent/session", "");
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
    }
}
