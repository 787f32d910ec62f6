use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, instrument};

use session_domain::{Result, StoreError};

use crate::types::{new_id, ListOptions, Message, Session};

use super::SessionStore;

/// In-memory-only backend. Reads return deep copies so callers cannot
/// mutate stored state (spec §4.5 "Cloning"); message lists are trimmed
/// from the front to a hard cap after every append (spec §4.5 "Bounded
/// memory").
pub struct MemorySessionStore {
    sessions: DashMap<String, Session>,
    key_index: DashMap<String, String>,
    messages: DashMap<String, Vec<Message>>,
}

const MAX_MESSAGES_PER_SESSION: usize = 1000;

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            key_index: DashMap::new(),
            messages: DashMap::new(),
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for MemorySessionStore {
    #[instrument(skip(self, session), fields(key = %session.key))]
    fn create(&self, session: Session) -> Result<Session> {
        // `entry` holds the key_index shard lock across the check-and-insert so two
        // concurrent creates for the same key can't both observe "vacant" (I1).
        match self.key_index.entry(session.key.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "session with key {} already exists",
                session.key
            ))),
            Entry::Vacant(v) => {
                v.insert(session.id.clone());
                self.sessions.insert(session.id.clone(), session.clone());
                Ok(session.deep_clone())
            }
        }
    }

    fn get(&self, id: &str) -> Result<Session> {
        self.sessions
            .get(id)
            .map(|s| s.deep_clone())
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    fn get_by_key(&self, key: &str) -> Result<Session> {
        let id = self
            .key_index
            .get(key)
            .map(|v| v.clone())
            .ok_or_else(|| StoreError::NotFound(format!("session with key {key}")))?;
        self.get(&id)
    }

    fn update(&self, mut session: Session) -> Result<Session> {
        if !self.sessions.contains_key(&session.id) {
            return Err(StoreError::NotFound(format!("session {}", session.id)));
        }
        session.updated_at = chrono::Utc::now();
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(session.deep_clone())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let (_, session) = self
            .sessions
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
        self.key_index.remove(&session.key);
        self.messages.remove(id);
        Ok(())
    }

    #[instrument(skip(self), fields(key))]
    fn get_or_create(
        &self,
        key: &str,
        agent_id: &str,
        channel: &str,
        channel_id: &str,
    ) -> Result<Session> {
        // `entry` holds the key_index shard lock across the check-and-insert, so
        // two concurrent callers racing on the same key can't both create a
        // session (spec §4.5 "Atomicity", Scenario 6).
        let session_id = match self.key_index.entry(key.to_string()) {
            Entry::Occupied(e) => {
                debug!("session cache hit");
                e.get().clone()
            }
            Entry::Vacant(v) => {
                let session = Session::new(agent_id, channel, channel_id, key);
                let id = session.id.clone();
                v.insert(id.clone());
                self.sessions.insert(id.clone(), session);
                id
            }
        };
        self.get(&session_id)
    }

    fn list(&self, agent_id: Option<&str>, opts: ListOptions) -> Result<Vec<Session>> {
        let mut all: Vec<Session> = self
            .sessions
            .iter()
            .filter(|e| agent_id.map(|a| a == e.agent_id).unwrap_or(true))
            .filter(|e| opts.channel.as_deref().map(|c| c == e.channel).unwrap_or(true))
            .map(|e| e.deep_clone())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let start = opts.offset.min(all.len());
        let end = if opts.limit == 0 {
            all.len()
        } else {
            (start + opts.limit).min(all.len())
        };
        Ok(all[start..end].to_vec())
    }

    #[instrument(skip(self, message), fields(session_id))]
    fn append_message(&self, session_id: &str, mut message: Message) -> Result<Message> {
        if !self.sessions.contains_key(session_id) {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        message.id = new_id();
        message.session_id = session_id.to_string();
        message.created_at = chrono::Utc::now();

        let mut entry = self.messages.entry(session_id.to_string()).or_default();
        let next_seq = entry.last().map(|m| m.sequence_num + 1).unwrap_or(1);
        message.sequence_num = next_seq;
        entry.push(message.clone());
        if entry.len() > MAX_MESSAGES_PER_SESSION {
            let overflow = entry.len() - MAX_MESSAGES_PER_SESSION;
            entry.drain(0..overflow);
        }
        drop(entry);

        if let Some(mut s) = self.sessions.get_mut(session_id) {
            s.updated_at = chrono::Utc::now();
        }

        Ok(message.deep_clone())
    }

    fn get_history(&self, session_id: &str, limit: i64) -> Result<Vec<Message>> {
        let all = self
            .messages
            .get(session_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        if limit <= 0 {
            return Ok(all);
        }
        let limit = limit as usize;
        let start = all.len().saturating_sub(limit);
        Ok(all[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::types::{Direction, Role};

    #[test]
    fn scenario_6_atomic_get_or_create() {
        let store = MemorySessionStore::new();
        let a = store.get_or_create("k", "agent1", "slack", "U1").unwrap();
        let b = store.get_or_create("k", "agent1", "slack", "U1").unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.sessions.len(), 1);
    }

    #[test]
    fn concurrent_get_or_create_never_duplicates_a_key() {
        let store = Arc::new(MemorySessionStore::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.get_or_create("k", "agent1", "slack", "U1").unwrap())
            })
            .collect();
        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap().id).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.sessions.len(), 1);
    }

    #[test]
    fn append_message_bumps_updated_at_and_sequence() {
        let store = MemorySessionStore::new();
        let s = store.get_or_create("k", "a", "c", "cid").unwrap();
        let m1 = Message::new(&s.id, "c", "cid", Direction::Inbound, Role::User, "hi");
        let appended = store.append_message(&s.id, m1).unwrap();
        assert_eq!(appended.sequence_num, 1);
        let m2 = Message::new(&s.id, "c", "cid", Direction::Inbound, Role::User, "again");
        let appended2 = store.append_message(&s.id, m2).unwrap();
        assert_eq!(appended2.sequence_num, 2);
    }

    #[test]
    fn get_history_limit_zero_returns_all() {
        let store = MemorySessionStore::new();
        let s = store.get_or_create("k", "a", "c", "cid").unwrap();
        for i in 0..5 {
            let m = Message::new(&s.id, "c", "cid", Direction::Inbound, Role::User, format!("m{i}"));
            store.append_message(&s.id, m).unwrap();
        }
        assert_eq!(store.get_history(&s.id, 0).unwrap().len(), 5);
        assert_eq!(store.get_history(&s.id, 2).unwrap().len(), 2);
    }

    #[test]
    fn messages_capped_at_hard_limit() {
        let store = MemorySessionStore::new();
        let s = store.get_or_create("k", "a", "c", "cid").unwrap();
        for i in 0..(MAX_MESSAGES_PER_SESSION + 10) {
            let m = Message::new(&s.id, "c", "cid", Direction::Inbound, Role::User, format!("m{i}"));
            store.append_message(&s.id, m).unwrap();
        }
        assert_eq!(store.get_history(&s.id, 0).unwrap().len(), MAX_MESSAGES_PER_SESSION);
    }

    #[test]
    fn delete_removes_session_and_messages() {
        let store = MemorySessionStore::new();
        let s = store.get_or_create("k", "a", "c", "cid").unwrap();
        store.delete(&s.id).unwrap();
        assert!(store.get(&s.id).is_err());
        assert!(store.get_history(&s.id, 0).unwrap().is_empty());
    }
}
