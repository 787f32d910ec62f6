//! Session Store (C5): CRUD over sessions and their message logs, with a
//! unique lookup key and an atomic get-or-create (spec §4.5).

pub mod memory;
pub mod sqlite;

use session_domain::Result;

use crate::types::{ListOptions, Message, Session};

/// Backend-agnostic interface over sessions and their messages. Implemented
/// by an in-memory map (tests, single-process ephemeral use) and a SQLite
/// backend (spec §9 "Interfaces over inheritance").
pub trait SessionStore: Send + Sync {
    fn create(&self, session: Session) -> Result<Session>;
    fn get(&self, id: &str) -> Result<Session>;
    fn get_by_key(&self, key: &str) -> Result<Session>;
    fn update(&self, session: Session) -> Result<Session>;
    fn delete(&self, id: &str) -> Result<()>;

    /// Atomic get-or-create keyed on `key` (spec §4.5 "Atomicity").
    fn get_or_create(
        &self,
        key: &str,
        agent_id: &str,
        channel: &str,
        channel_id: &str,
    ) -> Result<Session>;

    fn list(&self, agent_id: Option<&str>, opts: ListOptions) -> Result<Vec<Session>>;

    /// Appends a message, bumping the session's `updated_at` atomically
    /// (spec §4.5 "Atomicity").
    fn append_message(&self, session_id: &str, message: Message) -> Result<Message>;

    /// `limit <= 0` uses the backend's default (100 for SQL, all for
    /// in-memory — spec §8 "Boundary behaviors").
    fn get_history(&self, session_id: &str, limit: i64) -> Result<Vec<Message>>;
}

pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;
