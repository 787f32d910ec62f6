use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::instrument;

use session_domain::{Result, StoreError};

use crate::types::{new_id, Direction, ListOptions, Message, Metadata, Role, Session};

use super::SessionStore;

const DEFAULT_HISTORY_LIMIT: i64 = 100;

/// SQLite-backed session store. Wraps a single connection in a `Mutex` —
/// sufficient for the single-node target this crate ships for; a pooled
/// connection manager is the natural next step for multi-node deployments.
pub struct SqliteSessionStore {
    db: Mutex<Connection>,
}

impl SqliteSessionStore {
    pub fn new(conn: Connection) -> Self {
        Self { db: Mutex::new(conn) }
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let metadata_json: String = row.get(5)?;
    let metadata: Metadata = serde_json::from_str(&metadata_json).unwrap_or_default();
    Ok(Session {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        channel: row.get(2)?,
        channel_id: row.get(3)?,
        key: row.get(4)?,
        metadata,
        title: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

const SESSION_COLUMNS: &str =
    "id, agent_id, channel, channel_id, key, metadata, title, created_at, updated_at";

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let direction: String = row.get(6)?;
    let role: String = row.get(7)?;
    let attachments_json: String = row.get(9)?;
    let tool_calls_json: String = row.get(10)?;
    let tool_results_json: String = row.get(11)?;
    let metadata_json: String = row.get(12)?;
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        branch_id: row.get(2)?,
        sequence_num: row.get(3)?,
        channel: row.get(4)?,
        channel_id: row.get(5)?,
        direction: Direction::parse(&direction).unwrap_or(Direction::Inbound),
        role: Role::parse(&role).unwrap_or(Role::User),
        content: row.get(8)?,
        attachments: serde_json::from_str(&attachments_json).unwrap_or_default(),
        tool_calls: serde_json::from_str(&tool_calls_json).unwrap_or_default(),
        tool_results: serde_json::from_str(&tool_results_json).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        created_at: row.get(13)?,
    })
}

const MESSAGE_COLUMNS: &str = "id, session_id, branch_id, sequence_num, channel, channel_id, \
     direction, role, content, attachments, tool_calls, tool_results, metadata, created_at";

impl SessionStore for SqliteSessionStore {
    #[instrument(skip(self, session), fields(key = %session.key))]
    fn create(&self, session: Session) -> Result<Session> {
        let db = self.db.lock().unwrap();
        let metadata_json = serde_json::to_string(&session.metadata)?;
        let result = db.execute(
            "INSERT INTO sessions (id, agent_id, channel, channel_id, key, metadata, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session.id,
                session.agent_id,
                session.channel,
                session.channel_id,
                session.key,
                metadata_json,
                session.title,
                session.created_at,
                session.updated_at,
            ],
        );
        match result {
            Ok(_) => Ok(session),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Conflict(format!(
                    "session with key {} already exists",
                    session.key
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, id: &str) -> Result<Session> {
        let db = self.db.lock().unwrap();
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
        db.query_row(&sql, params![id], row_to_session)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    fn get_by_key(&self, key: &str) -> Result<Session> {
        let db = self.db.lock().unwrap();
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE key = ?1");
        db.query_row(&sql, params![key], row_to_session)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("session with key {key}")))
    }

    fn update(&self, mut session: Session) -> Result<Session> {
        session.updated_at = chrono::Utc::now();
        let metadata_json = serde_json::to_string(&session.metadata)?;
        let db = self.db.lock().unwrap();
        let rows = db.execute(
            "UPDATE sessions SET agent_id = ?1, channel = ?2, channel_id = ?3, key = ?4,
                    metadata = ?5, title = ?6, updated_at = ?7
             WHERE id = ?8",
            params![
                session.agent_id,
                session.channel,
                session.channel_id,
                session.key,
                metadata_json,
                session.title,
                session.updated_at,
                session.id,
            ],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("session {}", session.id)));
        }
        Ok(session)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute("DELETE FROM messages WHERE session_id = ?1", params![id])?;
        let rows = tx.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        tx.commit()?;
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
        let id = new_id();
        let now = chrono::Utc::now();
        let db = self.db.lock().unwrap();
        let sql = format!(
            "INSERT INTO sessions (id, agent_id, channel, channel_id, key, metadata, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, '{{}}', NULL, ?6, ?6)
             ON CONFLICT(key) DO UPDATE SET key = sessions.key
             RETURNING {SESSION_COLUMNS}"
        );
        db.query_row(
            &sql,
            params![id, agent_id, channel, channel_id, key, now],
            row_to_session,
        )
        .map_err(Into::into)
    }

    fn list(&self, agent_id: Option<&str>, opts: ListOptions) -> Result<Vec<Session>> {
        let db = self.db.lock().unwrap();
        let limit: i64 = if opts.limit == 0 { i64::MAX } else { opts.limit as i64 };
        let mut sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE 1=1");
        if agent_id.is_some() {
            sql.push_str(" AND agent_id = ?1");
        }
        if opts.channel.is_some() {
            sql.push_str(if agent_id.is_some() { " AND channel = ?2" } else { " AND channel = ?1" });
        }
        sql.push_str(" ORDER BY created_at ASC LIMIT ? OFFSET ?");

        let mut stmt = db.prepare(&sql)?;
        let mut dyn_params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(a) = agent_id {
            dyn_params.push(Box::new(a.to_string()));
        }
        if let Some(c) = &opts.channel {
            dyn_params.push(Box::new(c.clone()));
        }
        dyn_params.push(Box::new(limit));
        dyn_params.push(Box::new(opts.offset as i64));

        let param_refs: Vec<&dyn rusqlite::ToSql> = dyn_params.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(param_refs.as_slice(), row_to_session)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    #[instrument(skip(self, message), fields(session_id))]
    fn append_message(&self, session_id: &str, mut message: Message) -> Result<Message> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let next_seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(sequence_num), 0) + 1 FROM messages WHERE session_id = ?1",
                params![session_id],
                |r| r.get(0),
            )
            .unwrap_or(1);

        message.id = new_id();
        message.session_id = session_id.to_string();
        message.sequence_num = next_seq;
        message.created_at = chrono::Utc::now();

        let attachments_json = serde_json::to_string(&message.attachments)?;
        let tool_calls_json = serde_json::to_string(&message.tool_calls)?;
        let tool_results_json = serde_json::to_string(&message.tool_results)?;
        let metadata_json = serde_json::to_string(&message.metadata)?;

        let inserted = tx.execute(
            "INSERT INTO messages (id, session_id, branch_id, sequence_num, channel, channel_id,
                    direction, role, content, attachments, tool_calls, tool_results, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                message.id,
                message.session_id,
                message.branch_id,
                message.sequence_num,
                message.channel,
                message.channel_id,
                message.direction.as_str(),
                message.role.as_str(),
                message.content,
                attachments_json,
                tool_calls_json,
                tool_results_json,
                metadata_json,
                message.created_at,
            ],
        )?;
        let _ = inserted;

        let touched = tx.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![message.created_at, session_id],
        )?;
        if touched == 0 {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }

        tx.commit()?;
        Ok(message)
    }

    fn get_history(&self, session_id: &str, limit: i64) -> Result<Vec<Message>> {
        let limit = if limit <= 0 { DEFAULT_HISTORY_LIMIT } else { limit };
        let db = self.db.lock().unwrap();
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE session_id = ?1 ORDER BY sequence_num ASC LIMIT ?2"
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![session_id, limit], row_to_message)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::types::{Direction, Role};

    fn store() -> SqliteSessionStore {
        SqliteSessionStore::new(db::open_in_memory().unwrap())
    }

    #[test]
    fn scenario_6_atomic_get_or_create() {
        let store = store();
        let a = store.get_or_create("k", "agent1", "slack", "U1").unwrap();
        let b = store.get_or_create("k", "agent1", "slack", "U1").unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn create_duplicate_key_is_conflict() {
        let store = store();
        let s = Session::new("a", "c", "cid", "dup-key");
        store.create(s.clone()).unwrap();
        let s2 = Session::new("a", "c", "cid", "dup-key");
        let err = store.create(s2).unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[test]
    fn append_message_bumps_session_updated_at() {
        let store = store();
        let s = store.get_or_create("k", "a", "c", "cid").unwrap();
        let before = s.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        let m = Message::new(&s.id, "c", "cid", Direction::Inbound, Role::User, "hi");
        store.append_message(&s.id, m).unwrap();
        let after = store.get(&s.id).unwrap();
        assert!(after.updated_at > before);
    }

    #[test]
    fn get_history_default_limit_is_100() {
        let store = store();
        let s = store.get_or_create("k", "a", "c", "cid").unwrap();
        for i in 0..150 {
            let m = Message::new(&s.id, "c", "cid", Direction::Inbound, Role::User, format!("m{i}"));
            store.append_message(&s.id, m).unwrap();
        }
        assert_eq!(store.get_history(&s.id, 0).unwrap().len(), 100);
    }

    #[test]
    fn delete_not_found() {
        let store = store();
        assert!(store.delete("missing").is_err());
    }
}
