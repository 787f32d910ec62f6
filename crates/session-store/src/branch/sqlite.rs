use std::collections::HashSet;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::instrument;

use session_domain::{Result, StoreError};

use crate::types::{
    new_id, Branch, BranchComparison, BranchMerge, BranchNode, BranchStats, BranchStatus,
    Direction, MergeStrategy, Message, Metadata, Role,
};

use super::BranchStore;

const BRANCH_COLUMNS: &str = "id, session_id, parent_branch_id, name, description, branch_point, \
     status, is_primary, metadata, created_at, updated_at, merged_at";

fn row_to_branch(row: &rusqlite::Row<'_>) -> rusqlite::Result<Branch> {
    let status: String = row.get(6)?;
    let is_primary: i64 = row.get(7)?;
    let metadata_json: String = row.get(8)?;
    Ok(Branch {
        id: row.get(0)?,
        session_id: row.get(1)?,
        parent_branch_id: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        branch_point: row.get(5)?,
        status: BranchStatus::parse(&status).unwrap_or(BranchStatus::Active),
        is_primary: is_primary != 0,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        merged_at: row.get(11)?,
    })
}

const MESSAGE_COLUMNS: &str = "id, session_id, branch_id, sequence_num, channel, channel_id, \
     direction, role, content, attachments, tool_calls, tool_results, metadata, created_at";

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

/// SQLite-backed branch store, sharing the `messages` table with
/// [`crate::store::SqliteSessionStore`] via the `branch_id` column.
pub struct SqliteBranchStore {
    db: Mutex<Connection>,
}

impl SqliteBranchStore {
    pub fn new(conn: Connection) -> Self {
        Self { db: Mutex::new(conn) }
    }

    fn own_messages(conn: &Connection, branch_id: &str) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE branch_id = ?1 ORDER BY sequence_num ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![branch_id], row_to_message)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    fn get_branch(conn: &Connection, id: &str) -> Result<Branch> {
        let sql = format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE id = ?1");
        conn.query_row(&sql, params![id], row_to_branch)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("branch {id}")))
    }

    /// Path from `id` (index 0) up to the root, with cycle detection.
    fn ancestor_chain(conn: &Connection, id: &str) -> Result<Vec<Branch>> {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        let mut cur = Self::get_branch(conn, id)?;
        loop {
            if !visited.insert(cur.id.clone()) {
                break;
            }
            let parent_id = cur.parent_branch_id.clone();
            path.push(cur.clone());
            match parent_id {
                Some(pid) => cur = Self::get_branch(conn, &pid)?,
                None => break,
            }
        }
        Ok(path)
    }
}

impl BranchStore for SqliteBranchStore {
    #[instrument(skip(self, branch), fields(session_id = %branch.session_id))]
    fn create(&self, branch: Branch) -> Result<Branch> {
        let db = self.db.lock().unwrap();
        if let Some(parent_id) = &branch.parent_branch_id {
            Self::get_branch(&db, parent_id)?;
        }
        let metadata_json = serde_json::to_string(&branch.metadata)?;
        let result = db.execute(
            "INSERT INTO branches (id, session_id, parent_branch_id, name, description,
                    branch_point, status, is_primary, metadata, created_at, updated_at, merged_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                branch.id,
                branch.session_id,
                branch.parent_branch_id,
                branch.name,
                branch.description,
                branch.branch_point,
                branch.status.as_str(),
                branch.is_primary as i64,
                metadata_json,
                branch.created_at,
                branch.updated_at,
                branch.merged_at,
            ],
        );
        match result {
            Ok(_) => Ok(branch),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Conflict(format!(
                    "session {} already has a primary branch",
                    branch.session_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, id: &str) -> Result<Branch> {
        let db = self.db.lock().unwrap();
        Self::get_branch(&db, id)
    }

    fn fork(&self, parent_id: &str, branch_point: i64, name: &str) -> Result<Branch> {
        let parent = self.get(parent_id)?;
        let branch = Branch::fork(parent.session_id, parent.id, branch_point, name);
        self.create(branch)
    }

    #[instrument(skip(self, message), fields(branch_id))]
    fn append_message(&self, branch_id: &str, mut message: Message) -> Result<Message> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let (status, branch_point): (String, i64) = tx.query_row(
            "SELECT status, branch_point FROM branches WHERE id = ?1",
            params![branch_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        ).optional()?.ok_or_else(|| StoreError::NotFound(format!("branch {branch_id}")))?;
        if status != "active" {
            return Err(StoreError::Conflict(format!(
                "branch {branch_id} is {status} and rejects appends"
            )));
        }

        // Continue the parent's sequence scale from `branch_point` rather than
        // restarting at 1, so `merge`'s `sequence_num > branch_point` filter
        // (same absolute scale) keeps exactly the messages appended after the fork.
        let next_seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(sequence_num), ?2) + 1 FROM messages WHERE branch_id = ?1",
                params![branch_id, branch_point],
                |r| r.get(0),
            )
            .unwrap_or(branch_point + 1);

        message.id = new_id();
        message.branch_id = Some(branch_id.to_string());
        message.sequence_num = next_seq;
        message.created_at = chrono::Utc::now();

        let attachments_json = serde_json::to_string(&message.attachments)?;
        let tool_calls_json = serde_json::to_string(&message.tool_calls)?;
        let tool_results_json = serde_json::to_string(&message.tool_results)?;
        let metadata_json = serde_json::to_string(&message.metadata)?;

        tx.execute(
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
        tx.execute(
            "UPDATE branches SET updated_at = ?1 WHERE id = ?2",
            params![message.created_at, branch_id],
        )?;
        tx.commit()?;
        Ok(message)
    }

    fn get_branch_history(&self, id: &str, limit: i64) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        let path = Self::ancestor_chain(&db, id)?;
        let mut tagged: Vec<(usize, Message)> = Vec::new();
        for (depth, branch) in path.iter().enumerate() {
            if depth == 0 {
                for m in Self::own_messages(&db, &branch.id)? {
                    tagged.push((0, m));
                }
            } else {
                let child = &path[depth - 1];
                for m in Self::own_messages(&db, &branch.id)? {
                    if m.sequence_num <= child.branch_point {
                        tagged.push((depth, m));
                    }
                }
            }
        }
        tagged.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.sequence_num.cmp(&b.1.sequence_num)));
        let all: Vec<Message> = tagged.into_iter().map(|(_, m)| m).collect();
        if limit <= 0 {
            return Ok(all);
        }
        let limit = limit as usize;
        let start = all.len().saturating_sub(limit);
        Ok(all[start..].to_vec())
    }

    fn get_own_messages(&self, id: &str, limit: i64) -> Result<Vec<Message>> {
        let db = self.db.lock().unwrap();
        Self::get_branch(&db, id)?;
        let all = Self::own_messages(&db, id)?;
        if limit <= 0 {
            return Ok(all);
        }
        let limit = limit as usize;
        let start = all.len().saturating_sub(limit);
        Ok(all[start..].to_vec())
    }

    #[instrument(skip(self))]
    fn merge(&self, source_id: &str, target_id: &str, strategy: MergeStrategy) -> Result<BranchMerge> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let source = {
            let sql = format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE id = ?1");
            tx.query_row(&sql, params![source_id], row_to_branch)
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("branch {source_id}")))?
        };
        if source.is_primary {
            return Err(StoreError::Conflict("primary branch cannot be merged".into()));
        }
        if source.status != BranchStatus::Active {
            return Err(StoreError::Conflict(format!("source branch {source_id} is not active")));
        }
        {
            let sql = format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE id = ?1");
            tx.query_row(&sql, params![target_id], row_to_branch)
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("branch {target_id}")))?;
        }

        let target_max_seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(sequence_num), 0) FROM messages WHERE branch_id = ?1",
                params![target_id],
                |r| r.get(0),
            )
            .unwrap_or(0);

        let to_copy: Vec<Message> = {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE branch_id = ?1 AND sequence_num > ?2 ORDER BY sequence_num ASC"
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params![source_id, source.branch_point], row_to_message)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            out
        };

        let now = chrono::Utc::now();
        let source_seq_start = to_copy.first().map(|m| m.sequence_num);
        let source_seq_end = to_copy.last().map(|m| m.sequence_num);
        let message_count = to_copy.len() as i64;

        for (offset, m) in to_copy.into_iter().enumerate() {
            let new_seq = target_max_seq + offset as i64 + 1;
            let attachments_json = serde_json::to_string(&m.attachments)?;
            let tool_calls_json = serde_json::to_string(&m.tool_calls)?;
            let tool_results_json = serde_json::to_string(&m.tool_results)?;
            let metadata_json = serde_json::to_string(&m.metadata)?;
            tx.execute(
                "INSERT INTO messages (id, session_id, branch_id, sequence_num, channel, channel_id,
                        direction, role, content, attachments, tool_calls, tool_results, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    new_id(),
                    m.session_id,
                    target_id,
                    new_seq,
                    m.channel,
                    m.channel_id,
                    m.direction.as_str(),
                    m.role.as_str(),
                    m.content,
                    attachments_json,
                    tool_calls_json,
                    tool_results_json,
                    metadata_json,
                    m.created_at,
                ],
            )?;
        }

        tx.execute(
            "UPDATE branches SET status = 'merged', merged_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, source_id],
        )?;
        tx.execute(
            "UPDATE branches SET updated_at = ?1 WHERE id = ?2",
            params![now, target_id],
        )?;

        let record = BranchMerge {
            id: new_id(),
            source_branch_id: source_id.to_string(),
            target_branch_id: target_id.to_string(),
            strategy,
            source_sequence_start: source_seq_start.unwrap_or(0),
            source_sequence_end: source_seq_end,
            target_sequence_insert: target_max_seq + 1,
            message_count,
            metadata: Metadata::new(),
            merged_at: now,
            merged_by: None,
        };
        let metadata_json = serde_json::to_string(&record.metadata)?;
        tx.execute(
            "INSERT INTO branch_merges (id, source_branch_id, target_branch_id, strategy,
                    source_sequence_start, source_sequence_end, target_sequence_insert,
                    message_count, metadata, merged_at, merged_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.id,
                record.source_branch_id,
                record.target_branch_id,
                record.strategy.as_str(),
                record.source_sequence_start,
                record.source_sequence_end,
                record.target_sequence_insert,
                record.message_count,
                metadata_json,
                record.merged_at,
                record.merged_by,
            ],
        )?;

        tx.commit()?;
        Ok(record)
    }

    fn archive(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let branch = Self::get_branch(&db, id)?;
        if branch.is_primary {
            return Err(StoreError::Conflict("primary branch cannot be archived".into()));
        }
        db.execute(
            "UPDATE branches SET status = 'archived', updated_at = ?1 WHERE id = ?2",
            params![chrono::Utc::now(), id],
        )?;
        Ok(())
    }

    fn delete(&self, id: &str, delete_messages: bool) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let branch = Self::get_branch(&db, id)?;
        if branch.is_primary {
            return Err(StoreError::Conflict("primary branch cannot be deleted".into()));
        }
        let tx = db.transaction()?;
        if delete_messages {
            tx.execute("DELETE FROM messages WHERE branch_id = ?1", params![id])?;
        }
        tx.execute("DELETE FROM branches WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    fn get_branch_tree(&self, session_id: &str) -> Result<Vec<BranchNode>> {
        let db = self.db.lock().unwrap();
        let root = {
            let sql = format!(
                "SELECT {BRANCH_COLUMNS} FROM branches
                 WHERE session_id = ?1 AND parent_branch_id IS NULL"
            );
            db.query_row(&sql, params![session_id], row_to_branch)
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("root branch for session {session_id}")))?
        };

        let mut out = Vec::new();
        let mut stack = vec![(root, 0usize)];
        while let Some((branch, depth)) = stack.pop() {
            let children: Vec<Branch> = {
                let sql = format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE parent_branch_id = ?1");
                let mut stmt = db.prepare(&sql)?;
                let rows = stmt.query_map(params![branch.id], row_to_branch)?;
                let mut v = Vec::new();
                for r in rows {
                    v.push(r?);
                }
                v
            };
            out.push(BranchNode { branch, depth });
            for child in children {
                stack.push((child, depth + 1));
            }
        }
        out.sort_by_key(|n| n.depth);
        Ok(out)
    }

    fn get_full_branch_path(&self, id: &str) -> Result<Vec<Branch>> {
        let db = self.db.lock().unwrap();
        let mut path = Self::ancestor_chain(&db, id)?;
        path.reverse();
        Ok(path)
    }

    fn compare(&self, source_id: &str, target_id: &str) -> Result<BranchComparison> {
        let db = self.db.lock().unwrap();
        let source_ahead = Self::own_messages(&db, source_id)?.len() as i64;
        let target_ahead = Self::own_messages(&db, target_id)?.len() as i64;

        let source_path = Self::ancestor_chain(&db, source_id)?;
        let target_path = Self::ancestor_chain(&db, target_id)?;
        let source_ids: HashSet<&str> = source_path.iter().map(|b| b.id.as_str()).collect();
        let common_ancestor = target_path
            .iter()
            .find(|b| source_ids.contains(b.id.as_str()))
            .map(|b| b.id.clone());

        Ok(BranchComparison { source_ahead, target_ahead, common_ancestor })
    }

    fn stats(&self, id: &str) -> Result<BranchStats> {
        let own = self.get_own_messages(id, 0)?;
        let own_count = own.len() as i64;
        let last_message_at = own.last().map(|m| m.created_at);
        let db = self.db.lock().unwrap();
        let child_branch_count: i64 = db.query_row(
            "SELECT COUNT(*) FROM branches WHERE parent_branch_id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        drop(db);
        let total_with_inherited = self.get_branch_history(id, 0)?.len() as i64;
        Ok(BranchStats { own_count, child_branch_count, total_with_inherited, last_message_at })
    }

    fn ensure_primary_branch(&self, session_id: &str) -> Result<Branch> {
        {
            let db = self.db.lock().unwrap();
            let sql = format!(
                "SELECT {BRANCH_COLUMNS} FROM branches WHERE session_id = ?1 AND is_primary = 1"
            );
            if let Some(existing) = db.query_row(&sql, params![session_id], row_to_branch).optional()? {
                return Ok(existing);
            }
        }
        self.create(Branch::new_primary(session_id))
    }

    fn migrate_session_to_branches(&self, session_id: &str, mut orphan_messages: Vec<Message>) -> Result<Branch> {
        let primary = self.ensure_primary_branch(session_id)?;
        orphan_messages.sort_by_key(|m| m.created_at);

        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let mut next_seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(sequence_num), ?2) + 1 FROM messages WHERE branch_id = ?1",
                params![primary.id, primary.branch_point],
                |r| r.get(0),
            )
            .unwrap_or(primary.branch_point + 1);

        for m in orphan_messages {
            let attachments_json = serde_json::to_string(&m.attachments)?;
            let tool_calls_json = serde_json::to_string(&m.tool_calls)?;
            let tool_results_json = serde_json::to_string(&m.tool_results)?;
            let metadata_json = serde_json::to_string(&m.metadata)?;
            tx.execute(
                "UPDATE messages SET branch_id = ?1, sequence_num = ?2, attachments = ?3,
                        tool_calls = ?4, tool_results = ?5, metadata = ?6
                 WHERE id = ?7",
                params![
                    primary.id,
                    next_seq,
                    attachments_json,
                    tool_calls_json,
                    tool_results_json,
                    metadata_json,
                    m.id,
                ],
            )?;
            next_seq += 1;
        }
        tx.commit()?;
        Ok(primary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::store::{SessionStore, SqliteSessionStore};
    use crate::types::{Direction, Role, Session};

    #[test]
    fn fork_then_merge_round_trip() {
        let conn = db::open_in_memory().unwrap();
        let session_store = SqliteSessionStore::new(conn);
        let session = Session::new("agent1", "slack", "chan1", "k1");
        let session = session_store.create(session).unwrap();

        let conn2 = db::open_in_memory().unwrap();
        let branch_store = SqliteBranchStore::new(conn2);
        let primary = branch_store.create(Branch::new_primary(&session.id)).unwrap();

        for i in 0..2 {
            let mut m = Message::new(&session.id, "slack", "chan1", Direction::Inbound, Role::User, format!("r{i}"));
            m.branch_id = Some(primary.id.clone());
            branch_store.append_message(&primary.id, m).unwrap();
        }
        let feature = branch_store.fork(&primary.id, 2, "feature").unwrap();
        for i in 0..2 {
            let mut m = Message::new(&session.id, "slack", "chan1", Direction::Inbound, Role::User, format!("f{i}"));
            m.branch_id = Some(feature.id.clone());
            branch_store.append_message(&feature.id, m).unwrap();
        }

        let record = branch_store.merge(&feature.id, &primary.id, MergeStrategy::Continue).unwrap();
        assert_eq!(record.message_count, 2);

        let merged = branch_store.get(&feature.id).unwrap();
        assert_eq!(merged.status, BranchStatus::Merged);

        let target_own = branch_store.get_own_messages(&primary.id, 0).unwrap();
        assert_eq!(target_own.len(), 4);
    }

    #[test]
    fn primary_branch_cannot_be_archived() {
        let conn = db::open_in_memory().unwrap();
        let branch_store = SqliteBranchStore::new(conn);
        let primary = branch_store.create(Branch::new_primary("s1")).unwrap();
        assert!(branch_store.archive(&primary.id).is_err());
    }
}
