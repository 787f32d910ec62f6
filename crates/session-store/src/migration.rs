//! Migration Runner (C8): applies ordered, embedded SQL migrations
//! (spec §4.8). Each migration is a `<id>.up.sql` / `<id>.down.sql` pair
//! baked into the binary with `include_str!`, applied lexicographically.

use chrono::Utc;
use rusqlite::Connection;
use tracing::{info, instrument};

use crate::types::SchemaMigration;
use session_domain::{Result, StoreError};

struct MigrationFile {
    id: &'static str,
    up: &'static str,
    down: &'static str,
}

/// The embedded migration set, in lexicographic id order. Single source of
/// truth for schema changes; new migrations are appended here, never edited
/// in place once released.
const MIGRATIONS: &[MigrationFile] = &[MigrationFile {
    id: "0001_init",
    up: include_str!("../migrations/0001_init.up.sql"),
    down: include_str!("../migrations/0001_init.down.sql"),
}];

pub struct Migrator<'a> {
    conn: &'a Connection,
}

/// Status snapshot returned by `Migrator::status`.
#[derive(Debug, Clone, Default)]
pub struct MigrationStatus {
    pub applied: Vec<SchemaMigration>,
    pub pending: Vec<String>,
}

impl<'a> Migrator<'a> {
    pub fn new(conn: &'a Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                id TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }

    fn applied_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM schema_migrations ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for r in rows {
            ids.push(r?);
        }
        Ok(ids)
    }

    /// Apply the first `steps` unapplied migrations, each in its own
    /// transaction. `steps == 0` applies all pending migrations.
    #[instrument(skip(self))]
    pub fn up(&self, steps: usize) -> Result<Vec<String>> {
        let applied = self.applied_ids()?;
        let pending: Vec<&MigrationFile> = MIGRATIONS
            .iter()
            .filter(|m| !applied.iter().any(|a| a == m.id))
            .collect();

        let take = if steps == 0 { pending.len() } else { steps.min(pending.len()) };
        let mut ran = Vec::new();
        for m in &pending[..take] {
            let tx = self.conn.unchecked_transaction()?;
            tx.execute_batch(m.up)?;
            tx.execute(
                "INSERT INTO schema_migrations (id, applied_at) VALUES (?1, ?2)",
                rusqlite::params![m.id, Utc::now().to_rfc3339()],
            )?;
            tx.commit()?;
            info!(migration = m.id, "applied migration");
            ran.push(m.id.to_string());
        }
        Ok(ran)
    }

    /// Roll back the last `steps` applied migrations, in reverse order.
    #[instrument(skip(self))]
    pub fn down(&self, steps: usize) -> Result<Vec<String>> {
        let applied = self.applied_ids()?;
        let take = if steps == 0 { applied.len() } else { steps.min(applied.len()) };
        let to_revert: Vec<&String> = applied.iter().rev().take(take).collect();

        let mut reverted = Vec::new();
        for id in to_revert {
            let m = MIGRATIONS
                .iter()
                .find(|m| m.id == id.as_str())
                .ok_or_else(|| StoreError::Internal(format!("unknown migration: {id}")))?;
            let tx = self.conn.unchecked_transaction()?;
            tx.execute_batch(m.down)?;
            tx.execute("DELETE FROM schema_migrations WHERE id = ?1", rusqlite::params![id])?;
            tx.commit()?;
            info!(migration = m.id, "reverted migration");
            reverted.push(id.to_string());
        }
        Ok(reverted)
    }

    /// Applied + pending lists (spec §4.8 "Status").
    pub fn status(&self) -> Result<MigrationStatus> {
        let applied_ids = self.applied_ids()?;
        let mut stmt = self
            .conn
            .prepare("SELECT id, applied_at FROM schema_migrations ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let applied_at: String = row.get(1)?;
            Ok((id, applied_at))
        })?;
        let mut applied = Vec::new();
        for r in rows {
            let (id, applied_at) = r?;
            let applied_at = chrono::DateTime::parse_from_rfc3339(&applied_at)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| StoreError::Parse(e.to_string()))?;
            applied.push(SchemaMigration { id, applied_at });
        }
        let pending = MIGRATIONS
            .iter()
            .filter(|m| !applied_ids.iter().any(|a| a == m.id))
            .map(|m| m.id.to_string())
            .collect();
        Ok(MigrationStatus { applied, pending })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn up_then_status_then_down() {
        let conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new(&conn).unwrap();

        let applied = migrator.up(0).unwrap();
        assert_eq!(applied, vec!["0001_init".to_string()]);

        let status = migrator.status().unwrap();
        assert_eq!(status.applied.len(), 1);
        assert!(status.pending.is_empty());

        // Re-running Up after reaching the latest schema is a no-op.
        let noop = migrator.up(0).unwrap();
        assert!(noop.is_empty());

        let reverted = migrator.down(1).unwrap();
        assert_eq!(reverted, vec!["0001_init".to_string()]);
        let status2 = migrator.status().unwrap();
        assert!(status2.applied.is_empty());
        assert_eq!(status2.pending.len(), 1);
    }
}
