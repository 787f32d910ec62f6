use rusqlite::Connection;

use crate::migration::Migrator;
use session_domain::Result;

/// Open a SQLite connection and bring the schema up to date.
///
/// `path` may be a filesystem path or `:memory:` for an ephemeral store.
/// Safe to call on every startup.
pub fn open(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
    Migrator::new(&conn)?.up(0)?;
    Ok(conn)
}

/// Open an in-memory connection, already migrated. Used by tests across
/// every subsystem in this crate.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    Migrator::new(&conn)?.up(0)?;
    Ok(conn)
}
