//! JSONL import/export (spec §6 "JSONL import/export"): the migration
//! format used to move sessions and messages between stores.

use std::collections::HashMap;
use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use session_domain::{new_id, Result};

use crate::store::SessionStore;
use crate::types::{ListOptions, Message, Session};

/// One JSONL line: either a session or a message record, tagged by `type`
/// (spec §6 "Each line is one record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonlRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub session: Option<Session>,
    pub message: Option<Message>,
    pub source_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Writes every session and its messages as JSONL, one record per line.
#[instrument(skip(store, out))]
pub fn export_to_jsonl<S: SessionStore, W: Write>(store: &S, out: &mut W) -> Result<usize> {
    let mut count = 0;
    for session in store.list(None, ListOptions::default())? {
        let record = JsonlRecord {
            kind: "session".to_string(),
            source_id: session.id.clone(),
            timestamp: session.created_at,
            session: Some(session.clone()),
            message: None,
        };
        writeln!(out, "{}", serde_json::to_string(&record)?)?;
        count += 1;

        for message in store.get_history(&session.id, 0)? {
            let record = JsonlRecord {
                kind: "message".to_string(),
                source_id: message.id.clone(),
                timestamp: message.created_at,
                session: None,
                message: Some(message),
            };
            writeln!(out, "{}", serde_json::to_string(&record)?)?;
            count += 1;
        }
    }
    info!(records = count, "exported session store to JSONL");
    Ok(count)
}

/// Import options (spec §6 "Import options").
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Parse and count only; no writes.
    pub dry_run: bool,
    /// A session whose `key` already exists is skipped and its source id
    /// is mapped to the existing session's id.
    pub skip_duplicates: bool,
    /// Keep source ids verbatim instead of generating new ones.
    pub preserve_ids: bool,
    /// Used for session records with no `agent_id` set.
    pub default_agent_id: String,
    /// `old_channel_id -> new_channel_id` remap applied to every record.
    pub remap_channel_ids: HashMap<String, String>,
}

/// Result of [`import_from_reader`] (spec §6 "ImportResult").
#[derive(Debug, Clone, Default)]
pub struct ImportResult {
    pub sessions_imported: usize,
    pub sessions_skipped: usize,
    pub messages_imported: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub source_id_map: HashMap<String, String>,
}

/// Two-pass import: sessions first (populating the id map), then messages
/// (spec §6 "Import proceeds in two passes").
#[instrument(skip(store, reader, opts))]
pub fn import_from_reader<S: SessionStore, R: BufRead>(
    store: &S,
    reader: R,
    opts: &ImportOptions,
) -> Result<ImportResult> {
    let mut result = ImportResult::default();
    let mut session_lines = Vec::new();
    let mut message_lines = Vec::new();

    for (lineno, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                result.errors.push(format!("line {}: {}", lineno + 1, e));
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JsonlRecord>(&line) {
            Ok(record) if record.kind == "session" => session_lines.push(record),
            Ok(record) if record.kind == "message" => message_lines.push(record),
            Ok(record) => {
                result.warnings.push(format!("line {}: unknown record type '{}'", lineno + 1, record.kind));
            }
            Err(e) => {
                result.errors.push(format!("line {}: {}", lineno + 1, e));
            }
        }
    }

    for record in session_lines {
        let Some(mut session) = record.session else {
            result.warnings.push(format!("session record {} missing session field", record.source_id));
            continue;
        };
        if session.agent_id.trim().is_empty() {
            session.agent_id = opts.default_agent_id.clone();
        }
        if let Some(remapped) = opts.remap_channel_ids.get(&session.channel_id) {
            session.channel_id = remapped.clone();
        }

        if opts.skip_duplicates {
            if let Ok(existing) = store.get_by_key(&session.key) {
                result.sessions_skipped += 1;
                result.source_id_map.insert(record.source_id, existing.id);
                continue;
            }
        }

        if !opts.preserve_ids {
            session.id = new_id();
        }
        result.source_id_map.insert(record.source_id, session.id.clone());

        if opts.dry_run {
            result.sessions_imported += 1;
            continue;
        }
        match store.create(session) {
            Ok(_) => result.sessions_imported += 1,
            Err(e) => result.errors.push(e.to_string()),
        }
    }

    for record in message_lines {
        let Some(mut message) = record.message else {
            result.warnings.push(format!("message record {} missing message field", record.source_id));
            continue;
        };
        let Some(session_id) = result.source_id_map.get(&message.session_id).cloned() else {
            result.warnings.push(format!(
                "message {} references unknown session {}",
                record.source_id, message.session_id
            ));
            continue;
        };
        message.session_id = session_id.clone();
        if let Some(remapped) = opts.remap_channel_ids.get(&message.channel_id) {
            message.channel_id = remapped.clone();
        }

        if opts.dry_run {
            result.messages_imported += 1;
            continue;
        }
        if opts.preserve_ids {
            message.sequence_num = message.sequence_num.max(1);
        }
        match store.append_message(&session_id, message) {
            Ok(_) => result.messages_imported += 1,
            Err(e) => {
                warn!(error = %e, "failed to import message");
                result.errors.push(e.to_string());
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;
    use crate::types::{Direction, Role};

    fn seeded_store() -> MemorySessionStore {
        let store = MemorySessionStore::new();
        let s = store.get_or_create("k1", "agent1", "slack", "U1").unwrap();
        for i in 0..3 {
            let m = Message::new(&s.id, "slack", "U1", Direction::Inbound, Role::User, format!("m{i}"));
            store.append_message(&s.id, m).unwrap();
        }
        store
    }

    #[test]
    fn round_trip_r1_export_then_import_preserve_ids() {
        let source = seeded_store();
        let mut buf = Vec::new();
        let exported = export_to_jsonl(&source, &mut buf).unwrap();
        assert_eq!(exported, 4); // 1 session + 3 messages

        let dest = MemorySessionStore::new();
        let opts = ImportOptions { preserve_ids: true, ..Default::default() };
        let result = import_from_reader(&dest, buf.as_slice(), &opts).unwrap();
        assert_eq!(result.sessions_imported, 1);
        assert_eq!(result.messages_imported, 3);
        assert!(result.errors.is_empty());

        let imported_session = dest.get_by_key("k1").unwrap();
        let history = dest.get_history(&imported_session.id, 0).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "m0");
    }

    #[test]
    fn skip_duplicates_maps_source_id_to_existing() {
        let source = seeded_store();
        let mut buf = Vec::new();
        export_to_jsonl(&source, &mut buf).unwrap();

        let dest = seeded_store(); // already has a session with key "k1"
        let opts = ImportOptions { skip_duplicates: true, ..Default::default() };
        let result = import_from_reader(&dest, buf.as_slice(), &opts).unwrap();
        assert_eq!(result.sessions_skipped, 1);
        assert_eq!(result.sessions_imported, 0);
    }

    #[test]
    fn dry_run_counts_without_writing() {
        let source = seeded_store();
        let mut buf = Vec::new();
        export_to_jsonl(&source, &mut buf).unwrap();

        let dest = MemorySessionStore::new();
        let opts = ImportOptions { dry_run: true, preserve_ids: true, ..Default::default() };
        let result = import_from_reader(&dest, buf.as_slice(), &opts).unwrap();
        assert_eq!(result.sessions_imported, 1);
        assert!(dest.get_by_key("k1").is_err());
    }

    #[test]
    fn malformed_line_is_a_non_fatal_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"not json\n");
        let dest = MemorySessionStore::new();
        let result = import_from_reader(&dest, buf.as_slice(), &ImportOptions::default()).unwrap();
        assert_eq!(result.errors.len(), 1);
    }
}
