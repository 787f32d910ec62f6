//! Transcript Repair (C3): guarantees every assistant tool-call is
//! immediately followed by a matching tool-result (spec §4.3). Pure,
//! single forward pass.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use session_domain::Result;

use crate::store::SessionStore;
use crate::types::{meta_keys, Message, Role, Value};

/// Report returned alongside the repaired message list.
#[derive(Debug, Clone, Default)]
pub struct RepairReport {
    pub synthetic_added: usize,
    pub dropped_duplicates: usize,
    pub dropped_orphans: usize,
    pub moved: bool,
}

fn synthetic_tool_result(
    tool_call_id: &str,
    tool_name: Option<&str>,
    created_at: DateTime<Utc>,
) -> Message {
    let mut msg = Message::new(
        String::new(),
        String::new(),
        String::new(),
        crate::types::Direction::Inbound,
        Role::Tool,
        "[no tool result was produced for this call]",
    );
    msg.metadata.insert(meta_keys::SYNTHETIC.to_string(), Value::Bool(true));
    msg.metadata.insert(
        meta_keys::TOOL_NAME.to_string(),
        Value::Str(tool_name.unwrap_or("unknown").to_string()),
    );
    msg.tool_results.push(crate::types::ToolResult {
        tool_call_id: tool_call_id.to_string(),
        content: "[no tool result was produced for this call]".to_string(),
        is_error: true,
    });
    msg.created_at = created_at;
    msg
}

fn is_tool_result_message(m: &Message) -> bool {
    matches!(m.role, Role::Tool) && !m.tool_results.is_empty()
}

/// Run the single forward-pass repair described in spec §4.3. If no changes
/// are needed, returns a clone flagged with `moved = false` and the original
/// content — the caller can compare message ids to detect a no-op repair.
pub fn repair_transcript(messages: &[Message]) -> (Vec<Message>, RepairReport) {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    let mut report = RepairReport::default();
    let mut i = 0usize;
    let mut any_assistant_seen = false;

    while i < messages.len() {
        let msg = &messages[i];

        if matches!(msg.role, Role::Assistant) && !msg.tool_calls.is_empty() {
            any_assistant_seen = true;
            let assistant = msg.clone();
            out.push(assistant.clone());

            // Collect the run up to (not including) the next assistant message.
            let mut j = i + 1;
            let mut run: Vec<Message> = Vec::new();
            while j < messages.len() && !matches!(messages[j].role, Role::Assistant) {
                run.push(messages[j].clone());
                j += 1;
            }

            let mut matched: std::collections::HashMap<String, Message> = Default::default();
            let mut seen_ids: HashSet<String> = Default::default();
            let mut remainder: Vec<Message> = Vec::new();
            let mut pending_empty_id: VecDeque<String> =
                assistant.tool_calls.iter().map(|c| c.id.clone()).collect();
            let mut turn_had_drop = false;

            for m in run {
                if !is_tool_result_message(&m) {
                    remainder.push(m);
                    continue;
                }
                let tr = m.tool_results[0].clone();
                let id = if tr.tool_call_id.is_empty() {
                    pending_empty_id.pop_front()
                } else {
                    None
                };
                let resolved_id = id.unwrap_or_else(|| tr.tool_call_id.clone());

                let is_known_call = assistant.tool_calls.iter().any(|c| c.id == resolved_id);
                if !is_known_call {
                    report.dropped_orphans += 1;
                    turn_had_drop = true;
                    continue;
                }
                if seen_ids.contains(&resolved_id) {
                    report.dropped_duplicates += 1;
                    turn_had_drop = true;
                    continue;
                }
                seen_ids.insert(resolved_id.clone());
                if !pending_empty_id.is_empty() {
                    pending_empty_id.retain(|pid| pid != &resolved_id);
                }
                matched.insert(resolved_id, m);
            }

            if matched.len() != assistant.tool_calls.len() || !remainder.is_empty() || turn_had_drop
            {
                report.moved = true;
            }

            for (idx, call) in assistant.tool_calls.iter().enumerate() {
                if let Some(m) = matched.remove(&call.id) {
                    out.push(m);
                } else {
                    let synth_time = assistant.created_at + Duration::nanoseconds((idx as i64) + 1);
                    let synth = synthetic_tool_result(&call.id, Some(&call.name), synth_time);
                    report.synthetic_added += 1;
                    report.moved = true;
                    out.push(synth);
                }
            }

            out.extend(remainder);
            i = j;
            continue;
        }

        if matches!(msg.role, Role::Tool) && !any_assistant_seen {
            // Pure orphan before any assistant-with-tool-calls turn.
            report.dropped_orphans += 1;
            report.moved = true;
            i += 1;
            continue;
        }

        out.push(msg.clone());
        i += 1;
    }

    if report.synthetic_added == 0
        && report.dropped_duplicates == 0
        && report.dropped_orphans == 0
        && !report.moved
    {
        return (messages.to_vec(), report);
    }

    (out, report)
}

/// Streaming variant of repair, used as messages are appended one at a time.
/// Tracks pending tool-call ids from the most recent assistant turn and can
/// flush synthetic errors for anything still outstanding.
#[derive(Debug, Default)]
pub struct ToolCallGuard {
    pending: Vec<crate::types::ToolCall>,
    turn_started_at: Option<DateTime<Utc>>,
}

impl ToolCallGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an assistant turn, seeding pending ids (clears any prior
    /// unflushed state — callers should `flush` first if that matters).
    pub fn track(&mut self, msg: &Message) {
        if matches!(msg.role, Role::Assistant) && !msg.tool_calls.is_empty() {
            self.pending = msg.tool_calls.clone();
            self.turn_started_at = Some(msg.created_at);
        }
    }

    /// Mark a tool-call id as completed.
    pub fn record(&mut self, tool_call_id: &str) {
        self.pending.retain(|c| c.id != tool_call_id);
    }

    /// Emit synthetic errors for every still-pending call and clear state.
    pub fn flush(&mut self) -> Vec<Message> {
        let started = self.turn_started_at.unwrap_or_else(Utc::now);
        let synths = self
            .pending
            .drain(..)
            .enumerate()
            .map(|(idx, call)| {
                synthetic_tool_result(
                    &call.id,
                    Some(&call.name),
                    started + Duration::nanoseconds((idx as i64) + 1),
                )
            })
            .collect();
        self.turn_started_at = None;
        synths
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Wraps a [`SessionStore`] to apply [`ToolCallGuard`] automatically on
/// every append: an assistant turn re-seeds the pending ids, a tool-result
/// records completion, and anything else first flushes whatever is still
/// pending as synthetic errors (spec §4.3 "GuardedSessionStore").
pub struct GuardedSessionStore<S: SessionStore> {
    inner: S,
    guards: Mutex<HashMap<String, ToolCallGuard>>,
}

impl<S: SessionStore> GuardedSessionStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, guards: Mutex::new(HashMap::new()) }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Appends `message`, first emitting any synthetic tool-results the
    /// guard decides are due, then the message itself.
    pub fn append_message(&self, session_id: &str, message: Message) -> Result<Message> {
        let mut synths = Vec::new();
        {
            let mut guards = self.guards.lock().unwrap();
            let guard = guards.entry(session_id.to_string()).or_default();

            if matches!(message.role, Role::Assistant) && !message.tool_calls.is_empty() {
                guard.track(&message);
            } else if is_tool_result_message(&message) {
                guard.record(&message.tool_results[0].tool_call_id);
            } else if guard.has_pending() {
                synths = guard.flush();
            }
        }

        for synth in synths {
            self.inner.append_message(session_id, synth)?;
        }
        self.inner.append_message(session_id, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;
    use crate::types::{Direction, ToolCall, ToolResult};

    fn user(content: &str) -> Message {
        Message::new("s1", "c", "cid", Direction::Inbound, Role::User, content)
    }

    fn assistant_with_calls(ids: &[&str]) -> Message {
        let mut m = Message::new("s1", "c", "cid", Direction::Outbound, Role::Assistant, "");
        m.tool_calls = ids
            .iter()
            .map(|id| ToolCall {
                id: id.to_string(),
                name: "tool".to_string(),
                input: serde_json::json!({}),
            })
            .collect();
        m
    }

    fn tool_result(id: &str, content: &str) -> Message {
        let mut m = Message::new("s1", "c", "cid", Direction::Inbound, Role::Tool, content);
        m.tool_results.push(ToolResult {
            tool_call_id: id.to_string(),
            content: content.to_string(),
            is_error: false,
        });
        m
    }

    #[test]
    fn scenario_3_transcript_repair() {
        let messages = vec![
            user("hi"),
            assistant_with_calls(&["tc1", "tc2", "tc3"]),
            user("wait"),
            tool_result("tc1", "ok"),
            tool_result("tc2", "ok"),
            tool_result("tc1", "dup"),
            assistant_with_calls(&["tc4"]),
            tool_result("orphan1", "x"),
        ];

        let (repaired, report) = repair_transcript(&messages);

        assert_eq!(report.synthetic_added, 2);
        assert_eq!(report.dropped_duplicates, 1);
        assert_eq!(report.dropped_orphans, 1);
        assert!(report.moved);

        assert_eq!(repaired.len(), 8);
        assert!(matches!(repaired[0].role, Role::User));
        assert!(matches!(repaired[1].role, Role::Assistant));
        assert_eq!(repaired[2].tool_results[0].tool_call_id, "tc1");
        assert_eq!(repaired[3].tool_results[0].tool_call_id, "tc2");
        assert!(repaired[4].is_synthetic());
        assert_eq!(repaired[4].tool_results[0].tool_call_id, "tc3");
        assert!(matches!(repaired[5].role, Role::User));
        assert!(matches!(repaired[6].role, Role::Assistant));
        assert!(repaired[7].is_synthetic());
    }

    #[test]
    fn identity_preserved_when_no_changes_needed() {
        let messages = vec![
            user("hi"),
            assistant_with_calls(&["tc1"]),
            tool_result("tc1", "ok"),
        ];
        let (repaired, report) = repair_transcript(&messages);
        assert_eq!(report.synthetic_added, 0);
        assert_eq!(report.dropped_duplicates, 0);
        assert_eq!(report.dropped_orphans, 0);
        assert!(!report.moved);
        assert_eq!(repaired.len(), messages.len());
    }

    #[test]
    fn idempotent_repair() {
        let messages = vec![
            user("hi"),
            assistant_with_calls(&["tc1", "tc2"]),
            tool_result("tc1", "ok"),
        ];
        let (once, _) = repair_transcript(&messages);
        let (twice, _) = repair_transcript(&once);
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.id, b.id);
        }
    }

    #[test]
    fn leading_tool_messages_are_pure_orphans() {
        let messages = vec![tool_result("tcX", "x"), user("hi")];
        let (repaired, report) = repair_transcript(&messages);
        assert_eq!(report.dropped_orphans, 1);
        assert_eq!(repaired.len(), 1);
    }

    #[test]
    fn guard_flush_emits_synthetic_for_pending() {
        let mut guard = ToolCallGuard::new();
        guard.track(&assistant_with_calls(&["a", "b"]));
        guard.record("a");
        assert!(guard.has_pending());
        let synths = guard.flush();
        assert_eq!(synths.len(), 1);
        assert_eq!(synths[0].tool_results[0].tool_call_id, "b");
        assert!(!guard.has_pending());
    }

    #[test]
    fn guarded_store_flushes_synthetic_before_unrelated_message() {
        let store = GuardedSessionStore::new(MemorySessionStore::new());
        let session = store.inner().get_or_create("k1", "agent1", "slack", "U1").unwrap();

        store.append_message(&session.id, assistant_with_calls(&["tc1", "tc2"])).unwrap();
        store.append_message(&session.id, tool_result("tc1", "ok")).unwrap();
        // tc2 never completes; the next unrelated message should flush it.
        store.append_message(&session.id, user("next turn")).unwrap();

        let history = store.inner().get_history(&session.id, 0).unwrap();
        assert_eq!(history.len(), 4);
        assert!(history[2].is_synthetic());
        assert_eq!(history[2].tool_results[0].tool_call_id, "tc2");
        assert!(matches!(history[3].role, Role::User));
    }
}
