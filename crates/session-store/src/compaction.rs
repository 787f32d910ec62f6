//! Compaction Engine (C4): shrinks an overlong history via a selected
//! strategy, adapting chunk sizes to the model's context window when the
//! adaptive variant is configured (spec §4.4).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use session_domain::config::{AdaptiveCompactionConfig, CompactionConfig, CompactionStrategy};
use session_domain::{Result, StoreError};

use crate::types::{meta_keys, Message, Value};

/// A narrow interface over an LLM summarizer, consumed the way the core
/// consumes any external collaborator (spec §1 "Deliberately out of scope").
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        prompt: &str,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<String>;
}

/// Outcome of a compaction run (spec §4.4 "Output").
#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub before_count: usize,
    pub after_count: usize,
    pub before_tokens_est: usize,
    pub after_tokens_est: usize,
    pub summary: Option<String>,
    pub removed_ids: Vec<String>,
    pub compacted_at: DateTime<Utc>,
    pub strategy: CompactionStrategy,
}

/// Cheap token estimate: `floor((sum of content lengths + 20*N) / 4)`
/// (spec §4.4 "Trigger").
pub fn estimate_tokens(messages: &[Message]) -> usize {
    let content_len: usize = messages.iter().map(|m| m.content.len()).sum();
    (content_len + 20 * messages.len()) / 4
}

/// First satisfied condition wins: count, then tokens, then age
/// (spec §4.4 "Trigger").
pub fn should_compact(cfg: &CompactionConfig, messages: &[Message], now: DateTime<Utc>) -> bool {
    if !cfg.enabled {
        return false;
    }
    if messages.len() > cfg.max_messages {
        return true;
    }
    if estimate_tokens(messages) > cfg.max_tokens {
        return true;
    }
    if cfg.max_age_hours > 0 {
        if let Some(oldest) = messages.first() {
            let age_hours = now.signed_duration_since(oldest.created_at).num_hours();
            if age_hours > cfg.max_age_hours {
                return true;
            }
        }
    }
    false
}

fn is_system(m: &Message) -> bool {
    matches!(m.role, crate::types::Role::System)
}

/// Run the configured (non-adaptive) strategy (spec §4.4 "Strategies").
pub async fn compact(
    cfg: &CompactionConfig,
    messages: &[Message],
    summarizer: Option<&dyn Summarizer>,
    cancel: &CancellationToken,
    now: DateTime<Utc>,
) -> Result<(Vec<Message>, CompactionResult)> {
    let before_count = messages.len();
    let before_tokens_est = estimate_tokens(messages);

    let (kept, summary, removed_ids) = match cfg.strategy {
        CompactionStrategy::LastN => last_n(cfg, messages),
        CompactionStrategy::Summarize | CompactionStrategy::Hybrid => {
            summarize_strategy(cfg, messages, summarizer, cancel).await?
        }
        CompactionStrategy::ImportantOnly => important_only(cfg, messages),
        CompactionStrategy::TruncateOld => truncate_old(cfg, messages, now),
    };

    let after_tokens_est = estimate_tokens(&kept);
    let result = CompactionResult {
        before_count,
        after_count: kept.len(),
        before_tokens_est,
        after_tokens_est,
        summary,
        removed_ids,
        compacted_at: now,
        strategy: cfg.strategy,
    };
    Ok((kept, result))
}

fn last_n(cfg: &CompactionConfig, messages: &[Message]) -> (Vec<Message>, Option<String>, Vec<String>) {
    let (system, non_system): (Vec<&Message>, Vec<&Message>) =
        messages.iter().partition(|m| is_system(m));

    let keep_n = cfg.keep_last_n.min(non_system.len());
    let split = non_system.len() - keep_n;
    let removed: Vec<String> = non_system[..split].iter().map(|m| m.id.clone()).collect();
    let kept_non_system = &non_system[split..];

    let mut kept = Vec::new();
    if cfg.preserve_system_messages {
        kept.extend(system.into_iter().cloned());
    }
    kept.extend(kept_non_system.iter().map(|m| (*m).clone()));
    (kept, None, removed)
}

async fn summarize_strategy(
    cfg: &CompactionConfig,
    messages: &[Message],
    summarizer: Option<&dyn Summarizer>,
    cancel: &CancellationToken,
) -> Result<(Vec<Message>, Option<String>, Vec<String>)> {
    let (system, non_system): (Vec<&Message>, Vec<&Message>) =
        messages.iter().partition(|m| is_system(m));

    let keep_n = cfg.keep_last_n.min(non_system.len());
    let split = non_system.len() - keep_n;
    let to_drop = &non_system[..split];
    let removed: Vec<String> = to_drop.iter().map(|m| m.id.clone()).collect();
    let kept_tail = &non_system[split..];

    let Some(summarizer) = summarizer else {
        // No summarizer wired: fall back to last_n silently (spec §4.4).
        return Ok(last_n(cfg, messages));
    };

    if to_drop.is_empty() {
        let mut kept = Vec::new();
        if cfg.preserve_system_messages {
            kept.extend(system.into_iter().cloned());
        }
        kept.extend(kept_tail.iter().map(|m| (*m).clone()));
        return Ok((kept, None, removed));
    }

    let dropped_owned: Vec<Message> = to_drop.iter().map(|m| (*m).clone()).collect();
    let summary = summarizer
        .summarize(&cfg.summary_prompt, &dropped_owned, cancel)
        .await?;

    let mut summary_msg = Message::new(
        dropped_owned[0].session_id.clone(),
        dropped_owned[0].channel.clone(),
        dropped_owned[0].channel_id.clone(),
        crate::types::Direction::Inbound,
        crate::types::Role::System,
        format!("[Conversation Summary]\n{summary}"),
    );
    summary_msg.created_at = dropped_owned[0].created_at;

    let mut kept = Vec::new();
    if cfg.preserve_system_messages {
        kept.extend(system.into_iter().cloned());
    }
    kept.push(summary_msg);
    kept.extend(kept_tail.iter().map(|m| (*m).clone()));

    Ok((kept, Some(summary), removed))
}

fn important_only(
    cfg: &CompactionConfig,
    messages: &[Message],
) -> (Vec<Message>, Option<String>, Vec<String>) {
    let mut kept = Vec::new();
    let mut removed = Vec::new();
    for m in messages {
        let preserve_system = cfg.preserve_system_messages && is_system(m);
        if preserve_system || m.is_important() {
            kept.push(m.clone());
        } else {
            removed.push(m.id.clone());
        }
    }
    (kept, None, removed)
}

fn truncate_old(
    cfg: &CompactionConfig,
    messages: &[Message],
    now: DateTime<Utc>,
) -> (Vec<Message>, Option<String>, Vec<String>) {
    if cfg.max_age_hours == 0 {
        return (messages.to_vec(), None, Vec::new());
    }
    let cutoff = now - chrono::Duration::hours(cfg.max_age_hours);
    let mut kept = Vec::new();
    let mut removed = Vec::new();
    for m in messages {
        if is_system(m) || m.created_at >= cutoff {
            kept.push(m.clone());
        } else {
            removed.push(m.id.clone());
        }
    }
    (kept, None, removed)
}

// ---- Adaptive variant (spec §4.4 "Adaptive variant") ----

struct Chunk {
    messages: Vec<Message>,
    oversized: bool,
}

fn scaled_tokens(cfg: &AdaptiveCompactionConfig, message: &Message) -> f64 {
    estimate_tokens(std::slice::from_ref(message)) as f64 * cfg.safety_margin
}

fn effective_chunk_ratio(cfg: &AdaptiveCompactionConfig, messages: &[Message]) -> f64 {
    if messages.is_empty() {
        return cfg.base_chunk_ratio;
    }
    let avg_scaled: f64 =
        messages.iter().map(|m| scaled_tokens(cfg, m)).sum::<f64>() / messages.len() as f64;
    let avg_ratio = avg_scaled / cfg.context_window_tokens as f64;
    if avg_ratio > 0.10 {
        (cfg.base_chunk_ratio - 2.0 * avg_ratio).clamp(cfg.min_chunk_ratio, cfg.base_chunk_ratio)
    } else {
        cfg.base_chunk_ratio
    }
}

fn split_into_chunks(cfg: &AdaptiveCompactionConfig, messages: &[Message], max_chunk_tokens: f64) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut current: Vec<Message> = Vec::new();
    let mut current_tokens = 0.0f64;

    for m in messages {
        let tokens = scaled_tokens(cfg, m);
        let oversized = tokens > cfg.oversized_threshold * cfg.context_window_tokens as f64;
        if oversized {
            if !current.is_empty() {
                chunks.push(Chunk {
                    messages: std::mem::take(&mut current),
                    oversized: false,
                });
                current_tokens = 0.0;
            }
            chunks.push(Chunk {
                messages: vec![m.clone()],
                oversized: true,
            });
            continue;
        }
        if current_tokens + tokens > max_chunk_tokens && !current.is_empty() {
            chunks.push(Chunk {
                messages: std::mem::take(&mut current),
                oversized: false,
            });
            current_tokens = 0.0;
        }
        current.push(m.clone());
        current_tokens += tokens;
    }
    if !current.is_empty() {
        chunks.push(Chunk {
            messages: current,
            oversized: false,
        });
    }
    chunks
}

fn compaction_failure_note(n: usize) -> String {
    format!("[{n} messages were compacted due to context limits]")
}

/// Adaptive multi-stage compaction of the prefix to be dropped, used by the
/// `summarize`/`hybrid` strategies when the configured context window makes
/// a single summarizer call unsafe (spec §4.4 "Adaptive variant").
pub async fn adaptive_summarize(
    cfg: &AdaptiveCompactionConfig,
    prefix: &[Message],
    summarizer: &dyn Summarizer,
    summary_prompt: &str,
    merge_prompt: &str,
    cancel: &CancellationToken,
) -> Result<String> {
    if prefix.is_empty() {
        return Ok(String::new());
    }

    let ratio = effective_chunk_ratio(cfg, prefix);
    let max_chunk_tokens = ratio * cfg.context_window_tokens as f64;
    let prefix_tokens: f64 = prefix.iter().map(|m| scaled_tokens(cfg, m)).sum();

    if prefix_tokens <= max_chunk_tokens {
        return summarize_chunk(summarizer, summary_prompt, prefix, cancel).await;
    }

    let mut chunks = split_into_chunks(cfg, prefix, max_chunk_tokens);
    if chunks.len() > cfg.max_parts_for_multi_stage {
        chunks.truncate(cfg.max_parts_for_multi_stage);
    }

    let mut partial_summaries = Vec::new();
    for chunk in &chunks {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        if chunk.oversized {
            partial_summaries
                .push("[1 message skipped: oversized relative to context window]".to_string());
            continue;
        }
        let summary = summarize_chunk(summarizer, summary_prompt, &chunk.messages, cancel).await;
        match summary {
            Ok(s) => partial_summaries.push(s),
            Err(StoreError::Cancelled) => return Err(StoreError::Cancelled),
            Err(_) => partial_summaries.push(compaction_failure_note(chunk.messages.len())),
        }
    }

    let merged_input: Vec<Message> = partial_summaries
        .iter()
        .map(|s| {
            Message::new(
                String::new(),
                String::new(),
                String::new(),
                crate::types::Direction::Inbound,
                crate::types::Role::System,
                s.clone(),
            )
        })
        .collect();

    match summarize_chunk(summarizer, merge_prompt, &merged_input, cancel).await {
        Ok(s) => Ok(s),
        Err(StoreError::Cancelled) => Err(StoreError::Cancelled),
        Err(_) => Ok(compaction_failure_note(prefix.len())),
    }
}

async fn summarize_chunk(
    summarizer: &dyn Summarizer,
    prompt: &str,
    messages: &[Message],
    cancel: &CancellationToken,
) -> Result<String> {
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }
    summarizer.summarize(prompt, messages, cancel).await
}

/// Metadata recorded on the synthesized summary message, matching the
/// persisted metadata-key vocabulary (spec §6 "Persisted metadata keys").
pub fn compaction_info(before_count: usize, ratio: f64) -> session_domain::Metadata {
    let mut m = session_domain::Metadata::new();
    m.insert(
        meta_keys::MESSAGE_COUNT_PRE_COMPACTION.to_string(),
        Value::Int(before_count as i64),
    );
    m.insert(meta_keys::ADAPTIVE_RATIO.to_string(), Value::Float(ratio));
    m.insert(
        meta_keys::LAST_COMPACTED_AT.to_string(),
        Value::Str(Utc::now().to_rfc3339()),
    );
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, Role};

    fn msg(role: Role, content: &str, created_at: DateTime<Utc>) -> Message {
        let mut m = Message::new("s1", "c", "cid", Direction::Inbound, role, content);
        m.created_at = created_at;
        m
    }

    #[test]
    fn scenario_5_last_n_compaction() {
        let now = Utc::now();
        let mut messages = vec![msg(Role::System, "sys", now)];
        for i in 0..20 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            messages.push(msg(role, &format!("m{i}"), now));
        }
        let cfg = CompactionConfig {
            enabled: true,
            strategy: CompactionStrategy::LastN,
            keep_last_n: 5,
            preserve_system_messages: true,
            ..Default::default()
        };
        let (kept, _, removed) = last_n(&cfg, &messages);
        assert_eq!(kept.len(), 6);
        assert_eq!(removed.len(), 15);
    }

    #[test]
    fn keep_last_n_ge_length_is_noop() {
        let now = Utc::now();
        let messages = vec![msg(Role::User, "a", now), msg(Role::User, "b", now)];
        let cfg = CompactionConfig {
            keep_last_n: 10,
            ..Default::default()
        };
        let (kept, _, removed) = last_n(&cfg, &messages);
        assert_eq!(kept.len(), 2);
        assert!(removed.is_empty());
    }

    #[test]
    fn should_compact_respects_disabled() {
        let cfg = CompactionConfig {
            enabled: false,
            max_messages: 0,
            ..Default::default()
        };
        assert!(!should_compact(&cfg, &[], Utc::now()));
    }

    #[test]
    fn should_compact_triggers_on_count() {
        let now = Utc::now();
        let cfg = CompactionConfig {
            enabled: true,
            max_messages: 1,
            ..Default::default()
        };
        let messages = vec![msg(Role::User, "a", now), msg(Role::User, "b", now)];
        assert!(should_compact(&cfg, &messages, now));
    }

    #[test]
    fn important_only_keeps_flagged_and_system() {
        let now = Utc::now();
        let mut important = msg(Role::User, "keep me", now);
        important
            .metadata
            .insert(meta_keys::IMPORTANT.to_string(), Value::Bool(true));
        let messages = vec![msg(Role::System, "sys", now), important, msg(Role::User, "drop", now)];
        let cfg = CompactionConfig {
            preserve_system_messages: true,
            ..Default::default()
        };
        let (kept, _, removed) = important_only(&cfg, &messages);
        assert_eq!(kept.len(), 2);
        assert_eq!(removed.len(), 1);
    }

    #[test]
    fn truncate_old_zero_age_is_noop() {
        let now = Utc::now();
        let messages = vec![msg(Role::User, "a", now - chrono::Duration::days(10))];
        let cfg = CompactionConfig {
            max_age_hours: 0,
            ..Default::default()
        };
        let (kept, _, removed) = truncate_old(&cfg, &messages, now);
        assert_eq!(kept.len(), 1);
        assert!(removed.is_empty());
    }
}
