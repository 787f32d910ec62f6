//! Key Router (C1): builds and parses the hierarchical session key that
//! groups inbound messages into a session (spec §4.1). Pure, no I/O.

use session_domain::config::ScopeConfig;
use session_domain::{DmScope, Result, StoreError};

/// The parsed, structural form of a session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedKey {
    Dm {
        agent_id: String,
        identity: String,
    },
    DmPerChannel {
        agent_id: String,
        channel: String,
        peer: String,
    },
    Group {
        agent_id: String,
        channel: String,
        kind: String,
        peer: String,
        thread: Option<String>,
    },
    Subagent {
        agent_id: String,
        rest: String,
    },
    Acp {
        agent_id: String,
        rest: String,
    },
}

impl ParsedKey {
    /// Reconstruct the canonical string form. `ParseHierarchicalKey(k).String()
    /// == k` for every `k` produced by `BuildKey` (spec §8 R2).
    pub fn to_key_string(&self) -> String {
        match self {
            ParsedKey::Dm { agent_id, identity } => format!("agent:{agent_id}:dm:{identity}"),
            ParsedKey::DmPerChannel {
                agent_id,
                channel,
                peer,
            } => format!("agent:{agent_id}:{channel}:dm:{peer}"),
            ParsedKey::Group {
                agent_id,
                channel,
                kind,
                peer,
                thread,
            } => {
                let base = format!("agent:{agent_id}:{channel}:{kind}:{peer}");
                match thread {
                    Some(t) => format!("{base}:thread:{t}"),
                    None => base,
                }
            }
            ParsedKey::Subagent { agent_id, rest } => format!("agent:{agent_id}:subagent:{rest}"),
            ParsedKey::Acp { agent_id, rest } => format!("agent:{agent_id}:acp:{rest}"),
        }
    }
}

/// Normalize an agent id per spec §4.1: already-conformant ids
/// (`[A-Za-z0-9][A-Za-z0-9_-]{0,63}`) pass through unchanged; anything else is
/// lowercased, invalid-char runs collapsed to `-`, leading hyphens stripped,
/// and truncated to 64 chars. An empty result falls back to `"main"`.
///
/// Idempotent: `normalize_agent_id(normalize_agent_id(x)) == normalize_agent_id(x)`
/// (spec §8 R3).
pub fn normalize_agent_id(raw: &str) -> String {
    if is_conformant_agent_id(raw) {
        return raw.to_string();
    }
    let lowered = raw.to_lowercase();
    let mut collapsed = String::with_capacity(lowered.len());
    let mut prev_was_invalid = false;
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            collapsed.push(c);
            prev_was_invalid = false;
        } else if !prev_was_invalid {
            collapsed.push('-');
            prev_was_invalid = true;
        }
    }
    let trimmed = collapsed.trim_start_matches('-');
    let truncated: String = trimmed.chars().take(64).collect();
    if truncated.is_empty() {
        "main".to_string()
    } else {
        truncated
    }
}

fn is_conformant_agent_id(s: &str) -> bool {
    if s.is_empty() || s.len() > 64 {
        return false;
    }
    let mut chars = s.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_alphanumeric() {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn normalize_channel(raw: &str) -> String {
    if raw.trim().is_empty() {
        "unknown".to_string()
    } else {
        raw.to_lowercase()
    }
}

fn normalize_peer(raw: &str) -> String {
    if raw.trim().is_empty() {
        "unknown".to_string()
    } else {
        raw.to_string()
    }
}

/// Resolve a `<channel>:<peer>` pair to a canonical identity alias, if one is
/// configured (spec §4.1 "Identity resolution"). Matching is case-insensitive
/// on the channel; candidates are both `<peer>` and `<channel>:<peer>`.
pub fn resolve_identity(scope: &ScopeConfig, channel: &str, peer: &str) -> String {
    let channel_lc = channel.to_lowercase();
    for (canonical, aliases) in scope.identity_links.iter() {
        for alias in aliases {
            if let Some((alias_channel, alias_peer)) = alias.split_once(':') {
                if alias_channel.eq_ignore_ascii_case(&channel_lc) && alias_peer == peer {
                    return canonical.clone();
                }
            } else if alias == peer {
                return canonical.clone();
            }
        }
    }
    format!("{channel_lc}:{peer}")
}

/// Build a session key from the inbound-message parameters (spec §4.1).
/// `dm_scope` and `use_thread_suffix` are read from `scope`; passing them
/// separately would let callers drift from the configured policy.
pub fn build_key(
    scope: &ScopeConfig,
    agent_id: &str,
    channel: &str,
    peer_id: &str,
    is_group: bool,
    thread_id: Option<&str>,
) -> String {
    let agent = normalize_agent_id(agent_id);
    let channel = normalize_channel(channel);
    let peer = normalize_peer(peer_id);

    if !is_group {
        let key = match scope.dm_scope {
            DmScope::Main => format!("agent:{agent}:dm:main"),
            DmScope::PerPeer => {
                let identity = resolve_identity(scope, &channel, &peer);
                format!("agent:{agent}:dm:{identity}")
            }
            DmScope::PerChannelPeer => format!("agent:{agent}:{channel}:dm:{peer}"),
        };
        return apply_thread_suffix(&key, thread_id, scope.use_thread_suffix);
    }

    let base = format!("agent:{agent}:{channel}:group:{peer}");
    apply_thread_suffix(&base, thread_id, scope.use_thread_suffix)
}

fn apply_thread_suffix(base: &str, thread_id: Option<&str>, use_suffix: bool) -> String {
    match thread_id {
        Some(t) if use_suffix && !t.is_empty() => format!("{base}:thread:{t}"),
        _ => base.to_string(),
    }
}

/// Parse either the modern `agent:...` form or the legacy two-token
/// `<agent>:<channel>:<peer>...` form. Rejects fewer than three non-empty
/// colon-separated tokens.
pub fn parse_key(raw: &str) -> Result<ParsedKey> {
    let trimmed = raw.trim();
    let tokens: Vec<&str> = trimmed.split(':').filter(|t| !t.is_empty()).collect();
    if tokens.len() < 3 {
        return Err(StoreError::Parse("invalid session key format".to_string()));
    }

    if tokens[0] == "agent" {
        return parse_modern(&tokens);
    }

    // Legacy two-token form: <agent>:<channel>:<peer>[...]
    let agent_id = tokens[0].to_string();
    let channel = tokens[1].to_string();
    let peer = tokens[2].to_string();
    let thread = tokens.get(3).map(|s| s.to_string());
    Ok(ParsedKey::Group {
        agent_id,
        channel,
        kind: "group".to_string(),
        peer,
        thread,
    })
}

fn parse_modern(tokens: &[&str]) -> Result<ParsedKey> {
    if tokens.len() < 3 {
        return Err(StoreError::Parse("invalid session key format".to_string()));
    }
    let agent_id = tokens[1].to_string();
    match tokens[2] {
        "dm" => {
            if tokens.len() < 4 {
                return Err(StoreError::Parse("invalid session key format".to_string()));
            }
            Ok(ParsedKey::Dm {
                agent_id,
                identity: tokens[3..].join(":"),
            })
        }
        "subagent" => Ok(ParsedKey::Subagent {
            agent_id,
            rest: tokens[3..].join(":"),
        }),
        "acp" => Ok(ParsedKey::Acp {
            agent_id,
            rest: tokens[3..].join(":"),
        }),
        channel => {
            if tokens.len() >= 5 && tokens[3] == "dm" {
                return Ok(ParsedKey::DmPerChannel {
                    agent_id,
                    channel: channel.to_string(),
                    peer: tokens[4..].join(":"),
                });
            }
            if tokens.len() < 5 {
                return Err(StoreError::Parse("invalid session key format".to_string()));
            }
            let kind = tokens[3].to_string();
            let peer = tokens[4].to_string();
            let thread = if tokens.len() >= 7 && tokens[5] == "thread" {
                Some(tokens[6..].join(":"))
            } else {
                None
            };
            Ok(ParsedKey::Group {
                agent_id,
                channel: channel.to_string(),
                kind,
                peer,
                thread,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope_with_links() -> ScopeConfig {
        let mut scope = ScopeConfig {
            dm_scope: DmScope::PerPeer,
            ..Default::default()
        };
        scope.identity_links.insert(
            "jonathan".to_string(),
            vec!["slack:U123".to_string(), "discord:user456".to_string()],
        );
        scope
    }

    #[test]
    fn scenario_1_scoping() {
        let scope = scope_with_links();
        let key = build_key(&scope, "agent1", "slack", "U123", false, None);
        assert_eq!(key, "agent:agent1:dm:jonathan");

        let key2 = build_key(&scope, "agent1", "telegram", "tg1", false, None);
        assert_eq!(key2, "agent:agent1:dm:telegram:tg1");
    }

    #[test]
    fn roundtrip_build_and_parse() {
        let scope = ScopeConfig {
            dm_scope: DmScope::PerChannelPeer,
            ..Default::default()
        };
        let key = build_key(&scope, "agent1", "slack", "U1", false, None);
        let parsed = parse_key(&key).unwrap();
        assert_eq!(parsed.to_key_string(), key);
    }

    #[test]
    fn normalize_is_idempotent() {
        let raw = "Weird Agent!! Name";
        let once = normalize_agent_id(raw);
        let twice = normalize_agent_id(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_empty_falls_back_to_main() {
        assert_eq!(normalize_agent_id("!!!"), "main");
    }

    #[test]
    fn parse_rejects_short_keys() {
        assert!(parse_key("a:b").is_err());
    }

    #[test]
    fn parse_legacy_two_token_form() {
        let parsed = parse_key("agent1:slack:U123").unwrap();
        match parsed {
            ParsedKey::Group { agent_id, channel, peer, .. } => {
                assert_eq!(agent_id, "agent1");
                assert_eq!(channel, "slack");
                assert_eq!(peer, "U123");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn identity_resolution_skipped_for_main_scope() {
        let mut scope = scope_with_links();
        scope.dm_scope = DmScope::Main;
        let key = build_key(&scope, "agent1", "slack", "U123", false, None);
        assert_eq!(key, "agent:agent1:dm:main");
    }

    #[test]
    fn thread_suffix_appended() {
        let scope = ScopeConfig {
            dm_scope: DmScope::PerChannelPeer,
            ..Default::default()
        };
        let key = build_key(&scope, "a", "slack", "p1", true, Some("t1"));
        assert!(key.ends_with(":thread:t1"));
    }
}
