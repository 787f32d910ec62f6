//! The persisted data model (spec §3): sessions, messages, branches, and
//! their supporting records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use session_domain::{meta_keys, new_id, Metadata, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> session_domain::Result<Self> {
        match s {
            "inbound" => Ok(Direction::Inbound),
            "outbound" => Ok(Direction::Outbound),
            other => Err(session_domain::StoreError::Parse(format!(
                "unknown direction: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> session_domain::Result<Self> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            other => Err(session_domain::StoreError::Parse(format!(
                "unknown role: {other}"
            ))),
        }
    }
}

/// Conversation type consumed by the expiry policy and key router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvType {
    Dm,
    Group,
    Thread,
}

impl ConvType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConvType::Dm => "dm",
            ConvType::Group => "group",
            ConvType::Thread => "thread",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Active,
    Merged,
    Archived,
}

impl BranchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchStatus::Active => "active",
            BranchStatus::Merged => "merged",
            BranchStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> session_domain::Result<Self> {
        match s {
            "active" => Ok(BranchStatus::Active),
            "merged" => Ok(BranchStatus::Merged),
            "archived" => Ok(BranchStatus::Archived),
            other => Err(session_domain::StoreError::Parse(format!(
                "unknown branch status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Replace,
    Continue,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::Replace => "replace",
            MergeStrategy::Continue => "continue",
        }
    }

    pub fn parse(s: &str) -> session_domain::Result<Self> {
        match s {
            "replace" => Ok(MergeStrategy::Replace),
            "continue" => Ok(MergeStrategy::Continue),
            other => Err(session_domain::StoreError::Parse(format!(
                "unknown merge strategy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
}

/// A persisted conversation session (spec §3 "Session").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_id: String,
    pub channel: String,
    pub channel_id: String,
    pub key: String,
    pub title: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        agent_id: impl Into<String>,
        channel: impl Into<String>,
        channel_id: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            agent_id: agent_id.into(),
            channel: channel.into(),
            channel_id: channel_id.into(),
            key: key.into(),
            title: None,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// `updated_at` if non-zero, else `created_at`, else `None` if both are
    /// the zero sentinel (spec §4.2 "last_activity").
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        if self.updated_at != epoch {
            Some(self.updated_at)
        } else if self.created_at != epoch {
            Some(self.created_at)
        } else {
            None
        }
    }

    /// Deep copy, as required of every in-memory-store read (spec §4.5
    /// "Cloning").
    pub fn deep_clone(&self) -> Self {
        self.clone()
    }
}

/// A single message in a session's (or branch's) transcript (spec §3
/// "Message"). Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub branch_id: Option<String>,
    pub sequence_num: i64,
    pub channel: String,
    pub channel_id: String,
    pub direction: Direction,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<serde_json::Value>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub tool_results: Vec<ToolResult>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        session_id: impl Into<String>,
        channel: impl Into<String>,
        channel_id: impl Into<String>,
        direction: Direction,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            session_id: session_id.into(),
            branch_id: None,
            sequence_num: 0,
            channel: channel.into(),
            channel_id: channel_id.into(),
            direction,
            role,
            content: content.into(),
            attachments: Vec::new(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.metadata
            .get(meta_keys::SYNTHETIC)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn is_important(&self) -> bool {
        let important = self
            .metadata
            .get(meta_keys::IMPORTANT)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let high_priority = self
            .metadata
            .get(meta_keys::PRIORITY)
            .and_then(|v| v.as_str())
            .map(|p| p == "high")
            .unwrap_or(false);
        important || high_priority
    }

    pub fn deep_clone(&self) -> Self {
        self.clone()
    }
}

/// A branch in a session's DAG (spec §3 "Branch").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub session_id: String,
    pub parent_branch_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub branch_point: i64,
    pub status: BranchStatus,
    pub is_primary: bool,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
}

impl Branch {
    pub fn new_primary(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            session_id: session_id.into(),
            parent_branch_id: None,
            name: "main".to_string(),
            description: None,
            branch_point: 0,
            status: BranchStatus::Active,
            is_primary: true,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
            merged_at: None,
        }
    }

    pub fn fork(
        session_id: impl Into<String>,
        parent_branch_id: impl Into<String>,
        branch_point: i64,
        name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            session_id: session_id.into(),
            parent_branch_id: Some(parent_branch_id.into()),
            name: name.into(),
            description: None,
            branch_point,
            status: BranchStatus::Active,
            is_primary: false,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
            merged_at: None,
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.status, BranchStatus::Active)
    }
}

/// An immutable record of a branch merge (spec §3 "BranchMerge record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchMerge {
    pub id: String,
    pub source_branch_id: String,
    pub target_branch_id: String,
    pub strategy: MergeStrategy,
    pub source_sequence_start: i64,
    pub source_sequence_end: Option<i64>,
    pub target_sequence_insert: i64,
    pub message_count: i64,
    #[serde(default)]
    pub metadata: Metadata,
    pub merged_at: DateTime<Utc>,
    pub merged_by: Option<String>,
}

/// A single applied schema migration (spec §3, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaMigration {
    pub id: String,
    pub applied_at: DateTime<Utc>,
}

/// The DB-backed lease lock row (spec §3 "SessionLock").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLock {
    pub session_id: String,
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A branch annotated with its depth from the session's root, used by
/// `GetBranchTree` (spec §4.6 "Tree / Path").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchNode {
    pub branch: Branch,
    pub depth: usize,
}

/// Aggregate counters returned by `BranchStore::stats` (spec §4.6 "Stats").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchStats {
    pub own_count: i64,
    pub child_branch_count: i64,
    pub total_with_inherited: i64,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// The result of `BranchStore::compare` (spec §4.6 "Compare").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchComparison {
    pub source_ahead: i64,
    pub target_ahead: i64,
    pub common_ancestor: Option<String>,
}

/// Options accepted by `SessionStore::list` (spec §4.5 "List").
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub channel: Option<String>,
    pub limit: usize,
    pub offset: usize,
}
