//! Branch Store (C6): forks, merges, and the per-session branch DAG
//! (spec §4.6). `GetBranchHistory` inherits ancestor content lazily —
//! forking never copies messages.

pub mod memory;
pub mod sqlite;

use session_domain::Result;

use crate::types::{Branch, BranchComparison, BranchMerge, BranchNode, BranchStats, MergeStrategy, Message};

/// Backend-agnostic interface over a session's branch DAG.
pub trait BranchStore: Send + Sync {
    fn create(&self, branch: Branch) -> Result<Branch>;
    fn get(&self, id: &str) -> Result<Branch>;

    /// No messages are copied; the new branch's history inherits lazily via
    /// ancestor traversal (spec §4.6 "Fork").
    fn fork(&self, parent_id: &str, branch_point: i64, name: &str) -> Result<Branch>;

    /// Sequence numbers are `max(existing_seq_in_branch) + 1` (spec §4.6
    /// "Append to branch"). Rejects merged/archived branches.
    fn append_message(&self, branch_id: &str, message: Message) -> Result<Message>;

    /// Combined ancestor + own history, ordered root-most first (spec §4.6
    /// "GetBranchHistory").
    fn get_branch_history(&self, id: &str, limit: i64) -> Result<Vec<Message>>;

    /// Only the branch's own messages.
    fn get_own_messages(&self, id: &str, limit: i64) -> Result<Vec<Message>>;

    /// Copies `source`'s messages past its `branch_point` into `target`,
    /// marking `source` as merged (spec §4.6 "Merge").
    fn merge(&self, source_id: &str, target_id: &str, strategy: MergeStrategy) -> Result<BranchMerge>;

    /// The primary branch cannot be archived.
    fn archive(&self, id: &str) -> Result<()>;

    /// The primary branch cannot be deleted.
    fn delete(&self, id: &str, delete_messages: bool) -> Result<()>;

    /// Full hierarchy rooted at the session's root branch, root-first.
    fn get_branch_tree(&self, session_id: &str) -> Result<Vec<BranchNode>>;

    /// Walk to root, root-first.
    fn get_full_branch_path(&self, id: &str) -> Result<Vec<Branch>>;

    fn compare(&self, source_id: &str, target_id: &str) -> Result<BranchComparison>;

    fn stats(&self, id: &str) -> Result<BranchStats>;

    /// Creates a primary branch for the session if none exists yet.
    fn ensure_primary_branch(&self, session_id: &str) -> Result<Branch>;

    /// Attaches pre-branch orphan messages to the primary branch, numbering
    /// them chronologically (spec §4.6 "EnsurePrimaryBranch").
    fn migrate_session_to_branches(&self, session_id: &str, orphan_messages: Vec<Message>) -> Result<Branch>;
}

pub use memory::MemoryBranchStore;
pub use sqlite::SqliteBranchStore;
