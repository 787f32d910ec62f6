//! The session & branch store: persistent, concurrency-safe conversational
//! state for a multi-agent chat platform. See each module for its piece of
//! the design — key routing, expiry, transcript repair, compaction,
//! persistence, branching, locking, migration, and scoped composition.

pub mod branch;
pub mod compaction;
pub mod db;
pub mod error;
pub mod expiry;
pub mod jsonl;
pub mod key;
pub mod lock;
pub mod migration;
pub mod scoped;
pub mod store;
pub mod transcript;
pub mod types;

pub use error::{Result, StoreError};

pub use branch::{BranchStore, MemoryBranchStore, SqliteBranchStore};
pub use compaction::{CompactionResult, Summarizer};
pub use jsonl::{export_to_jsonl, import_from_reader, ImportOptions, ImportResult, JsonlRecord};
pub use key::{build_key, normalize_agent_id, parse_key, ParsedKey};
pub use lock::{DbLeaseLocker, LocalLocker, Locker, LockingStore};
pub use migration::{MigrationStatus, Migrator};
pub use scoped::ScopedStore;
pub use store::{MemorySessionStore, SessionStore, SqliteSessionStore};
pub use transcript::{repair_transcript, GuardedSessionStore, RepairReport, ToolCallGuard};
pub use types::{
    Branch, BranchComparison, BranchMerge, BranchNode, BranchStats, BranchStatus, ConvType,
    Direction, ListOptions, Message, MergeStrategy, Role, SchemaMigration, Session, SessionLock,
    ToolCall, ToolResult,
};
