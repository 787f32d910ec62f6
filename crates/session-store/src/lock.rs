//! Write-Lock Manager (C7): serializes writes per session, either via a
//! process-local map or a DB-backed lease (spec §4.7).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use session_domain::config::LeaseLockConfig;
use session_domain::{Result, StoreError};

use crate::store::SessionStore;
use crate::types::{Message, Session};

/// Shared interface over the two write-lock implementations (spec §4.7).
#[async_trait]
pub trait Locker: Send + Sync {
    async fn lock(&self, session_id: &str, cancel: &CancellationToken) -> Result<()>;
    async fn unlock(&self, session_id: &str) -> Result<()>;
    async fn try_lock(&self, session_id: &str) -> Result<bool>;
    async fn is_locked(&self, session_id: &str) -> bool;
}

struct LocalEntry {
    mutex: Arc<AsyncMutex<()>>,
    last_released_at: std::sync::Mutex<Instant>,
}

/// Process-wide map of session-scoped mutexes. Entries idle (unlocked and
/// untouched) for 10 minutes are garbage-collected on a background tick
/// (spec §4.7 "Local").
pub struct LocalLocker {
    entries: DashMap<String, Arc<LocalEntry>>,
    held: DashMap<String, tokio::sync::OwnedMutexGuard<()>>,
    gc_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

const GC_IDLE_THRESHOLD: Duration = Duration::from_secs(600);
const GC_TICK: Duration = Duration::from_secs(60);

impl LocalLocker {
    pub fn new() -> Arc<Self> {
        let locker = Arc::new(Self {
            entries: DashMap::new(),
            held: DashMap::new(),
            gc_handle: std::sync::Mutex::new(None),
        });
        let weak = Arc::downgrade(&locker);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_TICK);
            loop {
                interval.tick().await;
                let Some(locker) = weak.upgrade() else { break };
                locker.gc();
            }
        });
        *locker.gc_handle.lock().unwrap() = Some(handle);
        locker
    }

    fn entry(&self, session_id: &str) -> Arc<LocalEntry> {
        self.entries
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(LocalEntry {
                    mutex: Arc::new(AsyncMutex::new(())),
                    last_released_at: std::sync::Mutex::new(Instant::now()),
                })
            })
            .clone()
    }

    fn gc(&self) {
        let now = Instant::now();
        self.entries.retain(|id, entry| {
            let locked = self.held.contains_key(id);
            if locked {
                return true;
            }
            let idle = now.duration_since(*entry.last_released_at.lock().unwrap());
            idle < GC_IDLE_THRESHOLD
        });
    }
}

impl Drop for LocalLocker {
    fn drop(&mut self) {
        if let Some(handle) = self.gc_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Locker for LocalLocker {
    #[instrument(skip(self, cancel))]
    async fn lock(&self, session_id: &str, cancel: &CancellationToken) -> Result<()> {
        let entry = self.entry(session_id);
        let guard = tokio::select! {
            g = entry.mutex.clone().lock_owned() => g,
            _ = cancel.cancelled() => return Err(StoreError::Cancelled),
        };
        self.held.insert(session_id.to_string(), guard);
        Ok(())
    }

    async fn unlock(&self, session_id: &str) -> Result<()> {
        if let Some((_, _guard)) = self.held.remove(session_id) {
            if let Some(entry) = self.entries.get(session_id) {
                *entry.last_released_at.lock().unwrap() = Instant::now();
            }
        }
        Ok(())
    }

    async fn try_lock(&self, session_id: &str) -> Result<bool> {
        let entry = self.entry(session_id);
        match entry.mutex.clone().try_lock_owned() {
            Ok(guard) => {
                self.held.insert(session_id.to_string(), guard);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn is_locked(&self, session_id: &str) -> bool {
        self.held.contains_key(session_id)
    }
}

/// DB-backed lease lock (spec §4.7 "DB-backed lease"). Each held lock is
/// renewed by a background task every `refresh_interval_secs`; renewal
/// failure (rows affected = 0) means the lock was lost and the task exits.
pub struct DbLeaseLocker {
    db: Arc<std::sync::Mutex<Connection>>,
    owner_id: String,
    cfg: LeaseLockConfig,
    renew_tasks: std::sync::Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl DbLeaseLocker {
    pub fn new(conn: Connection, cfg: LeaseLockConfig) -> Self {
        Self::from_shared(Arc::new(std::sync::Mutex::new(conn)), cfg)
    }

    /// Builds a locker over a connection shared with another locker
    /// instance, e.g. to simulate two processes contending over the same
    /// `session_locks` table in tests.
    pub fn from_shared(db: Arc<std::sync::Mutex<Connection>>, cfg: LeaseLockConfig) -> Self {
        let owner_id = cfg.owner_id.clone().unwrap_or_else(session_domain::new_id);
        Self {
            db,
            owner_id,
            cfg,
            renew_tasks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// One upsert attempt; returns the winning owner id.
    fn try_acquire(&self, session_id: &str) -> Result<String> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now();
        let expires_at = now + chrono::Duration::seconds(self.cfg.ttl_secs as i64);
        let row: Option<String> = db
            .query_row(
                "INSERT INTO session_locks (session_id, owner_id, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_id) DO UPDATE SET
                    owner_id = excluded.owner_id,
                    acquired_at = excluded.acquired_at,
                    expires_at = excluded.expires_at
                 WHERE session_locks.expires_at < ?3 OR session_locks.owner_id = ?2
                 RETURNING owner_id",
                params![session_id, self.owner_id, now, expires_at],
                |r| r.get(0),
            )
            .optional()?;

        match row {
            Some(owner) => Ok(owner),
            // Conflicting owner still holds a live lease: read it back.
            None => {
                let owner: String = db.query_row(
                    "SELECT owner_id FROM session_locks WHERE session_id = ?1",
                    params![session_id],
                    |r| r.get(0),
                )?;
                Ok(owner)
            }
        }
    }

    /// Spawns the background renewal loop for a freshly acquired lock. Only
    /// needs `&self` — every captured value is cloned up front, so the task
    /// doesn't depend on `self` outliving this call.
    fn spawn_renewal(&self, session_id: String) {
        let refresh = Duration::from_secs(self.cfg.refresh_interval_secs);
        let db = self.db.clone();
        let owner_id = self.owner_id.clone();
        let ttl = self.cfg.ttl_secs;
        let task_session_id = session_id.clone();
        let handle = tokio::spawn(async move {
            let session_id = task_session_id;
            loop {
                tokio::time::sleep(refresh).await;
                let db = db.clone();
                let owner = owner_id.clone();
                let sid = session_id.clone();
                let affected = tokio::task::spawn_blocking(move || -> Result<usize> {
                    let conn = db.lock().unwrap();
                    let now = chrono::Utc::now();
                    let expires_at = now + chrono::Duration::seconds(ttl as i64);
                    let n = conn.execute(
                        "UPDATE session_locks SET expires_at = ?1
                         WHERE session_id = ?2 AND owner_id = ?3",
                        params![expires_at, sid, owner],
                    )?;
                    Ok(n)
                })
                .await
                .unwrap_or(Ok(0));

                match affected {
                    Ok(n) if n > 0 => debug!(session_id = %session_id, "lease renewed"),
                    _ => {
                        warn!(session_id = %session_id, "lease renewal failed, lock considered lost");
                        break;
                    }
                }
            }
        });
        self.renew_tasks.lock().unwrap().insert(session_id, handle);
    }

    /// Cancels every renewal task (spec §4.7 "Close").
    pub fn close(&self) {
        let mut tasks = self.renew_tasks.lock().unwrap();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}

impl Drop for DbLeaseLocker {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Locker for DbLeaseLocker {
    #[instrument(skip(self, cancel))]
    async fn lock(&self, session_id: &str, cancel: &CancellationToken) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(self.cfg.acquire_timeout_secs);
        loop {
            let winner = self.try_acquire(session_id)?;
            if winner == self.owner_id {
                info!(session_id = %session_id, owner = %self.owner_id, "lease acquired");
                self.spawn_renewal(session_id.to_string());
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StoreError::LockTimeout { session_id: session_id.to_string() });
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.cfg.poll_interval_ms)) => {}
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
            }
        }
    }

    async fn unlock(&self, session_id: &str) -> Result<()> {
        // Best-effort; TTL is the safety net (spec §4.7 "Unlock").
        let db = self.db.clone();
        let sid = session_id.to_string();
        let owner = self.owner_id.clone();
        let _ = tokio::task::spawn_blocking(move || {
            let conn = db.lock().unwrap();
            conn.execute(
                "DELETE FROM session_locks WHERE session_id = ?1 AND owner_id = ?2",
                params![sid, owner],
            )
        })
        .await;
        if let Some((_, handle)) = self.renew_tasks.lock().unwrap().remove(session_id) {
            handle.abort();
        }
        Ok(())
    }

    async fn try_lock(&self, session_id: &str) -> Result<bool> {
        let winner = self.try_acquire(session_id)?;
        let won = winner == self.owner_id;
        if won {
            self.spawn_renewal(session_id.to_string());
        }
        Ok(won)
    }

    async fn is_locked(&self, session_id: &str) -> bool {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now();
        db.query_row(
            "SELECT 1 FROM session_locks WHERE session_id = ?1 AND expires_at >= ?2",
            params![session_id, now],
            |_| Ok(()),
        )
        .optional()
        .unwrap_or(None)
        .is_some()
    }
}

/// Wraps a [`SessionStore`] so every write acquires the session's write
/// lock before delegating (spec §4.7 "LockingStore").
pub struct LockingStore<L: Locker, S: SessionStore> {
    locker: Arc<L>,
    inner: Arc<S>,
}

impl<L: Locker, S: SessionStore> LockingStore<L, S> {
    pub fn new(locker: Arc<L>, inner: Arc<S>) -> Self {
        Self { locker, inner }
    }

    pub async fn create(&self, session: Session, cancel: &CancellationToken) -> Result<Session> {
        self.locker.lock(&session.id, cancel).await?;
        let result = self.inner.create(session.clone());
        self.locker.unlock(&session.id).await?;
        result
    }

    pub async fn update(&self, session: Session, cancel: &CancellationToken) -> Result<Session> {
        self.locker.lock(&session.id, cancel).await?;
        let result = self.inner.update(session.clone());
        self.locker.unlock(&session.id).await?;
        result
    }

    pub async fn delete(&self, session_id: &str, cancel: &CancellationToken) -> Result<()> {
        self.locker.lock(session_id, cancel).await?;
        let result = self.inner.delete(session_id);
        self.locker.unlock(session_id).await?;
        result
    }

    pub async fn append_message(
        &self,
        session_id: &str,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        self.locker.lock(session_id, cancel).await?;
        let result = self.inner.append_message(session_id, message);
        self.locker.unlock(session_id).await?;
        result
    }

    /// Exposes the lock to callers needing a compound atomic operation
    /// (spec §4.7 "WithLock").
    pub async fn with_lock<F, R>(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(&S) -> Result<R>,
    {
        self.locker.lock(session_id, cancel).await?;
        let result = f(&self.inner);
        self.locker.unlock(session_id).await?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::store::MemorySessionStore;

    #[tokio::test]
    async fn local_locker_serializes_same_session() {
        let locker = LocalLocker::new();
        let cancel = CancellationToken::new();
        locker.lock("s1", &cancel).await.unwrap();
        assert!(!locker.try_lock("s1").await.unwrap());
        locker.unlock("s1").await.unwrap();
        assert!(locker.try_lock("s1").await.unwrap());
    }

    #[tokio::test]
    async fn locking_store_serializes_appends() {
        let locker = LocalLocker::new();
        let store = Arc::new(MemorySessionStore::new());
        let locking = LockingStore::new(locker, store.clone());
        let cancel = CancellationToken::new();

        let session = store.get_or_create("k", "a", "c", "cid").unwrap();
        let m = Message::new(&session.id, "c", "cid", crate::types::Direction::Inbound, crate::types::Role::User, "hi");
        locking.append_message(&session.id, m, &cancel).await.unwrap();
        assert_eq!(store.get_history(&session.id, 0).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn db_lease_locker_second_owner_times_out() {
        let shared = Arc::new(std::sync::Mutex::new(db::open_in_memory().unwrap()));

        let mut cfg = LeaseLockConfig::default();
        cfg.acquire_timeout_secs = 0;
        cfg.poll_interval_ms = 10;
        cfg.owner_id = Some("owner-a".to_string());
        let locker_a = DbLeaseLocker::from_shared(shared.clone(), cfg.clone());

        let cancel = CancellationToken::new();
        locker_a.lock("s1", &cancel).await.unwrap();

        let mut cfg_b = cfg;
        cfg_b.owner_id = Some("owner-b".to_string());
        let locker_b = DbLeaseLocker::from_shared(shared, cfg_b);
        let err = locker_b.lock("s1", &cancel).await.unwrap_err();
        assert_eq!(err.code(), "LOCK_TIMEOUT");
    }
}
