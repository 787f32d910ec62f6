//! Scoped Store (C9): composes the key router (C1), expiry policy (C2),
//! and session store (C5) into a single `GetOrCreateScoped` entry point
//! (spec §4.1, §4.2, §5 "Ordering guarantees").

use std::sync::Mutex as StdMutex;

use session_domain::config::ScopeConfig;
use session_domain::Result;

use crate::expiry::should_reset;
use crate::key::build_key;
use crate::store::SessionStore;
use crate::types::{ConvType, Session};

/// Wraps a [`SessionStore`] with the key-building and expiry-checking
/// steps a raw store doesn't know about. Holds a process-local mutex
/// across the check-expiry / delete-if-expired / get-or-create sequence
/// so the three steps form one critical section (spec §5).
pub struct ScopedStore<S: SessionStore> {
    inner: S,
    scope: ScopeConfig,
    critical_section: StdMutex<()>,
}

impl<S: SessionStore> ScopedStore<S> {
    pub fn new(inner: S, scope: ScopeConfig) -> Self {
        Self { inner, scope, critical_section: StdMutex::new(()) }
    }

    /// Builds the session key from the inbound-message parameters, resets
    /// the session if its expiry policy says it's due, then atomically
    /// gets or creates the (possibly fresh) session.
    pub fn get_or_create_scoped(
        &self,
        agent_id: &str,
        channel: &str,
        peer_id: &str,
        is_group: bool,
        thread_id: Option<&str>,
        conv_type: ConvType,
    ) -> Result<Session> {
        let key = build_key(&self.scope, agent_id, channel, peer_id, is_group, thread_id);

        let _guard = self.critical_section.lock().unwrap();

        if let Ok(existing) = self.inner.get_by_key(&key) {
            let now = chrono::Utc::now();
            if should_reset(&self.scope, channel, conv_type, existing.created_at, existing.updated_at, now) {
                self.inner.delete(&existing.id)?;
            }
        }

        self.inner.get_or_create(&key, agent_id, channel, peer_id)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;
    use session_domain::config::{ResetConfig, ResetMode};

    fn scope_with_idle_reset(minutes: i64) -> ScopeConfig {
        ScopeConfig {
            reset: ResetConfig { mode: ResetMode::Idle, at_hour: 0, idle_minutes: minutes },
            ..Default::default()
        }
    }

    #[test]
    fn returns_same_session_when_not_expired() {
        let store = ScopedStore::new(MemorySessionStore::new(), scope_with_idle_reset(60));
        let a = store
            .get_or_create_scoped("agent1", "slack", "U1", false, None, ConvType::Dm)
            .unwrap();
        let b = store
            .get_or_create_scoped("agent1", "slack", "U1", false, None, ConvType::Dm)
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn never_mode_never_resets_even_when_idle() {
        let store = ScopedStore::new(MemorySessionStore::new(), ScopeConfig::default());
        let a = store
            .get_or_create_scoped("agent1", "slack", "U1", false, None, ConvType::Dm)
            .unwrap();
        let b = store
            .get_or_create_scoped("agent1", "slack", "U1", false, None, ConvType::Dm)
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn distinct_keys_yield_distinct_sessions() {
        let store = ScopedStore::new(MemorySessionStore::new(), ScopeConfig::default());
        let a = store
            .get_or_create_scoped("agent1", "slack", "U1", false, None, ConvType::Dm)
            .unwrap();
        let b = store
            .get_or_create_scoped("agent1", "slack", "U2", false, None, ConvType::Dm)
            .unwrap();
        assert_ne!(a.id, b.id);
    }
}
