//! In-memory registry of logical terminal sessions.
//!
//! A session outlives any single WebSocket connection: the client may drop
//! and reconnect with the same id, and the registry only forgets it on an
//! explicit teardown or when the idle sweep removes it.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use crate::models::SessionInfo;

#[derive(Clone, Debug)]
pub struct Session {
    pub id: String,
    pub sandbox_ref: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    /// A streaming connection is attached.
    pub active: bool,
    /// An exec stream holds the session; acts as a mutual-exclusion gate.
    pub exec_locked: bool,
}

impl Session {
    fn touch(&mut self) {
        // last_used_at never moves backwards, even if the wall clock does.
        self.last_used_at = self.last_used_at.max(Utc::now());
    }

    fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_used_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn to_info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            sandbox: self.sandbox_ref.clone(),
            owner: self.owner.clone(),
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            active: self.active,
        }
    }
}

/// A fresh session identifier.
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, owner: &str, sandbox_ref: &str) -> Session {
        self.create_with_id(new_session_id(), owner, sandbox_ref)
    }

    /// Registers a session under an id issued earlier with [`new_session_id`].
    pub fn create_with_id(&self, id: String, owner: &str, sandbox_ref: &str) -> Session {
        let now = Utc::now();
        let session = Session {
            id,
            sandbox_ref: sandbox_ref.to_string(),
            owner: owner.to_string(),
            created_at: now,
            last_used_at: now,
            active: false,
            exec_locked: false,
        };

        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        session
    }

    /// Looks a session up and refreshes its `last_used_at`.
    pub fn get(&self, id: &str) -> Option<Session> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(id)?;
        session.touch();
        Some(session.clone())
    }

    /// Looks a session up without counting it as use.
    pub fn peek(&self, id: &str) -> Option<Session> {
        self.sessions.read().get(id).cloned()
    }

    pub fn delete(&self, id: &str) -> Option<Session> {
        self.sessions.write().remove(id)
    }

    pub fn touch(&self, id: &str) {
        if let Some(session) = self.sessions.write().get_mut(id) {
            session.touch();
        }
    }

    /// Claims the exec gate. Never blocks; returns false when already held
    /// or when the session does not exist.
    pub fn try_lock_exec(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(id) {
            Some(session) if !session.exec_locked => {
                session.exec_locked = true;
                true
            }
            _ => false,
        }
    }

    pub fn unlock_exec(&self, id: &str) {
        if let Some(session) = self.sessions.write().get_mut(id) {
            session.exec_locked = false;
        }
    }

    /// Marking a session inactive also releases its exec gate.
    pub fn set_active(&self, id: &str, active: bool) {
        if let Some(session) = self.sessions.write().get_mut(id) {
            session.active = active;
            if active {
                session.touch();
            } else {
                session.exec_locked = false;
            }
        }
    }

    /// True if any attached session other than `except` is bound to the sandbox.
    pub fn sandbox_in_use(&self, sandbox_ref: &str, except: &str) -> bool {
        self.sessions
            .read()
            .values()
            .any(|s| s.id != except && s.sandbox_ref == sandbox_ref && s.active)
    }

    /// Points a session at a (possibly recreated) sandbox and counts it as use.
    pub fn rebind(&self, id: &str, sandbox_ref: &str) -> Option<Session> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(id)?;
        session.sandbox_ref = sandbox_ref.to_string();
        session.touch();
        Some(session.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Removes inactive sessions idle for longer than `timeout`, but only
    /// those for which `confirm` resolves to true. Rejected entries stay in
    /// place and are retried on the next sweep.
    ///
    /// `confirm` runs without the lock held, so it may perform I/O. Each
    /// candidate is re-checked before removal in case it was reattached
    /// while `confirm` was running.
    pub async fn sweep_idle<F, Fut>(&self, timeout: Duration, mut confirm: F) -> Vec<String>
    where
        F: FnMut(Session) -> Fut,
        Fut: Future<Output = bool>,
    {
        let candidates: Vec<Session> = {
            let now = Utc::now();
            self.sessions
                .read()
                .values()
                .filter(|s| !s.active && s.idle_for(now) > timeout)
                .cloned()
                .collect()
        };

        let mut removed = Vec::new();
        for candidate in candidates {
            let id = candidate.id.clone();
            if !confirm(candidate).await {
                continue;
            }

            let mut sessions = self.sessions.write();
            let still_idle = sessions
                .get(&id)
                .is_some_and(|s| !s.active && s.idle_for(Utc::now()) > timeout);
            if still_idle {
                sessions.remove(&id);
                removed.push(id);
            }
        }

        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn backdate(registry: &SessionRegistry, id: &str, by: chrono::Duration) {
        let mut sessions = registry.sessions.write();
        let session = sessions.get_mut(id).unwrap();
        session.last_used_at = session.last_used_at - by;
    }

    #[test]
    fn create_issues_unique_ids_with_clear_flags() {
        let registry = SessionRegistry::new();
        let a = registry.create("alice", "kubeshell-alice");
        let b = registry.create("alice", "kubeshell-alice");

        assert_ne!(a.id, b.id);
        assert!(!a.active);
        assert!(!a.exec_locked);
        assert_eq!(a.created_at, a.last_used_at);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn get_refreshes_last_used() {
        let registry = SessionRegistry::new();
        let session = registry.create("alice", "kubeshell-alice");
        backdate(&registry, &session.id, chrono::Duration::minutes(5));

        let before = registry.peek(&session.id).unwrap().last_used_at;
        let after = registry.get(&session.id).unwrap().last_used_at;
        assert!(after > before);
    }

    #[test]
    fn missing_sessions_are_not_found() {
        let registry = SessionRegistry::new();
        assert!(registry.get("nope").is_none());
        assert!(!registry.try_lock_exec("nope"));
        assert!(registry.delete("nope").is_none());
        registry.set_active("nope", true);
        registry.unlock_exec("nope");
    }

    #[test]
    fn exec_lock_is_exclusive() {
        let registry = SessionRegistry::new();
        let session = registry.create("alice", "kubeshell-alice");

        assert!(registry.try_lock_exec(&session.id));
        assert!(!registry.try_lock_exec(&session.id));
        registry.unlock_exec(&session.id);
        assert!(registry.try_lock_exec(&session.id));
    }

    #[test]
    fn concurrent_lockers_get_exactly_one_winner() {
        let registry = Arc::new(SessionRegistry::new());
        let session = registry.create("alice", "kubeshell-alice");

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let registry = registry.clone();
                let id = session.id.clone();
                std::thread::spawn(move || registry.try_lock_exec(&id))
            })
            .collect();
        let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|won| **won).count(), 1);
    }

    #[test]
    fn deactivating_releases_exec_lock() {
        let registry = SessionRegistry::new();
        let session = registry.create("alice", "kubeshell-alice");

        registry.set_active(&session.id, true);
        assert!(registry.try_lock_exec(&session.id));
        registry.set_active(&session.id, false);

        let current = registry.peek(&session.id).unwrap();
        assert!(!current.active);
        assert!(!current.exec_locked);
        assert!(registry.try_lock_exec(&session.id));
    }

    #[test]
    fn sandbox_in_use_ignores_inactive_and_self() {
        let registry = SessionRegistry::new();
        let a = registry.create("alice", "kubeshell-alice");
        let b = registry.create("alice", "kubeshell-alice");

        assert!(!registry.sandbox_in_use("kubeshell-alice", &a.id));
        registry.set_active(&b.id, true);
        assert!(registry.sandbox_in_use("kubeshell-alice", &a.id));
        assert!(!registry.sandbox_in_use("kubeshell-alice", &b.id));
    }

    #[tokio::test]
    async fn sweep_removes_only_idle_inactive_sessions() {
        let registry = SessionRegistry::new();
        let idle = registry.create("alice", "kubeshell-alice");
        let active = registry.create("bob", "kubeshell-bob");
        let fresh = registry.create("carol", "kubeshell-carol");

        backdate(&registry, &idle.id, chrono::Duration::hours(2));
        backdate(&registry, &active.id, chrono::Duration::hours(2));
        registry.set_active(&active.id, true);
        // set_active(true) refreshes; push it back again to prove activity alone protects it.
        backdate(&registry, &active.id, chrono::Duration::hours(2));

        let removed = registry
            .sweep_idle(Duration::from_secs(3600), |_| async { true })
            .await;

        assert_eq!(removed, vec![idle.id.clone()]);
        assert!(registry.peek(&idle.id).is_none());
        assert!(registry.peek(&active.id).is_some());
        assert!(registry.peek(&fresh.id).is_some());
    }

    #[tokio::test]
    async fn sweep_keeps_entries_when_confirmation_fails() {
        let registry = SessionRegistry::new();
        let session = registry.create("alice", "kubeshell-alice");
        backdate(&registry, &session.id, chrono::Duration::hours(2));

        let removed = registry
            .sweep_idle(Duration::from_secs(3600), |_| async { false })
            .await;
        assert!(removed.is_empty());
        assert!(registry.peek(&session.id).is_some());

        let removed = registry
            .sweep_idle(Duration::from_secs(3600), |_| async { true })
            .await;
        assert_eq!(removed, vec![session.id]);
    }

    #[tokio::test]
    async fn sweep_spares_sessions_reattached_during_confirmation() {
        let registry = SessionRegistry::new();
        let session = registry.create("alice", "kubeshell-alice");
        backdate(&registry, &session.id, chrono::Duration::hours(2));

        let removed = registry
            .sweep_idle(Duration::from_secs(3600), |candidate| {
                // a client reconnects while the sandbox delete is in flight
                registry.set_active(&candidate.id, true);
                async { true }
            })
            .await;

        assert!(removed.is_empty());
        assert!(registry.peek(&session.id).is_some_and(|s| s.active));
    }

    #[test]
    fn rebind_moves_session_to_new_sandbox() {
        let registry = SessionRegistry::new();
        let session = registry.create("alice", "kubeshell-alice");
        backdate(&registry, &session.id, chrono::Duration::hours(2));

        let rebound = registry.rebind(&session.id, "kubeshell-alice-2").unwrap();
        assert_eq!(rebound.sandbox_ref, "kubeshell-alice-2");
        assert!(rebound.last_used_at >= session.last_used_at);
        assert!(registry.rebind("missing", "kubeshell-x").is_none());
    }
}
