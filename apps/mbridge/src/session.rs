// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Session store.
//!
//! A pluggable key-to-session mapping with TTL semantics. The in-process
//! implementation backs the default deployment: a map guarded by a mutex
//! plus a cleaning task that purges idle sessions every few minutes. A
//! cluster deployment would plug a shared cache behind the same trait; when
//! cluster mode is on but no store is configured, the server warns and
//! falls back to in-process sessions.

use crate::config::{ClusterConfig, SessionConfig};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One authenticated session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: i64,
    pub user: String,
    pub created_at: SystemTime,
    pub last_access: SystemTime,
    pub ip_address: Option<String>,
}

/// Pluggable session storage with idle-timeout semantics.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Creates a session and returns it (id is a fresh UUID).
    async fn create(&self, user_id: i64, user: &str, ip_address: Option<String>) -> Session;

    /// Fetches a session, refreshing its last-access time. A session idle
    /// past the timeout is not retrievable.
    async fn get(&self, id: &str) -> Option<Session>;

    async fn remove(&self, id: &str);
}

/// Map-backed store for single-node deployments.
pub struct InProcessSessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    timeout: Duration,
}

impl InProcessSessionStore {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { sessions: Mutex::new(HashMap::new()), timeout }
    }

    fn expired(&self, session: &Session) -> bool {
        session
            .last_access
            .elapsed()
            .map_or(false, |idle| idle >= self.timeout)
    }

    /// Purges idle sessions; returns how many were removed.
    pub fn clean(&self) -> usize {
        let mut sessions = self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, session| {
            session.last_access.elapsed().map_or(true, |idle| idle < self.timeout)
        });
        before - sessions.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawns the periodic cleaning task owned by whichever component
    /// constructed the store.
    pub fn spawn_cleaner(
        self: &Arc<Self>,
        interval: Duration,
        cancellation: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancellation.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                let removed = store.clean();
                if removed > 0 {
                    tracing::debug!(removed, "cleaned expired sessions");
                }
            }
        })
    }
}

#[async_trait]
impl SessionStore for InProcessSessionStore {
    async fn create(&self, user_id: i64, user: &str, ip_address: Option<String>) -> Session {
        let now = SystemTime::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            user_id,
            user: user.to_string(),
            created_at: now,
            last_access: now,
            ip_address,
        };
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(session.id.clone(), session.clone());
        session
    }

    async fn get(&self, id: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let expired = sessions.get(id).map(|session| self.expired(session));
        match expired {
            Some(true) => {
                sessions.remove(id);
                None
            }
            Some(false) => {
                let session = sessions.get_mut(id)?;
                session.last_access = SystemTime::now();
                Some(session.clone())
            }
            None => None,
        }
    }

    async fn remove(&self, id: &str) {
        self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(id);
    }
}

/// Builds the process-wide session store from configuration. Cluster mode
/// without a configured shared store falls back to in-process sessions
/// with a warning: cross-node requests will not share sessions until one
/// is configured.
#[must_use]
pub fn build_session_store(
    cluster: &ClusterConfig,
    session: &SessionConfig,
) -> Arc<InProcessSessionStore> {
    if cluster.enabled && cluster.session_store_url.is_none() {
        tracing::warn!(
            "cluster mode is enabled but no session store is configured; \
             falling back to in-process sessions"
        );
    }
    Arc::new(InProcessSessionStore::new(Duration::from_secs(session.timeout_mins * 60)))
}
