//! Session registry with bounded query concurrency

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{Session, SessionKiller};
use crate::backend::{Backend, BackendReply};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::events::{self, LifecycleEvent};
use crate::worker::{self, WorkerHandle};
use crate::{Error, Result};

/// Capacity and timeout settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    /// Maximum number of session handles held at once
    pub max_sessions: usize,
    /// Maximum number of backend queries running at once
    pub max_concurrent_queries: usize,
    /// Upper bound for one backend call
    pub query_timeout: Duration,
    /// Upper bound for waiting on a query slot
    pub queue_timeout: Duration,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            max_concurrent_queries: 3,
            query_timeout: Duration::from_secs(300),
            queue_timeout: Duration::from_secs(60),
        }
    }
}

impl RegistryLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_sessions: config.sessions.max_sessions,
            max_concurrent_queries: config.backend.max_concurrent_queries,
            query_timeout: config.backend.query_timeout(),
            queue_timeout: config.backend.queue_timeout(),
        }
    }
}

/// Owns every in-memory [`Session`].
///
/// Session count and concurrent query execution are bounded separately:
/// the map holds at most `max_sessions` handles, while a semaphore admits at
/// most `max_concurrent_queries` backend calls.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    semaphore: Semaphore,
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    limits: RegistryLimits,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn Backend>, limits: RegistryLimits) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            semaphore: Semaphore::new(limits.max_concurrent_queries),
            backend,
            clock: Arc::new(SystemClock),
            limits,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn limits(&self) -> RegistryLimits {
        self.limits
    }

    /// Return the session for `session_id`, creating it if needed.
    ///
    /// Lookup does not touch `last_used`.
    pub async fn get_or_create(&self, chat_id: &str, session_id: &str) -> Result<Session> {
        if self.semaphore.is_closed() {
            return Err(Error::ShuttingDown);
        }

        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(session_id) {
                return Ok(session.clone());
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(session_id) {
            return Ok(session.clone());
        }

        if sessions.len() >= self.limits.max_sessions {
            events::emit(
                LifecycleEvent::CapacityRejected,
                chat_id,
                format_args!("{} sessions held", sessions.len()),
            );
            return Err(Error::CapacityExceeded(self.limits.max_sessions));
        }

        let session = Session::new(session_id, chat_id, self.clock.now());
        sessions.insert(session_id.to_string(), session.clone());
        events::emit(
            LifecycleEvent::SessionCreated,
            chat_id,
            format_args!("session {} ({}/{})", session_id, sessions.len(), self.limits.max_sessions),
        );
        Ok(session)
    }

    /// Run one backend query for an existing session.
    ///
    /// Waits up to `queue_timeout` for a slot, then up to `query_timeout` for
    /// the backend. The slot is released on every exit path.
    pub async fn execute_query(
        &self,
        session_id: &str,
        query: &str,
        conversation_id: Option<&str>,
    ) -> Result<BackendReply> {
        let chat_id = {
            let sessions = self.sessions.read().await;
            sessions
                .get(session_id)
                .map(|s| s.chat_id.clone())
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?
        };

        let _permit = match timeout(self.limits.queue_timeout, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::ShuttingDown),
            Err(_) => {
                events::emit(
                    LifecycleEvent::CapacityRejected,
                    &chat_id,
                    format_args!("no query slot within {:?}", self.limits.queue_timeout),
                );
                return Err(Error::QueueTimeout(self.limits.queue_timeout));
            }
        };

        debug!(session_id, chat_id = %chat_id, "Query slot acquired");

        let result = match timeout(
            self.limits.query_timeout,
            self.backend.execute(query, conversation_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::QueryTimeout(self.limits.query_timeout)),
        };

        match &result {
            Ok(reply) => {
                let now = self.clock.now();
                if let Some(session) = self.sessions.write().await.get_mut(session_id) {
                    session.last_used = now;
                }
                events::emit(
                    LifecycleEvent::QueryCompleted,
                    &chat_id,
                    format_args!("{} chars, {} tools", reply.text.len(), reply.tools.len()),
                );
            }
            Err(e) => events::emit(LifecycleEvent::QueryFailed, &chat_id, e),
        }

        result
    }

    /// Remove a session.
    pub async fn kill(&self, session_id: &str) -> Result<()> {
        let removed = self.sessions.write().await.remove(session_id);
        match removed {
            Some(session) => {
                events::emit(
                    LifecycleEvent::SessionKilled,
                    &session.chat_id,
                    format_args!("session {}", session_id),
                );
                Ok(())
            }
            None => Err(Error::SessionNotFound(session_id.to_string())),
        }
    }

    /// Remove every session idle for longer than `max_idle`. Returns how many.
    pub async fn sweep_idle(&self, max_idle: Duration) -> usize {
        let max_idle = TimeDelta::from_std(max_idle).unwrap_or(TimeDelta::MAX);
        let now = self.clock.now();

        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|session_id, session| {
            let idle = session.idle_for(now);
            if idle > max_idle {
                events::emit(
                    LifecycleEvent::SessionsSwept,
                    &session.chat_id,
                    format_args!("session {} idle for {}s", session_id, idle.num_seconds()),
                );
                false
            } else {
                true
            }
        });

        let removed = before - sessions.len();
        if removed > 0 {
            info!(removed, remaining = sessions.len(), "Swept idle sessions");
        }
        removed
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Query slots currently free
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Stop admitting queries and drop every session.
    ///
    /// Waits up to `grace` for in-flight queries to give their slots back.
    pub async fn shutdown(&self, grace: Duration) {
        let slots = u32::try_from(self.limits.max_concurrent_queries).unwrap_or(u32::MAX);
        match timeout(grace, self.semaphore.acquire_many(slots)).await {
            Ok(Ok(permits)) => {
                permits.forget();
                debug!("All query slots drained");
            }
            Ok(Err(_)) => debug!("Registry already closed"),
            Err(_) => warn!(?grace, "Queries still running after grace period"),
        }
        self.semaphore.close();

        let mut sessions = self.sessions.write().await;
        let dropped = sessions.len();
        sessions.clear();
        info!(dropped, "Session registry shut down");
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `period`.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, period: Duration, max_idle: Duration) -> WorkerHandle {
        let registry = Arc::clone(self);
        worker::spawn_periodic("idle-sweeper", period, move || {
            let registry = Arc::clone(&registry);
            async move {
                registry.sweep_idle(max_idle).await;
            }
        })
    }
}

#[async_trait]
impl SessionKiller for SessionRegistry {
    async fn kill_session(&self, session_id: &str) -> Result<()> {
        self.kill(session_id).await
    }
}
