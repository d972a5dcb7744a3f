//! Background retirement of expired contexts

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::events::{self, LifecycleEvent};
use crate::session::SessionKiller;
use crate::storage::{ChatContext, CleanupKind, CleanupResult, Storage};
use crate::worker::{self, WorkerHandle};
use crate::{Error, Result};

/// Invoked with the chat id after each successful retirement
pub type RetireCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Outcome of one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub found: usize,
    pub retired: usize,
    /// Refreshed or replaced between the scan and the retirement
    pub skipped: usize,
    pub failed: usize,
}

/// Periodically retires contexts whose deadline has passed.
///
/// Retiring drops the in-memory session (tolerating absence), then
/// deactivates the row and appends an audit entry in one transaction, then
/// runs the retire callback.
pub struct ExpiryWorker {
    storage: Arc<Storage>,
    killer: Arc<dyn SessionKiller>,
    interval: Duration,
    on_retired: Option<RetireCallback>,
}

impl ExpiryWorker {
    pub fn new(storage: Arc<Storage>, killer: Arc<dyn SessionKiller>, interval: Duration) -> Self {
        Self {
            storage,
            killer,
            interval,
            on_retired: None,
        }
    }

    pub fn with_retire_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_retired = Some(Arc::new(callback));
        self
    }

    /// Retire every expired active context. One failure does not stop the rest.
    pub async fn tick(&self) -> Result<SweepReport> {
        let expired = self.storage.expired_contexts()?;
        let mut report = SweepReport {
            found: expired.len(),
            ..Default::default()
        };
        if expired.is_empty() {
            return Ok(report);
        }

        info!(count = expired.len(), "Retiring expired contexts");
        for ctx in &expired {
            match self.retire(ctx, CleanupKind::Expired).await {
                Ok(Some(_)) => report.retired += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(chat_id = %ctx.chat_id, "Failed to retire context: {}", e);
                }
            }
        }
        Ok(report)
    }

    /// Retire one chat's context now. `None` when the chat has no context.
    pub async fn manual_retire(&self, chat_id: &str) -> Result<Option<CleanupResult>> {
        match self.storage.get_context(chat_id)? {
            Some(ctx) => self.retire(&ctx, CleanupKind::Manual).await,
            None => Ok(None),
        }
    }

    /// Retire the epoch captured in `ctx`. `None` when the chat has moved on
    /// since `ctx` was read.
    async fn retire(&self, ctx: &ChatContext, kind: CleanupKind) -> Result<Option<CleanupResult>> {
        match self.killer.kill_session(&ctx.session_id).await {
            Ok(()) | Err(Error::SessionNotFound(_)) => {}
            Err(e) => warn!(session_id = %ctx.session_id, "Failed to kill session: {}", e),
        }

        let Some(result) = self
            .storage
            .deactivate_and_audit(&ctx.chat_id, &ctx.session_id, kind)?
        else {
            return Ok(None);
        };

        if let Some(callback) = &self.on_retired {
            callback(&ctx.chat_id);
        }

        events::emit(
            LifecycleEvent::ContextRetired,
            &ctx.chat_id,
            format_args!(
                "{}: epoch {}, {} messages and {} tools preserved",
                kind, ctx.session_id, result.messages_preserved, result.tools_preserved
            ),
        );
        Ok(Some(result))
    }

    /// Run [`tick`](Self::tick) on the configured interval until stopped.
    pub fn start(self: Arc<Self>) -> WorkerHandle {
        let interval = self.interval;
        worker::spawn_periodic("expiry", interval, move || {
            let worker = Arc::clone(&self);
            async move {
                match worker.tick().await {
                    Ok(report) if report.found > 0 => debug!(?report, "Expiry sweep finished"),
                    Ok(_) => {}
                    Err(e) => error!("Expiry sweep failed: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::ScriptedBackend;
    use crate::clock::{Clock, ManualClock};
    use crate::context::ContextManager;
    use crate::session::{RegistryLimits, SessionRegistry};
    use crate::storage::Role;
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use std::sync::Mutex;

    const TTL: Duration = Duration::from_secs(2 * 60 * 60);

    struct Fixture {
        storage: Arc<Storage>,
        registry: Arc<SessionRegistry>,
        manager: Arc<ContextManager>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let storage = Arc::new(Storage::in_memory().unwrap().with_clock(clock.clone()));
        let registry = Arc::new(
            SessionRegistry::new(Arc::new(ScriptedBackend::new()), RegistryLimits::default())
                .with_clock(clock.clone()),
        );
        let manager = Arc::new(ContextManager::new(
            Arc::clone(&storage),
            registry.clone(),
            TTL,
        ));
        Fixture {
            storage,
            registry,
            manager,
            clock,
        }
    }

    fn worker(f: &Fixture) -> ExpiryWorker {
        ExpiryWorker::new(
            Arc::clone(&f.storage),
            f.registry.clone(),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_ttl_scenario() {
        let f = fixture();
        let t0 = f.clock.now();
        let retired = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&retired);
        let worker = worker(&f).with_retire_callback(move |chat_id| {
            seen.lock().unwrap().push(chat_id.to_string());
        });

        let ctx = f.manager.get_or_create("chat-1", "private").await.unwrap();
        f.registry.get_or_create("chat-1", &ctx.session_id).await.unwrap();
        f.storage.save_message("chat-1", &ctx.session_id, Role::User, "hi").unwrap();
        f.storage.save_message("chat-1", &ctx.session_id, Role::Assistant, "hello").unwrap();

        f.clock.advance(TimeDelta::minutes(30));
        f.manager.refresh("chat-1").unwrap();
        let refreshed = f.storage.get_context("chat-1").unwrap().unwrap();
        assert_eq!(refreshed.expires_at, t0 + TimeDelta::minutes(150));

        // Still live one minute before the deadline.
        f.clock.set(t0 + TimeDelta::minutes(149));
        assert_eq!(worker.tick().await.unwrap().found, 0);

        f.clock.set(t0 + TimeDelta::minutes(151));
        let report = worker.tick().await.unwrap();
        assert_eq!(report, SweepReport { found: 1, retired: 1, skipped: 0, failed: 0 });

        let log = f.storage.cleanup_log("chat-1").unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, CleanupKind::Expired);
        assert_eq!(log[0].messages_count, 2);

        assert_eq!(f.storage.count_messages("chat-1", &ctx.session_id).unwrap(), 2);
        assert!(!f.storage.get_context("chat-1").unwrap().unwrap().is_active);
        assert!(f.registry.get(&ctx.session_id).await.is_none());
        assert_eq!(*retired.lock().unwrap(), vec!["chat-1".to_string()]);

        // Nothing left to do on the next pass.
        assert_eq!(worker.tick().await.unwrap().found, 0);
    }

    #[tokio::test]
    async fn test_callback_releases_chat_lock() {
        let f = fixture();
        let manager = Arc::clone(&f.manager);
        let worker = worker(&f).with_retire_callback(move |chat_id| {
            manager.release_lock(chat_id);
        });

        f.manager.get_or_create("chat-1", "private").await.unwrap();
        assert_eq!(f.manager.lock_count(), 1);

        f.clock.advance(TimeDelta::hours(3));
        worker.tick().await.unwrap();
        assert_eq!(f.manager.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_manual_retire() {
        let f = fixture();
        let worker = worker(&f);

        assert!(worker.manual_retire("nobody").await.unwrap().is_none());

        let ctx = f.manager.get_or_create("chat-1", "group").await.unwrap();
        f.storage.save_tool_execution("chat-1", &ctx.session_id, "Bash", "success").unwrap();

        let result = worker.manual_retire("chat-1").await.unwrap().unwrap();
        assert_eq!(result.tools_preserved, 1);
        assert_eq!(f.storage.cleanup_log("chat-1").unwrap()[0].kind, CleanupKind::Manual);

        // Next message starts a fresh epoch.
        let next = f.manager.get_or_create("chat-1", "group").await.unwrap();
        assert_ne!(next.session_id, ctx.session_id);
    }

    struct BrokenKiller;

    #[async_trait]
    impl SessionKiller for BrokenKiller {
        async fn kill_session(&self, _session_id: &str) -> Result<()> {
            Err(Error::Backend("registry unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_kill_failure_does_not_block_retirement() {
        let f = fixture();
        let worker = ExpiryWorker::new(
            Arc::clone(&f.storage),
            Arc::new(BrokenKiller),
            Duration::from_secs(60),
        );

        f.manager.get_or_create("a", "private").await.unwrap();
        f.manager.get_or_create("b", "private").await.unwrap();
        f.clock.advance(TimeDelta::hours(3));

        let report = worker.tick().await.unwrap();
        assert_eq!(report.retired, 2);
        assert_eq!(f.storage.active_context_count().unwrap(), 0);
    }

    /// Delivers a message for `chat-1` while the sweep is between its scan
    /// and the deactivation.
    struct MessageDuringRetire {
        manager: Arc<ContextManager>,
        refresh_only: bool,
    }

    #[async_trait]
    impl SessionKiller for MessageDuringRetire {
        async fn kill_session(&self, _session_id: &str) -> Result<()> {
            if self.refresh_only {
                self.manager.refresh("chat-1")
            } else {
                self.manager.get_or_create("chat-1", "private").await.map(|_| ())
            }
        }
    }

    #[tokio::test]
    async fn test_replaced_epoch_is_not_retired() {
        let f = fixture();
        let retired = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = Arc::clone(&retired);
        let worker = ExpiryWorker::new(
            Arc::clone(&f.storage),
            Arc::new(MessageDuringRetire {
                manager: Arc::clone(&f.manager),
                refresh_only: false,
            }),
            Duration::from_secs(60),
        )
        .with_retire_callback(move |chat_id| seen.lock().unwrap().push(chat_id.to_string()));

        let old = f.manager.get_or_create("chat-1", "private").await.unwrap();
        f.clock.advance(TimeDelta::hours(3));

        let report = worker.tick().await.unwrap();
        assert_eq!(report, SweepReport { found: 1, retired: 0, skipped: 1, failed: 0 });

        let row = f.storage.get_context("chat-1").unwrap().unwrap();
        assert_ne!(row.session_id, old.session_id);
        assert!(row.is_live(f.clock.now()));
        assert!(f.storage.cleanup_log("chat-1").unwrap().is_empty());
        assert!(retired.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refreshed_context_is_not_retired() {
        let f = fixture();
        let worker = ExpiryWorker::new(
            Arc::clone(&f.storage),
            Arc::new(MessageDuringRetire {
                manager: Arc::clone(&f.manager),
                refresh_only: true,
            }),
            Duration::from_secs(60),
        );

        let ctx = f.manager.get_or_create("chat-1", "private").await.unwrap();
        f.storage.set_conversation_id("chat-1", &ctx.session_id, "conv-1").unwrap();
        f.clock.advance(TimeDelta::hours(3));

        let report = worker.tick().await.unwrap();
        assert_eq!(report.skipped, 1);

        let row = f.storage.get_context("chat-1").unwrap().unwrap();
        assert_eq!(row.session_id, ctx.session_id);
        assert_eq!(row.conversation_id.as_deref(), Some("conv-1"));
        assert!(row.is_live(f.clock.now()));
        assert!(f.storage.cleanup_log("chat-1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_started_worker_retires_and_stops() {
        let f = fixture();
        let worker = Arc::new(worker(&f));

        f.manager.get_or_create("chat-1", "private").await.unwrap();
        f.clock.advance(TimeDelta::hours(3));

        let handle = worker.start();
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.stop().await;

        assert_eq!(f.storage.active_context_count().unwrap(), 0);
    }
}
