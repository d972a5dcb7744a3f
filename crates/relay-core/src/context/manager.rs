//! Per-chat context resolution

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::events::{self, LifecycleEvent};
use crate::session::SessionKiller;
use crate::storage::{ChatContext, Storage, TransferResult};
use crate::{Error, Result};

type ChatLock = Arc<tokio::sync::Mutex<()>>;

/// How a `/resume` request was satisfied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resumed {
    /// The chat already held the conversation actively
    AlreadyActive(ChatContext),
    /// The chat's own dormant context was reactivated
    Reactivated(ChatContext),
    /// The conversation was moved here from another chat
    Transferred(TransferResult),
}

/// Maps chat identities to their active conversation context.
///
/// Creation for one chat is serialized by a per-chat async mutex so that two
/// concurrent messages never both decide to create a context. Cross-chat
/// operations rely on storage transactions instead.
pub struct ContextManager {
    storage: Arc<Storage>,
    killer: Arc<dyn SessionKiller>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    locks: Mutex<HashMap<String, ChatLock>>,
}

impl ContextManager {
    pub fn new(storage: Arc<Storage>, killer: Arc<dyn SessionKiller>, ttl: Duration) -> Self {
        let clock = storage.clock();
        Self {
            storage,
            killer,
            clock,
            ttl,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn chat_lock(&self, chat_id: &str) -> ChatLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(chat_id.to_string()).or_default())
    }

    /// Return the chat's live context, or start a new epoch.
    pub async fn get_or_create(&self, chat_id: &str, chat_type: &str) -> Result<ChatContext> {
        let lock = self.chat_lock(chat_id);
        let _guard = lock.lock().await;

        let existing = self.storage.get_context(chat_id)?;
        if let Some(ctx) = &existing {
            if ctx.is_live(self.clock.now()) {
                return Ok(ctx.clone());
            }
            self.kill_quietly(&ctx.session_id).await;
        }

        let session_id = Uuid::new_v4().to_string();
        let ctx = self
            .storage
            .create_or_replace_context(chat_id, chat_type, &session_id, self.ttl)?;

        match existing {
            Some(old) => events::emit(
                LifecycleEvent::ContextSuperseded,
                chat_id,
                format_args!("epoch {} replaces {}", ctx.session_id, old.session_id),
            ),
            None => events::emit(
                LifecycleEvent::ContextCreated,
                chat_id,
                format_args!("epoch {}", ctx.session_id),
            ),
        }
        Ok(ctx)
    }

    /// Extend the deadline of the chat's active context.
    pub fn refresh(&self, chat_id: &str) -> Result<()> {
        self.storage.refresh_context(chat_id, self.ttl)?;
        events::emit(
            LifecycleEvent::ContextRefreshed,
            chat_id,
            format_args!("ttl {}s", self.ttl.as_secs()),
        );
        Ok(())
    }

    /// Drop the per-chat lock entry if nobody holds or waits on it.
    pub fn release_lock(&self, chat_id: &str) -> bool {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        match locks.get(chat_id) {
            Some(lock) if Arc::strong_count(lock) == 1 => {
                locks.remove(chat_id);
                debug!(chat_id, "Released chat lock");
                true
            }
            _ => false,
        }
    }

    /// Number of per-chat lock entries currently held
    pub fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Bring a dormant context back.
    ///
    /// Refused when the row is absent or active, or when its conversation is
    /// active in another chat.
    pub async fn reactivate(&self, chat_id: &str) -> Result<ChatContext> {
        let lock = self.chat_lock(chat_id);
        let _guard = lock.lock().await;

        let ctx = self.storage.reactivate_context(chat_id, self.ttl)?;
        events::emit(
            LifecycleEvent::ContextReactivated,
            chat_id,
            format_args!("epoch {}", ctx.session_id),
        );
        Ok(ctx)
    }

    /// Move the conversation held by `source_chat_id` to `target_chat_id`.
    ///
    /// After the transfer commits, the in-memory sessions of the source epoch
    /// and of the target's previous epoch are dropped.
    pub async fn transfer(
        &self,
        source_chat_id: &str,
        target_chat_id: &str,
        target_chat_type: &str,
    ) -> Result<TransferResult> {
        let lock = self.chat_lock(target_chat_id);
        let _guard = lock.lock().await;

        let source = self.storage.get_context(source_chat_id)?;
        let previous_target = self.storage.get_context(target_chat_id)?;

        let new_session_id = Uuid::new_v4().to_string();
        let result = self.storage.transfer_conversation(
            source_chat_id,
            target_chat_id,
            target_chat_type,
            &new_session_id,
            self.ttl,
        )?;

        for stale in source.iter().chain(previous_target.iter()) {
            self.kill_quietly(&stale.session_id).await;
        }

        events::emit(
            LifecycleEvent::ConversationTransferred,
            target_chat_id,
            format_args!(
                "from {} ({} messages, {} tools)",
                source_chat_id, result.messages_transferred, result.tools_transferred
            ),
        );
        Ok(result)
    }

    /// Attach `chat_id` to an existing backend conversation.
    pub async fn resume(
        &self,
        chat_id: &str,
        chat_type: &str,
        conversation_id: &str,
    ) -> Result<Resumed> {
        let owner = self
            .storage
            .find_by_conversation_id(conversation_id)?
            .ok_or_else(|| Error::ContextNotFound(conversation_id.to_string()))?;

        if owner.chat_id != chat_id {
            return self
                .transfer(&owner.chat_id, chat_id, chat_type)
                .await
                .map(Resumed::Transferred);
        }

        if owner.is_active {
            return Ok(Resumed::AlreadyActive(owner));
        }
        self.reactivate(chat_id).await.map(Resumed::Reactivated)
    }

    pub fn active_count(&self) -> Result<usize> {
        self.storage.active_context_count()
    }

    async fn kill_quietly(&self, session_id: &str) {
        match self.killer.kill_session(session_id).await {
            Ok(()) => debug!(session_id, "Killed stale session"),
            Err(Error::SessionNotFound(_)) => {}
            Err(e) => warn!(session_id, "Failed to kill stale session: {}", e),
        }
    }
}
