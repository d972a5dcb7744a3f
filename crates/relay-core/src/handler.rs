//! Inbound message handling
//!
//! Resolves the chat's context, runs the query through the registry and
//! records the turn. Chat commands (`/reset`, `/status`, ...) are handled here
//! too. Transports only deliver [`IncomingMessage`]s and send back the text.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::AccessConfig;
use crate::context::{ContextManager, ExpiryWorker, Resumed};
use crate::session::SessionRegistry;
use crate::storage::{Role, Storage};
use crate::{Error, Result};

const EMPTY_REPLY: &str = "I received your message but have no response to provide.";

const HELP_TEXT: &str = "\
Commands:
  /reset                Start a fresh conversation (history is kept)
  /status               Show this chat's conversation state
  /transfer <chat_id>   Move the conversation of another chat here
  /resume <conv_id>     Continue a conversation by its id
  /help                 Show this help

Anything else is sent to Claude.";

/// A message delivered by a transport
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: String,
    /// e.g. "private", "group"
    pub chat_type: String,
    pub sender_id: String,
    pub text: String,
}

impl IncomingMessage {
    pub fn new(
        chat_id: impl Into<String>,
        chat_type: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            chat_id: chat_id.into(),
            chat_type: chat_type.into(),
            sender_id: sender_id.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Reset,
    Status,
    Transfer(Option<&'a str>),
    Resume(Option<&'a str>),
    Help,
    Unknown(&'a str),
}

impl<'a> Command<'a> {
    fn parse(text: &'a str) -> Option<Self> {
        let text = text.trim();
        if !text.starts_with('/') {
            return None;
        }

        let mut parts = text.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let arg = parts.next();

        Some(match name {
            "/reset" => Command::Reset,
            "/status" => Command::Status,
            "/transfer" => Command::Transfer(arg),
            "/resume" => Command::Resume(arg),
            "/help" | "/start" => Command::Help,
            other => Command::Unknown(other),
        })
    }
}

pub struct MessageHandler {
    storage: Arc<Storage>,
    contexts: Arc<ContextManager>,
    registry: Arc<SessionRegistry>,
    expiry: Arc<ExpiryWorker>,
    access: AccessConfig,
}

impl MessageHandler {
    pub fn new(
        storage: Arc<Storage>,
        contexts: Arc<ContextManager>,
        registry: Arc<SessionRegistry>,
        expiry: Arc<ExpiryWorker>,
        access: AccessConfig,
    ) -> Self {
        Self {
            storage,
            contexts,
            registry,
            expiry,
            access,
        }
    }

    /// Handle one message. `None` means the sender is not allowed and
    /// nothing should be sent back.
    pub async fn handle(&self, msg: &IncomingMessage) -> Option<String> {
        if !self.access.allows(&msg.chat_id, &msg.sender_id) {
            debug!(chat_id = %msg.chat_id, sender_id = %msg.sender_id, "Ignoring message from unlisted chat");
            return None;
        }

        let result = match Command::parse(&msg.text) {
            Some(command) => self.run_command(command, msg).await,
            None => self.run_query(msg).await,
        };

        Some(match result {
            Ok(text) if text.trim().is_empty() => EMPTY_REPLY.to_string(),
            Ok(text) => text,
            Err(e) => {
                warn!(chat_id = %msg.chat_id, "Request failed: {}", e);
                e.user_message()
            }
        })
    }

    fn validate_query(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(Error::InvalidRequest("Query cannot be empty".to_string()));
        }
        let max = self.access.max_query_length;
        if text.chars().count() > max {
            return Err(Error::InvalidRequest(format!(
                "Query too long (max {} characters)",
                max
            )));
        }
        Ok(())
    }

    async fn run_query(&self, msg: &IncomingMessage) -> Result<String> {
        self.validate_query(&msg.text)?;
        let chat_id = msg.chat_id.as_str();

        let ctx = self.contexts.get_or_create(chat_id, &msg.chat_type).await?;
        if let Err(e) = self.contexts.refresh(chat_id) {
            warn!(chat_id, "Failed to refresh context: {}", e);
        }
        if let Err(e) = self
            .storage
            .save_message(chat_id, &ctx.session_id, Role::User, &msg.text)
        {
            warn!(chat_id, "Failed to save user message: {}", e);
        }

        self.registry.get_or_create(chat_id, &ctx.session_id).await?;
        let reply = self
            .registry
            .execute_query(&ctx.session_id, &msg.text, ctx.conversation_id.as_deref())
            .await?;

        if let Some(conversation_id) = &reply.conversation_id {
            if ctx.conversation_id.as_ref() != Some(conversation_id) {
                match self
                    .storage
                    .set_conversation_id(chat_id, &ctx.session_id, conversation_id)
                {
                    Ok(true) => debug!(chat_id, conversation_id = %conversation_id, "Recorded conversation id"),
                    Ok(false) => info!(chat_id, "Epoch changed during query; conversation id not recorded"),
                    Err(e) => warn!(chat_id, "Failed to record conversation id: {}", e),
                }
            }
        }

        if let Err(e) = self
            .storage
            .save_message(chat_id, &ctx.session_id, Role::Assistant, &reply.text)
        {
            warn!(chat_id, "Failed to save assistant message: {}", e);
        }
        for tool in &reply.tools {
            if let Err(e) =
                self.storage
                    .save_tool_execution(chat_id, &ctx.session_id, &tool.name, &tool.status)
            {
                warn!(chat_id, tool = %tool.name, "Failed to save tool execution: {}", e);
            }
        }

        Ok(reply.text)
    }

    async fn run_command(&self, command: Command<'_>, msg: &IncomingMessage) -> Result<String> {
        let chat_id = msg.chat_id.as_str();
        match command {
            Command::Help => Ok(HELP_TEXT.to_string()),
            Command::Unknown(name) => Ok(format!("Unknown command {}. Try /help.", name)),
            Command::Reset => match self.expiry.manual_retire(chat_id).await? {
                Some(result) => Ok(format!(
                    "Conversation reset. {} messages and {} tool runs kept in history.",
                    result.messages_preserved, result.tools_preserved
                )),
                None => Ok("Nothing to reset.".to_string()),
            },
            Command::Status => self.status(chat_id).await,
            Command::Transfer(None) => Err(Error::InvalidRequest(
                "Usage: /transfer <source_chat_id>".to_string(),
            )),
            Command::Transfer(Some(source)) => {
                let result = self.contexts.transfer(source, chat_id, &msg.chat_type).await?;
                let mut text = format!(
                    "Conversation {} moved here from {} ({} messages, {} tool runs).",
                    result.conversation_id,
                    result.source_chat_id,
                    result.messages_transferred,
                    result.tools_transferred
                );
                if result.source_was_active {
                    text.push_str(" The source chat no longer holds it.");
                }
                Ok(text)
            }
            Command::Resume(None) => Err(Error::InvalidRequest(
                "Usage: /resume <conversation_id>".to_string(),
            )),
            Command::Resume(Some(conversation_id)) => {
                match self
                    .contexts
                    .resume(chat_id, &msg.chat_type, conversation_id)
                    .await?
                {
                    Resumed::AlreadyActive(_) => {
                        Ok("This chat is already on that conversation.".to_string())
                    }
                    Resumed::Reactivated(_) => Ok(format!("Resumed conversation {}.", conversation_id)),
                    Resumed::Transferred(result) => Ok(format!(
                        "Resumed conversation {} from {} ({} messages).",
                        conversation_id, result.source_chat_id, result.messages_transferred
                    )),
                }
            }
        }
    }

    async fn status(&self, chat_id: &str) -> Result<String> {
        let Some(ctx) = self.storage.get_context(chat_id)? else {
            return Ok("No conversation yet. Send a message to start one.".to_string());
        };

        let now = self.storage.clock().now();
        let remaining = (ctx.expires_at - now).num_minutes().max(0);
        let messages = self.storage.count_messages(chat_id, &ctx.session_id)?;
        let limits = self.registry.limits();

        Ok(format!(
            "Conversation: {}\nEpoch: {}\nState: {}\nMessages this epoch: {}\nSessions: {}/{}\nFree query slots: {}/{}",
            ctx.conversation_id.as_deref().unwrap_or("(not started)"),
            ctx.session_id,
            if ctx.is_live(now) {
                format!("active, expires in {} min", remaining)
            } else {
                "inactive".to_string()
            },
            messages,
            self.registry.count().await,
            limits.max_sessions,
            self.registry.available_slots(),
            limits.max_concurrent_queries,
        ))
    }
}
