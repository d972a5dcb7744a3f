//! relay-core: session and context lifecycle engine for cc-relay
//!
//! Chats talk to the Claude Code CLI through isolated conversation contexts.
//! This crate owns the durable chat-to-conversation mapping, the bounded
//! in-memory session registry, background expiry, and conversation transfer.

pub mod backend;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod handler;
pub mod session;
pub mod storage;
pub mod worker;

pub use backend::{Backend, BackendReply, ClaudeCli, ToolUse};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use context::{ContextManager, ExpiryWorker, Resumed, SweepReport};
pub use error::{Error, Result};
pub use handler::{IncomingMessage, MessageHandler};
pub use session::{RegistryLimits, Session, SessionKiller, SessionRegistry};
pub use storage::{ChatContext, CleanupKind, CleanupResult, Storage, TransferResult};
pub use worker::WorkerHandle;
