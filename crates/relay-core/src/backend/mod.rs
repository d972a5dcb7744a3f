//! Backend invoker
//!
//! The registry treats the backend as an opaque, timeout-bounded call.
//! [`ClaudeCli`] runs the Claude Code CLI once per query.

mod cli;
mod parser;
#[cfg(test)]
pub(crate) mod test_support;

pub use cli::ClaudeCli;
pub use parser::{extract_tools, parse_output};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// A tool the backend reported using while answering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUse {
    pub name: String,
    pub status: String,
}

/// Answer to one query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendReply {
    /// Text to show the user
    pub text: String,
    /// Conversation id the backend assigned or continued
    pub conversation_id: Option<String>,
    pub tools: Vec<ToolUse>,
}

impl BackendReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Run one query, continuing `conversation_id` when given.
    async fn execute(&self, query: &str, conversation_id: Option<&str>) -> Result<BackendReply>;
}
