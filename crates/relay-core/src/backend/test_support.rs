//! In-process backend double

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{Backend, BackendReply, extract_tools};
use crate::{Error, Result};

/// Echoes the query back after an optional delay.
///
/// `Tool: <name>` lines in the query come back as tool uses, so callers can
/// script side effects through the query text.
#[derive(Debug, Default)]
pub(crate) struct ScriptedBackend {
    delay: Duration,
    conversation_id: Option<String>,
    fail: bool,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn with_conversation_id(mut self, id: &str) -> Self {
        self.conversation_id = Some(id.to_string());
        self
    }

    pub(crate) fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn execute(&self, query: &str, conversation_id: Option<&str>) -> Result<BackendReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            return Err(Error::Backend("scripted failure".to_string()));
        }

        Ok(BackendReply {
            text: format!("echo: {}", query),
            conversation_id: self
                .conversation_id
                .clone()
                .or_else(|| conversation_id.map(str::to_string)),
            tools: extract_tools(query),
        })
    }
}
