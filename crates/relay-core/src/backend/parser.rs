//! CLI output parsing

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use super::{BackendReply, ToolUse};
use crate::{Error, Result};

const EMPTY_RESULT: &str = "No response from Claude";

static TOOL_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)Tool:[ \t]*(\S[^\r\n]*?)[ \t]*\r?$").unwrap());

/// Shape of `--output-format json`
#[derive(Debug, Deserialize)]
struct CliOutput {
    #[serde(default)]
    result: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    subtype: Option<String>,
}

/// Turn raw CLI stdout into a reply.
///
/// Output that is not JSON is passed through as the reply text. A JSON
/// payload flagged `is_error` becomes [`Error::Backend`].
pub fn parse_output(raw: &str) -> Result<BackendReply> {
    let trimmed = raw.trim();

    let output: CliOutput = match serde_json::from_str(trimmed) {
        Ok(output) => output,
        Err(e) => {
            warn!("Failed to parse CLI JSON output: {}", e);
            return Ok(BackendReply {
                text: trimmed.to_string(),
                conversation_id: None,
                tools: extract_tools(trimmed),
            });
        }
    };

    if output.is_error {
        let reason = if output.result.is_empty() {
            output.subtype.unwrap_or_else(|| "unknown error".to_string())
        } else {
            output.result
        };
        return Err(Error::Backend(reason));
    }

    let text = if output.result.is_empty() {
        EMPTY_RESULT.to_string()
    } else {
        output.result
    };

    Ok(BackendReply {
        tools: extract_tools(&text),
        text,
        conversation_id: output.session_id.filter(|id| !id.is_empty()),
    })
}

/// Collect `Tool: <name>` lines as successful tool executions.
pub fn extract_tools(text: &str) -> Vec<ToolUse> {
    TOOL_LINE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|name| ToolUse {
            name: name.as_str().to_string(),
            status: "success".to_string(),
        })
        .collect()
}
