//! Claude Code CLI backend

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{Backend, BackendReply, parse_output};
use crate::config::BackendConfig;
use crate::{Error, Result};

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawns `claude -p` once per query.
///
/// The child is started with `kill_on_drop`, so a caller that gives up on the
/// future (query timeout) also abandons the process.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    cli_path: PathBuf,
    project_path: PathBuf,
    model: Option<String>,
}

impl ClaudeCli {
    pub fn new(cli_path: impl Into<PathBuf>, project_path: impl Into<PathBuf>) -> Self {
        Self {
            cli_path: cli_path.into(),
            project_path: project_path.into(),
            model: None,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            cli_path: config.cli_path.clone(),
            project_path: config.project_path.clone(),
            model: config.model.clone(),
        }
    }

    /// Argument list for one query
    fn args(&self, query: &str, conversation_id: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        if let Some(id) = conversation_id {
            args.push("--resume".to_string());
            args.push(id.to_string());
        }
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.push(query.to_string());
        args
    }

    /// Check the executable exists, is runnable and answers `--version`.
    pub async fn validate(&self) -> Result<String> {
        let meta = tokio::fs::metadata(&self.cli_path).await.map_err(|e| {
            Error::Config(format!(
                "Claude CLI not found at {}: {}",
                self.cli_path.display(),
                e
            ))
        })?;

        if meta.is_dir() {
            return Err(Error::Config(format!(
                "Claude CLI path is a directory: {}",
                self.cli_path.display()
            )));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if meta.permissions().mode() & 0o111 == 0 {
                return Err(Error::Config(format!(
                    "Claude CLI is not executable: {}",
                    self.cli_path.display()
                )));
            }
        }

        let output = timeout(
            VERSION_CHECK_TIMEOUT,
            Command::new(&self.cli_path)
                .arg("--version")
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Backend("--version did not answer within 5s".to_string()))??;

        if !output.status.success() {
            return Err(Error::Backend(format!(
                "--version failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if version.is_empty() {
            version = String::from_utf8_lossy(&output.stderr).trim().to_string();
        }

        info!(path = %self.cli_path.display(), version = %version, "Claude CLI validated");
        Ok(version)
    }
}

#[async_trait]
impl Backend for ClaudeCli {
    async fn execute(&self, query: &str, conversation_id: Option<&str>) -> Result<BackendReply> {
        debug!(
            resume = conversation_id.is_some(),
            query_len = query.len(),
            "Running Claude CLI"
        );

        let output = Command::new(&self.cli_path)
            .args(self.args(query, conversation_id))
            .current_dir(&self.project_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Backend(format!("Failed to spawn Claude CLI: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Backend(format!(
                "Claude CLI exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(output = %stdout, "Claude CLI raw output");
        parse_output(&stdout)
    }
}
