//! cc-relay: chat relay for the Claude Code CLI
//!
//! Usage:
//!   cc-relay                   - Start the interactive console
//!   cc-relay --execute <text>  - Send one message and exit
//!   cc-relay --check           - Validate configuration and the Claude CLI
//!   cc-relay --help            - Show help

mod cli;

use std::sync::Arc;
use std::time::Duration;

use relay_core::{
    ClaudeCli, Config, ContextManager, ExpiryWorker, MessageHandler, RegistryLimits,
    SessionRegistry, Storage,
};
use tracing_subscriber::EnvFilter;

const DEFAULT_CHAT_ID: &str = "console";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Run mode
#[derive(Debug, PartialEq, Eq)]
enum RunMode {
    /// Interactive console as the given chat
    Repl { chat_id: String },
    /// Send one message and print the reply
    Execute { chat_id: String, text: String },
    /// Validate configuration and the Claude CLI
    Check,
    Help,
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = match parse_args(&args) {
        Ok(mode) => mode,
        Err(message) => {
            eprintln!("{}\n", message);
            print_help();
            std::process::exit(2);
        }
    };

    match mode {
        RunMode::Help => {
            print_help();
            return Ok(());
        }
        RunMode::Version => {
            println!("cc-relay {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    dotenvy::dotenv().ok();

    let config = Config::load().map_err(|e| anyhow::anyhow!("Config error: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Config error: {}", e))?;

    match mode {
        RunMode::Check => run_check(&config).await,
        RunMode::Repl { chat_id } => run_relay(config, chat_id, None).await,
        RunMode::Execute { chat_id, text } => run_relay(config, chat_id, Some(text)).await,
        _ => Ok(()),
    }
}

/// Parse command line arguments
fn parse_args(args: &[String]) -> Result<RunMode, String> {
    let mut chat_id = DEFAULT_CHAT_ID.to_string();
    let mut execute = None;
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(RunMode::Help),
            "--version" | "-v" => return Ok(RunMode::Version),
            "--check" => return Ok(RunMode::Check),
            "--chat" => {
                chat_id = iter
                    .next()
                    .ok_or_else(|| "--chat requires a chat id".to_string())?
                    .clone();
            }
            "--execute" | "-e" => {
                execute = Some(
                    iter.next()
                        .ok_or_else(|| "--execute requires a message".to_string())?
                        .clone(),
                );
            }
            other => return Err(format!("Unknown argument: {}", other)),
        }
    }

    Ok(match execute {
        Some(text) => RunMode::Execute { chat_id, text },
        None => RunMode::Repl { chat_id },
    })
}

/// Print help message
fn print_help() {
    println!("cc-relay - chat relay for the Claude Code CLI");
    println!();
    println!("Usage:");
    println!("  cc-relay                   Start the interactive console");
    println!("  cc-relay --chat <id>       Start the console as chat <id>");
    println!("  cc-relay --execute <text>  Send one message and exit");
    println!("  cc-relay --check           Validate configuration and the Claude CLI");
    println!("  cc-relay --help            Show this help message");
    println!("  cc-relay --version         Show version");
    println!();
    println!("Configuration is read from cc-relay.toml when present.");
    println!();
    println!("Environment Variables:");
    println!("  CLAUDE_CLI_PATH          Claude CLI binary (default: claude)");
    println!("  CLAUDE_PROJECT_PATH      Working directory for queries (default: .)");
    println!("  CLAUDE_MODEL             Model passed to the CLI");
    println!("  RELAY_DB_PATH            SQLite database (default: data/cc-relay.db)");
    println!("  QUERY_TIMEOUT_SECS       Per-query timeout (default: 300)");
    println!("  MAX_CONCURRENT_QUERIES   Parallel CLI invocations (default: 3)");
    println!("  MAX_SESSIONS             Live session cap (default: 10)");
    println!("  CONTEXT_TTL_SECS         Conversation inactivity TTL (default: 7200)");
    println!("  CLEANUP_INTERVAL_SECS    Expiry sweep period (default: 300)");
    println!("  ALLOWED_CHAT_IDS         Comma-separated allow list");
    println!("  RUST_LOG                 Log filter");
}

async fn run_check(config: &Config) -> anyhow::Result<()> {
    println!("{}", config);
    let version = ClaudeCli::from_config(&config.backend)
        .validate()
        .await
        .map_err(|e| anyhow::anyhow!("Claude CLI check failed: {}", e))?;
    println!("Claude CLI OK: {}", version);
    Ok(())
}

/// Wire the lifecycle engine, run the console, then shut everything down.
async fn run_relay(config: Config, chat_id: String, execute: Option<String>) -> anyhow::Result<()> {
    tracing::info!("Starting cc-relay...");

    let storage = Arc::new(
        Storage::open(&config.storage.db_path)
            .map_err(|e| anyhow::anyhow!("Failed to open database: {}", e))?,
    );

    let backend = Arc::new(ClaudeCli::from_config(&config.backend));
    let registry = Arc::new(SessionRegistry::new(backend, RegistryLimits::from_config(&config)));

    let contexts = Arc::new(ContextManager::new(
        Arc::clone(&storage),
        registry.clone(),
        config.context.ttl(),
    ));

    let lock_owner = Arc::clone(&contexts);
    let expiry = Arc::new(
        ExpiryWorker::new(
            Arc::clone(&storage),
            registry.clone(),
            config.context.cleanup_interval(),
        )
        .with_retire_callback(move |chat_id| {
            lock_owner.release_lock(chat_id);
        }),
    );

    let expiry_handle = Arc::clone(&expiry).start();
    let sweeper_handle =
        registry.spawn_idle_sweeper(config.sessions.sweep_interval(), config.sessions.idle_timeout());

    let handler = Arc::new(MessageHandler::new(
        storage,
        contexts,
        Arc::clone(&registry),
        expiry,
        config.access.clone(),
    ));

    tracing::info!(
        "cc-relay initialized (max sessions {}, context TTL {}s)",
        config.sessions.max_sessions,
        config.context.ttl_secs
    );

    let result = match execute {
        Some(text) => {
            cli::send(&handler, &chat_id, &text).await;
            Ok(())
        }
        None => cli::run_repl(handler, chat_id).await,
    };

    tracing::info!("Shutting down...");
    expiry_handle.stop().await;
    sweeper_handle.stop().await;
    registry.shutdown(SHUTDOWN_GRACE).await;
    tracing::info!("Shutdown complete");

    result
}
