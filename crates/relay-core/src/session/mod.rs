//! Session registry
//!
//! Holds the in-memory session handles and bounds concurrent backend queries.

mod registry;
mod types;

pub use registry::{RegistryLimits, SessionRegistry};
pub use types::Session;

use async_trait::async_trait;

use crate::Result;

/// Drop an in-memory session without depending on the registry type.
///
/// The context layer and the expiry worker hold this instead of the registry.
#[async_trait]
pub trait SessionKiller: Send + Sync {
    /// Remove the session. Fails with `SessionNotFound` when absent.
    async fn kill_session(&self, session_id: &str) -> Result<()>;
}
