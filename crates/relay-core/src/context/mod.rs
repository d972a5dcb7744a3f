//! Context lifecycle: per-chat resolution and background expiry

mod expiry;
mod manager;

pub use expiry::{ExpiryWorker, RetireCallback, SweepReport};
pub use manager::{ContextManager, Resumed};
