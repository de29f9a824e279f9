//! Steward Core - Per-account automation engine
//!
//! This crate provides the engine behind the steward tool: a resilient
//! session-backed HTTP client, page-state extraction, a proxy pool, the
//! account registry and the cycle scheduler that drives per-account
//! workers.

pub mod account;
pub mod client;
pub mod config;
pub mod cycle;
pub mod extract;
pub mod features;
pub mod proxy;
pub mod session;

#[cfg(test)]
pub(crate) mod testutil;

pub use account::{AccountRecord, AccountRegistry, CyclePhase, RunStatus};
pub use client::{ClientError, GameClient, PageResponse};
pub use config::Settings;
pub use cycle::{BotController, StartOutcome};
pub use extract::{GameState, SecurityStatus};
pub use proxy::{ProxyPool, ProxyRecord, ProxyStatus};
pub use session::{SessionCookie, SessionSnapshot};
