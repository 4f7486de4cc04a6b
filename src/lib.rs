//! Coordination core for a persistent multi-agent company.
//!
//! Three coupled subsystems turn stateless LLM calls into durable,
//! goal-directed work: the channel substrate (SQLite-backed chat fabric),
//! the wake-up trigger engine (channel posts → gateway calls), and the
//! task-thread store with its stall watchdog. An in-process typed event
//! bus connects the stores to the trigger engine, the watchdog, and the
//! WebSocket broadcaster that keeps dashboards live.

pub mod api;
pub mod company;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod gateway;
pub mod llm_log;
pub mod trigger;
pub mod watchdog;

pub use config::Config;
pub use db::CompanyDb;
pub use error::{CompanyError, Result};

/// Current wall-clock time as epoch milliseconds.
///
/// All persisted timestamps use this representation; "most recent"
/// comparisons are strict (`>`) with ties broken on id.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
