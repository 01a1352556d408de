//! Log ingestion and detection pipeline.
//!
//! Events enter through the authenticated collector, travel a durable
//! partitioned bus, and are normalized, deduplicated, enriched, and
//! indexed by the processor. Every processed event is evaluated against
//! the loaded detection rules; matches become alerts that fan out to
//! notification channels and the playbook-driven response engine.
//!
//! ```text
//! client ──▶ collector ──▶ bus(raw_logs) ──▶ processor ──▶ index
//!                                               │
//!                                               ▼
//!                                           detection ──▶ bus(alerts)
//!                                               │
//!                                   ┌───────────┴───────────┐
//!                                   ▼                       ▼
//!                               dispatcher            response engine
//! ```

pub mod auth;
pub mod bus;
pub mod config;
pub mod detection;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod models;
pub mod parsers;
pub mod processor;
pub mod response;
pub mod router;
pub mod state;
pub mod storage;
pub mod util;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes for the service binaries.
pub mod exit_codes {
    /// Clean shutdown.
    pub const OK: i32 = 0;
    /// Fatal configuration error.
    pub const CONFIG: i32 = 1;
    /// Bus or cache unreachable at startup past the retry budget.
    pub const UPSTREAM: i32 = 2;
}
