//! Per-entity hourly and daily quota throttling.
//!
//! Counters and a lock live together in one value per (rule, entity) key of a
//! shared key-value table, so several processes can throttle the same entities
//! through SQLite, Redis or process memory without a separate lock service.

pub mod bucket;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod keys;
pub mod kv;
pub mod middleware;
pub mod policy;
pub mod record;
pub mod response;
pub mod rule;
pub mod server;
pub mod store;
pub mod validation;

pub use config::{ServerConfig, ThrottleConfig};
pub use error::{Result, ThrottlerError};
pub use policy::{QuotaStatus, ThrottlePolicy};
pub use rule::{ApprovalRequest, Rule, RuleSet};
pub use server::create_app;
