//! ark: authenticated push-backup receiver
//!
//! Untrusted hosts push tar archives over an authenticated transport. Every
//! session goes through the dispatcher, lands in a per-client destination
//! under a per-destination lock, and is promoted atomically or quarantined.

pub mod audit;
pub mod broker;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod lock_table;
pub mod net_async;
pub mod protocol;
pub mod protocol_core;
pub mod registry;
pub mod session;
pub mod ssh;
pub mod tar_stream;
pub mod tls;

pub use error::{ArkError, ArkResult, ErrorClass};
