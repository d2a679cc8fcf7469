//! hostconsole Library
//!
//! This library provides the operator web console: a WebSocket endpoint
//! that runs allow-listed diagnostic commands on the host and streams their
//! output back to the operator's browser.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod terminal;
