//! diag-echo: a single-threaded TCP echo server with diagnostic logging.
//!
//! Features:
//! - Welcome line with a monotonically increasing client id on connect
//! - Timestamped echo of every read event, no framing
//! - Periodic status report of live connections
//! - Classified socket error logging
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod error;
pub mod protocols;
pub mod runtime;
pub mod status;
