//! Timestamped echo protocol.
//!
//! There is no framing: whatever bytes a single read event delivers form one
//! echo unit, and each unit gets exactly one response line.
//!
//! ## Protocol Format
//!
//! ```text
//! On connect:  Welcome, client ID: <id>\n
//! Request:     <any bytes>
//! Response:    Received data [HH:MM:SS.mmm]: <trimmed UTF-8 input>\n
//!
//! Example:
//! Request:  "  ping\r\n"
//! Response: "Received data [14:03:22.517]: ping\n"
//! ```
//!
//! A message split by the network across two read events is answered with two
//! responses. Clients that need whole-message semantics must frame on their
//! side.

pub mod format;

pub use format::{describe_payload, echo_response, welcome};
