//! Echo protocol message formatting.

use chrono::NaiveTime;
use std::fmt::Write;

/// Number of payload bytes shown in hex by [`describe_payload`].
const PREVIEW_BYTES: usize = 64;

/// Greeting sent once to every newly accepted client.
pub fn welcome(client_id: u64) -> Vec<u8> {
    format!("Welcome, client ID: {client_id}\n").into_bytes()
}

/// Build the response line for one echo unit.
///
/// The input is decoded as UTF-8 (invalid sequences become U+FFFD) and
/// trimmed of surrounding whitespace.
pub fn echo_response(input: &[u8], at: NaiveTime) -> Vec<u8> {
    let text = String::from_utf8_lossy(input);
    format!(
        "Received data [{}]: {}\n",
        at.format("%H:%M:%S%.3f"),
        text.trim()
    )
    .into_bytes()
}

/// Human-readable summary of a payload for debug logging.
///
/// Small payloads are shown in full as hex; larger ones show their size and
/// the first 64 bytes.
pub fn describe_payload(data: &[u8]) -> String {
    if data.is_empty() {
        return "(no data)".to_string();
    }

    if data.len() > PREVIEW_BYTES {
        format!(
            "{} bytes (first {}: {})",
            data.len(),
            PREVIEW_BYTES,
            to_hex(&data[..PREVIEW_BYTES])
        )
    } else {
        format!("{} bytes: {}", data.len(), to_hex(data))
    }
}

fn to_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
