//! Protocol implementations.
//!
//! - `echo`: timestamped line echo with a welcome greeting
//!
//! Protocols here only format and describe bytes; all socket handling lives
//! in the runtime.

pub mod echo;
