//! Single-threaded readiness-based runtime.
//!
//! One mio poll loop (epoll on Linux, kqueue on macOS) owns the listener and
//! every client connection. Readiness is translated into [`ServerEvent`]s that
//! are dispatched one at a time on the loop thread, so connection state needs
//! no locking.
//!
//! - `ConnectionRegistry`: owns live connections, keyed by poll token and id
//! - `IdAllocator`: monotonic client ids
//! - `Server`: listener, event loop, and handlers

mod connection;
mod event_loop;
mod ids;

pub use connection::{ClientId, ConnState, Connection, ConnectionRegistry, ReadEnd};
pub use event_loop::{Server, ServerEvent, ShutdownHandle};
pub use ids::IdAllocator;
