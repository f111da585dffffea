//! Client identifier allocation.

use crate::runtime::connection::ClientId;

/// Hands out strictly increasing client ids starting from a seed.
///
/// Ids are never returned to the allocator, so a disconnected client's id is
/// never seen again within the process lifetime.
#[derive(Debug)]
pub struct IdAllocator {
    /// `None` once `u64::MAX` has been handed out.
    next: Option<u64>,
}

impl IdAllocator {
    pub fn new(first: u64) -> Self {
        Self { next: Some(first) }
    }

    /// Allocate the next id.
    ///
    /// Returns `None` once the id space is exhausted rather than wrapping.
    pub fn next_id(&mut self) -> Option<ClientId> {
        let id = self.next?;
        self.next = id.checked_add(1);
        Some(ClientId(id))
    }
}
