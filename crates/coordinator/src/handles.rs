use std::collections::HashSet;

use dirdelta_protocol::TransferHandle;
use dirdelta_transfer::TransferError;

/// Hands out [`TransferHandle`]s from a single 16-bit space.
///
/// Request and file handles share the space, so a handle identifies
/// exactly one thing while it is in use.
#[derive(Debug, Default)]
pub(crate) struct HandleAllocator {
    next: u16,
    in_use: HashSet<u16>,
}

impl HandleAllocator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the next free handle, wrapping around and skipping handles
    /// still in use.
    pub(crate) fn allocate(&mut self) -> Result<TransferHandle, TransferError> {
        if self.in_use.len() > usize::from(u16::MAX) {
            return Err(TransferError::InvalidRequest(
                "no free transfer handles".into(),
            ));
        }
        loop {
            let candidate = self.next;
            self.next = self.next.wrapping_add(1);
            if self.in_use.insert(candidate) {
                return Ok(TransferHandle(candidate));
            }
        }
    }

    /// Returns `handle` to the pool. Returns `false` if it was not allocated.
    pub(crate) fn release(&mut self, handle: TransferHandle) -> bool {
        self.in_use.remove(&handle.0)
    }

    pub(crate) fn in_use(&self) -> usize {
        self.in_use.len()
    }
}
