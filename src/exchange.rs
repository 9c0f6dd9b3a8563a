//! Single-slot handoff between frame ingestion and the transmit loop.
//!
//! The writer always blocks for the lock, the reader never does: a busy slot
//! just means the engine keeps sending what it already has. A newer frame
//! overwrites an unadopted older one.

use std::sync::{Mutex, TryLockError};

use crate::error::invariant_violation;
use crate::protocol::Frame;

/// Result of a non-blocking adoption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adoption {
    /// A newer frame was copied into the caller's buffer.
    Adopted,
    /// Nothing new since the last adoption.
    Unchanged,
    /// The writer holds the lock; try again next cycle.
    Busy,
}

#[derive(Default)]
struct PendingSlot {
    frame: Frame,
    dirty: bool,
}

#[derive(Default)]
pub struct FrameExchange {
    slot: Mutex<PendingSlot>,
}

impl FrameExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `frame` as the latest one, replacing anything not yet adopted.
    pub fn publish(&self, frame: &Frame) {
        let mut slot = self.slot.lock().unwrap_or_else(|_| poisoned());
        slot.frame = *frame;
        slot.dirty = true;
    }

    /// Copy the pending frame into `active` if there is one and the lock is
    /// free right now.
    pub fn try_adopt(&self, active: &mut Frame) -> Adoption {
        match self.slot.try_lock() {
            Ok(mut slot) => {
                if !slot.dirty {
                    return Adoption::Unchanged;
                }
                *active = slot.frame;
                slot.dirty = false;
                Adoption::Adopted
            }
            Err(TryLockError::WouldBlock) => Adoption::Busy,
            Err(TryLockError::Poisoned(_)) => poisoned(),
        }
    }

    /// Whether a published frame is waiting to be adopted.
    #[cfg(test)]
    fn has_pending(&self) -> bool {
        self.slot.lock().unwrap_or_else(|_| poisoned()).dirty
    }
}

// A writer panicked mid-copy; the slot may hold a torn frame.
fn poisoned() -> ! {
    invariant_violation("frame exchange lock poisoned")
}
