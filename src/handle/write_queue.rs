//! Per-handle FIFO of outstanding writes.
//!
//! Natives complete writes in the order they were submitted, so a completion
//! always belongs to the oldest pending entry. The sequence number carried by
//! a native ack is only used for diagnostics.

use std::collections::VecDeque;

use super::completion::{Completion, Status};

pub(crate) struct PendingWrite {
    pub seq: u64,
    pub len: usize,
    pub completion: Completion<Status>,
}

#[derive(Default)]
pub(crate) struct WriteQueue {
    next_seq: u64,
    pending: VecDeque<PendingWrite>,
    queued_bytes: usize,
}

impl WriteQueue {
    /// Appends a write and returns its sequence number.
    pub fn push(&mut self, len: usize, completion: Completion<Status>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queued_bytes += len;
        self.pending.push_back(PendingWrite {
            seq,
            len,
            completion,
        });
        seq
    }

    pub fn pop_oldest(&mut self) -> Option<PendingWrite> {
        let write = self.pending.pop_front()?;
        self.queued_bytes -= write.len;
        Some(write)
    }

    /// Takes back the write just pushed, if the native refused it.
    pub fn remove_newest(&mut self, seq: u64) -> Option<PendingWrite> {
        if self.pending.back().map(|w| w.seq) != Some(seq) {
            return None;
        }
        let write = self.pending.pop_back()?;
        self.queued_bytes -= write.len;
        Some(write)
    }

    /// Empties the queue in submission order.
    pub fn drain_all(&mut self) -> Vec<PendingWrite> {
        self.queued_bytes = 0;
        self.pending.drain(..).collect()
    }

    /// Sum of payload sizes not yet completed.
    pub fn size(&self) -> usize {
        self.queued_bytes
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
