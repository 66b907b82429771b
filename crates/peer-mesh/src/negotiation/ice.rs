use std::collections::VecDeque;

use crate::transport::IceCandidate;

/// Remote candidates that arrived before the transport could accept them.
#[derive(Debug, Default)]
pub struct IceQueue {
    pending: VecDeque<IceCandidate>,
}

impl IceQueue {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Empty the queue in arrival order. Each candidate is handed out once;
    /// what the caller fails to apply is gone.
    pub fn take_all(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }
}
