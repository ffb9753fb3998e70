//! Kernel event queue (kqueue)

use crate::objects::ObjectOps;
use ob_core::Errno;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// One triggered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEvent {
    pub ident: u64,
    pub filter: i16,
    pub data: i64,
    pub user_data: u64,
}

#[derive(Debug, Default)]
pub struct Queue {
    pending: Mutex<VecDeque<QueueEvent>>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self, event: QueueEvent) {
        self.pending.lock().push_back(event);
    }

    /// Take up to `max` events in trigger order.
    pub fn drain(&self, max: usize) -> Vec<QueueEvent> {
        let mut pending = self.pending.lock();
        let count = max.min(pending.len());
        pending.drain(..count).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectOps for Queue {}
