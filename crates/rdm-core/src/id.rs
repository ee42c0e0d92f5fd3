//! Task identifier generation
//!
//! Identifiers are the wall clock in milliseconds multiplied by 100 plus a
//! rolling two digit counter, so up to 100 ids can be handed out within the
//! same millisecond without colliding.

use rdm_types::TaskId;
use std::sync::atomic::{AtomicU32, Ordering};

const COUNTER_SPAN: u32 = 100;

/// Generates unique, roughly time ordered task ids
#[derive(Debug, Default)]
pub struct IdGenerator {
    counter: AtomicU32,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next identifier; always positive
    pub fn next_id(&self) -> TaskId {
        let millis = chrono::Utc::now().timestamp_millis();
        self.compose(millis)
    }

    fn compose(&self, millis: i64) -> TaskId {
        let counter = self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some((c + 1) % COUNTER_SPAN)
            })
            .unwrap_or(0);
        millis.max(0) * COUNTER_SPAN as i64 + counter as i64
    }
}
