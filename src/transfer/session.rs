//! Session id generation
//!
//! Ids are time based so that a restarted door does not reuse the ids of its
//! previous incarnation, and strictly increasing within a process even when
//! the wall clock steps backwards.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

use super::types::SessionId;

/// Low bits reserved for ids handed out within the same millisecond
const SEQUENCE_BITS: u32 = 16;

/// Monotonic session id generator.
///
/// One instance is shared (via `Arc`) by every transfer of a door.
#[derive(Debug, Default)]
pub struct SessionIdGenerator {
    last: AtomicU64,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> SessionId {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0) << SEQUENCE_BITS;
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last.wrapping_add(1)))
            })
            .unwrap_or_else(|last| last);
        SessionId(now.max(previous.wrapping_add(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_monotonic() {
        let generator = SessionIdGenerator::new();
        let id1 = generator.next();
        let id2 = generator.next();

        assert_ne!(id1, id2);
        assert!(id2 > id1);
    }

    #[test]
    fn test_unique_across_threads() {
        let generator = Arc::new(SessionIdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || (0..1000).map(|_| generator.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate session id {id}");
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
