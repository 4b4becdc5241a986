//! Schedule entries: where a thread was running and when.

use crate::id::{CpuId, ThreadId};
use serde::{Deserialize, Serialize};

/// One observation of a thread on a cpu
///
/// Produced on every cpu-id marker. The tuple is compared field-for-field
/// against the canonical schedule files, so field order and width are fixed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Thread observed
    pub thread: ThreadId,
    /// Most recent timestamp marker value at the time of observation
    pub timestamp: u64,
    /// Cpu the thread was on
    pub cpu: CpuId,
    /// Instructions the thread had executed so far
    pub instr_count: u64,
}

impl ScheduleEntry {
    /// Create a new schedule entry
    #[must_use]
    pub const fn new(thread: ThreadId, timestamp: u64, cpu: CpuId, instr_count: u64) -> Self {
        Self {
            thread,
            timestamp,
            cpu,
            instr_count,
        }
    }
}

impl std::fmt::Display for ScheduleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{{} @{} on {} after {} instrs}}",
            self.thread, self.timestamp, self.cpu, self.instr_count
        )
    }
}

/// Sort entries by timestamp, keeping the relative order of ties
pub fn sort_by_timestamp(entries: &mut [ScheduleEntry]) {
    entries.sort_by_key(|e| e.timestamp);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(tid: u64, ts: u64, cpu: u64, count: u64) -> ScheduleEntry {
        ScheduleEntry::new(ThreadId::new(tid), ts, CpuId::new(cpu), count)
    }

    #[test]
    fn test_display() {
        let e = entry(4, 100, 2, 9);
        assert_eq!(e.to_string(), "{T4 @100 on cpu2 after 9 instrs}");
    }

    #[test]
    fn test_sort_is_stable_on_ties() {
        let mut entries = vec![entry(1, 50, 0, 0), entry(2, 10, 0, 0), entry(3, 50, 1, 0)];
        sort_by_timestamp(&mut entries);
        let tids: Vec<u64> = entries.iter().map(|e| e.thread.as_u64()).collect();
        assert_eq!(tids, vec![2, 1, 3]);
    }

    proptest! {
        #[test]
        fn prop_sorted_timestamps_non_decreasing(
            ts in proptest::collection::vec(any::<u64>(), 0..64)
        ) {
            let mut entries: Vec<_> = ts.iter().map(|t| entry(1, *t, 0, 0)).collect();
            sort_by_timestamp(&mut entries);
            prop_assert!(entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        }
    }
}
