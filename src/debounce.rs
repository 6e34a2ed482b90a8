use log::debug;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Quiet period before a buffered edit is released for persistence.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(1200);

/// A pending cell write, keyed so that a later edit to the same cell
/// supersedes the earlier one. Superseding is the only cancellation
/// mechanism; once the quiet period elapses the write goes through.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CellKey {
    pub department_id: u64,
    pub year: i32,
    pub month: u32,
    pub metric_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingEdit {
    pub key: CellKey,
    /// `None` clears the cell.
    pub value: Option<f64>,
}

struct Buffered {
    value: Option<f64>,
    due_at: Instant,
}

/// Buffers rapid cell edits so only the final value in a burst is
/// persisted. Time is passed in by the caller so the buffer is
/// deterministic under test.
pub struct DebounceBuffer {
    quiet_period: Duration,
    pending: BTreeMap<CellKey, Buffered>,
}

impl DebounceBuffer {
    pub fn new() -> Self {
        Self::with_quiet_period(DEFAULT_QUIET_PERIOD)
    }

    pub fn with_quiet_period(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            pending: BTreeMap::new(),
        }
    }

    /// Records an edit, replacing any pending edit for the same cell and
    /// restarting its quiet period.
    pub fn submit(&mut self, key: CellKey, value: Option<f64>, now: Instant) {
        let due_at = now + self.quiet_period;
        if self.pending.insert(key.clone(), Buffered { value, due_at }).is_some() {
            debug!(
                "Superseded pending edit for department {} {}-{:02} {}",
                key.department_id, key.year, key.month, key.metric_key
            );
        }
    }

    /// Releases every edit whose quiet period has elapsed, removing it
    /// from the buffer.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<PendingEdit> {
        let ready: Vec<CellKey> = self
            .pending
            .iter()
            .filter(|(_, buffered)| buffered.due_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        ready
            .into_iter()
            .filter_map(|key| {
                self.pending.remove(&key).map(|buffered| PendingEdit {
                    key,
                    value: buffered.value,
                })
            })
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The next instant at which `drain_ready` would release something.
    pub fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|b| b.due_at).min()
    }
}

impl Default for DebounceBuffer {
    fn default() -> Self {
        Self::new()
    }
}
