//! Frame-based progress reporting.

/// Callback type for percentage updates.
pub type ProgressCallback<'a> = &'a (dyn Fn(u8) + Send + Sync);

/// Turns "frames done" into a monotonic integer percentage.
///
/// While frames are still being written the value is capped at 99, so 100 is
/// only ever reported by [`PercentTracker::complete`].
#[derive(Debug, Clone)]
pub struct PercentTracker {
    total: u64,
    last: Option<u8>,
}

impl PercentTracker {
    /// `total` may be 0 when the frame count is unknown.
    pub fn new(total: u64) -> Self {
        Self { total, last: None }
    }

    /// Record that `done` frames are finished. Returns the new percentage if it changed.
    pub fn advance(&mut self, done: u64) -> Option<u8> {
        let percent = if self.total == 0 {
            0
        } else {
            ((done.saturating_mul(100)) / self.total).min(99) as u8
        };
        self.emit(percent)
    }

    /// Mark the work finished. Returns 100 unless it was already reported.
    pub fn complete(&mut self) -> Option<u8> {
        self.emit(100)
    }

    pub fn last(&self) -> Option<u8> {
        self.last
    }

    fn emit(&mut self, percent: u8) -> Option<u8> {
        match self.last {
            Some(last) if percent <= last => None,
            _ => {
                self.last = Some(percent);
                Some(percent)
            }
        }
    }
}
