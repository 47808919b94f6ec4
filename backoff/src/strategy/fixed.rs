use std::time::Duration;

/// An endless iterator yielding the same interval. Bound it with [Iterator::take].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    duration: Duration,
}

impl Interval {
    pub fn from_millis(millis: u64) -> Self {
        Self {
            duration: Duration::from_millis(millis),
        }
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self { duration }
    }
}

impl Iterator for Interval {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.duration)
    }
}
