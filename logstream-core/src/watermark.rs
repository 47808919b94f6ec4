//! A [Watermark] is a point in time packed into a single `u64` so that it can travel inside a
//! [crate::record::Record] and be compared with plain integer comparison:
//!
//! ```text
//! |63 ....... 17|16 ....... 1|    0    |
//! |  timestamp  |  sequence   |completed|
//! ```
//!
//! For the same timestamp and sequence the completed watermark is greater than the pending one,
//! `completed_of(w) == w + 1`.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::Error;
use crate::Result;

pub mod interval;

pub use interval::WatermarkInterval;

const TIMESTAMP_SHIFT: u32 = 17;
const SEQUENCE_SHIFT: u32 = 1;
const SEQUENCE_MASK: u64 = 0xFFFF;
const COMPLETED_BIT: u64 = 1;
/// Largest timestamp that still fits in the packed value.
const MAX_TIMESTAMP: i64 = (u64::MAX >> TIMESTAMP_SHIFT) as i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Watermark {
    value: u64,
}

impl Watermark {
    pub const LOWEST: Watermark = Watermark { value: 0 };

    pub fn of_value(value: u64) -> Self {
        Self { value }
    }

    pub fn of_timestamp(timestamp: i64) -> Result<Self> {
        Self::of_timestamp_seq(timestamp, 0)
    }

    pub fn of_timestamp_seq(timestamp: i64, sequence: u16) -> Result<Self> {
        Self::encode(timestamp, sequence, false)
    }

    pub fn of_now() -> Self {
        let now = Utc::now().timestamp_millis().clamp(0, MAX_TIMESTAMP);
        Self {
            value: (now as u64) << TIMESTAMP_SHIFT,
        }
    }

    pub fn completed_of(watermark: Watermark) -> Self {
        Self {
            value: watermark.value | COMPLETED_BIT,
        }
    }

    fn encode(timestamp: i64, sequence: u16, completed: bool) -> Result<Self> {
        if !(0..=MAX_TIMESTAMP).contains(&timestamp) {
            return Err(Error::Watermark(format!(
                "invalid timestamp {timestamp}, expecting 0..={MAX_TIMESTAMP}"
            )));
        }
        let value = (timestamp as u64) << TIMESTAMP_SHIFT
            | (u64::from(sequence) & SEQUENCE_MASK) << SEQUENCE_SHIFT
            | u64::from(completed);
        Ok(Self { value })
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Milliseconds since epoch.
    pub fn timestamp(&self) -> i64 {
        (self.value >> TIMESTAMP_SHIFT) as i64
    }

    pub fn sequence(&self) -> u16 {
        ((self.value >> SEQUENCE_SHIFT) & SEQUENCE_MASK) as u16
    }

    pub fn is_completed(&self) -> bool {
        self.value & COMPLETED_BIT == COMPLETED_BIT
    }

    /// True when everything up to `timestamp` has been processed, i.e. a fresh watermark for
    /// `timestamp` is lower than this one.
    pub fn is_done(&self, timestamp: i64) -> bool {
        Self::of_timestamp(timestamp).map_or(timestamp < 0, |w| w < *self)
    }
}

impl From<Watermark> for u64 {
    fn from(watermark: Watermark) -> Self {
        watermark.value
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let date = DateTime::<Utc>::from_timestamp_millis(self.timestamp())
            .map(|d| d.to_rfc3339())
            .unwrap_or_default();
        write!(
            f,
            "Watermark{{completed={}, value={}, timestamp={}, sequence={}, date={}}}",
            self.is_completed(),
            self.value,
            self.timestamp(),
            self.sequence(),
            date
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packing() {
        let wm = Watermark::of_timestamp_seq(1_500_000_000_000, 12).unwrap();
        assert_eq!(wm.timestamp(), 1_500_000_000_000);
        assert_eq!(wm.sequence(), 12);
        assert!(!wm.is_completed());
        assert_eq!(Watermark::of_value(wm.value()), wm);

        let completed = Watermark::completed_of(wm);
        assert!(completed.is_completed());
        assert_eq!(completed.value(), wm.value() + 1);
        assert_eq!(completed.timestamp(), wm.timestamp());
        assert_eq!(completed.sequence(), wm.sequence());
        // completing twice is a no-op
        assert_eq!(Watermark::completed_of(completed), completed);
    }

    #[test]
    fn test_ordering_follows_timestamp_then_sequence() {
        let mut previous = Watermark::LOWEST;
        for ts in [0_i64, 1, 2, 1_000, 1_700_000_000_000] {
            for seq in [0_u16, 1, 2, u16::MAX] {
                let wm = Watermark::of_timestamp_seq(ts, seq).unwrap();
                if ts != 0 || seq != 0 {
                    assert!(wm > previous, "{wm} should be after {previous}");
                }
                assert!(Watermark::completed_of(wm) > wm);
                previous = Watermark::completed_of(wm);
            }
        }
    }

    #[test]
    fn test_invalid_timestamp() {
        assert!(matches!(
            Watermark::of_timestamp(-1),
            Err(Error::Watermark(_))
        ));
        assert!(Watermark::of_timestamp(MAX_TIMESTAMP).is_ok());
        assert!(Watermark::of_timestamp(MAX_TIMESTAMP + 1).is_err());
    }

    #[test]
    fn test_is_done() {
        let wm = Watermark::of_timestamp(1000).unwrap();
        assert!(wm.is_done(999));
        assert!(!wm.is_done(1000));
        assert!(!wm.is_done(1001));
        assert!(Watermark::completed_of(wm).is_done(1000));
        assert!(Watermark::LOWEST.is_done(-5));
        assert!(!Watermark::LOWEST.is_done(0));
    }

    #[test]
    fn test_of_now() {
        let before = Utc::now().timestamp_millis();
        let wm = Watermark::of_now();
        assert!(wm.timestamp() >= before);
        assert_eq!(wm.sequence(), 0);
        assert!(!wm.is_completed());
    }

    #[test]
    fn test_display() {
        let wm = Watermark::completed_of(Watermark::of_timestamp_seq(0, 3).unwrap());
        let text = wm.to_string();
        assert!(text.contains("completed=true"));
        assert!(text.contains("sequence=3"));
        assert!(text.contains("1970-01-01T00:00:00"));
    }
}
