use crate::watermark::Watermark;

/// Low watermark tracker of a runner.
///
/// `high` is the highest watermark seen since the last checkpoint, `low` the lowest one still
/// in flight. A checkpoint turns everything seen into done: `low` becomes the completed version
/// of `high`.
#[derive(Debug, Clone, Default)]
pub struct WatermarkInterval {
    low: Watermark,
    high: Watermark,
}

impl WatermarkInterval {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_value(&mut self, value: u64) -> Watermark {
        self.mark(Watermark::of_value(value))
    }

    pub fn mark(&mut self, watermark: Watermark) -> Watermark {
        if self.low == Watermark::LOWEST {
            self.low = watermark;
            self.high = watermark;
            return self.low;
        }
        if watermark < self.low {
            // the same point already completed, keep the completed mark
            if Watermark::completed_of(watermark) == self.low {
                return self.low;
            }
            self.low = watermark;
        }
        if watermark > self.high {
            self.high = watermark;
        }
        self.low
    }

    pub fn checkpoint(&mut self) -> Watermark {
        self.low = Watermark::completed_of(self.high);
        self.low
    }

    pub fn low(&self) -> Watermark {
        self.low
    }

    pub fn high(&self) -> Watermark {
        self.high
    }

    pub fn is_done(&self, timestamp: i64) -> bool {
        self.low.is_done(timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wm(ts: i64) -> Watermark {
        Watermark::of_timestamp(ts).unwrap()
    }

    #[test]
    fn test_mark_tracks_low_and_high() {
        let mut interval = WatermarkInterval::new();
        assert_eq!(interval.low(), Watermark::LOWEST);

        assert_eq!(interval.mark(wm(100)), wm(100));
        interval.mark(wm(300));
        interval.mark(wm(200));
        assert_eq!(interval.low(), wm(100));
        assert_eq!(interval.high(), wm(300));
        assert!(!interval.is_done(100));

        let low = interval.checkpoint();
        assert_eq!(low, Watermark::completed_of(wm(300)));
        assert!(low.is_completed());
        assert!(interval.is_done(300));
    }

    #[test]
    fn test_completed_low_does_not_regress() {
        let mut interval = WatermarkInterval::new();
        interval.mark(wm(100));
        interval.checkpoint();
        // replaying the record that was just completed
        assert_eq!(interval.mark(wm(100)), Watermark::completed_of(wm(100)));
        // an older record does lower the mark
        assert_eq!(interval.mark(wm(50)), wm(50));
    }
}
