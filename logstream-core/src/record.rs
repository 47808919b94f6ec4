//! The unit of data flowing between computations.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use bytes::Bytes;

use crate::watermark::Watermark;

/// Size of the payload prefix rendered by [Record]'s `Display`.
const DISPLAY_OVERVIEW_LEN: usize = 127;

/// Set of record flags, one bit per flag so that any combination fits in a byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    pub const DEFAULT: Flags = Flags(1);
    /// Ask the consuming runner to checkpoint right after this record.
    pub const COMMIT: Flags = Flags(1 << 1);
    /// Ask the consuming runner to checkpoint and stop.
    pub const POISON_PILL: Flags = Flags(1 << 2);
    /// The payload is a reference to a value stored elsewhere.
    pub const EXTERNAL_VALUE: Flags = Flags(1 << 3);
    pub const INTERNAL1: Flags = Flags(1 << 4);
    pub const INTERNAL2: Flags = Flags(1 << 5);
    pub const USER1: Flags = Flags(1 << 6);
    pub const USER2: Flags = Flags(1 << 7);

    const NAMED: [(Flags, &'static str); 8] = [
        (Flags::DEFAULT, "DEFAULT"),
        (Flags::COMMIT, "COMMIT"),
        (Flags::POISON_PILL, "POISON_PILL"),
        (Flags::EXTERNAL_VALUE, "EXTERNAL_VALUE"),
        (Flags::INTERNAL1, "INTERNAL1"),
        (Flags::INTERNAL2, "INTERNAL2"),
        (Flags::USER1, "USER1"),
        (Flags::USER2, "USER2"),
    ];

    pub const fn empty() -> Self {
        Flags(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn with(self, other: Flags) -> Self {
        Flags(self.0 | other.0)
    }

    #[must_use]
    pub const fn without(self, other: Flags) -> Self {
        Flags(self.0 & !other.0)
    }
}

impl Default for Flags {
    fn default() -> Self {
        Flags::DEFAULT
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        self.with(rhs)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        *self = self.with(rhs);
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Flags::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// An immutable record. A missing payload is not the same as an empty one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Record {
    key: Option<String>,
    watermark: u64,
    flags: Flags,
    payload: Option<Bytes>,
}

impl Record {
    pub fn new(key: Option<String>, payload: Option<Bytes>, watermark: u64, flags: Flags) -> Self {
        Self {
            key,
            watermark,
            flags,
            payload,
        }
    }

    /// Unstamped record, the runner assigns a watermark when it is flushed.
    pub fn of(key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(Some(key.into()), Some(payload.into()), 0, Flags::DEFAULT)
    }

    /// Record stamped with the current time.
    pub fn of_value(key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::new(
            Some(key.into()),
            Some(payload.into()),
            Watermark::of_now().value(),
            Flags::DEFAULT,
        )
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn has_flag(&self, flag: Flags) -> bool {
        self.flags.contains(flag)
    }

    #[must_use]
    pub fn with_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }

    #[must_use]
    pub fn with_watermark(mut self, watermark: u64) -> Self {
        self.watermark = watermark;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_flag(mut self, flag: Flags) -> Self {
        self.flags |= flag;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Option<Bytes>) -> Self {
        self.payload = payload;
        self
    }

    /// Printable prefix of the payload, safe to log. Bytes outside of printable ASCII are
    /// rendered as `.`.
    pub fn data_overview(&self, max_len: usize) -> String {
        let Some(payload) = &self.payload else {
            return String::new();
        };
        payload
            .iter()
            .take(max_len)
            .map(|b| {
                if b.is_ascii_graphic() || *b == b' ' {
                    char::from(*b)
                } else {
                    '.'
                }
            })
            .collect()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let length = self.payload.as_ref().map_or(0, Bytes::len);
        write!(
            f,
            "Record{{watermark={}, flags={}, key='{}', data.length={}",
            self.watermark,
            self.flags,
            self.key.as_deref().unwrap_or_default(),
            length
        )?;
        if length > 0 {
            write!(f, ", data=\"{}\"", self.data_overview(DISPLAY_OVERVIEW_LEN))?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let flags = Flags::DEFAULT | Flags::COMMIT;
        assert!(flags.contains(Flags::COMMIT));
        assert!(flags.contains(Flags::DEFAULT));
        assert!(!flags.contains(Flags::POISON_PILL));
        assert_eq!(flags.bits(), 0b11);
        assert_eq!(flags.without(Flags::COMMIT), Flags::DEFAULT);
        assert_eq!(Flags::from_bits(0xFF).to_string().matches(", ").count(), 7);
        assert_eq!(Flags::empty().to_string(), "[]");
    }

    #[test]
    fn test_record_builders() {
        let record = Record::of("k", "v");
        assert_eq!(record.key(), Some("k"));
        assert_eq!(record.watermark(), 0);
        assert_eq!(record.flags(), Flags::DEFAULT);

        let record = record
            .with_watermark(42)
            .with_flag(Flags::POISON_PILL)
            .with_key(None);
        assert_eq!(record.watermark(), 42);
        assert!(record.has_flag(Flags::POISON_PILL));
        assert!(record.has_flag(Flags::DEFAULT));
        assert_eq!(record.key(), None);

        assert!(Record::of_value("k", "v").watermark() > 0);
    }

    #[test]
    fn test_empty_payload_is_not_absent() {
        let empty = Record::new(None, Some(Bytes::new()), 0, Flags::DEFAULT);
        let absent = Record::new(None, None, 0, Flags::DEFAULT);
        assert_ne!(empty, absent);
    }

    #[test]
    fn test_data_overview() {
        let record = Record::of("k", Bytes::from_static(b"ab\x00\ncd e"));
        assert_eq!(record.data_overview(100), "ab..cd e");
        assert_eq!(record.data_overview(3), "ab.");
        assert_eq!(Record::new(None, None, 0, Flags::DEFAULT).data_overview(10), "");

        let text = record.to_string();
        assert!(text.contains("key='k'"));
        assert!(text.contains("data.length=8"));
        assert!(text.contains("data=\"ab..cd e\""));
    }
}
