use std::{
    fmt,
    ops::{Add, Sub},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{
    de::{Deserialize, Deserializer, Error},
    ser::{Serialize, Serializer},
};

/// Milliseconds since the Unix epoch, strictly increasing per user.
///
/// Unlike the Spanner-backed `SyncTimestamp` this is descended from, values
/// here are never rounded to a coarser resolution: every mutation must be
/// observably distinct from the one before it, even within the same
/// millisecond, so rounding (which the Spanner variant does to 10ms for
/// index-friendliness) would violate that invariant outright.
#[derive(Debug, Default, Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SyncTimestamp(u64);

impl SyncTimestamp {
    pub fn from_milliseconds(val: u64) -> Self {
        SyncTimestamp(val)
    }

    pub fn from_i64(val: i64) -> Self {
        debug_assert!(val >= 0);
        SyncTimestamp(val.max(0) as u64)
    }

    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        SyncTimestamp(millis)
    }

    /// The monotonic "now" used by every mutating `UserDb` operation:
    /// never less than the wall clock, and always strictly greater than
    /// the last value observed for this user.
    pub fn advance_from(last: SyncTimestamp) -> Self {
        let wall = Self::now();
        if wall > last {
            wall
        } else {
            SyncTimestamp(last.0 + 1)
        }
    }

    pub fn as_i64(&self) -> i64 {
        self.0 as i64
    }

    pub fn as_milliseconds(&self) -> u64 {
        self.0
    }

    pub fn as_seconds(&self) -> f64 {
        self.0 as f64 / 1_000.0
    }

    /// Formats as the two-decimal seconds string sent in `X-Last-Modified`
    /// / `X-Weave-Timestamp` response headers.
    pub fn as_header(&self) -> String {
        format!("{:.2}", self.as_seconds())
    }

    pub fn from_header(val: &str) -> Result<Self, std::num::ParseFloatError> {
        let seconds: f64 = val.parse()?;
        Ok(SyncTimestamp((seconds * 1_000.0).round() as u64))
    }
}

impl Add<u64> for SyncTimestamp {
    type Output = SyncTimestamp;

    fn add(self, millis: u64) -> SyncTimestamp {
        SyncTimestamp(self.0 + millis)
    }
}

impl Sub<u64> for SyncTimestamp {
    type Output = SyncTimestamp;

    fn sub(self, millis: u64) -> SyncTimestamp {
        SyncTimestamp(self.0.saturating_sub(millis))
    }
}

impl fmt::Display for SyncTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_header())
    }
}

impl Serialize for SyncTimestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(self.as_seconds())
    }
}

impl<'de> Deserialize<'de> for SyncTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        if seconds < 0.0 {
            return Err(D::Error::custom("timestamp must be non-negative"));
        }
        Ok(SyncTimestamp((seconds * 1_000.0).round() as u64))
    }
}

#[cfg(test)]
mod test {
    use super::SyncTimestamp;

    #[test]
    fn advance_from_clock_regression() {
        let last = SyncTimestamp::from_milliseconds(10_000_000_000);
        let advanced = SyncTimestamp::advance_from(last);
        assert!(advanced > last);
    }

    #[test]
    fn advance_from_wall_clock_ahead() {
        let last = SyncTimestamp::from_milliseconds(1);
        let advanced = SyncTimestamp::advance_from(last);
        assert!(advanced > last);
        assert!(advanced.as_milliseconds() > 1_000_000_000_000);
    }

    #[test]
    fn header_roundtrip() {
        let ts = SyncTimestamp::from_milliseconds(1_452_807_004_454);
        let header = ts.as_header();
        assert_eq!(header, "1452807004.45");
        let parsed = SyncTimestamp::from_header(&header).unwrap();
        assert_eq!(parsed.as_milliseconds(), 1_452_807_004_450);
    }

    #[test]
    fn ordering_is_strict() {
        let a = SyncTimestamp::from_milliseconds(5);
        let b = SyncTimestamp::from_milliseconds(6);
        assert!(a < b);
    }
}
