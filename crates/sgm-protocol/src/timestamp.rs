use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A wall-clock instant with nanosecond resolution.
///
/// The zero value (`Timestamp::ZERO`) is a sentinel meaning "fill this in
/// at consumption" — see the message recorder and line reader callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i128);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Timestamp(since_epoch.as_nanos() as i128)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn from_system_time(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp(d.as_nanos() as i128),
            Err(_) => Timestamp::ZERO,
        }
    }

    /// Seconds-since-epoch as a float, matching the `ts REAL` log column.
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Timestamp((secs * 1_000_000_000.0) as i128)
    }

    pub fn plus(self, delta: Duration) -> Self {
        Timestamp(self.0 + delta.as_nanos() as i128)
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::ZERO
    }
}
