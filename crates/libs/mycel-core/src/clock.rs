use core::fmt;
use core::ops::{Add, Sub};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Wall-clock instant with microsecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { micros: 0 };

    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    pub fn from_parts(secs: i64, micros: u32) -> Self {
        Self { micros: secs * 1_000_000 + micros as i64 }
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self { micros: (secs * 1e6) as i64 }
    }

    pub fn secs(&self) -> i64 {
        self.micros.div_euclid(1_000_000)
    }

    pub fn subsec_micros(&self) -> u32 {
        self.micros.rem_euclid(1_000_000) as u32
    }

    pub fn as_micros(&self) -> i64 {
        self.micros
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.micros as f64 / 1e6
    }

    pub fn shift_micros(&self, delta: i64) -> Timestamp {
        Timestamp { micros: self.micros + delta }
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp { micros: self.micros + rhs.as_micros() as i64 }
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = i64;

    /// Signed difference in microseconds.
    fn sub(self, rhs: Timestamp) -> i64 {
        self.micros - rhs.micros
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.secs(), self.subsec_micros())
    }
}

enum TimeSource {
    /// Monotonic progress anchored to the wall clock sampled at boot.
    System { boot: Instant, wall_base: i64 },
    /// Test clocks advance only when told to.
    Manual { now: i64 },
}

/// Monotonic plus network-synchronised wall clock. `now()` adds a signed
/// process-wide offset that the time-sync service adjusts; large offset
/// jumps are reported so the kernel can shift its timers along.
pub struct Clock {
    source: TimeSource,
    offset_micros: i64,
}

impl Clock {
    pub fn system() -> Self {
        let wall_base = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Self { source: TimeSource::System { boot: Instant::now(), wall_base }, offset_micros: 0 }
    }

    pub fn manual(start: Timestamp) -> Self {
        Self { source: TimeSource::Manual { now: start.as_micros() }, offset_micros: 0 }
    }

    pub fn now(&self) -> Timestamp {
        let raw = match &self.source {
            TimeSource::System { boot, wall_base } => {
                wall_base + boot.elapsed().as_micros() as i64
            }
            TimeSource::Manual { now } => *now,
        };
        Timestamp::from_micros(raw + self.offset_micros)
    }

    pub fn offset_micros(&self) -> i64 {
        self.offset_micros
    }

    /// Applies a signed adjustment to the process-wide offset and returns
    /// the delta so callers can rewrite their own timers.
    pub fn adjust(&mut self, delta_micros: i64) -> i64 {
        self.offset_micros += delta_micros;
        delta_micros
    }

    /// Only meaningful for manual clocks; system clocks advance themselves.
    pub fn advance(&mut self, by: Duration) {
        if let TimeSource::Manual { now } = &mut self.source {
            *now += by.as_micros() as i64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_only_on_request() {
        let mut clock = Clock::manual(Timestamp::from_parts(100, 0));
        let before = clock.now();
        assert_eq!(before, clock.now());

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now() - before, 1_500_000);
    }

    #[test]
    fn offset_shifts_reported_time() {
        let mut clock = Clock::manual(Timestamp::from_parts(100, 0));
        clock.adjust(-2_000_000);
        assert_eq!(clock.now(), Timestamp::from_parts(98, 0));
    }

    #[test]
    fn timestamp_parts_round_trip() {
        let ts = Timestamp::from_parts(12, 345_678);
        assert_eq!(ts.secs(), 12);
        assert_eq!(ts.subsec_micros(), 345_678);

        let negative = Timestamp::from_micros(-1);
        assert_eq!(negative.secs(), -1);
        assert_eq!(negative.subsec_micros(), 999_999);
    }
}
