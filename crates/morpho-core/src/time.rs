//! Tick arithmetic and lightweight UTC timestamps (no chrono dependency).
//!
//! The control loop counts time in ticks. Configuration speaks seconds for
//! human-facing values (leases, backoffs); [`TickClock`] converts between the
//! two and stamps audit records with wall-clock time.

use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonic tick counter. Tick 0 is "before the first tick".
pub type Tick = u64;

/// Maps ticks to seconds using the configured tick period.
#[derive(Clone, Copy, Debug)]
pub struct TickClock {
    tick_seconds: f64,
    started_at: u64,
}

impl TickClock {
    pub fn new(tick_seconds: f64) -> Self {
        Self {
            tick_seconds,
            started_at: now_unix_secs(),
        }
    }

    pub fn tick_seconds(&self) -> f64 {
        self.tick_seconds
    }

    /// Whole ticks covering `seconds`, never less than one.
    pub fn ticks_for(&self, seconds: f64) -> Tick {
        if self.tick_seconds <= 0.0 {
            return 1;
        }
        ((seconds / self.tick_seconds).ceil() as Tick).max(1)
    }

    /// Wall-clock ISO-8601 time corresponding to `tick`.
    pub fn timestamp(&self, tick: Tick) -> String {
        let offset = (tick as f64 * self.tick_seconds).floor() as u64;
        unix_to_iso8601(self.started_at + offset)
    }
}

/// Current UTC time as Unix seconds.
pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current UTC timestamp in ISO-8601 format.
pub fn now_iso8601() -> String {
    unix_to_iso8601(now_unix_secs())
}

/// Convert Unix seconds to ISO-8601 UTC string.
pub fn unix_to_iso8601(secs: u64) -> String {
    let days = (secs / 86400) as i64;
    let rem = secs % 86400;
    let (y, m, d) = civil_from_days(days);
    format!(
        "{y:04}-{m:02}-{d:02}T{:02}:{:02}:{:02}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Days since the Unix epoch → (year, month, day), proleptic Gregorian.
fn civil_from_days(days: i64) -> (i64, u64, u64) {
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe as i64 + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_formats() {
        assert_eq!(unix_to_iso8601(0), "1970-01-01T00:00:00Z");
        assert_eq!(unix_to_iso8601(1771632000), "2026-02-21T00:00:00Z");
    }

    #[test]
    fn ticks_for_rounds_up() {
        let clock = TickClock::new(1.0);
        assert_eq!(clock.ticks_for(60.0), 60);
        assert_eq!(clock.ticks_for(0.2), 1);

        let half = TickClock::new(0.5);
        assert_eq!(half.ticks_for(30.0), 60);
        assert_eq!(half.ticks_for(0.7), 2);
    }

    #[test]
    fn timestamp_advances_with_ticks() {
        let clock = TickClock::new(1.0);
        assert!(clock.timestamp(0) <= clock.timestamp(120));
    }
}
