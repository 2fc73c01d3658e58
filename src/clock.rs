/// Reference clock: current instant plus the fixed offset that defines a
/// calendar day for snapshots and reports.
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, Utc};
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// India Standard Time, the default reference offset.
pub const DEFAULT_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn offset(&self) -> FixedOffset;

    /// The calendar day `now` falls on in the reference offset.
    fn today(&self) -> NaiveDate {
        day_of(self.now(), self.offset())
    }
}

pub fn day_of(at: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    at.with_timezone(&offset).date_naive()
}

/// Parses offsets written as `+05:30`, or `Z`/`UTC`.
pub fn parse_offset(raw: &str) -> Result<FixedOffset> {
    let raw = raw.trim();
    if raw == "Z" || raw == "UTC" {
        return Ok(Utc.fix());
    }
    raw.parse::<FixedOffset>()
        .map_err(|err| Error::Config(format!("offset '{raw}' must look like +HH:MM: {err}")))
}

pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    offset: FixedOffset,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self {
            now: Mutex::new(now),
            offset,
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ist() -> FixedOffset {
        FixedOffset::east_opt(DEFAULT_OFFSET_SECS).unwrap()
    }

    #[test]
    fn today_follows_reference_offset_not_utc() {
        // 20:00 UTC is already the next day in IST.
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap(), ist());
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
    }

    #[test]
    fn advancing_crosses_day_boundary() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 18, 29, 0).unwrap(), ist());
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        clock.advance(Duration::minutes(1));
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
    }

    #[test]
    fn parses_offsets() {
        assert_eq!(parse_offset("+05:30").unwrap(), ist());
        assert_eq!(parse_offset("-08:00").unwrap().local_minus_utc(), -8 * 3600);
        assert_eq!(parse_offset("Z").unwrap().local_minus_utc(), 0);
        assert!(parse_offset("05:30").is_err());
        assert!(parse_offset("+5:3").is_err());
        assert!(parse_offset("IST").is_err());
    }
}
