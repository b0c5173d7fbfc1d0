//! Wall-clock access and the fixed regional zone.
//!
//! Civil dates and times are what users type; everything stored or compared
//! is an absolute instant in Unix milliseconds.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};

use crate::model::{Ms, Span};

const DAY_MS: Ms = 86_400_000;

/// Source of "now".
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Ms) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: Ms) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Ms {
        self.now.load(Ordering::SeqCst)
    }
}

/// The single fixed-offset zone civil input is interpreted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionalZone {
    offset: FixedOffset,
}

impl Default for RegionalZone {
    fn default() -> Self {
        Self::ist()
    }
}

impl RegionalZone {
    /// India Standard Time, UTC+05:30.
    pub fn ist() -> Self {
        Self {
            offset: FixedOffset::east_opt(5 * 3600 + 30 * 60).expect("valid offset"),
        }
    }

    /// `None` if the offset is outside ±24h.
    pub fn from_offset_minutes(minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(minutes.checked_mul(60)?).map(|offset| Self { offset })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    fn offset_ms(&self) -> Ms {
        self.offset.local_minus_utc() as Ms * 1000
    }

    /// Civil (date, time) in this zone → absolute instant. `None` when the
    /// shift to UTC leaves chrono's representable range.
    pub fn to_instant(&self, date: NaiveDate, time: NaiveTime) -> Option<Ms> {
        let local = date.and_time(time);
        local
            .checked_sub_signed(TimeDelta::milliseconds(self.offset_ms()))
            .map(|utc| utc.and_utc().timestamp_millis())
    }

    /// The civil day's `[00:00, 24:00)` window as an absolute range.
    pub fn day_window(&self, date: NaiveDate) -> Option<Span> {
        let start = self.to_instant(date, NaiveTime::MIN)?;
        Some(Span::new(start, start.checked_add(DAY_MS)?))
    }

    /// Absolute instant → civil date-time in this zone.
    pub fn civil(&self, instant: Ms) -> Option<NaiveDateTime> {
        DateTime::from_timestamp_millis(instant)
            .map(|utc| utc.with_timezone(&self.offset).naive_local())
    }

    /// Absolute instant → zone-aware timestamp (for rendering).
    pub fn local(&self, instant: Ms) -> Option<DateTime<FixedOffset>> {
        DateTime::from_timestamp_millis(instant).map(|utc| utc.with_timezone(&self.offset))
    }

    /// The civil date `now` falls on.
    pub fn today(&self, now: Ms) -> NaiveDate {
        self.civil(now)
            .map(|dt| dt.date())
            .unwrap_or(NaiveDate::MIN)
    }
}
