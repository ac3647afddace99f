//! Trading calendar and session clock.
//!
//! `TradingCalendar` is the seam to an external holiday source; the
//! bundled `WeekdayCalendar` treats weekends and configured dates as
//! closed. `SessionClock` converts UTC instants to market-local time and
//! cuts them into hourly cycle boundaries.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Timelike, Utc,
    Weekday,
};
use std::collections::BTreeSet;

use crate::types::{CoreError, CoreResult};

/// Answers whether a local date is a trading session.
pub trait TradingCalendar: Send + Sync {
    fn is_trading_day(&self, date: NaiveDate) -> bool;
}

/// Monday–Friday calendar with an explicit holiday list.
#[derive(Debug, Clone, Default)]
pub struct WeekdayCalendar {
    holidays: BTreeSet<NaiveDate>,
}

impl WeekdayCalendar {
    pub fn new(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
        }
    }
}

impl TradingCalendar for WeekdayCalendar {
    fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }
}

/// Market-local clock and session window.
#[derive(Debug, Clone)]
pub struct SessionClock {
    offset: FixedOffset,
    start: NaiveTime,
    end: NaiveTime,
}

impl SessionClock {
    pub fn new(utc_offset_hours: i32, start: NaiveTime, end: NaiveTime) -> CoreResult<Self> {
        let offset = FixedOffset::east_opt(utc_offset_hours * 3600).ok_or_else(|| {
            CoreError::Config(format!("invalid UTC offset {utc_offset_hours}h"))
        })?;
        Ok(Self { offset, start, end })
    }

    pub fn local(&self, ts: DateTime<Utc>) -> DateTime<FixedOffset> {
        ts.with_timezone(&self.offset)
    }

    pub fn local_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        self.local(ts).date_naive()
    }

    /// The hourly boundary (local top of the hour) containing `ts`.
    pub fn cycle_boundary(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let local = self.local(ts);
        let floored = local
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(local);
        floored.with_timezone(&Utc)
    }

    /// UTC bounds `[start, end)` of a local calendar day.
    pub fn day_bounds(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let midnight = date.and_time(NaiveTime::MIN);
        let start = self
            .offset
            .from_local_datetime(&midnight)
            .single()
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&midnight));
        (start, start + Duration::days(1))
    }

    /// Fails with `SchedulingSkip` when `ts` is not inside a trading session.
    pub fn check_session(&self, calendar: &dyn TradingCalendar, ts: DateTime<Utc>) -> CoreResult<()> {
        let local = self.local(ts);
        let date = local.date_naive();
        if !calendar.is_trading_day(date) {
            return Err(CoreError::SchedulingSkip(format!(
                "{date} ({}) is not a trading day",
                date.weekday()
            )));
        }
        let time = local.time();
        if time < self.start || time > self.end {
            return Err(CoreError::SchedulingSkip(format!(
                "{} is outside session {}-{}",
                time.format("%H:%M"),
                self.start.format("%H:%M"),
                self.end.format("%H:%M")
            )));
        }
        Ok(())
    }

    /// First trading day strictly after `date`.
    pub fn next_trading_day(&self, calendar: &dyn TradingCalendar, date: NaiveDate) -> NaiveDate {
        let mut d = date;
        // A year of consecutive holidays is not a real calendar.
        for _ in 0..366 {
            d = d.succ_opt().unwrap_or(d);
            if calendar.is_trading_day(d) {
                return d;
            }
        }
        date.succ_opt().unwrap_or(date)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
