//! Working-time arithmetic: seconds between two instants that fall inside the
//! daily working window on non-holiday weekdays.

use crate::ManagerError;
use chrono::{
    DateTime, Datelike, Duration, FixedOffset, Local, NaiveDate, NaiveDateTime, NaiveTime, Utc,
    Weekday,
};
use std::collections::BTreeSet;
use tracing::warn;

/// US federal holidays (actual and observed dates) plus site-specific extras.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HolidayCalendar {
    federal: bool,
    extra: BTreeSet<NaiveDate>,
}

impl HolidayCalendar {
    pub fn us_federal() -> Self {
        Self {
            federal: true,
            extra: BTreeSet::new(),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_extra<I>(mut self, dates: I) -> Self
    where
        I: IntoIterator<Item = NaiveDate>,
    {
        self.extra.extend(dates);
        self
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        if self.extra.contains(&date) {
            return true;
        }
        if !self.federal {
            return false;
        }
        // An observed New Year's Day can land on Dec 31 of the prior year.
        federal_holidays(date.year()).contains(&date)
            || federal_holidays(date.year() + 1).contains(&date)
    }
}

fn federal_holidays(year: i32) -> BTreeSet<NaiveDate> {
    let mut actual = Vec::with_capacity(11);
    let fixed = |month: u32, day: u32| NaiveDate::from_ymd_opt(year, month, day);

    actual.extend(fixed(1, 1));
    actual.extend(nth_weekday(year, 1, Weekday::Mon, 3));
    actual.extend(nth_weekday(year, 2, Weekday::Mon, 3));
    actual.extend(last_weekday(year, 5, Weekday::Mon));
    if year >= 2021 {
        actual.extend(fixed(6, 19));
    }
    actual.extend(fixed(7, 4));
    actual.extend(nth_weekday(year, 9, Weekday::Mon, 1));
    actual.extend(nth_weekday(year, 10, Weekday::Mon, 2));
    actual.extend(fixed(11, 11));
    actual.extend(nth_weekday(year, 11, Weekday::Thu, 4));
    actual.extend(fixed(12, 25));

    let mut days = BTreeSet::new();
    for date in actual {
        days.insert(date);
        match date.weekday() {
            Weekday::Sat => {
                days.insert(date - Duration::days(1));
            }
            Weekday::Sun => {
                days.insert(date + Duration::days(1));
            }
            _ => {}
        }
    }
    days
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n as u8)
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let mut day = first_of_next - Duration::days(1);
    while day.weekday() != weekday {
        day -= Duration::days(1);
    }
    Some(day)
}

/// Daily working window evaluated in one timezone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkCalendar {
    open: NaiveTime,
    close: NaiveTime,
    holidays: HolidayCalendar,
    /// `None` evaluates the window in the host's local time.
    offset: Option<FixedOffset>,
}

impl Default for WorkCalendar {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(6, 0, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or_default(),
            holidays: HolidayCalendar::us_federal(),
            offset: None,
        }
    }
}

impl WorkCalendar {
    pub fn new(
        open: NaiveTime,
        close: NaiveTime,
        holidays: HolidayCalendar,
        offset: Option<FixedOffset>,
    ) -> Result<Self, ManagerError> {
        if close <= open {
            return Err(ManagerError::validation(format!(
                "working window close {close} must be after open {open}"
            )));
        }
        Ok(Self {
            open,
            close,
            holidays,
            offset,
        })
    }

    pub fn open(&self) -> NaiveTime {
        self.open
    }

    pub fn close(&self) -> NaiveTime {
        self.close
    }

    pub fn is_working_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.is_holiday(date)
    }

    fn local(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        match self.offset {
            Some(offset) => instant.with_timezone(&offset).naive_local(),
            None => instant.with_timezone(&Local).naive_local(),
        }
    }

    /// Working seconds in `[start, end]`, or `None` when the interval is reversed.
    pub fn working_seconds(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<i64> {
        if end < start {
            return None;
        }
        let start = self.local(start);
        let end = self.local(end);
        if end <= start {
            return Some(0);
        }

        let mut total = 0i64;
        let mut day = start.date();
        while day <= end.date() {
            if self.is_working_day(day) {
                let window_open = day.and_time(self.open).max(start);
                let window_close = day.and_time(self.close).min(end);
                if window_close > window_open {
                    total += (window_close - window_open).num_seconds();
                }
            }
            day = match day.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }
        Some(total)
    }
}

/// Working duration in whole seconds, never negative.
///
/// Falls back to wall-clock seconds (clamped at zero) when the working-time
/// figure cannot be computed.
pub fn working_duration(calendar: &WorkCalendar, start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    match calendar.working_seconds(start, end) {
        Some(seconds) => seconds,
        None => {
            let elapsed = (end - start).num_seconds().max(0);
            warn!(
                event = "working_duration_fallback",
                start = %start,
                end = %end,
                elapsed,
                "working duration not computable, using elapsed time"
            );
            elapsed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc_calendar() -> WorkCalendar {
        WorkCalendar::new(
            NaiveTime::from_hms_opt(6, 0, 0).expect("open"),
            NaiveTime::from_hms_opt(18, 0, 0).expect("close"),
            HolidayCalendar::us_federal(),
            Some(FixedOffset::east_opt(0).expect("utc offset")),
        )
        .expect("calendar")
    }

    fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
    }

    #[test]
    fn same_day_inside_window_counts_wall_clock() {
        let calendar = utc_calendar();
        // Tuesday 2024-03-12
        let seconds = working_duration(&calendar, at(2024, 3, 12, 9, 0), at(2024, 3, 12, 10, 30));
        assert_eq!(seconds, 5400);
    }

    #[test]
    fn interval_is_clipped_to_the_working_window() {
        let calendar = utc_calendar();
        let seconds = working_duration(&calendar, at(2024, 3, 12, 4, 0), at(2024, 3, 12, 20, 0));
        assert_eq!(seconds, 12 * 3600);
    }

    #[test]
    fn weekends_contribute_nothing() {
        let calendar = utc_calendar();
        // Friday 17:00 -> Monday 07:00: one hour Friday, one hour Monday.
        let seconds = working_duration(&calendar, at(2024, 3, 15, 17, 0), at(2024, 3, 18, 7, 0));
        assert_eq!(seconds, 2 * 3600);
    }

    #[test]
    fn federal_holidays_contribute_nothing() {
        let calendar = utc_calendar();
        // 2024-07-04 is a Thursday.
        let seconds = working_duration(&calendar, at(2024, 7, 4, 8, 0), at(2024, 7, 4, 12, 0));
        assert_eq!(seconds, 0);
        // Thanksgiving 2024 is Nov 28; the Friday after is a working day.
        assert!(!calendar.is_working_day(date(2024, 11, 28)));
        assert!(calendar.is_working_day(date(2024, 11, 29)));
    }

    #[test]
    fn observed_holidays_shift_off_weekends() {
        let holidays = HolidayCalendar::us_federal();
        // 2026-07-04 is a Saturday, observed Friday 07-03.
        assert!(holidays.is_holiday(date(2026, 7, 3)));
        // 2022-01-01 was a Saturday, observed Friday 2021-12-31.
        assert!(holidays.is_holiday(date(2021, 12, 31)));
        // Memorial Day 2024 is the last Monday in May.
        assert!(holidays.is_holiday(date(2024, 5, 27)));
        assert!(!holidays.is_holiday(date(2024, 5, 20)));
        assert!(!HolidayCalendar::none().is_holiday(date(2024, 12, 25)));
    }

    #[test]
    fn extra_holidays_are_respected() {
        let calendar = WorkCalendar::new(
            NaiveTime::from_hms_opt(6, 0, 0).expect("open"),
            NaiveTime::from_hms_opt(18, 0, 0).expect("close"),
            HolidayCalendar::none().with_extra([date(2024, 3, 12)]),
            Some(FixedOffset::east_opt(0).expect("utc offset")),
        )
        .expect("calendar");
        assert_eq!(
            working_duration(&calendar, at(2024, 3, 12, 9, 0), at(2024, 3, 12, 10, 0)),
            0
        );
    }

    #[test]
    fn reversed_interval_falls_back_to_clamped_elapsed() {
        let calendar = utc_calendar();
        assert_eq!(calendar.working_seconds(at(2024, 3, 12, 10, 0), at(2024, 3, 12, 9, 0)), None);
        assert_eq!(
            working_duration(&calendar, at(2024, 3, 12, 10, 0), at(2024, 3, 12, 9, 0)),
            0
        );
    }

    #[test]
    fn offset_moves_the_window() {
        let eastern = WorkCalendar::new(
            NaiveTime::from_hms_opt(6, 0, 0).expect("open"),
            NaiveTime::from_hms_opt(18, 0, 0).expect("close"),
            HolidayCalendar::us_federal(),
            Some(FixedOffset::west_opt(5 * 3600).expect("offset")),
        )
        .expect("calendar");
        // 20:00-22:00 UTC is 15:00-17:00 at UTC-5.
        assert_eq!(
            working_duration(&eastern, at(2024, 3, 12, 20, 0), at(2024, 3, 12, 22, 0)),
            7200
        );
    }

    #[test]
    fn window_must_be_ordered() {
        let err = WorkCalendar::new(
            NaiveTime::from_hms_opt(18, 0, 0).expect("open"),
            NaiveTime::from_hms_opt(6, 0, 0).expect("close"),
            HolidayCalendar::none(),
            None,
        )
        .expect_err("inverted window");
        assert_eq!(err.status_code(), 400);
    }
}
