//! Recurring calendar dates and the arithmetic around them.
//!
//! Every function here is pure: the reference instant is always passed in,
//! so callers decide what "now" means.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Datelike, Month, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DateError, Result};

/// A month and day, optionally anchored to a birth year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StoredDate", into = "StoredDate")]
pub struct CalendarDate {
    month: Month,
    day: u8,
    year: Option<i32>,
}

impl CalendarDate {
    /// Creates a validated date.
    ///
    /// Without a year, February 29 is only accepted when the reference
    /// instant falls in a leap year.
    ///
    /// # Errors
    ///
    /// Returns [`DateError::InvalidDay`] if `day` does not exist in `month`.
    pub fn new(
        month: Month,
        day: u8,
        year: Option<i32>,
        reference: DateTime<Utc>,
    ) -> Result<Self> {
        let leap = is_leap_year(year.unwrap_or_else(|| reference.year()));
        Self::checked(month, day, year, leap)
    }

    fn checked(month: Month, day: u8, year: Option<i32>, leap: bool) -> Result<Self> {
        if !is_valid_day_for_month(leap, month, i32::from(day)) {
            return Err(DateError::InvalidDay {
                month,
                day: i64::from(day),
            });
        }
        Ok(Self { month, day, year })
    }

    pub fn month(self) -> Month {
        self.month
    }

    pub fn day(self) -> u8 {
        self.day
    }

    pub fn year(self) -> Option<i32> {
        self.year
    }

    /// Whether `reference` falls on this date's month and day in UTC.
    pub fn is_on(self, reference: DateTime<Utc>) -> bool {
        compare_to_today(self.month, i32::from(self.day), reference) == Ordering::Equal
    }
}

impl fmt::Display for CalendarDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}. {}", self.day, self.month.name())?;
        if let Some(year) = self.year {
            write!(f, " ({year})")?;
        }
        Ok(())
    }
}

/// Serialized form of [`CalendarDate`], with the month as a number.
#[derive(Serialize, Deserialize)]
struct StoredDate {
    month: u8,
    day: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    year: Option<i32>,
}

impl TryFrom<StoredDate> for CalendarDate {
    type Error = DateError;

    // Stored year-less dates were validated when they were entered, which
    // may have been in a leap year.
    fn try_from(stored: StoredDate) -> Result<Self> {
        let month = month_from_number(u32::from(stored.month))?;
        let leap = stored.year.is_none_or(is_leap_year);
        Self::checked(month, stored.day, stored.year, leap)
    }
}

impl From<CalendarDate> for StoredDate {
    fn from(date: CalendarDate) -> Self {
        Self {
            month: date.month.number_from_month() as u8,
            day: date.day,
            year: date.year,
        }
    }
}

/// Converts a 1-based month number into a [`Month`].
pub fn month_from_number(number: u32) -> Result<Month> {
    u8::try_from(number)
        .ok()
        .and_then(|n| Month::try_from(n).ok())
        .ok_or(DateError::InvalidMonth(number))
}

/// Determines whether `month` contains `day` in a year with the given leap state.
pub fn is_valid_day_for_month(leap: bool, month: Month, day: i32) -> bool {
    if day < 1 {
        return false;
    }

    let last_day = match month {
        Month::February => {
            if leap {
                29
            } else {
                28
            }
        }
        Month::January
        | Month::March
        | Month::May
        | Month::July
        | Month::August
        | Month::October
        | Month::December => 31,
        _ => 30,
    };

    day <= last_day
}

/// Proleptic Gregorian leap-year rule.
pub fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// Compares a recurring `(month, day)` with the UTC calendar day of `reference`.
///
/// `Less` means the date has already passed this year, `Equal` that it is
/// today, and `Greater` that it is still ahead. The day is not validated.
pub fn compare_to_today(month: Month, day: i32, reference: DateTime<Utc>) -> Ordering {
    month
        .number_from_month()
        .cmp(&reference.month())
        .then_with(|| day.cmp(&(reference.day() as i32)))
}

/// Number of completed years since `date`, or `None` when the year is unknown.
///
/// The birthday itself counts as completed, so the age increments on the day.
pub fn compute_age(date: CalendarDate, reference: DateTime<Utc>) -> Option<i32> {
    let year = date.year?;
    let years = reference.year() - year;
    let upcoming = compare_to_today(date.month, i32::from(date.day), reference) == Ordering::Greater;
    Some(years - i32::from(upcoming))
}

/// Options for [`next_occurrence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextOccurrenceOptions {
    /// Move to next year when the date is today.
    pub repeat_if_today: bool,
    /// Added to the UTC midnight of the occurrence.
    pub timezone_offset: TimeDelta,
}

impl Default for NextOccurrenceOptions {
    fn default() -> Self {
        Self {
            repeat_if_today: false,
            timezone_offset: TimeDelta::zero(),
        }
    }
}

/// Computes the next instant at which `(month, day)` occurs.
///
/// A day past the end of the month in the target year rolls over into the
/// following month, so February 29 becomes March 1 in common years.
///
/// # Errors
///
/// Returns [`DateError::OutOfRange`] if the result cannot be represented.
pub fn next_occurrence(
    month: Month,
    day: i32,
    reference: DateTime<Utc>,
    options: NextOccurrenceOptions,
) -> Result<DateTime<Utc>> {
    let ordering = compare_to_today(month, day, reference);
    let next_year = if options.repeat_if_today {
        ordering != Ordering::Greater
    } else {
        ordering == Ordering::Less
    };

    let year = reference
        .year()
        .checked_add(i32::from(next_year))
        .ok_or(DateError::OutOfRange)?;

    utc_midnight(year, month, day)?
        .checked_add_signed(options.timezone_offset)
        .ok_or(DateError::OutOfRange)
}

/// Renders a date as `"<day>. <MonthName>"` with an optional `" (<year>)"`.
pub fn format_for_display(date: CalendarDate) -> String {
    date.to_string()
}

fn utc_midnight(year: i32, month: Month, day: i32) -> Result<DateTime<Utc>> {
    let first = NaiveDate::from_ymd_opt(year, month.number_from_month(), 1)
        .ok_or(DateError::OutOfRange)?;
    let date = first
        .checked_add_signed(TimeDelta::days(i64::from(day) - 1))
        .ok_or(DateError::OutOfRange)?;
    let midnight = date.and_hms_opt(0, 0, 0).ok_or(DateError::OutOfRange)?;
    Ok(midnight.and_utc())
}
