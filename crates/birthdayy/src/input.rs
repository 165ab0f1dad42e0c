//! スラッシュコマンドの引数から誕生日を組み立てる。

use std::cmp::Ordering;

use birthdayy_core::{CalendarDate, DateError, compare_to_today, month_from_number};
use chrono::{DateTime, Datelike, Utc};
use thiserror::Error;

/// 受け付ける最も古い誕生年。
pub const MIN_YEAR: i32 = 1900;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DateInputError {
    #[error("Please provide a day and a month")]
    Missing,

    #[error("Invalid month: {0}")]
    InvalidMonth(i64),

    #[error("Year {year} must be between {} and {max}", MIN_YEAR)]
    YearOutOfRange { year: i64, max: i32 },

    #[error("The birthday can't be in the future")]
    InFuture,

    #[error(transparent)]
    Date(#[from] DateError),
}

/// コマンドから受け取った生の値。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateInput {
    pub day: Option<i64>,
    pub month: Option<i64>,
    pub year: Option<i64>,
}

impl DateInput {
    /// 入力を検証して [`CalendarDate`] に変換する。
    ///
    /// `now` はギルドの現地時刻を UTC として扱った日時を渡す。
    /// 年が省略された場合、2 月 29 日は `now` がうるう年のときだけ受け付ける。
    pub fn parse(self, now: DateTime<Utc>) -> Result<CalendarDate, DateInputError> {
        let (Some(day), Some(month)) = (self.day, self.month) else {
            return Err(DateInputError::Missing);
        };

        let month = u32::try_from(month)
            .ok()
            .and_then(|n| month_from_number(n).ok())
            .ok_or(DateInputError::InvalidMonth(month))?;

        let day = u8::try_from(day).map_err(|_| DateError::InvalidDay { month, day })?;

        let year = match self.year {
            Some(year) => {
                let max = now.year();
                match i32::try_from(year) {
                    Ok(y) if (MIN_YEAR..=max).contains(&y) => Some(y),
                    _ => return Err(DateInputError::YearOutOfRange { year, max }),
                }
            }
            None => None,
        };

        let date = CalendarDate::new(month, day, year, now)?;
        if year == Some(now.year())
            && compare_to_today(month, i32::from(day), now) == Ordering::Greater
        {
            return Err(DateInputError::InFuture);
        }
        Ok(date)
    }
}
