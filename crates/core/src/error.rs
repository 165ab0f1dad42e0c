use chrono::Month;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DateError {
    #[error("Invalid month: {0}")]
    InvalidMonth(u32),

    #[error("{} has no day {day}", .month.name())]
    InvalidDay { month: Month, day: i64 },

    #[error("Date is outside the supported range")]
    OutOfRange,
}

pub type Result<T> = std::result::Result<T, DateError>;
