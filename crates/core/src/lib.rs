//! Date arithmetic and message templates for the Birthdayy bot.
//!
//! Nothing in this crate reads the clock or performs I/O.

pub mod date;
mod error;
pub mod template;

pub use date::{
    CalendarDate, NextOccurrenceOptions, compare_to_today, compute_age, format_for_display,
    is_leap_year, is_valid_day_for_month, month_from_number, next_occurrence,
};
pub use error::{DateError, Result};
pub use template::{MessageContext, MessageTemplate, Token};

pub use chrono::Month;
