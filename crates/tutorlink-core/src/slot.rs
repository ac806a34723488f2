//! Weekly availability slots and time windows.
//!
//! A tutor's availability is a recurring weekly grid of one-hour slots addressed by
//! `(day-of-week, hour)`. Requests describe a window in minutes since midnight. All
//! arithmetic is in UTC and day 0 is Sunday.

use std::fmt;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

/// Minutes in one day.
pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// A day of the week, 0 = Sunday through 6 = Saturday.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct DayOfWeek(u8);

impl DayOfWeek {
    /// Sunday.
    pub const SUNDAY: Self = Self(0);
    /// Monday.
    pub const MONDAY: Self = Self(1);
    /// Tuesday.
    pub const TUESDAY: Self = Self(2);
    /// Wednesday.
    pub const WEDNESDAY: Self = Self(3);
    /// Thursday.
    pub const THURSDAY: Self = Self(4);
    /// Friday.
    pub const FRIDAY: Self = Self(5);
    /// Saturday.
    pub const SATURDAY: Self = Self(6);

    /// Create a day from its index.
    ///
    /// # Errors
    ///
    /// Returns `SlotError::InvalidDay` if `day` is greater than 6.
    pub const fn new(day: u8) -> Result<Self, SlotError> {
        if day > 6 {
            return Err(SlotError::InvalidDay(day));
        }
        Ok(Self(day))
    }

    /// The day of the week a UTC timestamp falls on.
    #[must_use]
    pub fn of(at: &DateTime<Utc>) -> Self {
        // num_days_from_sunday is always in 0..=6
        #[allow(clippy::cast_possible_truncation)]
        Self(at.weekday().num_days_from_sunday() as u8)
    }

    /// Return the numeric index.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for DayOfWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
        f.write_str(NAMES[self.0 as usize])
    }
}

impl TryFrom<u8> for DayOfWeek {
    type Error = SlotError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DayOfWeek> for u8 {
    fn from(day: DayOfWeek) -> Self {
        day.0
    }
}

/// One hour of a tutor's weekly grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slot {
    /// Day of the week.
    pub day: DayOfWeek,
    /// Starting hour, 0..=23.
    pub hour: u8,
}

impl Slot {
    /// Create a slot.
    ///
    /// # Errors
    ///
    /// Returns `SlotError::InvalidHour` if `hour` is greater than 23.
    pub const fn new(day: DayOfWeek, hour: u8) -> Result<Self, SlotError> {
        if hour > 23 {
            return Err(SlotError::InvalidHour(hour));
        }
        Ok(Self { day, hour })
    }

    /// The slot's time-of-day window, `[hour:00, hour+1:00)`.
    #[must_use]
    pub const fn window(&self) -> TimeWindow {
        let start = self.hour as u16 * 60;
        TimeWindow {
            start_minute: start,
            end_minute: start + 60,
        }
    }
}

/// A time-of-day window in minutes since midnight, half-open `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    /// First minute covered.
    pub start_minute: u16,
    /// First minute no longer covered.
    pub end_minute: u16,
}

impl TimeWindow {
    /// Create a window from minute offsets.
    ///
    /// # Errors
    ///
    /// Returns `SlotError::InvalidWindow` unless `start < end <= 1440`.
    pub const fn new(start_minute: u16, end_minute: u16) -> Result<Self, SlotError> {
        if start_minute >= end_minute || end_minute > MINUTES_PER_DAY {
            return Err(SlotError::InvalidWindow {
                start_minute,
                end_minute,
            });
        }
        Ok(Self {
            start_minute,
            end_minute,
        })
    }

    /// Create a window from whole hours, e.g. `from_hours(16, 18)` is 16:00-18:00.
    ///
    /// # Errors
    ///
    /// Returns `SlotError::InvalidWindow` for an empty or out-of-range window.
    pub const fn from_hours(start_hour: u8, end_hour: u8) -> Result<Self, SlotError> {
        Self::new(start_hour as u16 * 60, end_hour as u16 * 60)
    }

    /// Two windows overlap iff `start1 < end2 && end1 > start2`.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start_minute < other.end_minute && self.end_minute > other.start_minute
    }

    /// Widen the window by `tolerance` minutes on both sides, clamped to the day.
    #[must_use]
    pub fn widen(&self, tolerance: u16) -> Self {
        Self {
            start_minute: self.start_minute.saturating_sub(tolerance),
            end_minute: self
                .end_minute
                .saturating_add(tolerance)
                .min(MINUTES_PER_DAY),
        }
    }
}

/// Errors for slot and window construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    /// Day index outside 0..=6.
    #[error("invalid day of week: {0}")]
    InvalidDay(u8),

    /// Hour outside 0..=23.
    #[error("invalid hour: {0}")]
    InvalidHour(u8),

    /// Empty or out-of-range window.
    #[error("invalid time window: {start_minute}..{end_minute}")]
    InvalidWindow {
        /// Requested start minute.
        start_minute: u16,
        /// Requested end minute.
        end_minute: u16,
    },
}
