//! Slot resolution for accepted invitations.
//!
//! An invitation carries the days and hours that overlapped the request when it was
//! sent. On acceptance those are expanded into concrete start times over the booking
//! horizon, earliest first; the store blocks the first one that is still open.

use chrono::{DateTime, Days, NaiveTime, TimeZone, Utc};
use tutorlink_core::{DayOfWeek, Slot};
use tutorlink_store::{LessonInvitation, SlotCandidate};

fn at_hour(date: chrono::NaiveDate, hour: u8) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(u32::from(hour), 0, 0)?;
    Some(Utc.from_utc_datetime(&date.and_time(time)))
}

/// Concrete start times for an invitation over the next `horizon_days`, earliest first.
///
/// Only times strictly after `now` are returned.
#[must_use]
pub fn candidate_slots(
    invitation: &LessonInvitation,
    now: DateTime<Utc>,
    horizon_days: u32,
) -> Vec<SlotCandidate> {
    let mut hours = invitation.matching_hours.clone();
    hours.sort_unstable();
    hours.dedup();

    let today = now.date_naive();
    let mut candidates = Vec::new();

    for offset in 0..=u64::from(horizon_days) {
        let Some(date) = today.checked_add_days(Days::new(offset)) else {
            break;
        };
        let Some(midnight) = at_hour(date, 0) else {
            continue;
        };
        let day = DayOfWeek::of(&midnight);
        if !invitation.matching_days.contains(&day) {
            continue;
        }

        for hour in &hours {
            let (Ok(slot), Some(starts_at)) = (Slot::new(day, *hour), at_hour(date, *hour)) else {
                continue;
            };
            if starts_at > now && starts_at <= now + chrono::Duration::days(i64::from(horizon_days)) {
                candidates.push(SlotCandidate { slot, starts_at });
            }
        }
    }

    candidates
}

/// Tomorrow at `hour` UTC.
#[must_use]
pub fn fallback_start(now: DateTime<Utc>, hour: u8) -> Option<DateTime<Utc>> {
    let tomorrow = now.date_naive().checked_add_days(Days::new(1))?;
    at_hour(tomorrow, hour)
}

/// The next start of a weekly slot strictly after `now`.
#[must_use]
pub fn next_occurrence(slot: Slot, now: DateTime<Utc>) -> Option<SlotCandidate> {
    let today = now.date_naive();
    (0..=7u64).find_map(|offset| {
        let date = today.checked_add_days(Days::new(offset))?;
        let starts_at = at_hour(date, slot.hour)?;
        (DayOfWeek::of(&starts_at) == slot.day && starts_at > now)
            .then_some(SlotCandidate { slot, starts_at })
    })
}

/// Lesson price for a tutor's hourly rate.
#[must_use]
pub fn lesson_price_cents(hourly_rate_cents: u32, duration_minutes: u32) -> u32 {
    let cents = u64::from(hourly_rate_cents) * u64::from(duration_minutes) / 60;
    u32::try_from(cents).unwrap_or(u32::MAX)
}
