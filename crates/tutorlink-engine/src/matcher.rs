//! Tutor matching and ranking.
//!
//! Tutors are filtered on hard constraints (active, teaches the subject, within budget,
//! spare capacity, at least one open slot) and then placed in one of three tiers:
//!
//! - `Exact`: an open slot on a requested day overlaps the requested window.
//! - `Nearby`: no exact overlap, but a slot on a requested day overlaps the window
//!   widened by the configured tolerance.
//! - `AvailabilityOnly`: open slots exist, none of them close to the request.
//!
//! Tiers are ordered first, so a nearby tutor never outranks an exact one. Within a tier
//! candidates are ordered by score, then total lessons, then tutor ID. Each satisfied
//! soft preference (gender, style) adds a small fixed amount to the score.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;
use tutorlink_core::{DayOfWeek, StudentId, TimeWindow, TutorId};
use tutorlink_store::{AvailabilitySlot, Store, StudentMatchingPreference, Tutor};

use crate::error::Result;
use crate::types::EngineConfig;

const RATING_WEIGHT: f64 = 40.0;
const EXPERIENCE_WEIGHT: f64 = 30.0;
const EXPERIENCE_CAP: u32 = 100;
const EXACT_BONUS: f64 = 30.0;
const PARTIAL_BONUS: f64 = 15.0;
const SOFT_MATCH_BONUS: f64 = 2.5;

/// How well a tutor's grid fits the requested days and window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    /// Overlaps the requested window on a requested day.
    Exact,
    /// Overlaps the widened window on a requested day.
    Nearby,
    /// Has open slots, none near the request.
    AvailabilityOnly,
}

/// A ranked tutor.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    /// The tutor profile.
    pub tutor: Tutor,
    /// Score out of 100 (plus the optional price term).
    pub score: f64,
    /// Availability tier.
    pub tier: MatchTier,
    /// Requested days on which matching slots were found.
    pub matching_days: Vec<DayOfWeek>,
    /// Hours of the matching slots.
    pub matching_hours: Vec<u8>,
    /// How many soft preferences (gender, style) the tutor satisfies.
    pub soft_matches: u8,
}

impl Candidate {
    /// Returns true if the tutor overlaps the requested window without tolerance.
    #[must_use]
    pub fn exact_time_match(&self) -> bool {
        self.tier == MatchTier::Exact
    }
}

/// A tutor plus the live state the matcher needs.
#[derive(Debug, Clone)]
pub struct TutorSnapshot {
    /// The tutor profile.
    pub tutor: Tutor,
    /// The tutor's weekly grid.
    pub grid: Vec<AvailabilitySlot>,
    /// Distinct students with a live lesson under this tutor.
    pub active_students: u32,
}

/// Open slots on requested days whose window overlaps `window`.
fn overlapping<'a>(
    open: &[&'a AvailabilitySlot],
    days: &HashSet<DayOfWeek>,
    window: &TimeWindow,
) -> Vec<&'a AvailabilitySlot> {
    open.iter()
        .copied()
        .filter(|cell| days.contains(&cell.slot.day) && cell.slot.window().overlaps(window))
        .collect()
}

fn soft_matches(preference: &StudentMatchingPreference, tutor: &Tutor) -> u8 {
    let same = |wanted: &Option<String>, actual: &Option<String>| match (wanted, actual) {
        (Some(w), Some(a)) => w.eq_ignore_ascii_case(a),
        _ => false,
    };
    u8::from(same(&preference.preferred_gender, &tutor.gender))
        + u8::from(same(&preference.preferred_style, &tutor.teaching_style))
}

/// Score a tutor for a tier.
#[must_use]
pub fn score(
    tutor: &Tutor,
    tier: MatchTier,
    max_hourly_rate_cents: u32,
    soft_matches: u8,
    config: &EngineConfig,
) -> f64 {
    let rating = tutor.rating.clamp(0.0, 5.0) / 5.0 * RATING_WEIGHT;
    let experience =
        f64::from(tutor.total_lessons.min(EXPERIENCE_CAP)) / f64::from(EXPERIENCE_CAP) * EXPERIENCE_WEIGHT;
    let availability = match tier {
        MatchTier::Exact => EXACT_BONUS,
        MatchTier::Nearby | MatchTier::AvailabilityOnly => PARTIAL_BONUS,
    };

    let price = if config.price_weight > 0.0 && max_hourly_rate_cents > 0 {
        let ratio = f64::from(tutor.hourly_rate_cents) / f64::from(max_hourly_rate_cents);
        (1.0 - ratio).clamp(0.0, 1.0) * config.price_weight
    } else {
        0.0
    };

    rating + experience + availability + price + f64::from(soft_matches) * SOFT_MATCH_BONUS
}

/// Filter and rank tutors for a preference.
#[must_use]
pub fn rank_candidates(
    preference: &StudentMatchingPreference,
    tutors: &[TutorSnapshot],
    config: &EngineConfig,
) -> Vec<Candidate> {
    let days: HashSet<DayOfWeek> = preference.preferred_days.iter().copied().collect();
    let widened = preference.window.widen(config.nearby_tolerance_minutes);

    let mut candidates: Vec<Candidate> = tutors
        .iter()
        .filter_map(|snapshot| {
            let tutor = &snapshot.tutor;
            let capacity = tutor.capacity.unwrap_or(config.default_tutor_capacity);
            if !tutor.active
                || !tutor.subjects.contains(&preference.subject_id)
                || tutor.hourly_rate_cents > preference.max_hourly_rate_cents
                || snapshot.active_students >= capacity
            {
                return None;
            }

            let open: Vec<&AvailabilitySlot> =
                snapshot.grid.iter().filter(|cell| cell.available).collect();
            if open.is_empty() {
                return None;
            }

            let exact = overlapping(&open, &days, &preference.window);
            let (tier, matched) = if exact.is_empty() {
                let nearby = overlapping(&open, &days, &widened);
                if nearby.is_empty() {
                    (MatchTier::AvailabilityOnly, Vec::new())
                } else {
                    (MatchTier::Nearby, nearby)
                }
            } else {
                (MatchTier::Exact, exact)
            };

            let soft = soft_matches(preference, tutor);
            let matching_days: BTreeSet<DayOfWeek> = matched.iter().map(|c| c.slot.day).collect();
            let matching_hours: BTreeSet<u8> = matched.iter().map(|c| c.slot.hour).collect();

            Some(Candidate {
                tutor: tutor.clone(),
                score: score(tutor, tier, preference.max_hourly_rate_cents, soft, config),
                tier,
                matching_days: matching_days.into_iter().collect(),
                matching_hours: matching_hours.into_iter().collect(),
                soft_matches: soft,
            })
        })
        .collect();

    candidates.sort_by(compare);
    candidates
}

fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    a.tier
        .cmp(&b.tier)
        .then(b.score.total_cmp(&a.score))
        .then(b.tutor.total_lessons.cmp(&a.tutor.total_lessons))
        .then(a.tutor.tutor_id.cmp(&b.tutor.tutor_id))
}

/// The candidates that receive an invitation: exact and nearby tiers at or above the
/// minimum score, in ranking order, capped at `max_invitations`.
#[must_use]
pub fn select_invitees<'a>(ranked: &'a [Candidate], config: &EngineConfig) -> Vec<&'a Candidate> {
    ranked
        .iter()
        .filter(|c| c.tier != MatchTier::AvailabilityOnly && c.score >= config.min_invite_score)
        .take(config.max_invitations)
        .collect()
}

/// Count distinct students with a live lesson per tutor.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn active_students<S: Store>(store: &S, tutor_id: &TutorId) -> Result<u32> {
    let students: HashSet<StudentId> = store
        .list_lessons_by_tutor(tutor_id)?
        .into_iter()
        .filter(|lesson| lesson.status.is_live())
        .map(|lesson| lesson.student_id)
        .collect();
    Ok(u32::try_from(students.len()).unwrap_or(u32::MAX))
}

/// Load every tutor with its grid and load.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn load_snapshots<S: Store>(store: &S) -> Result<Vec<TutorSnapshot>> {
    let mut snapshots = Vec::new();
    for tutor in store.list_tutors()? {
        let grid = store.get_availability(&tutor.tutor_id)?;
        let active_students = active_students(store, &tutor.tutor_id)?;
        snapshots.push(TutorSnapshot {
            tutor,
            grid,
            active_students,
        });
    }
    Ok(snapshots)
}

/// Rank the store's tutors for a preference.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn find_candidates<S: Store>(
    store: &S,
    preference: &StudentMatchingPreference,
    config: &EngineConfig,
) -> Result<Vec<Candidate>> {
    let snapshots = load_snapshots(store)?;
    let ranked = rank_candidates(preference, &snapshots, config);

    let by_tier = ranked.iter().fold(HashMap::new(), |mut acc, c| {
        *acc.entry(c.tier).or_insert(0usize) += 1;
        acc
    });
    tracing::debug!(
        preference_id = %preference.preference_id,
        tutors = snapshots.len(),
        exact = by_tier.get(&MatchTier::Exact).copied().unwrap_or(0),
        nearby = by_tier.get(&MatchTier::Nearby).copied().unwrap_or(0),
        availability_only = by_tier.get(&MatchTier::AvailabilityOnly).copied().unwrap_or(0),
        "Ranked tutor candidates"
    );

    Ok(ranked)
}
