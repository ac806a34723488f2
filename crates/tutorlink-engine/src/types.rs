//! Request, response and configuration types for engine operations.

use serde::{Deserialize, Serialize};
use tutorlink_core::{DayOfWeek, SubjectId, TimeWindow, TopicId};
use tutorlink_store::{Lesson, LessonInvitation, StudentMatchingPreference, TopicCompletion};

use crate::matcher::Candidate;

/// Longest accepted invitation lifetime (30 days).
const MAX_INVITATION_TTL_SECONDS: i64 = 30 * 86_400;

/// Derived status of a topic for one student. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicStatus {
    /// Prerequisites or the previous topic's quiz are not satisfied.
    Locked,
    /// The student may request a lesson on this topic.
    Available,
    /// A live lesson references the topic.
    InProgress,
    /// Done. Never reverts.
    Completed,
}

/// Quiz state of a topic for one student.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum QuizStatus {
    /// The topic has no required quiz.
    NotRequired,
    /// Required, never attempted.
    NotAttempted,
    /// Required, best score below the passing threshold.
    Failed {
        /// Best score so far.
        best: u8,
    },
    /// Required and passed.
    Passed {
        /// Best score so far.
        best: u8,
    },
}

impl QuizStatus {
    /// Returns true if the quiz does not hold back the next topic.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::NotRequired | Self::Passed { .. })
    }
}

/// A student's request for a lesson on a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonRequest {
    /// Subject of the topic.
    pub subject_id: SubjectId,
    /// Topic to be taught.
    pub topic_id: TopicId,
    /// Acceptable days.
    pub preferred_days: Vec<DayOfWeek>,
    /// Acceptable time of day (UTC).
    pub window: TimeWindow,
    /// Budget ceiling in cents per hour.
    pub max_hourly_rate_cents: u32,
    /// Soft preference on tutor gender.
    #[serde(default)]
    pub preferred_gender: Option<String>,
    /// Soft preference on teaching style.
    #[serde(default)]
    pub preferred_style: Option<String>,
    /// Where to email the student, if anywhere.
    #[serde(default)]
    pub contact_email: Option<String>,
}

impl LessonRequest {
    /// Create a request with no soft preferences.
    #[must_use]
    pub fn new(
        subject_id: SubjectId,
        topic_id: TopicId,
        preferred_days: Vec<DayOfWeek>,
        window: TimeWindow,
        max_hourly_rate_cents: u32,
    ) -> Self {
        Self {
            subject_id,
            topic_id,
            preferred_days,
            window,
            max_hourly_rate_cents,
            preferred_gender: None,
            preferred_style: None,
            contact_email: None,
        }
    }
}

/// A tutor's answer to an invitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TutorResponse {
    /// Whether the tutor takes the lesson.
    pub accept: bool,
    /// Optional note for the student.
    #[serde(default)]
    pub note: Option<String>,
}

impl TutorResponse {
    /// Accept without a note.
    #[must_use]
    pub const fn accept() -> Self {
        Self {
            accept: true,
            note: None,
        }
    }

    /// Decline, optionally explaining why.
    #[must_use]
    pub fn decline(note: Option<String>) -> Self {
        Self {
            accept: false,
            note,
        }
    }
}

/// What a successful lesson request produced.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    /// The persisted preference, `Pending`.
    pub preference: StudentMatchingPreference,
    /// Invitations fanned out, in ranking order.
    pub invitations: Vec<LessonInvitation>,
    /// The full ranking, including candidates that were not invited.
    pub candidates: Vec<Candidate>,
}

/// Result of a tutor's response.
#[derive(Debug, Clone)]
pub enum RespondOutcome {
    /// The acceptance won and a lesson was booked.
    Booked(Lesson),
    /// The invitation was declined.
    Declined(LessonInvitation),
}

/// Result of completing a lesson.
#[derive(Debug, Clone)]
pub struct LessonCompletion {
    /// The lesson, now `Completed`.
    pub lesson: Lesson,
    /// The updated completion record of the lesson's topic.
    pub completion: TopicCompletion,
}

/// Configuration for the tutoring engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a tutor has to answer an invitation (seconds).
    pub invitation_ttl_seconds: i64,
    /// How far ahead acceptance looks for a concrete slot (days).
    pub booking_horizon_days: u32,
    /// UTC hour used for tomorrow's lesson when an invitation carries no slot data.
    pub fallback_hour: u8,
    /// Length of a booked lesson (minutes).
    pub lesson_duration_minutes: u32,
    /// Confirmed-student limit for tutors without their own capacity.
    pub default_tutor_capacity: u32,
    /// Widening applied to the request window for nearby matches (minutes).
    pub nearby_tolerance_minutes: u16,
    /// Candidates scoring below this are ranked but not invited.
    pub min_invite_score: f64,
    /// Upper bound on invitations per fan-out.
    pub max_invitations: usize,
    /// Weight of the price-closeness term; 0 disables it.
    pub price_weight: f64,
    /// Interval between expiration sweeps (seconds).
    pub sweep_interval_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            invitation_ttl_seconds: 86_400, // 24 hours
            booking_horizon_days: 14,
            fallback_hour: 10,
            lesson_duration_minutes: 60,
            default_tutor_capacity: 5,
            nearby_tolerance_minutes: 120,
            min_invite_score: 0.0,
            max_invitations: 10,
            price_weight: 0.0,
            sweep_interval_seconds: 300, // 5 minutes
        }
    }
}

impl EngineConfig {
    /// Invitation lifetime, clamped to between one second and thirty days.
    #[must_use]
    pub fn invitation_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            self.invitation_ttl_seconds
                .clamp(1, MAX_INVITATION_TTL_SECONDS),
        )
    }

    /// Sweep period, never zero.
    #[must_use]
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_seconds.max(1))
    }

    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `TUTORLINK_INVITATION_TTL_SECONDS` (1 to 30 days)
    /// - `TUTORLINK_BOOKING_HORIZON_DAYS`
    /// - `TUTORLINK_FALLBACK_HOUR` (0-23)
    /// - `TUTORLINK_LESSON_DURATION_MINUTES`
    /// - `TUTORLINK_DEFAULT_TUTOR_CAPACITY`
    /// - `TUTORLINK_NEARBY_TOLERANCE_MINUTES`
    /// - `TUTORLINK_MIN_INVITE_SCORE`
    /// - `TUTORLINK_MAX_INVITATIONS`
    /// - `TUTORLINK_PRICE_WEIGHT`
    /// - `TUTORLINK_SWEEP_INTERVAL_SECONDS` (at least 1)
    ///
    /// Unset, unparsable or out-of-range values keep their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = var("TUTORLINK_INVITATION_TTL_SECONDS") {
            match val.parse::<i64>() {
                Ok(n) if (1..=MAX_INVITATION_TTL_SECONDS).contains(&n) => {
                    config.invitation_ttl_seconds = n;
                }
                _ => tracing::warn!(value = %val, "Ignoring invalid TUTORLINK_INVITATION_TTL_SECONDS"),
            }
        }
        if let Some(val) = var("TUTORLINK_BOOKING_HORIZON_DAYS") {
            if let Ok(n) = val.parse() {
                config.booking_horizon_days = n;
            }
        }
        if let Some(val) = var("TUTORLINK_FALLBACK_HOUR") {
            if let Ok(n) = val.parse::<u8>() {
                if n < 24 {
                    config.fallback_hour = n;
                }
            }
        }
        if let Some(val) = var("TUTORLINK_LESSON_DURATION_MINUTES") {
            if let Ok(n) = val.parse() {
                config.lesson_duration_minutes = n;
            }
        }
        if let Some(val) = var("TUTORLINK_DEFAULT_TUTOR_CAPACITY") {
            if let Ok(n) = val.parse() {
                config.default_tutor_capacity = n;
            }
        }
        if let Some(val) = var("TUTORLINK_NEARBY_TOLERANCE_MINUTES") {
            if let Ok(n) = val.parse() {
                config.nearby_tolerance_minutes = n;
            }
        }
        if let Some(val) = var("TUTORLINK_MIN_INVITE_SCORE") {
            if let Ok(n) = val.parse() {
                config.min_invite_score = n;
            }
        }
        if let Some(val) = var("TUTORLINK_MAX_INVITATIONS") {
            if let Ok(n) = val.parse() {
                config.max_invitations = n;
            }
        }
        if let Some(val) = var("TUTORLINK_PRICE_WEIGHT") {
            if let Ok(n) = val.parse() {
                config.price_weight = n;
            }
        }
        if let Some(val) = var("TUTORLINK_SWEEP_INTERVAL_SECONDS") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.sweep_interval_seconds = n,
                _ => tracing::warn!(value = %val, "Ignoring invalid TUTORLINK_SWEEP_INTERVAL_SECONDS"),
            }
        }

        config
    }
}
