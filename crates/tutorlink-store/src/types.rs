//! Domain types stored in the database.
//!
//! These types represent the persisted state of the curriculum, tutors, matching
//! preferences, invitations and lessons.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tutorlink_core::{
    AttemptId, DayOfWeek, InvitationId, LessonId, PaymentAuthorizationId, PreferenceId, Slot,
    StudentId, SubjectId, TimeWindow, TopicId, TutorId,
};

// =========================================================================
// Curriculum
// =========================================================================

/// An immutable curriculum node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    /// Unique identifier for the topic.
    pub topic_id: TopicId,
    /// Subject whose curriculum this topic belongs to.
    pub subject_id: SubjectId,
    /// Human-readable title.
    pub title: String,
    /// Position within the subject's curriculum.
    pub ordinal: u32,
    /// Topics that must be completed before this one, in addition to the previous ordinal.
    #[serde(default)]
    pub prerequisites: Vec<TopicId>,
    /// Whether a passing quiz score is needed before the next topic unlocks.
    pub quiz_required: bool,
    /// Minimum best quiz score (0-100) that passes the quiz.
    pub passing_score: u8,
    /// XP awarded when the topic is completed.
    pub xp_reward: u32,
    /// Completed lessons needed to complete the topic.
    #[serde(default = "Topic::default_lessons_required")]
    pub lessons_required: u32,
}

impl Topic {
    const fn default_lessons_required() -> u32 {
        1
    }
}

/// Stored progress of a student on a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// No lesson has been booked yet.
    NotStarted,
    /// A lesson was booked.
    InProgress,
    /// The topic is done.
    Completed,
}

/// Per (student, topic) completion record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicCompletion {
    /// Student this record belongs to.
    pub student_id: StudentId,
    /// Topic this record belongs to.
    pub topic_id: TopicId,
    /// Stored status. The live status is derived, see the progression engine.
    pub status: CompletionStatus,
    /// When the topic was completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// XP earned for the topic.
    pub xp_earned: u32,
    /// Number of completed lessons on the topic.
    pub lessons_completed: u32,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl TopicCompletion {
    /// A fresh record for a first interaction.
    #[must_use]
    pub fn not_started(student_id: StudentId, topic_id: TopicId, at: DateTime<Utc>) -> Self {
        Self {
            student_id,
            topic_id,
            status: CompletionStatus::NotStarted,
            completed_at: None,
            xp_earned: 0,
            lessons_completed: 0,
            updated_at: at,
        }
    }
}

/// One quiz attempt by a student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizAttempt {
    /// Unique identifier for the attempt.
    pub attempt_id: AttemptId,
    /// Student who took the quiz.
    pub student_id: StudentId,
    /// Topic the quiz belongs to.
    pub topic_id: TopicId,
    /// Score, 0-100.
    pub score: u8,
    /// When the attempt was recorded.
    pub taken_at: DateTime<Utc>,
}

// =========================================================================
// Tutors and availability
// =========================================================================

/// A tutor profile as seen by the matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tutor {
    /// Unique identifier for the tutor.
    pub tutor_id: TutorId,
    /// Display name.
    pub display_name: String,
    /// Contact address for notification emails.
    pub email: String,
    /// Subjects the tutor teaches.
    pub subjects: Vec<SubjectId>,
    /// Inactive tutors are never matched.
    pub active: bool,
    /// Hourly rate in cents.
    pub hourly_rate_cents: u32,
    /// Average rating, 0.0-5.0.
    pub rating: f64,
    /// Total completed lessons.
    pub total_lessons: u32,
    /// Maximum confirmed students. `None` uses the configured default.
    #[serde(default)]
    pub capacity: Option<u32>,
    /// Optional self-declared gender, used as a soft preference.
    #[serde(default)]
    pub gender: Option<String>,
    /// Optional teaching style, used as a soft preference.
    #[serde(default)]
    pub teaching_style: Option<String>,
}

/// One cell of a tutor's weekly grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    /// Tutor owning the grid.
    pub tutor_id: TutorId,
    /// Day and hour.
    pub slot: Slot,
    /// Whether the slot can still be booked.
    pub available: bool,
    /// The lesson consuming the slot, if booked.
    pub booked_lesson: Option<LessonId>,
}

// =========================================================================
// Matching preferences
// =========================================================================

/// Lifecycle states for a matching preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PreferenceStatus {
    /// Invitations may be fanned out and answered.
    Pending = 1,
    /// One invitation has been claimed; booking in progress.
    Matched = 2,
    /// A lesson was booked.
    Confirmed = 3,
    /// Withdrawn by the student or superseded.
    Cancelled = 4,
}

impl PreferenceStatus {
    /// Returns true while the preference counts as the student's active request.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Matched)
    }
}

/// A student's standing request for a lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentMatchingPreference {
    /// Unique identifier for the preference.
    pub preference_id: PreferenceId,
    /// Requesting student.
    pub student_id: StudentId,
    /// Requested subject.
    pub subject_id: SubjectId,
    /// Requested topic within the subject.
    pub topic_id: TopicId,
    /// Acceptable days of the week.
    pub preferred_days: Vec<DayOfWeek>,
    /// Acceptable time of day.
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
    /// Current status.
    pub status: PreferenceStatus,
    /// The invitation that won the race, once claimed.
    #[serde(default)]
    pub matched_invitation: Option<InvitationId>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

// =========================================================================
// Invitations
// =========================================================================

/// Status of a lesson invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum InvitationStatus {
    /// Awaiting the tutor's answer.
    Pending = 1,
    /// The tutor accepted and won the race.
    Accepted = 2,
    /// The tutor declined.
    Rejected = 3,
    /// Nobody answered before the deadline.
    Expired = 4,
    /// The student withdrew the invitation.
    Cancelled = 5,
    /// A sibling invitation for the same preference was accepted.
    AutoRejected = 6,
}

impl InvitationStatus {
    /// Convert the status to its numeric representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to convert a numeric value to an `InvitationStatus`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Pending),
            2 => Some(Self::Accepted),
            3 => Some(Self::Rejected),
            4 => Some(Self::Expired),
            5 => Some(Self::Cancelled),
            6 => Some(Self::AutoRejected),
            _ => None,
        }
    }
}

/// Result of opening a new preference for a student.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// The preference was written. Stale pending preferences of the student were
    /// cancelled in the same batch.
    Opened {
        /// Preferences moved `Pending → Cancelled`.
        retired: Vec<PreferenceId>,
    },
    /// Another preference of the student is matched or still has pending invitations.
    Blocked(PreferenceId),
}

/// Result of writing a fan-out batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutOutcome {
    /// Every invitation was written.
    Inserted,
    /// The preference left `Pending` before the batch arrived.
    PreferenceResolved(PreferenceStatus),
    /// The student already has pending invitations for the same subject and topic.
    Outstanding(PreferenceId),
}

/// An offer to one tutor to teach one student a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonInvitation {
    /// Unique identifier, derived from `(preference_id, tutor_id)`.
    pub invitation_id: InvitationId,
    /// Preference this invitation was fanned out for.
    pub preference_id: PreferenceId,
    /// Requesting student.
    pub student_id: StudentId,
    /// Invited tutor.
    pub tutor_id: TutorId,
    /// Requested subject.
    pub subject_id: SubjectId,
    /// Requested topic.
    pub topic_id: TopicId,
    /// Hours of the tutor's grid that overlapped the request when the invitation was sent.
    pub matching_hours: Vec<u8>,
    /// Days of the tutor's grid that overlapped the request when the invitation was sent.
    pub matching_days: Vec<DayOfWeek>,
    /// Matcher score at fan-out time.
    pub score: f64,
    /// Whether the tutor matched the requested window exactly (not via tolerance).
    pub exact_match: bool,
    /// Current status.
    pub status: InvitationStatus,
    /// When the invitation was sent.
    pub sent_at: DateTime<Utc>,
    /// Deadline for an answer.
    pub expires_at: DateTime<Utc>,
    /// When the status last left `Pending`.
    #[serde(default)]
    pub responded_at: Option<DateTime<Utc>>,
    /// The tutor's note.
    #[serde(default)]
    pub tutor_response: Option<String>,
    /// Payment authorization held for this invitation.
    #[serde(default)]
    pub authorization_id: Option<PaymentAuthorizationId>,
    /// Lesson price in cents.
    pub amount_cents: u32,
    /// Set when an acceptance could not be completed or rolled back cleanly.
    #[serde(default)]
    pub needs_review: bool,
}

/// Result of trying to claim an invitation for its preference.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The invitation is now `Accepted` and its preference `Matched`.
    Claimed(LessonInvitation),
    /// The invitation had already left `Pending`.
    InvitationNotPending(InvitationStatus),
    /// The invitation is still pending but its deadline has passed.
    PastDeadline,
    /// Another invitation already won the preference, or it was cancelled.
    PreferenceResolved(PreferenceStatus),
}

// =========================================================================
// Lessons
// =========================================================================

/// Status of a lesson.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonStatus {
    /// Booked and upcoming.
    Scheduled,
    /// Taught.
    Completed,
    /// Called off.
    Cancelled,
    /// Moved to another slot, still upcoming.
    Rescheduled,
}

impl LessonStatus {
    /// Returns true for lessons that are still going to happen.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Scheduled | Self::Rescheduled)
    }
}

/// A materialized booking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    /// Unique identifier for the lesson.
    pub lesson_id: LessonId,
    /// Student taking the lesson.
    pub student_id: StudentId,
    /// Tutor teaching the lesson.
    pub tutor_id: TutorId,
    /// Topic being taught.
    pub topic_id: TopicId,
    /// The invitation that produced this lesson, if any.
    #[serde(default)]
    pub invitation_id: Option<InvitationId>,
    /// Start time.
    pub scheduled_at: DateTime<Utc>,
    /// Length in minutes.
    pub duration_minutes: u32,
    /// Grid slot consumed by the lesson, if one was blocked.
    #[serde(default)]
    pub slot: Option<Slot>,
    /// Current status.
    pub status: LessonStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

/// A concrete start time paired with the grid slot it consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCandidate {
    /// Grid slot to block.
    pub slot: Slot,
    /// Start time of the lesson if this slot is used.
    pub starts_at: DateTime<Utc>,
}

/// Everything written by a successful acceptance, as one batch.
#[derive(Debug, Clone)]
pub struct BookingCommit {
    /// The claimed invitation.
    pub invitation_id: InvitationId,
    /// Lesson to create. `scheduled_at` and `slot` are filled in by the store.
    pub lesson: Lesson,
    /// Slots to try, earliest first. The first one still available is blocked.
    pub candidates: Vec<SlotCandidate>,
    /// Start time to use without blocking a slot when `candidates` is empty.
    pub fallback_start: Option<DateTime<Utc>>,
    /// Completion record to write (normally in-progress).
    pub completion: TopicCompletion,
    /// Commit timestamp.
    pub at: DateTime<Utc>,
}

/// Result of committing a claimed invitation.
#[derive(Debug, Clone)]
pub enum BookingOutcome {
    /// The lesson was written.
    Booked(BookingReceipt),
    /// Every candidate slot was taken and there was no fallback.
    NoSlot,
    /// The student already has a live lesson on the topic.
    TopicInProgress(LessonId),
    /// The student already completed the topic.
    TopicCompleted,
}

/// What a committed booking produced.
#[derive(Debug, Clone)]
pub struct BookingReceipt {
    /// The created lesson.
    pub lesson: Lesson,
    /// Sibling invitations flipped to `AutoRejected` by this commit.
    pub auto_rejected: Vec<LessonInvitation>,
    /// The preference, now `Confirmed`.
    pub preference: StudentMatchingPreference,
}

/// Everything written when a lesson is taught, as one batch.
#[derive(Debug, Clone, Copy)]
pub struct CompletionCommit {
    /// The lesson being completed.
    pub lesson_id: LessonId,
    /// Completed lessons the topic needs.
    pub lessons_required: u32,
    /// XP recorded when the topic completes.
    pub xp_reward: u32,
    /// Commit timestamp.
    pub at: DateTime<Utc>,
}

/// What a lesson completion produced.
#[derive(Debug, Clone)]
pub struct CompletionReceipt {
    /// The lesson, now `Completed`.
    pub lesson: Lesson,
    /// The topic's completion record after the increment.
    pub completion: TopicCompletion,
    /// True when this lesson completed the topic.
    pub topic_completed: bool,
}

/// Result of moving a lesson to another slot.
#[derive(Debug, Clone)]
pub enum MoveOutcome {
    /// The lesson now holds the new slot and the old one was freed.
    Moved(Lesson),
    /// The lesson is no longer live.
    NotLive(LessonStatus),
    /// The target slot is unknown or not available.
    SlotTaken,
}
