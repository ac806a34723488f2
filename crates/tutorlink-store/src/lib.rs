//! `RocksDB` storage layer for tutorlink.
//!
//! This crate provides persistent storage for the curriculum, tutor availability,
//! matching preferences, invitations and lessons using `RocksDB` with column families
//! for efficient indexing.
//!
//! # Architecture
//!
//! Primary records live in one column family each (`topics`, `completions`, `tutors`,
//! `availability`, `preferences`, `invitations`, `lessons`, ...). Secondary indexes are
//! separate column families whose keys are `owner || record_id` with empty values.
//!
//! Every read-modify-write goes through a single write gate, so the conditional
//! updates below (`open_preference`, `insert_invitations`, `transition_*`,
//! `claim_invitation`, `commit_booking`, `complete_lesson`, `move_lesson`) behave like
//! `UPDATE ... WHERE status = 'expected'`: they either apply completely or report that
//! the expected state no longer holds. Multi-record writes are a single `WriteBatch`,
//! so readers never see half of a commit.
//!
//! # Example
//!
//! ```no_run
//! use tutorlink_store::{RocksStore, Store, InvitationStatus};
//!
//! let store = RocksStore::open("/tmp/tutorlink-db").unwrap();
//!
//! // Everything still waiting on a tutor
//! let pending = store.list_invitations_by_status(InvitationStatus::Pending).unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use types::{
    AvailabilitySlot, BookingCommit, BookingOutcome, BookingReceipt, ClaimOutcome,
    CompletionCommit, CompletionReceipt, CompletionStatus, FanOutOutcome, InvitationStatus,
    Lesson, LessonInvitation, LessonStatus, MoveOutcome, OpenOutcome, PreferenceStatus,
    QuizAttempt, SlotCandidate, StudentMatchingPreference, Topic, TopicCompletion, Tutor,
};

use chrono::{DateTime, Utc};
use tutorlink_core::{
    InvitationId, LessonId, PreferenceId, Slot, StudentId, TopicId, TutorId,
};

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer, allowing for different implementations
/// (e.g., `RocksDB`, a relational database with row-level conditional updates).
pub trait Store: Send + Sync {
    // =========================================================================
    // Curriculum
    // =========================================================================

    /// Insert or update a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_topic(&self, topic: &Topic) -> Result<()>;

    /// Get a topic by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_topic(&self, topic_id: &TopicId) -> Result<Option<Topic>>;

    /// List all topics ordered by subject, then ordinal.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_topics(&self) -> Result<Vec<Topic>>;

    // =========================================================================
    // Progress
    // =========================================================================

    /// Get the completion record for `(student, topic)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_completion(
        &self,
        student_id: &StudentId,
        topic_id: &TopicId,
    ) -> Result<Option<TopicCompletion>>;

    /// List all completion records of a student.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_completions(&self, student_id: &StudentId) -> Result<Vec<TopicCompletion>>;

    /// Record a quiz attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_quiz_attempt(&self, attempt: &QuizAttempt) -> Result<()>;

    /// List all quiz attempts of a student.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_quiz_attempts(&self, student_id: &StudentId) -> Result<Vec<QuizAttempt>>;

    // =========================================================================
    // Tutors and availability
    // =========================================================================

    /// Insert or update a tutor profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_tutor(&self, tutor: &Tutor) -> Result<()>;

    /// Get a tutor by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_tutor(&self, tutor_id: &TutorId) -> Result<Option<Tutor>>;

    /// List all tutors.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_tutors(&self) -> Result<Vec<Tutor>>;

    /// Mark grid slots as available or unavailable.
    ///
    /// Slots currently booked by a lesson are left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn set_availability(&self, tutor_id: &TutorId, slots: &[Slot], available: bool) -> Result<()>;

    /// Get a tutor's grid in weekly order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_availability(&self, tutor_id: &TutorId) -> Result<Vec<AvailabilitySlot>>;

    // =========================================================================
    // Preferences
    // =========================================================================

    /// Write a new preference, keeping at most one active preference per student.
    ///
    /// Active preferences of the same student that are still `Pending` without any
    /// pending invitation are cancelled in the same batch. A `Matched` preference, or a
    /// `Pending` one with pending invitations, blocks the write.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the preference ID already exists.
    fn open_preference(&self, preference: &StudentMatchingPreference) -> Result<OpenOutcome>;

    /// Get a preference by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_preference(&self, preference_id: &PreferenceId)
        -> Result<Option<StudentMatchingPreference>>;

    /// List all preferences of a student.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_preferences_by_student(
        &self,
        student_id: &StudentId,
    ) -> Result<Vec<StudentMatchingPreference>>;

    /// Compare-and-set a preference's status.
    ///
    /// Returns the updated preference, or `None` if its status was not `expected`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the preference doesn't exist.
    fn transition_preference(
        &self,
        preference_id: &PreferenceId,
        expected: PreferenceStatus,
        target: PreferenceStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<StudentMatchingPreference>>;

    // =========================================================================
    // Invitations
    // =========================================================================

    /// Insert the fan-out batch of one preference.
    ///
    /// Nothing is written unless the preference is still `Pending` and no preference of
    /// the same student, subject and topic (this one included) has a pending invitation.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` on a duplicate invitation or a batch spanning
    /// several preferences, and `StoreError::NotFound` if the preference doesn't exist.
    fn insert_invitations(&self, invitations: &[LessonInvitation]) -> Result<FanOutOutcome>;

    /// Get an invitation by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_invitation(&self, invitation_id: &InvitationId) -> Result<Option<LessonInvitation>>;

    /// List all invitations fanned out for a preference.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_invitations_by_preference(
        &self,
        preference_id: &PreferenceId,
    ) -> Result<Vec<LessonInvitation>>;

    /// List all invitations with a given status.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_invitations_by_status(&self, status: InvitationStatus)
        -> Result<Vec<LessonInvitation>>;

    /// List all invitations sent to a tutor.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_invitations_by_tutor(&self, tutor_id: &TutorId) -> Result<Vec<LessonInvitation>>;

    /// Compare-and-set an invitation's status.
    ///
    /// Returns the updated invitation, or `None` if its status was not `expected`
    /// ("0 rows affected").
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the invitation doesn't exist.
    fn transition_invitation(
        &self,
        invitation_id: &InvitationId,
        expected: InvitationStatus,
        target: InvitationStatus,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Option<LessonInvitation>>;

    /// Atomically move an invitation `pending → accepted` and its preference
    /// `pending → matched`.
    ///
    /// This is the single point where a preference's race is decided.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the invitation or its preference doesn't exist.
    fn claim_invitation(&self, invitation_id: &InvitationId, at: DateTime<Utc>)
        -> Result<ClaimOutcome>;

    /// Undo a claim: invitation `accepted → revert_to`, preference `matched → pending`.
    ///
    /// Returns `false` if the invitation no longer holds the claim.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the invitation or its preference doesn't exist.
    fn release_claim(
        &self,
        invitation_id: &InvitationId,
        revert_to: InvitationStatus,
        needs_review: bool,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Commit a claimed invitation as a booked lesson in one batch.
    ///
    /// Refuses when the student already has a live lesson on the topic or has completed
    /// it. Otherwise blocks the first available candidate slot (or uses
    /// `fallback_start`), writes the lesson and completion, flips every pending sibling
    /// to `AutoRejected` and moves the preference to `Confirmed`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the invitation does not hold its preference's claim.
    fn commit_booking(&self, commit: &BookingCommit) -> Result<BookingOutcome>;

    // =========================================================================
    // Lessons
    // =========================================================================

    /// Get a lesson by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_lesson(&self, lesson_id: &LessonId) -> Result<Option<Lesson>>;

    /// List all lessons of a student.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_lessons_by_student(&self, student_id: &StudentId) -> Result<Vec<Lesson>>;

    /// List all lessons of a tutor.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_lessons_by_tutor(&self, tutor_id: &TutorId) -> Result<Vec<Lesson>>;

    /// Compare-and-set a lesson's status.
    ///
    /// A lesson leaving the live states gives its grid slot back in the same batch.
    /// Returns the updated lesson, or `None` if its status was not `expected`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the lesson doesn't exist.
    fn transition_lesson(
        &self,
        lesson_id: &LessonId,
        expected: LessonStatus,
        target: LessonStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Lesson>>;

    /// Mark a live lesson taught in one batch.
    ///
    /// Frees the lesson's slot, counts the lesson on the topic's completion record
    /// (completing the topic once `lessons_required` is reached) and increments the
    /// tutor's `total_lessons`. Returns `None` if the lesson is no longer live.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the lesson doesn't exist.
    fn complete_lesson(&self, commit: &CompletionCommit) -> Result<Option<CompletionReceipt>>;

    /// Move a live lesson to another open slot of its tutor in one batch.
    ///
    /// Blocks the target slot and frees the old one.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the lesson doesn't exist.
    fn move_lesson(
        &self,
        lesson_id: &LessonId,
        to: SlotCandidate,
        at: DateTime<Utc>,
    ) -> Result<MoveOutcome>;
}
