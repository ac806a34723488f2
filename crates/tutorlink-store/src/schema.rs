//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Curriculum topics, keyed by `topic_id`.
    pub const TOPICS: &str = "topics";

    /// Per-student topic completion, keyed by `student_id || topic_id`.
    pub const COMPLETIONS: &str = "completions";

    /// Quiz attempts, keyed by `student_id || topic_id || attempt_id`.
    pub const QUIZ_ATTEMPTS: &str = "quiz_attempts";

    /// Tutor profiles, keyed by `tutor_id`.
    pub const TUTORS: &str = "tutors";

    /// Weekly availability grid, keyed by `tutor_id || day || hour`.
    pub const AVAILABILITY: &str = "availability";

    /// Matching preferences, keyed by `preference_id`.
    pub const PREFERENCES: &str = "preferences";

    /// Index: preferences by student, keyed by `student_id || preference_id`.
    pub const PREFERENCES_BY_STUDENT: &str = "preferences_by_student";

    /// Lesson invitations, keyed by `invitation_id`.
    pub const INVITATIONS: &str = "invitations";

    /// Index: invitations by preference, keyed by `preference_id || invitation_id`.
    pub const INVITATIONS_BY_PREFERENCE: &str = "invitations_by_preference";

    /// Index: invitations by status, keyed by `status || invitation_id`.
    pub const INVITATIONS_BY_STATUS: &str = "invitations_by_status";

    /// Index: invitations by tutor, keyed by `tutor_id || invitation_id`.
    pub const INVITATIONS_BY_TUTOR: &str = "invitations_by_tutor";

    /// Lessons, keyed by `lesson_id`.
    pub const LESSONS: &str = "lessons";

    /// Index: lessons by student, keyed by `student_id || lesson_id`.
    pub const LESSONS_BY_STUDENT: &str = "lessons_by_student";

    /// Index: lessons by tutor, keyed by `tutor_id || lesson_id`.
    pub const LESSONS_BY_TUTOR: &str = "lessons_by_tutor";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::TOPICS,
        cf::COMPLETIONS,
        cf::QUIZ_ATTEMPTS,
        cf::TUTORS,
        cf::AVAILABILITY,
        cf::PREFERENCES,
        cf::PREFERENCES_BY_STUDENT,
        cf::INVITATIONS,
        cf::INVITATIONS_BY_PREFERENCE,
        cf::INVITATIONS_BY_STATUS,
        cf::INVITATIONS_BY_TUTOR,
        cf::LESSONS,
        cf::LESSONS_BY_STUDENT,
        cf::LESSONS_BY_TUTOR,
    ]
}
