//! Invitation, lesson and preference state machines.
//!
//! Every status change in the engine is checked against the tables in this module
//! before it is handed to the store's compare-and-set.
//!
//! # Invitations
//!
//! ```text
//!                 ┌──────────┐
//!                 │ Pending  │◄──────────────┐
//!                 └────┬─────┘               │ (capture failed,
//!                      │                     │  before deadline)
//!   ┌──────────┬───────┼─────────┬───────────┴──┐
//!   ▼          ▼       ▼         ▼              ▼
//! Rejected  Expired  Cancelled  AutoRejected  Accepted
//!              ▲                                │
//!              └────────────────────────────────┘
//!                (capture failed after deadline, or no slot left)
//! ```
//!
//! The two edges out of `Accepted` are compensation edges, used only to roll back
//! an acceptance that could not be completed. No edge ever leaves `Rejected`,
//! `Expired`, `Cancelled` or `AutoRejected`.
//!
//! # Lessons
//!
//! `Scheduled` and `Rescheduled` may move to `Completed`, `Cancelled` or `Rescheduled`.
//!
//! # Preferences
//!
//! `Pending → Matched | Cancelled`, `Matched → Confirmed | Pending`.

use tutorlink_core::{InvitationId, LessonId, PreferenceId};
use tutorlink_store::{InvitationStatus, LessonStatus, PreferenceStatus};

use crate::error::{EngineError, Result};

/// Check if a forward invitation transition is valid.
#[must_use]
pub const fn is_valid_invitation_transition(from: InvitationStatus, to: InvitationStatus) -> bool {
    use InvitationStatus::{Accepted, AutoRejected, Cancelled, Expired, Pending, Rejected};

    matches!(
        (from, to),
        (Pending, Accepted | Rejected | Expired | Cancelled | AutoRejected)
    )
}

/// Check if a transition is one of the acceptance rollback edges.
#[must_use]
pub const fn is_compensation(from: InvitationStatus, to: InvitationStatus) -> bool {
    use InvitationStatus::{Accepted, Expired, Pending};

    matches!((from, to), (Accepted, Pending | Expired))
}

/// Validates an invitation transition and returns the target status if valid.
///
/// # Errors
///
/// Returns `EngineError::InvalidInvitationTransition` if the transition is not allowed.
pub fn validate_invitation_transition(
    invitation_id: &InvitationId,
    from: InvitationStatus,
    to: InvitationStatus,
) -> Result<InvitationStatus> {
    if is_valid_invitation_transition(from, to) {
        Ok(to)
    } else {
        Err(EngineError::InvalidInvitationTransition {
            invitation_id: *invitation_id,
            from,
            to,
        })
    }
}

/// Returns true if the invitation can no longer be answered.
#[must_use]
pub const fn is_resolved(status: InvitationStatus) -> bool {
    !matches!(status, InvitationStatus::Pending)
}

/// Check if a lesson transition is valid.
#[must_use]
pub const fn is_valid_lesson_transition(from: LessonStatus, to: LessonStatus) -> bool {
    use LessonStatus::{Cancelled, Completed, Rescheduled, Scheduled};

    matches!(
        (from, to),
        (Scheduled | Rescheduled, Completed | Cancelled | Rescheduled)
    )
}

/// Validates a lesson transition and returns the target status if valid.
///
/// # Errors
///
/// Returns `EngineError::InvalidLessonTransition` if the transition is not allowed.
pub fn validate_lesson_transition(
    lesson_id: &LessonId,
    from: LessonStatus,
    to: LessonStatus,
) -> Result<LessonStatus> {
    if is_valid_lesson_transition(from, to) {
        Ok(to)
    } else {
        Err(EngineError::InvalidLessonTransition {
            lesson_id: *lesson_id,
            from,
            to,
        })
    }
}

/// Check if a preference transition is valid.
#[must_use]
pub const fn is_valid_preference_transition(from: PreferenceStatus, to: PreferenceStatus) -> bool {
    use PreferenceStatus::{Cancelled, Confirmed, Matched, Pending};

    matches!(
        (from, to),
        (Pending, Matched | Cancelled) | (Matched, Confirmed | Pending)
    )
}

/// Validates a preference transition and returns the target status if valid.
///
/// # Errors
///
/// Returns `EngineError::InvalidPreferenceTransition` if the transition is not allowed.
pub fn validate_preference_transition(
    preference_id: &PreferenceId,
    from: PreferenceStatus,
    to: PreferenceStatus,
) -> Result<PreferenceStatus> {
    if is_valid_preference_transition(from, to) {
        Ok(to)
    } else {
        Err(EngineError::InvalidPreferenceTransition {
            preference_id: *preference_id,
            from,
            to,
        })
    }
}
