//! Error types for the tutoring engine.
//!
//! This module defines every error a caller can see from progression, matching,
//! invitation and lesson operations.

use thiserror::Error;
use tutorlink_core::{
    InvitationId, LessonId, PreferenceId, Slot, SlotError, StudentId, TopicId, TutorId,
};
use tutorlink_store::{InvitationStatus, LessonStatus, PreferenceStatus};

use crate::collaborators::CollaboratorError;
use crate::types::TopicStatus;

/// A result type using `EngineError`.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The student asked for a topic that is locked, in progress or completed.
    #[error("topic {topic_id} is not bookable for student {student_id}: it is {status:?}")]
    NoEligibleTopic {
        /// The requesting student.
        student_id: StudentId,
        /// The requested topic.
        topic_id: TopicId,
        /// The topic's derived status.
        status: TopicStatus,
    },

    /// No tutor passed the filters, or no slot is left to book.
    #[error("no candidates for preference {preference_id} ({alternatives} ranked below the invite threshold)")]
    NoCandidates {
        /// The preference that could not be served.
        preference_id: PreferenceId,
        /// Ranked candidates that were not invited (availability-only or low score).
        alternatives: usize,
    },

    /// The invitation's race was already decided, or it left `Pending`.
    #[error("invitation {0} is already resolved")]
    AlreadyResolved(InvitationId),

    /// Payment capture failed and the acceptance was rolled back.
    #[error("payment capture failed for invitation {invitation_id}: {reason}")]
    PaymentCaptureFailed {
        /// The invitation whose acceptance was rolled back.
        invitation_id: InvitationId,
        /// Gateway message.
        reason: String,
    },

    /// The student already has an active preference with invitations outstanding.
    #[error("student {student_id} already has active preference {preference_id}")]
    ActivePreferenceExists {
        /// The requesting student.
        student_id: StudentId,
        /// The active preference.
        preference_id: PreferenceId,
    },

    /// Invitations for this subject and topic are still pending.
    #[error("invitations for topic {topic_id} are still outstanding for student {student_id}")]
    InvitationsOutstanding {
        /// The requesting student.
        student_id: StudentId,
        /// The requested topic.
        topic_id: TopicId,
    },

    /// The preference was resolved before its invitations could be written.
    #[error("preference {preference_id} is {status:?}, not pending")]
    PreferenceClosed {
        /// The preference.
        preference_id: PreferenceId,
        /// Its status at the time of the write.
        status: PreferenceStatus,
    },

    /// The requested topic was not found.
    #[error("topic not found: {0}")]
    TopicNotFound(TopicId),

    /// The requested tutor was not found.
    #[error("tutor not found: {0}")]
    TutorNotFound(TutorId),

    /// The requested preference was not found.
    #[error("preference not found: {0}")]
    PreferenceNotFound(PreferenceId),

    /// The requested invitation was not found.
    #[error("invitation not found: {0}")]
    InvitationNotFound(InvitationId),

    /// The requested lesson was not found.
    #[error("lesson not found: {0}")]
    LessonNotFound(LessonId),

    /// The tutor is not the recipient of the invitation.
    #[error("tutor {tutor_id} was not invited by {invitation_id}")]
    NotInvitee {
        /// The responding tutor.
        tutor_id: TutorId,
        /// The invitation.
        invitation_id: InvitationId,
    },

    /// The student does not own the preference or invitation.
    #[error("student {student_id} does not own preference {preference_id}")]
    NotRequester {
        /// The acting student.
        student_id: StudentId,
        /// The preference being acted on.
        preference_id: PreferenceId,
    },

    /// The actor is neither the student nor the tutor of the lesson.
    #[error("actor is not a participant of lesson {0}")]
    NotParticipant(LessonId),

    /// The requested invitation transition is not valid.
    #[error("invalid transition for invitation {invitation_id}: cannot transition from {from:?} to {to:?}")]
    InvalidInvitationTransition {
        /// The invitation.
        invitation_id: InvitationId,
        /// The current status.
        from: InvitationStatus,
        /// The requested status.
        to: InvitationStatus,
    },

    /// The requested lesson transition is not valid.
    #[error("invalid transition for lesson {lesson_id}: cannot transition from {from:?} to {to:?}")]
    InvalidLessonTransition {
        /// The lesson.
        lesson_id: LessonId,
        /// The current status.
        from: LessonStatus,
        /// The requested status.
        to: LessonStatus,
    },

    /// The requested preference transition is not valid.
    #[error("invalid transition for preference {preference_id}: cannot transition from {from:?} to {to:?}")]
    InvalidPreferenceTransition {
        /// The preference.
        preference_id: PreferenceId,
        /// The current status.
        from: PreferenceStatus,
        /// The requested status.
        to: PreferenceStatus,
    },

    /// The target slot cannot be booked.
    #[error("slot {slot:?} of tutor {tutor_id} is not available")]
    SlotUnavailable {
        /// The tutor.
        tutor_id: TutorId,
        /// The slot.
        slot: Slot,
    },

    /// The request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A slot or window could not be built.
    #[error("invalid slot: {0}")]
    InvalidSlot(#[from] SlotError),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] tutorlink_store::StoreError),

    /// An external collaborator failed on a path that cannot ignore it.
    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns the appropriate HTTP status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) | Self::InvalidSlot(_) => 400,
            Self::PaymentCaptureFailed { .. } => 402,
            Self::NotInvitee { .. } | Self::NotRequester { .. } | Self::NotParticipant(_) => 403,
            Self::TopicNotFound(_)
            | Self::TutorNotFound(_)
            | Self::PreferenceNotFound(_)
            | Self::InvitationNotFound(_)
            | Self::LessonNotFound(_) => 404,
            Self::AlreadyResolved(_)
            | Self::ActivePreferenceExists { .. }
            | Self::InvitationsOutstanding { .. }
            | Self::PreferenceClosed { .. }
            | Self::InvalidInvitationTransition { .. }
            | Self::InvalidLessonTransition { .. }
            | Self::InvalidPreferenceTransition { .. }
            | Self::SlotUnavailable { .. } => 409,
            Self::NoEligibleTopic { .. } | Self::NoCandidates { .. } => 422,
            Self::Collaborator(_) => 502,
            Self::Store(_) | Self::Internal(_) => 500,
        }
    }

    /// Returns true if this error might be resolved by retrying.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Collaborator(_) | Self::PaymentCaptureFailed { .. } | Self::Internal(_)
        )
    }
}
