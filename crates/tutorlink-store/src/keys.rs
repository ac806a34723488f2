//! Key encoding utilities for `RocksDB`.
//!
//! This module provides functions to encode and decode keys for various indexes.
//! All keys are designed to support efficient prefix scans: every secondary index
//! key ends with the 16-byte ID of the record it points at.

use tutorlink_core::{
    AttemptId, InvitationId, LessonId, PreferenceId, Slot, StudentId, TopicId, TutorId,
};

/// Length of an encoded ID.
pub const ID_LEN: usize = 16;

fn concat(parts: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for part in parts {
        key.extend_from_slice(part);
    }
    key
}

/// Extract the trailing record ID from an index key.
///
/// # Panics
///
/// Panics if the key is shorter than 16 bytes.
#[must_use]
pub fn trailing_id(key: &[u8]) -> [u8; ID_LEN] {
    let mut bytes = [0u8; ID_LEN];
    bytes.copy_from_slice(&key[key.len() - ID_LEN..]);
    bytes
}

/// Encode a topic key.
#[must_use]
pub fn topic_key(topic_id: &TopicId) -> Vec<u8> {
    topic_id.as_bytes().to_vec()
}

/// Encode a completion key: `student_id || topic_id`.
///
/// One key per pair makes the "one completion row per (student, topic)" rule structural.
#[must_use]
pub fn completion_key(student_id: &StudentId, topic_id: &TopicId) -> Vec<u8> {
    concat(&[student_id.as_bytes(), topic_id.as_bytes()])
}

/// Encode a student prefix for scanning completions, attempts and index entries.
#[must_use]
pub fn student_prefix(student_id: &StudentId) -> Vec<u8> {
    student_id.as_bytes().to_vec()
}

/// Encode a quiz attempt key: `student_id || topic_id || attempt_id`.
#[must_use]
pub fn quiz_attempt_key(student_id: &StudentId, topic_id: &TopicId, attempt: &AttemptId) -> Vec<u8> {
    concat(&[student_id.as_bytes(), topic_id.as_bytes(), attempt.as_bytes()])
}

/// Encode a tutor key.
#[must_use]
pub fn tutor_key(tutor_id: &TutorId) -> Vec<u8> {
    tutor_id.as_bytes().to_vec()
}

/// Encode a tutor prefix for scanning availability and index entries.
#[must_use]
pub fn tutor_prefix(tutor_id: &TutorId) -> Vec<u8> {
    tutor_id.as_bytes().to_vec()
}

/// Encode an availability key: `tutor_id || day || hour`.
///
/// Keys sort by day, then hour, so a prefix scan yields the grid in weekly order.
#[must_use]
pub fn availability_key(tutor_id: &TutorId, slot: &Slot) -> Vec<u8> {
    concat(&[tutor_id.as_bytes(), &[slot.day.as_u8(), slot.hour]])
}

/// Encode a preference key.
#[must_use]
pub fn preference_key(preference_id: &PreferenceId) -> Vec<u8> {
    preference_id.as_bytes().to_vec()
}

/// Encode a student-preference index key: `student_id || preference_id`.
#[must_use]
pub fn student_preference_key(student_id: &StudentId, preference_id: &PreferenceId) -> Vec<u8> {
    concat(&[student_id.as_bytes(), preference_id.as_bytes()])
}

/// Encode an invitation key.
#[must_use]
pub fn invitation_key(invitation_id: &InvitationId) -> Vec<u8> {
    invitation_id.as_bytes().to_vec()
}

/// Encode a preference-invitation index key: `preference_id || invitation_id`.
#[must_use]
pub fn preference_invitation_key(
    preference_id: &PreferenceId,
    invitation_id: &InvitationId,
) -> Vec<u8> {
    concat(&[preference_id.as_bytes(), invitation_id.as_bytes()])
}

/// Encode a preference prefix for scanning invitations by preference.
#[must_use]
pub fn preference_prefix(preference_id: &PreferenceId) -> Vec<u8> {
    preference_id.as_bytes().to_vec()
}

/// Encode a status-invitation index key: `status || invitation_id`.
#[must_use]
pub fn status_invitation_key(status: u8, invitation_id: &InvitationId) -> Vec<u8> {
    concat(&[&[status], invitation_id.as_bytes()])
}

/// Encode a status prefix for scanning invitations by status.
#[must_use]
pub fn status_prefix(status: u8) -> Vec<u8> {
    vec![status]
}

/// Encode a tutor-invitation index key: `tutor_id || invitation_id`.
#[must_use]
pub fn tutor_invitation_key(tutor_id: &TutorId, invitation_id: &InvitationId) -> Vec<u8> {
    concat(&[tutor_id.as_bytes(), invitation_id.as_bytes()])
}

/// Encode a lesson key.
#[must_use]
pub fn lesson_key(lesson_id: &LessonId) -> Vec<u8> {
    lesson_id.as_bytes().to_vec()
}

/// Encode a student-lesson index key: `student_id || lesson_id`.
#[must_use]
pub fn student_lesson_key(student_id: &StudentId, lesson_id: &LessonId) -> Vec<u8> {
    concat(&[student_id.as_bytes(), lesson_id.as_bytes()])
}

/// Encode a tutor-lesson index key: `tutor_id || lesson_id`.
#[must_use]
pub fn tutor_lesson_key(tutor_id: &TutorId, lesson_id: &LessonId) -> Vec<u8> {
    concat(&[tutor_id.as_bytes(), lesson_id.as_bytes()])
}
