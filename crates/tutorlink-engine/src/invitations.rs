//! Invitation lifecycle.
//!
//! The `InvitationManager` fans a preference out to the selected tutors, resolves their
//! responses and materializes the winning acceptance as a lesson.
//!
//! # Acceptance
//!
//! Accepting runs as a short saga over the store's conditional updates:
//!
//! 1. **Claim.** The invitation moves `Pending → Accepted` and its preference
//!    `Pending → Matched` in one conditional update. This is where concurrent
//!    acceptances for the same preference are decided; every loser sees
//!    `AlreadyResolved`.
//! 2. **Capture.** The payment authorization is captured. On failure the claim is
//!    released (back to `Pending` before the deadline, otherwise `Expired` and flagged
//!    for review) and nothing else is written.
//! 3. **Commit.** One batch blocks the first still-open candidate slot, writes the
//!    lesson and the in-progress completion, auto-rejects every pending sibling and
//!    confirms the preference. If every candidate slot was taken in the meantime the
//!    claim is released, the capture refunded and the caller gets `NoCandidates`.
//!
//! Side effects on collaborators (releasing sibling holds, notifications) run after
//! the commit and never undo it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tutorlink_core::{InvitationId, LessonId, PreferenceId, StudentId, TutorId};
use tutorlink_store::{
    BookingCommit, BookingOutcome, ClaimOutcome, CompletionStatus, FanOutOutcome,
    InvitationStatus, Lesson, LessonInvitation, LessonStatus, PreferenceStatus, Store,
    StudentMatchingPreference, TopicCompletion,
};

use crate::booking;
use crate::collaborators::{Collaborators, Participant};
use crate::error::{EngineError, Result};
use crate::lifecycle;
use crate::matcher::Candidate;
use crate::types::{EngineConfig, RespondOutcome, TopicStatus, TutorResponse};

/// Move a pending invitation to `Expired`.
///
/// Returns the expired invitation, or `None` if it had already left `Pending`.
///
/// # Errors
///
/// Returns an error if the store operation fails.
pub fn expire_invitation<S: Store>(
    store: &S,
    invitation_id: &InvitationId,
    now: DateTime<Utc>,
) -> Result<Option<LessonInvitation>> {
    let expired = store.transition_invitation(
        invitation_id,
        InvitationStatus::Pending,
        InvitationStatus::Expired,
        None,
        now,
    )?;

    if let Some(invitation) = &expired {
        tracing::info!(
            invitation_id = %invitation.invitation_id,
            preference_id = %invitation.preference_id,
            tutor_id = %invitation.tutor_id,
            "Invitation expired"
        );
    }
    Ok(expired)
}

/// Creates invitations and resolves tutor responses.
pub struct InvitationManager<S: Store> {
    store: Arc<S>,
    collaborators: Collaborators,
    config: EngineConfig,
}

impl<S: Store> InvitationManager<S> {
    /// Create a new invitation manager.
    #[must_use]
    pub fn new(store: Arc<S>, collaborators: Collaborators, config: EngineConfig) -> Self {
        Self {
            store,
            collaborators,
            config,
        }
    }

    /// Get a reference to the store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    // =========================================================================
    // Fan-out
    // =========================================================================

    /// Send one invitation per candidate.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvitationsOutstanding` if the student still has pending
    /// invitations for the same subject and topic, and `EngineError::NoCandidates` if no
    /// payment hold could be placed for any candidate.
    pub async fn create_invitations(
        &self,
        preference: &StudentMatchingPreference,
        candidates: &[&Candidate],
    ) -> Result<Vec<LessonInvitation>> {
        self.create_invitations_at(preference, candidates, Utc::now())
            .await
    }

    /// Send one invitation per candidate, as of `now`.
    ///
    /// # Errors
    ///
    /// See [`InvitationManager::create_invitations`].
    pub async fn create_invitations_at(
        &self,
        preference: &StudentMatchingPreference,
        candidates: &[&Candidate],
        now: DateTime<Utc>,
    ) -> Result<Vec<LessonInvitation>> {
        if preference.status != PreferenceStatus::Pending {
            return Err(EngineError::PreferenceClosed {
                preference_id: preference.preference_id,
                status: preference.status,
            });
        }
        self.ensure_nothing_outstanding(preference)?;

        let mut invitations = Vec::with_capacity(candidates.len());
        let mut addresses = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let tutor = &candidate.tutor;
            let amount_cents =
                booking::lesson_price_cents(tutor.hourly_rate_cents, self.config.lesson_duration_minutes);

            let authorization_id = match self
                .collaborators
                .payments
                .authorize(&preference.student_id, &tutor.tutor_id, amount_cents)
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(
                        preference_id = %preference.preference_id,
                        tutor_id = %tutor.tutor_id,
                        error = %e,
                        "Payment authorization failed, skipping tutor"
                    );
                    continue;
                }
            };

            invitations.push(LessonInvitation {
                invitation_id: InvitationId::derive(&preference.preference_id, &tutor.tutor_id),
                preference_id: preference.preference_id,
                student_id: preference.student_id,
                tutor_id: tutor.tutor_id,
                subject_id: preference.subject_id,
                topic_id: preference.topic_id,
                matching_hours: candidate.matching_hours.clone(),
                matching_days: candidate.matching_days.clone(),
                score: candidate.score,
                exact_match: candidate.exact_time_match(),
                status: InvitationStatus::Pending,
                sent_at: now,
                expires_at: now + self.config.invitation_ttl(),
                responded_at: None,
                tutor_response: None,
                authorization_id: Some(authorization_id),
                amount_cents,
                needs_review: false,
            });
            addresses.push(tutor.email.as_str());
        }

        if invitations.is_empty() {
            return Err(EngineError::NoCandidates {
                preference_id: preference.preference_id,
                alternatives: 0,
            });
        }

        // The preference may have been retired or fanned out while we were authorizing
        let refused = match self.store.insert_invitations(&invitations) {
            Ok(FanOutOutcome::Inserted) => None,
            Ok(FanOutOutcome::PreferenceResolved(status)) => Some(EngineError::PreferenceClosed {
                preference_id: preference.preference_id,
                status,
            }),
            Ok(FanOutOutcome::Outstanding(_)) => Some(EngineError::InvitationsOutstanding {
                student_id: preference.student_id,
                topic_id: preference.topic_id,
            }),
            Err(e) => Some(e.into()),
        };
        if let Some(error) = refused {
            for invitation in &invitations {
                self.collaborators
                    .release_payment(invitation.authorization_id)
                    .await;
            }
            tracing::warn!(
                preference_id = %preference.preference_id,
                error = %error,
                "Fan-out refused, released authorizations"
            );
            return Err(error);
        }

        let notices = invitations.iter().zip(&addresses).map(|(invitation, address)| {
            let text = format!(
                "New lesson request, please answer by {}",
                invitation.expires_at.to_rfc3339()
            );
            async move {
                self.collaborators
                    .notify(
                        Participant::Student(invitation.student_id),
                        Participant::Tutor(invitation.tutor_id),
                        &text,
                    )
                    .await;
                self.collaborators
                    .email(address, "New lesson request", &text)
                    .await;
            }
        });
        join_all(notices).await;

        tracing::info!(
            preference_id = %preference.preference_id,
            student_id = %preference.student_id,
            invitations = invitations.len(),
            "Fanned out lesson invitations"
        );

        Ok(invitations)
    }

    /// Reject a fan-out while earlier invitations for the same subject and topic are pending.
    fn ensure_nothing_outstanding(&self, preference: &StudentMatchingPreference) -> Result<()> {
        let mut related = self.store.list_preferences_by_student(&preference.student_id)?;
        if !related
            .iter()
            .any(|p| p.preference_id == preference.preference_id)
        {
            related.push(preference.clone());
        }

        for other in related {
            if other.subject_id != preference.subject_id || other.topic_id != preference.topic_id {
                continue;
            }
            let outstanding = self
                .store
                .list_invitations_by_preference(&other.preference_id)?
                .iter()
                .any(|i| i.status == InvitationStatus::Pending);
            if outstanding {
                return Err(EngineError::InvitationsOutstanding {
                    student_id: preference.student_id,
                    topic_id: preference.topic_id,
                });
            }
        }
        Ok(())
    }

    // =========================================================================
    // Responses
    // =========================================================================

    /// Resolve a tutor's response.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::AlreadyResolved` if the race was already decided or the
    /// invitation is past its deadline, `EngineError::PaymentCaptureFailed` if the
    /// acceptance was rolled back, and `EngineError::NoCandidates` if no slot is left.
    pub async fn respond(
        &self,
        invitation_id: &InvitationId,
        tutor_id: &TutorId,
        response: TutorResponse,
    ) -> Result<RespondOutcome> {
        self.respond_at(invitation_id, tutor_id, response, Utc::now())
            .await
    }

    /// Resolve a tutor's response, as of `now`.
    ///
    /// # Errors
    ///
    /// See [`InvitationManager::respond`].
    pub async fn respond_at(
        &self,
        invitation_id: &InvitationId,
        tutor_id: &TutorId,
        response: TutorResponse,
        now: DateTime<Utc>,
    ) -> Result<RespondOutcome> {
        let invitation = self
            .store
            .get_invitation(invitation_id)?
            .ok_or(EngineError::InvitationNotFound(*invitation_id))?;

        if invitation.tutor_id != *tutor_id {
            return Err(EngineError::NotInvitee {
                tutor_id: *tutor_id,
                invitation_id: *invitation_id,
            });
        }
        if lifecycle::is_resolved(invitation.status) {
            return Err(EngineError::AlreadyResolved(*invitation_id));
        }

        if response.accept {
            self.accept(&invitation, now).await.map(RespondOutcome::Booked)
        } else {
            self.decline(&invitation, response.note, now)
                .await
                .map(RespondOutcome::Declined)
        }
    }

    async fn decline(
        &self,
        invitation: &LessonInvitation,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<LessonInvitation> {
        let invitation_id = invitation.invitation_id;

        if invitation.expires_at < now {
            expire_invitation(self.store.as_ref(), &invitation_id, now)?;
            return Err(EngineError::AlreadyResolved(invitation_id));
        }
        lifecycle::validate_invitation_transition(
            &invitation_id,
            invitation.status,
            InvitationStatus::Rejected,
        )?;

        let declined = self
            .store
            .transition_invitation(
                &invitation_id,
                InvitationStatus::Pending,
                InvitationStatus::Rejected,
                note,
                now,
            )?
            .ok_or(EngineError::AlreadyResolved(invitation_id))?;

        self.collaborators
            .release_payment(declined.authorization_id)
            .await;
        self.collaborators
            .notify(
                Participant::Tutor(declined.tutor_id),
                Participant::Student(declined.student_id),
                declined
                    .tutor_response
                    .as_deref()
                    .unwrap_or("The tutor declined your lesson request."),
            )
            .await;

        tracing::info!(
            invitation_id = %invitation_id,
            tutor_id = %declined.tutor_id,
            "Invitation declined"
        );
        Ok(declined)
    }

    async fn accept(&self, invitation: &LessonInvitation, now: DateTime<Utc>) -> Result<Lesson> {
        let invitation_id = invitation.invitation_id;
        lifecycle::validate_invitation_transition(
            &invitation_id,
            invitation.status,
            InvitationStatus::Accepted,
        )?;

        let claimed = match self.store.claim_invitation(&invitation_id, now)? {
            ClaimOutcome::Claimed(claimed) => claimed,
            ClaimOutcome::PastDeadline => {
                expire_invitation(self.store.as_ref(), &invitation_id, now)?;
                return Err(EngineError::AlreadyResolved(invitation_id));
            }
            ClaimOutcome::InvitationNotPending(status) => {
                tracing::debug!(
                    invitation_id = %invitation_id,
                    status = ?status,
                    "Acceptance lost: invitation no longer pending"
                );
                return Err(EngineError::AlreadyResolved(invitation_id));
            }
            ClaimOutcome::PreferenceResolved(status) => {
                tracing::info!(
                    invitation_id = %invitation_id,
                    preference_id = %invitation.preference_id,
                    preference_status = ?status,
                    "Acceptance lost: preference already resolved"
                );
                return Err(EngineError::AlreadyResolved(invitation_id));
            }
        };

        if let Some(authorization_id) = claimed.authorization_id {
            if let Err(e) = self.collaborators.payments.capture(&authorization_id).await {
                let settled_at = now.max(Utc::now());
                self.roll_back_claim(&claimed, settled_at)?;
                return Err(EngineError::PaymentCaptureFailed {
                    invitation_id,
                    reason: e.to_string(),
                });
            }
        }

        let candidates = booking::candidate_slots(&claimed, now, self.config.booking_horizon_days);
        let fallback_start = if candidates.is_empty() {
            booking::fallback_start(now, self.config.fallback_hour)
        } else {
            None
        };

        let commit = BookingCommit {
            invitation_id,
            lesson: Lesson {
                lesson_id: LessonId::generate(),
                student_id: claimed.student_id,
                tutor_id: claimed.tutor_id,
                topic_id: claimed.topic_id,
                invitation_id: Some(invitation_id),
                scheduled_at: now,
                duration_minutes: self.config.lesson_duration_minutes,
                slot: None,
                status: LessonStatus::Scheduled,
                created_at: now,
                updated_at: now,
            },
            candidates,
            fallback_start,
            completion: self.booking_completion(&claimed, now)?,
            at: now,
        };

        let receipt = match self.store.commit_booking(&commit) {
            Ok(BookingOutcome::Booked(receipt)) => receipt,
            Ok(BookingOutcome::NoSlot) => {
                tracing::warn!(
                    invitation_id = %invitation_id,
                    tutor_id = %claimed.tutor_id,
                    "No candidate slot left, abandoning acceptance"
                );
                self.refund_claim(&claimed, InvitationStatus::Expired, now)
                    .await;
                return Err(EngineError::NoCandidates {
                    preference_id: claimed.preference_id,
                    alternatives: 0,
                });
            }
            Ok(outcome @ (BookingOutcome::TopicInProgress(_) | BookingOutcome::TopicCompleted)) => {
                let status = if matches!(outcome, BookingOutcome::TopicCompleted) {
                    TopicStatus::Completed
                } else {
                    TopicStatus::InProgress
                };
                tracing::warn!(
                    invitation_id = %invitation_id,
                    student_id = %claimed.student_id,
                    topic_id = %claimed.topic_id,
                    topic_status = ?status,
                    "Topic already booked elsewhere, abandoning acceptance"
                );
                self.refund_claim(&claimed, InvitationStatus::Expired, now)
                    .await;
                return Err(EngineError::NoEligibleTopic {
                    student_id: claimed.student_id,
                    topic_id: claimed.topic_id,
                    status,
                });
            }
            Err(e) => {
                tracing::error!(
                    invitation_id = %invitation_id,
                    error = %e,
                    "Booking commit failed, rolling back acceptance"
                );
                let revert_to = if now <= claimed.expires_at {
                    InvitationStatus::Pending
                } else {
                    InvitationStatus::Expired
                };
                self.refund_claim(&claimed, revert_to, now).await;
                return Err(e.into());
            }
        };

        for sibling in &receipt.auto_rejected {
            self.collaborators
                .release_payment(sibling.authorization_id)
                .await;
            self.collaborators
                .notify(
                    Participant::Student(sibling.student_id),
                    Participant::Tutor(sibling.tutor_id),
                    "This lesson request was taken by another tutor.",
                )
                .await;
        }

        let lesson = receipt.lesson;
        let booked = format!("Lesson booked for {}", lesson.scheduled_at.to_rfc3339());
        self.collaborators
            .notify(
                Participant::Tutor(lesson.tutor_id),
                Participant::Student(lesson.student_id),
                &booked,
            )
            .await;
        if let Some(address) = &receipt.preference.contact_email {
            self.collaborators
                .email(address, "Your lesson is booked", &booked)
                .await;
        }

        tracing::info!(
            invitation_id = %invitation_id,
            lesson_id = %lesson.lesson_id,
            tutor_id = %lesson.tutor_id,
            student_id = %lesson.student_id,
            scheduled_at = %lesson.scheduled_at,
            auto_rejected = receipt.auto_rejected.len(),
            "Invitation accepted, lesson booked"
        );

        Ok(lesson)
    }

    /// The completion record written with a booking. A completed topic stays completed.
    fn booking_completion(
        &self,
        invitation: &LessonInvitation,
        now: DateTime<Utc>,
    ) -> Result<TopicCompletion> {
        let existing = self
            .store
            .get_completion(&invitation.student_id, &invitation.topic_id)?;

        Ok(match existing {
            Some(completion) if completion.status == CompletionStatus::Completed => completion,
            Some(mut completion) => {
                completion.status = CompletionStatus::InProgress;
                completion.updated_at = now;
                completion
            }
            None => {
                let mut completion =
                    TopicCompletion::not_started(invitation.student_id, invitation.topic_id, now);
                completion.status = CompletionStatus::InProgress;
                completion
            }
        })
    }

    /// Undo a claim whose payment was never captured.
    fn roll_back_claim(&self, claimed: &LessonInvitation, now: DateTime<Utc>) -> Result<()> {
        let (revert_to, needs_review) = if now <= claimed.expires_at {
            (InvitationStatus::Pending, false)
        } else {
            (InvitationStatus::Expired, true)
        };
        debug_assert!(lifecycle::is_compensation(InvitationStatus::Accepted, revert_to));

        if self
            .store
            .release_claim(&claimed.invitation_id, revert_to, needs_review, now)?
        {
            tracing::warn!(
                invitation_id = %claimed.invitation_id,
                reverted_to = ?revert_to,
                needs_review,
                "Payment capture failed, acceptance rolled back"
            );
        } else {
            tracing::error!(
                invitation_id = %claimed.invitation_id,
                "Payment capture failed and the claim was no longer held"
            );
        }
        Ok(())
    }

    /// Undo a claim whose payment was captured, refunding the capture.
    async fn refund_claim(
        &self,
        claimed: &LessonInvitation,
        revert_to: InvitationStatus,
        now: DateTime<Utc>,
    ) {
        match self
            .store
            .release_claim(&claimed.invitation_id, revert_to, false, now)
        {
            Ok(true) => {}
            Ok(false) => tracing::error!(
                invitation_id = %claimed.invitation_id,
                "Claim was no longer held during rollback"
            ),
            Err(e) => tracing::error!(
                invitation_id = %claimed.invitation_id,
                error = %e,
                "Failed to release claim during rollback"
            ),
        }
        self.collaborators
            .release_payment(claimed.authorization_id)
            .await;
    }

    // =========================================================================
    // Withdrawals
    // =========================================================================

    /// Withdraw one pending invitation on the student's behalf.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotRequester` if the student did not send the invitation and
    /// `EngineError::AlreadyResolved` if it already left `Pending`.
    pub async fn cancel(
        &self,
        invitation_id: &InvitationId,
        student_id: &StudentId,
    ) -> Result<LessonInvitation> {
        let invitation = self
            .store
            .get_invitation(invitation_id)?
            .ok_or(EngineError::InvitationNotFound(*invitation_id))?;

        if invitation.student_id != *student_id {
            return Err(EngineError::NotRequester {
                student_id: *student_id,
                preference_id: invitation.preference_id,
            });
        }
        if lifecycle::is_resolved(invitation.status) {
            return Err(EngineError::AlreadyResolved(*invitation_id));
        }

        let cancelled = self
            .withdraw(invitation_id, Utc::now())
            .await?
            .ok_or(EngineError::AlreadyResolved(*invitation_id))?;

        tracing::info!(
            invitation_id = %invitation_id,
            student_id = %student_id,
            "Invitation cancelled"
        );
        Ok(cancelled)
    }

    /// Cancel a pending preference and every invitation still waiting on it.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotRequester` if the student does not own the preference
    /// and `EngineError::InvalidPreferenceTransition` unless it is `Pending`.
    pub async fn cancel_preference(
        &self,
        preference_id: &PreferenceId,
        student_id: &StudentId,
    ) -> Result<StudentMatchingPreference> {
        let preference = self
            .store
            .get_preference(preference_id)?
            .ok_or(EngineError::PreferenceNotFound(*preference_id))?;

        if preference.student_id != *student_id {
            return Err(EngineError::NotRequester {
                student_id: *student_id,
                preference_id: *preference_id,
            });
        }
        lifecycle::validate_preference_transition(
            preference_id,
            preference.status,
            PreferenceStatus::Cancelled,
        )?;

        let now = Utc::now();
        let Some(cancelled) = self.store.transition_preference(
            preference_id,
            preference.status,
            PreferenceStatus::Cancelled,
            now,
        )?
        else {
            let current = self
                .store
                .get_preference(preference_id)?
                .map_or(preference.status, |p| p.status);
            return Err(EngineError::InvalidPreferenceTransition {
                preference_id: *preference_id,
                from: current,
                to: PreferenceStatus::Cancelled,
            });
        };

        let mut withdrawn = 0usize;
        for invitation in self.store.list_invitations_by_preference(preference_id)? {
            if invitation.status != InvitationStatus::Pending {
                continue;
            }
            if self.withdraw(&invitation.invitation_id, now).await?.is_some() {
                withdrawn += 1;
            }
        }

        tracing::info!(
            preference_id = %preference_id,
            student_id = %student_id,
            withdrawn,
            "Preference cancelled"
        );
        Ok(cancelled)
    }

    /// `Pending → Cancelled`, releasing the hold and telling the tutor.
    async fn withdraw(
        &self,
        invitation_id: &InvitationId,
        now: DateTime<Utc>,
    ) -> Result<Option<LessonInvitation>> {
        let Some(cancelled) = self.store.transition_invitation(
            invitation_id,
            InvitationStatus::Pending,
            InvitationStatus::Cancelled,
            None,
            now,
        )?
        else {
            return Ok(None);
        };

        self.collaborators
            .release_payment(cancelled.authorization_id)
            .await;
        self.collaborators
            .notify(
                Participant::Student(cancelled.student_id),
                Participant::Tutor(cancelled.tutor_id),
                "The student withdrew this lesson request.",
            )
            .await;
        Ok(Some(cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, Harness};
    use crate::sweeper::sweep_expired;
    use chrono::Duration;
    use tutorlink_core::DayOfWeek;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_accepts_have_one_winner() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        fixtures::seed_tutor(&harness.store, 2, &[(DayOfWeek::MONDAY, 17)]);
        let manager = Arc::new(harness.manager());

        let preference = fixtures::seed_preference(&harness.store, StudentId::generate(), &topics[0]);
        let invitations = fixtures::fan_out(&harness, &manager, &preference).await;
        assert_eq!(invitations.len(), 2);

        let handles: Vec<_> = invitations
            .iter()
            .map(|invitation| {
                let manager = Arc::clone(&manager);
                let invitation_id = invitation.invitation_id;
                let tutor_id = invitation.tutor_id;
                tokio::spawn(async move {
                    manager
                        .respond(&invitation_id, &tutor_id, TutorResponse::accept())
                        .await
                })
            })
            .collect();

        let mut booked = 0;
        let mut resolved = 0;
        for result in join_all(handles).await {
            match result.unwrap() {
                Ok(RespondOutcome::Booked(_)) => booked += 1,
                Err(EngineError::AlreadyResolved(_)) => resolved += 1,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(booked, 1);
        assert_eq!(resolved, 1);

        let settled = harness
            .store
            .list_invitations_by_preference(&preference.preference_id)
            .unwrap();
        let accepted: Vec<_> = settled
            .iter()
            .filter(|i| i.status == InvitationStatus::Accepted)
            .collect();
        let loser = settled
            .iter()
            .find(|i| i.status == InvitationStatus::AutoRejected)
            .unwrap();
        assert_eq!(accepted.len(), 1);
        assert!(harness
            .mocks
            .payments
            .released()
            .contains(&loser.authorization_id.unwrap()));
        assert_eq!(
            harness
                .mocks
                .payments
                .captured(),
            vec![accepted[0].authorization_id.unwrap()]
        );

        let lessons = harness
            .store
            .list_lessons_by_student(&preference.student_id)
            .unwrap();
        assert_eq!(lessons.len(), 1);
        assert_eq!(lessons[0].tutor_id, accepted[0].tutor_id);

        let stored = harness
            .store
            .get_preference(&preference.preference_id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, PreferenceStatus::Confirmed);
    }

    #[tokio::test]
    async fn accept_books_slot_and_marks_topic_in_progress() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 2);
        let tutor = fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let manager = harness.manager();

        let preference = fixtures::seed_preference(&harness.store, StudentId::generate(), &topics[0]);
        let invitations = fixtures::fan_out(&harness, &manager, &preference).await;

        let outcome = manager
            .respond(&invitations[0].invitation_id, &tutor.tutor_id, TutorResponse::accept())
            .await
            .unwrap();
        let RespondOutcome::Booked(lesson) = outcome else {
            panic!("expected a booking");
        };

        assert_eq!(lesson.slot.map(|s| s.day), Some(DayOfWeek::MONDAY));
        assert_eq!(DayOfWeek::of(&lesson.scheduled_at), DayOfWeek::MONDAY);
        assert!(lesson.scheduled_at > Utc::now() - Duration::minutes(1));

        let grid = harness.store.get_availability(&tutor.tutor_id).unwrap();
        assert!(!grid[0].available);
        assert_eq!(grid[0].booked_lesson, Some(lesson.lesson_id));

        let completion = harness
            .store
            .get_completion(&preference.student_id, &topics[0].topic_id)
            .unwrap()
            .unwrap();
        assert_eq!(completion.status, CompletionStatus::InProgress);

        // The student hears about the booking by message and email
        assert_eq!(
            harness
                .mocks
                .notifier
                .messages_to(Participant::Student(preference.student_id)),
            1
        );
        assert!(harness
            .mocks
            .notifier
            .emails()
            .contains(&("student@example.com".to_string(), "Your lesson is booked".to_string())));
    }

    #[tokio::test]
    async fn failed_capture_rolls_back() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        let tutor = fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let manager = harness.manager();

        let preference = fixtures::seed_preference(&harness.store, StudentId::generate(), &topics[0]);
        let invitations = fixtures::fan_out(&harness, &manager, &preference).await;
        let invitation_id = invitations[0].invitation_id;

        harness.mocks.payments.set_fail_capture(true);
        let err = manager
            .respond(&invitation_id, &tutor.tutor_id, TutorResponse::accept())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PaymentCaptureFailed { .. }));

        let invitation = harness.store.get_invitation(&invitation_id).unwrap().unwrap();
        assert_eq!(invitation.status, InvitationStatus::Pending);
        assert!(!invitation.needs_review);
        let stored = harness
            .store
            .get_preference(&preference.preference_id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, PreferenceStatus::Pending);
        assert!(harness
            .store
            .list_lessons_by_student(&preference.student_id)
            .unwrap()
            .is_empty());
        assert!(harness.store.get_availability(&tutor.tutor_id).unwrap()[0].available);

        // The tutor can try again once the card works
        harness.mocks.payments.set_fail_capture(false);
        let outcome = manager
            .respond(&invitation_id, &tutor.tutor_id, TutorResponse::accept())
            .await
            .unwrap();
        assert!(matches!(outcome, RespondOutcome::Booked(_)));
    }

    #[tokio::test]
    async fn expired_invitation_cannot_be_accepted() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        let tutor = fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let manager = harness.manager();

        let preference = fixtures::seed_preference(&harness.store, StudentId::generate(), &topics[0]);
        let invitations = fixtures::fan_out(&harness, &manager, &preference).await;
        let invitation_id = invitations[0].invitation_id;
        assert_eq!(
            invitations[0].expires_at - invitations[0].sent_at,
            Duration::hours(24)
        );

        let report = sweep_expired(harness.store.as_ref(), Utc::now() + Duration::hours(25)).unwrap();
        assert_eq!(report.expired, vec![invitation_id]);

        let err = manager
            .respond(&invitation_id, &tutor.tutor_id, TutorResponse::accept())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyResolved(id) if id == invitation_id));
    }

    #[tokio::test]
    async fn late_answer_expires_invitation() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        let tutor = fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let manager = harness.manager();

        let preference = fixtures::seed_preference(&harness.store, StudentId::generate(), &topics[0]);
        let invitations = fixtures::fan_out(&harness, &manager, &preference).await;
        let invitation_id = invitations[0].invitation_id;

        let late = Utc::now() + Duration::hours(25);
        let err = manager
            .respond_at(&invitation_id, &tutor.tutor_id, TutorResponse::accept(), late)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyResolved(_)));

        let invitation = harness.store.get_invitation(&invitation_id).unwrap().unwrap();
        assert_eq!(invitation.status, InvitationStatus::Expired);
        assert!(harness.mocks.payments.captured().is_empty());
    }

    #[tokio::test]
    async fn decline_releases_hold_once() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        let tutor = fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let manager = harness.manager();

        let preference = fixtures::seed_preference(&harness.store, StudentId::generate(), &topics[0]);
        let invitations = fixtures::fan_out(&harness, &manager, &preference).await;
        let invitation_id = invitations[0].invitation_id;

        let outcome = manager
            .respond(
                &invitation_id,
                &tutor.tutor_id,
                TutorResponse::decline(Some("Away that week".to_string())),
            )
            .await
            .unwrap();
        let RespondOutcome::Declined(declined) = outcome else {
            panic!("expected a decline");
        };
        assert_eq!(declined.status, InvitationStatus::Rejected);
        assert_eq!(declined.tutor_response.as_deref(), Some("Away that week"));
        assert_eq!(
            harness.mocks.payments.released(),
            vec![declined.authorization_id.unwrap()]
        );

        let again = manager
            .respond(&invitation_id, &tutor.tutor_id, TutorResponse::decline(None))
            .await;
        assert!(matches!(again, Err(EngineError::AlreadyResolved(_))));
        assert_eq!(harness.mocks.payments.released().len(), 1);
    }

    #[tokio::test]
    async fn only_the_invited_tutor_may_answer() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let manager = harness.manager();

        let preference = fixtures::seed_preference(&harness.store, StudentId::generate(), &topics[0]);
        let invitations = fixtures::fan_out(&harness, &manager, &preference).await;

        let err = manager
            .respond(
                &invitations[0].invitation_id,
                &TutorId::generate(),
                TutorResponse::accept(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status_code(), 403);
    }

    #[tokio::test]
    async fn second_fan_out_is_refused() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let manager = harness.manager();

        let preference = fixtures::seed_preference(&harness.store, StudentId::generate(), &topics[0]);
        fixtures::fan_out(&harness, &manager, &preference).await;

        let ranked = crate::matcher::find_candidates(harness.store.as_ref(), &preference, &harness.config)
            .unwrap();
        let invitees: Vec<_> = ranked.iter().collect();
        let err = manager
            .create_invitations(&preference, &invitees)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvitationsOutstanding { .. }));
    }

    #[tokio::test]
    async fn taken_slot_across_students_is_not_double_booked() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        let tutor = fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let manager = harness.manager();

        let first = fixtures::seed_preference(&harness.store, StudentId::generate(), &topics[0]);
        let second = fixtures::seed_preference(&harness.store, StudentId::generate(), &topics[0]);
        let first_invites = fixtures::fan_out(&harness, &manager, &first).await;
        let second_invites = fixtures::fan_out(&harness, &manager, &second).await;

        manager
            .respond(&first_invites[0].invitation_id, &tutor.tutor_id, TutorResponse::accept())
            .await
            .unwrap();
        let err = manager
            .respond(&second_invites[0].invitation_id, &tutor.tutor_id, TutorResponse::accept())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoCandidates { .. }));

        assert_eq!(
            harness
                .store
                .list_lessons_by_tutor(&tutor.tutor_id)
                .unwrap()
                .len(),
            1
        );
        let abandoned = harness
            .store
            .get_invitation(&second_invites[0].invitation_id)
            .unwrap()
            .unwrap();
        assert_eq!(abandoned.status, InvitationStatus::Expired);
        assert!(harness
            .mocks
            .payments
            .released()
            .contains(&abandoned.authorization_id.unwrap()));
        let reopened = harness
            .store
            .get_preference(&second.preference_id)
            .unwrap()
            .unwrap();
        assert_eq!(reopened.status, PreferenceStatus::Pending);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_accepts_across_students_book_slot_once() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        let tutor = fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let manager = Arc::new(harness.manager());

        let mut invitations = Vec::new();
        for _ in 0..2 {
            let preference =
                fixtures::seed_preference(&harness.store, StudentId::generate(), &topics[0]);
            invitations.extend(fixtures::fan_out(&harness, &manager, &preference).await);
        }
        assert_eq!(invitations.len(), 2);

        let handles: Vec<_> = invitations
            .iter()
            .map(|invitation| {
                let manager = Arc::clone(&manager);
                let invitation_id = invitation.invitation_id;
                let tutor_id = invitation.tutor_id;
                tokio::spawn(async move {
                    manager
                        .respond(&invitation_id, &tutor_id, TutorResponse::accept())
                        .await
                })
            })
            .collect();

        let mut winner = None;
        let mut refused = 0;
        for result in join_all(handles).await {
            match result.unwrap() {
                Ok(RespondOutcome::Booked(lesson)) => {
                    assert!(winner.replace(lesson).is_none());
                }
                Err(EngineError::NoCandidates { alternatives: 0, .. }) => refused += 1,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        let winner = winner.unwrap();
        assert_eq!(refused, 1);

        let lessons = harness.store.list_lessons_by_tutor(&tutor.tutor_id).unwrap();
        assert_eq!(lessons.len(), 1);
        let grid = harness.store.get_availability(&tutor.tutor_id).unwrap();
        assert_eq!(grid[0].booked_lesson, Some(winner.lesson_id));

        let loser = invitations
            .iter()
            .find(|i| i.student_id != winner.student_id)
            .unwrap();
        let loser = harness
            .store
            .get_invitation(&loser.invitation_id)
            .unwrap()
            .unwrap();
        assert_eq!(loser.status, InvitationStatus::Expired);
        assert!(harness
            .mocks
            .payments
            .released()
            .contains(&loser.authorization_id.unwrap()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sweep_and_accept_at_deadline_settle_once() {
        for _ in 0..8 {
            let harness = Harness::new();
            let topics = fixtures::seed_curriculum(&harness.store, 1);
            let tutor = fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
            let manager = Arc::new(harness.manager());

            let preference =
                fixtures::seed_preference(&harness.store, StudentId::generate(), &topics[0]);
            let sent_at =
                Utc::now() - harness.config.invitation_ttl() + Duration::milliseconds(200);
            let invitation = fixtures::fan_out_at(&harness, &manager, &preference, sent_at)
                .await
                .remove(0);
            let deadline = invitation.expires_at;

            let store = Arc::clone(&harness.store);
            let sweep = tokio::spawn(async move {
                sweep_expired(store.as_ref(), deadline + Duration::milliseconds(1))
            });
            let answer = {
                let manager = Arc::clone(&manager);
                let invitation_id = invitation.invitation_id;
                let tutor_id = tutor.tutor_id;
                tokio::spawn(async move {
                    manager
                        .respond_at(&invitation_id, &tutor_id, TutorResponse::accept(), deadline)
                        .await
                })
            };
            let report = sweep.await.unwrap().unwrap();
            let answer = answer.await.unwrap();

            let settled = harness
                .store
                .get_invitation(&invitation.invitation_id)
                .unwrap()
                .unwrap();
            let lessons = harness.store.list_lessons_by_tutor(&tutor.tutor_id).unwrap();
            let booked_cells = harness
                .store
                .get_availability(&tutor.tutor_id)
                .unwrap()
                .iter()
                .filter(|c| c.booked_lesson.is_some())
                .count();

            match answer {
                Ok(RespondOutcome::Booked(lesson)) => {
                    assert_eq!(settled.status, InvitationStatus::Accepted);
                    assert!(report.expired.is_empty());
                    assert_eq!(lessons.len(), 1);
                    assert_eq!(lessons[0].lesson_id, lesson.lesson_id);
                    assert_eq!(booked_cells, 1);
                }
                Err(EngineError::AlreadyResolved(_)) => {
                    assert_eq!(settled.status, InvitationStatus::Expired);
                    assert_eq!(report.expired, vec![invitation.invitation_id]);
                    assert!(lessons.is_empty());
                    assert_eq!(booked_cells, 0);
                    assert!(harness.mocks.payments.captured().is_empty());
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn accept_refused_when_topic_already_booked() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        let first_tutor = fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let manager = harness.manager();
        let student_id = StudentId::generate();

        let first = fixtures::seed_preference(&harness.store, student_id, &topics[0]);
        let first_invites = fixtures::fan_out(&harness, &manager, &first).await;

        let second_tutor = fixtures::seed_tutor(&harness.store, 2, &[(DayOfWeek::MONDAY, 17)]);
        let outcome = manager
            .respond(&first_invites[0].invitation_id, &first_tutor.tutor_id, TutorResponse::accept())
            .await
            .unwrap();
        let RespondOutcome::Booked(lesson) = outcome else {
            panic!("expected a booking");
        };
        // A second request for the topic that got past progression before the first booking landed
        let second = fixtures::seed_preference(&harness.store, student_id, &topics[0]);
        let late = fixtures::fan_out(&harness, &manager, &second)
            .await
            .into_iter()
            .find(|i| i.tutor_id == second_tutor.tutor_id)
            .unwrap();

        let err = manager
            .respond(&late.invitation_id, &second_tutor.tutor_id, TutorResponse::accept())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::NoEligibleTopic {
                status: TopicStatus::InProgress,
                ..
            }
        ));

        let abandoned = harness
            .store
            .get_invitation(&late.invitation_id)
            .unwrap()
            .unwrap();
        assert_eq!(abandoned.status, InvitationStatus::Expired);
        let authorization_id = abandoned.authorization_id.unwrap();
        assert!(harness.mocks.payments.captured().contains(&authorization_id));
        assert!(harness.mocks.payments.released().contains(&authorization_id));

        let lessons = harness.store.list_lessons_by_student(&student_id).unwrap();
        assert_eq!(lessons.len(), 1);
        assert_eq!(lessons[0].lesson_id, lesson.lesson_id);
        let grid = harness.store.get_availability(&second_tutor.tutor_id).unwrap();
        assert!(grid[0].available);
    }

    #[tokio::test]
    async fn invitation_without_slot_data_falls_back_to_tomorrow() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        let tutor = fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let manager = harness.manager();

        let preference = fixtures::seed_preference(&harness.store, StudentId::generate(), &topics[0]);
        let mut invitations = fixtures::fan_out(&harness, &manager, &preference).await;
        let mut invitation = invitations.remove(0);

        // Re-insert with the overlap data stripped, as if written before it was tracked
        manager
            .cancel(&invitation.invitation_id, &preference.student_id)
            .await
            .unwrap();
        let stale_preference = fixtures::seed_preference(&harness.store, preference.student_id, &topics[0]);
        invitation.invitation_id = InvitationId::derive(&stale_preference.preference_id, &tutor.tutor_id);
        invitation.preference_id = stale_preference.preference_id;
        invitation.matching_days.clear();
        invitation.matching_hours.clear();
        assert_eq!(
            harness.store.insert_invitations(&[invitation.clone()]).unwrap(),
            FanOutOutcome::Inserted
        );

        let now = Utc::now();
        let outcome = manager
            .respond_at(&invitation.invitation_id, &tutor.tutor_id, TutorResponse::accept(), now)
            .await
            .unwrap();
        let RespondOutcome::Booked(lesson) = outcome else {
            panic!("expected a booking");
        };
        assert_eq!(
            Some(lesson.scheduled_at),
            booking::fallback_start(now, harness.config.fallback_hour)
        );
        assert!(lesson.slot.is_none());
        assert!(harness.store.get_availability(&tutor.tutor_id).unwrap()[0].available);
    }

    #[tokio::test]
    async fn cancel_requires_owner_and_pending() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        let tutor = fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let manager = harness.manager();

        let preference = fixtures::seed_preference(&harness.store, StudentId::generate(), &topics[0]);
        let invitations = fixtures::fan_out(&harness, &manager, &preference).await;
        let invitation_id = invitations[0].invitation_id;

        let err = manager
            .cancel(&invitation_id, &StudentId::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotRequester { .. }));

        let cancelled = manager
            .cancel(&invitation_id, &preference.student_id)
            .await
            .unwrap();
        assert_eq!(cancelled.status, InvitationStatus::Cancelled);
        assert_eq!(
            harness
                .mocks
                .notifier
                .messages_to(Participant::Tutor(tutor.tutor_id)),
            2
        );

        let err = manager
            .respond(&invitation_id, &tutor.tutor_id, TutorResponse::accept())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyResolved(_)));
    }

    #[tokio::test]
    async fn cancel_preference_withdraws_everything() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        let a = fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        fixtures::seed_tutor(&harness.store, 2, &[(DayOfWeek::MONDAY, 17)]);
        let manager = harness.manager();

        let preference = fixtures::seed_preference(&harness.store, StudentId::generate(), &topics[0]);
        let invitations = fixtures::fan_out(&harness, &manager, &preference).await;
        assert_eq!(invitations.len(), 2);

        let cancelled = manager
            .cancel_preference(&preference.preference_id, &preference.student_id)
            .await
            .unwrap();
        assert_eq!(cancelled.status, PreferenceStatus::Cancelled);
        assert_eq!(harness.mocks.payments.released().len(), 2);

        let pending = harness
            .store
            .list_invitations_by_status(InvitationStatus::Pending)
            .unwrap();
        assert!(pending.is_empty());

        let a_invitation = invitations.iter().find(|i| i.tutor_id == a.tutor_id).unwrap();
        let err = manager
            .respond(&a_invitation.invitation_id, &a.tutor_id, TutorResponse::accept())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyResolved(_)));

        let again = manager
            .cancel_preference(&preference.preference_id, &preference.student_id)
            .await
            .unwrap_err();
        assert!(matches!(again, EngineError::InvalidPreferenceTransition { .. }));
    }
}
