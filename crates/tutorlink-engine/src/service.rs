//! Tutoring service implementation.
//!
//! This module provides the `Tutoring` trait and the `TutoringService` implementation
//! that ties progression, matching, invitations and lesson management together.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tutorlink_core::{AttemptId, InvitationId, LessonId, PreferenceId, Slot, StudentId, TopicId, TutorId};
use tutorlink_store::{
    AvailabilitySlot, CompletionCommit, Lesson, LessonInvitation, LessonStatus, MoveOutcome,
    OpenOutcome, PreferenceStatus, QuizAttempt, Store, StudentMatchingPreference,
};

use crate::booking;
use crate::collaborators::{Collaborators, Participant};
use crate::error::{EngineError, Result};
use crate::invitations::InvitationManager;
use crate::lifecycle;
use crate::matcher::{self, Candidate};
use crate::progression::{self, TopicProgress};
use crate::types::{
    EngineConfig, LessonCompletion, LessonRequest, RequestOutcome, RespondOutcome, TutorResponse,
};

/// Trait defining the tutoring operations.
///
/// Every operation names its acting user first; ownership is checked before anything
/// is written.
#[async_trait]
pub trait Tutoring: Send + Sync {
    // =========================================================================
    // Progression
    // =========================================================================

    /// Get a student's progression, ordered by subject and ordinal.
    ///
    /// A student with no history gets the first topic of each subject as available.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    async fn get_progression(&self, student_id: &StudentId) -> Result<Vec<TopicProgress>>;

    /// Record a quiz score (0-100) for a topic.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidRequest` for scores above 100 or topics without a
    /// quiz, and `EngineError::TopicNotFound` for unknown topics.
    async fn record_quiz_attempt(
        &self,
        student_id: &StudentId,
        topic_id: &TopicId,
        score: u8,
    ) -> Result<QuizAttempt>;

    // =========================================================================
    // Matching
    // =========================================================================

    /// Rank tutors for a stored preference.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::PreferenceNotFound` if the preference doesn't exist.
    async fn find_candidates(&self, preference_id: &PreferenceId) -> Result<Vec<Candidate>>;

    /// Request a lesson: check eligibility, persist a preference, match and fan out.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NoEligibleTopic` if the topic cannot be booked,
    /// `EngineError::ActivePreferenceExists` while an earlier request is still in flight,
    /// and `EngineError::NoCandidates` if no tutor qualifies for an invitation.
    async fn request_lesson(
        &self,
        student_id: &StudentId,
        request: LessonRequest,
    ) -> Result<RequestOutcome>;

    // =========================================================================
    // Invitations
    // =========================================================================

    /// Answer an invitation as its tutor.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::AlreadyResolved` if the race was already decided.
    async fn respond(
        &self,
        tutor_id: &TutorId,
        invitation_id: &InvitationId,
        response: TutorResponse,
    ) -> Result<RespondOutcome>;

    /// Withdraw a pending invitation as its student.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::AlreadyResolved` if the invitation left `Pending`.
    async fn cancel_invitation(
        &self,
        student_id: &StudentId,
        invitation_id: &InvitationId,
    ) -> Result<LessonInvitation>;

    /// A tutor's invitations still awaiting an answer, earliest deadline first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    async fn tutor_invitations(&self, tutor_id: &TutorId) -> Result<Vec<LessonInvitation>>;

    /// Cancel a pending preference and its outstanding invitations.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidPreferenceTransition` unless the preference is `Pending`.
    async fn cancel_preference(
        &self,
        student_id: &StudentId,
        preference_id: &PreferenceId,
    ) -> Result<StudentMatchingPreference>;

    // =========================================================================
    // Lessons
    // =========================================================================

    /// Mark a lesson as taught.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotParticipant` if the tutor does not teach the lesson.
    async fn complete_lesson(&self, tutor_id: &TutorId, lesson_id: &LessonId)
        -> Result<LessonCompletion>;

    /// Cancel a lesson as either participant.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotParticipant` if the actor is not part of the lesson.
    async fn cancel_lesson(&self, actor: Participant, lesson_id: &LessonId) -> Result<Lesson>;

    /// Move a lesson to another slot of the tutor's grid.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::SlotUnavailable` if the new slot is not open.
    async fn reschedule_lesson(
        &self,
        tutor_id: &TutorId,
        lesson_id: &LessonId,
        slot: Slot,
    ) -> Result<Lesson>;

    // =========================================================================
    // Availability
    // =========================================================================

    /// Open or close slots in a tutor's grid. Booked slots are left alone.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::TutorNotFound` if the tutor doesn't exist.
    async fn set_availability(
        &self,
        tutor_id: &TutorId,
        slots: &[Slot],
        available: bool,
    ) -> Result<Vec<AvailabilitySlot>>;
}

/// The main tutoring service implementation.
pub struct TutoringService<S: Store> {
    store: Arc<S>,
    invitations: InvitationManager<S>,
    collaborators: Collaborators,
    config: EngineConfig,
}

impl<S: Store> TutoringService<S> {
    /// Create a new tutoring service.
    #[must_use]
    pub fn new(store: Arc<S>, collaborators: Collaborators, config: EngineConfig) -> Self {
        let invitations =
            InvitationManager::new(Arc::clone(&store), collaborators.clone(), config.clone());
        Self {
            store,
            invitations,
            collaborators,
            config,
        }
    }

    /// Create with no-op collaborators and default configuration.
    #[must_use]
    pub fn with_defaults(store: Arc<S>) -> Self {
        Self::new(store, Collaborators::noop(), EngineConfig::default())
    }

    /// Get a reference to the store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get the invitation manager.
    #[must_use]
    pub const fn invitations(&self) -> &InvitationManager<S> {
        &self.invitations
    }

    fn get_lesson(&self, lesson_id: &LessonId) -> Result<Lesson> {
        self.store
            .get_lesson(lesson_id)?
            .ok_or(EngineError::LessonNotFound(*lesson_id))
    }

    /// Get a lesson and verify the tutor teaches it.
    fn get_tutor_lesson(&self, tutor_id: &TutorId, lesson_id: &LessonId) -> Result<Lesson> {
        let lesson = self.get_lesson(lesson_id)?;
        if lesson.tutor_id != *tutor_id {
            return Err(EngineError::NotParticipant(*lesson_id));
        }
        Ok(lesson)
    }

    /// Perform a validated lesson transition. Leaving the live states frees the slot.
    fn transition_lesson(&self, lesson: &Lesson, target: LessonStatus) -> Result<Lesson> {
        lifecycle::validate_lesson_transition(&lesson.lesson_id, lesson.status, target)?;
        self.store
            .transition_lesson(&lesson.lesson_id, lesson.status, target, Utc::now())?
            .ok_or(EngineError::InvalidLessonTransition {
                lesson_id: lesson.lesson_id,
                from: lesson.status,
                to: target,
            })
    }

    /// Re-read a lesson that lost a conditional write and report the refused transition.
    fn lost_lesson_race(&self, lesson_id: &LessonId, target: LessonStatus) -> EngineError {
        match self.get_lesson(lesson_id) {
            Ok(current) => EngineError::InvalidLessonTransition {
                lesson_id: *lesson_id,
                from: current.status,
                to: target,
            },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl<S: Store + 'static> Tutoring for TutoringService<S> {
    // =========================================================================
    // Progression
    // =========================================================================

    async fn get_progression(&self, student_id: &StudentId) -> Result<Vec<TopicProgress>> {
        progression::load_progression(self.store.as_ref(), student_id)
    }

    async fn record_quiz_attempt(
        &self,
        student_id: &StudentId,
        topic_id: &TopicId,
        score: u8,
    ) -> Result<QuizAttempt> {
        if score > 100 {
            return Err(EngineError::InvalidRequest(format!(
                "quiz score {score} is above 100"
            )));
        }
        let topic = self
            .store
            .get_topic(topic_id)?
            .ok_or(EngineError::TopicNotFound(*topic_id))?;
        if !topic.quiz_required {
            return Err(EngineError::InvalidRequest(format!(
                "topic {topic_id} has no quiz"
            )));
        }

        let attempt = QuizAttempt {
            attempt_id: AttemptId::generate(),
            student_id: *student_id,
            topic_id: *topic_id,
            score,
            taken_at: Utc::now(),
        };
        self.store.put_quiz_attempt(&attempt)?;

        tracing::info!(
            student_id = %student_id,
            topic_id = %topic_id,
            score,
            passed = score >= topic.passing_score,
            "Recorded quiz attempt"
        );

        Ok(attempt)
    }

    // =========================================================================
    // Matching
    // =========================================================================

    async fn find_candidates(&self, preference_id: &PreferenceId) -> Result<Vec<Candidate>> {
        let preference = self
            .store
            .get_preference(preference_id)?
            .ok_or(EngineError::PreferenceNotFound(*preference_id))?;
        matcher::find_candidates(self.store.as_ref(), &preference, &self.config)
    }

    async fn request_lesson(
        &self,
        student_id: &StudentId,
        request: LessonRequest,
    ) -> Result<RequestOutcome> {
        if request.preferred_days.is_empty() {
            return Err(EngineError::InvalidRequest(
                "at least one preferred day is required".to_string(),
            ));
        }
        if request.max_hourly_rate_cents == 0 {
            return Err(EngineError::InvalidRequest(
                "maximum hourly rate must be positive".to_string(),
            ));
        }

        let progression = progression::load_progression(self.store.as_ref(), student_id)?;
        let row = progression::ensure_bookable(&progression, student_id, &request.topic_id)?;
        if row.topic.subject_id != request.subject_id {
            return Err(EngineError::InvalidRequest(format!(
                "topic {} does not belong to subject {}",
                request.topic_id, request.subject_id
            )));
        }

        let now = Utc::now();
        let mut preferred_days = request.preferred_days;
        preferred_days.sort_unstable();
        preferred_days.dedup();

        let preference = StudentMatchingPreference {
            preference_id: PreferenceId::generate(),
            student_id: *student_id,
            subject_id: request.subject_id,
            topic_id: request.topic_id,
            preferred_days,
            window: request.window,
            max_hourly_rate_cents: request.max_hourly_rate_cents,
            preferred_gender: request.preferred_gender,
            preferred_style: request.preferred_style,
            contact_email: request.contact_email,
            status: PreferenceStatus::Pending,
            matched_invitation: None,
            created_at: now,
            updated_at: now,
        };
        match self.store.open_preference(&preference)? {
            OpenOutcome::Opened { retired } => {
                for preference_id in retired {
                    tracing::info!(
                        preference_id = %preference_id,
                        student_id = %student_id,
                        "Cancelled stale preference"
                    );
                }
            }
            OpenOutcome::Blocked(preference_id) => {
                return Err(EngineError::ActivePreferenceExists {
                    student_id: *student_id,
                    preference_id,
                });
            }
        }

        let candidates = matcher::find_candidates(self.store.as_ref(), &preference, &self.config)?;
        let invitees = matcher::select_invitees(&candidates, &self.config);
        if invitees.is_empty() {
            tracing::info!(
                preference_id = %preference.preference_id,
                student_id = %student_id,
                ranked = candidates.len(),
                "No tutor qualifies for an invitation"
            );
            return Err(EngineError::NoCandidates {
                preference_id: preference.preference_id,
                alternatives: candidates.len(),
            });
        }

        let invitations = self
            .invitations
            .create_invitations_at(&preference, &invitees, now)
            .await?;

        Ok(RequestOutcome {
            preference,
            invitations,
            candidates,
        })
    }

    // =========================================================================
    // Invitations
    // =========================================================================

    async fn respond(
        &self,
        tutor_id: &TutorId,
        invitation_id: &InvitationId,
        response: TutorResponse,
    ) -> Result<RespondOutcome> {
        self.invitations
            .respond(invitation_id, tutor_id, response)
            .await
    }

    async fn cancel_invitation(
        &self,
        student_id: &StudentId,
        invitation_id: &InvitationId,
    ) -> Result<LessonInvitation> {
        self.invitations.cancel(invitation_id, student_id).await
    }

    async fn tutor_invitations(&self, tutor_id: &TutorId) -> Result<Vec<LessonInvitation>> {
        let now = Utc::now();
        let mut open: Vec<LessonInvitation> = self
            .store
            .list_invitations_by_tutor(tutor_id)?
            .into_iter()
            .filter(|i| i.status == tutorlink_store::InvitationStatus::Pending && i.expires_at >= now)
            .collect();
        open.sort_by_key(|i| i.expires_at);
        Ok(open)
    }

    async fn cancel_preference(
        &self,
        student_id: &StudentId,
        preference_id: &PreferenceId,
    ) -> Result<StudentMatchingPreference> {
        self.invitations
            .cancel_preference(preference_id, student_id)
            .await
    }

    // =========================================================================
    // Lessons
    // =========================================================================

    async fn complete_lesson(
        &self,
        tutor_id: &TutorId,
        lesson_id: &LessonId,
    ) -> Result<LessonCompletion> {
        let lesson = self.get_tutor_lesson(tutor_id, lesson_id)?;
        let topic = self
            .store
            .get_topic(&lesson.topic_id)?
            .ok_or(EngineError::TopicNotFound(lesson.topic_id))?;

        lifecycle::validate_lesson_transition(lesson_id, lesson.status, LessonStatus::Completed)?;

        let receipt = self
            .store
            .complete_lesson(&CompletionCommit {
                lesson_id: *lesson_id,
                lessons_required: topic.lessons_required,
                xp_reward: topic.xp_reward,
                at: Utc::now(),
            })?
            .ok_or_else(|| self.lost_lesson_race(lesson_id, LessonStatus::Completed))?;
        let newly_completed = receipt.topic_completed;
        let lesson = receipt.lesson;
        let completion = receipt.completion;

        if newly_completed {
            self.collaborators
                .reward(&lesson.student_id, topic.xp_reward)
                .await;
        }

        tracing::info!(
            lesson_id = %lesson_id,
            tutor_id = %tutor_id,
            student_id = %lesson.student_id,
            topic_id = %lesson.topic_id,
            topic_completed = newly_completed,
            "Lesson completed"
        );

        Ok(LessonCompletion { lesson, completion })
    }

    async fn cancel_lesson(&self, actor: Participant, lesson_id: &LessonId) -> Result<Lesson> {
        let lesson = self.get_lesson(lesson_id)?;
        let counterpart = match actor {
            Participant::Student(id) if id == lesson.student_id => Participant::Tutor(lesson.tutor_id),
            Participant::Tutor(id) if id == lesson.tutor_id => Participant::Student(lesson.student_id),
            _ => return Err(EngineError::NotParticipant(*lesson_id)),
        };

        let lesson = self.transition_lesson(&lesson, LessonStatus::Cancelled)?;

        self.collaborators
            .notify(
                actor,
                counterpart,
                &format!(
                    "The lesson on {} was cancelled.",
                    lesson.scheduled_at.to_rfc3339()
                ),
            )
            .await;

        tracing::info!(lesson_id = %lesson_id, actor = %actor, "Lesson cancelled");

        Ok(lesson)
    }

    async fn reschedule_lesson(
        &self,
        tutor_id: &TutorId,
        lesson_id: &LessonId,
        slot: Slot,
    ) -> Result<Lesson> {
        let lesson = self.get_tutor_lesson(tutor_id, lesson_id)?;
        lifecycle::validate_lesson_transition(lesson_id, lesson.status, LessonStatus::Rescheduled)?;

        if lesson.slot == Some(slot) {
            return Err(EngineError::InvalidRequest(format!(
                "lesson {lesson_id} already uses slot {slot:?}"
            )));
        }
        let target = booking::next_occurrence(slot, Utc::now()).ok_or_else(|| {
            EngineError::InvalidRequest(format!("no upcoming occurrence of slot {slot:?}"))
        })?;

        let moved = match self.store.move_lesson(lesson_id, target, Utc::now())? {
            MoveOutcome::Moved(moved) => moved,
            MoveOutcome::SlotTaken => {
                return Err(EngineError::SlotUnavailable {
                    tutor_id: *tutor_id,
                    slot,
                });
            }
            MoveOutcome::NotLive(from) => {
                return Err(EngineError::InvalidLessonTransition {
                    lesson_id: *lesson_id,
                    from,
                    to: LessonStatus::Rescheduled,
                });
            }
        };

        self.collaborators
            .notify(
                Participant::Tutor(*tutor_id),
                Participant::Student(moved.student_id),
                &format!(
                    "Your lesson was moved to {}.",
                    moved.scheduled_at.to_rfc3339()
                ),
            )
            .await;

        tracing::info!(
            lesson_id = %lesson_id,
            tutor_id = %tutor_id,
            scheduled_at = %moved.scheduled_at,
            "Lesson rescheduled"
        );

        Ok(moved)
    }

    // =========================================================================
    // Availability
    // =========================================================================

    async fn set_availability(
        &self,
        tutor_id: &TutorId,
        slots: &[Slot],
        available: bool,
    ) -> Result<Vec<AvailabilitySlot>> {
        if self.store.get_tutor(tutor_id)?.is_none() {
            return Err(EngineError::TutorNotFound(*tutor_id));
        }

        self.store.set_availability(tutor_id, slots, available)?;

        tracing::info!(
            tutor_id = %tutor_id,
            slots = slots.len(),
            available,
            "Updated availability"
        );

        Ok(self.store.get_availability(tutor_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, Harness};
    use crate::types::{QuizStatus, TopicStatus};
    use futures::future::join_all;
    use tutorlink_core::{DayOfWeek, TimeWindow};
    use tutorlink_store::{CompletionStatus, InvitationStatus};

    /// Request a lesson on `topic` and have `tutor` accept it.
    async fn book(
        service: &TutoringService<tutorlink_store::RocksStore>,
        student_id: &StudentId,
        topic: &tutorlink_store::Topic,
        tutor_id: &TutorId,
    ) -> Lesson {
        let outcome = service
            .request_lesson(student_id, fixtures::monday_request(topic))
            .await
            .unwrap();
        let invitation = outcome
            .invitations
            .iter()
            .find(|i| i.tutor_id == *tutor_id)
            .unwrap();
        match service
            .respond(tutor_id, &invitation.invitation_id, TutorResponse::accept())
            .await
            .unwrap()
        {
            RespondOutcome::Booked(lesson) => lesson,
            RespondOutcome::Declined(_) => panic!("expected a booking"),
        }
    }

    #[tokio::test]
    async fn new_student_sees_first_topic_available() {
        let harness = Harness::new();
        fixtures::seed_curriculum(&harness.store, 3);
        let service = harness.service();

        let progression = service
            .get_progression(&StudentId::generate())
            .await
            .unwrap();
        let statuses: Vec<_> = progression.iter().map(|p| p.status).collect();
        assert_eq!(
            statuses,
            vec![TopicStatus::Available, TopicStatus::Locked, TopicStatus::Locked]
        );
    }

    #[tokio::test]
    async fn request_invites_overlapping_tutors_only() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        let monday = fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 17), (DayOfWeek::MONDAY, 18)]);
        let tuesday = fixtures::seed_tutor(&harness.store, 2, &[(DayOfWeek::TUESDAY, 17)]);
        let service = harness.service();
        let student_id = StudentId::generate();

        let outcome = service
            .request_lesson(&student_id, fixtures::monday_request(&topics[0]))
            .await
            .unwrap();

        assert_eq!(outcome.candidates.len(), 2);
        assert_eq!(outcome.candidates[0].tutor.tutor_id, monday.tutor_id);
        assert!(outcome.candidates[0].exact_time_match());
        assert_eq!(outcome.candidates[1].tutor.tutor_id, tuesday.tutor_id);
        assert!(outcome.candidates[0].score > outcome.candidates[1].score);

        assert_eq!(outcome.invitations.len(), 1);
        let invitation = &outcome.invitations[0];
        assert_eq!(invitation.tutor_id, monday.tutor_id);
        assert_eq!(invitation.matching_days, vec![DayOfWeek::MONDAY]);
        assert_eq!(invitation.matching_hours, vec![17]);
        assert_eq!(invitation.amount_cents, 4_000);
        assert_eq!(harness.mocks.payments.authorized().len(), 1);
        assert_eq!(harness.mocks.notifier.emails().len(), 1);
    }

    #[tokio::test]
    async fn locked_topic_is_not_bookable() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 2);
        fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let service = harness.service();

        let err = service
            .request_lesson(&StudentId::generate(), fixtures::monday_request(&topics[1]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::NoEligibleTopic {
                status: TopicStatus::Locked,
                ..
            }
        ));
        assert_eq!(err.http_status_code(), 422);
    }

    #[tokio::test]
    async fn request_rejects_mismatched_subject() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        let service = harness.service();

        let mut request = fixtures::monday_request(&topics[0]);
        request.subject_id = tutorlink_core::SubjectId::generate();
        let err = service
            .request_lesson(&StudentId::generate(), request)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn no_candidates_keeps_preference_until_next_request() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        let service = harness.service();
        let student_id = StudentId::generate();

        let err = service
            .request_lesson(&student_id, fixtures::monday_request(&topics[0]))
            .await
            .unwrap_err();
        let EngineError::NoCandidates { preference_id, alternatives } = err else {
            panic!("expected NoCandidates");
        };
        assert_eq!(alternatives, 0);
        let stale = harness.store.get_preference(&preference_id).unwrap().unwrap();
        assert_eq!(stale.status, PreferenceStatus::Pending);

        // A tutor shows up; the next request retires the stale preference
        fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let outcome = service
            .request_lesson(&student_id, fixtures::monday_request(&topics[0]))
            .await
            .unwrap();
        assert_eq!(outcome.invitations.len(), 1);

        let stale = harness.store.get_preference(&preference_id).unwrap().unwrap();
        assert_eq!(stale.status, PreferenceStatus::Cancelled);
    }

    #[tokio::test]
    async fn availability_only_tutors_are_alternatives() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::FRIDAY, 9)]);
        let service = harness.service();

        let err = service
            .request_lesson(&StudentId::generate(), fixtures::monday_request(&topics[0]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoCandidates { alternatives: 1, .. }));
        assert!(harness.mocks.payments.authorized().is_empty());
    }

    #[tokio::test]
    async fn in_flight_request_blocks_a_new_one() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let service = harness.service();
        let student_id = StudentId::generate();

        let first = service
            .request_lesson(&student_id, fixtures::monday_request(&topics[0]))
            .await
            .unwrap();
        let err = service
            .request_lesson(&student_id, fixtures::monday_request(&topics[0]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::ActivePreferenceExists { preference_id, .. }
                if preference_id == first.preference.preference_id
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_leave_one_preference_in_flight() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        harness
            .mocks
            .payments
            .set_authorize_delay(std::time::Duration::from_millis(20));
        let service = Arc::new(harness.service());
        let student_id = StudentId::generate();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let service = Arc::clone(&service);
                let request = fixtures::monday_request(&topics[0]);
                tokio::spawn(async move { service.request_lesson(&student_id, request).await })
            })
            .collect();

        let mut accepted = Vec::new();
        for result in join_all(handles).await {
            match result.unwrap() {
                Ok(outcome) => accepted.push(outcome),
                Err(
                    EngineError::ActivePreferenceExists { .. } | EngineError::PreferenceClosed { .. },
                ) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(accepted.len(), 1);
        let winner = &accepted[0];

        let active: Vec<_> = harness
            .store
            .list_preferences_by_student(&student_id)
            .unwrap()
            .into_iter()
            .filter(|p| p.status.is_active())
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].preference_id, winner.preference.preference_id);

        let pending: Vec<_> = harness
            .store
            .list_invitations_by_status(InvitationStatus::Pending)
            .unwrap();
        assert_eq!(pending.len(), winner.invitations.len());
        assert!(pending
            .iter()
            .all(|i| i.preference_id == winner.preference.preference_id));

        // Holds placed by the losing call are given back
        let kept: Vec<_> = winner
            .invitations
            .iter()
            .filter_map(|i| i.authorization_id)
            .collect();
        let released = harness.mocks.payments.released();
        for (authorization_id, ..) in harness.mocks.payments.authorized() {
            assert!(kept.contains(&authorization_id) != released.contains(&authorization_id));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_completion_counts_once() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        let tutor = fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let service = Arc::new(harness.service());
        let student_id = StudentId::generate();
        let lesson = book(&service, &student_id, &topics[0], &tutor.tutor_id).await;

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let service = Arc::clone(&service);
                let tutor_id = tutor.tutor_id;
                let lesson_id = lesson.lesson_id;
                tokio::spawn(async move { service.complete_lesson(&tutor_id, &lesson_id).await })
            })
            .collect();

        let mut completed = 0;
        for result in join_all(handles).await {
            match result.unwrap() {
                Ok(done) => {
                    assert_eq!(done.completion.lessons_completed, 1);
                    completed += 1;
                }
                Err(EngineError::InvalidLessonTransition {
                    from: LessonStatus::Completed,
                    ..
                }) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(completed, 1);

        let tutor_after = harness.store.get_tutor(&tutor.tutor_id).unwrap().unwrap();
        assert_eq!(tutor_after.total_lessons, tutor.total_lessons + 1);
        assert_eq!(harness.mocks.gamification.xp(), vec![(student_id, 50)]);
        let completion = harness
            .store
            .get_completion(&student_id, &topics[0].topic_id)
            .unwrap()
            .unwrap();
        assert_eq!(completion.lessons_completed, 1);
        assert!(harness.store.get_availability(&tutor.tutor_id).unwrap()[0].available);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_racing_reschedule_keeps_grid_consistent() {
        let monday = Slot::new(DayOfWeek::MONDAY, 16).unwrap();
        let wednesday = Slot::new(DayOfWeek::WEDNESDAY, 10).unwrap();
        for _ in 0..8 {
            let harness = Harness::new();
            let topics = fixtures::seed_curriculum(&harness.store, 1);
            let tutor = fixtures::seed_tutor(
                &harness.store,
                1,
                &[(DayOfWeek::MONDAY, 16), (DayOfWeek::WEDNESDAY, 10)],
            );
            let service = Arc::new(harness.service());
            let student_id = StudentId::generate();
            let lesson = book(&service, &student_id, &topics[0], &tutor.tutor_id).await;
            assert_eq!(lesson.slot, Some(monday));

            let cancel = {
                let service = Arc::clone(&service);
                let lesson_id = lesson.lesson_id;
                tokio::spawn(async move {
                    service
                        .cancel_lesson(Participant::Student(student_id), &lesson_id)
                        .await
                })
            };
            let reschedule = {
                let service = Arc::clone(&service);
                let tutor_id = tutor.tutor_id;
                let lesson_id = lesson.lesson_id;
                tokio::spawn(async move {
                    service
                        .reschedule_lesson(&tutor_id, &lesson_id, wednesday)
                        .await
                })
            };
            let cancelled = cancel.await.unwrap();
            let moved = reschedule.await.unwrap();
            assert!(cancelled.is_ok() || moved.is_ok());

            let stored = harness.store.get_lesson(&lesson.lesson_id).unwrap().unwrap();
            let booked: Vec<_> = harness
                .store
                .get_availability(&tutor.tutor_id)
                .unwrap()
                .into_iter()
                .filter(|c| c.booked_lesson.is_some())
                .collect();
            if stored.status.is_live() {
                assert_eq!(stored.status, LessonStatus::Rescheduled);
                assert_eq!(booked.len(), 1);
                assert_eq!(Some(booked[0].slot), stored.slot);
                assert_eq!(stored.slot, Some(wednesday));
            } else {
                assert_eq!(stored.status, LessonStatus::Cancelled);
                assert!(booked.is_empty());
            }
        }
    }

    #[tokio::test]
    async fn booking_then_completion_unlocks_next_topic() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 2);
        let tutor = fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let service = harness.service();
        let student_id = StudentId::generate();

        let lesson = book(&service, &student_id, &topics[0], &tutor.tutor_id).await;
        let progression = service.get_progression(&student_id).await.unwrap();
        assert_eq!(progression[0].status, TopicStatus::InProgress);
        assert_eq!(progression[1].status, TopicStatus::Locked);

        let done = service
            .complete_lesson(&tutor.tutor_id, &lesson.lesson_id)
            .await
            .unwrap();
        assert_eq!(done.lesson.status, LessonStatus::Completed);
        assert_eq!(done.completion.status, CompletionStatus::Completed);
        assert_eq!(done.completion.xp_earned, 50);
        assert_eq!(
            harness.mocks.gamification.xp(),
            vec![(student_id, 50)]
        );
        assert_eq!(harness.mocks.gamification.badge_checks(), 1);

        let tutor_after = harness.store.get_tutor(&tutor.tutor_id).unwrap().unwrap();
        assert_eq!(tutor_after.total_lessons, tutor.total_lessons + 1);
        assert!(harness.store.get_availability(&tutor.tutor_id).unwrap()[0].available);

        let progression = service.get_progression(&student_id).await.unwrap();
        assert_eq!(progression[0].status, TopicStatus::Completed);
        assert_eq!(progression[1].status, TopicStatus::Available);

        // Completing twice is not a valid transition
        let err = service
            .complete_lesson(&tutor.tutor_id, &lesson.lesson_id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidLessonTransition { .. }));
    }

    #[tokio::test]
    async fn quiz_gates_the_next_request() {
        let harness = Harness::new();
        let mut topics = fixtures::seed_curriculum(&harness.store, 2);
        topics[0].quiz_required = true;
        harness.store.put_topic(&topics[0]).unwrap();
        let tutor = fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let service = harness.service();
        let student_id = StudentId::generate();

        let lesson = book(&service, &student_id, &topics[0], &tutor.tutor_id).await;
        service
            .complete_lesson(&tutor.tutor_id, &lesson.lesson_id)
            .await
            .unwrap();

        service
            .record_quiz_attempt(&student_id, &topics[0].topic_id, 60)
            .await
            .unwrap();
        let progression = service.get_progression(&student_id).await.unwrap();
        assert_eq!(progression[0].quiz, QuizStatus::Failed { best: 60 });
        assert!(!progression[0].can_book_next);
        let err = service
            .request_lesson(&student_id, fixtures::monday_request(&topics[1]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoEligibleTopic { .. }));

        service
            .record_quiz_attempt(&student_id, &topics[0].topic_id, 85)
            .await
            .unwrap();
        let outcome = service
            .request_lesson(&student_id, fixtures::monday_request(&topics[1]))
            .await
            .unwrap();
        assert_eq!(outcome.invitations.len(), 1);
    }

    #[tokio::test]
    async fn quiz_score_is_validated() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        let service = harness.service();
        let student_id = StudentId::generate();

        let err = service
            .record_quiz_attempt(&student_id, &topics[0].topic_id, 101)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));

        // The seeded topics carry no quiz
        let err = service
            .record_quiz_attempt(&student_id, &topics[0].topic_id, 90)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));

        let err = service
            .record_quiz_attempt(&student_id, &TopicId::generate(), 90)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TopicNotFound(_)));
    }

    #[tokio::test]
    async fn cancelled_lesson_frees_slot_and_topic() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        let tutor = fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let service = harness.service();
        let student_id = StudentId::generate();

        let lesson = book(&service, &student_id, &topics[0], &tutor.tutor_id).await;

        let err = service
            .cancel_lesson(Participant::Student(StudentId::generate()), &lesson.lesson_id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotParticipant(_)));

        let cancelled = service
            .cancel_lesson(Participant::Student(student_id), &lesson.lesson_id)
            .await
            .unwrap();
        assert_eq!(cancelled.status, LessonStatus::Cancelled);
        assert!(harness.store.get_availability(&tutor.tutor_id).unwrap()[0].available);

        // The in-progress completion is stale now; the topic is bookable again
        let progression = service.get_progression(&student_id).await.unwrap();
        assert_eq!(progression[0].status, TopicStatus::Available);
        assert_eq!(
            harness
                .mocks
                .notifier
                .messages_to(Participant::Tutor(tutor.tutor_id)),
            2
        );
    }

    #[tokio::test]
    async fn reschedule_moves_between_open_slots() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        let tutor = fixtures::seed_tutor(
            &harness.store,
            1,
            &[(DayOfWeek::MONDAY, 16), (DayOfWeek::WEDNESDAY, 10)],
        );
        let service = harness.service();
        let student_id = StudentId::generate();

        let lesson = book(&service, &student_id, &topics[0], &tutor.tutor_id).await;
        let monday = Slot::new(DayOfWeek::MONDAY, 16).unwrap();
        let wednesday = Slot::new(DayOfWeek::WEDNESDAY, 10).unwrap();
        assert_eq!(lesson.slot, Some(monday));

        let err = service
            .reschedule_lesson(&tutor.tutor_id, &lesson.lesson_id, Slot::new(DayOfWeek::FRIDAY, 9).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SlotUnavailable { .. }));

        let moved = service
            .reschedule_lesson(&tutor.tutor_id, &lesson.lesson_id, wednesday)
            .await
            .unwrap();
        assert_eq!(moved.status, LessonStatus::Rescheduled);
        assert_eq!(moved.slot, Some(wednesday));
        assert_eq!(DayOfWeek::of(&moved.scheduled_at), DayOfWeek::WEDNESDAY);

        let grid = harness.store.get_availability(&tutor.tutor_id).unwrap();
        let cell = |slot: Slot| grid.iter().find(|c| c.slot == slot).unwrap().clone();
        assert!(cell(monday).available);
        assert_eq!(cell(wednesday).booked_lesson, Some(lesson.lesson_id));

        // A rescheduled lesson is still live and can be completed
        let done = service
            .complete_lesson(&tutor.tutor_id, &lesson.lesson_id)
            .await
            .unwrap();
        assert_eq!(done.lesson.status, LessonStatus::Completed);
    }

    #[tokio::test]
    async fn full_tutor_is_filtered_out() {
        let harness = Harness::with_config(EngineConfig {
            default_tutor_capacity: 1,
            ..EngineConfig::default()
        });
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        let tutor = fixtures::seed_tutor(
            &harness.store,
            1,
            &[(DayOfWeek::MONDAY, 16), (DayOfWeek::MONDAY, 17)],
        );
        let service = harness.service();

        book(&service, &StudentId::generate(), &topics[0], &tutor.tutor_id).await;

        let err = service
            .request_lesson(&StudentId::generate(), fixtures::monday_request(&topics[0]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoCandidates { alternatives: 0, .. }));
    }

    #[tokio::test]
    async fn set_availability_requires_known_tutor() {
        let harness = Harness::new();
        let tutor = fixtures::seed_tutor(&harness.store, 1, &[]);
        let service = harness.service();
        let slots = [
            Slot::new(DayOfWeek::SATURDAY, 9).unwrap(),
            Slot::new(DayOfWeek::SATURDAY, 10).unwrap(),
        ];

        let grid = service
            .set_availability(&tutor.tutor_id, &slots, true)
            .await
            .unwrap();
        assert_eq!(grid.len(), 2);
        assert!(grid.iter().all(|c| c.available));

        let err = service
            .set_availability(&TutorId::generate(), &slots, true)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TutorNotFound(_)));
    }

    #[tokio::test]
    async fn tutor_inbox_lists_open_invitations() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        let tutor = fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let service = harness.service();

        let first = service
            .request_lesson(&StudentId::generate(), fixtures::monday_request(&topics[0]))
            .await
            .unwrap();
        let second = service
            .request_lesson(&StudentId::generate(), fixtures::monday_request(&topics[0]))
            .await
            .unwrap();

        let inbox = service.tutor_invitations(&tutor.tutor_id).await.unwrap();
        assert_eq!(inbox.len(), 2);
        assert!(inbox
            .iter()
            .any(|i| i.invitation_id == first.invitations[0].invitation_id));
        assert!(inbox.windows(2).all(|w| w[0].expires_at <= w[1].expires_at));

        service
            .respond(
                &tutor.tutor_id,
                &second.invitations[0].invitation_id,
                TutorResponse::decline(None),
            )
            .await
            .unwrap();
        let inbox = service.tutor_invitations(&tutor.tutor_id).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert!(service
            .tutor_invitations(&TutorId::generate())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn tutor_decline_leaves_preference_open() {
        let harness = Harness::new();
        let topics = fixtures::seed_curriculum(&harness.store, 1);
        let tutor = fixtures::seed_tutor(&harness.store, 1, &[(DayOfWeek::MONDAY, 16)]);
        let service = harness.service();
        let student_id = StudentId::generate();

        let mut request = fixtures::monday_request(&topics[0]);
        request.window = TimeWindow::from_hours(15, 17).unwrap();
        let outcome = service.request_lesson(&student_id, request).await.unwrap();

        service
            .respond(
                &tutor.tutor_id,
                &outcome.invitations[0].invitation_id,
                TutorResponse::decline(None),
            )
            .await
            .unwrap();

        let invitation = harness
            .store
            .get_invitation(&outcome.invitations[0].invitation_id)
            .unwrap()
            .unwrap();
        assert_eq!(invitation.status, InvitationStatus::Rejected);
        let preference = harness
            .store
            .get_preference(&outcome.preference.preference_id)
            .unwrap()
            .unwrap();
        assert_eq!(preference.status, PreferenceStatus::Pending);

        // With nothing outstanding a fresh request goes through
        service
            .request_lesson(&student_id, fixtures::monday_request(&topics[0]))
            .await
            .unwrap();
    }
}
