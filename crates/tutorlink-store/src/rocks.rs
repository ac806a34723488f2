//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use tutorlink_core::{InvitationId, LessonId, PreferenceId, Slot, StudentId, TopicId, TutorId};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::types::{
    AvailabilitySlot, BookingCommit, BookingOutcome, BookingReceipt, ClaimOutcome,
    CompletionCommit, CompletionReceipt, CompletionStatus, FanOutOutcome, InvitationStatus,
    Lesson, LessonInvitation, LessonStatus, MoveOutcome, OpenOutcome, PreferenceStatus,
    QuizAttempt, SlotCandidate, StudentMatchingPreference, Topic, TopicCompletion, Tutor,
};
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    /// Serializes every read-modify-write so conditional updates are linearizable.
    write_gate: Mutex<()>,
}

fn db_err(e: rocksdb::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(db_err)?;

        Ok(Self {
            db: Arc::new(db),
            write_gate: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Read one record from a column family.
    fn load<T: serde::de::DeserializeOwned>(&self, name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(db_err)?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    /// Collect every key in a column family that starts with `prefix`.
    fn scan_keys(&self, name: &str, prefix: &[u8]) -> Result<Vec<Box<[u8]>>> {
        let cf = self.cf(name)?;
        let mode = if prefix.is_empty() {
            IteratorMode::Start
        } else {
            IteratorMode::From(prefix, Direction::Forward)
        };

        let mut found = Vec::new();
        for item in self.db.iterator_cf(&cf, mode) {
            let (key, _) = item.map_err(db_err)?;

            // Stop if we're past the prefix
            if !key.starts_with(prefix) {
                break;
            }
            found.push(key);
        }
        Ok(found)
    }

    /// Decode every value in a column family under `prefix`.
    fn scan_values<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
        prefix: &[u8],
    ) -> Result<Vec<T>> {
        let cf = self.cf(name)?;
        let mode = if prefix.is_empty() {
            IteratorMode::Start
        } else {
            IteratorMode::From(prefix, Direction::Forward)
        };

        let mut values = Vec::new();
        for item in self.db.iterator_cf(&cf, mode) {
            let (key, value) = item.map_err(db_err)?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(Self::deserialize(&value)?);
        }
        Ok(values)
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db.write(batch).map_err(db_err)
    }

    fn load_invitation(&self, invitation_id: &InvitationId) -> Result<Option<LessonInvitation>> {
        self.load(cf::INVITATIONS, &keys::invitation_key(invitation_id))
    }

    fn load_preference(
        &self,
        preference_id: &PreferenceId,
    ) -> Result<Option<StudentMatchingPreference>> {
        self.load(cf::PREFERENCES, &keys::preference_key(preference_id))
    }

    fn load_slot(&self, tutor_id: &TutorId, slot: &Slot) -> Result<Option<AvailabilitySlot>> {
        self.load(cf::AVAILABILITY, &keys::availability_key(tutor_id, slot))
    }

    fn invitations_under(&self, index: &str, prefix: &[u8]) -> Result<Vec<LessonInvitation>> {
        let mut invitations = Vec::new();
        for key in self.scan_keys(index, prefix)? {
            let invitation_id = InvitationId::from_bytes(keys::trailing_id(&key));
            if let Some(invitation) = self.load_invitation(&invitation_id)? {
                invitations.push(invitation);
            }
        }
        Ok(invitations)
    }

    fn lessons_under(&self, index: &str, prefix: &[u8]) -> Result<Vec<Lesson>> {
        let mut lessons = Vec::new();
        for key in self.scan_keys(index, prefix)? {
            let lesson_id = LessonId::from_bytes(keys::trailing_id(&key));
            if let Some(lesson) = self.get_lesson(&lesson_id)? {
                lessons.push(lesson);
            }
        }
        Ok(lessons)
    }

    /// Stage an invitation write, keeping the status index in step.
    fn stage_invitation(
        &self,
        batch: &mut WriteBatch,
        previous: Option<InvitationStatus>,
        invitation: &LessonInvitation,
    ) -> Result<()> {
        let cf_invitations = self.cf(cf::INVITATIONS)?;
        let cf_by_preference = self.cf(cf::INVITATIONS_BY_PREFERENCE)?;
        let cf_by_status = self.cf(cf::INVITATIONS_BY_STATUS)?;
        let cf_by_tutor = self.cf(cf::INVITATIONS_BY_TUTOR)?;
        let id = &invitation.invitation_id;

        batch.put_cf(
            &cf_invitations,
            keys::invitation_key(id),
            Self::serialize(invitation)?,
        );
        batch.put_cf(
            &cf_by_preference,
            keys::preference_invitation_key(&invitation.preference_id, id),
            [],
        );
        batch.put_cf(
            &cf_by_tutor,
            keys::tutor_invitation_key(&invitation.tutor_id, id),
            [],
        );

        if let Some(old) = previous {
            if old != invitation.status {
                batch.delete_cf(&cf_by_status, keys::status_invitation_key(old.as_u8(), id));
            }
        }
        batch.put_cf(
            &cf_by_status,
            keys::status_invitation_key(invitation.status.as_u8(), id),
            [],
        );
        Ok(())
    }

    fn stage_preference(
        &self,
        batch: &mut WriteBatch,
        preference: &StudentMatchingPreference,
    ) -> Result<()> {
        let cf_preferences = self.cf(cf::PREFERENCES)?;
        let cf_by_student = self.cf(cf::PREFERENCES_BY_STUDENT)?;

        batch.put_cf(
            &cf_preferences,
            keys::preference_key(&preference.preference_id),
            Self::serialize(preference)?,
        );
        batch.put_cf(
            &cf_by_student,
            keys::student_preference_key(&preference.student_id, &preference.preference_id),
            [],
        );
        Ok(())
    }

    fn stage_lesson(&self, batch: &mut WriteBatch, lesson: &Lesson) -> Result<()> {
        let cf_lessons = self.cf(cf::LESSONS)?;
        let cf_by_student = self.cf(cf::LESSONS_BY_STUDENT)?;
        let cf_by_tutor = self.cf(cf::LESSONS_BY_TUTOR)?;

        batch.put_cf(
            &cf_lessons,
            keys::lesson_key(&lesson.lesson_id),
            Self::serialize(lesson)?,
        );
        batch.put_cf(
            &cf_by_student,
            keys::student_lesson_key(&lesson.student_id, &lesson.lesson_id),
            [],
        );
        batch.put_cf(
            &cf_by_tutor,
            keys::tutor_lesson_key(&lesson.tutor_id, &lesson.lesson_id),
            [],
        );
        Ok(())
    }

    fn stage_slot(&self, batch: &mut WriteBatch, slot: &AvailabilitySlot) -> Result<()> {
        let cf = self.cf(cf::AVAILABILITY)?;
        batch.put_cf(
            &cf,
            keys::availability_key(&slot.tutor_id, &slot.slot),
            Self::serialize(slot)?,
        );
        Ok(())
    }

    fn stage_tutor(&self, batch: &mut WriteBatch, tutor: &Tutor) -> Result<()> {
        let cf = self.cf(cf::TUTORS)?;
        batch.put_cf(&cf, keys::tutor_key(&tutor.tutor_id), Self::serialize(tutor)?);
        Ok(())
    }

    /// Stage freeing the lesson's grid slot, if the lesson still holds it.
    fn stage_slot_release(&self, batch: &mut WriteBatch, lesson: &Lesson) -> Result<()> {
        let Some(slot) = lesson.slot else {
            return Ok(());
        };
        match self.load_slot(&lesson.tutor_id, &slot)? {
            Some(mut cell) if cell.booked_lesson == Some(lesson.lesson_id) => {
                cell.available = true;
                cell.booked_lesson = None;
                self.stage_slot(batch, &cell)
            }
            _ => {
                tracing::warn!(
                    lesson_id = %lesson.lesson_id,
                    tutor_id = %lesson.tutor_id,
                    slot = ?slot,
                    "Lesson slot was not held by the lesson"
                );
                Ok(())
            }
        }
    }

    fn has_pending_invitation(&self, preference_id: &PreferenceId) -> Result<bool> {
        Ok(self
            .list_invitations_by_preference(preference_id)?
            .iter()
            .any(|i| i.status == InvitationStatus::Pending))
    }

    fn stage_completion(&self, batch: &mut WriteBatch, completion: &TopicCompletion) -> Result<()> {
        let cf = self.cf(cf::COMPLETIONS)?;
        batch.put_cf(
            &cf,
            keys::completion_key(&completion.student_id, &completion.topic_id),
            Self::serialize(completion)?,
        );
        Ok(())
    }

    /// First candidate whose slot is still open.
    fn first_open_candidate(
        &self,
        tutor_id: &TutorId,
        candidates: &[SlotCandidate],
    ) -> Result<Option<SlotCandidate>> {
        for candidate in candidates {
            if let Some(cell) = self.load_slot(tutor_id, &candidate.slot)? {
                if cell.available {
                    return Ok(Some(*candidate));
                }
            }
            tracing::debug!(
                tutor_id = %tutor_id,
                slot = ?candidate.slot,
                "Candidate slot no longer available, trying next"
            );
        }
        Ok(None)
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Curriculum
    // =========================================================================

    fn put_topic(&self, topic: &Topic) -> Result<()> {
        let cf = self.cf(cf::TOPICS)?;
        self.db
            .put_cf(&cf, keys::topic_key(&topic.topic_id), Self::serialize(topic)?)
            .map_err(db_err)
    }

    fn get_topic(&self, topic_id: &TopicId) -> Result<Option<Topic>> {
        self.load(cf::TOPICS, &keys::topic_key(topic_id))
    }

    fn list_topics(&self) -> Result<Vec<Topic>> {
        let mut topics: Vec<Topic> = self.scan_values(cf::TOPICS, &[])?;
        topics.sort_by(|a, b| {
            a.subject_id
                .cmp(&b.subject_id)
                .then(a.ordinal.cmp(&b.ordinal))
                .then(a.topic_id.cmp(&b.topic_id))
        });
        Ok(topics)
    }

    // =========================================================================
    // Progress
    // =========================================================================

    fn get_completion(
        &self,
        student_id: &StudentId,
        topic_id: &TopicId,
    ) -> Result<Option<TopicCompletion>> {
        self.load(cf::COMPLETIONS, &keys::completion_key(student_id, topic_id))
    }

    fn list_completions(&self, student_id: &StudentId) -> Result<Vec<TopicCompletion>> {
        self.scan_values(cf::COMPLETIONS, &keys::student_prefix(student_id))
    }

    fn put_quiz_attempt(&self, attempt: &QuizAttempt) -> Result<()> {
        let cf = self.cf(cf::QUIZ_ATTEMPTS)?;
        let key = keys::quiz_attempt_key(&attempt.student_id, &attempt.topic_id, &attempt.attempt_id);
        self.db
            .put_cf(&cf, key, Self::serialize(attempt)?)
            .map_err(db_err)
    }

    fn list_quiz_attempts(&self, student_id: &StudentId) -> Result<Vec<QuizAttempt>> {
        self.scan_values(cf::QUIZ_ATTEMPTS, &keys::student_prefix(student_id))
    }

    // =========================================================================
    // Tutors and availability
    // =========================================================================

    fn put_tutor(&self, tutor: &Tutor) -> Result<()> {
        let _gate = self.write_gate.lock();
        let mut batch = WriteBatch::default();
        self.stage_tutor(&mut batch, tutor)?;
        self.write(batch)
    }

    fn get_tutor(&self, tutor_id: &TutorId) -> Result<Option<Tutor>> {
        self.load(cf::TUTORS, &keys::tutor_key(tutor_id))
    }

    fn list_tutors(&self) -> Result<Vec<Tutor>> {
        self.scan_values(cf::TUTORS, &[])
    }

    fn set_availability(&self, tutor_id: &TutorId, slots: &[Slot], available: bool) -> Result<()> {
        let _gate = self.write_gate.lock();
        let mut batch = WriteBatch::default();

        for slot in slots {
            if let Some(existing) = self.load_slot(tutor_id, slot)? {
                if existing.booked_lesson.is_some() {
                    continue;
                }
            }
            let cell = AvailabilitySlot {
                tutor_id: *tutor_id,
                slot: *slot,
                available,
                booked_lesson: None,
            };
            self.stage_slot(&mut batch, &cell)?;
        }

        self.write(batch)
    }

    fn get_availability(&self, tutor_id: &TutorId) -> Result<Vec<AvailabilitySlot>> {
        self.scan_values(cf::AVAILABILITY, &keys::tutor_prefix(tutor_id))
    }

    // =========================================================================
    // Preferences
    // =========================================================================

    fn open_preference(&self, preference: &StudentMatchingPreference) -> Result<OpenOutcome> {
        let _gate = self.write_gate.lock();

        if self.load_preference(&preference.preference_id)?.is_some() {
            return Err(StoreError::Conflict(format!(
                "preference {} already exists",
                preference.preference_id
            )));
        }

        let mut batch = WriteBatch::default();
        let mut retired = Vec::new();
        for mut existing in self.list_preferences_by_student(&preference.student_id)? {
            match existing.status {
                PreferenceStatus::Matched => {
                    return Ok(OpenOutcome::Blocked(existing.preference_id));
                }
                PreferenceStatus::Pending => {
                    if self.has_pending_invitation(&existing.preference_id)? {
                        return Ok(OpenOutcome::Blocked(existing.preference_id));
                    }
                    existing.status = PreferenceStatus::Cancelled;
                    existing.updated_at = preference.created_at;
                    self.stage_preference(&mut batch, &existing)?;
                    retired.push(existing.preference_id);
                }
                PreferenceStatus::Confirmed | PreferenceStatus::Cancelled => {}
            }
        }

        self.stage_preference(&mut batch, preference)?;
        self.write(batch)?;
        Ok(OpenOutcome::Opened { retired })
    }

    fn get_preference(
        &self,
        preference_id: &PreferenceId,
    ) -> Result<Option<StudentMatchingPreference>> {
        self.load_preference(preference_id)
    }

    fn list_preferences_by_student(
        &self,
        student_id: &StudentId,
    ) -> Result<Vec<StudentMatchingPreference>> {
        let mut preferences = Vec::new();
        for key in self.scan_keys(cf::PREFERENCES_BY_STUDENT, &keys::student_prefix(student_id))? {
            let preference_id = PreferenceId::from_bytes(keys::trailing_id(&key));
            if let Some(preference) = self.load_preference(&preference_id)? {
                preferences.push(preference);
            }
        }
        preferences.sort_by_key(|p| p.created_at);
        Ok(preferences)
    }

    fn transition_preference(
        &self,
        preference_id: &PreferenceId,
        expected: PreferenceStatus,
        target: PreferenceStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<StudentMatchingPreference>> {
        let _gate = self.write_gate.lock();

        let mut preference = self
            .load_preference(preference_id)?
            .ok_or(StoreError::NotFound)?;
        if preference.status != expected {
            return Ok(None);
        }

        preference.status = target;
        preference.updated_at = at;
        if target == PreferenceStatus::Pending {
            preference.matched_invitation = None;
        }

        let mut batch = WriteBatch::default();
        self.stage_preference(&mut batch, &preference)?;
        self.write(batch)?;
        Ok(Some(preference))
    }

    // =========================================================================
    // Invitations
    // =========================================================================

    fn insert_invitations(&self, invitations: &[LessonInvitation]) -> Result<FanOutOutcome> {
        let _gate = self.write_gate.lock();

        let Some(first) = invitations.first() else {
            return Ok(FanOutOutcome::Inserted);
        };
        if invitations
            .iter()
            .any(|i| i.preference_id != first.preference_id)
        {
            return Err(StoreError::Conflict(
                "a fan-out batch must belong to a single preference".to_string(),
            ));
        }

        let mut batch = WriteBatch::default();
        for invitation in invitations {
            if self.load_invitation(&invitation.invitation_id)?.is_some() {
                return Err(StoreError::Conflict(format!(
                    "invitation {} already exists",
                    invitation.invitation_id
                )));
            }
            self.stage_invitation(&mut batch, None, invitation)?;
        }

        let preference = self
            .load_preference(&first.preference_id)?
            .ok_or(StoreError::NotFound)?;
        if preference.status != PreferenceStatus::Pending {
            return Ok(FanOutOutcome::PreferenceResolved(preference.status));
        }
        for related in self.list_preferences_by_student(&preference.student_id)? {
            if related.subject_id != preference.subject_id || related.topic_id != preference.topic_id
            {
                continue;
            }
            if self.has_pending_invitation(&related.preference_id)? {
                return Ok(FanOutOutcome::Outstanding(related.preference_id));
            }
        }

        self.write(batch)?;
        Ok(FanOutOutcome::Inserted)
    }

    fn get_invitation(&self, invitation_id: &InvitationId) -> Result<Option<LessonInvitation>> {
        self.load_invitation(invitation_id)
    }

    fn list_invitations_by_preference(
        &self,
        preference_id: &PreferenceId,
    ) -> Result<Vec<LessonInvitation>> {
        self.invitations_under(
            cf::INVITATIONS_BY_PREFERENCE,
            &keys::preference_prefix(preference_id),
        )
    }

    fn list_invitations_by_status(
        &self,
        status: InvitationStatus,
    ) -> Result<Vec<LessonInvitation>> {
        self.invitations_under(
            cf::INVITATIONS_BY_STATUS,
            &keys::status_prefix(status.as_u8()),
        )
    }

    fn list_invitations_by_tutor(&self, tutor_id: &TutorId) -> Result<Vec<LessonInvitation>> {
        self.invitations_under(cf::INVITATIONS_BY_TUTOR, &keys::tutor_prefix(tutor_id))
    }

    fn transition_invitation(
        &self,
        invitation_id: &InvitationId,
        expected: InvitationStatus,
        target: InvitationStatus,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Option<LessonInvitation>> {
        let _gate = self.write_gate.lock();

        let mut invitation = self
            .load_invitation(invitation_id)?
            .ok_or(StoreError::NotFound)?;
        if invitation.status != expected {
            return Ok(None);
        }

        invitation.status = target;
        invitation.responded_at = Some(at);
        if note.is_some() {
            invitation.tutor_response = note;
        }

        let mut batch = WriteBatch::default();
        self.stage_invitation(&mut batch, Some(expected), &invitation)?;
        self.write(batch)?;
        Ok(Some(invitation))
    }

    fn claim_invitation(
        &self,
        invitation_id: &InvitationId,
        at: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let _gate = self.write_gate.lock();

        let mut invitation = self
            .load_invitation(invitation_id)?
            .ok_or(StoreError::NotFound)?;
        if invitation.status != InvitationStatus::Pending {
            return Ok(ClaimOutcome::InvitationNotPending(invitation.status));
        }
        if invitation.expires_at < at {
            return Ok(ClaimOutcome::PastDeadline);
        }

        let mut preference = self
            .load_preference(&invitation.preference_id)?
            .ok_or(StoreError::NotFound)?;
        if preference.status != PreferenceStatus::Pending {
            return Ok(ClaimOutcome::PreferenceResolved(preference.status));
        }

        invitation.status = InvitationStatus::Accepted;
        invitation.responded_at = Some(at);
        preference.status = PreferenceStatus::Matched;
        preference.matched_invitation = Some(*invitation_id);
        preference.updated_at = at;

        let mut batch = WriteBatch::default();
        self.stage_invitation(&mut batch, Some(InvitationStatus::Pending), &invitation)?;
        self.stage_preference(&mut batch, &preference)?;
        self.write(batch)?;

        Ok(ClaimOutcome::Claimed(invitation))
    }

    fn release_claim(
        &self,
        invitation_id: &InvitationId,
        revert_to: InvitationStatus,
        needs_review: bool,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let _gate = self.write_gate.lock();

        let mut invitation = self
            .load_invitation(invitation_id)?
            .ok_or(StoreError::NotFound)?;
        let mut preference = self
            .load_preference(&invitation.preference_id)?
            .ok_or(StoreError::NotFound)?;

        if invitation.status != InvitationStatus::Accepted
            || preference.status != PreferenceStatus::Matched
            || preference.matched_invitation != Some(*invitation_id)
        {
            return Ok(false);
        }

        invitation.status = revert_to;
        invitation.needs_review = needs_review;
        invitation.responded_at = Some(at);
        preference.status = PreferenceStatus::Pending;
        preference.matched_invitation = None;
        preference.updated_at = at;

        let mut batch = WriteBatch::default();
        self.stage_invitation(&mut batch, Some(InvitationStatus::Accepted), &invitation)?;
        self.stage_preference(&mut batch, &preference)?;
        self.write(batch)?;
        Ok(true)
    }

    fn commit_booking(&self, commit: &BookingCommit) -> Result<BookingOutcome> {
        let _gate = self.write_gate.lock();

        let invitation = self
            .load_invitation(&commit.invitation_id)?
            .ok_or(StoreError::NotFound)?;
        let mut preference = self
            .load_preference(&invitation.preference_id)?
            .ok_or(StoreError::NotFound)?;

        if invitation.status != InvitationStatus::Accepted
            || preference.status != PreferenceStatus::Matched
            || preference.matched_invitation != Some(commit.invitation_id)
        {
            return Err(StoreError::Conflict(format!(
                "invitation {} does not hold the claim on preference {}",
                commit.invitation_id, preference.preference_id
            )));
        }

        if let Some(live) = self
            .list_lessons_by_student(&invitation.student_id)?
            .into_iter()
            .find(|l| l.topic_id == invitation.topic_id && l.status.is_live())
        {
            return Ok(BookingOutcome::TopicInProgress(live.lesson_id));
        }
        if self
            .get_completion(&invitation.student_id, &invitation.topic_id)?
            .is_some_and(|c| c.status == CompletionStatus::Completed)
        {
            return Ok(BookingOutcome::TopicCompleted);
        }

        let mut lesson = commit.lesson.clone();
        let mut batch = WriteBatch::default();

        match self.first_open_candidate(&invitation.tutor_id, &commit.candidates)? {
            Some(candidate) => {
                lesson.scheduled_at = candidate.starts_at;
                lesson.slot = Some(candidate.slot);
                let cell = AvailabilitySlot {
                    tutor_id: invitation.tutor_id,
                    slot: candidate.slot,
                    available: false,
                    booked_lesson: Some(lesson.lesson_id),
                };
                self.stage_slot(&mut batch, &cell)?;
            }
            None if commit.candidates.is_empty() => {
                let Some(fallback) = commit.fallback_start else {
                    return Ok(BookingOutcome::NoSlot);
                };
                lesson.scheduled_at = fallback;
                lesson.slot = None;
            }
            None => return Ok(BookingOutcome::NoSlot),
        }

        self.stage_lesson(&mut batch, &lesson)?;
        self.stage_completion(&mut batch, &commit.completion)?;

        let mut auto_rejected = Vec::new();
        for mut sibling in self.list_invitations_by_preference(&invitation.preference_id)? {
            if sibling.invitation_id == commit.invitation_id
                || sibling.status != InvitationStatus::Pending
            {
                continue;
            }
            sibling.status = InvitationStatus::AutoRejected;
            sibling.responded_at = Some(commit.at);
            self.stage_invitation(&mut batch, Some(InvitationStatus::Pending), &sibling)?;
            auto_rejected.push(sibling);
        }

        preference.status = PreferenceStatus::Confirmed;
        preference.updated_at = commit.at;
        self.stage_preference(&mut batch, &preference)?;

        self.write(batch)?;

        Ok(BookingOutcome::Booked(BookingReceipt {
            lesson,
            auto_rejected,
            preference,
        }))
    }

    // =========================================================================
    // Lessons
    // =========================================================================

    fn get_lesson(&self, lesson_id: &LessonId) -> Result<Option<Lesson>> {
        self.load(cf::LESSONS, &keys::lesson_key(lesson_id))
    }

    fn list_lessons_by_student(&self, student_id: &StudentId) -> Result<Vec<Lesson>> {
        self.lessons_under(cf::LESSONS_BY_STUDENT, &keys::student_prefix(student_id))
    }

    fn list_lessons_by_tutor(&self, tutor_id: &TutorId) -> Result<Vec<Lesson>> {
        self.lessons_under(cf::LESSONS_BY_TUTOR, &keys::tutor_prefix(tutor_id))
    }

    fn transition_lesson(
        &self,
        lesson_id: &LessonId,
        expected: LessonStatus,
        target: LessonStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Lesson>> {
        let _gate = self.write_gate.lock();

        let mut lesson = self.get_lesson(lesson_id)?.ok_or(StoreError::NotFound)?;
        if lesson.status != expected {
            return Ok(None);
        }

        let mut batch = WriteBatch::default();
        if !target.is_live() {
            self.stage_slot_release(&mut batch, &lesson)?;
        }
        lesson.status = target;
        lesson.updated_at = at;
        self.stage_lesson(&mut batch, &lesson)?;
        self.write(batch)?;
        Ok(Some(lesson))
    }

    fn complete_lesson(&self, commit: &CompletionCommit) -> Result<Option<CompletionReceipt>> {
        let _gate = self.write_gate.lock();

        let mut lesson = self
            .get_lesson(&commit.lesson_id)?
            .ok_or(StoreError::NotFound)?;
        if !lesson.status.is_live() {
            return Ok(None);
        }

        let mut batch = WriteBatch::default();
        self.stage_slot_release(&mut batch, &lesson)?;
        lesson.status = LessonStatus::Completed;
        lesson.updated_at = commit.at;
        self.stage_lesson(&mut batch, &lesson)?;

        let mut completion = self
            .get_completion(&lesson.student_id, &lesson.topic_id)?
            .unwrap_or_else(|| {
                TopicCompletion::not_started(lesson.student_id, lesson.topic_id, commit.at)
            });
        let mut topic_completed = false;
        if completion.status != CompletionStatus::Completed {
            completion.lessons_completed = completion.lessons_completed.saturating_add(1);
            if completion.lessons_completed >= commit.lessons_required.max(1) {
                completion.status = CompletionStatus::Completed;
                completion.completed_at = Some(commit.at);
                completion.xp_earned = commit.xp_reward;
                topic_completed = true;
            } else {
                completion.status = CompletionStatus::InProgress;
            }
            completion.updated_at = commit.at;
            self.stage_completion(&mut batch, &completion)?;
        }

        if let Some(mut tutor) = self.get_tutor(&lesson.tutor_id)? {
            tutor.total_lessons = tutor.total_lessons.saturating_add(1);
            self.stage_tutor(&mut batch, &tutor)?;
        }

        self.write(batch)?;
        Ok(Some(CompletionReceipt {
            lesson,
            completion,
            topic_completed,
        }))
    }

    fn move_lesson(
        &self,
        lesson_id: &LessonId,
        to: SlotCandidate,
        at: DateTime<Utc>,
    ) -> Result<MoveOutcome> {
        let _gate = self.write_gate.lock();

        let mut lesson = self.get_lesson(lesson_id)?.ok_or(StoreError::NotFound)?;
        if !lesson.status.is_live() {
            return Ok(MoveOutcome::NotLive(lesson.status));
        }
        let Some(mut cell) = self.load_slot(&lesson.tutor_id, &to.slot)? else {
            return Ok(MoveOutcome::SlotTaken);
        };
        if !cell.available {
            return Ok(MoveOutcome::SlotTaken);
        }

        let mut batch = WriteBatch::default();
        self.stage_slot_release(&mut batch, &lesson)?;
        cell.available = false;
        cell.booked_lesson = Some(lesson.lesson_id);
        self.stage_slot(&mut batch, &cell)?;

        lesson.status = LessonStatus::Rescheduled;
        lesson.scheduled_at = to.starts_at;
        lesson.slot = Some(to.slot);
        lesson.updated_at = at;
        self.stage_lesson(&mut batch, &lesson)?;

        self.write(batch)?;
        Ok(MoveOutcome::Moved(lesson))
    }
}
