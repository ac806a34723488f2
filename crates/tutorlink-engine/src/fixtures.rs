//! Shared setup for engine tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tutorlink_core::{DayOfWeek, PreferenceId, Slot, StudentId, SubjectId, TimeWindow, TopicId, TutorId};
use tutorlink_store::{
    LessonInvitation, OpenOutcome, PreferenceStatus, RocksStore, Store, StudentMatchingPreference, Topic, Tutor,
};

use crate::collaborators::mock::MockCollaborators;
use crate::invitations::InvitationManager;
use crate::matcher;
use crate::service::TutoringService;
use crate::types::{EngineConfig, LessonRequest};

/// A store in a temp dir plus mock collaborators.
pub struct Harness {
    pub store: Arc<RocksStore>,
    pub mocks: MockCollaborators,
    pub config: EngineConfig,
    _dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        Self {
            store,
            mocks: MockCollaborators::new(),
            config,
            _dir: dir,
        }
    }

    pub fn manager(&self) -> InvitationManager<RocksStore> {
        InvitationManager::new(
            Arc::clone(&self.store),
            self.mocks.bundle(),
            self.config.clone(),
        )
    }

    pub fn service(&self) -> TutoringService<RocksStore> {
        TutoringService::new(
            Arc::clone(&self.store),
            self.mocks.bundle(),
            self.config.clone(),
        )
    }
}

pub fn subject() -> SubjectId {
    SubjectId::from_bytes([7u8; 16])
}

/// `count` topics of one subject, no quizzes, one lesson each.
pub fn seed_curriculum(store: &RocksStore, count: u32) -> Vec<Topic> {
    (1..=count)
        .map(|ordinal| {
            let topic = Topic {
                topic_id: TopicId::generate(),
                subject_id: subject(),
                title: format!("Unit {ordinal}"),
                ordinal,
                prerequisites: vec![],
                quiz_required: false,
                passing_score: 80,
                xp_reward: 50,
                lessons_required: 1,
            };
            store.put_topic(&topic).unwrap();
            topic
        })
        .collect()
}

/// An active tutor of `subject()` at 40.00/h with open slots at the given hours.
pub fn seed_tutor(store: &RocksStore, id: u8, slots: &[(DayOfWeek, u8)]) -> Tutor {
    let tutor = Tutor {
        tutor_id: TutorId::from_bytes([id; 16]),
        display_name: format!("Tutor {id}"),
        email: format!("tutor{id}@example.com"),
        subjects: vec![subject()],
        active: true,
        hourly_rate_cents: 4_000,
        rating: 4.5,
        total_lessons: 20,
        capacity: None,
        gender: None,
        teaching_style: None,
    };
    store.put_tutor(&tutor).unwrap();

    let grid: Vec<Slot> = slots
        .iter()
        .map(|(day, hour)| Slot::new(*day, *hour).unwrap())
        .collect();
    store.set_availability(&tutor.tutor_id, &grid, true).unwrap();
    tutor
}

/// Monday 16:00-18:00, up to 50.00/h.
pub fn monday_request(topic: &Topic) -> LessonRequest {
    LessonRequest::new(
        topic.subject_id,
        topic.topic_id,
        vec![DayOfWeek::MONDAY],
        TimeWindow::from_hours(16, 18).unwrap(),
        5_000,
    )
}

/// A pending Monday 16:00-18:00 preference, persisted.
pub fn seed_preference(
    store: &RocksStore,
    student_id: StudentId,
    topic: &Topic,
) -> StudentMatchingPreference {
    let now = Utc::now();
    let request = monday_request(topic);
    let preference = StudentMatchingPreference {
        preference_id: PreferenceId::generate(),
        student_id,
        subject_id: request.subject_id,
        topic_id: request.topic_id,
        preferred_days: request.preferred_days,
        window: request.window,
        max_hourly_rate_cents: request.max_hourly_rate_cents,
        preferred_gender: None,
        preferred_style: None,
        contact_email: Some("student@example.com".to_string()),
        status: PreferenceStatus::Pending,
        matched_invitation: None,
        created_at: now,
        updated_at: now,
    };
    assert!(matches!(
        store.open_preference(&preference).unwrap(),
        OpenOutcome::Opened { .. }
    ));
    preference
}

/// Rank, select and invite for a preference.
pub async fn fan_out(
    harness: &Harness,
    manager: &InvitationManager<RocksStore>,
    preference: &StudentMatchingPreference,
) -> Vec<LessonInvitation> {
    fan_out_at(harness, manager, preference, Utc::now()).await
}

pub async fn fan_out_at(
    harness: &Harness,
    manager: &InvitationManager<RocksStore>,
    preference: &StudentMatchingPreference,
    at: DateTime<Utc>,
) -> Vec<LessonInvitation> {
    let ranked = matcher::find_candidates(harness.store.as_ref(), preference, &harness.config).unwrap();
    let invitees = matcher::select_invitees(&ranked, &harness.config);
    manager
        .create_invitations_at(preference, &invitees, at)
        .await
        .unwrap()
}
