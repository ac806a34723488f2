//! Topic progression.
//!
//! A student's topic statuses are never stored. They are projected from the curriculum,
//! the student's completion records, live lessons and quiz attempts every time they are
//! asked for. Within a subject, topics are walked in ordinal order:
//!
//! 1. A completed record makes the topic `Completed`. This never reverts.
//! 2. Otherwise a live (scheduled or rescheduled) lesson makes it `InProgress`. A
//!    stored in-progress record with no live lesson behind it is ignored.
//! 3. Otherwise the topic is `Available` if it is the first of its subject, or if the
//!    previous topic is completed and its quiz (if required) is passed, and all explicit
//!    prerequisites are completed. Anything else is `Locked`.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tutorlink_core::{StudentId, TopicId};
use tutorlink_store::{CompletionStatus, Lesson, QuizAttempt, Store, Topic, TopicCompletion};

use crate::error::{EngineError, Result};
use crate::types::{QuizStatus, TopicStatus};

/// One row of a student's progression.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicProgress {
    /// The topic.
    pub topic: Topic,
    /// Derived status.
    pub status: TopicStatus,
    /// Quiz state.
    pub quiz: QuizStatus,
    /// Whether finishing this topic lets the student book the next one.
    pub can_book_next: bool,
}

/// Quiz state of `topic` given the student's best score.
#[must_use]
pub fn quiz_status(topic: &Topic, best: Option<u8>) -> QuizStatus {
    if !topic.quiz_required {
        return QuizStatus::NotRequired;
    }
    match best {
        None => QuizStatus::NotAttempted,
        Some(best) if best >= topic.passing_score => QuizStatus::Passed { best },
        Some(best) => QuizStatus::Failed { best },
    }
}

/// Project a student's progression from their history.
///
/// `topics` may come in any order; the result is ordered by subject, then ordinal.
#[must_use]
pub fn project(
    topics: &[Topic],
    completions: &[TopicCompletion],
    lessons: &[Lesson],
    attempts: &[QuizAttempt],
) -> Vec<TopicProgress> {
    let completed: HashSet<TopicId> = completions
        .iter()
        .filter(|c| c.status == CompletionStatus::Completed)
        .map(|c| c.topic_id)
        .collect();

    let live: HashSet<TopicId> = lessons
        .iter()
        .filter(|l| l.status.is_live())
        .map(|l| l.topic_id)
        .collect();

    let mut best: HashMap<TopicId, u8> = HashMap::new();
    for attempt in attempts {
        let entry = best.entry(attempt.topic_id).or_insert(attempt.score);
        *entry = (*entry).max(attempt.score);
    }

    let mut ordered: Vec<&Topic> = topics.iter().collect();
    ordered.sort_by(|a, b| {
        a.subject_id
            .cmp(&b.subject_id)
            .then(a.ordinal.cmp(&b.ordinal))
            .then(a.topic_id.cmp(&b.topic_id))
    });

    let mut progression = Vec::with_capacity(ordered.len());
    let mut previous: Option<(&Topic, bool)> = None;

    for topic in ordered {
        if previous.is_some_and(|(p, _)| p.subject_id != topic.subject_id) {
            previous = None;
        }

        let quiz = quiz_status(topic, best.get(&topic.topic_id).copied());
        let is_completed = completed.contains(&topic.topic_id);

        let status = if is_completed {
            TopicStatus::Completed
        } else if live.contains(&topic.topic_id) {
            TopicStatus::InProgress
        } else {
            let after_previous = previous.map_or(true, |(_, opens_next)| opens_next);
            let prerequisites_met = topic
                .prerequisites
                .iter()
                .all(|id| completed.contains(id));
            if after_previous && prerequisites_met {
                TopicStatus::Available
            } else {
                TopicStatus::Locked
            }
        };

        let can_book_next = is_completed && quiz.is_open();
        previous = Some((topic, can_book_next));

        progression.push(TopicProgress {
            topic: topic.clone(),
            status,
            quiz,
            can_book_next,
        });
    }

    progression
}

/// Load a student's history from the store and project it.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn load_progression<S: Store>(store: &S, student_id: &StudentId) -> Result<Vec<TopicProgress>> {
    let topics = store.list_topics()?;
    let completions = store.list_completions(student_id)?;
    let lessons = store.list_lessons_by_student(student_id)?;
    let attempts = store.list_quiz_attempts(student_id)?;

    Ok(project(&topics, &completions, &lessons, &attempts))
}

/// Find a topic's row and check that a lesson on it may be requested.
///
/// # Errors
///
/// Returns `EngineError::TopicNotFound` if the topic is not in the progression, and
/// `EngineError::NoEligibleTopic` unless it is `Available`.
pub fn ensure_bookable<'a>(
    progression: &'a [TopicProgress],
    student_id: &StudentId,
    topic_id: &TopicId,
) -> Result<&'a TopicProgress> {
    let row = progression
        .iter()
        .find(|p| p.topic.topic_id == *topic_id)
        .ok_or(EngineError::TopicNotFound(*topic_id))?;

    if row.status != TopicStatus::Available {
        return Err(EngineError::NoEligibleTopic {
            student_id: *student_id,
            topic_id: *topic_id,
            status: row.status,
        });
    }
    Ok(row)
}
