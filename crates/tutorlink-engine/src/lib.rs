//! Tutoring engine: topic progression, tutor matching and the invitation lifecycle.
//!
//! This crate holds the business logic of the marketplace core. It decides which topic
//! a student may book next, ranks tutors for a lesson request, fans invitations out to
//! them and guarantees that at most one invitation per request is ever accepted.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      HTTP layer (out of crate)              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TutoringService                        │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────┐    │
//! │  │ Progression │ │  Matcher    │ │ InvitationManager   │    │
//! │  │ (projection)│ │  (ranking)  │ │ (claim/capture/     │    │
//! │  │             │ │             │ │  commit saga)       │    │
//! │  └─────────────┘ └─────────────┘ └─────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┼──────────────┐
//!               ▼              ▼              ▼
//!        ┌──────────┐   ┌──────────┐   ┌──────────────┐
//!        │  Store   │   │ Sweeper  │   │ Collaborators│
//!        │ (RocksDB)│   │ (expiry) │   │ pay/notify/xp│
//!        └──────────┘   └──────────┘   └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tutorlink_engine::{LessonRequest, Tutoring, TutoringService};
//! use tutorlink_core::{DayOfWeek, StudentId, SubjectId, TimeWindow, TopicId};
//! use tutorlink_store::RocksStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(RocksStore::open("/tmp/tutorlink")?);
//! let tutoring = TutoringService::with_defaults(store);
//!
//! // Ask for a Monday afternoon lesson
//! let student_id = StudentId::generate();
//! let request = LessonRequest::new(
//!     SubjectId::generate(),
//!     TopicId::generate(),
//!     vec![DayOfWeek::MONDAY],
//!     TimeWindow::from_hours(16, 18)?,
//!     5_000,
//! );
//! let outcome = tutoring.request_lesson(&student_id, request).await?;
//!
//! println!("Invited {} tutors", outcome.invitations.len());
//! # Ok(())
//! # }
//! ```
//!
//! # State Machines
//!
//! - Invitations: `Pending` → `Accepted`, `Rejected`, `Expired`, `Cancelled` or
//!   `AutoRejected`. All of these are final; `Accepted` only steps back when an
//!   acceptance is rolled back.
//! - Preferences: `Pending` → `Matched` → `Confirmed`, or `Pending` → `Cancelled`.
//! - Lessons: `Scheduled`/`Rescheduled` → `Completed`, `Cancelled` or `Rescheduled`.
//!
//! See the [`lifecycle`] module for the transition tables.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod booking;
pub mod collaborators;
pub mod error;
pub mod invitations;
pub mod lifecycle;
pub mod matcher;
pub mod progression;
pub mod service;
pub mod sweeper;
pub mod types;

#[cfg(test)]
mod fixtures;

pub use collaborators::{
    CollaboratorError, CollaboratorResult, Collaborators, Gamification, NoopGamification,
    NoopNotifier, NoopPaymentGateway, Notifier, Participant, PaymentGateway,
};
pub use error::{EngineError, Result};
pub use invitations::InvitationManager;
pub use matcher::{Candidate, MatchTier};
pub use progression::TopicProgress;
pub use service::{Tutoring, TutoringService};
pub use sweeper::{sweep_expired, ExpirationSweeper, SweepReport};
pub use types::{
    EngineConfig, LessonCompletion, LessonRequest, QuizStatus, RequestOutcome, RespondOutcome,
    TopicStatus, TutorResponse,
};

// Re-export commonly used types from dependencies for convenience
pub use tutorlink_core::{InvitationId, LessonId, PreferenceId, StudentId, TopicId, TutorId};
pub use tutorlink_store::{
    InvitationStatus, Lesson, LessonInvitation, LessonStatus, PreferenceStatus,
    StudentMatchingPreference,
};
