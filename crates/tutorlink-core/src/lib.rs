//! Core types and utilities for tutorlink.
//!
//! This crate provides the foundational types used throughout the tutoring marketplace:
//!
//! - **Identifiers**: Strongly-typed IDs for students, tutors, topics, invitations and lessons
//! - **Slot algebra**: Weekly `(day-of-week, hour)` slots and minute-based time windows
//! - **Error types**: Common error definitions shared across crates
//!
//! # Example
//!
//! ```
//! use tutorlink_core::{DayOfWeek, InvitationId, PreferenceId, Slot, TimeWindow, TutorId};
//!
//! // Invitation IDs are derived from the preference and the tutor
//! let preference_id = PreferenceId::generate();
//! let tutor_id = TutorId::generate();
//! let a = InvitationId::derive(&preference_id, &tutor_id);
//! let b = InvitationId::derive(&preference_id, &tutor_id);
//! assert_eq!(a, b);
//!
//! // Monday 17:00 overlaps a Monday 16:00-18:00 request
//! let slot = Slot::new(DayOfWeek::MONDAY, 17).unwrap();
//! let request = TimeWindow::from_hours(16, 18).unwrap();
//! assert!(slot.window().overlaps(&request));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;
pub mod slot;

pub use error::{CoreError, Result};
pub use ids::{
    AttemptId, IdError, InvitationId, LessonId, PaymentAuthorizationId, PreferenceId, StudentId,
    SubjectId, TopicId, TutorId,
};
pub use slot::{DayOfWeek, Slot, SlotError, TimeWindow};
