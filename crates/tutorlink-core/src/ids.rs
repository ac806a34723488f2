//! Core identifier types for tutorlink.
//!
//! Every entity is addressed by a UUID-backed newtype so that a `TutorId` can never be
//! passed where a `StudentId` is expected. All IDs serialize as their canonical UUID string
//! and expose their 16 raw bytes for key encoding in the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Create an ID from a UUID.
            #[must_use]
            pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }

            /// Create an ID from its 16 raw bytes.
            #[must_use]
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(uuid::Uuid::from_bytes(bytes))
            }

            /// Generate a new random ID.
            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Return the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }

            /// Return the bytes of the UUID.
            #[must_use]
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = uuid::Uuid::parse_str(s).map_err(|_| IdError::InvalidUuid)?;
                Ok(Self(uuid))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0.to_string()
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }
    };
}

uuid_id! {
    /// A student account, owned by the external account service.
    StudentId
}

uuid_id! {
    /// A tutor account, owned by the external account service.
    TutorId
}

uuid_id! {
    /// A subject (e.g. "Algebra") grouping an ordered curriculum of topics.
    SubjectId
}

uuid_id! {
    /// A curriculum topic.
    TopicId
}

uuid_id! {
    /// A student's matching preference (one lesson request).
    PreferenceId
}

uuid_id! {
    /// A lesson invitation sent to one tutor.
    ///
    /// Invitation IDs are derived from `(preference, tutor)` so that a second fan-out
    /// for the same pair collides on the primary key.
    InvitationId
}

uuid_id! {
    /// A materialized lesson booking.
    LessonId
}

uuid_id! {
    /// A payment authorization held by the external payment provider.
    PaymentAuthorizationId
}

uuid_id! {
    /// A single quiz attempt.
    AttemptId
}

impl InvitationId {
    /// Derive the invitation ID for a `(preference, tutor)` pair.
    ///
    /// The first 16 bytes of a blake3 hash over both IDs are used, with the UUID
    /// version and variant bits set so the result is a well-formed v4-style UUID.
    #[must_use]
    pub fn derive(preference_id: &PreferenceId, tutor_id: &TutorId) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"invitation");
        hasher.update(preference_id.as_bytes());
        hasher.update(tutor_id.as_bytes());

        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        Self(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input is not a valid UUID.
    #[error("invalid UUID format")]
    InvalidUuid,
}
