//! Common error types for tutorlink.
//!
//! This module provides shared error types that are used across multiple crates.

use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur throughout the tutorlink system.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] crate::ids::IdError),

    /// An invalid slot or time window was provided.
    #[error("invalid slot: {0}")]
    InvalidSlot(#[from] crate::slot::SlotError),

    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}
