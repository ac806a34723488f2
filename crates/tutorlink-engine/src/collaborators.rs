//! External collaborators invoked by the engine.
//!
//! Payments, notifications and gamification live outside this crate. The engine only
//! talks to them through the traits below, so tests and the binary can plug in
//! whatever implementation fits.
//!
//! Notifications and gamification are fire-and-forget: failures are logged and never
//! undo a state transition. Payment capture is the one call whose failure changes
//! the outcome of an operation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tutorlink_core::{PaymentAuthorizationId, StudentId, TutorId};

/// Errors reported by external collaborators.
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    /// The collaborator refused the request.
    #[error("declined: {0}")]
    Declined(String),

    /// The collaborator could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// A result type using `CollaboratorError`.
pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

/// A user on either side of a lesson.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Participant {
    /// A student.
    Student(StudentId),
    /// A tutor.
    Tutor(TutorId),
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Student(id) => write!(f, "student:{id}"),
            Self::Tutor(id) => write!(f, "tutor:{id}"),
        }
    }
}

/// Payment authorization, capture and release.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Place a hold for a lesson price.
    ///
    /// # Errors
    ///
    /// Returns an error if the hold cannot be placed.
    async fn authorize(
        &self,
        student_id: &StudentId,
        tutor_id: &TutorId,
        amount_cents: u32,
    ) -> CollaboratorResult<PaymentAuthorizationId>;

    /// Capture a held authorization.
    ///
    /// # Errors
    ///
    /// Returns an error if the capture fails; the engine rolls the acceptance back.
    async fn capture(&self, authorization_id: &PaymentAuthorizationId) -> CollaboratorResult<()>;

    /// Release a hold, or refund a capture.
    ///
    /// # Errors
    ///
    /// Returns an error if the gateway cannot be reached.
    async fn release(&self, authorization_id: &PaymentAuthorizationId) -> CollaboratorResult<()>;
}

/// Message and email delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Post an in-app system message.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails.
    async fn send_system_message(
        &self,
        from: Participant,
        to: Participant,
        text: &str,
    ) -> CollaboratorResult<()>;

    /// Send an email.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails.
    async fn send_email(&self, to_address: &str, subject: &str, body: &str)
        -> CollaboratorResult<()>;
}

/// XP and badge bookkeeping.
#[async_trait]
pub trait Gamification: Send + Sync {
    /// Credit XP to a student.
    ///
    /// # Errors
    ///
    /// Returns an error if the award cannot be recorded.
    async fn award_xp(&self, student_id: &StudentId, amount: u32) -> CollaboratorResult<()>;

    /// Re-evaluate badge rules for a student.
    ///
    /// # Errors
    ///
    /// Returns an error if the check cannot run.
    async fn check_and_award_badges(&self, student_id: &StudentId) -> CollaboratorResult<()>;
}

/// The set of collaborators the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Payment gateway.
    pub payments: Arc<dyn PaymentGateway>,
    /// Message and email delivery.
    pub notifier: Arc<dyn Notifier>,
    /// XP and badges.
    pub gamification: Arc<dyn Gamification>,
}

impl Collaborators {
    /// Create a bundle from explicit implementations.
    #[must_use]
    pub fn new(
        payments: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        gamification: Arc<dyn Gamification>,
    ) -> Self {
        Self {
            payments,
            notifier,
            gamification,
        }
    }

    /// Collaborators that accept everything and do nothing.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(
            Arc::new(NoopPaymentGateway),
            Arc::new(NoopNotifier),
            Arc::new(NoopGamification),
        )
    }

    /// Send a system message, logging failures.
    pub async fn notify(&self, from: Participant, to: Participant, text: &str) {
        if let Err(e) = self.notifier.send_system_message(from, to, text).await {
            tracing::warn!(from = %from, to = %to, error = %e, "Failed to send system message");
        }
    }

    /// Send an email, logging failures.
    pub async fn email(&self, to_address: &str, subject: &str, body: &str) {
        if let Err(e) = self.notifier.send_email(to_address, subject, body).await {
            tracing::warn!(to = %to_address, error = %e, "Failed to send email");
        }
    }

    /// Release a payment authorization if there is one, logging failures.
    pub async fn release_payment(&self, authorization_id: Option<PaymentAuthorizationId>) {
        let Some(authorization_id) = authorization_id else {
            return;
        };
        if let Err(e) = self.payments.release(&authorization_id).await {
            tracing::warn!(
                authorization_id = %authorization_id,
                error = %e,
                "Failed to release payment authorization"
            );
        }
    }

    /// Award XP and re-check badges, logging failures.
    pub async fn reward(&self, student_id: &StudentId, xp: u32) {
        if xp > 0 {
            if let Err(e) = self.gamification.award_xp(student_id, xp).await {
                tracing::warn!(student_id = %student_id, xp, error = %e, "Failed to award XP");
            }
        }
        if let Err(e) = self.gamification.check_and_award_badges(student_id).await {
            tracing::warn!(student_id = %student_id, error = %e, "Failed to check badges");
        }
    }
}

/// A payment gateway that approves everything.
///
/// Used when no gateway is configured.
#[derive(Debug, Clone, Default)]
pub struct NoopPaymentGateway;

#[async_trait]
impl PaymentGateway for NoopPaymentGateway {
    async fn authorize(
        &self,
        student_id: &StudentId,
        tutor_id: &TutorId,
        amount_cents: u32,
    ) -> CollaboratorResult<PaymentAuthorizationId> {
        tracing::debug!(
            student_id = %student_id,
            tutor_id = %tutor_id,
            amount_cents,
            "Noop payment gateway: authorize (no-op)"
        );
        Ok(PaymentAuthorizationId::generate())
    }

    async fn capture(&self, authorization_id: &PaymentAuthorizationId) -> CollaboratorResult<()> {
        tracing::debug!(authorization_id = %authorization_id, "Noop payment gateway: capture (no-op)");
        Ok(())
    }

    async fn release(&self, authorization_id: &PaymentAuthorizationId) -> CollaboratorResult<()> {
        tracing::debug!(authorization_id = %authorization_id, "Noop payment gateway: release (no-op)");
        Ok(())
    }
}

/// A notifier that only logs.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send_system_message(
        &self,
        from: Participant,
        to: Participant,
        text: &str,
    ) -> CollaboratorResult<()> {
        tracing::debug!(from = %from, to = %to, text, "Noop notifier: system message");
        Ok(())
    }

    async fn send_email(
        &self,
        to_address: &str,
        subject: &str,
        _body: &str,
    ) -> CollaboratorResult<()> {
        tracing::debug!(to = %to_address, subject, "Noop notifier: email");
        Ok(())
    }
}

/// Gamification that does nothing.
#[derive(Debug, Clone, Default)]
pub struct NoopGamification;

#[async_trait]
impl Gamification for NoopGamification {
    async fn award_xp(&self, _student_id: &StudentId, _amount: u32) -> CollaboratorResult<()> {
        Ok(())
    }

    async fn check_and_award_badges(&self, _student_id: &StudentId) -> CollaboratorResult<()> {
        Ok(())
    }
}

/// Recording collaborators for testing.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;

    /// A payment gateway that records every call.
    #[derive(Default)]
    pub struct MockPaymentGateway {
        authorized: Mutex<Vec<(PaymentAuthorizationId, StudentId, TutorId, u32)>>,
        captured: Mutex<Vec<PaymentAuthorizationId>>,
        released: Mutex<Vec<PaymentAuthorizationId>>,
        fail_capture: Mutex<bool>,
        authorize_delay: Mutex<Option<std::time::Duration>>,
    }

    impl MockPaymentGateway {
        /// Create a new mock gateway.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make subsequent captures fail (or succeed again).
        pub fn set_fail_capture(&self, fail: bool) {
            *self.fail_capture.lock() = fail;
        }

        /// Hold every subsequent authorization for `delay` before answering.
        pub fn set_authorize_delay(&self, delay: std::time::Duration) {
            *self.authorize_delay.lock() = Some(delay);
        }

        /// Authorizations placed, with their amounts.
        pub fn authorized(&self) -> Vec<(PaymentAuthorizationId, StudentId, TutorId, u32)> {
            self.authorized.lock().clone()
        }

        /// Authorizations successfully captured.
        pub fn captured(&self) -> Vec<PaymentAuthorizationId> {
            self.captured.lock().clone()
        }

        /// Authorizations released.
        pub fn released(&self) -> Vec<PaymentAuthorizationId> {
            self.released.lock().clone()
        }
    }

    #[async_trait]
    impl PaymentGateway for MockPaymentGateway {
        async fn authorize(
            &self,
            student_id: &StudentId,
            tutor_id: &TutorId,
            amount_cents: u32,
        ) -> CollaboratorResult<PaymentAuthorizationId> {
            let delay = *self.authorize_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let authorization_id = PaymentAuthorizationId::generate();
            self.authorized
                .lock()
                .push((authorization_id, *student_id, *tutor_id, amount_cents));
            Ok(authorization_id)
        }

        async fn capture(
            &self,
            authorization_id: &PaymentAuthorizationId,
        ) -> CollaboratorResult<()> {
            if *self.fail_capture.lock() {
                return Err(CollaboratorError::Declined("card declined".to_string()));
            }
            self.captured.lock().push(*authorization_id);
            Ok(())
        }

        async fn release(
            &self,
            authorization_id: &PaymentAuthorizationId,
        ) -> CollaboratorResult<()> {
            self.released.lock().push(*authorization_id);
            Ok(())
        }
    }

    /// A notifier that records every message.
    #[derive(Default)]
    pub struct MockNotifier {
        messages: Mutex<Vec<(Participant, Participant, String)>>,
        emails: Mutex<Vec<(String, String)>>,
    }

    impl MockNotifier {
        /// Create a new mock notifier.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// System messages sent so far.
        pub fn messages(&self) -> Vec<(Participant, Participant, String)> {
            self.messages.lock().clone()
        }

        /// Messages addressed to one participant.
        pub fn messages_to(&self, to: Participant) -> usize {
            self.messages.lock().iter().filter(|(_, t, _)| *t == to).count()
        }

        /// `(address, subject)` of every email sent so far.
        pub fn emails(&self) -> Vec<(String, String)> {
            self.emails.lock().clone()
        }
    }

    #[async_trait]
    impl Notifier for MockNotifier {
        async fn send_system_message(
            &self,
            from: Participant,
            to: Participant,
            text: &str,
        ) -> CollaboratorResult<()> {
            self.messages.lock().push((from, to, text.to_string()));
            Ok(())
        }

        async fn send_email(
            &self,
            to_address: &str,
            subject: &str,
            _body: &str,
        ) -> CollaboratorResult<()> {
            self.emails
                .lock()
                .push((to_address.to_string(), subject.to_string()));
            Ok(())
        }
    }

    /// Gamification that records awards.
    #[derive(Default)]
    pub struct MockGamification {
        xp: Mutex<Vec<(StudentId, u32)>>,
        badge_checks: Mutex<Vec<StudentId>>,
    }

    impl MockGamification {
        /// Create a new mock.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// XP awards so far.
        pub fn xp(&self) -> Vec<(StudentId, u32)> {
            self.xp.lock().clone()
        }

        /// Number of badge checks run.
        pub fn badge_checks(&self) -> usize {
            self.badge_checks.lock().len()
        }
    }

    #[async_trait]
    impl Gamification for MockGamification {
        async fn award_xp(&self, student_id: &StudentId, amount: u32) -> CollaboratorResult<()> {
            self.xp.lock().push((*student_id, amount));
            Ok(())
        }

        async fn check_and_award_badges(&self, student_id: &StudentId) -> CollaboratorResult<()> {
            self.badge_checks.lock().push(*student_id);
            Ok(())
        }
    }

    /// The three mocks together, plus a `Collaborators` bundle pointing at them.
    pub struct MockCollaborators {
        /// Payment mock.
        pub payments: Arc<MockPaymentGateway>,
        /// Notifier mock.
        pub notifier: Arc<MockNotifier>,
        /// Gamification mock.
        pub gamification: Arc<MockGamification>,
    }

    impl MockCollaborators {
        /// Create fresh mocks.
        #[must_use]
        pub fn new() -> Self {
            Self {
                payments: Arc::new(MockPaymentGateway::new()),
                notifier: Arc::new(MockNotifier::new()),
                gamification: Arc::new(MockGamification::new()),
            }
        }

        /// A bundle the engine can use.
        #[must_use]
        pub fn bundle(&self) -> Collaborators {
            Collaborators::new(
                Arc::clone(&self.payments) as Arc<dyn PaymentGateway>,
                Arc::clone(&self.notifier) as Arc<dyn Notifier>,
                Arc::clone(&self.gamification) as Arc<dyn Gamification>,
            )
        }
    }

    impl Default for MockCollaborators {
        fn default() -> Self {
            Self::new()
        }
    }
}
