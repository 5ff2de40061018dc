//! Recovery state machine.
//!
//! Flow Overview: `submit_email` validates locally, asks the service for a code,
//! and moves to `CodeRequested`. The first redeem interaction moves to
//! `AwaitingRedeem`; `submit_redeem` validates, redeems, and lands in
//! `Succeeded` or stays in `AwaitingRedeem` with the failing reason. While a call
//! is outstanding the state is `Submitting` and every other submission is
//! rejected locally.
//!
//! Session data sits behind a `std::sync::Mutex` that is never held across an
//! `.await`; the in-flight flag is released by a drop guard so a cancelled or
//! panicking call cannot wedge the session.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use secrecy::SecretString;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

use super::policy::{ValidationError, ValidationPolicy};
use super::service::{RecoveryService, RedeemCodeOutcome, RequestCodeOutcome};
use super::session::{Notice, RecoverySession, RecoveryState, Snapshot};

const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_AUTO_CLOSE_SECONDS: u64 = 3;

const CODE_SENT: &str = "A recovery code has been sent. Check your email.";
const CODE_PENDING: &str =
    "A recovery code was already sent. Check your email or wait before requesting another.";
const SERVER_ERROR: &str = "Server error. Please try again later.";
const REQUEST_IN_PROGRESS: &str = "A request is already in progress.";
const PASSWORD_UPDATED: &str = "Password updated. You can sign in now.";
const INVALID_CODE: &str = "Invalid or expired code.";
const WEAK_PASSWORD: &str = "Password does not meet the requirements.";
const REQUEST_REJECTED: &str = "Request rejected.";
const EMAIL_LOCKED: &str = "A code was requested for a different email. Start over to change it.";
const CODE_REQUIRED: &str = "Request a code before setting a new password.";
const ATTEMPT_FINISHED: &str = "This recovery attempt is finished. Start over to recover again.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    request_timeout: Duration,
    auto_close_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS),
            auto_close_delay: Duration::from_secs(DEFAULT_AUTO_CLOSE_SECONDS),
        }
    }
}

impl ControllerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    #[must_use]
    pub fn with_auto_close_delay(mut self, delay: Duration) -> Self {
        self.auto_close_delay = delay;
        self
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    #[must_use]
    pub fn auto_close_delay(&self) -> Duration {
        self.auto_close_delay
    }
}

/// Why a submission did not move the session forward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    /// Local rule failed; nothing was sent.
    Validation(ValidationError),
    /// The service refused the request with a reason.
    Rejected,
    /// The service could not be reached, timed out, or answered garbage.
    Transport,
    /// Another call is still outstanding.
    InFlight,
    /// The current state does not accept this input.
    InvalidState,
    /// The session was cancelled or restarted while the call was outstanding.
    Discarded,
}

/// Result of a caller-triggered transition attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub snapshot: Snapshot,
    pub failure: Option<Failure>,
}

impl Submission {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }
}

pub struct RecoveryController<S> {
    service: S,
    policy: ValidationPolicy,
    config: ControllerConfig,
    session: Mutex<RecoverySession>,
    notifier: watch::Sender<Snapshot>,
}

impl<S> RecoveryController<S> {
    fn lock(&self) -> MutexGuard<'_, RecoverySession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, session: &RecoverySession) -> Snapshot {
        let snapshot = session.snapshot();
        self.notifier.send_replace(snapshot.clone());
        snapshot
    }

    /// Records a notice without a state change and reports `failure`.
    fn refuse(
        &self,
        session: &mut RecoverySession,
        notice: Notice,
        failure: Failure,
    ) -> Submission {
        session.last_message = Some(notice);
        Submission {
            snapshot: self.publish(session),
            failure: Some(failure),
        }
    }

    fn acquire(&self, session: &mut RecoverySession) -> InFlight<'_, S> {
        let restore = session.state;
        session.attempt_in_flight = true;
        transition(session, RecoveryState::Submitting);
        self.publish(session);
        InFlight {
            controller: self,
            session_id: session.id(),
            restore,
            released: false,
        }
    }

    #[must_use]
    pub fn current_state(&self) -> RecoveryState {
        self.lock().state()
    }

    #[must_use]
    pub fn last_message(&self) -> Option<Notice> {
        self.lock().last_message().cloned()
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.lock().snapshot()
    }

    #[must_use]
    pub fn session_id(&self) -> Ulid {
        self.lock().id()
    }

    /// Change notifications; the receiver always holds the latest snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.notifier.subscribe()
    }

    #[must_use]
    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// How long the caller should keep the success message up before closing.
    /// `None` unless the session has succeeded.
    #[must_use]
    pub fn auto_close_after(&self) -> Option<Duration> {
        (self.current_state() == RecoveryState::Succeeded).then_some(self.config.auto_close_delay)
    }

    fn discard(&self, reason: &'static str) -> Snapshot {
        let mut session = self.lock();
        debug!(session_id = %session.id(), from = %session.state(), "recovery {reason}");
        *session = RecoverySession::new();
        session.state = RecoveryState::Closed;
        self.publish(&session)
    }

    /// Discards the session. Any outstanding call resolves into the void.
    #[instrument(skip(self))]
    pub fn cancel(&self) -> Snapshot {
        self.discard("cancelled")
    }

    /// Closes the flow, normally after `Succeeded`.
    #[instrument(skip(self))]
    pub fn close(&self) -> Snapshot {
        self.discard("closed")
    }

    /// Replaces the session with a fresh one waiting for an email.
    #[instrument(skip(self))]
    pub fn restart(&self) -> Snapshot {
        let mut session = self.lock();
        let previous = session.id();
        *session = RecoverySession::new();
        debug!(session_id = %session.id(), %previous, "recovery restarted");
        self.publish(&session)
    }

    /// Goes back to the email step so a different address can be used.
    #[instrument(skip(self))]
    pub fn reset(&self) -> Submission {
        let mut session = self.lock();
        if session.attempt_in_flight() {
            return self.refuse(
                &mut session,
                Notice::info(REQUEST_IN_PROGRESS),
                Failure::InFlight,
            );
        }
        if session.state().is_terminal() {
            return self.refuse(
                &mut session,
                Notice::error(ATTEMPT_FINISHED),
                Failure::InvalidState,
            );
        }

        session.clear_inputs();
        session.last_message = None;
        transition(&mut session, RecoveryState::AwaitingEmail);
        Submission {
            snapshot: self.publish(&session),
            failure: None,
        }
    }
}

impl<S: RecoveryService> RecoveryController<S> {
    pub fn new(service: S, policy: ValidationPolicy, config: ControllerConfig) -> Self {
        let session = RecoverySession::new();
        let (notifier, _) = watch::channel(session.snapshot());
        Self {
            service,
            policy,
            config,
            session: Mutex::new(session),
            notifier,
        }
    }

    /// Requests a code for `email`.
    ///
    /// Allowed from `AwaitingEmail`, or again for the same email once a code was
    /// requested. A repeat for an email with a live code comes back as an
    /// informational notice, never as an error.
    #[instrument(skip_all)]
    pub async fn submit_email(&self, email: &str) -> Submission {
        let email = email.trim().to_string();
        let guard = {
            let mut session = self.lock();
            if session.attempt_in_flight() {
                return self.refuse(
                    &mut session,
                    Notice::info(REQUEST_IN_PROGRESS),
                    Failure::InFlight,
                );
            }

            if let Err(err) = self.policy.validate_email_step(&email) {
                return self.refuse(
                    &mut session,
                    Notice::error(err.to_string()),
                    Failure::Validation(err),
                );
            }

            match session.state() {
                RecoveryState::AwaitingEmail => {}
                RecoveryState::CodeRequested | RecoveryState::AwaitingRedeem => {
                    if session.email() != Some(email.as_str()) {
                        return self.refuse(
                            &mut session,
                            Notice::error(EMAIL_LOCKED),
                            Failure::InvalidState,
                        );
                    }
                }
                RecoveryState::Submitting => {
                    return self.refuse(
                        &mut session,
                        Notice::info(REQUEST_IN_PROGRESS),
                        Failure::InFlight,
                    );
                }
                RecoveryState::Succeeded | RecoveryState::Closed => {
                    return self.refuse(
                        &mut session,
                        Notice::error(ATTEMPT_FINISHED),
                        Failure::InvalidState,
                    );
                }
            }

            self.acquire(&mut session)
        };

        self.request(guard, email).await
    }

    /// Asks for another code for the email already on the session.
    #[instrument(skip_all)]
    pub async fn resend_code(&self) -> Submission {
        let (guard, email) = {
            let mut session = self.lock();
            if session.attempt_in_flight() {
                return self.refuse(
                    &mut session,
                    Notice::info(REQUEST_IN_PROGRESS),
                    Failure::InFlight,
                );
            }

            let email = match (session.state().accepts_redeem(), session.email()) {
                (true, Some(email)) => email.to_string(),
                _ => {
                    return self.refuse(
                        &mut session,
                        Notice::error(CODE_REQUIRED),
                        Failure::InvalidState,
                    );
                }
            };

            (self.acquire(&mut session), email)
        };

        self.request(guard, email).await
    }

    async fn request(&self, guard: InFlight<'_, S>, email: String) -> Submission {
        let outcome = match timeout(
            self.config.request_timeout,
            self.service.request_code(&email),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => RequestCodeOutcome::TransportError(format!(
                "no response within {}s",
                self.config.request_timeout.as_secs()
            )),
        };

        // Resending from the redeem step keeps the user on the redeem step.
        let issued_state = if guard.restore == RecoveryState::AwaitingRedeem {
            RecoveryState::AwaitingRedeem
        } else {
            RecoveryState::CodeRequested
        };

        let (next, notice, failure) = match outcome {
            RequestCodeOutcome::Issued => (issued_state, Notice::success(CODE_SENT), None),
            RequestCodeOutcome::AlreadyPending => (issued_state, Notice::info(CODE_PENDING), None),
            RequestCodeOutcome::Rejected(reason) => {
                info!(session_id = %guard.session_id, "code request rejected");
                (
                    guard.restore,
                    Notice::error(reason_or(reason, REQUEST_REJECTED)),
                    Some(Failure::Rejected),
                )
            }
            RequestCodeOutcome::TransportError(detail) => {
                warn!(session_id = %guard.session_id, "code request failed: {detail}");
                (
                    guard.restore,
                    Notice::error(SERVER_ERROR),
                    Some(Failure::Transport),
                )
            }
        };

        guard.release(failure, |session| {
            if matches!(next, RecoveryState::CodeRequested | RecoveryState::AwaitingRedeem) {
                session.email = Some(email);
            }
            session.last_message = Some(notice);
            next
        })
    }

    /// Redeems `code` and sets the new credential.
    ///
    /// Code and both credential fields are kept on the session after a
    /// rejection so only the failing part needs to be corrected.
    #[instrument(skip_all)]
    pub async fn submit_redeem(
        &self,
        code: &str,
        new_credential: &str,
        confirm_credential: &str,
    ) -> Submission {
        let (guard, email) = {
            let mut session = self.lock();
            if session.attempt_in_flight() {
                return self.refuse(
                    &mut session,
                    Notice::info(REQUEST_IN_PROGRESS),
                    Failure::InFlight,
                );
            }

            let email = match (session.state(), session.email()) {
                (RecoveryState::CodeRequested | RecoveryState::AwaitingRedeem, Some(email)) => {
                    email.to_string()
                }
                (RecoveryState::Succeeded | RecoveryState::Closed, _) => {
                    return self.refuse(
                        &mut session,
                        Notice::error(ATTEMPT_FINISHED),
                        Failure::InvalidState,
                    );
                }
                _ => {
                    return self.refuse(
                        &mut session,
                        Notice::error(CODE_REQUIRED),
                        Failure::InvalidState,
                    );
                }
            };

            if session.state() == RecoveryState::CodeRequested {
                transition(&mut session, RecoveryState::AwaitingRedeem);
            }

            session.code = code.trim().to_string();
            session.new_credential = SecretString::from(new_credential.to_owned());
            session.confirm_credential = SecretString::from(confirm_credential.to_owned());

            if let Err(err) = self
                .policy
                .validate_redeem_step(code, new_credential, confirm_credential)
            {
                return self.refuse(
                    &mut session,
                    Notice::error(err.to_string()),
                    Failure::Validation(err),
                );
            }

            (self.acquire(&mut session), email)
        };

        let credential = SecretString::from(new_credential.to_owned());
        let outcome = match timeout(
            self.config.request_timeout,
            self.service.redeem_code(&email, code.trim(), &credential),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => RedeemCodeOutcome::TransportError(format!(
                "no response within {}s",
                self.config.request_timeout.as_secs()
            )),
        };

        let (next, notice, failure) = match outcome {
            RedeemCodeOutcome::Success => (
                RecoveryState::Succeeded,
                Notice::success(PASSWORD_UPDATED),
                None,
            ),
            RedeemCodeOutcome::InvalidCode(reason) => (
                RecoveryState::AwaitingRedeem,
                Notice::error(reason_or(reason, INVALID_CODE)),
                Some(Failure::Rejected),
            ),
            RedeemCodeOutcome::WeakCredential(reason) => (
                RecoveryState::AwaitingRedeem,
                Notice::error(reason_or(reason, WEAK_PASSWORD)),
                Some(Failure::Rejected),
            ),
            RedeemCodeOutcome::Rejected(reason) => (
                RecoveryState::AwaitingRedeem,
                Notice::error(reason_or(reason, REQUEST_REJECTED)),
                Some(Failure::Rejected),
            ),
            RedeemCodeOutcome::TransportError(detail) => {
                warn!(session_id = %guard.session_id, "code redeem failed: {detail}");
                (
                    RecoveryState::AwaitingRedeem,
                    Notice::error(SERVER_ERROR),
                    Some(Failure::Transport),
                )
            }
        };

        if failure == Some(Failure::Rejected) {
            info!(session_id = %guard.session_id, "code redeem rejected");
        }

        guard.release(failure, |session| {
            if next == RecoveryState::Succeeded {
                // Nothing left to correct; drop the secrets right away.
                session.code.clear();
                session.new_credential = SecretString::from("");
                session.confirm_credential = SecretString::from("");
            }
            session.last_message = Some(notice);
            next
        })
    }
}

/// Scoped ownership of the in-flight flag for one remote call.
///
/// `release` applies the classified outcome; dropping without releasing (future
/// cancelled, panic) restores the pre-call state. Either way the flag is cleared
/// unless the session was replaced in the meantime.
struct InFlight<'a, S> {
    controller: &'a RecoveryController<S>,
    session_id: Ulid,
    restore: RecoveryState,
    released: bool,
}

impl<S> InFlight<'_, S> {
    fn release(
        mut self,
        failure: Option<Failure>,
        apply: impl FnOnce(&mut RecoverySession) -> RecoveryState,
    ) -> Submission {
        self.released = true;
        let mut session = self.controller.lock();

        if session.id() != self.session_id {
            debug!(session_id = %self.session_id, "discarding result for replaced session");
            return Submission {
                snapshot: session.snapshot(),
                failure: Some(Failure::Discarded),
            };
        }

        let next = apply(&mut session);
        session.attempt_in_flight = false;
        transition(&mut session, next);

        Submission {
            snapshot: self.controller.publish(&session),
            failure,
        }
    }
}

impl<S> Drop for InFlight<'_, S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut session = self.controller.lock();
        if session.id() != self.session_id {
            return;
        }
        session.attempt_in_flight = false;
        if session.state() == RecoveryState::Submitting {
            transition(&mut session, self.restore);
        }
        self.controller.publish(&session);
    }
}

fn transition(session: &mut RecoverySession, to: RecoveryState) {
    let from = session.state();
    if from != to {
        debug!(session_id = %session.id(), %from, %to, "recovery transition");
        session.state = to;
    }
}

fn reason_or(reason: String, fallback: &str) -> String {
    let trimmed = reason.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::policy::{OtpFormat, PolicyConfig};
    use crate::recovery::session::NoticeKind;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use secrecy::ExposeSecret;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    /// Service double that replays queued outcomes and counts calls.
    #[derive(Default)]
    struct ScriptedService {
        requests: Mutex<VecDeque<RequestCodeOutcome>>,
        redeems: Mutex<VecDeque<RedeemCodeOutcome>>,
        request_calls: AtomicUsize,
        redeem_calls: AtomicUsize,
        last_redeem: Mutex<Option<(String, String, String)>>,
        gate: Option<Arc<Notify>>,
        hang: bool,
    }

    impl ScriptedService {
        fn with_requests(outcomes: impl IntoIterator<Item = RequestCodeOutcome>) -> Self {
            Self {
                requests: Mutex::new(outcomes.into_iter().collect()),
                ..Self::default()
            }
        }

        fn then_redeems(self, outcomes: impl IntoIterator<Item = RedeemCodeOutcome>) -> Self {
            Self {
                redeems: Mutex::new(outcomes.into_iter().collect()),
                ..self
            }
        }

        fn gated(self, gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..self
            }
        }

        fn request_calls(&self) -> usize {
            self.request_calls.load(Ordering::SeqCst)
        }

        fn redeem_calls(&self) -> usize {
            self.redeem_calls.load(Ordering::SeqCst)
        }

        async fn wait(&self) {
            if self.hang {
                std::future::pending::<()>().await;
            }
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
        }
    }

    #[async_trait]
    impl RecoveryService for ScriptedService {
        async fn request_code(&self, _email: &str) -> RequestCodeOutcome {
            self.request_calls.fetch_add(1, Ordering::SeqCst);
            self.wait().await;
            self.requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .unwrap_or(RequestCodeOutcome::Issued)
        }

        async fn redeem_code(
            &self,
            email: &str,
            code: &str,
            new_credential: &SecretString,
        ) -> RedeemCodeOutcome {
            self.redeem_calls.fetch_add(1, Ordering::SeqCst);
            *self
                .last_redeem
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some((
                email.to_string(),
                code.to_string(),
                new_credential.expose_secret().to_string(),
            ));
            self.wait().await;
            self.redeems
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .unwrap_or(RedeemCodeOutcome::Success)
        }
    }

    fn controller(service: ScriptedService) -> Arc<RecoveryController<Arc<ScriptedService>>> {
        controller_with(service, ControllerConfig::default())
    }

    fn controller_with(
        service: ScriptedService,
        config: ControllerConfig,
    ) -> Arc<RecoveryController<Arc<ScriptedService>>> {
        let policy = ValidationPolicy::new(
            PolicyConfig::new()
                .with_min_credential_length(6)
                .with_otp_format(OtpFormat::Digits(6)),
        );
        Arc::new(RecoveryController::new(Arc::new(service), policy, config))
    }

    fn notice_kind(submission: &Submission) -> Option<NoticeKind> {
        submission.snapshot.notice.as_ref().map(|notice| notice.kind)
    }

    async fn wait_in_flight(
        controller: &RecoveryController<Arc<ScriptedService>>,
    ) -> Result<()> {
        let mut rx = controller.subscribe();
        let waited = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|snapshot| snapshot.in_flight),
        )
        .await;
        match waited {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => bail!("notifier closed: {err}"),
            Err(_) => bail!("call never went in flight"),
        }
    }

    #[tokio::test]
    async fn blank_email_never_reaches_service() {
        let controller = controller(ScriptedService::default());

        for email in ["", "   ", "\t\n"] {
            let submission = controller.submit_email(email).await;
            assert_eq!(
                submission.failure,
                Some(Failure::Validation(ValidationError::EmptyEmail))
            );
            assert_eq!(submission.snapshot.state, RecoveryState::AwaitingEmail);
            assert_eq!(notice_kind(&submission), Some(NoticeKind::Error));
        }
        assert_eq!(controller.service.request_calls(), 0);
    }

    #[tokio::test]
    async fn issued_code_moves_to_code_requested() {
        let controller = controller(ScriptedService::with_requests([RequestCodeOutcome::Issued]));

        let submission = controller.submit_email("u@x.com").await;

        assert!(submission.is_ok());
        assert_eq!(submission.snapshot.state, RecoveryState::CodeRequested);
        assert_eq!(notice_kind(&submission), Some(NoticeKind::Success));
        assert_eq!(submission.snapshot.email.as_deref(), Some("u@x.com"));
        assert!(!submission.snapshot.in_flight);
    }

    #[tokio::test]
    async fn already_pending_is_informational() {
        let controller =
            controller(ScriptedService::with_requests([RequestCodeOutcome::AlreadyPending]));

        let submission = controller.submit_email("u@x.com").await;

        assert!(submission.is_ok());
        assert_eq!(submission.snapshot.state, RecoveryState::CodeRequested);
        assert_eq!(notice_kind(&submission), Some(NoticeKind::Info));
    }

    #[tokio::test]
    async fn repeated_request_is_idempotent() {
        let controller = controller(ScriptedService::with_requests([
            RequestCodeOutcome::Issued,
            RequestCodeOutcome::AlreadyPending,
        ]));

        let first = controller.submit_email("u@x.com").await;
        let second = controller.submit_email("u@x.com").await;

        assert_eq!(first.snapshot.state, RecoveryState::CodeRequested);
        assert_eq!(second.snapshot.state, RecoveryState::CodeRequested);
        assert_ne!(notice_kind(&first), Some(NoticeKind::Error));
        assert_ne!(notice_kind(&second), Some(NoticeKind::Error));
        assert_eq!(controller.service.request_calls(), 2);
    }

    #[tokio::test]
    async fn rejection_surfaces_server_reason() {
        let controller = controller(ScriptedService::with_requests([
            RequestCodeOutcome::Rejected("Too many requests".to_string()),
        ]));

        let submission = controller.submit_email("u@x.com").await;

        assert_eq!(submission.failure, Some(Failure::Rejected));
        assert_eq!(submission.snapshot.state, RecoveryState::AwaitingEmail);
        assert_eq!(
            submission.snapshot.notice,
            Some(Notice::error("Too many requests"))
        );
        assert_eq!(submission.snapshot.email, None);
    }

    #[tokio::test]
    async fn transport_failure_releases_guard() {
        let controller = controller(ScriptedService::with_requests([
            RequestCodeOutcome::TransportError("connection refused".to_string()),
            RequestCodeOutcome::Issued,
        ]));

        let failed = controller.submit_email("u@x.com").await;
        assert_eq!(failed.failure, Some(Failure::Transport));
        assert_eq!(failed.snapshot.state, RecoveryState::AwaitingEmail);
        assert_eq!(failed.snapshot.notice, Some(Notice::error(SERVER_ERROR)));
        assert!(!failed.snapshot.in_flight);

        let retried = controller.submit_email("u@x.com").await;
        assert!(retried.is_ok());
        assert_eq!(controller.service.request_calls(), 2);
    }

    #[tokio::test]
    async fn different_email_requires_reset() {
        let controller = controller(ScriptedService::default());
        controller.submit_email("u@x.com").await;

        let submission = controller.submit_email("other@x.com").await;
        assert_eq!(submission.failure, Some(Failure::InvalidState));
        assert_eq!(submission.snapshot.email.as_deref(), Some("u@x.com"));
        assert_eq!(controller.service.request_calls(), 1);

        let reset = controller.reset();
        assert!(reset.is_ok());
        assert_eq!(reset.snapshot.state, RecoveryState::AwaitingEmail);
        assert_eq!(reset.snapshot.email, None);

        let submission = controller.submit_email("other@x.com").await;
        assert!(submission.is_ok());
        assert_eq!(submission.snapshot.email.as_deref(), Some("other@x.com"));
    }

    #[tokio::test]
    async fn weak_credential_is_caught_locally() {
        let controller = controller(ScriptedService::default());
        controller.submit_email("u@x.com").await;

        let submission = controller.submit_redeem("123456", "abc", "abc").await;

        assert_eq!(
            submission.failure,
            Some(Failure::Validation(ValidationError::WeakCredential { min: 6 }))
        );
        assert_eq!(submission.snapshot.state, RecoveryState::AwaitingRedeem);
        assert_eq!(controller.service.redeem_calls(), 0);
    }

    #[tokio::test]
    async fn mismatch_never_calls_redeem() {
        let controller = controller(ScriptedService::default());
        controller.submit_email("u@x.com").await;

        let submission = controller
            .submit_redeem("123456", "goodpass1", "goodpass2")
            .await;

        assert_eq!(
            submission.failure,
            Some(Failure::Validation(ValidationError::CredentialMismatch))
        );
        assert_eq!(submission.snapshot.state, RecoveryState::AwaitingRedeem);
        assert_eq!(controller.service.redeem_calls(), 0);
    }

    #[tokio::test]
    async fn invalid_code_keeps_fields() {
        let controller = controller(
            ScriptedService::default()
                .then_redeems([RedeemCodeOutcome::InvalidCode(String::new())]),
        );
        controller.submit_email("u@x.com").await;

        let submission = controller
            .submit_redeem("999999", "goodpass1", "goodpass1")
            .await;

        assert_eq!(submission.failure, Some(Failure::Rejected));
        assert_eq!(submission.snapshot.state, RecoveryState::AwaitingRedeem);
        assert_eq!(notice_kind(&submission), Some(NoticeKind::Error));
        assert_eq!(
            submission.snapshot.notice,
            Some(Notice::error(INVALID_CODE))
        );

        let session = controller.lock();
        assert_eq!(session.code(), "999999");
        assert_eq!(session.new_credential.expose_secret(), "goodpass1");
        assert_eq!(session.confirm_credential.expose_secret(), "goodpass1");
    }

    #[tokio::test]
    async fn redeem_sends_trimmed_code_and_session_email() -> Result<()> {
        let controller = controller(ScriptedService::default());
        controller.submit_email("  u@x.com ").await;

        controller
            .submit_redeem(" 123456 ", "goodpass1", "goodpass1")
            .await;

        let Some((email, code, credential)) = controller
            .service
            .last_redeem
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            bail!("redeem was not called");
        };
        assert_eq!(email, "u@x.com");
        assert_eq!(code, "123456");
        assert_eq!(credential, "goodpass1");
        Ok(())
    }

    #[tokio::test]
    async fn success_is_terminal_until_restart() {
        let controller = controller(ScriptedService::default());
        controller.submit_email("u@x.com").await;

        let success = controller
            .submit_redeem("123456", "goodpass1", "goodpass1")
            .await;
        assert!(success.is_ok());
        assert_eq!(success.snapshot.state, RecoveryState::Succeeded);
        assert_eq!(notice_kind(&success), Some(NoticeKind::Success));
        assert_eq!(
            controller.auto_close_after(),
            Some(controller.config().auto_close_delay())
        );

        let again = controller.submit_email("u@x.com").await;
        assert_eq!(again.failure, Some(Failure::InvalidState));
        let redeem = controller
            .submit_redeem("123456", "goodpass1", "goodpass1")
            .await;
        assert_eq!(redeem.failure, Some(Failure::InvalidState));
        assert_eq!(controller.service.request_calls(), 1);
        assert_eq!(controller.service.redeem_calls(), 1);

        let before = controller.session_id();
        let fresh = controller.restart();
        assert_eq!(fresh.state, RecoveryState::AwaitingEmail);
        assert_ne!(fresh.session_id, before);
        assert!(controller.submit_email("u@x.com").await.is_ok());
    }

    #[tokio::test]
    async fn redeem_before_request_is_refused() {
        let controller = controller(ScriptedService::default());

        let submission = controller
            .submit_redeem("123456", "goodpass1", "goodpass1")
            .await;

        assert_eq!(submission.failure, Some(Failure::InvalidState));
        assert_eq!(submission.snapshot.state, RecoveryState::AwaitingEmail);
        assert_eq!(controller.service.redeem_calls(), 0);
    }

    #[tokio::test]
    async fn redeem_transport_failure_stays_on_redeem() {
        let controller = controller(ScriptedService::default().then_redeems([
            RedeemCodeOutcome::TransportError("reset by peer".to_string()),
            RedeemCodeOutcome::Success,
        ]));
        controller.submit_email("u@x.com").await;

        let failed = controller
            .submit_redeem("123456", "goodpass1", "goodpass1")
            .await;
        assert_eq!(failed.failure, Some(Failure::Transport));
        assert_eq!(failed.snapshot.state, RecoveryState::AwaitingRedeem);
        assert_eq!(failed.snapshot.notice, Some(Notice::error(SERVER_ERROR)));

        let retried = controller
            .submit_redeem("123456", "goodpass1", "goodpass1")
            .await;
        assert_eq!(retried.snapshot.state, RecoveryState::Succeeded);
    }

    #[tokio::test]
    async fn resend_from_redeem_step_stays_there() {
        let controller = controller(ScriptedService::with_requests([
            RequestCodeOutcome::Issued,
            RequestCodeOutcome::AlreadyPending,
        ]));
        controller.submit_email("u@x.com").await;
        controller.submit_redeem("12", "goodpass1", "goodpass1").await;
        assert_eq!(controller.current_state(), RecoveryState::AwaitingRedeem);

        let resent = controller.resend_code().await;

        assert!(resent.is_ok());
        assert_eq!(resent.snapshot.state, RecoveryState::AwaitingRedeem);
        assert_eq!(notice_kind(&resent), Some(NoticeKind::Info));
    }

    #[tokio::test]
    async fn resend_needs_a_requested_code() {
        let controller = controller(ScriptedService::default());

        let submission = controller.resend_code().await;

        assert_eq!(submission.failure, Some(Failure::InvalidState));
        assert_eq!(controller.service.request_calls(), 0);
    }

    #[tokio::test]
    async fn second_submission_while_in_flight_is_rejected() -> Result<()> {
        let gate = Arc::new(Notify::new());
        let controller = controller(ScriptedService::default().gated(gate.clone()));

        let background = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.submit_email("u@x.com").await })
        };
        wait_in_flight(&controller).await?;
        assert_eq!(controller.current_state(), RecoveryState::Submitting);

        let rejected = controller.submit_email("u@x.com").await;
        assert_eq!(rejected.failure, Some(Failure::InFlight));
        assert_eq!(notice_kind(&rejected), Some(NoticeKind::Info));
        let reset = controller.reset();
        assert_eq!(reset.failure, Some(Failure::InFlight));

        gate.notify_one();
        let finished = background.await?;
        assert!(finished.is_ok());
        assert_eq!(finished.snapshot.state, RecoveryState::CodeRequested);
        assert!(!finished.snapshot.in_flight);
        assert_eq!(controller.service.request_calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn timeout_resolves_as_transport_failure() {
        let service = ScriptedService {
            hang: true,
            ..ScriptedService::default()
        };
        let controller = controller_with(
            service,
            ControllerConfig::new().with_request_timeout(Duration::from_millis(50)),
        );

        let submission = controller.submit_email("u@x.com").await;

        assert_eq!(submission.failure, Some(Failure::Transport));
        assert_eq!(submission.snapshot.state, RecoveryState::AwaitingEmail);
        assert!(!submission.snapshot.in_flight);
    }

    #[tokio::test]
    async fn late_result_after_restart_is_discarded() -> Result<()> {
        let gate = Arc::new(Notify::new());
        let controller = controller(ScriptedService::default().gated(gate.clone()));

        let background = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.submit_email("u@x.com").await })
        };
        wait_in_flight(&controller).await?;

        let fresh = controller.restart();
        gate.notify_one();
        let finished = background.await?;

        assert_eq!(finished.failure, Some(Failure::Discarded));
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.session_id, fresh.session_id);
        assert_eq!(snapshot.state, RecoveryState::AwaitingEmail);
        assert_eq!(snapshot.email, None);
        assert!(!snapshot.in_flight);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_call_restores_pre_call_state() -> Result<()> {
        let gate = Arc::new(Notify::new());
        let controller = controller(ScriptedService::default().gated(gate));

        let background = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.submit_email("u@x.com").await })
        };
        wait_in_flight(&controller).await?;

        background.abort();
        let _ = background.await;

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.state, RecoveryState::AwaitingEmail);
        assert!(!snapshot.in_flight);
        Ok(())
    }

    #[tokio::test]
    async fn cancel_discards_session() {
        let controller = controller(ScriptedService::default());
        controller.submit_email("u@x.com").await;
        let before = controller.session_id();

        let closed = controller.cancel();

        assert_eq!(closed.state, RecoveryState::Closed);
        assert_eq!(closed.email, None);
        assert_ne!(closed.session_id, before);
        let refused = controller.submit_email("u@x.com").await;
        assert_eq!(refused.failure, Some(Failure::InvalidState));
    }

    #[tokio::test]
    async fn subscribers_see_every_transition() {
        let controller = controller(ScriptedService::default());
        let mut rx = controller.subscribe();
        assert_eq!(rx.borrow_and_update().state, RecoveryState::AwaitingEmail);

        controller.submit_email("u@x.com").await;

        assert!(rx.has_changed().unwrap_or(false));
        assert_eq!(rx.borrow_and_update().state, RecoveryState::CodeRequested);
        assert_eq!(
            controller.last_message().map(|notice| notice.kind),
            Some(NoticeKind::Success)
        );
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    proptest! {
        #[test]
        fn whitespace_email_never_calls_service(email in "[ \t\r\n]{0,16}") {
            let controller = controller(ScriptedService::default());
            let submission = block_on(controller.submit_email(&email));

            prop_assert_eq!(
                submission.failure,
                Some(Failure::Validation(ValidationError::EmptyEmail))
            );
            prop_assert_eq!(submission.snapshot.state, RecoveryState::AwaitingEmail);
            prop_assert_eq!(controller.service.request_calls(), 0);
        }

        #[test]
        fn mismatched_confirmation_never_redeems(
            new_credential in "[a-zA-Z0-9!@#]{1,24}",
            confirm_credential in "[a-zA-Z0-9!@#]{1,24}",
        ) {
            prop_assume!(new_credential != confirm_credential);
            let controller = controller(ScriptedService::default());
            let submission = block_on(async {
                controller.submit_email("u@x.com").await;
                controller
                    .submit_redeem("123456", &new_credential, &confirm_credential)
                    .await
            });

            prop_assert_eq!(
                submission.failure,
                Some(Failure::Validation(ValidationError::CredentialMismatch))
            );
            prop_assert_eq!(submission.snapshot.state, RecoveryState::AwaitingRedeem);
            prop_assert_eq!(controller.service.redeem_calls(), 0);
        }
    }
}
