//! Per-attempt recovery state.
//!
//! A [`RecoverySession`] lives for exactly one recovery attempt and is only
//! mutated by the controller. Credentials are held as [`SecretString`] and are
//! redacted from `Debug` output; [`Snapshot`] is the credential-free view handed
//! to callers.

use secrecy::SecretString;
use std::fmt;
use ulid::Ulid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecoveryState {
    AwaitingEmail,
    CodeRequested,
    AwaitingRedeem,
    /// A remote call is outstanding.
    Submitting,
    Succeeded,
    /// Terminal; the session has been discarded.
    Closed,
}

impl RecoveryState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Closed)
    }

    /// States from which the user may type a code and new password.
    #[must_use]
    pub fn accepts_redeem(self) -> bool {
        matches!(self, Self::CodeRequested | Self::AwaitingRedeem)
    }
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitingEmail => "awaiting_email",
            Self::CodeRequested => "code_requested",
            Self::AwaitingRedeem => "awaiting_redeem",
            Self::Submitting => "submitting",
            Self::Succeeded => "succeeded",
            Self::Closed => "closed",
        };
        formatter.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeKind {
    Info,
    Error,
    Success,
}

/// Message surfaced to the caller after a transition attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub text: String,
}

impl Notice {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Info,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Error,
            text: text.into(),
        }
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Success,
            text: text.into(),
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.kind {
            NoticeKind::Info => "info",
            NoticeKind::Error => "error",
            NoticeKind::Success => "success",
        };
        write!(formatter, "[{tag}] {}", self.text)
    }
}

pub struct RecoverySession {
    id: Ulid,
    pub(crate) state: RecoveryState,
    pub(crate) email: Option<String>,
    pub(crate) code: String,
    pub(crate) new_credential: SecretString,
    pub(crate) confirm_credential: SecretString,
    pub(crate) last_message: Option<Notice>,
    pub(crate) attempt_in_flight: bool,
}

impl RecoverySession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Ulid::new(),
            state: RecoveryState::AwaitingEmail,
            email: None,
            code: String::new(),
            new_credential: SecretString::from(""),
            confirm_credential: SecretString::from(""),
            last_message: None,
            attempt_in_flight: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> Ulid {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> RecoveryState {
        self.state
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    #[must_use]
    pub fn last_message(&self) -> Option<&Notice> {
        self.last_message.as_ref()
    }

    #[must_use]
    pub fn attempt_in_flight(&self) -> bool {
        self.attempt_in_flight
    }

    /// Drops the email and every redeem field, returning to the first step.
    pub(crate) fn clear_inputs(&mut self) {
        self.email = None;
        self.code.clear();
        self.new_credential = SecretString::from("");
        self.confirm_credential = SecretString::from("");
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            session_id: self.id,
            state: self.state,
            email: self.email.clone(),
            notice: self.last_message.clone(),
            in_flight: self.attempt_in_flight,
        }
    }
}

impl Default for RecoverySession {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecoverySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoverySession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("email", &self.email)
            .field("code", &"***")
            .field("new_credential", &"***")
            .field("confirm_credential", &"***")
            .field("last_message", &self.last_message)
            .field("attempt_in_flight", &self.attempt_in_flight)
            .finish()
    }
}

/// Read-only view of a session, published after every transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub session_id: Ulid,
    pub state: RecoveryState,
    pub email: Option<String>,
    pub notice: Option<Notice>,
    pub in_flight: bool,
}
