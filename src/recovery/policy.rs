//! Local validation rules that gate recovery transitions.
//!
//! Everything here is pure: no I/O, no clock, no logging. Email format and
//! deliverability are left to the recovery service so the two rule sets cannot
//! drift apart.

use regex::Regex;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const DEFAULT_MIN_CREDENTIAL_LENGTH: usize = 8;
const DEFAULT_OTP_DIGITS: usize = 6;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Email is required.")]
    EmptyEmail,
    #[error("Code, new password, and confirmation are all required.")]
    MissingField,
    #[error("Passwords do not match.")]
    CredentialMismatch,
    #[error("Password must be at least {min} characters.")]
    WeakCredential { min: usize },
    #[error("Code must be {0}.")]
    InvalidCodeFormat(OtpFormat),
}

/// Shape of the one-time code users type in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OtpFormat {
    /// Any non-empty text; the service decides.
    FreeText,
    /// Exactly `n` ASCII digits.
    Digits(usize),
}

impl Default for OtpFormat {
    fn default() -> Self {
        Self::Digits(DEFAULT_OTP_DIGITS)
    }
}

impl fmt::Display for OtpFormat {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FreeText => write!(formatter, "non-empty text"),
            Self::Digits(length) => write!(formatter, "{length} digits"),
        }
    }
}

impl FromStr for OtpFormat {
    type Err = String;

    /// Parses `free-text` or `digits` (default length).
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "free-text" => Ok(Self::FreeText),
            "digits" => Ok(Self::default()),
            _ => Err(format!("invalid otp format: {value}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PolicyConfig {
    min_credential_length: usize,
    otp_format: OtpFormat,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_credential_length: DEFAULT_MIN_CREDENTIAL_LENGTH,
            otp_format: OtpFormat::default(),
        }
    }
}

impl PolicyConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_min_credential_length(mut self, length: usize) -> Self {
        self.min_credential_length = length;
        self
    }

    /// A zero-length `Digits` format falls back to the default length.
    #[must_use]
    pub fn with_otp_format(mut self, format: OtpFormat) -> Self {
        self.otp_format = match format {
            OtpFormat::Digits(0) => OtpFormat::default(),
            format => format,
        };
        self
    }

    #[must_use]
    pub fn min_credential_length(&self) -> usize {
        self.min_credential_length
    }

    #[must_use]
    pub fn otp_format(&self) -> OtpFormat {
        self.otp_format
    }
}

/// Rule set shared by every recovery flow.
#[derive(Clone, Debug)]
pub struct ValidationPolicy {
    config: PolicyConfig,
    code_pattern: Option<Regex>,
}

impl ValidationPolicy {
    #[must_use]
    pub fn new(config: PolicyConfig) -> Self {
        let code_pattern = match config.otp_format {
            OtpFormat::FreeText => None,
            OtpFormat::Digits(length) => Regex::new(&format!(r"^[0-9]{{{length}}}$")).ok(),
        };
        Self {
            config,
            code_pattern,
        }
    }

    #[must_use]
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// # Errors
    /// Returns [`ValidationError::EmptyEmail`] for empty or whitespace-only input.
    pub fn validate_email_step(&self, email: &str) -> Result<(), ValidationError> {
        if email.trim().is_empty() {
            return Err(ValidationError::EmptyEmail);
        }
        Ok(())
    }

    /// Checks redeem input and reports the first failing rule.
    ///
    /// Order is fixed: missing field, mismatch, strength, then code shape.
    ///
    /// # Errors
    /// Returns the first [`ValidationError`] that applies.
    pub fn validate_redeem_step(
        &self,
        code: &str,
        new_credential: &str,
        confirm_credential: &str,
    ) -> Result<(), ValidationError> {
        let code = code.trim();
        if code.is_empty() || new_credential.is_empty() || confirm_credential.is_empty() {
            return Err(ValidationError::MissingField);
        }

        if new_credential != confirm_credential {
            return Err(ValidationError::CredentialMismatch);
        }

        if new_credential.chars().count() < self.config.min_credential_length {
            return Err(ValidationError::WeakCredential {
                min: self.config.min_credential_length,
            });
        }

        if !self.code_matches(code) {
            return Err(ValidationError::InvalidCodeFormat(self.config.otp_format));
        }

        Ok(())
    }

    fn code_matches(&self, code: &str) -> bool {
        match self.config.otp_format {
            OtpFormat::FreeText => true,
            OtpFormat::Digits(length) => self.code_pattern.as_ref().map_or_else(
                || code.len() == length && code.bytes().all(|b| b.is_ascii_digit()),
                |regex| regex.is_match(code),
            ),
        }
    }
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}
