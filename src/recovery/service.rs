//! Contract with the remote recovery backend.
//!
//! The controller only depends on this trait. Outcomes are values, not errors:
//! a transport failure is one more case the state machine has to classify.

use async_trait::async_trait;
use secrecy::SecretString;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestCodeOutcome {
    Issued,
    /// A live code already exists for this email; nothing new was sent.
    AlreadyPending,
    Rejected(String),
    TransportError(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RedeemCodeOutcome {
    Success,
    InvalidCode(String),
    WeakCredential(String),
    Rejected(String),
    TransportError(String),
}

/// Remote capability that issues and redeems one-time recovery codes.
///
/// Implementations must not retry on their own and must never log the code or
/// the new credential.
#[async_trait]
pub trait RecoveryService: Send + Sync {
    async fn request_code(&self, email: &str) -> RequestCodeOutcome;

    async fn redeem_code(
        &self,
        email: &str,
        code: &str,
        new_credential: &SecretString,
    ) -> RedeemCodeOutcome;
}

#[async_trait]
impl<T: RecoveryService + ?Sized> RecoveryService for std::sync::Arc<T> {
    async fn request_code(&self, email: &str) -> RequestCodeOutcome {
        (**self).request_code(email).await
    }

    async fn redeem_code(
        &self,
        email: &str,
        code: &str,
        new_credential: &SecretString,
    ) -> RedeemCodeOutcome {
        (**self).redeem_code(email, code, new_credential).await
    }
}
