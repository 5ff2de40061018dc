//! # Reclaim (Account Recovery Client)
//!
//! `reclaim` drives the password-recovery flow for users who know their email
//! address but hold no valid session. The flow is a small challenge-response
//! protocol: request a one-time code (OTP), then redeem the code together with a
//! new password.
//!
//! ## State Machine
//!
//! [`recovery::RecoveryController`] owns a single [`recovery::RecoverySession`]
//! and moves it through `AwaitingEmail → CodeRequested → AwaitingRedeem →
//! Succeeded`. Every transition attempt surfaces a [`recovery::Notice`] and
//! publishes a [`recovery::Snapshot`] to subscribers.
//!
//! - **Local validation first:** [`recovery::ValidationPolicy`] gates every remote
//!   call. Validation failures never reach the network.
//! - **Idempotent requests:** asking again for an email with a live code is a
//!   success-shaped outcome with an informational notice, never an error.
//! - **Single flight:** at most one remote call is outstanding per session; a
//!   second submission is rejected locally.
//! - **No silent progress:** rejections and transport failures leave the session
//!   in its pre-call state.
//!
//! ## Trust Boundary
//!
//! Anyone can request a code for any email. The client never infers account
//! existence from responses, never retries credential-bearing calls on its own,
//! and maps transport failures to a generic message so internals do not leak.
//!
//! ## Remote Service
//!
//! [`recovery::RecoveryService`] is the seam to the backend. [`client::HttpRecoveryService`]
//! implements it over JSON/HTTP.

pub mod cli;
pub mod client;
pub mod recovery;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
