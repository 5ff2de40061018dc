//! Password-recovery flow: request a one-time code, then redeem it with a new
//! password. This module touches a trust boundary (anyone may request a code for
//! any email) and must never log codes or credentials.

pub mod controller;
pub mod policy;
pub mod service;
pub mod session;

pub use controller::{ControllerConfig, Failure, RecoveryController, Submission};
pub use policy::{OtpFormat, PolicyConfig, ValidationError, ValidationPolicy};
pub use service::{RecoveryService, RedeemCodeOutcome, RequestCodeOutcome};
pub use session::{Notice, NoticeKind, RecoverySession, RecoveryState, Snapshot};
