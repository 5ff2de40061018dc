//! JSON/HTTP implementation of [`RecoveryService`]. Requests carry the email,
//! the one-time code, and the new password, so payloads must never be logged.
//! Every call has a bounded timeout and HTTP errors are reduced to sanitized,
//! truncated messages before they reach the user.

mod error;

pub use self::error::ApiError;

use crate::recovery::{RecoveryService, RedeemCodeOutcome, RequestCodeOutcome};
use async_trait::async_trait;
use reqwest::{Client, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

pub const REQUEST_CODE_PATH: &str = "/v1/auth/recovery/request";
pub const REDEEM_CODE_PATH: &str = "/v1/auth/recovery/redeem";

/// Default request timeout applied to every call.
const DEFAULT_TIMEOUT_SECONDS: u64 = 10;
/// Maximum number of error body characters surfaced to the user.
const MAX_ERROR_CHARS: usize = 200;

const CODE_OTP_PENDING: &str = "otp_pending";
const CODE_INVALID_CODE: &str = "invalid_code";
const CODE_WEAK_PASSWORD: &str = "weak_password";

#[derive(Clone, Debug)]
pub struct HttpServiceConfig {
    base_url: String,
    timeout: Duration,
}

impl HttpServiceConfig {
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[derive(Serialize)]
struct RequestCodeBody<'a> {
    email: &'a str,
}

/// Carries the new password; intentionally not `Debug`.
#[derive(Serialize)]
struct RedeemCodeBody<'a> {
    email: &'a str,
    code: &'a str,
    new_password: &'a str,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct HttpRecoveryService {
    client: Client,
    base_url: String,
}

impl HttpRecoveryService {
    /// # Errors
    /// Returns [`ApiError::Config`] if the base URL is not an absolute http(s) URL
    /// or the HTTP client cannot be built.
    pub fn new(config: &HttpServiceConfig) -> Result<Self, ApiError> {
        let base_url = config.base_url.trim();
        let parsed = Url::parse(base_url)
            .map_err(|err| ApiError::Config(format!("Invalid API URL {base_url}: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ApiError::Config(format!(
                "Unsupported API URL scheme: {}",
                parsed.scheme()
            )));
        }

        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(config.timeout)
            .build()
            .map_err(|err| ApiError::Config(format!("Failed to build HTTP client: {err}")))?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
        })
    }

    /// Posts JSON and expects an empty (or ignored) success body.
    async fn post_json<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<(), ApiError> {
        let url = build_url_with_base(&self.base_url, path);
        let payload = serde_json::to_vec(body)
            .map_err(|err| ApiError::Serialization(format!("Failed to encode request: {err}")))?;

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(map_request_error)?;

        debug!("{} {}", url, response.status());

        handle_empty_response(response).await
    }
}

#[async_trait]
impl RecoveryService for HttpRecoveryService {
    #[instrument(skip_all)]
    async fn request_code(&self, email: &str) -> RequestCodeOutcome {
        let result = self
            .post_json(REQUEST_CODE_PATH, &RequestCodeBody { email })
            .await;
        classify_request(result)
    }

    #[instrument(skip_all)]
    async fn redeem_code(
        &self,
        email: &str,
        code: &str,
        new_credential: &SecretString,
    ) -> RedeemCodeOutcome {
        let body = RedeemCodeBody {
            email,
            code,
            new_password: new_credential.expose_secret(),
        };
        let result = self.post_json(REDEEM_CODE_PATH, &body).await;
        classify_redeem(result)
    }
}

fn is_client_error(status: u16) -> bool {
    (400..500).contains(&status)
}

/// Maps a request-code response onto the outcome contract.
fn classify_request(result: Result<(), ApiError>) -> RequestCodeOutcome {
    match result {
        Ok(()) => RequestCodeOutcome::Issued,
        Err(err) if err.status() == Some(409) || err.code() == Some(CODE_OTP_PENDING) => {
            RequestCodeOutcome::AlreadyPending
        }
        Err(ApiError::Http {
            status, message, ..
        }) if is_client_error(status) => RequestCodeOutcome::Rejected(message),
        Err(err) => RequestCodeOutcome::TransportError(err.to_string()),
    }
}

/// Maps a redeem response onto the outcome contract.
fn classify_redeem(result: Result<(), ApiError>) -> RedeemCodeOutcome {
    let err = match result {
        Ok(()) => return RedeemCodeOutcome::Success,
        Err(err) => err,
    };

    match err {
        ApiError::Http {
            status,
            code,
            message,
        } if is_client_error(status) => match code.as_deref() {
            Some(CODE_INVALID_CODE) => RedeemCodeOutcome::InvalidCode(message),
            Some(CODE_WEAK_PASSWORD) => RedeemCodeOutcome::WeakCredential(message),
            _ if status == 410 => RedeemCodeOutcome::InvalidCode(message),
            _ => RedeemCodeOutcome::Rejected(message),
        },
        err => RedeemCodeOutcome::TransportError(err.to_string()),
    }
}

/// Builds a URL from an explicit base URL and the provided path.
fn build_url_with_base(base_url: &str, path: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    let path = path.trim();

    if base.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", base, path.trim_start_matches('/'))
    }
}

/// Maps network errors into `ApiError` variants with timeout detection.
fn map_request_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout("Request timed out. Please try again.".to_string())
    } else {
        ApiError::Network(format!("Unable to reach the server: {err}"))
    }
}

/// Accepts an empty or JSON success body and returns sanitized HTTP errors
/// otherwise.
async fn handle_empty_response(response: Response) -> Result<(), ApiError> {
    let status = response.status();
    let body = response.text().await;

    if status.is_success() {
        let body =
            body.map_err(|err| ApiError::Parse(format!("Failed to read response: {err}")))?;
        return check_success_body(&body);
    }

    let (code, message) = parse_error_body(&body.unwrap_or_default());
    Err(ApiError::Http {
        status: status.as_u16(),
        code,
        message,
    })
}

/// A success body is either empty or JSON; anything else means the response
/// did not come from the recovery API.
fn check_success_body(body: &str) -> Result<(), ApiError> {
    if body.trim().is_empty() {
        return Ok(());
    }
    serde_json::from_str::<serde_json::Value>(body)
        .map(|_| ())
        .map_err(|err| ApiError::Parse(format!("Unexpected response body: {err}")))
}

/// Extracts `(code, message)` from a JSON error body, falling back to the raw
/// text for non-JSON bodies.
fn parse_error_body(body: &str) -> (Option<String>, String) {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => {
            let message = parsed.message.or(parsed.error).unwrap_or_default();
            let code = parsed
                .code
                .map(|code| code.trim().to_lowercase())
                .filter(|code| !code.is_empty());
            (code, sanitize_body(&message))
        }
        Err(_) => (None, sanitize_body(body)),
    }
}

/// Sanitizes HTTP error bodies for user-facing messages by trimming and truncating.
fn sanitize_body(body: &str) -> String {
    body.trim().chars().take(MAX_ERROR_CHARS).collect()
}
