use crate::cli::{
    actions::{recover::Args, Action},
    commands::{policy, service},
};
use anyhow::Result;

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let service = service::Options::parse(matches)?;
    let policy = policy::Options::parse(matches)?;

    Ok(Action::Recover(Args {
        api_url: service.api_url,
        http_timeout_seconds: service.http_timeout_seconds,
        request_timeout_seconds: service.request_timeout_seconds,
        auto_close_seconds: service.auto_close_seconds,
        policy: policy.policy_config(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cli::commands, recovery::OtpFormat};

    #[test]
    fn builds_recover_action() {
        let matches = commands::new().get_matches_from(vec![
            "reclaim",
            "--api-url",
            "http://127.0.0.1:8080",
            "--request-timeout-seconds",
            "7",
            "--auto-close-seconds",
            "1",
            "--min-password-length",
            "10",
            "--otp-format",
            "free-text",
        ]);

        let Action::Recover(args) = handler(&matches).unwrap();
        assert_eq!(args.api_url, "http://127.0.0.1:8080");
        assert_eq!(args.request_timeout_seconds, 7);
        assert_eq!(args.auto_close_seconds, 1);
        assert_eq!(args.policy.min_credential_length(), 10);
        assert_eq!(args.policy.otp_format(), OtpFormat::FreeText);
    }
}
