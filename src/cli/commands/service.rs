use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};

pub const ARG_API_URL: &str = "api-url";
pub const ARG_HTTP_TIMEOUT_SECONDS: &str = "http-timeout-seconds";
pub const ARG_REQUEST_TIMEOUT_SECONDS: &str = "request-timeout-seconds";
pub const ARG_AUTO_CLOSE_SECONDS: &str = "auto-close-seconds";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_API_URL)
                .short('u')
                .long(ARG_API_URL)
                .help("Recovery API base URL, example: https://api.permesi.dev")
                .env("RECLAIM_API_URL")
                .required(true),
        )
        .arg(
            Arg::new(ARG_HTTP_TIMEOUT_SECONDS)
                .long(ARG_HTTP_TIMEOUT_SECONDS)
                .help("Per-request HTTP timeout in seconds")
                .env("RECLAIM_HTTP_TIMEOUT_SECONDS")
                .default_value("10")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_REQUEST_TIMEOUT_SECONDS)
                .long(ARG_REQUEST_TIMEOUT_SECONDS)
                .help("Upper bound on how long a recovery step waits for the service")
                .env("RECLAIM_REQUEST_TIMEOUT_SECONDS")
                .default_value("30")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_AUTO_CLOSE_SECONDS)
                .long(ARG_AUTO_CLOSE_SECONDS)
                .help("Seconds to keep the success message before closing")
                .env("RECLAIM_AUTO_CLOSE_SECONDS")
                .default_value("3")
                .value_parser(clap::value_parser!(u64)),
        )
}

#[derive(Debug, Clone)]
pub struct Options {
    pub api_url: String,
    pub http_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
    pub auto_close_seconds: u64,
}

impl Options {
    /// # Errors
    /// Returns an error if the API URL is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let api_url = matches
            .get_one::<String>(ARG_API_URL)
            .cloned()
            .context("missing required argument: --api-url")?;

        Ok(Self {
            api_url,
            http_timeout_seconds: matches
                .get_one::<u64>(ARG_HTTP_TIMEOUT_SECONDS)
                .copied()
                .unwrap_or(10),
            request_timeout_seconds: matches
                .get_one::<u64>(ARG_REQUEST_TIMEOUT_SECONDS)
                .copied()
                .unwrap_or(30),
            auto_close_seconds: matches
                .get_one::<u64>(ARG_AUTO_CLOSE_SECONDS)
                .copied()
                .unwrap_or(3),
        })
    }
}
