use crate::recovery::{OtpFormat, PolicyConfig};
use anyhow::{anyhow, bail, Result};
use clap::{builder::PossibleValuesParser, Arg, ArgMatches, Command};

pub const ARG_MIN_PASSWORD_LENGTH: &str = "min-password-length";
pub const ARG_OTP_FORMAT: &str = "otp-format";
pub const ARG_OTP_LENGTH: &str = "otp-length";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_MIN_PASSWORD_LENGTH)
                .long(ARG_MIN_PASSWORD_LENGTH)
                .help("Minimum new password length, checked before contacting the service")
                .env("RECLAIM_MIN_PASSWORD_LENGTH")
                .default_value("8")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_OTP_FORMAT)
                .long(ARG_OTP_FORMAT)
                .help("Expected one-time code shape")
                .env("RECLAIM_OTP_FORMAT")
                .default_value("digits")
                .value_parser(PossibleValuesParser::new(["digits", "free-text"])),
        )
        .arg(
            Arg::new(ARG_OTP_LENGTH)
                .long(ARG_OTP_LENGTH)
                .help("Number of digits when --otp-format=digits")
                .env("RECLAIM_OTP_LENGTH")
                .default_value("6")
                .value_parser(clap::value_parser!(usize)),
        )
}

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub min_password_length: usize,
    pub otp_format: OtpFormat,
}

impl Options {
    /// # Errors
    /// Returns an error if the code format and length do not combine into a valid shape.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let min_password_length = matches
            .get_one::<usize>(ARG_MIN_PASSWORD_LENGTH)
            .copied()
            .unwrap_or(8);

        let format = matches
            .get_one::<String>(ARG_OTP_FORMAT)
            .map_or("digits", String::as_str);
        let otp_format = match format {
            "digits" => {
                let length = matches.get_one::<usize>(ARG_OTP_LENGTH).copied().unwrap_or(6);
                if length == 0 {
                    bail!("--{ARG_OTP_LENGTH} must be greater than zero");
                }
                OtpFormat::Digits(length)
            }
            other => other.parse::<OtpFormat>().map_err(|err| anyhow!(err))?,
        };

        Ok(Self {
            min_password_length,
            otp_format,
        })
    }

    #[must_use]
    pub fn policy_config(&self) -> PolicyConfig {
        PolicyConfig::new()
            .with_min_credential_length(self.min_password_length)
            .with_otp_format(self.otp_format)
    }
}
