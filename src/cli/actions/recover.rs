use crate::{
    client::{HttpRecoveryService, HttpServiceConfig},
    recovery::{
        ControllerConfig, PolicyConfig, RecoveryController, RecoveryService, RecoveryState,
        Submission, ValidationPolicy,
    },
};
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

const COMMAND_QUIT: &str = ":quit";
const COMMAND_RESEND: &str = ":resend";
const COMMAND_RESET: &str = ":reset";

#[derive(Debug)]
pub struct Args {
    pub api_url: String,
    pub http_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
    pub auto_close_seconds: u64,
    pub policy: PolicyConfig,
}

/// How an interactive run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveOutcome {
    Recovered,
    Cancelled,
}

/// Execute the recover action against stdin/stdout.
/// # Errors
/// Returns an error if the HTTP client cannot be built or the terminal fails.
pub async fn execute(args: Args) -> Result<()> {
    info!(
        api_url = %args.api_url,
        request_timeout_seconds = args.request_timeout_seconds,
        "starting password recovery"
    );

    let service = HttpRecoveryService::new(
        &HttpServiceConfig::new(args.api_url)
            .with_timeout(Duration::from_secs(args.http_timeout_seconds)),
    )
    .context("could not configure the recovery API client")?;

    let controller = RecoveryController::new(
        service,
        ValidationPolicy::new(args.policy),
        ControllerConfig::new()
            .with_request_timeout(Duration::from_secs(args.request_timeout_seconds))
            .with_auto_close_delay(Duration::from_secs(args.auto_close_seconds)),
    );

    let mut input = BufReader::new(tokio::io::stdin());
    let mut output = tokio::io::stdout();

    match drive(&controller, &mut input, &mut output).await? {
        DriveOutcome::Recovered => info!("password recovered"),
        DriveOutcome::Cancelled => info!("password recovery cancelled"),
    }

    Ok(())
}

/// Runs the prompt loop until the session closes.
///
/// End of input at any prompt cancels the session, as does `:quit`. While a
/// code is expected, `:resend` asks for another code and `:reset` goes back
/// to the email step.
///
/// # Errors
/// Returns an error only when reading from `input` or writing to `output` fails.
pub async fn drive<S, R, W>(
    controller: &RecoveryController<S>,
    input: &mut R,
    output: &mut W,
) -> Result<DriveOutcome>
where
    S: RecoveryService,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        match controller.current_state() {
            RecoveryState::AwaitingEmail => {
                let Some(email) = prompt(input, output, "Email: ").await? else {
                    return cancel(controller, output).await;
                };
                if email.trim() == COMMAND_QUIT {
                    return cancel(controller, output).await;
                }
                let submission = controller.submit_email(&email).await;
                report(output, &submission).await?;
            }
            RecoveryState::CodeRequested | RecoveryState::AwaitingRedeem => {
                let label = format!("Code ({COMMAND_RESEND}, {COMMAND_RESET}, {COMMAND_QUIT}): ");
                let Some(code) = prompt(input, output, &label).await? else {
                    return cancel(controller, output).await;
                };
                let submission = match code.trim() {
                    COMMAND_QUIT => return cancel(controller, output).await,
                    COMMAND_RESEND => controller.resend_code().await,
                    COMMAND_RESET => controller.reset(),
                    _ => {
                        let Some(new_password) = prompt_secret(input, output, "New password: ").await?
                        else {
                            return cancel(controller, output).await;
                        };
                        let Some(confirm_password) =
                            prompt_secret(input, output, "Confirm password: ").await?
                        else {
                            return cancel(controller, output).await;
                        };
                        controller
                            .submit_redeem(
                                &code,
                                new_password.expose_secret(),
                                confirm_password.expose_secret(),
                            )
                            .await
                    }
                };
                report(output, &submission).await?;
            }
            RecoveryState::Succeeded => {
                if let Some(delay) = controller.auto_close_after() {
                    tokio::time::sleep(delay).await;
                }
                controller.close();
                return Ok(DriveOutcome::Recovered);
            }
            RecoveryState::Closed => return Ok(DriveOutcome::Cancelled),
            // Only reachable if another task shares the controller.
            RecoveryState::Submitting => {
                let mut updates = controller.subscribe();
                let _ = updates.wait_for(|snapshot| !snapshot.in_flight).await;
            }
        }
    }
}

async fn cancel<S, W>(controller: &RecoveryController<S>, output: &mut W) -> Result<DriveOutcome>
where
    W: AsyncWrite + Unpin,
{
    controller.cancel();
    output.write_all(b"\nRecovery cancelled.\n").await?;
    output.flush().await?;
    Ok(DriveOutcome::Cancelled)
}

async fn report<W>(output: &mut W, submission: &Submission) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if let Some(failure) = &submission.failure {
        debug!(?failure, state = %submission.snapshot.state, "submission not applied");
    }
    if let Some(notice) = &submission.snapshot.notice {
        output.write_all(format!("{notice}\n").as_bytes()).await?;
        output.flush().await?;
    }
    Ok(())
}

/// Writes `label` and reads one line. `None` means end of input.
async fn prompt<R, W>(input: &mut R, output: &mut W, label: &str) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    output.write_all(label.as_bytes()).await?;
    output.flush().await?;

    let mut line = String::new();
    if input.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    Ok(Some(line))
}

async fn prompt_secret<R, W>(
    input: &mut R,
    output: &mut W,
    label: &str,
) -> Result<Option<SecretString>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    Ok(prompt(input, output, label).await?.map(SecretString::from))
}
