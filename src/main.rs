//! miunlock CLI entry point
//!
//! Collects credentials, performs the login handshake, then hands off to the
//! minute-aligned scheduler until authorization is granted or the process is
//! interrupted.

use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result, eyre};
use tracing::{info, warn};

use miunlock::api::{AuthError, AuthProvider, CommunityClient, SessionContext};
use miunlock::cli::Cli;
use miunlock::clock::SystemClock;
use miunlock::config::Config;
use miunlock::scheduler::Scheduler;
use miunlock::timesync::NtpTimeSource;

/// Credential prompt rounds before giving up
const MAX_LOGIN_ROUNDS: u32 = 3;

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    Ok(())
}

/// Prompt for username and password; `preset_user` skips the username prompt
fn prompt_credentials(preset_user: Option<&str>) -> Result<(String, String)> {
    let mut editor = rustyline::DefaultEditor::new().context("Failed to open prompt")?;

    let user = match preset_user {
        Some(user) => user.to_string(),
        None => editor.readline("Username: ").context("Failed to read username")?,
    };
    let password = editor.readline("Password: ").context("Failed to read password")?;

    Ok((user.trim().to_string(), password))
}

/// Run the credential prompt / login loop
async fn establish_session(config: &Config, preset_user: Option<&str>) -> Result<SessionContext> {
    let provider = AuthProvider::new(&config.api, &config.schedule).context("Failed to build auth client")?;

    for round in 1..=MAX_LOGIN_ROUNDS {
        let (user, password) = prompt_credentials(preset_user)?;

        match provider.login(&user, &password).await {
            Ok(session) => return Ok(session),
            Err(e @ AuthError::VerificationRequired { .. }) => {
                // needs manual account action, retrying is pointless
                return Err(eyre!(e));
            }
            Err(e) => {
                warn!(round, max = MAX_LOGIN_ROUNDS, error = %e, "authentication failed");
            }
        }
    }

    Err(eyre!("authentication failed after {MAX_LOGIN_ROUNDS} rounds"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    let session = establish_session(&config, cli.user.as_deref()).await?;
    info!(region = %session.region, "session established");

    let api = CommunityClient::new(&config.api, &session).context("Failed to build API client")?;
    let scheduler = Scheduler::new(
        Arc::new(SystemClock),
        Arc::new(NtpTimeSource::new(&config.ntp)),
        Arc::new(api),
        &config.schedule,
    )
    .context("Failed to build scheduler")?;

    tokio::select! {
        _ = scheduler.run() => {
            info!("done");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, exiting");
        }
    }

    Ok(())
}
