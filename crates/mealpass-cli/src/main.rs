//! mealpass - command-line shell around the session core.
//!
//! Signs an operator in, keeps the session alive while `watch` runs, and
//! signs out. Mostly useful for exercising the API and the stored session
//! outside the mobile app.

use std::io::{self, Write};

use anyhow::{anyhow, Result};
use mealpass_core::{Config, SessionEvent, SessionStack, SignInError};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

/// Directory under the local data dir that holds the log files
const LOG_DIR: &str = "mealpass/logs";

const LOG_FILE_PREFIX: &str = "mealpass.log";

const USAGE: &str = "\
Usage: mealpass <command>

Commands:
  login [email]   Sign in and store the session
  status          Show the stored session
  whoami          Re-validate the stored session with the server
  watch           Restore the session and keep it renewed until Ctrl-C
  logout          Sign out and clear the stored session";

/// Initialize the tracing subscriber for logging.
///
/// Console output honours `RUST_LOG` (default `warn`). A daily log file is
/// written as well when the data directory is available; keep the returned
/// guard alive so it gets flushed.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let appender = dirs::data_local_dir().and_then(|dir| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .build(dir.join(LOG_DIR))
            .ok()
    });
    let (file_layer, guard) = match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };
    if matches!(command.as_str(), "help" | "-h" | "--help") {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load()?;
    let stack = SessionStack::from_config(&config)?;
    info!(command = %command, api = %config.api_base_url, "mealpass starting");

    match command.as_str() {
        "login" => login(&stack, &config, args.get(1).cloned()).await,
        "status" => status(&stack),
        "whoami" => whoami(&stack).await,
        "watch" => watch(&stack).await,
        "logout" => logout(&stack).await,
        other => Err(anyhow!("Unknown command '{}'\n\n{}", other, USAGE)),
    }
}

fn prompt_identifier(default: Option<&str>) -> Result<String> {
    match default {
        Some(default) => print!("Email [{}]: ", default),
        None => print!("Email: "),
    }
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let entered = line.trim();
    if entered.is_empty() {
        default
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Email is required"))
    } else {
        Ok(entered.to_string())
    }
}

async fn login(stack: &SessionStack, config: &Config, identifier: Option<String>) -> Result<()> {
    let identifier = match identifier {
        Some(identifier) => identifier,
        None => prompt_identifier(config.last_identifier.as_deref())?,
    };
    let secret = rpassword::prompt_password("Password: ")?;
    if secret.is_empty() {
        return Err(anyhow!("Password is required"));
    }

    let profile = match stack.controller.sign_in(&identifier, &secret).await {
        Ok(profile) => profile,
        Err(SignInError::Rejected(message)) => return Err(anyhow!("Sign-in rejected: {}", message)),
        Err(e) => return Err(e.into()),
    };

    if let Err(e) = Config::remember_identifier(&identifier) {
        tracing::warn!(error = %e, "Failed to remember sign-in email");
    }
    println!("Signed in as {} <{}>", profile.name, profile.email);
    Ok(())
}

fn status(stack: &SessionStack) -> Result<()> {
    let vault = stack.controller.context().vault();
    match vault.load_session() {
        Some((credential, profile)) => {
            let now = chrono::Utc::now();
            println!("Signed in as {} <{}>", profile.name, profile.email);
            if credential.is_expired_at(now) {
                println!("Token expired at {}", credential.expires_at);
            } else {
                println!(
                    "Token expires at {} ({} min left)",
                    credential.expires_at,
                    credential.minutes_until_expiry(now)
                );
            }
        }
        None => println!("Not signed in"),
    }
    Ok(())
}

async fn whoami(stack: &SessionStack) -> Result<()> {
    if !stack.controller.bootstrap().await {
        println!("Not signed in");
        return Ok(());
    }
    let profile = stack
        .controller
        .current_user()
        .ok_or_else(|| anyhow!("Session ended while reading the profile"))?;
    println!("{}", serde_json::to_string_pretty(&profile)?);
    Ok(())
}

async fn watch(stack: &SessionStack) -> Result<()> {
    let mut events = stack.controller.subscribe();
    let mut notices = stack.controller.notices();

    if !stack.controller.bootstrap().await {
        println!("Not signed in. Run `mealpass login` first.");
        return Ok(());
    }
    println!("Session active, renewing in the background. Press Ctrl-C to stop.");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::Invalidated(reason)) => {
                    println!("Session ended: {:?}", reason);
                    break;
                }
                Ok(SessionEvent::SignedOut) => {
                    println!("Signed out");
                    break;
                }
                Ok(SessionEvent::Renewed { expires_at }) => println!("Token renewed, expires at {}", expires_at),
                Ok(other) => info!(event = ?other, "Session event"),
                Err(RecvError::Lagged(skipped)) => info!(skipped, "Missed session events"),
                Err(RecvError::Closed) => break,
            },
            notice = notices.recv() => {
                if let Ok(notice) = notice {
                    eprintln!("{}", notice);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping");
                break;
            }
        }
    }
    Ok(())
}

async fn logout(stack: &SessionStack) -> Result<()> {
    let was_signed_in = stack.controller.is_authenticated();
    stack.controller.try_sign_out().await?;
    if was_signed_in {
        println!("Signed out");
    } else {
        println!("Not signed in");
    }
    Ok(())
}
