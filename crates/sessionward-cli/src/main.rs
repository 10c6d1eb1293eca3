//! sessionward - command line front end for the session client.
//!
//! Logs in against the configured API, makes authenticated requests through
//! the refreshing dispatcher, and can sit in the foreground watching for
//! inactivity.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sessionward_core::activity::{ActivitySignal, InactivityMonitor, MonitorCallbacks, MonitorState};
use sessionward_core::api::{ApiError, ApiRequest, ReqwestTransport};
use sessionward_core::auth::{
    token, AuthFailureBroadcaster, FileStore, KeyringStore, KvStore, LoginOutcome, MemoryStore,
    Retention, SealedStore, SessionController, SessionStore,
};
use sessionward_core::config::ClientConfig;

// ============================================================================
// Constants
// ============================================================================

/// Keychain service holding the session file's sealing secret
const KEYCHAIN_SERVICE: &str = "sessionward";

const SEALING_SECRET_KEY: &str = "sealing-secret";

/// Set to `1` to also write logs under the cache directory
const ENV_LOG_FILE: &str = "SESSIONWARD_LOG_FILE";

/// Extra attempts for `get` when the server is briefly unavailable
const GET_RETRIES: u32 = 2;

const USAGE: &str = "\
Usage: sessionward <command>

Commands:
  login <identifier> [--remember]   Log in (prompts for password and 2FA code)
  logout                            End the session
  status                            Show the current session
  get <path>                        Authenticated GET, prints the response
  watch                             Watch for inactivity (Enter = activity, c = continue, q = quit)

Without --remember the session only lasts as long as the command.";

type Controller = SessionController<ReqwestTransport>;

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "sessionward.log");
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

    let config = ClientConfig::load()?;
    let log_dir = if std::env::var(ENV_LOG_FILE).is_ok_and(|v| v == "1") {
        Some(config.cache_dir()?)
    } else {
        None
    };
    let _guard = init_tracing(log_dir.as_deref());

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    let store = open_store(&config)?;
    let broadcaster = AuthFailureBroadcaster::new();
    let transport = Arc::new(ReqwestTransport::new()?);
    let monitor = Arc::new(InactivityMonitor::new(
        Arc::clone(&store),
        broadcaster.clone(),
        MonitorCallbacks::new()
            .on_warning(|_| {
                // Terminal bell
                print!("\x07");
                let _ = io::stdout().flush();
            })
            .on_timeout(|| info!("Session ended by inactivity")),
    ));
    let controller = SessionController::new(transport, Arc::clone(&store), broadcaster, config.clone())
        .with_monitor(Arc::clone(&monitor));
    controller.listen();

    // Restoring counts as activity, so note the previous stamp first
    let last_seen = store.last_activity();
    if command != "login" && config.inactivity.enabled {
        controller.restore(config.inactivity.timeout());
    }

    match command.as_str() {
        "login" => login(&controller, &args[1..]).await,
        "logout" => {
            controller.logout().await;
            println!("Logged out");
            Ok(())
        }
        "status" => status(&controller, &store, &config, last_seen),
        "get" => {
            let Some(path) = args.get(1) else {
                bail!("get needs a path\n\n{}", USAGE);
            };
            get(&controller, &store, path).await
        }
        "watch" => watch(&controller, &monitor, &config).await,
        "-h" | "--help" | "help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
}

/// Session file sealed with a keychain-held secret; plain file when the
/// keychain cannot be used.
fn open_store(config: &ClientConfig) -> Result<Arc<SessionStore>> {
    let dir = config.cache_dir()?;
    let file = FileStore::in_dir(&dir, "session");
    let keychain = KeyringStore::new(KEYCHAIN_SERVICE);

    let secret = match keychain.get(SEALING_SECRET_KEY) {
        Ok(Some(secret)) => Some(secret),
        Ok(None) => {
            let secret = SealedStore::<FileStore>::generate_secret();
            match keychain.set(SEALING_SECRET_KEY, &secret) {
                Ok(()) => Some(secret),
                Err(e) => {
                    warn!(error = %e, "Could not save sealing secret, session file will not be encrypted");
                    None
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "Keychain unavailable, session file will not be encrypted");
            None
        }
    };

    let store = match secret {
        Some(secret) => {
            let sealed = SealedStore::new(file, secret.as_bytes(), "session")
                .context("Failed to set up session encryption")?;
            SessionStore::new(sealed, MemoryStore::new())
        }
        None => SessionStore::new(file, MemoryStore::new()),
    };
    debug!(dir = %dir.display(), "Session store opened");
    Ok(Arc::new(store))
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

async fn login(controller: &Controller, args: &[String]) -> Result<()> {
    let remember = args.iter().any(|a| a == "--remember");
    let identifier = match args.iter().find(|a| !a.starts_with("--")) {
        Some(identifier) => identifier.clone(),
        None => prompt("Username or email: ")?,
    };
    if identifier.is_empty() {
        bail!("An identifier is required");
    }
    let password = rpassword::prompt_password("Password: ")?;

    let session = match controller.login(&identifier, &password, remember).await? {
        LoginOutcome::Authenticated(session) => session,
        LoginOutcome::TwoFactorRequired { pre_auth_token } => {
            let code = prompt("Verification code: ")?;
            controller
                .verify_two_factor(&pre_auth_token, &code, remember)
                .await?
        }
    };

    println!("Logged in as {}", session.identity.label());
    if !remember {
        println!("Session not remembered; pass --remember to keep it for later commands");
    }
    Ok(())
}

fn status(
    controller: &Controller,
    store: &SessionStore,
    config: &ClientConfig,
    last_seen: Option<DateTime<Utc>>,
) -> Result<()> {
    let Some(session) = controller.current_session() else {
        println!("Not logged in");
        return Ok(());
    };

    println!("User:        {} (id {})", session.identity.label(), session.identity.id);
    if let Some(email) = &session.identity.email {
        println!("Email:       {}", email);
    }
    let retention = match store.retention() {
        Some(Retention::Persistent) => "remembered",
        _ => "this process only",
    };
    println!("Stored:      {}", retention);
    println!(
        "Expires:     {} ({} days left)",
        session.absolute_expiry.format("%Y-%m-%d %H:%M UTC"),
        session.time_until_expiry().num_days()
    );
    match token::expiry(&session.access_token) {
        Ok(exp) if exp > Utc::now() => println!("Token:       valid until {}", exp.format("%H:%M:%S UTC")),
        Ok(_) => println!("Token:       expired, refreshed on next request"),
        Err(e) => println!("Token:       unreadable ({})", e),
    }
    if let Some(last) = last_seen {
        let idle = (Utc::now() - last).num_seconds().max(0);
        println!("Idle:        {}s", idle);
        if config.inactivity.enabled {
            let left = config.inactivity.timeout().as_secs() as i64 - idle;
            println!("Inactivity:  logs out in {}s", left.max(0));
        }
    }
    Ok(())
}

async fn get(controller: &Controller, store: &SessionStore, path: &str) -> Result<()> {
    if controller.current_session().is_none() {
        bail!("Not logged in");
    }

    let request = ApiRequest::get(path).retry(GET_RETRIES);
    let response = match controller.client().execute(&request).await {
        Ok(response) => response,
        Err(ApiError::AuthExpired { .. }) => bail!("Session expired, please log in again"),
        Err(e) => return Err(e.into()),
    };
    store.record_activity();

    match response.value() {
        Ok(Some(value)) => println!("{}", serde_json::to_string_pretty(&value)?),
        Ok(None) => println!("({} No Content)", response.status),
        Err(_) => println!("{}", response.body),
    }
    Ok(())
}

async fn watch(controller: &Controller, monitor: &InactivityMonitor, config: &ClientConfig) -> Result<()> {
    if controller.current_session().is_none() {
        bail!("Not logged in");
    }
    if !monitor.arm(config.inactivity) {
        bail!("Inactivity monitoring is disabled in the configuration");
    }

    let mut states = monitor.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!(
        "Watching for inactivity ({}s). Enter = activity, c = continue, q = quit",
        config.inactivity.timeout().as_secs()
    );

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "q" => break,
                    "c" if matches!(monitor.state(), MonitorState::Warning { .. }) => {
                        if monitor.continue_session() {
                            println!("\nStill signed in");
                        }
                    }
                    _ => {
                        monitor.record_signal(ActivitySignal::KeyPress);
                    }
                }
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                match state {
                    MonitorState::Warning { remaining_secs } => {
                        print!("\rSigning out in {:>3}s, type c to stay signed in ", remaining_secs);
                        io::stdout().flush()?;
                    }
                    MonitorState::Expired => {
                        println!("\nSigned out after {}s of inactivity", config.inactivity.timeout().as_secs());
                        // Revoke server-side too; the broadcast listener may not have run yet
                        controller.logout().await;
                        return Ok(());
                    }
                    MonitorState::Inactive => {
                        println!("\nSession ended");
                        return Ok(());
                    }
                    MonitorState::Active => {}
                }
            }
        }
    }
    Ok(())
}
