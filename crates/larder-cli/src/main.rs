//! larder - command-line companion for the larder session layer.
//!
//! Inspects and drives the stored session against a real API host:
//! restore it, force a refresh, import a token pair, make an authenticated
//! request, or log out.

use std::io;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use larder_core::auth::{CredentialIssuer, LoginError, LoginGrant, RestoreOutcome};
use larder_core::{AppContext, Config, TokenPair};

const USAGE: &str = "\
Usage: larder <command>

Commands:
  status        Show the stored tokens without contacting the server
  restore       Restore the stored session as on app start
  refresh       Force a token refresh
  import        Store a token pair (prompted, hidden) and restore it
  get <path>    Authenticated GET against the API host
  logout        Forget the stored session
";

/// Log file name inside the cache directory
const LOG_FILE: &str = "larder.log";

/// Logins happen in the app; the CLI only works with imported tokens.
struct ImportOnlyIssuer;

#[async_trait]
impl CredentialIssuer for ImportOnlyIssuer {
    async fn login(&self, _email: &str, _password: &str) -> Result<LoginGrant, LoginError> {
        Err(LoginError::Other(anyhow!(
            "password login is not available here, use `larder import`"
        )))
    }
}

/// Initialize the tracing subscriber for logging
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match config.cache_dir() {
        Ok(dir) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
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

    let config = Config::load()?;
    let _log_guard = init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprint!("{}", USAGE);
        return Ok(());
    };

    let context = AppContext::new(config, Arc::new(ImportOnlyIssuer))?;
    info!(command = %command, "larder starting");

    match command.as_str() {
        "status" => status(&context).await,
        "restore" => restore(&context).await,
        "refresh" => refresh(&context).await,
        "import" => import(&context).await,
        "get" => {
            let path = args
                .get(1)
                .ok_or_else(|| anyhow!("get needs a path, e.g. `larder get /api/fridge`"))?;
            get(&context, path).await
        }
        "logout" => {
            context.session.logout().await;
            println!("Logged out");
            Ok(())
        }
        other => {
            eprint!("Unknown command: {}\n\n{}", other, USAGE);
            Ok(())
        }
    }
}

fn describe(outcome: &RestoreOutcome) -> String {
    match outcome {
        RestoreOutcome::NoSession => "no stored session".to_string(),
        RestoreOutcome::RefreshTokenExpired => "refresh token expired, session cleared".to_string(),
        RestoreOutcome::Restored => "restored".to_string(),
        RestoreOutcome::Refreshed => "restored with a refreshed access token".to_string(),
        RestoreOutcome::Rejected(e) => format!("server rejected the session ({}), cleared", e),
        RestoreOutcome::Deferred(e) => format!("could not reach the server ({}), tokens kept", e),
    }
}

async fn status(context: &AppContext) -> Result<()> {
    let overview = context.session.token_overview().await?;
    let stored = if overview.refresh.present {
        "stored session found"
    } else {
        "no stored session"
    };
    println!("Session: {}", stored);
    println!("{}", serde_json::to_string_pretty(&overview)?);
    Ok(())
}

async fn restore(context: &AppContext) -> Result<()> {
    let outcome = context.session.init().await;
    println!("Session: {}", describe(&outcome));
    println!("Status:  {:?}", context.session.status());
    if let Some(user) = context.session.user() {
        println!("User:    {}", user.display_name());
    }
    match outcome {
        RestoreOutcome::Rejected(e) => Err(anyhow!("Session rejected by server: {}", e)),
        _ => Ok(()),
    }
}

async fn refresh(context: &AppContext) -> Result<()> {
    match context.session.refresher().refresh().await {
        Ok(_) => {
            println!("Token refreshed");
            Ok(())
        }
        Err(e) if e.is_auth_fatal() => {
            context.session.logout().await;
            Err(anyhow!("Refresh rejected ({}); session cleared", e))
        }
        Err(e) => Err(anyhow!("Refresh failed ({}); tokens kept", e)),
    }
}

async fn import(context: &AppContext) -> Result<()> {
    let access = rpassword::prompt_password("Access token: ")?;
    let refresh = rpassword::prompt_password("Refresh token: ")?;
    if access.trim().is_empty() || refresh.trim().is_empty() {
        return Err(anyhow!("Both tokens are required"));
    }

    let outcome = context
        .session
        .import_tokens(&TokenPair::new(access.trim(), refresh.trim()))
        .await?;
    println!("Session: {}", describe(&outcome));
    Ok(())
}

async fn get(context: &AppContext, path: &str) -> Result<()> {
    let outcome = context.session.init().await;
    if !context.session.is_logged_in() {
        return Err(anyhow!("Not logged in: {}", describe(&outcome)));
    }

    match context.api.get_text(path).await {
        Ok(body) => {
            println!("{}", body);
            Ok(())
        }
        Err(e) => {
            let logged_out = context.session.handle_api_error(&e).await;
            let info = e.info();
            eprintln!(
                "Request failed ({}): {}",
                info.status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "no response".to_string()),
                info.message
            );
            if logged_out {
                eprintln!("Session expired; import a new token pair.");
            }
            Err(e.into())
        }
    }
}
