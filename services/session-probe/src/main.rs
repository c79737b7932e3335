//! Lyo session probe
//!
//! Small operator binary that wires the session core together against a real
//! API deployment:
//! 1. Restores sealed credentials and starts proactive refresh
//! 2. `login` / `logout` / `status` manage the stored token pair
//! 3. `get` issues one authenticated request through the pipeline
//! 4. `stream` follows the live stream and degrades to polling on fallback

mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use lyo_api::{RequestPipeline, UserAction, build_http_client};
use lyo_auth::{
    CredentialStore, FileCredentialStore, MemoryCredentialStore, SealingKey, SessionManager,
    spawn_refresh_task,
};
use lyo_stream::{Envelope, StreamConnection, StreamEvent};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

const USAGE: &str =
    "usage: lyo-session-probe [--config PATH] <login ACCESS REFRESH | logout | status | get PATH | stream>";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Login { access: String, refresh: String },
    Logout,
    Status,
    Get { path: String },
    Stream,
}

#[derive(Debug, PartialEq, Eq)]
struct Cli {
    config: Option<String>,
    command: Command,
}

/// Simple positional parsing; `--config PATH` may appear anywhere.
fn parse_args(args: &[String]) -> Result<Cli> {
    let mut config = None;
    let mut positional = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            config = Some(iter.next().context("--config needs a path")?.clone());
        } else {
            positional.push(arg.as_str());
        }
    }

    let command = match positional.as_slice() {
        ["login", access, refresh] => Command::Login {
            access: access.to_string(),
            refresh: refresh.to_string(),
        },
        ["logout"] => Command::Logout,
        ["status"] => Command::Status,
        ["get", path] => Command::Get {
            path: path.to_string(),
        },
        ["stream"] => Command::Stream,
        _ => bail!("{USAGE}"),
    };
    Ok(Cli { config, command })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_args(&args)?;

    let config_path = Config::resolve_path(cli.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!(
        base_url = %config.api.base_url,
        stream_url = %config.stream_url(),
        credentials = %config.credentials.path.display(),
        "configuration loaded"
    );

    let pipeline_config = config.pipeline();
    let client = build_http_client(&pipeline_config).context("building HTTP client")?;
    let store = open_store(&config).await?;
    let session = Arc::new(SessionManager::new(
        &pipeline_config.base_url,
        store,
        client.clone(),
    ));
    session.restore().await;

    match cli.command {
        Command::Login { access, refresh } => {
            session.set_tokens(access, refresh).await;
            info!("tokens stored");
        }
        Command::Logout => {
            session.clear_tokens().await;
            info!("signed out");
        }
        Command::Status => {
            let status = serde_json::json!({
                "authenticated": session.is_authenticated().await,
                "expiring_soon": session
                    .expires_within(Duration::from_secs(config.credentials.refresh_threshold_secs))
                    .await,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Get { path } => {
            let pipeline = RequestPipeline::new(&pipeline_config.base_url, client, session);
            match pipeline.get::<serde_json::Value>(&path).await {
                Ok(body) => println!("{}", serde_json::to_string_pretty(&body)?),
                Err(e) => {
                    error!(error = %e, action = ?e.user_action(), "request failed");
                    return Err(e).with_context(|| format!("GET {path}"));
                }
            }
        }
        Command::Stream => {
            let refresher = spawn_refresh_task(
                session.clone(),
                Duration::from_secs(config.credentials.refresh_check_secs),
                Duration::from_secs(config.credentials.refresh_threshold_secs),
            );
            let pipeline = RequestPipeline::new(&pipeline_config.base_url, client, session.clone());
            let connection = StreamConnection::new(session, config.stream());
            let result = follow_stream(&config, &pipeline, &connection).await;
            refresher.abort();
            result?;
        }
    }

    Ok(())
}

/// Sealed file store when a key is configured, otherwise in-memory only.
async fn open_store(config: &Config) -> Result<Arc<dyn CredentialStore>> {
    match &config.credentials.key {
        Some(key) => {
            let store = FileCredentialStore::open(
                config.credentials.path.clone(),
                SealingKey::derive(key.expose()),
            )
            .await
            .with_context(|| {
                format!(
                    "opening credential store {}",
                    config.credentials.path.display()
                )
            })?;
            Ok(Arc::new(store))
        }
        None => {
            warn!(
                "no credential key configured (set {} or key_file), credentials will not persist",
                config::CREDENTIAL_KEY_ENV
            );
            Ok(Arc::new(MemoryCredentialStore::new()))
        }
    }
}

/// Follow the stream until Ctrl-C; on fallback, poll `poll_path` instead.
async fn follow_stream(
    config: &Config,
    pipeline: &RequestPipeline,
    connection: &StreamConnection,
) -> Result<()> {
    let degraded = Arc::new(Notify::new());
    let signal = degraded.clone();
    connection.on_fallback(move || signal.notify_one());

    connection
        .connect(&config.stream_url(), |event| match event {
            StreamEvent::Frame(frame) => match Envelope::from_frame(&frame) {
                Some(envelope) => info!(kind = envelope.kind.as_str(), "stream event"),
                None => debug!(?frame, "stream frame"),
            },
            StreamEvent::Error(reason) => warn!(reason = %reason, "stream interrupted"),
        })
        .await
        .context("opening stream")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            connection.disconnect().await;
            return Ok(());
        }
        _ = degraded.notified() => {
            warn!(path = %config.stream.poll_path, "stream degraded, falling back to polling");
        }
    }
    connection.disconnect().await;

    let mut ticker = tokio::time::interval(Duration::from_secs(config.stream.poll_interval_secs));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
            _ = ticker.tick() => {
                match pipeline.get::<serde_json::Value>(&config.stream.poll_path).await {
                    Ok(body) => info!(bytes = body.to_string().len(), "poll succeeded"),
                    Err(e) if e.user_action() == UserAction::Login => {
                        return Err(e).context("session expired, log in again");
                    }
                    Err(e) => warn!(error = %e, "poll failed, will retry"),
                }
            }
        }
    }
}
