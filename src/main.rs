#![allow(missing_docs)]

//! Simstim CLI — log in to web chat platforms, store the harvested
//! credentials encrypted, and chat through them.
//!
//! `login` runs the whole interactive flow in one process: it opens a
//! browser context, relays the QR snapshot to a file, polls until the human
//! finishes the login, then extracts and stores the credential. Every other
//! subcommand is a one-shot against the store or the platform.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_stream::StreamExt;
use tracing::{info, warn};

use simstim::broker::{BrokerError, SessionBroker};
use simstim::cipher::{CredentialCipher, MasterSecret};
use simstim::config::SimstimConfig;
use simstim::credential::CredentialPayload;
use simstim::dispatch::ChatOutcome;
use simstim::engine::bridge::BridgeClient;
use simstim::engine::sidecar::BrowserSidecar;
use simstim::engine::{decode_png, AutomationEngine, BrowserDriver};
use simstim::platforms;
use simstim::schema::{ChatMessage, ChatRequest};
use simstim::session::{run_expiry_sweep, AuthState, SessionError};
use simstim::store::SqliteStore;
use simstim::validator::Validity;

/// Refresh the QR snapshot file every this many polls; platforms rotate the
/// code while the page is open.
const QR_REFRESH_TICKS: u64 = 10;

/// Simstim — act as an authenticated human on web chat platforms.
#[derive(Parser, Debug)]
#[command(name = "simstim", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List supported platforms and their models
    Platforms,

    /// Log in to a platform and store the harvested credential
    Login {
        /// Owner the credential is stored under
        #[arg(long, default_value = "default")]
        owner: String,

        /// Platform name (see `platforms`)
        #[arg(long)]
        platform: String,

        /// Where to write the login QR snapshot
        #[arg(long, default_value = "simstim-qr.png")]
        qr_path: PathBuf,
    },

    /// Store a credential from cookies pasted by hand
    Submit {
        /// Owner the credential is stored under
        #[arg(long, default_value = "default")]
        owner: String,

        /// Platform name
        #[arg(long)]
        platform: String,

        /// Cookie as NAME=VALUE; repeat for each cookie
        #[arg(long = "cookie", value_name = "NAME=VALUE", required = true)]
        cookies: Vec<String>,

        /// User agent of the browser the cookies came from
        #[arg(long)]
        user_agent: Option<String>,
    },

    /// Show the stored credential's state
    Status {
        /// Owner the credential is stored under
        #[arg(long, default_value = "default")]
        owner: String,

        /// Platform name
        #[arg(long)]
        platform: String,
    },

    /// Probe whether the stored credential still works on the platform
    Validate {
        /// Owner the credential is stored under
        #[arg(long, default_value = "default")]
        owner: String,

        /// Platform name
        #[arg(long)]
        platform: String,
    },

    /// Send a chat message as the stored identity
    Chat {
        /// Message text
        message: String,

        /// Owner the credential is stored under
        #[arg(long, default_value = "default")]
        owner: String,

        /// Platform name
        #[arg(long)]
        platform: String,

        /// Model override (platform default otherwise)
        #[arg(long)]
        model: Option<String>,

        /// System prompt prepended to the conversation
        #[arg(long)]
        system: Option<String>,

        /// Buffer the full reply instead of streaming it
        #[arg(long)]
        no_stream: bool,
    },

    /// Show recent usage records
    Usage {
        /// Owner to list usage for
        #[arg(long, default_value = "default")]
        owner: String,

        /// Narrow to one platform
        #[arg(long)]
        platform: Option<String>,

        /// How many records to show
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Delete the stored credential
    Revoke {
        /// Owner the credential is stored under
        #[arg(long, default_value = "default")]
        owner: String,

        /// Platform name
        #[arg(long)]
        platform: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = SimstimConfig::load().context("failed to load configuration")?;

    // The login watch runs long and deserves file logs; one-shots log to
    // stderr only.
    let _logging_guard = match &cli.command {
        Commands::Login { .. } => {
            let logs_dir = config.logging.logs_dir()?;
            Some(simstim::logging::init_service(&logs_dir, &config.logging.level)?)
        }
        _ => {
            simstim::logging::init_cli(&config.logging.level);
            None
        }
    };

    match cli.command {
        Commands::Platforms => {
            run_platforms();
            Ok(())
        }
        Commands::Login {
            owner,
            platform,
            qr_path,
        } => run_login(&config, &owner, &platform, &qr_path).await,
        Commands::Submit {
            owner,
            platform,
            cookies,
            user_agent,
        } => run_submit(&config, &owner, &platform, &cookies, user_agent).await,
        Commands::Status { owner, platform } => run_status(&config, &owner, &platform).await,
        Commands::Validate { owner, platform } => run_validate(&config, &owner, &platform).await,
        Commands::Chat {
            message,
            owner,
            platform,
            model,
            system,
            no_stream,
        } => run_chat(&config, &owner, &platform, message, model, system, no_stream).await,
        Commands::Usage {
            owner,
            platform,
            limit,
        } => run_usage(&config, &owner, platform.as_deref(), limit).await,
        Commands::Revoke { owner, platform } => run_revoke(&config, &owner, &platform).await,
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Build the broker over the configured store, cipher, and browser driver.
///
/// `need_browser` decides whether the bridge must actually be reachable:
/// the login flow requires it, store-only and wire-only commands do not.
async fn build_broker(config: &SimstimConfig, need_browser: bool) -> Result<SessionBroker> {
    let secret = MasterSecret::from_env()
        .context("master key unavailable; set SIMSTIM_MASTER_KEY")?;
    let cipher = Arc::new(CredentialCipher::new(&secret)?);

    let db_path = config.store.database_path()?;
    let store = Arc::new(SqliteStore::connect(&db_path).await?);
    info!(path = %db_path.display(), "credential store opened");

    let driver = build_driver(config, need_browser).await?;
    let engine = Arc::new(AutomationEngine::new(driver, config.engine.max_contexts));

    Ok(SessionBroker::new(
        engine,
        store,
        cipher,
        config.engine.session_ttl(),
    )?)
}

/// Resolve the browser driver: explicit URL, managed sidecar, or the default
/// local bridge port.
async fn build_driver(
    config: &SimstimConfig,
    need_browser: bool,
) -> Result<Arc<dyn BrowserDriver>> {
    let bridge = if let Some(url) = &config.engine.driver_url {
        BridgeClient::new(url.clone())
    } else if need_browser && config.sidecar.managed {
        let docker = bollard::Docker::connect_with_local_defaults()
            .context("cannot reach Docker for the managed browser sidecar")?;
        let sidecar = BrowserSidecar::ensure(&docker, &config.sidecar.spec()).await?;
        BridgeClient::new(sidecar.base_url().to_owned())
    } else {
        BridgeClient::with_port(config.sidecar.port)
    };

    if need_browser {
        bridge.wait_healthy().await.context(
            "browser bridge is not answering; start it or enable the managed sidecar",
        )?;
    }
    Ok(Arc::new(bridge))
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

fn run_platforms() {
    for descriptor in platforms::all_descriptors() {
        println!("{:<10} {}", descriptor.id, descriptor.display_name);
        println!(
            "  models: {} (default {})",
            descriptor.models.join(", "),
            descriptor.default_model
        );
        println!("  quota:  {} tokens", descriptor.default_quota);
    }
}

async fn run_login(
    config: &SimstimConfig,
    owner: &str,
    platform: &str,
    qr_path: &Path,
) -> Result<()> {
    let broker = build_broker(config, true).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let sweep = tokio::spawn(run_expiry_sweep(
        broker.session_manager(),
        config.engine.sweep_interval(),
        shutdown_rx,
    ));

    let result = drive_login(&broker, config, owner, platform, qr_path).await;

    let _ = shutdown_tx.send(true);
    let _ = sweep.await;
    result
}

/// The interactive part of `login`: QR out, poll until the human finishes,
/// then extract and store.
async fn drive_login(
    broker: &SessionBroker,
    config: &SimstimConfig,
    owner: &str,
    platform: &str,
    qr_path: &Path,
) -> Result<()> {
    let status = broker.start_authorization(owner, platform).await?;
    println!(
        "authorization session open for {platform} ({}s deadline)",
        status.seconds_remaining
    );

    write_qr(broker, owner, platform, qr_path).await?;
    println!(
        "QR snapshot written to {}; scan it with the platform's app, then wait",
        qr_path.display()
    );
    println!("press Ctrl-C to cancel");

    let mut ticks: u64 = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                broker.cancel_authorization(owner, platform).await?;
                std::fs::remove_file(qr_path).ok();
                bail!("login cancelled");
            }
            () = tokio::time::sleep(config.engine.poll_interval()) => {}
        }

        ticks = ticks.saturating_add(1);
        let status = broker.poll_authorization(owner, platform).await?;
        match status.state {
            AuthState::LoggedIn => break,
            AuthState::AwaitingLogin => {
                if ticks.is_multiple_of(QR_REFRESH_TICKS) {
                    if let Err(e) = write_qr(broker, owner, platform, qr_path).await {
                        warn!(error = %e, "QR refresh failed");
                    }
                }
            }
            other => bail!("authorization session moved to unexpected state {other}"),
        }
    }

    println!("login detected, extracting credential");
    let credential = match broker.finalize_authorization(owner, platform).await {
        Ok(credential) => credential,
        Err(BrokerError::Session(SessionError::ShapeInvalid(e))) => {
            // The platform may still be writing cookies right after login;
            // the session allows exactly one more extraction.
            warn!(error = %e, "harvest came up short, retrying once");
            tokio::time::sleep(Duration::from_secs(2)).await;
            broker.finalize_authorization(owner, platform).await?
        }
        Err(e) => return Err(e.into()),
    };

    std::fs::remove_file(qr_path).ok();
    println!(
        "credential stored for {} on {platform} ({} token quota)",
        credential.owner_id, credential.quota_limit
    );
    Ok(())
}

/// Capture a fresh QR snapshot and write it where the user can see it.
async fn write_qr(
    broker: &SessionBroker,
    owner: &str,
    platform: &str,
    path: &Path,
) -> Result<()> {
    let snapshot = broker.qr_snapshot(owner, platform).await?;
    let bytes = decode_png(&snapshot.png_base64)?;
    std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

async fn run_submit(
    config: &SimstimConfig,
    owner: &str,
    platform: &str,
    pairs: &[String],
    user_agent: Option<String>,
) -> Result<()> {
    let mut cookies = BTreeMap::new();
    for pair in pairs {
        let Some((name, value)) = pair.split_once('=') else {
            bail!("cookie {pair:?} is not NAME=VALUE");
        };
        cookies.insert(name.to_owned(), value.to_owned());
    }
    let mut payload = CredentialPayload::from_cookies(cookies);
    payload.user_agent = user_agent;

    let broker = build_broker(config, false).await?;
    let credential = broker.submit_credentials(owner, platform, payload).await?;
    println!(
        "credential stored for {} on {platform} ({} token quota)",
        credential.owner_id, credential.quota_limit
    );
    Ok(())
}

async fn run_status(config: &SimstimConfig, owner: &str, platform: &str) -> Result<()> {
    let broker = build_broker(config, false).await?;
    let Some(credential) = broker.credential(owner, platform).await? else {
        println!("no credential stored for {owner} on {platform}");
        return Ok(());
    };

    println!("platform:   {platform}");
    println!("issued:     {}", credential.issued_at.to_rfc3339());
    println!("validated:  {}", format_instant(credential.last_validated_at));
    println!("last used:  {}", format_instant(credential.last_used_at));
    println!("expired:    {}", credential.is_expired);
    println!(
        "quota:      {}/{} tokens",
        credential.quota_used, credential.quota_limit
    );
    Ok(())
}

fn format_instant(at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    at.map_or_else(|| "never".to_owned(), |at| at.to_rfc3339())
}

async fn run_validate(config: &SimstimConfig, owner: &str, platform: &str) -> Result<()> {
    let broker = build_broker(config, false).await?;
    match broker.check_credential(owner, platform).await? {
        Validity::Valid => {
            println!("credential works; the platform answered as a logged-in user");
            Ok(())
        }
        Validity::Invalid { reason } => bail!("credential invalid: {reason}"),
    }
}

async fn run_chat(
    config: &SimstimConfig,
    owner: &str,
    platform: &str,
    message: String,
    model: Option<String>,
    system: Option<String>,
    no_stream: bool,
) -> Result<()> {
    let broker = build_broker(config, false).await?;

    let mut request = ChatRequest::from_prompt(message);
    if let Some(system) = system {
        request.messages.insert(0, ChatMessage::system(system));
    }
    request.model = model;
    request.stream = !no_stream;

    match broker.chat_completion(owner, platform, request).await? {
        ChatOutcome::Complete(reply) => {
            println!("{}", reply.content);
            if let Some(usage) = reply.usage {
                info!(
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    model = %reply.model,
                    "call complete"
                );
            }
        }
        ChatOutcome::Stream(mut stream) => {
            let mut stdout = std::io::stdout();
            while let Some(item) = stream.next().await {
                let chunk = item?;
                print!("{}", chunk.delta);
                stdout.flush().ok();
            }
            println!();
        }
    }
    Ok(())
}

async fn run_usage(
    config: &SimstimConfig,
    owner: &str,
    platform: Option<&str>,
    limit: u32,
) -> Result<()> {
    let broker = build_broker(config, false).await?;
    let records = broker.recent_usage(owner, platform, limit).await?;
    if records.is_empty() {
        println!("no usage recorded");
        return Ok(());
    }

    for record in records {
        println!(
            "{}  {:<10} {:<8} {:>6} tokens  {:>6} ms  {}",
            record.created_at.to_rfc3339(),
            record.platform,
            record.outcome,
            record.usage.total(),
            record.latency_ms,
            record.model
        );
        if let Some(error) = record.error {
            println!("  {error}");
        }
    }
    Ok(())
}

async fn run_revoke(config: &SimstimConfig, owner: &str, platform: &str) -> Result<()> {
    let broker = build_broker(config, false).await?;
    if broker.revoke_credential(owner, platform).await? {
        println!("credential for {owner} on {platform} deleted");
    } else {
        println!("no credential stored for {owner} on {platform}");
    }
    Ok(())
}
