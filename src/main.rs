//! station-viewer: command-line client for the weather-station API.
//!
//! Wires the data-access layer together:
//! 1. Restores the session from the encrypted vault
//! 2. Builds the interceptor chain around the HTTP transport
//! 3. Serves station data through the cache-first repository
//! 4. Keeps the session fresh with the periodic monitor (`watch`)

mod config;

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use common::config::ClientConfig;
use common::{DateRange, Error, LoginRequest, StationId};
use repository::{DataRepository, FetchPolicy, FetchState, SensorBounds};
use session::{
    EncryptedFileVault, MemoryVault, SessionEvent, SessionStore, SessionVault, TokenLifecycle,
};
use station_client::{HttpAuthApi, InterceptorChain, ReqwestTransport, RetryPolicy, StationApi, Transport};

/// Weather-station viewer
#[derive(Parser)]
#[command(name = "station-viewer", about = "Weather-station data client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in with a password or an identity-provider token.
    Login {
        #[arg(long, conflicts_with = "provider")]
        username: Option<String>,
        #[arg(long, env = "STATION_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// Identity provider name, e.g. `google`.
        #[arg(long, requires = "id_token")]
        provider: Option<String>,
        #[arg(long, env = "STATION_ID_TOKEN", hide_env_values = true)]
        id_token: Option<String>,
    },
    /// Sign out and forget the stored session.
    Logout,
    /// Show the current session.
    Status,
    /// List stations.
    Stations {
        #[arg(long)]
        refresh: bool,
    },
    /// Latest readings for one station.
    Widget {
        station: String,
        /// Bypass the cache.
        #[arg(long)]
        refresh: bool,
    },
    /// Historical readings for a day range (inclusive).
    History {
        station: String,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// Poll a station's widget until interrupted.
    Watch {
        station: String,
        #[arg(long, default_value_t = 60)]
        interval_secs: u64,
    },
}

struct App {
    store: Arc<SessionStore>,
    lifecycle: Arc<TokenLifecycle>,
    repo: DataRepository,
}

fn build_vault(cfg: &ClientConfig) -> Result<Arc<dyn SessionVault>, Error> {
    let path = cfg.session.vault_path.trim();
    if path.is_empty() {
        info!("Session persistence disabled (empty session.vault_path)");
        return Ok(Arc::new(MemoryVault::new()));
    }
    if cfg.session.vault_secret.is_empty() {
        warn!("STATION_VAULT_KEY not set; the session will not survive this process");
        return Ok(Arc::new(MemoryVault::new()));
    }
    Ok(Arc::new(EncryptedFileVault::new(path, &cfg.session.vault_secret)?))
}

fn build_app(cfg: &ClientConfig) -> Result<App, Error> {
    let store = Arc::new(SessionStore::restore(build_vault(cfg)?));

    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(&cfg.api)?);
    let auth = Arc::new(HttpAuthApi::new(
        Arc::clone(&transport),
        RetryPolicy::from(&cfg.retry),
    ));
    let lifecycle = Arc::new(TokenLifecycle::new(
        Arc::clone(&store),
        auth,
        cfg.session.refresh_buffer(),
    ));

    let chain = InterceptorChain::standard(transport, Arc::clone(&lifecycle), cfg);
    let repo = DataRepository::new(
        Arc::new(StationApi::new(chain)),
        Arc::new(SensorBounds::from(&cfg.validation)),
        cfg.cache.clone(),
    );

    Ok(App {
        store,
        lifecycle,
        repo,
    })
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => error!("Failed to render output: {}", e),
    }
}

fn policy(refresh: bool) -> FetchPolicy {
    if refresh {
        FetchPolicy::NetworkOnly
    } else {
        FetchPolicy::CacheFirst
    }
}

/// Unauthorized failures end the session; tell the user to sign in again.
fn report(app: &App, e: &Error) {
    if e.requires_reauthentication() {
        app.store.teardown();
        error!("Session is no longer valid; run `station-viewer login` again ({})", e);
    } else {
        error!("{:?}: {}", e.kind(), e);
    }
}

async fn run(app: &App, cfg: &ClientConfig, command: Command) -> Result<(), Error> {
    match command {
        Command::Login {
            username,
            password,
            provider,
            id_token,
        } => {
            let request = match (username, password, provider, id_token) {
                (Some(username), Some(password), None, _) => {
                    LoginRequest::Password { username, password }
                }
                (None, _, Some(provider), Some(id_token)) => {
                    LoginRequest::IdentityProvider { provider, id_token }
                }
                _ => {
                    return Err(Error::Auth(
                        "login needs --username with a password, or --provider with an id token"
                            .into(),
                    ))
                }
            };
            let session = app.lifecycle.login(request).await?;
            if let Some(user) = session.user() {
                println!("Signed in as {} ({})", user.display_name, user.id);
            }
        }
        Command::Logout => {
            app.lifecycle.logout().await;
            println!("Signed out");
        }
        Command::Status => {
            let session = app.store.snapshot();
            println!("state:   {:?}", session.state());
            println!("token:   {:?}", app.lifecycle.status());
            if let Some(user) = session.user() {
                println!("user:    {} ({})", user.display_name, user.id);
            }
            if let Some(expires_at) = session.expires_at() {
                let left = expires_at - Utc::now();
                println!("expires: {} ({} min left)", expires_at, left.num_minutes());
            }
        }
        Command::Stations { refresh } => {
            let stations = app.repo.stations(policy(refresh)).await?;
            print_json(&stations);
        }
        Command::Widget { station, refresh } => {
            let data = app
                .repo
                .widget(&StationId::new(station), policy(refresh))
                .await?;
            print_json(&data);
        }
        Command::History { station, from, to } => {
            let series = app
                .repo
                .historical(&StationId::new(station), DateRange::new(from, to), FetchPolicy::CacheFirst)
                .await?;
            print_json(&series);
        }
        Command::Watch {
            station,
            interval_secs,
        } => watch(app, cfg, StationId::new(station), interval_secs).await,
    }
    Ok(())
}

async fn watch(app: &App, cfg: &ClientConfig, station: StationId, interval_secs: u64) {
    let monitor = app.lifecycle.spawn_monitor(cfg.session.check_interval());
    let watcher = app.repo.spawn_session_watch(&app.store);
    let sweeper = app.repo.spawn_sweeper(Duration::from_secs(cfg.cache.sweep_interval_secs));
    let mut events = app.store.subscribe_events();

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    info!("Watching {} every {}s (Ctrl-C to stop)", station, interval_secs.max(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut states = app.repo.observe_widget(&station, FetchPolicy::CacheFirst);
                while let Some(state) = states.recv().await {
                    match state {
                        FetchState::Loading => info!("Loading {}...", station),
                        FetchState::Success(data) => print_json(&data),
                        FetchState::Error { kind, message } => warn!("{:?}: {}", kind, message),
                    }
                }
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Expired { reason }) => {
                    app.store.teardown();
                    error!("Session expired ({}); run `station-viewer login` again", reason);
                    break;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping");
                break;
            }
        }
    }

    monitor.abort();
    watcher.abort();
    sweeper.abort();
}

#[tokio::main]
async fn main() {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "station_viewer=info,station_client=info,session=info,repository=info,flight=info"
                    .into()
            }),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    let cfg = match config::load_config() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let app = match build_app(&cfg) {
        Ok(app) => app,
        Err(e) => {
            error!("Startup failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&app, &cfg, cli.command).await {
        report(&app, &e);
        std::process::exit(if e.requires_reauthentication() { 2 } else { 1 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_history_range() {
        let cli = Cli::try_parse_from([
            "station-viewer",
            "history",
            "StationA",
            "--from",
            "2024-01-01",
            "--to",
            "2024-01-02",
        ])
        .unwrap();
        match cli.command {
            Command::History { station, from, to } => {
                assert_eq!(station, "StationA");
                assert_eq!(from, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
                assert_eq!(to, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
            }
            _ => panic!("expected history"),
        }
    }

    #[test]
    fn test_vault_falls_back_to_memory_without_secret() {
        let mut cfg = ClientConfig::default();
        cfg.session.vault_secret.clear();
        assert!(build_vault(&cfg).is_ok());

        cfg.session.vault_path = String::new();
        cfg.session.vault_secret = "k".into();
        assert!(build_vault(&cfg).is_ok());
    }

    #[tokio::test]
    async fn test_app_starts_logged_out_without_vault() {
        let mut cfg = ClientConfig::default();
        cfg.session.vault_path = String::new();
        let app = build_app(&cfg).unwrap();
        assert_eq!(app.store.state(), session::SessionState::LoggedOut);
    }
}
