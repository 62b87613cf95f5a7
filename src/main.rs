//! # Album Wallpaper
//!
//! Keeps the desktop wallpaper rotating through the photos of a remote album.
//!
//! ## Architecture
//! The daemon process owns the update manager and exposes it over D-Bus:
//!
//! - `manager.rs` - Update orchestration: single-flight runs, preemption, scheduling
//! - `scheduler.rs` - Due-time computation and the one-shot timer
//! - `selection.rs` - Candidate filtering and random/sequential picking
//! - `photos.rs` - Photo library client (album listing, downloads)
//! - `sink.rs` - Applies the downloaded file as the desktop background
//! - `config.rs` - Persisted settings and the settings store
//! - `service.rs` - D-Bus service embedded in the daemon
//! - `dbus_client.rs` - Client proxy used by the CLI subcommands
//!
//! ## CLI Usage
//! - No subcommand / `daemon`: Run the scheduler and D-Bus service
//! - `update`: Change the wallpaper now (through the daemon if it is running)
//! - `status`: Show the last and next update
//! - `set-album <ID> [--name NAME]`, `set-frequency <FREQUENCY>`
//! - `set-options [--random|--sequential] [--min-width N] [--horizontal-only BOOL] [--fill-mode MODE]`
//! - `set-automatic <true|false>`: Pause or resume the daemon's timer
//!
//! Sending SIGHUP to the daemon reloads `config.json` and rebuilds the photo client.

mod config;      // Settings file and settings store
mod dbus_client; // D-Bus client proxy (used by the CLI to talk to the daemon)
mod error;       // Update failure taxonomy
mod manager;     // Update manager actor
mod photos;      // Photo library API client
mod scheduler;   // Next due time and one-shot timer
mod selection;   // Filters and photo selection policies
mod service;     // D-Bus service (embedded in the daemon)
mod sink;        // Desktop wallpaper backends

use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use clap::{ArgAction, Parser, Subcommand};
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{ChangeFrequency, ConfigError, JsonSettingsStore, SettingsStore};
use dbus_client::WallpaperClient;
use manager::{Collaborators, ManagerError, ManagerHandle, RequestOutcome, RunOutcome, UpdateEvent, UpdateTrigger, WallpaperManager};
use photos::{HttpPhotoSource, PhotoSource, PhotoSourceError};
use sink::FillMode;

/// Default log filter when neither `--log-level` nor `RUST_LOG` is given.
const DEFAULT_LOG_FILTER: &str = "album_wallpaper=info";

#[derive(Debug, Parser)]
#[command(name = "album-wallpaper", version, about = "Rotates the desktop wallpaper from a remote photo album")]
struct Cli {
    /// Log filter, e.g. `debug` or `album_wallpaper=trace` (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the update scheduler and D-Bus service (default)
    Daemon,
    /// Change the wallpaper now
    Update,
    /// Show the last and next wallpaper update
    Status,
    /// Select the album wallpapers are picked from
    SetAlbum {
        /// Album id; an empty string clears the selection
        id: String,
        /// Display name of the album
        #[arg(long)]
        name: Option<String>,
    },
    /// Set how often the wallpaper changes: never, hourly, six-hours or daily
    SetFrequency { frequency: ChangeFrequency },
    /// Change how photos are picked and displayed
    SetOptions {
        /// Pick photos at random
        #[arg(long, conflicts_with = "sequential")]
        random: bool,
        /// Pick photos in album order
        #[arg(long)]
        sequential: bool,
        /// Skip photos narrower than this many pixels; 0 disables the check
        #[arg(long)]
        min_width: Option<u32>,
        /// Skip portrait photos
        #[arg(long)]
        horizontal_only: Option<bool>,
        /// fill, fit, stretch or center
        #[arg(long)]
        fill_mode: Option<FillMode>,
    },
    /// Turn the daemon's automatic updates on or off
    SetAutomatic {
        #[arg(action = ArgAction::Set)]
        enabled: bool,
    },
}

/// Photo options given to `set-options`; `None` keeps the current value.
#[derive(Debug, Default)]
struct PhotoOptions {
    pick_randomly: Option<bool>,
    minimum_width: Option<u32>,
    horizontal_only: Option<bool>,
    fill_mode: Option<FillMode>,
}

impl PhotoOptions {
    /// The filter pair to write, if either half was given.
    fn filters(&self, current: &config::Config) -> Option<(u32, bool)> {
        (self.minimum_width.is_some() || self.horizontal_only.is_some()).then(|| {
            (
                self.minimum_width.unwrap_or(current.minimum_picture_width),
                self.horizontal_only.unwrap_or(current.horizontal_only),
            )
        })
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Photo service: {0}")]
    Photos(#[from] PhotoSourceError),
    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Wallpaper daemon is already running")]
    AlreadyRunning,
    #[error("{0}")]
    UpdateFailed(String),
    #[error("The wallpaper daemon is not running")]
    NotRunning,
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let result = match cli.command.unwrap_or(Command::Daemon) {
        Command::Daemon => run_daemon().await,
        Command::Update => run_update().await,
        Command::Status => run_status().await,
        Command::SetAlbum { id, name } => run_set_album(id, name.unwrap_or_default()).await,
        Command::SetFrequency { frequency } => run_set_frequency(frequency).await,
        Command::SetOptions { random, sequential, min_width, horizontal_only, fill_mode } => {
            let pick_randomly = if random { Some(true) } else if sequential { Some(false) } else { None };
            run_set_options(PhotoOptions { pick_randomly, minimum_width: min_width, horizontal_only, fill_mode }).await
        }
        Command::SetAutomatic { enabled } => run_set_automatic(enabled).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Wires the production collaborators into a new manager.
fn spawn_manager(store: Arc<JsonSettingsStore>, photos: Arc<dyn PhotoSource>) -> Result<ManagerHandle, CliError> {
    let wallpaper_path = config::wallpaper_file_path().ok_or(ConfigError::NoConfigDir)?;
    info!(path = %wallpaper_path.display(), "Wallpaper file");
    Ok(WallpaperManager::spawn(Collaborators {
        photos,
        store,
        sink: Arc::from(sink::detect_sink()),
        wallpaper_path,
    }))
}

fn photo_source(store: &JsonSettingsStore) -> Result<Arc<dyn PhotoSource>, CliError> {
    if std::env::var_os(photos::TOKEN_ENV).is_none() {
        warn!("{} is not set; requests to the photo service will be unauthenticated", photos::TOKEN_ENV);
    }
    Ok(Arc::new(HttpPhotoSource::from_env(&store.snapshot().api_base_url)?))
}

/// Re-reads the settings file and hands the manager a fresh photo source.
fn reload(store: &JsonSettingsStore, manager: &ManagerHandle) -> Result<(), CliError> {
    info!("Reloading settings");
    match store.reload() {
        Ok(()) => manager.settings_changed()?,
        Err(e) => warn!(error = %e, "Failed to reload settings, keeping the previous ones"),
    }
    match photo_source(store) {
        Ok(photos) => manager.reconfigure(photos)?,
        Err(e) => warn!(error = %e, "Failed to reload photo source"),
    }
    Ok(())
}

/// Runs the daemon until interrupted.
async fn run_daemon() -> Result<(), CliError> {
    if dbus_client::is_service_available().await {
        return Err(CliError::AlreadyRunning);
    }

    let store = Arc::new(JsonSettingsStore::open_default()?);
    info!(path = %store.path().display(), "Loaded settings");
    let photos = photo_source(&store)?;
    manager::verify_selected_album(photos.as_ref(), store.as_ref()).await;

    let manager = spawn_manager(store.clone(), photos)?;
    manager.start()?;

    // Keep the connection alive for the lifetime of the daemon.
    let _connection = service::serve(manager.clone(), store.clone()).await?;
    info!(service = service::SERVICE_NAME, "Wallpaper daemon running");

    // SIGHUP reloads hand-edited settings and rebuilds the photo client,
    // e.g. after the access token was rotated.
    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            _ = hangup.recv() => reload(&store, &manager)?,
        }
    }
    info!("Shutting down");
    manager.stop()?;
    Ok(())
}

async fn run_update() -> Result<(), CliError> {
    if dbus_client::is_service_available().await {
        let client = WallpaperClient::connect().await?;
        return match client.update_and_wait().await? {
            None => {
                println!("An update is already in progress");
                Ok(())
            }
            Some((state, message)) if state == "complete" => {
                println!("{message}");
                Ok(())
            }
            Some((_, message)) => Err(CliError::UpdateFailed(message)),
        };
    }

    // No daemon: run a single manual update in-process.
    let store = Arc::new(JsonSettingsStore::open_default()?);
    let manager = spawn_manager(store.clone(), photo_source(&store)?)?;
    let mut events = manager.subscribe();
    let RequestOutcome::Accepted { run, .. } = manager.request_update(UpdateTrigger::Manual).await? else {
        return Err(CliError::UpdateFailed("Update request was rejected".into()));
    };

    loop {
        match events.recv().await {
            Ok(UpdateEvent::Finished { run: finished, outcome, .. }) if finished == run => {
                return match outcome {
                    RunOutcome::Applied { item_id, .. } => {
                        println!("Wallpaper updated ({item_id})");
                        Ok(())
                    }
                    RunOutcome::Failed(message) => Err(CliError::UpdateFailed(message)),
                    RunOutcome::Canceled => Err(CliError::UpdateFailed("Update canceled".into())),
                };
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return Err(ManagerError::Closed.into()),
        }
    }
}

/// Formats an RFC 3339 timestamp in local time.
fn display_time(rfc3339: &str, unset: &str) -> String {
    match DateTime::parse_from_rfc3339(rfc3339) {
        Ok(t) => t.with_timezone(&Local).format("%a %b %d %H:%M").to_string(),
        Err(_) => unset.to_string(),
    }
}

fn album_label(settings: &config::Config) -> &str {
    settings.selected_album_name.as_deref().or(settings.album_id()).unwrap_or("none")
}

async fn run_status() -> Result<(), CliError> {
    if dbus_client::is_service_available().await {
        let status = WallpaperClient::connect().await?.status().await?;
        println!("Daemon:          running");
        println!("Album:           {}", album_label(&status.config));
        println!("Frequency:       {}", status.config.change_frequency.as_str());
        println!("Automatic:       {}", if status.automatic_updates { "on" } else { "off" });
        println!("Last update:     {}", display_time(&status.last_successful_update, "never"));
        println!("Next update:     {}", display_time(&status.next_scheduled_update, "not scheduled"));
        if !status.last_update_error.is_empty() {
            println!("Last error:      {}", status.last_update_error);
        }
        return Ok(());
    }

    let settings = JsonSettingsStore::open_default()?.snapshot();
    let next = scheduler::next_due_time(
        Utc::now(),
        settings.change_frequency,
        settings.album_id().is_some(),
        settings.last_successful_update,
        None,
    );
    println!("Daemon:          not running");
    println!("Album:           {}", album_label(&settings));
    println!("Frequency:       {}", settings.change_frequency.as_str());
    println!("Last update:     {}", display_time(&service::format_timestamp(settings.last_successful_update), "never"));
    println!("Next update:     {}", display_time(&service::format_timestamp(next), "not scheduled"));
    Ok(())
}

async fn run_set_album(id: String, name: String) -> Result<(), CliError> {
    if dbus_client::is_service_available().await {
        WallpaperClient::connect().await?.set_album(&id, &name).await?;
    } else {
        let id = Some(id).filter(|id| !id.trim().is_empty());
        let name = Some(name).filter(|name| !name.is_empty());
        JsonSettingsStore::open_default()?.set_selected_album(id, name)?;
    }
    println!("Album updated");
    Ok(())
}

async fn run_set_frequency(frequency: ChangeFrequency) -> Result<(), CliError> {
    if dbus_client::is_service_available().await {
        WallpaperClient::connect().await?.set_change_frequency(frequency.as_str()).await?;
    } else {
        JsonSettingsStore::open_default()?.set_change_frequency(frequency)?;
    }
    println!("Change frequency set to {}", frequency.as_str());
    Ok(())
}

async fn run_set_options(options: PhotoOptions) -> Result<(), CliError> {
    if dbus_client::is_service_available().await {
        let client = WallpaperClient::connect().await?;
        let current = client.config().await?;
        if let Some(random) = options.pick_randomly {
            client.set_pick_randomly(random).await?;
        }
        if let Some((width, horizontal_only)) = options.filters(&current) {
            client.set_filters(width, horizontal_only).await?;
        }
        if let Some(mode) = options.fill_mode {
            client.set_fill_mode(mode.as_str()).await?;
        }
    } else {
        let store = JsonSettingsStore::open_default()?;
        let current = store.snapshot();
        if let Some(random) = options.pick_randomly {
            store.set_pick_randomly(random)?;
        }
        if let Some((width, horizontal_only)) = options.filters(&current) {
            store.set_filters(width, horizontal_only)?;
        }
        if let Some(mode) = options.fill_mode {
            store.set_fill_mode(mode)?;
        }
    }
    println!("Photo options updated");
    Ok(())
}

async fn run_set_automatic(enabled: bool) -> Result<(), CliError> {
    if !dbus_client::is_service_available().await {
        return Err(CliError::NotRunning);
    }
    WallpaperClient::connect().await?.set_automatic_updates(enabled).await?;
    println!("Automatic updates {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}
