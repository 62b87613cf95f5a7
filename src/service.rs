//! # Wallpaper Service Module
//!
//! Exposes the update manager on the session bus so the CLI (or any other
//! client) can trigger updates and read the schedule of a running daemon.
//!
//! ## D-Bus Interface
//!
//! Service name: `io.github.album_wallpaper.Wallpaper1`
//! Object path: `/io/github/album_wallpaper/Wallpaper1`
//!
//! ### Methods
//! - `UpdateNow()` - Request a manual update; false if it was rejected
//! - `RequestUpdate()` - Same as `UpdateNow`, returning the run id (empty if rejected)
//! - `GetLastSuccessfulUpdate()` - RFC 3339 timestamp, empty if never
//! - `GetNextScheduledUpdate()` - RFC 3339 timestamp, empty if nothing is scheduled
//! - `GetLastUpdateError()` - Message of the last failed run, empty after a success
//! - `GetConfig()` - Current configuration as JSON
//! - `SetAlbum(id: String, name: String)` - Select the source album (empty id clears it)
//! - `SetChangeFrequency(frequency: String)` - `never`, `hourly`, `six-hours` or `daily`
//! - `SetPickRandomly(random: bool)` - Random or sequential selection
//! - `SetFilters(minimum_width: u32, horizontal_only: bool)` - Candidate filters (width 0 disables)
//! - `SetFillMode(mode: String)` - `fill`, `fit`, `stretch` or `center`
//! - `GetAutomaticUpdates()` / `SetAutomaticUpdates(enabled: bool)`
//!
//! ### Signals
//! - `UpdateProgress(run: String, state: String, message: String)` - Emitted as runs
//!   start and finish; `run` is empty for rejected requests

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use zbus::{interface, Connection, SignalContext};

use crate::config::{self, ChangeFrequency, ConfigError, SettingsStore};
use crate::manager::{ManagerHandle, RequestOutcome, RunOutcome, UpdateEvent, UpdateTrigger};
use crate::sink::FillMode;

/// D-Bus service name, unique on the session bus.
pub const SERVICE_NAME: &str = "io.github.album_wallpaper.Wallpaper1";

/// D-Bus object path where the interface lives.
pub const OBJECT_PATH: &str = "/io/github/album_wallpaper/Wallpaper1";

/// Timestamps cross the bus as RFC 3339 strings; empty means unset.
pub fn format_timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// The D-Bus interface implementation.
pub struct WallpaperService {
    manager: ManagerHandle,
    store: Arc<dyn SettingsStore>,
}

impl WallpaperService {
    pub fn new(manager: ManagerHandle, store: Arc<dyn SettingsStore>) -> Self {
        Self { manager, store }
    }

    fn settings_changed(&self) -> zbus::fdo::Result<()> {
        self.manager
            .settings_changed()
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    async fn write<F>(&self, write: F) -> zbus::fdo::Result<()>
    where
        F: FnOnce(&dyn SettingsStore) -> Result<(), ConfigError> + Send + 'static,
    {
        config::write_blocking(&self.store, write)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    async fn request_manual(&self) -> zbus::fdo::Result<RequestOutcome> {
        self.manager
            .request_update(UpdateTrigger::Manual)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}

#[interface(name = "io.github.album_wallpaper.Wallpaper1")]
impl WallpaperService {
    /// Request a manual update
    ///
    /// Returns true when the request was accepted (possibly preempting a
    /// running update), false when it was rejected.
    async fn update_now(&self) -> zbus::fdo::Result<bool> {
        Ok(matches!(self.request_manual().await?, RequestOutcome::Accepted { .. }))
    }

    /// Request a manual update and return its run id
    ///
    /// The id matches the `run` argument of the `UpdateProgress` signals for
    /// that run. Empty when the request was rejected.
    async fn request_update(&self) -> zbus::fdo::Result<String> {
        Ok(match self.request_manual().await? {
            RequestOutcome::Accepted { run, .. } => run.to_string(),
            RequestOutcome::Rejected => String::new(),
        })
    }

    async fn get_last_successful_update(&self) -> String {
        format_timestamp(self.manager.status().last_successful_update)
    }

    async fn get_next_scheduled_update(&self) -> String {
        format_timestamp(self.manager.status().next_scheduled_update)
    }

    async fn get_last_update_error(&self) -> String {
        self.manager.status().last_update_error.unwrap_or_default()
    }

    /// Get current configuration as JSON
    async fn get_config(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.store.snapshot())
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Select the source album and reschedule
    async fn set_album(&self, id: String, name: String) -> zbus::fdo::Result<()> {
        let id = Some(id).filter(|id| !id.trim().is_empty());
        let name = Some(name).filter(|name| !name.is_empty());
        self.write(move |s| s.set_selected_album(id, name)).await?;
        self.settings_changed()
    }

    async fn set_change_frequency(&self, frequency: String) -> zbus::fdo::Result<()> {
        let frequency: ChangeFrequency = frequency
            .parse()
            .map_err(zbus::fdo::Error::InvalidArgs)?;
        self.write(move |s| s.set_change_frequency(frequency)).await?;
        self.settings_changed()
    }

    async fn set_pick_randomly(&self, random: bool) -> zbus::fdo::Result<()> {
        self.write(move |s| s.set_pick_randomly(random)).await
    }

    async fn set_filters(&self, minimum_width: u32, horizontal_only: bool) -> zbus::fdo::Result<()> {
        self.write(move |s| s.set_filters(minimum_width, horizontal_only)).await
    }

    async fn set_fill_mode(&self, mode: String) -> zbus::fdo::Result<()> {
        let mode: FillMode = mode.parse().map_err(zbus::fdo::Error::InvalidArgs)?;
        self.write(move |s| s.set_fill_mode(mode)).await
    }

    async fn get_automatic_updates(&self) -> bool {
        self.manager.status().automatic_updates
    }

    /// Enable or disable the automatic update timer
    async fn set_automatic_updates(&self, enabled: bool) -> zbus::fdo::Result<()> {
        let result = if enabled { self.manager.start() } else { self.manager.stop() };
        result.map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    // === Signals ===

    /// Signal emitted as update runs start and finish
    #[zbus(signal)]
    async fn update_progress(ctx: &SignalContext<'_>, run: &str, state: &str, message: &str) -> zbus::Result<()>;
}

/// `UpdateProgress` signal arguments: run id (empty if none), state, message.
pub type Progress = (String, &'static str, String);

/// Maps a manager event onto the `UpdateProgress` signal arguments.
pub fn progress_signal(event: &UpdateEvent) -> Progress {
    match event {
        UpdateEvent::Started { run, trigger } => {
            (run.to_string(), "started", format!("Updating wallpaper ({})", trigger.as_str()))
        }
        UpdateEvent::Rejected { .. } => (String::new(), "rejected", "An update is already in progress".to_string()),
        UpdateEvent::Finished { run, outcome, .. } => {
            let (state, message) = match outcome {
                RunOutcome::Applied { item_id, .. } => ("complete", format!("Wallpaper updated ({item_id})")),
                RunOutcome::Failed(message) => ("failed", message.clone()),
                RunOutcome::Canceled => ("canceled", "Update canceled".to_string()),
            };
            (run.to_string(), state, message)
        }
    }
}

/// Re-emits manager events as `UpdateProgress` signals until the manager goes away.
async fn forward_progress(ctx: SignalContext<'static>, mut events: broadcast::Receiver<UpdateEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let (run, state, message) = progress_signal(&event);
                if let Err(e) = WallpaperService::update_progress(&ctx, &run, state, &message).await {
                    warn!(error = %e, "Failed to emit UpdateProgress");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Progress forwarder lagged behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Claims [`SERVICE_NAME`] on the session bus and serves the interface.
///
/// The returned connection must be kept alive for as long as the service
/// should stay registered.
pub async fn serve(manager: ManagerHandle, store: Arc<dyn SettingsStore>) -> zbus::Result<Connection> {
    let events = manager.subscribe();
    let service = WallpaperService::new(manager, store);
    let connection = zbus::connection::Builder::session()?
        .name(SERVICE_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    let ctx = SignalContext::new(&connection, OBJECT_PATH)?;
    tokio::spawn(forward_progress(ctx, events));
    Ok(connection)
}
