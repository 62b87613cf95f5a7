//! # D-Bus Client Module
//!
//! Client side of [`crate::service`], used by the CLI subcommands to talk to a
//! running daemon.
//!
//! ## Usage
//!
//! ```ignore
//! let client = WallpaperClient::connect().await?;
//! if client.update_and_wait().await?.is_none() {
//!     println!("An update is already running");
//! }
//! ```

use futures_util::StreamExt;
use zbus::{proxy, Connection};

use crate::config::Config;
use crate::service::SERVICE_NAME;

/// D-Bus proxy for the wallpaper service
#[proxy(
    interface = "io.github.album_wallpaper.Wallpaper1",
    default_service = "io.github.album_wallpaper.Wallpaper1",
    default_path = "/io/github/album_wallpaper/Wallpaper1"
)]
trait WallpaperService {
    /// Run id of the accepted request, empty if rejected
    async fn request_update(&self) -> zbus::Result<String>;

    async fn get_last_successful_update(&self) -> zbus::Result<String>;

    async fn get_next_scheduled_update(&self) -> zbus::Result<String>;

    async fn get_last_update_error(&self) -> zbus::Result<String>;

    /// Current configuration as JSON
    async fn get_config(&self) -> zbus::Result<String>;

    async fn set_album(&self, id: &str, name: &str) -> zbus::Result<()>;

    async fn set_change_frequency(&self, frequency: &str) -> zbus::Result<()>;

    async fn get_automatic_updates(&self) -> zbus::Result<bool>;

    async fn set_automatic_updates(&self, enabled: bool) -> zbus::Result<()>;

    async fn set_pick_randomly(&self, random: bool) -> zbus::Result<()>;

    async fn set_filters(&self, minimum_width: u32, horizontal_only: bool) -> zbus::Result<()>;

    async fn set_fill_mode(&self, mode: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn update_progress(&self, run: String, state: String, message: String) -> zbus::Result<()>;
}

/// Schedule and error state as reported by the daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStatus {
    pub last_successful_update: String,
    pub next_scheduled_update: String,
    pub last_update_error: String,
    pub automatic_updates: bool,
    pub config: Config,
}

/// High-level client for the wallpaper daemon
pub struct WallpaperClient {
    proxy: WallpaperServiceProxy<'static>,
}

impl WallpaperClient {
    /// Connect to the wallpaper service
    ///
    /// Connecting succeeds even if no daemon owns the name; check
    /// [`is_service_available`] first.
    pub async fn connect() -> zbus::Result<Self> {
        let connection = Connection::session().await?;
        let proxy = WallpaperServiceProxy::new(&connection).await?;
        Ok(Self { proxy })
    }

    /// Requests a manual update and waits until that run reports its end state.
    ///
    /// Returns the final `(state, message)` pair of the `UpdateProgress`
    /// signal for the requested run, or `None` if the request was rejected.
    /// Signals of other runs (e.g. one this request preempted) are skipped.
    pub async fn update_and_wait(&self) -> zbus::Result<Option<(String, String)>> {
        // Subscribe before requesting so the final signal can't be missed.
        let mut progress = self.proxy.receive_update_progress().await?;
        let run = self.proxy.request_update().await?;
        if run.is_empty() {
            return Ok(None);
        }
        while let Some(signal) = progress.next().await {
            let args = signal.args()?;
            if ends_run(&args.run, &args.state, &run) {
                return Ok(Some((args.state, args.message)));
            }
        }
        Ok(None)
    }

    pub async fn status(&self) -> zbus::Result<RemoteStatus> {
        Ok(RemoteStatus {
            last_successful_update: self.proxy.get_last_successful_update().await?,
            next_scheduled_update: self.proxy.get_next_scheduled_update().await?,
            last_update_error: self.proxy.get_last_update_error().await?,
            automatic_updates: self.proxy.get_automatic_updates().await?,
            config: self.config().await?,
        })
    }

    /// The daemon's current settings.
    pub async fn config(&self) -> zbus::Result<Config> {
        let json = self.proxy.get_config().await?;
        serde_json::from_str(&json).map_err(|e| zbus::Error::Failure(format!("Invalid config from daemon: {e}")))
    }

    pub async fn set_album(&self, id: &str, name: &str) -> zbus::Result<()> {
        self.proxy.set_album(id, name).await
    }

    pub async fn set_change_frequency(&self, frequency: &str) -> zbus::Result<()> {
        self.proxy.set_change_frequency(frequency).await
    }

    pub async fn set_automatic_updates(&self, enabled: bool) -> zbus::Result<()> {
        self.proxy.set_automatic_updates(enabled).await
    }

    pub async fn set_pick_randomly(&self, random: bool) -> zbus::Result<()> {
        self.proxy.set_pick_randomly(random).await
    }

    pub async fn set_filters(&self, minimum_width: u32, horizontal_only: bool) -> zbus::Result<()> {
        self.proxy.set_filters(minimum_width, horizontal_only).await
    }

    pub async fn set_fill_mode(&self, mode: &str) -> zbus::Result<()> {
        self.proxy.set_fill_mode(mode).await
    }
}

/// True when a progress signal reports the end of run `expected`.
fn ends_run(run: &str, state: &str, expected: &str) -> bool {
    run == expected && matches!(state, "complete" | "failed" | "canceled")
}

/// Check if the service is available (daemon is running and registered on D-Bus)
pub async fn is_service_available() -> bool {
    if let Ok(connection) = Connection::session().await {
        connection
            .call_method(
                Some("org.freedesktop.DBus"),
                "/org/freedesktop/DBus",
                Some("org.freedesktop.DBus"),
                "NameHasOwner",
                &SERVICE_NAME,
            )
            .await
            .and_then(|reply| reply.body().deserialize::<bool>())
            .unwrap_or(false)
    } else {
        false
    }
}
